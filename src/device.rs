use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::config::ScannerConfig;
use crate::error::{ConsoleError, Result};
use crate::scanner::{Facing, FrameSink, ScanDevice};

/// Scan device backed by a character device or FIFO.
///
/// Hardware scanners in keyboard/serial text mode emit one decoded code per
/// line; each line is offered to the sink as one frame.
pub struct LineDevice {
    rear: Option<PathBuf>,
    front: Option<PathBuf>,
    reader: Option<JoinHandle<()>>,
}

impl LineDevice {
    pub fn new(config: &ScannerConfig) -> Self {
        LineDevice {
            rear: config.rear_device.clone(),
            front: config.front_device.clone(),
            reader: None,
        }
    }

    fn path(&self, facing: Facing) -> Option<&PathBuf> {
        match facing {
            Facing::Rear => self.rear.as_ref(),
            Facing::Front => self.front.as_ref(),
        }
    }
}

impl ScanDevice for LineDevice {
    async fn start(&mut self, facing: Facing, sink: FrameSink) -> Result<()> {
        if self.reader.is_some() {
            return Err(ConsoleError::Camera("Scan device already in use".to_string()));
        }
        let path = self
            .path(facing)
            .cloned()
            .ok_or_else(|| ConsoleError::Camera(format!("No {:?} scan device configured", facing)))?;

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| ConsoleError::Camera(format!("{}: {}", path.display(), e)))?;
        log::info!("Opened scan device {}", path.display());

        self.reader = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(file).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        sink.deliver(Some(&line));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // unreadable frame
                        log::debug!("Skipping unreadable scan line: {}", e);
                    }
                }
            }
            log::debug!("Scan device {} reached end of input", path.display());
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            log::info!("Released scan device");
        }
    }
}

impl Drop for LineDevice {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
