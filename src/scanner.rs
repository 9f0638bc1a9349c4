use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use crate::error::Result;

/// Which camera (or scan head) a device should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facing {
    Rear,
    Front,
}

impl Facing {
    pub fn opposite(self) -> Facing {
        match self {
            Facing::Rear => Facing::Front,
            Facing::Front => Facing::Rear,
        }
    }
}

/// Where a streaming device hands its decoded frames.
///
/// Holds a single slot: a frame is accepted only when decoding is not paused
/// and the previous scan has been drained. Accepting a frame pauses decoding
/// until [`ScannerSession::resume`] or a reopen.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<String>,
    paused: Arc<AtomicBool>,
}

impl FrameSink {
    /// Offer one decode result
    ///
    /// # Arguments
    /// * `decoded` - Text found in the frame, or `None` when the frame held no code
    ///
    /// # Returns
    /// * `bool` - True if the text was queued for the consumer
    pub fn deliver(&self, decoded: Option<&str>) -> bool {
        let text = match decoded {
            Some(text) if !text.trim().is_empty() => text.trim(),
            _ => return false,
        };
        if self.paused.swap(true, Ordering::SeqCst) {
            return false;
        }
        match self.tx.try_send(text.to_string()) {
            Ok(()) => {
                log::debug!("Scan delivered ({} bytes)", text.len());
                true
            }
            Err(_) => false,
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

/// Consumer side of the scan slot.
pub struct ScanEvents {
    rx: mpsc::Receiver<String>,
}

impl ScanEvents {
    /// Wait for the next decoded scan. `None` once the session is dropped.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Take a pending scan without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

/// A device that produces decoded QR text.
///
/// `stop` must release the underlying handle and be harmless when the device
/// is not streaming.
pub trait ScanDevice: Send {
    fn start(&mut self, facing: Facing, sink: FrameSink) -> impl Future<Output = Result<()>> + Send;

    fn stop(&mut self) -> impl Future<Output = ()> + Send;
}

/// Observable state of the scanner dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScannerState {
    Idle,
    Scanning { facing: Facing },
    Paused { facing: Facing },
    /// Acquisition failed; a manual retry is possible
    Failed { facing: Facing, message: String },
    /// Camera access is blocked outright; no retry is offered
    InsecureContext,
    Closed,
}

impl ScannerState {
    pub fn can_retry(&self) -> bool {
        matches!(self, ScannerState::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Streaming,
    Failed(String),
    Insecure,
    Closed,
}

pub const INSECURE_CONTEXT_MESSAGE: &str = "Camera access requires a secure connection (HTTPS). \
     Please use localhost or a valid SSL certificate.";

/// Owns one scan device for the lifetime of a scanner dialog.
///
/// At most one stream is active. Every path that leaves the streaming phase
/// goes through `release`, so a start is always paired with a stop.
pub struct ScannerSession<D: ScanDevice> {
    device: D,
    facing: Facing,
    phase: Phase,
    sink: FrameSink,
}

impl<D: ScanDevice> ScannerSession<D> {
    /// Create a closed session and the receiver its scans arrive on.
    pub fn new(device: D) -> (Self, ScanEvents) {
        let (tx, rx) = mpsc::channel(1);
        let session = ScannerSession {
            device,
            facing: Facing::Rear,
            phase: Phase::Idle,
            sink: FrameSink {
                tx,
                paused: Arc::new(AtomicBool::new(true)),
            },
        };
        (session, ScanEvents { rx })
    }

    pub fn state(&self) -> ScannerState {
        match &self.phase {
            Phase::Idle => ScannerState::Idle,
            Phase::Streaming if self.sink.is_paused() => ScannerState::Paused {
                facing: self.facing,
            },
            Phase::Streaming => ScannerState::Scanning {
                facing: self.facing,
            },
            Phase::Failed(message) => ScannerState::Failed {
                facing: self.facing,
                message: message.clone(),
            },
            Phase::Insecure => ScannerState::InsecureContext,
            Phase::Closed => ScannerState::Closed,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Open the dialog
    ///
    /// In an insecure context nothing is acquired. Otherwise the rear device is
    /// tried first, falling back once to the front device.
    ///
    /// # Arguments
    /// * `secure` - Whether the requesting context is allowed camera access
    pub async fn open(&mut self, secure: bool) -> ScannerState {
        if !secure {
            self.release().await;
            self.phase = Phase::Insecure;
            log::warn!("Scanner refused: insecure context");
            return self.state();
        }
        self.facing = Facing::Rear;
        self.acquire().await;
        self.state()
    }

    /// Switch to the other facing mode, restarting the stream if the dialog is open.
    pub async fn toggle_facing(&mut self) -> ScannerState {
        self.facing = self.facing.opposite();
        if matches!(self.phase, Phase::Streaming | Phase::Failed(_)) {
            self.acquire().await;
        }
        self.state()
    }

    /// Manual retry after a failed acquisition; ignored in any other state.
    pub async fn retry(&mut self) -> ScannerState {
        if let Phase::Failed(_) = self.phase {
            self.acquire().await;
        }
        self.state()
    }

    /// Accept the next scan after one has been consumed.
    pub fn resume(&mut self) -> ScannerState {
        if self.phase == Phase::Streaming {
            self.sink.set_paused(false);
        }
        self.state()
    }

    /// Close the dialog. The device is stopped whatever state it is in.
    pub async fn close(&mut self) -> ScannerState {
        self.release().await;
        self.phase = Phase::Closed;
        self.state()
    }

    async fn release(&mut self) {
        self.sink.set_paused(true);
        self.device.stop().await;
    }

    async fn start(&mut self, facing: Facing) -> Result<()> {
        match self.device.start(facing, self.sink.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // a failed start may still hold a partially opened handle
                self.device.stop().await;
                Err(e)
            }
        }
    }

    async fn acquire(&mut self) {
        self.release().await;
        // a device may deliver its first frame before `start` returns
        self.sink.set_paused(false);

        let mut result = self.start(self.facing).await;
        if let Err(e) = &result {
            if self.facing == Facing::Rear {
                log::warn!("Rear scan device failed ({}), trying front", e);
                self.facing = Facing::Front;
                result = self.start(Facing::Front).await;
            }
        }

        match result {
            Ok(()) => {
                log::info!("Scanner streaming ({:?})", self.facing);
                self.phase = Phase::Streaming;
            }
            Err(e) => {
                log::warn!("Scanner failed to start ({:?}): {}", self.facing, e);
                self.sink.set_paused(true);
                self.phase = Phase::Failed(e.to_string());
            }
        }
    }
}
