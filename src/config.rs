use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConsoleError, Result};

/// Json struct for console settings
///
/// Every field has a default so a partial (or empty `{}`) file is valid.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Address the HTTP server binds to
    pub bind_address: String,

    /// Port the HTTP server listens on
    pub port: u16,

    /// Directory holding `registrations.json` and `admins.json`.
    /// `None` keeps registrations in memory only.
    pub data_dir: Option<PathBuf>,

    /// Domain appended to admin usernames before the credential check
    pub admin_email_domain: String,

    /// Base URL of the remote QR image generator
    pub qr_endpoint: String,

    /// Pause between two verification emails, in milliseconds
    pub email_delay_ms: u64,

    pub event: EventDetails,

    pub smtp: Option<SmtpConfig>,

    pub scanner: ScannerConfig,

    /// Treat every request as coming from a secure context
    pub assume_secure: bool,
}

/// Event details embedded in every verification email.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EventDetails {
    pub date: String,
    pub time: String,
    pub venue: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Mailbox used in the From header, e.g. `Registration Desk <desk@example.org>`
    pub from: String,
}

/// Device paths for the local scan device, one per facing mode.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ScannerConfig {
    pub rear_device: Option<PathBuf>,
    pub front_device: Option<PathBuf>,
}

fn default_smtp_port() -> u16 {
    465
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
            data_dir: Some(PathBuf::from("database")),
            admin_email_domain: "admin.regdesk.local".to_string(),
            qr_endpoint: "https://api.qrserver.com/v1/create-qr-code/".to_string(),
            email_delay_ms: 800,
            event: EventDetails::default(),
            smtp: None,
            scanner: ScannerConfig::default(),
            assume_secure: false,
        }
    }
}

impl Default for EventDetails {
    fn default() -> Self {
        EventDetails {
            date: "TBA".to_string(),
            time: "09:00 AM".to_string(),
            venue: "Main Auditorium".to_string(),
            message: "Congratulations! Your registration has been verified. \
                      Please show the QR code below at the registration desk."
                .to_string(),
        }
    }
}

impl ConsoleConfig {
    /// Load settings from a JSON file
    ///
    /// # Arguments
    /// * `path` - Location of the settings file
    ///
    /// # Returns
    /// * `Result<ConsoleConfig>` - Parsed settings, or a `Config` error naming the file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConsoleError::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| ConsoleError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Path of the registration collection, if persisted.
    pub fn registrations_file(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("registrations.json"))
    }

    /// Path of the admin account file.
    pub fn admins_file(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("admins.json")
    }
}
