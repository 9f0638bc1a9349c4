use thiserror::Error;

/// Errors raised by the registration console.
///
/// Every variant is recoverable from the session's point of view: callers log
/// it and surface it as a transient notice. The only fatal path is a panic,
/// which the HTTP layer turns into a reload prompt.
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("Registration {0} not found")]
    NotFound(String),

    #[error("Invalid QR format: {0}")]
    Malformed(String),

    #[error("Payment not verified for registration {0}")]
    PaymentNotVerified(String),

    #[error("{name} is not registered for {event}")]
    NotRegistered { name: String, event: String },

    #[error("Member {index} not found in registration {id}")]
    MemberNotFound { id: String, index: usize },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not allowed in {0} mode")]
    Forbidden(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mail error: {0}")]
    Mail(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Scanner is in use by another session")]
    ScannerBusy,

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ConsoleError>;

#[cfg(feature = "web")]
impl From<rust_xlsxwriter::XlsxError> for ConsoleError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        ConsoleError::Export(err.to_string())
    }
}

#[cfg(feature = "web")]
impl From<lettre::error::Error> for ConsoleError {
    fn from(err: lettre::error::Error) -> Self {
        ConsoleError::Mail(err.to_string())
    }
}

#[cfg(feature = "web")]
impl From<lettre::transport::smtp::Error> for ConsoleError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        ConsoleError::Mail(err.to_string())
    }
}

#[cfg(feature = "web")]
impl From<reqwest::Error> for ConsoleError {
    fn from(err: reqwest::Error) -> Self {
        ConsoleError::Export(err.to_string())
    }
}
