use thiserror::Error;

/// Errors raised by the remote side of a synchronization or push session.
#[derive(Error, Debug)]
pub enum MailError {
    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("{0}")]
    Sync(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<imap::error::Error> for MailError {
    fn from(e: imap::error::Error) -> Self {
        MailError::Imap(e.to_string())
    }
}

impl MailError {
    /// Whether this error means the underlying connection is gone.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            MailError::Io(_) | MailError::Tls(_) => true,
            MailError::Imap(msg) => msg.to_lowercase().contains("connection"),
            _ => false,
        }
    }
}
