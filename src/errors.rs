use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy surfaced by the core. Every layer maps into these variants
/// at its boundary; the CLI turns them into process exit codes.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("send blocked: {0}")]
    SendBlocked(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("storage error: {0}")]
    Store(String),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotFound(_) => 1,
            Error::InvalidInput(_) => 2,
            Error::Connection(_) | Error::Protocol(_) | Error::Store(_) => 3,
            Error::Auth(_) => 4,
            Error::SendBlocked(_) => 5,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(format!("column decode: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<async_imap::error::Error> for Error {
    fn from(e: async_imap::error::Error) -> Self {
        use async_imap::error::Error as ImapError;
        match e {
            ImapError::Io(io) => Error::Connection(io.to_string()),
            ImapError::ConnectionLost => Error::Connection("connection lost".into()),
            ImapError::No(msg) | ImapError::Bad(msg) => Error::Protocol(msg),
            ImapError::Validate(v) => Error::InvalidInput(v.to_string()),
            other => Error::Protocol(other.to_string()),
        }
    }
}
