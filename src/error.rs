//! Error taxonomy shared by the pipeline and its collaborators.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// No credential has been recorded; the authorization flow must run.
    #[error("not authenticated")]
    Unauthenticated,

    /// The refresh exchange failed; the authorization flow must restart.
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),

    #[error("mailbox provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("language model backend unavailable: {0}")]
    ModelUnavailable(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("email store corrupt: {0}")]
    StoreCorrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("lock poisoned")]
    LockPoisoned,

    #[error("worker pool is shut down")]
    WorkerClosed,
}

impl Error {
    /// True for failures that require the user to sign in again.
    pub fn needs_reauth(&self) -> bool {
        matches!(self, Error::Unauthenticated | Error::RefreshFailed(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Error::MalformedResponse(err.to_string())
        } else {
            Error::ProviderUnavailable(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
