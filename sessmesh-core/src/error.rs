//! Error taxonomy shared by every component.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backing key/value store rejected or could not serve a call.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A store call did not finish within the configured remote-call timeout.
    #[error("store call timed out after {0:?}")]
    StoreTimeout(Duration),

    /// Mutation attempted on a replica that has been invalidated.
    #[error("session {0} is no longer valid")]
    InvalidState(String),

    /// Attribute names under the `session:` prefix hold replica metadata.
    #[error("attribute name {0:?} is reserved")]
    ReservedAttribute(String),

    /// A change message could not be encoded or decoded.
    #[error("malformed change message: {0}")]
    Decode(String),

    /// Node startup could not reach the store or the bus.
    #[error("node startup failed: {0}")]
    Lifecycle(String),
}

impl Error {
    /// Transient failures that a later retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::StoreTimeout(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}
