//! Remote shell transport seam
//!
//! [`RemoteEndpoint`](super::RemoteEndpoint) owns the connect and retry
//! protocol; a transport only knows how to log in once, open a command
//! channel on a session, and upload a file.

use std::path::Path;
use thiserror::Error;

use super::capture::OutputSource;
use super::connection::Connection;

/// Transport failure, classified for the connect loop
#[derive(Debug, Error)]
pub enum TransportError {
    /// Host unreachable, connection refused or reset
    #[error("network error: {0}")]
    Network(String),

    /// Credentials rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A command channel could not be opened on an existing session
    #[error("channel error: {0}")]
    Channel(String),

    /// Anything else; never retried
    #[error("{0}")]
    Fatal(String),
}

impl TransportError {
    /// Errors the connect loop sleeps through
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::Auth(_))
    }
}

pub trait Transport: Send + Sync {
    /// An authenticated session; channels are multiplexed over it
    type Session: Send + Sync;

    type Channel: OutputSource;

    fn login(
        &self,
        host: &str,
        username: &str,
        connection: &Connection,
    ) -> Result<Self::Session, TransportError>;

    /// Start `command` on a new channel of `session`
    fn open(&self, session: &Self::Session, command: &str) -> Result<Self::Channel, TransportError>;

    fn upload(&self, session: &Self::Session, src: &Path, dst: &str) -> Result<(), TransportError>;
}
