use shared::error::RemoteError;
use thiserror::Error;

use crate::retry::Unauthorized;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The key service rejected the session. The caller must route to re-login.
    #[error("{operation} rejected by the key service after {attempts} attempt(s): {source}")]
    TerminalAuth {
        operation: &'static str,
        attempts: u64,
        source: RemoteError,
    },
    #[error("local persistence failed during {operation}: {source:#}")]
    LocalData {
        operation: &'static str,
        source: anyhow::Error,
    },
}

impl SyncError {
    pub fn is_terminal_auth(&self) -> bool {
        matches!(self, SyncError::TerminalAuth { .. })
    }
}

impl From<Unauthorized> for SyncError {
    fn from(value: Unauthorized) -> Self {
        SyncError::TerminalAuth {
            operation: value.operation,
            attempts: value.attempts,
            source: value.source,
        }
    }
}

pub(crate) trait LocalResultExt<T> {
    fn local(self, operation: &'static str) -> Result<T, SyncError>;
}

impl<T> LocalResultExt<T> for anyhow::Result<T> {
    fn local(self, operation: &'static str) -> Result<T, SyncError> {
        self.map_err(|source| SyncError::LocalData { operation, source })
    }
}
