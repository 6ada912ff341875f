//! Portal error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendError;
use crate::forwarding::relay::RelayError;

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Tunnel failed to start: {0}")]
    TunnelStartFailure(String),

    #[error("Port allocation failed: {0}")]
    PortAllocationFailure(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Stable error category carried over the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    BackendUnavailable,
    TunnelStartFailure,
    PortAllocationFailure,
    Internal,
}

impl PortalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PortalError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PortalError::NotFound(_) => ErrorKind::NotFound,
            PortalError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            PortalError::TunnelStartFailure(_) => ErrorKind::TunnelStartFailure,
            PortalError::PortAllocationFailure(_) => ErrorKind::PortAllocationFailure,
            PortalError::IoError(_) => ErrorKind::Internal,
        }
    }

    /// Message without the category prefix
    pub fn message(&self) -> String {
        match self {
            PortalError::InvalidArgument(msg)
            | PortalError::NotFound(msg)
            | PortalError::BackendUnavailable(msg)
            | PortalError::TunnelStartFailure(msg)
            | PortalError::PortAllocationFailure(msg) => msg.clone(),
            PortalError::IoError(e) => e.to_string(),
        }
    }

    /// Prefix the message with `context`, keeping the category
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        match self {
            PortalError::InvalidArgument(msg) => {
                PortalError::InvalidArgument(format!("{}: {}", context, msg))
            }
            PortalError::NotFound(msg) => PortalError::NotFound(format!("{}: {}", context, msg)),
            PortalError::BackendUnavailable(msg) => {
                PortalError::BackendUnavailable(format!("{}: {}", context, msg))
            }
            PortalError::TunnelStartFailure(msg) => {
                PortalError::TunnelStartFailure(format!("{}: {}", context, msg))
            }
            PortalError::PortAllocationFailure(msg) => {
                PortalError::PortAllocationFailure(format!("{}: {}", context, msg))
            }
            PortalError::IoError(e) => {
                PortalError::IoError(std::io::Error::new(e.kind(), format!("{}: {}", context, e)))
            }
        }
    }

    /// Rebuild an error received over the control API
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::InvalidArgument => PortalError::InvalidArgument(message),
            ErrorKind::NotFound => PortalError::NotFound(message),
            ErrorKind::BackendUnavailable => PortalError::BackendUnavailable(message),
            ErrorKind::TunnelStartFailure => PortalError::TunnelStartFailure(message),
            ErrorKind::PortAllocationFailure => PortalError::PortAllocationFailure(message),
            ErrorKind::Internal => PortalError::IoError(std::io::Error::other(message)),
        }
    }
}

impl From<BackendError> for PortalError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(_) => PortalError::BackendUnavailable(err.to_string()),
            _ => PortalError::NotFound(err.to_string()),
        }
    }
}

impl From<RelayError> for PortalError {
    fn from(err: RelayError) -> Self {
        PortalError::TunnelStartFailure(err.to_string())
    }
}

// Errors cross the control API as plain strings
impl serde::Serialize for PortalError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
