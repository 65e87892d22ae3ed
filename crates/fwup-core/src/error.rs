//! Update error taxonomy.
//!
//! Per-block transient failures never leave the session; what does surface
//! is either session-fatal, a connectivity condition, or a transient failure
//! that exhausted its retry budget. Every surfaced error carries a
//! [`Recovery`] hint telling the caller whether the next attempt can resume
//! from the persisted index or has to start over with a fresh erase.

use std::fmt;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::payload::ImageError;
use crate::protocol::ResponseCode;
use crate::snapshot::SnapshotError;
use crate::state::{Phase, StateError};
use crate::version::SourceError;

/// Error taxonomy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Per-block failure (invalid block/CRC, lost notification).
    Transient,
    /// Device refused the session; no retry.
    SessionFatal,
    /// Link or charger condition.
    Connectivity,
    /// Undecodable notification.
    Malformed,
    /// Caller or local failure (no image, bad state, I/O).
    Local,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::SessionFatal => write!(f, "session-fatal"),
            ErrorKind::Connectivity => write!(f, "connectivity"),
            ErrorKind::Malformed => write!(f, "malformed"),
            ErrorKind::Local => write!(f, "local"),
        }
    }
}

/// What the next attempt has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing device-side to recover.
    None,
    /// Staging area is still valid; resume from the persisted index later.
    RetryLater,
    /// Staging area or key is unusable; start over with a fresh erase.
    ReErase,
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recovery::None => write!(f, "none"),
            Recovery::RetryLater => write!(f, "update failed, retry later"),
            Recovery::ReErase => write!(f, "update failed, staging must be re-erased"),
        }
    }
}

/// Why a single attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    Response(ResponseCode),
    Timeout,
    Malformed,
    CrcMismatch { expected: u16, actual: u16 },
}

impl FailureCause {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FailureCause::Response(code) if code.is_fatal() => ErrorKind::SessionFatal,
            FailureCause::Response(code) if code.is_connectivity() => ErrorKind::Connectivity,
            FailureCause::Response(_) | FailureCause::Timeout | FailureCause::CrcMismatch { .. } => {
                ErrorKind::Transient
            }
            FailureCause::Malformed => ErrorKind::Malformed,
        }
    }

    pub fn response(&self) -> Option<ResponseCode> {
        match self {
            FailureCause::Response(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Response(code) => write!(f, "{}", code),
            FailureCause::Timeout => write!(f, "no response"),
            FailureCause::Malformed => write!(f, "malformed response"),
            FailureCause::CrcMismatch { expected, actual } => write!(
                f,
                "CRC mismatch (local 0x{:04X}, device 0x{:04X})",
                expected, actual
            ),
        }
    }
}

/// Where in the session a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureContext {
    pub phase: Phase,
    pub block_index: Option<u16>,
}

impl fmt::Display for FailureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.block_index {
            Some(i) => write!(f, "{} block {}", self.phase, i),
            None => write!(f, "{}", self.phase),
        }
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("{context}: device answered {response}")]
    Rejected {
        context: FailureContext,
        response: ResponseCode,
    },

    #[error("{context}: gave up after {attempts} attempts, last failure: {last}")]
    RetriesExhausted {
        context: FailureContext,
        attempts: u8,
        last: FailureCause,
    },

    #[error("Stale session: {0}")]
    StaleSession(String),

    #[error("No firmware image loaded")]
    NoImage,

    #[error("No update source configured")]
    NoSource,

    #[error("No resumable session")]
    NothingToResume,

    #[error("Update canceled")]
    Canceled,

    #[error("Invalid state: {0}")]
    State(#[from] StateError),

    #[error("Control point: {0}")]
    Channel(#[from] ChannelError),

    #[error("Firmware image: {0}")]
    Image(#[from] ImageError),

    #[error("Update source: {0}")]
    Source(#[from] SourceError),

    #[error("Session snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Rejected { response, .. } => FailureCause::Response(*response).kind(),
            UpdateError::RetriesExhausted { last, .. } => last.kind(),
            UpdateError::StaleSession(_) => ErrorKind::SessionFatal,
            UpdateError::Channel(ChannelError::Malformed(_)) => ErrorKind::Malformed,
            UpdateError::Channel(ChannelError::Encode(_)) => ErrorKind::Local,
            UpdateError::Channel(_) => ErrorKind::Connectivity,
            _ => ErrorKind::Local,
        }
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            UpdateError::Rejected { context, response } => match response {
                ResponseCode::NotConnectedToCharger | ResponseCode::DeviceDisconnected
                    if context.phase.is_resumable() =>
                {
                    Recovery::RetryLater
                }
                _ => Recovery::ReErase,
            },
            UpdateError::RetriesExhausted { context, .. } => {
                if context.phase.is_resumable() {
                    Recovery::RetryLater
                } else {
                    Recovery::ReErase
                }
            }
            UpdateError::StaleSession(_) | UpdateError::NothingToResume | UpdateError::Canceled => {
                Recovery::ReErase
            }
            UpdateError::Channel(ChannelError::Encode(_)) => Recovery::None,
            UpdateError::Channel(_) => Recovery::RetryLater,
            _ => Recovery::None,
        }
    }

    pub fn context(&self) -> Option<FailureContext> {
        match self {
            UpdateError::Rejected { context, .. }
            | UpdateError::RetriesExhausted { context, .. } => Some(*context),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<ResponseCode> {
        match self {
            UpdateError::Rejected { response, .. } => Some(*response),
            UpdateError::RetriesExhausted { last, .. } => last.response(),
            _ => None,
        }
    }
}
