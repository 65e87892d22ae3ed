//! Control point request/response exchange.
//!
//! Wraps a [`ControlPointTransport`] so that each command is written once and
//! resolved by exactly one notification, a timeout, or a disconnect.
//! `request` takes `&mut self`, so a second write cannot be issued while a
//! response is outstanding.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use crate::protocol::{ControlCommand, ControlResponse, DecodeError, EncodeError};
use crate::transport::{ControlPointTransport, TransportError};

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("No response within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Malformed response: {0}")]
    Malformed(#[from] DecodeError),

    #[error("Device disconnected")]
    Disconnected,

    /// Link was already down; the command was never written.
    #[error("Device not connected")]
    NotConnected,

    #[error("Encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl ChannelError {
    /// A lost round trip: retried like an error response.
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Malformed(_))
    }
}

impl From<TransportError> for ChannelError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Disconnected => Self::Disconnected,
            TransportError::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            other => Self::Transport(other),
        }
    }
}

/// Single-outstanding-request control point channel.
pub struct ControlPointChannel<T: ControlPointTransport> {
    transport: T,
    timeout: Duration,
    last_response: Option<ControlResponse>,
}

impl<T: ControlPointTransport> ControlPointChannel<T> {
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            last_response: None,
        }
    }

    /// Write `command` and wait for its response.
    pub fn request(&mut self, command: &ControlCommand) -> Result<ControlResponse, ChannelError> {
        let bytes = command.encode(self.transport.max_write_len())?;

        let stale = self.transport.discard_pending();
        if stale > 0 {
            debug!(stale, "Dropped late notifications before write");
        }

        trace!(command = %command, len = bytes.len(), "Control point write");
        self.transport.write(&bytes).map_err(|e| match e {
            TransportError::Disconnected => ChannelError::NotConnected,
            other => other.into(),
        })?;

        let raw = self.transport.wait_notification(self.timeout)?;
        let response = ControlResponse::decode(&raw)?;
        trace!(command = %command, response = %response, "Control point response");

        self.last_response = Some(response);
        Ok(response)
    }

    /// Last successfully decoded response.
    pub fn last_response(&self) -> Option<ControlResponse> {
        self.last_response
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}
