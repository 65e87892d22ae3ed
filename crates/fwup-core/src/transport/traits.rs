//! Control point transport abstraction.
//!
//! Defines the `ControlPointTransport` trait for the single request/response
//! characteristic, allowing different implementations (BLE bridge, mock,
//! simulated device).

use std::time::Duration;

use thiserror::Error;

use crate::protocol::constants::MAX_WRITE_LEN;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract control point link.
///
/// This trait enables:
/// - A message-passing bridge to an external BLE stack
/// - Mock implementation for unit testing
/// - An in-process simulated device
pub trait ControlPointTransport: Send {
    /// Write one command to the control point characteristic.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Block until the next notification, the timeout, or a disconnect.
    fn wait_notification(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Check if the device link is up.
    fn is_connected(&self) -> bool;

    /// Largest write the characteristic accepts.
    fn max_write_len(&self) -> usize {
        MAX_WRITE_LEN
    }

    /// Drop notifications that arrived after their request timed out.
    fn discard_pending(&mut self) -> usize {
        0
    }
}

impl<T: ControlPointTransport + ?Sized> ControlPointTransport for Box<T> {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write(data)
    }

    fn wait_notification(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).wait_notification(timeout)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn max_write_len(&self) -> usize {
        (**self).max_write_len()
    }

    fn discard_pending(&mut self) -> usize {
        (**self).discard_pending()
    }
}
