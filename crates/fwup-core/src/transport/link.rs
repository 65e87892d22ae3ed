//! Message-passing bridge to an external BLE stack.
//!
//! The BLE layer owns a [`LinkEndpoint`]: it forwards each command written by
//! the session to the control point characteristic and pushes every
//! notification (or the loss of the link) back as a [`LinkEvent`]. The
//! session side holds the [`LinkTransport`] and blocks on the event channel,
//! so each write suspends until exactly one event resolves it.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use tracing::debug;

use super::traits::{ControlPointTransport, TransportError};
use crate::protocol::constants::MAX_WRITE_LEN;

/// Event delivered from the BLE layer to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Control point notification payload.
    Notification(Vec<u8>),
    /// The device link dropped.
    Disconnected,
}

/// Session side of the link.
pub struct LinkTransport {
    writes: Sender<Vec<u8>>,
    events: Receiver<LinkEvent>,
    connected: bool,
    max_write_len: usize,
}

/// BLE side of the link.
pub struct LinkEndpoint {
    writes: Receiver<Vec<u8>>,
    events: Sender<LinkEvent>,
}

/// Create a connected transport/endpoint pair.
pub fn link_pair() -> (LinkTransport, LinkEndpoint) {
    link_pair_with_mtu(MAX_WRITE_LEN)
}

/// Create a pair for a characteristic with a smaller negotiated write size.
pub fn link_pair_with_mtu(max_write_len: usize) -> (LinkTransport, LinkEndpoint) {
    let (write_tx, write_rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::channel();
    (
        LinkTransport {
            writes: write_tx,
            events: event_rx,
            connected: true,
            max_write_len,
        },
        LinkEndpoint {
            writes: write_rx,
            events: event_tx,
        },
    )
}

impl ControlPointTransport for LinkTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        self.writes.send(data.to_vec()).map_err(|_| {
            self.connected = false;
            TransportError::Disconnected
        })
    }

    fn wait_notification(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        match self.events.recv_timeout(timeout) {
            Ok(LinkEvent::Notification(bytes)) => Ok(bytes),
            Ok(LinkEvent::Disconnected) | Err(RecvTimeoutError::Disconnected) => {
                self.connected = false;
                Err(TransportError::Disconnected)
            }
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }

    fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(event) = self.events.try_recv() {
            match event {
                LinkEvent::Notification(bytes) => {
                    debug!(len = bytes.len(), "Discarding stale notification");
                    dropped += 1;
                }
                LinkEvent::Disconnected => {
                    self.connected = false;
                    break;
                }
            }
        }
        dropped
    }
}

impl LinkEndpoint {
    /// Next command written by the session.
    ///
    /// `Ok(None)` on timeout, `Err` once the session side is gone.
    pub fn recv_write(&self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        match self.writes.recv_timeout(timeout) {
            Ok(data) => Ok(Some(data)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    /// Forward a notification to the session.
    pub fn notify(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.events
            .send(LinkEvent::Notification(data))
            .map_err(|_| TransportError::Disconnected)
    }

    /// Report loss of the device link.
    pub fn disconnect(&self) {
        let _ = self.events.send(LinkEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[test]
    fn test_write_and_notify() {
        let (mut transport, endpoint) = link_pair();
        transport.write(&[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(endpoint.recv_write(WAIT).unwrap(), Some(vec![0x01, 0x02, 0x03]));

        endpoint.notify(vec![0x01, 0x00, 0x00]).unwrap();
        assert_eq!(transport.wait_notification(WAIT).unwrap(), vec![0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_timeout() {
        let (mut transport, _endpoint) = link_pair();
        assert!(matches!(
            transport.wait_notification(Duration::from_millis(5)),
            Err(TransportError::Timeout { timeout_ms: 5 })
        ));
        assert!(transport.is_connected());
    }

    #[test]
    fn test_disconnect_event() {
        let (mut transport, endpoint) = link_pair();
        endpoint.disconnect();
        assert!(matches!(
            transport.wait_notification(WAIT),
            Err(TransportError::Disconnected)
        ));
        assert!(!transport.is_connected());
        assert!(transport.write(&[0x01]).is_err());
    }

    #[test]
    fn test_endpoint_dropped() {
        let (mut transport, endpoint) = link_pair();
        drop(endpoint);
        assert!(transport.wait_notification(WAIT).is_err());
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_discard_stale() {
        let (mut transport, endpoint) = link_pair();
        endpoint.notify(vec![0x01, 0, 0]).unwrap();
        endpoint.notify(vec![0x04, 0, 0]).unwrap();
        assert_eq!(transport.discard_pending(), 2);
        assert!(transport.wait_notification(Duration::from_millis(5)).is_err());
    }
}
