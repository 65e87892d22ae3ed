//! Mock control point transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{ControlPointTransport, TransportError};
use crate::protocol::{ControlResponse, ResponseCode};

/// Scripted outcome of one notification wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Deliver these bytes as the notification.
    Notify(Vec<u8>),
    /// No notification arrives.
    Silent,
    /// The link drops while waiting.
    Disconnect,
}

/// Mock transport for unit testing channel and session logic.
///
/// Clones share the same script and write log, so a test can keep one
/// clone for inspection after handing the other to the code under test.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued replies, consumed one per wait.
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Whether device is "connected".
    connected: Arc<Mutex<bool>>,
    max_write_len: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            replies: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
            max_write_len: crate::protocol::constants::MAX_WRITE_LEN,
        }
    }

    pub fn with_max_write_len(mut self, len: usize) -> Self {
        self.max_write_len = len;
        self
    }

    pub fn queue(&self, reply: MockReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Queue a decoded response.
    pub fn queue_response(&self, code: ResponseCode, value: u16) {
        self.queue(MockReply::Notify(
            ControlResponse::new(code, value).to_bytes().to_vec(),
        ));
    }

    pub fn queue_success(&self, value: u16) {
        self.queue_response(ResponseCode::Success, value);
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Opcodes of all captured writes.
    pub fn opcodes(&self) -> Vec<u8> {
        self.write_log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|w| w.first().copied())
            .collect()
    }

    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate device reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPointTransport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn wait_notification(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        let timeout_ms = timeout.as_millis() as u64;
        match self.replies.lock().unwrap().pop_front() {
            Some(MockReply::Notify(bytes)) => Ok(bytes),
            Some(MockReply::Silent) | None => Err(TransportError::Timeout { timeout_ms }),
            Some(MockReply::Disconnect) => {
                *self.connected.lock().unwrap() = false;
                Err(TransportError::Disconnected)
            }
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn max_write_len(&self) -> usize {
        self.max_write_len
    }
}
