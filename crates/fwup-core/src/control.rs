//! Cross-thread pause/cancel requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Request pending against a running update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Run,
    Pause,
    Cancel,
}

const RUN: u8 = 0;
const PAUSE: u8 = 1;
const CANCEL: u8 = 2;

/// Cloneable handle checked before every command.
///
/// Cancel wins over pause: once canceled, a pause request is ignored until
/// the orchestrator acknowledges the cancel with [`UpdateControl::clear`].
#[derive(Debug, Clone, Default)]
pub struct UpdateControl {
    request: Arc<AtomicU8>,
}

impl UpdateControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        let _ = self
            .request
            .compare_exchange(RUN, PAUSE, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.request.store(CANCEL, Ordering::SeqCst);
    }

    /// Withdraw a pause request. A pending cancel stays.
    pub fn resume(&self) {
        let _ = self
            .request
            .compare_exchange(PAUSE, RUN, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Back to `Run` regardless of the pending request.
    pub fn clear(&self) {
        self.request.store(RUN, Ordering::SeqCst);
    }

    pub fn request(&self) -> ControlRequest {
        match self.request.load(Ordering::SeqCst) {
            PAUSE => ControlRequest::Pause,
            CANCEL => ControlRequest::Cancel,
            _ => ControlRequest::Run,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.request() == ControlRequest::Cancel
    }
}
