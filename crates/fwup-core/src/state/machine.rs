//! Firmware update session state.
//!
//! The protocol phase and the lifecycle flag are kept apart, so a session can
//! be paused or suspended in any phase without a combined "paused while
//! canceled" kind of state. Cancellation is not a state at all: it resets the
//! session to `NotActive`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::AccessKey;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Cannot {action} while in {phase}")]
    InvalidTransition { action: &'static str, phase: Phase },
    #[error("No access key in {0}")]
    MissingKey(Phase),
}

/// Protocol phase of an update session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    NotActive,
    DownloadFirmware,
    EraseStagingArea,
    TransmitCodeBlocks,
    ReadCrc,
    StartFwUpdate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::NotActive => write!(f, "NOT_ACTIVE"),
            Phase::DownloadFirmware => write!(f, "DOWNLOAD_FIRMWARE"),
            Phase::EraseStagingArea => write!(f, "ERASE_STAGING_AREA"),
            Phase::TransmitCodeBlocks => write!(f, "TRANSMIT_CODE_BLOCKS"),
            Phase::ReadCrc => write!(f, "READ_CRC"),
            Phase::StartFwUpdate => write!(f, "START_FW_UPDATE"),
        }
    }
}

impl Phase {
    /// Phases that exchange commands with the device.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Phase::EraseStagingArea
                | Phase::TransmitCodeBlocks
                | Phase::ReadCrc
                | Phase::StartFwUpdate
        )
    }

    /// Phases a persisted session can be resumed into.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Phase::TransmitCodeBlocks | Phase::ReadCrc | Phase::StartFwUpdate
        )
    }
}

/// Orthogonal run state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Lifecycle {
    #[default]
    Active,
    /// Frozen by the user; no writes until continued.
    Paused,
    /// Waiting for the device to come back.
    Suspended,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Active => write!(f, "ACTIVE"),
            Lifecycle::Paused => write!(f, "PAUSED"),
            Lifecycle::Suspended => write!(f, "SUSPENDED"),
        }
    }
}

/// Runtime state of one update session.
#[derive(Debug, Default, Clone)]
pub struct SessionState {
    phase: Phase,
    lifecycle: Lifecycle,
    /// Index of the block in flight.
    current_index: usize,
    total_blocks: usize,
    /// Confirmed session key.
    access_key: Option<AccessKey>,
    /// Key sent with the erase, until the device confirms it.
    requested_key: Option<AccessKey>,
    /// Failed attempts for the block in flight.
    retry_count: u8,
    /// Re-storing a block whose CRC did not verify.
    repairing: bool,
    /// Initiate has been written to the device.
    initiate_sent: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn access_key(&self) -> Option<AccessKey> {
        self.access_key
    }

    pub fn requested_key(&self) -> Option<AccessKey> {
        self.requested_key
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    pub fn is_repairing(&self) -> bool {
        self.repairing
    }

    pub fn initiate_sent(&self) -> bool {
        self.initiate_sent
    }

    /// Block currently addressed, as sent on the wire.
    pub fn wire_index(&self) -> u16 {
        self.current_index as u16
    }

    /// Transition to a new phase.
    fn goto_phase(&mut self, new_phase: Phase) {
        info!(from = %self.phase, to = %new_phase, "Phase transition");
        self.phase = new_phase;
        self.retry_count = 0;
    }

    fn expect(&self, action: &'static str, phase: Phase) -> Result<(), StateError> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(StateError::InvalidTransition {
                action,
                phase: self.phase,
            })
        }
    }

    /// NotActive → DownloadFirmware.
    pub fn begin_download(&mut self) -> Result<(), StateError> {
        self.expect("begin download", Phase::NotActive)?;
        self.goto_phase(Phase::DownloadFirmware);
        Ok(())
    }

    /// DownloadFirmware → EraseStagingArea with a fresh key request.
    pub fn begin_erase(&mut self, total_blocks: usize) -> Result<AccessKey, StateError> {
        self.expect("erase staging area", Phase::DownloadFirmware)?;
        let key = AccessKey::generate();
        self.total_blocks = total_blocks;
        self.current_index = 0;
        self.access_key = None;
        self.requested_key = Some(key);
        self.goto_phase(Phase::EraseStagingArea);
        Ok(key)
    }

    /// EraseStagingArea → TransmitCodeBlocks once the device accepted the erase.
    ///
    /// A non-zero response value is the device-issued key; zero confirms the
    /// requested one.
    pub fn erase_confirmed(&mut self, response_value: u16) -> Result<AccessKey, StateError> {
        self.expect("confirm erase", Phase::EraseStagingArea)?;
        let key = AccessKey::new(response_value)
            .or(self.requested_key)
            .ok_or(StateError::MissingKey(self.phase))?;
        self.access_key = Some(key);
        self.requested_key = None;
        self.current_index = 0;
        info!(key = %key, "Staging area erased");
        self.goto_phase(Phase::TransmitCodeBlocks);
        Ok(key)
    }

    /// Current block acknowledged by the device.
    pub fn block_stored(&mut self) -> Result<(), StateError> {
        self.expect("store block", Phase::TransmitCodeBlocks)?;
        if self.repairing {
            // Re-read the repaired block; the retry budget carries over.
            self.repairing = false;
            self.phase = Phase::ReadCrc;
            debug!(index = self.current_index, "Repaired block, re-reading CRC");
            return Ok(());
        }
        self.current_index += 1;
        self.retry_count = 0;
        if self.current_index >= self.total_blocks {
            self.current_index = 0;
            self.goto_phase(Phase::ReadCrc);
        }
        Ok(())
    }

    /// Current block's device CRC matches.
    pub fn block_verified(&mut self) -> Result<(), StateError> {
        self.expect("verify block", Phase::ReadCrc)?;
        self.current_index += 1;
        self.retry_count = 0;
        if self.current_index >= self.total_blocks {
            self.current_index = 0;
            self.goto_phase(Phase::StartFwUpdate);
        }
        Ok(())
    }

    /// ReadCrc → TransmitCodeBlocks for the current index only.
    pub fn begin_repair(&mut self) -> Result<(), StateError> {
        self.expect("repair block", Phase::ReadCrc)?;
        self.repairing = true;
        self.phase = Phase::TransmitCodeBlocks;
        debug!(index = self.current_index, "CRC mismatch, re-storing block");
        Ok(())
    }

    /// Count a failed attempt; `false` once the budget is exceeded.
    pub fn record_retry(&mut self, max_retries: u8) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count <= max_retries
    }

    pub fn mark_initiate_sent(&mut self) {
        self.initiate_sent = true;
    }

    pub fn pause(&mut self) {
        if self.lifecycle == Lifecycle::Active {
            self.lifecycle = Lifecycle::Paused;
        }
    }

    pub fn suspend(&mut self) {
        self.lifecycle = Lifecycle::Suspended;
    }

    /// Back to active from paused or suspended. Position is untouched.
    pub fn resume(&mut self) {
        self.lifecycle = Lifecycle::Active;
    }

    /// Re-enter a persisted position without erasing.
    pub fn restore(
        &mut self,
        phase: Phase,
        index: usize,
        total_blocks: usize,
        key: AccessKey,
    ) -> Result<(), StateError> {
        if !phase.is_resumable() {
            return Err(StateError::InvalidTransition {
                action: "restore",
                phase,
            });
        }
        *self = Self {
            phase,
            current_index: index,
            total_blocks,
            access_key: Some(key),
            ..Self::default()
        };
        info!(phase = %phase, index, key = %key, "Session restored");
        Ok(())
    }

    /// Back to NotActive, forgetting key and position.
    pub fn reset(&mut self) {
        if self.phase != Phase::NotActive {
            info!(from = %self.phase, to = %Phase::NotActive, "Phase transition");
        }
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transmitting(total: usize) -> SessionState {
        let mut s = SessionState::new();
        s.begin_download().unwrap();
        s.begin_erase(total).unwrap();
        s.erase_confirmed(0x1234).unwrap();
        s
    }

    #[test]
    fn test_erase_adopts_device_key() {
        let s = transmitting(3);
        assert_eq!(s.phase(), Phase::TransmitCodeBlocks);
        assert_eq!(s.access_key().map(|k| k.value()), Some(0x1234));
        assert_eq!(s.requested_key(), None);
    }

    #[test]
    fn test_zero_erase_value_confirms_requested_key() {
        let mut s = SessionState::new();
        s.begin_download().unwrap();
        let requested = s.begin_erase(1).unwrap();
        let key = s.erase_confirmed(0).unwrap();
        assert_eq!(key, requested);
    }

    #[test]
    fn test_store_then_verify_walks_indices() {
        let mut s = transmitting(2);
        s.block_stored().unwrap();
        assert_eq!(s.current_index(), 1);
        s.block_stored().unwrap();
        assert_eq!(s.phase(), Phase::ReadCrc);
        assert_eq!(s.current_index(), 0);

        s.block_verified().unwrap();
        s.block_verified().unwrap();
        assert_eq!(s.phase(), Phase::StartFwUpdate);
    }

    #[test]
    fn test_repair_returns_to_same_index() {
        let mut s = transmitting(3);
        for _ in 0..3 {
            s.block_stored().unwrap();
        }
        s.block_verified().unwrap();
        assert!(s.record_retry(3));
        s.begin_repair().unwrap();
        assert_eq!(s.phase(), Phase::TransmitCodeBlocks);
        assert_eq!(s.current_index(), 1);

        s.block_stored().unwrap();
        assert_eq!(s.phase(), Phase::ReadCrc);
        assert_eq!(s.current_index(), 1);
        assert_eq!(s.retry_count(), 1);
    }

    #[test]
    fn test_retry_budget() {
        let mut s = transmitting(1);
        assert!(s.record_retry(2));
        assert!(s.record_retry(2));
        assert!(!s.record_retry(2));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut s = SessionState::new();
        assert!(matches!(
            s.block_stored(),
            Err(StateError::InvalidTransition {
                phase: Phase::NotActive,
                ..
            })
        ));
        assert!(s.begin_erase(1).is_err());
    }

    #[test]
    fn test_pause_resume_keeps_position() {
        let mut s = transmitting(4);
        s.block_stored().unwrap();
        let key = s.access_key();
        s.pause();
        assert_eq!(s.lifecycle(), Lifecycle::Paused);
        s.resume();
        assert_eq!(s.lifecycle(), Lifecycle::Active);
        assert_eq!(s.current_index(), 1);
        assert_eq!(s.phase(), Phase::TransmitCodeBlocks);
        assert_eq!(s.access_key(), key);
    }

    #[test]
    fn test_reset_clears_key() {
        let mut s = transmitting(4);
        s.reset();
        assert_eq!(s.phase(), Phase::NotActive);
        assert_eq!(s.access_key(), None);
        assert_eq!(s.current_index(), 0);
    }

    #[test]
    fn test_restore_only_into_resumable_phase() {
        let mut s = SessionState::new();
        let key = AccessKey::new(5).unwrap();
        assert!(s.restore(Phase::EraseStagingArea, 0, 4, key).is_err());
        s.restore(Phase::ReadCrc, 2, 4, key).unwrap();
        assert_eq!(s.phase(), Phase::ReadCrc);
        assert_eq!(s.current_index(), 2);
    }
}
