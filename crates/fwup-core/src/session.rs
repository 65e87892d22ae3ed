//! Update session - one device's pass through the protocol.
//!
//! The session decides which command comes next and folds each exchange
//! back into its state. It performs no I/O itself; the orchestrator owns the
//! channel and drives the loop.

use std::sync::Arc;

use tracing::info;

use crate::error::UpdateError;
use crate::events::UpdateObserver;
use crate::payload::CodeBlockSource;
use crate::protocol::{AccessKey, ControlCommand, DEFAULT_MAX_RETRIES};
use crate::snapshot::SessionSnapshot;
use crate::state::{
    Exchange, HandleResult, HandlerContext, Lifecycle, Phase, SessionState, StateError,
    handle_exchange,
};

/// Shared block source handed to a session.
pub type SharedSource = Arc<dyn CodeBlockSource + Send + Sync>;

/// State machine for a single firmware update.
pub struct UpdateSession {
    state: SessionState,
    source: Option<SharedSource>,
    max_retries: u8,
}

impl Default for UpdateSession {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

impl UpdateSession {
    pub fn new(max_retries: u8) -> Self {
        Self {
            state: SessionState::new(),
            source: None,
            max_retries,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle()
    }

    pub fn source(&self) -> Option<&SharedSource> {
        self.source.as_ref()
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    /// NotActive → DownloadFirmware. Already downloading is fine.
    pub fn begin_download(&mut self) -> Result<(), UpdateError> {
        if self.state.phase() != Phase::DownloadFirmware {
            self.state.begin_download()?;
        }
        Ok(())
    }

    /// Attach the blocks to transfer. Only between sessions.
    pub fn load(&mut self, source: SharedSource) -> Result<(), UpdateError> {
        if self.state.phase().is_protocol() {
            return Err(StateError::InvalidTransition {
                action: "load image",
                phase: self.state.phase(),
            }
            .into());
        }
        info!(
            blocks = source.total_blocks(),
            block_size = source.block_size(),
            fingerprint = format!("0x{:08X}", source.fingerprint()),
            "Image loaded"
        );
        self.source = Some(source);
        Ok(())
    }

    /// DownloadFirmware → EraseStagingArea. Returns the requested key.
    pub fn start(&mut self) -> Result<AccessKey, UpdateError> {
        let total = self
            .source
            .as_ref()
            .ok_or(UpdateError::NoImage)?
            .total_blocks();
        self.begin_download()?;
        Ok(self.state.begin_erase(total)?)
    }

    /// Re-enter a persisted position without erasing.
    pub fn resume_from(&mut self, snapshot: &SessionSnapshot) -> Result<(), UpdateError> {
        let source = self.source.as_ref().ok_or(UpdateError::NoImage)?;
        if self.state.phase().is_protocol() {
            return Err(StateError::InvalidTransition {
                action: "resume",
                phase: self.state.phase(),
            }
            .into());
        }
        if let Some(reason) = snapshot.mismatch(source.as_ref()) {
            return Err(UpdateError::StaleSession(reason));
        }
        self.state.restore(
            snapshot.phase,
            snapshot.current_index,
            snapshot.total_blocks,
            snapshot.access_key,
        )?;
        Ok(())
    }

    /// Command for the current state.
    pub fn next_command(&self) -> Result<ControlCommand, UpdateError> {
        let phase = self.state.phase();
        let key = || self.state.access_key().ok_or(StateError::MissingKey(phase));
        let index = self.state.wire_index();

        let command = match phase {
            Phase::EraseStagingArea => ControlCommand::EraseStagingArea {
                key: self
                    .state
                    .requested_key()
                    .ok_or(StateError::MissingKey(phase))?,
            },
            Phase::TransmitCodeBlocks => {
                let source = self.source.as_ref().ok_or(UpdateError::NoImage)?;
                let block = source.block(index).ok_or_else(|| {
                    UpdateError::StaleSession(format!("block {} is not part of the image", index))
                })?;
                ControlCommand::StoreCodeBlock {
                    key: key()?,
                    index,
                    data: block.data.to_vec(),
                }
            }
            // Carries no key on the wire, but never issued outside a session.
            Phase::ReadCrc => {
                key()?;
                ControlCommand::ReadCodeBlockCrc { index }
            }
            Phase::StartFwUpdate => ControlCommand::InitiateFirmwareUpdate { key: key()? },
            _ => {
                return Err(StateError::InvalidTransition {
                    action: "issue command",
                    phase,
                }
                .into());
            }
        };
        Ok(command)
    }

    /// Fold the outcome of the last command into the session.
    pub fn handle<O: UpdateObserver + ?Sized>(
        &mut self,
        exchange: Exchange,
        observer: &O,
    ) -> Result<HandleResult, UpdateError> {
        let source = self.source.clone().ok_or(UpdateError::NoImage)?;
        let mut ctx = HandlerContext {
            state: &mut self.state,
            source: source.as_ref(),
            observer,
            max_retries: self.max_retries,
        };
        handle_exchange(exchange, &mut ctx)
    }

    /// Position to persist, once a key has been issued.
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        let source = self.source.as_ref()?;
        let key = self.state.access_key()?;
        // A block under repair is re-read first when resumed.
        let phase = if self.state.is_repairing() {
            Phase::ReadCrc
        } else {
            self.state.phase()
        };
        if !phase.is_resumable() {
            return None;
        }
        Some(SessionSnapshot {
            fingerprint: source.fingerprint(),
            block_size: source.block_size(),
            total_blocks: source.total_blocks(),
            phase,
            current_index: self.state.current_index(),
            access_key: key,
        })
    }

    /// Progress within the current phase as `(done, total)`.
    pub fn progress(&self) -> (usize, usize) {
        let total = self.state.total_blocks();
        match self.state.phase() {
            Phase::TransmitCodeBlocks | Phase::ReadCrc => (self.state.current_index(), total),
            Phase::StartFwUpdate => (total, total),
            _ => (0, total),
        }
    }

    pub fn pause(&mut self) {
        self.state.pause();
    }

    pub fn suspend(&mut self) {
        self.state.suspend();
    }

    pub fn resume(&mut self) {
        self.state.resume();
    }

    /// Back to NotActive. The loaded image stays.
    pub fn reset(&mut self) {
        self.state.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelError;
    use crate::events::NullObserver;
    use crate::payload::FirmwareImage;
    use crate::protocol::{ControlResponse, ResponseCode};

    fn loaded(blocks: usize) -> (UpdateSession, Arc<FirmwareImage>) {
        let image = Arc::new(FirmwareImage::from_bytes(vec![0xAB; blocks * 32], 32).unwrap());
        let mut session = UpdateSession::new(3);
        session.load(image.clone()).unwrap();
        (session, image)
    }

    fn success(value: u16) -> Exchange {
        Ok(ControlResponse::success(value))
    }

    #[test]
    fn test_command_sequence_shares_key() {
        let (mut session, image) = loaded(2);
        let requested = session.start().unwrap();
        assert_eq!(
            session.next_command().unwrap(),
            ControlCommand::EraseStagingArea { key: requested }
        );
        session.handle(success(0), &NullObserver).unwrap();

        let mut commands = Vec::new();
        while session.phase() != Phase::StartFwUpdate {
            let cmd = session.next_command().unwrap();
            let reply = match &cmd {
                ControlCommand::ReadCodeBlockCrc { index } => image.block(*index).unwrap().crc(),
                _ => 0,
            };
            commands.push(cmd);
            session.handle(success(reply), &NullObserver).unwrap();
        }
        commands.push(session.next_command().unwrap());

        assert_eq!(commands.len(), 5);
        assert!(
            commands
                .iter()
                .filter_map(|c| c.access_key())
                .all(|k| k == requested)
        );
    }

    #[test]
    fn test_only_erase_before_key() {
        let (mut session, _) = loaded(1);
        session.start().unwrap();
        // Still erasing: no key yet, and the erase is the only valid command.
        assert!(matches!(
            session.next_command(),
            Ok(ControlCommand::EraseStagingArea { .. })
        ));
        session.reset();
        assert!(session.next_command().is_err());
    }

    #[test]
    fn test_snapshot_only_after_erase() {
        let (mut session, _) = loaded(3);
        session.start().unwrap();
        assert!(session.snapshot().is_none());
        session.handle(success(0x55), &NullObserver).unwrap();
        session.handle(success(0), &NullObserver).unwrap();

        let snap = session.snapshot().unwrap();
        assert_eq!(snap.phase, Phase::TransmitCodeBlocks);
        assert_eq!(snap.current_index, 1);
        assert_eq!(snap.access_key.value(), 0x55);
    }

    #[test]
    fn test_resume_rejects_other_image() {
        let (mut session, _) = loaded(3);
        session.start().unwrap();
        session.handle(success(0x55), &NullObserver).unwrap();
        let snap = session.snapshot().unwrap();

        let (mut other, _) = loaded(4);
        assert!(matches!(
            other.resume_from(&snap),
            Err(UpdateError::StaleSession(_))
        ));

        let (mut same, _) = loaded(3);
        same.resume_from(&snap).unwrap();
        assert_eq!(same.phase(), Phase::TransmitCodeBlocks);
        assert_eq!(
            same.next_command().unwrap().access_key().map(|k| k.value()),
            Some(0x55)
        );
    }

    #[test]
    fn test_repair_snapshot_points_at_read() {
        let (mut session, _) = loaded(1);
        session.start().unwrap();
        session.handle(success(0x10), &NullObserver).unwrap();
        session.handle(success(0), &NullObserver).unwrap();
        // Device reports a CRC that cannot match the 0xAB block.
        session
            .handle(
                Ok(ControlResponse::new(ResponseCode::Success, 0)),
                &NullObserver,
            )
            .unwrap();
        assert_eq!(session.phase(), Phase::TransmitCodeBlocks);
        assert_eq!(session.snapshot().unwrap().phase, Phase::ReadCrc);
    }

    #[test]
    fn test_disconnect_suspends() {
        let (mut session, _) = loaded(2);
        session.start().unwrap();
        session.handle(success(0x10), &NullObserver).unwrap();
        let result = session
            .handle(Err(ChannelError::Disconnected), &NullObserver)
            .unwrap();
        assert!(matches!(result, HandleResult::Suspend(_)));
        assert_eq!(session.state().current_index(), 0);
    }
}
