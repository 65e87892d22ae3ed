//! Response handlers - interpret one control point exchange per phase.
//!
//! This module is split into submodules by phase:
//! - `erase`: staging area erase and key confirmation
//! - `transfer`: code block stores
//! - `verify`: per-block CRC read-back and repair
//! - `apply`: initiate firmware update

mod apply;
mod erase;
mod transfer;
mod verify;

use tracing::warn;

use crate::channel::ChannelError;
use crate::error::{FailureCause, FailureContext, UpdateError};
use crate::events::{LogLevel, SuspendReason, UpdateEvent, UpdateObserver};
use crate::payload::CodeBlockSource;
use crate::protocol::{ControlResponse, ResponseCode};
use crate::state::machine::{Phase, SessionState, StateError};

use apply::handle_initiate;
use erase::handle_erase;
use transfer::handle_store;
use verify::handle_crc;

/// Outcome of one request on the control point.
pub type Exchange = Result<ControlResponse, ChannelError>;

/// Result of handling an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// Issue the next command for the current state.
    Continue,
    /// Stop issuing commands until the device is back.
    Suspend(SuspendReason),
    /// Device accepted the new firmware.
    Complete,
}

/// Handler context containing all resources.
pub struct HandlerContext<'a, O: UpdateObserver + ?Sized> {
    pub state: &'a mut SessionState,
    pub source: &'a dyn CodeBlockSource,
    pub observer: &'a O,
    pub max_retries: u8,
}

impl<'a, O: UpdateObserver + ?Sized> HandlerContext<'a, O> {
    pub(crate) fn emit(&self, event: UpdateEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(UpdateEvent::Log {
            level,
            message: message.into(),
        });
    }

    /// Phase and, for block phases, the block in flight.
    pub(crate) fn failure_context(&self) -> FailureContext {
        let phase = self.state.phase();
        let block_index = matches!(phase, Phase::TransmitCodeBlocks | Phase::ReadCrc)
            .then(|| self.state.wire_index());
        FailureContext { phase, block_index }
    }

    pub(crate) fn rejected(&self, response: ResponseCode) -> UpdateError {
        UpdateError::Rejected {
            context: self.failure_context(),
            response,
        }
    }

    /// Count a failed attempt and repeat the same command, or give up once
    /// the budget is spent.
    pub(crate) fn retry(&mut self, cause: FailureCause) -> Result<HandleResult, UpdateError> {
        if self.state.record_retry(self.max_retries) {
            let attempt = self.state.retry_count();
            warn!(
                phase = %self.state.phase(),
                index = self.state.current_index(),
                attempt,
                cause = %cause,
                "Retrying"
            );
            self.emit(UpdateEvent::Retry {
                phase: self.state.phase(),
                index: self.state.wire_index(),
                attempt,
                cause: cause.to_string(),
            });
            Ok(HandleResult::Continue)
        } else {
            Err(UpdateError::RetriesExhausted {
                context: self.failure_context(),
                attempts: self.state.retry_count(),
                last: cause,
            })
        }
    }

    /// Channel failures shared by every phase.
    pub(crate) fn channel_failure(&mut self, err: ChannelError) -> Result<HandleResult, UpdateError> {
        match err {
            ChannelError::Timeout { .. } => self.retry(FailureCause::Timeout),
            ChannelError::Malformed(e) => {
                self.log(LogLevel::Warn, format!("Malformed response: {}", e));
                self.retry(FailureCause::Malformed)
            }
            ChannelError::Disconnected | ChannelError::NotConnected => {
                Ok(HandleResult::Suspend(SuspendReason::Disconnected))
            }
            other => Err(other.into()),
        }
    }
}

/// Suspension a connectivity response asks for.
pub(crate) fn suspend_reason(code: ResponseCode) -> Option<SuspendReason> {
    match code {
        ResponseCode::DeviceDisconnected => Some(SuspendReason::Disconnected),
        ResponseCode::NotConnectedToCharger => Some(SuspendReason::NotOnCharger),
        _ => None,
    }
}

/// Interpret `exchange` for the command issued in the current phase.
pub fn handle_exchange<O: UpdateObserver + ?Sized>(
    exchange: Exchange,
    ctx: &mut HandlerContext<'_, O>,
) -> Result<HandleResult, UpdateError> {
    match ctx.state.phase() {
        Phase::EraseStagingArea => handle_erase(exchange, ctx),
        Phase::TransmitCodeBlocks => handle_store(exchange, ctx),
        Phase::ReadCrc => handle_crc(exchange, ctx),
        Phase::StartFwUpdate => handle_initiate(exchange, ctx),
        phase => Err(StateError::InvalidTransition {
            action: "handle response",
            phase,
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::NullObserver;
    use crate::payload::FirmwareImage;
    use crate::protocol::DecodeError;

    pub(super) fn image(blocks: usize) -> FirmwareImage {
        let data: Vec<u8> = (0..blocks * 16).map(|i| i as u8).collect();
        FirmwareImage::from_bytes(data, 16).unwrap()
    }

    pub(super) fn state_in(phase: Phase, total: usize) -> SessionState {
        let mut s = SessionState::new();
        s.begin_download().unwrap();
        s.begin_erase(total).unwrap();
        if phase == Phase::EraseStagingArea {
            return s;
        }
        s.erase_confirmed(0x4242).unwrap();
        while s.phase() != phase {
            match s.phase() {
                Phase::TransmitCodeBlocks => s.block_stored().unwrap(),
                Phase::ReadCrc => s.block_verified().unwrap(),
                _ => unreachable!(),
            }
        }
        s
    }

    pub(super) fn ok(code: ResponseCode, value: u16) -> Exchange {
        Ok(ControlResponse::new(code, value))
    }

    #[test]
    fn test_lost_responses_retry_then_exhaust() {
        let img = image(2);
        let mut state = state_in(Phase::TransmitCodeBlocks, 2);
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 1,
        };
        let timeout = || Err(ChannelError::Timeout { timeout_ms: 5 });

        assert_eq!(
            handle_exchange(timeout(), &mut ctx).unwrap(),
            HandleResult::Continue
        );
        let err = handle_exchange(timeout(), &mut ctx).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::RetriesExhausted {
                attempts: 2,
                last: FailureCause::Timeout,
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_malformed_responses_retry_then_exhaust() {
        let img = image(3);
        let mut state = state_in(Phase::TransmitCodeBlocks, 3);
        state.block_stored().unwrap();
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 2,
        };
        let garbage = || Err(ChannelError::Malformed(DecodeError::Malformed { code: 0xEE }));

        for attempt in 1..=2 {
            assert_eq!(
                handle_exchange(garbage(), &mut ctx).unwrap(),
                HandleResult::Continue
            );
            assert_eq!(ctx.state.current_index(), 1);
            assert_eq!(ctx.state.retry_count(), attempt);
        }
        let err = handle_exchange(garbage(), &mut ctx).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::RetriesExhausted {
                attempts: 3,
                last: FailureCause::Malformed,
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert_eq!(err.context().and_then(|c| c.block_index), Some(1));
    }

    #[test]
    fn test_disconnect_suspends_mid_transfer() {
        let img = image(2);
        let mut state = state_in(Phase::ReadCrc, 2);
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 3,
        };
        assert_eq!(
            handle_exchange(Err(ChannelError::Disconnected), &mut ctx).unwrap(),
            HandleResult::Suspend(SuspendReason::Disconnected)
        );
        assert_eq!(state.phase(), Phase::ReadCrc);
    }

    #[test]
    fn test_no_handler_outside_protocol_phases() {
        let img = image(1);
        let mut state = SessionState::new();
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 3,
        };
        assert!(matches!(
            handle_exchange(ok(ResponseCode::Success, 0), &mut ctx),
            Err(UpdateError::State(_))
        ));
    }
}
