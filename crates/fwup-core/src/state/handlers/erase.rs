//! Staging area erase.

use tracing::info;

use crate::error::UpdateError;
use crate::events::{LogLevel, SuspendReason, UpdateObserver};
use crate::protocol::ResponseCode;

use super::{Exchange, HandleResult, HandlerContext};

/// Erase answered: adopt the key or end the session.
///
/// There is no partial-erase recovery, so anything but `Success` or a
/// disconnect is fatal.
pub fn handle_erase<O: UpdateObserver + ?Sized>(
    exchange: Exchange,
    ctx: &mut HandlerContext<'_, O>,
) -> Result<HandleResult, UpdateError> {
    let rsp = match exchange {
        Ok(rsp) => rsp,
        Err(e) => return ctx.channel_failure(e),
    };

    match rsp.code {
        ResponseCode::Success => {
            let key = ctx.state.erase_confirmed(rsp.value)?;
            info!(key = %key, blocks = ctx.state.total_blocks(), "Erase accepted");
            ctx.log(
                LogLevel::Info,
                format!("Staging area erased, session key {}", key),
            );
            Ok(HandleResult::Continue)
        }
        ResponseCode::DeviceDisconnected => Ok(HandleResult::Suspend(SuspendReason::Disconnected)),
        code => Err(ctx.rejected(code)),
    }
}

#[cfg(test)]
mod tests {
    use super::super::handle_exchange;
    use super::super::tests::{image, ok, state_in};
    use super::*;
    use crate::error::{ErrorKind, Recovery};
    use crate::events::NullObserver;
    use crate::state::Phase;

    #[test]
    fn test_success_adopts_key() {
        let img = image(3);
        let mut state = state_in(Phase::EraseStagingArea, 3);
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 3,
        };
        let result = handle_exchange(ok(ResponseCode::Success, 0x7777), &mut ctx).unwrap();
        assert_eq!(result, HandleResult::Continue);
        assert_eq!(state.phase(), Phase::TransmitCodeBlocks);
        assert_eq!(state.access_key().map(|k| k.value()), Some(0x7777));
    }

    #[test]
    fn test_any_other_response_is_fatal() {
        for code in [
            ResponseCode::NotSupported,
            ResponseCode::InvalidOperator,
            ResponseCode::InvalidCrc,
            ResponseCode::NotConnectedToCharger,
        ] {
            let img = image(1);
            let mut state = state_in(Phase::EraseStagingArea, 1);
            let mut ctx = HandlerContext {
                state: &mut state,
                source: &img,
                observer: &NullObserver,
                max_retries: 3,
            };
            let err = handle_exchange(ok(code, 0), &mut ctx).unwrap_err();
            assert_eq!(err.response(), Some(code));
            assert_eq!(err.recovery(), Recovery::ReErase);
            assert_eq!(state.access_key(), None);
        }
    }

    #[test]
    fn test_not_supported_is_session_fatal() {
        let img = image(1);
        let mut state = state_in(Phase::EraseStagingArea, 1);
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 3,
        };
        let err = handle_exchange(ok(ResponseCode::NotSupported, 0), &mut ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionFatal);
    }
}
