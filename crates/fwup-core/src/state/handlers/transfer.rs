//! Code block stores.

use tracing::{debug, trace};

use crate::error::{FailureCause, UpdateError};
use crate::events::UpdateObserver;
use crate::protocol::ResponseCode;

use super::{Exchange, HandleResult, HandlerContext, suspend_reason};

/// Store answered: advance, retry the same index, suspend or fail.
pub fn handle_store<O: UpdateObserver + ?Sized>(
    exchange: Exchange,
    ctx: &mut HandlerContext<'_, O>,
) -> Result<HandleResult, UpdateError> {
    let rsp = match exchange {
        Ok(rsp) => rsp,
        Err(e) => return ctx.channel_failure(e),
    };
    let index = ctx.state.wire_index();

    match rsp.code {
        ResponseCode::Success => {
            if rsp.value != index {
                debug!(index, acked = rsp.value, "Store acknowledged with other index");
            }
            trace!(index, "Block stored");
            ctx.state.block_stored()?;
            Ok(HandleResult::Continue)
        }
        code if code.is_transient() => ctx.retry(FailureCause::Response(code)),
        code => match suspend_reason(code) {
            Some(reason) => Ok(HandleResult::Suspend(reason)),
            None => Err(ctx.rejected(code)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::super::handle_exchange;
    use super::super::tests::{image, ok, state_in};
    use super::*;
    use crate::error::{ErrorKind, Recovery};
    use crate::events::{NullObserver, SuspendReason};
    use crate::state::Phase;

    #[test]
    fn test_invalid_block_retries_same_index() {
        let img = image(3);
        let mut state = state_in(Phase::TransmitCodeBlocks, 3);
        state.block_stored().unwrap();
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 3,
        };

        let result = handle_exchange(ok(ResponseCode::InvalidCodeBlock, 1), &mut ctx).unwrap();
        assert_eq!(result, HandleResult::Continue);
        assert_eq!(ctx.state.current_index(), 1);
        assert_eq!(ctx.state.retry_count(), 1);

        handle_exchange(ok(ResponseCode::Success, 1), &mut ctx).unwrap();
        assert_eq!(state.current_index(), 2);
        assert_eq!(state.retry_count(), 0);
    }

    #[test]
    fn test_exhausted_budget_reports_block() {
        let img = image(3);
        let mut state = state_in(Phase::TransmitCodeBlocks, 3);
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 2,
        };
        let mut last = None;
        for _ in 0..3 {
            last = Some(handle_exchange(ok(ResponseCode::InvalidCrc, 0), &mut ctx));
        }
        let err = last.unwrap().unwrap_err();
        assert_eq!(err.context().and_then(|c| c.block_index), Some(0));
        assert_eq!(err.recovery(), Recovery::RetryLater);
    }

    #[test]
    fn test_connectivity_suspends() {
        let img = image(2);
        let mut state = state_in(Phase::TransmitCodeBlocks, 2);
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 3,
        };
        assert_eq!(
            handle_exchange(ok(ResponseCode::NotConnectedToCharger, 0), &mut ctx).unwrap(),
            HandleResult::Suspend(SuspendReason::NotOnCharger)
        );
        assert_eq!(
            handle_exchange(ok(ResponseCode::DeviceDisconnected, 0), &mut ctx).unwrap(),
            HandleResult::Suspend(SuspendReason::Disconnected)
        );
        assert_eq!(state.current_index(), 0);
    }

    #[test]
    fn test_rejected_key_is_stale_session() {
        let img = image(2);
        let mut state = state_in(Phase::TransmitCodeBlocks, 2);
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 3,
        };
        let err = handle_exchange(ok(ResponseCode::InvalidOperator, 0), &mut ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionFatal);
        assert_eq!(err.recovery(), Recovery::ReErase);
    }
}
