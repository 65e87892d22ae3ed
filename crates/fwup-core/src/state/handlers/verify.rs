//! Per-block CRC read-back.
//!
//! `InvalidCRC` from the device means it could not compute the CRC, so the
//! read is repeated. A CRC that differs from the local one means the staged
//! block is bad; that single block is stored again and then re-read. Both
//! paths draw on the same per-index retry budget.

use tracing::{trace, warn};

use crate::error::{FailureCause, UpdateError};
use crate::events::UpdateObserver;
use crate::protocol::ResponseCode;

use super::{Exchange, HandleResult, HandlerContext, suspend_reason};

pub fn handle_crc<O: UpdateObserver + ?Sized>(
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
            let expected = ctx
                .source
                .block(index)
                .map(|block| block.crc())
                .ok_or_else(|| {
                    UpdateError::StaleSession(format!("block {} is not part of the image", index))
                })?;

            if rsp.value == expected {
                trace!(index, crc = expected, "Block verified");
                ctx.state.block_verified()?;
                return Ok(HandleResult::Continue);
            }

            warn!(
                index,
                expected = format!("0x{:04X}", expected),
                actual = format!("0x{:04X}", rsp.value),
                "CRC mismatch"
            );
            let result = ctx.retry(FailureCause::CrcMismatch {
                expected,
                actual: rsp.value,
            })?;
            ctx.state.begin_repair()?;
            Ok(result)
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
    use crate::error::Recovery;
    use crate::events::NullObserver;
    use crate::payload::CodeBlockSource;
    use crate::state::Phase;

    #[test]
    fn test_matching_crc_advances() {
        let img = image(2);
        let mut state = state_in(Phase::ReadCrc, 2);
        let crc = img.block(0).unwrap().crc();
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 3,
        };
        handle_exchange(ok(ResponseCode::Success, crc), &mut ctx).unwrap();
        assert_eq!(state.current_index(), 1);
        assert_eq!(state.phase(), Phase::ReadCrc);
    }

    #[test]
    fn test_mismatch_restores_one_block() {
        let img = image(3);
        let mut state = state_in(Phase::ReadCrc, 3);
        state.block_verified().unwrap();
        let crc = img.block(1).unwrap().crc();
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 3,
        };

        handle_exchange(ok(ResponseCode::Success, crc ^ 0xFFFF), &mut ctx).unwrap();
        assert_eq!(ctx.state.phase(), Phase::TransmitCodeBlocks);
        assert_eq!(ctx.state.current_index(), 1);

        // Store of the repaired block goes straight back to the read.
        handle_exchange(ok(ResponseCode::Success, 1), &mut ctx).unwrap();
        assert_eq!(ctx.state.phase(), Phase::ReadCrc);
        assert_eq!(ctx.state.current_index(), 1);
        assert_eq!(ctx.state.retry_count(), 1);

        handle_exchange(ok(ResponseCode::Success, crc), &mut ctx).unwrap();
        assert_eq!(state.current_index(), 2);
    }

    #[test]
    fn test_invalid_crc_rereads_without_store() {
        let img = image(2);
        let mut state = state_in(Phase::ReadCrc, 2);
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 3,
        };
        handle_exchange(ok(ResponseCode::InvalidCrc, 0), &mut ctx).unwrap();
        assert_eq!(state.phase(), Phase::ReadCrc);
        assert_eq!(state.current_index(), 0);
        assert_eq!(state.retry_count(), 1);
    }

    #[test]
    fn test_persistent_mismatch_is_resumable_failure() {
        let img = image(2);
        let mut state = state_in(Phase::ReadCrc, 2);
        let bad = img.block(0).unwrap().crc() ^ 1;
        let mut ctx = HandlerContext {
            state: &mut state,
            source: &img,
            observer: &NullObserver,
            max_retries: 0,
        };
        let err = handle_exchange(ok(ResponseCode::Success, bad), &mut ctx).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::RetriesExhausted {
                last: FailureCause::CrcMismatch { actual, .. },
                ..
            } if actual == bad
        ));
        assert_eq!(err.recovery(), Recovery::RetryLater);
        // Nothing changed, so a later resume re-reads the same block.
        assert_eq!(state.phase(), Phase::ReadCrc);
    }
}
