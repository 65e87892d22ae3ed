//! Initiate firmware update.
//!
//! The device reboots into the new image right after accepting the initiate,
//! so losing the link once the command went out is the normal way this
//! exchange ends.

use tracing::info;

use crate::channel::ChannelError;
use crate::error::UpdateError;
use crate::events::{LogLevel, SuspendReason, UpdateObserver};
use crate::protocol::ResponseCode;

use super::{Exchange, HandleResult, HandlerContext};

pub fn handle_initiate<O: UpdateObserver + ?Sized>(
    exchange: Exchange,
    ctx: &mut HandlerContext<'_, O>,
) -> Result<HandleResult, UpdateError> {
    match exchange {
        Ok(rsp) => match rsp.code {
            ResponseCode::Success | ResponseCode::DeviceDisconnected => {
                info!(response = %rsp.code, "Firmware update initiated");
                ctx.state.mark_initiate_sent();
                Ok(HandleResult::Complete)
            }
            // Verified staging stays valid; try again once charging.
            ResponseCode::NotConnectedToCharger => {
                ctx.log(LogLevel::Warn, "Device must be on the charger to apply");
                Ok(HandleResult::Suspend(SuspendReason::NotOnCharger))
            }
            code => Err(ctx.rejected(code)),
        },
        Err(ChannelError::Disconnected) => {
            info!("Device dropped the link after initiate");
            ctx.state.mark_initiate_sent();
            Ok(HandleResult::Complete)
        }
        Err(ChannelError::NotConnected) if ctx.state.initiate_sent() => {
            // An earlier initiate got no answer and the device is now gone.
            Ok(HandleResult::Complete)
        }
        Err(e) => {
            if e.is_lost() {
                ctx.state.mark_initiate_sent();
            }
            ctx.channel_failure(e)
        }
    }
}
