//! Protocol module - control point wire format.

pub mod command;
pub mod constants;
pub mod response;

pub use command::{AccessKey, CommandParseError, ControlCommand, EncodeError};
pub use constants::*;
pub use response::{ControlResponse, DecodeError, ResponseCode};
