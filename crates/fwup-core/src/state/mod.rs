//! State machine module.

pub mod handlers;
pub mod machine;

pub use handlers::{Exchange, HandleResult, HandlerContext, handle_exchange};
pub use machine::{Lifecycle, Phase, SessionState, StateError};
