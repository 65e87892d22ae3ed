//! Transport layer module.

pub mod link;
pub mod mock;
pub mod sim;
pub mod traits;

pub use link::{LinkEndpoint, LinkEvent, LinkTransport, link_pair, link_pair_with_mtu};
pub use mock::{MockReply, MockTransport};
pub use sim::{FaultAction, SimulatedDevice};
pub use traits::{ControlPointTransport, TransportError};
