//! UDP link abstraction over the app<->PHY socket pair (§4.2).

mod link;
mod queue;

pub use link::UdpLink;
pub use queue::{InboundItem, InboundQueue};
