//! Frame codec and wire metadata types (design doc §4.1).

mod frame;

pub use frame::{Dest, Frame, FrameMeta, MsgKind};
