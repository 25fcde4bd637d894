//! Core library for a vehicular wireless-consensus testbed node: UDP/SDR
//! transport, a weighted-commit Raft-style consensus engine, and the
//! reliability-sweep experiment controller/follower roles. Linked by the
//! `vraft_node` binary.

pub mod utils;
pub mod wire;
pub mod transport;
pub mod peers;
pub mod consensus;
pub mod round;
pub mod experiment;
pub mod phy;
pub mod node;

pub use consensus::{weighted_commit, ConsensusEngine, WeightedCommitResult};
pub use node::Node;
pub use round::RoundOutcome;
pub use utils::{ErrorKind, VRaftError};
