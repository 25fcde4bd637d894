//! Experiment controller (leader side) and follower experiment role (§4.6,
//! §4.7): the reliability-sweep grid walk, the Bernoulli vote policy, and
//! the TX gain control loop.

pub mod artifact;
pub mod controller;
pub mod follower;

pub use artifact::{aggregate_cell, Cell, CellAggregate, ConfigSummary, ResultArtifact, RoundRecord};
pub use controller::{ExpBeginBody, ExperimentController};
pub use follower::{BernoulliVotePolicy, GainController};
