//! Term-numbered election/heartbeat maintenance, log-append with majority
//! confirmation, and the deterministic weighted-commit rule (§4.4).

pub(crate) mod election;
pub(crate) mod replication;

pub use election::ElectionOutcome;
pub use replication::{weighted_commit, WeightedCommitResult};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::peers::PeerTable;
use crate::transport::UdpLink;
use crate::utils::TomlTunables;
use crate::wire::Dest;

pub type Term = u64;
pub type NodeId = u8;

/// A voting policy a follower applies when deciding whether to grant a
/// vote on an otherwise-acceptable `AppendEntries`. The default policy
/// grants unconditionally; the experiment follower role (§4.7) substitutes
/// a Bernoulli policy. Kept as a trait object so the replication path
/// doesn't need to know which experiment phase is active.
pub trait VotePolicy: Send + Sync {
    fn decide(&self, prev_matches: bool) -> bool;

    /// Whether `handle_append` should append regardless of whether `prev`
    /// matches this node's log, per §4.7 ("it appends unconditionally").
    /// The vanilla Raft policy below keeps the real accept-iff-match rule;
    /// only the experiment follower role overrides this to `true`.
    fn force_append(&self) -> bool {
        false
    }

    /// Swaps in a new Bernoulli grant probability, per the `EXP_BEGIN{p_node}`
    /// broadcast of §4.6 step 2. A no-op for policies with no such notion.
    fn set_p_node(&self, _p_node: f32) {}
}

/// Always grants exactly when `prev` matched -- the vanilla Raft acceptance
/// rule, used outside of the reliability-experiment follower role (e.g.
/// during the leader-restart failure test of §8 scenario 6, where real
/// majority semantics apply).
pub struct AlwaysGrant;

impl VotePolicy for AlwaysGrant {
    fn decide(&self, prev_matches: bool) -> bool {
        prev_matches
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// A log entry. `ground_truth` is populated only at the proposing leader
/// and never serialized onto the wire (see `wire::FrameMeta`, which has no
/// such field, and `replication::WireEntry`, which carries only `payload`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: Term,
    pub payload: Vec<u8>,
    pub ground_truth: Option<bool>,
}

/// One follower's response to a round's `AppendEntries`. `granted=false` is
/// an explicit "no", distinct from never having voted at all.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoteRecord {
    pub round_id: u64,
    pub voter: NodeId,
    pub granted: bool,
    pub observed_snr_db: f32,
    pub received_at: Instant,
}

/// Mutable Raft state, guarded by a single lock per the design doc's
/// one-lock-per-structure rule.
pub(crate) struct ConsensusState {
    pub role: Role,
    pub curr_term: Term,
    pub voted_for: Option<NodeId>,
    pub votes_granted: HashSet<NodeId>,
    pub log: Vec<LogEntry>, // log[0] is a term-0 sentinel, indices are 1-based
    pub commit_index: u64,
}

impl ConsensusState {
    fn new() -> Self {
        ConsensusState {
            role: Role::Follower,
            curr_term: 0,
            voted_for: None,
            votes_granted: HashSet::new(),
            log: vec![LogEntry {
                index: 0,
                term: 0,
                payload: vec![],
                ground_truth: None,
            }],
            commit_index: 0,
        }
    }

    pub fn last_index(&self) -> u64 {
        self.log.last().unwrap().index
    }

    pub fn last_term(&self) -> Term {
        self.log.last().unwrap().term
    }
}

/// Ties together the node's identity, its (pinned) leader id, the shared
/// peer table and link, and the guarded Raft state. One instance per node.
pub struct ConsensusEngine {
    pub id: NodeId,
    pub leader_id: NodeId,
    pub population: u8,
    pub tunables: TomlTunables,
    pub peers: Arc<PeerTable>,
    pub link: Arc<UdpLink>,
    pub(crate) state: Mutex<ConsensusState>,
}

impl ConsensusEngine {
    pub fn new(
        id: NodeId,
        leader_id: NodeId,
        population: u8,
        tunables: TomlTunables,
        peers: Arc<PeerTable>,
        link: Arc<UdpLink>,
    ) -> Self {
        ConsensusEngine {
            id,
            leader_id,
            population,
            tunables,
            peers,
            link,
            state: Mutex::new(ConsensusState::new()),
        }
    }

    pub fn is_pinned_leader(&self) -> bool {
        self.id == self.leader_id
    }

    pub async fn role(&self) -> Role {
        self.state.lock().await.role
    }

    pub async fn curr_term(&self) -> Term {
        self.state.lock().await.curr_term
    }

    pub async fn commit_index(&self) -> u64 {
        self.state.lock().await.commit_index
    }

    /// Whether `dst` targets this node: either a direct match or broadcast.
    pub fn targets_me(&self, dst: Dest) -> bool {
        matches!(dst, Dest::Broadcast) || dst == Dest::Node(self.id)
    }

    /// Adopts `term` if it's higher than ours, reverting to `Follower` if
    /// we were `Candidate`/`Leader`. Returns true if we stepped down.
    /// Mirrors the teacher's `check_term` (protocols/craft/leadership.rs).
    pub(crate) async fn adopt_higher_term(&self, term: Term) -> bool {
        let mut st = self.state.lock().await;
        if term > st.curr_term {
            st.curr_term = term;
            st.voted_for = None;
            st.votes_granted.clear();
            let stepped_down = st.role != Role::Follower;
            st.role = Role::Follower;
            stepped_down
        } else {
            false
        }
    }
}
