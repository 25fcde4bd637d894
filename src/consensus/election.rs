//! Leader election: timeout-triggered candidacy, RequestVote handling, and
//! the (normally dormant) majority-vote leader transition.
//!
//! Under normal operation the pinned `leader_id` steps directly into the
//! `Leader` role at startup (§4.4: "the leader role is pinned ... elections
//! are not exercised under normal operation"). This machinery only
//! activates when a follower stops hearing heartbeats -- exercised by the
//! leader-crash failure test (§8 scenario 6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Mutex as AsyncMutex;

use crate::consensus::{ConsensusEngine, NodeId, Role, Term};
use crate::utils::{Timer, VRaftError};
use crate::wire::{Dest, Frame, FrameMeta, MsgKind};
use crate::{pf_info, pf_trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    StayedFollower,
    BecameCandidate,
    BecameLeader,
    SteppedDown,
}

/// Per-node election timer, seeded from the node id so timeout draws are
/// reproducible across runs (§4.4: "randomized per node, seeded by id").
pub struct ElectionTimer {
    rng: AsyncMutex<StdRng>,
    timer: AsyncMutex<Timer>,
}

impl ElectionTimer {
    pub fn new(id: NodeId) -> Self {
        ElectionTimer {
            rng: AsyncMutex::new(StdRng::seed_from_u64(id as u64)),
            timer: AsyncMutex::new(Timer::new()),
        }
    }

    /// Re-arms the timer to fire after a uniform random draw in
    /// `[1.5s, 3.0s]` (or the tunable override).
    pub async fn kickoff(&self, lo: Duration, hi: Duration) {
        use rand::Rng;
        let mut rng = self.rng.lock().await;
        let lo_ns = lo.as_nanos() as u64;
        let hi_ns = hi.as_nanos().max(lo_ns as u128 + 1) as u64;
        let dur = Duration::from_nanos(rng.gen_range(lo_ns..hi_ns));
        self.timer.lock().await.kickoff(dur);
    }

    pub async fn sleep(&self) {
        // Snapshot the deadline under the lock, then await outside of it so
        // concurrent `kickoff` calls aren't blocked by a long sleep.
        let sleep_fut = {
            let t = self.timer.lock().await;
            t.sleep()
        };
        sleep_fut.await;
    }
}

/// Runs until `shutdown` is set. On every fire, attempts to become a
/// candidate (becoming a no-op if we're already the leader or the pinned
/// leader is still being heard from).
pub async fn run_election_ticker(
    engine: Arc<ConsensusEngine>,
    election_timer: Arc<ElectionTimer>,
    shutdown: Arc<AtomicBool>,
) {
    election_timer
        .kickoff(
            Duration::from_millis(engine.tunables.election_timeout_lo_ms),
            Duration::from_millis(engine.tunables.election_timeout_hi_ms),
        )
        .await;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        tokio::select! {
            _ = election_timer.sleep() => {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                if let Err(e) = become_candidate(&engine).await {
                    pf_trace!("election tick error: {}", e);
                }
                election_timer
                    .kickoff(
                        Duration::from_millis(engine.tunables.election_timeout_lo_ms),
                        Duration::from_millis(engine.tunables.election_timeout_hi_ms),
                    )
                    .await;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                // periodically re-check shutdown even if timer never fires
            }
        }
    }
}

/// Directly installs this node as `Leader` at term 1 without an election,
/// used only for the pinned `leader_id` at startup.
pub async fn pin_as_leader(engine: &ConsensusEngine) {
    let mut st = engine.state.lock().await;
    st.role = Role::Leader;
    st.curr_term = 1;
    pf_info!("pinned leader, starting at term {}", st.curr_term);
}

pub async fn become_candidate(
    engine: &Arc<ConsensusEngine>,
) -> Result<ElectionOutcome, VRaftError> {
    let (term, last_index, last_term) = {
        let mut st = engine.state.lock().await;
        if st.role == Role::Leader {
            return Ok(ElectionOutcome::StayedFollower);
        }
        st.role = Role::Candidate;
        st.curr_term += 1;
        st.voted_for = Some(engine.id);
        st.votes_granted = std::collections::HashSet::from([engine.id]);
        (st.curr_term, st.last_index(), st.last_term())
    };

    pf_info!("starting election for term {}", term);

    let frame = Frame::new(
        FrameMeta::new(engine.id, Dest::Broadcast, term, MsgKind::RequestVote),
        serde_json::to_vec(&RequestVoteBody {
            last_index,
            last_term,
        })
        .map_err(VRaftError::from)?,
    );
    engine.link.send(&frame).await?;

    Ok(ElectionOutcome::BecameCandidate)
}

pub async fn become_leader(
    engine: &Arc<ConsensusEngine>,
) -> Result<(), VRaftError> {
    let term = {
        let mut st = engine.state.lock().await;
        st.role = Role::Leader;
        st.curr_term
    };
    pf_info!("elected leader for term {}", term);
    Ok(())
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct RequestVoteBody {
    pub last_index: u64,
    pub last_term: Term,
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct VoteBody {
    pub granted: bool,
}

/// Handles an inbound `RequestVote`. Grants at most one vote per term,
/// only if the candidate's log is at least as up to date as ours.
pub async fn handle_request_vote(
    engine: &Arc<ConsensusEngine>,
    candidate: NodeId,
    term: Term,
    last_index: u64,
    last_term: Term,
) -> Result<(), VRaftError> {
    engine.adopt_higher_term(term).await;

    let granted = {
        let mut st = engine.state.lock().await;
        if term < st.curr_term {
            false
        } else {
            let up_to_date = (last_term, last_index)
                >= (st.last_term(), st.last_index());
            let can_vote = st.voted_for.is_none()
                || st.voted_for == Some(candidate);
            if can_vote && up_to_date {
                st.voted_for = Some(candidate);
                true
            } else {
                false
            }
        }
    };

    pf_trace!(
        "RequestVote from {} term {} -> granted={}",
        candidate,
        term,
        granted
    );

    let term_now = engine.curr_term().await;
    let frame = Frame::new(
        FrameMeta::new(engine.id, Dest::Node(candidate), term_now, MsgKind::Vote),
        serde_json::to_vec(&VoteBody { granted }).map_err(VRaftError::from)?,
    );
    engine.link.send(&frame).await
}

/// Handles an inbound `Vote` reply while we're a candidate. Transitions to
/// `Leader` once a strict majority of grants is collected.
pub async fn handle_vote(
    engine: &Arc<ConsensusEngine>,
    voter: NodeId,
    term: Term,
    granted: bool,
) -> Result<ElectionOutcome, VRaftError> {
    if engine.adopt_higher_term(term).await {
        return Ok(ElectionOutcome::SteppedDown);
    }

    let became_leader = {
        let mut st = engine.state.lock().await;
        if st.role != Role::Candidate || term != st.curr_term || !granted {
            false
        } else {
            st.votes_granted.insert(voter);
            st.votes_granted.len() * 2 > engine.population as usize
        }
    };

    if became_leader {
        become_leader(engine).await?;
        Ok(ElectionOutcome::BecameLeader)
    } else {
        Ok(ElectionOutcome::StayedFollower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    use crate::peers::PeerTable;
    use crate::utils::TomlTunables;

    /// Builds a real `ConsensusEngine` backed by a loopback `UdpLink`, the
    /// same way `transport::link`'s own tests do. The returned socket is the
    /// "PHY" stand-in `send` targets; the caller must keep it bound for the
    /// engine's lifetime, or sends start landing on a port nobody owns.
    async fn test_engine(
        id: NodeId,
        leader_id: NodeId,
        population: u8,
    ) -> (Arc<ConsensusEngine>, UdpSocket) {
        let peers = Arc::new(PeerTable::new(&TomlTunables::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let phy = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let phy_port = phy.local_addr().unwrap().port();
        let rx_port = {
            let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let (link, _recv_handle) =
            crate::transport::UdpLink::bind(phy_port, rx_port, 16, peers.clone(), shutdown)
                .await
                .unwrap();

        let engine = Arc::new(ConsensusEngine::new(
            id,
            leader_id,
            population,
            TomlTunables::default(),
            peers,
            Arc::new(link),
        ));
        (engine, phy)
    }

    #[tokio::test]
    async fn majority_vote_transitions_to_leader() {
        // population 5, leader is id 1 once it holds votes from itself + 2
        // others (3 of 5 is a strict majority).
        let (engine, _phy) = test_engine(1, 1, 5).await;
        let outcome = become_candidate(&engine).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::BecameCandidate);

        let term = engine.curr_term().await;
        assert_eq!(handle_vote(&engine, 2, term, true).await.unwrap(), ElectionOutcome::StayedFollower);
        assert_eq!(engine.role().await, Role::Candidate);

        assert_eq!(
            handle_vote(&engine, 3, term, true).await.unwrap(),
            ElectionOutcome::BecameLeader
        );
        assert_eq!(engine.role().await, Role::Leader);
    }

    #[tokio::test]
    async fn stale_term_vote_is_ignored() {
        // A vote carrying an older term than the one we're campaigning on
        // (e.g. a reply to a previous, abandoned candidacy) must not count
        // toward the current term's majority.
        let (engine, _phy) = test_engine(1, 1, 3).await;
        become_candidate(&engine).await.unwrap(); // term 1
        become_candidate(&engine).await.unwrap(); // term 2, re-campaign
        let stale_term = engine.curr_term().await - 1;

        let outcome = handle_vote(&engine, 2, stale_term, true).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::StayedFollower);
        assert_eq!(engine.role().await, Role::Candidate);
    }

    #[tokio::test]
    async fn request_vote_grants_at_most_once_per_term() {
        let (engine, _phy) = test_engine(1, 1, 3).await;

        handle_request_vote(&engine, 2, 5, 0, 0).await.unwrap();
        {
            let st = engine.state.lock().await;
            assert_eq!(st.curr_term, 5);
            assert_eq!(st.voted_for, Some(2));
        }

        // A second candidate asking for the same term must be refused even
        // though its log is equally up to date.
        handle_request_vote(&engine, 3, 5, 0, 0).await.unwrap();
        {
            let st = engine.state.lock().await;
            assert_eq!(st.voted_for, Some(2));
        }

        // Re-requesting on behalf of the node already voted for in this term
        // is idempotent, not a second grant.
        handle_request_vote(&engine, 2, 5, 0, 0).await.unwrap();
        let st = engine.state.lock().await;
        assert_eq!(st.voted_for, Some(2));
    }

    #[tokio::test]
    async fn request_vote_rejects_stale_candidate_log() {
        // Candidate's log is behind ours (we've already logged index 1 at
        // term 1); the up-to-date check must refuse the vote.
        let (engine, _phy) = test_engine(1, 1, 3).await;
        {
            let mut st = engine.state.lock().await;
            st.log.push(LogEntry {
                index: 1,
                term: 1,
                payload: vec![],
                ground_truth: None,
            });
        }

        handle_request_vote(&engine, 2, 2, 0, 0).await.unwrap();
        let st = engine.state.lock().await;
        assert_eq!(st.voted_for, None);
    }

    #[tokio::test]
    async fn higher_term_steps_down_candidate_and_leader() {
        let (engine, _phy) = test_engine(1, 1, 3).await;
        become_candidate(&engine).await.unwrap();
        let old_term = engine.curr_term().await;
        assert_eq!(engine.role().await, Role::Candidate);

        let outcome = handle_vote(&engine, 2, old_term + 1, true).await.unwrap();
        assert_eq!(outcome, ElectionOutcome::SteppedDown);

        let st = engine.state.lock().await;
        assert_eq!(st.role, Role::Follower);
        assert_eq!(st.curr_term, old_term + 1);
        assert!(st.voted_for.is_none());
        assert!(st.votes_granted.is_empty());
    }

    #[tokio::test]
    async fn request_vote_adopts_higher_term_before_deciding() {
        let (engine, _phy) = test_engine(1, 1, 3).await;
        become_candidate(&engine).await.unwrap();
        let old_term = engine.curr_term().await;

        handle_request_vote(&engine, 2, old_term + 3, 0, 0).await.unwrap();

        let st = engine.state.lock().await;
        assert_eq!(st.role, Role::Follower);
        assert_eq!(st.curr_term, old_term + 3);
        assert_eq!(st.voted_for, Some(2));
    }
}
