//! Round orchestrator: per-round propose -> collect votes until deadline ->
//! weighted commit -> record outcome (§4.5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::consensus::{weighted_commit, ConsensusEngine, VoteRecord};
use crate::consensus::replication::{self, leader_self_snr};
use crate::utils::VRaftError;
use crate::{pf_debug, pf_info};

/// Append-only, per-round result. Raw `votes` are retained alongside the
/// derived fields so a cell's aggregates can be recomputed under a
/// different `n_target` without re-running the round (§8 "filtering
/// idempotence").
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub round_id: u64,
    pub snr_tier_db: f64,
    pub p_node: f64,
    pub n_target: u8,
    pub n_eff: usize,
    pub weighted_yes: f64,
    pub weighted_total: f64,
    pub committed: bool,
    pub ground_truth: bool,
    pub correct: bool,
    pub latency_ms: f32,
    pub votes: Vec<VoteRecord>,
}

/// Runs a single round to completion. `votes_rx` receives `AppendAck`-derived
/// `VoteRecord`s for any in-flight round; this function filters to the
/// current `round_id` and discards stragglers from earlier rounds.
#[allow(clippy::too_many_arguments)]
pub async fn run_round(
    engine: &Arc<ConsensusEngine>,
    votes_rx: &mut mpsc::UnboundedReceiver<VoteRecord>,
    round_id: u64,
    seed: u64,
    vote_deadline: Duration,
    n_target: u8,
    snr_tier_db: f64,
    p_node: f64,
) -> Result<RoundOutcome, VRaftError> {
    // Reproducible fair coin for this round's ground truth, per seed + id.
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(round_id));
    let ground_truth: bool = rng.gen();
    let payload = round_id.to_be_bytes().to_vec();

    let start = Instant::now();
    replication::propose(engine, round_id, payload, ground_truth).await?;

    let deadline = start + vote_deadline;
    let retry_interval = Duration::from_millis(engine.tunables.append_retry_interval_ms);
    let mut next_retry = Instant::now() + retry_interval;
    let mut retries_done = 0u32;

    let mut votes: Vec<VoteRecord> = Vec::new();
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let retry_at = next_retry.min(deadline);
        tokio::select! {
            biased;

            maybe_vote = votes_rx.recv() => {
                match maybe_vote {
                    Some(v) if v.round_id == round_id => votes.push(v),
                    Some(stale) => {
                        pf_debug!("discarding stale vote for round {}", stale.round_id);
                    }
                    None => break,
                }
            }

            _ = tokio::time::sleep_until(retry_at) => {
                if retries_done < engine.tunables.append_retry_count {
                    replication::resend_append(engine, round_id).await?;
                    retries_done += 1;
                    next_retry = Instant::now() + retry_interval;
                }
            }
        }
    }

    let peer_snrs: HashMap<_, _> = engine
        .peers
        .snapshot()
        .into_iter()
        .map(|(id, st)| (id, st.ewma_snr_db))
        .collect();
    let leader_snr = leader_self_snr(&peer_snrs);

    let result = weighted_commit(&votes, engine.id, leader_snr, n_target);
    let correct = result.committed == ground_truth;
    let latency_ms = start.elapsed().as_secs_f32() * 1000.0;

    pf_info!(
        "round {} committed={} correct={} n_eff={} (W_yes={:.4} W_tot={:.4})",
        round_id,
        result.committed,
        correct,
        result.n_eff,
        result.weighted_yes,
        result.weighted_total
    );

    Ok(RoundOutcome {
        round_id,
        snr_tier_db,
        p_node,
        n_target,
        n_eff: result.n_eff,
        weighted_yes: result.weighted_yes,
        weighted_total: result.weighted_total,
        committed: result.committed,
        ground_truth,
        correct,
        latency_ms,
        votes,
    })
}
