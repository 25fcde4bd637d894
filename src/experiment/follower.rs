//! Follower experiment role (§4.7): the Bernoulli vote policy and the
//! proportional-with-clamp TX gain control loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::consensus::{NodeId, VotePolicy};
use crate::phy::PhyControlClient;
use crate::pf_warn;

const GAIN_STEP_PER_DB: f32 = 0.02;
const DEAD_BAND_DB: f32 = 1.0;
const NO_REPORT_HOLD: Duration = Duration::from_secs(3);

/// Bernoulli vote policy: grants independent of `prev_matches`, per §4.4
/// ("it appends unconditionally but sets granted to `rand() < p_node`").
/// `p_node` is swapped in place by `EXP_BEGIN{p_node}` broadcasts, so it's
/// behind an atomic rather than baked in at construction.
pub struct BernoulliVotePolicy {
    rng: StdMutex<StdRng>,
    /// Stored as bits of an f32 so it can be read/written without a lock.
    p_node_bits: AtomicU64,
}

impl BernoulliVotePolicy {
    /// `node_id` plus the process start time seed the RNG (§4.7: "seeded
    /// from node_id + wall-clock at process start; not cryptographically
    /// meaningful").
    pub fn new(node_id: NodeId, p_node: f32, start_nanos: u64) -> Self {
        let seed = (node_id as u64).wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(start_nanos);
        BernoulliVotePolicy {
            rng: StdMutex::new(StdRng::seed_from_u64(seed)),
            p_node_bits: AtomicU64::new(p_node.to_bits() as u64),
        }
    }

    pub fn set_p_node(&self, p_node: f32) {
        self.p_node_bits.store(p_node.to_bits() as u64, Ordering::Relaxed);
    }

    pub fn p_node(&self) -> f32 {
        f32::from_bits(self.p_node_bits.load(Ordering::Relaxed) as u32)
    }
}

impl VotePolicy for BernoulliVotePolicy {
    fn decide(&self, _prev_matches: bool) -> bool {
        let mut rng = self.rng.lock().unwrap();
        rng.gen::<f32>() < self.p_node()
    }

    fn force_append(&self) -> bool {
        true
    }

    fn set_p_node(&self, p_node: f32) {
        BernoulliVotePolicy::set_p_node(self, p_node);
    }
}

/// Tracks the leader-reported SNR of this follower (delivered in heartbeat
/// metadata) and drives the PHY's TX gain toward `target_snr_db`.
pub struct GainController {
    target_snr_db: StdMutex<f32>,
    current_gain: StdMutex<f32>,
    last_report: StdMutex<Option<(f32, Instant)>>,
}

impl GainController {
    pub fn new(init_gain: f32, target_snr_db: f32) -> Self {
        GainController {
            target_snr_db: StdMutex::new(target_snr_db),
            current_gain: StdMutex::new(init_gain.clamp(0.0, 1.0)),
            last_report: StdMutex::new(None),
        }
    }

    pub fn set_target(&self, target_snr_db: f32) {
        *self.target_snr_db.lock().unwrap() = target_snr_db;
    }

    /// Records the leader's SNR observation of this follower, as echoed in
    /// heartbeat/AppendEntries metadata.
    pub fn record_observed_snr(&self, snr_db: f32) {
        *self.last_report.lock().unwrap() = Some((snr_db, Instant::now()));
    }

    /// One gain-adjustment tick (§4.7): `new_gain = clamp(current +
    /// k*(target - observed), 0, 1)` with a `±1 dB` dead-band; holds gain
    /// constant if no report arrived within the last 3s.
    pub async fn tick(&self, phy: &PhyControlClient) {
        let observed = {
            let guard = self.last_report.lock().unwrap();
            match *guard {
                Some((snr, at)) if at.elapsed() < NO_REPORT_HOLD => Some(snr),
                _ => None,
            }
        };

        let Some(observed) = observed else {
            return; // hold gain constant
        };

        let target = *self.target_snr_db.lock().unwrap();
        let error_db = target - observed;
        if error_db.abs() <= DEAD_BAND_DB {
            return;
        }

        let new_gain = {
            let mut gain = self.current_gain.lock().unwrap();
            *gain = (*gain + GAIN_STEP_PER_DB * error_db).clamp(0.0, 1.0);
            *gain
        };

        if let Err(e) = phy.set_tx_gain(new_gain).await {
            pf_warn!("gain adjustment failed, holding constant: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bernoulli_p1_always_grants() {
        let policy = BernoulliVotePolicy::new(1, 1.0, 42);
        for _ in 0..100 {
            assert!(policy.decide(false));
        }
    }

    #[test]
    fn bernoulli_p0_never_grants() {
        let policy = BernoulliVotePolicy::new(1, 0.0, 42);
        for _ in 0..100 {
            assert!(!policy.decide(true));
        }
    }

    #[test]
    fn set_p_node_takes_effect() {
        let policy = BernoulliVotePolicy::new(1, 0.0, 7);
        assert_eq!(policy.p_node(), 0.0);
        policy.set_p_node(1.0);
        assert_eq!(policy.p_node(), 1.0);
        assert!(policy.decide(false));
    }

    #[tokio::test]
    async fn gain_holds_constant_without_recent_report() {
        let ctrl = GainController::new(0.5, 10.0);
        // no report recorded; ctrl.tick would need a live PhyControlClient,
        // so we only assert the dead-reckoning branch is reachable by
        // checking last_report stays None.
        assert!(ctrl.last_report.lock().unwrap().is_none());
    }

    #[test]
    fn dead_band_suppresses_small_error() {
        let ctrl = GainController::new(0.5, 10.0);
        ctrl.record_observed_snr(10.5); // within +/-1dB dead-band
        let target = *ctrl.target_snr_db.lock().unwrap();
        let observed = ctrl.last_report.lock().unwrap().unwrap().0;
        assert!((target - observed).abs() <= DEAD_BAND_DB);
    }
}
