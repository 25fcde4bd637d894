//! Peer table: per-peer last-seen timestamp, EWMA SNR, and liveness.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::utils::TomlTunables;

/// Liveness classification driven purely by a staleness timer, never by
/// inbound traffic directly (design doc invariant 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Stale,
    Dead,
}

#[derive(Debug, Clone, Copy)]
pub struct PeerState {
    pub id: u8,
    pub last_seen: Instant,
    pub ewma_snr_db: f32,
    pub liveness: Liveness,
}

/// Guards the peer map behind a single lock, per the design doc's
/// one-lock-per-structure rule and the `peer_table -> consensus_state ->
/// outcome_log` lock ordering.
pub struct PeerTable {
    peers: Mutex<HashMap<u8, PeerState>>,
    stale_after: Duration,
    dead_after: Duration,
}

impl PeerTable {
    pub fn new(tunables: &TomlTunables) -> Self {
        PeerTable {
            peers: Mutex::new(HashMap::new()),
            stale_after: Duration::from_millis(tunables.stale_after_ms),
            dead_after: Duration::from_millis(tunables.dead_after_ms),
        }
    }

    /// Records an inbound frame from `id` carrying the given SNR sample.
    /// Unconditionally refreshes `last_seen`; EWMA is `0.3*sample +
    /// 0.7*prev`, seeded to the first sample observed.
    pub fn observe(&self, id: u8, snr_db: f32) {
        let mut peers = self.peers.lock().unwrap();
        let now = Instant::now();
        let entry = peers.entry(id).or_insert(PeerState {
            id,
            last_seen: now,
            ewma_snr_db: snr_db,
            liveness: Liveness::Alive,
        });
        entry.last_seen = now;
        entry.ewma_snr_db = 0.3 * snr_db + 0.7 * entry.ewma_snr_db;
        entry.liveness = Liveness::Alive;
    }

    /// Re-evaluates liveness for every known peer against the staleness
    /// thresholds. Called on a 500ms tick by a dedicated background task.
    pub fn tick(&self) {
        let mut peers = self.peers.lock().unwrap();
        let now = Instant::now();
        for peer in peers.values_mut() {
            let since = now.duration_since(peer.last_seen);
            peer.liveness = if since >= self.dead_after {
                Liveness::Dead
            } else if since >= self.stale_after {
                Liveness::Stale
            } else {
                Liveness::Alive
            };
        }
    }

    /// Returns a point-in-time copy of the table, used by the controller
    /// and by the weighted-commit rule.
    pub fn snapshot(&self) -> HashMap<u8, PeerState> {
        self.peers.lock().unwrap().clone()
    }

    pub fn get(&self, id: u8) -> Option<PeerState> {
        self.peers.lock().unwrap().get(&id).copied()
    }

    /// Number of peers currently `Alive`.
    pub fn alive_count(&self) -> usize {
        self.peers
            .lock()
            .unwrap()
            .values()
            .filter(|p| matches!(p.liveness, Liveness::Alive))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PeerTable {
        PeerTable::new(&TomlTunables::default())
    }

    #[test]
    fn ewma_seeds_to_first_sample() {
        let t = table();
        t.observe(1, 18.0);
        assert_eq!(t.get(1).unwrap().ewma_snr_db, 18.0);
    }

    #[test]
    fn ewma_blends_subsequent_samples() {
        let t = table();
        t.observe(1, 10.0);
        t.observe(1, 20.0);
        let expected = 0.3 * 20.0 + 0.7 * 10.0;
        assert!((t.get(1).unwrap().ewma_snr_db - expected).abs() < 1e-6);
    }

    #[test]
    fn unknown_peer_absent() {
        assert!(table().get(9).is_none());
    }

    #[test]
    fn tick_marks_stale_and_dead() {
        let t = PeerTable::new(&TomlTunables {
            stale_after_ms: 0,
            dead_after_ms: 0,
            ..TomlTunables::default()
        });
        t.observe(1, 15.0);
        std::thread::sleep(Duration::from_millis(2));
        t.tick();
        assert_eq!(t.get(1).unwrap().liveness, Liveness::Dead);
    }
}
