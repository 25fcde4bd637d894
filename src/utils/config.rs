//! CLI surface (clap derive) and the TOML tunables layer.

use clap::Parser;
use serde::Deserialize;

use crate::utils::VRaftError;

/// CLI surface, §6 of the design doc. A single binary serves both leader
/// and follower roles: the process whose `--id` equals `--leader-id` runs
/// the experiment controller; every other process runs the follower role.
#[derive(Parser, Debug, Clone)]
#[command(name = "vraft_node", about = "vehicular wireless-consensus node")]
pub struct CliOptions {
    /// This node's id.
    #[arg(long)]
    pub id: u8,

    /// Id of the node pinned to the leader role.
    #[arg(long, default_value_t = 0)]
    pub leader_id: u8,

    /// Cluster size (total node count).
    #[arg(long)]
    pub total: u8,

    /// App -> PHY egress data port (localhost).
    #[arg(long)]
    pub tx: u16,

    /// PHY -> app ingress data port (localhost).
    #[arg(long)]
    pub rx: u16,

    /// Local PHY control port. Required for followers; leaders may also
    /// supply one (e.g. to co-locate a PHY instance) but need not.
    #[arg(long)]
    pub ctrl: Option<u16>,

    /// Comma-separated SNR tier targets in dB (leader only).
    #[arg(long)]
    pub snr_levels: Option<String>,

    /// Comma-separated p_node levels (leader only).
    #[arg(long)]
    pub p_node_levels: Option<String>,

    /// Comma-separated effective cluster sizes (leader only).
    #[arg(long)]
    pub n_levels: Option<String>,

    /// Rounds to run per grid cell (leader only).
    #[arg(long)]
    pub rounds: Option<u32>,

    /// Vote collection deadline in seconds (leader only, default 0.5).
    #[arg(long)]
    pub vote_deadline: Option<f32>,

    /// Per-cell SNR stabilization wait in seconds (leader only, default
    /// 60.0 hard cap already enforced internally; this is the nominal
    /// settle time before polling starts).
    #[arg(long)]
    pub stabilize_time: Option<f32>,

    /// Target SNR in dB to converge to (follower only).
    #[arg(long)]
    pub target_snr: Option<f32>,

    /// Initial normalized TX gain in [0, 1] (follower only).
    #[arg(long)]
    pub init_gain: Option<f32>,

    /// Initial Bernoulli vote-grant probability (follower only).
    #[arg(long)]
    pub p_node: Option<f32>,

    /// Status print interval in seconds (follower only).
    #[arg(long)]
    pub status_interval: Option<f32>,

    /// Directory the result artifact is written into (leader only).
    #[arg(long, default_value = ".")]
    pub results_dir: String,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Optional inline TOML string of protocol tunables (election timeout
    /// bounds, heartbeat interval, append retry count, queue capacity).
    #[arg(long)]
    pub tunables: Option<String>,
}

impl CliOptions {
    pub fn is_leader(&self) -> bool {
        self.id == self.leader_id
    }
}

/// Tunables overridable via `--tunables`, layered under the CLI flags.
/// CLI flags for `vote_deadline`/`stabilize_time` take precedence over
/// this struct's fields when both are present; see `node::Node::build`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TomlTunables {
    pub election_timeout_lo_ms: u64,
    pub election_timeout_hi_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub append_retry_count: u32,
    pub append_retry_interval_ms: u64,
    pub queue_capacity: usize,
    pub peer_tick_interval_ms: u64,
    pub stale_after_ms: u64,
    pub dead_after_ms: u64,
}

impl Default for TomlTunables {
    fn default() -> Self {
        TomlTunables {
            election_timeout_lo_ms: 1500,
            election_timeout_hi_ms: 3000,
            heartbeat_interval_ms: 150,
            append_retry_count: 3,
            append_retry_interval_ms: 150,
            queue_capacity: 1024,
            peer_tick_interval_ms: 500,
            stale_after_ms: 2000,
            dead_after_ms: 5000,
        }
    }
}

/// Parses an optional TOML string into `TomlTunables`, falling back to
/// defaults when `None`. Mirrors the teacher's `parsed_config!` macro but
/// as a plain function since there is exactly one tunables shape here.
pub fn parsed_tunables(
    tunables_str: Option<&str>,
) -> Result<TomlTunables, VRaftError> {
    match tunables_str {
        None => Ok(TomlTunables::default()),
        Some(s) if s.trim().is_empty() => Ok(TomlTunables::default()),
        Some(s) => Ok(toml::from_str(s)?),
    }
}

/// Parses a comma-separated list of floats from a CLI flag value.
pub fn parse_float_list(s: &str) -> Result<Vec<f64>, VRaftError> {
    s.split(',')
        .map(|tok| {
            tok.trim()
                .parse::<f64>()
                .map_err(|e| VRaftError::msg(format!("bad float '{}': {}", tok, e)))
        })
        .collect()
}

/// Parses a comma-separated list of integers from a CLI flag value, also
/// accepting a `a..b` range shorthand for a single token (e.g. "1..6").
pub fn parse_int_list(s: &str) -> Result<Vec<u8>, VRaftError> {
    if let Some((lo, hi)) = s.trim().split_once("..") {
        let lo: u8 = lo
            .trim()
            .parse()
            .map_err(|e| VRaftError::msg(format!("bad range start '{}': {}", lo, e)))?;
        let hi: u8 = hi
            .trim()
            .parse()
            .map_err(|e| VRaftError::msg(format!("bad range end '{}': {}", hi, e)))?;
        return Ok((lo..hi).collect());
    }
    s.split(',')
        .map(|tok| {
            tok.trim()
                .parse::<u8>()
                .map_err(|e| VRaftError::msg(format!("bad int '{}': {}", tok, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_absent() {
        let t = parsed_tunables(None).unwrap();
        assert_eq!(t.heartbeat_interval_ms, 150);
    }

    #[test]
    fn overrides_merge() {
        let t = parsed_tunables(Some("heartbeat_interval_ms = 200")).unwrap();
        assert_eq!(t.heartbeat_interval_ms, 200);
        assert_eq!(t.append_retry_count, 3); // default preserved
    }

    #[test]
    fn float_list() {
        assert_eq!(parse_float_list("16.0, 6.0").unwrap(), vec![16.0, 6.0]);
    }

    #[test]
    fn int_list_range() {
        assert_eq!(parse_int_list("1..6").unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(parse_int_list("1,2,3").unwrap(), vec![1, 2, 3]);
    }
}
