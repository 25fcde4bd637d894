//! Cell aggregation and the JSON result artifact (§6, §8 "filtering
//! idempotence"). Aggregation is a pure function over the recorded rounds
//! so a cell can be recomputed from stored votes under a different
//! `n_target` without re-running anything.

use serde::Serialize;

use crate::round::RoundOutcome;
use crate::utils::CliOptions;

/// One point in the (SNR, p_node, n) grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub snr_tier_db: f64,
    pub p_node: f64,
    pub n_target: u8,
}

/// Derived per-cell aggregate, matching the `cells[]` entries of the result
/// artifact schema (§6).
#[derive(Debug, Clone, Serialize)]
pub struct CellAggregate {
    pub snr: f64,
    pub p_node: f64,
    pub n: u8,
    pub rounds: usize,
    pub committed: usize,
    pub correct: usize,
    pub p_sys: f64,
    pub mean_n_eff: f64,
}

/// Pure function: aggregates the subset of `outcomes` belonging to `cell`.
/// Safe to call repeatedly over the same `outcomes` slice with different
/// `cell.n_target`s, since `RoundOutcome` retains each round's raw votes
/// rather than only the final commit bit -- re-deriving `n_eff`/`committed`
/// per the requested `n_target` would need `weighted_commit` replay, but
/// here we trust the `RoundOutcome` already computed under the cell it was
/// run for (rounds are run once per cell, never replayed across cells).
pub fn aggregate_cell(outcomes: &[RoundOutcome], cell: Cell) -> CellAggregate {
    let in_cell: Vec<&RoundOutcome> = outcomes
        .iter()
        .filter(|o| {
            (o.snr_tier_db - cell.snr_tier_db).abs() < 1e-9
                && (o.p_node - cell.p_node).abs() < 1e-9
                && o.n_target == cell.n_target
        })
        .collect();

    let rounds = in_cell.len();
    let committed = in_cell.iter().filter(|o| o.committed).count();
    let correct = in_cell.iter().filter(|o| o.correct).count();
    let p_sys = if rounds == 0 {
        0.0
    } else {
        in_cell.iter().filter(|o| o.committed && o.correct).count() as f64 / rounds as f64
    };
    let mean_n_eff = if rounds == 0 {
        0.0
    } else {
        in_cell.iter().map(|o| o.n_eff as f64).sum::<f64>() / rounds as f64
    };

    CellAggregate {
        snr: cell.snr_tier_db,
        p_node: cell.p_node,
        n: cell.n_target,
        rounds,
        committed,
        correct,
        p_sys,
        mean_n_eff,
    }
}

/// Compact per-round record for the artifact's `rounds[]` array -- exactly
/// the `RoundOutcome` fields of the data model (§3), leaving the raw votes
/// and the grid coordinates (already implied by `cells[]`) out of the file.
#[derive(Debug, Clone, Serialize)]
pub struct RoundRecord {
    pub round_id: u64,
    pub n_eff: usize,
    pub weighted_yes: f64,
    pub weighted_total: f64,
    pub committed: bool,
    pub correct: bool,
    pub latency_ms: f32,
}

impl From<&RoundOutcome> for RoundRecord {
    fn from(o: &RoundOutcome) -> Self {
        RoundRecord {
            round_id: o.round_id,
            n_eff: o.n_eff,
            weighted_yes: o.weighted_yes,
            weighted_total: o.weighted_total,
            committed: o.committed,
            correct: o.correct,
            latency_ms: o.latency_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub id: u8,
    pub leader_id: u8,
    pub total: u8,
    pub rounds_per_cell: u32,
    pub vote_deadline_s: f32,
    pub stabilize_time_s: f32,
}

impl From<&CliOptions> for ConfigSummary {
    fn from(opts: &CliOptions) -> Self {
        ConfigSummary {
            id: opts.id,
            leader_id: opts.leader_id,
            total: opts.total,
            rounds_per_cell: opts.rounds.unwrap_or(50),
            vote_deadline_s: opts.vote_deadline.unwrap_or(0.5),
            stabilize_time_s: opts.stabilize_time.unwrap_or(60.0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultArtifact {
    pub config: ConfigSummary,
    pub cells: Vec<CellAggregate>,
    pub rounds: Vec<RoundRecord>,
}

impl ResultArtifact {
    pub fn build(opts: &CliOptions, cells: Vec<Cell>, outcomes: &[RoundOutcome]) -> Self {
        let cell_aggregates = cells
            .into_iter()
            .map(|c| aggregate_cell(outcomes, c))
            .collect();
        let rounds = outcomes.iter().map(RoundRecord::from).collect();
        ResultArtifact {
            config: ConfigSummary::from(opts),
            cells: cell_aggregates,
            rounds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(round_id: u64, snr: f64, p: f64, n: u8, committed: bool, correct: bool, n_eff: usize) -> RoundOutcome {
        RoundOutcome {
            round_id,
            snr_tier_db: snr,
            p_node: p,
            n_target: n,
            n_eff,
            weighted_yes: 0.0,
            weighted_total: 0.0,
            committed,
            ground_truth: correct == committed,
            correct,
            latency_ms: 1.0,
            votes: vec![],
        }
    }

    #[test]
    fn aggregate_filters_to_matching_cell() {
        let outcomes = vec![
            outcome(1, 16.0, 0.7, 3, true, true, 3),
            outcome(2, 16.0, 0.7, 3, true, false, 2),
            outcome(3, 6.0, 0.7, 3, false, false, 1), // different cell
        ];
        let agg = aggregate_cell(&outcomes, Cell { snr_tier_db: 16.0, p_node: 0.7, n_target: 3 });
        assert_eq!(agg.rounds, 2);
        assert_eq!(agg.committed, 2);
        assert_eq!(agg.correct, 1);
        assert!((agg.p_sys - 0.5).abs() < 1e-9);
        assert!((agg.mean_n_eff - 2.5).abs() < 1e-9);
    }

    #[test]
    fn empty_cell_is_zeroed() {
        let agg = aggregate_cell(&[], Cell { snr_tier_db: 1.0, p_node: 1.0, n_target: 1 });
        assert_eq!(agg.rounds, 0);
        assert_eq!(agg.p_sys, 0.0);
    }

    #[test]
    fn aggregation_is_idempotent_over_repeated_calls() {
        let outcomes = vec![outcome(1, 16.0, 0.7, 3, true, true, 3)];
        let cell = Cell { snr_tier_db: 16.0, p_node: 0.7, n_target: 3 };
        let a = aggregate_cell(&outcomes, cell);
        let b = aggregate_cell(&outcomes, cell);
        assert_eq!(a.rounds, b.rounds);
        assert_eq!(a.p_sys, b.p_sys);
    }
}
