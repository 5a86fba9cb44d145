//! Selection Policy
//!
//! Scores eligible workers and picks the best `k` for a dispatch. Pure
//! functions over registry snapshots; the caller decides what to do when
//! fewer than `k` candidates exist.

use std::collections::HashSet;

use iris_common::{Difficulty, Tier};

use crate::config::SelectionWeights;
use crate::registry::NodeSnapshot;

const EPSILON: f64 = 1e-6;

/// Tiers allowed to serve a difficulty.
#[must_use]
pub const fn eligible_tiers(difficulty: Difficulty) -> &'static [Tier] {
    match difficulty {
        Difficulty::Simple => &[Tier::Basic, Tier::Mid, Tier::Pro],
        Difficulty::Complex => &[Tier::Mid, Tier::Pro],
        Difficulty::Advanced => &[Tier::Pro],
    }
}

/// Pick up to `k` distinct online nodes for the difficulty, best first.
///
/// Nodes in `exclude` (prior attempts on the same subtask) never come back.
/// Returns fewer than `k` when the eligible set is smaller.
#[must_use]
pub fn select(
    snapshot: &[NodeSnapshot],
    difficulty: Difficulty,
    k: usize,
    exclude: &HashSet<String>,
    weights: &SelectionWeights,
) -> Vec<NodeSnapshot> {
    let tiers = eligible_tiers(difficulty);

    let cohort: Vec<&NodeSnapshot> = snapshot
        .iter()
        .filter(|n| n.is_online && tiers.contains(&n.tier) && !exclude.contains(&n.node_id))
        .collect();

    if cohort.is_empty() {
        return Vec::new();
    }

    // Normalisation maxima are per-cohort so scores stay in comparable range
    // regardless of who happens to be online.
    let max_rep = cohort.iter().map(|n| n.reputation as f64).fold(EPSILON, f64::max);
    let max_tps = cohort
        .iter()
        .map(|n| n.capabilities.tokens_per_second)
        .fold(EPSILON, f64::max);
    let max_wait = cohort.iter().map(|n| queue_delay(n)).fold(EPSILON, f64::max);

    let mut scored: Vec<(f64, &NodeSnapshot)> = cohort
        .into_iter()
        .map(|n| {
            let score = weights.reputation * (n.reputation as f64 / max_rep)
                + weights.tps * (n.capabilities.tokens_per_second / max_tps)
                - weights.load * f64::from(n.effective_load)
                - weights.wait * (queue_delay(n) / max_wait);
            (score, n)
        })
        .collect();

    // Deterministic order: score desc, reputation desc, load asc, id lex.
    scored.sort_by(|(sa, a), (sb, b)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.reputation.cmp(&a.reputation))
            .then_with(|| a.effective_load.cmp(&b.effective_load))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    scored.into_iter().take(k).map(|(_, n)| n.clone()).collect()
}

/// Expected queue delay in seconds: pending work over throughput.
fn queue_delay(node: &NodeSnapshot) -> f64 {
    f64::from(node.effective_load) / node.capabilities.tokens_per_second.max(EPSILON)
}
