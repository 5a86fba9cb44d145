//! Tier Derivation
//!
//! Pure classification of declared capabilities into a hardware tier.
//! Stable across heartbeats: only registration-time capabilities feed it.

use iris_common::{NodeCapabilities, Tier};
use regex::Regex;
use std::sync::OnceLock;

/// Matches a parameter count embedded in a model name ("llama3:8b", "34B").
fn params_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*b\b").expect("valid regex"))
}

/// Raw parameter count in billions: the declared value when present,
/// otherwise extracted from the model name, otherwise 0.
#[must_use]
pub fn raw_params_billions(caps: &NodeCapabilities) -> f64 {
    if let Some(params) = caps.params_billions {
        return params;
    }

    params_pattern()
        .captures_iter(&caps.model_name)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0.0)
}

/// Effective parameter count: raw count scaled by the quantization factor.
#[must_use]
pub fn effective_params_billions(caps: &NodeCapabilities) -> f64 {
    raw_params_billions(caps) * caps.quantization.effective_factor()
}

/// Derive the tier for a set of capabilities.
///
/// The BASIC rule is checked first: a large model on hardware too slow to
/// serve it still lands in BASIC.
#[must_use]
pub fn derive_tier(caps: &NodeCapabilities) -> Tier {
    let params = effective_params_billions(caps);
    let tps = caps.tokens_per_second;

    if params < 7.0 || tps < 10.0 {
        Tier::Basic
    } else if params > 20.0 || tps > 30.0 {
        Tier::Pro
    } else {
        Tier::Mid
    }
}
