//! Node Types

use serde::{Deserialize, Serialize};

/// Coarse hardware tier derived from declared capabilities.
///
/// Ordering matters: selection treats `Pro` as strictly more capable
/// than `Mid`, which is strictly more capable than `Basic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Small models or slow hardware.
    Basic,
    /// Mid-range models.
    Mid,
    /// Large models on fast hardware.
    Pro,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Mid => write!(f, "mid"),
            Self::Pro => write!(f, "pro"),
        }
    }
}

/// Quantization level of the hosted model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    #[serde(alias = "q4_0", alias = "q4_k_m")]
    Q4,
    Q5,
    Q6,
    Q8,
    #[default]
    #[serde(alias = "f16")]
    Fp16,
}

impl Quantization {
    /// Multiplier applied to the raw parameter count when deriving the tier.
    /// Higher-precision weights count for more effective capacity.
    #[must_use]
    pub const fn effective_factor(self) -> f64 {
        match self {
            Self::Q4 => 1.0,
            Self::Q5 => 1.1,
            Self::Q6 => 1.2,
            Self::Q8 => 1.4,
            Self::Fp16 => 1.6,
        }
    }
}

/// Capabilities a worker declares at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Model name as reported by the local server (e.g. "llama3:34b-q5").
    pub model_name: String,
    /// Parameter count in billions, if the worker knows it.
    /// When absent it is extracted from the model name, else treated as 0.
    #[serde(default)]
    pub params_billions: Option<f64>,
    /// Quantization level of the loaded weights.
    #[serde(default)]
    pub quantization: Quantization,
    /// Declared VRAM in megabytes.
    #[serde(default)]
    pub vram_mb: u64,
    /// Benchmarked tokens per second.
    pub tokens_per_second: f64,
    /// Whether the model accepts image input.
    #[serde(default)]
    pub vision: bool,
    /// Artificial load offset. Fallback nodes declare a non-zero offset
    /// so that selection prefers real workers.
    #[serde(default)]
    pub artificial_load_offset: u32,
}
