//! Coordinator Configuration
//!
//! Loads configuration from environment variables.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

use iris_common::Difficulty;

/// Coordinator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,

    /// `SQLite` connection URL (e.g., "sqlite://iris.db?mode=rwc")
    pub database_url: String,

    /// Shared secret used to verify worker account proofs. Issued keys come
    /// from the external account-key service; the coordinator only verifies.
    pub account_secret: String,

    /// External difficulty classifier endpoint (optional; heuristic fallback
    /// is used when unset or unreachable)
    pub classifier_url: Option<String>,

    /// Classifier call budget in seconds (default: 5)
    pub classifier_timeout_s: u64,

    /// External document processor endpoint for the direct bypass path
    pub direct_processor_url: Option<String>,

    /// Attachment extensions handled by the direct bypass path
    pub direct_formats: Vec<String>,

    /// Worker-declared heartbeat interval in seconds (default: 15);
    /// the reaper uses 3x this value as the liveness timeout
    pub heartbeat_interval_s: u64,

    /// Maximum dispatch attempts per subtask (default: 2)
    pub max_attempts_per_subtask: u32,

    /// Replicas for consensus mode (default: 3)
    pub consensus_replicas: u32,

    /// Minimum normalized similarity for two consensus answers to count
    /// as the same answer (default: 0.85)
    pub consensus_similarity_threshold: f64,

    /// Whether consensus dissenters are penalised (default: false)
    pub consensus_penalty_enabled: bool,

    /// Context mode window size in tokens (default: 2048)
    pub context_window_tokens: usize,

    /// Context mode window overlap in tokens (default: 128)
    pub context_overlap_tokens: usize,

    /// Per-difficulty task deadlines in seconds
    pub difficulty_timeout_s: DifficultyTimeouts,

    /// Per-attempt subtask deadline in seconds (default: 120); the effective
    /// attempt deadline is the minimum of this and the difficulty timeout
    pub subtask_timeout_s: u64,

    /// Selection weights
    pub selection_weights: SelectionWeights,

    /// Bounded per-task stream queue capacity in frames (default: 256)
    pub stream_queue_capacity: usize,

    /// Grace before a full worker send queue is treated as a lost node
    /// (default: 2s)
    pub send_grace_ms: u64,

    /// Reputation score floor (default: 10)
    pub reputation_floor: i64,

    /// Reputation score ceiling (default: 1000)
    pub reputation_ceiling: i64,

    /// Completion faster than this fraction of the difficulty timeout earns
    /// a FAST_COMPLETION bonus (default: 0.5)
    pub fast_completion_ratio: f64,

    /// Weekly multiplicative decay factor (default: 0.99)
    pub weekly_decay_factor: f64,

    /// Maximum fragments produced by the subtasks divider (default: 8)
    pub max_subtasks_per_task: usize,

    /// Leaderboard size in the network stats response (default: 10)
    pub leaderboard_size: usize,
}

/// Task deadlines by classified difficulty.
#[derive(Debug, Clone, Copy)]
pub struct DifficultyTimeouts {
    pub simple_s: u64,
    pub complex_s: u64,
    pub advanced_s: u64,
}

impl DifficultyTimeouts {
    /// Deadline for a task of the given difficulty.
    #[must_use]
    pub const fn for_difficulty(&self, difficulty: Difficulty) -> Duration {
        let secs = match difficulty {
            Difficulty::Simple => self.simple_s,
            Difficulty::Complex => self.complex_s,
            Difficulty::Advanced => self.advanced_s,
        };
        Duration::from_secs(secs)
    }
}

/// Weights for the worker selection score.
#[derive(Debug, Clone, Copy)]
pub struct SelectionWeights {
    pub reputation: f64,
    pub tps: f64,
    pub load: f64,
    pub wait: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            reputation: 0.4,
            tps: 0.3,
            load: 0.2,
            wait: 0.1,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://iris.db?mode=rwc".into()),
            account_secret: env::var("ACCOUNT_SECRET").context("ACCOUNT_SECRET must be set")?,
            classifier_url: env::var("CLASSIFIER_URL").ok(),
            classifier_timeout_s: env_parse("CLASSIFIER_TIMEOUT_S", 5),
            direct_processor_url: env::var("DIRECT_PROCESSOR_URL").ok(),
            direct_formats: env::var("DIRECT_FORMATS")
                .unwrap_or_else(|_| "pdf,docx,xlsx".into())
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            heartbeat_interval_s: env_parse("HEARTBEAT_INTERVAL_S", 15),
            max_attempts_per_subtask: env_parse("MAX_ATTEMPTS_PER_SUBTASK", 2),
            consensus_replicas: env_parse("CONSENSUS_REPLICAS", 3),
            consensus_similarity_threshold: env_parse("CONSENSUS_SIMILARITY_THRESHOLD", 0.85),
            consensus_penalty_enabled: env_parse("CONSENSUS_PENALTY_ENABLED", false),
            context_window_tokens: env_parse("CONTEXT_WINDOW_TOKENS", 2048),
            context_overlap_tokens: env_parse("CONTEXT_OVERLAP_TOKENS", 128),
            difficulty_timeout_s: DifficultyTimeouts {
                simple_s: env_parse("DIFFICULTY_TIMEOUT_SIMPLE_S", 60),
                complex_s: env_parse("DIFFICULTY_TIMEOUT_COMPLEX_S", 300),
                advanced_s: env_parse("DIFFICULTY_TIMEOUT_ADVANCED_S", 600),
            },
            subtask_timeout_s: env_parse("SUBTASK_TIMEOUT_S", 120),
            selection_weights: SelectionWeights {
                reputation: env_parse("SELECTION_WEIGHT_REPUTATION", 0.4),
                tps: env_parse("SELECTION_WEIGHT_TPS", 0.3),
                load: env_parse("SELECTION_WEIGHT_LOAD", 0.2),
                wait: env_parse("SELECTION_WEIGHT_WAIT", 0.1),
            },
            stream_queue_capacity: env_parse("STREAM_QUEUE_CAPACITY", 256),
            send_grace_ms: env_parse("SEND_GRACE_MS", 2000),
            reputation_floor: env_parse("REPUTATION_FLOOR", 10),
            reputation_ceiling: env_parse("REPUTATION_CEILING", 1000),
            fast_completion_ratio: env_parse("FAST_COMPLETION_RATIO", 0.5),
            weekly_decay_factor: env_parse("WEEKLY_DECAY_FACTOR", 0.99),
            max_subtasks_per_task: env_parse("MAX_SUBTASKS_PER_TASK", 8),
            leaderboard_size: env_parse("LEADERBOARD_SIZE", 10),
        })
    }

    /// Liveness timeout used by the heartbeat reaper (3x heartbeat interval).
    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s * 3)
    }

    /// Effective wall-clock budget for one subtask attempt.
    #[must_use]
    pub fn subtask_deadline(&self, difficulty: Difficulty) -> Duration {
        self.difficulty_timeout_s
            .for_difficulty(difficulty)
            .min(Duration::from_secs(self.subtask_timeout_s))
    }

    /// Create a default configuration for testing. Uses an in-memory
    /// database and no external services.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:0".into(),
            database_url: "sqlite::memory:".into(),
            account_secret: "test-secret".into(),
            classifier_url: None,
            classifier_timeout_s: 5,
            direct_processor_url: None,
            direct_formats: vec!["pdf".into(), "docx".into(), "xlsx".into()],
            heartbeat_interval_s: 15,
            max_attempts_per_subtask: 2,
            consensus_replicas: 3,
            consensus_similarity_threshold: 0.85,
            consensus_penalty_enabled: false,
            context_window_tokens: 2048,
            context_overlap_tokens: 128,
            difficulty_timeout_s: DifficultyTimeouts {
                simple_s: 60,
                complex_s: 300,
                advanced_s: 600,
            },
            subtask_timeout_s: 120,
            selection_weights: SelectionWeights::default(),
            stream_queue_capacity: 256,
            send_grace_ms: 2000,
            reputation_floor: 10,
            reputation_ceiling: 1000,
            fast_completion_ratio: 0.5,
            weekly_decay_factor: 0.99,
            max_subtasks_per_task: 8,
            leaderboard_size: 10,
        }
    }
}
