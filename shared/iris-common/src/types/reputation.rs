//! Reputation Types

use serde::{Deserialize, Serialize};

/// Kind of reputation event recorded against a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationEventKind {
    TaskCompleted,
    /// Completion observed in under half the difficulty timeout.
    FastCompletion,
    Timeout,
    InvalidResponse,
    UptimeHour,
    /// Registered but unreachable, charged per hour.
    BrokenPromise,
    WeeklyDecay,
}

impl ReputationEventKind {
    /// Score delta for this event. `WeeklyDecay` is multiplicative and
    /// carries no fixed delta.
    #[must_use]
    pub const fn points(self) -> i64 {
        match self {
            Self::TaskCompleted => 10,
            Self::FastCompletion => 5,
            Self::Timeout => -20,
            Self::InvalidResponse => -50,
            Self::UptimeHour => 1,
            Self::BrokenPromise => -5,
            Self::WeeklyDecay => 0,
        }
    }

    /// Stable name used in the persisted event log.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TaskCompleted => "task_completed",
            Self::FastCompletion => "fast_completion",
            Self::Timeout => "timeout",
            Self::InvalidResponse => "invalid_response",
            Self::UptimeHour => "uptime_hour",
            Self::BrokenPromise => "broken_promise",
            Self::WeeklyDecay => "weekly_decay",
        }
    }
}
