//! Runtime configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the controller talks to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModePreference {
    /// Resume when the provider supports sessions, replay otherwise.
    #[default]
    Auto,
    Resume,
    Replay,
}

/// How think/respond text reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Text is forwarded as it streams in.
    Token,
    /// Text is forwarded once per complete unit.
    #[default]
    Unit,
}

/// Backoff for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 250,
            max_backoff_ms: 4_000,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .base_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Runtime configuration. Every field has a default, so an empty table is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub mode: ModePreference,
    pub granularity: Granularity,
    /// Rebuild context from only the last N events.
    pub window: Option<usize>,
    /// Model passes allowed per turn.
    pub max_iterations: u32,
    /// Per-call tool timeout. `None` disables it.
    pub tool_timeout_secs: Option<u64>,
    pub retry: RetryPolicy,
    /// Extra text appended to the system prompt.
    pub instructions: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: ModePreference::Auto,
            granularity: Granularity::Unit,
            window: None,
            max_iterations: 10,
            tool_timeout_secs: Some(30),
            retry: RetryPolicy::default(),
            instructions: None,
        }
    }
}

impl RuntimeConfig {
    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.map(Duration::from_secs)
    }
}
