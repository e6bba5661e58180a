//! Retry policies for task execution

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay growth between attempts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

/// How many times a failing task is retried, and how long to wait in between
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff,
            delay_ms,
            max_delay_ms: None,
            jitter: false,
        }
    }

    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self::new(max_attempts, Backoff::Fixed, delay_ms)
    }

    pub fn linear(max_attempts: u32, delay_ms: u64) -> Self {
        Self::new(max_attempts, Backoff::Linear, delay_ms)
    }

    pub fn exponential(max_attempts: u32, delay_ms: u64) -> Self {
        Self::new(max_attempts, Backoff::Exponential, delay_ms)
    }

    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// `jitter_factor` is only applied when the policy has jitter enabled
    /// and is clamped to [0.5, 1.0).
    pub fn delay_for_attempt(&self, attempt: u32, jitter_factor: f64) -> Duration {
        let attempt = attempt.max(1);
        let base = match self.backoff {
            Backoff::Fixed => self.delay_ms,
            Backoff::Linear => self.delay_ms.saturating_mul(attempt as u64),
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.delay_ms.saturating_mul(factor)
            }
        };
        let capped = match self.max_delay_ms {
            Some(max) => base.min(max),
            None => base,
        };
        if self.jitter {
            let factor = jitter_factor.clamp(0.5, 1.0);
            Duration::from_millis((capped as f64 * factor) as u64)
        } else {
            Duration::from_millis(capped)
        }
    }
}
