use crate::config::SupervisorConfig;
use std::time::{Duration, SystemTime};

/// Restart policy configuration
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Whether automatic restart is enabled
    pub enabled: bool,
    /// Maximum number of restarts over the life of a process
    pub max_attempts: u32,
    /// Initial delay before first restart (in milliseconds)
    pub initial_delay_ms: u64,
    /// Backoff strategy to use
    pub backoff_strategy: BackoffStrategy,
}

impl RestartPolicy {
    /// Create a restart policy from supervisor configuration, honouring a per-process override
    pub fn from_config(config: &SupervisorConfig, auto_restart_override: Option<bool>) -> Self {
        let backoff_strategy = if config.exponential_backoff {
            BackoffStrategy::Exponential {
                max_delay_ms: config.max_restart_delay_ms,
            }
        } else {
            BackoffStrategy::Fixed
        };

        Self {
            enabled: auto_restart_override.unwrap_or(config.auto_restart),
            max_attempts: config.max_restart_attempts,
            initial_delay_ms: config.restart_delay_ms,
            backoff_strategy,
        }
    }

    /// Check if restart should be attempted based on restart history
    pub fn should_restart(&self, tracker: &RestartTracker) -> bool {
        self.enabled && (tracker.restart_count() as u32) < self.max_attempts
    }

    /// Calculate the delay before the next restart attempt
    pub fn calculate_delay(&self, tracker: &RestartTracker) -> Duration {
        self.backoff_strategy
            .calculate_delay(self.initial_delay_ms, tracker.restart_count())
    }
}

/// Backoff strategy for restart delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed delay between restarts
    Fixed,
    /// Exponential backoff with maximum delay
    Exponential { max_delay_ms: u64 },
}

impl BackoffStrategy {
    /// Calculate the delay for a given restart attempt
    pub fn calculate_delay(&self, initial_delay_ms: u64, restart_count: usize) -> Duration {
        match self {
            BackoffStrategy::Fixed => Duration::from_millis(initial_delay_ms),
            BackoffStrategy::Exponential { max_delay_ms } => {
                // delay = initial * 2^restart_count
                let exponent = u32::try_from(restart_count).unwrap_or(u32::MAX);
                let delay_ms = initial_delay_ms
                    .saturating_mul(2_u64.saturating_pow(exponent))
                    .min(*max_delay_ms);
                Duration::from_millis(delay_ms)
            }
        }
    }
}

/// Tracks restart history for a process
#[derive(Debug, Clone, Default)]
pub struct RestartTracker {
    /// Timestamps of all restart attempts
    restart_times: Vec<SystemTime>,
}

impl RestartTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a restart attempt
    pub fn record_restart(&mut self) {
        self.restart_times.push(SystemTime::now());
    }

    /// Get the total number of restarts
    pub fn restart_count(&self) -> usize {
        self.restart_times.len()
    }

    /// Get the time of the last restart, if any
    pub fn last_restart_time(&self) -> Option<SystemTime> {
        self.restart_times.last().copied()
    }
}
