//! Process-wide engine configuration.
//!
//! All recognized options with their defaults. The TOML-facing
//! [`CoreSettings`] mirror uses plain seconds so config files stay
//! readable; [`CoreSettings::into_config`] validates and converts.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use conductor_db::models::CheckpointFrequency;

use crate::error::{CoreError, CoreResult};

/// Tolerance when checking that evaluator weights sum to 1.
pub const WEIGHT_EPSILON: f64 = 1e-9;

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Nominal interval workers advertise between heartbeats.
    pub heartbeat_interval: Duration,
    /// Liveness window after which a silent worker is Offline.
    /// Defaults to twice the heartbeat interval, floor 60 s.
    pub heartbeat_loss_window: Duration,
    pub max_concurrent_subtasks_per_worker: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_max_attempts: u32,
    /// Dimension name -> weight. Must sum to 1.
    pub evaluator_weights: BTreeMap<String, f64>,
    pub checkpoint_frequency_default: CheckpointFrequency,
    pub peer_review_max_cycles: i32,
    /// Minimum review score at which an auto-fix correction may be spawned.
    pub auto_fix_score_floor: f64,
    pub llm_decomposition_timeout: Duration,
    pub evaluator_timeout: Duration,
    pub dispatch_ack_timeout: Duration,
    pub subtask_execution_timeout: Duration,
    pub event_bus_replay_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let mut evaluator_weights = BTreeMap::new();
        evaluator_weights.insert("completeness".to_owned(), 0.4);
        evaluator_weights.insert("structure".to_owned(), 0.3);
        evaluator_weights.insert("error_hygiene".to_owned(), 0.3);

        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_loss_window: Duration::from_secs(120),
            max_concurrent_subtasks_per_worker: 3,
            retry_base_delay: Duration::from_secs(10),
            retry_max_delay: Duration::from_secs(60),
            retry_max_attempts: 3,
            evaluator_weights,
            checkpoint_frequency_default: CheckpointFrequency::Medium,
            peer_review_max_cycles: 3,
            auto_fix_score_floor: 6.0,
            llm_decomposition_timeout: Duration::from_secs(10),
            evaluator_timeout: Duration::from_secs(30),
            dispatch_ack_timeout: Duration::from_secs(5),
            subtask_execution_timeout: Duration::from_secs(600),
            event_bus_replay_size: 256,
        }
    }
}

impl CoreConfig {
    /// Validate cross-field invariants.
    ///
    /// - Evaluator weights sum to 1 within [`WEIGHT_EPSILON`], each in
    ///   (0, 1].
    /// - The heartbeat loss window is at least 60 s and at least twice
    ///   the heartbeat interval.
    /// - Retry delays are ordered.
    pub fn validate(&self) -> CoreResult<()> {
        if self.evaluator_weights.is_empty() {
            return Err(CoreError::validation("evaluator_weights must not be empty"));
        }
        let sum: f64 = self.evaluator_weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(CoreError::validation(format!(
                "evaluator weights must sum to 1, got {sum}"
            ))
            .with_details(serde_json::json!({ "sum": sum })));
        }
        for (dimension, weight) in &self.evaluator_weights {
            if *weight <= 0.0 || *weight > 1.0 {
                return Err(CoreError::validation(format!(
                    "evaluator weight for {dimension:?} must be in (0, 1], got {weight}"
                )));
            }
        }

        if self.heartbeat_loss_window < Duration::from_secs(60) {
            return Err(CoreError::validation(
                "heartbeat_loss_window must be at least 60 seconds",
            ));
        }
        if self.heartbeat_loss_window < self.heartbeat_interval * 2 {
            return Err(CoreError::validation(
                "heartbeat_loss_window must be at least twice the heartbeat interval",
            ));
        }

        if self.retry_base_delay > self.retry_max_delay {
            return Err(CoreError::validation(
                "retry_base_delay must not exceed retry_max_delay",
            ));
        }

        Ok(())
    }
}

/// TOML-facing mirror of [`CoreConfig`]: every field optional, durations
/// in whole seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreSettings {
    pub heartbeat_interval_secs: Option<u64>,
    pub heartbeat_loss_window_secs: Option<u64>,
    pub max_concurrent_subtasks_per_worker: Option<usize>,
    pub retry_base_delay_secs: Option<u64>,
    pub retry_max_delay_secs: Option<u64>,
    pub retry_max_attempts: Option<u32>,
    pub evaluator_weights: Option<BTreeMap<String, f64>>,
    pub checkpoint_frequency_default: Option<CheckpointFrequency>,
    pub peer_review_max_cycles: Option<i32>,
    pub auto_fix_score_floor: Option<f64>,
    pub llm_decomposition_timeout_secs: Option<u64>,
    pub evaluator_timeout_secs: Option<u64>,
    pub dispatch_ack_timeout_secs: Option<u64>,
    pub subtask_execution_timeout_secs: Option<u64>,
    pub event_bus_replay_size: Option<usize>,
}

impl CoreSettings {
    /// Merge these settings over the defaults, deriving the loss window
    /// from the heartbeat interval when unset, then validate.
    pub fn into_config(self) -> CoreResult<CoreConfig> {
        let mut config = CoreConfig::default();

        if let Some(secs) = self.heartbeat_interval_secs {
            config.heartbeat_interval = Duration::from_secs(secs);
            // Derived default: 2x interval, floor 60 s.
            config.heartbeat_loss_window = Duration::from_secs((secs * 2).max(60));
        }
        if let Some(secs) = self.heartbeat_loss_window_secs {
            config.heartbeat_loss_window = Duration::from_secs(secs);
        }
        if let Some(n) = self.max_concurrent_subtasks_per_worker {
            config.max_concurrent_subtasks_per_worker = n;
        }
        if let Some(secs) = self.retry_base_delay_secs {
            config.retry_base_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = self.retry_max_delay_secs {
            config.retry_max_delay = Duration::from_secs(secs);
        }
        if let Some(n) = self.retry_max_attempts {
            config.retry_max_attempts = n;
        }
        if let Some(weights) = self.evaluator_weights {
            config.evaluator_weights = weights;
        }
        if let Some(freq) = self.checkpoint_frequency_default {
            config.checkpoint_frequency_default = freq;
        }
        if let Some(n) = self.peer_review_max_cycles {
            config.peer_review_max_cycles = n;
        }
        if let Some(floor) = self.auto_fix_score_floor {
            config.auto_fix_score_floor = floor;
        }
        if let Some(secs) = self.llm_decomposition_timeout_secs {
            config.llm_decomposition_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.evaluator_timeout_secs {
            config.evaluator_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.dispatch_ack_timeout_secs {
            config.dispatch_ack_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.subtask_execution_timeout_secs {
            config.subtask_execution_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = self.event_bus_replay_size {
            config.event_bus_replay_size = n;
        }

        config.validate()?;
        Ok(config)
    }
}
