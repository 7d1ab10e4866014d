//! Session configuration.
//!
//! A [`SessionConfig`] is cloned into each session when it starts and never
//! changes afterwards; new parameters need a new session.

use llama_engine::{LoadParams, SamplingParams};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// When and how far the window is shifted during generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShiftPolicy {
    /// Incremental starts shift first if the new tokens would leave fewer
    /// than this many free positions.
    pub incremental_margin: usize,
    /// Pulls and the producer shift once headroom drops below this.
    pub pull_margin: usize,
    /// Tokens retained by a proactive shift.
    pub keep: usize,
}

impl Default for ShiftPolicy {
    fn default() -> Self {
        Self {
            incremental_margin: 32,
            pull_margin: 16,
            keep: 64,
        }
    }
}

/// Processor batching for threaded sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Flush once this many tokens are batched.
    pub flush_tokens: usize,
    /// Flush a non-empty batch after this long without a flush.
    pub flush_interval_ms: u64,
    /// Upper bound on each wait for the next token.
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_tokens: 4,
            flush_interval_ms: 50,
            poll_interval_ms: 10,
        }
    }
}

/// Immutable per-session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hard ceiling on tokens held. 0 asks the resource policy.
    pub window_capacity: usize,
    /// Tokens per backend call during prompt evaluation.
    pub batch_size: usize,
    pub max_output_tokens: usize,
    pub sampling: SamplingParams,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub shift: ShiftPolicy,
    pub pipeline: PipelineConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_capacity: 0,
            batch_size: 512,
            max_output_tokens: 256,
            sampling: SamplingParams::default(),
            use_mmap: true,
            use_mlock: false,
            shift: ShiftPolicy::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Fixed mobile settings for low-latency turns: small prompt batches,
    /// 256 output tokens, the stock sampler chain and a policy-sized window.
    pub fn turbo() -> Self {
        Self {
            window_capacity: 0,
            batch_size: 32,
            max_output_tokens: 256,
            sampling: SamplingParams {
                temperature: 0.7,
                top_p: 0.9,
                top_k: 40,
                repeat_penalty: 1.1,
                repeat_last_n: 64,
                ..SamplingParams::default()
            },
            ..Self::default()
        }
    }

    /// Parse and validate a JSON config; missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RuntimeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RuntimeError::InvalidConfig(msg));

        if self.batch_size == 0 {
            return invalid("batch_size must be positive".into());
        }
        if self.max_output_tokens == 0 {
            return invalid("max_output_tokens must be positive".into());
        }
        if self.pipeline.flush_tokens == 0 {
            return invalid("pipeline.flush_tokens must be positive".into());
        }
        if self.pipeline.poll_interval_ms == 0 {
            return invalid("pipeline.poll_interval_ms must be positive".into());
        }
        if self.window_capacity > 0 && self.shift.keep >= self.window_capacity {
            return invalid(format!(
                "shift.keep ({}) must be below window_capacity ({})",
                self.shift.keep, self.window_capacity
            ));
        }
        let sampling = &self.sampling;
        if !sampling.temperature.is_finite() || sampling.temperature < 0.0 {
            return invalid(format!("temperature must be >= 0 (got {})", sampling.temperature));
        }
        if !(sampling.top_p > 0.0 && sampling.top_p <= 1.0) {
            return invalid(format!("top_p must be in (0, 1] (got {})", sampling.top_p));
        }
        Ok(())
    }

    /// Backend load hints derived from this config.
    pub fn load_params(&self) -> LoadParams {
        LoadParams {
            context_capacity: self.window_capacity,
            batch_size: self.batch_size,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn keep_must_leave_room() {
        let config = SessionConfig {
            window_capacity: 64,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(RuntimeError::InvalidConfig(_))));
    }
}
