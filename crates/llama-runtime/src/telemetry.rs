//! Generation statistics and telemetry hooks.
//!
//! Provides:
//! - [`GenerationStats`]: flat, read-only snapshot of one session's counters
//! - [`StatsRecorder`]: records timestamps and derives the snapshot
//! - [`TelemetryHook`] trait: callback interface for real-time reporting
//! - [`NoopTelemetry`] / [`LogTelemetry`]: built-in hook implementations

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;

/// Counters of one generation session. Reset only when a session starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GenerationStats {
    /// Tokens evaluated as prompt (the increment, for incremental starts).
    pub prompt_tokens: usize,
    /// Tokens sampled and evaluated during generation.
    pub generated_tokens: usize,
    pub total_tokens: usize,
    /// Wall-clock prompt evaluation time in milliseconds.
    pub prompt_eval_ms: f64,
    /// Wall-clock generation time in milliseconds (excludes prompt evaluation).
    pub eval_ms: f64,
    /// Generated tokens per second of `eval_ms`.
    pub tokens_per_second: f64,
}

/// Callback trait for real-time generation telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called after the prompt has been evaluated.
    fn on_prompt_evaluated(&self, _prompt_tokens: usize, _elapsed_ms: f64) {}

    /// Called after each generated token has been evaluated.
    fn on_token(&self, _generated: usize, _elapsed_ms: f64) {}

    /// Called once when a session reaches a terminal state.
    fn on_generation_complete(&self, _stats: &GenerationStats) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Keeps the stats of the last completed session.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<GenerationStats>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stats of the last completed session, if any.
    pub fn last_stats(&self) -> Option<GenerationStats> {
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_generation_complete(&self, stats: &GenerationStats) {
        tracing::info!(
            prompt_tokens = stats.prompt_tokens,
            generated_tokens = stats.generated_tokens,
            tokens_per_second = stats.tokens_per_second,
            "generation complete"
        );
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(*stats);
    }
}

/// Records timestamps during a session to derive [`GenerationStats`].
///
/// Usage:
/// 1. [`StatsRecorder::start`] when prompt evaluation begins
/// 2. [`StatsRecorder::prompt_done`] after the prompt is evaluated
/// 3. [`StatsRecorder::token`] after each generated token
/// 4. [`StatsRecorder::finish`] once, at the terminal state
pub struct StatsRecorder {
    hook: Arc<dyn TelemetryHook>,
    start: Instant,
    stats: GenerationStats,
    finished: bool,
}

impl StatsRecorder {
    pub fn start(prompt_tokens: usize, hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            hook,
            start: Instant::now(),
            stats: GenerationStats {
                prompt_tokens,
                total_tokens: prompt_tokens,
                ..GenerationStats::default()
            },
            finished: false,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn prompt_done(&mut self) {
        self.stats.prompt_eval_ms = self.elapsed_ms();
        self.hook
            .on_prompt_evaluated(self.stats.prompt_tokens, self.stats.prompt_eval_ms);
    }

    pub fn token(&mut self) {
        self.stats.generated_tokens += 1;
        self.stats.total_tokens = self.stats.prompt_tokens + self.stats.generated_tokens;
        self.refresh();
        self.hook
            .on_token(self.stats.generated_tokens, self.stats.eval_ms);
    }

    fn refresh(&mut self) {
        self.stats.eval_ms = (self.elapsed_ms() - self.stats.prompt_eval_ms).max(0.0);
        if self.stats.eval_ms > 0.0 {
            self.stats.tokens_per_second =
                self.stats.generated_tokens as f64 * 1000.0 / self.stats.eval_ms;
        }
    }

    /// Finalize timings and fire the completion hook. Idempotent.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.refresh();
        self.hook.on_generation_complete(&self.stats);
    }

    pub fn generated(&self) -> usize {
        self.stats.generated_tokens
    }

    pub fn snapshot(&self) -> GenerationStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHook {
        tokens: AtomicUsize,
        completions: AtomicUsize,
    }

    impl TelemetryHook for CountingHook {
        fn on_token(&self, _generated: usize, _elapsed_ms: f64) {
            self.tokens.fetch_add(1, Ordering::SeqCst);
        }

        fn on_generation_complete(&self, _stats: &GenerationStats) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn recorder_counts_tokens() {
        let mut recorder = StatsRecorder::start(10, Arc::new(NoopTelemetry));
        recorder.prompt_done();
        recorder.token();
        recorder.token();
        recorder.token();
        recorder.finish();

        let stats = recorder.snapshot();
        assert_eq!(stats.prompt_tokens, 10);
        assert_eq!(stats.generated_tokens, 3);
        assert_eq!(stats.total_tokens, 13);
        assert!(stats.prompt_eval_ms >= 0.0);
        assert!(stats.eval_ms >= 0.0);
    }

    #[test]
    fn finish_fires_hook_once() {
        let hook = Arc::new(CountingHook::default());
        let mut recorder = StatsRecorder::start(2, hook.clone());
        recorder.prompt_done();
        recorder.token();
        recorder.finish();
        recorder.finish();

        assert_eq!(hook.tokens.load(Ordering::SeqCst), 1);
        assert_eq!(hook.completions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn log_telemetry_captures_stats() {
        let log = LogTelemetry::new();
        assert!(log.last_stats().is_none());

        let mut recorder = StatsRecorder::start(4, Arc::new(log.clone()));
        recorder.prompt_done();
        recorder.token();
        recorder.token();
        recorder.finish();

        let captured = log.last_stats().unwrap();
        assert_eq!(captured.prompt_tokens, 4);
        assert_eq!(captured.generated_tokens, 2);
    }

    #[test]
    fn stats_serialize_as_flat_record() {
        let stats = GenerationStats {
            prompt_tokens: 5,
            generated_tokens: 20,
            total_tokens: 25,
            prompt_eval_ms: 12.0,
            eval_ms: 200.0,
            tokens_per_second: 100.0,
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["prompt_tokens"], 5);
        assert_eq!(json["tokens_per_second"], 100.0);
    }
}
