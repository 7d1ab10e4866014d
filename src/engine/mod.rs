//! Host-facing engine handle.
//!
//! An [`Engine`] owns at most one loaded model, its context window and the
//! current [`GenerationSession`]. Every host operation goes through it; there
//! is no process-wide state, so independent engines can coexist.
//!
//! Locking:
//! - one coarse lock over model, window and session, held for the length of a
//!   state-mutating call (one step for the threaded Producer)
//! - narrow locks for the output buffer, the push callback, `last_error` and
//!   the worker handles
//! - atomics for the stop and generating flags
//!
//! Workers are always joined with the coarse lock released.

pub mod pipeline;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use llama_engine::{LoadParams, ModelSource};
use llama_runtime::{
    GenerationStats, MemoryInfo, NoopTelemetry, PressureLevel, ResourcePolicy, TelemetryHook,
    UsageKind, MIB,
};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{Result, RuntimeError};
use crate::session::{GenerationSession, ModelContext, Phase, Termination};
use pipeline::{CallbackSlot, OutputBuffer, QueueCounters, QueueStats, Workers};

/// Description of the loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub description: String,
    pub model_bytes: u64,
    pub context_capacity: usize,
    pub vocab_size: usize,
}

pub(crate) struct LoadedModel {
    ctx: ModelContext,
    info: ModelInfo,
    context_bytes: u64,
}

#[derive(Default)]
pub(crate) struct Core {
    model: Option<LoadedModel>,
    session: Option<GenerationSession>,
}

#[derive(Default)]
pub(crate) struct Shared {
    core: Mutex<Core>,
    stop: AtomicBool,
    generating: AtomicBool,
    last_error: Mutex<Option<RuntimeError>>,
    output: OutputBuffer,
    callback: CallbackSlot,
    queue: QueueCounters,
}

impl Shared {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        lock(&self.core)
    }

    fn record_error(&self, err: RuntimeError) {
        *lock(&self.last_error) = Some(err);
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StartMode {
    Fresh,
    Incremental,
    Threaded,
}

/// Explicit runtime handle: model lifecycle, sessions, pull/push output.
pub struct Engine {
    shared: Arc<Shared>,
    workers: Mutex<Option<Workers>>,
    policy: Arc<ResourcePolicy>,
    telemetry: Arc<dyn TelemetryHook>,
}

impl Engine {
    pub fn new(policy: Arc<ResourcePolicy>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            workers: Mutex::new(None),
            policy,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Engine gated by this host's `/proc/meminfo`.
    pub fn from_host() -> Self {
        Self::new(Arc::new(ResourcePolicy::from_host()))
    }

    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = hook;
        self
    }

    pub fn policy(&self) -> &ResourcePolicy {
        &self.policy
    }

    // -----------------------------------------------------------------------
    // Model lifecycle
    // -----------------------------------------------------------------------

    /// Open a model, replacing any loaded one.
    ///
    /// The resource policy is consulted with the model size plus the estimated
    /// context size before the source allocates anything.
    pub fn load(&self, source: &dyn ModelSource, params: &LoadParams) -> Result<ModelInfo> {
        self.unload();

        let capacity = match params.context_capacity {
            0 => self.policy.recommended_window_capacity(),
            requested => requested,
        };
        let model_bytes = source.model_bytes();
        let requested = model_bytes.saturating_add(self.policy.context_bytes(capacity));
        let available = self.policy.available();
        if model_bytes > self.policy.max_model_bytes() || !self.policy.can_allocate(requested) {
            warn!(
                model = source.name(),
                requested_mb = requested / MIB,
                available_mb = available / MIB,
                "model load rejected"
            );
            return Err(RuntimeError::AllocationRejected {
                requested_mb: requested / MIB,
                available_mb: available / MIB,
            });
        }

        let params = LoadParams {
            context_capacity: capacity,
            ..params.clone()
        };
        let backend = source.open(&params)?;
        let ctx = ModelContext::new(backend);
        let info = ModelInfo {
            name: source.name().to_string(),
            description: ctx.backend().describe(),
            model_bytes,
            context_capacity: ctx.backend().capacity(),
            vocab_size: ctx.vocab().vocab_size(),
        };
        let context_bytes = self.policy.context_bytes(info.context_capacity);
        self.policy.register_usage(UsageKind::Model, model_bytes);
        self.policy.register_usage(UsageKind::Context, context_bytes);

        info!(
            model = %info.name,
            context_capacity = info.context_capacity,
            model_mb = model_bytes / MIB,
            "model loaded"
        );
        let mut core = self.shared.lock_core();
        core.model = Some(LoadedModel {
            ctx,
            info: info.clone(),
            context_bytes,
        });
        core.session = None;
        Ok(info)
    }

    /// Cancel any generation, wait for the workers, then release the model.
    pub fn unload(&self) {
        self.halt();
        let mut core = self.shared.lock_core();
        core.session = None;
        if let Some(model) = core.model.take() {
            self.policy
                .unregister_usage(UsageKind::Model, model.info.model_bytes);
            self.policy
                .unregister_usage(UsageKind::Context, model.context_bytes);
            info!(model = %model.info.name, "model unloaded");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.shared.lock_core().model.is_some()
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        self.shared
            .lock_core()
            .model
            .as_ref()
            .map(|model| model.info.clone())
    }

    // -----------------------------------------------------------------------
    // Session control
    // -----------------------------------------------------------------------

    pub fn start_fresh(&self, prompt: &str, config: &SessionConfig) -> Result<()> {
        self.start(prompt, config, StartMode::Fresh)
    }

    pub fn start_incremental(&self, prompt: &str, config: &SessionConfig) -> Result<()> {
        self.start(prompt, config, StartMode::Incremental)
    }

    /// Incremental start, then generation on a Producer/Processor pair.
    ///
    /// Output arrives through [`drain_buffer`](Self::drain_buffer) and the
    /// registered callback.
    pub fn start_threaded(&self, prompt: &str, config: &SessionConfig) -> Result<()> {
        self.start(prompt, config, StartMode::Threaded)
    }

    /// Incremental start with [`SessionConfig::turbo`].
    pub fn start_turbo(&self, prompt: &str) -> Result<()> {
        self.start(prompt, &SessionConfig::turbo(), StartMode::Incremental)
    }

    fn start(&self, prompt: &str, config: &SessionConfig, mode: StartMode) -> Result<()> {
        config.validate()?;
        if !self.is_loaded() {
            return Err(RuntimeError::NoModel);
        }
        let pressure = self.policy.pressure_level();
        if pressure == PressureLevel::Critical {
            warn!(%pressure, "session start rejected");
            return Err(RuntimeError::Pressure(pressure));
        }

        // Held until the new workers are stored, so a concurrent start waits
        // here and then joins them.
        let mut workers = lock(&self.workers);
        self.halt_with(&mut workers);

        let mut core = self.shared.lock_core();
        let Core { model, session } = &mut *core;
        let model = model.as_mut().ok_or(RuntimeError::NoModel)?;

        self.shared.stop.store(false, Ordering::Release);
        *lock(&self.shared.last_error) = None;

        let mut snapshot = config.clone();
        if snapshot.window_capacity == 0 {
            snapshot.window_capacity = self.policy.recommended_window_capacity();
        }
        let mut next = GenerationSession::new(snapshot, self.telemetry.clone());
        let started = match mode {
            StartMode::Fresh => next.start_fresh(&mut model.ctx, prompt),
            StartMode::Incremental | StartMode::Threaded => {
                next.start_incremental(&mut model.ctx, prompt)
            }
        };
        *session = Some(next);
        if let Err(err) = started {
            self.shared.record_error(err.clone());
            return Err(err);
        }
        if mode != StartMode::Threaded {
            return Ok(());
        }

        self.shared.output.clear();
        self.shared.queue.reset();
        self.shared.generating.store(true, Ordering::Release);
        let vocab = model.ctx.vocab();
        drop(core);

        match Workers::spawn(self.shared.clone(), vocab, config.pipeline.clone()) {
            Ok(spawned) => {
                *workers = Some(spawned);
                Ok(())
            }
            Err(err) => {
                self.shared.generating.store(false, Ordering::Release);
                if let Some(session) = self.shared.lock_core().session.as_mut() {
                    session.cancel();
                }
                self.shared.record_error(err.clone());
                Err(err)
            }
        }
    }

    /// Request cancellation. Idempotent; never waits for the workers.
    ///
    /// Returns after at most one in-flight backend call.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(session) = self.shared.lock_core().session.as_mut() {
            session.cancel();
        }
    }

    /// Wait for a threaded session's workers to exit.
    ///
    /// Must not be called from the push callback, and neither may anything
    /// that joins: starts, `unload` and `clear_cache`.
    pub fn join(&self) {
        let workers = lock(&self.workers).take();
        if let Some(workers) = workers {
            workers.join();
        }
    }

    fn halt(&self) {
        let mut workers = lock(&self.workers);
        self.halt_with(&mut workers);
    }

    /// Stop and join with the worker slot already locked by the caller.
    fn halt_with(&self, workers: &mut Option<Workers>) {
        self.stop();
        if let Some(running) = workers.take() {
            running.join();
        }
    }

    /// True while a session can still produce output. For threaded sessions,
    /// stays true until the Processor has drained the queue.
    pub fn is_generating(&self) -> bool {
        if self.shared.generating.load(Ordering::Acquire) {
            return true;
        }
        self.shared
            .lock_core()
            .session
            .as_ref()
            .is_some_and(GenerationSession::is_generating)
    }

    pub fn phase(&self) -> Phase {
        self.shared
            .lock_core()
            .session
            .as_ref()
            .map_or(Phase::Idle, GenerationSession::phase)
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.shared
            .lock_core()
            .session
            .as_ref()
            .map(GenerationSession::id)
    }

    // -----------------------------------------------------------------------
    // Pull API
    // -----------------------------------------------------------------------

    /// One synchronous step. Empty at the end of generation, and for pieces
    /// that complete a glyph later; [`is_generating`](Self::is_generating)
    /// tells the two apart.
    pub fn next_token(&self) -> String {
        if self.shared.generating.load(Ordering::Acquire) {
            return String::new();
        }
        let mut core = self.shared.lock_core();
        let Core { model, session } = &mut *core;
        let (Some(model), Some(session)) = (model.as_mut(), session.as_mut()) else {
            return String::new();
        };
        match session.next_token(&mut model.ctx, &self.shared.stop) {
            Ok(piece) => piece.unwrap_or_default(),
            Err(err) => {
                self.shared.record_error(err);
                String::new()
            }
        }
    }

    /// Up to `count` steps, shifting the window when headroom runs low.
    pub fn next_tokens(&self, count: usize) -> Vec<String> {
        let mut out = Vec::new();
        if self.shared.generating.load(Ordering::Acquire) {
            return out;
        }
        let mut core = self.shared.lock_core();
        let Core { model, session } = &mut *core;
        let (Some(model), Some(session)) = (model.as_mut(), session.as_mut()) else {
            return out;
        };
        while out.len() < count {
            match session.advance(&mut model.ctx, &self.shared.stop) {
                Ok(Some(piece)) => out.push(piece),
                Ok(None) => break,
                Err(err) => {
                    self.shared.record_error(err);
                    break;
                }
            }
        }
        out
    }

    /// [`next_tokens`](Self::next_tokens) as one string.
    pub fn next_tokens_joined(&self, count: usize) -> String {
        self.next_tokens(count).concat()
    }

    /// Fresh start, then feed every piece to `f(text, false)` until done.
    ///
    /// `f` returning `false` cancels. `f("", true)` is the last call on every
    /// path after a successful start. The coarse lock is released while `f`
    /// runs, so `f` may call back into the engine.
    pub fn generate_with_callback<F>(
        &self,
        prompt: &str,
        config: &SessionConfig,
        mut f: F,
    ) -> Result<Termination>
    where
        F: FnMut(&str, bool) -> bool,
    {
        self.start_fresh(prompt, config)?;
        loop {
            let step = {
                let mut core = self.shared.lock_core();
                let Core { model, session } = &mut *core;
                match (model.as_mut(), session.as_mut()) {
                    (Some(model), Some(session)) => {
                        session.advance(&mut model.ctx, &self.shared.stop)
                    }
                    _ => Ok(None),
                }
            };
            match step {
                Ok(Some(piece)) => {
                    if !f(&piece, false) {
                        self.stop();
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.shared.record_error(err.clone());
                    f("", true);
                    return Err(err);
                }
            }
        }
        f("", true);
        Ok(match self.phase() {
            Phase::Terminated(termination) => termination,
            _ => Termination::Done,
        })
    }

    // -----------------------------------------------------------------------
    // Push / poll API
    // -----------------------------------------------------------------------

    pub fn register_callback<F>(&self, callback: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.shared.callback.set(Box::new(callback));
    }

    pub fn clear_callback(&self) {
        self.shared.callback.clear();
    }

    /// Return and clear the text accumulated by the Processor.
    pub fn drain_buffer(&self) -> String {
        self.shared.output.drain()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.shared.queue.snapshot()
    }

    // -----------------------------------------------------------------------
    // Introspection and cache control
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> GenerationStats {
        self.shared
            .lock_core()
            .session
            .as_ref()
            .map(GenerationSession::stats)
            .unwrap_or_default()
    }

    /// Drop the finished session and its counters.
    pub fn reset_stats(&self) -> Result<()> {
        if self.is_generating() {
            return Err(RuntimeError::Busy);
        }
        self.shared.lock_core().session = None;
        Ok(())
    }

    /// Tokens currently committed to the backend.
    pub fn cached_token_count(&self) -> usize {
        self.shared
            .lock_core()
            .model
            .as_ref()
            .map_or(0, |model| model.ctx.window().committed())
    }

    pub fn memory_info(&self) -> MemoryInfo {
        self.policy.memory_info()
    }

    /// Cancel any generation and drop all cached tokens.
    pub fn clear_cache(&self) -> Result<()> {
        self.halt();
        let mut core = self.shared.lock_core();
        let model = core.model.as_mut().ok_or(RuntimeError::NoModel)?;
        model.ctx.clear();
        Ok(())
    }

    /// Keep the newest `keep` cached tokens. Returns how many were dropped.
    ///
    /// Safe during threaded generation: the Producer picks up the new
    /// positions on its next step.
    pub fn shift_window(&self, keep: usize) -> Result<usize> {
        let mut core = self.shared.lock_core();
        let model = core.model.as_mut().ok_or(RuntimeError::NoModel)?;
        let result = model.ctx.shift(keep);
        if let Err(err) = &result {
            self.shared.record_error(err.clone());
        }
        result
    }

    /// The most recent failure, including ones raised on worker threads.
    pub fn last_error(&self) -> Option<RuntimeError> {
        lock(&self.shared.last_error).clone()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.halt();
    }
}
