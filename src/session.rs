//! Generation session state machine.
//!
//! A [`GenerationSession`] drives one logical generation against a
//! [`ModelContext`]: tokenize the prompt, evaluate it, then sample and evaluate
//! one token at a time until a terminal state.
//!
//! ```text
//! Idle ─start─> Tokenizing ─> EvaluatingPrompt ─> Generating ─┬─> Terminated(Done)
//!                   │                │                         ├─> Stopping ─> Terminated(Cancelled)
//!                   └────────────────┴──> Terminated(Error) <──┘
//! ```
//!
//! The session borrows the context per call instead of owning it, because the
//! context (backend plus window) outlives sessions: incremental starts reuse the
//! history a previous session left behind.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use llama_engine::{Backend, TokenId, TokenizeError, Vocab};
use llama_kv::ContextWindow;
use llama_runtime::{GenerationStats, StatsRecorder, TelemetryHook};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{ErrorKind, Result, RuntimeError};

/// Extra tokenizer slots beyond the prompt's byte length on the first attempt.
const TOKENIZE_SLACK: usize = 32;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// End of sequence, output limit or exhausted window.
    Done,
    Cancelled,
    Error(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Tokenizing,
    EvaluatingPrompt,
    Generating,
    Stopping,
    Terminated(Termination),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Tokenizing => write!(f, "tokenizing"),
            Phase::EvaluatingPrompt => write!(f, "evaluating_prompt"),
            Phase::Generating => write!(f, "generating"),
            Phase::Stopping => write!(f, "stopping"),
            Phase::Terminated(Termination::Done) => write!(f, "done"),
            Phase::Terminated(Termination::Cancelled) => write!(f, "cancelled"),
            Phase::Terminated(Termination::Error(kind)) => write!(f, "error ({kind:?})"),
        }
    }
}

/// A loaded backend and the window mirroring its positions.
///
/// Lives as long as the model stays loaded.
pub struct ModelContext {
    backend: Box<dyn Backend>,
    vocab: Arc<dyn Vocab>,
    window: ContextWindow,
}

impl ModelContext {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        let vocab = backend.vocab();
        let window = ContextWindow::new(backend.capacity());
        Self {
            backend,
            vocab,
            window,
        }
    }

    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    pub fn vocab(&self) -> Arc<dyn Vocab> {
        self.vocab.clone()
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Drop all history and backend state.
    pub fn clear(&mut self) {
        self.window.clear(self.backend.as_mut());
    }

    /// Keep the newest `keep` committed tokens. Returns how many were dropped.
    pub fn shift(&mut self, keep: usize) -> Result<usize> {
        self.window
            .shift(keep, self.backend.as_mut())
            .map_err(RuntimeError::Shift)
    }

    fn check_positions(&self) -> Result<()> {
        if self.window.verify(self.backend.as_ref()) {
            return Ok(());
        }
        let held = self
            .backend
            .max_position(llama_engine::DEFAULT_SEQ)
            .map_or(0, |pos| pos as usize + 1);
        Err(RuntimeError::PositionMismatch {
            held,
            committed: self.window.committed(),
        })
    }
}

/// One logical generation.
pub struct GenerationSession {
    id: Uuid,
    config: SessionConfig,
    phase: Phase,
    hook: Arc<dyn TelemetryHook>,
    stats: StatsRecorder,
}

impl GenerationSession {
    /// Create an idle session. `config` is captured as-is.
    pub fn new(config: SessionConfig, hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            phase: Phase::Idle,
            stats: StatsRecorder::start(0, hook.clone()),
            hook,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The configuration snapshot, with `window_capacity` resolved once started.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_generating(&self) -> bool {
        self.phase == Phase::Generating
    }

    pub fn termination(&self) -> Option<Termination> {
        match self.phase {
            Phase::Terminated(termination) => Some(termination),
            _ => None,
        }
    }

    pub fn stats(&self) -> GenerationStats {
        self.stats.snapshot()
    }

    /// Clear history, then evaluate `prompt` with the leading marker token.
    pub fn start_fresh(&mut self, ctx: &mut ModelContext, prompt: &str) -> Result<()> {
        self.begin(ctx, prompt, true)
    }

    /// Evaluate only `prompt` on top of the existing history, shifting first
    /// if it would not fit within the incremental margin.
    pub fn start_incremental(&mut self, ctx: &mut ModelContext, prompt: &str) -> Result<()> {
        self.begin(ctx, prompt, false)
    }

    fn begin(&mut self, ctx: &mut ModelContext, prompt: &str, fresh: bool) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(RuntimeError::AlreadyStarted);
        }
        let backend_capacity = ctx.backend.capacity();
        let capacity = match self.config.window_capacity {
            0 => backend_capacity,
            requested => requested.min(backend_capacity),
        };
        if fresh {
            ctx.clear();
        } else if ctx.window.len() > capacity {
            // History from a larger window must shrink before the new capacity applies.
            let keep = self
                .config
                .shift
                .keep
                .min(capacity.saturating_sub(self.config.shift.incremental_margin));
            debug!(
                session = %self.id,
                held = ctx.window.len(),
                capacity,
                keep,
                "shifting into a smaller window"
            );
            if let Err(err) = ctx.shift(keep) {
                return Err(self.fail(err));
            }
        }
        if let Err(err) = ctx.window.set_capacity(capacity) {
            return Err(self.fail(err.into()));
        }
        self.config.window_capacity = capacity;
        ctx.backend.configure_sampler(&self.config.sampling);

        self.phase = Phase::Tokenizing;
        let add_special = fresh || ctx.window.is_empty();
        let tokens = match tokenize(ctx.vocab.as_ref(), prompt, add_special) {
            Ok(tokens) if tokens.is_empty() => return Err(self.fail(RuntimeError::EmptyPrompt)),
            Ok(tokens) => tokens,
            Err(err) => return Err(self.fail(err)),
        };

        if !fresh {
            let room = capacity
                .saturating_sub(ctx.window.committed())
                .saturating_sub(self.config.shift.incremental_margin);
            if tokens.len() > room {
                debug!(
                    session = %self.id,
                    increment = tokens.len(),
                    room,
                    "shifting before incremental prompt"
                );
                if let Err(err) = ctx.shift(self.config.shift.keep) {
                    return Err(self.fail(err));
                }
            }
        }
        let headroom = capacity - ctx.window.len();
        if tokens.len() > headroom {
            return Err(self.fail(RuntimeError::PromptTooLong {
                tokens: tokens.len(),
                headroom,
            }));
        }

        self.phase = Phase::EvaluatingPrompt;
        self.stats = StatsRecorder::start(tokens.len(), self.hook.clone());
        if let Err(err) = ctx.window.append(&tokens) {
            return Err(self.fail(err.into()));
        }
        if let Err(err) = self.evaluate_pending(ctx) {
            return Err(self.fail(err));
        }
        self.stats.prompt_done();
        self.phase = Phase::Generating;

        info!(
            session = %self.id,
            fresh,
            prompt_tokens = tokens.len(),
            committed = ctx.window.committed(),
            capacity,
            "session started"
        );
        Ok(())
    }

    /// Evaluate pending tokens in `batch_size` chunks; logits only for the last.
    fn evaluate_pending(&mut self, ctx: &mut ModelContext) -> Result<()> {
        let pending = ctx.window.pending().to_vec();
        let chunks = pending.chunks(self.config.batch_size.max(1));
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.enumerate() {
            let start = ctx.window.next_position();
            debug!(session = %self.id, start, len = chunk.len(), "evaluating prompt chunk");
            if let Err(err) = ctx.backend.evaluate(chunk, start, i == last) {
                let dropped = ctx.window.rollback(ctx.backend.as_mut());
                warn!(session = %self.id, dropped, "rolled back uncommitted prompt tokens");
                return Err(err.into());
            }
            ctx.window.mark_committed(chunk.len())?;
        }
        Ok(())
    }

    /// One synchronous step without shifting.
    ///
    /// `Ok(Some(text))` for a produced token (text may be empty for a partial
    /// glyph), `Ok(None)` once the session is no longer generating.
    pub fn next_token(
        &mut self,
        ctx: &mut ModelContext,
        cancel: &AtomicBool,
    ) -> Result<Option<String>> {
        if cancel.load(Ordering::Acquire) {
            self.cancel();
            return Ok(None);
        }
        let Some(token) = self.sample_next(ctx)? else {
            return Ok(None);
        };
        let piece = ctx.vocab.token_to_piece(token);
        self.commit_token(ctx, token)?;
        Ok(Some(piece))
    }

    /// [`next_token`](Self::next_token) preceded by a proactive shift when
    /// headroom is below the pull margin.
    pub fn advance(
        &mut self,
        ctx: &mut ModelContext,
        cancel: &AtomicBool,
    ) -> Result<Option<String>> {
        self.ensure_headroom(ctx)?;
        self.next_token(ctx, cancel)
    }

    /// Up to `count` steps, stopping early when generation ends.
    pub fn pull(
        &mut self,
        ctx: &mut ModelContext,
        count: usize,
        cancel: &AtomicBool,
    ) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            match self.advance(ctx, cancel)? {
                Some(piece) => out.push(piece),
                None => break,
            }
        }
        Ok(out)
    }

    /// Step until done, handing each piece to `f(text, false)`.
    ///
    /// `f` returning `false` cancels the session. `f("", true)` is always the
    /// last call, on every path.
    pub fn pull_with_callback<F>(
        &mut self,
        ctx: &mut ModelContext,
        cancel: &AtomicBool,
        mut f: F,
    ) -> Result<Termination>
    where
        F: FnMut(&str, bool) -> bool,
    {
        if !self.is_generating() {
            return Err(RuntimeError::NotGenerating);
        }
        loop {
            match self.advance(ctx, cancel) {
                Ok(Some(piece)) => {
                    if !f(&piece, false) {
                        self.cancel();
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    f("", true);
                    return Err(err);
                }
            }
        }
        f("", true);
        Ok(self.termination().unwrap_or(Termination::Done))
    }

    /// Shift when headroom is below the pull margin. A failed shift ends the
    /// session with `ShiftFailed`. Finished sessions leave the window alone.
    pub(crate) fn ensure_headroom(&mut self, ctx: &mut ModelContext) -> Result<()> {
        if !self.is_generating() {
            return Ok(());
        }
        let headroom = ctx.window.headroom();
        if headroom >= self.config.shift.pull_margin {
            return Ok(());
        }
        match ctx.shift(self.config.shift.keep) {
            Ok(0) => Ok(()),
            Ok(dropped) => {
                debug!(session = %self.id, headroom, dropped, "proactive shift");
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Check limits, sample, accept. `None` ends the session as Done.
    pub(crate) fn sample_next(&mut self, ctx: &mut ModelContext) -> Result<Option<TokenId>> {
        if !self.is_generating() {
            return Ok(None);
        }
        if ctx.window.committed() + 1 >= ctx.window.capacity() {
            info!(
                session = %self.id,
                committed = ctx.window.committed(),
                "context window exhausted"
            );
            self.finish(Termination::Done);
            return Ok(None);
        }
        if self.stats.generated() >= self.config.max_output_tokens {
            self.finish(Termination::Done);
            return Ok(None);
        }
        if let Err(err) = ctx.check_positions() {
            return Err(self.fail(err));
        }

        let token = match ctx.backend.sample() {
            Ok(token) => token,
            Err(err) => return Err(self.fail(err.into())),
        };
        ctx.backend.accept(token);

        if ctx.vocab.is_end_of_sequence(token) {
            debug!(session = %self.id, "end of sequence");
            self.finish(Termination::Done);
            return Ok(None);
        }
        Ok(Some(token))
    }

    /// Append `token` and evaluate it at the next explicit position.
    pub(crate) fn commit_token(&mut self, ctx: &mut ModelContext, token: TokenId) -> Result<()> {
        if let Err(err) = ctx.window.append(&[token]) {
            return Err(self.fail(err.into()));
        }
        let position = ctx.window.next_position();
        if let Err(err) = ctx.backend.evaluate(&[token], position, true) {
            ctx.window.rollback(ctx.backend.as_mut());
            return Err(self.fail(err.into()));
        }
        if let Err(err) = ctx.window.mark_committed(1) {
            return Err(self.fail(err.into()));
        }

        self.stats.token();
        if self.stats.generated() >= self.config.max_output_tokens {
            debug!(session = %self.id, "output limit reached");
            self.finish(Termination::Done);
        }
        Ok(())
    }

    /// Cooperative cancellation. Only a generating session changes phase.
    pub fn cancel(&mut self) {
        if self.phase != Phase::Generating {
            return;
        }
        self.phase = Phase::Stopping;
        info!(session = %self.id, generated = self.stats.generated(), "session cancelled");
        self.finish(Termination::Cancelled);
    }

    fn finish(&mut self, termination: Termination) {
        self.phase = Phase::Terminated(termination);
        self.stats.finish();
    }

    fn fail(&mut self, err: RuntimeError) -> RuntimeError {
        error!(session = %self.id, phase = %self.phase, %err, "session failed");
        self.finish(Termination::Error(err.kind()));
        err
    }
}

/// Tokenize with a guessed buffer, retrying once with the size the vocabulary
/// asked for.
fn tokenize(vocab: &dyn Vocab, prompt: &str, add_special: bool) -> Result<Vec<TokenId>> {
    let guess = prompt.len() + TOKENIZE_SLACK;
    match vocab.tokenize(prompt, add_special, guess) {
        Err(TokenizeError::BufferTooSmall { required }) => {
            debug!(guess, required, "retrying tokenization with a larger buffer");
            Ok(vocab.tokenize(prompt, add_special, required)?)
        }
        other => Ok(other?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_runtime::mock::{MockBackend, MockConfig, MockVocab, BOS};
    use llama_runtime::NoopTelemetry;

    fn context(config: MockConfig) -> ModelContext {
        ModelContext::new(Box::new(MockBackend::new(config)))
    }

    fn session(max_output_tokens: usize) -> GenerationSession {
        let config = SessionConfig {
            window_capacity: 256,
            max_output_tokens,
            ..SessionConfig::default()
        };
        GenerationSession::new(config, Arc::new(NoopTelemetry))
    }

    #[test]
    fn fresh_start_adds_leading_marker() {
        let mut ctx = context(MockConfig::default());
        let mut s = session(4);
        s.start_fresh(&mut ctx, "hey").unwrap();
        assert_eq!(ctx.window().tokens()[0], BOS);
        assert_eq!(ctx.window().committed(), 4);
        assert_eq!(s.phase(), Phase::Generating);
    }

    #[test]
    fn second_start_is_rejected() {
        let mut ctx = context(MockConfig::default());
        let mut s = session(4);
        s.start_fresh(&mut ctx, "hey").unwrap();
        assert_eq!(s.start_fresh(&mut ctx, "again"), Err(RuntimeError::AlreadyStarted));
    }

    #[test]
    fn tokenizer_retry_uses_required_size() {
        let vocab = MockVocab::new().with_expansion(20);
        let tokens = tokenize(&vocab, "hello", true).unwrap();
        assert_eq!(tokens.len(), 101);
    }

    #[test]
    fn tokenizer_overflow_after_retry() {
        let vocab = MockVocab::new().overflowing();
        let err = tokenize(&vocab, "hello", true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenizeOverflow);
    }

    #[test]
    fn cancel_only_affects_generating_session() {
        let mut s = session(4);
        s.cancel();
        assert_eq!(s.phase(), Phase::Idle);
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::Generating.to_string(), "generating");
        assert_eq!(Phase::Terminated(Termination::Done).to_string(), "done");
    }
}
