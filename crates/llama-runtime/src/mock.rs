//! Deterministic in-process backend.
//!
//! [`MockBackend`] implements the full [`Backend`] contract without a model:
//! - byte-level vocabulary (BOS = 1, EOS = 2, byte `b` → `b + 3`)
//! - explicit per-position cells, so shifts and positions are checked for real
//! - a scripted sampler that replays a fixed token cycle
//! - fault injection (evaluation failure, refused removal, tokenizer overflow)
//!
//! Counters are shared through a [`MockProbe`] that stays readable after the
//! backend has been boxed and handed to the runtime.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use llama_engine::{
    Backend, BackendError, LoadParams, ModelSource, Position, SamplingParams, SeqId,
    SequenceMemory, TokenId, TokenizeError, Vocab,
};

pub const BOS: TokenId = 1;
pub const EOS: TokenId = 2;
const BYTE_OFFSET: TokenId = 3;

/// Byte-level vocabulary.
#[derive(Debug, Clone)]
pub struct MockVocab {
    pieces_per_byte: usize,
    always_overflow: bool,
}

impl Default for MockVocab {
    fn default() -> Self {
        Self {
            pieces_per_byte: 1,
            always_overflow: false,
        }
    }
}

impl MockVocab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `n` tokens per input byte, so short prompts outgrow the first
    /// buffer guess.
    pub fn with_expansion(mut self, n: usize) -> Self {
        self.pieces_per_byte = n.max(1);
        self
    }

    /// Report an undersized buffer on every call.
    pub fn overflowing(mut self) -> Self {
        self.always_overflow = true;
        self
    }

    /// Token ids for `text` without the leading marker.
    pub fn encode(&self, text: &str) -> Vec<TokenId> {
        text.bytes()
            .flat_map(|b| std::iter::repeat(b as TokenId + BYTE_OFFSET).take(self.pieces_per_byte))
            .collect()
    }
}

impl Vocab for MockVocab {
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        capacity: usize,
    ) -> Result<Vec<TokenId>, TokenizeError> {
        let mut tokens = Vec::with_capacity(text.len() * self.pieces_per_byte + 1);
        if add_special {
            tokens.push(BOS);
        }
        tokens.extend(self.encode(text));

        if self.always_overflow {
            return Err(TokenizeError::BufferTooSmall {
                required: tokens.len() + 1,
            });
        }
        if tokens.len() > capacity {
            return Err(TokenizeError::BufferTooSmall {
                required: tokens.len(),
            });
        }
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> String {
        match u8::try_from(token - BYTE_OFFSET) {
            // Non-ASCII bytes are partial glyphs on their own.
            Ok(byte) if byte.is_ascii() => char::from(byte).to_string(),
            _ => String::new(),
        }
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn vocab_size(&self) -> usize {
        256 + BYTE_OFFSET as usize
    }
}

/// Behaviour of a [`MockBackend`].
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub capacity: usize,
    /// Tokens returned by `sample`, cycled.
    pub script: Vec<TokenId>,
    /// Sample EOS as the n-th (0-based) token of a session.
    pub eos_after: Option<usize>,
    /// Fail the n-th (0-based) `evaluate` call after writing half of its tokens.
    pub fail_evaluate_at: Option<usize>,
    pub refuse_remove: bool,
    pub eval_delay: Duration,
    pub model_bytes: u64,
    pub vocab: MockVocab,
}

impl Default for MockConfig {
    fn default() -> Self {
        let vocab = MockVocab::default();
        Self {
            capacity: 2048,
            script: vocab.encode("lorem ipsum "),
            eos_after: None,
            fail_evaluate_at: None,
            refuse_remove: false,
            eval_delay: Duration::ZERO,
            model_bytes: 64 * 1024 * 1024,
            vocab,
        }
    }
}

impl MockConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_script_text(mut self, text: &str) -> Self {
        self.script = self.vocab.encode(text);
        self
    }

    pub fn with_script(mut self, script: Vec<TokenId>) -> Self {
        self.script = script;
        self
    }

    pub fn with_eos_after(mut self, n: usize) -> Self {
        self.eos_after = Some(n);
        self
    }

    pub fn failing_evaluate_at(mut self, call: usize) -> Self {
        self.fail_evaluate_at = Some(call);
        self
    }

    pub fn refusing_remove(mut self) -> Self {
        self.refuse_remove = true;
        self
    }

    pub fn with_eval_delay(mut self, delay: Duration) -> Self {
        self.eval_delay = delay;
        self
    }

    pub fn with_model_bytes(mut self, bytes: u64) -> Self {
        self.model_bytes = bytes;
        self
    }

    pub fn with_vocab(mut self, vocab: MockVocab) -> Self {
        self.vocab = vocab;
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    evaluate_calls: AtomicUsize,
    evaluated_tokens: AtomicUsize,
    samples: AtomicUsize,
    removals: AtomicUsize,
    shifts: AtomicUsize,
    clears: AtomicUsize,
    accepted: Mutex<Vec<TokenId>>,
    sampler: Mutex<Option<SamplingParams>>,
}

/// Read-only view of a mock backend's activity.
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    counters: Arc<Counters>,
}

impl MockProbe {
    pub fn evaluate_calls(&self) -> usize {
        self.counters.evaluate_calls.load(Ordering::SeqCst)
    }

    pub fn evaluated_tokens(&self) -> usize {
        self.counters.evaluated_tokens.load(Ordering::SeqCst)
    }

    pub fn samples(&self) -> usize {
        self.counters.samples.load(Ordering::SeqCst)
    }

    pub fn removals(&self) -> usize {
        self.counters.removals.load(Ordering::SeqCst)
    }

    /// Number of renumbering calls (one per window shift).
    pub fn shifts(&self) -> usize {
        self.counters.shifts.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.counters.clears.load(Ordering::SeqCst)
    }

    pub fn accepted(&self) -> Vec<TokenId> {
        self.counters
            .accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sampler(&self) -> Option<SamplingParams> {
        self.counters
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Scripted backend with real position bookkeeping.
pub struct MockBackend {
    config: MockConfig,
    vocab: Arc<MockVocab>,
    cells: BTreeMap<Position, TokenId>,
    logits_ready: bool,
    sampled: usize,
    counters: Arc<Counters>,
}

impl MockBackend {
    pub fn new(config: MockConfig) -> Self {
        Self::with_probe(config, MockProbe::default())
    }

    fn with_probe(config: MockConfig, probe: MockProbe) -> Self {
        Self {
            vocab: Arc::new(config.vocab.clone()),
            config,
            cells: BTreeMap::new(),
            logits_ready: false,
            sampled: 0,
            counters: probe.counters,
        }
    }

    pub fn probe(&self) -> MockProbe {
        MockProbe {
            counters: self.counters.clone(),
        }
    }

    /// Tokens currently held, in position order.
    pub fn cells(&self) -> Vec<TokenId> {
        self.cells.values().copied().collect()
    }
}

impl SequenceMemory for MockBackend {
    fn remove_range(&mut self, _seq: SeqId, start: Position, end: Option<Position>) -> bool {
        if self.config.refuse_remove {
            return false;
        }
        self.counters.removals.fetch_add(1, Ordering::SeqCst);
        let end = end.unwrap_or(Position::MAX);
        self.cells.retain(|&pos, _| pos < start || pos >= end);
        true
    }

    fn shift_positions(&mut self, _seq: SeqId, start: Position, end: Option<Position>, delta: i64) {
        self.counters.shifts.fetch_add(1, Ordering::SeqCst);
        let end = end.unwrap_or(Position::MAX);
        let cells = std::mem::take(&mut self.cells);
        self.cells = cells
            .into_iter()
            .map(|(pos, token)| {
                if pos >= start && pos < end {
                    ((pos as i64 + delta).max(0) as Position, token)
                } else {
                    (pos, token)
                }
            })
            .collect();
    }

    fn clear_sequence(&mut self, _seq: SeqId) {
        self.counters.clears.fetch_add(1, Ordering::SeqCst);
        self.cells.clear();
        self.logits_ready = false;
    }

    fn max_position(&self, _seq: SeqId) -> Option<Position> {
        self.cells.keys().next_back().copied()
    }

    fn capacity(&self) -> usize {
        self.config.capacity
    }
}

impl Backend for MockBackend {
    fn vocab(&self) -> Arc<dyn Vocab> {
        self.vocab.clone()
    }

    fn evaluate(
        &mut self,
        tokens: &[TokenId],
        start: Position,
        want_logits: bool,
    ) -> Result<(), BackendError> {
        let call = self.counters.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        self.logits_ready = false;

        if self.config.fail_evaluate_at == Some(call) {
            for (i, &token) in tokens.iter().take(tokens.len() / 2).enumerate() {
                self.cells.insert(start + i as Position, token);
            }
            return Err(BackendError::Evaluate {
                position: start,
                reason: "injected failure".into(),
            });
        }

        let expected = self.max_position(0).map_or(0, |pos| pos + 1);
        if start != expected {
            return Err(BackendError::Evaluate {
                position: start,
                reason: format!("expected position {expected}"),
            });
        }
        if start as usize + tokens.len() > self.config.capacity {
            return Err(BackendError::Evaluate {
                position: start,
                reason: format!("context full ({} positions)", self.config.capacity),
            });
        }

        if !self.config.eval_delay.is_zero() {
            std::thread::sleep(self.config.eval_delay);
        }

        for (i, &token) in tokens.iter().enumerate() {
            self.cells.insert(start + i as Position, token);
        }
        self.counters
            .evaluated_tokens
            .fetch_add(tokens.len(), Ordering::SeqCst);
        self.logits_ready = want_logits;
        Ok(())
    }

    fn configure_sampler(&mut self, params: &SamplingParams) {
        self.sampled = 0;
        *self
            .counters
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(params.clone());
    }

    fn sample(&mut self) -> Result<TokenId, BackendError> {
        if !self.logits_ready {
            return Err(BackendError::Sample("no logits for the last position".into()));
        }
        self.counters.samples.fetch_add(1, Ordering::SeqCst);
        let index = self.sampled;
        self.sampled += 1;

        if self.config.eos_after == Some(index) || self.config.script.is_empty() {
            return Ok(EOS);
        }
        Ok(self.config.script[index % self.config.script.len()])
    }

    fn accept(&mut self, token: TokenId) {
        self.counters
            .accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token);
    }

    fn model_bytes(&self) -> u64 {
        self.config.model_bytes
    }

    fn describe(&self) -> String {
        format!(
            "mock backend: context {} tokens, vocab {} tokens",
            self.config.capacity,
            self.vocab.vocab_size()
        )
    }
}

/// [`ModelSource`] producing [`MockBackend`]s that share one [`MockProbe`].
#[derive(Debug, Clone)]
pub struct MockSource {
    name: String,
    config: MockConfig,
    probe: MockProbe,
    opened: Arc<AtomicUsize>,
}

impl MockSource {
    pub fn new(config: MockConfig) -> Self {
        Self {
            name: "mock".to_string(),
            config,
            probe: MockProbe::default(),
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }

    /// How many backends have been opened from this source.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl ModelSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_bytes(&self) -> u64 {
        self.config.model_bytes
    }

    fn open(&self, params: &LoadParams) -> Result<Box<dyn Backend>, BackendError> {
        if params.batch_size == 0 {
            return Err(BackendError::ModelLoad("batch size must be positive".into()));
        }
        let mut config = self.config.clone();
        if params.context_capacity > 0 {
            config.capacity = params.context_capacity;
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockBackend::with_probe(config, self.probe.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_engine::DEFAULT_SEQ;

    #[test]
    fn vocab_round_trips_ascii() {
        let vocab = MockVocab::new();
        let tokens = vocab.tokenize("hi", true, 16).unwrap();
        assert_eq!(tokens[0], BOS);
        let text: String = tokens.iter().map(|&t| vocab.token_to_piece(t)).collect();
        assert_eq!(text, "hi");
    }

    #[test]
    fn vocab_reports_required_size() {
        let vocab = MockVocab::new().with_expansion(10);
        let err = vocab.tokenize("abc", true, 4).unwrap_err();
        assert_eq!(err, TokenizeError::BufferTooSmall { required: 31 });
        assert_eq!(vocab.tokenize("abc", true, 31).unwrap().len(), 31);
    }

    #[test]
    fn evaluate_rejects_wrong_position() {
        let mut backend = MockBackend::new(MockConfig::default());
        backend.evaluate(&[BOS, 10, 11], 0, true).unwrap();
        let err = backend.evaluate(&[12], 5, true).unwrap_err();
        assert!(matches!(err, BackendError::Evaluate { position: 5, .. }));
        backend.evaluate(&[12], 3, true).unwrap();
        assert_eq!(backend.cells(), vec![BOS, 10, 11, 12]);
    }

    #[test]
    fn sample_requires_logits_and_follows_script() {
        let mut backend = MockBackend::new(MockConfig::default().with_script(vec![50, 51]));
        assert!(backend.sample().is_err());
        backend.evaluate(&[BOS], 0, true).unwrap();
        assert_eq!(backend.sample().unwrap(), 50);
        assert_eq!(backend.sample().unwrap(), 51);
        assert_eq!(backend.sample().unwrap(), 50);
    }

    #[test]
    fn shift_renumbers_cells() {
        let mut backend = MockBackend::new(MockConfig::default());
        backend.evaluate(&[1, 20, 21, 22, 23], 0, false).unwrap();
        assert!(backend.remove_range(DEFAULT_SEQ, 0, Some(3)));
        backend.shift_positions(DEFAULT_SEQ, 3, Some(5), -3);
        assert_eq!(backend.max_position(DEFAULT_SEQ), Some(1));
        assert_eq!(backend.cells(), vec![22, 23]);
        backend.evaluate(&[24], 2, true).unwrap();
    }

    #[test]
    fn injected_failure_writes_partial_batch() {
        let mut backend = MockBackend::new(MockConfig::default().failing_evaluate_at(0));
        assert!(backend.evaluate(&[1, 2, 3, 4], 0, true).is_err());
        assert_eq!(backend.cells(), vec![1, 2]);
    }

    #[test]
    fn source_overrides_capacity() {
        let source = MockSource::new(MockConfig::default());
        let params = LoadParams {
            context_capacity: 128,
            ..LoadParams::default()
        };
        let backend = source.open(&params).unwrap();
        assert_eq!(backend.capacity(), 128);
        assert_eq!(source.opened(), 1);
    }
}
