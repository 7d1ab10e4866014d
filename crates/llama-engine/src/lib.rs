//! # llama-engine
//!
//! The "narrow waist" of the llama-stream stack. Defines the backend contract
//! that the generation runtime drives: a read-only [`Vocab`], the mutable
//! [`Backend`] (evaluate, sample, sequence memory), and a [`ModelSource`] that
//! can report its memory footprint before anything is allocated.
//!
//! ## Design Notes
//!
//! ### Split vocabulary
//! Detokenization runs on the pipeline's processor thread while the producer
//! thread holds the backend for `evaluate`. The vocabulary is therefore its own
//! `Send + Sync` trait object handed out by [`Backend::vocab`], so the slow
//! text path never waits on the session lock.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are logically
//! non-negative. Positions are `u32`; `SeqId` follows the backend's signed convention.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Sequence position inside the backend's working memory.
pub type Position = u32;

/// Backend sequence identifier.
pub type SeqId = i32;

/// The only sequence the runtime uses.
pub const DEFAULT_SEQ: SeqId = 0;

/// Errors reported by a backend implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Evaluation failed at position {position}: {reason}")]
    Evaluate { position: Position, reason: String },
    #[error("Sampling failed: {0}")]
    Sample(String),
}

/// Errors from [`Vocab::tokenize`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizeError {
    /// The caller's buffer guess was too small; `required` tokens are needed.
    #[error("token buffer too small: {required} tokens required")]
    BufferTooSmall { required: usize },
    #[error("tokenizer rejected input: {0}")]
    Invalid(String),
}

/// Sampler chain tuning, forwarded verbatim to the backend.
///
/// The chain is penalty → top-k → top-p → temperature → final draw; the
/// runtime never interprets these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub repeat_last_n: u32,
    pub seed: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: 0xFFFF_FFFF,
        }
    }
}

/// Parameters used when opening a model and its context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadParams {
    /// Context capacity in tokens. 0 lets the resource policy decide.
    pub context_capacity: usize,
    /// Tokens evaluated per backend call during prompt processing.
    pub batch_size: usize,
    pub use_mmap: bool,
    pub use_mlock: bool,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            context_capacity: 0,
            batch_size: 512,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// Read-only vocabulary: tokenization, detokenization and end-of-sequence tests.
pub trait Vocab: Send + Sync {
    /// Tokenize `text` into at most `capacity` tokens.
    ///
    /// `add_special` prepends the leading marker (BOS) token. Returns
    /// [`TokenizeError::BufferTooSmall`] when `capacity` is insufficient.
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        capacity: usize,
    ) -> Result<Vec<TokenId>, TokenizeError>;

    /// Text fragment for one token. May be empty (partial multi-token glyphs).
    fn token_to_piece(&self, token: TokenId) -> String;

    /// Whether the token ends generation.
    fn is_end_of_sequence(&self, token: TokenId) -> bool;

    fn vocab_size(&self) -> usize;
}

/// Per-sequence position bookkeeping of the backend's working memory.
pub trait SequenceMemory {
    /// Remove positions `[start, end)` from `seq`. `end = None` means "to the end".
    /// Returns `false` if the backend refuses.
    fn remove_range(&mut self, seq: SeqId, start: Position, end: Option<Position>) -> bool;

    /// Add `delta` to every position in `[start, end)` of `seq`.
    fn shift_positions(&mut self, seq: SeqId, start: Position, end: Option<Position>, delta: i64);

    /// Drop all state for `seq`.
    fn clear_sequence(&mut self, seq: SeqId);

    /// Highest occupied position of `seq`, `None` when empty.
    fn max_position(&self, seq: SeqId) -> Option<Position>;

    /// Total token capacity of the context.
    fn capacity(&self) -> usize;
}

/// A loaded model plus its context: the expensive, stateful half of the contract.
///
/// Every call is synchronous and runs to completion; the runtime never
/// interrupts one.
pub trait Backend: SequenceMemory + Send {
    /// Shared handle to the vocabulary (cheap clone).
    fn vocab(&self) -> Arc<dyn Vocab>;

    /// Evaluate `tokens` at positions `start..start + tokens.len()` of
    /// [`DEFAULT_SEQ`]. `want_logits` is set when the output will be sampled
    /// from (last chunk of a prompt, every generated token).
    fn evaluate(
        &mut self,
        tokens: &[TokenId],
        start: Position,
        want_logits: bool,
    ) -> Result<(), BackendError>;

    /// Rebuild the sampler chain for a new session.
    fn configure_sampler(&mut self, params: &SamplingParams);

    /// Sample the next token from the most recent logits.
    fn sample(&mut self) -> Result<TokenId, BackendError>;

    /// Inform the sampler of the chosen token (repetition-penalty bookkeeping).
    fn accept(&mut self, token: TokenId);

    /// Bytes held by the model weights.
    fn model_bytes(&self) -> u64;

    /// Human-readable description of the loaded model.
    fn describe(&self) -> String {
        format!("context capacity: {}", self.capacity())
    }
}

/// Something that can produce a [`Backend`], e.g. a model file on disk.
///
/// `model_bytes` must be answerable without allocating, so the resource
/// policy can refuse the load first.
pub trait ModelSource {
    fn name(&self) -> &str;

    fn model_bytes(&self) -> u64;

    fn open(&self, params: &LoadParams) -> Result<Box<dyn Backend>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_defaults_match_mobile_tuning() {
        let params = SamplingParams::default();
        assert_eq!(params.top_k, 40);
        assert_eq!(params.repeat_last_n, 64);
        assert!((params.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn sampling_partial_json_uses_defaults() {
        let params: SamplingParams = serde_json::from_str(r#"{"top_k": 8}"#).unwrap();
        assert_eq!(params.top_k, 8);
        assert_eq!(params.top_p, 0.9);
    }

    #[test]
    fn load_params_default_defers_to_policy() {
        let params = LoadParams::default();
        assert_eq!(params.context_capacity, 0);
        assert!(params.use_mmap);
        assert!(!params.use_mlock);
    }

    #[test]
    fn error_display_carries_context() {
        let err = BackendError::Evaluate {
            position: 7,
            reason: "decode returned 1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains("decode returned 1"));

        let err = TokenizeError::BufferTooSmall { required: 99 };
        assert!(err.to_string().contains("99"));
    }
}
