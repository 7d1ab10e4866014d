//! Streaming, memory-bounded text generation on top of an external model backend.
//!
//! The backend (tokenizer, decoder, sampler) sits behind the traits in
//! `llama-engine`. This crate adds what turns those primitives into a runtime:
//! - [`GenerationSession`]: tokenize → evaluate prompt → sample/evaluate loop
//! - a Producer/Processor pipeline so detokenization never stalls sampling
//! - context-window shifting for generation past the raw capacity
//! - [`Engine`]: the handle hosts call into

pub mod config;
pub mod engine;
pub mod error;
pub mod session;

pub use config::{PipelineConfig, SessionConfig, ShiftPolicy};
pub use engine::pipeline::{CallbackSlot, OutputBuffer, QueueStats, TokenCallback};
pub use engine::{Engine, ModelInfo};
pub use error::{ErrorKind, Result, RuntimeError};
pub use session::{GenerationSession, ModelContext, Phase, Termination};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
