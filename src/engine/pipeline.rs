//! Threaded generation: one Producer and one Processor per session.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐    TokenQueue (FIFO)     ┌──────────────────┐
//! │ Producer thread  │ ──── raw token ids ────> │ Processor thread │ ──> OutputBuffer
//! │ sample → accept  │                          │ detokenize,      │ ──> push callback
//! │ → enqueue → eval │   sender dropped = done  │ batch, flush     │
//! └──────────────────┘                          └──────────────────┘
//! ```
//!
//! The Producer takes the engine's core lock for one step at a time, so hosts
//! can read stats or shift the window between steps. The Processor never
//! touches the core lock; it only needs the vocabulary.
//!
//! # Token Batching
//!
//! Delivering every token separately makes the callback the bottleneck. The
//! Processor batches pieces and flushes every `flush_tokens` tokens, after
//! `flush_interval_ms` with a non-empty batch, and once more when the queue
//! closes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use llama_engine::{TokenId, Vocab};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{lock, Core, Shared};
use crate::config::PipelineConfig;
use crate::error::{Result, RuntimeError};

/// Push callback receiving flushed text batches.
pub type TokenCallback = Box<dyn FnMut(&str) + Send>;

/// Text waiting for a polling consumer. Append-only, drained atomically.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    text: Mutex<String>,
}

impl OutputBuffer {
    pub fn append(&self, text: &str) {
        lock(&self.text).push_str(text);
    }

    /// Take everything accumulated so far.
    pub fn drain(&self) -> String {
        std::mem::take(&mut *lock(&self.text))
    }

    pub fn clear(&self) {
        lock(&self.text).clear();
    }
}

/// Optional push callback behind its own lock.
///
/// The callback is lent out of the slot while it runs, so it may register,
/// replace or clear callbacks on the same engine. A callback replaced or
/// cleared mid-delivery is dropped when that delivery returns and never runs
/// again.
#[derive(Default)]
pub struct CallbackSlot {
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    callback: Option<TokenCallback>,
    /// Bumped by every `set` and `clear`.
    version: u64,
    /// The callback is out for delivery.
    lent: bool,
}

impl CallbackSlot {
    pub fn set(&self, callback: TokenCallback) {
        let mut state = lock(&self.state);
        state.callback = Some(callback);
        state.version += 1;
        state.lent = false;
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.callback = None;
        state.version += 1;
        state.lent = false;
    }

    pub fn is_set(&self) -> bool {
        let state = lock(&self.state);
        state.callback.is_some() || state.lent
    }

    /// Invoke the callback if one is registered. The slot lock is not held
    /// during the call.
    pub fn deliver(&self, text: &str) {
        let (mut callback, version) = {
            let mut state = lock(&self.state);
            let Some(callback) = state.callback.take() else {
                return;
            };
            state.lent = true;
            (callback, state.version)
        };

        callback(text);

        let mut state = lock(&self.state);
        if state.version == version {
            state.callback = Some(callback);
            state.lent = false;
        }
    }
}

/// Token counts on both ends of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: usize,
    pub dequeued: usize,
}

#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    enqueued: AtomicUsize,
    dequeued: AtomicUsize,
}

impl QueueCounters {
    pub(crate) fn reset(&self) {
        self.enqueued.store(0, Ordering::SeqCst);
        self.dequeued.store(0, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            dequeued: self.dequeued.load(Ordering::SeqCst),
        }
    }
}

/// Handles of a running pipeline, joined together.
pub(crate) struct Workers {
    producer: JoinHandle<()>,
    processor: JoinHandle<()>,
}

impl Workers {
    /// Start the Processor, then the Producer.
    ///
    /// The caller must already hold a generating session and have set the
    /// `generating` flag; the Processor clears it once the queue is drained.
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        vocab: Arc<dyn Vocab>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let (tx, rx) = unbounded::<TokenId>();

        let processor_shared = shared.clone();
        let processor = thread::Builder::new()
            .name("llama-processor".into())
            .spawn(move || process(&processor_shared, rx, vocab, &config))
            .map_err(|e| RuntimeError::Spawn(e.to_string()))?;

        let producer = match thread::Builder::new()
            .name("llama-producer".into())
            .spawn(move || produce(&shared, tx))
        {
            Ok(handle) => handle,
            Err(err) => {
                // The failed closure dropped the sender, so the processor exits.
                let _ = processor.join();
                return Err(RuntimeError::Spawn(err.to_string()));
            }
        };

        Ok(Self {
            producer,
            processor,
        })
    }

    pub(crate) fn join(self) {
        if self.producer.join().is_err() {
            warn!("producer thread panicked");
        }
        if self.processor.join().is_err() {
            warn!("processor thread panicked");
        }
    }
}

/// sample → accept → enqueue → evaluate, one step per lock acquisition.
fn produce(shared: &Shared, tx: Sender<TokenId>) {
    let mut produced = 0usize;
    loop {
        let mut core = shared.lock_core();
        let Core { model, session } = &mut *core;
        let (Some(model), Some(session)) = (model.as_mut(), session.as_mut()) else {
            break;
        };
        let ctx = &mut model.ctx;

        if shared.stop.load(Ordering::Acquire) {
            session.cancel();
            break;
        }

        let step = match session.ensure_headroom(ctx) {
            Ok(()) => session.sample_next(ctx),
            Err(err) => Err(err),
        };
        let token = match step {
            Ok(Some(token)) => token,
            Ok(None) => break,
            Err(err) => {
                shared.record_error(err);
                break;
            }
        };

        shared.queue.enqueued.fetch_add(1, Ordering::SeqCst);
        if tx.send(token).is_err() {
            warn!("token queue closed before generation finished");
            session.cancel();
            break;
        }

        if let Err(err) = session.commit_token(ctx, token) {
            shared.record_error(err);
            break;
        }
        produced += 1;
    }
    debug!(produced, "producer finished");
}

fn process(
    shared: &Shared,
    rx: Receiver<TokenId>,
    vocab: Arc<dyn Vocab>,
    config: &PipelineConfig,
) {
    let poll = Duration::from_millis(config.poll_interval_ms);
    let interval = Duration::from_millis(config.flush_interval_ms);

    let mut batch = String::new();
    let mut batched = 0usize;
    let mut flushes = 0usize;
    let mut last_flush = Instant::now();

    loop {
        match rx.recv_timeout(poll) {
            Ok(token) => {
                shared.queue.dequeued.fetch_add(1, Ordering::SeqCst);
                batch.push_str(&vocab.token_to_piece(token));
                batched += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            // Every queued token has been received once the sender is gone.
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if batched >= config.flush_tokens || (batched > 0 && last_flush.elapsed() >= interval) {
            flush(shared, &mut batch);
            batched = 0;
            flushes += 1;
            last_flush = Instant::now();
        }
    }

    if batched > 0 {
        flush(shared, &mut batch);
        flushes += 1;
    }

    let counts = shared.queue.snapshot();
    info!(
        enqueued = counts.enqueued,
        dequeued = counts.dequeued,
        flushes,
        "pipeline drained"
    );
    shared.generating.store(false, Ordering::Release);
}

fn flush(shared: &Shared, batch: &mut String) {
    if !batch.is_empty() {
        shared.output.append(batch);
        shared.callback.deliver(batch);
    }
    batch.clear();
}
