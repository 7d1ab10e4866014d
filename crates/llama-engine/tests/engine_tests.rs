//! Integration tests for the llama-engine backend contract.
//!
//! Validates:
//! - Vocab, Backend and ModelSource can be implemented by a small word-level backend
//! - Trait objects work for dynamic dispatch across threads (the "narrow waist")
//! - The vocabulary handle is usable while the backend is borrowed mutably

use std::sync::Arc;

use llama_engine::*;

// ---------------------------------------------------------------------------
// Word-level backend
// ---------------------------------------------------------------------------

const EOS: TokenId = 0;

struct Words {
    words: Vec<&'static str>,
}

impl Vocab for Words {
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        capacity: usize,
    ) -> Result<Vec<TokenId>, TokenizeError> {
        let mut out = Vec::new();
        if add_special {
            out.push(1);
        }
        for word in text.split_whitespace() {
            let id = self
                .words
                .iter()
                .position(|w| *w == word)
                .ok_or_else(|| TokenizeError::Invalid(word.to_string()))?;
            out.push(id as TokenId);
        }
        if out.len() > capacity {
            return Err(TokenizeError::BufferTooSmall { required: out.len() });
        }
        Ok(out)
    }

    fn token_to_piece(&self, token: TokenId) -> String {
        self.words
            .get(token as usize)
            .map(|w| format!("{w} "))
            .unwrap_or_default()
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn vocab_size(&self) -> usize {
        self.words.len()
    }
}

struct Echo {
    vocab: Arc<Words>,
    cells: Vec<TokenId>,
    capacity: usize,
}

impl SequenceMemory for Echo {
    fn remove_range(&mut self, _seq: SeqId, start: Position, end: Option<Position>) -> bool {
        let end = end.map_or(self.cells.len(), |e| (e as usize).min(self.cells.len()));
        self.cells.drain(start as usize..end);
        true
    }

    fn shift_positions(&mut self, _seq: SeqId, _start: Position, _end: Option<Position>, _delta: i64) {}

    fn clear_sequence(&mut self, _seq: SeqId) {
        self.cells.clear();
    }

    fn max_position(&self, _seq: SeqId) -> Option<Position> {
        self.cells.len().checked_sub(1).map(|p| p as Position)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Backend for Echo {
    fn vocab(&self) -> Arc<dyn Vocab> {
        self.vocab.clone()
    }

    fn evaluate(
        &mut self,
        tokens: &[TokenId],
        start: Position,
        _want_logits: bool,
    ) -> Result<(), BackendError> {
        if start as usize != self.cells.len() || self.cells.len() + tokens.len() > self.capacity {
            return Err(BackendError::Evaluate {
                position: start,
                reason: "out of order".into(),
            });
        }
        self.cells.extend_from_slice(tokens);
        Ok(())
    }

    fn configure_sampler(&mut self, _params: &SamplingParams) {}

    /// Repeats the most recent token, then ends.
    fn sample(&mut self) -> Result<TokenId, BackendError> {
        match self.cells.last() {
            Some(&last) if self.cells.iter().filter(|&&t| t == last).count() < 2 => Ok(last),
            Some(_) => Ok(EOS),
            None => Err(BackendError::Sample("no logits".into())),
        }
    }

    fn accept(&mut self, _token: TokenId) {}

    fn model_bytes(&self) -> u64 {
        1024
    }
}

struct EchoSource;

impl ModelSource for EchoSource {
    fn name(&self) -> &str {
        "echo"
    }

    fn model_bytes(&self) -> u64 {
        1024
    }

    fn open(&self, params: &LoadParams) -> Result<Box<dyn Backend>, BackendError> {
        if params.context_capacity == 0 {
            return Err(BackendError::ModelLoad("capacity required".into()));
        }
        Ok(Box::new(Echo {
            vocab: Arc::new(Words {
                words: vec!["</s>", "<s>", "hello", "llama"],
            }),
            cells: Vec::new(),
            capacity: params.context_capacity,
        }))
    }
}

fn open(capacity: usize) -> Box<dyn Backend> {
    let params = LoadParams {
        context_capacity: capacity,
        ..LoadParams::default()
    };
    EchoSource.open(&params).unwrap()
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[test]
fn source_refuses_unsized_context() {
    let err = EchoSource.open(&LoadParams::default()).err().unwrap();
    assert!(matches!(err, BackendError::ModelLoad(_)));
}

#[test]
fn evaluate_then_sample_through_trait_objects() {
    let mut backend = open(16);
    let vocab = backend.vocab();

    let prompt = vocab.tokenize("hello llama", true, 8).unwrap();
    assert_eq!(prompt, vec![1, 2, 3]);
    backend.evaluate(&prompt, 0, true).unwrap();
    assert_eq!(backend.max_position(DEFAULT_SEQ), Some(2));

    let token = backend.sample().unwrap();
    assert_eq!(vocab.token_to_piece(token), "llama ");
    backend.evaluate(&[token], 3, true).unwrap();
    let token = backend.sample().unwrap();
    assert!(vocab.is_end_of_sequence(token));
}

#[test]
fn evaluate_rejects_gaps_and_overflow() {
    let mut backend = open(4);
    let err = backend.evaluate(&[2], 1, true).unwrap_err();
    assert_eq!(
        err,
        BackendError::Evaluate {
            position: 1,
            reason: "out of order".into()
        }
    );
    assert!(backend.evaluate(&[2, 2, 2, 2, 2], 0, false).is_err());
    assert_eq!(backend.max_position(DEFAULT_SEQ), None);
}

#[test]
fn tokenize_reports_required_size() {
    let backend = open(8);
    let err = backend.vocab().tokenize("hello hello hello", true, 2).unwrap_err();
    assert_eq!(err, TokenizeError::BufferTooSmall { required: 4 });
}

#[test]
fn remove_range_to_end() {
    let mut backend = open(8);
    backend.evaluate(&[1, 2, 3, 2], 0, true).unwrap();
    assert!(backend.remove_range(DEFAULT_SEQ, 2, None));
    assert_eq!(backend.max_position(DEFAULT_SEQ), Some(1));
    backend.clear_sequence(DEFAULT_SEQ);
    assert_eq!(backend.max_position(DEFAULT_SEQ), None);
}

#[test]
fn default_description_mentions_capacity() {
    assert_eq!(open(32).describe(), "context capacity: 32");
}

#[test]
fn vocab_handle_crosses_threads() {
    let backend = open(8);
    let vocab = backend.vocab();
    let worker = std::thread::spawn(move || vocab.token_to_piece(2));
    assert_eq!(worker.join().unwrap(), "hello ");
}
