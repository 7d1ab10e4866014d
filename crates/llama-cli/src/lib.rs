//! # llama-cli
//!
//! Demo front end for llama-stream. Runs generation sessions against the
//! deterministic mock backend, synchronously or on the threaded pipeline, and
//! reports what the resource policy sees on this host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use llama_engine::LoadParams;
use llama_runtime::mock::{MockConfig, MockSource};
use llama_runtime::{
    GenerationStats, MemoryInfo, PolicyConfig, ProcMeminfo, ResourcePolicy, StaticProbe, MIB,
};
use llama_stream::{Engine, ModelInfo, Phase, QueueStats, RuntimeError, SessionConfig, Termination};
use serde::Serialize;
use tracing::info;

/// Errors from the CLI front end.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid policy config: {0}")]
    Policy(String),
}

/// Where host memory numbers come from.
#[derive(Debug, Clone, Copy)]
pub enum MemorySource {
    /// `/proc/meminfo`.
    Host,
    /// Pretend this many MiB are available.
    Fixed { available_mb: u64 },
}

pub fn build_policy(source: MemorySource) -> Result<ResourcePolicy, CliError> {
    let config = PolicyConfig::default();
    let policy = match source {
        MemorySource::Host => ResourcePolicy::new(config, Arc::new(ProcMeminfo::default())),
        MemorySource::Fixed { available_mb } => {
            let bytes = available_mb * MIB;
            ResourcePolicy::new(config, Arc::new(StaticProbe::new(bytes, bytes)))
        }
    };
    policy.map_err(|e| CliError::Policy(e.to_string()))
}

/// Memory snapshot plus the decisions derived from it.
#[derive(Debug, Serialize)]
pub struct MemoryReport {
    #[serde(flatten)]
    pub info: MemoryInfo,
    pub recommended_window: usize,
    pub max_model_mb: u64,
}

pub fn memory_report(policy: &ResourcePolicy) -> MemoryReport {
    MemoryReport {
        info: policy.memory_info(),
        recommended_window: policy.recommended_window_capacity(),
        max_model_mb: policy.max_model_bytes() / MIB,
    }
}

/// Read a [`SessionConfig`] from a JSON file.
pub fn load_config(path: &Path) -> Result<SessionConfig, CliError> {
    let json = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(SessionConfig::from_json(&json)?)
}

/// One demo generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub config: SessionConfig,
    /// Text the mock backend cycles through.
    pub script: String,
    pub threaded: bool,
}

#[derive(Debug, Serialize)]
pub struct GenerateReport {
    pub text: String,
    pub termination: Termination,
    pub model: ModelInfo,
    pub stats: GenerationStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueStats>,
}

/// Load the mock model and run one session to completion.
///
/// `on_text` sees output as it is produced: per token in synchronous mode,
/// per flushed batch in threaded mode.
pub fn generate<F>(
    policy: ResourcePolicy,
    request: &GenerateRequest,
    mut on_text: F,
) -> Result<GenerateReport, CliError>
where
    F: FnMut(&str) + Send + 'static,
{
    let engine = Engine::new(Arc::new(policy));
    let source = MockSource::new(MockConfig::default().with_script_text(&request.script));
    let model = engine.load(&source, &request.config.load_params())?;
    info!(model = %model.name, threaded = request.threaded, "generating");

    if request.threaded {
        engine.register_callback(on_text);
        engine.start_threaded(&request.prompt, &request.config)?;
        engine.join();
        engine.clear_callback();

        let termination = match engine.phase() {
            Phase::Terminated(Termination::Error(_)) => {
                return Err(engine
                    .last_error()
                    .unwrap_or(RuntimeError::NotGenerating)
                    .into());
            }
            Phase::Terminated(termination) => termination,
            _ => Termination::Done,
        };
        return Ok(GenerateReport {
            text: engine.drain_buffer(),
            termination,
            model,
            stats: engine.stats(),
            queue: Some(engine.queue_stats()),
        });
    }

    let mut text = String::new();
    let termination = engine.generate_with_callback(&request.prompt, &request.config, |piece, _| {
        on_text(piece);
        text.push_str(piece);
        true
    })?;
    Ok(GenerateReport {
        text,
        termination,
        model,
        stats: engine.stats(),
        queue: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(threaded: bool) -> GenerateRequest {
        GenerateRequest {
            prompt: "Once".into(),
            config: SessionConfig {
                window_capacity: 256,
                max_output_tokens: 12,
                ..SessionConfig::default()
            },
            script: "upon a time ".into(),
            threaded,
        }
    }

    fn policy() -> ResourcePolicy {
        build_policy(MemorySource::Fixed { available_mb: 4096 }).unwrap()
    }

    #[test]
    fn sync_and_threaded_agree() {
        let sync = generate(policy(), &request(false), |_| {}).unwrap();
        let threaded = generate(policy(), &request(true), |_| {}).unwrap();

        assert_eq!(sync.text, "upon a time ");
        assert_eq!(threaded.text, sync.text);
        assert_eq!(sync.termination, Termination::Done);
        assert_eq!(threaded.queue.map(|q| q.dequeued), Some(12));
    }

    #[test]
    fn low_memory_rejects_load() {
        let policy = build_policy(MemorySource::Fixed { available_mb: 200 }).unwrap();
        let err = generate(policy, &request(false), |_| {}).unwrap_err();
        assert!(matches!(err, CliError::Runtime(RuntimeError::AllocationRejected { .. })));
    }

    #[test]
    fn memory_report_serializes_flat() {
        let report = memory_report(&policy());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["available_mb"], 4096);
        assert_eq!(json["recommended_window"], 32768);
    }
}
