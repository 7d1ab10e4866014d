//! # llama-runtime
//!
//! Host-facing runtime support for llama-stream: the memory policy that gates
//! model loads and sizes the context window, per-session statistics with
//! telemetry hooks, and a deterministic mock backend.
//!
//! ## Design Notes
//!
//! - [`ResourcePolicy`] never allocates. It answers questions about the host
//!   and keeps running totals of what callers say they hold.
//! - Host memory is read through [`MemoryProbe`] so tests can pin it.
//! - [`mock::MockBackend`] implements the full backend contract with real
//!   position bookkeeping, which makes shift and rollback bugs observable.

pub mod memory;
pub mod mock;
pub mod telemetry;

pub use memory::{
    HostMemory, MemoryInfo, MemoryProbe, PolicyConfig, PolicyError, PressureLevel,
    PressureThresholds, ProcMeminfo, ResourcePolicy, ResourceSnapshot, StaticProbe, UsageKind,
    MIB,
};
pub use telemetry::{GenerationStats, LogTelemetry, NoopTelemetry, StatsRecorder, TelemetryHook};
