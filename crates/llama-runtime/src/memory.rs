//! Resource policy: host memory gating and window sizing for llama-stream.
//!
//! Provides:
//! - [`MemoryProbe`]: where host memory numbers come from ([`ProcMeminfo`], [`StaticProbe`])
//! - [`ResourcePolicy`]: allocation gate, recommended window capacity, pressure ladder
//! - usage registration for model and context memory, with a pressure callback
//!
//! The policy never allocates anything itself. It is consulted before a model is
//! opened and before a session sizes its window, so a rejection is cheap and has
//! no side effects. Host memory is re-read on every query; nothing is cached.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const MIB: u64 = 1024 * 1024;

/// Coarse classification of available host memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PressureLevel::Low => write!(f, "low"),
            PressureLevel::Medium => write!(f, "medium"),
            PressureLevel::High => write!(f, "high"),
            PressureLevel::Critical => write!(f, "critical"),
        }
    }
}

/// What a registered block of memory is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageKind {
    Model,
    Context,
}

impl fmt::Display for UsageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageKind::Model => write!(f, "model"),
            UsageKind::Context => write!(f, "context"),
        }
    }
}

/// Raw host memory numbers in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostMemory {
    pub total: u64,
    pub available: u64,
}

/// Source of host memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Current readings, or `None` when the host cannot report them.
    fn read(&self) -> Option<HostMemory>;
}

/// Reads `/proc/meminfo` (Linux, Android).
#[derive(Debug, Clone)]
pub struct ProcMeminfo {
    path: PathBuf,
}

impl Default for ProcMeminfo {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl ProcMeminfo {
    /// Read from an alternative meminfo-formatted file.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MemoryProbe for ProcMeminfo {
    fn read(&self) -> Option<HostMemory> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => parse_meminfo(&content),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "cannot read host memory");
                None
            }
        }
    }
}

/// Parse meminfo text. Values are in kB.
///
/// `MemAvailable` is preferred; older kernels fall back to
/// `MemFree + Buffers + Cached`.
pub fn parse_meminfo(content: &str) -> Option<HostMemory> {
    let field = |name: &str| -> Option<u64> {
        content
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|value| value.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };

    let total = field("MemTotal:")?;
    let available = match field("MemAvailable:") {
        Some(available) if available > 0 => available,
        _ => {
            field("MemFree:").unwrap_or(0)
                + field("Buffers:").unwrap_or(0)
                + field("Cached:").unwrap_or(0)
        }
    };
    Some(HostMemory { total, available })
}

/// Fixed, adjustable readings for tests and hosts that push memory numbers in.
#[derive(Debug, Default)]
pub struct StaticProbe {
    state: Mutex<Option<HostMemory>>,
}

impl StaticProbe {
    pub fn new(total: u64, available: u64) -> Self {
        Self {
            state: Mutex::new(Some(HostMemory { total, available })),
        }
    }

    /// A probe whose host never reports memory.
    pub fn unavailable() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }

    pub fn set_available(&self, available: u64) {
        let mut state = lock(&self.state);
        let total = match *state {
            Some(mem) => mem.total.max(available),
            None => available,
        };
        *state = Some(HostMemory { total, available });
    }
}

impl MemoryProbe for StaticProbe {
    fn read(&self) -> Option<HostMemory> {
        *lock(&self.state)
    }
}

/// Errors from policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("pressure thresholds must satisfy critical < high < medium (got {critical} / {high} / {medium})")]
    ThresholdOrder { critical: u64, high: u64, medium: u64 },
    #[error("window bounds must satisfy 0 < min <= max (got {min} / {max})")]
    WindowBounds { min: usize, max: usize },
    #[error("bytes_per_token must be positive")]
    ZeroTokenCost,
}

/// Available-memory boundaries of the pressure ladder, in bytes.
///
/// Below `critical` → Critical, below `high` → High, below `medium` → Medium,
/// otherwise Low.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureThresholds {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            critical: 64 * MIB,
            high: 128 * MIB,
            medium: 256 * MIB,
        }
    }
}

impl PressureThresholds {
    pub fn level_for(&self, available: u64) -> PressureLevel {
        if available < self.critical {
            PressureLevel::Critical
        } else if available < self.high {
            PressureLevel::High
        } else if available < self.medium {
            PressureLevel::Medium
        } else {
            PressureLevel::Low
        }
    }
}

/// Tunables of the resource policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Headroom required on top of every allocation.
    pub safety_margin: u64,
    /// Memory that must remain free after an allocation.
    pub min_free_after_alloc: u64,
    /// Rough per-token cost of context state.
    pub bytes_per_token: u64,
    pub min_window: usize,
    pub max_window: usize,
    pub thresholds: PressureThresholds,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            safety_margin: 100 * MIB,
            min_free_after_alloc: 500 * MIB,
            bytes_per_token: 4 * 1024,
            min_window: 512,
            max_window: 32_768,
            thresholds: PressureThresholds::default(),
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), PolicyError> {
        let t = &self.thresholds;
        if !(t.critical < t.high && t.high < t.medium) {
            return Err(PolicyError::ThresholdOrder {
                critical: t.critical,
                high: t.high,
                medium: t.medium,
            });
        }
        if self.min_window == 0 || self.min_window > self.max_window {
            return Err(PolicyError::WindowBounds {
                min: self.min_window,
                max: self.max_window,
            });
        }
        if self.bytes_per_token == 0 {
            return Err(PolicyError::ZeroTokenCost);
        }
        Ok(())
    }
}

/// Point-in-time view of host memory and registered usage, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub model: u64,
    pub context: u64,
    pub pressure: PressureLevel,
}

/// Flat host-facing memory record, in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryInfo {
    pub total_mb: u64,
    pub available_mb: u64,
    pub used_mb: u64,
    pub model_mb: u64,
    pub context_mb: u64,
    pub pressure: PressureLevel,
}

impl From<ResourceSnapshot> for MemoryInfo {
    fn from(s: ResourceSnapshot) -> Self {
        Self {
            total_mb: s.total / MIB,
            available_mb: s.available / MIB,
            used_mb: s.used / MIB,
            model_mb: s.model / MIB,
            context_mb: s.context / MIB,
            pressure: s.pressure,
        }
    }
}

/// Pressure listener. Invoked without any policy lock held, so it may swap
/// or clear itself.
pub type PressureCallback = Arc<dyn Fn(PressureLevel) + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    model: u64,
    context: u64,
}

/// Advisory memory gate consulted before model loads and window sizing.
pub struct ResourcePolicy {
    config: PolicyConfig,
    probe: Arc<dyn MemoryProbe>,
    usage: Mutex<Usage>,
    callback: Mutex<Option<PressureCallback>>,
}

impl fmt::Debug for ResourcePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePolicy")
            .field("config", &self.config)
            .field("usage", &*lock(&self.usage))
            .finish_non_exhaustive()
    }
}

impl ResourcePolicy {
    /// Build a policy over `probe`. The configuration must already be valid.
    pub fn new(config: PolicyConfig, probe: Arc<dyn MemoryProbe>) -> Result<Self, PolicyError> {
        config.validate()?;
        Ok(Self {
            config,
            probe,
            usage: Mutex::new(Usage::default()),
            callback: Mutex::new(None),
        })
    }

    /// Default policy over `/proc/meminfo`.
    pub fn from_host() -> Self {
        Self {
            config: PolicyConfig::default(),
            probe: Arc::new(ProcMeminfo::default()),
            usage: Mutex::new(Usage::default()),
            callback: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Host readings; an unreporting host counts as zero available memory.
    fn host(&self) -> HostMemory {
        self.probe.read().unwrap_or_default()
    }

    pub fn available(&self) -> u64 {
        self.host().available
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let host = self.host();
        let usage = *lock(&self.usage);
        ResourceSnapshot {
            total: host.total,
            available: host.available,
            used: host.total.saturating_sub(host.available),
            model: usage.model,
            context: usage.context,
            pressure: self.config.thresholds.level_for(host.available),
        }
    }

    pub fn memory_info(&self) -> MemoryInfo {
        self.snapshot().into()
    }

    /// Whether `bytes` can be allocated right now.
    ///
    /// Both must hold: `available >= bytes + safety_margin`, and
    /// `available - bytes >= min_free_after_alloc`.
    pub fn can_allocate(&self, bytes: u64) -> bool {
        let available = self.available();
        let ok = allocation_fits(&self.config, available, bytes);
        if ok {
            debug!(
                needed_mb = bytes / MIB,
                available_mb = available / MIB,
                "memory check passed"
            );
        } else {
            warn!(
                needed_mb = bytes / MIB,
                available_mb = available / MIB,
                "allocation rejected by resource policy"
            );
        }
        ok
    }

    /// Window capacity that fits the memory currently available.
    ///
    /// `(available - safety_margin) / bytes_per_token`, clamped to
    /// `[min_window, max_window]`, rounded down to a power of two.
    pub fn recommended_window_capacity(&self) -> usize {
        let tokens = window_for(&self.config, self.available());
        debug!(tokens, "recommended window capacity");
        tokens
    }

    pub fn pressure_level(&self) -> PressureLevel {
        self.config.thresholds.level_for(self.available())
    }

    /// Upper bound for model weights: 60% of available memory.
    pub fn max_model_bytes(&self) -> u64 {
        self.available() / 10 * 6
    }

    /// Estimated bytes of context state for `tokens` positions.
    pub fn context_bytes(&self, tokens: usize) -> u64 {
        tokens as u64 * self.config.bytes_per_token
    }

    pub fn usage(&self, kind: UsageKind) -> u64 {
        let usage = lock(&self.usage);
        match kind {
            UsageKind::Model => usage.model,
            UsageKind::Context => usage.context,
        }
    }

    /// Record `bytes` of `kind` and re-evaluate pressure.
    pub fn register_usage(&self, kind: UsageKind, bytes: u64) {
        let total = {
            let mut usage = lock(&self.usage);
            let slot = match kind {
                UsageKind::Model => &mut usage.model,
                UsageKind::Context => &mut usage.context,
            };
            *slot = slot.saturating_add(bytes);
            *slot
        };
        info!(%kind, mb = bytes / MIB, total_mb = total / MIB, "memory registered");
        self.check_pressure();
    }

    /// Release `bytes` of `kind`; clamps at zero.
    pub fn unregister_usage(&self, kind: UsageKind, bytes: u64) {
        let total = {
            let mut usage = lock(&self.usage);
            let slot = match kind {
                UsageKind::Model => &mut usage.model,
                UsageKind::Context => &mut usage.context,
            };
            *slot = slot.saturating_sub(bytes);
            *slot
        };
        info!(%kind, mb = bytes / MIB, total_mb = total / MIB, "memory unregistered");
    }

    pub fn set_pressure_callback<F>(&self, callback: F)
    where
        F: Fn(PressureLevel) + Send + Sync + 'static,
    {
        *lock(&self.callback) = Some(Arc::new(callback));
    }

    pub fn clear_pressure_callback(&self) {
        *lock(&self.callback) = None;
    }

    /// Evaluate pressure and notify the callback when it is not Low.
    pub fn check_pressure(&self) -> PressureLevel {
        let level = self.pressure_level();
        if level != PressureLevel::Low {
            warn!(%level, "memory pressure detected");
            let callback = lock(&self.callback).clone();
            if let Some(callback) = callback {
                callback(level);
            }
        }
        level
    }
}

fn allocation_fits(config: &PolicyConfig, available: u64, bytes: u64) -> bool {
    let needed = bytes.saturating_add(config.safety_margin);
    if available < needed {
        return false;
    }
    available - bytes >= config.min_free_after_alloc
}

fn window_for(config: &PolicyConfig, available: u64) -> usize {
    let usable = available.saturating_sub(config.safety_margin);
    let tokens = usize::try_from(usable / config.bytes_per_token).unwrap_or(usize::MAX);
    let clamped = tokens.clamp(config.min_window, config.max_window);
    prev_power_of_two(clamped)
}

fn prev_power_of_two(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    1 << (usize::BITS - 1 - n.leading_zeros())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
