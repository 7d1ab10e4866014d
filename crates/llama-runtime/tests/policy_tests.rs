//! Integration tests for the resource policy.
//!
//! Validates:
//! - Allocation gate: both the safety margin and the minimum-free check apply
//! - Gate monotonicity across a sweep of sizes at a fixed snapshot
//! - Window recommendation tracks available memory
//! - Usage registration drives the pressure callback
//! - Soft failure when the host cannot report memory

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use llama_runtime::{
    MemoryInfo, PolicyConfig, PressureLevel, ResourcePolicy, StaticProbe, UsageKind, MIB,
};

fn policy(available_mb: u64) -> (ResourcePolicy, Arc<StaticProbe>) {
    let probe = Arc::new(StaticProbe::new(16 * 1024 * MIB, available_mb * MIB));
    let policy = ResourcePolicy::new(PolicyConfig::default(), probe.clone()).unwrap();
    (policy, probe)
}

// ===========================================================================
// Allocation gate
// ===========================================================================

#[test]
fn model_of_700mb_needs_more_than_600mb_available() {
    let (policy, probe) = policy(600);
    assert!(!policy.can_allocate(700 * MIB));

    probe.set_available(1200 * MIB);
    assert!(policy.can_allocate(700 * MIB));
}

#[test]
fn each_check_rejects_independently() {
    // Passes the safety margin (900 >= 700 + 100) but leaves only 200 MB free.
    let (policy, _) = policy(900);
    assert!(!policy.can_allocate(700 * MIB));

    // With a tiny minimum-free margin only the safety margin matters.
    let config = PolicyConfig {
        min_free_after_alloc: MIB,
        ..PolicyConfig::default()
    };
    let probe = Arc::new(StaticProbe::new(4096 * MIB, 750 * MIB));
    let policy = ResourcePolicy::new(config, probe).unwrap();
    assert!(!policy.can_allocate(700 * MIB));
    assert!(policy.can_allocate(600 * MIB));
}

#[test]
fn gate_is_monotonic_in_requested_size() {
    for available_mb in [0, 300, 600, 1200, 4096] {
        let (policy, _) = policy(available_mb);
        let mut rejected = false;
        for size_mb in (0..5000).step_by(50) {
            let ok = policy.can_allocate(size_mb * MIB);
            if rejected {
                assert!(!ok, "{size_mb} MB accepted after a smaller size was rejected");
            }
            rejected |= !ok;
        }
    }
}

// ===========================================================================
// Window sizing and pressure
// ===========================================================================

#[test]
fn window_recommendation_grows_with_memory() {
    let (policy, probe) = policy(0);
    assert_eq!(policy.recommended_window_capacity(), 512);

    // (2148 - 100) MiB / 4 KiB = 524288 tokens, capped at 32768.
    probe.set_available(2148 * MIB);
    assert_eq!(policy.recommended_window_capacity(), 32768);

    // (110 - 100) MiB / 4 KiB = 2560 tokens, rounded down to 2048.
    probe.set_available(110 * MIB);
    assert_eq!(policy.recommended_window_capacity(), 2048);
}

#[test]
fn unreported_memory_is_most_conservative() {
    let policy =
        ResourcePolicy::new(PolicyConfig::default(), Arc::new(StaticProbe::unavailable())).unwrap();
    assert!(!policy.can_allocate(1));
    assert_eq!(policy.pressure_level(), PressureLevel::Critical);
    assert_eq!(policy.recommended_window_capacity(), 512);
}

#[test]
fn registration_reports_pressure_unless_low() {
    let (policy, probe) = policy(4096);
    let seen: Arc<Mutex<Vec<PressureLevel>>> = Arc::default();
    let sink = seen.clone();
    policy.set_pressure_callback(move |level| sink.lock().unwrap().push(level));

    policy.register_usage(UsageKind::Model, 700 * MIB);
    assert!(seen.lock().unwrap().is_empty());

    probe.set_available(100 * MIB);
    policy.register_usage(UsageKind::Context, 8 * MIB);
    assert_eq!(*seen.lock().unwrap(), vec![PressureLevel::High]);

    policy.clear_pressure_callback();
    policy.register_usage(UsageKind::Context, 8 * MIB);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn unregister_clamps_at_zero() {
    let (policy, _) = policy(4096);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    policy.set_pressure_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    policy.register_usage(UsageKind::Model, 10 * MIB);
    policy.unregister_usage(UsageKind::Model, 50 * MIB);
    assert_eq!(policy.usage(UsageKind::Model), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn memory_info_reports_megabytes() {
    let (policy, _) = policy(3000);
    policy.register_usage(UsageKind::Model, 700 * MIB);
    policy.register_usage(UsageKind::Context, 64 * MIB);

    let info: MemoryInfo = policy.memory_info();
    assert_eq!(info.available_mb, 3000);
    assert_eq!(info.total_mb, 16 * 1024);
    assert_eq!(info.model_mb, 700);
    assert_eq!(info.context_mb, 64);
    assert_eq!(info.pressure, PressureLevel::Low);

    let json = serde_json::to_value(info).unwrap();
    assert_eq!(json["pressure"], "low");
}
