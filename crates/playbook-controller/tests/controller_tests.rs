//! Integration tests for playbook-controller
//!
//! Drives the public surface the learning pipeline uses: observations built
//! from execution traces, reflection depth, mode selection, and the loop.

use playbook_controller::{spawn, ControlCommand, MetaController, Mode, Observation, SignalKind};
use playbook_core::config::{ControllerConfig, ExplorationMode};
use playbook_core::{ExecutionTrace, Group, ReflectionDepth, StepOutcome, ToolResult};
use std::time::Duration;

fn quiet_config() -> ControllerConfig {
    let mut c = ControllerConfig::default();
    c.exploration.mode = ExplorationMode::Off;
    c
}

fn failing_trace() -> ExecutionTrace {
    let mut t = ExecutionTrace::new("fetch the quarterly report", Group::Left, false);
    t.expected_success = Some(true);
    t.confidence = 0.6;
    t.error = Some("HTTP 503 from upstream".into());
    t.steps.push(StepOutcome {
        description: "call report endpoint".into(),
        success: false,
        tool: Some("http_get".into()),
        error: Some("503".into()),
    });
    t.tool_results.push(ToolResult { name: "http_get".into(), success: false, duration_ms: Some(900) });
    t
}

fn routine_trace() -> ExecutionTrace {
    let mut t = ExecutionTrace::new("list files", Group::Left, true);
    t.expected_success = Some(true);
    t.confidence = 0.95;
    t
}

// ============================================================
// Novelty -> depth
// ============================================================

#[test]
fn surprising_failure_demands_deep_reflection() {
    let mut mc = MetaController::new(quiet_config());
    let m = mc.measure(&Observation::from(&failing_trace()));
    assert!(m.has(SignalKind::PredictionError));
    assert!(m.has(SignalKind::ExecutionFailure));
    assert!(m.has(SignalKind::LowConfidence));
    assert!(m.has(SignalKind::ToolFailure));
    assert!(m.tick >= 0.8);

    mc.observe(&m);
    let pressure = mc.pressure_for(&m);
    assert_eq!(MetaController::depth_for(pressure), ReflectionDepth::Deep);
}

#[test]
fn routine_success_reflects_shallowly_at_most() {
    let mut mc = MetaController::new(quiet_config());
    for _ in 0..20 {
        let m = mc.measure(&Observation::from(&routine_trace()));
        mc.observe(&m);
    }
    let m = mc.measure(&Observation::from(&routine_trace()));
    let depth = MetaController::depth_for(mc.pressure_for(&m));
    assert!(depth <= ReflectionDepth::Shallow);
}

// ============================================================
// Mode and energy
// ============================================================

#[test]
fn sustained_failures_push_toward_explore() {
    let mut mc = MetaController::new(quiet_config());
    for _ in 0..10 {
        let m = mc.measure(&Observation::from(&failing_trace()));
        mc.observe(&m);
    }
    let d = mc.tick(1.0);
    assert_eq!(d.mode, Mode::Explore);
    assert_eq!(d.decision, "HIGH_NOVELTY -> EXPLORE");
}

#[test]
fn depleted_energy_never_selects_unaffordable_mode() {
    let mut mc = MetaController::new(quiet_config());
    mc.report_pressure(0.1, 0.95);
    let mut saw_low_energy = false;
    for _ in 0..50 {
        let before = mc.energy();
        let d = mc.tick(0.0);
        let cost = match d.mode {
            Mode::Explore => mc.config().explore_cost,
            Mode::Exploit => mc.config().exploit_cost,
            Mode::Integrate => mc.config().integrate_cost,
        };
        if cost > before {
            assert!(d.low_energy);
        }
        saw_low_energy |= d.low_energy;
        assert!(mc.energy() >= 0.0);
    }
    assert!(saw_low_energy);
}

#[test]
fn metrics_expose_state_and_energy() {
    let mut mc = MetaController::new(quiet_config());
    mc.tick(0.5);
    let m = mc.metrics();
    assert_eq!(m.tick_count, 1);
    assert!(m.energy_level <= 100.0);
    assert!(m.current_tick_interval >= 0.1 && m.current_tick_interval <= 2.0);
    assert_eq!(m.last_decision.as_deref(), Some("STABLE -> EXPLOIT"));
    let json = serde_json::to_value(&m).unwrap();
    assert!(json.get("state").and_then(|s| s.get("fatigue")).is_some());
}

// ============================================================
// Loop
// ============================================================

#[tokio::test(start_paused = true)]
async fn loop_applies_commands_in_order() {
    let task = spawn(MetaController::new(quiet_config()), None, 100);
    let handle = task.handle.clone();
    let mc = MetaController::new(quiet_config());
    let m = mc.measure(&Observation::from(&failing_trace()));

    handle.send(ControlCommand::Observe(m)).await;
    handle.send(ControlCommand::Pressure { entropy: 0.9, conflict: 0.0 }).await;
    handle.send(ControlCommand::ResetFatigue).await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let metrics = handle.metrics();
    assert_eq!(metrics.observations, 1);
    assert_eq!(metrics.entropy, 0.9);
    assert!(metrics.tick_count >= 1);

    let final_state = task.shutdown().await.unwrap();
    assert_eq!(final_state.state().observations, 1);
}
