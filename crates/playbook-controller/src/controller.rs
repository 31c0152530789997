//! Execution-pressure meta-controller.
//!
//! Folds novelty into a smoothed tick rate, picks a cognitive mode each tick
//! under an energy budget, and adapts its own tick interval. The record is
//! plain data so it can be checkpointed and hydrated across restarts.

use crate::energy::EnergyBudget;
use crate::exploration::ExplorationPolicy;
use crate::novelty::{NoveltyDetector, NoveltyMeasurement, Observation};
use crate::state::{StateInputs, StateVector};
use chrono::{DateTime, Utc};
use playbook_core::config::ControllerConfig;
use playbook_core::ReflectionDepth;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Explore,
    Exploit,
    Integrate,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Explore, Mode::Exploit, Mode::Integrate];

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Explore => "EXPLORE",
            Mode::Exploit => "EXPLOIT",
            Mode::Integrate => "INTEGRATE",
        }
    }

    fn cost(self, config: &ControllerConfig) -> f64 {
        match self {
            Mode::Explore => config.explore_cost,
            Mode::Exploit => config.exploit_cost,
            Mode::Integrate => config.integrate_cost,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeDecision {
    pub mode: Mode,
    /// e.g. "HIGH_ENTROPY -> EXPLORE" or "HIGH_ENTROPY -> EXPLOIT (LOW_ENERGY)".
    pub decision: String,
    pub low_energy: bool,
    /// Set when the exploration policy overrode the preferred mode.
    pub forced: Option<String>,
    pub tick: u64,
}

/// Persisted controller record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerState {
    pub mode: Mode,
    pub tick_count: u64,
    pub tick_rate: f64,
    pub entropy: f64,
    pub conflict: f64,
    pub energy: EnergyBudget,
    pub state: StateVector,
    pub interval_secs: f64,
    pub observations: u64,
    pub last_decision: Option<ModeDecision>,
    pub updated_at: DateTime<Utc>,
}

impl ControllerState {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            mode: Mode::Exploit,
            tick_count: 0,
            tick_rate: config.initial_tick_rate.clamp(0.0, 1.0),
            entropy: 0.0,
            conflict: 0.0,
            energy: EnergyBudget::new(config.max_energy, config.energy_regen_per_sec),
            state: StateVector::default(),
            interval_secs: config.max_interval_secs,
            observations: 0,
            last_decision: None,
            updated_at: Utc::now(),
        }
    }
}

/// Read-only view published to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsciousnessMetrics {
    pub mode: Mode,
    pub tick_count: u64,
    pub tick_rate: f64,
    pub entropy: f64,
    pub conflict: f64,
    pub energy_level: f64,
    pub energy_fraction: f64,
    pub current_tick_interval: f64,
    pub state: StateVector,
    pub explore_fraction: f64,
    pub observations: u64,
    pub last_decision: Option<String>,
}

pub struct MetaController {
    config: ControllerConfig,
    detector: NoveltyDetector,
    policy: ExplorationPolicy,
    record: ControllerState,
    /// Novelty tick of the most recent observation, consumed by the next state update.
    pending_novelty: Option<f64>,
}

impl MetaController {
    pub fn new(config: ControllerConfig) -> Self {
        let record = ControllerState::new(&config);
        Self::with_state(config, record)
    }

    pub fn with_state(config: ControllerConfig, mut record: ControllerState) -> Self {
        record.energy.rebound(config.max_energy, config.energy_regen_per_sec);
        record.state.clamp();
        record.tick_rate = record.tick_rate.clamp(0.0, 1.0);
        record.interval_secs = record.interval_secs.clamp(config.min_interval_secs, config.max_interval_secs);
        Self {
            detector: NoveltyDetector::new(config.baseline_confidence),
            policy: ExplorationPolicy::new(config.exploration.clone()),
            config,
            record,
            pending_novelty: None,
        }
    }

    /// Load the checkpoint at `path` if it parses, otherwise start fresh.
    pub fn hydrate_or_create(path: &Path, config: ControllerConfig) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(json) => match serde_json::from_str::<ControllerState>(&json) {
                    Ok(state) => {
                        info!(
                            "Hydrated controller state: mode={} ticks={} tick_rate={:.3}",
                            state.mode, state.tick_count, state.tick_rate
                        );
                        return Self::with_state(config, state);
                    }
                    Err(e) => warn!("Failed to parse {}: {}, creating fresh", path.display(), e),
                },
                Err(e) => warn!("Failed to read {}: {}, creating fresh", path.display(), e),
            }
        }
        Self::new(config)
    }

    /// Write the record atomically. Failures are logged, never fatal.
    pub fn checkpoint(&self, path: &Path) {
        let json = match serde_json::to_string_pretty(&self.record) {
            Ok(j) => j,
            Err(e) => {
                error!("Failed to serialize controller state: {}", e);
                return;
            }
        };
        let tmp_path = path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp_path, &json) {
            error!("Failed to write controller state tmp: {}", e);
            return;
        }
        if let Err(e) = std::fs::rename(&tmp_path, path) {
            error!("Failed to rename controller checkpoint: {}", e);
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn state(&self) -> &ControllerState {
        &self.record
    }

    pub fn mode(&self) -> Mode {
        self.record.mode
    }

    pub fn tick_rate(&self) -> f64 {
        self.record.tick_rate
    }

    pub fn interval_secs(&self) -> f64 {
        self.record.interval_secs
    }

    pub fn energy(&self) -> f64 {
        self.record.energy.level()
    }

    pub fn measure(&self, obs: &Observation) -> NoveltyMeasurement {
        self.detector.measure(obs)
    }

    /// Fold one measurement into the tick rate. Returns the new rate.
    pub fn observe(&mut self, measurement: &NoveltyMeasurement) -> f64 {
        let d = self.config.ema_decay.clamp(0.0, 1.0);
        let tick = measurement.tick.clamp(0.0, 1.0);
        self.record.tick_rate = (d * self.record.tick_rate + (1.0 - d) * tick).clamp(0.0, 1.0);
        self.record.observations += 1;
        self.record.updated_at = Utc::now();
        self.pending_novelty = Some(tick);
        debug!(tick, tick_rate = self.record.tick_rate, signals = measurement.signals.len(), "observed");
        self.record.tick_rate
    }

    /// Latest entropy/conflict from retrieval or the hemispheres.
    pub fn report_pressure(&mut self, entropy: f64, conflict: f64) {
        self.record.entropy = entropy.clamp(0.0, 1.0);
        self.record.conflict = conflict.clamp(0.0, 1.0);
    }

    /// Pressure used to pick reflection depth for one execution: the larger
    /// of its own tick and the smoothed rate.
    pub fn pressure_for(&self, measurement: &NoveltyMeasurement) -> f64 {
        measurement.tick.max(self.record.tick_rate).clamp(0.0, 1.0)
    }

    pub fn depth_for(pressure: f64) -> ReflectionDepth {
        ReflectionDepth::for_pressure(pressure)
    }

    /// Advance one tick after `elapsed_secs` of wall time.
    pub fn tick(&mut self, elapsed_secs: f64) -> ModeDecision {
        let elapsed = elapsed_secs.max(0.0);
        self.record.energy.regenerate(elapsed);

        let (preferred, label) = self.preferred_mode();
        let forced = if preferred == Mode::Explore { None } else { self.policy.should_force(self.record.tick_count) };
        let (mut mode, label) = match forced {
            Some(reason) => (Mode::Explore, format!("FORCED_{}", reason.as_str())),
            None => (preferred, label.to_string()),
        };

        let mut low_energy = false;
        if !self.record.energy.can_afford(mode.cost(&self.config)) {
            low_energy = true;
            mode = self.fallback_mode();
        }
        self.record.energy.try_spend(mode.cost(&self.config));

        let decision = if low_energy {
            format!("{} -> {} (LOW_ENERGY)", label, mode)
        } else {
            format!("{} -> {}", label, mode)
        };

        let novelty = self.pending_novelty.take().unwrap_or(self.record.tick_rate);
        self.record.state.update(
            StateInputs { novelty, entropy: self.record.entropy, conflict: self.record.conflict, elapsed_secs: elapsed },
            self.config.fatigue_rate,
            self.config.engagement_baseline,
        );
        self.adapt_interval();

        self.policy.record(mode == Mode::Explore, self.record.tick_rate);
        self.record.mode = mode;
        self.record.tick_count += 1;
        self.record.updated_at = Utc::now();

        let result = ModeDecision {
            mode,
            decision,
            low_energy,
            forced: forced.map(|r| r.as_str().to_string()),
            tick: self.record.tick_count,
        };
        debug!(decision = %result.decision, energy = self.record.energy.level(), interval = self.record.interval_secs, "tick");
        self.record.last_decision = Some(result.clone());
        result
    }

    pub fn reset_fatigue(&mut self) {
        self.record.state.reset_fatigue();
        info!("Fatigue reset");
    }

    pub fn metrics(&self) -> ConsciousnessMetrics {
        ConsciousnessMetrics {
            mode: self.record.mode,
            tick_count: self.record.tick_count,
            tick_rate: self.record.tick_rate,
            entropy: self.record.entropy,
            conflict: self.record.conflict,
            energy_level: self.record.energy.level(),
            energy_fraction: self.record.energy.fraction(),
            current_tick_interval: self.record.interval_secs,
            state: self.record.state,
            explore_fraction: self.policy.explore_fraction(),
            observations: self.record.observations,
            last_decision: self.record.last_decision.as_ref().map(|d| d.decision.clone()),
        }
    }

    fn preferred_mode(&self) -> (Mode, &'static str) {
        let c = &self.config;
        if self.record.entropy > c.entropy_threshold {
            (Mode::Explore, "HIGH_ENTROPY")
        } else if self.record.tick_rate > c.novelty_threshold {
            (Mode::Explore, "HIGH_NOVELTY")
        } else if self.record.conflict > c.conflict_threshold {
            (Mode::Integrate, "CONFLICT")
        } else {
            (Mode::Exploit, "STABLE")
        }
    }

    /// Cheapest affordable mode, or the cheapest overall when nothing is.
    fn fallback_mode(&self) -> Mode {
        let by_cost = |a: &Mode, b: &Mode| a.cost(&self.config).total_cmp(&b.cost(&self.config));
        Mode::ALL
            .iter()
            .copied()
            .filter(|m| self.record.energy.can_afford(m.cost(&self.config)))
            .min_by(by_cost)
            .or_else(|| Mode::ALL.iter().copied().min_by(by_cost))
            .unwrap_or(Mode::Exploit)
    }

    fn adapt_interval(&mut self) {
        let c = &self.config;
        let (min, max) = (c.min_interval_secs, c.max_interval_secs.max(c.min_interval_secs));
        let urgency = self.record.tick_rate.max(self.record.state.alertness).clamp(0.0, 1.0);
        let target = max - (max - min) * urgency;
        let d = c.ema_decay.clamp(0.0, 1.0);
        self.record.interval_secs = (d * self.record.interval_secs + (1.0 - d) * target).clamp(min, max);
    }
}
