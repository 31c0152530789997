//! Playbook Controller - execution-pressure meta-controller
//!
//! Novelty from each execution folds into a smoothed tick rate. The tick rate
//! sets reflection depth, drives EXPLORE / EXPLOIT / INTEGRATE selection under
//! an energy budget, and adapts the controller's own tick interval.

pub mod controller;
pub mod energy;
pub mod exploration;
pub mod novelty;
pub mod runtime;
pub mod state;

pub use controller::{ConsciousnessMetrics, ControllerState, MetaController, Mode, ModeDecision};
pub use energy::EnergyBudget;
pub use exploration::{ExplorationPolicy, ForceReason};
pub use novelty::{NoveltyDetector, NoveltyMeasurement, NoveltySignal, Observation, SignalKind};
pub use runtime::{spawn, ControlCommand, ControllerHandle, ControllerTask};
pub use state::{StateInputs, StateVector};
