//! Bounded energy budget that modes spend from and time refills.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyBudget {
    level: f64,
    max: f64,
    regen_per_sec: f64,
}

impl EnergyBudget {
    /// Starts full.
    pub fn new(max: f64, regen_per_sec: f64) -> Self {
        let max = max.max(0.0);
        Self { level: max, max, regen_per_sec: regen_per_sec.max(0.0) }
    }

    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Fraction of the maximum currently available.
    pub fn fraction(&self) -> f64 {
        if self.max <= 0.0 {
            0.0
        } else {
            self.level / self.max
        }
    }

    pub fn regenerate(&mut self, elapsed_secs: f64) {
        if elapsed_secs > 0.0 {
            self.level = (self.level + self.regen_per_sec * elapsed_secs).min(self.max);
        }
    }

    pub fn can_afford(&self, cost: f64) -> bool {
        cost <= self.level
    }

    /// Deduct `cost` if affordable. Returns whether anything was spent.
    pub fn try_spend(&mut self, cost: f64) -> bool {
        if !self.can_afford(cost) {
            return false;
        }
        self.level = (self.level - cost).max(0.0);
        true
    }

    /// Re-apply bounds after a config change or a hand-edited checkpoint.
    pub fn rebound(&mut self, max: f64, regen_per_sec: f64) {
        self.max = max.max(0.0);
        self.regen_per_sec = regen_per_sec.max(0.0);
        self.level = self.level.clamp(0.0, self.max);
    }
}
