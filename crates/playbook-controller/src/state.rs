//! Five-dimensional internal state, every component in [0,1].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    pub alertness: f64,
    pub focus: f64,
    pub cognitive_load: f64,
    pub fatigue: f64,
    pub engagement: f64,
}

impl Default for StateVector {
    fn default() -> Self {
        Self { alertness: 0.5, focus: 0.5, cognitive_load: 0.0, fatigue: 0.0, engagement: 0.5 }
    }
}

/// What one state update sees.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateInputs {
    pub novelty: f64,
    pub entropy: f64,
    pub conflict: f64,
    pub elapsed_secs: f64,
}

impl StateVector {
    /// Linear, bounded update. Fatigue only accumulates here; see
    /// [`reset_fatigue`](Self::reset_fatigue).
    pub fn update(&mut self, input: StateInputs, fatigue_rate: f64, engagement_baseline: f64) {
        let novelty = unit(input.novelty);
        let entropy = unit(input.entropy);
        let conflict = unit(input.conflict);
        let elapsed = input.elapsed_secs.max(0.0);

        self.cognitive_load = unit((entropy + conflict) / 2.0);
        self.fatigue = unit(self.fatigue + fatigue_rate.max(0.0) * elapsed * (0.5 + 0.5 * self.cognitive_load));
        self.alertness = unit(0.7 * self.alertness + 0.3 * novelty - 0.1 * self.fatigue);

        let stability = 1.0 - entropy.max(conflict).max(novelty);
        self.focus = unit(0.7 * self.focus + 0.3 * stability - 0.2 * self.fatigue);
        self.engagement = unit(engagement_baseline + 0.5 * novelty - self.fatigue);
    }

    pub fn reset_fatigue(&mut self) {
        self.fatigue = 0.0;
    }

    pub fn clamp(&mut self) {
        self.alertness = unit(self.alertness);
        self.focus = unit(self.focus);
        self.cognitive_load = unit(self.cognitive_load);
        self.fatigue = unit(self.fatigue);
        self.engagement = unit(self.engagement);
    }
}

fn unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}
