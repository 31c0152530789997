//! Forced-exploration policy.
//!
//! Keeps the controller from settling into exploit forever: a minimum
//! explore share over a sliding window, a fixed cadence, or a flat tick rate
//! with no recent exploration can each force an EXPLORE decision.

use playbook_core::config::{ExplorationConfig, ExplorationMode};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceReason {
    Quota,
    Interval,
    Stuck,
}

impl ForceReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quota => "QUOTA",
            Self::Interval => "INTERVAL",
            Self::Stuck => "STUCK",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExplorationPolicy {
    config: ExplorationConfig,
    explored: VecDeque<bool>,
    tick_rates: VecDeque<f64>,
}

impl ExplorationPolicy {
    pub fn new(config: ExplorationConfig) -> Self {
        Self { config, explored: VecDeque::new(), tick_rates: VecDeque::new() }
    }

    /// Whether the next decision must be EXPLORE. `tick_count` is the index
    /// of the tick about to be decided.
    pub fn should_force(&self, tick_count: u64) -> Option<ForceReason> {
        let mode = self.config.mode;
        let uses = |m: ExplorationMode| mode == m || mode == ExplorationMode::Hybrid;
        if mode == ExplorationMode::Off {
            return None;
        }
        if uses(ExplorationMode::Stuck) && self.is_stuck() {
            return Some(ForceReason::Stuck);
        }
        if uses(ExplorationMode::Quota) && self.below_quota() {
            return Some(ForceReason::Quota);
        }
        if uses(ExplorationMode::Interval) && self.config.interval_ticks > 0 && tick_count > 0 && tick_count % self.config.interval_ticks == 0 {
            return Some(ForceReason::Interval);
        }
        None
    }

    pub fn record(&mut self, explored: bool, tick_rate: f64) {
        push_bounded(&mut self.explored, explored, self.config.window_size.max(1));
        push_bounded(&mut self.tick_rates, tick_rate, self.config.stuck_window.max(1));
    }

    /// Share of EXPLORE decisions in the current window.
    pub fn explore_fraction(&self) -> f64 {
        if self.explored.is_empty() {
            return 0.0;
        }
        self.explored.iter().filter(|e| **e).count() as f64 / self.explored.len() as f64
    }

    fn below_quota(&self) -> bool {
        // Judge the quota only once a fifth of the window has been seen.
        let warmup = (self.config.window_size / 5).max(1);
        self.explored.len() >= warmup && self.explore_fraction() < self.config.min_explore_fraction
    }

    fn is_stuck(&self) -> bool {
        let window = self.config.stuck_window;
        if window == 0 || self.tick_rates.len() < window {
            return false;
        }
        let (lo, hi) = self
            .tick_rates
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| (lo.min(*r), hi.max(*r)));
        let recent_explore = self.explored.iter().rev().take(window).any(|e| *e);
        hi - lo < self.config.stuck_epsilon && !recent_explore
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, cap: usize) {
    buf.push_back(value);
    while buf.len() > cap {
        buf.pop_front();
    }
}
