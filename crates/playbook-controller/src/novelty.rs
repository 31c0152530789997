//! Novelty measurement from execution outcomes.
//!
//! Each execution yields a handful of named signals; their mean plus a small
//! multi-signal bonus (capped) is the single-event tick.

use playbook_core::{ExecutionTrace, ToolResult};
use serde::{Deserialize, Serialize};

/// Tick reported when nothing about an execution was surprising.
pub const QUIET_TICK: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    PredictionError,
    ExecutionFailure,
    LowConfidence,
    ToolFailure,
    UnexpectedSuccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoveltySignal {
    pub kind: SignalKind,
    pub magnitude: f64,
    pub evidence: String,
}

/// The parts of an execution that novelty looks at.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub expected_success: Option<bool>,
    pub success: bool,
    pub confidence: f64,
    pub tool_results: Vec<ToolResult>,
    pub error: Option<String>,
}

impl From<&ExecutionTrace> for Observation {
    fn from(trace: &ExecutionTrace) -> Self {
        Self {
            expected_success: trace.expected_success,
            success: trace.success,
            confidence: trace.confidence,
            tool_results: trace.tool_results.clone(),
            error: trace.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoveltyMeasurement {
    pub signals: Vec<NoveltySignal>,
    /// Combined single-event value in [0,1].
    pub tick: f64,
}

impl NoveltyMeasurement {
    pub fn has(&self, kind: SignalKind) -> bool {
        self.signals.iter().any(|s| s.kind == kind)
    }
}

#[derive(Debug, Clone)]
pub struct NoveltyDetector {
    baseline_confidence: f64,
}

impl NoveltyDetector {
    pub fn new(baseline_confidence: f64) -> Self {
        Self { baseline_confidence }
    }

    pub fn measure(&self, obs: &Observation) -> NoveltyMeasurement {
        let mut signals = Vec::new();

        if let Some(expected) = obs.expected_success {
            if expected != obs.success {
                signals.push(NoveltySignal {
                    kind: SignalKind::PredictionError,
                    magnitude: if obs.success { 0.6 } else { 0.8 },
                    evidence: format!("expected {}, got {}", outcome_word(expected), outcome_word(obs.success)),
                });
            }
        }

        if !obs.success {
            signals.push(NoveltySignal {
                kind: SignalKind::ExecutionFailure,
                magnitude: 0.9,
                evidence: obs.error.clone().unwrap_or_else(|| "execution failed".into()),
            });
        }

        if obs.confidence < self.baseline_confidence {
            signals.push(NoveltySignal {
                kind: SignalKind::LowConfidence,
                magnitude: (1.0 - obs.confidence).clamp(0.0, 1.0),
                evidence: format!("confidence {:.2} below {:.2}", obs.confidence, self.baseline_confidence),
            });
        }

        for tool in obs.tool_results.iter().filter(|t| !t.success) {
            signals.push(NoveltySignal {
                kind: SignalKind::ToolFailure,
                magnitude: 0.7,
                evidence: format!("tool '{}' failed", tool.name),
            });
        }

        if obs.success && obs.confidence < 0.4 {
            signals.push(NoveltySignal {
                kind: SignalKind::UnexpectedSuccess,
                magnitude: 0.5,
                evidence: format!("succeeded at confidence {:.2}", obs.confidence),
            });
        }

        let tick = combine(&signals);
        NoveltyMeasurement { signals, tick }
    }
}

/// Mean magnitude plus 0.1 per signal (bonus capped at 0.3), capped at 1.0.
pub fn combine(signals: &[NoveltySignal]) -> f64 {
    if signals.is_empty() {
        return QUIET_TICK;
    }
    let mean = signals.iter().map(|s| s.magnitude).sum::<f64>() / signals.len() as f64;
    let bonus = (0.1 * signals.len() as f64).min(0.3);
    (mean + bonus).min(1.0)
}

fn outcome_word(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}
