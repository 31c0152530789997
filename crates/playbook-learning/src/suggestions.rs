//! Cross-hemisphere suggestion rules.
//!
//! A bullet that keeps helping one agent is offered to the other. Offers are
//! generated after successful outcomes and delivered only while the
//! controller is quiet, landing QUARANTINED in the target group so they earn
//! their own outcomes there.

use playbook_controller::{ConsciousnessMetrics, Mode};
use playbook_core::config::SuggestionConfig;
use playbook_core::{Bullet, BulletStatus, Group};
use playbook_store::{tokenize, word_overlap};
use serde::Serialize;
use std::collections::BTreeSet;

/// Confidence a delivered suggestion starts with in its new group.
pub const DELIVERED_CONFIDENCE: f64 = 0.5;

const NEGATIVE_MARKERS: &[&str] = &["never", "do not", "don t", "avoid", "must not"];
const POSITIVE_MARKERS: &[&str] = &["must", "always", "required"];
/// Words that carry polarity only; ignored when comparing content.
const MARKER_WORDS: &[&str] = &["never", "do", "don", "t", "not", "avoid", "must", "always", "required"];

/// How busy the controller is right now.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TickProfile {
    pub is_idle: bool,
    /// Execution pressure in [0,1].
    pub pressure: f64,
}

impl TickProfile {
    /// A quiet controller: used when no live metrics are supplied.
    pub fn idle() -> Self {
        Self { is_idle: true, pressure: 0.0 }
    }

    /// Idle means exploiting at or under `idle_tick_rate`. Pressure is the
    /// larger of the smoothed tick rate and retrieval entropy.
    pub fn from_metrics(metrics: &ConsciousnessMetrics, idle_tick_rate: f64) -> Self {
        Self {
            is_idle: metrics.mode == Mode::Exploit && metrics.tick_rate <= idle_tick_rate,
            pressure: metrics.tick_rate.max(metrics.entropy).clamp(0.0, 1.0),
        }
    }
}

/// Delivery gate: enabled, idle when required, and under the pressure ceiling.
pub fn can_deliver(profile: &TickProfile, config: &SuggestionConfig) -> bool {
    if !config.enabled {
        return false;
    }
    if config.deliver_when_idle && !profile.is_idle {
        return false;
    }
    profile.pressure <= config.max_pressure_to_deliver
}

/// Whether `bullet` has proven itself enough to offer to the other side.
pub fn should_suggest(bullet: &Bullet, config: &SuggestionConfig) -> bool {
    bullet.group.is_agent()
        && bullet.status == BulletStatus::Active
        && bullet.helpful_count >= config.suggest_threshold
        && bullet.harmful_count <= config.harmful_tolerance
        && bullet.confidence >= config.min_suggest_confidence
}

/// Some live bullet in `existing` says the same thing as `text`.
pub fn equivalent_in(text: &str, existing: &[Bullet], threshold: f64) -> bool {
    existing
        .iter()
        .filter(|b| b.status != BulletStatus::Deprecated)
        .any(|b| word_overlap(text, &b.text) >= threshold)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Polarity {
    Negative,
    Positive,
    Neutral,
}

fn polarity(text: &str) -> Polarity {
    let padded = format!(" {} ", tokenize(text).join(" "));
    let has = |markers: &[&str]| markers.iter().any(|m| padded.contains(&format!(" {m} ")));
    if has(NEGATIVE_MARKERS) {
        Polarity::Negative
    } else if has(POSITIVE_MARKERS) {
        Polarity::Positive
    } else {
        Polarity::Neutral
    }
}

fn content_words(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().filter(|w| !MARKER_WORDS.contains(&w.as_str())).collect()
}

/// Flags advice that says the opposite of something already held.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    enabled: bool,
    similarity_threshold: f64,
}

impl ConflictDetector {
    pub fn new(config: &SuggestionConfig) -> Self {
        Self { enabled: config.conflicts_enabled, similarity_threshold: config.conflict_similarity }
    }

    /// Same subject (content-word overlap at or above the threshold) with
    /// opposite polarity.
    pub fn conflicts(&self, a: &str, b: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let opposed = matches!(
            (polarity(a), polarity(b)),
            (Polarity::Negative, Polarity::Positive) | (Polarity::Positive, Polarity::Negative)
        );
        if !opposed {
            return false;
        }
        let (wa, wb) = (content_words(a), content_words(b));
        let union = wa.union(&wb).count();
        union > 0 && wa.intersection(&wb).count() as f64 / union as f64 >= self.similarity_threshold
    }

    /// Ids of live bullets in `existing` that conflict with `text`.
    pub fn find_conflicts(&self, text: &str, existing: &[Bullet]) -> Vec<String> {
        existing
            .iter()
            .filter(|b| b.status != BulletStatus::Deprecated && self.conflicts(text, &b.text))
            .map(|b| b.id.clone())
            .collect()
    }
}

/// What one delivery pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    /// The gate was closed; nothing was looked at.
    pub gated: bool,
    pub expired: usize,
    pub delivered: Vec<DeliveredSuggestion>,
    pub rejected: Vec<RejectedSuggestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveredSuggestion {
    pub suggestion_id: String,
    pub bullet_id: String,
    pub to_side: Group,
    pub conflicts_with: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedSuggestion {
    pub suggestion_id: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use playbook_core::BulletKind;

    fn enabled() -> SuggestionConfig {
        SuggestionConfig { enabled: true, ..SuggestionConfig::default() }
    }

    fn proven(helpful: u32, harmful: u32, confidence: f64) -> Bullet {
        let mut b = Bullet::new("Check the exit code", Group::Left, BulletKind::Heuristic, vec![], confidence, BulletStatus::Active);
        b.helpful_count = helpful;
        b.harmful_count = harmful;
        b
    }

    #[test]
    fn suggestion_needs_a_proven_active_agent_bullet() {
        let cfg = enabled();
        assert!(should_suggest(&proven(2, 0, 0.7), &cfg));
        assert!(!should_suggest(&proven(1, 0, 0.7), &cfg));
        assert!(!should_suggest(&proven(5, 1, 0.7), &cfg));
        assert!(!should_suggest(&proven(5, 0, 0.6), &cfg));

        let mut quarantined = proven(5, 0, 0.9);
        quarantined.status = BulletStatus::Quarantined;
        assert!(!should_suggest(&quarantined, &cfg));
        let mut shared = proven(5, 0, 0.9);
        shared.group = Group::Shared;
        assert!(!should_suggest(&shared, &cfg));
    }

    #[test]
    fn delivery_gate_follows_idle_and_pressure() {
        let cfg = enabled();
        assert!(can_deliver(&TickProfile::idle(), &cfg));
        assert!(!can_deliver(&TickProfile { is_idle: false, pressure: 0.1 }, &cfg));
        assert!(!can_deliver(&TickProfile { is_idle: true, pressure: 0.5 }, &cfg));

        let anytime = SuggestionConfig { deliver_when_idle: false, ..enabled() };
        assert!(can_deliver(&TickProfile { is_idle: false, pressure: 0.2 }, &anytime));
        assert!(!can_deliver(&TickProfile::idle(), &SuggestionConfig::default()));
    }

    #[test]
    fn profile_reads_controller_mode_and_pressure() {
        use playbook_controller::MetaController;
        use playbook_core::config::ControllerConfig;

        let mut m = MetaController::new(ControllerConfig::default()).metrics();
        m.mode = Mode::Exploit;
        m.tick_rate = 0.1;
        m.entropy = 0.05;
        let p = TickProfile::from_metrics(&m, 0.2);
        assert!(p.is_idle);
        assert!((p.pressure - 0.1).abs() < 1e-9);

        m.entropy = 0.6;
        assert!((TickProfile::from_metrics(&m, 0.2).pressure - 0.6).abs() < 1e-9);
        m.mode = Mode::Explore;
        assert!(!TickProfile::from_metrics(&m, 0.2).is_idle);
    }

    #[test]
    fn opposite_polarity_on_the_same_subject_conflicts() {
        let d = ConflictDetector::new(&enabled());
        assert!(d.conflicts("Always retry the upload on timeout", "Never retry the upload on timeout"));
        assert!(d.conflicts("You must not cache auth tokens", "You must cache auth tokens"));
        assert!(!d.conflicts("Always retry the upload on timeout", "Always retry the upload on timeout"));
        assert!(!d.conflicts("Always retry the upload", "Never log secrets to stdout"));

        let off = ConflictDetector::new(&SuggestionConfig { conflicts_enabled: false, ..enabled() });
        assert!(!off.conflicts("Always retry the upload on timeout", "Never retry the upload on timeout"));
    }

    #[test]
    fn equivalence_ignores_deprecated_bullets() {
        let mut b = proven(3, 0, 0.8);
        assert!(equivalent_in("check the EXIT code", std::slice::from_ref(&b), 0.9));
        b.status = BulletStatus::Deprecated;
        assert!(!equivalent_in("check the exit code", &[b], 0.9));
    }
}
