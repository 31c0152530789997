//! Quality analysis: prune candidates and score distribution.

use chrono::{DateTime, Utc};
use playbook_core::config::PrunePolicy;
use playbook_core::{Bullet, BulletStatus};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneReason {
    HarmfulRatio,
    NeverUsed,
    QuarantineExpired,
    LowConfidence,
}

impl PruneReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HarmfulRatio => "harmful_ratio",
            Self::NeverUsed => "never_used",
            Self::QuarantineExpired => "quarantine_expired",
            Self::LowConfidence => "low_confidence",
        }
    }
}

/// Numeric limits behind a named policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyThresholds {
    /// Prune when harmful > helpful * ratio.
    pub harmful_ratio: f64,
    pub never_used_days: i64,
    pub quarantine_expiry_days: i64,
    pub low_confidence_days: i64,
    pub low_confidence: f64,
}

impl PolicyThresholds {
    pub fn for_policy(policy: PrunePolicy, low_confidence: f64) -> Self {
        let (harmful_ratio, never_used_days, quarantine_expiry_days, low_confidence_days) = match policy {
            PrunePolicy::Aggressive => (1.0, 7, 14, 7),
            PrunePolicy::Balanced => (1.5, 14, 30, 14),
            PrunePolicy::Conservative => (2.0, 30, 60, 30),
        };
        Self { harmful_ratio, never_used_days, quarantine_expiry_days, low_confidence_days, low_confidence }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneCandidate {
    pub bullet: Bullet,
    pub reasons: Vec<PruneReason>,
    pub quality: f64,
}

pub struct QualityAnalyzer {
    thresholds: PolicyThresholds,
}

impl QualityAnalyzer {
    pub fn new(policy: PrunePolicy, low_confidence: f64) -> Self {
        Self { thresholds: PolicyThresholds::for_policy(policy, low_confidence) }
    }

    pub fn thresholds(&self) -> &PolicyThresholds {
        &self.thresholds
    }

    /// Every reason `bullet` qualifies for pruning. Empty means keep.
    pub fn assess(&self, bullet: &Bullet, now: DateTime<Utc>) -> Vec<PruneReason> {
        let t = &self.thresholds;
        let age = bullet.age_days(now);
        let uses = bullet.uses();
        let mut reasons = Vec::new();

        if uses > 0 && bullet.harmful_count as f64 > bullet.helpful_count as f64 * t.harmful_ratio {
            reasons.push(PruneReason::HarmfulRatio);
        }
        if uses == 0 && age > t.never_used_days {
            reasons.push(PruneReason::NeverUsed);
        }
        if bullet.status == BulletStatus::Quarantined && age > t.quarantine_expiry_days {
            reasons.push(PruneReason::QuarantineExpired);
        }
        if bullet.confidence < t.low_confidence && uses == 0 && age > t.low_confidence_days {
            reasons.push(PruneReason::LowConfidence);
        }
        reasons
    }

    /// Prunable bullets, worst quality first. Staged and deprecated bullets
    /// are never candidates.
    pub fn candidates<'a>(&self, bullets: impl IntoIterator<Item = &'a Bullet>, now: DateTime<Utc>) -> Vec<PruneCandidate> {
        let mut out: Vec<PruneCandidate> = bullets
            .into_iter()
            .filter(|b| !matches!(b.status, BulletStatus::Staged | BulletStatus::Deprecated))
            .filter_map(|b| {
                let reasons = self.assess(b, now);
                (!reasons.is_empty()).then(|| PruneCandidate { bullet: b.clone(), reasons, quality: quality_score(b) })
            })
            .collect();
        out.sort_by(|a, b| a.quality.total_cmp(&b.quality).then_with(|| a.bullet.id.cmp(&b.bullet.id)));
        out
    }
}

/// Quality in [0,1]. Unused bullets score half their confidence.
pub fn quality_score(bullet: &Bullet) -> f64 {
    let uses = bullet.uses();
    if uses == 0 {
        return bullet.confidence * 0.5;
    }
    let usage = ((uses as f64).ln_1p() / 10.0).min(1.0);
    bullet.helpful_ratio() * 0.5 + usage * 0.3 + bullet.confidence * 0.2
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityDistribution {
    pub excellent: usize,
    pub good: usize,
    pub fair: usize,
    pub poor: usize,
    pub very_poor: usize,
    pub total: usize,
    pub mean: f64,
}

impl QualityDistribution {
    pub fn from_bullets<'a>(bullets: impl IntoIterator<Item = &'a Bullet>) -> Self {
        let mut d = Self::default();
        let mut sum = 0.0;
        for b in bullets {
            let q = quality_score(b);
            sum += q;
            d.total += 1;
            match q {
                q if q > 0.8 => d.excellent += 1,
                q if q > 0.6 => d.good += 1,
                q if q > 0.4 => d.fair += 1,
                q if q > 0.2 => d.poor += 1,
                _ => d.very_poor += 1,
            }
        }
        if d.total > 0 {
            d.mean = sum / d.total as f64;
        }
        d
    }
}
