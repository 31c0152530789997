//! Curator: the only path from insights into the store.
//!
//! Insights are filtered, checked against every collection for a near
//! duplicate, then either folded into the existing bullet or created as
//! STAGED and routed by the hemisphere classifier.

use crate::classifier::{Classification, HemisphereClassifier};
use crate::dedup::{DedupReport, Deduplicator};
use crate::formatter::translate_for_shared;
use crate::pruner::{PruneOptions, PruneReport, Pruner};
use crate::suggestions::{
    can_deliver, equivalent_in, should_suggest, ConflictDetector, DeliveredSuggestion, DeliveryReport,
    RejectedSuggestion, TickProfile, DELIVERED_CONFIDENCE,
};
use chrono::Utc;
use playbook_core::config::{CurationConfig, SuggestionConfig};
use playbook_core::{Bullet, BulletKind, BulletStatus, Error, Group, Insight, Privilege, Result};
use playbook_store::{cosine, AuditStatus, BulletStore, Suggestion, SuggestionStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reviewer name recorded on classifier-driven assignments.
pub const AUTO_REVIEWER: &str = "auto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewPriority {
    High,
    Medium,
}

impl ReviewPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewPriority::High => "high",
            ReviewPriority::Medium => "medium",
        }
    }
}

impl fmt::Display for ReviewPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(ReviewPriority::High),
            "medium" => Ok(ReviewPriority::Medium),
            other => Err(format!("unknown review priority: {other}")),
        }
    }
}

/// Where a freshly staged bullet ended up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "routing", rename_all = "snake_case")]
pub enum Routing {
    Assigned { group: Group, confidence: f64, audit_required: bool },
    Staged { priority: ReviewPriority, suggestion: Group, confidence: f64 },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CurationReport {
    /// New bullets, whatever their routing.
    pub created: Vec<String>,
    /// Existing bullets that absorbed a duplicate insight.
    pub merged: Vec<String>,
    pub filtered: usize,
    pub assigned: Vec<String>,
    pub staged_for_review: Vec<String>,
}

pub struct Curator {
    store: Arc<BulletStore>,
    classifier: Arc<HemisphereClassifier>,
    deduplicator: Deduplicator,
    pruner: Pruner,
    config: CurationConfig,
    suggestions: SuggestionConfig,
}

impl Curator {
    pub fn new(
        store: Arc<BulletStore>,
        classifier: Arc<HemisphereClassifier>,
        deduplicator: Deduplicator,
        pruner: Pruner,
        config: CurationConfig,
    ) -> Self {
        Self { store, classifier, deduplicator, pruner, config, suggestions: SuggestionConfig::default() }
    }

    /// Cross-hemisphere suggestion settings. Off by default.
    pub fn with_suggestions(mut self, suggestions: SuggestionConfig) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn suggestion_config(&self) -> &SuggestionConfig {
        &self.suggestions
    }

    pub fn config(&self) -> &CurationConfig {
        &self.config
    }

    pub fn pruner(&self) -> &Pruner {
        &self.pruner
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.deduplicator
    }

    pub async fn curate(&self, insights: &[Insight], source_group: Group, trace_id: Option<&str>) -> Result<CurationReport> {
        let mut report = CurationReport::default();

        for insight in insights {
            let text = insight.text.trim();
            if insight.confidence < self.config.min_confidence || text.chars().count() < self.config.min_text_len {
                debug!(confidence = insight.confidence, len = text.len(), "insight filtered");
                report.filtered += 1;
                continue;
            }

            if let Some((id, similarity)) = self.find_duplicate(text) {
                self.store.absorb(&id, insight.confidence, &insight.tags, trace_id)?;
                debug!(%id, similarity, "insight merged into existing bullet");
                report.merged.push(id);
                continue;
            }

            let bullet = self.store.create(
                text,
                source_group,
                insight.kind,
                insight.tags.clone(),
                insight.confidence,
                trace_id.map(str::to_string),
                Privilege::Normal,
            )?;
            if !insight.evidence.is_empty() {
                let mut evidence = Map::new();
                evidence.insert("evidence".into(), json!(insight.evidence));
                self.store.annotate(&bullet.id, evidence)?;
            }
            report.created.push(bullet.id.clone());

            match self.route(&bullet.id, &bullet.text, bullet.kind, Some(source_group)).await? {
                Routing::Assigned { .. } => report.assigned.push(bullet.id),
                Routing::Staged { .. } => report.staged_for_review.push(bullet.id),
            }
        }

        info!(
            created = report.created.len(),
            merged = report.merged.len(),
            filtered = report.filtered,
            assigned = report.assigned.len(),
            staged = report.staged_for_review.len(),
            "curation complete"
        );
        Ok(report)
    }

    /// Best non-deprecated match at or above the duplicate threshold, across
    /// every collection.
    pub fn find_duplicate(&self, text: &str) -> Option<(String, f64)> {
        let vector = self.store.embed(text);
        let mut best: Option<(String, f64)> = None;
        for group in Group::ALL {
            for (bullet, v) in self.store.collection(group).snapshot() {
                if bullet.status == BulletStatus::Deprecated {
                    continue;
                }
                let sim = cosine(&vector, &v);
                if sim >= self.config.duplicate_threshold && best.as_ref().map_or(true, |(_, s)| sim > *s) {
                    best = Some((bullet.id, sim));
                }
            }
        }
        best
    }

    /// Classify a staged bullet and apply the routing bands.
    pub async fn route(&self, id: &str, text: &str, kind: BulletKind, hint: Option<Group>) -> Result<Routing> {
        let classification = self.classifier.classify(text, kind, hint).await;
        self.apply_classification(id, &classification)
    }

    pub fn apply_classification(&self, id: &str, c: &Classification) -> Result<Routing> {
        let bands = self.classifier.config();
        let assignable = !c.ambiguous && c.group.is_agent() && c.confidence >= bands.manual_review_threshold;

        if assignable {
            let audit_required = c.confidence < bands.auto_assign_threshold;
            let mut extra = Map::new();
            extra.insert("classifier_confidence".into(), json!(c.confidence));
            extra.insert("classifier_reasoning".into(), json!(c.reasoning));
            if audit_required {
                extra.insert("audit_required".into(), Value::Bool(true));
            }
            self.store.assign_staged(id, c.group, AUTO_REVIEWER, extra)?;
            return Ok(Routing::Assigned { group: c.group, confidence: c.confidence, audit_required });
        }

        let priority = if c.ambiguous || c.confidence < 0.5 { ReviewPriority::High } else { ReviewPriority::Medium };
        let mut notes = Map::new();
        notes.insert("review_priority".into(), json!(priority));
        notes.insert("classifier_suggestion".into(), json!(c.group));
        notes.insert("classifier_confidence".into(), json!(c.confidence));
        notes.insert("classifier_reasoning".into(), json!(c.reasoning));
        self.store.annotate(id, notes)?;
        debug!(id, %priority, suggestion = %c.group, "left in staging for review");
        Ok(Routing::Staged { priority, suggestion: c.group, confidence: c.confidence })
    }

    /// Staged bullets, oldest first, optionally filtered by review priority.
    pub fn list_staged(&self, priority: Option<ReviewPriority>) -> Vec<Bullet> {
        self.store
            .list(Group::Staging, Some(BulletStatus::Staged), None)
            .into_iter()
            .filter(|b| {
                priority.map_or(true, |p| b.meta_str("review_priority").and_then(|s| s.parse().ok()) == Some(p))
            })
            .collect()
    }

    pub fn prune_low_quality(&self, group: Group, options: &PruneOptions) -> Result<PruneReport> {
        self.pruner.prune(group, options)
    }

    pub fn deduplicate(&self, groups: &[Group], threshold: Option<f64>, dry_run: bool) -> Result<DedupReport> {
        self.deduplicator.run(groups, threshold, dry_run, "curator")
    }

    /// Copy every eligible ACTIVE bullet of `group` into shared. Returns the
    /// new shared copies.
    pub fn promote_eligible(&self, group: Group) -> Result<Vec<Bullet>> {
        if !group.is_agent() {
            return Err(Error::invariant(format!("only left and right bullets are promoted, not {group}")));
        }
        let mut promoted = Vec::new();
        for bullet in self.store.list(group, Some(BulletStatus::Active), None) {
            if !self.store.promotion_eligible(&bullet) {
                continue;
            }
            let text = self.config.translate_on_promote.then(|| translate_for_shared(&bullet.text));
            match self.store.promote(&bullet.id, text) {
                Ok(copy) => promoted.push(copy),
                Err(Error::InvariantViolation(msg)) => warn!(id = %bullet.id, "promotion skipped: {}", msg),
                Err(e) => return Err(e),
            }
        }
        if !promoted.is_empty() {
            info!(%group, promoted = promoted.len(), "promotion pass complete");
        }
        Ok(promoted)
    }

    // ============================================================
    // Cross-hemisphere suggestions
    // ============================================================

    /// Offer proven bullets of `from` to `to` (the other agent group by
    /// default). Skips anything shared already holds, anything the target
    /// already says, and origins with a suggestion still in flight. Stops at
    /// `max_pending` pending suggestions.
    pub fn generate_suggestions(
        &self,
        bullets: &[Bullet],
        from: Group,
        to: Option<Group>,
        reason: &str,
    ) -> Result<Vec<Suggestion>> {
        let cfg = &self.suggestions;
        if !cfg.enabled {
            return Ok(Vec::new());
        }
        let Some(target) = to.or_else(|| from.other()).filter(|t| t.is_agent() && *t != from) else {
            return Ok(Vec::new());
        };
        let pending = self.store.suggestions();
        let at_cap = || cfg.max_pending > 0 && pending.count(Some(SuggestionStatus::Pending)) >= cfg.max_pending;
        if at_cap() {
            debug!(max_pending = cfg.max_pending, "suggestion queue full");
            return Ok(Vec::new());
        }

        let shared = self.store.list(Group::Shared, None, None);
        let in_target = self.store.list(target, None, None);
        let mut created = Vec::new();
        for bullet in bullets.iter().filter(|b| b.group == from) {
            if at_cap() {
                break;
            }
            if !should_suggest(bullet, cfg)
                || equivalent_in(&bullet.text, &shared, cfg.equivalence_threshold)
                || equivalent_in(&bullet.text, &in_target, cfg.equivalence_threshold)
                || pending.exists_active(&bullet.id, target)
            {
                continue;
            }
            created.push(pending.create(Suggestion::from_bullet(bullet, target, reason))?);
        }

        if !created.is_empty() {
            let ids: Vec<&str> = created.iter().map(|s| s.suggestion_id.as_str()).collect();
            self.store.audit().append(
                "suggested",
                AuditStatus::Ok,
                "curator",
                json!({ "from": from, "to": target, "reason": reason, "ids": ids }),
            )?;
            info!(%from, to = %target, created = created.len(), "suggestions generated");
        }
        Ok(created)
    }

    /// Deliver up to `limit` pending suggestions (the per-tick budget by
    /// default) when `profile` passes the delivery gate. Each lands
    /// QUARANTINED in its target with its origin recorded; conflicts with
    /// bullets already there are flagged, not blocked.
    pub fn deliver_suggestions(
        &self,
        profile: &TickProfile,
        to_side: Option<Group>,
        limit: Option<usize>,
    ) -> Result<DeliveryReport> {
        let cfg = &self.suggestions;
        let mut report = DeliveryReport::default();
        if !can_deliver(profile, cfg) {
            report.gated = true;
            return Ok(report);
        }
        let limit = limit.unwrap_or(cfg.deliver_budget_per_tick);
        let pending = self.store.suggestions();
        report.expired = pending.expire_old(cfg.expiry_days, Utc::now())?;
        let detector = ConflictDetector::new(cfg);

        for suggestion in pending.list_pending(to_side) {
            if report.delivered.len() >= limit {
                break;
            }
            let target = suggestion.to_side;
            let reject = if target == suggestion.from_side || !target.is_agent() {
                Some("invalid_target")
            } else {
                let existing = self.store.list(target, None, None);
                equivalent_in(&suggestion.suggested_text, &existing, cfg.equivalence_threshold)
                    .then_some("duplicate_in_target")
            };
            if let Some(reason) = reject {
                pending.resolve(&suggestion.suggestion_id, false, reason)?;
                debug!(id = %suggestion.suggestion_id, reason, "suggestion rejected");
                report.rejected.push(RejectedSuggestion { suggestion_id: suggestion.suggestion_id, reason: reason.into() });
                continue;
            }

            let existing = self.store.list(target, None, None);
            let conflicts = detector.find_conflicts(&suggestion.suggested_text, &existing);
            let bullet = self.store.create(
                &suggestion.suggested_text,
                target,
                suggestion.kind,
                suggestion.tags.clone(),
                DELIVERED_CONFIDENCE,
                suggestion.trace_ids.first().cloned(),
                Privilege::Bootstrap,
            )?;
            let mut meta = Map::new();
            meta.insert("suggestion_id".into(), json!(suggestion.suggestion_id));
            meta.insert("origin_bullet_id".into(), json!(suggestion.origin_bullet_id));
            meta.insert("taught_from".into(), json!(suggestion.from_side));
            if !conflicts.is_empty() {
                meta.insert("conflicts_with".into(), json!(conflicts));
                meta.insert("conflict_flag".into(), Value::Bool(true));
                warn!(id = %bullet.id, conflicts = ?conflicts, "delivered suggestion conflicts with existing bullets");
            }
            self.store.annotate(&bullet.id, meta)?;
            pending.mark_delivered(&suggestion.suggestion_id, &bullet.id)?;
            report.delivered.push(DeliveredSuggestion {
                suggestion_id: suggestion.suggestion_id,
                bullet_id: bullet.id,
                to_side: target,
                conflicts_with: conflicts,
            });
        }

        if !report.delivered.is_empty() {
            self.store.audit().append("suggestions_delivered", AuditStatus::Ok, "curator", json!(report))?;
            info!(delivered = report.delivered.len(), rejected = report.rejected.len(), "suggestions delivered");
        }
        Ok(report)
    }
}
