//! Safe pruning of low-quality bullets.
//!
//! Order of work: analyze, enforce the per-run cap and confirmation rule,
//! write one backup of every candidate, then commit in batches. A failure
//! after the backup leaves a restorable state and an audit record.

use crate::quality::{PruneReason, QualityAnalyzer};
use chrono::Utc;
use playbook_core::config::{PrunePolicy, PruningConfig};
use playbook_core::{BulletStatus, Error, Group, Result};
use playbook_store::{AuditStatus, BackupManifest, BulletStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PruneOptions {
    pub policy: PrunePolicy,
    pub dry_run: bool,
    /// Required when the run exceeds the confirmation threshold.
    pub force: bool,
    pub actor: String,
}

impl PruneOptions {
    pub fn new(policy: PrunePolicy) -> Self {
        Self { policy, dry_run: false, force: false, actor: "pruner".into() }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrunedEntry {
    pub id: String,
    pub reasons: Vec<PruneReason>,
    pub quality: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneReport {
    pub group: Group,
    pub policy: PrunePolicy,
    pub candidates: Vec<PrunedEntry>,
    /// Ids actually deprecated or removed. Empty on a dry run.
    pub pruned: Vec<String>,
    pub backup_id: Option<String>,
    pub dry_run: bool,
    /// Records were removed rather than deprecated.
    pub hard_delete: bool,
}

pub struct Pruner {
    store: Arc<BulletStore>,
    config: PruningConfig,
}

impl Pruner {
    pub fn new(store: Arc<BulletStore>, config: PruningConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &PruningConfig {
        &self.config
    }

    pub fn prune(&self, group: Group, options: &PruneOptions) -> Result<PruneReport> {
        if group == Group::Staging {
            return Err(Error::invariant("staging is excluded from pruning"));
        }

        let analyzer = QualityAnalyzer::new(options.policy, self.config.low_confidence_threshold);
        let bullets = self.store.collection(group).bullets();
        let mut candidates = analyzer.candidates(&bullets, Utc::now());
        candidates.truncate(self.config.max_prune_per_run);

        let mut report = PruneReport {
            group,
            policy: options.policy,
            candidates: candidates
                .iter()
                .map(|c| PrunedEntry { id: c.bullet.id.clone(), reasons: c.reasons.clone(), quality: c.quality })
                .collect(),
            pruned: Vec::new(),
            backup_id: None,
            dry_run: options.dry_run,
            hard_delete: self.config.hard_delete,
        };

        if candidates.is_empty() || options.dry_run {
            info!(%group, candidates = candidates.len(), dry_run = options.dry_run, "prune analysis");
            return Ok(report);
        }
        if candidates.len() > self.config.require_confirmation_threshold && !options.force {
            return Err(Error::ConfirmationRequired {
                count: candidates.len(),
                threshold: self.config.require_confirmation_threshold,
            });
        }

        let guard = self.store.collection(group).lock_exclusive()?;
        // Re-read under the lock; drop anything changed out from under us.
        let live: Vec<_> = candidates
            .into_iter()
            .filter_map(|c| guard.get(&c.bullet.id).filter(|b| b.status != BulletStatus::Deprecated).map(|b| (b, c.reasons)))
            .collect();
        if live.is_empty() {
            return Ok(report);
        }

        let snapshot: Vec<_> = live.iter().map(|(b, _)| b.clone()).collect();
        let manifest = self
            .store
            .backups()
            .write(&snapshot, &format!("prune: {}", policy_name(options.policy)), &options.actor)?;
        report.backup_id = Some(manifest.backup_id.clone());

        let now = Utc::now().to_rfc3339();
        for batch in live.chunks(self.config.batch_size.max(1)) {
            for (bullet, reasons) in batch {
                if self.config.hard_delete {
                    guard.remove(&bullet.id);
                } else {
                    let mut b = bullet.clone();
                    b.status = BulletStatus::Deprecated;
                    b.set_meta("pruned_at", now.clone());
                    b.set_meta("prune_reasons", reasons.iter().map(|r| r.as_str()).collect::<Vec<_>>());
                    b.set_meta("backup_id", manifest.backup_id.clone());
                    guard.replace(b)?;
                }
            }
            if let Err(e) = guard.flush() {
                drop(guard);
                self.audit_failure(group, &manifest, &options.actor, &e);
                return Err(e);
            }
            report.pruned.extend(batch.iter().map(|(b, _)| b.id.clone()));
        }
        drop(guard);

        self.store.audit().append(
            "pruned",
            AuditStatus::Ok,
            &options.actor,
            serde_json::json!({
                "group": group,
                "policy": options.policy,
                "hard_delete": self.config.hard_delete,
                "ids": report.pruned,
                "reasons": report.candidates,
                "backup_id": manifest.backup_id,
            }),
        )?;
        info!(%group, pruned = report.pruned.len(), backup = %manifest.backup_id, "prune complete");
        Ok(report)
    }

    pub fn list_backups(&self) -> Result<Vec<BackupManifest>> {
        self.store.backups().list()
    }

    pub fn rollback(&self, backup_id: &str, actor: &str) -> Result<BackupManifest> {
        self.store.rollback(backup_id, actor)
    }

    pub fn restore_bullets(&self, ids: &[String], actor: &str) -> Result<Vec<String>> {
        self.store.restore_bullets(ids, actor)
    }

    fn audit_failure(&self, group: Group, manifest: &BackupManifest, actor: &str, error: &Error) {
        warn!(%group, backup = %manifest.backup_id, "prune failed after backup: {}", error);
        let data = serde_json::json!({ "group": group, "backup_id": manifest.backup_id, "error": error.to_string() });
        if let Err(e) = self.store.audit().append("pruned", AuditStatus::Failed, actor, data) {
            warn!("Failed to audit prune failure: {}", e);
        }
    }
}

fn policy_name(policy: PrunePolicy) -> &'static str {
    match policy {
        PrunePolicy::Aggressive => "aggressive",
        PrunePolicy::Balanced => "balanced",
        PrunePolicy::Conservative => "conservative",
    }
}
