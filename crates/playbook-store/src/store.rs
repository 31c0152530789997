//! BulletStore - persistent collections plus the lifecycle rules that guard them.
//!
//! `record_outcome` is the only path that touches helpful/harmful counts.
//! Every destructive operation writes a backup before it mutates anything.

use crate::audit::{AuditLog, AuditStatus};
use crate::backup::{write_json_atomic, BackupManifest, BackupStore};
use crate::collection::{Collection, ExclusiveGuard};
use crate::embedding::Embedder;
use crate::suggestion::SuggestionStore;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use playbook_core::config::LifecycleConfig;
use playbook_core::{Bullet, BulletKind, BulletStatus, Error, Group, Privilege, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// What a `record_outcome` call did, per bullet id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutcomeReport {
    pub applied: Vec<String>,
    /// Already applied under the same outcome id.
    pub duplicates: Vec<String>,
    pub missing: Vec<String>,
    /// Moved QUARANTINED -> ACTIVE by this call.
    pub activated: Vec<String>,
    /// Shared copies created by this call.
    pub promoted: Vec<String>,
}

/// Bullet counts per group and status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub groups: BTreeMap<Group, BTreeMap<String, usize>>,
    pub total: usize,
}

/// Applied `(outcome_id, bullet_id)` pairs with the time they were applied,
/// persisted as `outcomes.json`. Entries older than the retention window are
/// forgotten on open and on every flush.
struct OutcomeLedger {
    path: PathBuf,
    applied: DashMap<String, DateTime<Utc>>,
    retention: Option<Duration>,
    flush_lock: Mutex<()>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LedgerFile {
    Stamped(BTreeMap<String, DateTime<Utc>>),
    /// Bare key list; entries are stamped with the load time.
    Keys(Vec<String>),
}

impl OutcomeLedger {
    fn open(path: PathBuf, retention_days: u32) -> Result<Self> {
        let applied = DashMap::new();
        match std::fs::read(&path) {
            Ok(bytes) => {
                let file: LedgerFile = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::store(format!("corrupt outcome ledger {}: {}", path.display(), e)))?;
                match file {
                    LedgerFile::Stamped(entries) => {
                        for (key, at) in entries {
                            applied.insert(key, at);
                        }
                    }
                    LedgerFile::Keys(keys) => {
                        let now = Utc::now();
                        for key in keys {
                            applied.insert(key, now);
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let retention = (retention_days > 0).then(|| Duration::days(i64::from(retention_days)));
        let ledger = Self { path, applied, retention, flush_lock: Mutex::new(()) };
        ledger.expire(Utc::now());
        Ok(ledger)
    }

    /// Atomically claim a key. False if it was already applied.
    fn claim(&self, key: &str) -> bool {
        match self.applied.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                true
            }
        }
    }

    fn release(&self, key: &str) {
        self.applied.remove(key);
    }

    /// Drop entries past the retention window. Returns how many were dropped.
    fn expire(&self, now: DateTime<Utc>) -> usize {
        let Some(retention) = self.retention else { return 0 };
        let cutoff = now - retention;
        let before = self.applied.len();
        self.applied.retain(|_, at| *at >= cutoff);
        let dropped = before.saturating_sub(self.applied.len());
        if dropped > 0 {
            debug!(dropped, "outcome ledger entries expired");
        }
        dropped
    }

    fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().map_err(|_| Error::store("ledger lock poisoned"))?;
        self.expire(Utc::now());
        let entries: BTreeMap<String, DateTime<Utc>> =
            self.applied.iter().map(|e| (e.key().clone(), *e.value())).collect();
        write_json_atomic(&self.path, &entries)
    }

    fn len(&self) -> usize {
        self.applied.len()
    }
}

pub struct BulletStore {
    root: PathBuf,
    lifecycle: LifecycleConfig,
    embedder: Arc<dyn Embedder>,
    collections: BTreeMap<Group, Collection>,
    ledger: OutcomeLedger,
    backups: BackupStore,
    audit: AuditLog,
    suggestions: SuggestionStore,
}

impl BulletStore {
    /// Open (or initialize) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, lifecycle: LifecycleConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let root = root.into();
        let collections_dir = root.join("collections");
        std::fs::create_dir_all(&collections_dir)?;

        let mut collections = BTreeMap::new();
        for group in Group::ALL {
            collections.insert(group, Collection::open(&collections_dir, group, embedder.as_ref())?);
        }

        let store = Self {
            ledger: OutcomeLedger::open(root.join("outcomes.json"), lifecycle.outcome_retention_days)?,
            backups: BackupStore::new(root.join("backups"))?,
            audit: AuditLog::new(root.join("audit.jsonl")),
            suggestions: SuggestionStore::open(root.join("suggestions.jsonl"))?,
            root,
            lifecycle,
            embedder,
            collections,
        };
        store.reconcile_staging()?;
        info!("Opened bullet store at {}", store.root.display());
        Ok(store)
    }

    /// An assignment interrupted between its two flushes leaves the bullet in
    /// both staging and its target. The target copy wins.
    fn reconcile_staging(&self) -> Result<()> {
        let staging = self.collection(Group::Staging).lock_exclusive()?;
        let mut dropped = 0;
        for bullet in self.collection(Group::Staging).bullets() {
            let assigned_elsewhere = Group::AGENTS.iter().any(|g| self.collection(*g).contains(&bullet.id));
            if assigned_elsewhere {
                staging.remove(&bullet.id);
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!("Dropped {} staging copies of already-assigned bullets", dropped);
            staging.flush()?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lifecycle(&self) -> &LifecycleConfig {
        &self.lifecycle
    }

    pub fn collection(&self, group: Group) -> &Collection {
        // Every group is opened in `open`.
        &self.collections[&group]
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn suggestions(&self) -> &SuggestionStore {
        &self.suggestions
    }

    /// Outcome keys currently remembered for idempotency.
    pub fn remembered_outcomes(&self) -> usize {
        self.ledger.len()
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        self.embedder.embed(text)
    }

    // ============================================================
    // Create / read
    // ============================================================

    /// Create a bullet. Normal callers land in staging as STAGED with `group`
    /// recorded as a hint; bootstrap callers go straight to `group` as QUARANTINED.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        text: &str,
        group: Group,
        kind: BulletKind,
        tags: Vec<String>,
        confidence: f64,
        source_trace_id: Option<String>,
        privilege: Privilege,
    ) -> Result<Bullet> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::invariant("bullet text must not be empty"));
        }
        if !confidence.is_finite() {
            return Err(Error::invariant("confidence must be a finite number"));
        }

        let (home, status) = match (privilege, group) {
            (Privilege::Normal, _) | (Privilege::Bootstrap, Group::Staging) => (Group::Staging, BulletStatus::Staged),
            (Privilege::Bootstrap, Group::Shared) => {
                return Err(Error::invariant("shared bullets are only created by promotion"));
            }
            (Privilege::Bootstrap, g) => (g, BulletStatus::Quarantined),
        };

        let mut bullet = Bullet::new(text, group, kind, tags, confidence, status);
        bullet.group = home;
        bullet.source_trace_id = source_trace_id;
        if home == Group::Staging && group != Group::Staging {
            bullet.set_meta("source_hemisphere", group.as_str());
        }

        let vector = self.embedder.embed(&bullet.text);
        let bullet = self.collection(home).insert(bullet, vector)?;
        debug!(id = %bullet.id, group = %home, status = %bullet.status, "bullet created");
        Ok(bullet)
    }

    pub fn locate(&self, id: &str) -> Option<Group> {
        Group::ALL.into_iter().find(|g| self.collection(*g).contains(id))
    }

    pub fn find(&self, id: &str) -> Option<Bullet> {
        self.locate(id).and_then(|g| self.collection(g).get(id))
    }

    pub fn get(&self, id: &str) -> Result<Bullet> {
        self.find(id).ok_or_else(|| Error::BulletNotFound(id.to_string()))
    }

    pub fn get_many(&self, ids: &[String]) -> Vec<Bullet> {
        ids.iter().filter_map(|id| self.find(id)).collect()
    }

    /// Bullets in `group`, oldest first.
    pub fn list(&self, group: Group, status: Option<BulletStatus>, limit: Option<usize>) -> Vec<Bullet> {
        let mut bullets: Vec<Bullet> = self
            .collection(group)
            .bullets()
            .into_iter()
            .filter(|b| status.map_or(true, |s| b.status == s))
            .collect();
        bullets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            bullets.truncate(limit);
        }
        bullets
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats::default();
        for group in Group::ALL {
            let entry = stats.groups.entry(group).or_default();
            for b in self.collection(group).bullets() {
                *entry.entry(b.status.to_string()).or_default() += 1;
                stats.total += 1;
            }
        }
        stats
    }

    // ============================================================
    // Lifecycle
    // ============================================================

    /// Plain status change, validated against the lifecycle state machine.
    /// Deprecation goes through [`deprecate`](Self::deprecate) and is backed up.
    pub fn update_status(&self, id: &str, next: BulletStatus) -> Result<Bullet> {
        if next == BulletStatus::Deprecated {
            return self.deprecate(id, "status change", "lifecycle");
        }
        let group = self.locate(id).ok_or_else(|| Error::BulletNotFound(id.to_string()))?;
        let quarantine_threshold = self.lifecycle.quarantine_threshold;
        self.collection(group).update(id, |b| {
            if b.status == next {
                return Ok(());
            }
            if b.status == BulletStatus::Staged && next == BulletStatus::Quarantined {
                return Err(Error::invariant("staged bullets enter a group only through assignment"));
            }
            if !b.status.can_transition_to(next) {
                return Err(Error::invalid_transition(&b.id, b.status, next));
            }
            if next == BulletStatus::Active && (b.helpful_count < quarantine_threshold || b.harmful_count > 0) {
                return Err(Error::invariant(format!(
                    "{} needs {} helpful and 0 harmful outcomes to activate (has {}/{})",
                    b.id, quarantine_threshold, b.helpful_count, b.harmful_count
                )));
            }
            b.status = next;
            b.set_meta(&format!("{}_at", next), Utc::now().to_rfc3339());
            Ok(())
        })
    }

    /// Mark one bullet DEPRECATED after writing a single-bullet backup.
    pub fn deprecate(&self, id: &str, reason: &str, actor: &str) -> Result<Bullet> {
        let group = self.locate(id).ok_or_else(|| Error::BulletNotFound(id.to_string()))?;
        let guard = self.collection(group).lock_exclusive()?;
        let current = guard.get(id).ok_or_else(|| Error::BulletNotFound(id.to_string()))?;
        if current.status == BulletStatus::Deprecated {
            return Ok(current);
        }
        if !current.status.can_transition_to(BulletStatus::Deprecated) {
            return Err(Error::invalid_transition(id, current.status, BulletStatus::Deprecated));
        }

        let manifest = self.backups.write(std::slice::from_ref(&current), &format!("deprecate: {reason}"), actor)?;
        let mut bullet = current;
        bullet.status = BulletStatus::Deprecated;
        bullet.set_meta("deprecated_at", Utc::now().to_rfc3339());
        bullet.set_meta("deprecate_reason", reason);
        bullet.set_meta("backup_id", manifest.backup_id.clone());
        guard.replace(bullet.clone())?;
        guard.flush()?;
        drop(guard);

        self.audit.append(
            "deprecated",
            AuditStatus::Ok,
            actor,
            serde_json::json!({ "id": id, "group": group, "reason": reason, "backup_id": manifest.backup_id }),
        )?;
        info!(id, group = %group, backup = %manifest.backup_id, "bullet deprecated");
        Ok(bullet)
    }

    /// Move a STAGED bullet into `target` as QUARANTINED.
    pub fn assign_staged(
        &self,
        id: &str,
        target: Group,
        reviewer: &str,
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Bullet> {
        if !target.is_agent() {
            return Err(Error::invariant(format!("staged bullets can only be assigned to left or right, not {target}")));
        }

        let guards = self.lock_groups(&[Group::Staging, target])?;
        let staging = guard_for(&guards, Group::Staging)?;
        let destination = guard_for(&guards, target)?;

        let mut bullet = staging.get(id).ok_or_else(|| Error::BulletNotFound(id.to_string()))?;
        if bullet.status != BulletStatus::Staged {
            return Err(Error::invalid_transition(id, bullet.status, BulletStatus::Quarantined));
        }
        let vector = self.collection(Group::Staging).vector(id).unwrap_or_else(|| self.embed(&bullet.text));

        bullet.group = target;
        bullet.status = BulletStatus::Quarantined;
        bullet.set_meta("assigned_by", reviewer);
        bullet.set_meta("assigned_at", Utc::now().to_rfc3339());
        bullet.metadata.remove("review_priority");
        for (k, v) in extra {
            bullet.metadata.insert(k, v);
        }

        destination.put(bullet.clone(), vector);
        destination.flush()?;
        staging.remove(id);
        staging.flush()?;
        drop(guards);

        self.audit.append(
            "staged_assigned",
            AuditStatus::Ok,
            reviewer,
            serde_json::json!({ "id": id, "group": target }),
        )?;
        info!(id, group = %target, reviewer, "staged bullet assigned");
        Ok(bullet)
    }

    /// Hard-delete a STAGED bullet after backing it up.
    pub fn reject_staged(&self, id: &str, reason: &str, reviewer: &str) -> Result<BackupManifest> {
        let staging = self.collection(Group::Staging).lock_exclusive()?;
        let bullet = staging.get(id).ok_or_else(|| Error::BulletNotFound(id.to_string()))?;
        if bullet.status != BulletStatus::Staged {
            return Err(Error::invariant(format!("{id} is {} and cannot be rejected", bullet.status)));
        }
        let manifest = self.backups.write(std::slice::from_ref(&bullet), &format!("reject: {reason}"), reviewer)?;
        staging.remove(id);
        staging.flush()?;
        drop(staging);

        self.audit.append(
            "staged_rejected",
            AuditStatus::Ok,
            reviewer,
            serde_json::json!({ "id": id, "reason": reason, "backup_id": manifest.backup_id }),
        )?;
        info!(id, reviewer, reason, "staged bullet rejected");
        Ok(manifest)
    }

    /// Apply one outcome signal to each bullet in `ids`.
    ///
    /// Idempotent per `(outcome_id, bullet_id)` within the ledger's retention
    /// window: retrying the same outcome never double counts, distinct
    /// outcome ids always add. The ledger is flushed even when the call fails
    /// part way, so counts already applied stay claimed.
    pub fn record_outcome(&self, outcome_id: &str, ids: &[String], helpful: bool) -> Result<OutcomeReport> {
        let mut report = OutcomeReport::default();
        let applied = self.apply_outcome(outcome_id, ids, helpful, &mut report);
        let flushed = self.ledger.flush();
        applied?;
        flushed?;
        Ok(report)
    }

    fn apply_outcome(&self, outcome_id: &str, ids: &[String], helpful: bool, report: &mut OutcomeReport) -> Result<()> {
        let threshold = self.lifecycle.quarantine_threshold;

        for id in ids {
            let key = format!("{outcome_id}:{id}");
            if !self.ledger.claim(&key) {
                report.duplicates.push(id.clone());
                continue;
            }

            let mut result = Err(Error::BulletNotFound(id.clone()));
            let mut activated = false;
            // One retry covers a bullet moving between collections mid-call.
            for _ in 0..2 {
                let Some(group) = self.locate(id) else { break };
                activated = false;
                result = self.collection(group).update(id, |b| {
                    if helpful {
                        b.helpful_count += 1;
                    } else {
                        b.harmful_count += 1;
                    }
                    b.last_used_at = Some(Utc::now());
                    if b.status == BulletStatus::Quarantined && b.helpful_count >= threshold && b.harmful_count == 0 {
                        b.status = BulletStatus::Active;
                        b.set_meta("active_at", Utc::now().to_rfc3339());
                        activated = true;
                    }
                    Ok(())
                });
                if !matches!(result, Err(Error::BulletNotFound(_))) {
                    break;
                }
            }

            match result {
                Ok(bullet) => {
                    report.applied.push(id.clone());
                    if activated {
                        info!(id = %bullet.id, helpful = bullet.helpful_count, "bullet activated");
                        report.activated.push(id.clone());
                    }
                    if self.lifecycle.auto_promote && self.promotion_eligible(&bullet) {
                        match self.promote(&bullet.id, None) {
                            Ok(copy) => report.promoted.push(copy.id),
                            Err(Error::InvariantViolation(msg)) => debug!(id = %bullet.id, "not promoted: {}", msg),
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(Error::BulletNotFound(_)) => {
                    self.ledger.release(&key);
                    report.missing.push(id.clone());
                }
                Err(e) => {
                    self.ledger.release(&key);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Whether `bullet` currently meets every promotion condition.
    pub fn promotion_eligible(&self, bullet: &Bullet) -> bool {
        bullet.group.is_agent()
            && bullet.status == BulletStatus::Active
            && bullet.helpful_count >= self.lifecycle.promote_threshold
            && bullet.harmful_count == 0
            && !self.collection(Group::Shared).contains(&Bullet::shared_id(&bullet.id))
    }

    /// Copy an ACTIVE agent-group bullet into shared. `text` overrides the
    /// copied wording (phrasing translation for the receiving group).
    pub fn promote(&self, id: &str, text: Option<String>) -> Result<Bullet> {
        let origin = self.get(id)?;
        if !origin.group.is_agent() {
            return Err(Error::invariant(format!("{id} is in {} and cannot be promoted", origin.group)));
        }
        if origin.harmful_count > 0 {
            return Err(Error::invariant(format!("{id} has {} harmful outcomes", origin.harmful_count)));
        }
        if origin.status != BulletStatus::Active {
            return Err(Error::invariant(format!("{id} is {}, only active bullets are promoted", origin.status)));
        }
        if origin.helpful_count < self.lifecycle.promote_threshold {
            return Err(Error::invariant(format!(
                "{id} has {} helpful outcomes, promotion needs {}",
                origin.helpful_count, self.lifecycle.promote_threshold
            )));
        }

        let shared_id = Bullet::shared_id(id);
        if self.collection(Group::Shared).contains(&shared_id) {
            return Err(Error::invariant(format!("{id} is already promoted")));
        }

        let now = Utc::now().to_rfc3339();
        let mut copy = origin.clone();
        copy.id = shared_id;
        copy.group = Group::Shared;
        copy.status = BulletStatus::Active;
        copy.confidence = origin.confidence.max(0.8);
        if let Some(text) = text {
            copy.text = text;
        }
        copy.tags.insert("promoted".into());
        copy.set_meta("promoted_from", id);
        copy.set_meta("promoted_from_group", origin.group.as_str());
        copy.set_meta("promoted_at", now.clone());

        let vector = self.embed(&copy.text);
        let copy = self.collection(Group::Shared).insert(copy, vector)?;
        self.collection(origin.group).update(id, |b| {
            b.set_meta("promoted_to", copy.id.clone());
            Ok(())
        })?;

        self.audit.append(
            "promoted",
            AuditStatus::Ok,
            "lifecycle",
            serde_json::json!({ "id": id, "shared_id": copy.id, "from": origin.group }),
        )?;
        info!(id, shared_id = %copy.id, "bullet promoted to shared");
        Ok(copy)
    }

    /// Fold a duplicate insight into an existing bullet: weighted-average
    /// confidence, union of tags. Counts are untouched.
    pub fn absorb(&self, id: &str, confidence: f64, tags: &[String], trace_id: Option<&str>) -> Result<Bullet> {
        let group = self.locate(id).ok_or_else(|| Error::BulletNotFound(id.to_string()))?;
        self.collection(group).update(id, |b| {
            let weight = b.uses().max(1) as f64;
            b.confidence = ((b.confidence * weight + confidence) / (weight + 1.0)).clamp(0.0, 1.0);
            b.tags.extend(tags.iter().map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty()));
            let merges = b.metadata.get("merge_count").and_then(|v| v.as_u64()).unwrap_or(0);
            b.set_meta("merge_count", merges + 1);
            if let Some(trace) = trace_id {
                b.set_meta("last_merged_trace", trace);
            }
            Ok(())
        })
    }

    /// Attach metadata to a bullet without touching lifecycle fields.
    pub fn annotate(&self, id: &str, entries: serde_json::Map<String, serde_json::Value>) -> Result<Bullet> {
        let group = self.locate(id).ok_or_else(|| Error::BulletNotFound(id.to_string()))?;
        self.collection(group).update(id, |b| {
            for (k, v) in entries {
                b.metadata.insert(k, v);
            }
            Ok(())
        })
    }

    // ============================================================
    // Destructive operations (always backed up)
    // ============================================================

    /// Delete one bullet after backing it up. Returns the backup manifest.
    pub fn delete(&self, id: &str, reason: &str, actor: &str) -> Result<BackupManifest> {
        let group = self.locate(id).ok_or_else(|| Error::BulletNotFound(id.to_string()))?;
        self.delete_batch(group, &[id.to_string()], reason, actor)
    }

    /// Delete several bullets of one group under a single backup.
    pub fn delete_batch(&self, group: Group, ids: &[String], reason: &str, actor: &str) -> Result<BackupManifest> {
        let guard = self.collection(group).lock_exclusive()?;
        let bullets: Vec<Bullet> = ids.iter().filter_map(|id| guard.get(id)).collect();
        if bullets.is_empty() {
            return Err(Error::BulletNotFound(ids.join(",")));
        }
        let manifest = self.backups.write(&bullets, reason, actor)?;
        for b in &bullets {
            guard.remove(&b.id);
        }
        guard.flush()?;
        drop(guard);

        self.audit.append(
            "deleted",
            AuditStatus::Ok,
            actor,
            serde_json::json!({ "group": group, "ids": manifest.ids, "reason": reason, "backup_id": manifest.backup_id }),
        )?;
        Ok(manifest)
    }

    /// Put bullets back exactly as given, into their recorded groups.
    pub fn restore(&self, bullets: &[Bullet]) -> Result<Vec<String>> {
        let groups: BTreeSet<Group> = bullets.iter().map(|b| b.group).collect();
        let groups: Vec<Group> = groups.into_iter().collect();
        let guards = self.lock_groups(&groups)?;
        for bullet in bullets {
            let guard = guard_for(&guards, bullet.group)?;
            guard.put(bullet.clone(), self.embed(&bullet.text));
        }
        for guard in &guards {
            guard.flush()?;
        }
        Ok(bullets.iter().map(|b| b.id.clone()).collect())
    }

    /// Restore every bullet in a backup to its backed-up state.
    pub fn rollback(&self, backup_id: &str, actor: &str) -> Result<BackupManifest> {
        let (manifest, bullets) = self.backups.load(backup_id)?;
        let restored = self.restore(&bullets)?;
        self.audit.append(
            "rollback",
            AuditStatus::Ok,
            actor,
            serde_json::json!({ "backup_id": backup_id, "ids": restored }),
        )?;
        info!(backup_id, restored = restored.len(), "rollback complete");
        Ok(manifest)
    }

    /// Restore individual bullets from the newest backup holding each one.
    /// Returns the ids that were found and restored.
    pub fn restore_bullets(&self, ids: &[String], actor: &str) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for id in ids {
            match self.backups.latest_copy_of(id)? {
                Some((_, bullet)) => found.push(bullet),
                None => warn!(id = %id, "no backup holds this bullet"),
            }
        }
        if found.is_empty() {
            return Ok(Vec::new());
        }
        let restored = self.restore(&found)?;
        self.audit.append("restore", AuditStatus::Ok, actor, serde_json::json!({ "ids": restored }))?;
        Ok(restored)
    }

    /// Lock several collections exclusively, in a fixed order.
    pub fn lock_groups(&self, groups: &[Group]) -> Result<Vec<ExclusiveGuard<'_>>> {
        let ordered: BTreeSet<Group> = groups.iter().copied().collect();
        ordered.into_iter().map(|g| self.collection(g).lock_exclusive()).collect()
    }
}

/// The guard for `group` among guards taken by [`BulletStore::lock_groups`].
pub fn guard_for<'g, 'a>(guards: &'g [ExclusiveGuard<'a>], group: Group) -> Result<&'g ExclusiveGuard<'a>> {
    guards
        .iter()
        .find(|g| g.group() == group)
        .ok_or_else(|| Error::Internal(format!("{group} was not locked")))
}
