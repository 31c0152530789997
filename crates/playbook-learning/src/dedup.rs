//! Near-duplicate clustering and merging.
//!
//! Pairs at or above the similarity threshold are joined with union-find.
//! Each cluster merges into its highest-quality member under exclusive
//! locks, with a backup of the whole cluster written first. Losers are
//! archived as deprecated, so a second run finds nothing to do.
//!
//! A shared bullet and the agent bullet it was promoted from are never
//! merged: the copy already carries the origin's counts.

use chrono::{DateTime, Utc};
use playbook_core::config::DedupConfig;
use playbook_core::{Bullet, BulletStatus, Error, Group, Result};
use playbook_store::{cosine, guard_for, AuditStatus, BulletStore};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateCluster {
    /// Member ids, sorted.
    pub ids: Vec<String>,
    /// Highest pairwise similarity inside the cluster.
    pub max_similarity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeRecord {
    pub primary: String,
    pub merged: Vec<String>,
    pub backup_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupReport {
    pub groups: Vec<Group>,
    pub clusters_found: usize,
    pub merges: Vec<MergeRecord>,
    /// Clusters left for the next run because of the per-run cap.
    pub deferred: usize,
    pub dry_run: bool,
}

impl DedupReport {
    pub fn bullets_archived(&self) -> usize {
        self.merges.iter().map(|m| m.merged.len()).sum()
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb.max(ra)] = ra.min(rb);
        }
    }
}

pub struct Deduplicator {
    store: Arc<BulletStore>,
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(store: Arc<BulletStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    /// Clusters among live (non-staged, non-deprecated) bullets of `groups`.
    pub fn find_clusters(&self, groups: &[Group], threshold: f64) -> Vec<DuplicateCluster> {
        let mut items: Vec<(Bullet, Vec<f32>)> = Vec::new();
        for group in groups.iter().filter(|g| **g != Group::Staging) {
            items.extend(
                self.store
                    .collection(*group)
                    .snapshot()
                    .into_iter()
                    .filter(|(b, _)| matches!(b.status, BulletStatus::Quarantined | BulletStatus::Active)),
            );
        }
        items.sort_by(|a, b| a.0.id.cmp(&b.0.id));

        let mut uf = UnionFind::new(items.len());
        let mut best: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for i in 0..items.len() {
            for j in (i + 1)..items.len() {
                if promotion_linked(&items[i].0, &items[j].0) {
                    continue;
                }
                let sim = cosine(&items[i].1, &items[j].1);
                if sim >= threshold {
                    uf.union(i, j);
                    best.insert((i, j), sim);
                }
            }
        }

        let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..items.len() {
            let root = uf.find(i);
            members.entry(root).or_default().push(i);
        }

        let min_size = self.config.min_cluster_size.max(2);
        members
            .into_values()
            .map(|m| {
                // Union-find is transitive, so an origin and its copy can still meet through a third bullet.
                let ids: BTreeSet<&str> = m.iter().map(|i| items[*i].0.id.as_str()).collect();
                m.into_iter()
                    .filter(|i| items[*i].0.meta_str("promoted_from").map_or(true, |o| !ids.contains(o)))
                    .collect::<Vec<_>>()
            })
            .filter(|m| m.len() >= min_size)
            .map(|m| {
                let set: BTreeSet<usize> = m.iter().copied().collect();
                let max_similarity = best
                    .iter()
                    .filter(|((i, j), _)| set.contains(i) && set.contains(j))
                    .map(|(_, s)| *s)
                    .fold(0.0, f64::max);
                DuplicateCluster { ids: m.into_iter().map(|i| items[i].0.id.clone()).collect(), max_similarity }
            })
            .collect()
    }

    /// Find and merge clusters. `threshold` overrides the configured one.
    pub fn run(&self, groups: &[Group], threshold: Option<f64>, dry_run: bool, actor: &str) -> Result<DedupReport> {
        validate_scope(groups)?;
        let threshold = threshold.unwrap_or(self.config.similarity_threshold);
        let clusters = self.find_clusters(groups, threshold);
        let mut report = DedupReport {
            groups: groups.to_vec(),
            clusters_found: clusters.len(),
            dry_run,
            ..Default::default()
        };
        if dry_run {
            return Ok(report);
        }

        let cap = self.config.max_merges_per_run;
        report.deferred = clusters.len().saturating_sub(cap);
        for cluster in clusters.into_iter().take(cap) {
            match self.merge(&cluster, actor) {
                Ok(Some(record)) => report.merges.push(record),
                Ok(None) => {}
                Err(failure) => {
                    self.audit_failure(&cluster, failure.backup_id.as_deref(), actor, &failure.error);
                    if failure.error.is_fatal() {
                        return Err(failure.error);
                    }
                }
            }
        }
        info!(
            groups = ?groups,
            clusters = report.clusters_found,
            merged = report.merges.len(),
            archived = report.bullets_archived(),
            "deduplication complete"
        );
        Ok(report)
    }

    /// Merge one cluster as a single unit of work. Returns `None` when the
    /// cluster no longer has two live members.
    fn merge(&self, cluster: &DuplicateCluster, actor: &str) -> std::result::Result<Option<MergeRecord>, MergeFailure> {
        let groups: BTreeSet<Group> = cluster.ids.iter().filter_map(|id| self.store.locate(id)).collect();
        let groups: Vec<Group> = groups.into_iter().collect();
        let guards = self.store.lock_groups(&groups)?;

        // Re-read under the locks; anything archived meanwhile drops out.
        let mut members = Vec::new();
        for id in &cluster.ids {
            let Some(group) = self.store.locate(id) else { continue };
            let Ok(guard) = guard_for(&guards, group) else { continue };
            if let Some(b) = guard.get(id) {
                if matches!(b.status, BulletStatus::Quarantined | BulletStatus::Active) {
                    members.push(b);
                }
            }
        }
        let members = without_promoted_copies(members);
        if members.len() < 2 {
            return Ok(None);
        }

        let backup = self.store.backups().write(&members, "deduplication", actor)?;
        let after_backup = |error: Error| MergeFailure { error, backup_id: Some(backup.backup_id.clone()) };
        let merged = merge_cluster(members, self.store.lifecycle().quarantine_threshold, Utc::now());

        let commit = || -> Result<()> {
            guard_for(&guards, merged.primary.group)?.replace(merged.primary.clone())?;
            for loser in &merged.archived {
                guard_for(&guards, loser.group)?.replace(loser.clone())?;
            }
            for guard in &guards {
                guard.flush()?;
            }
            Ok(())
        };
        commit().map_err(after_backup)?;
        drop(guards);

        let record = MergeRecord {
            primary: merged.primary.id.clone(),
            merged: merged.archived.iter().map(|b| b.id.clone()).collect(),
            backup_id: backup.backup_id.clone(),
        };
        self.store
            .audit()
            .append(
                "merged",
                AuditStatus::Ok,
                actor,
                serde_json::json!({ "primary": record.primary, "merged": record.merged, "backup_id": record.backup_id }),
            )
            .map_err(after_backup)?;
        Ok(Some(record))
    }

    fn audit_failure(&self, cluster: &DuplicateCluster, backup_id: Option<&str>, actor: &str, error: &Error) {
        warn!(ids = ?cluster.ids, backup = ?backup_id, "cluster merge failed: {}", error);
        let data = serde_json::json!({ "ids": cluster.ids, "backup_id": backup_id, "error": error.to_string() });
        if let Err(e) = self.store.audit().append("merged", AuditStatus::Failed, actor, data) {
            warn!("Failed to audit merge failure: {}", e);
        }
    }
}

/// A merge error, with the backup id when it happened after the backup.
struct MergeFailure {
    error: Error,
    backup_id: Option<String>,
}

impl From<Error> for MergeFailure {
    fn from(error: Error) -> Self {
        Self { error, backup_id: None }
    }
}

fn promotion_linked(a: &Bullet, b: &Bullet) -> bool {
    let points_to = |x: &Bullet, y: &Bullet| {
        x.meta_str("promoted_from") == Some(y.id.as_str()) || x.meta_str("promoted_to") == Some(y.id.as_str())
    };
    points_to(a, b) || points_to(b, a)
}

/// Drop shared copies whose origin is also among `members`.
fn without_promoted_copies(members: Vec<Bullet>) -> Vec<Bullet> {
    let ids: BTreeSet<String> = members.iter().map(|b| b.id.clone()).collect();
    members
        .into_iter()
        .filter(|b| b.meta_str("promoted_from").map_or(true, |origin| !ids.contains(origin)))
        .collect()
}

/// Result of folding a cluster into its primary.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub primary: Bullet,
    pub archived: Vec<Bullet>,
}

/// Primary selection score: helpful_ratio * ln(1 + uses) * confidence, or
/// confidence * 0.1 for an unused bullet.
pub fn merge_quality(b: &Bullet) -> f64 {
    let uses = b.uses();
    if uses == 0 {
        b.confidence * 0.1
    } else {
        b.helpful_ratio() * (uses as f64).ln_1p() * b.confidence
    }
}

/// Fold `members` into the best of them. Pure: callers persist the result.
///
/// The primary keeps its id, text, group and status, except that a
/// quarantined primary whose merged counts clear `quarantine_threshold` with
/// no harm becomes active.
pub fn merge_cluster(members: Vec<Bullet>, quarantine_threshold: u32, now: DateTime<Utc>) -> MergeOutcome {
    let mut members = members;
    members.sort_by(|a, b| {
        merge_quality(b)
            .total_cmp(&merge_quality(a))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    let mut primary = members.remove(0);
    let losers = members;

    let all = std::iter::once(&primary).chain(losers.iter());
    let total_uses: u32 = all.clone().map(|b| b.uses()).sum();
    let confidence = if total_uses > 0 {
        all.clone().map(|b| b.confidence * b.uses() as f64).sum::<f64>() / total_uses as f64
    } else {
        primary.confidence
    };
    let created_at = all.clone().map(|b| b.created_at).min().unwrap_or(primary.created_at);
    let last_used_at = all.clone().filter_map(|b| b.last_used_at).max();

    for loser in &losers {
        primary.helpful_count += loser.helpful_count;
        primary.harmful_count += loser.harmful_count;
        primary.tags.extend(loser.tags.iter().cloned());
    }
    primary.confidence = confidence.clamp(0.0, 1.0);
    primary.created_at = created_at;
    primary.last_used_at = last_used_at;
    let merges = primary.metadata.get("merge_count").and_then(|v| v.as_u64()).unwrap_or(0);
    primary.set_meta("merge_count", merges + losers.len() as u64);
    primary.set_meta("last_merged_at", now.to_rfc3339());

    if primary.status == BulletStatus::Quarantined
        && primary.helpful_count >= quarantine_threshold
        && primary.harmful_count == 0
    {
        primary.status = BulletStatus::Active;
        primary.set_meta("active_at", now.to_rfc3339());
    }

    let archived = losers
        .into_iter()
        .map(|mut b| {
            b.status = BulletStatus::Deprecated;
            b.set_meta("merged_into", primary.id.clone());
            b.set_meta("merge_reason", "deduplication");
            b.set_meta("merged_at", now.to_rfc3339());
            b
        })
        .collect();

    MergeOutcome { primary, archived }
}

/// Refuse obviously wrong scopes early.
pub fn validate_scope(groups: &[Group]) -> Result<()> {
    if groups.is_empty() {
        return Err(Error::invariant("deduplication needs at least one group"));
    }
    if groups.contains(&Group::Staging) {
        return Err(Error::invariant("staging is not deduplicated; review staged bullets instead"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use playbook_core::BulletKind;

    fn bullet(helpful: u32, harmful: u32, confidence: f64, status: BulletStatus) -> Bullet {
        let mut b = Bullet::new("retry with backoff", Group::Left, BulletKind::Heuristic, vec![], confidence, status);
        b.helpful_count = helpful;
        b.harmful_count = harmful;
        b
    }

    #[test]
    fn primary_is_highest_quality_and_counts_sum() {
        let mut a = bullet(1, 0, 0.9, BulletStatus::Quarantined);
        a.tags.insert("http".into());
        let mut b = bullet(4, 0, 0.7, BulletStatus::Active);
        b.tags.insert("retry".into());
        let b_id = b.id.clone();

        let out = merge_cluster(vec![a.clone(), b], 2, Utc::now());
        assert_eq!(out.primary.id, b_id);
        assert_eq!(out.primary.helpful_count, 5);
        assert!(out.primary.tags.contains("http") && out.primary.tags.contains("retry"));
        // (0.9*1 + 0.7*4) / 5
        assert!((out.primary.confidence - 0.74).abs() < 1e-9);
        assert_eq!(out.archived.len(), 1);
        assert_eq!(out.archived[0].status, BulletStatus::Deprecated);
        assert_eq!(out.archived[0].meta_str("merged_into"), Some(b_id.as_str()));
        assert_eq!(out.archived[0].meta_str("merge_reason"), Some("deduplication"));
    }

    #[test]
    fn merged_counts_can_activate_but_never_demote() {
        let a = bullet(1, 0, 0.8, BulletStatus::Quarantined);
        let b = bullet(1, 0, 0.6, BulletStatus::Quarantined);
        let out = merge_cluster(vec![a, b], 2, Utc::now());
        assert_eq!(out.primary.status, BulletStatus::Active);

        let a = bullet(5, 0, 0.9, BulletStatus::Active);
        let b = bullet(0, 3, 0.9, BulletStatus::Quarantined);
        let out = merge_cluster(vec![a, b], 2, Utc::now());
        assert_eq!(out.primary.status, BulletStatus::Active);
        assert_eq!(out.primary.harmful_count, 3);
    }

    #[test]
    fn unused_cluster_keeps_primary_confidence() {
        let a = bullet(0, 0, 0.4, BulletStatus::Quarantined);
        let b = bullet(0, 0, 0.9, BulletStatus::Quarantined);
        let out = merge_cluster(vec![a, b], 2, Utc::now());
        assert_eq!(out.primary.confidence, 0.9);
        assert_eq!(out.primary.status, BulletStatus::Quarantined);
    }

    #[test]
    fn union_find_joins_transitively() {
        let mut uf = UnionFind::new(4);
        uf.union(0, 1);
        uf.union(2, 1);
        assert_eq!(uf.find(2), uf.find(0));
        assert_ne!(uf.find(3), uf.find(0));
    }

    #[test]
    fn promoted_copy_is_linked_to_its_origin() {
        let origin = bullet(3, 0, 0.8, BulletStatus::Active);
        let mut copy = origin.clone();
        copy.id = Bullet::shared_id(&origin.id);
        copy.group = Group::Shared;
        copy.set_meta("promoted_from", origin.id.clone());
        let stranger = bullet(1, 0, 0.8, BulletStatus::Active);

        assert!(promotion_linked(&origin, &copy));
        assert!(promotion_linked(&copy, &origin));
        assert!(!promotion_linked(&origin, &stranger));

        let kept = without_promoted_copies(vec![origin.clone(), copy.clone(), stranger.clone()]);
        let ids: Vec<_> = kept.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec![origin.id.as_str(), stranger.id.as_str()]);
        // Without its origin the copy is an ordinary member.
        assert_eq!(without_promoted_copies(vec![copy, stranger]).len(), 2);
    }

    #[test]
    fn staging_scope_is_rejected() {
        assert!(validate_scope(&[Group::Left, Group::Staging]).is_err());
        assert!(validate_scope(&[]).is_err());
        assert!(validate_scope(&[Group::Left, Group::Shared]).is_ok());
    }
}
