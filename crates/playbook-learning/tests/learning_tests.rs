//! Integration tests for playbook-learning
//!
//! Exercise the write side through the `Playbook` facade:
//! - classifier routing of added bullets and the review bands
//! - merge of near-duplicates with summed counts, and dedup idempotence
//! - dedup never folds a shared copy into its origin; failed merges are audited
//! - prune behind a backup, confirmation and dry runs, exact rollback
//! - promotion with phrasing translation
//! - learn_from_trace end to end, including deep-reflection fallback
//! - cross-hemisphere suggestions from outcome to delivery

use playbook_core::{BulletKind, BulletStatus, Error, ExecutionTrace, Group, PlaybookConfig, Privilege, ReflectionDepth, ToolResult};
use playbook_learning::{
    Classification, MaintenancePlan, Playbook, PruneOptions, ReviewPriority, Routing, TickProfile, TickRate,
};
use playbook_llm::{GenerateError, GenerateResult, Generator};
use playbook_store::{AuditStatus, Embedder, HashEmbedder, SuggestionStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

const DIM: usize = 16;
const RETRY_A: &str = "Retry idempotent requests with exponential backoff";
const RETRY_B: &str = "Use exponential backoff when retrying idempotent calls";

/// Fixed vectors for known texts, hashing for everything else.
struct TableEmbedder {
    table: HashMap<&'static str, Vec<f32>>,
    fallback: HashEmbedder,
}

impl TableEmbedder {
    fn new() -> Self {
        let mut a = vec![0.0f32; DIM];
        a[0] = 1.0;
        let mut b = vec![0.0f32; DIM];
        b[0] = 0.95;
        b[1] = (1.0f32 - 0.95 * 0.95).sqrt();
        let table = HashMap::from([(RETRY_A, a), (RETRY_B, b)]);
        Self { table, fallback: HashEmbedder::new(DIM) }
    }
}

impl Embedder for TableEmbedder {
    fn dimension(&self) -> usize {
        DIM
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        self.table.get(text).cloned().unwrap_or_else(|| self.fallback.embed(text))
    }
}

struct Broken;

#[async_trait::async_trait]
impl Generator for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn generate(&self, _prompt: &str) -> GenerateResult<String> {
        Err(GenerateError::RequestFailed("service unavailable".into()))
    }
}

fn open(tmp: &TempDir, config: PlaybookConfig) -> Playbook {
    Playbook::open(config, tmp.path(), None).unwrap()
}

fn open_table(tmp: &TempDir, config: PlaybookConfig) -> Playbook {
    Playbook::open_with_embedder(config, tmp.path(), Arc::new(TableEmbedder::new()), None).unwrap()
}

fn only(prune: bool, dedup: bool, promote: bool) -> MaintenancePlan {
    MaintenancePlan { prune, dedup, promote, dry_run: false, force: false }
}

async fn seed(pb: &Playbook, text: &str, group: Group) -> String {
    pb.add_with_privilege(text, group, BulletKind::Heuristic, vec![], 0.7, Privilege::Bootstrap)
        .await
        .unwrap()
        .bullet
        .id
}

// ============================================================
// Routing
// ============================================================

#[tokio::test]
async fn prescriptive_rule_is_assigned_left_and_quarantined() {
    let tmp = TempDir::new().unwrap();
    let pb = open(&tmp, PlaybookConfig::default());
    let out = pb
        .add("Always validate the schema before calling the API", Group::Right, BulletKind::Heuristic, vec![], 0.8)
        .await
        .unwrap();

    match out.routing {
        Some(Routing::Assigned { group, confidence, audit_required }) => {
            assert_eq!(group, Group::Left);
            assert!(confidence > 0.85, "confidence {confidence}");
            assert!(!audit_required);
        }
        other => panic!("expected assignment, got {other:?}"),
    }
    assert_eq!(out.bullet.group, Group::Left);
    assert_eq!(out.bullet.status, BulletStatus::Quarantined);
    assert!(pb.list_staged(None).is_empty());
}

#[tokio::test]
async fn mid_confidence_classification_stays_staged() {
    let tmp = TempDir::new().unwrap();
    let pb = open(&tmp, PlaybookConfig::default());
    let b = pb
        .store()
        .create("Quarterly numbers live in the blue folder", Group::Left, BulletKind::Example, vec![], 0.7, None, Privilege::Normal)
        .unwrap();
    let c = Classification {
        group: Group::Left,
        confidence: 0.65,
        reasoning: "weak lexical signal".into(),
        ambiguous: false,
        left_score: 0.3,
        right_score: 0.2,
    };
    let routing = pb.curator().apply_classification(&b.id, &c).unwrap();
    assert!(matches!(routing, Routing::Staged { priority: ReviewPriority::Medium, .. }));

    let staged = pb.list_staged(Some(ReviewPriority::Medium));
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].status, BulletStatus::Staged);
    assert_eq!(staged[0].meta_str("review_priority"), Some("medium"));

    let manifest = pb.reject_staged_bullet(&b.id, "not useful", "reviewer-1").unwrap();
    assert!(pb.store().find(&b.id).is_none());
    pb.rollback(&manifest.backup_id, "reviewer-1").unwrap();
    assert_eq!(pb.store().get(&b.id).unwrap().status, BulletStatus::Staged);
}

// ============================================================
// Dedup
// ============================================================

#[tokio::test]
async fn near_duplicates_merge_with_summed_counts() {
    let tmp = TempDir::new().unwrap();
    let pb = open_table(&tmp, PlaybookConfig::default());
    let a = seed(&pb, RETRY_A, Group::Left).await;
    let b = seed(&pb, RETRY_B, Group::Left).await;
    pb.record_outcome("o1", &[a.clone()], true).unwrap();
    pb.record_outcome("o2", &[a.clone()], true).unwrap();
    pb.record_outcome("o3", &[b.clone()], true).unwrap();

    let stats = pb.run_maintenance(Some(Group::Left), &only(false, true, false)).unwrap();
    assert_eq!(stats.clusters_found, 1);
    assert_eq!(stats.merged, 1);
    assert_eq!(stats.backups.len(), 1);

    let live: Vec<_> = pb
        .store()
        .list(Group::Left, None, None)
        .into_iter()
        .filter(|x| x.status != BulletStatus::Deprecated)
        .collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, a);
    assert_eq!(live[0].helpful_count, 3);
    assert_eq!(live[0].status, BulletStatus::Active);

    let loser = pb.store().get(&b).unwrap();
    assert_eq!(loser.status, BulletStatus::Deprecated);
    assert_eq!(loser.meta_str("merged_into"), Some(a.as_str()));

    let again = pb.run_maintenance(Some(Group::Left), &only(false, true, false)).unwrap();
    assert_eq!(again.clusters_found, 0);
    assert_eq!(again.merged, 0);
}

#[tokio::test]
async fn merge_backup_rolls_back_both_members() {
    let tmp = TempDir::new().unwrap();
    let pb = open_table(&tmp, PlaybookConfig::default());
    let a = seed(&pb, RETRY_A, Group::Left).await;
    let b = seed(&pb, RETRY_B, Group::Left).await;
    pb.record_outcome("o1", &[a.clone()], true).unwrap();
    pb.record_outcome("o2", &[a.clone()], true).unwrap();
    pb.record_outcome("o3", &[b.clone()], true).unwrap();
    let before_a = pb.store().get(&a).unwrap();
    let before_b = pb.store().get(&b).unwrap();

    let stats = pb.run_maintenance(Some(Group::Left), &only(false, true, false)).unwrap();
    assert_eq!(stats.merged, 1);
    pb.rollback(&stats.backups[0], "operator").unwrap();

    let restored_a = pb.store().get(&a).unwrap();
    let restored_b = pb.store().get(&b).unwrap();
    assert_eq!((restored_a.status, restored_a.helpful_count), (BulletStatus::Active, 2));
    assert_eq!((restored_b.status, restored_b.helpful_count), (BulletStatus::Quarantined, 1));
    assert_eq!(restored_a.text, before_a.text);
    assert_eq!(restored_b.status, before_b.status);
    assert!(restored_b.meta_str("merged_into").is_none());
}

#[tokio::test]
async fn shared_copy_is_not_merged_into_its_origin() {
    let tmp = TempDir::new().unwrap();
    let pb = open(&tmp, PlaybookConfig::default());
    let id = seed(&pb, "Pin the toolchain version in CI", Group::Left).await;
    for i in 0..10 {
        pb.record_outcome(&format!("ok-{i}"), &[id.clone()], true).unwrap();
    }
    let origin = pb.store().get(&id).unwrap();
    let copy_id = origin.meta_str("promoted_to").unwrap().to_string();

    let report = pb.curator().deduplicate(&[Group::Left, Group::Shared], None, false).unwrap();
    assert_eq!(report.clusters_found, 0);
    assert!(report.merges.is_empty());

    let origin = pb.store().get(&id).unwrap();
    assert_eq!(origin.status, BulletStatus::Active);
    assert_eq!(origin.helpful_count, 10);
    let copy = pb.store().get(&copy_id).unwrap();
    assert_eq!(copy.group, Group::Shared);
    assert_eq!(copy.status, BulletStatus::Active);
    assert_eq!(copy.helpful_count, 3);
}

async fn duplicate_pair(pb: &Playbook) -> (String, String) {
    let a = seed(pb, RETRY_A, Group::Left).await;
    let b = seed(pb, RETRY_B, Group::Left).await;
    pb.record_outcome("o1", &[a.clone()], true).unwrap();
    (a, b)
}

fn failed_merges(pb: &Playbook) -> Vec<serde_json::Value> {
    pb.store()
        .audit()
        .events_named("merged")
        .unwrap()
        .into_iter()
        .filter(|e| e.status == AuditStatus::Failed)
        .map(|e| e.data)
        .collect()
}

#[tokio::test]
async fn merge_that_cannot_back_up_is_audited_and_changes_nothing() {
    let tmp = TempDir::new().unwrap();
    let pb = open_table(&tmp, PlaybookConfig::default());
    let (a, b) = duplicate_pair(&pb).await;
    let backups = tmp.path().join("backups");
    std::fs::remove_dir_all(&backups).unwrap();
    std::fs::write(&backups, b"not a directory").unwrap();

    let err = pb.run_maintenance(Some(Group::Left), &only(false, true, false)).unwrap_err();
    assert!(err.is_fatal(), "{err}");

    let failed = failed_merges(&pb);
    assert_eq!(failed.len(), 1);
    assert!(failed[0]["backup_id"].is_null());
    assert_eq!(failed[0]["ids"].as_array().unwrap().len(), 2);
    assert!(failed[0]["error"].as_str().is_some());
    assert_eq!(pb.store().get(&a).unwrap().helpful_count, 1);
    assert_ne!(pb.store().get(&b).unwrap().status, BulletStatus::Deprecated);
}

#[tokio::test]
async fn merge_that_fails_to_commit_names_its_backup() {
    let tmp = TempDir::new().unwrap();
    let pb = open_table(&tmp, PlaybookConfig::default());
    let (a, b) = duplicate_pair(&pb).await;
    let left = tmp.path().join("collections").join("left.json");
    std::fs::remove_file(&left).unwrap();
    std::fs::create_dir_all(left.join("blocker")).unwrap();

    let err = pb.run_maintenance(Some(Group::Left), &only(false, true, false)).unwrap_err();
    assert!(err.is_fatal(), "{err}");

    let failed = failed_merges(&pb);
    assert_eq!(failed.len(), 1);
    let backup_id = failed[0]["backup_id"].as_str().unwrap().to_string();

    std::fs::remove_dir_all(&left).unwrap();
    pb.rollback(&backup_id, "operator").unwrap();
    let restored_a = pb.store().get(&a).unwrap();
    let restored_b = pb.store().get(&b).unwrap();
    assert_eq!(restored_a.helpful_count, 1);
    assert_eq!(restored_b.helpful_count, 0);
    assert_eq!(restored_b.status, BulletStatus::Quarantined);
}

// ============================================================
// Prune
// ============================================================

async fn harmful_pair(pb: &Playbook) -> Vec<String> {
    let x = seed(pb, "Cache every response for a day", Group::Left).await;
    let y = seed(pb, "Skip the health check on deploy", Group::Left).await;
    seed(pb, "Pin dependency versions in CI", Group::Left).await;
    pb.record_outcome("bad-1", &[x.clone(), y.clone()], false).unwrap();
    vec![x, y]
}

#[tokio::test]
async fn prune_then_rollback_restores_exact_state() {
    let tmp = TempDir::new().unwrap();
    let pb = open(&tmp, PlaybookConfig::default());
    let harmful = harmful_pair(&pb).await;
    let before = pb.store().list(Group::Left, None, None);

    let stats = pb.run_maintenance(Some(Group::Left), &only(true, false, false)).unwrap();
    assert_eq!(stats.pruned, 2);
    assert_eq!(stats.backups.len(), 1);
    for id in &harmful {
        let b = pb.store().get(id).unwrap();
        assert_eq!(b.status, BulletStatus::Deprecated);
        assert_eq!(b.meta_str("backup_id"), Some(stats.backups[0].as_str()));
        assert!(b.metadata["prune_reasons"].as_array().unwrap().iter().any(|r| r == "harmful_ratio"));
    }

    pb.rollback(&stats.backups[0], "test").unwrap();
    assert_eq!(pb.store().list(Group::Left, None, None), before);
    assert!(pb.list_backups().unwrap().iter().any(|m| m.backup_id == stats.backups[0]));
}

#[tokio::test]
async fn large_prune_needs_force_and_dry_run_changes_nothing() {
    let tmp = TempDir::new().unwrap();
    let mut config = PlaybookConfig::default();
    config.pruning.require_confirmation_threshold = 1;
    let pb = open(&tmp, config);
    harmful_pair(&pb).await;
    let before = pb.store().list(Group::Left, None, None);

    let err = pb.run_maintenance(Some(Group::Left), &only(true, false, false)).unwrap_err();
    assert!(matches!(err, Error::ConfirmationRequired { count: 2, threshold: 1 }));

    let dry = MaintenancePlan { dry_run: true, ..only(true, false, false) };
    let stats = pb.run_maintenance(Some(Group::Left), &dry).unwrap();
    assert_eq!(stats.prune_candidates, 2);
    assert_eq!(stats.pruned, 0);
    assert_eq!(pb.store().list(Group::Left, None, None), before);

    let forced = MaintenancePlan { force: true, ..only(true, false, false) };
    assert_eq!(pb.run_maintenance(Some(Group::Left), &forced).unwrap().pruned, 2);
}

#[tokio::test]
async fn hard_delete_removes_and_rollback_reinstates() {
    let tmp = TempDir::new().unwrap();
    let mut config = PlaybookConfig::default();
    config.pruning.hard_delete = true;
    let pb = open(&tmp, config);
    let harmful = harmful_pair(&pb).await;

    let stats = pb.run_maintenance(Some(Group::Left), &only(true, false, false)).unwrap();
    assert_eq!(stats.pruned, 2);
    assert!(harmful.iter().all(|id| pb.store().find(id).is_none()));

    let restored = pb.restore_bullets(&harmful, "test").unwrap();
    assert_eq!(restored.len(), 2);
    assert!(harmful.iter().all(|id| pb.store().find(id).is_some()));
}

#[test]
fn staging_is_never_pruned() {
    let tmp = TempDir::new().unwrap();
    let pb = open(&tmp, PlaybookConfig::default());
    let options = PruneOptions::new(pb.config().pruning.policy);
    assert!(matches!(pb.curator().prune_low_quality(Group::Staging, &options), Err(Error::InvariantViolation(_))));
}

// ============================================================
// Promotion
// ============================================================

#[tokio::test]
async fn promotion_pass_translates_phrasing() {
    let tmp = TempDir::new().unwrap();
    let mut config = PlaybookConfig::default();
    config.lifecycle.auto_promote = false;
    config.curation.translate_on_promote = true;
    let pb = open(&tmp, config);
    let id = seed(&pb, "You must always check the exit code", Group::Left).await;
    for i in 0..3 {
        pb.record_outcome(&format!("ok-{i}"), &[id.clone()], true).unwrap();
    }

    let stats = pb.run_maintenance(Some(Group::Left), &only(false, false, true)).unwrap();
    assert_eq!(stats.promoted.len(), 1);
    let copy = pb.store().get(&stats.promoted[0]).unwrap();
    assert_eq!(copy.group, Group::Shared);
    assert_eq!(copy.text, "You should usually check the exit code");
    assert_eq!(copy.meta_str("promoted_from"), Some(id.as_str()));

    let again = pb.run_maintenance(Some(Group::Left), &only(false, false, true)).unwrap();
    assert!(again.promoted.is_empty());
}

// ============================================================
// learn_from_trace
// ============================================================

fn surprising_failure() -> ExecutionTrace {
    let mut t = ExecutionTrace::new("export the weekly report", Group::Left, false);
    t.expected_success = Some(true);
    t.confidence = 0.6;
    t.error = Some("permission denied".into());
    t.tool_results = vec![ToolResult { name: "file_write".into(), success: false, duration_ms: Some(12) }];
    t
}

#[tokio::test]
async fn surprising_failure_earns_deep_reflection_and_falls_back() {
    let tmp = TempDir::new().unwrap();
    let generator: Arc<dyn Generator> = Arc::new(Broken);
    let pb = Playbook::open(PlaybookConfig::default(), tmp.path(), Some(generator)).unwrap();

    let report = pb.learn_from_trace(&surprising_failure(), TickRate::Auto).await.unwrap();
    assert!(report.pressure >= 0.8, "pressure {}", report.pressure);
    assert_eq!(report.depth, ReflectionDepth::Deep);
    // Medium fallback: one pitfall for the failed tool.
    assert_eq!(report.insights, 1);
    assert_eq!(report.curation.created.len(), 1);

    let created = pb.store().get(&report.curation.created[0]).unwrap();
    assert!(created.text.contains("file_write"));
    assert_eq!(created.source_trace_id.as_deref(), Some(report.trace_id.as_str()));
    assert_eq!(pb.get_consciousness_metrics().observations, 1);
}

#[tokio::test]
async fn routine_success_learns_nothing() {
    let tmp = TempDir::new().unwrap();
    let pb = open(&tmp, PlaybookConfig::default());
    let mut trace = ExecutionTrace::new("list files", Group::Right, true);
    trace.confidence = 0.9;

    let report = pb.learn_from_trace(&trace, TickRate::Fixed(0.0)).await.unwrap();
    assert!(report.novelty.signals.is_empty());
    assert_eq!(report.depth, ReflectionDepth::None);
    assert_eq!(report.insights, 0);
    assert_eq!(pb.store().stats().total, 0);
}

#[tokio::test]
async fn repeated_trace_merges_instead_of_duplicating() {
    let tmp = TempDir::new().unwrap();
    let pb = open(&tmp, PlaybookConfig::default());
    let first = pb.learn_from_trace(&surprising_failure(), TickRate::Auto).await.unwrap();
    let second = pb.learn_from_trace(&surprising_failure(), TickRate::Auto).await.unwrap();
    assert_eq!(first.curation.created.len(), 1);
    assert!(second.curation.created.is_empty());
    assert_eq!(second.curation.merged, first.curation.created);
}

#[tokio::test]
async fn controller_state_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let pb = open(&tmp, PlaybookConfig::default());
        pb.learn_from_trace(&surprising_failure(), TickRate::Auto).await.unwrap();
        pb.tick(0.5).unwrap();
        pb.shutdown();
    }
    let pb = open(&tmp, PlaybookConfig::default());
    let metrics = pb.get_consciousness_metrics();
    assert_eq!(metrics.observations, 1);
    assert_eq!(metrics.tick_count, 1);
}

// ============================================================
// Cross-hemisphere suggestions
// ============================================================

fn suggesting() -> PlaybookConfig {
    let mut config = PlaybookConfig::default();
    config.lifecycle.auto_promote = false;
    config.suggestions.enabled = true;
    config
}

fn helpful(pb: &Playbook, prefix: &str, id: &str, times: usize) {
    for i in 0..times {
        pb.record_outcome(&format!("{prefix}-{i}"), &[id.to_string()], true).unwrap();
    }
}

#[tokio::test]
async fn proven_bullet_is_suggested_and_delivered_quarantined() {
    let tmp = TempDir::new().unwrap();
    let pb = open(&tmp, suggesting());
    let origin = seed(&pb, "Pin the toolchain version in CI", Group::Left).await;

    helpful(&pb, "warmup", &origin, 1);
    assert!(pb.list_suggestions(None, None).is_empty());
    helpful(&pb, "proven", &origin, 2);
    let pending = pb.list_suggestions(Some(SuggestionStatus::Pending), Some(Group::Right));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].origin_bullet_id, origin);
    assert_eq!(pending[0].from_side, Group::Left);

    let busy = TickProfile { is_idle: false, pressure: 0.9 };
    let gated = pb.deliver_suggestions(Some(busy), None).unwrap();
    assert!(gated.gated);
    assert!(gated.delivered.is_empty());

    let report = pb.deliver_suggestions(None, None).unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert!(report.delivered[0].conflicts_with.is_empty());
    let taught = pb.store().get(&report.delivered[0].bullet_id).unwrap();
    assert_eq!(taught.group, Group::Right);
    assert_eq!(taught.status, BulletStatus::Quarantined);
    assert_eq!(taught.meta_str("origin_bullet_id"), Some(origin.as_str()));
    assert_eq!(taught.meta_str("taught_from"), Some("left"));
    let delivered = &pb.list_suggestions(Some(SuggestionStatus::Delivered), None)[0];
    assert_eq!(delivered.delivered_bullet_id.as_deref(), Some(taught.id.as_str()));

    helpful(&pb, "taught", &taught.id, 2);
    let accepted = pb.list_suggestions(Some(SuggestionStatus::Accepted), None);
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].resolution_reason.as_deref(), Some("activated"));
    let origin = pb.store().get(&origin).unwrap();
    assert_eq!(origin.metadata.get("cross_confirmed"), Some(&serde_json::Value::Bool(true)));
}

#[tokio::test]
async fn opposite_advice_is_delivered_with_a_conflict_flag() {
    let tmp = TempDir::new().unwrap();
    let pb = open(&tmp, suggesting());
    let held = seed(&pb, "Never retry the upload on timeout", Group::Right).await;
    let origin = seed(&pb, "Always retry the upload on timeout", Group::Left).await;
    helpful(&pb, "ok", &origin, 2);

    let report = pb.deliver_suggestions(None, Some(Group::Right)).unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert_eq!(report.delivered[0].conflicts_with, vec![held.clone()]);
    let taught = pb.store().get(&report.delivered[0].bullet_id).unwrap();
    assert_eq!(taught.metadata.get("conflict_flag"), Some(&serde_json::Value::Bool(true)));
    assert_eq!(pb.store().get(&held).unwrap().status, BulletStatus::Quarantined);
}

#[tokio::test]
async fn suggestions_are_off_by_default() {
    let tmp = TempDir::new().unwrap();
    let mut config = PlaybookConfig::default();
    config.lifecycle.auto_promote = false;
    let pb = open(&tmp, config);
    let origin = seed(&pb, "Pin the toolchain version in CI", Group::Left).await;
    helpful(&pb, "ok", &origin, 3);

    assert!(pb.list_suggestions(None, None).is_empty());
    assert!(pb.deliver_suggestions(None, None).unwrap().gated);
}
