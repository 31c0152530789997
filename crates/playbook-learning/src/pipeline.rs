//! `Playbook`: the facade the agent layer talks to.
//!
//! Owns the store, retriever, reflector, curator and the controller link.
//! The controller either lives in-process behind a mutex (CLI, tests) or in
//! its own single-writer loop once `start_controller_loop` is called.

use crate::classifier::HemisphereClassifier;
use crate::curator::{Curator, CurationReport, ReviewPriority, Routing};
use crate::dedup::Deduplicator;
use crate::pruner::{PruneOptions, Pruner};
use crate::quality::QualityDistribution;
use crate::reflector::Reflector;
use crate::scheduler::MaintenanceScheduler;
use crate::suggestions::{DeliveryReport, TickProfile};
use chrono::Utc;
use playbook_controller::{
    spawn, ConsciousnessMetrics, ControlCommand, ControllerHandle, ControllerTask, MetaController, ModeDecision,
    NoveltyDetector, NoveltyMeasurement, Observation,
};
use playbook_core::{
    Bullet, BulletKind, BulletStatus, ExecutionTrace, Group, PlaybookConfig, Privilege, ReflectionDepth, Result,
};
use playbook_llm::Generator;
use playbook_store::{
    BackupManifest, BulletStore, Embedder, HashEmbedder, OutcomeReport, RetrievalRequest, Retriever, Suggestion,
    SuggestionStatus,
};
use serde::Serialize;
use serde_json::{json, Map};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CONTROLLER_STATE_FILE: &str = "controller-state.json";

/// Where the tick rate for a learning pass comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickRate {
    /// The controller's smoothed rate.
    Auto,
    /// Caller-supplied rate in [0,1].
    Fixed(f64),
}

#[derive(Debug, Clone, Serialize)]
pub struct LearnReport {
    pub trace_id: String,
    pub novelty: NoveltyMeasurement,
    pub pressure: f64,
    pub depth: ReflectionDepth,
    pub insights: usize,
    pub curation: CurationReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddOutcome {
    /// The bullet as stored after routing.
    pub bullet: Bullet,
    /// None for bootstrap inserts, which skip staging.
    pub routing: Option<Routing>,
}

/// Which maintenance passes to run.
#[derive(Debug, Clone)]
pub struct MaintenancePlan {
    pub prune: bool,
    pub dedup: bool,
    pub promote: bool,
    pub dry_run: bool,
    pub force: bool,
}

impl MaintenancePlan {
    pub fn all() -> Self {
        Self { prune: true, dedup: true, promote: true, dry_run: false, force: false }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceStats {
    pub groups: Vec<Group>,
    pub clusters_found: usize,
    pub merged: usize,
    pub prune_candidates: usize,
    pub pruned: usize,
    pub promoted: Vec<String>,
    pub backups: Vec<String>,
    pub dry_run: bool,
}

enum ControllerLink {
    Local(Mutex<MetaController>),
    Loop(ControllerHandle),
}

pub struct Playbook {
    config: PlaybookConfig,
    store: Arc<BulletStore>,
    retriever: Retriever,
    reflector: Reflector,
    curator: Arc<Curator>,
    detector: NoveltyDetector,
    controller: ControllerLink,
    controller_path: PathBuf,
    shutdown: CancellationToken,
}

impl Playbook {
    /// Open (or create) a playbook rooted at `root` with the local hashing embedder.
    pub fn open(config: PlaybookConfig, root: impl Into<PathBuf>, generator: Option<Arc<dyn Generator>>) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(config.storage.embedding_dimension));
        Self::open_with_embedder(config, root, embedder, generator)
    }

    pub fn open_with_embedder(
        config: PlaybookConfig,
        root: impl Into<PathBuf>,
        embedder: Arc<dyn Embedder>,
        generator: Option<Arc<dyn Generator>>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(BulletStore::open(root, config.lifecycle.clone(), embedder.clone())?);
        let shutdown = CancellationToken::new();

        let classifier = Arc::new(HemisphereClassifier::new(embedder, generator.clone(), config.classifier.clone()));
        let curator = Arc::new(Curator::new(
            store.clone(),
            classifier,
            Deduplicator::new(store.clone(), config.dedup.clone()),
            Pruner::new(store.clone(), config.pruning.clone()),
            config.curation.clone(),
        )
        .with_suggestions(config.suggestions.clone()));
        let reflector = Reflector::new(generator, config.reflection.clone()).with_cancellation(shutdown.child_token());
        let retriever = Retriever::new(store.clone(), config.retrieval.clone());

        let controller_path = store.root().join(CONTROLLER_STATE_FILE);
        let controller = MetaController::hydrate_or_create(&controller_path, config.controller.clone());
        info!(root = %store.root().display(), bullets = store.stats().total, "playbook opened");

        Ok(Self {
            detector: NoveltyDetector::new(config.controller.baseline_confidence),
            config,
            store,
            retriever,
            reflector,
            curator,
            controller: ControllerLink::Local(Mutex::new(controller)),
            controller_path,
            shutdown,
        })
    }

    pub fn config(&self) -> &PlaybookConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<BulletStore> {
        &self.store
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn curator(&self) -> &Arc<Curator> {
        &self.curator
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    // ============================================================
    // Controller
    // ============================================================

    /// Hand the in-process controller to a background loop. Must be called
    /// inside a tokio runtime. Returns None if a loop is already running.
    pub fn start_controller_loop(&mut self, checkpoint_every: u64) -> Option<ControllerTask> {
        let placeholder = ControllerLink::Local(Mutex::new(MetaController::new(self.config.controller.clone())));
        match std::mem::replace(&mut self.controller, placeholder) {
            ControllerLink::Local(local) => {
                let controller = local.into_inner().unwrap_or_else(PoisonError::into_inner);
                let task = spawn(controller, Some(self.controller_path.clone()), checkpoint_every);
                self.controller = ControllerLink::Loop(task.handle.clone());
                Some(task)
            }
            running @ ControllerLink::Loop(_) => {
                self.controller = running;
                None
            }
        }
    }

    pub fn get_consciousness_metrics(&self) -> ConsciousnessMetrics {
        match &self.controller {
            ControllerLink::Local(c) => c.lock().unwrap_or_else(PoisonError::into_inner).metrics(),
            ControllerLink::Loop(h) => h.metrics(),
        }
    }

    /// Advance the in-process controller by one tick. None when a loop owns it.
    pub fn tick(&self, elapsed_secs: f64) -> Option<ModeDecision> {
        match &self.controller {
            ControllerLink::Local(c) => {
                let mut controller = c.lock().unwrap_or_else(PoisonError::into_inner);
                let decision = controller.tick(elapsed_secs);
                controller.checkpoint(&self.controller_path);
                Some(decision)
            }
            ControllerLink::Loop(_) => None,
        }
    }

    /// Latest retrieval entropy and cross-group conflict.
    pub async fn report_pressure(&self, entropy: f64, conflict: f64) {
        match &self.controller {
            ControllerLink::Local(c) => {
                c.lock().unwrap_or_else(PoisonError::into_inner).report_pressure(entropy, conflict);
            }
            ControllerLink::Loop(h) => {
                h.send(ControlCommand::Pressure { entropy, conflict }).await;
            }
        }
    }

    /// Feed one measurement to the controller and return the reflection
    /// pressure for that execution.
    async fn observe(&self, measurement: &NoveltyMeasurement, tick_rate: TickRate) -> f64 {
        let rate = match &self.controller {
            ControllerLink::Local(c) => {
                let mut controller = c.lock().unwrap_or_else(PoisonError::into_inner);
                let rate = controller.tick_rate();
                controller.observe(measurement);
                controller.checkpoint(&self.controller_path);
                rate
            }
            ControllerLink::Loop(h) => {
                let rate = h.tick_rate();
                h.send(ControlCommand::Observe(measurement.clone())).await;
                rate
            }
        };
        let rate = match tick_rate {
            TickRate::Auto => rate,
            TickRate::Fixed(f) => f,
        };
        measurement.tick.max(rate).clamp(0.0, 1.0)
    }

    // ============================================================
    // Learning
    // ============================================================

    /// Measure, reflect at the depth the pressure earns, then curate.
    pub async fn learn_from_trace(&self, trace: &ExecutionTrace, tick_rate: TickRate) -> Result<LearnReport> {
        let measurement = self.detector.measure(&Observation::from(trace));
        let pressure = self.observe(&measurement, tick_rate).await;
        let depth = ReflectionDepth::for_pressure(pressure);

        let insights = self.reflector.reflect(trace, depth).await;
        let curation = if insights.is_empty() {
            CurationReport::default()
        } else {
            self.curator.curate(&insights, trace.group, Some(&trace.trace_id)).await?
        };

        info!(
            trace = %trace.trace_id,
            tick = measurement.tick,
            pressure,
            depth = %depth,
            insights = insights.len(),
            created = curation.created.len(),
            "learned from trace"
        );
        Ok(LearnReport {
            trace_id: trace.trace_id.clone(),
            novelty: measurement,
            pressure,
            depth,
            insights: insights.len(),
            curation,
        })
    }

    /// Add a bullet by hand. It lands in staging and is routed like any
    /// curated insight.
    pub async fn add(
        &self,
        text: &str,
        group_hint: Group,
        kind: BulletKind,
        tags: Vec<String>,
        confidence: f64,
    ) -> Result<AddOutcome> {
        self.add_with_privilege(text, group_hint, kind, tags, confidence, Privilege::Normal).await
    }

    /// Bootstrap callers skip staging and land QUARANTINED in `group`.
    pub async fn add_with_privilege(
        &self,
        text: &str,
        group: Group,
        kind: BulletKind,
        tags: Vec<String>,
        confidence: f64,
        privilege: Privilege,
    ) -> Result<AddOutcome> {
        let bullet = self.store.create(text, group, kind, tags, confidence, None, privilege)?;
        if bullet.status != BulletStatus::Staged {
            return Ok(AddOutcome { bullet, routing: None });
        }
        let routing = self.curator.route(&bullet.id, &bullet.text, bullet.kind, Some(group)).await?;
        let bullet = self.store.get(&bullet.id)?;
        Ok(AddOutcome { bullet, routing: Some(routing) })
    }

    // ============================================================
    // Retrieval and outcomes
    // ============================================================

    pub fn retrieve(&self, query: &str, groups: &[Group], k: usize, min_confidence: f64) -> (Vec<Bullet>, Vec<String>) {
        let request = RetrievalRequest::new(query, groups.to_vec(), k, min_confidence);
        let (bullets, ids) = self.retriever.retrieve(&request);
        debug!(query, hits = ids.len(), "retrieved");
        (bullets, ids)
    }

    /// Apply an outcome to the bullets that were used. A helpful outcome also
    /// feeds cross-hemisphere suggestions; failures there are logged and do
    /// not fail the outcome.
    pub fn record_outcome(&self, outcome_id: &str, ids: &[String], helpful: bool) -> Result<OutcomeReport> {
        let report = self.store.record_outcome(outcome_id, ids, helpful)?;
        if helpful && self.config.suggestions.enabled && !report.applied.is_empty() {
            if let Err(e) = self.follow_up_suggestions(&report) {
                warn!(outcome_id, error = %e, "suggestion follow-up failed");
            }
        }
        Ok(report)
    }

    fn follow_up_suggestions(&self, report: &OutcomeReport) -> Result<()> {
        let mut by_group: BTreeMap<Group, Vec<Bullet>> = BTreeMap::new();
        for id in &report.applied {
            let Ok(bullet) = self.store.get(id) else { continue };

            // A taught bullet that helps confirms its origin on the other side.
            if let Some(origin) = bullet.metadata.get("origin_bullet_id").and_then(|v| v.as_str()) {
                if self.store.get(origin).is_ok() {
                    let mut meta = Map::new();
                    meta.insert("cross_confirmed".into(), json!(true));
                    meta.insert("cross_confirmed_at".into(), json!(Utc::now()));
                    self.store.annotate(origin, meta)?;
                }
                if report.activated.contains(&bullet.id) {
                    if let Some(sid) = bullet.metadata.get("suggestion_id").and_then(|v| v.as_str()) {
                        self.store.suggestions().resolve(sid, true, "activated")?;
                    }
                }
            }
            if bullet.group.is_agent() {
                by_group.entry(bullet.group).or_default().push(bullet);
            }
        }
        for (group, bullets) in by_group {
            self.curator.generate_suggestions(&bullets, group, None, "successful_outcome")?;
        }
        Ok(())
    }

    // ============================================================
    // Cross-hemisphere suggestions
    // ============================================================

    /// Delivery gate inputs read off the controller.
    pub fn tick_profile(&self) -> TickProfile {
        TickProfile::from_metrics(&self.get_consciousness_metrics(), self.config.suggestions.idle_tick_rate)
    }

    /// Deliver pending suggestions. Without a profile the controller is taken
    /// as idle, which suits explicit operator calls.
    pub fn deliver_suggestions(&self, profile: Option<TickProfile>, to_side: Option<Group>) -> Result<DeliveryReport> {
        self.curator.deliver_suggestions(&profile.unwrap_or_else(TickProfile::idle), to_side, None)
    }

    pub fn list_suggestions(&self, status: Option<SuggestionStatus>, to_side: Option<Group>) -> Vec<Suggestion> {
        self.store.suggestions().list(status, to_side)
    }

    pub fn resolve_suggestion(&self, id: &str, accepted: bool, reason: &str) -> Result<Suggestion> {
        self.store.suggestions().resolve(id, accepted, reason)
    }

    // ============================================================
    // Staging review
    // ============================================================

    pub fn list_staged(&self, priority: Option<ReviewPriority>) -> Vec<Bullet> {
        self.curator.list_staged(priority)
    }

    pub fn assign_staged_bullet(&self, id: &str, group: Group, reviewer: &str) -> Result<Bullet> {
        self.store.assign_staged(id, group, reviewer, serde_json::Map::new())
    }

    pub fn reject_staged_bullet(&self, id: &str, reason: &str, reviewer: &str) -> Result<BackupManifest> {
        self.store.reject_staged(id, reason, reviewer)
    }

    // ============================================================
    // Maintenance
    // ============================================================

    /// Run the selected passes over `group`, or every configured group.
    /// Each unit commits independently; the first hard failure aborts.
    pub fn run_maintenance(&self, group: Option<Group>, plan: &MaintenancePlan) -> Result<MaintenanceStats> {
        let groups = group.map_or_else(|| self.config.maintenance.groups.clone(), |g| vec![g]);
        let mut stats = MaintenanceStats { groups: groups.clone(), dry_run: plan.dry_run, ..Default::default() };

        for group in groups {
            if plan.dedup {
                let report = self.curator.deduplicate(&[group], None, plan.dry_run)?;
                stats.clusters_found += report.clusters_found;
                stats.merged += report.bullets_archived();
                stats.backups.extend(report.merges.into_iter().map(|m| m.backup_id));
            }
            if plan.prune {
                let options = PruneOptions::new(self.config.pruning.policy)
                    .dry_run(plan.dry_run)
                    .force(plan.force)
                    .actor("maintenance");
                let report = self.curator.prune_low_quality(group, &options)?;
                stats.prune_candidates += report.candidates.len();
                stats.pruned += report.pruned.len();
                stats.backups.extend(report.backup_id);
            }
            if plan.promote && group.is_agent() && !plan.dry_run {
                stats.promoted.extend(self.curator.promote_eligible(group)?.into_iter().map(|b| b.id));
            }
        }

        info!(
            merged = stats.merged,
            pruned = stats.pruned,
            promoted = stats.promoted.len(),
            dry_run = stats.dry_run,
            "maintenance complete"
        );
        Ok(stats)
    }

    pub fn scheduler(&self) -> MaintenanceScheduler {
        MaintenanceScheduler::new(self.curator.clone(), self.config.maintenance.clone(), self.config.pruning.policy)
    }

    /// Quality distribution of live bullets in `group`.
    pub fn quality_report(&self, group: Group) -> QualityDistribution {
        let bullets: Vec<Bullet> = self
            .store
            .list(group, None, None)
            .into_iter()
            .filter(|b| !matches!(b.status, BulletStatus::Deprecated | BulletStatus::Staged))
            .collect();
        QualityDistribution::from_bullets(&bullets)
    }

    pub fn list_backups(&self) -> Result<Vec<BackupManifest>> {
        self.curator.pruner().list_backups()
    }

    pub fn rollback(&self, backup_id: &str, actor: &str) -> Result<BackupManifest> {
        self.curator.pruner().rollback(backup_id, actor)
    }

    pub fn restore_bullets(&self, ids: &[String], actor: &str) -> Result<Vec<String>> {
        self.curator.pruner().restore_bullets(ids, actor)
    }

    /// Cancel in-flight deep reflection and checkpoint the in-process controller.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let ControllerLink::Local(c) = &self.controller {
            c.lock().unwrap_or_else(PoisonError::into_inner).checkpoint(&self.controller_path);
        }
    }
}
