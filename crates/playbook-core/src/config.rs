//! Playbook configuration
//!
//! All thresholds in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use crate::error::{Error, Result};
use crate::types::Group;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybookConfig {
    /// Where collections, backups and the audit log live.
    pub storage: StorageConfig,
    /// Lifecycle thresholds. Global across groups, merges included.
    pub lifecycle: LifecycleConfig,
    /// Retrieval profiles and fusion parameters.
    pub retrieval: RetrievalConfig,
    /// Reflection limits and generative-call bounds.
    pub reflection: ReflectionConfig,
    /// Curation filters.
    pub curation: CurationConfig,
    /// Hemisphere classifier decision bands.
    pub classifier: ClassifierConfig,
    /// Near-duplicate merging.
    pub dedup: DedupConfig,
    /// Quality policy and prune safety limits.
    pub pruning: PruningConfig,
    /// Background maintenance schedule.
    pub maintenance: MaintenanceConfig,
    /// Execution-pressure controller.
    pub controller: ControllerConfig,
    /// Cross-hemisphere suggestions. Off unless enabled.
    pub suggestions: SuggestionConfig,
    /// Generative text service.
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store root directory. `~/` is expanded by the CLI.
    pub root: String,
    /// Dimension of the local hashing embedder.
    pub embedding_dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Helpful outcomes (with zero harmful) needed for QUARANTINED -> ACTIVE.
    pub quarantine_threshold: u32,
    /// Helpful outcomes (with zero harmful) needed for promotion into shared.
    pub promote_threshold: u32,
    /// Promote from `record_outcome` as soon as a bullet qualifies.
    pub auto_promote: bool,
    /// Rank multiplier applied to the caller's own quarantined bullets.
    pub quarantine_trust: f64,
    /// Days an applied outcome id is remembered for idempotency. 0 keeps
    /// them forever; a retry older than the window counts again.
    pub outcome_retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub precision_k: usize,
    pub precision_min_confidence: f64,
    pub exploration_k: usize,
    pub exploration_min_confidence: f64,
    /// MMR trade-off for the exploration profile (0 = pure relevance).
    pub exploration_diversity: f64,
    /// Reciprocal rank fusion constant.
    pub rrf_constant: f64,
    pub adaptive_min_k: usize,
    pub adaptive_max_k: usize,
    /// Top score below which adaptive retrieval widens to `adaptive_max_k`.
    pub adaptive_confident_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    /// Upper bound on the deep-reflection generative call.
    pub generation_timeout_secs: u64,
    pub medium_max_insights: usize,
    pub deep_max_insights: usize,
    /// Max chars of the task description quoted into insight text.
    pub task_excerpt_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurationConfig {
    pub min_confidence: f64,
    pub min_text_len: usize,
    /// Cosine similarity at or above which an insight merges into an existing bullet.
    pub duplicate_threshold: f64,
    /// Neutralize absolute phrasing when copying into shared.
    pub translate_on_promote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// At or above: assigned automatically.
    pub auto_assign_threshold: f64,
    /// Below: left in staging for manual review. Between: assigned, flagged for audit.
    pub manual_review_threshold: f64,
    /// Relative margin under which the contest counts as ambiguous.
    pub ambiguity_margin: f64,
    /// Both sides under this score means no real signal.
    pub min_signal: f64,
    /// Ask the generative service to break ties.
    pub use_tie_break: bool,
    pub tie_break_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub similarity_threshold: f64,
    pub min_cluster_size: usize,
    /// Safety cap on cluster merges per run.
    pub max_merges_per_run: usize,
}

/// Named low-quality policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrunePolicy {
    Aggressive,
    Balanced,
    Conservative,
}

impl std::str::FromStr for PrunePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aggressive" => Ok(PrunePolicy::Aggressive),
            "balanced" => Ok(PrunePolicy::Balanced),
            "conservative" => Ok(PrunePolicy::Conservative),
            other => Err(format!("unknown prune policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    pub policy: PrunePolicy,
    pub max_prune_per_run: usize,
    /// Runs larger than this need `force`.
    pub require_confirmation_threshold: usize,
    /// Bullets committed per unit of work after the backup is written.
    pub batch_size: usize,
    /// Remove records instead of marking them deprecated.
    pub hard_delete: bool,
    pub low_confidence_threshold: f64,
}

/// How often a maintenance task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Schedule {
    Manual,
    Daily,
    Weekly,
    Monthly,
}

impl Schedule {
    pub fn period(self) -> Option<chrono::Duration> {
        match self {
            Schedule::Manual => None,
            Schedule::Daily => Some(chrono::Duration::days(1)),
            Schedule::Weekly => Some(chrono::Duration::weeks(1)),
            Schedule::Monthly => Some(chrono::Duration::days(30)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub dedup_schedule: Schedule,
    pub prune_schedule: Schedule,
    pub promote_schedule: Schedule,
    /// How often the scheduler loop wakes to check for due tasks.
    pub check_interval_secs: u64,
    pub history_limit: usize,
    pub groups: Vec<Group>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Weight of the previous value in every moving average.
    pub ema_decay: f64,
    pub initial_tick_rate: f64,
    pub entropy_threshold: f64,
    pub conflict_threshold: f64,
    pub novelty_threshold: f64,
    /// Agent confidence below which a low-confidence signal fires.
    pub baseline_confidence: f64,
    pub max_energy: f64,
    pub energy_regen_per_sec: f64,
    pub explore_cost: f64,
    pub exploit_cost: f64,
    pub integrate_cost: f64,
    pub min_interval_secs: f64,
    pub max_interval_secs: f64,
    /// Fatigue gained per second at full cognitive load.
    pub fatigue_rate: f64,
    pub engagement_baseline: f64,
    pub exploration: ExplorationConfig,
}

/// Forced exploration rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplorationMode {
    Off,
    Quota,
    Interval,
    Stuck,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorationConfig {
    pub mode: ExplorationMode,
    pub window_size: usize,
    pub min_explore_fraction: f64,
    pub interval_ticks: u64,
    pub stuck_window: usize,
    /// Tick-rate spread under which the window counts as stuck.
    pub stuck_epsilon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestionConfig {
    pub enabled: bool,
    /// Helpful outcomes a bullet needs before it is offered to the other side.
    pub suggest_threshold: u32,
    pub harmful_tolerance: u32,
    pub min_suggest_confidence: f64,
    /// Cap on pending suggestions; 0 means unlimited.
    pub max_pending: usize,
    /// Deliver only while the controller is idle.
    pub deliver_when_idle: bool,
    pub max_pressure_to_deliver: f64,
    pub deliver_budget_per_tick: usize,
    /// Pending or delivered suggestions older than this expire; 0 disables expiry.
    pub expiry_days: u32,
    /// Word-overlap ratio at or above which two texts count as the same advice.
    pub equivalence_threshold: f64,
    pub conflicts_enabled: bool,
    /// Word-overlap ratio above which opposite-polarity texts conflict.
    pub conflict_similarity: f64,
    /// Tick rate at or below which an exploiting controller counts as idle.
    pub idle_tick_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// "anthropic" or "none".
    pub provider: String,
    pub model: String,
    pub max_tokens: u32,
    pub base_url: String,
    pub api_key_env: String,
}

// ============================================================
// Defaults
// ============================================================

impl Default for StorageConfig {
    fn default() -> Self {
        Self { root: "~/.playbook".into(), embedding_dimension: 256 }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            quarantine_threshold: 2,
            promote_threshold: 3,
            auto_promote: true,
            quarantine_trust: 0.5,
            outcome_retention_days: 90,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            precision_k: 8,
            precision_min_confidence: 0.6,
            exploration_k: 16,
            exploration_min_confidence: 0.2,
            exploration_diversity: 0.5,
            rrf_constant: 60.0,
            adaptive_min_k: 5,
            adaptive_max_k: 20,
            adaptive_confident_score: 0.5,
        }
    }
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self { generation_timeout_secs: 30, medium_max_insights: 3, deep_max_insights: 5, task_excerpt_chars: 120 }
    }
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self { min_confidence: 0.5, min_text_len: 10, duplicate_threshold: 0.90, translate_on_promote: false }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            auto_assign_threshold: 0.85,
            manual_review_threshold: 0.7,
            ambiguity_margin: 0.2,
            min_signal: 0.15,
            use_tie_break: true,
            tie_break_timeout_secs: 15,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { similarity_threshold: 0.90, min_cluster_size: 2, max_merges_per_run: 50 }
    }
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            policy: PrunePolicy::Balanced,
            max_prune_per_run: 100,
            require_confirmation_threshold: 50,
            batch_size: 25,
            hard_delete: false,
            low_confidence_threshold: 0.2,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            dedup_schedule: Schedule::Daily,
            prune_schedule: Schedule::Weekly,
            promote_schedule: Schedule::Daily,
            check_interval_secs: 3600,
            history_limit: 100,
            groups: vec![Group::Left, Group::Right, Group::Shared],
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ema_decay: 0.8,
            initial_tick_rate: 0.3,
            entropy_threshold: 0.6,
            conflict_threshold: 0.5,
            novelty_threshold: 0.7,
            baseline_confidence: 0.7,
            max_energy: 100.0,
            energy_regen_per_sec: 10.0,
            explore_cost: 15.0,
            exploit_cost: 5.0,
            integrate_cost: 20.0,
            min_interval_secs: 0.1,
            max_interval_secs: 2.0,
            fatigue_rate: 0.001,
            engagement_baseline: 0.5,
            exploration: ExplorationConfig::default(),
        }
    }
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            mode: ExplorationMode::Hybrid,
            window_size: 50,
            min_explore_fraction: 0.25,
            interval_ticks: 20,
            stuck_window: 6,
            stuck_epsilon: 0.02,
        }
    }
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            suggest_threshold: 2,
            harmful_tolerance: 0,
            min_suggest_confidence: 0.65,
            max_pending: 0,
            deliver_when_idle: true,
            max_pressure_to_deliver: 0.35,
            deliver_budget_per_tick: 1,
            expiry_days: 0,
            equivalence_threshold: 0.9,
            conflicts_enabled: true,
            conflict_similarity: 0.88,
            idle_tick_rate: 0.2,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "none".into(),
            model: "claude-haiku-4-5".into(),
            max_tokens: 1024,
            base_url: "https://api.anthropic.com/v1/messages".into(),
            api_key_env: "ANTHROPIC_API_KEY".into(),
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl PlaybookConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Reject threshold combinations that would make the lifecycle incoherent.
    pub fn validate(&self) -> Result<()> {
        let c = &self.classifier;
        if c.manual_review_threshold > c.auto_assign_threshold {
            return Err(Error::Config(format!(
                "classifier.manual_review_threshold ({}) exceeds auto_assign_threshold ({})",
                c.manual_review_threshold, c.auto_assign_threshold
            )));
        }
        if self.lifecycle.promote_threshold < self.lifecycle.quarantine_threshold {
            return Err(Error::Config("lifecycle.promote_threshold is below quarantine_threshold".into()));
        }
        let ctl = &self.controller;
        if !(0.0..1.0).contains(&ctl.ema_decay) {
            return Err(Error::Config(format!("controller.ema_decay must be in [0,1), got {}", ctl.ema_decay)));
        }
        if ctl.min_interval_secs <= 0.0 || ctl.min_interval_secs > ctl.max_interval_secs {
            return Err(Error::Config("controller interval bounds are inverted or non-positive".into()));
        }
        if ctl.max_energy <= 0.0 {
            return Err(Error::Config("controller.max_energy must be positive".into()));
        }
        for (name, t) in [
            ("curation.duplicate_threshold", self.curation.duplicate_threshold),
            ("dedup.similarity_threshold", self.dedup.similarity_threshold),
            ("suggestions.equivalence_threshold", self.suggestions.equivalence_threshold),
            ("suggestions.conflict_similarity", self.suggestions.conflict_similarity),
        ] {
            if !(0.0..=1.0).contains(&t) {
                return Err(Error::Config(format!("{name} must be in [0,1], got {t}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        PlaybookConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_round_trip_keeps_sections() {
        let cfg = PlaybookConfig::default();
        let text = cfg.to_toml();
        assert!(text.contains("[lifecycle]"));
        assert!(text.contains("[controller.exploration]"));
        let back: PlaybookConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.lifecycle.promote_threshold, 3);
        assert_eq!(back.pruning.policy, PrunePolicy::Balanced);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: PlaybookConfig = toml::from_str("[lifecycle]\nquarantine_threshold = 4\npromote_threshold = 6\n").unwrap();
        assert_eq!(cfg.lifecycle.quarantine_threshold, 4);
        assert_eq!(cfg.classifier.auto_assign_threshold, 0.85);
        assert_eq!(cfg.maintenance.dedup_schedule, Schedule::Daily);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = PlaybookConfig::load(&tmp.path().join("absent.toml"));
        assert_eq!(cfg.controller.max_energy, 100.0);
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "[lifecycle\nnot toml").unwrap();
        let cfg = PlaybookConfig::load(&path);
        assert_eq!(cfg.lifecycle.quarantine_threshold, 2);
    }

    #[test]
    fn suggestions_default_off_and_parse() {
        assert!(!PlaybookConfig::default().suggestions.enabled);
        let cfg: PlaybookConfig = toml::from_str("[suggestions]\nenabled = true\nmax_pending = 4\n").unwrap();
        assert!(cfg.suggestions.enabled);
        assert_eq!(cfg.suggestions.max_pending, 4);
        assert_eq!(cfg.suggestions.suggest_threshold, 2);
        assert_eq!(cfg.lifecycle.outcome_retention_days, 90);
    }

    #[test]
    fn inverted_classifier_bands_rejected() {
        let mut cfg = PlaybookConfig::default();
        cfg.classifier.manual_review_threshold = 0.9;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
