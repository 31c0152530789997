//! Playbook Learning - reflection, curation and maintenance
//!
//! The write side of the playbook:
//! - [`Reflector`] turns execution traces into candidate insights
//! - [`Curator`] filters and deduplicates them into staging, then routes
//!   them through the [`HemisphereClassifier`]
//! - [`Deduplicator`], [`Pruner`] and [`MaintenanceScheduler`] keep the
//!   collections healthy, always behind a backup
//! - [`suggestions`] offers proven bullets from one agent group to the other
//! - [`Playbook`] ties it together with the store and the controller

pub mod classifier;
pub mod curator;
pub mod dedup;
pub mod exemplars;
pub mod formatter;
pub mod pipeline;
pub mod pruner;
pub mod quality;
pub mod reflector;
pub mod scheduler;
pub mod suggestions;

pub use classifier::{Classification, HemisphereClassifier};
pub use curator::{CurationReport, Curator, ReviewPriority, Routing};
pub use dedup::{merge_cluster, DedupReport, Deduplicator, DuplicateCluster};
pub use formatter::{format_bullets_compact, format_bullets_for_prompt, translate_for_shared};
pub use pipeline::{AddOutcome, LearnReport, MaintenancePlan, MaintenanceStats, Playbook, TickRate};
pub use pruner::{PruneOptions, PruneReport, Pruner};
pub use quality::{PruneReason, QualityAnalyzer, QualityDistribution};
pub use reflector::Reflector;
pub use scheduler::{MaintenanceScheduler, MaintenanceTask, TaskRun};
pub use suggestions::{can_deliver, should_suggest, ConflictDetector, DeliveryReport, TickProfile};
