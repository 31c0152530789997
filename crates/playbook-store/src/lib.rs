//! Playbook Store - persistent, embedding-indexed bullet collections
//!
//! Layout under the store root:
//! - `collections/<group>.json`: one collection per group, staging included
//! - `outcomes.json`: applied outcome ids with timestamps (idempotent `record_outcome`)
//! - `audit.jsonl`: append-only maintenance/audit log
//! - `backups/<backup_id>/`: pre-destruction snapshots
//! - `suggestions.jsonl`: cross-hemisphere suggestions

pub mod audit;
pub mod backup;
pub mod collection;
pub mod embedding;
pub mod retrieval;
pub mod store;
pub mod suggestion;

pub use audit::{AuditEvent, AuditLog, AuditStatus};
pub use backup::{BackupManifest, BackupStore};
pub use collection::{Collection, ExclusiveGuard};
pub use embedding::{cosine, tokenize, word_overlap, Embedder, HashEmbedder};
pub use retrieval::{Fusion, Ranked, RetrievalProfile, RetrievalRequest, Retriever};
pub use store::{guard_for, BulletStore, OutcomeReport, StoreStats};
pub use suggestion::{Suggestion, SuggestionStatus, SuggestionStore};
