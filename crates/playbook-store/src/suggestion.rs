//! Cross-hemisphere suggestions (`suggestions.jsonl`).
//!
//! A suggestion offers a proven bullet from one agent group to the other.
//! It moves pending -> delivered -> accepted/rejected, and either of the
//! first two may expire. The whole file is rewritten atomically on change.

use crate::backup::write_atomic;
use chrono::{DateTime, Duration, Utc};
use playbook_core::{Bullet, BulletKind, Error, Group, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionStatus {
    Pending,
    Delivered,
    Accepted,
    Rejected,
    Expired,
}

impl SuggestionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Delivered => "delivered",
            SuggestionStatus::Accepted => "accepted",
            SuggestionStatus::Rejected => "rejected",
            SuggestionStatus::Expired => "expired",
        }
    }

    /// Still in flight: blocks a second suggestion of the same origin.
    pub fn is_active(self) -> bool {
        matches!(self, SuggestionStatus::Pending | SuggestionStatus::Delivered)
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuggestionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(SuggestionStatus::Pending),
            "delivered" => Ok(SuggestionStatus::Delivered),
            "accepted" => Ok(SuggestionStatus::Accepted),
            "rejected" => Ok(SuggestionStatus::Rejected),
            "expired" => Ok(SuggestionStatus::Expired),
            other => Err(format!("unknown suggestion status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub suggestion_id: String,
    pub from_side: Group,
    pub to_side: Group,
    pub origin_bullet_id: String,
    pub suggested_text: String,
    pub kind: BulletKind,
    #[serde(default)]
    pub tags: Vec<String>,
    pub reason: String,
    pub status: SuggestionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_bullet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_reason: Option<String>,
}

impl Suggestion {
    /// A pending suggestion to copy `origin` into `to_side`.
    pub fn from_bullet(origin: &Bullet, to_side: Group, reason: &str) -> Self {
        Self {
            suggestion_id: Self::generate_id(),
            from_side: origin.group,
            to_side,
            origin_bullet_id: origin.id.clone(),
            suggested_text: origin.text.clone(),
            kind: origin.kind,
            tags: origin.tags.iter().cloned().collect(),
            reason: reason.to_string(),
            status: SuggestionStatus::Pending,
            created_at: Utc::now(),
            delivered_at: None,
            resolved_at: None,
            trace_ids: origin.source_trace_id.iter().cloned().collect(),
            delivered_bullet_id: None,
            resolution_reason: None,
        }
    }

    /// `sg_{hex10}`
    pub fn generate_id() -> String {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        format!("sg_{}", &uuid[..10])
    }
}

pub struct SuggestionStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Suggestion>>,
}

impl SuggestionStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut entries = BTreeMap::new();
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                for (n, line) in content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                    let s: Suggestion = serde_json::from_str(line).map_err(|e| {
                        Error::store(format!("corrupt suggestion at {}:{}: {}", path.display(), n + 1, e))
                    })?;
                    entries.insert(s.suggestion_id.clone(), s);
                }
                debug!("Loaded {} suggestions", entries.len());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self { path, entries: Mutex::new(entries) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create(&self, suggestion: Suggestion) -> Result<Suggestion> {
        let mut entries = self.lock()?;
        if entries.contains_key(&suggestion.suggestion_id) {
            return Err(Error::invariant(format!("duplicate suggestion id {}", suggestion.suggestion_id)));
        }
        entries.insert(suggestion.suggestion_id.clone(), suggestion.clone());
        self.persist(&entries)?;
        Ok(suggestion)
    }

    pub fn get(&self, id: &str) -> Option<Suggestion> {
        self.lock().ok().and_then(|e| e.get(id).cloned())
    }

    /// Oldest first, optionally filtered by status and target.
    pub fn list(&self, status: Option<SuggestionStatus>, to_side: Option<Group>) -> Vec<Suggestion> {
        let Ok(entries) = self.lock() else { return Vec::new() };
        let mut out: Vec<Suggestion> = entries
            .values()
            .filter(|s| status.map_or(true, |st| s.status == st))
            .filter(|s| to_side.map_or(true, |g| s.to_side == g))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.suggestion_id.cmp(&b.suggestion_id)));
        out
    }

    pub fn list_pending(&self, to_side: Option<Group>) -> Vec<Suggestion> {
        self.list(Some(SuggestionStatus::Pending), to_side)
    }

    pub fn count(&self, status: Option<SuggestionStatus>) -> usize {
        self.lock().map(|e| e.values().filter(|s| status.map_or(true, |st| s.status == st)).count()).unwrap_or(0)
    }

    /// A pending or delivered suggestion of `origin` into `to_side` exists.
    pub fn exists_active(&self, origin: &str, to_side: Group) -> bool {
        self.lock()
            .map(|e| e.values().any(|s| s.origin_bullet_id == origin && s.to_side == to_side && s.status.is_active()))
            .unwrap_or(false)
    }

    pub fn mark_delivered(&self, id: &str, bullet_id: &str) -> Result<Suggestion> {
        self.transition(id, |s| {
            if s.status != SuggestionStatus::Pending {
                return Err(Error::invariant(format!("suggestion {id} is {}, only pending ones are delivered", s.status)));
            }
            s.status = SuggestionStatus::Delivered;
            s.delivered_at = Some(Utc::now());
            s.delivered_bullet_id = Some(bullet_id.to_string());
            Ok(())
        })
    }

    /// Close an in-flight suggestion as accepted or rejected.
    pub fn resolve(&self, id: &str, accepted: bool, reason: &str) -> Result<Suggestion> {
        self.transition(id, |s| {
            if !s.status.is_active() {
                return Err(Error::invariant(format!("suggestion {id} is already {}", s.status)));
            }
            s.status = if accepted { SuggestionStatus::Accepted } else { SuggestionStatus::Rejected };
            s.resolved_at = Some(Utc::now());
            s.resolution_reason = Some(reason.to_string());
            Ok(())
        })
    }

    /// Expire pending suggestions older than `max_age_days` since creation and
    /// delivered ones older than that since delivery. Returns how many expired.
    pub fn expire_old(&self, max_age_days: u32, now: DateTime<Utc>) -> Result<usize> {
        if max_age_days == 0 {
            return Ok(0);
        }
        let cutoff = now - Duration::days(i64::from(max_age_days));
        let mut entries = self.lock()?;
        let mut expired = 0;
        for s in entries.values_mut() {
            let since = match s.status {
                SuggestionStatus::Pending => s.created_at,
                SuggestionStatus::Delivered => s.delivered_at.unwrap_or(s.created_at),
                _ => continue,
            };
            if since < cutoff {
                s.status = SuggestionStatus::Expired;
                s.resolved_at = Some(now);
                s.resolution_reason = Some("expired".into());
                expired += 1;
            }
        }
        if expired > 0 {
            self.persist(&entries)?;
            info!(expired, "suggestions expired");
        }
        Ok(expired)
    }

    fn transition<F>(&self, id: &str, f: F) -> Result<Suggestion>
    where
        F: FnOnce(&mut Suggestion) -> Result<()>,
    {
        let mut entries = self.lock()?;
        let current = entries.get(id).ok_or_else(|| Error::store(format!("suggestion {id} not found")))?;
        let mut draft = current.clone();
        f(&mut draft)?;
        entries.insert(id.to_string(), draft.clone());
        self.persist(&entries)?;
        Ok(draft)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Suggestion>>> {
        self.entries.lock().map_err(|_| Error::store("suggestion store lock poisoned"))
    }

    fn persist(&self, entries: &BTreeMap<String, Suggestion>) -> Result<()> {
        let mut ordered: Vec<&Suggestion> = entries.values().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.suggestion_id.cmp(&b.suggestion_id)));
        let mut out = String::new();
        for s in ordered {
            out.push_str(&serde_json::to_string(s)?);
            out.push('\n');
        }
        write_atomic(&self.path, out.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playbook_core::BulletStatus;

    fn origin(text: &str) -> Bullet {
        Bullet::new(text, Group::Left, BulletKind::Heuristic, vec!["http".into()], 0.8, BulletStatus::Active)
    }

    fn open(tmp: &tempfile::TempDir) -> SuggestionStore {
        SuggestionStore::open(tmp.path().join("suggestions.jsonl")).unwrap()
    }

    #[test]
    fn lifecycle_persists_across_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(&tmp);
        let b = origin("Check status codes before parsing");
        let s = store.create(Suggestion::from_bullet(&b, Group::Right, "successful_outcome")).unwrap();
        assert!(s.suggestion_id.starts_with("sg_"));
        assert_eq!(s.suggestion_id.len(), 13);
        assert!(store.exists_active(&b.id, Group::Right));
        assert!(!store.exists_active(&b.id, Group::Left));

        store.mark_delivered(&s.suggestion_id, "pb_1_aaaa").unwrap();
        assert!(store.mark_delivered(&s.suggestion_id, "pb_1_aaaa").is_err());
        assert!(store.exists_active(&b.id, Group::Right));

        let reopened = open(&tmp);
        let got = reopened.get(&s.suggestion_id).unwrap();
        assert_eq!(got.status, SuggestionStatus::Delivered);
        assert_eq!(got.delivered_bullet_id.as_deref(), Some("pb_1_aaaa"));

        reopened.resolve(&s.suggestion_id, false, "not useful here").unwrap();
        assert!(!reopened.exists_active(&b.id, Group::Right));
        assert!(reopened.resolve(&s.suggestion_id, true, "again").is_err());
        assert_eq!(reopened.count(Some(SuggestionStatus::Rejected)), 1);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(&tmp);
        let s = Suggestion::from_bullet(&origin("Pin versions"), Group::Right, "manual");
        store.create(s.clone()).unwrap();
        assert!(matches!(store.create(s), Err(Error::InvariantViolation(_))));
        assert_eq!(store.count(None), 1);
    }

    #[test]
    fn expiry_ages_pending_from_creation_and_delivered_from_delivery() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(&tmp);
        let now = Utc::now();
        let mut old_pending = Suggestion::from_bullet(&origin("one"), Group::Right, "r");
        old_pending.created_at = now - Duration::days(10);
        let mut fresh_delivery = Suggestion::from_bullet(&origin("two"), Group::Right, "r");
        fresh_delivery.created_at = now - Duration::days(10);
        fresh_delivery.status = SuggestionStatus::Delivered;
        fresh_delivery.delivered_at = Some(now - Duration::days(1));
        let young = Suggestion::from_bullet(&origin("three"), Group::Right, "r");
        for s in [&old_pending, &fresh_delivery, &young] {
            store.create(s.clone()).unwrap();
        }

        assert_eq!(store.expire_old(0, now).unwrap(), 0);
        assert_eq!(store.expire_old(7, now).unwrap(), 1);
        assert_eq!(store.get(&old_pending.suggestion_id).unwrap().status, SuggestionStatus::Expired);
        assert_eq!(store.get(&fresh_delivery.suggestion_id).unwrap().status, SuggestionStatus::Delivered);
        assert_eq!(store.list_pending(Some(Group::Right)).len(), 1);
    }

    #[test]
    fn pending_list_is_oldest_first() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open(&tmp);
        let later = Suggestion::from_bullet(&origin("later"), Group::Right, "r");
        let mut earlier = Suggestion::from_bullet(&origin("earlier"), Group::Right, "r");
        earlier.created_at = later.created_at - Duration::seconds(5);
        store.create(later.clone()).unwrap();
        store.create(earlier.clone()).unwrap();
        let ids: Vec<_> = store.list_pending(None).into_iter().map(|s| s.suggestion_id).collect();
        assert_eq!(ids, vec![earlier.suggestion_id, later.suggestion_id]);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Delivered".parse::<SuggestionStatus>().unwrap(), SuggestionStatus::Delivered);
        assert!("maybe".parse::<SuggestionStatus>().is_err());
    }
}
