//! Backups taken before any destructive change.
//!
//! Layout: `<root>/backups/<backup_id>/{manifest.json,bullets.json}`.
//! A backup directory is written under a `.tmp` name and renamed into place,
//! so a listed backup is always complete.

use chrono::{DateTime, Utc};
use playbook_core::{Bullet, Error, Group, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupManifest {
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    pub actor: String,
    pub groups: Vec<Group>,
    pub bullet_count: usize,
    pub ids: Vec<String>,
}

pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serialize `bullets` plus a manifest. Returns once the backup is durable.
    pub fn write(&self, bullets: &[Bullet], reason: &str, actor: &str) -> Result<BackupManifest> {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let backup_id = format!("backup_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &uuid[..8]);
        let groups: BTreeSet<Group> = bullets.iter().map(|b| b.group).collect();
        let manifest = BackupManifest {
            backup_id: backup_id.clone(),
            created_at: Utc::now(),
            reason: reason.to_string(),
            actor: actor.to_string(),
            groups: groups.into_iter().collect(),
            bullet_count: bullets.len(),
            ids: bullets.iter().map(|b| b.id.clone()).collect(),
        };

        let staging = self.dir.join(format!("{backup_id}.tmp"));
        std::fs::create_dir_all(&staging)?;
        std::fs::write(staging.join("bullets.json"), serde_json::to_vec_pretty(bullets)?)?;
        std::fs::write(staging.join("manifest.json"), serde_json::to_vec_pretty(&manifest)?)?;
        std::fs::rename(&staging, self.dir.join(&backup_id))?;

        info!(backup_id = %backup_id, bullets = bullets.len(), reason, "backup written");
        Ok(manifest)
    }

    pub fn load(&self, backup_id: &str) -> Result<(BackupManifest, Vec<Bullet>)> {
        if backup_id.contains(['/', '\\']) || backup_id.starts_with('.') {
            return Err(Error::BackupNotFound(backup_id.to_string()));
        }
        let path = self.dir.join(backup_id);
        if !path.is_dir() {
            return Err(Error::BackupNotFound(backup_id.to_string()));
        }
        let manifest: BackupManifest = serde_json::from_slice(&std::fs::read(path.join("manifest.json"))?)?;
        let bullets: Vec<Bullet> = serde_json::from_slice(&std::fs::read(path.join("bullets.json"))?)?;
        Ok((manifest, bullets))
    }

    /// All complete backups, newest first.
    pub fn list(&self) -> Result<Vec<BackupManifest>> {
        let mut manifests = Vec::new();
        for entry in std::fs::read_dir(&self.dir)?.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() || path.extension().is_some_and(|e| e == "tmp") {
                continue;
            }
            match std::fs::read(path.join("manifest.json")) {
                Ok(bytes) => match serde_json::from_slice::<BackupManifest>(&bytes) {
                    Ok(m) => manifests.push(m),
                    Err(e) => warn!("Skipping unreadable manifest in {}: {}", path.display(), e),
                },
                Err(e) => debug!("No manifest in {}: {}", path.display(), e),
            }
        }
        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.backup_id.cmp(&a.backup_id)));
        Ok(manifests)
    }

    /// Most recent backed-up copy of `id`, if any backup holds it.
    pub fn latest_copy_of(&self, id: &str) -> Result<Option<(BackupManifest, Bullet)>> {
        for manifest in self.list()? {
            if !manifest.ids.iter().any(|i| i == id) {
                continue;
            }
            let (manifest, bullets) = self.load(&manifest.backup_id)?;
            if let Some(b) = bullets.into_iter().find(|b| b.id == id) {
                return Ok(Some((manifest, b)));
            }
        }
        Ok(None)
    }
}

/// Write JSON to `path` atomically: `<path>.tmp` then rename.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, &serde_json::to_vec_pretty(value)?)
}

/// Write `<path>.tmp`, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use playbook_core::{BulletKind, BulletStatus};

    fn bullet(text: &str) -> Bullet {
        Bullet::new(text, Group::Left, BulletKind::Heuristic, vec![], 0.7, BulletStatus::Active)
    }

    #[test]
    fn write_then_load_returns_same_bullets() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path().join("backups")).unwrap();
        let bullets = vec![bullet("one"), bullet("two")];
        let manifest = store.write(&bullets, "prune", "tester").unwrap();
        let (loaded_manifest, loaded) = store.load(&manifest.backup_id).unwrap();
        assert_eq!(loaded_manifest, manifest);
        assert_eq!(loaded, bullets);
        assert!(!store.dir().join(format!("{}.tmp", manifest.backup_id)).exists());
    }

    #[test]
    fn missing_backup_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path().to_path_buf()).unwrap();
        assert!(matches!(store.load("backup_nope"), Err(Error::BackupNotFound(_))));
        assert!(matches!(store.load("../etc"), Err(Error::BackupNotFound(_))));
    }

    #[test]
    fn latest_copy_prefers_newest_backup() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = BackupStore::new(tmp.path().to_path_buf()).unwrap();
        let mut b = bullet("evolving");
        store.write(std::slice::from_ref(&b), "first", "t").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        b.helpful_count = 9;
        store.write(std::slice::from_ref(&b), "second", "t").unwrap();
        let (manifest, copy) = store.latest_copy_of(&b.id).unwrap().unwrap();
        assert_eq!(manifest.reason, "second");
        assert_eq!(copy.helpful_count, 9);
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("x.json");
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
