//! One persisted, embedding-indexed collection per group.
//!
//! Records live in a `DashMap`, so a single bullet's read-modify-write is
//! atomic under its shard lock. A per-collection gate serializes cross-bullet
//! maintenance against individual updates: updates hold it shared, merges and
//! prunes hold it exclusively through [`ExclusiveGuard`].

use crate::backup::write_json_atomic;
use crate::embedding::Embedder;
use dashmap::DashMap;
use playbook_core::{Bullet, Error, Group, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CollectionFile {
    version: u32,
    group: Group,
    bullets: Vec<Bullet>,
}

pub struct Collection {
    group: Group,
    path: PathBuf,
    bullets: DashMap<String, Bullet>,
    vectors: DashMap<String, Vec<f32>>,
    gate: RwLock<()>,
    flush_lock: Mutex<()>,
}

impl Collection {
    /// Load `<dir>/<group>.json`, or start empty if it does not exist.
    pub fn open(dir: &Path, group: Group, embedder: &dyn Embedder) -> Result<Self> {
        let path = dir.join(format!("{}.json", group));
        let collection = Self {
            group,
            path,
            bullets: DashMap::new(),
            vectors: DashMap::new(),
            gate: RwLock::new(()),
            flush_lock: Mutex::new(()),
        };

        match std::fs::read(&collection.path) {
            Ok(bytes) => {
                let file: CollectionFile = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::store(format!("corrupt collection {}: {}", collection.path.display(), e))
                })?;
                if file.version != FORMAT_VERSION {
                    warn!("Collection {} has format version {}, expected {}", group, file.version, FORMAT_VERSION);
                }
                for bullet in file.bullets {
                    collection.vectors.insert(bullet.id.clone(), embedder.embed(&bullet.text));
                    collection.bullets.insert(bullet.id.clone(), bullet);
                }
                info!("Loaded {} bullets into {}", collection.bullets.len(), group);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No collection file for {}, starting empty", group);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(collection)
    }

    pub fn group(&self) -> Group {
        self.group
    }

    pub fn len(&self) -> usize {
        self.bullets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bullets.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.bullets.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Bullet> {
        self.bullets.get(id).map(|b| b.clone())
    }

    pub fn vector(&self, id: &str) -> Option<Vec<f32>> {
        self.vectors.get(id).map(|v| v.clone())
    }

    /// Point-in-time copy of every record with its embedding.
    pub fn snapshot(&self) -> Vec<(Bullet, Vec<f32>)> {
        self.bullets
            .iter()
            .map(|entry| {
                let vector = self.vectors.get(entry.key()).map(|v| v.clone()).unwrap_or_default();
                (entry.value().clone(), vector)
            })
            .collect()
    }

    pub fn bullets(&self) -> Vec<Bullet> {
        self.bullets.iter().map(|e| e.value().clone()).collect()
    }

    /// Insert a new record. Fails if the id is already present.
    pub fn insert(&self, bullet: Bullet, vector: Vec<f32>) -> Result<Bullet> {
        let _shared = self.shared()?;
        match self.bullets.entry(bullet.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::invariant(format!("duplicate bullet id {} in {}", bullet.id, self.group)));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                self.vectors.insert(bullet.id.clone(), vector);
                slot.insert(bullet.clone());
            }
        }
        self.flush()?;
        Ok(bullet)
    }

    /// Atomic read-modify-write of one record. `f` works on a copy; nothing
    /// is written back if it returns an error.
    pub fn update<F>(&self, id: &str, f: F) -> Result<Bullet>
    where
        F: FnOnce(&mut Bullet) -> Result<()>,
    {
        let _shared = self.shared()?;
        let updated = {
            let mut entry = self.bullets.get_mut(id).ok_or_else(|| Error::BulletNotFound(id.to_string()))?;
            let mut draft = entry.clone();
            f(&mut draft)?;
            *entry = draft.clone();
            draft
        };
        self.flush()?;
        Ok(updated)
    }

    /// Take the collection exclusively for a cross-bullet unit of work.
    pub fn lock_exclusive(&self) -> Result<ExclusiveGuard<'_>> {
        let guard = self.gate.write().map_err(|_| Error::store(format!("{} gate poisoned", self.group)))?;
        Ok(ExclusiveGuard { collection: self, _guard: guard })
    }

    fn shared(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.gate.read().map_err(|_| Error::store(format!("{} gate poisoned", self.group)))
    }

    /// Persist the whole collection atomically.
    pub fn flush(&self) -> Result<()> {
        let _flush = self.flush_lock.lock().map_err(|_| Error::store("flush lock poisoned"))?;
        let mut bullets: Vec<Bullet> = self.bullets.iter().map(|e| e.value().clone()).collect();
        bullets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let file = CollectionFile { version: FORMAT_VERSION, group: self.group, bullets };
        write_json_atomic(&self.path, &file)
    }
}

/// Exclusive access to one collection. Individual updates wait until it drops.
pub struct ExclusiveGuard<'a> {
    collection: &'a Collection,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl ExclusiveGuard<'_> {
    pub fn group(&self) -> Group {
        self.collection.group
    }

    pub fn get(&self, id: &str) -> Option<Bullet> {
        self.collection.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.collection.contains(id)
    }

    /// Insert or overwrite a record. Not persisted until [`flush`](Self::flush).
    pub fn put(&self, bullet: Bullet, vector: Vec<f32>) {
        self.collection.vectors.insert(bullet.id.clone(), vector);
        self.collection.bullets.insert(bullet.id.clone(), bullet);
    }

    /// Replace a record's fields, keeping its embedding.
    pub fn replace(&self, bullet: Bullet) -> Result<()> {
        let mut entry = self
            .collection
            .bullets
            .get_mut(&bullet.id)
            .ok_or_else(|| Error::BulletNotFound(bullet.id.clone()))?;
        *entry = bullet;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Option<Bullet> {
        self.collection.vectors.remove(id);
        self.collection.bullets.remove(id).map(|(_, b)| b)
    }

    pub fn flush(&self) -> Result<()> {
        self.collection.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use playbook_core::{BulletKind, BulletStatus};

    fn bullet(text: &str) -> Bullet {
        Bullet::new(text, Group::Right, BulletKind::Pattern, vec![], 0.6, BulletStatus::Quarantined)
    }

    #[test]
    fn insert_persists_and_reloads() {
        let tmp = tempfile::TempDir::new().unwrap();
        let e = HashEmbedder::default();
        let c = Collection::open(tmp.path(), Group::Right, &e).unwrap();
        let b = bullet("try a different approach");
        c.insert(b.clone(), e.embed(&b.text)).unwrap();

        let reopened = Collection::open(tmp.path(), Group::Right, &e).unwrap();
        assert_eq!(reopened.get(&b.id), Some(b.clone()));
        assert!(reopened.vector(&b.id).is_some());
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let e = HashEmbedder::default();
        let c = Collection::open(tmp.path(), Group::Right, &e).unwrap();
        let b = bullet("x y z");
        c.insert(b.clone(), vec![]).unwrap();
        assert!(matches!(c.insert(b, vec![]), Err(Error::InvariantViolation(_))));
    }

    #[test]
    fn failed_update_leaves_record_untouched() {
        let tmp = tempfile::TempDir::new().unwrap();
        let e = HashEmbedder::default();
        let c = Collection::open(tmp.path(), Group::Right, &e).unwrap();
        let b = c.insert(bullet("keep me"), vec![]).unwrap();
        let result = c.update(&b.id, |draft| {
            draft.helpful_count = 99;
            Err(Error::invariant("nope"))
        });
        assert!(result.is_err());
        assert_eq!(c.get(&b.id).unwrap().helpful_count, 0);
    }

    #[test]
    fn corrupt_file_is_a_store_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("left.json"), b"{not json").unwrap();
        let e = HashEmbedder::default();
        assert!(matches!(Collection::open(tmp.path(), Group::Left, &e), Err(Error::Store(_))));
    }

    #[test]
    fn concurrent_updates_do_not_lose_increments() {
        let tmp = tempfile::TempDir::new().unwrap();
        let e = HashEmbedder::default();
        let c = std::sync::Arc::new(Collection::open(tmp.path(), Group::Right, &e).unwrap());
        let b = c.insert(bullet("counted"), vec![]).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = c.clone();
                let id = b.id.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        c.update(&id, |d| {
                            d.helpful_count += 1;
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.get(&b.id).unwrap().helpful_count, 40);
    }
}
