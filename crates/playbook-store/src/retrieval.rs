//! Similarity retrieval across group collections.
//!
//! Read-only. Per-group behavior (k, confidence floor, diversity) comes in
//! through the request; the retriever itself has no notion of which agent
//! is asking beyond the `owner` used for quarantine visibility.

use crate::embedding::cosine;
use crate::store::BulletStore;
use playbook_core::config::RetrievalConfig;
use playbook_core::{Bullet, BulletStatus, Group};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// k / confidence floor / diversity triple a caller picks per query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalProfile {
    pub k: usize,
    pub min_confidence: f64,
    /// MMR weight on novelty versus relevance, 0 disables.
    pub diversity: f64,
}

impl RetrievalProfile {
    /// Small k, high floor, pure relevance.
    pub fn precision(cfg: &RetrievalConfig) -> Self {
        Self { k: cfg.precision_k, min_confidence: cfg.precision_min_confidence, diversity: 0.0 }
    }

    /// Large k, low floor, diversity-biased.
    pub fn exploration(cfg: &RetrievalConfig) -> Self {
        Self { k: cfg.exploration_k, min_confidence: cfg.exploration_min_confidence, diversity: cfg.exploration_diversity }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query: String,
    pub groups: Vec<Group>,
    pub k: usize,
    pub min_confidence: f64,
    /// Keep bullets carrying at least one of these tags. Empty keeps all.
    pub tags: Vec<String>,
    pub diversity: f64,
    /// Group whose quarantined bullets are visible to this query.
    pub owner: Option<Group>,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>, groups: Vec<Group>, k: usize, min_confidence: f64) -> Self {
        let agents: Vec<Group> = groups.iter().copied().filter(|g| g.is_agent()).collect();
        let owner = if agents.len() == 1 { Some(agents[0]) } else { None };
        Self { query: query.into(), groups, k, min_confidence, tags: Vec::new(), diversity: 0.0, owner }
    }

    /// The caller's own group plus shared, shaped by `profile`.
    pub fn for_group(query: impl Into<String>, group: Group, profile: RetrievalProfile) -> Self {
        let mut groups = vec![group];
        if group != Group::Shared {
            groups.push(Group::Shared);
        }
        Self::new(query, groups, profile.k, profile.min_confidence).with_diversity(profile.diversity)
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_diversity(mut self, diversity: f64) -> Self {
        self.diversity = diversity.clamp(0.0, 1.0);
        self
    }

    pub fn with_owner(mut self, owner: Option<Group>) -> Self {
        self.owner = owner;
        self
    }
}

/// A retrieved bullet with its ranking inputs.
#[derive(Debug, Clone)]
pub struct Ranked {
    pub bullet: Bullet,
    pub similarity: f64,
    /// Similarity scaled by trust in the bullet's status.
    pub relevance: f64,
    vector: Vec<f32>,
}

/// How multi-query results are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fusion {
    /// Reciprocal rank fusion.
    Rank,
    /// Sum of per-query relevance.
    Score,
}

pub struct Retriever {
    store: Arc<BulletStore>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(store: Arc<BulletStore>, config: RetrievalConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Ranked bullets and their ids.
    pub fn retrieve(&self, request: &RetrievalRequest) -> (Vec<Bullet>, Vec<String>) {
        split(self.retrieve_ranked(request))
    }

    pub fn retrieve_ranked(&self, request: &RetrievalRequest) -> Vec<Ranked> {
        let candidates = self.candidates(request);
        let selected = if request.diversity > 0.0 {
            mmr_select(candidates, request.k, request.diversity)
        } else {
            candidates.into_iter().take(request.k).collect()
        };
        debug!(query = %truncate(&request.query, 60), returned = selected.len(), "retrieve");
        selected
    }

    /// Run several phrasings of one need and fuse the rankings.
    pub fn retrieve_multi(&self, queries: &[String], base: &RetrievalRequest, fusion: Fusion) -> (Vec<Bullet>, Vec<String>) {
        if queries.is_empty() {
            return (Vec::new(), Vec::new());
        }
        let per_query_k = base.k.max(5);
        let mut fused: HashMap<String, (f64, Bullet)> = HashMap::new();
        for query in queries {
            let mut req = base.clone();
            req.query = query.clone();
            req.k = per_query_k;
            for (rank, hit) in self.retrieve_ranked(&req).into_iter().enumerate() {
                let contribution = match fusion {
                    Fusion::Rank => 1.0 / (rank as f64 + self.config.rrf_constant),
                    Fusion::Score => hit.relevance,
                };
                fused.entry(hit.bullet.id.clone()).or_insert((0.0, hit.bullet)).0 += contribution;
            }
        }
        let mut ordered: Vec<(f64, Bullet)> = fused.into_values().collect();
        ordered.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        let bullets: Vec<Bullet> = ordered.into_iter().take(base.k).map(|(_, b)| b).collect();
        let ids = bullets.iter().map(|b| b.id.clone()).collect();
        debug!(queries = queries.len(), returned = bullets.len(), ?fusion, "fused retrieval");
        (bullets, ids)
    }

    /// Start at `adaptive_min_k`; widen to `adaptive_max_k` when the best hit is weak.
    pub fn retrieve_adaptive(&self, request: &RetrievalRequest) -> (Vec<Bullet>, Vec<String>) {
        let mut wide = request.clone();
        wide.k = self.config.adaptive_max_k.max(self.config.adaptive_min_k);
        let ranked = self.retrieve_ranked(&wide);
        let top = ranked.first().map(|r| r.relevance).unwrap_or(0.0);
        let k = if top >= self.config.adaptive_confident_score {
            self.config.adaptive_min_k
        } else {
            self.config.adaptive_max_k
        };
        debug!(top, k, "adaptive retrieval");
        split(ranked.into_iter().take(k).collect())
    }

    /// Visible, filtered, relevance-ordered candidates with text duplicates removed.
    fn candidates(&self, request: &RetrievalRequest) -> Vec<Ranked> {
        let query_vector = self.store.embed(&request.query);
        let trust = self.store.lifecycle().quarantine_trust;
        let mut ranked = Vec::new();

        for group in &request.groups {
            for (bullet, vector) in self.store.collection(*group).snapshot() {
                let weight = match visibility(&bullet, request.owner) {
                    Some(Visibility::Full) => 1.0,
                    Some(Visibility::Reduced) => trust,
                    None => continue,
                };
                if bullet.confidence < request.min_confidence {
                    continue;
                }
                if !request.tags.is_empty() && !bullet.has_any_tag(&request.tags) {
                    continue;
                }
                let similarity = cosine(&query_vector, &vector);
                if similarity <= 0.0 {
                    continue;
                }
                ranked.push(Ranked { bullet, similarity, relevance: similarity * weight, vector });
            }
        }

        ranked.sort_by(|a, b| {
            b.relevance
                .total_cmp(&a.relevance)
                .then_with(|| b.bullet.score().total_cmp(&a.bullet.score()))
                .then_with(|| a.bullet.id.cmp(&b.bullet.id))
        });
        let mut seen = HashSet::new();
        ranked.retain(|r| seen.insert(r.bullet.text.trim().to_lowercase()));
        ranked
    }
}

enum Visibility {
    Full,
    Reduced,
}

fn visibility(bullet: &Bullet, owner: Option<Group>) -> Option<Visibility> {
    match (bullet.group, bullet.status) {
        (Group::Staging, _) | (_, BulletStatus::Staged) | (_, BulletStatus::Deprecated) => None,
        (Group::Shared, _) | (_, BulletStatus::Active) => Some(Visibility::Full),
        (group, BulletStatus::Quarantined) if owner == Some(group) => Some(Visibility::Reduced),
        _ => None,
    }
}

/// Maximal marginal relevance over an already relevance-sorted list.
fn mmr_select(mut pool: Vec<Ranked>, k: usize, lambda: f64) -> Vec<Ranked> {
    let mut selected: Vec<Ranked> = Vec::with_capacity(k.min(pool.len()));
    while selected.len() < k && !pool.is_empty() {
        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (i, cand) in pool.iter().enumerate() {
            let redundancy = selected.iter().map(|s| cosine(&cand.vector, &s.vector)).fold(0.0, f64::max);
            let score = (1.0 - lambda) * cand.relevance - lambda * redundancy;
            if score > best_score {
                best_score = score;
                best = i;
            }
        }
        selected.push(pool.remove(best));
    }
    selected
}

fn split(ranked: Vec<Ranked>) -> (Vec<Bullet>, Vec<String>) {
    let ids = ranked.iter().map(|r| r.bullet.id.clone()).collect();
    (ranked.into_iter().map(|r| r.bullet).collect(), ids)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
