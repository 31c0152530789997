//! Hemisphere classifier for staged bullets.
//!
//! Each side is scored from its best exemplar similarity, keyword coverage
//! and a small kind bonus. A weak or close contest is ambiguous and, when a
//! generator is available, goes to a generative tie-break.

use crate::exemplars::{contains_keyword, for_side, kind_side, META_BULLETS};
use playbook_core::config::ClassifierConfig;
use playbook_core::{BulletKind, Group};
use playbook_llm::{generate_bounded, Generator};
use playbook_store::{cosine, Embedder};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SIMILARITY_WEIGHT: f64 = 0.35;
const KEYWORD_WEIGHT: f64 = 0.65;
/// Exemplar hits needed for full keyword coverage.
const KEYWORD_SATURATION: f64 = 3.0;
const KIND_BONUS: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub group: Group,
    pub confidence: f64,
    pub reasoning: String,
    pub ambiguous: bool,
    pub left_score: f64,
    pub right_score: f64,
}

pub struct HemisphereClassifier {
    embedder: Arc<dyn Embedder>,
    exemplar_vectors: Vec<Vec<f32>>,
    generator: Option<Arc<dyn Generator>>,
    config: ClassifierConfig,
}

impl HemisphereClassifier {
    pub fn new(embedder: Arc<dyn Embedder>, generator: Option<Arc<dyn Generator>>, config: ClassifierConfig) -> Self {
        let exemplar_vectors = META_BULLETS.iter().map(|m| embedder.embed(m.text)).collect();
        Self { embedder, exemplar_vectors, generator, config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Deterministic scoring only, no tie-break.
    pub fn score(&self, text: &str, kind: BulletKind, hint: Option<Group>) -> Classification {
        let vector = self.embedder.embed(text);
        let lowered = text.to_lowercase();
        let left = self.side_score(Group::Left, &vector, &lowered, kind);
        let right = self.side_score(Group::Right, &vector, &lowered, kind);

        let total = left.score + right.score;
        let margin = if total > 0.0 { (left.score - right.score) / total } else { 0.0 };
        let weak = left.score < self.config.min_signal && right.score < self.config.min_signal;
        let ambiguous = weak || margin.abs() < self.config.ambiguity_margin;

        let group = if weak {
            agent_hint(hint).unwrap_or(Group::Left)
        } else if margin >= 0.0 {
            Group::Left
        } else {
            Group::Right
        };
        let confidence = if weak { 0.5 } else { (0.55 + 0.5 * margin.abs()).min(0.95) };

        let reasoning = format!(
            "left {:.2} ({} keyword hits: {}), right {:.2} ({} keyword hits: {}), margin {:.2}{}",
            left.score,
            left.hits.len(),
            left.hits.join(", "),
            right.score,
            right.hits.len(),
            right.hits.join(", "),
            margin.abs(),
            if weak { ", no strong signal" } else { "" },
        );
        Classification { group, confidence, reasoning, ambiguous, left_score: left.score, right_score: right.score }
    }

    /// Score, then break ambiguous ties generatively. Falls back to the hint
    /// at 0.5 confidence, still ambiguous, when the tie-break is unavailable
    /// or fails.
    pub async fn classify(&self, text: &str, kind: BulletKind, hint: Option<Group>) -> Classification {
        let scored = self.score(text, kind, hint);
        if !scored.ambiguous {
            return scored;
        }

        if self.config.use_tie_break {
            if let Some(generator) = &self.generator {
                let timeout = Duration::from_secs(self.config.tie_break_timeout_secs.max(1));
                match generate_bounded(generator.as_ref(), &tie_break_prompt(text, &scored), timeout, None).await {
                    Ok(response) => match parse_tie_break(&response) {
                        Some((group, confidence, reasoning)) => {
                            debug!(%group, confidence, "tie-break resolved");
                            return Classification {
                                group,
                                confidence,
                                reasoning: format!("tie-break: {reasoning}"),
                                ambiguous: false,
                                ..scored
                            };
                        }
                        None => warn!("Tie-break response did not parse"),
                    },
                    Err(e) => warn!("Tie-break failed: {}", e),
                }
            }
        }

        Classification {
            group: agent_hint(hint).unwrap_or(scored.group),
            confidence: 0.5,
            reasoning: format!("ambiguous, using hint; {}", scored.reasoning),
            ambiguous: true,
            ..scored
        }
    }

    fn side_score(&self, side: Group, vector: &[f32], lowered: &str, kind: BulletKind) -> SideScore {
        let similarity = META_BULLETS
            .iter()
            .zip(&self.exemplar_vectors)
            .filter(|(m, _)| m.side == side)
            .map(|(_, v)| cosine(vector, v))
            .fold(0.0, f64::max);

        let mut hits = Vec::new();
        for exemplar in for_side(side) {
            if let Some(kw) = exemplar.keywords.iter().find(|kw| contains_keyword(lowered, kw)) {
                hits.push(kw.trim().to_string());
            }
        }
        let coverage = (hits.len() as f64 / KEYWORD_SATURATION).min(1.0);
        let bonus = if kind_side(kind) == Some(side) { KIND_BONUS } else { 0.0 };

        SideScore { score: SIMILARITY_WEIGHT * similarity.max(0.0) + KEYWORD_WEIGHT * coverage + bonus, hits }
    }
}

struct SideScore {
    score: f64,
    hits: Vec<String>,
}

fn agent_hint(hint: Option<Group>) -> Option<Group> {
    hint.filter(|g| g.is_agent())
}

fn tie_break_prompt(text: &str, scored: &Classification) -> String {
    format!(
        "Classify this knowledge bullet for one of two agents.\n\n\
         LEFT: prescriptive, verifiable, procedural. Rules, validation, checklists, exact formats, known pitfalls.\n\
         RIGHT: exploratory, contrarian, generative. Alternatives, what-ifs, anomalies, edge cases, reframing.\n\n\
         BULLET: {text}\n\
         HEURISTIC SCORES: left {:.2}, right {:.2}\n\n\
         Answer with exactly three lines:\n\
         HEMISPHERE: left or right\n\
         CONFIDENCE: 0.0-1.0\n\
         REASONING: one sentence\n",
        scored.left_score, scored.right_score,
    )
}

/// Parse `HEMISPHERE:` / `CONFIDENCE:` / `REASONING:` lines.
pub fn parse_tie_break(response: &str) -> Option<(Group, f64, String)> {
    let mut group = None;
    let mut confidence = None;
    let mut reasoning = String::new();
    for line in response.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        match key.trim().to_ascii_uppercase().as_str() {
            "HEMISPHERE" => group = value.trim().parse::<Group>().ok().filter(|g| g.is_agent()),
            "CONFIDENCE" => confidence = value.trim().parse::<f64>().ok().filter(|c| c.is_finite()),
            "REASONING" => reasoning = value.trim().to_string(),
            _ => {}
        }
    }
    Some((group?, confidence?.clamp(0.0, 1.0), reasoning))
}
