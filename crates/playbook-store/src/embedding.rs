//! Text embedding for similarity search.
//!
//! Only bullet text is ever embedded. The default embedder is a local
//! feature-hashing model: deterministic, dependency-free at runtime, and
//! good enough for near-duplicate detection and lexical routing.

/// Turns text into a fixed-dimension vector.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Feature-hashing bag of words plus adjacent-word bigrams, L2-normalized.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension: dimension.max(16) }
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a(feature);
        let idx = (h % self.dimension as u64) as usize;
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        vector[idx] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let words = tokenize(text);
        for word in &words {
            self.accumulate(&mut vector, word, 1.0);
        }
        for pair in words.windows(2) {
            self.accumulate(&mut vector, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        normalize(&mut vector);
        vector
    }
}

/// Lowercase alphanumeric word tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Cosine similarity. Zero vectors are dissimilar to everything.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Jaccard overlap of the two texts' word sets. Empty text overlaps nothing.
pub fn word_overlap(a: &str, b: &str) -> f64 {
    let a: std::collections::BTreeSet<String> = tokenize(a).into_iter().collect();
    let b: std::collections::BTreeSet<String> = tokenize(b).into_iter().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_has_unit_similarity() {
        let e = HashEmbedder::default();
        let a = e.embed("Always validate the schema");
        let b = e.embed("always validate THE schema!");
        assert!((cosine(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn unrelated_text_is_far() {
        let e = HashEmbedder::default();
        let a = e.embed("validate the json schema before the request");
        let b = e.embed("consider exploring alternative creative reframings");
        assert!(cosine(&a, &b) < 0.5);
    }

    #[test]
    fn empty_text_embeds_to_zero() {
        let e = HashEmbedder::new(32);
        let v = e.embed("  ...  ");
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine(&v, &v), 0.0);
    }

    #[test]
    fn word_overlap_is_jaccard_over_words() {
        assert_eq!(word_overlap("Never skip tests", "never SKIP tests!"), 1.0);
        assert!((word_overlap("a b c", "b c d") - 0.5).abs() < 1e-9);
        assert_eq!(word_overlap("", "anything"), 0.0);
    }

    #[test]
    fn tokenize_splits_on_punctuation() {
        assert_eq!(tokenize("Don't call-API"), vec!["don", "t", "call", "api"]);
    }
}
