//! Skill selection: pick the catalog entry that best fits a unit.
//!
//! The engine depends only on [`SkillSelector`]. Two strategies ship: keyword
//! hit counting, and cosine similarity over a pluggable [`Embedder`].

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::plan::Unit;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9_]+").expect("token regex"));

/// A reusable set of instructions handed to the implementer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub instructions: String,
}

pub trait SkillSelector: Send + Sync {
    fn select(&self, unit: &Unit) -> Option<Skill>;
}

/// Selector that never picks a skill.
pub struct NoSkills;

impl SkillSelector for NoSkills {
    fn select(&self, _unit: &Unit) -> Option<Skill> {
        None
    }
}

fn unit_text(unit: &Unit) -> String {
    let mut text = format!("{}\n{}", unit.title, unit.description);
    for criterion in &unit.acceptance_criteria {
        text.push('\n');
        text.push_str(criterion);
    }
    text
}

fn tokens(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Picks the skill whose keywords appear most often in the unit text.
///
/// A multi-word keyword counts once when all of its words are present. Ties
/// go to the skill declared first; zero hits selects nothing.
pub struct KeywordSelector {
    catalog: Vec<Skill>,
}

impl KeywordSelector {
    pub fn new(catalog: Vec<Skill>) -> Self {
        Self { catalog }
    }
}

impl SkillSelector for KeywordSelector {
    fn select(&self, unit: &Unit) -> Option<Skill> {
        let words: HashSet<String> = tokens(&unit_text(unit)).into_iter().collect();
        let mut best: Option<(usize, &Skill)> = None;
        for skill in &self.catalog {
            let hits = skill
                .keywords
                .iter()
                .filter(|keyword| {
                    let parts = tokens(keyword);
                    !parts.is_empty() && parts.iter().all(|p| words.contains(p))
                })
                .count();
            if hits > 0 && best.is_none_or(|(top, _)| hits > top) {
                best = Some((hits, skill));
            }
        }
        best.map(|(_, skill)| skill.clone())
    }
}

/// Maps text to a fixed-length vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic feature-hashing embedder (FNV-1a over lowercase tokens).
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in tokens(text) {
            let hash = fnv1a(token.as_bytes());
            let slot = (hash % self.dims as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }
        vector
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Picks the most similar skill, if it clears `min_similarity`.
pub struct EmbeddingSelector<E: Embedder> {
    embedder: E,
    catalog: Vec<(Skill, Vec<f32>)>,
    min_similarity: f32,
}

impl<E: Embedder> EmbeddingSelector<E> {
    pub fn new(embedder: E, catalog: Vec<Skill>, min_similarity: f32) -> Self {
        let catalog = catalog
            .into_iter()
            .map(|skill| {
                let text = format!(
                    "{}\n{}\n{}",
                    skill.name,
                    skill.description,
                    skill.keywords.join(" ")
                );
                let vector = embedder.embed(&text);
                (skill, vector)
            })
            .collect();
        Self {
            embedder,
            catalog,
            min_similarity,
        }
    }
}

impl<E: Embedder> SkillSelector for EmbeddingSelector<E> {
    fn select(&self, unit: &Unit) -> Option<Skill> {
        let query = self.embedder.embed(&unit_text(unit));
        let mut best: Option<(f32, &Skill)> = None;
        for (skill, vector) in &self.catalog {
            let score = cosine_similarity(&query, vector);
            if score >= self.min_similarity && best.is_none_or(|(top, _)| score > top) {
                best = Some((score, skill));
            }
        }
        best.map(|(_, skill)| skill.clone())
    }
}
