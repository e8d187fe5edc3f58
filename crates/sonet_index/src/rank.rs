//! Ranking: a weighted blend of match quality, tf-idf relevance, recency
//! decay, and document importance signals.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct RankWeights {
    pub exact_match: f64,
    pub partial_match: f64,
    pub relevance_score: f64,
    pub recency: f64,
    pub user_interaction: f64,
    pub message_importance: f64,
    pub context_match: f64,
    pub semantic_match: f64,
    pub popularity: f64,
    pub personal_relevance: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        Self {
            exact_match: 2.0,
            partial_match: 0.6,
            relevance_score: 1.5,
            recency: 1.0,
            user_interaction: 0.4,
            message_importance: 0.5,
            context_match: 0.3,
            semantic_match: 1.0,
            popularity: 0.3,
            personal_relevance: 0.4,
        }
    }
}

/// Per-document signals the scorer consumes; assembled by the index from
/// postings and document metadata.
#[derive(Debug, Clone)]
pub struct ScoreInputs {
    /// Query terms matched exactly / as a prefix of an indexed term.
    pub exact_terms: usize,
    pub partial_terms: usize,
    pub query_terms: usize,
    /// Sum of tf-idf over matched terms.
    pub tf_idf: f64,
    pub timestamp: DateTime<Utc>,
    pub engagement_score: f64,
    pub is_important: bool,
    /// Query terms adjacent in the document (phrase-ish context).
    pub context_hits: usize,
    /// Cosine similarity of semantic vectors, when both sides have one.
    pub semantic_similarity: Option<f64>,
    pub reaction_count: usize,
    /// Searcher is a participant of the message's chat.
    pub same_chat_as_searcher: bool,
}

impl Default for ScoreInputs {
    fn default() -> Self {
        Self {
            exact_terms: 0,
            partial_terms: 0,
            query_terms: 0,
            tf_idf: 0.0,
            timestamp: Utc::now(),
            engagement_score: 0.0,
            is_important: false,
            context_hits: 0,
            semantic_similarity: None,
            reaction_count: 0,
            same_chat_as_searcher: false,
        }
    }
}

/// Exponential recency decay: 2^(-age / half_life).
pub fn recency_factor(timestamp: DateTime<Utc>, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
    let age_hours = (now - timestamp).num_seconds().max(0) as f64 / 3600.0;
    (0.5f64).powf(age_hours / half_life_hours.max(0.001))
}

pub fn score(inputs: &ScoreInputs, weights: &RankWeights, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
    if inputs.query_terms == 0 {
        return 0.0;
    }
    let q = inputs.query_terms as f64;
    let exact = inputs.exact_terms as f64 / q;
    let partial = inputs.partial_terms as f64 / q;
    let context = (inputs.context_hits as f64 / q).min(1.0);
    let popularity = (inputs.reaction_count as f64 / 10.0).min(1.0);

    let mut total = weights.exact_match * exact
        + weights.partial_match * partial
        + weights.relevance_score * inputs.tf_idf
        + weights.recency * recency_factor(inputs.timestamp, now, half_life_hours)
        + weights.user_interaction * inputs.engagement_score.clamp(0.0, 1.0)
        + weights.context_match * context
        + weights.popularity * popularity;
    if inputs.is_important {
        total += weights.message_importance;
    }
    if let Some(similarity) = inputs.semantic_similarity {
        total += weights.semantic_match * similarity.clamp(0.0, 1.0);
    }
    if inputs.same_chat_as_searcher {
        total += weights.personal_relevance;
    }
    total
}

/// tf-idf for one matched term.
pub fn tf_idf(term_frequency: usize, doc_len: usize, document_frequency: usize, total_docs: usize) -> f64 {
    if term_frequency == 0 || doc_len == 0 || document_frequency == 0 || total_docs == 0 {
        return 0.0;
    }
    let tf = term_frequency as f64 / doc_len as f64;
    let idf = ((total_docs as f64 + 1.0) / (document_frequency as f64 + 1.0)).ln() + 1.0;
    tf * idf
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64).powi(2);
        nb += (*y as f64).powi(2);
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
