//! Index tuning knobs.

use std::collections::HashSet;
use std::time::Duration;

use crate::rank::RankWeights;

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Light suffix-stripping on top of casefolded tokens.
    pub enable_stemming: bool,
    pub stop_words: HashSet<String>,
    /// Hits scoring below this are dropped from results.
    pub min_relevance_score: f64,
    /// Half-life for exponential recency decay.
    pub recency_half_life_hours: f64,
    pub weights: RankWeights,
    /// Query cache entry TTL.
    pub max_cache_age: Duration,
    /// LRU eviction starts once the estimated cache footprint passes this.
    pub memory_cache_size_mb: usize,
    /// Batch writer drain cadence.
    pub index_batch_interval: Duration,
    /// Drain early once this many ops are pending.
    pub max_batch_size: usize,
    /// Bound on the pending-op queue; oldest non-delete ops drop on overflow.
    pub max_pending_updates: usize,
    /// Commit retries before a batch is dropped and logged.
    pub commit_retry_ceiling: u32,
    /// Compute and store semantic vectors when an embedder is configured.
    pub enable_semantic: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        let stop_words = ["a", "an", "and", "are", "as", "at", "be", "by", "for", "from",
            "has", "he", "in", "is", "it", "its", "of", "on", "that", "the", "to",
            "was", "were", "will", "with"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self {
            enable_stemming: false,
            stop_words,
            min_relevance_score: 0.05,
            recency_half_life_hours: 72.0,
            weights: RankWeights::default(),
            max_cache_age: Duration::from_secs(60),
            memory_cache_size_mb: 64,
            index_batch_interval: Duration::from_millis(200),
            max_batch_size: 128,
            max_pending_updates: 4096,
            commit_retry_ceiling: 5,
            enable_semantic: false,
        }
    }
}
