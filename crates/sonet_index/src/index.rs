//! The inverted index.
//!
//! Postings map term → (message → positions). Document metadata carries the
//! signals ranking needs. Reads run under the shared side of an RwLock; the
//! batch writer and removals take the exclusive side briefly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use sonet_proto::message::MessageType;

use crate::cache::{QueryCache, SuggestionCache};
use crate::config::IndexConfig;
use crate::error::IndexError;
use crate::rank::{self, ScoreInputs};
use crate::tokenizer;

/// Capability seam for semantic vectors. The core ships a deterministic
/// hashing embedder for tests; a production embedder is injected here.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Feature-hashing embedder: deterministic, dependency-free, good enough
/// to exercise the semantic path.
pub struct HashingEmbedder {
    pub dimensions: usize,
}

impl EmbeddingProvider for HashingEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for word in text.split_whitespace() {
            let h = blake3::hash(word.to_lowercase().as_bytes());
            let idx = u64::from_le_bytes(h.as_bytes()[..8].try_into().unwrap()) as usize
                % self.dimensions;
            let sign = if h.as_bytes()[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

/// What the service hands the indexer per message.
#[derive(Debug, Clone)]
pub struct IndexDoc {
    pub message_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub content: String,
    pub message_type: MessageType,
    pub thread_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub engagement_score: f64,
    pub is_important: bool,
    pub reaction_count: usize,
    pub has_attachments: bool,
    pub starred: bool,
    pub pinned: bool,
}

#[derive(Debug, Clone)]
struct DocMeta {
    chat_id: String,
    user_id: String,
    message_type: MessageType,
    thread_id: Option<String>,
    timestamp: DateTime<Utc>,
    engagement_score: f64,
    is_important: bool,
    reaction_count: usize,
    has_attachments: bool,
    starred: bool,
    pinned: bool,
    token_count: usize,
    hashtags: HashSet<String>,
    mentions: HashSet<String>,
    semantic: Option<Vec<f32>>,
    terms: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    All,
    Chat,
    User,
}

#[derive(Debug, Clone)]
pub struct SearchFilters {
    pub scope: SearchScope,
    /// Chat the scope narrows to (participant check is the caller's job).
    pub chat_id: Option<String>,
    pub include_users: Vec<String>,
    pub exclude_users: Vec<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub result_type: Option<MessageType>,
    pub hashtags: Vec<String>,
    pub mentions: Vec<String>,
    pub has_attachments: Option<bool>,
    pub starred_only: bool,
    pub pinned_only: bool,
    pub thread_id: Option<String>,
    /// Requesting user, for the personal-relevance factor.
    pub searcher_chats: HashSet<String>,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            scope: SearchScope::All,
            chat_id: None,
            include_users: Vec::new(),
            exclude_users: Vec::new(),
            after: None,
            before: None,
            result_type: None,
            hashtags: Vec::new(),
            mentions: Vec::new(),
            has_attachments: None,
            starred_only: false,
            pinned_only: false,
            thread_id: None,
            searcher_chats: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub message_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct IndexInner {
    /// term → message_id → positions.
    postings: HashMap<String, HashMap<String, Vec<u32>>>,
    document_frequencies: HashMap<String, usize>,
    docs: HashMap<String, DocMeta>,
}

impl IndexInner {
    fn insert_doc(&mut self, doc: &IndexDoc, config: &IndexConfig, embedder: Option<&dyn EmbeddingProvider>) {
        // Re-index means delete + insert; duplicate postings never stack.
        self.remove_doc(&doc.message_id);

        let tokens = tokenizer::tokenize(&doc.content, config);
        let mut terms = HashSet::new();
        for token in &tokens {
            let entry = self
                .postings
                .entry(token.term.clone())
                .or_default()
                .entry(doc.message_id.clone())
                .or_default();
            entry.push(token.position);
            terms.insert(token.term.clone());
        }
        for term in &terms {
            *self.document_frequencies.entry(term.clone()).or_insert(0) += 1;
        }

        let hashtags = doc
            .content
            .split_whitespace()
            .filter_map(|w| w.strip_prefix('#'))
            .map(|w| w.to_lowercase())
            .collect();
        let mentions = doc
            .content
            .split_whitespace()
            .filter_map(|w| w.strip_prefix('@'))
            .map(|w| w.to_lowercase())
            .collect();

        let semantic = if config.enable_semantic {
            embedder.map(|e| e.embed(&doc.content))
        } else {
            None
        };

        self.docs.insert(
            doc.message_id.clone(),
            DocMeta {
                chat_id: doc.chat_id.clone(),
                user_id: doc.user_id.clone(),
                message_type: doc.message_type,
                thread_id: doc.thread_id.clone(),
                timestamp: doc.timestamp,
                engagement_score: doc.engagement_score,
                is_important: doc.is_important,
                reaction_count: doc.reaction_count,
                has_attachments: doc.has_attachments,
                starred: doc.starred,
                pinned: doc.pinned,
                token_count: tokens.len(),
                hashtags,
                mentions,
                semantic,
                terms,
            },
        );
    }

    fn remove_doc(&mut self, message_id: &str) {
        let Some(meta) = self.docs.remove(message_id) else {
            return;
        };
        for term in &meta.terms {
            if let Some(postings) = self.postings.get_mut(term) {
                postings.remove(message_id);
                if postings.is_empty() {
                    self.postings.remove(term);
                }
            }
            if let Some(df) = self.document_frequencies.get_mut(term) {
                *df = df.saturating_sub(1);
                if *df == 0 {
                    self.document_frequencies.remove(term);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct Indexer {
    inner: Arc<RwLock<IndexInner>>,
    query_cache: Arc<Mutex<QueryCache>>,
    suggestion_cache: Arc<Mutex<SuggestionCache>>,
    config: Arc<IndexConfig>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl Indexer {
    pub fn new(config: IndexConfig) -> Self {
        let query_cache = QueryCache::new(config.max_cache_age, config.memory_cache_size_mb);
        Self {
            inner: Arc::default(),
            query_cache: Arc::new(Mutex::new(query_cache)),
            suggestion_cache: Arc::new(Mutex::new(SuggestionCache::new(1024))),
            config: Arc::new(config),
            embedder: None,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Index (or re-index) one message. Exclusive lock for the insert only.
    pub async fn index(&self, doc: IndexDoc) {
        let message_id = doc.message_id.clone();
        {
            let mut inner = self.inner.write().await;
            inner.insert_doc(&doc, &self.config, self.embedder.as_deref());
        }
        self.query_cache.lock().await.invalidate_message(&message_id);
        self.suggestion_cache.lock().await.clear();
    }

    /// Delete + re-index under one exclusive acquisition.
    pub async fn update(&self, doc: IndexDoc) {
        self.index(doc).await;
    }

    /// Remove a message everywhere. After this returns, no later search can
    /// surface the id.
    pub async fn remove(&self, message_id: &str) {
        {
            let mut inner = self.inner.write().await;
            inner.remove_doc(message_id);
        }
        self.query_cache.lock().await.invalidate_message(message_id);
    }

    pub async fn doc_count(&self) -> usize {
        self.inner.read().await.docs.len()
    }

    fn cache_key(query: &str, filters: &SearchFilters, max_results: usize) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(query.as_bytes());
        hasher.update(&(max_results as u64).to_le_bytes());
        hasher.update(format!("{:?}", filters.scope).as_bytes());
        if let Some(chat) = &filters.chat_id {
            hasher.update(chat.as_bytes());
        }
        for list in [&filters.include_users, &filters.exclude_users, &filters.hashtags, &filters.mentions] {
            for item in list {
                hasher.update(item.as_bytes());
                hasher.update(b"\x00");
            }
            hasher.update(b"\x01");
        }
        if let Some(t) = filters.after {
            hasher.update(&t.timestamp_millis().to_le_bytes());
        }
        if let Some(t) = filters.before {
            hasher.update(&t.timestamp_millis().to_le_bytes());
        }
        if let Some(rt) = filters.result_type {
            hasher.update(format!("{rt:?}").as_bytes());
        }
        u64::from_le_bytes(hasher.finalize().as_bytes()[..8].try_into().unwrap())
    }

    /// Search the index. Results are ranked, floored at
    /// `min_relevance_score`, and capped at `max_results`.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, IndexError> {
        let terms = tokenizer::tokenize_query(query, &self.config);
        if terms.is_empty() {
            return Err(IndexError::EmptyQuery);
        }

        let key = Self::cache_key(query, filters, max_results);
        if let Some(cached) = self.query_cache.lock().await.get(key) {
            return Ok(cached);
        }

        let query_vector = if self.config.enable_semantic {
            self.embedder.as_ref().map(|e| e.embed(query))
        } else {
            None
        };

        let inner = self.inner.read().await;
        let total_docs = inner.docs.len();

        // Union of postings across query terms.
        let mut candidates: HashMap<String, (usize, f64)> = HashMap::new();
        for term in &terms {
            if let Some(postings) = inner.postings.get(term) {
                let df = inner.document_frequencies.get(term).copied().unwrap_or(0);
                for (message_id, positions) in postings {
                    let doc_len = inner
                        .docs
                        .get(message_id)
                        .map(|d| d.token_count)
                        .unwrap_or(1);
                    let entry = candidates.entry(message_id.clone()).or_insert((0, 0.0));
                    entry.0 += 1;
                    entry.1 += rank::tf_idf(positions.len(), doc_len, df, total_docs);
                }
            }
        }
        // Prefix matches count as partial hits.
        let mut partial: HashMap<String, usize> = HashMap::new();
        for term in &terms {
            for (indexed_term, postings) in &inner.postings {
                if indexed_term != term && indexed_term.starts_with(term.as_str()) {
                    for message_id in postings.keys() {
                        *partial.entry(message_id.clone()).or_insert(0) += 1;
                        candidates.entry(message_id.clone()).or_insert((0, 0.0));
                    }
                }
            }
        }

        let now = Utc::now();
        let mut hits: Vec<SearchHit> = Vec::new();
        for (message_id, (exact, tfidf)) in &candidates {
            let Some(meta) = inner.docs.get(message_id) else {
                continue;
            };
            if !filter_match(meta, filters) {
                continue;
            }

            let semantic_similarity = match (&query_vector, &meta.semantic) {
                (Some(q), Some(d)) => Some(rank::cosine_similarity(q, d)),
                _ => None,
            };

            let inputs = ScoreInputs {
                exact_terms: *exact,
                partial_terms: partial.get(message_id).copied().unwrap_or(0),
                query_terms: terms.len(),
                tf_idf: *tfidf,
                timestamp: meta.timestamp,
                engagement_score: meta.engagement_score,
                is_important: meta.is_important,
                context_hits: 0,
                semantic_similarity,
                reaction_count: meta.reaction_count,
                same_chat_as_searcher: filters.searcher_chats.contains(&meta.chat_id),
            };
            let score = rank::score(&inputs, &self.config.weights, now, self.config.recency_half_life_hours);
            if score < self.config.min_relevance_score {
                continue;
            }
            hits.push(SearchHit {
                message_id: message_id.clone(),
                chat_id: meta.chat_id.clone(),
                user_id: meta.user_id.clone(),
                score,
                timestamp: meta.timestamp,
            });
        }
        drop(inner);

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        hits.truncate(max_results);

        self.query_cache.lock().await.put(key, hits.clone());
        Ok(hits)
    }

    /// Vocabulary-backed prefix suggestions, served from their own cache.
    pub async fn suggest(&self, prefix: &str, limit: usize) -> Vec<String> {
        let folded = prefix.to_lowercase();
        if let Some(cached) = self.suggestion_cache.lock().await.get(&folded) {
            return cached.iter().take(limit).cloned().collect();
        }
        let inner = self.inner.read().await;
        let mut terms: Vec<(usize, String)> = inner
            .postings
            .iter()
            .filter(|(term, _)| term.starts_with(&folded))
            .map(|(term, postings)| (postings.len(), term.clone()))
            .collect();
        drop(inner);
        terms.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        let suggestions: Vec<String> = terms.into_iter().map(|(_, t)| t).collect();
        self.suggestion_cache
            .lock()
            .await
            .put(folded, suggestions.clone());
        suggestions.into_iter().take(limit).collect()
    }
}

fn filter_match(meta: &DocMeta, filters: &SearchFilters) -> bool {
    match filters.scope {
        SearchScope::All => {}
        SearchScope::Chat => {
            if filters.chat_id.as_deref() != Some(meta.chat_id.as_str()) {
                return false;
            }
        }
        SearchScope::User => {
            if !filters.include_users.iter().any(|u| u == &meta.user_id) {
                return false;
            }
        }
    }
    if !filters.include_users.is_empty()
        && filters.scope != SearchScope::User
        && !filters.include_users.iter().any(|u| u == &meta.user_id)
    {
        return false;
    }
    if filters.exclude_users.iter().any(|u| u == &meta.user_id) {
        return false;
    }
    if let Some(after) = filters.after {
        if meta.timestamp < after {
            return false;
        }
    }
    if let Some(before) = filters.before {
        if meta.timestamp > before {
            return false;
        }
    }
    if let Some(result_type) = filters.result_type {
        if meta.message_type != result_type {
            return false;
        }
    }
    if !filters.hashtags.is_empty()
        && !filters.hashtags.iter().any(|h| meta.hashtags.contains(&h.to_lowercase()))
    {
        return false;
    }
    if !filters.mentions.is_empty()
        && !filters.mentions.iter().any(|m| meta.mentions.contains(&m.to_lowercase()))
    {
        return false;
    }
    if let Some(wants) = filters.has_attachments {
        if meta.has_attachments != wants {
            return false;
        }
    }
    if filters.starred_only && !meta.starred {
        return false;
    }
    if filters.pinned_only && !meta.pinned {
        return false;
    }
    if let Some(thread) = &filters.thread_id {
        if meta.thread_id.as_deref() != Some(thread.as_str()) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, content: &str, ts_offset_mins: i64) -> IndexDoc {
        IndexDoc {
            message_id: id.into(),
            chat_id: "c1".into(),
            user_id: "alice".into(),
            content: content.into(),
            message_type: MessageType::Text,
            thread_id: None,
            timestamp: Utc::now() - chrono::Duration::minutes(ts_offset_mins),
            engagement_score: 0.0,
            is_important: false,
            reaction_count: 0,
            has_attachments: false,
            starred: false,
            pinned: false,
        }
    }

    fn indexer() -> Indexer {
        Indexer::new(IndexConfig::default())
    }

    #[tokio::test]
    async fn search_ranks_recent_first() {
        let idx = indexer();
        idx.index(doc("m1", "hello world", 60)).await;
        idx.index(doc("m2", "goodbye", 30)).await;
        idx.index(doc("m3", "hello there", 0)).await;

        let hits = idx.search("hello", &SearchFilters::default(), 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].message_id, "m3");
        assert_eq!(hits[1].message_id, "m1");
        assert!(hits.iter().all(|h| h.score > 0.0));
    }

    #[tokio::test]
    async fn remove_is_immediate_and_total() {
        let idx = indexer();
        idx.index(doc("m1", "hello world", 10)).await;
        idx.index(doc("m2", "hello there", 5)).await;

        // Warm the cache, then remove.
        let _ = idx.search("hello", &SearchFilters::default(), 10).await.unwrap();
        idx.remove("m2").await;

        let hits = idx.search("hello", &SearchFilters::default(), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, "m1");
        assert!(!hits.iter().any(|h| h.message_id == "m2"));
    }

    #[tokio::test]
    async fn reindex_does_not_duplicate_postings() {
        let idx = indexer();
        idx.index(doc("m1", "hello hello world", 0)).await;
        idx.index(doc("m1", "hello hello world", 0)).await;

        let hits = idx.search("hello", &SearchFilters::default(), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(idx.doc_count().await, 1);

        let inner = idx.inner.read().await;
        assert_eq!(inner.document_frequencies.get("hello"), Some(&1));
        assert_eq!(inner.postings["hello"]["m1"].len(), 2);
    }

    #[tokio::test]
    async fn update_replaces_content() {
        let idx = indexer();
        idx.index(doc("m1", "original words", 0)).await;
        idx.update(doc("m1", "replacement phrasing", 0)).await;

        assert!(idx.search("original", &SearchFilters::default(), 10).await.unwrap().is_empty());
        let hits = idx.search("replacement", &SearchFilters::default(), 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn filters_narrow_results() {
        let idx = indexer();
        let mut d1 = doc("m1", "hello from alice", 0);
        d1.user_id = "alice".into();
        let mut d2 = doc("m2", "hello from bob", 0);
        d2.user_id = "bob".into();
        d2.chat_id = "c2".into();
        idx.index(d1).await;
        idx.index(d2).await;

        let filters = SearchFilters {
            exclude_users: vec!["bob".into()],
            ..Default::default()
        };
        let hits = idx.search("hello", &filters, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, "m1");

        let filters = SearchFilters {
            scope: SearchScope::Chat,
            chat_id: Some("c2".into()),
            ..Default::default()
        };
        let hits = idx.search("hello", &filters, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, "m2");
    }

    #[tokio::test]
    async fn hashtag_filter() {
        let idx = indexer();
        idx.index(doc("m1", "launch day #shipit", 0)).await;
        idx.index(doc("m2", "launch postponed", 0)).await;

        let filters = SearchFilters { hashtags: vec!["shipit".into()], ..Default::default() };
        let hits = idx.search("launch", &filters, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, "m1");
    }

    #[tokio::test]
    async fn empty_query_is_invalid() {
        let idx = indexer();
        assert!(matches!(
            idx.search("the a an", &SearchFilters::default(), 10).await.unwrap_err(),
            IndexError::EmptyQuery
        ));
    }

    #[tokio::test]
    async fn suggestions_come_from_vocabulary() {
        let idx = indexer();
        idx.index(doc("m1", "hello helicopters", 0)).await;
        idx.index(doc("m2", "hello again", 0)).await;

        let suggestions = idx.suggest("hel", 10).await;
        assert!(suggestions.contains(&"hello".to_string()));
        assert!(suggestions.contains(&"helicopters".to_string()));
        // "hello" appears in two docs, so it ranks first.
        assert_eq!(suggestions[0], "hello");
    }

    #[tokio::test]
    async fn semantic_vectors_affect_scoring_when_enabled() {
        let config = IndexConfig { enable_semantic: true, ..Default::default() };
        let idx = Indexer::new(config).with_embedder(Arc::new(HashingEmbedder { dimensions: 64 }));
        idx.index(doc("m1", "cat sat on the mat", 0)).await;
        idx.index(doc("m2", "cat chased the dog", 0)).await;

        let hits = idx.search("cat sat mat", &SearchFilters::default(), 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].message_id, "m1");
    }
}
