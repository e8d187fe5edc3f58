//! sonet_index — inverted index over decryptable message content.
//!
//! Reads take a shared lock; the batch writer takes the exclusive lock for
//! the minimum interval needed to apply a drained batch. Removals are
//! applied immediately so a deleted message can never surface in a later
//! query.
//!
//! # Module layout
//! - `tokenizer` — Unicode word segmentation, casefold, stop words, stemming
//! - `index`     — postings, document metadata, search entry point
//! - `rank`      — the ten-factor scoring blend
//! - `cache`     — query cache (TTL + LRU) and suggestion cache
//! - `batch`     — bounded pending queue and the background commit task

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod index;
pub mod rank;
pub mod tokenizer;

pub use batch::IndexWriter;
pub use config::IndexConfig;
pub use error::IndexError;
pub use index::{IndexDoc, Indexer, SearchFilters, SearchHit, SearchScope};
