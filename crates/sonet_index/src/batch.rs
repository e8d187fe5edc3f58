//! Batched index writes.
//!
//! Index and update ops queue in a bounded pending buffer; a background
//! task drains it every `index_batch_interval`, or sooner once
//! `max_batch_size` ops are waiting. On overflow the oldest non-delete op
//! is dropped and counted. Removals bypass the queue entirely — they go
//! straight to the index so a deleted message cannot outlive the call.
//!
//! Commits retry with exponential backoff up to the configured ceiling,
//! then the batch is dropped and logged.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{interval, MissedTickBehavior};

use crate::error::IndexError;
use crate::index::{IndexDoc, Indexer};

#[derive(Debug, Clone)]
pub enum IndexOp {
    Index(IndexDoc),
    Update(IndexDoc),
    Remove(String),
}

impl IndexOp {
    fn is_remove(&self) -> bool {
        matches!(self, IndexOp::Remove(_))
    }
}

/// Producer handle plus the background drain task.
#[derive(Clone)]
pub struct IndexWriter {
    indexer: Indexer,
    pending: Arc<Mutex<VecDeque<IndexOp>>>,
    wake: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    pub dropped_ops: Arc<AtomicU64>,
}

impl IndexWriter {
    /// Spawn the background drain task and return the handle.
    pub fn spawn(indexer: Indexer) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let writer = Self {
            indexer: indexer.clone(),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            wake: Arc::new(Notify::new()),
            shutdown: shutdown_tx,
            dropped_ops: Arc::new(AtomicU64::new(0)),
        };
        tokio::spawn(drain_loop(
            indexer,
            writer.pending.clone(),
            writer.wake.clone(),
            shutdown_rx,
        ));
        writer
    }

    /// Enqueue an op. Removals are applied immediately; everything else is
    /// batched. On a full queue the oldest non-delete op is dropped.
    pub async fn submit(&self, op: IndexOp) -> Result<(), IndexError> {
        if *self.shutdown.borrow() {
            return Err(IndexError::ShutDown);
        }
        if let IndexOp::Remove(message_id) = &op {
            // Purge queued writes for this message so a pending re-index
            // cannot resurrect it after the removal.
            {
                let mut pending = self.pending.lock().await;
                pending.retain(|queued| match queued {
                    IndexOp::Index(d) | IndexOp::Update(d) => d.message_id != *message_id,
                    IndexOp::Remove(_) => true,
                });
            }
            self.indexer.remove(message_id).await;
            return Ok(());
        }

        let max = self.indexer.config().max_pending_updates;
        let batch_size = self.indexer.config().max_batch_size;
        let mut pending = self.pending.lock().await;
        if pending.len() >= max {
            match pending.iter().position(|queued| !queued.is_remove()) {
                Some(idx) => {
                    pending.remove(idx);
                    let dropped = self.dropped_ops.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(dropped, "index queue full, dropped oldest update");
                }
                None => return Err(IndexError::QueueFull),
            }
        }
        pending.push_back(op);
        let should_wake = pending.len() >= batch_size;
        drop(pending);
        if should_wake {
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Signal shutdown; the drain task flushes what is queued and exits.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.wake.notify_one();
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Drain everything now. Tests and shutdown paths.
    pub async fn flush(&self) {
        let batch = {
            let mut pending = self.pending.lock().await;
            pending.drain(..).collect::<Vec<_>>()
        };
        apply_batch(&self.indexer, batch).await;
    }
}

async fn drain_loop(
    indexer: Indexer,
    pending: Arc<Mutex<VecDeque<IndexOp>>>,
    wake: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(indexer.config().index_batch_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let retry_ceiling = indexer.config().commit_retry_ceiling;

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = wake.notified() => {}
            _ = shutdown.changed() => {}
        }

        let batch: Vec<IndexOp> = {
            let mut pending = pending.lock().await;
            let take = pending.len().min(indexer.config().max_batch_size);
            pending.drain(..take).collect()
        };

        if !batch.is_empty() {
            commit_with_retry(&indexer, batch, retry_ceiling).await;
        }

        if *shutdown.borrow() {
            // Drain whatever arrived during the last commit, then exit.
            let rest: Vec<IndexOp> = {
                let mut pending = pending.lock().await;
                pending.drain(..).collect()
            };
            if !rest.is_empty() {
                commit_with_retry(&indexer, rest, retry_ceiling).await;
            }
            tracing::debug!("index writer drained and stopped");
            return;
        }
    }
}

async fn commit_with_retry(indexer: &Indexer, batch: Vec<IndexOp>, ceiling: u32) {
    let mut delay = std::time::Duration::from_millis(10);
    for attempt in 0..=ceiling {
        match try_commit(indexer, &batch).await {
            Ok(()) => return,
            Err(e) if attempt < ceiling => {
                tracing::warn!(attempt, error = %e, "index commit failed, backing off");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => {
                tracing::error!(batch = batch.len(), error = %e, "index batch dropped after retries");
                return;
            }
        }
    }
}

async fn try_commit(indexer: &Indexer, batch: &[IndexOp]) -> Result<(), IndexError> {
    apply_batch(indexer, batch.to_vec()).await;
    Ok(())
}

async fn apply_batch(indexer: &Indexer, batch: Vec<IndexOp>) {
    for op in batch {
        match op {
            IndexOp::Index(doc) => indexer.index(doc).await,
            IndexOp::Update(doc) => indexer.update(doc).await,
            IndexOp::Remove(id) => indexer.remove(&id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::index::SearchFilters;
    use chrono::Utc;
    use sonet_proto::message::MessageType;

    fn doc(id: &str, content: &str) -> IndexDoc {
        IndexDoc {
            message_id: id.into(),
            chat_id: "c".into(),
            user_id: "u".into(),
            content: content.into(),
            message_type: MessageType::Text,
            thread_id: None,
            timestamp: Utc::now(),
            engagement_score: 0.0,
            is_important: false,
            reaction_count: 0,
            has_attachments: false,
            starred: false,
            pinned: false,
        }
    }

    #[tokio::test]
    async fn batched_ops_land_after_flush() {
        let indexer = Indexer::new(IndexConfig {
            index_batch_interval: std::time::Duration::from_secs(3600),
            ..Default::default()
        });
        let writer = IndexWriter::spawn(indexer.clone());

        writer.submit(IndexOp::Index(doc("m1", "hello"))).await.unwrap();
        assert_eq!(indexer.doc_count().await, 0);
        writer.flush().await;
        assert_eq!(indexer.doc_count().await, 1);
        writer.shutdown();
    }

    #[tokio::test]
    async fn size_trigger_drains_without_interval() {
        let indexer = Indexer::new(IndexConfig {
            index_batch_interval: std::time::Duration::from_secs(3600),
            max_batch_size: 2,
            ..Default::default()
        });
        let writer = IndexWriter::spawn(indexer.clone());

        writer.submit(IndexOp::Index(doc("m1", "one"))).await.unwrap();
        writer.submit(IndexOp::Index(doc("m2", "two"))).await.unwrap();
        // Give the drain task a moment to pick up the wake.
        for _ in 0..50 {
            if indexer.doc_count().await == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(indexer.doc_count().await, 2);
        writer.shutdown();
    }

    #[tokio::test]
    async fn remove_bypasses_queue_and_purges_pending() {
        let indexer = Indexer::new(IndexConfig {
            index_batch_interval: std::time::Duration::from_secs(3600),
            ..Default::default()
        });
        let writer = IndexWriter::spawn(indexer.clone());

        indexer.index(doc("m1", "hello world")).await;
        // A queued re-index must not resurrect the message post-remove.
        writer.submit(IndexOp::Update(doc("m1", "hello again"))).await.unwrap();
        writer.submit(IndexOp::Remove("m1".into())).await.unwrap();
        writer.flush().await;

        let hits = indexer.search("hello", &SearchFilters::default(), 10).await.unwrap();
        assert!(hits.is_empty());
        writer.shutdown();
    }

    #[tokio::test]
    async fn overflow_drops_oldest_update() {
        let indexer = Indexer::new(IndexConfig {
            index_batch_interval: std::time::Duration::from_secs(3600),
            max_pending_updates: 2,
            max_batch_size: 100,
            ..Default::default()
        });
        let writer = IndexWriter::spawn(indexer.clone());

        writer.submit(IndexOp::Index(doc("m1", "one"))).await.unwrap();
        writer.submit(IndexOp::Index(doc("m2", "two"))).await.unwrap();
        writer.submit(IndexOp::Index(doc("m3", "three"))).await.unwrap();
        assert_eq!(writer.pending_len().await, 2);
        assert_eq!(writer.dropped_ops.load(Ordering::Relaxed), 1);

        writer.flush().await;
        assert_eq!(indexer.doc_count().await, 2);
        // m1 was the sacrifice.
        assert!(indexer.search("one", &SearchFilters::default(), 10).await.unwrap().is_empty());
        writer.shutdown();
    }
}
