//! The component registry.
//!
//! One `MessagingCore` value owns every engine the service orchestrates;
//! it is built once at startup and passed down. The chat registry doubles
//! as the hub's `ChatDirectory`, so subscription checks and fan-out
//! recipient resolution read the same membership the service writes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use sonet_crypto::RatchetEngine;
use sonet_hub::auth::StaticTokens;
use sonet_hub::hub::ChatDirectory;
use sonet_hub::{AuthPredicate, RealtimeHub};
use sonet_index::{IndexConfig, IndexWriter, Indexer};
use sonet_proto::Chat;
use sonet_store::{MessageStore, StoreDb};

use crate::config::ServerConfig;

/// Shared chat membership map, written by the service, read by the hub.
#[derive(Clone, Default)]
pub struct ChatRegistry {
    chats: Arc<RwLock<HashMap<String, Chat>>>,
    /// dedup key → chat id, for idempotent creation.
    dedup: Arc<RwLock<HashMap<String, String>>>,
}

impl ChatRegistry {
    pub async fn get(&self, chat_id: &str) -> Option<Chat> {
        self.chats.read().await.get(chat_id).cloned()
    }

    pub async fn lookup_dedup(&self, key: &str) -> Option<Chat> {
        let chat_id = self.dedup.read().await.get(key).cloned()?;
        self.get(&chat_id).await
    }

    pub async fn insert(&self, chat: Chat, dedup_key: String) {
        self.dedup.write().await.insert(dedup_key, chat.chat_id.clone());
        self.chats.write().await.insert(chat.chat_id.clone(), chat);
    }

    pub async fn update(&self, chat: Chat) {
        self.chats.write().await.insert(chat.chat_id.clone(), chat);
    }

    pub async fn for_user(&self, user_id: &str) -> Vec<Chat> {
        self.chats
            .read()
            .await
            .values()
            .filter(|c| c.is_participant(user_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChatDirectory for ChatRegistry {
    async fn participants(&self, chat_id: &str) -> Option<BTreeSet<String>> {
        self.chats
            .read()
            .await
            .get(chat_id)
            .map(|c| c.participant_ids.clone())
    }

    async fn chats_for_user(&self, user_id: &str) -> Vec<String> {
        self.chats
            .read()
            .await
            .values()
            .filter(|c| c.is_participant(user_id))
            .map(|c| c.chat_id.clone())
            .collect()
    }
}

pub struct MessagingCore {
    pub config: ServerConfig,
    pub chats: ChatRegistry,
    pub store: MessageStore,
    pub engine: RatchetEngine,
    pub indexer: Indexer,
    pub index_writer: IndexWriter,
    pub hub: Arc<RealtimeHub>,
    pub db: Option<StoreDb>,
}

impl MessagingCore {
    /// Wire every component from config. The auth predicate comes from the
    /// config token table; an empty table accepts everything (dev mode).
    pub async fn build(config: ServerConfig) -> anyhow::Result<Arc<Self>> {
        let chats = ChatRegistry::default();

        let auth: Arc<dyn AuthPredicate> = if config.auth.tokens.is_empty() {
            tracing::warn!("no auth tokens configured; accepting every session token");
            Arc::new(sonet_hub::auth::AllowAll)
        } else {
            Arc::new(StaticTokens { tokens: config.auth.tokens.clone() })
        };

        let hub_config = config.hub.to_hub_config(config.limits.message_rate_limit);
        let hub = Arc::new(RealtimeHub::new(hub_config, auth, Arc::new(chats.clone())));

        let db = match &config.database.path {
            Some(path) => Some(StoreDb::open(std::path::Path::new(path)).await?),
            None => None,
        };
        let store = match &db {
            Some(db) => MessageStore::with_persistence(db.clone()),
            None => MessageStore::new(),
        };

        let indexer = Indexer::new(IndexConfig::default());
        let index_writer = IndexWriter::spawn(indexer.clone());

        Ok(Arc::new(Self {
            config,
            chats,
            store,
            engine: RatchetEngine::new(),
            indexer,
            index_writer,
            hub,
            db,
        }))
    }

    /// Background maintenance: hub sweeps (idle eviction, typing expiry).
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let core = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                core.hub.maintenance_tick().await;
            }
        })
    }

    /// Drain bounded queues before exit.
    pub async fn shutdown(&self) {
        self.index_writer.shutdown();
        self.index_writer.flush().await;
    }
}
