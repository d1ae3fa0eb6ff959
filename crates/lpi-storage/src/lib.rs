//! Persistence collaborator for LPI plus the HTTP fetch utilities feeds use.
//!
//! [`Store`] is the seam the ingestion runner writes through. Two backends
//! ship here: [`InMemoryStore`] for tests and dev runs, and [`PgStore`] for
//! Postgres. Both hand out per-key exclusive sections via [`KeyLocks`] so a
//! resolve/merge/write sequence for one natural key never interleaves with
//! another writer of the same key.

mod http;
mod postgres;

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use lpi_core::{Client, EntityKey, Process, Publication, PublicationStatus};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

pub use http::{
    classify_reqwest_error, classify_status, parse_retry_after, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "lpi-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid stored value in {column}: {value}")]
    Corrupt { column: &'static str, value: String },
    #[error("{0}")]
    Backend(String),
}

/// Result of an idempotent raw-publication upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Same identity, different payload: the stored copy was replaced.
    Updated,
    Unchanged,
}

/// Held for the duration of one resolve/merge/write section.
pub type KeyGuard = OwnedMutexGuard<()>;

/// Lazily-created exclusive sections keyed by owner-scoped natural key.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<EntityKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: EntityKey) -> KeyGuard {
        let lock = {
            let mut map = self.locks.lock().await;
            // Entries nobody holds or waits on are dropped so the map stays bounded.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn tracked_keys(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert-if-absent by `(owner_id, identity_key)`; a differing payload
    /// replaces the stored copy while keeping a human `Read` status.
    async fn upsert_publication(&self, publication: &Publication)
        -> Result<UpsertOutcome, StoreError>;

    async fn get_publications(
        &self,
        owner_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Publication>, StoreError>;

    async fn list_publications(&self, owner_id: &str) -> Result<Vec<Publication>, StoreError>;

    /// Moves only `New` rows to `Processed`; returns how many moved.
    async fn mark_publications_processed(
        &self,
        owner_id: &str,
        ids: &[Uuid],
    ) -> Result<usize, StoreError>;

    /// Human read transition. Returns `false` when the publication is unknown.
    async fn mark_publication_read(&self, owner_id: &str, id: Uuid) -> Result<bool, StoreError>;

    async fn find_process(
        &self,
        owner_id: &str,
        cnj_number: &str,
    ) -> Result<Option<Process>, StoreError>;

    async fn save_process(&self, process: &Process) -> Result<(), StoreError>;

    async fn list_processes(&self, owner_id: &str) -> Result<Vec<Process>, StoreError>;

    async fn find_client(&self, owner_id: &str, document: &str)
        -> Result<Option<Client>, StoreError>;

    async fn save_client(&self, client: &Client) -> Result<(), StoreError>;

    async fn list_clients(&self, owner_id: &str) -> Result<Vec<Client>, StoreError>;

    /// Exclusive section spanning resolve, merge and persist for one key.
    async fn lock_key(&self, key: EntityKey) -> KeyGuard;
}

#[derive(Debug, Default)]
struct MemoryTables {
    publications: HashMap<Uuid, Publication>,
    processes: BTreeMap<(String, String), Process>,
    clients: BTreeMap<(String, String), Client>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<MemoryTables>,
    locks: KeyLocks,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_publication(
        &self,
        publication: &Publication,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.publications.entry(publication.id) {
            Entry::Vacant(slot) => {
                slot.insert(publication.clone());
                Ok(UpsertOutcome::Inserted)
            }
            Entry::Occupied(mut slot) => {
                let stored = slot.get_mut();
                if stored.payload_hash() == publication.payload_hash() {
                    return Ok(UpsertOutcome::Unchanged);
                }
                let status = match stored.status {
                    PublicationStatus::Read => PublicationStatus::Read,
                    _ => PublicationStatus::New,
                };
                *stored = publication.clone();
                stored.status = status;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    async fn get_publications(
        &self,
        owner_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Publication>, StoreError> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.publications.get(id))
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn list_publications(&self, owner_id: &str) -> Result<Vec<Publication>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows = tables
            .publications
            .values()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            b.publication_date
                .cmp(&a.publication_date)
                .then_with(|| a.identity_key.cmp(&b.identity_key))
        });
        Ok(rows)
    }

    async fn mark_publications_processed(
        &self,
        owner_id: &str,
        ids: &[Uuid],
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.write().await;
        let mut moved = 0usize;
        for id in ids {
            if let Some(p) = tables.publications.get_mut(id) {
                if p.owner_id == owner_id && p.status.can_mark_processed() {
                    p.status = PublicationStatus::Processed;
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    async fn mark_publication_read(&self, owner_id: &str, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.publications.get_mut(&id) {
            Some(p) if p.owner_id == owner_id => {
                p.status = PublicationStatus::Read;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_process(
        &self,
        owner_id: &str,
        cnj_number: &str,
    ) -> Result<Option<Process>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .processes
            .get(&(owner_id.to_string(), cnj_number.to_string()))
            .cloned())
    }

    async fn save_process(&self, process: &Process) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.processes.insert(
            (process.owner_id.clone(), process.cnj_number.clone()),
            process.clone(),
        );
        Ok(())
    }

    async fn list_processes(&self, owner_id: &str) -> Result<Vec<Process>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .processes
            .values()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn find_client(
        &self,
        owner_id: &str,
        document: &str,
    ) -> Result<Option<Client>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .clients
            .get(&(owner_id.to_string(), document.to_string()))
            .cloned())
    }

    async fn save_client(&self, client: &Client) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.clients.insert(
            (client.owner_id.clone(), client.document.clone()),
            client.clone(),
        );
        Ok(())
    }

    async fn list_clients(&self, owner_id: &str) -> Result<Vec<Client>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .clients
            .values()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn lock_key(&self, key: EntityKey) -> KeyGuard {
        self.locks.acquire(key).await
    }
}
