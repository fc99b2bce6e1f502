use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{Collection, DocumentStore, ProfileDocument, ProfileField};
use crate::error::{StoreError, StoreResult};

/// In-process document store used by tests and local runs.
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<(Collection, String), ProfileDocument>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
    find_by_id_calls: AtomicUsize,
    find_by_ids_calls: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, collection: Collection, doc: ProfileDocument) {
        if let Ok(mut docs) = self.docs.lock() {
            docs.insert((collection, doc.id.clone()), doc);
        }
    }

    pub fn contains(&self, collection: Collection, id: &str) -> bool {
        self.docs
            .lock()
            .map(|docs| docs.contains_key(&(collection, id.to_string())))
            .unwrap_or(false)
    }

    /// Every subsequent call fails as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    pub fn find_by_id_calls(&self) -> usize {
        self.find_by_id_calls.load(Ordering::SeqCst)
    }

    pub fn find_by_ids_calls(&self) -> usize {
        self.find_by_ids_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> StoreResult<()> {
        let latency = self.latency.lock().ok().and_then(|slot| *slot);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("document store offline".into()));
        }
        Ok(())
    }

    fn docs(
        &self,
    ) -> StoreResult<std::sync::MutexGuard<'_, HashMap<(Collection, String), ProfileDocument>>> {
        self.docs
            .lock()
            .map_err(|_| StoreError::Unavailable("document map poisoned".into()))
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find_by_id(
        &self,
        collection: Collection,
        id: &str,
    ) -> StoreResult<Option<ProfileDocument>> {
        self.find_by_id_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        Ok(self.docs()?.get(&(collection, id.to_string())).cloned())
    }

    async fn find_by_ids(
        &self,
        collection: Collection,
        ids: &[String],
        projection: &[ProfileField],
    ) -> StoreResult<Vec<ProfileDocument>> {
        self.find_by_ids_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        let docs = self.docs()?;
        Ok(ids
            .iter()
            .filter_map(|id| docs.get(&(collection, id.clone())))
            .map(|doc| doc.clone().project(projection))
            .collect())
    }

    async fn delete_by_id(&self, collection: Collection, id: &str) -> StoreResult<bool> {
        self.enter().await?;
        Ok(self.docs()?.remove(&(collection, id.to_string())).is_some())
    }
}
