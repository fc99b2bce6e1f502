use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use actix_web::web;
use tokio::time::Instant;

use crate::config::DEFAULT_REQUEST_TIMEOUT_MS;
use crate::documents::DocumentStore;
use crate::error::{CoreError, StoreError, StoreKind, StoreResult};
use crate::store::RelationalStore;

/// Process-wide store handles, injected into every component.
///
/// A handle returned by [`Stores::for_request`] shares one deadline across
/// every call made through it. An unscoped handle gives each call the full
/// budget.
#[derive(Clone)]
pub struct Stores {
    relational: Arc<dyn RelationalStore>,
    documents: Arc<dyn DocumentStore>,
    budget: Duration,
    expires_at: Option<Instant>,
}

impl Stores {
    pub fn new(relational: Arc<dyn RelationalStore>, documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            relational,
            documents,
            budget: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            expires_at: None,
        }
    }

    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Start the clock for one request.
    pub fn for_request(&self) -> Stores {
        Stores {
            expires_at: Some(Instant::now() + self.budget),
            ..self.clone()
        }
    }

    pub fn documents(&self) -> &dyn DocumentStore {
        self.documents.as_ref()
    }

    fn expiry(&self) -> Instant {
        self.expires_at.unwrap_or_else(|| Instant::now() + self.budget)
    }

    /// Run a blocking relational read off the async executor. On expiry the
    /// caller stops waiting; the read itself is left to finish and discarded.
    ///
    /// Only reads and idempotent single-statement upserts go through here.
    /// Transactional writes use [`Stores::relational_write`].
    pub async fn relational<T, F>(&self, op: F) -> Result<T, CoreError>
    where
        F: FnOnce(&dyn RelationalStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.relational);
        let task = web::block(move || op(store.as_ref()));
        match tokio::time::timeout_at(self.expiry(), task).await {
            Ok(Ok(result)) => result.map_err(|e| CoreError::from_store(StoreKind::Relational, e)),
            Ok(Err(blocking)) => Err(blocking_failed(blocking)),
            Err(_) => Err(self.expired(StoreKind::Relational)),
        }
    }

    /// Run a transactional write with whatever is left of the deadline. The
    /// store is handed that budget and rolls back rather than commit after
    /// it, so the outcome is awaited: an error here always means nothing was
    /// written.
    pub async fn relational_write<T, F>(&self, op: F) -> Result<T, CoreError>
    where
        F: FnOnce(&dyn RelationalStore, Duration) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.relational);
        let until = self.expiry().into_std();
        let task = web::block(move || {
            let budget = until.saturating_duration_since(std::time::Instant::now());
            if budget.is_zero() {
                return Err(StoreError::Unavailable(
                    "deadline expired before the write started".into(),
                ));
            }
            op(store.as_ref(), budget)
        });
        match task.await {
            Ok(result) => result.map_err(|e| {
                if matches!(e, StoreError::Unavailable(_)) {
                    tracing::warn!(error = %e, "relational write abandoned");
                }
                CoreError::from_store(StoreKind::Relational, e)
            }),
            Err(blocking) => Err(blocking_failed(blocking)),
        }
    }

    /// Await a document-store call, bounded by the deadline.
    pub async fn document<T, Fut>(&self, call: Fut) -> Result<T, CoreError>
    where
        Fut: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout_at(self.expiry(), call).await {
            Ok(result) => result.map_err(|e| CoreError::from_store(StoreKind::Document, e)),
            Err(_) => Err(self.expired(StoreKind::Document)),
        }
    }

    fn expired(&self, store: StoreKind) -> CoreError {
        tracing::warn!(%store, budget_ms = self.budget.as_millis() as u64, "store call timed out");
        CoreError::UpstreamUnavailable {
            store,
            source: StoreError::Unavailable(format!(
                "no answer within {}ms",
                self.budget.as_millis()
            )),
        }
    }
}

fn blocking_failed(err: actix_web::error::BlockingError) -> CoreError {
    CoreError::UpstreamUnavailable {
        store: StoreKind::Relational,
        source: StoreError::Unavailable(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{Collection, MemoryDocumentStore};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn slow_relational_store_hits_deadline() {
        let relational = MemoryStore::new().with_latency(Duration::from_millis(300));
        let stores = Stores::new(Arc::new(relational), Arc::new(MemoryDocumentStore::new()))
            .with_deadline(Duration::from_millis(20));

        let err = stores
            .relational(|store| store.find_patient("u1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::UpstreamUnavailable {
                store: StoreKind::Relational,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn slow_document_store_hits_deadline() {
        let documents = Arc::new(MemoryDocumentStore::new());
        documents.set_latency(Some(Duration::from_millis(300)));
        let stores = Stores::new(Arc::new(MemoryStore::new()), documents)
            .with_deadline(Duration::from_millis(20));

        let err = stores
            .document(stores.documents().find_by_id(Collection::Doctors, "d1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::UpstreamUnavailable {
                store: StoreKind::Document,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn request_scope_shares_one_deadline() {
        let relational = MemoryStore::new().with_latency(Duration::from_millis(40));
        let stores = Stores::new(Arc::new(relational), Arc::new(MemoryDocumentStore::new()))
            .with_deadline(Duration::from_millis(60));

        // unscoped: every call gets the whole budget
        for _ in 0..2 {
            stores.relational(|store| store.find_patient("u1")).await.unwrap();
        }

        let scoped = stores.for_request();
        scoped.relational(|store| store.find_patient("u1")).await.unwrap();
        let err = scoped
            .relational(|store| store.find_patient("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UpstreamUnavailable { .. }));
    }

    #[tokio::test]
    async fn expired_scope_never_starts_a_write() {
        let relational = Arc::new(MemoryStore::new());
        let stores = Stores::new(relational.clone(), Arc::new(MemoryDocumentStore::new()))
            .with_deadline(Duration::from_millis(10))
            .for_request();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = stores
            .relational_write(|store, budget| store.delete_doctor_footprint(1, budget))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::UpstreamUnavailable {
                store: StoreKind::Relational,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn store_errors_keep_their_cause() {
        let documents = Arc::new(MemoryDocumentStore::new());
        documents.set_unavailable(true);
        let stores = Stores::new(Arc::new(MemoryStore::new()), documents);

        let err = stores
            .document(stores.documents().find_by_id(Collection::Users, "u1"))
            .await
            .unwrap_err();
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("store unavailable: document store offline"));
    }
}
