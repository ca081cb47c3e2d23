use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    Error, Result,
    client::{ItemResponse, RequestOptions, StatusCode},
    connection::ConnectionHandle,
    metrics,
    model::{Aggregate, DocumentKey},
    partition,
    procedure::TargetedLookupProcedure,
    query::QueryEngine,
};

/// Race `fut` against `cancel`. The future is dropped when the token fires.
pub(crate) async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        out = fut => Ok(out),
    }
}

/// Typed CRUD over one container for one aggregate kind.
///
/// Any number of stores can share a [`ConnectionHandle`]. Disposing a store
/// only affects that store.
pub struct DocumentStore<T: Aggregate> {
    handle: Arc<ConnectionHandle>,
    disposed: AtomicBool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Aggregate> std::fmt::Debug for DocumentStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("kind", &T::KIND)
            .field("container", &self.handle.container().id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl<T: Aggregate> DocumentStore<T> {
    pub fn new(handle: Arc<ConnectionHandle>) -> Self {
        Self {
            handle,
            disposed: AtomicBool::new(false),
            _marker: PhantomData,
        }
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            debug!(kind = T::KIND, "store disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn query(&self) -> Result<QueryEngine> {
        self.ensure_live()?;
        Ok(QueryEngine::new(self.handle.clone()))
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn begin(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_live()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn decode(&self, response: ItemResponse) -> Result<T> {
        self.handle.observe_session(response.session_token.as_deref());
        Ok(serde_json::from_value(response.document)?)
    }

    fn encode(doc: &T) -> Result<Value> {
        Ok(serde_json::to_value(doc)?)
    }

    #[instrument(skip(self, doc, cancel), fields(kind = T::KIND, id = %doc.id()))]
    pub async fn create(&self, mut doc: T, cancel: &CancellationToken) -> Result<T> {
        self.begin(cancel)?;
        if doc.id().trim().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{} id must not be blank",
                T::KIND
            )));
        }
        let meta = doc.meta_mut();
        meta.assign_partition_key();
        meta.ensure_concurrency_stamp();

        let partition_key = doc.meta().partition_key().to_string();
        let body = Self::encode(&doc)?;
        let result = cancellable(
            cancel,
            self.handle.client().create_item(
                self.handle.container(),
                &partition_key,
                body,
                &RequestOptions::default(),
            ),
        )
        .await?;

        match result {
            Ok(response) => {
                metrics::record_doc_write(1);
                self.decode(response)
            }
            Err(err) if err.status == StatusCode::Conflict => Err(Error::AlreadyExists {
                id: doc.id().to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Replace the stored document. Fails with [`Error::ConcurrencyFailure`]
    /// when `doc` carries an entity tag that is no longer current.
    #[instrument(skip(self, doc, cancel), fields(kind = T::KIND, id = %doc.id()))]
    pub async fn update(&self, mut doc: T, cancel: &CancellationToken) -> Result<T> {
        self.begin(cancel)?;
        if doc.id().trim().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{} id must not be blank",
                T::KIND
            )));
        }
        let meta = doc.meta_mut();
        meta.assign_partition_key();
        meta.regenerate_concurrency_stamp();

        let id = doc.id().to_string();
        let partition_key = doc.meta().partition_key().to_string();
        let options = RequestOptions::if_match(doc.meta().etag());
        let body = Self::encode(&doc)?;
        let result = cancellable(
            cancel,
            self.handle.client().replace_item(
                self.handle.container(),
                &id,
                &partition_key,
                body,
                &options,
            ),
        )
        .await?;

        match result {
            Ok(response) => {
                metrics::record_doc_write(1);
                self.decode(response)
            }
            // A missing document was removed after the caller read it.
            Err(err)
                if matches!(
                    err.status,
                    StatusCode::PreconditionFailed | StatusCode::NotFound
                ) =>
            {
                metrics::record_doc_conflict();
                debug!(status = %err.status, "update rejected");
                Err(Error::ConcurrencyFailure { id })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deleting a document that no longer exists succeeds.
    #[instrument(skip(self, doc, cancel), fields(kind = T::KIND, id = %doc.id()))]
    pub async fn delete(&self, doc: &T, cancel: &CancellationToken) -> Result<()> {
        self.begin(cancel)?;
        let id = doc.id();
        if id.trim().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{} id must not be blank",
                T::KIND
            )));
        }
        let partition_key = partition::derive(id);
        let options = RequestOptions::if_match(doc.meta().etag());
        let result = cancellable(
            cancel,
            self.handle
                .client()
                .delete_item(self.handle.container(), id, &partition_key, &options),
        )
        .await?;

        match result {
            Ok(response) => {
                metrics::record_doc_write(1);
                self.handle.observe_session(response.session_token.as_deref());
                Ok(())
            }
            Err(err) if err.status == StatusCode::NotFound => {
                debug!("document already absent");
                Ok(())
            }
            Err(err) if err.status == StatusCode::PreconditionFailed => {
                metrics::record_doc_conflict();
                Err(Error::ConcurrencyFailure { id: id.to_string() })
            }
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self, id, cancel), fields(kind = T::KIND))]
    pub async fn find_by_id(&self, id: &T::Key, cancel: &CancellationToken) -> Result<Option<T>> {
        self.begin(cancel)?;
        let id = id.to_document_id();
        if id.trim().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{} id must not be blank",
                T::KIND
            )));
        }
        metrics::record_doc_read();

        if self.handle.lookup_procedure_installed() {
            match TargetedLookupProcedure::new(&self.handle)
                .invoke::<T>(&id, cancel)
                .await
            {
                Ok(found) => return Ok(found),
                Err(Error::StoreFailure {
                    status: StatusCode::NotFound,
                    message,
                }) => {
                    metrics::record_lookup_fallback();
                    warn!(%message, "lookup procedure missing; using point read");
                }
                Err(err) => return Err(err),
            }
        }
        self.read_item(&id, cancel).await
    }

    async fn read_item(&self, id: &str, cancel: &CancellationToken) -> Result<Option<T>> {
        let partition_key = partition::derive(id);
        let options = RequestOptions::session(self.handle.session_token());
        let result = cancellable(
            cancel,
            self.handle
                .client()
                .read_item(self.handle.container(), id, &partition_key, &options),
        )
        .await?;

        match result {
            Ok(response) => Ok(Some(serde_json::from_value(response.document)?)),
            Err(err) if err.status == StatusCode::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Move `doc` to `new_id`. The primary id of a stored document is
    /// immutable, so the old document is deleted and a copy is created.
    #[instrument(skip(self, doc, new_id, cancel), fields(kind = T::KIND, from = %doc.id(), to = ?new_id))]
    pub async fn rekey(&self, doc: T, new_id: &T::Key, cancel: &CancellationToken) -> Result<T> {
        self.begin(cancel)?;
        let new_id = new_id.to_document_id();
        if new_id.trim().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{} id must not be blank",
                T::KIND
            )));
        }
        if new_id == doc.id() {
            return Ok(doc);
        }
        if self.read_item(&new_id, cancel).await?.is_some() {
            return Err(Error::AlreadyExists { id: new_id });
        }
        self.delete(&doc, cancel).await?;

        let mut moved = doc;
        moved.meta_mut().rekey(new_id);
        self.create(moved, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::IdentityUser,
        testing::{MemoryClient, memory_handle, remove_lookup_procedure},
    };

    type User = IdentityUser;

    async fn store() -> (Arc<MemoryClient>, DocumentStore<User>) {
        let client = Arc::new(MemoryClient::new());
        let handle = memory_handle(client.clone(), "users").await.unwrap();
        (client, DocumentStore::new(handle))
    }

    #[tokio::test]
    async fn create_then_find_observes_the_write() {
        let (_client, store) = store().await;
        let cancel = CancellationToken::new();

        let created = store
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap();
        assert_eq!(created.meta.partition_key(), "0001");
        assert!(created.meta.etag().is_some());
        assert!(created.meta.timestamp().is_some());
        assert!(store.handle().session_token().is_some());

        let found = store
            .find_by_id(&"user-0001".to_string(), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, created);
    }

    #[tokio::test]
    async fn create_rejects_blank_ids_and_duplicates() {
        let (client, store) = store().await;
        let cancel = CancellationToken::new();

        let err = store
            .create(User::with_id("  ", "nobody"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(client.item_count(store.handle().container()), 0);

        store
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap();
        let err = store
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { ref id } if id == "user-0001"));
    }

    #[tokio::test]
    async fn stale_update_is_a_concurrency_failure() {
        let (_client, store) = store().await;
        let cancel = CancellationToken::new();

        let created = store
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap();
        let stale = created.clone();

        let mut fresh = created;
        fresh.email = Some("alice@example.com".into());
        let updated = store.update(fresh.clone(), &cancel).await.unwrap();
        assert_ne!(updated.meta.concurrency_stamp(), fresh.meta.concurrency_stamp());
        assert_ne!(updated.meta.etag(), fresh.meta.etag());

        let err = store.update(stale, &cancel).await.unwrap_err();
        assert!(err.is_concurrency_failure());
    }

    #[tokio::test]
    async fn update_of_vanished_document_is_a_concurrency_failure() {
        let (_client, store) = store().await;
        let cancel = CancellationToken::new();
        let created = store
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap();
        store.delete(&created, &cancel).await.unwrap();

        let err = store.update(created, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrencyFailure { .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent_but_checks_entity_tags() {
        let (_client, store) = store().await;
        let cancel = CancellationToken::new();

        store
            .delete(&User::with_id("user-9999", "ghost"), &cancel)
            .await
            .unwrap();
        assert!(
            store
                .find_by_id(&"user-9999".to_string(), &cancel)
                .await
                .unwrap()
                .is_none()
        );

        let created = store
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap();
        store.update(created.clone(), &cancel).await.unwrap();
        let err = store.delete(&created, &cancel).await.unwrap_err();
        assert!(err.is_concurrency_failure());
    }

    #[tokio::test]
    async fn claims_survive_the_update_cycle() {
        let (_client, store) = store().await;
        let cancel = CancellationToken::new();
        let id = "user-0001".to_string();

        let mut user = store
            .create(User::with_id(id.clone(), "alice"), &cancel)
            .await
            .unwrap();
        user.add_claim("email", "alice@example.com");
        user.add_claim("dept", "ops");
        store.update(user, &cancel).await.unwrap();

        let found = store.find_by_id(&id, &cancel).await.unwrap().unwrap();
        assert_eq!(found.id(), "user-0001");
        assert_eq!(found.claims.len(), 2);

        store.delete(&found, &cancel).await.unwrap();
        assert!(store.find_by_id(&id, &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn find_falls_back_to_point_reads_without_procedure() {
        let client = Arc::new(MemoryClient::new());
        client.fail_procedures(true);
        let handle = memory_handle(client.clone(), "users").await.unwrap();
        assert!(!handle.lookup_procedure_installed());
        let store: DocumentStore<User> = DocumentStore::new(handle);
        let cancel = CancellationToken::new();

        store
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap();
        let found = store
            .find_by_id(&"user-0001".to_string(), &cancel)
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(client.procedure_calls(), 0);
    }

    #[tokio::test]
    async fn missing_procedure_at_call_time_falls_back() {
        let (client, store) = store().await;
        let cancel = CancellationToken::new();
        store
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap();
        remove_lookup_procedure(&client, store.handle().container()).await;

        let found = store
            .find_by_id(&"user-0001".to_string(), &cancel)
            .await
            .unwrap();
        assert_eq!(found.map(|u| u.user_name), Some(Some("alice".to_string())));
        assert_eq!(client.procedure_calls(), 1);
    }

    #[tokio::test]
    async fn find_uses_the_installed_procedure() {
        let (client, store) = store().await;
        let cancel = CancellationToken::new();
        store
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap();
        store
            .find_by_id(&"user-0001".to_string(), &cancel)
            .await
            .unwrap();
        assert_eq!(client.procedure_calls(), 1);
    }

    #[tokio::test]
    async fn disposal_is_local_and_checked_first() {
        let client = Arc::new(MemoryClient::new());
        let handle = memory_handle(client.clone(), "users").await.unwrap();
        let first: DocumentStore<User> = DocumentStore::new(handle.clone());
        let second: DocumentStore<User> = DocumentStore::new(handle);
        let cancel = CancellationToken::new();
        cancel.cancel();

        first.dispose();
        first.dispose();
        assert!(first.is_disposed());
        let err = first
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disposed));
        assert!(matches!(first.query(), Err(Error::Disposed)));

        let live = CancellationToken::new();
        second
            .create(User::with_id("user-0001", "alice"), &live)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_operations_do_no_io() {
        let (client, store) = store().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let before = client.request_count();

        let err = store
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        let err = store
            .find_by_id(&"user-0001".to_string(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(client.request_count(), before);
    }

    #[tokio::test]
    async fn rekey_moves_the_document() {
        let (_client, store) = store().await;
        let cancel = CancellationToken::new();
        let mut user = store
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap();
        user.add_claim("dept", "ops");
        let user = store.update(user, &cancel).await.unwrap();

        let moved = store
            .rekey(user, &"user-0042".to_string(), &cancel)
            .await
            .unwrap();
        assert_eq!(moved.id(), "user-0042");
        assert_eq!(moved.meta.partition_key(), "0042");
        assert!(moved.has_claim("dept", "ops"));
        assert!(
            store
                .find_by_id(&"user-0001".to_string(), &cancel)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .find_by_id(&"user-0042".to_string(), &cancel)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn rekey_onto_a_taken_id_keeps_the_original() {
        let (client, store) = store().await;
        let cancel = CancellationToken::new();
        let alice = store
            .create(User::with_id("user-0001", "alice"), &cancel)
            .await
            .unwrap();
        store
            .create(User::with_id("user-0002", "bob"), &cancel)
            .await
            .unwrap();

        let err = store
            .rekey(alice, &"user-0002".to_string(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { ref id } if id == "user-0002"));
        let original = store
            .find_by_id(&"user-0001".to_string(), &cancel)
            .await
            .unwrap();
        assert_eq!(original.and_then(|u| u.user_name).as_deref(), Some("alice"));
        assert_eq!(client.item_count(store.handle().container()), 2);
    }

    #[tokio::test]
    async fn cancelling_an_in_flight_create_leaves_no_trace() {
        let (client, store) = store().await;
        let cancel = CancellationToken::new();
        client.stall_requests(true);

        let fire = async {
            client.wait_parked().await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(
            store.create(User::with_id("user-0001", "alice"), &cancel),
            fire
        );
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(client.item_count(store.handle().container()), 0);
        assert!(store.handle().session_token().is_none());
    }

    #[tokio::test]
    async fn cancelling_an_in_flight_update_keeps_the_stored_copy() {
        let (client, store) = store().await;
        let live = CancellationToken::new();
        let created = store
            .create(User::with_id("user-0001", "alice"), &live)
            .await
            .unwrap();
        let mut edited = created.clone();
        edited.email = Some("alice@example.com".into());

        client.stall_requests(true);
        let cancel = CancellationToken::new();
        let fire = async {
            client.wait_parked().await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(store.update(edited, &cancel), fire);
        assert!(matches!(result, Err(Error::Cancelled)));

        client.stall_requests(false);
        let stored = store
            .find_by_id(&"user-0001".to_string(), &live)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.email, None);
        assert_eq!(stored.meta.etag(), created.meta.etag());
    }
}
