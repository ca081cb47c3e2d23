//! Shared connections keyed by configuration fingerprint.
//!
//! A [`ConnectionRegistry`] is created once at process start and handed to
//! every store. The first request for a fingerprint builds the connection
//! (verifying database and container, installing procedures); every later
//! request with the same fingerprint shares the same [`ConnectionHandle`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::{
    Result,
    client::{ContainerRef, DatabaseRef, DocumentClient},
    config::{ConnectionMode, ConsistencyLevel, Fingerprint, StoreOptions},
    metrics,
    partition::PARTITION_KEY_PATH,
    postgres::PgDocumentClient,
    procedure::TargetedLookupProcedure,
};

type Slot = Arc<OnceCell<Arc<ConnectionHandle>>>;

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<Fingerprint, Slot>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, fingerprint: Fingerprint) -> Slot {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.entry(fingerprint).or_default().clone()
    }

    /// Return the handle for `fingerprint`, running `factory` if none exists yet.
    ///
    /// Concurrent callers with the same fingerprint wait for a single factory
    /// run. A failed run is not remembered: the error goes to the caller whose
    /// factory ran and the next caller starts over.
    pub async fn get_or_create<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        factory: F,
    ) -> Result<Arc<ConnectionHandle>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ConnectionHandle>>,
    {
        let slot = self.slot(fingerprint);
        let handle = slot
            .get_or_try_init(|| async move {
                debug!(%fingerprint, "building connection");
                factory().await.map(Arc::new)
            })
            .await?;
        Ok(handle.clone())
    }

    /// Connect to a PostgreSQL-backed document database described by `options`.
    #[instrument(skip(self, options), fields(database = %options.database, container = %options.container))]
    pub async fn connect_postgres(&self, options: &StoreOptions) -> Result<Arc<ConnectionHandle>> {
        options.validate()?;
        self.get_or_create(options.fingerprint(), || build_postgres(options))
            .await
    }

    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&fingerprint)
            .is_some_and(|slot| slot.initialized())
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every connection. Stores still holding a handle will see
    /// transport failures afterwards.
    pub async fn shutdown(&self) {
        let drained: Vec<(Fingerprint, Slot)> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.drain().collect()
        };
        for (fingerprint, slot) in drained {
            if let Some(handle) = slot.get() {
                handle.client.close().await;
                info!(%fingerprint, "connection closed");
            }
        }
    }
}

async fn build_postgres(options: &StoreOptions) -> Result<ConnectionHandle> {
    let client: Arc<dyn DocumentClient> = Arc::new(PgDocumentClient::connect(options).await?);
    ConnectionHandle::establish(client, options).await
}

/// One live connection: client, resolved database and container, and the
/// session token used to pin reads.
pub struct ConnectionHandle {
    fingerprint: Fingerprint,
    client: Arc<dyn DocumentClient>,
    database: DatabaseRef,
    container: ContainerRef,
    consistency: ConsistencyLevel,
    connection_mode: ConnectionMode,
    default_page_size: u32,
    lookup_installed: bool,
    session_token: RwLock<Option<String>>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("fingerprint", &self.fingerprint)
            .field("database", &self.database)
            .field("container", &self.container)
            .field("consistency", &self.consistency)
            .field("connection_mode", &self.connection_mode)
            .field("lookup_installed", &self.lookup_installed)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Verify (or create) the database and container, then install the
    /// targeted lookup procedure. A failed installation leaves the handle in
    /// point-read mode instead of failing.
    #[instrument(skip(client, options), fields(database = %options.database, container = %options.container))]
    pub async fn establish(
        client: Arc<dyn DocumentClient>,
        options: &StoreOptions,
    ) -> Result<Self> {
        options.validate()?;
        let database = client.ensure_database(&options.database).await?;
        let container = client
            .ensure_container(&database, &options.container, PARTITION_KEY_PATH)
            .await?;

        let lookup_installed =
            match TargetedLookupProcedure::install(client.as_ref(), &container).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, container = %container.id, "lookup procedure unavailable; falling back to point reads");
                    false
                }
            };

        metrics::record_connection_created();
        Ok(Self {
            fingerprint: options.fingerprint(),
            client,
            database,
            container,
            consistency: ConsistencyLevel::Session,
            connection_mode: options.connection_mode,
            default_page_size: options.default_page_size.max(1),
            lookup_installed,
            session_token: RwLock::new(None),
        })
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn client(&self) -> &dyn DocumentClient {
        self.client.as_ref()
    }

    pub fn database(&self) -> &DatabaseRef {
        &self.database
    }

    pub fn container(&self) -> &ContainerRef {
        &self.container
    }

    pub fn consistency(&self) -> ConsistencyLevel {
        self.consistency
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        self.connection_mode
    }

    pub fn default_page_size(&self) -> u32 {
        self.default_page_size
    }

    pub fn lookup_procedure_installed(&self) -> bool {
        self.lookup_installed
    }

    pub fn session_token(&self) -> Option<String> {
        self.session_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pin `token` unless one is already pinned; returns whether it was stored.
    ///
    /// Only the first token after creation (or [`reset_session_token`]) is
    /// kept. Readers sharing the handle get read-your-writes for that first
    /// write, not for later ones.
    ///
    /// [`reset_session_token`]: Self::reset_session_token
    pub fn set_session_token_if_empty(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let mut slot = self
            .session_token
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(token.to_string());
        metrics::record_session_pin();
        true
    }

    pub fn reset_session_token(&self) -> Option<String> {
        self.session_token
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn observe_session(&self, token: Option<&str>) {
        if let Some(token) = token {
            self.set_session_token_if_empty(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, testing::MemoryClient};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn options(container: &str) -> StoreOptions {
        StoreOptions::builder("memory://local")
            .auth_key("key")
            .database("identity")
            .container(container)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn concurrent_first_access_builds_once() {
        let registry = Arc::new(ConnectionRegistry::new());
        let client = Arc::new(MemoryClient::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let opts = options("users");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let client = client.clone();
            let builds = builds.clone();
            let opts = opts.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .get_or_create(opts.fingerprint(), || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        ConnectionHandle::establish(client, &opts).await
                    })
                    .await
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(client.ensure_database_calls(), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn failed_construction_is_not_cached() {
        let registry = ConnectionRegistry::new();
        let client = Arc::new(MemoryClient::new());
        client.fail_next_ensure(1);
        let opts = options("users");

        let first = registry
            .get_or_create(opts.fingerprint(), || {
                ConnectionHandle::establish(client.clone(), &opts)
            })
            .await;
        assert!(matches!(first, Err(Error::StoreFailure { .. })));
        assert!(!registry.contains(opts.fingerprint()));

        let second = registry
            .get_or_create(opts.fingerprint(), || {
                ConnectionHandle::establish(client.clone(), &opts)
            })
            .await;
        assert!(second.is_ok());
        assert!(registry.contains(opts.fingerprint()));
        assert_eq!(client.ensure_database_calls(), 2);
    }

    #[tokio::test]
    async fn distinct_fingerprints_get_distinct_handles() {
        let registry = ConnectionRegistry::new();
        let client = Arc::new(MemoryClient::new());
        let users = options("users");
        let roles = options("roles");

        let (a, b) = tokio::join!(
            registry.get_or_create(users.fingerprint(), || {
                ConnectionHandle::establish(client.clone(), &users)
            }),
            registry.get_or_create(roles.fingerprint(), || {
                ConnectionHandle::establish(client.clone(), &roles)
            }),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.container().id, "users");
        assert_eq!(b.container().id, "roles");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn first_session_token_wins_until_reset() {
        let client = Arc::new(MemoryClient::new());
        let handle = ConnectionHandle::establish(client, &options("users"))
            .await
            .unwrap();
        assert_eq!(handle.consistency(), ConsistencyLevel::Session);
        assert!(handle.session_token().is_none());

        assert!(!handle.set_session_token_if_empty(""));
        assert!(handle.set_session_token_if_empty("1"));
        assert!(!handle.set_session_token_if_empty("2"));
        assert_eq!(handle.session_token().as_deref(), Some("1"));

        assert_eq!(handle.reset_session_token().as_deref(), Some("1"));
        assert!(handle.set_session_token_if_empty("3"));
        assert_eq!(handle.session_token().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn procedure_install_failure_degrades() {
        let client = Arc::new(MemoryClient::new());
        client.fail_procedures(true);
        let handle = ConnectionHandle::establish(client, &options("users"))
            .await
            .unwrap();
        assert!(!handle.lookup_procedure_installed());
    }

    #[tokio::test]
    async fn shutdown_closes_clients_and_empties_registry() {
        let registry = ConnectionRegistry::new();
        let client = Arc::new(MemoryClient::new());
        let opts = options("users");
        let handle = registry
            .get_or_create(opts.fingerprint(), || {
                ConnectionHandle::establish(client.clone(), &opts)
            })
            .await
            .unwrap();
        assert!(handle.lookup_procedure_installed());

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert!(client.is_closed());
    }
}
