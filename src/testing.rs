//! In-process [`DocumentClient`] for tests.
//!
//! [`MemoryClient`] keeps containers in memory and honours the same contract
//! as the PostgreSQL backend for item CRUD, entity tags, session tokens,
//! paging and the lookup procedure. Query text is not interpreted: any text
//! starting with `select` returns every document in scope, in id order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    Result,
    client::{
        ClientError, ClientResult, ContainerRef, DatabaseRef, DeleteResponse, DocumentClient,
        ItemResponse, ProcedureResponse, QueryPage, QueryRequest, RequestOptions, StatusCode,
    },
    config::StoreOptions,
    connection::ConnectionHandle,
    partition,
    procedure::{LOOKUP_PROCEDURE_ID, ProcedureDefinition},
};

#[derive(Clone, Debug)]
struct StoredItem {
    partition_key: String,
    document: Map<String, Value>,
    etag: String,
    ts: i64,
}

impl StoredItem {
    fn view(&self) -> Value {
        let mut document = self.document.clone();
        document.insert("_etag".into(), Value::String(self.etag.clone()));
        document.insert("_ts".into(), Value::from(self.ts));
        Value::Object(document)
    }
}

#[derive(Debug, Default)]
struct Container {
    items: BTreeMap<String, StoredItem>,
    procedures: HashMap<String, ProcedureDefinition>,
}

#[derive(Debug, Default)]
struct State {
    databases: HashSet<String>,
    containers: HashMap<(String, String), Container>,
}

#[derive(Debug, Default)]
pub struct MemoryClient {
    state: Mutex<State>,
    lsn: AtomicU64,
    requests: AtomicUsize,
    ensure_database_calls: AtomicUsize,
    page_requests: AtomicUsize,
    procedure_calls: AtomicUsize,
    failing_ensures: AtomicUsize,
    fail_procedures: AtomicBool,
    stalled: AtomicBool,
    parked: Notify,
    closed: AtomicBool,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls to `ensure_database` with 503.
    pub fn fail_next_ensure(&self, count: usize) {
        self.failing_ensures.store(count, Ordering::SeqCst);
    }

    /// Reject procedure management calls, as a backend without procedure
    /// support would.
    pub fn fail_procedures(&self, fail: bool) {
        self.fail_procedures.store(fail, Ordering::SeqCst);
    }

    /// Park item and query requests before they touch any state, until the
    /// caller drops them. Used to cancel calls that are in flight.
    pub fn stall_requests(&self, stall: bool) {
        self.stalled.store(stall, Ordering::SeqCst);
    }

    /// Resolves once a request has parked.
    pub async fn wait_parked(&self) {
        self.parked.notified().await;
    }

    pub fn ensure_database_calls(&self) -> usize {
        self.ensure_database_calls.load(Ordering::SeqCst)
    }

    pub fn page_requests(&self) -> usize {
        self.page_requests.load(Ordering::SeqCst)
    }

    pub fn procedure_calls(&self) -> usize {
        self.procedure_calls.load(Ordering::SeqCst)
    }

    /// Calls made through the [`DocumentClient`] trait.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn item_count(&self, container: &ContainerRef) -> usize {
        self.lock()
            .containers
            .get(&(container.database.clone(), container.id.clone()))
            .map_or(0, |c| c.items.len())
    }

    /// Insert a raw document, bypassing the store layer. The partition key is
    /// taken from `partitionKey` or derived from `id`.
    pub fn seed(&self, container: &ContainerRef, document: Value) {
        let Value::Object(mut document) = document else {
            return;
        };
        let Some(id) = document.get("id").and_then(Value::as_str).map(str::to_owned) else {
            return;
        };
        let partition_key = document
            .get("partitionKey")
            .and_then(Value::as_str)
            .map_or_else(|| partition::derive(&id), str::to_owned);
        document.remove("_etag");
        document.remove("_ts");
        let item = self.stamp(partition_key, document);
        let mut state = self.lock();
        state
            .containers
            .entry((container.database.clone(), container.id.clone()))
            .or_default()
            .items
            .insert(id, item);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    async fn park(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            self.parked.notify_one();
            std::future::pending::<()>().await;
        }
    }

    fn next_session(&self) -> String {
        (self.lsn.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stamp(&self, partition_key: String, document: Map<String, Value>) -> StoredItem {
        StoredItem {
            partition_key,
            document,
            etag: format!("\"{}\"", Uuid::new_v4()),
            ts: Utc::now().timestamp(),
        }
    }

    fn with_container<R>(
        &self,
        container: &ContainerRef,
        f: impl FnOnce(&mut Container) -> ClientResult<R>,
    ) -> ClientResult<R> {
        let mut state = self.lock();
        let entry = state
            .containers
            .get_mut(&(container.database.clone(), container.id.clone()))
            .ok_or_else(|| ClientError::not_found(format!("container `{}`", container.id)))?;
        f(entry)
    }

    fn closed_guard(&self) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::new(
                StatusCode::ServiceUnavailable,
                "client closed",
            ));
        }
        Ok(())
    }
}

fn into_object(document: Value) -> ClientResult<Map<String, Value>> {
    match document {
        Value::Object(mut map) => {
            map.remove("_etag");
            map.remove("_ts");
            Ok(map)
        }
        _ => Err(ClientError::bad_request("document must be a JSON object")),
    }
}

fn check_precondition(item: &StoredItem, options: &RequestOptions) -> ClientResult<()> {
    match options.if_match.as_deref() {
        Some(etag) if etag != item.etag => Err(ClientError::new(
            StatusCode::PreconditionFailed,
            "entity tag mismatch",
        )),
        _ => Ok(()),
    }
}

#[async_trait]
impl DocumentClient for MemoryClient {
    async fn ensure_database(&self, database: &str) -> ClientResult<DatabaseRef> {
        self.touch();
        self.ensure_database_calls.fetch_add(1, Ordering::SeqCst);
        self.closed_guard()?;
        let failing = self
            .failing_ensures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ClientError::new(
                StatusCode::ServiceUnavailable,
                "endpoint unreachable",
            ));
        }
        self.lock().databases.insert(database.to_string());
        Ok(DatabaseRef {
            id: database.to_string(),
        })
    }

    async fn ensure_container(
        &self,
        database: &DatabaseRef,
        container: &str,
        partition_key_path: &str,
    ) -> ClientResult<ContainerRef> {
        self.touch();
        self.closed_guard()?;
        let mut state = self.lock();
        if !state.databases.contains(&database.id) {
            return Err(ClientError::not_found(format!("database `{}`", database.id)));
        }
        state
            .containers
            .entry((database.id.clone(), container.to_string()))
            .or_default();
        Ok(ContainerRef {
            database: database.id.clone(),
            id: container.to_string(),
            partition_key_path: partition_key_path.to_string(),
        })
    }

    async fn create_item(
        &self,
        container: &ContainerRef,
        partition_key: &str,
        document: Value,
        _options: &RequestOptions,
    ) -> ClientResult<ItemResponse> {
        self.touch();
        self.park().await;
        self.closed_guard()?;
        let document = into_object(document)?;
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ClientError::bad_request("document has no id"))?;
        let item = self.stamp(partition_key.to_string(), document);
        let session = self.next_session();
        self.with_container(container, |c| {
            if c.items.contains_key(&id) {
                return Err(ClientError::new(StatusCode::Conflict, "id already exists"));
            }
            let response = ItemResponse {
                document: item.view(),
                etag: Some(item.etag.clone()),
                session_token: Some(session),
            };
            c.items.insert(id, item);
            Ok(response)
        })
    }

    async fn replace_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        document: Value,
        options: &RequestOptions,
    ) -> ClientResult<ItemResponse> {
        self.touch();
        self.park().await;
        self.closed_guard()?;
        let document = into_object(document)?;
        let item = self.stamp(partition_key.to_string(), document);
        let session = self.next_session();
        self.with_container(container, |c| {
            let existing = c
                .items
                .get(id)
                .filter(|existing| existing.partition_key == partition_key)
                .ok_or_else(|| ClientError::not_found(format!("document `{id}`")))?;
            check_precondition(existing, options)?;
            let response = ItemResponse {
                document: item.view(),
                etag: Some(item.etag.clone()),
                session_token: Some(session),
            };
            c.items.insert(id.to_string(), item);
            Ok(response)
        })
    }

    async fn read_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        _options: &RequestOptions,
    ) -> ClientResult<ItemResponse> {
        self.touch();
        self.park().await;
        self.closed_guard()?;
        self.with_container(container, |c| {
            let item = c
                .items
                .get(id)
                .filter(|item| item.partition_key == partition_key)
                .ok_or_else(|| ClientError::not_found(format!("document `{id}`")))?;
            Ok(ItemResponse {
                document: item.view(),
                etag: Some(item.etag.clone()),
                session_token: None,
            })
        })
    }

    async fn delete_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        options: &RequestOptions,
    ) -> ClientResult<DeleteResponse> {
        self.touch();
        self.park().await;
        self.closed_guard()?;
        let session = self.next_session();
        self.with_container(container, |c| {
            let existing = c
                .items
                .get(id)
                .filter(|item| item.partition_key == partition_key)
                .ok_or_else(|| ClientError::not_found(format!("document `{id}`")))?;
            check_precondition(existing, options)?;
            c.items.remove(id);
            Ok(DeleteResponse {
                session_token: Some(session),
            })
        })
    }

    async fn query_page(
        &self,
        container: &ContainerRef,
        request: QueryRequest<'_>,
    ) -> ClientResult<QueryPage> {
        self.touch();
        self.park().await;
        self.page_requests.fetch_add(1, Ordering::SeqCst);
        self.closed_guard()?;
        let text = request.definition.text().trim_start();
        if !text
            .get(..7)
            .is_some_and(|head| head.eq_ignore_ascii_case("select "))
        {
            return Err(ClientError::bad_request(format!(
                "syntax error in query `{text}`"
            )));
        }
        let offset = match request.continuation {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ClientError::bad_request("invalid continuation token"))?,
            None => 0,
        };
        let page_size = request.max_item_count.max(1) as usize;
        self.with_container(container, |c| {
            let items: Vec<Value> = c
                .items
                .values()
                .filter(|item| {
                    request
                        .partition_key
                        .is_none_or(|pk| item.partition_key == pk)
                })
                .skip(offset)
                .take(page_size)
                .map(StoredItem::view)
                .collect();
            let continuation = (items.len() == page_size).then(|| (offset + page_size).to_string());
            Ok(QueryPage {
                items,
                continuation,
            })
        })
    }

    async fn delete_procedure(&self, container: &ContainerRef, id: &str) -> ClientResult<()> {
        self.touch();
        self.closed_guard()?;
        if self.fail_procedures.load(Ordering::SeqCst) {
            return Err(ClientError::new(
                StatusCode::Other(405),
                "procedures not supported",
            ));
        }
        self.with_container(container, |c| {
            c.procedures
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| ClientError::not_found(format!("procedure `{id}`")))
        })
    }

    async fn create_procedure(
        &self,
        container: &ContainerRef,
        definition: &ProcedureDefinition,
    ) -> ClientResult<()> {
        self.touch();
        self.closed_guard()?;
        if self.fail_procedures.load(Ordering::SeqCst) {
            return Err(ClientError::new(
                StatusCode::Other(405),
                "procedures not supported",
            ));
        }
        self.with_container(container, |c| {
            if c.procedures.contains_key(&definition.id) {
                return Err(ClientError::new(
                    StatusCode::Conflict,
                    "procedure already exists",
                ));
            }
            c.procedures
                .insert(definition.id.clone(), definition.clone());
            Ok(())
        })
    }

    async fn execute_procedure(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        args: Vec<Value>,
        _options: &RequestOptions,
    ) -> ClientResult<ProcedureResponse> {
        self.touch();
        self.park().await;
        self.procedure_calls.fetch_add(1, Ordering::SeqCst);
        self.closed_guard()?;
        self.with_container(container, |c| {
            if !c.procedures.contains_key(id) {
                return Err(ClientError::not_found(format!("procedure `{id}`")));
            }
            if id != LOOKUP_PROCEDURE_ID {
                return Err(ClientError::bad_request(format!(
                    "procedure `{id}` cannot run in memory"
                )));
            }
            let target = args.first().and_then(Value::as_str).unwrap_or_default();
            let value = c
                .items
                .get(target)
                .filter(|item| item.partition_key == partition_key)
                .map_or(Value::Null, StoredItem::view);
            Ok(ProcedureResponse {
                value,
                session_token: None,
            })
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Establish a handle on `client` for `container` in database `identity`.
pub async fn memory_handle(
    client: Arc<MemoryClient>,
    container: &str,
) -> Result<Arc<ConnectionHandle>> {
    let options = StoreOptions::builder("memory://local")
        .auth_key("memory")
        .database("identity")
        .container(container)
        .build()?;
    Ok(Arc::new(ConnectionHandle::establish(client, &options).await?))
}

/// Drop the lookup procedure behind the handle's back.
pub async fn remove_lookup_procedure(client: &MemoryClient, container: &ContainerRef) {
    let _ = client.delete_procedure(container, LOOKUP_PROCEDURE_ID).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryDefinition;
    use serde_json::json;

    async fn container(client: &MemoryClient) -> ContainerRef {
        let db = client.ensure_database("identity").await.unwrap();
        client.ensure_container(&db, "users", "/partitionKey").await.unwrap()
    }

    #[tokio::test]
    async fn writes_assign_entity_tags_and_session_tokens() {
        let client = MemoryClient::new();
        let c = container(&client).await;
        let created = client
            .create_item(&c, "0001", json!({"id": "user-0001"}), &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(created.session_token.as_deref(), Some("1"));
        let etag = created.etag.unwrap();

        let stale = RequestOptions::if_match(Some("\"other\""));
        let err = client
            .replace_item(&c, "user-0001", "0001", json!({"id": "user-0001"}), &stale)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::PreconditionFailed);

        let current = RequestOptions::if_match(Some(etag.as_str()));
        let replaced = client
            .replace_item(&c, "user-0001", "0001", json!({"id": "user-0001"}), &current)
            .await
            .unwrap();
        assert_ne!(replaced.etag.as_deref(), Some(etag.as_str()));
    }

    #[tokio::test]
    async fn reads_are_partition_scoped() {
        let client = MemoryClient::new();
        let c = container(&client).await;
        client.seed(&c, json!({"id": "user-0001"}));
        let opts = RequestOptions::default();
        assert!(client.read_item(&c, "user-0001", "0001", &opts).await.is_ok());
        let err = client.read_item(&c, "user-0001", "9999", &opts).await.unwrap_err();
        assert_eq!(err.status, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn full_pages_carry_a_continuation() {
        let client = MemoryClient::new();
        let c = container(&client).await;
        for i in 0..4 {
            client.seed(&c, json!({"id": format!("doc-{i:04}")}));
        }
        let query = QueryDefinition::new("select c.doc from c");
        let request = QueryRequest {
            definition: &query,
            partition_key: None,
            max_item_count: 2,
            continuation: Some("2"),
            session_token: None,
        };
        let page = client.query_page(&c, request).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.continuation.as_deref(), Some("4"));

        let bad = QueryRequest {
            continuation: Some("x"),
            ..request
        };
        assert_eq!(
            client.query_page(&c, bad).await.unwrap_err().status,
            StatusCode::BadRequest
        );
    }
}
