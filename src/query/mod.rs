//! Parameterized queries and lazy paging.
//!
//! Query text runs against the relation `c(id, partition_key, body, doc)`.
//! `doc` is the stored JSON document including `_etag` and `_ts`; `body` is
//! the document as written, and predicates on it can use the container's
//! indexes. Every query projects a single JSON column. Parameters are referenced as `@name` and are
//! always bound, never spliced into the text.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    Error, Result,
    client::{ClientError, QueryRequest, StatusCode},
    connection::ConnectionHandle,
    metrics,
    store::cancellable,
};

const SLOW_PAGE: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq)]
pub struct QueryParameter {
    pub name: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryDefinition {
    text: String,
    parameters: Vec<QueryParameter>,
}

impl QueryDefinition {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    /// Bind `value` to `@name`; the leading `@` is optional.
    pub fn with_parameter(mut self, name: &str, value: impl Into<Value>) -> Self {
        let name = if name.starts_with('@') {
            name.to_string()
        } else {
            format!("@{name}")
        };
        match self.parameters.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.value = value.into(),
            None => self.parameters.push(QueryParameter {
                name,
                value: value.into(),
            }),
        }
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn parameters(&self) -> &[QueryParameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }
}

/// Incremental builder for [`QueryDefinition`]s.
///
/// ```
/// use rillflow_identity::query::QueryBuilder;
///
/// let mut qb = QueryBuilder::new("select c.doc from c where c.body #>> ");
/// qb.push_path(&["normalizedUserName"]).push(" = ").push_bind("ALICE");
/// let query = qb.build();
/// assert_eq!(query.text(), "select c.doc from c where c.body #>> @p0::text[] = @p1");
/// ```
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    text: String,
    parameters: Vec<QueryParameter>,
}

impl QueryBuilder {
    pub fn new(init: impl Into<String>) -> Self {
        Self {
            text: init.into(),
            parameters: Vec::new(),
        }
    }

    pub fn push(&mut self, sql: impl AsRef<str>) -> &mut Self {
        self.text.push_str(sql.as_ref());
        self
    }

    pub fn push_bind(&mut self, value: impl Into<Value>) -> &mut Self {
        let name = format!("@p{}", self.parameters.len());
        self.text.push_str(&name);
        self.parameters.push(QueryParameter {
            name,
            value: value.into(),
        });
        self
    }

    /// Bind a JSON path (for `#>` / `#>>`). The reference carries a
    /// `::text[]` cast, which makes the backend bind it as a text array.
    pub fn push_path(&mut self, path: &[&str]) -> &mut Self {
        let segments = path
            .iter()
            .map(|segment| Value::String((*segment).to_string()))
            .collect::<Vec<_>>();
        self.push_bind(Value::Array(segments)).push("::text[]")
    }

    pub fn sql(&self) -> &str {
        &self.text
    }

    pub fn build(self) -> QueryDefinition {
        QueryDefinition {
            text: self.text,
            parameters: self.parameters,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub page_size: Option<u32>,
    /// Restrict the query to one partition instead of fanning out.
    pub partition_key: Option<String>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }
}

#[derive(Clone)]
pub struct QueryEngine {
    handle: Arc<ConnectionHandle>,
}

impl QueryEngine {
    pub fn new(handle: Arc<ConnectionHandle>) -> Self {
        Self { handle }
    }

    /// Prepare a lazy result sequence. Nothing is sent until the first pull.
    pub fn run<T: DeserializeOwned>(
        &self,
        definition: QueryDefinition,
        options: QueryOptions,
        cancel: &CancellationToken,
    ) -> QueryStream<T> {
        let page_size = options
            .page_size
            .unwrap_or_else(|| self.handle.default_page_size())
            .max(1);
        QueryStream {
            handle: self.handle.clone(),
            definition,
            partition_key: options.partition_key,
            page_size,
            cancel: cancel.clone(),
            buffer: VecDeque::new(),
            continuation: None,
            state: PagingState::NotStarted,
            pages_fetched: 0,
            _marker: PhantomData,
        }
    }

    pub async fn first_or_default<T: DeserializeOwned>(
        &self,
        definition: QueryDefinition,
        cancel: &CancellationToken,
    ) -> Result<Option<T>> {
        self.run(definition, QueryOptions::default(), cancel)
            .first_or_default()
            .await
    }

    pub async fn to_list<T: DeserializeOwned>(
        &self,
        definition: QueryDefinition,
        options: QueryOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>> {
        self.run(definition, options, cancel).to_list().await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PagingState {
    NotStarted,
    /// The last page carried a continuation token.
    HasMore,
    Exhausted,
}

/// Pull-based, finite and non-restartable result sequence.
///
/// Pages are fetched on demand; the sequence ends when a page comes back
/// without a continuation token. After the end, or after an error, every pull
/// returns `None`.
pub struct QueryStream<T> {
    handle: Arc<ConnectionHandle>,
    definition: QueryDefinition,
    partition_key: Option<String>,
    page_size: u32,
    cancel: CancellationToken,
    buffer: VecDeque<Value>,
    continuation: Option<String>,
    state: PagingState,
    pages_fetched: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for QueryStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream")
            .field("query", &self.definition.text())
            .field("page_size", &self.page_size)
            .field("buffered", &self.buffer.len())
            .field("state", &self.state)
            .field("pages_fetched", &self.pages_fetched)
            .finish()
    }
}

impl<T: DeserializeOwned> QueryStream<T> {
    pub async fn next(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(value) = self.buffer.pop_front() {
                return self.decode(value).map(Some);
            }
            if self.state == PagingState::Exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    /// The remaining items of the current page, or the next page from the
    /// store. Pages may be empty; `None` marks the end.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>> {
        if self.buffer.is_empty() {
            if self.state == PagingState::Exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
        let values: Vec<Value> = self.buffer.drain(..).collect();
        let mut items = Vec::with_capacity(values.len());
        for value in values {
            items.push(self.decode(value)?);
        }
        Ok(Some(items))
    }

    pub async fn first_or_default(mut self) -> Result<Option<T>> {
        self.next().await
    }

    pub async fn to_list(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == PagingState::Exhausted && self.buffer.is_empty()
    }

    fn decode(&mut self, value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|err| {
            self.finish();
            Error::query(
                self.definition.text(),
                format!("failed to decode query result: {err}"),
            )
        })
    }

    fn finish(&mut self) {
        self.state = PagingState::Exhausted;
        self.buffer.clear();
        self.continuation = None;
    }

    async fn fetch_page(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.finish();
            return Err(Error::Cancelled);
        }
        let continuation = match self.state {
            PagingState::NotStarted => None,
            PagingState::HasMore => self.continuation.take(),
            PagingState::Exhausted => return Ok(()),
        };

        let session_token = self.handle.session_token();
        let request = QueryRequest {
            definition: &self.definition,
            partition_key: self.partition_key.as_deref(),
            max_item_count: self.page_size,
            continuation: continuation.as_deref(),
            session_token: session_token.as_deref(),
        };
        let start = Instant::now();
        let outcome = cancellable(
            &self.cancel,
            self.handle
                .client()
                .query_page(self.handle.container(), request),
        )
        .await;

        let page = match outcome {
            Ok(Ok(page)) => page,
            Ok(Err(err)) => {
                self.finish();
                return Err(classify_query_error(self.definition.text(), err));
            }
            Err(err) => {
                self.finish();
                return Err(err);
            }
        };

        let elapsed = start.elapsed();
        self.pages_fetched += 1;
        metrics::record_query_page(page.items.len() as u64, elapsed);
        if elapsed > SLOW_PAGE {
            warn!(target: "rillflow_identity::slow_query", elapsed_ms = elapsed.as_millis() as u64, query = %self.definition.text(), "slow query page");
        }
        debug!(
            items = page.items.len(),
            page = self.pages_fetched,
            more = page.continuation.is_some(),
            "fetched query page"
        );

        self.buffer.extend(page.items);
        match page.continuation {
            Some(token) if !token.is_empty() => {
                self.continuation = Some(token);
                self.state = PagingState::HasMore;
            }
            _ => self.state = PagingState::Exhausted,
        }
        Ok(())
    }
}

fn classify_query_error(query: &str, err: ClientError) -> Error {
    match err.status {
        StatusCode::BadRequest | StatusCode::NotFound => Error::query(query, err.message),
        _ => err.into(),
    }
}
