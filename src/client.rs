//! Transport capability consumed by the stores.
//!
//! A [`DocumentClient`] speaks to one document database account: it can make
//! sure databases and containers exist, perform partition-scoped item CRUD,
//! run paged queries and manage server-side procedures. Faults are reported as
//! [`ClientError`] carrying an HTTP-like [`StatusCode`]; the store layer turns
//! those into its own error taxonomy.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::{procedure::ProcedureDefinition, query::QueryDefinition};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    BadRequest,
    Unauthorized,
    NotFound,
    Conflict,
    PreconditionFailed,
    TooManyRequests,
    Internal,
    ServiceUnavailable,
    Other(u16),
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::NotFound => 404,
            StatusCode::Conflict => 409,
            StatusCode::PreconditionFailed => 412,
            StatusCode::TooManyRequests => 429,
            StatusCode::Internal => 500,
            StatusCode::ServiceUnavailable => 503,
            StatusCode::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            400 => StatusCode::BadRequest,
            401 => StatusCode::Unauthorized,
            404 => StatusCode::NotFound,
            409 => StatusCode::Conflict,
            412 => StatusCode::PreconditionFailed,
            429 => StatusCode::TooManyRequests,
            500 => StatusCode::Internal,
            503 => StatusCode::ServiceUnavailable,
            other => StatusCode::Other(other),
        }
    }

    pub fn is_transient(self) -> bool {
        matches!(
            self,
            StatusCode::TooManyRequests | StatusCode::ServiceUnavailable
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{status}: {message}")]
pub struct ClientError {
    pub status: StatusCode,
    pub message: String,
}

impl ClientError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BadRequest, message)
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatabaseRef {
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    pub database: String,
    pub id: String,
    pub partition_key_path: String,
}

#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Entity tag the stored document must still carry.
    pub if_match: Option<String>,
    /// Session token reads must be at least as fresh as.
    pub session_token: Option<String>,
}

impl RequestOptions {
    pub fn if_match(etag: Option<&str>) -> Self {
        Self {
            if_match: etag.map(str::to_owned),
            session_token: None,
        }
    }

    pub fn session(token: Option<String>) -> Self {
        Self {
            if_match: None,
            session_token: token,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ItemResponse {
    /// Stored document including the `_etag` and `_ts` system properties.
    pub document: Value,
    pub etag: Option<String>,
    pub session_token: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct DeleteResponse {
    pub session_token: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct QueryRequest<'a> {
    pub definition: &'a QueryDefinition,
    pub partition_key: Option<&'a str>,
    pub max_item_count: u32,
    pub continuation: Option<&'a str>,
    pub session_token: Option<&'a str>,
}

#[derive(Clone, Debug, Default)]
pub struct QueryPage {
    pub items: Vec<Value>,
    /// `None` once there is nothing left to fetch.
    pub continuation: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ProcedureResponse {
    pub value: Value,
    pub session_token: Option<String>,
}

#[async_trait]
pub trait DocumentClient: Send + Sync + 'static {
    /// Create the database if missing. Must be idempotent.
    async fn ensure_database(&self, database: &str) -> ClientResult<DatabaseRef>;

    /// Create the container if missing. Must be idempotent.
    async fn ensure_container(
        &self,
        database: &DatabaseRef,
        container: &str,
        partition_key_path: &str,
    ) -> ClientResult<ContainerRef>;

    /// Insert a new document; `Conflict` when the id is taken.
    async fn create_item(
        &self,
        container: &ContainerRef,
        partition_key: &str,
        document: Value,
        options: &RequestOptions,
    ) -> ClientResult<ItemResponse>;

    /// Replace an existing document; `PreconditionFailed` when `if_match` is stale,
    /// `NotFound` when the document is gone.
    async fn replace_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        document: Value,
        options: &RequestOptions,
    ) -> ClientResult<ItemResponse>;

    async fn read_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        options: &RequestOptions,
    ) -> ClientResult<ItemResponse>;

    async fn delete_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        options: &RequestOptions,
    ) -> ClientResult<DeleteResponse>;

    /// Fetch a single page of results.
    async fn query_page(
        &self,
        container: &ContainerRef,
        request: QueryRequest<'_>,
    ) -> ClientResult<QueryPage>;

    /// `NotFound` when no procedure with that id exists.
    async fn delete_procedure(&self, container: &ContainerRef, id: &str) -> ClientResult<()>;

    async fn create_procedure(
        &self,
        container: &ContainerRef,
        definition: &ProcedureDefinition,
    ) -> ClientResult<()>;

    async fn execute_procedure(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        args: Vec<Value>,
        options: &RequestOptions,
    ) -> ClientResult<ProcedureResponse>;

    /// Release transport resources. Only called at registry shutdown.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip_through_numbers() {
        for code in [400u16, 401, 404, 409, 412, 429, 500, 503, 418] {
            assert_eq!(StatusCode::from_u16(code).as_u16(), code);
        }
        assert_eq!(StatusCode::from_u16(418), StatusCode::Other(418));
        assert_eq!(StatusCode::PreconditionFailed.to_string(), "412");
    }

    #[test]
    fn only_throttling_and_unavailability_are_transient() {
        assert!(StatusCode::TooManyRequests.is_transient());
        assert!(StatusCode::ServiceUnavailable.is_transient());
        assert!(!StatusCode::PreconditionFailed.is_transient());
        assert!(!StatusCode::Internal.is_transient());
    }
}
