//! Rillflow Identity: partitioned document storage for identity aggregates.
//!
//! Users and roles are stored as self-contained JSON documents, partitioned by
//! the tail of their identifier, with optimistic concurrency on entity tags and
//! one shared connection per configuration.

pub mod client;
pub mod config;
pub mod connection;
mod error;
pub mod lookups;
pub mod metrics;
pub mod model;
pub mod partition;
pub mod postgres;
pub mod procedure;
pub mod query;
pub mod store;
pub mod testing;

pub use client::{ClientError, DocumentClient, StatusCode};
pub use config::{ConnectionMode, ConsistencyLevel, Fingerprint, StoreOptions};
pub use connection::{ConnectionHandle, ConnectionRegistry};
pub use error::{Error, Result, WithContext};
pub use model::{Aggregate, IdentityRole, IdentityUser, StandardShape};
pub use postgres::PgDocumentClient;
pub use query::{QueryBuilder, QueryDefinition, QueryEngine, QueryOptions, QueryStream};
pub use store::DocumentStore;

pub use tokio_util::sync::CancellationToken;

pub mod prelude {
    pub use crate::{
        Aggregate, CancellationToken, ConnectionRegistry, DocumentStore, Error, IdentityRole,
        IdentityUser, QueryDefinition, QueryOptions, Result, StoreOptions,
    };
}
