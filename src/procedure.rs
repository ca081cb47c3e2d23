//! Server-side lookup of an aggregate by primary id.
//!
//! The hot "find by id" path runs inside the store engine, scoped to the
//! partition derived from the id. The procedure is deployed once per
//! container when a connection is established.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    Error, Result,
    client::{ContainerRef, DocumentClient, RequestOptions, StatusCode},
    connection::ConnectionHandle,
    model::Aggregate,
    partition,
    store::cancellable,
};

pub const LOOKUP_PROCEDURE_ID: &str = "lookupById";

/// Procedure body in the query dialect; `p_args` is the JSON array of
/// arguments and `c` is already restricted to the target partition.
const LOOKUP_PROCEDURE_BODY: &str = "select c.doc from c where c.id = (p_args ->> 0) limit 1";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcedureDefinition {
    pub id: String,
    pub body: String,
}

pub struct TargetedLookupProcedure<'a> {
    handle: &'a ConnectionHandle,
}

impl<'a> TargetedLookupProcedure<'a> {
    pub fn new(handle: &'a ConnectionHandle) -> Self {
        Self { handle }
    }

    pub fn definition() -> ProcedureDefinition {
        ProcedureDefinition {
            id: LOOKUP_PROCEDURE_ID.to_string(),
            body: LOOKUP_PROCEDURE_BODY.to_string(),
        }
    }

    /// Delete-if-exists, then create. Safe to repeat.
    #[instrument(skip(client, container), fields(container = %container.id))]
    pub async fn install(client: &dyn DocumentClient, container: &ContainerRef) -> Result<()> {
        let definition = Self::definition();
        match client.delete_procedure(container, &definition.id).await {
            Ok(()) => debug!(procedure = %definition.id, "replaced existing procedure"),
            Err(err) if err.status == StatusCode::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        client.create_procedure(container, &definition).await?;
        Ok(())
    }

    /// Run the lookup inside the partition of `id`. `None` when nothing matches.
    pub async fn invoke<T: Aggregate>(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<T>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let partition_key = partition::derive(id);
        let options = RequestOptions::session(self.handle.session_token());
        let response = cancellable(
            cancel,
            self.handle.client().execute_procedure(
                self.handle.container(),
                LOOKUP_PROCEDURE_ID,
                &partition_key,
                vec![Value::String(id.to_string())],
                &options,
            ),
        )
        .await??;

        if response.value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(response.value)?))
    }
}
