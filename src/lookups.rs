//! Predicate lookups over identity aggregates.
//!
//! Every lookup is a cross-partition containment query (`c.body @> @p0`) on
//! the raw document, which the container's `jsonb_path_ops` GIN index serves.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::{
    Error, Result,
    model::{IdentityRole, IdentityShape, IdentityUser},
    query::{QueryBuilder, QueryDefinition, QueryOptions},
    store::DocumentStore,
};

/// One embedded role membership together with the user that holds it.
///
/// Projections are read-only: to change a membership, load the owning user by
/// id and update it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleMembershipView<R> {
    pub user_id: String,
    #[serde(flatten)]
    pub membership: R,
}

fn contains(fragment: Value) -> QueryDefinition {
    let mut qb = QueryBuilder::new("select c.doc from c where c.body @> ");
    qb.push_bind(fragment);
    qb.build()
}

fn field_equals(field: &str, value: &str) -> QueryDefinition {
    let mut fragment = Map::new();
    fragment.insert(field.to_string(), Value::String(value.to_string()));
    contains(Value::Object(fragment))
}

fn contains_element(collection: &str, element: Value) -> QueryDefinition {
    let mut fragment = Map::new();
    fragment.insert(collection.to_string(), Value::Array(vec![element]));
    contains(Value::Object(fragment))
}

pub fn user_by_normalized_name(normalized_user_name: &str) -> QueryDefinition {
    field_equals("normalizedUserName", normalized_user_name)
}

pub fn user_by_normalized_email(normalized_email: &str) -> QueryDefinition {
    field_equals("normalizedEmail", normalized_email)
}

pub fn user_by_login(login_provider: &str, provider_key: &str) -> QueryDefinition {
    contains_element(
        "logins",
        json!({"loginProvider": login_provider, "providerKey": provider_key}),
    )
}

pub fn users_with_claim(claim_type: &str, claim_value: &str) -> QueryDefinition {
    contains_element(
        "claims",
        json!({"claimType": claim_type, "claimValue": claim_value}),
    )
}

pub fn users_in_role(role_id: &str) -> QueryDefinition {
    contains_element("roles", json!({"roleId": role_id}))
}

/// Join over the embedded `roles` arrays of the users holding `role_id`.
pub fn role_memberships(role_id: &str) -> QueryDefinition {
    let mut qb = QueryBuilder::new(
        "select r.elem || jsonb_build_object('userId', c.id) from c \
         cross join lateral jsonb_array_elements(c.body -> 'roles') as r(elem) \
         where c.body @> ",
    );
    qb.push_bind(json!({"roles": [{"roleId": role_id}]}))
        .push(" and r.elem ->> 'roleId' = ")
        .push_bind(role_id);
    qb.build()
}

pub fn role_by_normalized_name(normalized_name: &str) -> QueryDefinition {
    field_equals("normalizedName", normalized_name)
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidArgument(format!("{what} must not be blank")));
    }
    Ok(())
}

impl<S: IdentityShape> DocumentStore<IdentityUser<S>> {
    pub async fn find_by_normalized_user_name(
        &self,
        normalized_user_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IdentityUser<S>>> {
        let engine = self.query()?;
        require(normalized_user_name, "normalized user name")?;
        engine
            .first_or_default(user_by_normalized_name(normalized_user_name), cancel)
            .await
    }

    pub async fn find_by_normalized_email(
        &self,
        normalized_email: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IdentityUser<S>>> {
        let engine = self.query()?;
        require(normalized_email, "normalized email")?;
        engine
            .first_or_default(user_by_normalized_email(normalized_email), cancel)
            .await
    }

    pub async fn find_by_login(
        &self,
        login_provider: &str,
        provider_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IdentityUser<S>>> {
        let engine = self.query()?;
        require(login_provider, "login provider")?;
        require(provider_key, "provider key")?;
        engine
            .first_or_default(user_by_login(login_provider, provider_key), cancel)
            .await
    }

    pub async fn users_for_claim(
        &self,
        claim_type: &str,
        claim_value: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<IdentityUser<S>>> {
        let engine = self.query()?;
        require(claim_type, "claim type")?;
        engine
            .to_list(
                users_with_claim(claim_type, claim_value),
                QueryOptions::default(),
                cancel,
            )
            .await
    }

    pub async fn users_in_role(
        &self,
        role_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<IdentityUser<S>>> {
        let engine = self.query()?;
        require(role_id, "role id")?;
        engine
            .to_list(users_in_role(role_id), QueryOptions::default(), cancel)
            .await
    }

    pub async fn role_memberships(
        &self,
        role_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RoleMembershipView<S::Role>>> {
        let engine = self.query()?;
        require(role_id, "role id")?;
        engine
            .to_list(role_memberships(role_id), QueryOptions::default(), cancel)
            .await
    }
}

impl<S: IdentityShape> DocumentStore<IdentityRole<S>> {
    pub async fn find_by_normalized_name(
        &self,
        normalized_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IdentityRole<S>>> {
        let engine = self.query()?;
        require(normalized_name, "normalized role name")?;
        engine
            .first_or_default(role_by_normalized_name(normalized_name), cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::RoleMembership,
        testing::{MemoryClient, memory_handle},
    };
    use std::sync::Arc;

    #[test]
    fn values_are_bound_not_spliced() {
        let query = user_by_normalized_name("ALICE'; drop table users; --");
        assert_eq!(query.text(), "select c.doc from c where c.body @> @p0");
        assert_eq!(
            query.parameter("@p0"),
            Some(&json!({"normalizedUserName": "ALICE'; drop table users; --"}))
        );
    }

    #[test]
    fn embedded_lookups_use_containment() {
        let query = user_by_login("github", "gh-1");
        assert_eq!(query.text(), "select c.doc from c where c.body @> @p0");
        assert_eq!(
            query.parameter("@p0"),
            Some(&json!({"logins": [{"loginProvider": "github", "providerKey": "gh-1"}]}))
        );

        let query = users_in_role("role-admin");
        assert_eq!(
            query.parameter("@p0"),
            Some(&json!({"roles": [{"roleId": "role-admin"}]}))
        );

        let query = role_memberships("role-admin");
        assert!(query.text().contains("where c.body @> @p0 and r.elem ->> 'roleId' = @p1"));
    }

    #[test]
    fn membership_views_flatten_the_entry() {
        let view: RoleMembershipView<RoleMembership> = serde_json::from_value(json!({
            "userId": "user-0001",
            "roleId": "role-admin",
            "roleName": "Admin"
        }))
        .unwrap();
        assert_eq!(view.user_id, "user-0001");
        assert_eq!(view.membership.role_id, "role-admin");
        assert!(role_memberships("role-admin").text().contains("jsonb_array_elements"));
    }

    #[tokio::test]
    async fn blank_arguments_fail_before_io() {
        let client = Arc::new(MemoryClient::new());
        let handle = memory_handle(client.clone(), "users").await.unwrap();
        let users: DocumentStore<IdentityUser> = DocumentStore::new(handle);
        let cancel = CancellationToken::new();

        let err = users
            .find_by_normalized_user_name(" ", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = users.find_by_login("github", "", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(client.page_requests(), 0);

        users.dispose();
        let err = users.users_in_role("role-admin", &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Disposed));
    }
}
