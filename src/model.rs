//! Identity aggregates and their embedded sub-entities.
//!
//! An aggregate is one self-contained document. Claims, logins, role
//! memberships and tokens are embedded arrays without identity of their own;
//! they are changed in memory and written back with the whole aggregate.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::partition;

/// Primary key types a store can be addressed with.
pub trait DocumentKey: Clone + fmt::Debug + Send + Sync + 'static {
    fn to_document_id(&self) -> String;
}

impl DocumentKey for String {
    fn to_document_id(&self) -> String {
        self.clone()
    }
}

impl DocumentKey for Uuid {
    fn to_document_id(&self) -> String {
        self.to_string()
    }
}

/// Identity and concurrency metadata shared by every aggregate document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    pub id: String,
    #[serde(default)]
    partition_key: String,
    #[serde(default)]
    concurrency_stamp: String,
    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(rename = "_ts", default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

impl DocumentMeta {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            partition_key: partition::derive(&id),
            id,
            concurrency_stamp: Uuid::new_v4().to_string(),
            etag: None,
            timestamp: None,
        }
    }

    pub fn generated() -> Self {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn concurrency_stamp(&self) -> &str {
        &self.concurrency_stamp
    }

    /// Entity tag assigned by the store on the last write, if any.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Store-assigned modification time in epoch seconds.
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub(crate) fn assign_partition_key(&mut self) {
        self.partition_key = partition::derive(&self.id);
    }

    pub(crate) fn ensure_concurrency_stamp(&mut self) {
        if self.concurrency_stamp.is_empty() {
            self.regenerate_concurrency_stamp();
        }
    }

    pub(crate) fn regenerate_concurrency_stamp(&mut self) {
        self.concurrency_stamp = Uuid::new_v4().to_string();
    }

    /// Point the metadata at a new identifier, dropping everything the store
    /// assigned to the old one.
    pub(crate) fn rekey(&mut self, id: String) {
        self.id = id;
        self.assign_partition_key();
        self.regenerate_concurrency_stamp();
        self.etag = None;
        self.timestamp = None;
    }
}

/// A top-level document stored and versioned as a unit.
pub trait Aggregate: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    type Key: DocumentKey;

    /// Short label used in logs.
    const KIND: &'static str;

    fn meta(&self) -> &DocumentMeta;
    fn meta_mut(&mut self) -> &mut DocumentMeta;

    fn id(&self) -> &str {
        &self.meta().id
    }
}

pub trait SubEntity:
    Serialize + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
}

impl<T> SubEntity for T where
    T: Serialize + DeserializeOwned + Clone + fmt::Debug + PartialEq + Send + Sync + 'static
{
}

pub trait ClaimEntry: SubEntity {
    fn new(claim_type: &str, claim_value: &str) -> Self;
    fn claim_type(&self) -> &str;
    fn claim_value(&self) -> &str;

    fn matches(&self, claim_type: &str, claim_value: &str) -> bool {
        self.claim_type() == claim_type && self.claim_value() == claim_value
    }
}

pub trait LoginEntry: SubEntity {
    fn new(login_provider: &str, provider_key: &str, display_name: Option<&str>) -> Self;
    fn login_provider(&self) -> &str;
    fn provider_key(&self) -> &str;
}

pub trait TokenEntry: SubEntity {
    fn new(login_provider: &str, name: &str, value: &str) -> Self;
    fn login_provider(&self) -> &str;
    fn name(&self) -> &str;
    fn value(&self) -> &str;
    fn set_value(&mut self, value: &str);
}

pub trait RoleEntry: SubEntity {
    fn new(role_id: &str, role_name: Option<&str>) -> Self;
    fn role_id(&self) -> &str;
}

/// Selects the key and sub-entity types of the identity aggregates.
pub trait IdentityShape: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    type Key: DocumentKey;
    type Claim: ClaimEntry;
    type Login: LoginEntry;
    type Token: TokenEntry;
    type Role: RoleEntry;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StandardShape;

impl IdentityShape for StandardShape {
    type Key = String;
    type Claim = Claim;
    type Login = UserLogin;
    type Token = UserToken;
    type Role = RoleMembership;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub claim_type: String,
    pub claim_value: String,
}

impl ClaimEntry for Claim {
    fn new(claim_type: &str, claim_value: &str) -> Self {
        Self {
            claim_type: claim_type.to_string(),
            claim_value: claim_value.to_string(),
        }
    }

    fn claim_type(&self) -> &str {
        &self.claim_type
    }

    fn claim_value(&self) -> &str {
        &self.claim_value
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLogin {
    pub login_provider: String,
    pub provider_key: String,
    #[serde(default)]
    pub provider_display_name: Option<String>,
}

impl LoginEntry for UserLogin {
    fn new(login_provider: &str, provider_key: &str, display_name: Option<&str>) -> Self {
        Self {
            login_provider: login_provider.to_string(),
            provider_key: provider_key.to_string(),
            provider_display_name: display_name.map(str::to_owned),
        }
    }

    fn login_provider(&self) -> &str {
        &self.login_provider
    }

    fn provider_key(&self) -> &str {
        &self.provider_key
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserToken {
    pub login_provider: String,
    pub name: String,
    pub value: String,
}

impl TokenEntry for UserToken {
    fn new(login_provider: &str, name: &str, value: &str) -> Self {
        Self {
            login_provider: login_provider.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn login_provider(&self) -> &str {
        &self.login_provider
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> &str {
        &self.value
    }

    fn set_value(&mut self, value: &str) {
        self.value = value.to_string();
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleMembership {
    pub role_id: String,
    #[serde(default)]
    pub role_name: Option<String>,
}

impl RoleEntry for RoleMembership {
    fn new(role_id: &str, role_name: Option<&str>) -> Self {
        Self {
            role_id: role_id.to_string(),
            role_name: role_name.map(str::to_owned),
        }
    }

    fn role_id(&self) -> &str {
        &self.role_id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct IdentityUser<S: IdentityShape = StandardShape> {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub normalized_user_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub normalized_email: Option<String>,
    #[serde(default)]
    pub email_confirmed: bool,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub security_stamp: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub phone_number_confirmed: bool,
    #[serde(default)]
    pub two_factor_enabled: bool,
    #[serde(default)]
    pub lockout_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lockout_enabled: bool,
    #[serde(default)]
    pub access_failed_count: i32,
    #[serde(default)]
    pub claims: Vec<S::Claim>,
    #[serde(default)]
    pub logins: Vec<S::Login>,
    #[serde(default)]
    pub roles: Vec<S::Role>,
    #[serde(default)]
    pub tokens: Vec<S::Token>,
}

impl<S: IdentityShape> IdentityUser<S> {
    /// New user with a generated identifier.
    pub fn new(user_name: impl Into<String>) -> Self {
        Self::with_meta(DocumentMeta::generated(), user_name.into())
    }

    pub fn with_id(id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self::with_meta(DocumentMeta::new(id), user_name.into())
    }

    fn with_meta(meta: DocumentMeta, user_name: String) -> Self {
        Self {
            meta,
            user_name: Some(user_name),
            normalized_user_name: None,
            email: None,
            normalized_email: None,
            email_confirmed: false,
            password_hash: None,
            security_stamp: None,
            phone_number: None,
            phone_number_confirmed: false,
            two_factor_enabled: false,
            lockout_end: None,
            lockout_enabled: false,
            access_failed_count: 0,
            claims: Vec::new(),
            logins: Vec::new(),
            roles: Vec::new(),
            tokens: Vec::new(),
        }
    }

    pub fn add_claim(&mut self, claim_type: &str, claim_value: &str) {
        self.claims.push(S::Claim::new(claim_type, claim_value));
    }

    pub fn add_claims<'a, I>(&mut self, claims: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (claim_type, claim_value) in claims {
            self.add_claim(claim_type, claim_value);
        }
    }

    /// Replace every matching claim in place. Returns how many were replaced.
    pub fn replace_claim(
        &mut self,
        old: (&str, &str),
        new_type: &str,
        new_value: &str,
    ) -> usize {
        let mut replaced = 0;
        for claim in self.claims.iter_mut() {
            if claim.matches(old.0, old.1) {
                *claim = S::Claim::new(new_type, new_value);
                replaced += 1;
            }
        }
        replaced
    }

    pub fn remove_claim(&mut self, claim_type: &str, claim_value: &str) -> usize {
        let before = self.claims.len();
        self.claims.retain(|c| !c.matches(claim_type, claim_value));
        before - self.claims.len()
    }

    pub fn has_claim(&self, claim_type: &str, claim_value: &str) -> bool {
        self.claims.iter().any(|c| c.matches(claim_type, claim_value))
    }

    /// Adds the login unless the provider/key pair is already linked.
    pub fn add_login(
        &mut self,
        login_provider: &str,
        provider_key: &str,
        display_name: Option<&str>,
    ) -> bool {
        if self.find_login(login_provider, provider_key).is_some() {
            return false;
        }
        self.logins
            .push(S::Login::new(login_provider, provider_key, display_name));
        true
    }

    pub fn remove_login(&mut self, login_provider: &str, provider_key: &str) -> bool {
        let before = self.logins.len();
        self.logins.retain(|l| {
            !(l.login_provider() == login_provider && l.provider_key() == provider_key)
        });
        before != self.logins.len()
    }

    pub fn find_login(&self, login_provider: &str, provider_key: &str) -> Option<&S::Login> {
        self.logins
            .iter()
            .find(|l| l.login_provider() == login_provider && l.provider_key() == provider_key)
    }

    pub fn add_to_role(&mut self, role_id: &str, role_name: Option<&str>) -> bool {
        if self.is_in_role(role_id) {
            return false;
        }
        self.roles.push(S::Role::new(role_id, role_name));
        true
    }

    pub fn remove_from_role(&mut self, role_id: &str) -> bool {
        let before = self.roles.len();
        self.roles.retain(|r| r.role_id() != role_id);
        before != self.roles.len()
    }

    pub fn is_in_role(&self, role_id: &str) -> bool {
        self.roles.iter().any(|r| r.role_id() == role_id)
    }

    pub fn set_token(&mut self, login_provider: &str, name: &str, value: &str) {
        match self
            .tokens
            .iter_mut()
            .find(|t| t.login_provider() == login_provider && t.name() == name)
        {
            Some(token) => token.set_value(value),
            None => self.tokens.push(S::Token::new(login_provider, name, value)),
        }
    }

    pub fn get_token(&self, login_provider: &str, name: &str) -> Option<&str> {
        self.tokens
            .iter()
            .find(|t| t.login_provider() == login_provider && t.name() == name)
            .map(|t| t.value())
    }

    pub fn remove_token(&mut self, login_provider: &str, name: &str) -> bool {
        let before = self.tokens.len();
        self.tokens
            .retain(|t| !(t.login_provider() == login_provider && t.name() == name));
        before != self.tokens.len()
    }
}

impl<S: IdentityShape> Aggregate for IdentityUser<S> {
    type Key = S::Key;
    const KIND: &'static str = "user";

    fn meta(&self) -> &DocumentMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut DocumentMeta {
        &mut self.meta
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct IdentityRole<S: IdentityShape = StandardShape> {
    #[serde(flatten)]
    pub meta: DocumentMeta,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub normalized_name: Option<String>,
    #[serde(default)]
    pub claims: Vec<S::Claim>,
}

impl<S: IdentityShape> IdentityRole<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: DocumentMeta::generated(),
            name: Some(name.into()),
            normalized_name: None,
            claims: Vec::new(),
        }
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            meta: DocumentMeta::new(id),
            ..Self::new(name)
        }
    }

    pub fn add_claim(&mut self, claim_type: &str, claim_value: &str) {
        self.claims.push(S::Claim::new(claim_type, claim_value));
    }

    pub fn remove_claim(&mut self, claim_type: &str, claim_value: &str) -> usize {
        let before = self.claims.len();
        self.claims.retain(|c| !c.matches(claim_type, claim_value));
        before - self.claims.len()
    }
}

impl<S: IdentityShape> Aggregate for IdentityRole<S> {
    type Key = S::Key;
    const KIND: &'static str = "role";

    fn meta(&self) -> &DocumentMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut DocumentMeta {
        &mut self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type User = IdentityUser;

    #[test]
    fn new_documents_carry_partition_and_stamp() {
        let user = User::with_id("user-0001", "alice");
        assert_eq!(user.meta.partition_key(), "0001");
        assert!(!user.meta.concurrency_stamp().is_empty());
        assert!(user.meta.etag().is_none());

        let generated = User::new("bob");
        assert_eq!(generated.meta.partition_key().chars().count(), 4);
    }

    #[test]
    fn claims_are_added_replaced_and_removed() {
        let mut user = User::with_id("user-0001", "alice");
        user.add_claims([("email", "a@x.io"), ("dept", "ops")]);
        user.add_claim("dept", "ops");
        assert!(user.has_claim("dept", "ops"));

        assert_eq!(user.replace_claim(("dept", "ops"), "dept", "eng"), 2);
        assert!(user.has_claim("dept", "eng"));
        assert_eq!(user.remove_claim("dept", "eng"), 2);
        assert_eq!(user.claims.len(), 1);
    }

    #[test]
    fn logins_roles_and_tokens_are_deduplicated() {
        let mut user = User::with_id("user-0001", "alice");
        assert!(user.add_login("github", "gh-1", Some("GitHub")));
        assert!(!user.add_login("github", "gh-1", None));
        assert!(user.find_login("github", "gh-1").is_some());
        assert!(user.remove_login("github", "gh-1"));
        assert!(!user.remove_login("github", "gh-1"));

        assert!(user.add_to_role("role-admin", Some("Admin")));
        assert!(!user.add_to_role("role-admin", None));
        assert!(user.is_in_role("role-admin"));
        assert!(user.remove_from_role("role-admin"));
        assert!(!user.is_in_role("role-admin"));

        user.set_token("[AspNetUserStore]", "AuthenticatorKey", "k1");
        user.set_token("[AspNetUserStore]", "AuthenticatorKey", "k2");
        assert_eq!(user.tokens.len(), 1);
        assert_eq!(
            user.get_token("[AspNetUserStore]", "AuthenticatorKey"),
            Some("k2")
        );
        assert!(user.remove_token("[AspNetUserStore]", "AuthenticatorKey"));
        assert!(user.get_token("[AspNetUserStore]", "AuthenticatorKey").is_none());
    }

    #[test]
    fn wire_format_uses_flat_camel_case_fields() {
        let mut user = User::with_id("user-0001", "alice");
        user.normalized_user_name = Some("ALICE".into());
        user.add_claim("email", "a@x.io");
        user.add_login("github", "gh-1", None);
        user.add_to_role("role-admin", Some("Admin"));
        user.set_token("github", "access_token", "t");

        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["id"], "user-0001");
        assert_eq!(value["partitionKey"], "0001");
        assert_eq!(value["normalizedUserName"], "ALICE");
        assert_eq!(value["claims"][0]["claimType"], "email");
        assert_eq!(value["logins"][0]["loginProvider"], "github");
        assert_eq!(value["roles"][0]["roleId"], "role-admin");
        assert_eq!(value["tokens"][0]["name"], "access_token");
        assert!(value.get("_etag").is_none());
    }

    #[test]
    fn tolerates_missing_collections_and_reads_system_fields() {
        let user: User = serde_json::from_value(json!({
            "id": "user-0002",
            "partitionKey": "0002",
            "concurrencyStamp": "s1",
            "_etag": "\"e1\"",
            "_ts": 1700000000,
            "userName": "carol"
        }))
        .unwrap();
        assert!(user.claims.is_empty());
        assert_eq!(user.meta.etag(), Some("\"e1\""));
        assert_eq!(user.meta.timestamp(), Some(1_700_000_000));
        assert_eq!(user.user_name.as_deref(), Some("carol"));
    }

    #[test]
    fn rekey_drops_store_assigned_metadata() {
        let mut meta: DocumentMeta = serde_json::from_value(json!({
            "id": "user-0001",
            "partitionKey": "0001",
            "concurrencyStamp": "s1",
            "_etag": "\"e1\"",
            "_ts": 1
        }))
        .unwrap();
        meta.rekey("user-0042".into());
        assert_eq!(meta.partition_key(), "0042");
        assert_ne!(meta.concurrency_stamp(), "s1");
        assert!(meta.etag().is_none());
        assert!(meta.timestamp().is_none());
    }

    #[test]
    fn roles_carry_claims() {
        let mut role: IdentityRole = IdentityRole::with_id("role-admin", "Admin");
        role.add_claim("permission", "users.write");
        assert_eq!(role.meta.partition_key(), "dmin");
        assert_eq!(role.remove_claim("permission", "users.write"), 1);
        let value = serde_json::to_value(&role).unwrap();
        assert_eq!(value["name"], "Admin");
        assert!(value["claims"].as_array().unwrap().is_empty());
    }
}
