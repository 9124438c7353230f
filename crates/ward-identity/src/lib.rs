//! Identity resolution and principal authentication contracts.
//!
//! Recipient identifiers arrive as loosely spelled user names, emails or
//! department names. [`IdentityResolver`] maps them onto durable identity
//! records through ordered fallback tiers; [`principal_may_act_for`] decides
//! whether an authenticated caller may answer on behalf of such an identifier.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use ward_core::{identifiers_match, normalize_identifier};

/// Durable identity record backing a recipient or sender name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub is_floor_account: bool,
    #[serde(default)]
    pub is_department_account: bool,
}

/// Already-authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub is_floor_account: bool,
    #[serde(default)]
    pub is_department_account: bool,
}

impl From<&Identity> for Principal {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.name.clone(),
            organization_id: identity.organization_id.clone(),
            department: identity.department.clone(),
            is_floor_account: identity.is_floor_account,
            is_department_account: identity.is_department_account,
        }
    }
}

/// Maps a name, email or department name to an identity record.
///
/// Unresolvable identifiers yield `Ok(None)`; errors are reserved for backend
/// failures.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_identity(&self, identifier: &str) -> Result<Option<Identity>>;
}

/// Maps an opaque bearer credential to a principal.
#[async_trait]
pub trait PrincipalAuthenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Option<Principal>>;
}

/// In-memory identity directory seeded at startup.
#[derive(Debug, Clone, Default)]
pub struct DirectoryIdentityResolver {
    identities: Vec<Identity>,
}

impl DirectoryIdentityResolver {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self { identities }
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    /// Runs the fallback tiers synchronously.
    pub fn resolve(&self, identifier: &str) -> Option<&Identity> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return None;
        }

        if let Some(identity) = self
            .identities
            .iter()
            .find(|identity| identity.name == identifier)
        {
            return Some(identity);
        }

        if let Some(identity) = self.identities.iter().find(|identity| {
            identity
                .email
                .as_deref()
                .is_some_and(|email| email.eq_ignore_ascii_case(identifier))
        }) {
            return Some(identity);
        }

        let key = normalize_identifier(identifier);
        if key.is_empty() {
            return None;
        }
        let department_members = self
            .identities
            .iter()
            .filter(|identity| {
                identity
                    .department
                    .as_deref()
                    .is_some_and(|department| normalize_identifier(department) == key)
            })
            .collect::<Vec<_>>();

        department_members
            .iter()
            .find(|identity| identity.is_floor_account)
            .or_else(|| {
                department_members
                    .iter()
                    .find(|identity| !identity.is_floor_account)
            })
            .or_else(|| department_members.first())
            .copied()
    }
}

#[async_trait]
impl IdentityResolver for DirectoryIdentityResolver {
    async fn resolve_identity(&self, identifier: &str) -> Result<Option<Identity>> {
        Ok(self.resolve(identifier).cloned())
    }
}

/// Returns true when `principal` may respond on behalf of `identifier`.
///
/// Allowed when the names match after normalization, when the identifier
/// resolves to the principal's own identity, or when the principal is a
/// department account for the identifier's department in the same
/// organization.
pub async fn principal_may_act_for(
    resolver: &dyn IdentityResolver,
    principal: &Principal,
    identifier: &str,
) -> Result<bool> {
    if identifiers_match(&principal.name, identifier) {
        return Ok(true);
    }

    let identity = resolver.resolve_identity(identifier).await?;
    if identity
        .as_ref()
        .is_some_and(|identity| identity.id == principal.id)
    {
        return Ok(true);
    }

    if !principal.is_department_account {
        return Ok(false);
    }
    let Some(department) = principal.department.as_deref() else {
        return Ok(false);
    };

    let allowed = match identity {
        Some(identity) => {
            identity.organization_id == principal.organization_id
                && (identity
                    .department
                    .as_deref()
                    .is_some_and(|owned| identifiers_match(owned, department))
                    || identifiers_match(identifier, department))
        }
        None => identifiers_match(identifier, department),
    };
    if !allowed {
        tracing::debug!(
            principal = %principal.name,
            identifier,
            "department account is not entitled to respond for identifier"
        );
    }
    Ok(allowed)
}

/// Bearer-token authenticator backed by a static token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    principals_by_token: HashMap<String, Principal>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_principal(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.insert(token, principal);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, principal: Principal) {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return;
        }
        self.principals_by_token.insert(token, principal);
    }

    pub fn len(&self) -> usize {
        self.principals_by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.principals_by_token.is_empty()
    }
}

#[async_trait]
impl PrincipalAuthenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Option<Principal>> {
        Ok(self.principals_by_token.get(credential.trim()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        principal_may_act_for, DirectoryIdentityResolver, Identity, IdentityResolver, Principal,
        PrincipalAuthenticator, StaticTokenAuthenticator,
    };

    fn identity(id: &str, name: &str, department: Option<&str>) -> Identity {
        Identity {
            id: id.to_string(),
            name: name.to_string(),
            email: Some(format!("{id}@ward.test")),
            organization_id: Some("org-1".to_string()),
            department: department.map(str::to_string),
            is_floor_account: false,
            is_department_account: false,
        }
    }

    fn sample_directory() -> DirectoryIdentityResolver {
        let nurse = identity("u-nurse", "Ana Souza", Some("Cardiologia"));
        let mut desk = identity("u-desk", "Cardio Desk", Some("Cardiologia"));
        desk.is_department_account = true;
        let mut floor = identity("u-floor", "Cardio Floor", Some("Cardiologia"));
        floor.is_floor_account = true;
        floor.is_department_account = true;
        let mut other_org = identity("u-other", "ICU", Some("UTI"));
        other_org.organization_id = Some("org-2".to_string());
        DirectoryIdentityResolver::new(vec![nurse, desk, floor, other_org])
    }

    #[tokio::test]
    async fn unit_exact_name_wins_over_department_match() {
        let directory = sample_directory();
        let resolved = directory
            .resolve_identity("Cardio Desk")
            .await
            .expect("resolve")
            .expect("identity");
        assert_eq!(resolved.id, "u-desk");
    }

    #[test]
    fn unit_email_match_ignores_ascii_case() {
        let directory = sample_directory();
        let resolved = directory.resolve("U-NURSE@Ward.Test").expect("identity");
        assert_eq!(resolved.id, "u-nurse");
    }

    #[test]
    fn functional_department_match_prefers_floor_account() {
        let directory = sample_directory();
        let resolved = directory.resolve("  cardiología ").expect("identity");
        assert_eq!(resolved.id, "u-floor");
    }

    #[test]
    fn functional_department_match_without_floor_account_takes_first_member() {
        let member = identity("u-member", "Member", Some("Radiologia"));
        let mut desk = identity("u-desk", "Desk", Some("Radiologia"));
        desk.is_department_account = true;
        let directory = DirectoryIdentityResolver::new(vec![member, desk]);
        assert_eq!(
            directory.resolve("RADIOLOGIA").expect("identity").id,
            "u-member"
        );
    }

    #[test]
    fn unit_unknown_or_blank_identifiers_resolve_to_none() {
        let directory = sample_directory();
        assert!(directory.resolve("Pharmacy").is_none());
        assert!(directory.resolve("   ").is_none());
    }

    #[tokio::test]
    async fn functional_principal_may_act_for_own_name_and_identity() {
        let directory = sample_directory();
        let nurse = Principal::from(directory.resolve("Ana Souza").expect("identity"));

        assert!(principal_may_act_for(&directory, &nurse, "ana souza")
            .await
            .expect("authorize"));
        assert!(principal_may_act_for(&directory, &nurse, "u-nurse@ward.test")
            .await
            .expect("authorize"));
        assert!(!principal_may_act_for(&directory, &nurse, "Cardio Desk")
            .await
            .expect("authorize"));
    }

    #[tokio::test]
    async fn functional_department_account_acts_within_its_department_and_org() {
        let directory = sample_directory();
        let desk = Principal::from(directory.resolve("Cardio Desk").expect("identity"));

        assert!(principal_may_act_for(&directory, &desk, "Ana Souza")
            .await
            .expect("authorize"));
        assert!(principal_may_act_for(&directory, &desk, "Cardiologia")
            .await
            .expect("authorize"));
        assert!(!principal_may_act_for(&directory, &desk, "ICU")
            .await
            .expect("authorize"));
    }

    #[tokio::test]
    async fn functional_static_token_authenticator_maps_trimmed_tokens() {
        let directory = sample_directory();
        let principal = Principal::from(directory.resolve("Ana Souza").expect("identity"));
        let authenticator =
            StaticTokenAuthenticator::new().with_principal(" token-ana ", principal.clone());

        assert_eq!(authenticator.len(), 1);
        assert_eq!(
            authenticator
                .authenticate("token-ana")
                .await
                .expect("authenticate"),
            Some(principal)
        );
        assert!(authenticator
            .authenticate("token-bob")
            .await
            .expect("authenticate")
            .is_none());
    }

    #[test]
    fn unit_identity_deserializes_with_optional_fields_defaulted() {
        let identity: Identity =
            serde_json::from_str(r#"{"id":"u-1","name":"Pharmacy"}"#).expect("parse identity");
        assert!(identity.email.is_none());
        assert!(!identity.is_floor_account);
    }
}
