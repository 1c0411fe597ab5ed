// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Credential management for bindings.
//!
//! [`merge_bindings`] is the policy merge used whenever a role is granted:
//! bindings are grouped by role, members are unioned, and roles left without
//! members are dropped. [`ServiceAccountManager`] builds on it to mint one
//! service identity per binding through an abstract [`IamClient`].
//! [`SqlAccountManager`] mints a database user plus a client certificate.

mod sql;

pub use sql::{
    SqlAccountInfo, SqlAccountManager, SqlAdminClient, SqlFlavor, SqlOperation, SslCert,
    cert_name_for_binding,
};

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::details::{BindDetails, Details};
use crate::store::{ServiceBindingRecord, ServiceInstanceRecord, StoreError};

const ROLE_PREFIX: &str = "roles/";
const MEMBER_PREFIX: &str = "serviceAccount:";
const ACCOUNT_PREFIX: &str = "sb-binding-";

/// Backend limit on service account IDs.
pub const MAX_ACCOUNT_ID_LEN: usize = 20;

/// A role granted to a set of members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBinding {
    /// Role name, including its `roles/` prefix.
    pub role: String,
    /// Principals holding the role.
    pub members: Vec<String>,
}

impl PolicyBinding {
    /// Binding of `role` to `members`.
    pub fn new<I, S>(role: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            role: role.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }
}

/// Merge bindings so every role appears once with the union of its members.
///
/// Roles whose member set ends up empty are dropped. The result is ordered
/// by role and member, but callers should only rely on set equality.
pub fn merge_bindings(bindings: Vec<PolicyBinding>) -> Vec<PolicyBinding> {
    let mut by_role: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for binding in bindings {
        by_role
            .entry(binding.role)
            .or_default()
            .extend(binding.members);
    }

    by_role
        .into_iter()
        .filter(|(_, members)| !members.is_empty())
        .map(|(role, members)| PolicyBinding {
            role,
            members: members.into_iter().collect(),
        })
        .collect()
}

/// Remove `member` from every binding. Empty roles are left for
/// [`merge_bindings`] to drop.
pub fn remove_member(bindings: &mut [PolicyBinding], member: &str) {
    for binding in bindings {
        binding.members.retain(|m| m != member);
    }
}

/// Key union of two blobs. Keys in `overrides` win.
pub fn merge_details(base: &Details, overrides: &Details) -> Details {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Credential errors.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The bind request carried no usable `role` parameter.
    #[error("error getting role as string from request")]
    MissingRole,

    /// The requested role is not on the whitelist.
    #[error("the role {role} is not allowed for this service; you must use one of {allowed:?}")]
    RoleNotAllowed {
        /// Requested role.
        role: String,
        /// Allowed roles.
        allowed: Vec<String>,
    },

    /// Bind parameters were not an object.
    #[error("invalid bind parameters: {0}")]
    InvalidParameters(String),

    /// A database bind did not name the user to create.
    #[error("Error binding, missing parameters. Required parameters are username and password")]
    MissingUserCredentials,

    /// Another writer changed the policy concurrently.
    #[error("policy was modified concurrently: {0}")]
    Conflict(String),

    /// The policy kept changing underneath every attempt.
    #[error("gave up updating the policy after {attempts} conflicting attempts")]
    ConflictRetriesExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// The identity backend rejected a call.
    #[error("identity backend error {code}: {message}")]
    Backend {
        /// Status code.
        code: u16,
        /// Backend message.
        message: String,
    },

    /// A backend operation was still running after the last poll.
    #[error("operation {operation} did not finish after {polls} polls")]
    OperationTimedOut {
        /// Backend operation name.
        operation: String,
        /// Polls made.
        polls: u32,
    },

    /// A stored credential blob could not be read.
    #[error("error unmarshalling credentials: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The instance metadata could not be read.
    #[error("error reading instance details: {0}")]
    InstanceDetails(#[from] StoreError),
}

impl CredentialError {
    /// True for errors the backend expects to clear up by itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend { code: 503, .. })
    }

    /// True for errors caused by the bind request itself.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::MissingRole
                | Self::RoleNotAllowed { .. }
                | Self::InvalidParameters(_)
                | Self::MissingUserCredentials
        )
    }
}

/// Mints and revokes credentials for bindings.
#[async_trait]
pub trait AccountManager: Send + Sync {
    /// Create credentials for `binding_id` on `instance`.
    async fn create_credentials(
        &self,
        instance: &ServiceInstanceRecord,
        binding_id: &str,
        details: &BindDetails,
    ) -> Result<Details, CredentialError>;

    /// Destroy the credentials stored in `binding`.
    async fn delete_credentials(
        &self,
        instance: &ServiceInstanceRecord,
        binding: &ServiceBindingRecord,
    ) -> Result<(), CredentialError>;

    /// Freshly minted credentials merged with the instance metadata.
    ///
    /// The default is a key union where instance metadata wins.
    fn build_instance_credentials(
        &self,
        credentials: &Details,
        instance: &ServiceInstanceRecord,
    ) -> Result<Details, CredentialError> {
        let metadata = instance.details()?;
        Ok(merge_details(credentials, &metadata))
    }
}

// ============================================================================
// Service identities
// ============================================================================

/// A service identity as the backend reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceAccount {
    /// Full resource name.
    pub name: String,
    /// Display name.
    pub display_name: String,
    /// Email used as the policy principal.
    pub email: String,
    /// Stable unique ID.
    pub unique_id: String,
}

/// A project-level authorization policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    /// Role bindings.
    pub bindings: Vec<PolicyBinding>,
    /// Version tag used for optimistic concurrency.
    pub etag: String,
}

/// Identity backend operations needed by [`ServiceAccountManager`].
#[async_trait]
pub trait IamClient: Send + Sync {
    /// Create a service account.
    async fn create_service_account(
        &self,
        account_id: &str,
        display_name: &str,
    ) -> Result<ServiceAccount, CredentialError>;

    /// Create a key for the account, returning its private key data.
    async fn create_key(&self, account: &ServiceAccount) -> Result<String, CredentialError>;

    /// Read the project policy.
    async fn get_policy(&self) -> Result<Policy, CredentialError>;

    /// Replace the project policy. Fails with [`CredentialError::Conflict`]
    /// if the policy changed since it was read.
    async fn set_policy(&self, policy: Policy) -> Result<(), CredentialError>;

    /// Delete a service account by unique ID.
    async fn delete_service_account(&self, unique_id: &str) -> Result<(), CredentialError>;
}

/// Credential blob stored for service-identity bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceAccountInfo {
    /// Display name of the account.
    pub name: String,
    /// Principal email.
    pub email: String,
    /// Stable unique ID, used to delete the account.
    pub unique_id: String,
    /// Owning project.
    pub project_id: String,
    /// Key material handed to the application.
    pub private_key_data: String,
}

/// Account ID for a binding: a fixed prefix plus the binding ID, truncated
/// to the backend's length limit.
pub fn account_id_for_binding(binding_id: &str) -> String {
    format!("{ACCOUNT_PREFIX}{binding_id}")
        .chars()
        .take(MAX_ACCOUNT_ID_LEN)
        .collect()
}

/// One service identity per binding, granted a role picked by the caller.
pub struct ServiceAccountManager<C> {
    client: C,
    project_id: String,
    role_whitelist: BTreeSet<String>,
    max_attempts: u32,
    conflict_delay: Duration,
}

impl<C: IamClient> ServiceAccountManager<C> {
    /// Manager for `project_id`. Any role is accepted until a whitelist is set.
    pub fn new(client: C, project_id: impl Into<String>) -> Self {
        Self {
            client,
            project_id: project_id.into(),
            role_whitelist: BTreeSet::new(),
            max_attempts: 3,
            conflict_delay: Duration::from_secs(5),
        }
    }

    /// Only accept these roles (without the `roles/` prefix).
    pub fn with_role_whitelist<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.role_whitelist = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Wait this long between policy writes that hit a conflict.
    pub fn with_conflict_delay(mut self, delay: Duration) -> Self {
        self.conflict_delay = delay;
        self
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Role requested in the bind parameters, checked against the whitelist.
    pub fn requested_role(&self, details: &BindDetails) -> Result<String, CredentialError> {
        let params = details
            .parameters()
            .map_err(|e| CredentialError::InvalidParameters(e.to_string()))?;
        let role = params
            .get("role")
            .and_then(|r| r.as_str())
            .ok_or(CredentialError::MissingRole)?;

        if !self.role_whitelist.is_empty() && !self.role_whitelist.contains(role) {
            return Err(CredentialError::RoleNotAllowed {
                role: role.to_string(),
                allowed: self.role_whitelist.iter().cloned().collect(),
            });
        }
        Ok(role.to_string())
    }

    /// Create an account for `binding_id`, grant it `roles` and mint a key.
    pub async fn create_account_with_roles(
        &self,
        binding_id: &str,
        roles: &[String],
    ) -> Result<ServiceAccountInfo, CredentialError> {
        let account_id = account_id_for_binding(binding_id);
        let account = self
            .client
            .create_service_account(&account_id, &account_id)
            .await?;
        info!(account = %account.email, binding_id, "Created service account");

        for role in roles {
            self.grant_role(role, &account).await?;
        }

        let private_key_data = self.client.create_key(&account).await?;

        Ok(ServiceAccountInfo {
            name: account.display_name,
            email: account.email,
            unique_id: account.unique_id,
            project_id: self.project_id.clone(),
            private_key_data,
        })
    }

    async fn grant_role(
        &self,
        role: &str,
        account: &ServiceAccount,
    ) -> Result<(), CredentialError> {
        let member = format!("{MEMBER_PREFIX}{}", account.email);
        let binding = PolicyBinding::new(format!("{ROLE_PREFIX}{role}"), [member]);

        self.update_policy(|bindings| {
            bindings.push(binding.clone());
        })
        .await
    }

    async fn revoke_member(&self, email: &str) -> Result<(), CredentialError> {
        let member = format!("{MEMBER_PREFIX}{email}");
        self.update_policy(|bindings| remove_member(bindings, &member))
            .await
    }

    /// Read-modify-write the project policy, retrying on conflicts.
    async fn update_policy<F>(&self, edit: F) -> Result<(), CredentialError>
    where
        F: Fn(&mut Vec<PolicyBinding>) + Send + Sync,
    {
        for attempt in 1..=self.max_attempts {
            let mut policy = self.client.get_policy().await?;
            edit(&mut policy.bindings);
            policy.bindings = merge_bindings(std::mem::take(&mut policy.bindings));

            match self.client.set_policy(policy).await {
                Ok(()) => return Ok(()),
                Err(CredentialError::Conflict(reason)) => {
                    warn!(attempt, reason = %reason, "Policy write conflicted");
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.conflict_delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(CredentialError::ConflictRetriesExhausted {
            attempts: self.max_attempts,
        })
    }
}

#[async_trait]
impl<C: IamClient> AccountManager for ServiceAccountManager<C> {
    async fn create_credentials(
        &self,
        _instance: &ServiceInstanceRecord,
        binding_id: &str,
        details: &BindDetails,
    ) -> Result<Details, CredentialError> {
        let role = self.requested_role(details)?;
        let info = self.create_account_with_roles(binding_id, &[role]).await?;

        match serde_json::to_value(&info)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Ok(Details::new()),
        }
    }

    async fn delete_credentials(
        &self,
        _instance: &ServiceInstanceRecord,
        binding: &ServiceBindingRecord,
    ) -> Result<(), CredentialError> {
        let info: ServiceAccountInfo = serde_json::from_str(&binding.other_details)?;

        self.revoke_member(&info.email).await?;
        self.client.delete_service_account(&info.unique_id).await?;
        debug!(unique_id = %info.unique_id, "Deleted service account");
        Ok(())
    }
}
