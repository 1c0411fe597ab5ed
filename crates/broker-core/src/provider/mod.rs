// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider capability contract.
//!
//! A provider knows how to create, delete and grant access to one kind of
//! backend resource. The broker owns the records and the control flow;
//! providers only talk to their backend. Each enabled service is served by
//! exactly one provider, chosen through the
//! [`ServiceRegistry`](crate::catalog::ServiceRegistry).
//!
//! Providers that work asynchronously override [`ServiceProvider::poll_instance`]
//! and [`ServiceProvider::last_operation_was_delete`]; the defaults report the
//! capability as unsupported. Synchronous services can be assembled from a
//! [`ResourceManager`] and an account manager with [`BaseProvider`].

mod base;
#[cfg(any(test, feature = "testing"))]
mod mock;

pub use base::{BaseProvider, ResourceManager};
#[cfg(any(test, feature = "testing"))]
pub use mock::{MockCall, MockProvider};

use async_trait::async_trait;

use crate::catalog::ServicePlan;
use crate::credentials::{CredentialError, merge_details};
use crate::details::{BindDetails, Details, DeprovisionDetails, ProvisionDetails};
use crate::store::{ServiceBindingRecord, ServiceInstanceRecord};

/// What a provider reports about a resource it created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceMetadata {
    /// Backend display name.
    pub name: String,
    /// Backend location or region.
    pub location: String,
    /// Backend URL, if any.
    pub url: String,
    /// Everything else the provider needs to find the resource again.
    pub other_details: Details,
}

/// Errors reported by providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The backend asked to be retried later.
    #[error("backend temporarily unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the call.
    #[error("backend error {code}: {message}")]
    Backend {
        /// Status code reported by the backend.
        code: u16,
        /// Backend message.
        message: String,
    },

    /// The request parameters make no sense for this provider.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Minting or revoking credentials failed.
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// The provider does not implement this capability.
    #[error("{0} is not supported by this provider")]
    NotSupported(&'static str),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// True if the failure is expected to clear up by itself.
    ///
    /// During polling, transient errors are reported as "in progress" rather
    /// than "failed". A backend 503 counts as transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Backend { code, .. } => *code == 503,
            Self::Credentials(err) => err.is_transient(),
            _ => false,
        }
    }

    /// True if the request, not the backend, is at fault.
    pub fn is_caller_error(&self) -> bool {
        match self {
            Self::InvalidParameters(_) => true,
            Self::Credentials(err) => err.is_caller_error(),
            _ => false,
        }
    }
}

/// Capabilities a backend provider must offer.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// Create the backend resource for `instance_id`.
    ///
    /// Backend identifiers should be derived from `instance_id` wherever the
    /// backend allows it, so the resource can be found again after a crash.
    async fn provision(
        &self,
        instance_id: &str,
        details: &ProvisionDetails,
        plan: &ServicePlan,
    ) -> Result<InstanceMetadata, ProviderError>;

    /// Delete the backend resource.
    async fn deprovision(
        &self,
        instance: &ServiceInstanceRecord,
        details: &DeprovisionDetails,
    ) -> Result<(), ProviderError>;

    /// Mint credentials for a binding.
    async fn bind(
        &self,
        instance: &ServiceInstanceRecord,
        binding_id: &str,
        details: &BindDetails,
    ) -> Result<Details, ProviderError>;

    /// Revoke a binding's credentials.
    async fn unbind(
        &self,
        instance: &ServiceInstanceRecord,
        binding: &ServiceBindingRecord,
    ) -> Result<(), ProviderError>;

    /// Combine freshly minted credentials with the instance's metadata.
    ///
    /// The default is a key union where instance metadata wins.
    fn build_instance_credentials(
        &self,
        credentials: &Details,
        instance: &ServiceInstanceRecord,
    ) -> Result<Details, ProviderError> {
        let metadata = instance
            .details()
            .map_err(|e| ProviderError::Other(e.to_string()))?;
        Ok(merge_details(credentials, &metadata))
    }

    /// Whether the outstanding operation on the instance has finished.
    async fn poll_instance(
        &self,
        _instance: &ServiceInstanceRecord,
    ) -> Result<bool, ProviderError> {
        Err(ProviderError::NotSupported("polling"))
    }

    /// Whether the last finished operation on the instance was a delete.
    async fn last_operation_was_delete(
        &self,
        _instance: &ServiceInstanceRecord,
    ) -> Result<bool, ProviderError> {
        Err(ProviderError::NotSupported("operation lookup"))
    }

    /// True if provisioning finishes out of band.
    fn provisions_async(&self) -> bool {
        false
    }

    /// True if deprovisioning finishes out of band.
    fn deprovisions_async(&self) -> bool {
        false
    }
}
