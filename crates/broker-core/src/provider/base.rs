// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider assembled from a resource manager and an account manager.
//!
//! Most services create their backend resource synchronously and hand out
//! bindings through an [`AccountManager`]. [`BaseProvider`] wires the two
//! together so a service only has to implement [`ResourceManager`].

use async_trait::async_trait;

use super::{InstanceMetadata, ProviderError, ServiceProvider};
use crate::catalog::ServicePlan;
use crate::credentials::AccountManager;
use crate::details::{BindDetails, Details, DeprovisionDetails, ProvisionDetails};
use crate::store::{ServiceBindingRecord, ServiceInstanceRecord};

/// Creates and deletes one kind of backend resource.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Create the resource for `instance_id`.
    async fn create(
        &self,
        instance_id: &str,
        details: &ProvisionDetails,
        plan: &ServicePlan,
    ) -> Result<InstanceMetadata, ProviderError>;

    /// Delete the resource behind `instance`.
    async fn delete(
        &self,
        instance: &ServiceInstanceRecord,
        details: &DeprovisionDetails,
    ) -> Result<(), ProviderError>;
}

/// Synchronous provider that routes bind and unbind to an account manager.
pub struct BaseProvider<R, A> {
    resources: R,
    accounts: A,
}

impl<R: ResourceManager, A: AccountManager> BaseProvider<R, A> {
    /// Provider backed by `resources`, minting bindings through `accounts`.
    pub fn new(resources: R, accounts: A) -> Self {
        Self {
            resources,
            accounts,
        }
    }

    /// The resource manager.
    pub fn resources(&self) -> &R {
        &self.resources
    }

    /// The account manager.
    pub fn accounts(&self) -> &A {
        &self.accounts
    }
}

#[async_trait]
impl<R: ResourceManager, A: AccountManager> ServiceProvider for BaseProvider<R, A> {
    async fn provision(
        &self,
        instance_id: &str,
        details: &ProvisionDetails,
        plan: &ServicePlan,
    ) -> Result<InstanceMetadata, ProviderError> {
        self.resources.create(instance_id, details, plan).await
    }

    async fn deprovision(
        &self,
        instance: &ServiceInstanceRecord,
        details: &DeprovisionDetails,
    ) -> Result<(), ProviderError> {
        self.resources.delete(instance, details).await
    }

    async fn bind(
        &self,
        instance: &ServiceInstanceRecord,
        binding_id: &str,
        details: &BindDetails,
    ) -> Result<Details, ProviderError> {
        Ok(self
            .accounts
            .create_credentials(instance, binding_id, details)
            .await?)
    }

    async fn unbind(
        &self,
        instance: &ServiceInstanceRecord,
        binding: &ServiceBindingRecord,
    ) -> Result<(), ProviderError> {
        Ok(self.accounts.delete_credentials(instance, binding).await?)
    }

    fn build_instance_credentials(
        &self,
        credentials: &Details,
        instance: &ServiceInstanceRecord,
    ) -> Result<Details, ProviderError> {
        Ok(self
            .accounts
            .build_instance_credentials(credentials, instance)?)
    }
}
