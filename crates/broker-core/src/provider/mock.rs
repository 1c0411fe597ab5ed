// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock provider for testing.
//!
//! Simulates a backend without talking to one. Poll results and failures can
//! be scripted ahead of time, and every call is recorded.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use super::{InstanceMetadata, ProviderError, ServiceProvider};
use crate::catalog::ServicePlan;
use crate::details::{BindDetails, Details, DeprovisionDetails, ProvisionDetails};
use crate::store::{ServiceBindingRecord, ServiceInstanceRecord};

/// Provider capability a scripted failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    /// `provision`
    Provision,
    /// `deprovision`
    Deprovision,
    /// `bind`
    Bind,
    /// `unbind`
    Unbind,
    /// `poll_instance`
    Poll,
    /// `last_operation_was_delete`
    WasDelete,
}

#[derive(Default)]
struct MockState {
    polls: VecDeque<Result<bool, ProviderError>>,
    was_delete: Option<bool>,
    failures: HashMap<MockCall, ProviderError>,
    calls: Vec<String>,
}

/// Mock provider for testing.
pub struct MockProvider {
    provisions_async: bool,
    deprovisions_async: bool,
    state: Mutex<MockState>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// A fully synchronous provider.
    pub fn new() -> Self {
        Self::with_async(false, false)
    }

    /// A provider whose creates and deletes both finish out of band.
    pub fn asynchronous() -> Self {
        Self::with_async(true, true)
    }

    /// A provider with the given async flags.
    pub fn with_async(provisions_async: bool, deprovisions_async: bool) -> Self {
        Self {
            provisions_async,
            deprovisions_async,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Queue the next poll result. With an empty queue polls report done.
    pub async fn push_poll(&self, result: Result<bool, ProviderError>) {
        self.state.lock().await.polls.push_back(result);
    }

    /// Answer for `last_operation_was_delete`. Unset means unsupported.
    pub async fn set_last_operation_was_delete(&self, was_delete: bool) {
        self.state.lock().await.was_delete = Some(was_delete);
    }

    /// Make the next call of `call` fail with `error`.
    pub async fn fail_next(&self, call: MockCall, error: ProviderError) {
        self.state.lock().await.failures.insert(call, error);
    }

    /// Calls received so far, as `capability:instance[/binding]`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    /// Number of calls received for a capability.
    pub async fn call_count(&self, capability: &str) -> usize {
        let prefix = format!("{capability}:");
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    async fn record(&self, call: MockCall, entry: String) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state.calls.push(entry);
        match state.failures.remove(&call) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ServiceProvider for MockProvider {
    async fn provision(
        &self,
        instance_id: &str,
        details: &ProvisionDetails,
        plan: &ServicePlan,
    ) -> Result<InstanceMetadata, ProviderError> {
        self.record(MockCall::Provision, format!("provision:{instance_id}"))
            .await?;

        let mut other_details = Details::new();
        other_details.insert("resource_id".to_string(), json!(format!("mock-{instance_id}")));
        other_details.insert("plan".to_string(), json!(plan.name));
        for (key, value) in details.parameters().map_err(|e| {
            ProviderError::InvalidParameters(e.to_string())
        })? {
            other_details.insert(key, value);
        }

        Ok(InstanceMetadata {
            name: format!("mock-{instance_id}"),
            location: plan
                .service_properties
                .get("location")
                .cloned()
                .unwrap_or_else(|| "local".to_string()),
            url: format!("mock://{instance_id}"),
            other_details,
        })
    }

    async fn deprovision(
        &self,
        instance: &ServiceInstanceRecord,
        _details: &DeprovisionDetails,
    ) -> Result<(), ProviderError> {
        self.record(MockCall::Deprovision, format!("deprovision:{}", instance.id))
            .await
    }

    async fn bind(
        &self,
        instance: &ServiceInstanceRecord,
        binding_id: &str,
        _details: &BindDetails,
    ) -> Result<Details, ProviderError> {
        self.record(MockCall::Bind, format!("bind:{}/{binding_id}", instance.id))
            .await?;

        let mut credentials = Details::new();
        credentials.insert("username".to_string(), json!(format!("user-{binding_id}")));
        credentials.insert("password".to_string(), json!(format!("secret-{binding_id}")));
        Ok(credentials)
    }

    async fn unbind(
        &self,
        instance: &ServiceInstanceRecord,
        binding: &ServiceBindingRecord,
    ) -> Result<(), ProviderError> {
        self.record(
            MockCall::Unbind,
            format!("unbind:{}/{}", instance.id, binding.binding_id),
        )
        .await
    }

    async fn poll_instance(&self, instance: &ServiceInstanceRecord) -> Result<bool, ProviderError> {
        self.record(MockCall::Poll, format!("poll:{}", instance.id))
            .await?;
        self.state
            .lock()
            .await
            .polls
            .pop_front()
            .unwrap_or(Ok(true))
    }

    async fn last_operation_was_delete(
        &self,
        instance: &ServiceInstanceRecord,
    ) -> Result<bool, ProviderError> {
        self.record(MockCall::WasDelete, format!("was_delete:{}", instance.id))
            .await?;
        self.state
            .lock()
            .await
            .was_delete
            .ok_or(ProviderError::NotSupported("operation lookup"))
    }

    fn provisions_async(&self) -> bool {
        self.provisions_async
    }

    fn deprovisions_async(&self) -> bool {
        self.deprovisions_async
    }
}
