// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Legacy plan upgrader.
//!
//! Older installs generated plan IDs at startup, so every install has its own
//! IDs for the same plans. Those IDs survive in `plan_details` and in the
//! instances that were provisioned from them. [`LegacyPlanUpgrader`] wraps a
//! [`ServiceBroker`] and refuses to work on such instances until they are
//! moved to the fixed plan that replaced their legacy one. The move itself is
//! a record change only; the backend resource is untouched.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::broker::{
    BindResponse, DeprovisionResponse, LastOperation, ProvisionResponse, ServiceBroker,
    UpdateResponse,
};
use crate::catalog::{ServiceDefinition, ServicePlan};
use crate::details::{
    BindDetails, DeprovisionDetails, ProvisionDetails, UnbindDetails, UpdateDetails,
};
use crate::error::{BrokerError, Result};
use crate::store::Store;

/// Prefix of the synthetic catalog plans shown for legacy plans.
pub const LEGACY_PLAN_PREFIX: &str = "legacy3-";

/// A legacy plan that may exist in the store, and its replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeCandidate {
    /// Service the plan belongs to.
    pub service_id: String,
    /// Name the legacy plan was stored under.
    pub legacy_plan_name: String,
    /// Fixed ID of the replacement plan.
    pub new_plan_id: String,
    /// Name of the replacement plan.
    pub new_plan_name: String,
}

impl UpgradeCandidate {
    /// A candidate upgrade from `legacy_plan_name` to the given plan.
    pub fn new(
        service_id: impl Into<String>,
        legacy_plan_name: impl Into<String>,
        new_plan_id: impl Into<String>,
        new_plan_name: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            legacy_plan_name: legacy_plan_name.into(),
            new_plan_id: new_plan_id.into(),
            new_plan_name: new_plan_name.into(),
        }
    }
}

/// A legacy plan known to this install and its replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePath {
    /// Service the plan belongs to.
    pub service_id: String,
    /// Install-specific ID of the legacy plan.
    pub legacy_plan_id: String,
    /// Name the legacy plan was stored under.
    pub legacy_plan_name: String,
    /// Fixed ID of the replacement plan.
    pub new_plan_id: String,
    /// Name of the replacement plan.
    pub new_plan_name: String,
}

impl UpgradePath {
    /// Catalog name of the synthetic legacy plan.
    pub fn catalog_name(&self) -> String {
        format!("{LEGACY_PLAN_PREFIX}{}", self.legacy_plan_name)
    }

    /// Synthetic catalog entry for the legacy plan.
    pub fn to_service_plan(&self) -> ServicePlan {
        ServicePlan {
            id: self.legacy_plan_id.clone(),
            name: self.catalog_name(),
            description: format!("Legacy plan, must be upgraded to {:?}", self.new_plan_name),
            free: true,
            ..Default::default()
        }
    }
}

/// Upgrades from the runtime-generated plans of 3.x installs to fixed plans.
pub fn default_upgrade_candidates() -> Vec<UpgradeCandidate> {
    [
        // Stackdriver Debugger
        (
            "83837945-1547-41e0-b661-ea31d76eed11",
            "default",
            "10866183-a775-49e8-96e3-4e7a901e4a79",
            "default",
        ),
        // Cloud ML APIs
        (
            "5ad2dce0-51f7-4ede-8b46-293d6df1e8d4",
            "default",
            "be7954e1-ecfb-4936-a0b6-db35e6424c7a",
            "default",
        ),
        // Pub/Sub
        (
            "628629e3-79f5-4255-b981-d14c6c7856be",
            "default",
            "622f4da3-8731-492a-af29-66a9146f8333",
            "default",
        ),
        // Stackdriver Trace
        (
            "c5ddfe15-24d9-47f8-8ffe-f6b7daa9cf4a",
            "default",
            "ab6c2287-b4bc-4ff4-a36a-0575e7910164",
            "default",
        ),
        // Datastore
        (
            "76d4abb2-fee7-4c8f-aee1-bcea2837f02b",
            "default",
            "05f1fb6b-b5f0-48a2-9c2b-a5f236507a97",
            "default",
        ),
        // BigQuery
        (
            "f80c0a3e-bd4d-4809-a900-b4e33a6450f1",
            "default",
            "10ff4e72-6e84-44eb-851f-bdb38a791914",
            "default",
        ),
        // Cloud Storage
        (
            "b9e4332e-b42b-4680-bda5-ea1506797474",
            "nearline",
            "a42c1182-d1a0-4d40-82c1-28220518b360",
            "nearline",
        ),
        (
            "b9e4332e-b42b-4680-bda5-ea1506797474",
            "reduced_availability",
            "1a1f4fe6-1904-44d0-838c-4c87a9490a6b",
            "reduced-availability",
        ),
        (
            "b9e4332e-b42b-4680-bda5-ea1506797474",
            "standard",
            "e1d11f65-da66-46ad-977c-6d56513baf43",
            "standard",
        ),
    ]
    .into_iter()
    .map(|(service, legacy, new_id, new_name)| {
        UpgradeCandidate::new(service, legacy, new_id, new_name)
    })
    .collect()
}

/// Resolve candidates against the plans stored by earlier installs.
///
/// Candidates without a stored plan are skipped; an install only has the
/// legacy plans it actually ran with.
pub async fn resolve_upgrade_paths(
    store: &dyn Store,
    candidates: Vec<UpgradeCandidate>,
) -> Result<Vec<UpgradePath>> {
    let mut paths = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let legacy = match store
            .get_legacy_plan(&candidate.service_id, &candidate.legacy_plan_name)
            .await
        {
            Ok(plan) => plan,
            Err(e) if e.is_not_found() => {
                debug!(
                    service_id = %candidate.service_id,
                    plan = %candidate.legacy_plan_name,
                    "Legacy plan not present in this install"
                );
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        paths.push(UpgradePath {
            service_id: candidate.service_id,
            legacy_plan_id: legacy.id,
            legacy_plan_name: candidate.legacy_plan_name,
            new_plan_id: candidate.new_plan_id,
            new_plan_name: candidate.new_plan_name,
        });
    }

    Ok(paths)
}

/// [`ServiceBroker`] decorator that blocks work on legacy plans.
pub struct LegacyPlanUpgrader {
    wrapped: Arc<dyn ServiceBroker>,
    store: Arc<dyn Store>,
    upgrades: Vec<UpgradePath>,
}

impl std::fmt::Debug for LegacyPlanUpgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyPlanUpgrader")
            .field("upgrades", &self.upgrades)
            .finish_non_exhaustive()
    }
}

impl LegacyPlanUpgrader {
    /// Wrap `wrapped` with already resolved upgrade paths.
    pub fn new(
        wrapped: Arc<dyn ServiceBroker>,
        store: Arc<dyn Store>,
        upgrades: Vec<UpgradePath>,
    ) -> Self {
        Self {
            wrapped,
            store,
            upgrades,
        }
    }

    /// Upgrade paths active for this install.
    pub fn upgrades(&self) -> &[UpgradePath] {
        &self.upgrades
    }

    fn upgrade_path(&self, service_id: &str, plan_id: &str) -> Option<&UpgradePath> {
        self.upgrades
            .iter()
            .find(|up| up.service_id == service_id && up.legacy_plan_id == plan_id)
    }

    fn augment(&self, mut service: ServiceDefinition) -> ServiceDefinition {
        let compat_plans: Vec<ServicePlan> = self
            .upgrades
            .iter()
            .filter(|up| up.service_id == service.id)
            .map(UpgradePath::to_service_plan)
            .collect();

        if !compat_plans.is_empty() {
            service.plan_updateable = true;
            service.plans.extend(compat_plans);
        }
        service
    }

    /// Fails if the stored instance is on a legacy plan.
    async fn ensure_upgraded(&self, verb: &str, instance_id: &str) -> Result<()> {
        let instance = match self.store.get_instance(instance_id).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                return Err(BrokerError::InstanceDoesNotExist {
                    instance_id: instance_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        match self.upgrade_path(&instance.service_id, &instance.plan_id) {
            None => Ok(()),
            Some(path) => Err(BrokerError::LegacyPlan(format!(
                "The instance you're trying to {verb} is using an unsupported plan. \
                 You must update it first by running `cf update-service SERVICE_NAME -p {}`",
                path.new_plan_name
            ))),
        }
    }
}

#[async_trait]
impl ServiceBroker for LegacyPlanUpgrader {
    async fn services(&self) -> Result<Vec<ServiceDefinition>> {
        let services = self.wrapped.services().await?;
        Ok(services.into_iter().map(|s| self.augment(s)).collect())
    }

    async fn provision(
        &self,
        instance_id: &str,
        details: &ProvisionDetails,
        async_allowed: bool,
    ) -> Result<ProvisionResponse> {
        if let Some(path) = self.upgrade_path(&details.service_id, &details.plan_id) {
            return Err(BrokerError::LegacyPlan(format!(
                "The plan {:?} is only available for compatibility purposes, use {:?} instead.",
                path.catalog_name(),
                path.new_plan_name
            )));
        }
        self.wrapped
            .provision(instance_id, details, async_allowed)
            .await
    }

    async fn deprovision(
        &self,
        instance_id: &str,
        details: &DeprovisionDetails,
        async_allowed: bool,
    ) -> Result<DeprovisionResponse> {
        self.ensure_upgraded("deprovision", instance_id).await?;
        self.wrapped
            .deprovision(instance_id, details, async_allowed)
            .await
    }

    async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        details: &BindDetails,
    ) -> Result<BindResponse> {
        self.ensure_upgraded("bind", instance_id).await?;
        self.wrapped.bind(instance_id, binding_id, details).await
    }

    async fn unbind(
        &self,
        instance_id: &str,
        binding_id: &str,
        details: &UnbindDetails,
    ) -> Result<()> {
        self.ensure_upgraded("unbind", instance_id).await?;
        self.wrapped.unbind(instance_id, binding_id, details).await
    }

    #[instrument(skip(self, details), fields(instance_id = %instance_id))]
    async fn update(
        &self,
        instance_id: &str,
        details: &UpdateDetails,
        async_allowed: bool,
    ) -> Result<UpdateResponse> {
        let mut instance = match self.store.get_instance(instance_id).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                return Err(BrokerError::InstanceDoesNotExist {
                    instance_id: instance_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let Some(path) = self.upgrade_path(&instance.service_id, &instance.plan_id) else {
            return self.wrapped.update(instance_id, details, async_allowed).await;
        };

        if details.plan_id.as_deref() != Some(path.new_plan_id.as_str()) {
            return Err(BrokerError::LegacyPlan(format!(
                "you can only upgrade this legacy plan to {:?}",
                path.new_plan_name
            )));
        }

        instance.plan_id = path.new_plan_id.clone();
        self.store.save_instance(&instance).await?;

        info!(
            legacy_plan = %path.legacy_plan_id,
            new_plan = %path.new_plan_id,
            "Instance moved off legacy plan"
        );
        Ok(UpdateResponse { is_async: false })
    }

    async fn last_operation(&self, instance_id: &str) -> Result<LastOperation> {
        self.wrapped.last_operation(instance_id).await
    }
}
