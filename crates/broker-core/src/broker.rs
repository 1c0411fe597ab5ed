// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker orchestrator.
//!
//! [`Broker`] implements the six protocol operations on top of a [`Store`]
//! and a [`ServiceRegistry`]. The instance row is the claim: Provision inserts
//! it in `pending` status before the backend is touched, so the unique key on
//! the instance ID decides which of two racing callers wins.
//!
//! Instance lifecycle as stored:
//!
//! ```text
//! (absent) --claim--> pending --sync--> active --sync delete--> (deleted)
//!                        |                 ^  \
//!                        | async           |   async delete
//!                        v                 |    v
//!                  provisioning --poll-----+  deprovisioning --poll--> (deleted)
//! ```
//!
//! A failed backend create releases the `pending` claim. Polling is a pure
//! function of the stored status and the classified provider answer; see
//! [`next_transition`].
//!
//! A `pending` row older than the claim timeout belonged to a call that never
//! finished. Such a row is polled like any other and may be deprovisioned.
//! Bindings follow the same scheme: Bind inserts a `pending` binding row
//! before the provider mints anything, and the partial unique index on live
//! pairs rejects a second claim.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{ServiceDefinition, ServiceRegistry};
use crate::details::{
    BindDetails, Details, DeprovisionDetails, ProvisionDetails, UnbindDetails, UpdateDetails,
};
use crate::error::{BrokerError, ResponseStatus, Result};
use crate::provider::{ProviderError, ServiceProvider};
use crate::store::{
    BindingStatus, InstanceStatus, ProvisionRequestRecord, ServiceBindingRecord,
    ServiceInstanceRecord, Store, StoreError,
};

/// Age after which an unfinished claim is treated as abandoned.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(600);

/// Description reported when a finished operation cannot be classified.
pub const UNDETERMINED_OPERATION: &str = "Couldn't determine if provision or deprovision flow, \
    this may leave orphaned resources, contact your operator for cleanup";

// ============================================================================
// Responses
// ============================================================================

/// Result of a successful Provision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionResponse {
    /// True if the backend create finishes out of band.
    pub is_async: bool,
    /// Dashboard for the instance, if the provider exposes one.
    pub dashboard_url: Option<String>,
}

impl ProvisionResponse {
    /// `Accepted` for async creates, `Created` otherwise.
    pub fn status(&self) -> ResponseStatus {
        if self.is_async {
            ResponseStatus::Accepted
        } else {
            ResponseStatus::Created
        }
    }
}

/// Result of a successful Deprovision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeprovisionResponse {
    /// True if the backend delete finishes out of band.
    pub is_async: bool,
}

impl DeprovisionResponse {
    /// `Accepted` for async deletes, `Ok` otherwise.
    pub fn status(&self) -> ResponseStatus {
        if self.is_async {
            ResponseStatus::Accepted
        } else {
            ResponseStatus::Ok
        }
    }
}

/// Result of a successful Bind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindResponse {
    /// Credentials merged with the instance metadata.
    pub credentials: Details,
}

impl BindResponse {
    /// Always `Created`.
    pub fn status(&self) -> ResponseStatus {
        ResponseStatus::Created
    }
}

/// Result of a successful Update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResponse {
    /// True if the change finishes out of band.
    pub is_async: bool,
}

impl UpdateResponse {
    /// `Accepted` for async updates, `Ok` otherwise.
    pub fn status(&self) -> ResponseStatus {
        if self.is_async {
            ResponseStatus::Accepted
        } else {
            ResponseStatus::Ok
        }
    }
}

/// State reported by LastOperation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Still running, poll again.
    InProgress,
    /// Finished.
    Succeeded,
    /// Finished with an error.
    Failed,
}

impl OperationState {
    /// Returns the protocol string for the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Result of LastOperation.
#[derive(Debug, Clone, PartialEq)]
pub struct LastOperation {
    /// Operation state.
    pub state: OperationState,
    /// Human readable detail, if any.
    pub description: Option<String>,
}

impl LastOperation {
    fn new(state: OperationState, description: Option<String>) -> Self {
        Self { state, description }
    }
}

// ============================================================================
// Poll transitions
// ============================================================================

/// Kind of backend operation a poll observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// The instance was being created.
    Create,
    /// The instance was being deleted.
    Delete,
}

impl OperationKind {
    /// The operation named by a stored status, if any.
    pub fn in_flight(status: InstanceStatus) -> Option<Self> {
        match status {
            InstanceStatus::Pending | InstanceStatus::Provisioning => Some(Self::Create),
            InstanceStatus::Deprovisioning => Some(Self::Delete),
            InstanceStatus::Active => None,
        }
    }
}

/// Classified answer of a provider poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The backend is still working.
    Pending,
    /// The backend asked to be polled again later.
    Transient(String),
    /// The backend reported an error.
    Failed(String),
    /// The backend finished an operation of the given kind.
    Done {
        /// What finished.
        kind: OperationKind,
    },
}

/// Change to apply to the instance row after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    /// The backend resource is gone.
    SoftDelete,
    /// The backend resource is ready.
    MarkActive,
    /// An abandoned claim reached the backend, which is still working.
    MarkProvisioning,
    /// An abandoned claim never produced a backend resource.
    ReleaseClaim,
}

/// What a poll means for the caller and for the record.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// State to report.
    pub state: OperationState,
    /// Record change to apply, if any.
    pub action: Option<RecordAction>,
    /// Detail to report.
    pub description: Option<String>,
}

/// Map the stored status and a classified poll answer to a transition.
///
/// Only abandoned `pending` rows are ever polled. A failed poll on one of them
/// releases the claim; any other failure leaves the record alone.
pub fn next_transition(status: InstanceStatus, outcome: &PollOutcome) -> Transition {
    let (state, action, description) = match (status, outcome) {
        (InstanceStatus::Pending, PollOutcome::Pending) => (
            OperationState::InProgress,
            Some(RecordAction::MarkProvisioning),
            None,
        ),
        (_, PollOutcome::Pending) => (OperationState::InProgress, None, None),
        (_, PollOutcome::Transient(message)) => {
            (OperationState::InProgress, None, Some(message.clone()))
        }
        (InstanceStatus::Pending, PollOutcome::Failed(message)) => (
            OperationState::Failed,
            Some(RecordAction::ReleaseClaim),
            Some(message.clone()),
        ),
        (_, PollOutcome::Failed(message)) => (OperationState::Failed, None, Some(message.clone())),
        (_, PollOutcome::Done { kind: OperationKind::Delete }) => {
            (OperationState::Succeeded, Some(RecordAction::SoftDelete), None)
        }
        (InstanceStatus::Active, PollOutcome::Done { kind: OperationKind::Create }) => {
            (OperationState::Succeeded, None, None)
        }
        (_, PollOutcome::Done { kind: OperationKind::Create }) => {
            (OperationState::Succeeded, Some(RecordAction::MarkActive), None)
        }
    };

    Transition {
        state,
        action,
        description,
    }
}

// ============================================================================
// ServiceBroker
// ============================================================================

/// The six protocol operations plus the catalog.
///
/// Implemented by [`Broker`] and by decorators wrapping it, such as the
/// [`LegacyPlanUpgrader`](crate::compatibility::LegacyPlanUpgrader).
#[async_trait]
pub trait ServiceBroker: Send + Sync {
    /// Enabled services and their plans.
    async fn services(&self) -> Result<Vec<ServiceDefinition>>;

    /// Create an instance.
    async fn provision(
        &self,
        instance_id: &str,
        details: &ProvisionDetails,
        async_allowed: bool,
    ) -> Result<ProvisionResponse>;

    /// Delete an instance.
    async fn deprovision(
        &self,
        instance_id: &str,
        details: &DeprovisionDetails,
        async_allowed: bool,
    ) -> Result<DeprovisionResponse>;

    /// Mint credentials for an instance.
    async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        details: &BindDetails,
    ) -> Result<BindResponse>;

    /// Revoke credentials.
    async fn unbind(
        &self,
        instance_id: &str,
        binding_id: &str,
        details: &UnbindDetails,
    ) -> Result<()>;

    /// Change the plan of an instance.
    async fn update(
        &self,
        instance_id: &str,
        details: &UpdateDetails,
        async_allowed: bool,
    ) -> Result<UpdateResponse>;

    /// Poll the outstanding operation on an instance.
    async fn last_operation(&self, instance_id: &str) -> Result<LastOperation>;
}

// ============================================================================
// Broker
// ============================================================================

/// Orchestrates providers and records.
pub struct Broker {
    store: Arc<dyn Store>,
    registry: Arc<ServiceRegistry>,
    instance_limit: Option<u64>,
    claim_timeout: Duration,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("store", &"<Store>")
            .field("registry", &self.registry)
            .field("instance_limit", &self.instance_limit)
            .field("claim_timeout", &self.claim_timeout)
            .finish()
    }
}

impl Broker {
    /// A broker without an instance ceiling.
    pub fn new(store: Arc<dyn Store>, registry: Arc<ServiceRegistry>) -> Self {
        Self {
            store,
            registry,
            instance_limit: None,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }

    /// Set the maximum number of live instances. `None` means unlimited.
    pub fn with_instance_limit(mut self, limit: Option<u64>) -> Self {
        self.instance_limit = limit;
        self
    }

    /// Set the age after which a `pending` instance or binding row is
    /// considered abandoned.
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    /// The record store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The service registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    async fn live_instance(&self, instance_id: &str) -> Result<ServiceInstanceRecord> {
        match self.store.get_instance(instance_id).await {
            Ok(instance) => Ok(instance),
            Err(e) if e.is_not_found() => Err(BrokerError::InstanceDoesNotExist {
                instance_id: instance_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn is_stale(&self, created_at: DateTime<Utc>) -> bool {
        let age = Utc::now().signed_duration_since(created_at);
        chrono::Duration::from_std(self.claim_timeout).is_ok_and(|timeout| age >= timeout)
    }

    async fn check_instance_limit(&self) -> Result<()> {
        let Some(limit) = self.instance_limit else {
            return Ok(());
        };
        let live = self.store.count_all_instances().await?;
        if u64::try_from(live).unwrap_or(0) >= limit {
            return Err(BrokerError::InstanceLimitExceeded { limit });
        }
        Ok(())
    }

    /// Kind of the operation the provider reported as finished.
    async fn finished_operation(
        &self,
        provider: &dyn ServiceProvider,
        instance: &ServiceInstanceRecord,
    ) -> std::result::Result<OperationKind, ProviderError> {
        if let Some(kind) = OperationKind::in_flight(instance.status()) {
            return Ok(kind);
        }
        let was_delete = provider.last_operation_was_delete(instance).await?;
        Ok(if was_delete {
            OperationKind::Delete
        } else {
            OperationKind::Create
        })
    }

    async fn apply(
        &self,
        mut instance: ServiceInstanceRecord,
        action: RecordAction,
    ) -> std::result::Result<(), StoreError> {
        match action {
            RecordAction::SoftDelete => self.store.soft_delete_instance(&instance.id).await,
            RecordAction::MarkActive => {
                instance.set_status(InstanceStatus::Active);
                self.store.save_instance(&instance).await
            }
            RecordAction::MarkProvisioning => {
                instance.set_status(InstanceStatus::Provisioning);
                self.store.save_instance(&instance).await
            }
            RecordAction::ReleaseClaim => {
                self.store.release_instance_claim(&instance.id).await?;
                Ok(())
            }
        }
    }
}

fn orphaned(
    resource: &'static str,
    id: &str,
    action: &'static str,
) -> impl FnOnce(StoreError) -> BrokerError {
    let id = id.to_string();
    move |source| BrokerError::Orphaned {
        resource,
        id,
        action,
        source,
    }
}

fn operation_in_progress(instance: &ServiceInstanceRecord) -> BrokerError {
    BrokerError::OperationInProgress {
        instance_id: instance.id.clone(),
        status: instance.status.clone(),
    }
}

#[async_trait]
impl ServiceBroker for Broker {
    async fn services(&self) -> Result<Vec<ServiceDefinition>> {
        Ok(self.registry.services())
    }

    #[instrument(
        skip(self, details),
        fields(
            instance_id = %instance_id,
            service_id = %details.service_id,
            plan_id = %details.plan_id
        )
    )]
    async fn provision(
        &self,
        instance_id: &str,
        details: &ProvisionDetails,
        async_allowed: bool,
    ) -> Result<ProvisionResponse> {
        self.check_instance_limit().await?;

        if self.store.count_instances(instance_id).await? > 0 {
            return Err(BrokerError::InstanceAlreadyExists {
                instance_id: instance_id.to_string(),
            });
        }

        let (plan, provider) = self
            .registry
            .resolve(&details.service_id, &details.plan_id)?;
        let plan = plan.clone();

        let is_async = provider.provisions_async();
        if is_async && !async_allowed {
            return Err(BrokerError::AsyncRequired);
        }
        details.parameters()?;

        let mut record = ServiceInstanceRecord::new(instance_id, &details.service_id, &plan.id);
        record.organization_guid = details.organization_guid.clone();
        record.space_guid = details.space_guid.clone();
        let request = ProvisionRequestRecord::new(instance_id, details)?;

        match self.store.claim_instance(&record, &request).await {
            Ok(_) => debug!("Instance claimed"),
            Err(StoreError::ConstraintViolation(_)) => {
                return Err(BrokerError::InstanceAlreadyExists {
                    instance_id: instance_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let metadata = match provider.provision(instance_id, details, &plan).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, "Provider failed to provision, releasing claim");
                if let Err(release_err) = self.store.release_instance_claim(instance_id).await {
                    error!(error = %release_err, "Failed to release instance claim");
                }
                return Err(e.into());
            }
        };

        record.name = metadata.name;
        record.location = metadata.location;
        record.url = metadata.url;
        record.set_status(if is_async {
            InstanceStatus::Provisioning
        } else {
            InstanceStatus::Active
        });

        let saved = match record.set_details(&metadata.other_details) {
            Ok(()) => self.store.save_instance(&record).await,
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            error!(error = %e, "Instance provisioned but its record could not be saved");
            return Err(orphaned("instance", instance_id, "provision")(e));
        }

        info!(is_async, status = %record.status(), "Instance provisioned");
        Ok(ProvisionResponse {
            is_async,
            dashboard_url: None,
        })
    }

    #[instrument(skip(self, details), fields(instance_id = %instance_id))]
    async fn deprovision(
        &self,
        instance_id: &str,
        details: &DeprovisionDetails,
        async_allowed: bool,
    ) -> Result<DeprovisionResponse> {
        let mut instance = self.live_instance(instance_id).await?;
        match instance.status() {
            InstanceStatus::Deprovisioning => return Err(operation_in_progress(&instance)),
            InstanceStatus::Pending if !self.is_stale(instance.created_at) => {
                return Err(operation_in_progress(&instance));
            }
            InstanceStatus::Pending => warn!("Deprovisioning an abandoned instance claim"),
            InstanceStatus::Provisioning | InstanceStatus::Active => {}
        }

        let provider = self.registry.provider(&instance.service_id)?;
        let is_async = provider.deprovisions_async();
        if is_async && !async_allowed {
            return Err(BrokerError::AsyncRequired);
        }

        provider.deprovision(&instance, details).await?;

        if is_async {
            instance.set_status(InstanceStatus::Deprovisioning);
            self.store
                .save_instance(&instance)
                .await
                .map_err(orphaned("instance", instance_id, "deprovision"))?;
        } else {
            self.store
                .soft_delete_instance(instance_id)
                .await
                .map_err(orphaned("instance", instance_id, "deprovision"))?;
        }

        info!(is_async, "Instance deprovisioned");
        Ok(DeprovisionResponse { is_async })
    }

    #[instrument(
        skip(self, details),
        fields(instance_id = %instance_id, binding_id = %binding_id)
    )]
    async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        details: &BindDetails,
    ) -> Result<BindResponse> {
        if self.store.count_bindings(instance_id, binding_id).await? > 0 {
            return Err(BrokerError::BindingAlreadyExists {
                instance_id: instance_id.to_string(),
                binding_id: binding_id.to_string(),
            });
        }

        if details.app_guid.as_deref().is_none_or(str::is_empty) {
            return Err(BrokerError::AppGuidRequired);
        }

        let instance = self.live_instance(instance_id).await?;
        if instance.status() != InstanceStatus::Active {
            return Err(operation_in_progress(&instance));
        }

        let provider = self.registry.provider(&instance.service_id)?;

        let mut record = ServiceBindingRecord::claim(instance_id, binding_id, &instance.service_id);
        match self.store.create_binding(&record).await {
            Ok(id) => {
                debug!(id, "Binding claimed");
                record.id = id;
            }
            Err(StoreError::ConstraintViolation(_)) => {
                return Err(BrokerError::BindingAlreadyExists {
                    instance_id: instance_id.to_string(),
                    binding_id: binding_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let credentials = match provider.bind(&instance, binding_id, details).await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(error = %e, "Provider failed to bind, releasing claim");
                if let Err(release_err) = self.store.release_binding_claim(record.id).await {
                    error!(error = %release_err, "Failed to release binding claim");
                }
                return Err(e.into());
            }
        };

        let saved = match record.set_credentials(&credentials) {
            Ok(()) => {
                record.set_status(BindingStatus::Active);
                self.store.save_binding(&record).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            error!(error = %e, "Credentials minted but the binding could not be saved");
            return Err(orphaned("binding", binding_id, "bind")(e));
        }

        let credentials = provider.build_instance_credentials(&credentials, &instance)?;
        info!("Binding created");
        Ok(BindResponse { credentials })
    }

    #[instrument(
        skip(self, _details),
        fields(instance_id = %instance_id, binding_id = %binding_id)
    )]
    async fn unbind(
        &self,
        instance_id: &str,
        binding_id: &str,
        _details: &UnbindDetails,
    ) -> Result<()> {
        let instance = self.live_instance(instance_id).await?;

        let binding = match self.store.get_binding(instance_id, binding_id).await {
            Ok(binding) => binding,
            Err(e) if e.is_not_found() => {
                return Err(BrokerError::BindingDoesNotExist {
                    instance_id: instance_id.to_string(),
                    binding_id: binding_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if binding.status() == BindingStatus::Pending {
            if !self.is_stale(binding.created_at) {
                return Err(BrokerError::BindingInProgress {
                    instance_id: instance_id.to_string(),
                    binding_id: binding_id.to_string(),
                });
            }
            // No credentials were recorded, so there is nothing to revoke.
            warn!("Removing an abandoned binding claim");
            self.store
                .soft_delete_binding(instance_id, binding_id)
                .await?;
            return Ok(());
        }

        let provider = self.registry.provider(&instance.service_id)?;
        provider.unbind(&instance, &binding).await?;

        self.store
            .soft_delete_binding(instance_id, binding_id)
            .await
            .map_err(orphaned("binding", binding_id, "unbind"))?;

        info!("Binding removed");
        Ok(())
    }

    #[instrument(skip(self, _details), fields(instance_id = %instance_id))]
    async fn update(
        &self,
        instance_id: &str,
        _details: &UpdateDetails,
        _async_allowed: bool,
    ) -> Result<UpdateResponse> {
        Err(BrokerError::PlanChangeNotSupported)
    }

    #[instrument(skip(self), fields(instance_id = %instance_id))]
    async fn last_operation(&self, instance_id: &str) -> Result<LastOperation> {
        let instance = self.live_instance(instance_id).await?;
        let provider = self.registry.provider(&instance.service_id)?;

        if !provider.provisions_async() && !provider.deprovisions_async() {
            return Err(BrokerError::PollingNotApplicable {
                service_id: instance.service_id.clone(),
            });
        }

        let status = instance.status();
        if status == InstanceStatus::Pending && !self.is_stale(instance.created_at) {
            return Ok(LastOperation::new(OperationState::InProgress, None));
        }

        let outcome = match provider.poll_instance(&instance).await {
            Ok(false) => PollOutcome::Pending,
            Ok(true) => match self.finished_operation(provider.as_ref(), &instance).await {
                Ok(kind) => PollOutcome::Done { kind },
                Err(e) => {
                    error!(
                        error = %e,
                        "Couldn't determine whether the finished operation was a delete"
                    );
                    return Ok(LastOperation::new(
                        OperationState::Succeeded,
                        Some(UNDETERMINED_OPERATION.to_string()),
                    ));
                }
            },
            Err(e) if e.is_transient() => PollOutcome::Transient(e.to_string()),
            Err(e) => PollOutcome::Failed(e.to_string()),
        };

        let transition = next_transition(status, &outcome);
        debug!(state = transition.state.as_str(), action = ?transition.action, "Poll evaluated");

        let Some(action) = transition.action else {
            return Ok(LastOperation::new(transition.state, transition.description));
        };

        if let Err(e) = self.apply(instance, action).await {
            warn!(
                error = %e,
                ?action,
                "Operation finished but the instance record could not be updated"
            );
            let description = match action {
                RecordAction::SoftDelete => format!(
                    "Error deleting instance details from database: {e}. WARNING: this instance \
                     will remain visible; contact your operator for cleanup"
                ),
                RecordAction::MarkActive => format!(
                    "Error marking instance as active: {e}. The next poll will retry the update"
                ),
                RecordAction::MarkProvisioning => format!(
                    "Error marking instance as provisioning: {e}. The next poll will retry the \
                     update"
                ),
                RecordAction::ReleaseClaim => format!(
                    "Error releasing abandoned instance claim: {e}. The next poll will retry"
                ),
            };
            return Ok(LastOperation::new(transition.state, Some(description)));
        }

        info!(?action, "Operation finished");
        Ok(LastOperation::new(transition.state, transition.description))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServicePlan;
    use crate::migrations::Migrator;
    use crate::provider::{MockCall, MockProvider};
    use crate::store::SqliteStore;

    fn plan(id: &str) -> ServicePlan {
        ServicePlan {
            id: id.to_string(),
            name: format!("{id}-name"),
            description: "test plan".to_string(),
            free: true,
            ..Default::default()
        }
    }

    fn service(id: &str) -> ServiceDefinition {
        ServiceDefinition {
            id: id.to_string(),
            name: format!("{id}-name"),
            description: "test service".to_string(),
            bindable: true,
            plans: vec![plan("plan-a")],
            ..Default::default()
        }
    }

    async fn broker_with(provider: Arc<MockProvider>) -> Broker {
        let store = SqliteStore::in_memory().await.unwrap();
        Migrator::broker().run(&store).await.unwrap();
        let registry = ServiceRegistry::builder()
            .register(service("svc"), provider)
            .build()
            .unwrap();
        Broker::new(Arc::new(store), Arc::new(registry))
    }

    fn provision_details() -> ProvisionDetails {
        ProvisionDetails {
            service_id: "svc".to_string(),
            plan_id: "plan-a".to_string(),
            organization_guid: "org".to_string(),
            space_guid: "space".to_string(),
            raw_parameters: None,
        }
    }

    // ========================================================================
    // next_transition
    // ========================================================================

    #[test]
    fn test_abandoned_claim_transitions() {
        let working = next_transition(InstanceStatus::Pending, &PollOutcome::Pending);
        assert_eq!(working.state, OperationState::InProgress);
        assert_eq!(working.action, Some(RecordAction::MarkProvisioning));

        let failed = next_transition(
            InstanceStatus::Pending,
            &PollOutcome::Failed("not found".to_string()),
        );
        assert_eq!(failed.state, OperationState::Failed);
        assert_eq!(failed.action, Some(RecordAction::ReleaseClaim));
        assert_eq!(failed.description.as_deref(), Some("not found"));

        let done = next_transition(
            InstanceStatus::Pending,
            &PollOutcome::Done {
                kind: OperationKind::Create,
            },
        );
        assert_eq!(done.action, Some(RecordAction::MarkActive));

        let flaky = next_transition(
            InstanceStatus::Pending,
            &PollOutcome::Transient("503".to_string()),
        );
        assert_eq!(flaky.action, None);
    }

    #[test]
    fn test_transient_is_in_progress_with_message() {
        let t = next_transition(
            InstanceStatus::Provisioning,
            &PollOutcome::Transient("503".to_string()),
        );
        assert_eq!(t.state, OperationState::InProgress);
        assert_eq!(t.description.as_deref(), Some("503"));
        assert_eq!(t.action, None);
    }

    #[test]
    fn test_failure_leaves_record_alone() {
        let t = next_transition(
            InstanceStatus::Deprovisioning,
            &PollOutcome::Failed("quota".to_string()),
        );
        assert_eq!(t.state, OperationState::Failed);
        assert_eq!(t.action, None);
    }

    #[test]
    fn test_done_transitions() {
        let delete = next_transition(
            InstanceStatus::Deprovisioning,
            &PollOutcome::Done {
                kind: OperationKind::Delete,
            },
        );
        assert_eq!(delete.state, OperationState::Succeeded);
        assert_eq!(delete.action, Some(RecordAction::SoftDelete));

        let create = next_transition(
            InstanceStatus::Provisioning,
            &PollOutcome::Done {
                kind: OperationKind::Create,
            },
        );
        assert_eq!(create.action, Some(RecordAction::MarkActive));

        let already_active = next_transition(
            InstanceStatus::Active,
            &PollOutcome::Done {
                kind: OperationKind::Create,
            },
        );
        assert_eq!(already_active.state, OperationState::Succeeded);
        assert_eq!(already_active.action, None);
    }

    #[test]
    fn test_in_flight_kind_follows_status() {
        assert_eq!(
            OperationKind::in_flight(InstanceStatus::Provisioning),
            Some(OperationKind::Create)
        );
        assert_eq!(
            OperationKind::in_flight(InstanceStatus::Deprovisioning),
            Some(OperationKind::Delete)
        );
        assert_eq!(
            OperationKind::in_flight(InstanceStatus::Pending),
            Some(OperationKind::Create)
        );
        assert_eq!(OperationKind::in_flight(InstanceStatus::Active), None);
    }

    // ========================================================================
    // Broker
    // ========================================================================

    #[tokio::test]
    async fn test_failed_provision_releases_claim() {
        let provider = Arc::new(MockProvider::new());
        provider
            .fail_next(
                MockCall::Provision,
                ProviderError::Backend {
                    code: 400,
                    message: "bad region".to_string(),
                },
            )
            .await;
        let broker = broker_with(provider.clone()).await;

        let err = broker
            .provision("i1", &provision_details(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Provider(ProviderError::Backend { code: 400, .. })));
        assert_eq!(broker.store().count_instances("i1").await.unwrap(), 0);

        // The ID is free again.
        let response = broker.provision("i1", &provision_details(), true).await.unwrap();
        assert_eq!(response.status(), ResponseStatus::Created);
    }

    #[tokio::test]
    async fn test_provision_records_request_and_metadata() {
        let broker = broker_with(Arc::new(MockProvider::new())).await;
        let mut details = provision_details();
        details.raw_parameters = Some(serde_json::json!({"size": "small"}));

        broker.provision("i1", &details, false).await.unwrap();

        let instance = broker.store().get_instance("i1").await.unwrap();
        assert_eq!(instance.status(), InstanceStatus::Active);
        assert_eq!(instance.name, "mock-i1");
        assert_eq!(instance.organization_guid, "org");
        assert_eq!(instance.details().unwrap()["size"], "small");

        let requests = broker.store().list_provision_requests("i1").await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].request_details.contains("\"size\":\"small\""));
    }

    #[tokio::test]
    async fn test_non_object_parameters_rejected_before_claim() {
        let provider = Arc::new(MockProvider::new());
        let broker = broker_with(provider.clone()).await;
        let mut details = provision_details();
        details.raw_parameters = Some(serde_json::json!(["a", "b"]));

        let err = broker.provision("i1", &details, true).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidParameters(_)));
        assert_eq!(provider.call_count("provision").await, 0);
        assert_eq!(broker.store().count_instances("i1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bind_requires_app_guid() {
        let provider = Arc::new(MockProvider::new());
        let broker = broker_with(provider.clone()).await;
        broker.provision("i1", &provision_details(), true).await.unwrap();

        let err = broker
            .bind("i1", "b1", &BindDetails::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::AppGuidRequired));
        assert_eq!(provider.call_count("bind").await, 0);
    }

    #[tokio::test]
    async fn test_bind_waits_for_async_provision() {
        let provider = Arc::new(MockProvider::asynchronous());
        let broker = broker_with(provider.clone()).await;
        broker.provision("i1", &provision_details(), true).await.unwrap();

        let details = BindDetails {
            app_guid: Some("app".to_string()),
            ..Default::default()
        };
        let err = broker.bind("i1", "b1", &details).await.unwrap_err();
        assert!(matches!(err, BrokerError::OperationInProgress { .. }));

        let op = broker.last_operation("i1").await.unwrap();
        assert_eq!(op.state, OperationState::Succeeded);
        assert!(broker.bind("i1", "b1", &details).await.is_ok());
    }

    #[tokio::test]
    async fn test_undetermined_operation_still_succeeds() {
        let provider = Arc::new(MockProvider::asynchronous());
        let broker = broker_with(provider.clone()).await;

        // A row written before statuses existed reads as active.
        let mut record = ServiceInstanceRecord::new("i1", "svc", "plan-a");
        record.set_status(InstanceStatus::Active);
        broker.store().create_instance(&record).await.unwrap();

        let op = broker.last_operation("i1").await.unwrap();
        assert_eq!(op.state, OperationState::Succeeded);
        assert_eq!(op.description.as_deref(), Some(UNDETERMINED_OPERATION));
        assert_eq!(broker.store().count_instances("i1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_bind_releases_claim() {
        let provider = Arc::new(MockProvider::new());
        let broker = broker_with(provider.clone()).await;
        broker.provision("i1", &provision_details(), true).await.unwrap();
        provider
            .fail_next(
                MockCall::Bind,
                ProviderError::Backend {
                    code: 500,
                    message: "iam down".to_string(),
                },
            )
            .await;

        let details = BindDetails {
            app_guid: Some("app".to_string()),
            ..Default::default()
        };
        let err = broker.bind("i1", "b1", &details).await.unwrap_err();
        assert!(matches!(err, BrokerError::Provider(_)));
        assert_eq!(broker.store().count_bindings("i1", "b1").await.unwrap(), 0);

        broker.bind("i1", "b1", &details).await.unwrap();
        let stored = broker.store().get_binding("i1", "b1").await.unwrap();
        assert_eq!(stored.status(), BindingStatus::Active);
    }

    #[tokio::test]
    async fn test_claim_staleness_follows_timeout() {
        let broker = broker_with(Arc::new(MockProvider::new())).await;
        let fresh = Utc::now();
        let old = fresh - chrono::Duration::minutes(11);
        assert!(!broker.is_stale(fresh));
        assert!(broker.is_stale(old));

        let patient = broker.with_claim_timeout(Duration::from_secs(3600));
        assert!(!patient.is_stale(old));
    }

    #[tokio::test]
    async fn test_update_is_not_supported() {
        let broker = broker_with(Arc::new(MockProvider::new())).await;
        let err = broker
            .update("i1", &UpdateDetails::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PlanChangeNotSupported));
    }
}
