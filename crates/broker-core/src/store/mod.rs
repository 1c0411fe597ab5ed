// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record store for broker-core.
//!
//! The store owns the schema and every write. Callers only see the typed
//! operations on [`Store`]; no SQL leaves this module.
//!
//! Rows are never physically removed by the broker. Deleting an instance or
//! binding stamps `deleted_at`, which hides the row from `count_*` and
//! `get_*` while keeping it reachable through the `*_including_deleted`
//! queries for audit. The single exception is
//! [`Store::release_instance_claim`], which drops a row that never left the
//! `pending` status because its backend create failed.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::details::Details;
use crate::migrations::{MigrationError, Migrator};

/// Persisted state of a service instance row.
///
/// The live states map one to one onto the stored `status` column. A
/// soft-deleted row is the `deleted` state; it has no status of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Claimed by a provision whose backend call has not returned yet.
    Pending,
    /// Backend create accepted, completion must be confirmed by polling.
    Provisioning,
    /// Usable.
    Active,
    /// Backend delete accepted, completion must be confirmed by polling.
    Deprovisioning,
}

impl InstanceStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Deprovisioning => "deprovisioning",
        }
    }

    /// Parse a status from a string.
    ///
    /// Unknown values read as `Active`, which is also the column default for
    /// rows written before the status column existed.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "provisioning" => Self::Provisioning,
            "deprovisioning" => Self::Deprovisioning,
            _ => Self::Active,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted state of a live binding row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStatus {
    /// Claimed by a bind whose backend call has not returned yet.
    Pending,
    /// Credentials minted and stored.
    Active,
}

impl BindingStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
        }
    }

    /// Parse a status from a string. Unknown values read as `Active`.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            _ => Self::Active,
        }
    }
}

/// Service instance row (`service_instance_details`).
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ServiceInstanceRecord {
    /// Caller-supplied instance ID.
    pub id: String,
    /// Backend display name.
    pub name: String,
    /// Backend location or region.
    pub location: String,
    /// Backend URL, if the resource has one.
    pub url: String,
    /// Provider metadata, serialized as a JSON object.
    pub other_details: String,
    /// Service the instance was provisioned from. Never changes.
    pub service_id: String,
    /// Current plan.
    pub plan_id: String,
    /// Owning space.
    pub space_guid: String,
    /// Owning organization.
    pub organization_guid: String,
    /// Stored [`InstanceStatus`].
    pub status: String,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last saved.
    pub updated_at: DateTime<Utc>,
    /// When the row was soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ServiceInstanceRecord {
    /// A fresh `pending` row with empty backend metadata.
    pub fn new(
        id: impl Into<String>,
        service_id: impl Into<String>,
        plan_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: String::new(),
            location: String::new(),
            url: String::new(),
            other_details: "{}".to_string(),
            service_id: service_id.into(),
            plan_id: plan_id.into(),
            space_guid: String::new(),
            organization_guid: String::new(),
            status: InstanceStatus::Pending.as_str().to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Parsed status of the row.
    pub fn status(&self) -> InstanceStatus {
        InstanceStatus::parse(&self.status)
    }

    /// Replace the stored status.
    pub fn set_status(&mut self, status: InstanceStatus) {
        self.status = status.as_str().to_string();
    }

    /// Parsed provider metadata. An empty column reads as an empty map.
    pub fn details(&self) -> Result<Details, StoreError> {
        parse_details("other_details", &self.other_details)
    }

    /// Replace the provider metadata.
    pub fn set_details(&mut self, details: &Details) -> Result<(), StoreError> {
        self.other_details = serialize_details("other_details", details)?;
        Ok(())
    }
}

/// Binding row (`service_binding_credentials`).
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ServiceBindingRecord {
    /// Database primary key.
    pub id: i64,
    /// Owning instance.
    pub service_instance_id: String,
    /// Caller-supplied binding ID, unique per live instance.
    pub binding_id: String,
    /// Service of the owning instance.
    pub service_id: String,
    /// Credentials minted for the binding, serialized as a JSON object.
    pub other_details: String,
    /// Stored [`BindingStatus`].
    pub status: String,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last saved.
    pub updated_at: DateTime<Utc>,
    /// When the row was soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ServiceBindingRecord {
    /// A new, unsaved `active` binding row holding `credentials`.
    pub fn new(
        instance_id: impl Into<String>,
        binding_id: impl Into<String>,
        service_id: impl Into<String>,
        credentials: &Details,
    ) -> Result<Self, StoreError> {
        let mut record = Self::claim(instance_id, binding_id, service_id);
        record.set_credentials(credentials)?;
        record.set_status(BindingStatus::Active);
        Ok(record)
    }

    /// A new, unsaved `pending` binding row without credentials.
    pub fn claim(
        instance_id: impl Into<String>,
        binding_id: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            service_instance_id: instance_id.into(),
            binding_id: binding_id.into(),
            service_id: service_id.into(),
            other_details: "{}".to_string(),
            status: BindingStatus::Pending.as_str().to_string(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Parsed status of the row.
    pub fn status(&self) -> BindingStatus {
        BindingStatus::parse(&self.status)
    }

    /// Replace the stored status.
    pub fn set_status(&mut self, status: BindingStatus) {
        self.status = status.as_str().to_string();
    }

    /// Replace the stored credentials.
    pub fn set_credentials(&mut self, credentials: &Details) -> Result<(), StoreError> {
        self.other_details = serialize_details("other_details", credentials)?;
        Ok(())
    }

    /// Parsed credentials.
    pub fn credentials(&self) -> Result<Details, StoreError> {
        parse_details("other_details", &self.other_details)
    }
}

/// Append-only copy of a provision request (`provision_request_details`).
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProvisionRequestRecord {
    /// Database primary key.
    pub id: i64,
    /// Instance the request was made for.
    pub service_instance_id: String,
    /// The request as received, serialized as JSON.
    pub request_details: String,
    /// When the request was recorded.
    pub created_at: DateTime<Utc>,
}

impl ProvisionRequestRecord {
    /// A new, unsaved request row holding `request` as JSON.
    pub fn new<T: Serialize + ?Sized>(
        instance_id: impl Into<String>,
        request: &T,
    ) -> Result<Self, StoreError> {
        let request_details =
            serde_json::to_string(request).map_err(|source| StoreError::Json {
                field: "request_details",
                source,
            })?;
        Ok(Self {
            id: 0,
            service_instance_id: instance_id.into(),
            request_details,
            created_at: Utc::now(),
        })
    }
}

/// Historical plan definition (`plan_details`).
///
/// Plans used to be stored in the database. Those rows are only read now, to
/// recover the IDs of legacy plans that instances may still reference.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct LegacyPlanRecord {
    /// Plan ID.
    pub id: String,
    /// Service the plan belonged to.
    pub service_id: String,
    /// Plan name.
    pub name: String,
    /// Plan features, serialized as JSON.
    pub features: String,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row was last saved.
    pub updated_at: DateTime<Utc>,
    /// When the row was soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl LegacyPlanRecord {
    /// A new, unsaved plan row.
    pub fn new(
        id: impl Into<String>,
        service_id: impl Into<String>,
        name: impl Into<String>,
        features: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            service_id: service_id.into(),
            name: name.into(),
            features: features.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No live row matched the key.
    #[error("{entity} {key} not found")]
    NotFound {
        /// Record kind.
        entity: &'static str,
        /// Key that was looked up.
        key: String,
    },

    /// A unique constraint rejected the write.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The database reported an error.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// A JSON column could not be read or written.
    #[error("malformed {field}: {source}")]
    Json {
        /// Column name.
        field: &'static str,
        /// Underlying error.
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Returns true for [`StoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err
            && db_err.is_unique_violation()
        {
            return Self::ConstraintViolation(db_err.message().to_string());
        }
        Self::Database(err)
    }
}

fn parse_details(field: &'static str, raw: &str) -> Result<Details, StoreError> {
    if raw.trim().is_empty() {
        return Ok(Details::new());
    }
    serde_json::from_str(raw).map_err(|source| StoreError::Json { field, source })
}

fn serialize_details(field: &'static str, details: &Details) -> Result<String, StoreError> {
    serde_json::to_string(details).map_err(|source| StoreError::Json { field, source })
}

/// Typed persistence operations used by the broker.
///
/// `count_*` and `get_*` only see live rows. `create_*` fails with
/// [`StoreError::ConstraintViolation`] when a unique key is taken, and
/// `soft_delete_*` fails with [`StoreError::NotFound`] when no live row
/// matches.
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Number of live instances with this ID (0 or 1).
    async fn count_instances(&self, instance_id: &str) -> Result<i64, StoreError>;

    /// Number of live instances.
    async fn count_all_instances(&self) -> Result<i64, StoreError>;

    /// Insert an instance row.
    async fn create_instance(&self, record: &ServiceInstanceRecord) -> Result<(), StoreError>;

    /// Insert an instance row together with the request that created it,
    /// atomically. Returns the ID of the request row.
    async fn claim_instance(
        &self,
        record: &ServiceInstanceRecord,
        request: &ProvisionRequestRecord,
    ) -> Result<i64, StoreError>;

    /// Overwrite every mutable column of a live instance row.
    async fn save_instance(&self, record: &ServiceInstanceRecord) -> Result<(), StoreError>;

    /// Fetch a live instance.
    async fn get_instance(&self, instance_id: &str) -> Result<ServiceInstanceRecord, StoreError>;

    /// Fetch an instance whether or not it was soft-deleted.
    async fn get_instance_including_deleted(
        &self,
        instance_id: &str,
    ) -> Result<ServiceInstanceRecord, StoreError>;

    /// Mark a live instance deleted.
    async fn soft_delete_instance(&self, instance_id: &str) -> Result<(), StoreError>;

    /// True if the instance exists and has been soft-deleted.
    async fn is_instance_soft_deleted(&self, instance_id: &str) -> Result<bool, StoreError>;

    /// Physically remove an instance row that is still `pending`.
    ///
    /// Returns false if there was nothing to release. Provision requests are
    /// history and stay.
    async fn release_instance_claim(&self, instance_id: &str) -> Result<bool, StoreError>;

    // ------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------

    /// Number of live bindings for the pair (0 or 1).
    async fn count_bindings(&self, instance_id: &str, binding_id: &str)
    -> Result<i64, StoreError>;

    /// Insert a binding row, returning its generated ID.
    ///
    /// Inserting a `pending` row claims the pair: the partial unique index on
    /// live pairs rejects a second claim with a constraint violation.
    async fn create_binding(&self, record: &ServiceBindingRecord) -> Result<i64, StoreError>;

    /// Overwrite the credentials and status of a live binding row, by ID.
    async fn save_binding(&self, record: &ServiceBindingRecord) -> Result<(), StoreError>;

    /// Physically remove a binding row that is still `pending`, by ID.
    ///
    /// Returns false if there was nothing to release.
    async fn release_binding_claim(&self, id: i64) -> Result<bool, StoreError>;

    /// Fetch a live binding.
    async fn get_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<ServiceBindingRecord, StoreError>;

    /// Fetch the newest binding row for the pair, deleted or not.
    async fn get_binding_including_deleted(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<ServiceBindingRecord, StoreError>;

    /// Mark a live binding deleted.
    async fn soft_delete_binding(&self, instance_id: &str, binding_id: &str)
    -> Result<(), StoreError>;

    /// True if the pair has rows and none of them is live.
    async fn is_binding_soft_deleted(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<bool, StoreError>;

    // ------------------------------------------------------------------
    // Provision requests and historical plans
    // ------------------------------------------------------------------

    /// Append a provision request, returning its generated ID.
    async fn create_provision_request(
        &self,
        request: &ProvisionRequestRecord,
    ) -> Result<i64, StoreError>;

    /// All provision requests recorded for an instance, oldest first.
    async fn list_provision_requests(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ProvisionRequestRecord>, StoreError>;

    /// Insert a historical plan row.
    async fn create_legacy_plan(&self, plan: &LegacyPlanRecord) -> Result<(), StoreError>;

    /// Look up a historical plan by service and plan name.
    async fn get_legacy_plan(
        &self,
        service_id: &str,
        name: &str,
    ) -> Result<LegacyPlanRecord, StoreError>;

    /// Round-trip a trivial query.
    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Connect to `database_url`, bring the schema up to date and return the store.
///
/// `sqlite:` URLs get a [`SqliteStore`], `postgres://` and `postgresql://`
/// URLs a [`PostgresStore`].
pub async fn open(
    database_url: &str,
    max_connections: u32,
) -> Result<Arc<dyn Store>, MigrationError> {
    let migrator = Migrator::broker();

    if database_url.starts_with("sqlite:") {
        let store = SqliteStore::connect(database_url, max_connections).await?;
        let applied = migrator.run(&store).await?;
        info!(backend = "sqlite", applied, "Record store ready");
        Ok(Arc::new(store))
    } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")
    {
        let store = PostgresStore::connect(database_url, max_connections).await?;
        let applied = migrator.run(&store).await?;
        info!(backend = "postgres", applied, "Record store ready");
        Ok(Arc::new(store))
    } else {
        Err(MigrationError::UnsupportedUrl(
            database_url.split(':').next().unwrap_or_default().to_string(),
        ))
    }
}
