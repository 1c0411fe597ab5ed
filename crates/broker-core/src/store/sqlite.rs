// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed record store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::migrations::{Dialect, Migration, MigrationTarget};

use super::{
    LegacyPlanRecord, ProvisionRequestRecord, ServiceBindingRecord, ServiceInstanceRecord, Store,
    StoreError,
};

/// SQLite-backed record store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing pool. The schema is not touched.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`, creating the database file if needed.
    ///
    /// In-memory databases are private to a connection, so they always get
    /// a single connection that is never recycled.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await?
        };

        Ok(Self { pool })
    }

    /// Private in-memory database, mostly for tests and embedded use.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn count_instances(&self, instance_id: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM service_instance_details
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn count_all_instances(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM service_instance_details WHERE deleted_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn create_instance(&self, record: &ServiceInstanceRecord) -> Result<(), StoreError> {
        insert_instance(&self.pool, record).await
    }

    async fn claim_instance(
        &self,
        record: &ServiceInstanceRecord,
        request: &ProvisionRequestRecord,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        insert_instance(&mut *tx, record).await?;
        let request_id = insert_provision_request(&mut *tx, request).await?;

        tx.commit().await?;
        Ok(request_id)
    }

    async fn save_instance(&self, record: &ServiceInstanceRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE service_instance_details
            SET name = ?, location = ?, url = ?, other_details = ?, plan_id = ?,
                space_guid = ?, organization_guid = ?, status = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(&record.name)
        .bind(&record.location)
        .bind(&record.url)
        .bind(&record.other_details)
        .bind(&record.plan_id)
        .bind(&record.space_guid)
        .bind(&record.organization_guid)
        .bind(&record.status)
        .bind(Utc::now())
        .bind(&record.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("instance", &record.id));
        }
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<ServiceInstanceRecord, StoreError> {
        sqlx::query_as::<_, ServiceInstanceRecord>(
            r#"
            SELECT id, name, location, url, other_details, service_id, plan_id,
                   space_guid, organization_guid, status, created_at, updated_at, deleted_at
            FROM service_instance_details
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("instance", instance_id))
    }

    async fn get_instance_including_deleted(
        &self,
        instance_id: &str,
    ) -> Result<ServiceInstanceRecord, StoreError> {
        sqlx::query_as::<_, ServiceInstanceRecord>(
            r#"
            SELECT id, name, location, url, other_details, service_id, plan_id,
                   space_guid, organization_guid, status, created_at, updated_at, deleted_at
            FROM service_instance_details
            WHERE id = ?
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("instance", instance_id))
    }

    async fn soft_delete_instance(&self, instance_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE service_instance_details
            SET deleted_at = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("instance", instance_id));
        }
        Ok(())
    }

    async fn is_instance_soft_deleted(&self, instance_id: &str) -> Result<bool, StoreError> {
        let deleted_at: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT deleted_at FROM service_instance_details WHERE id = ?")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(matches!(deleted_at, Some(Some(_))))
    }

    async fn release_instance_claim(&self, instance_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM service_instance_details
            WHERE id = ? AND status = 'pending' AND deleted_at IS NULL
            "#,
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_bindings(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM service_binding_credentials
            WHERE service_instance_id = ? AND binding_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(instance_id)
        .bind(binding_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn create_binding(&self, record: &ServiceBindingRecord) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO service_binding_credentials
                (created_at, updated_at, other_details, status, service_id,
                 service_instance_id, binding_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(&record.other_details)
        .bind(&record.status)
        .bind(&record.service_id)
        .bind(&record.service_instance_id)
        .bind(&record.binding_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn save_binding(&self, record: &ServiceBindingRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE service_binding_credentials
            SET other_details = ?, status = ?, updated_at = ?
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(&record.other_details)
        .bind(&record.status)
        .bind(Utc::now())
        .bind(record.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("binding", record.id.to_string()));
        }
        Ok(())
    }

    async fn release_binding_claim(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM service_binding_credentials
            WHERE id = ? AND status = 'pending' AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<ServiceBindingRecord, StoreError> {
        sqlx::query_as::<_, ServiceBindingRecord>(
            r#"
            SELECT id, service_instance_id, binding_id, service_id, other_details, status,
                   created_at, updated_at, deleted_at
            FROM service_binding_credentials
            WHERE service_instance_id = ? AND binding_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(instance_id)
        .bind(binding_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("binding", format!("{instance_id}/{binding_id}")))
    }

    async fn get_binding_including_deleted(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<ServiceBindingRecord, StoreError> {
        sqlx::query_as::<_, ServiceBindingRecord>(
            r#"
            SELECT id, service_instance_id, binding_id, service_id, other_details, status,
                   created_at, updated_at, deleted_at
            FROM service_binding_credentials
            WHERE service_instance_id = ? AND binding_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(instance_id)
        .bind(binding_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("binding", format!("{instance_id}/{binding_id}")))
    }

    async fn soft_delete_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE service_binding_credentials
            SET deleted_at = ?, updated_at = ?
            WHERE service_instance_id = ? AND binding_id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(instance_id)
        .bind(binding_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(
                "binding",
                format!("{instance_id}/{binding_id}"),
            ));
        }
        Ok(())
    }

    async fn is_binding_soft_deleted(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<bool, StoreError> {
        let (total, deleted): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*), COUNT(deleted_at) FROM service_binding_credentials
            WHERE service_instance_id = ? AND binding_id = ?
            "#,
        )
        .bind(instance_id)
        .bind(binding_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(total > 0 && total == deleted)
    }

    async fn create_provision_request(
        &self,
        request: &ProvisionRequestRecord,
    ) -> Result<i64, StoreError> {
        insert_provision_request(&self.pool, request).await
    }

    async fn list_provision_requests(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ProvisionRequestRecord>, StoreError> {
        let requests = sqlx::query_as::<_, ProvisionRequestRecord>(
            r#"
            SELECT id, service_instance_id, request_details, created_at
            FROM provision_request_details
            WHERE service_instance_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(requests)
    }

    async fn create_legacy_plan(&self, plan: &LegacyPlanRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO plan_details (id, created_at, updated_at, service_id, name, features)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&plan.id)
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .bind(&plan.service_id)
        .bind(&plan.name)
        .bind(&plan.features)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_legacy_plan(
        &self,
        service_id: &str,
        name: &str,
    ) -> Result<LegacyPlanRecord, StoreError> {
        sqlx::query_as::<_, LegacyPlanRecord>(
            r#"
            SELECT id, service_id, name, features, created_at, updated_at, deleted_at
            FROM plan_details
            WHERE service_id = ? AND name = ? AND deleted_at IS NULL
            LIMIT 1
            "#,
        )
        .bind(service_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("plan", format!("{service_id}/{name}")))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MigrationTarget for SqliteStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn last_applied_migration(&self) -> Result<Option<i64>, StoreError> {
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'migrations'",
        )
        .fetch_one(&self.pool)
        .await?;

        if tables == 0 {
            return Ok(None);
        }

        let last: Option<i64> = sqlx::query_scalar("SELECT MAX(migration_id) FROM migrations")
            .fetch_one(&self.pool)
            .await?;

        Ok(last)
    }

    async fn apply_migration(&self, migration: &Migration) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(migration.sql(Dialect::Sqlite)))
            .await?;

        sqlx::query("INSERT INTO migrations (created_at, migration_id) VALUES (?, ?)")
            .bind(Utc::now())
            .bind(migration.sequence)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn insert_instance<'e, E>(
    executor: E,
    record: &ServiceInstanceRecord,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO service_instance_details
            (id, created_at, updated_at, name, location, url, other_details,
             service_id, plan_id, space_guid, organization_guid, status)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(record.created_at)
    .bind(record.updated_at)
    .bind(&record.name)
    .bind(&record.location)
    .bind(&record.url)
    .bind(&record.other_details)
    .bind(&record.service_id)
    .bind(&record.plan_id)
    .bind(&record.space_guid)
    .bind(&record.organization_guid)
    .bind(&record.status)
    .execute(executor)
    .await?;

    Ok(())
}

async fn insert_provision_request<'e, E>(
    executor: E,
    request: &ProvisionRequestRecord,
) -> Result<i64, StoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO provision_request_details (created_at, service_instance_id, request_details)
        VALUES (?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(request.created_at)
    .bind(&request.service_instance_id)
    .bind(&request.request_details)
    .fetch_one(executor)
    .await?;

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::details::Details;
    use crate::migrations::Migrator;
    use crate::store::{BindingStatus, InstanceStatus};
    use serde_json::json;

    /// Create a migrated in-memory store for testing.
    async fn test_store() -> SqliteStore {
        let store = SqliteStore::in_memory()
            .await
            .expect("Failed to create in-memory SQLite store");

        Migrator::broker()
            .run(&store)
            .await
            .expect("Failed to run migrations");

        store
    }

    fn instance(id: &str) -> ServiceInstanceRecord {
        let mut record = ServiceInstanceRecord::new(id, "svc-a", "plan-a");
        record.set_status(InstanceStatus::Active);
        record
    }

    fn credentials() -> Details {
        let mut creds = Details::new();
        creds.insert("Email".to_string(), json!("b1@example.com"));
        creds
    }

    #[tokio::test]
    async fn test_migrations_are_recorded() {
        let store = test_store().await;

        assert_eq!(
            store.last_applied_migration().await.unwrap(),
            Some(Migrator::broker().latest())
        );
        assert_eq!(Migrator::broker().run(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fresh_database_has_no_ledger() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert_eq!(store.last_applied_migration().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_and_get_instance() {
        let store = test_store().await;
        let mut record = instance("i1");
        record.name = "bucket-i1".to_string();
        record.organization_guid = "org".to_string();

        store.create_instance(&record).await.unwrap();

        let loaded = store.get_instance("i1").await.unwrap();
        assert_eq!(loaded.name, "bucket-i1");
        assert_eq!(loaded.organization_guid, "org");
        assert_eq!(loaded.status(), InstanceStatus::Active);
        assert!(loaded.deleted_at.is_none());
        assert_eq!(store.count_instances("i1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_instance_is_constraint_violation() {
        let store = test_store().await;
        store.create_instance(&instance("i1")).await.unwrap();

        let err = store.create_instance(&instance("i1")).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_get_missing_instance_is_not_found() {
        let store = test_store().await;
        let err = store.get_instance("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.is_instance_soft_deleted("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_soft_delete_hides_instance() {
        let store = test_store().await;
        store.create_instance(&instance("i1")).await.unwrap();

        store.soft_delete_instance("i1").await.unwrap();

        assert_eq!(store.count_instances("i1").await.unwrap(), 0);
        assert_eq!(store.count_all_instances().await.unwrap(), 0);
        assert!(store.get_instance("i1").await.unwrap_err().is_not_found());
        assert!(store.is_instance_soft_deleted("i1").await.unwrap());

        let audit = store.get_instance_including_deleted("i1").await.unwrap();
        assert!(audit.deleted_at.is_some());

        let again = store.soft_delete_instance("i1").await.unwrap_err();
        assert!(again.is_not_found());
    }

    #[tokio::test]
    async fn test_save_instance_updates_mutable_columns() {
        let store = test_store().await;
        store.create_instance(&instance("i1")).await.unwrap();

        let mut record = store.get_instance("i1").await.unwrap();
        let mut details = Details::new();
        details.insert("bucket_name".to_string(), json!("b"));
        record.set_details(&details).unwrap();
        record.plan_id = "plan-b".to_string();
        record.service_id = "ignored".to_string();
        record.set_status(InstanceStatus::Deprovisioning);
        store.save_instance(&record).await.unwrap();

        let loaded = store.get_instance("i1").await.unwrap();
        assert_eq!(loaded.plan_id, "plan-b");
        assert_eq!(loaded.service_id, "svc-a");
        assert_eq!(loaded.status(), InstanceStatus::Deprovisioning);
        assert_eq!(loaded.details().unwrap(), details);
    }

    #[tokio::test]
    async fn test_save_missing_instance_is_not_found() {
        let store = test_store().await;
        let err = store.save_instance(&instance("ghost")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_claim_and_release() {
        let store = test_store().await;
        let record = ServiceInstanceRecord::new("i1", "svc-a", "plan-a");
        let request = ProvisionRequestRecord::new("i1", &json!({"plan_id": "plan-a"})).unwrap();

        let request_id = store.claim_instance(&record, &request).await.unwrap();
        assert!(request_id > 0);
        assert_eq!(
            store.get_instance("i1").await.unwrap().status(),
            InstanceStatus::Pending
        );

        let dup = store.claim_instance(&record, &request).await.unwrap_err();
        assert!(matches!(dup, StoreError::ConstraintViolation(_)));
        // the rejected claim left no request row behind
        assert_eq!(store.list_provision_requests("i1").await.unwrap().len(), 1);

        assert!(store.release_instance_claim("i1").await.unwrap());
        assert_eq!(store.count_instances("i1").await.unwrap(), 0);
        assert_eq!(store.list_provision_requests("i1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_release_ignores_non_pending() {
        let store = test_store().await;
        store.create_instance(&instance("i1")).await.unwrap();

        assert!(!store.release_instance_claim("i1").await.unwrap());
        assert_eq!(store.count_instances("i1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_binding_lifecycle() {
        let store = test_store().await;
        store.create_instance(&instance("i1")).await.unwrap();

        let record = ServiceBindingRecord::new("i1", "b1", "svc-a", &credentials()).unwrap();
        let id = store.create_binding(&record).await.unwrap();
        assert!(id > 0);
        assert_eq!(store.count_bindings("i1", "b1").await.unwrap(), 1);
        assert_eq!(store.count_bindings("i1", "b2").await.unwrap(), 0);

        let loaded = store.get_binding("i1", "b1").await.unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.credentials().unwrap(), credentials());
        assert!(!store.is_binding_soft_deleted("i1", "b1").await.unwrap());

        store.soft_delete_binding("i1", "b1").await.unwrap();
        assert_eq!(store.count_bindings("i1", "b1").await.unwrap(), 0);
        assert!(store.get_binding("i1", "b1").await.unwrap_err().is_not_found());
        assert!(store.is_binding_soft_deleted("i1", "b1").await.unwrap());
        assert!(
            store
                .get_binding_including_deleted("i1", "b1")
                .await
                .unwrap()
                .deleted_at
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_duplicate_live_binding_is_constraint_violation() {
        let store = test_store().await;
        let record = ServiceBindingRecord::new("i1", "b1", "svc-a", &credentials()).unwrap();
        store.create_binding(&record).await.unwrap();

        let err = store.create_binding(&record).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        // a deleted binding frees the pair
        store.soft_delete_binding("i1", "b1").await.unwrap();
        store.create_binding(&record).await.unwrap();
        assert!(!store.is_binding_soft_deleted("i1", "b1").await.unwrap());
    }

    #[tokio::test]
    async fn test_binding_claim_is_completed_or_released() {
        let store = test_store().await;

        let mut claim = ServiceBindingRecord::claim("i1", "b1", "svc-a");
        claim.id = store.create_binding(&claim).await.unwrap();
        let loaded = store.get_binding("i1", "b1").await.unwrap();
        assert_eq!(loaded.status(), BindingStatus::Pending);
        assert!(loaded.credentials().unwrap().is_empty());

        claim.set_credentials(&credentials()).unwrap();
        claim.set_status(BindingStatus::Active);
        store.save_binding(&claim).await.unwrap();
        let loaded = store.get_binding("i1", "b1").await.unwrap();
        assert_eq!(loaded.status(), BindingStatus::Active);
        assert_eq!(loaded.credentials().unwrap(), credentials());

        // completed claims are not released
        assert!(!store.release_binding_claim(claim.id).await.unwrap());

        let mut other = ServiceBindingRecord::claim("i1", "b2", "svc-a");
        other.id = store.create_binding(&other).await.unwrap();
        assert!(store.release_binding_claim(other.id).await.unwrap());
        assert_eq!(store.count_bindings("i1", "b2").await.unwrap(), 0);
        assert!(!store.is_binding_soft_deleted("i1", "b2").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_deleted_binding_is_not_found() {
        let store = test_store().await;
        let mut record = ServiceBindingRecord::new("i1", "b1", "svc-a", &credentials()).unwrap();
        record.id = store.create_binding(&record).await.unwrap();
        store.soft_delete_binding("i1", "b1").await.unwrap();

        let err = store.save_binding(&record).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_provision_requests_are_append_only_history() {
        let store = test_store().await;
        let first = ProvisionRequestRecord::new("i1", &json!({"n": 1})).unwrap();
        let second = ProvisionRequestRecord::new("i1", &json!({"n": 2})).unwrap();

        store.create_provision_request(&first).await.unwrap();
        store.create_provision_request(&second).await.unwrap();

        let requests = store.list_provision_requests("i1").await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].request_details, r#"{"n":1}"#);
        assert_eq!(requests[1].request_details, r#"{"n":2}"#);
    }

    #[tokio::test]
    async fn test_legacy_plan_lookup() {
        let store = test_store().await;
        store
            .create_legacy_plan(&LegacyPlanRecord::new("old-id", "svc-a", "standard", "{}"))
            .await
            .unwrap();

        let plan = store.get_legacy_plan("svc-a", "standard").await.unwrap();
        assert_eq!(plan.id, "old-id");

        let missing = store.get_legacy_plan("svc-b", "standard").await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = test_store().await;
        store.health_check().await.unwrap();
    }
}
