// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::migrations::{Dialect, Migration, MigrationTarget};

use super::{
    LegacyPlanRecord, ProvisionRequestRecord, ServiceBindingRecord, ServiceInstanceRecord, Store,
    StoreError,
};

/// PostgreSQL-backed record store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store from an existing pool. The schema is not touched.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a pool of `max_connections`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn count_instances(&self, instance_id: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM service_instance_details
            WHERE id = $1 AND deleted_at IS NULL
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
            SET name = $1, location = $2, url = $3, other_details = $4, plan_id = $5,
                space_guid = $6, organization_guid = $7, status = $8, updated_at = $9
            WHERE id = $10 AND deleted_at IS NULL
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
            WHERE id = $1 AND deleted_at IS NULL
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
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("instance", instance_id))
    }

    async fn soft_delete_instance(&self, instance_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE service_instance_details
            SET deleted_at = $1, updated_at = $1
            WHERE id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(Utc::now())
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
            sqlx::query_scalar("SELECT deleted_at FROM service_instance_details WHERE id = $1")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(matches!(deleted_at, Some(Some(_))))
    }

    async fn release_instance_claim(&self, instance_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM service_instance_details
            WHERE id = $1 AND status = 'pending' AND deleted_at IS NULL
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
            WHERE service_instance_id = $1 AND binding_id = $2 AND deleted_at IS NULL
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
            VALUES ($1, $2, $3, $4, $5, $6, $7)
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
            SET other_details = $1, status = $2, updated_at = $3
            WHERE id = $4 AND deleted_at IS NULL
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
            WHERE id = $1 AND status = 'pending' AND deleted_at IS NULL
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
            WHERE service_instance_id = $1 AND binding_id = $2 AND deleted_at IS NULL
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
            WHERE service_instance_id = $1 AND binding_id = $2
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
        let result = sqlx::query(
            r#"
            UPDATE service_binding_credentials
            SET deleted_at = $1, updated_at = $1
            WHERE service_instance_id = $2 AND binding_id = $3 AND deleted_at IS NULL
            "#,
        )
        .bind(Utc::now())
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
            WHERE service_instance_id = $1 AND binding_id = $2
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
            WHERE service_instance_id = $1
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
            VALUES ($1, $2, $3, $4, $5, $6)
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
            WHERE service_id = $1 AND name = $2 AND deleted_at IS NULL
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
        let _: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MigrationTarget for PostgresStore {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn last_applied_migration(&self) -> Result<Option<i64>, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = 'migrations'
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        if !exists {
            return Ok(None);
        }

        let last: Option<i64> = sqlx::query_scalar("SELECT MAX(migration_id) FROM migrations")
            .fetch_one(&self.pool)
            .await?;

        Ok(last)
    }

    async fn apply_migration(&self, migration: &Migration) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(migration.sql(Dialect::Postgres)))
            .await?;

        sqlx::query("INSERT INTO migrations (created_at, migration_id) VALUES ($1, $2)")
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
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO service_instance_details
            (id, created_at, updated_at, name, location, url, other_details,
             service_id, plan_id, space_guid, organization_guid, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
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
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO provision_request_details (created_at, service_instance_id, request_details)
        VALUES ($1, $2, $3)
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
