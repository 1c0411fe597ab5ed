// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for broker-core integration tests.
//!
//! Provides an in-memory store, catalog fixtures, a fault-injecting store
//! wrapper and a base provider backed by a fake IAM service.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use broker_core::broker::Broker;
use broker_core::catalog::{ServiceDefinition, ServicePlan, ServiceRegistry};
use broker_core::credentials::{
    CredentialError, IamClient, Policy, ServiceAccount, ServiceAccountManager, SqlAccountManager,
    SqlAdminClient, SqlFlavor, SqlOperation, SslCert,
};
use broker_core::details::{BindDetails, Details, DeprovisionDetails, ProvisionDetails};
use broker_core::migrations::Migrator;
use broker_core::provider::{
    BaseProvider, InstanceMetadata, MockProvider, ProviderError, ResourceManager,
};
use broker_core::store::{
    LegacyPlanRecord, ProvisionRequestRecord, ServiceBindingRecord, ServiceInstanceRecord,
    SqliteStore, Store, StoreError,
};

pub const SYNC_SERVICE: &str = "sync-service";
pub const SYNC_PLAN: &str = "sync-plan";
pub const ASYNC_SERVICE: &str = "async-service";
pub const ASYNC_PLAN: &str = "async-plan";
pub const IAM_SERVICE: &str = "iam-service";
pub const IAM_PLAN: &str = "iam-plan";
pub const SQL_SERVICE: &str = "sql-service";
pub const SQL_PLAN: &str = "sql-plan";

/// Fresh in-memory SQLite store with the schema applied.
pub async fn test_store() -> Arc<dyn Store> {
    let store = SqliteStore::in_memory()
        .await
        .expect("Failed to open in-memory store");
    Migrator::broker()
        .run(&store)
        .await
        .expect("Failed to run migrations");
    Arc::new(store)
}

pub fn plan(id: &str, name: &str) -> ServicePlan {
    ServicePlan {
        id: id.to_string(),
        name: name.to_string(),
        description: format!("{name} plan"),
        free: true,
        service_properties: BTreeMap::new(),
    }
}

pub fn service(id: &str, name: &str, plans: Vec<ServicePlan>) -> ServiceDefinition {
    ServiceDefinition {
        id: id.to_string(),
        name: name.to_string(),
        description: format!("{name} service"),
        bindable: true,
        plan_updateable: false,
        tags: vec!["test".to_string()],
        plans,
    }
}

pub fn provision_details(service_id: &str, plan_id: &str) -> ProvisionDetails {
    ProvisionDetails {
        service_id: service_id.to_string(),
        plan_id: plan_id.to_string(),
        organization_guid: "org-guid".to_string(),
        space_guid: "space-guid".to_string(),
        raw_parameters: None,
    }
}

pub fn deprovision_details(service_id: &str, plan_id: &str) -> DeprovisionDetails {
    DeprovisionDetails {
        service_id: service_id.to_string(),
        plan_id: plan_id.to_string(),
    }
}

pub fn bind_details(service_id: &str, plan_id: &str) -> BindDetails {
    BindDetails {
        service_id: service_id.to_string(),
        plan_id: plan_id.to_string(),
        app_guid: Some("app-guid".to_string()),
        raw_parameters: None,
    }
}

/// A broker over two mock services: one synchronous, one asynchronous.
pub struct TestContext {
    pub store: Arc<dyn Store>,
    pub sync_provider: Arc<MockProvider>,
    pub async_provider: Arc<MockProvider>,
    pub registry: Arc<ServiceRegistry>,
    pub broker: Broker,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_store(test_store().await, None).await
    }

    pub async fn with_limit(limit: u64) -> Self {
        Self::with_store(test_store().await, Some(limit)).await
    }

    pub async fn with_store(store: Arc<dyn Store>, limit: Option<u64>) -> Self {
        let sync_provider = Arc::new(MockProvider::new());
        let async_provider = Arc::new(MockProvider::asynchronous());

        let registry = ServiceRegistry::builder()
            .register(
                service(SYNC_SERVICE, "sync", vec![plan(SYNC_PLAN, "small")]),
                sync_provider.clone(),
            )
            .register(
                service(ASYNC_SERVICE, "async", vec![plan(ASYNC_PLAN, "large")]),
                async_provider.clone(),
            )
            .build()
            .expect("Failed to build registry");
        let registry = Arc::new(registry);

        let broker = Broker::new(store.clone(), registry.clone()).with_instance_limit(limit);

        Self {
            store,
            sync_provider,
            async_provider,
            registry,
            broker,
        }
    }

    /// Treat `pending` rows older than `timeout` as abandoned.
    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.broker = self.broker.with_claim_timeout(timeout);
        self
    }
}

// ============================================================================
// Fault injection
// ============================================================================

fn injected() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

/// Store wrapper whose writes can be made to fail on demand.
pub struct FailingStore {
    inner: Arc<dyn Store>,
    pub fail_save_instance: AtomicBool,
    pub fail_soft_delete_instance: AtomicBool,
    pub fail_create_binding: AtomicBool,
    pub fail_save_binding: AtomicBool,
    pub fail_soft_delete_binding: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            fail_save_instance: AtomicBool::new(false),
            fail_soft_delete_instance: AtomicBool::new(false),
            fail_create_binding: AtomicBool::new(false),
            fail_save_binding: AtomicBool::new(false),
            fail_soft_delete_binding: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(injected())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn count_instances(&self, instance_id: &str) -> Result<i64, StoreError> {
        self.inner.count_instances(instance_id).await
    }

    async fn count_all_instances(&self) -> Result<i64, StoreError> {
        self.inner.count_all_instances().await
    }

    async fn create_instance(&self, record: &ServiceInstanceRecord) -> Result<(), StoreError> {
        self.inner.create_instance(record).await
    }

    async fn claim_instance(
        &self,
        record: &ServiceInstanceRecord,
        request: &ProvisionRequestRecord,
    ) -> Result<i64, StoreError> {
        self.inner.claim_instance(record, request).await
    }

    async fn save_instance(&self, record: &ServiceInstanceRecord) -> Result<(), StoreError> {
        Self::check(&self.fail_save_instance)?;
        self.inner.save_instance(record).await
    }

    async fn get_instance(&self, instance_id: &str) -> Result<ServiceInstanceRecord, StoreError> {
        self.inner.get_instance(instance_id).await
    }

    async fn get_instance_including_deleted(
        &self,
        instance_id: &str,
    ) -> Result<ServiceInstanceRecord, StoreError> {
        self.inner.get_instance_including_deleted(instance_id).await
    }

    async fn soft_delete_instance(&self, instance_id: &str) -> Result<(), StoreError> {
        Self::check(&self.fail_soft_delete_instance)?;
        self.inner.soft_delete_instance(instance_id).await
    }

    async fn is_instance_soft_deleted(&self, instance_id: &str) -> Result<bool, StoreError> {
        self.inner.is_instance_soft_deleted(instance_id).await
    }

    async fn release_instance_claim(&self, instance_id: &str) -> Result<bool, StoreError> {
        self.inner.release_instance_claim(instance_id).await
    }

    async fn count_bindings(&self, instance_id: &str, binding_id: &str) -> Result<i64, StoreError> {
        self.inner.count_bindings(instance_id, binding_id).await
    }

    async fn create_binding(&self, record: &ServiceBindingRecord) -> Result<i64, StoreError> {
        Self::check(&self.fail_create_binding)?;
        self.inner.create_binding(record).await
    }

    async fn save_binding(&self, record: &ServiceBindingRecord) -> Result<(), StoreError> {
        Self::check(&self.fail_save_binding)?;
        self.inner.save_binding(record).await
    }

    async fn release_binding_claim(&self, id: i64) -> Result<bool, StoreError> {
        self.inner.release_binding_claim(id).await
    }

    async fn get_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<ServiceBindingRecord, StoreError> {
        self.inner.get_binding(instance_id, binding_id).await
    }

    async fn get_binding_including_deleted(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<ServiceBindingRecord, StoreError> {
        self.inner
            .get_binding_including_deleted(instance_id, binding_id)
            .await
    }

    async fn soft_delete_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<(), StoreError> {
        Self::check(&self.fail_soft_delete_binding)?;
        self.inner.soft_delete_binding(instance_id, binding_id).await
    }

    async fn is_binding_soft_deleted(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<bool, StoreError> {
        self.inner
            .is_binding_soft_deleted(instance_id, binding_id)
            .await
    }

    async fn create_provision_request(
        &self,
        request: &ProvisionRequestRecord,
    ) -> Result<i64, StoreError> {
        self.inner.create_provision_request(request).await
    }

    async fn list_provision_requests(
        &self,
        instance_id: &str,
    ) -> Result<Vec<ProvisionRequestRecord>, StoreError> {
        self.inner.list_provision_requests(instance_id).await
    }

    async fn create_legacy_plan(&self, plan: &LegacyPlanRecord) -> Result<(), StoreError> {
        self.inner.create_legacy_plan(plan).await
    }

    async fn get_legacy_plan(
        &self,
        service_id: &str,
        name: &str,
    ) -> Result<LegacyPlanRecord, StoreError> {
        self.inner.get_legacy_plan(service_id, name).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.inner.health_check().await
    }
}

// ============================================================================
// IAM-backed provider
// ============================================================================

#[derive(Default)]
struct FakeIamState {
    policy: Policy,
    accounts: HashMap<String, ServiceAccount>,
    deleted: Vec<String>,
}

/// In-memory IAM service. Policy writes never conflict.
#[derive(Default)]
pub struct FakeIam {
    state: Mutex<FakeIamState>,
}

impl FakeIam {
    /// Members granted `role` (with the `roles/` prefix).
    pub fn members(&self, role: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .policy
            .bindings
            .iter()
            .filter(|b| b.role == role)
            .flat_map(|b| b.members.iter().cloned())
            .collect()
    }

    pub fn live_accounts(&self) -> usize {
        self.state.lock().unwrap().accounts.len()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl IamClient for FakeIam {
    async fn create_service_account(
        &self,
        account_id: &str,
        display_name: &str,
    ) -> Result<ServiceAccount, CredentialError> {
        let account = ServiceAccount {
            name: format!("projects/test-project/serviceAccounts/{account_id}"),
            display_name: display_name.to_string(),
            email: format!("{account_id}@test-project.example.com"),
            unique_id: format!("uid-{account_id}"),
        };
        let mut state = self.state.lock().unwrap();
        if state.accounts.contains_key(&account.unique_id) {
            return Err(CredentialError::Backend {
                code: 409,
                message: format!("account {account_id} already exists"),
            });
        }
        state
            .accounts
            .insert(account.unique_id.clone(), account.clone());
        Ok(account)
    }

    async fn create_key(&self, account: &ServiceAccount) -> Result<String, CredentialError> {
        Ok(format!("key-for-{}", account.unique_id))
    }

    async fn get_policy(&self) -> Result<Policy, CredentialError> {
        Ok(self.state.lock().unwrap().policy.clone())
    }

    async fn set_policy(&self, policy: Policy) -> Result<(), CredentialError> {
        self.state.lock().unwrap().policy = policy;
        Ok(())
    }

    async fn delete_service_account(&self, unique_id: &str) -> Result<(), CredentialError> {
        let mut state = self.state.lock().unwrap();
        if state.accounts.remove(unique_id).is_none() {
            return Err(CredentialError::Backend {
                code: 404,
                message: format!("account {unique_id} not found"),
            });
        }
        state.deleted.push(unique_id.to_string());
        Ok(())
    }
}

/// Buckets named after the instance; deletes always succeed.
pub struct BucketResources;

#[async_trait]
impl ResourceManager for BucketResources {
    async fn create(
        &self,
        instance_id: &str,
        _details: &ProvisionDetails,
        plan: &ServicePlan,
    ) -> Result<InstanceMetadata, ProviderError> {
        let mut other_details = Details::new();
        other_details.insert("bucket_name".to_string(), json!(format!("bucket-{instance_id}")));
        other_details.insert("plan".to_string(), json!(plan.name));
        Ok(InstanceMetadata {
            name: format!("bucket-{instance_id}"),
            location: "us".to_string(),
            url: String::new(),
            other_details,
        })
    }

    async fn delete(
        &self,
        _instance: &ServiceInstanceRecord,
        _details: &DeprovisionDetails,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Synchronous provider whose bindings are service identities.
pub type IamProvider = BaseProvider<BucketResources, ServiceAccountManager<FakeIam>>;

pub fn iam_provider() -> IamProvider {
    let accounts = ServiceAccountManager::new(FakeIam::default(), "test-project")
        .with_role_whitelist(["storage.objectViewer", "storage.objectAdmin"])
        .with_conflict_delay(Duration::from_millis(1));
    BaseProvider::new(BucketResources, accounts)
}

// ============================================================================
// Database-backed provider
// ============================================================================

/// In-memory database admin API; every operation finishes immediately.
#[derive(Default)]
pub struct FakeSqlAdmin {
    users: Mutex<Vec<String>>,
    certs: Mutex<Vec<String>>,
}

impl FakeSqlAdmin {
    pub fn users(&self) -> Vec<String> {
        self.users.lock().unwrap().clone()
    }

    pub fn certs(&self) -> Vec<String> {
        self.certs.lock().unwrap().clone()
    }
}

#[async_trait]
impl SqlAdminClient for FakeSqlAdmin {
    async fn insert_user(
        &self,
        instance_name: &str,
        username: &str,
        _password: &str,
    ) -> Result<SqlOperation, CredentialError> {
        self.users
            .lock()
            .unwrap()
            .push(format!("{instance_name}/{username}"));
        Ok(SqlOperation {
            name: format!("insert-user-{username}"),
        })
    }

    async fn delete_user(
        &self,
        instance_name: &str,
        username: &str,
    ) -> Result<SqlOperation, CredentialError> {
        let user = format!("{instance_name}/{username}");
        self.users.lock().unwrap().retain(|u| *u != user);
        Ok(SqlOperation {
            name: format!("delete-user-{username}"),
        })
    }

    async fn insert_ssl_cert(
        &self,
        _instance_name: &str,
        common_name: &str,
    ) -> Result<SslCert, CredentialError> {
        self.certs.lock().unwrap().push(common_name.to_string());
        Ok(SslCert {
            sha1_fingerprint: common_name.to_string(),
            cert: format!("cert-{common_name}"),
            private_key: format!("key-{common_name}"),
            server_ca_cert: "server-ca".to_string(),
        })
    }

    async fn delete_ssl_cert(
        &self,
        _instance_name: &str,
        sha1_fingerprint: &str,
    ) -> Result<SqlOperation, CredentialError> {
        self.certs.lock().unwrap().retain(|c| c != sha1_fingerprint);
        Ok(SqlOperation {
            name: format!("delete-cert-{sha1_fingerprint}"),
        })
    }

    async fn operation_done(&self, _operation: &SqlOperation) -> Result<bool, CredentialError> {
        Ok(true)
    }
}

/// Databases named after the instance.
pub struct DatabaseResources;

#[async_trait]
impl ResourceManager for DatabaseResources {
    async fn create(
        &self,
        instance_id: &str,
        _details: &ProvisionDetails,
        _plan: &ServicePlan,
    ) -> Result<InstanceMetadata, ProviderError> {
        let mut other_details = Details::new();
        other_details.insert("host".to_string(), json!("10.0.0.5"));
        other_details.insert("database_name".to_string(), json!(format!("db_{instance_id}")));
        Ok(InstanceMetadata {
            name: format!("db-{instance_id}"),
            location: "us-central1".to_string(),
            url: String::new(),
            other_details,
        })
    }

    async fn delete(
        &self,
        _instance: &ServiceInstanceRecord,
        _details: &DeprovisionDetails,
    ) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Synchronous provider whose bindings are database users.
pub type SqlProvider = BaseProvider<DatabaseResources, SqlAccountManager<FakeSqlAdmin>>;

pub fn sql_provider(flavor: SqlFlavor) -> SqlProvider {
    BaseProvider::new(
        DatabaseResources,
        SqlAccountManager::new(FakeSqlAdmin::default(), flavor)
            .with_poll_interval(Duration::from_millis(1)),
    )
}

/// Helper macro to skip tests if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
