// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Composition of store, registry, broker and compatibility shim.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use broker_core::catalog::ServiceRegistry;
//! use broker_core::compatibility::default_upgrade_candidates;
//! use broker_core::runtime::BrokerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = broker_core::store::open("sqlite:broker.db", 5).await?;
//!     let registry = ServiceRegistry::builder()
//!         .register(bucket_service(), Arc::new(BucketProvider::new()))
//!         .build()?;
//!
//!     let broker = BrokerBuilder::new()
//!         .store(store)
//!         .registry(Arc::new(registry))
//!         .instance_limit(Some(100))
//!         .claim_timeout(Duration::from_secs(600))
//!         .upgrade_candidates(default_upgrade_candidates())
//!         .build()
//!         .await?;
//!
//!     let services = broker.services().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::broker::{Broker, DEFAULT_CLAIM_TIMEOUT, ServiceBroker};
use crate::catalog::ServiceRegistry;
use crate::compatibility::{LegacyPlanUpgrader, UpgradeCandidate, resolve_upgrade_paths};
use crate::store::Store;

/// Builder for the composed [`ServiceBroker`].
pub struct BrokerBuilder {
    store: Option<Arc<dyn Store>>,
    registry: Option<Arc<ServiceRegistry>>,
    instance_limit: Option<u64>,
    claim_timeout: Duration,
    upgrade_candidates: Vec<UpgradeCandidate>,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            store: None,
            registry: None,
            instance_limit: None,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
            upgrade_candidates: Vec::new(),
        }
    }
}

impl std::fmt::Debug for BrokerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("registry", &self.registry)
            .field("instance_limit", &self.instance_limit)
            .field("claim_timeout", &self.claim_timeout)
            .field("upgrade_candidates", &self.upgrade_candidates.len())
            .finish()
    }
}

impl BrokerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the service registry (required).
    pub fn registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the maximum number of live instances.
    ///
    /// Default: unlimited
    pub fn instance_limit(mut self, limit: Option<u64>) -> Self {
        self.instance_limit = limit;
        self
    }

    /// Set the age after which an unfinished provision or bind is abandoned.
    ///
    /// Default: 10 minutes
    pub fn claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    /// Set the legacy plans to look for in the store.
    ///
    /// Default: none
    pub fn upgrade_candidates(mut self, candidates: Vec<UpgradeCandidate>) -> Self {
        self.upgrade_candidates = candidates;
        self
    }

    /// Build the broker wrapped in the legacy plan upgrader.
    ///
    /// Returns an error if required fields are missing or the legacy plans
    /// cannot be read.
    pub async fn build(self) -> Result<Arc<dyn ServiceBroker>> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;

        let broker = Broker::new(store.clone(), registry)
            .with_instance_limit(self.instance_limit)
            .with_claim_timeout(self.claim_timeout);
        let upgrades = resolve_upgrade_paths(store.as_ref(), self.upgrade_candidates).await?;

        info!(
            instance_limit = ?self.instance_limit,
            claim_timeout = ?self.claim_timeout,
            legacy_plans = upgrades.len(),
            "Broker ready"
        );

        Ok(Arc::new(LegacyPlanUpgrader::new(
            Arc::new(broker),
            store,
            upgrades,
        )))
    }
}
