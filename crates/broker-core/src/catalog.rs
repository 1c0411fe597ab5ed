// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service catalog and provider registry.
//!
//! The catalog is validated once, when it is built. Anything missing an
//! identifier or name is rejected there, so request handling never sees a
//! half-defined service.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::provider::ServiceProvider;

/// A plan offered by a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePlan {
    /// Globally unique plan ID.
    pub id: String,
    /// CLI-friendly plan name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Whether the plan is free of charge.
    pub free: bool,
    /// Provider-specific settings for instances on this plan.
    pub service_properties: BTreeMap<String, String>,
}

/// A service offering and its plans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDefinition {
    /// Globally unique service ID.
    pub id: String,
    /// CLI-friendly service name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Whether instances can be bound.
    pub bindable: bool,
    /// Whether instances can change plans.
    pub plan_updateable: bool,
    /// Searchable tags.
    pub tags: Vec<String>,
    /// Offered plans.
    pub plans: Vec<ServicePlan>,
}

impl ServiceDefinition {
    /// Find a plan by ID.
    pub fn plan(&self, plan_id: &str) -> Option<&ServicePlan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    fn validate(&self) -> Result<(), CatalogError> {
        if self.id.trim().is_empty() {
            return Err(CatalogError::MissingField {
                field: "service id",
                context: format!("service {:?}", self.name),
            });
        }
        if self.name.trim().is_empty() {
            return Err(CatalogError::MissingField {
                field: "service name",
                context: format!("service {}", self.id),
            });
        }

        let mut seen = HashSet::new();
        for plan in &self.plans {
            if plan.id.trim().is_empty() {
                return Err(CatalogError::MissingField {
                    field: "plan id",
                    context: format!("plan {:?} of service {}", plan.name, self.id),
                });
            }
            if plan.name.trim().is_empty() {
                return Err(CatalogError::MissingField {
                    field: "plan name",
                    context: format!("plan {} of service {}", plan.id, self.id),
                });
            }
            if !seen.insert(plan.id.as_str()) {
                return Err(CatalogError::DuplicatePlan {
                    service_id: self.id.clone(),
                    plan_id: plan.id.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Catalog errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// A definition lacks a required field.
    #[error("{context} is missing a {field}")]
    MissingField {
        /// The missing field.
        field: &'static str,
        /// Which definition it is missing from.
        context: String,
    },

    /// Two services share an ID.
    #[error("service {0} is defined more than once")]
    DuplicateService(String),

    /// Two plans of one service share an ID.
    #[error("plan {plan_id} is defined more than once in service {service_id}")]
    DuplicatePlan {
        /// The service.
        service_id: String,
        /// The duplicate plan ID.
        plan_id: String,
    },

    /// No enabled service has this ID.
    #[error("unknown service ID: {0}")]
    ServiceNotFound(String),

    /// The service has no plan with this ID.
    #[error("plan ID {plan_id} could not be found for service {service_id}")]
    PlanNotFound {
        /// The service.
        service_id: String,
        /// The unknown plan.
        plan_id: String,
    },
}

/// Immutable set of enabled services keyed by service ID.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    services: HashMap<String, ServiceDefinition>,
}

impl Catalog {
    /// Validate and index `definitions`.
    pub fn new(definitions: Vec<ServiceDefinition>) -> Result<Self, CatalogError> {
        let mut services = HashMap::with_capacity(definitions.len());
        for definition in definitions {
            definition.validate()?;
            if services.contains_key(&definition.id) {
                return Err(CatalogError::DuplicateService(definition.id));
            }
            services.insert(definition.id.clone(), definition);
        }
        Ok(Self { services })
    }

    /// Look up a service.
    pub fn service(&self, service_id: &str) -> Result<&ServiceDefinition, CatalogError> {
        self.services
            .get(service_id)
            .ok_or_else(|| CatalogError::ServiceNotFound(service_id.to_string()))
    }

    /// Resolve a (service, plan) pair.
    pub fn resolve_plan(
        &self,
        service_id: &str,
        plan_id: &str,
    ) -> Result<&ServicePlan, CatalogError> {
        self.service(service_id)?
            .plan(plan_id)
            .ok_or_else(|| CatalogError::PlanNotFound {
                service_id: service_id.to_string(),
                plan_id: plan_id.to_string(),
            })
    }

    /// All services, sorted by name.
    pub fn services(&self) -> Vec<ServiceDefinition> {
        let mut services: Vec<_> = self.services.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True if no services are enabled.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Catalog plus the provider that serves each service.
pub struct ServiceRegistry {
    catalog: Catalog,
    providers: HashMap<String, Arc<dyn ServiceProvider>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("catalog", &self.catalog)
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServiceRegistry {
    /// Start registering services.
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder::default()
    }

    /// The validated catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// All services, sorted by name.
    pub fn services(&self) -> Vec<ServiceDefinition> {
        self.catalog.services()
    }

    /// Provider serving `service_id`.
    pub fn provider(&self, service_id: &str) -> Result<Arc<dyn ServiceProvider>, CatalogError> {
        self.providers
            .get(service_id)
            .cloned()
            .ok_or_else(|| CatalogError::ServiceNotFound(service_id.to_string()))
    }

    /// Resolve a plan and the provider that serves it.
    pub fn resolve(
        &self,
        service_id: &str,
        plan_id: &str,
    ) -> Result<(&ServicePlan, Arc<dyn ServiceProvider>), CatalogError> {
        let plan = self.catalog.resolve_plan(service_id, plan_id)?;
        Ok((plan, self.provider(service_id)?))
    }
}

/// Builder for [`ServiceRegistry`].
#[derive(Default)]
pub struct ServiceRegistryBuilder {
    entries: Vec<(ServiceDefinition, Arc<dyn ServiceProvider>)>,
}

impl ServiceRegistryBuilder {
    /// Enable a service, served by `provider`.
    pub fn register(
        mut self,
        definition: ServiceDefinition,
        provider: Arc<dyn ServiceProvider>,
    ) -> Self {
        self.entries.push((definition, provider));
        self
    }

    /// Validate every definition and build the registry.
    pub fn build(self) -> Result<ServiceRegistry, CatalogError> {
        let mut definitions = Vec::with_capacity(self.entries.len());
        let mut providers = HashMap::with_capacity(self.entries.len());

        for (definition, provider) in self.entries {
            providers.insert(definition.id.clone(), provider);
            definitions.push(definition);
        }

        Ok(ServiceRegistry {
            catalog: Catalog::new(definitions)?,
            providers,
        })
    }
}
