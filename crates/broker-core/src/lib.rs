// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker Core - Service Broker Control Plane
//!
//! This crate drives pluggable backend providers through the service broker
//! lifecycle (provision, bind, unbind, deprovision, plus polling of
//! asynchronous operations) and tracks every instance and binding in a
//! relational store so retries, restarts and concurrent requests stay
//! consistent.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Transport (out of scope)                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         LegacyPlanUpgrader                               │
//! │              (blocks work on legacy plans until upgraded)                │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Broker                                      │
//! │        Provision / Deprovision / Bind / Unbind / LastOperation           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                        │                          │
//!           ▼                        ▼                          ▼
//! ┌───────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │  ServiceRegistry  │   │   ServiceProvider   │   │        Store        │
//! │  (catalog, plans) │   │  (one per service)  │   │ (SQLite/PostgreSQL) │
//! └───────────────────┘   └─────────────────────┘   └─────────────────────┘
//!                                    │
//!                                    ▼
//!                         ┌─────────────────────┐
//!                         │   AccountManager    │
//!                         │ (binding identities)│
//!                         └─────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Sync success | Async success | Notable failures |
//! |-----------|--------------|---------------|------------------|
//! | `provision` | Created | Accepted | InstanceAlreadyExists, InstanceLimitExceeded, AsyncRequired |
//! | `deprovision` | Ok | Accepted | InstanceDoesNotExist (Gone), AsyncRequired |
//! | `bind` | Created | - | BindingAlreadyExists, InstanceDoesNotExist, AppGuidRequired |
//! | `unbind` | Ok | - | InstanceDoesNotExist, BindingDoesNotExist (both Gone), BindingInProgress |
//! | `last_operation` | state | - | InstanceDoesNotExist, PollingNotApplicable |
//! | `update` | Ok | Accepted | PlanChangeNotSupported, legacy upgrade errors |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `BROKER_DATABASE_URL` | Yes | - | `sqlite:...` or `postgres://...` URL |
//! | `BROKER_DB_MAX_CONNECTIONS` | No | `5` | Connection pool size |
//! | `BROKER_INSTANCE_LIMIT` | No | unlimited | Maximum number of live instances |
//! | `BROKER_CLAIM_TIMEOUT_SECS` | No | `600` | Age after which an unfinished claim is abandoned |
//!
//! # Modules
//!
//! - [`broker`]: Broker orchestrator and the [`ServiceBroker`] trait
//! - [`catalog`]: Service and plan definitions, service to provider registry
//! - [`compatibility`]: Legacy plan upgrader
//! - [`config`]: Configuration from environment variables
//! - [`credentials`]: Policy binding merge, service account and database user credentials
//! - [`details`]: Request details
//! - [`error`]: Error types with response status mapping
//! - [`migrations`]: Schema migration runner
//! - [`provider`]: Provider capability contract and the account-backed base provider
//! - [`runtime`]: Builder composing the broker
//! - [`store`]: Record store for instances, bindings and requests

#![deny(missing_docs)]

/// Broker orchestrator and poll transitions.
pub mod broker;

/// Service catalog and provider registry.
pub mod catalog;

/// Legacy plan compatibility shim.
pub mod compatibility;

/// Configuration loaded from environment variables.
pub mod config;

/// Policy binding merge and service account credentials.
pub mod credentials;

/// Request details shared by the broker, the shim and providers.
pub mod details;

/// Error types with response status mapping.
pub mod error;

/// Schema migration runner and embedded migrations.
pub mod migrations;

/// Provider capability contract, the account-backed base provider and a
/// scripted mock (`testing` feature).
pub mod provider;

/// Builder composing store, registry, broker and shim.
pub mod runtime;

/// Record store for instances, bindings, provision requests and legacy plans.
pub mod store;

pub use broker::{Broker, LastOperation, OperationState, ServiceBroker};
pub use error::{BrokerError, Operation, ResponseStatus, Result};
