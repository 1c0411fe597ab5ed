// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for broker-core.
//!
//! [`BrokerError`] is the single error surfaced by the six broker operations.
//! Lower layers keep their own error enums and convert into it with `?`.
//! Transports map an error to a response with [`BrokerError::status`], which
//! needs to know the [`Operation`] because the same error kind means
//! different things for different calls (a missing instance is `Gone` for
//! Deprovision but `NotFound` for Bind).

use crate::catalog::CatalogError;
use crate::provider::ProviderError;
use crate::store::StoreError;

/// Result type using BrokerError
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Protocol operation an error was produced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// List the catalog.
    Catalog,
    /// Create an instance.
    Provision,
    /// Delete an instance.
    Deprovision,
    /// Mint credentials for an instance.
    Bind,
    /// Revoke credentials.
    Unbind,
    /// Change the plan of an instance.
    Update,
    /// Poll an asynchronous operation.
    LastOperation,
}

impl Operation {
    /// Returns the string representation of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Catalog => "catalog",
            Self::Provision => "provision",
            Self::Deprovision => "deprovision",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
            Self::Update => "update",
            Self::LastOperation => "last_operation",
        }
    }
}

/// Transport-agnostic response category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// 200
    Ok,
    /// 201
    Created,
    /// 202
    Accepted,
    /// 404
    NotFound,
    /// 409
    Conflict,
    /// 410
    Gone,
    /// 422
    UnprocessableEntity,
    /// 500
    InternalServerError,
}

impl ResponseStatus {
    /// HTTP status code conventionally used for this category.
    pub fn code(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::Accepted => 202,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Gone => 410,
            Self::UnprocessableEntity => 422,
            Self::InternalServerError => 500,
        }
    }
}

/// Errors returned by broker operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// A live instance with this ID is already tracked.
    #[error("instance {instance_id} already exists")]
    InstanceAlreadyExists {
        /// The duplicate instance ID.
        instance_id: String,
    },

    /// No live instance with this ID is tracked.
    #[error("instance {instance_id} does not exist")]
    InstanceDoesNotExist {
        /// The missing instance ID.
        instance_id: String,
    },

    /// The configured instance ceiling has been reached.
    #[error("instance limit of {limit} has been reached")]
    InstanceLimitExceeded {
        /// The configured ceiling.
        limit: u64,
    },

    /// A live binding with this ID is already tracked for the instance.
    #[error("binding {binding_id} already exists for instance {instance_id}")]
    BindingAlreadyExists {
        /// The owning instance.
        instance_id: String,
        /// The duplicate binding ID.
        binding_id: String,
    },

    /// No live binding with this ID is tracked for the instance.
    #[error("binding {binding_id} does not exist for instance {instance_id}")]
    BindingDoesNotExist {
        /// The owning instance.
        instance_id: String,
        /// The missing binding ID.
        binding_id: String,
    },

    /// Another call is still minting credentials for this binding.
    #[error("binding {binding_id} for instance {instance_id} is still being created")]
    BindingInProgress {
        /// The owning instance.
        instance_id: String,
        /// The binding being created.
        binding_id: String,
    },

    /// The provider only works asynchronously and the caller did not accept that.
    #[error("this service plan requires client support for asynchronous service operations")]
    AsyncRequired,

    /// Plan changes are not implemented by the base broker.
    #[error("the service does not support changing plans")]
    PlanChangeNotSupported,

    /// Bind was called without an application identifier.
    #[error("this service supports generation of credentials through binding an application only")]
    AppGuidRequired,

    /// Caller-supplied parameters could not be interpreted.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Another operation on the instance has not finished yet.
    #[error("instance {instance_id} is {status}; another operation is in progress")]
    OperationInProgress {
        /// The instance ID.
        instance_id: String,
        /// Stored status of the instance.
        status: String,
    },

    /// LastOperation was called on a service whose provider is fully synchronous.
    #[error("can't call LastOperation on a synchronous service ({service_id})")]
    PollingNotApplicable {
        /// The synchronous service.
        service_id: String,
    },

    /// The request involves a legacy plan that must be upgraded first.
    #[error("{0}")]
    LegacyPlan(String),

    /// The backend action succeeded but its record could not be persisted.
    #[error(
        "{action} of {resource} {id} succeeded but saving its record failed: {source}. \
         WARNING: this {resource} may be orphaned or left stale and cannot be managed through the \
         broker; contact your operator for cleanup"
    )]
    Orphaned {
        /// Kind of record ("instance" or "binding").
        resource: &'static str,
        /// ID of the affected instance or binding.
        id: String,
        /// The backend action that succeeded.
        action: &'static str,
        /// The persistence failure.
        source: StoreError,
    },

    /// Catalog lookup failed.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The record store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BrokerError {
    /// Get the error code string for this error type.
    ///
    /// Codes for conflict-like 422 responses follow the open service broker
    /// naming (`AsyncRequired`, `ConcurrencyError`, `RequiresApp`).
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceAlreadyExists { .. } => "InstanceAlreadyExists",
            Self::InstanceDoesNotExist { .. } => "InstanceDoesNotExist",
            Self::InstanceLimitExceeded { .. } => "InstanceLimitExceeded",
            Self::BindingAlreadyExists { .. } => "BindingAlreadyExists",
            Self::BindingDoesNotExist { .. } => "BindingDoesNotExist",
            Self::BindingInProgress { .. } => "ConcurrencyError",
            Self::AsyncRequired => "AsyncRequired",
            Self::PlanChangeNotSupported => "PlanChangeNotSupported",
            Self::AppGuidRequired => "RequiresApp",
            Self::InvalidParameters(_) => "InvalidParameters",
            Self::OperationInProgress { .. } => "ConcurrencyError",
            Self::PollingNotApplicable { .. } => "PollingNotApplicable",
            Self::LegacyPlan(_) => "LegacyPlan",
            Self::Orphaned { .. } => "OrphanedResource",
            Self::Catalog(_) => "CatalogError",
            Self::Provider(_) => "ProviderError",
            Self::Store(_) => "StoreError",
        }
    }

    /// Map this error to a response status for the given operation.
    ///
    /// Anything not listed falls back to a generic server error; the message
    /// is always carried alongside by the caller.
    pub fn status(&self, operation: Operation) -> ResponseStatus {
        match self {
            Self::InstanceAlreadyExists { .. } | Self::BindingAlreadyExists { .. } => {
                ResponseStatus::Conflict
            }
            Self::InstanceDoesNotExist { .. } => match operation {
                Operation::Deprovision | Operation::Unbind => ResponseStatus::Gone,
                _ => ResponseStatus::NotFound,
            },
            Self::BindingDoesNotExist { .. } => ResponseStatus::Gone,
            Self::AsyncRequired
            | Self::PlanChangeNotSupported
            | Self::AppGuidRequired
            | Self::InvalidParameters(_)
            | Self::OperationInProgress { .. }
            | Self::BindingInProgress { .. } => ResponseStatus::UnprocessableEntity,
            Self::Provider(err) if err.is_caller_error() => ResponseStatus::UnprocessableEntity,
            _ => ResponseStatus::InternalServerError,
        }
    }

    /// Returns true if a record for a live backend resource may be missing.
    pub fn is_orphaning(&self) -> bool {
        matches!(self, Self::Orphaned { .. })
    }
}
