// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request details passed from the transport to the broker and on to providers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BrokerError;

/// Opaque key/value blob: provider metadata, credentials, parameters.
pub type Details = serde_json::Map<String, Value>;

/// Interpret optional raw parameters as a JSON object.
///
/// Absent or `null` parameters are an empty map. Anything that is not an
/// object is rejected.
fn parameters_object(raw: Option<&Value>) -> Result<Details, BrokerError> {
    match raw {
        None | Some(Value::Null) => Ok(Details::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(other) => Err(BrokerError::InvalidParameters(format!(
            "parameters must be a JSON object, got {}",
            json_kind(other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Provision request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionDetails {
    /// Requested service.
    pub service_id: String,
    /// Requested plan.
    pub plan_id: String,
    /// Owning organization.
    #[serde(default)]
    pub organization_guid: String,
    /// Owning space.
    #[serde(default)]
    pub space_guid: String,
    /// Caller-supplied parameters.
    #[serde(default, rename = "parameters", skip_serializing_if = "Option::is_none")]
    pub raw_parameters: Option<Value>,
}

impl ProvisionDetails {
    /// Parameters as an object.
    pub fn parameters(&self) -> Result<Details, BrokerError> {
        parameters_object(self.raw_parameters.as_ref())
    }
}

/// Deprovision request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeprovisionDetails {
    /// Service the caller believes the instance belongs to.
    pub service_id: String,
    /// Plan the caller believes the instance is on.
    pub plan_id: String,
}

/// Bind request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindDetails {
    /// Service of the instance.
    pub service_id: String,
    /// Plan of the instance.
    pub plan_id: String,
    /// Application the credentials are for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_guid: Option<String>,
    /// Caller-supplied parameters.
    #[serde(default, rename = "parameters", skip_serializing_if = "Option::is_none")]
    pub raw_parameters: Option<Value>,
}

impl BindDetails {
    /// Parameters as an object.
    pub fn parameters(&self) -> Result<Details, BrokerError> {
        parameters_object(self.raw_parameters.as_ref())
    }
}

/// Unbind request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnbindDetails {
    /// Service of the instance.
    pub service_id: String,
    /// Plan of the instance.
    pub plan_id: String,
}

/// Update request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDetails {
    /// Service of the instance.
    pub service_id: String,
    /// Target plan, if the plan should change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Caller-supplied parameters.
    #[serde(default, rename = "parameters", skip_serializing_if = "Option::is_none")]
    pub raw_parameters: Option<Value>,
    /// Plan the caller believes the instance is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_plan_id: Option<String>,
}
