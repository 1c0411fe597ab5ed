// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database users with client certificates as binding credentials.
//!
//! Every bind creates a user named by the caller and a client certificate
//! on the database instance, waiting for each admin operation to finish.
//! Unbind deletes the certificate first, then the user.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{AccountManager, CredentialError, merge_details};
use crate::details::{BindDetails, Details};
use crate::store::{ServiceBindingRecord, ServiceInstanceRecord};

const CERT_SUFFIX: &str = "cert";
const CERT_PREFIX_LEN: usize = 10;

/// Handle of a long-running admin operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlOperation {
    /// Backend operation name.
    pub name: String,
}

/// A freshly issued client certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslCert {
    /// Fingerprint used to revoke the certificate.
    pub sha1_fingerprint: String,
    /// Client certificate, PEM.
    pub cert: String,
    /// Client private key, PEM.
    pub private_key: String,
    /// Server CA certificate, PEM.
    pub server_ca_cert: String,
}

/// Database admin operations needed by [`SqlAccountManager`].
///
/// `instance_name` is the backend name of the database instance.
#[async_trait]
pub trait SqlAdminClient: Send + Sync {
    /// Create a database user.
    async fn insert_user(
        &self,
        instance_name: &str,
        username: &str,
        password: &str,
    ) -> Result<SqlOperation, CredentialError>;

    /// Delete a database user. A user that no longer exists reports a
    /// [`CredentialError::Backend`] with code 404.
    async fn delete_user(
        &self,
        instance_name: &str,
        username: &str,
    ) -> Result<SqlOperation, CredentialError>;

    /// Issue a client certificate with the given common name.
    async fn insert_ssl_cert(
        &self,
        instance_name: &str,
        common_name: &str,
    ) -> Result<SslCert, CredentialError>;

    /// Revoke a client certificate.
    async fn delete_ssl_cert(
        &self,
        instance_name: &str,
        sha1_fingerprint: &str,
    ) -> Result<SqlOperation, CredentialError>;

    /// Whether the operation has finished.
    async fn operation_done(&self, operation: &SqlOperation) -> Result<bool, CredentialError>;
}

/// Database engine, which decides the shape of the connection URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlFlavor {
    /// MySQL
    MySql,
    /// PostgreSQL
    Postgres,
}

/// Credential blob stored for database bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SqlAccountInfo {
    /// Database user.
    pub username: String,
    /// Password of the user.
    pub password: String,
    /// Server CA certificate. Empty if no certificate was issued.
    pub ca_cert: String,
    /// Client certificate.
    pub client_cert: String,
    /// Client private key.
    pub client_key: String,
    /// Fingerprint used to revoke the certificate.
    pub sha1_fingerprint: String,
}

/// Common name of the certificate issued for a binding.
pub fn cert_name_for_binding(binding_id: &str) -> String {
    let prefix: String = binding_id.chars().take(CERT_PREFIX_LEN).collect();
    format!("{prefix}{CERT_SUFFIX}")
}

/// Mints a database user and client certificate per binding.
pub struct SqlAccountManager<C> {
    client: C,
    flavor: SqlFlavor,
    poll_interval: Duration,
    max_polls: u32,
}

impl<C: SqlAdminClient> SqlAccountManager<C> {
    /// Manager for databases of the given flavor. Operations are polled once
    /// per second for up to five minutes.
    pub fn new(client: C, flavor: SqlFlavor) -> Self {
        Self {
            client,
            flavor,
            poll_interval: Duration::from_secs(1),
            max_polls: 300,
        }
    }

    /// Wait this long between operation polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Give up on an operation after this many polls.
    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = max_polls.max(1);
        self
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// The configured engine.
    pub fn flavor(&self) -> SqlFlavor {
        self.flavor
    }

    /// Username and password requested in the bind parameters.
    pub fn requested_user(
        &self,
        details: &BindDetails,
    ) -> Result<(String, String), CredentialError> {
        let params = details
            .parameters()
            .map_err(|e| CredentialError::InvalidParameters(e.to_string()))?;
        let username = params.get("username").and_then(|v| v.as_str());
        let password = params.get("password").and_then(|v| v.as_str());

        match (username, password) {
            (Some(username), Some(password)) => Ok((username.to_string(), password.to_string())),
            _ => Err(CredentialError::MissingUserCredentials),
        }
    }

    async fn wait_for(&self, operation: &SqlOperation) -> Result<(), CredentialError> {
        for poll in 1..=self.max_polls {
            if self.client.operation_done(operation).await? {
                debug!(operation = %operation.name, poll, "Operation finished");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        Err(CredentialError::OperationTimedOut {
            operation: operation.name.clone(),
            polls: self.max_polls,
        })
    }

    /// Connection URI for merged credentials.
    ///
    /// Reads `Username`, `Password`, `host`, `database_name` and an optional
    /// `UriPrefix`; the Postgres form also carries the certificates.
    pub fn connection_uri(&self, credentials: &Details) -> String {
        let field = |key: &str| credentials.get(key).and_then(|v| v.as_str()).unwrap_or("");
        let escaped = |key: &str| urlencoding::encode(field(key)).into_owned();

        match self.flavor {
            SqlFlavor::MySql => format!(
                "{}mysql://{}:{}@{}/{}?ssl_mode=required",
                field("UriPrefix"),
                escaped("Username"),
                escaped("Password"),
                field("host"),
                field("database_name"),
            ),
            SqlFlavor::Postgres => format!(
                "{}postgres://{}:{}@{}/{}?sslmode=require&sslcert={}&sslkey={}&sslrootcert={}",
                field("UriPrefix"),
                escaped("Username"),
                escaped("Password"),
                field("host"),
                field("database_name"),
                escaped("ClientCert"),
                escaped("ClientKey"),
                escaped("CaCert"),
            ),
        }
    }
}

#[async_trait]
impl<C: SqlAdminClient> AccountManager for SqlAccountManager<C> {
    async fn create_credentials(
        &self,
        instance: &ServiceInstanceRecord,
        binding_id: &str,
        details: &BindDetails,
    ) -> Result<Details, CredentialError> {
        let (username, password) = self.requested_user(details)?;

        let operation = self
            .client
            .insert_user(&instance.name, &username, &password)
            .await?;
        self.wait_for(&operation).await?;
        info!(database = %instance.name, username = %username, binding_id, "Created database user");

        let cert = self
            .client
            .insert_ssl_cert(&instance.name, &cert_name_for_binding(binding_id))
            .await?;

        let info = SqlAccountInfo {
            username,
            password,
            ca_cert: cert.server_ca_cert,
            client_cert: cert.cert,
            client_key: cert.private_key,
            sha1_fingerprint: cert.sha1_fingerprint,
        };

        match serde_json::to_value(&info)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Ok(Details::new()),
        }
    }

    async fn delete_credentials(
        &self,
        instance: &ServiceInstanceRecord,
        binding: &ServiceBindingRecord,
    ) -> Result<(), CredentialError> {
        let info: SqlAccountInfo = serde_json::from_str(&binding.other_details)?;

        // No CA means no certificate was issued.
        if !info.ca_cert.is_empty() {
            let operation = self
                .client
                .delete_ssl_cert(&instance.name, &info.sha1_fingerprint)
                .await?;
            self.wait_for(&operation).await?;
        }

        match self.client.delete_user(&instance.name, &info.username).await {
            Ok(operation) => self.wait_for(&operation).await?,
            Err(CredentialError::Backend { code: 404, .. }) => {
                warn!(username = %info.username, "Database user already gone");
            }
            Err(e) => return Err(e),
        }

        debug!(database = %instance.name, username = %info.username, "Deleted database user");
        Ok(())
    }

    fn build_instance_credentials(
        &self,
        credentials: &Details,
        instance: &ServiceInstanceRecord,
    ) -> Result<Details, CredentialError> {
        let mut merged = merge_details(credentials, &instance.details()?);
        let uri = self.connection_uri(&merged);
        merged.insert("uri".to_string(), serde_json::Value::String(uri));
        Ok(merged)
    }
}
