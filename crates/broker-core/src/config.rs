// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Maximum connections in the store pool
    pub max_connections: u32,
    /// Ceiling on live instances; `None` means unlimited
    pub instance_limit: Option<u64>,
    /// Age after which an unfinished provision or bind claim is abandoned
    pub claim_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `BROKER_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional:
    /// - `BROKER_DB_MAX_CONNECTIONS`: pool size (default: 5)
    /// - `BROKER_INSTANCE_LIMIT`: maximum number of live instances (default: unlimited)
    /// - `BROKER_CLAIM_TIMEOUT_SECS`: age of an abandoned claim (default: 600)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("BROKER_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("BROKER_DATABASE_URL"))?;

        let max_connections: u32 = std::env::var("BROKER_DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "BROKER_DB_MAX_CONNECTIONS",
                "must be a positive integer",
            ))?;

        let instance_limit = match std::env::var("BROKER_INSTANCE_LIMIT") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse::<u64>().map_err(|_| {
                ConfigError::Invalid("BROKER_INSTANCE_LIMIT", "must be a non-negative integer")
            })?),
            _ => None,
        };

        let claim_timeout = std::env::var("BROKER_CLAIM_TIMEOUT_SECS")
            .unwrap_or_else(|_| "600".to_string())
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| {
                ConfigError::Invalid("BROKER_CLAIM_TIMEOUT_SECS", "must be a non-negative integer")
            })?;

        Ok(Self {
            database_url,
            max_connections,
            instance_limit,
            claim_timeout,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
