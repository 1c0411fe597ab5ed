// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker Core - operator entry point
//!
//! Loads the configuration, brings the record store schema up to date and
//! verifies the database. Serving the broker protocol is left to the
//! embedding transport.

use anyhow::Result;
use tracing::{error, info};

use broker_core::config::Config;
use broker_core::store;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("broker_core=info".parse()?),
        )
        .init();

    info!("Starting Broker Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        max_connections = config.max_connections,
        instance_limit = ?config.instance_limit,
        claim_timeout = ?config.claim_timeout,
        "Configuration loaded"
    );

    // Connect and migrate
    info!("Opening record store...");
    let store = store::open(&config.database_url, config.max_connections)
        .await
        .map_err(|e| {
            error!("Record store error: {}", e);
            e
        })?;

    store.health_check().await?;
    info!("Database health check passed");

    let live = store.count_all_instances().await?;
    info!(live_instances = live, "Broker Core initialized successfully");

    if let Some(limit) = config.instance_limit
        && u64::try_from(live).unwrap_or(0) >= limit
    {
        error!(
            live_instances = live,
            limit, "Instance limit already reached; provisioning will be refused"
        );
    }

    Ok(())
}
