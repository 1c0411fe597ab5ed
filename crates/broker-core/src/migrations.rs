// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schema migrations for the record store.
//!
//! Migrations are numbered from 0 and embedded in the binary from the
//! per-dialect scripts under `migrations/sqlite` and `migrations/postgresql`.
//! Applied migrations are recorded in the `migrations` ledger table; on
//! startup the highest recorded number decides what still has to run. A
//! missing ledger means nothing has been applied.
//!
//! Each migration runs in its own transaction together with its ledger row,
//! so a failure leaves every earlier migration applied and the failing one
//! absent.
//!
//! # Example
//!
//! ```ignore
//! use broker_core::migrations::Migrator;
//! use broker_core::store::SqliteStore;
//!
//! let store = SqliteStore::connect("sqlite:broker.db?mode=rwc", 5).await?;
//! let applied = Migrator::broker().run(&store).await?;
//! ```

use async_trait::async_trait;
use tracing::{debug, info};

use crate::store::StoreError;

/// SQL dialect a target speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// SQLite
    Sqlite,
    /// PostgreSQL
    Postgres,
}

/// One schema migration.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Position in the migration sequence, starting at 0.
    pub sequence: i64,
    /// Short human-readable summary.
    pub description: &'static str,
    /// Script for SQLite.
    pub sqlite: &'static str,
    /// Script for PostgreSQL.
    pub postgres: &'static str,
}

impl Migration {
    /// Script to run for `dialect`. May hold several statements.
    pub fn sql(&self, dialect: Dialect) -> &'static str {
        match dialect {
            Dialect::Sqlite => self.sqlite,
            Dialect::Postgres => self.postgres,
        }
    }
}

/// A database the migrator can bring up to date.
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Dialect used to pick statements.
    fn dialect(&self) -> Dialect;

    /// Highest applied migration, or `None` if the ledger is absent or empty.
    async fn last_applied_migration(&self) -> Result<Option<i64>, StoreError>;

    /// Run the migration's statements and record it in the ledger, in one
    /// transaction.
    async fn apply_migration(&self, migration: &Migration) -> Result<(), StoreError>;
}

/// Migration errors.
///
/// None of these are retryable: they mean the schema and the code disagree
/// or the database refused a statement.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// The database has migrations this build does not know about.
    #[error(
        "database schema is at migration {found} but this build only knows up to {supported}; \
         upgrade the broker before connecting it to this database"
    )]
    SchemaAhead {
        /// Highest applied migration.
        found: i64,
        /// Highest known migration.
        supported: i64,
    },

    /// The database predates the oldest schema this build can upgrade.
    #[error(
        "database schema is at migration {found}, older than the oldest supported baseline {oldest}"
    )]
    UnsupportedBaseline {
        /// Highest applied migration.
        found: i64,
        /// Oldest supported starting point.
        oldest: i64,
    },

    /// A migration failed and was rolled back.
    #[error("migration {sequence} failed: {source}")]
    Failed {
        /// The failing migration.
        sequence: i64,
        /// Underlying error.
        source: StoreError,
    },

    /// The database URL names no supported backend.
    #[error("unsupported database url scheme: {0}")]
    UnsupportedUrl(String),

    /// Reading the ledger or connecting failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ordered migration list plus the oldest schema version it can upgrade from.
#[derive(Debug, Clone)]
pub struct Migrator {
    migrations: Vec<Migration>,
    oldest_supported: i64,
}

impl Migrator {
    /// Create a migrator. Migrations are sorted by sequence number.
    pub fn new(mut migrations: Vec<Migration>, oldest_supported: i64) -> Self {
        migrations.sort_by_key(|m| m.sequence);
        Self {
            migrations,
            oldest_supported,
        }
    }

    /// The broker's own schema.
    pub fn broker() -> Self {
        Self::new(MIGRATIONS.to_vec(), 0)
    }

    /// Highest known migration, or -1 if there are none.
    pub fn latest(&self) -> i64 {
        self.migrations.last().map(|m| m.sequence).unwrap_or(-1)
    }

    /// Migrations still to run after `last_applied`.
    pub fn pending(&self, last_applied: Option<i64>) -> Result<&[Migration], MigrationError> {
        let last = last_applied.unwrap_or(-1);
        let latest = self.latest();

        if last > latest {
            return Err(MigrationError::SchemaAhead {
                found: last,
                supported: latest,
            });
        }
        if last >= 0 && last < self.oldest_supported {
            return Err(MigrationError::UnsupportedBaseline {
                found: last,
                oldest: self.oldest_supported,
            });
        }

        let start = self.migrations.partition_point(|m| m.sequence <= last);
        Ok(&self.migrations[start..])
    }

    /// Apply every pending migration to `target`. Returns how many ran.
    pub async fn run<T>(&self, target: &T) -> Result<usize, MigrationError>
    where
        T: MigrationTarget + ?Sized,
    {
        let last = target.last_applied_migration().await?;
        let pending = self.pending(last)?;

        if pending.is_empty() {
            debug!(last = ?last, "Schema is up to date");
            return Ok(0);
        }

        for migration in pending {
            info!(
                sequence = migration.sequence,
                description = migration.description,
                "Applying migration"
            );
            target
                .apply_migration(migration)
                .await
                .map_err(|source| MigrationError::Failed {
                    sequence: migration.sequence,
                    source,
                })?;
        }

        Ok(pending.len())
    }
}

// ============================================================================
// Broker schema
// ============================================================================

/// Migrations for the broker schema, in order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        sequence: 0,
        description: "create instance, binding, request, plan and ledger tables",
        sqlite: include_str!("../migrations/sqlite/0000_baseline.sql"),
        postgres: include_str!("../migrations/postgresql/0000_baseline.sql"),
    },
    Migration {
        sequence: 1,
        description: "add explicit instance status",
        sqlite: include_str!("../migrations/sqlite/0001_instance_status.sql"),
        postgres: include_str!("../migrations/postgresql/0001_instance_status.sql"),
    },
    Migration {
        sequence: 2,
        description: "unique live binding per instance, request lookup index",
        sqlite: include_str!("../migrations/sqlite/0002_live_binding_index.sql"),
        postgres: include_str!("../migrations/postgresql/0002_live_binding_index.sql"),
    },
    Migration {
        sequence: 3,
        description: "add binding status for claimed binds",
        sqlite: include_str!("../migrations/sqlite/0003_binding_status.sql"),
        postgres: include_str!("../migrations/postgresql/0003_binding_status.sql"),
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory target recording which migrations ran.
    struct FakeTarget {
        ledger: Mutex<Vec<i64>>,
        fail_on: Option<i64>,
    }

    impl FakeTarget {
        fn at(applied: &[i64]) -> Self {
            Self {
                ledger: Mutex::new(applied.to_vec()),
                fail_on: None,
            }
        }

        fn applied(&self) -> Vec<i64> {
            self.ledger.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MigrationTarget for FakeTarget {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        async fn last_applied_migration(&self) -> Result<Option<i64>, StoreError> {
            Ok(self.ledger.lock().unwrap().iter().copied().max())
        }

        async fn apply_migration(&self, migration: &Migration) -> Result<(), StoreError> {
            if self.fail_on == Some(migration.sequence) {
                return Err(StoreError::ConstraintViolation("boom".to_string()));
            }
            self.ledger.lock().unwrap().push(migration.sequence);
            Ok(())
        }
    }

    fn noop(sequence: i64) -> Migration {
        Migration {
            sequence,
            description: "noop",
            sqlite: "",
            postgres: "",
        }
    }

    fn migrator(count: i64, oldest: i64) -> Migrator {
        Migrator::new((0..count).map(noop).collect(), oldest)
    }

    #[tokio::test]
    async fn test_fresh_database_runs_everything() {
        let target = FakeTarget::at(&[]);
        let applied = migrator(3, 0).run(&target).await.unwrap();

        assert_eq!(applied, 3);
        assert_eq!(target.applied(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_partial_schema_runs_remaining() {
        let target = FakeTarget::at(&[0, 1]);
        let applied = migrator(4, 0).run(&target).await.unwrap();

        assert_eq!(applied, 2);
        assert_eq!(target.applied(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_up_to_date_is_noop() {
        let target = FakeTarget::at(&[0, 1, 2]);
        assert_eq!(migrator(3, 0).run(&target).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_schema_ahead_refuses() {
        let target = FakeTarget::at(&[0, 1, 2, 3, 4]);
        let err = migrator(3, 0).run(&target).await.unwrap_err();

        assert!(matches!(
            err,
            MigrationError::SchemaAhead {
                found: 4,
                supported: 2
            }
        ));
        assert_eq!(target.applied().len(), 5);
    }

    #[tokio::test]
    async fn test_unsupported_baseline_refuses() {
        let target = FakeTarget::at(&[0]);
        let err = migrator(5, 2).run(&target).await.unwrap_err();

        assert!(matches!(
            err,
            MigrationError::UnsupportedBaseline {
                found: 0,
                oldest: 2
            }
        ));
    }

    #[test]
    fn test_baseline_does_not_block_fresh_database() {
        let m = migrator(5, 2);
        assert_eq!(m.pending(None).unwrap().len(), 5);
        assert_eq!(m.pending(Some(2)).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_stops_run_and_keeps_earlier() {
        let target = FakeTarget {
            ledger: Mutex::new(Vec::new()),
            fail_on: Some(1),
        };
        let err = migrator(3, 0).run(&target).await.unwrap_err();

        assert!(matches!(err, MigrationError::Failed { sequence: 1, .. }));
        assert_eq!(target.applied(), vec![0]);
    }

    #[test]
    fn test_broker_migrations_are_contiguous() {
        for (i, m) in MIGRATIONS.iter().enumerate() {
            assert_eq!(m.sequence, i as i64);
            assert!(!m.sql(Dialect::Sqlite).trim().is_empty());
            assert!(!m.sql(Dialect::Postgres).trim().is_empty());
        }
        assert_eq!(Migrator::broker().latest(), MIGRATIONS.len() as i64 - 1);
    }

    #[test]
    fn test_baseline_ddl_is_per_dialect() {
        let baseline = &MIGRATIONS[0];
        assert!(baseline.sql(Dialect::Sqlite).contains("AUTOINCREMENT"));
        assert!(baseline.sql(Dialect::Postgres).contains("BIGSERIAL"));
        assert!(baseline.sql(Dialect::Postgres).contains("TIMESTAMPTZ"));

        for m in MIGRATIONS {
            assert!(m.sql(Dialect::Sqlite).contains("service_"));
        }
    }
}
