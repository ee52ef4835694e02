// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! SQLite-backed configuration store, setup lock, and revocation table.

use std::{
    path::Path,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use sqlx::{sqlite::SqliteConnectOptions, Pool, Row, Sqlite, SqlitePool};
use tracing::instrument;

use crate::{
    error::StoreError,
    lock::LeaseLock,
    revocation::{normalize_serial, RevocationLedger},
    store::ConfigStore,
};

static MIGRATIONS: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/");

/// Ensure the database is migrated to the latest version.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() -> anyhow::Result<()> {
/// let db = rootca::db::pool("sqlite::memory:", false).await?;
/// rootca::db::migrate(&db).await?;
/// # Ok(())
/// # }
/// ```
///
/// Instances sharing a fresh database may race to apply the same migration; the loser's
/// transaction fails and is retried, at which point it finds the migration already applied.
#[instrument(skip_all)]
pub async fn migrate(pool: &Pool<Sqlite>) -> anyhow::Result<()> {
    let mut attempt = 1;
    loop {
        match MIGRATIONS.run(pool).await {
            Ok(()) => return Ok(()),
            Err(
                error @ (sqlx::migrate::MigrateError::Execute(_)
                | sqlx::migrate::MigrateError::ExecuteMigration(..)),
            ) if attempt < MIGRATION_ATTEMPTS => {
                tracing::debug!(%error, attempt, "Migration attempt failed; retrying");
                tokio::time::sleep(MIGRATION_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            Err(error) => return Err(error).context("Migrations could not be applied"),
        }
    }
}

const MIGRATION_ATTEMPTS: u32 = 5;
const MIGRATION_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Get a database pool.
///
/// If `read_only` is `true`, the database will be opened in read-only mode.
pub async fn pool(db_uri: &str, read_only: bool) -> anyhow::Result<Pool<Sqlite>> {
    let opts = SqliteConnectOptions::from_str(db_uri)
        .context("The database URL couldn't be parsed.")?
        .create_if_missing(true)
        .foreign_keys(true)
        .read_only(read_only)
        .busy_timeout(Duration::from_secs(30))
        .optimize_on_close(true, Some(400));
    SqlitePool::connect_with(opts)
        .await
        .with_context(|| format!("Failed to connect to the database at {db_uri}"))
}

/// A configuration store and setup lock backed by a (possibly shared) SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open the database at `path`, creating and migrating it as necessary.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let uri = format!("sqlite://{}", path.display());
        let pool = pool(&uri, false).await?;
        migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing, migrated pool.
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

impl ConfigStore for SqliteStore {
    async fn get(&self, name: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM configuration WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn update(&self, name: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO configuration (name, value) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl RevocationLedger for SqliteStore {
    #[instrument(skip(self), err)]
    async fn record_revocation(&self, serial: &str, common_name: &str) -> Result<(), StoreError> {
        if serial.is_empty() && common_name.is_empty() {
            return Err(StoreError::EmptyRevocation);
        }
        sqlx::query(
            "INSERT INTO revoked_certificates (serial, common_name, revoked_at) VALUES (?, ?, ?)",
        )
        .bind(normalize_serial(serial))
        .bind(common_name)
        .bind(unix_millis(SystemTime::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revocations(&self) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query("SELECT serial, common_name FROM revoked_certificates")
            .fetch_all(&self.pool)
            .await?;
        let revoked = rows
            .iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("serial")?,
                    row.try_get::<String, _>("common_name")?,
                ))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        Ok(revoked)
    }
}

impl LeaseLock for SqliteStore {
    async fn try_acquire(&self, name: &str, holder: &str, lease: Duration) -> Result<bool, StoreError> {
        let now = SystemTime::now();
        let result = sqlx::query(
            "INSERT INTO setup_locks (name, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE setup_locks.expires_at <= ?4 OR setup_locks.holder = excluded.holder",
        )
        .bind(name)
        .bind(holder)
        .bind(unix_millis(now + lease))
        .bind(unix_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM setup_locks WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revocation::{refresh, RevocationList, RevocationStore};

    async fn store(dir: &tempfile::TempDir) -> anyhow::Result<SqliteStore> {
        SqliteStore::open(&dir.path().join("rootca.sqlite")).await
    }

    #[tokio::test]
    async fn configuration_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(&dir).await?;
        assert_eq!(store.get("root.issuer.dn").await?, None);
        store.update("root.issuer.dn", "CN=one").await?;
        store.update("root.issuer.dn", "CN=two").await?;
        assert_eq!(store.get("root.issuer.dn").await?.as_deref(), Some("CN=two"));

        // A second connection to the same file sees the same values.
        let other = SqliteStore::open(&dir.path().join("rootca.sqlite")).await?;
        assert_eq!(other.get("root.issuer.dn").await?.as_deref(), Some("CN=two"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_opens_of_a_fresh_database() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("rootca.sqlite");
        let opens = (0..4)
            .map(|_| {
                let path = path.clone();
                tokio::spawn(async move { SqliteStore::open(&path).await })
            })
            .collect::<Vec<_>>();
        for open in opens {
            let store = open.await??;
            store.update("root.issuer.dn", "CN=shared").await?;
        }

        let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
            .fetch_one(store(&dir).await?.pool())
            .await?;
        assert_eq!(applied, MIGRATIONS.iter().count() as i64);
        Ok(())
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released_or_expired() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(&dir).await?;
        let lease = Duration::from_secs(60);

        assert!(store.try_acquire("root-ca-setup", "a", lease).await?);
        assert!(!store.try_acquire("root-ca-setup", "b", lease).await?);
        assert!(store.try_acquire("root-ca-setup", "a", lease).await?);
        store.release("root-ca-setup", "b").await?;
        assert!(!store.try_acquire("root-ca-setup", "b", lease).await?);
        store.release("root-ca-setup", "a").await?;
        assert!(store.try_acquire("root-ca-setup", "b", Duration::ZERO).await?);

        // b's lease has already expired.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.try_acquire("root-ca-setup", "c", lease).await?);
        Ok(())
    }

    #[tokio::test]
    async fn revocations_load_into_list() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(&dir).await?;
        store.record_revocation("0x00BEEF", "").await?;
        store.record_revocation("", "stolen.example").await?;
        assert!(matches!(
            store.record_revocation("", "").await,
            Err(StoreError::EmptyRevocation)
        ));

        let list = RevocationList::new();
        list.revoke("1234", "");
        refresh(&store, &list).await?;
        assert!(list.is_revoked("BEEF", None));
        assert!(list.is_revoked("1", Some("stolen.example")));
        assert!(!list.is_revoked("1234", None));
        Ok(())
    }
}
