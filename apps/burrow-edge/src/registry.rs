//! Subdomain registry backed by SQLite. The unique index on
//! `subdomain` is authoritative for allocation: the allocator inserts
//! optimistically and treats a unique violation as a collision.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::blocklist::is_subdomain_blocked;

/// Allocation attempts before the register call fails with a 500.
const MAX_ALLOCATION_TRIES: usize = 10;

/// Attempts at the starting length before the allocator begins
/// growing the subdomain by one character per retry.
const TRIES_AT_BASE_LENGTH: usize = 4;

const BASE_SUBDOMAIN_LENGTH: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("subdomain allocation budget exhausted")]
    AllocationExhausted,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, FromRow)]
pub struct TunnelRow {
    pub subdomain: String,
    pub client_id: String,
    pub port: i64,
    pub config: String,
}

/// Outcome of an idempotent register call for one `(client_id, port)`.
#[derive(Debug)]
pub struct EnsureOutcome {
    pub subdomain: String,
    /// True when an existing row's config was overwritten; the caller
    /// must invalidate its config cache for this subdomain.
    pub config_updated: bool,
}

#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    pub async fn connect(database_url: &str) -> Result<Self, RegistryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        sqlx::raw_sql(include_str!("../schema.sql"))
            .execute(&pool)
            .await?;
        Ok(Self { pool })
    }

    /// Return the existing subdomain for `(client_id, port)` or
    /// allocate a fresh one. A config supplied for an existing row
    /// replaces the stored config.
    pub async fn ensure_tunnel(
        &self,
        client_id: &str,
        port: u16,
        config: Option<&serde_json::Value>,
    ) -> Result<EnsureOutcome, RegistryError> {
        if let Some(row) = self.lookup(client_id, port).await? {
            let mut config_updated = false;
            if let Some(config) = config {
                sqlx::query("UPDATE tunnels SET config = ?1 WHERE subdomain = ?2")
                    .bind(config.to_string())
                    .bind(&row.subdomain)
                    .execute(&self.pool)
                    .await?;
                config_updated = true;
            }
            return Ok(EnsureOutcome {
                subdomain: row.subdomain,
                config_updated,
            });
        }

        let subdomain = self.allocate(client_id, port, config).await?;
        Ok(EnsureOutcome {
            subdomain,
            config_updated: false,
        })
    }

    pub async fn lookup(
        &self,
        client_id: &str,
        port: u16,
    ) -> Result<Option<TunnelRow>, RegistryError> {
        let row = sqlx::query_as::<_, TunnelRow>(
            "SELECT subdomain, client_id, port, config FROM tunnels \
             WHERE client_id = ?1 AND port = ?2",
        )
        .bind(client_id)
        .bind(i64::from(port))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Stored config for one subdomain, `None` when unregistered.
    pub async fn tunnel_config(
        &self,
        subdomain: &str,
    ) -> Result<Option<serde_json::Value>, RegistryError> {
        let config: Option<String> =
            sqlx::query_scalar("SELECT config FROM tunnels WHERE subdomain = ?1")
                .bind(subdomain)
                .fetch_optional(&self.pool)
                .await?;
        Ok(config.map(|raw| serde_json::from_str(&raw).unwrap_or_default()))
    }

    async fn allocate(
        &self,
        client_id: &str,
        port: u16,
        config: Option<&serde_json::Value>,
    ) -> Result<String, RegistryError> {
        for attempt in 0..MAX_ALLOCATION_TRIES {
            let length = if attempt < TRIES_AT_BASE_LENGTH {
                BASE_SUBDOMAIN_LENGTH
            } else {
                BASE_SUBDOMAIN_LENGTH + (attempt - TRIES_AT_BASE_LENGTH) + 1
            };
            let candidate = generate_subdomain(length);
            match self.insert(&candidate, client_id, port, config).await {
                Ok(()) => return Ok(candidate),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    debug!(%candidate, attempt, "subdomain collision, retrying");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(RegistryError::AllocationExhausted)
    }

    async fn insert(
        &self,
        subdomain: &str,
        client_id: &str,
        port: u16,
        config: Option<&serde_json::Value>,
    ) -> Result<(), sqlx::Error> {
        let config = config
            .map(|c| c.to_string())
            .unwrap_or_else(|| "{}".to_string());
        sqlx::query(
            "INSERT INTO tunnels (subdomain, client_id, port, config) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(subdomain)
        .bind(client_id)
        .bind(i64::from(port))
        .bind(config)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Random lowercase-alphanumeric subdomain of the given length.
/// Blocklisted words are rejected at generation; regeneration does not
/// consume an allocation attempt.
pub fn generate_subdomain(length: usize) -> String {
    loop {
        let candidate: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(|b| (b as char).to_ascii_lowercase())
            .collect();
        if !is_subdomain_blocked(&candidate) {
            return candidate;
        }
    }
}
