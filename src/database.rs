//! Storage union backing the factor registry and one-time code store.
//!
//! The authorization subsystem treats persistence as an external record
//! store. Two backends implement it: PostgreSQL for deployments, and a
//! process-memory backend used when no `postgres` entry is configured
//! (and by the test suite).

use std::sync::Arc;

use axum::extract::FromRef;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::AppState;
use crate::registry::Method;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "authgate";
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Custom db structure to pass to Axum.
#[derive(Clone)]
pub enum Database {
    Postgres(PgPool),
    Memory(Arc<Memory>),
}

/// Process-memory record tables.
#[derive(Default)]
pub struct Memory {
    /// One factor row per principal.
    pub factors: DashMap<String, FactorRow>,
    /// All one-time codes ever issued per principal, newest last.
    pub codes: DashMap<String, Vec<CodeRow>>,
}

/// Per-principal factor record.
#[derive(Debug, Clone, Default)]
pub struct FactorRow {
    pub method: Method,
    pub totp_ref: Option<String>,
}

/// One-time code record.
#[derive(Debug, Clone)]
pub struct CodeRow {
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl Database {
    /// Init PostgreSQL connection pool.
    pub async fn new(
        hostname: &str,
        username: &str,
        password: &str,
        db: &str,
        pool: u32,
    ) -> Result<Self, sqlx::Error> {
        let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
        let pool = PgPoolOptions::new().max_connections(pool);
        let postgres = pool.connect(&addr).await?;

        tracing::info!(%hostname, %db, "postgres connected");

        Ok(Self::Postgres(postgres))
    }

    /// Process-memory backend, records are lost on restart.
    pub fn memory() -> Self {
        Self::Memory(Arc::new(Memory::default()))
    }
}

impl FromRef<AppState> for Database {
    fn from_ref(app_state: &AppState) -> Database {
        app_state.db.clone()
    }
}
