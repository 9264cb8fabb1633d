//! Per-principal record of which second factor is enrolled.
//!
//! The registry is deliberately dumb: a method is only ever written by the
//! orchestrator after a successful challenge of that method, so a
//! half-finished enrollment never grants reduced assurance.

use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::database::Database;
use crate::error::Result;

/// Enrolled second-factor method. At most one per principal.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    #[default]
    None,
    Totp,
    Email,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::None => "none",
            Method::Totp => "totp",
            Method::Email => "email",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "totp" => Method::Totp,
            "email" => Method::Email,
            _ => Method::None,
        }
    }
}

/// Factor registry over the external record store.
#[derive(Clone)]
pub struct FactorRegistry {
    db: Database,
}

impl FactorRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Read current enrollment.
    pub async fn get_method(&self, principal: &str) -> Result<Method> {
        match &self.db {
            Database::Postgres(pool) => {
                let row = sqlx::query(
                    "SELECT method FROM factors WHERE principal_id = $1",
                )
                .bind(principal)
                .fetch_optional(pool)
                .await?;

                Ok(row
                    .map(|row| Method::parse(row.get::<String, _>(0).as_str()))
                    .unwrap_or_default())
            },
            Database::Memory(memory) => Ok(memory
                .factors
                .get(principal)
                .map(|row| row.method)
                .unwrap_or_default()),
        }
    }

    /// Idempotent upsert. Callers only invoke this right after a
    /// verification success.
    pub async fn set_method(
        &self,
        principal: &str,
        method: Method,
    ) -> Result<()> {
        match &self.db {
            Database::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO factors (principal_id, method) VALUES ($1, $2)
                     ON CONFLICT (principal_id) DO UPDATE SET method = $2",
                )
                .bind(principal)
                .bind(method.as_str())
                .execute(pool)
                .await?;
            },
            Database::Memory(memory) => {
                memory.factors.entry(principal.to_string()).or_default().method =
                    method;
            },
        }

        tracing::info!(%principal, ?method, "factor method committed");
        Ok(())
    }

    /// Set method back to `None` on unenrollment.
    pub async fn clear_method(&self, principal: &str) -> Result<()> {
        self.set_method(principal, Method::None).await
    }

    /// Opaque reference to an in-flight or verified TOTP factor at the
    /// external provider.
    pub async fn totp_ref(&self, principal: &str) -> Result<Option<String>> {
        match &self.db {
            Database::Postgres(pool) => {
                let row = sqlx::query(
                    "SELECT totp_ref FROM factors WHERE principal_id = $1",
                )
                .bind(principal)
                .fetch_optional(pool)
                .await?;

                Ok(row.and_then(|row| row.get::<Option<String>, _>(0)))
            },
            Database::Memory(memory) => Ok(memory
                .factors
                .get(principal)
                .and_then(|row| row.totp_ref.clone())),
        }
    }

    pub async fn set_totp_ref(
        &self,
        principal: &str,
        totp_ref: Option<&str>,
    ) -> Result<()> {
        match &self.db {
            Database::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO factors (principal_id, method, totp_ref)
                     VALUES ($1, 'none', $2)
                     ON CONFLICT (principal_id) DO UPDATE SET totp_ref = $2",
                )
                .bind(principal)
                .bind(totp_ref)
                .execute(pool)
                .await?;
            },
            Database::Memory(memory) => {
                memory
                    .factors
                    .entry(principal.to_string())
                    .or_default()
                    .totp_ref = totp_ref.map(str::to_owned);
            },
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRINCIPAL: &str = "u1";

    #[tokio::test]
    async fn test_default_method_is_none() {
        let registry = FactorRegistry::new(Database::memory());
        assert_eq!(registry.get_method(PRINCIPAL).await.unwrap(), Method::None);
    }

    #[tokio::test]
    async fn test_set_and_clear_method() {
        let registry = FactorRegistry::new(Database::memory());

        registry.set_method(PRINCIPAL, Method::Email).await.unwrap();
        assert_eq!(
            registry.get_method(PRINCIPAL).await.unwrap(),
            Method::Email
        );

        // Upsert is idempotent.
        registry.set_method(PRINCIPAL, Method::Email).await.unwrap();
        assert_eq!(
            registry.get_method(PRINCIPAL).await.unwrap(),
            Method::Email
        );

        registry.clear_method(PRINCIPAL).await.unwrap();
        assert_eq!(registry.get_method(PRINCIPAL).await.unwrap(), Method::None);
    }

    #[tokio::test]
    async fn test_totp_ref_round_trip() {
        let registry = FactorRegistry::new(Database::memory());

        assert!(registry.totp_ref(PRINCIPAL).await.unwrap().is_none());
        registry.set_totp_ref(PRINCIPAL, Some("ref-1")).await.unwrap();
        assert_eq!(
            registry.totp_ref(PRINCIPAL).await.unwrap().as_deref(),
            Some("ref-1")
        );

        // Storing a ref must not enroll anything on its own.
        assert_eq!(registry.get_method(PRINCIPAL).await.unwrap(), Method::None);

        registry.set_totp_ref(PRINCIPAL, None).await.unwrap();
        assert!(registry.totp_ref(PRINCIPAL).await.unwrap().is_none());
    }
}
