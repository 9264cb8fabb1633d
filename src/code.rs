//! Single-use numeric codes tied to a principal and an expiry.

use chrono::{Duration, Utc};
use rand::Rng;
use rand::rngs::OsRng;

use crate::database::{CodeRow, Database};
use crate::error::{Result, ServerError};

/// Codes expire 10 minutes after issuance.
const VALIDITY_MINUTES: i64 = 10;
const CODE_DIGITS: u32 = 6;

/// Issues, verifies and invalidates one-time codes.
#[derive(Clone)]
pub struct CodeStore {
    db: Database,
}

impl CodeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Issue a fresh code for `principal`, invalidating every still-unused
    /// code first so at most one consumable code exists at any instant.
    ///
    /// The returned code is for out-of-band delivery only; callers must
    /// not hand it out if persistence failed.
    pub async fn issue(&self, principal: &str) -> Result<String> {
        self.invalidate_all(principal).await?;

        let code = format!("{:06}", OsRng.gen_range(0..10u32.pow(CODE_DIGITS)));
        let created_at = Utc::now();
        let expires_at = created_at + Duration::minutes(VALIDITY_MINUTES);

        match &self.db {
            Database::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO one_time_codes
                     (principal_id, code, created_at, expires_at, used)
                     VALUES ($1, $2, $3, $4, false)",
                )
                .bind(principal)
                .bind(&code)
                .bind(created_at)
                .bind(expires_at)
                .execute(pool)
                .await?;
            },
            Database::Memory(memory) => {
                memory.codes.entry(principal.to_string()).or_default().push(
                    CodeRow {
                        code: code.clone(),
                        created_at,
                        expires_at,
                        used: false,
                    },
                );
            },
        }

        tracing::debug!(%principal, "one-time code issued");
        Ok(code)
    }

    /// Consume a code: exact match, unused, unexpired.
    ///
    /// Consumption is atomic per code row (conditional update on
    /// `used = false`), so a single code cannot be redeemed twice under
    /// concurrent calls. Every failure reason collapses into
    /// [`ServerError::InvalidOrExpiredCode`].
    pub async fn verify(&self, principal: &str, code: &str) -> Result<()> {
        let now = Utc::now();

        let consumed = match &self.db {
            Database::Postgres(pool) => {
                let row = sqlx::query(
                    "UPDATE one_time_codes SET used = true
                     WHERE id = (
                         SELECT id FROM one_time_codes
                         WHERE principal_id = $1 AND code = $2
                           AND used = false AND expires_at > $3
                         ORDER BY created_at DESC LIMIT 1
                         FOR UPDATE SKIP LOCKED
                     )
                     RETURNING id",
                )
                .bind(principal)
                .bind(code)
                .bind(now)
                .fetch_optional(pool)
                .await?;

                row.is_some()
            },
            Database::Memory(memory) => {
                // The dashmap entry guard makes read-candidate-then-mark
                // a single step per principal.
                match memory.codes.get_mut(principal) {
                    Some(mut rows) => rows
                        .iter_mut()
                        .rev()
                        .find(|row| {
                            !row.used
                                && row.code == code
                                && row.expires_at > now
                        })
                        .map(|row| row.used = true)
                        .is_some(),
                    None => false,
                }
            },
        };

        if consumed {
            Ok(())
        } else {
            Err(ServerError::InvalidOrExpiredCode)
        }
    }

    /// Mark every outstanding code used. Called on unenrollment, method
    /// switch and before issuing a replacement code.
    pub async fn invalidate_all(&self, principal: &str) -> Result<()> {
        match &self.db {
            Database::Postgres(pool) => {
                sqlx::query(
                    "UPDATE one_time_codes SET used = true
                     WHERE principal_id = $1 AND used = false",
                )
                .bind(principal)
                .execute(pool)
                .await?;
            },
            Database::Memory(memory) => {
                if let Some(mut rows) = memory.codes.get_mut(principal) {
                    for row in rows.iter_mut() {
                        row.used = true;
                    }
                }
            },
        }

        Ok(())
    }
}
