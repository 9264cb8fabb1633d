//! Enrollment and challenge orchestration.
//!
//! Sequences the per-principal factor state machine: `NoFactor` to
//! `TotpEnrolled` or `EmailEnrolled` through a pending verification step,
//! with switches between the two clearing the other method's artifacts
//! first. The registry method is only ever committed after a successful
//! verification, so no failure path leaves a half-finished enrollment
//! granting reduced assurance.

use std::time::Duration;

use crate::code::CodeStore;
use crate::config::Mfa as MfaConfig;
use crate::error::{Result, ServerError};
use crate::identity::Identity;
use crate::limiter::RateLimiter;
use crate::mail::MailManager;
use crate::proof::ProofSigner;
use crate::registry::{FactorRegistry, Method};
use crate::totp::{LocalTotpProvider, PendingFactor};

const SEND_LIMIT_PREFIX: &str = "mfa-email:";
const VERIFY_LIMIT_PREFIX: &str = "mfa-verify:";

/// Outcome of a successful email-code verification.
#[derive(Debug)]
pub struct EmailVerified {
    /// Fresh session proof cookie for the caller to set.
    pub cookie: String,
    /// Whether this verification committed a new enrollment.
    pub enrolled: bool,
}

/// Drives enrollment and challenge flows for both factor kinds.
#[derive(Clone)]
pub struct Orchestrator {
    pub registry: FactorRegistry,
    codes: CodeStore,
    provider: LocalTotpProvider,
    signer: ProofSigner,
    mail: MailManager,
    limiter: RateLimiter,
    config: MfaConfig,
}

impl Orchestrator {
    pub fn new(
        registry: FactorRegistry,
        codes: CodeStore,
        provider: LocalTotpProvider,
        signer: ProofSigner,
        mail: MailManager,
        limiter: RateLimiter,
        config: MfaConfig,
    ) -> Self {
        Self {
            registry,
            codes,
            provider,
            signer,
            mail,
            limiter,
            config,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    fn check_limit(&self, prefix: &str, principal: &str, max: u32) -> Result<()> {
        let verdict = self.limiter.check(
            &format!("{prefix}{principal}"),
            max,
            self.window(),
        );
        if verdict.allowed {
            Ok(())
        } else {
            Err(ServerError::RateLimited {
                retry_in: verdict.reset_in,
            })
        }
    }

    /// Start TOTP enrollment: retire any half-enrolled factor left behind,
    /// then request a fresh one. The registry method stays untouched until
    /// the factor is verified.
    ///
    /// An already-committed TOTP enrollment is refused; the principal must
    /// unenroll first, which the gate only allows at elevated assurance.
    pub async fn start_totp_enroll(
        &self,
        identity: &Identity,
    ) -> Result<PendingFactor> {
        if self.registry.get_method(&identity.id).await? == Method::Totp {
            return Err(ServerError::FactorExists);
        }
        if let Some(stale) = self.registry.totp_ref(&identity.id).await? {
            self.provider.unenroll(&identity.id, &stale);
        }

        let factor = self.provider.start_enroll(&identity.id)?;
        self.registry
            .set_totp_ref(&identity.id, Some(&factor.factor_ref))
            .await?;

        tracing::info!(principal = %identity.id, "totp enrollment started");
        Ok(factor)
    }

    /// Verify a TOTP code, either to commit an enrollment or to answer a
    /// challenge. Enrollment commit clears any email-method artifacts.
    pub async fn verify_totp(
        &self,
        identity: &Identity,
        code: &str,
    ) -> Result<()> {
        self.check_limit(
            VERIFY_LIMIT_PREFIX,
            &identity.id,
            self.config.verify_limit,
        )?;

        let Some(factor_ref) = self.registry.totp_ref(&identity.id).await?
        else {
            return Err(ServerError::NotEnrolled);
        };

        if !self.provider.verify(&identity.id, &factor_ref, code)? {
            return Err(ServerError::InvalidOrExpiredCode);
        }

        if self.registry.get_method(&identity.id).await? != Method::Totp {
            // Switching from email: retire its codes before committing.
            self.codes.invalidate_all(&identity.id).await?;
            self.registry.set_method(&identity.id, Method::Totp).await?;
        }

        Ok(())
    }

    /// Unenroll the TOTP factor.
    pub async fn unenroll_totp(&self, identity: &Identity) -> Result<()> {
        if let Some(factor_ref) = self.registry.totp_ref(&identity.id).await? {
            self.provider.unenroll(&identity.id, &factor_ref);
            self.registry.set_totp_ref(&identity.id, None).await?;
        }
        self.registry.clear_method(&identity.id).await?;

        tracing::info!(principal = %identity.id, "totp unenrolled");
        Ok(())
    }

    /// Issue and deliver an email code. Enrollment and challenge share
    /// this path; neither touches the registry method.
    ///
    /// A code whose delivery fails is invalidated on the spot so no valid
    /// code is stranded without a successful send.
    pub async fn start_email(&self, identity: &Identity) -> Result<()> {
        if identity.email.is_empty() {
            tracing::warn!(principal = %identity.id, "no email address on identity");
            return Err(ServerError::DeliveryFailed);
        }

        self.check_limit(
            SEND_LIMIT_PREFIX,
            &identity.id,
            self.config.send_limit,
        )?;

        let code = self.codes.issue(&identity.id).await?;

        if let Err(err) = self.mail.send_code(&identity.email, &code).await {
            self.codes.invalidate_all(&identity.id).await?;
            tracing::warn!(principal = %identity.id, "code delivery failed");
            return Err(err);
        }

        Ok(())
    }

    /// Verify an email code. On success the Email method is committed if
    /// this was an enrollment (clearing TOTP artifacts), and a fresh
    /// session proof cookie is always issued.
    pub async fn verify_email(
        &self,
        identity: &Identity,
        code: &str,
    ) -> Result<EmailVerified> {
        self.check_limit(
            VERIFY_LIMIT_PREFIX,
            &identity.id,
            self.config.verify_limit,
        )?;

        self.codes.verify(&identity.id, code).await?;

        let mut enrolled = false;
        if self.registry.get_method(&identity.id).await? != Method::Email {
            // Enrollment commit; a previous TOTP factor is retired first
            // so the registry never reports both methods.
            if let Some(factor_ref) =
                self.registry.totp_ref(&identity.id).await?
            {
                self.provider.unenroll(&identity.id, &factor_ref);
                self.registry.set_totp_ref(&identity.id, None).await?;
            }
            self.registry.set_method(&identity.id, Method::Email).await?;
            enrolled = true;
        }

        let token = self.signer.sign(&identity.id)?;
        Ok(EmailVerified {
            cookie: self.signer.cookie(&token),
            enrolled,
        })
    }

    /// Unenroll the email method: clear the registry, retire outstanding
    /// codes and hand back an expired cookie for the caller to set.
    ///
    /// A still-circulating proof stays valid until its natural expiry;
    /// the 12 hour bound is accepted.
    pub async fn unenroll_email(&self, identity: &Identity) -> Result<String> {
        self.registry.clear_method(&identity.id).await?;
        self.codes.invalidate_all(&identity.id).await?;

        tracing::info!(principal = %identity.id, "email factor unenrolled");
        Ok(self.signer.expired_cookie())
    }
}
