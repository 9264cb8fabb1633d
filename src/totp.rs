//! Authenticator-factor provider boundary.
//!
//! The gate and orchestrator only orchestrate enrollment and challenge
//! calls against this interface and record outcomes; the code arithmetic
//! itself belongs to the provider. [`LocalTotpProvider`] is an in-process
//! RFC 6238 provider so the service is complete stand-alone; a hosted
//! provider can replace it behind the same surface.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha1::Sha1;
use std::sync::Arc;

use crate::config::Totp as TotpConfig;
use crate::error::{Result, ServerError};

const SECRET_BYTES: usize = 20;

/// How long a verified TOTP challenge keeps the session elevated.
const ELEVATION_SECS: u64 = 12 * 60 * 60;

/// Authenticator assurance level of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assurance {
    /// Primary authentication only.
    Password,
    /// Second factor verified recently.
    Elevated,
}

/// A factor created by [`LocalTotpProvider::start_enroll`], not yet verified.
#[derive(Debug, Clone)]
pub struct PendingFactor {
    /// Opaque id to hand back on verify/unenroll.
    pub factor_ref: String,
    /// `otpauth://` provisioning URI for the authenticator app.
    pub otpauth_uri: String,
}

/// In-process TOTP provider.
#[derive(Clone)]
pub struct LocalTotpProvider {
    config: TotpConfig,
    issuer: String,
    /// factor_ref -> base32 secret.
    factors: Arc<DashMap<String, String>>,
    /// principal -> unix second the elevation expires at.
    elevated_until: Arc<DashMap<String, u64>>,
}

impl LocalTotpProvider {
    pub fn new(config: TotpConfig, issuer: &str) -> Self {
        Self {
            config,
            issuer: issuer.to_owned(),
            factors: Arc::new(DashMap::new()),
            elevated_until: Arc::new(DashMap::new()),
        }
    }

    /// Create a fresh factor for `principal` and return its provisioning
    /// data.
    pub fn start_enroll(&self, principal: &str) -> Result<PendingFactor> {
        let mut secret_bytes = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut secret_bytes);
        let secret = base32::encode(
            base32::Alphabet::Rfc4648 { padding: false },
            &secret_bytes,
        );

        let mut ref_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut ref_bytes);
        let factor_ref = hex::encode(ref_bytes);

        let otpauth_uri = format!(
            "otpauth://totp/{}:{principal}?secret={secret}&issuer={}&digits={}&period={}",
            self.issuer, self.issuer, self.config.digits, self.config.period,
        );

        self.factors.insert(factor_ref.clone(), secret);

        Ok(PendingFactor {
            factor_ref,
            otpauth_uri,
        })
    }

    /// Check `code` against the factor. Success elevates the principal's
    /// assurance.
    pub fn verify(
        &self,
        principal: &str,
        factor_ref: &str,
        code: &str,
    ) -> Result<bool> {
        let secret = match self.factors.get(factor_ref) {
            Some(secret) => secret.clone(),
            None => return Ok(false),
        };

        let now = unix_seconds()?;
        let step = now / self.config.period;

        // Accept one step of clock drift on either side.
        let matched = (step.saturating_sub(1)..=step + 1).any(|counter| {
            generate(&secret, counter, self.config.digits)
                .map(|expected| expected == code)
                .unwrap_or(false)
        });

        if matched {
            self.elevated_until
                .insert(principal.to_string(), now + ELEVATION_SECS);
        }

        Ok(matched)
    }

    /// Remove a factor. Dropping the factor also drops the elevation it
    /// granted.
    pub fn unenroll(&self, principal: &str, factor_ref: &str) {
        self.factors.remove(factor_ref);
        self.elevated_until.remove(principal);
    }

    /// Current assurance level for `principal`.
    pub fn assurance(&self, principal: &str) -> Result<Assurance> {
        let now = unix_seconds()?;
        Ok(match self.elevated_until.get(principal) {
            Some(until) if *until > now => Assurance::Elevated,
            _ => Assurance::Password,
        })
    }

    #[cfg(test)]
    pub fn current_code(&self, factor_ref: &str) -> String {
        let secret = self.factors.get(factor_ref).unwrap().clone();
        let step = unix_seconds().unwrap() / self.config.period;
        generate(&secret, step, self.config.digits).unwrap()
    }
}

/// Generate a TOTP code for a time counter (RFC 6238, HMAC-SHA1).
fn generate(secret: &str, counter: u64, digits: u32) -> Result<String> {
    let key = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, secret)
        .ok_or_else(|| ServerError::Internal {
            details: "invalid base32 encoding".into(),
            source: None,
        })?;

    let mut mac =
        Hmac::<Sha1>::new_from_slice(&key).map_err(|err| {
            ServerError::Internal {
                details: "HMAC error".into(),
                source: Some(Box::new(err)),
            }
        })?;
    mac.update(&counter.to_be_bytes());
    let result = mac.finalize().into_bytes();

    // Dynamic truncation (RFC 6238).
    let offset = (result[19] & 0x0f) as usize;
    let binary_code = ((result[offset] as u32 & 0x7f) << 24)
        | ((result[offset + 1] as u32) << 16)
        | ((result[offset + 2] as u32) << 8)
        | (result[offset + 3] as u32);

    let code = binary_code % 10u32.pow(digits);
    Ok(format!("{code:0>width$}", width = digits as usize))
}

fn unix_seconds() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| ServerError::Internal {
            details: "system clock before Unix epoch".into(),
            source: Some(Box::new(err)),
        })?
        .as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRINCIPAL: &str = "u1";

    fn provider() -> LocalTotpProvider {
        LocalTotpProvider::new(TotpConfig::default(), "authgate")
    }

    #[test]
    fn test_rfc6238_vector() {
        // RFC 6238 Appendix B, SHA-1, T=59s => counter 1, 8 digits.
        let secret = base32::encode(
            base32::Alphabet::Rfc4648 { padding: false },
            b"12345678901234567890",
        );
        assert_eq!(generate(&secret, 1, 8).unwrap(), "94287082");
    }

    #[test]
    fn test_enroll_verify_elevates() {
        let provider = provider();
        let factor = provider.start_enroll(PRINCIPAL).unwrap();
        assert!(factor.otpauth_uri.starts_with("otpauth://totp/"));
        assert_eq!(
            provider.assurance(PRINCIPAL).unwrap(),
            Assurance::Password
        );

        let code = provider.current_code(&factor.factor_ref);
        assert!(provider.verify(PRINCIPAL, &factor.factor_ref, &code).unwrap());
        assert_eq!(
            provider.assurance(PRINCIPAL).unwrap(),
            Assurance::Elevated
        );
    }

    #[test]
    fn test_wrong_code_rejected() {
        let provider = provider();
        let factor = provider.start_enroll(PRINCIPAL).unwrap();

        let code = provider.current_code(&factor.factor_ref);
        let wrong = if code == "000000" { "000001" } else { "000000" };
        assert!(!provider.verify(PRINCIPAL, &factor.factor_ref, wrong).unwrap());
        assert_eq!(
            provider.assurance(PRINCIPAL).unwrap(),
            Assurance::Password
        );
    }

    #[test]
    fn test_unenroll_drops_elevation() {
        let provider = provider();
        let factor = provider.start_enroll(PRINCIPAL).unwrap();
        let code = provider.current_code(&factor.factor_ref);
        assert!(provider.verify(PRINCIPAL, &factor.factor_ref, &code).unwrap());

        provider.unenroll(PRINCIPAL, &factor.factor_ref);
        assert_eq!(
            provider.assurance(PRINCIPAL).unwrap(),
            Assurance::Password
        );
        assert!(
            !provider
                .verify(PRINCIPAL, &factor.factor_ref, &code)
                .unwrap()
        );
    }
}
