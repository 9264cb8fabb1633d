//! Signed session proofs for email-code verification.
//!
//! A proof is a compact `principal:issued_ms:signature` token proving the
//! principal passed out-of-band verification recently. It is carried in a
//! cookie, never persisted server-side, and stays valid until its 12 hour
//! lifetime elapses: there is no revocation list.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, ServerError};

type HmacSha256 = Hmac<Sha256>;

/// Proof lifetime, in milliseconds.
pub const LIFETIME_MS: u64 = 12 * 60 * 60 * 1000;
const COOKIE_MAX_AGE_SECS: u64 = LIFETIME_MS / 1000;
const PARTS: usize = 3;

/// Signs and verifies session proofs with a process-wide HMAC secret.
#[derive(Clone)]
pub struct ProofSigner {
    secret: Vec<u8>,
    cookie_name: String,
    secure_cookie: bool,
}

impl ProofSigner {
    pub fn new(secret: &str, cookie_name: &str, secure_cookie: bool) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            cookie_name: cookie_name.to_owned(),
            secure_cookie,
        }
    }

    fn mac(&self, principal: &str, issued_ms: u64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(
            |err| ServerError::Internal {
                details: "invalid HMAC key".into(),
                source: Some(Box::new(err)),
            },
        )?;
        mac.update(principal.as_bytes());
        mac.update(b":");
        mac.update(issued_ms.to_string().as_bytes());
        Ok(mac)
    }

    /// Create a new proof for `principal`, issued now.
    pub fn sign(&self, principal: &str) -> Result<String> {
        self.sign_at(principal, now_ms()?)
    }

    fn sign_at(&self, principal: &str, issued_ms: u64) -> Result<String> {
        let tag = self.mac(principal, issued_ms)?.finalize().into_bytes();
        Ok(format!("{principal}:{issued_ms}:{}", hex::encode(tag)))
    }

    /// Check a proof against the expected principal.
    ///
    /// Any parse failure, principal mismatch, bad signature or elapsed
    /// lifetime yields `false` with no further detail. The signature check
    /// goes through [`Mac::verify_slice`], a constant-time comparison.
    pub fn verify(&self, token: &str, expected_principal: &str) -> bool {
        let parts: Vec<&str> = token.split(':').collect();
        if parts.len() != PARTS {
            return false;
        }

        let (principal, issued, signature) = (parts[0], parts[1], parts[2]);
        if principal != expected_principal {
            return false;
        }

        let Ok(issued_ms) = issued.parse::<u64>() else {
            return false;
        };
        let Ok(tag) = hex::decode(signature) else {
            return false;
        };

        let Ok(mac) = self.mac(principal, issued_ms) else {
            return false;
        };
        if mac.verify_slice(&tag).is_err() {
            return false;
        }

        match now_ms() {
            Ok(now) => now.saturating_sub(issued_ms) <= LIFETIME_MS,
            Err(_) => false,
        }
    }

    /// Cookie holding `token`, scoped site-wide.
    pub fn cookie(&self, token: &str) -> String {
        format!(
            "{}={token}; Max-Age={COOKIE_MAX_AGE_SECS}; Path=/; HttpOnly; SameSite=Lax{}",
            self.cookie_name,
            if self.secure_cookie { "; Secure" } else { "" },
        )
    }

    /// Cookie value instructing the client to drop its proof.
    pub fn expired_cookie(&self) -> String {
        format!(
            "{}=; Max-Age=0; Path=/; HttpOnly; SameSite=Lax{}",
            self.cookie_name,
            if self.secure_cookie { "; Secure" } else { "" },
        )
    }

    /// Extract this signer's cookie value from a `Cookie` request header.
    pub fn from_cookie_header<'a>(&self, header: &'a str) -> Option<&'a str> {
        header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == self.cookie_name).then_some(value)
        })
    }
}

fn now_ms() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| ServerError::Internal {
            details: "system clock before Unix epoch".into(),
            source: Some(Box::new(err)),
        })?
        .as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRINCIPAL: &str = "u1";

    fn signer() -> ProofSigner {
        ProofSigner::new("test-secret", "authgate_email_mfa", false)
    }

    #[test]
    fn test_sign_then_verify() {
        let signer = signer();
        let token = signer.sign(PRINCIPAL).unwrap();
        assert!(signer.verify(&token, PRINCIPAL));
    }

    #[test]
    fn test_wrong_principal_rejected() {
        let signer = signer();
        let token = signer.sign(PRINCIPAL).unwrap();
        assert!(!signer.verify(&token, "u2"));
    }

    #[test]
    fn test_flipped_signature_bit_rejected() {
        let signer = signer();
        let token = signer.sign(PRINCIPAL).unwrap();

        // Flip a single bit in the last hex nibble of the signature.
        let mut bytes = token.into_bytes();
        let last = bytes.last_mut().unwrap();
        *last = if *last == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert!(!signer.verify(&tampered, PRINCIPAL));
    }

    #[test]
    fn test_expiry_boundary() {
        let signer = signer();
        let now = now_ms().unwrap();

        let still_valid =
            signer.sign_at(PRINCIPAL, now - LIFETIME_MS + 5_000).unwrap();
        assert!(signer.verify(&still_valid, PRINCIPAL));

        // 12 hours + 1 second in the past.
        let expired =
            signer.sign_at(PRINCIPAL, now - LIFETIME_MS - 1_000).unwrap();
        assert!(!signer.verify(&expired, PRINCIPAL));
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        let signer = signer();
        assert!(!signer.verify("", PRINCIPAL));
        assert!(!signer.verify("u1:123", PRINCIPAL));
        assert!(!signer.verify("u1:123:ab:cd", PRINCIPAL));
        assert!(!signer.verify("u1:not-a-number:abcdef", PRINCIPAL));
        assert!(!signer.verify("u1:123:zzzz", PRINCIPAL));
    }

    #[test]
    fn test_other_secret_rejected() {
        let signer = signer();
        let other = ProofSigner::new("other-secret", "authgate_email_mfa", false);
        let token = other.sign(PRINCIPAL).unwrap();
        assert!(!signer.verify(&token, PRINCIPAL));
    }

    #[test]
    fn test_cookie_round_trip() {
        let signer = signer();
        let token = signer.sign(PRINCIPAL).unwrap();
        let header = format!("theme=dark; {}", signer.cookie(&token));

        // `cookie()` emits attributes after the value; a request header
        // only carries `name=value` pairs, so strip attributes first.
        let header = header.split("; Max-Age").next().unwrap().to_string();
        let value = signer.from_cookie_header(&header).unwrap();
        assert!(signer.verify(value, PRINCIPAL));
    }
}
