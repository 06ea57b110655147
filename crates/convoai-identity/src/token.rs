use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use convoai_core::error::{ConvoError, Result};
use convoai_core::types::{Subject, UserRole};

type HmacSha256 = Hmac<Sha256>;

/// Verified token contents.
///
/// `roles` is carried as an opaque string set; only "admin" has meaning to
/// the core. Unknown role strings pass through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub roles: Vec<String>,
    /// Unix timestamp (seconds) after which the token is rejected.
    pub exp: i64,
}

impl Claims {
    pub fn new(sub: impl Into<String>, roles: Vec<String>, exp: i64) -> Self {
        Self {
            sub: sub.into(),
            roles,
            exp,
        }
    }

    pub fn subject(&self) -> Subject {
        Subject::from(self.sub.as_str())
    }

    pub fn role(&self) -> UserRole {
        if self.roles.iter().any(|r| r == "admin") {
            UserRole::Admin
        } else {
            UserRole::User
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role().is_admin()
    }
}

/// Stateless token verifier over a shared HMAC-SHA256 key.
///
/// Wire format: `base64url(claims_json) "." base64url(hmac)`. The MAC is
/// computed over the encoded claims segment, so the signed bytes are exactly
/// the bytes on the wire.
#[derive(Debug)]
pub struct Verifier {
    key: Vec<u8>,
}

impl Verifier {
    /// Build a verifier from the configured key. An empty key would accept
    /// trivially forged tokens, so it refuses to construct — the caller
    /// treats this as fatal at startup.
    pub fn new(key: &str) -> Result<Self> {
        if key.is_empty() {
            return Err(ConvoError::Config(
                "auth.verification_key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            key: key.as_bytes().to_vec(),
        })
    }

    /// Validate structure, signature, and expiry. Returns the claims or the
    /// precise rejection reason.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let (claims_b64, sig_b64) = token
            .split_once('.')
            .ok_or_else(|| ConvoError::InvalidToken("expected two segments".to_string()))?;

        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| ConvoError::InvalidToken("signature is not base64url".to_string()))?;

        // verify_slice is constant-time; never compare MACs with ==
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| ConvoError::Internal(format!("hmac init: {}", e)))?;
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| ConvoError::InvalidToken("signature mismatch".to_string()))?;

        let claims_json = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| ConvoError::InvalidToken("claims are not base64url".to_string()))?;
        let claims: Claims = serde_json::from_slice(&claims_json)
            .map_err(|e| ConvoError::InvalidToken(format!("claims malformed: {}", e)))?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(ConvoError::ExpiredToken {
                expired_at: claims.exp,
            });
        }

        Ok(claims)
    }

    /// Sign a claims set into a token. Used by the `mint-token` operator
    /// command and by tests; production tokens come from the identity store
    /// holding the same key.
    pub fn sign(&self, claims: &Claims) -> Result<String> {
        let claims_json = serde_json::to_vec(claims)?;
        let claims_b64 = URL_SAFE_NO_PAD.encode(claims_json);

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| ConvoError::Internal(format!("hmac init: {}", e)))?;
        mac.update(claims_b64.as_bytes());
        let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{}.{}", claims_b64, sig_b64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> Verifier {
        Verifier::new("test-key-with-plenty-of-entropy").unwrap()
    }

    fn future_exp() -> i64 {
        Utc::now().timestamp() + 3600
    }

    #[test]
    fn empty_key_refuses_to_construct() {
        let err = Verifier::new("").unwrap_err();
        assert_eq!(err.code(), "FATAL");
    }

    #[test]
    fn sign_verify_round_trip() {
        let v = verifier();
        let claims = Claims::new("alice", vec!["user".to_string()], future_exp());
        let token = v.sign(&claims).unwrap();

        let verified = v.verify(&token).unwrap();
        assert_eq!(verified.sub, "alice");
        assert_eq!(verified.role(), UserRole::User);
    }

    #[test]
    fn admin_role_is_detected() {
        let v = verifier();
        let claims = Claims::new(
            "root",
            vec!["ops".to_string(), "admin".to_string()],
            future_exp(),
        );
        let token = v.sign(&claims).unwrap();
        assert!(v.verify(&token).unwrap().is_admin());
    }

    #[test]
    fn expired_token_is_rejected() {
        let v = verifier();
        let claims = Claims::new("alice", vec![], Utc::now().timestamp() - 10);
        let token = v.sign(&claims).unwrap();

        let err = v.verify(&token).unwrap_err();
        assert_eq!(err.code(), "EXPIRED_TOKEN");
    }

    #[test]
    fn tampered_claims_are_rejected() {
        let v = verifier();
        let claims = Claims::new("alice", vec![], future_exp());
        let token = v.sign(&claims).unwrap();

        let forged_claims = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&Claims::new("mallory", vec!["admin".to_string()], future_exp()))
                .unwrap(),
        );
        let sig = token.split_once('.').unwrap().1;
        let forged = format!("{}.{}", forged_claims, sig);

        let err = v.verify(&forged).unwrap_err();
        assert_eq!(err.code(), "INVALID_TOKEN");
    }

    #[test]
    fn wrong_key_is_rejected() {
        let signer = Verifier::new("key-a").unwrap();
        let claims = Claims::new("alice", vec![], future_exp());
        let token = signer.sign(&claims).unwrap();

        let other = Verifier::new("key-b").unwrap();
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn garbage_is_invalid_not_a_panic() {
        let v = verifier();
        for input in ["", ".", "a.b.c", "notatoken", "x."] {
            let err = v.verify(input).unwrap_err();
            assert_eq!(err.code(), "INVALID_TOKEN", "input {:?}", input);
        }
    }
}
