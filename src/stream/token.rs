use crate::config::StreamConfig;
use crate::error::{Result, TokenRejection, WardenError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_VERSION: &str = "1";
pub const DEFAULT_SCOPE: &str = "default";
/// Scope granting access to every process stream regardless of subject
pub const ALL_SCOPE: &str = "all";

const MAX_SUBJECT_CHARS: usize = 256;
const MAX_PAYLOAD_SEGMENT: usize = 4096;
const MAX_SIGNATURE_SEGMENT: usize = 128;
const MAX_PAYLOAD_BYTES: usize = 4096;

/// Signed contents of a session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub subject: String,
    /// Expiry, unix milliseconds
    pub exp: i64,
    pub version: String,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

impl TokenClaims {
    /// Whether these claims may open the stream of `process`
    pub fn grants(&self, process: &str) -> bool {
        self.scope == ALL_SCOPE || self.subject == process
    }
}

/// Issues and verifies HMAC-SHA256 session tokens
#[derive(Clone)]
pub struct TokenSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    /// Random secret that lives as long as the process
    pub fn ephemeral() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        Self::new(hex)
    }

    /// Production deployments must supply the secret; elsewhere an ephemeral one is generated
    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        match &config.secret {
            Some(secret) => Ok(Self::new(secret)),
            None if config.environment.is_production() => Err(WardenError::ConfigError(
                "INTERNAL_SSE_SECRET is required in production".to_string(),
            )),
            None => {
                tracing::warn!("using an ephemeral stream token secret; set INTERNAL_SSE_SECRET to keep tokens valid across restarts");
                Ok(Self::ephemeral())
            }
        }
    }

    fn mac(&self, payload: &[u8]) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| WardenError::Internal(format!("invalid HMAC key: {}", e)))?;
        mac.update(payload);
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    pub fn issue(&self, subject: &str, ttl: Duration, scope: &str) -> Result<String> {
        self.issue_at(subject, ttl, scope, chrono::Utc::now().timestamp_millis())
    }

    pub fn issue_at(&self, subject: &str, ttl: Duration, scope: &str, now_ms: i64) -> Result<String> {
        if subject.trim().is_empty() {
            return Err(WardenError::InvalidSubject);
        }

        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let claims = TokenClaims {
            subject: subject.chars().take(MAX_SUBJECT_CHARS).collect(),
            exp: now_ms.saturating_add(ttl_ms),
            version: TOKEN_VERSION.to_string(),
            scope: if scope.is_empty() {
                DEFAULT_SCOPE.to_string()
            } else {
                scope.to_string()
            },
        };
        let payload = serde_json::to_vec(&claims)
            .map_err(|e| WardenError::SerializationError(e.to_string()))?;
        let signature = self.mac(&payload)?;

        Ok(format!("{}.{}", URL_SAFE_NO_PAD.encode(&payload), signature))
    }

    pub fn verify(&self, token: Option<&str>) -> Result<TokenClaims> {
        self.verify_at(token, chrono::Utc::now().timestamp_millis())
    }

    /// Checks run in order: shape, size, signature, expiry, version
    pub fn verify_at(&self, token: Option<&str>, now_ms: i64) -> Result<TokenClaims> {
        self.check(token, now_ms).map_err(WardenError::InvalidToken)
    }

    fn check(&self, token: Option<&str>, now_ms: i64) -> std::result::Result<TokenClaims, TokenRejection> {
        let token = token.filter(|t| !t.is_empty()).ok_or(TokenRejection::Missing)?;

        let mut parts = token.split('.');
        let (Some(payload_b64), Some(signature), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenRejection::Malformed);
        };

        if payload_b64.len() > MAX_PAYLOAD_SEGMENT || signature.len() > MAX_SIGNATURE_SEGMENT {
            return Err(TokenRejection::TooLarge);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenRejection::ParseError)?;
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(TokenRejection::PayloadTooLarge);
        }

        let expected = self.mac(&payload).map_err(|_| TokenRejection::BadSignature)?;
        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(TokenRejection::BadSignature);
        }

        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenRejection::ParseError)?;

        if now_ms > claims.exp {
            return Err(TokenRejection::Expired);
        }
        if claims.version != TOKEN_VERSION {
            return Err(TokenRejection::BadVersion);
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn signer() -> TokenSigner {
        TokenSigner::new("test-secret")
    }

    fn rejection(result: Result<TokenClaims>) -> TokenRejection {
        match result {
            Err(WardenError::InvalidToken(reason)) => reason,
            other => panic!("expected token rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_fresh_token_verifies() {
        let token = signer()
            .issue_at("alice", Duration::from_secs(600), DEFAULT_SCOPE, NOW)
            .unwrap();
        let claims = signer().verify_at(Some(&token), NOW + 1000).unwrap();
        assert_eq!(claims.subject, "alice");
        assert_eq!(claims.scope, DEFAULT_SCOPE);
        assert_eq!(claims.exp, NOW + 600_000);
        assert_eq!(claims.version, TOKEN_VERSION);
    }

    #[test]
    fn test_huge_ttl_saturates_expiry() {
        let token = signer()
            .issue_at("alice", Duration::from_secs(u64::MAX), DEFAULT_SCOPE, NOW)
            .unwrap();
        let claims = signer().verify_at(Some(&token), NOW).unwrap();
        assert_eq!(claims.exp, i64::MAX);
    }

    #[test]
    fn test_expired_token_rejected_despite_signature() {
        let token = signer()
            .issue_at("alice", Duration::from_secs(60), DEFAULT_SCOPE, NOW)
            .unwrap();
        assert_eq!(
            rejection(signer().verify_at(Some(&token), NOW + 60_001)),
            TokenRejection::Expired
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let token = signer()
            .issue_at("alice", Duration::from_secs(60), DEFAULT_SCOPE, NOW)
            .unwrap();
        let (_, signature) = token.split_once('.').unwrap();
        let forged = serde_json::json!({
            "subject": "mallory",
            "exp": NOW + 60_000,
            "version": TOKEN_VERSION,
            "scope": ALL_SCOPE,
        });
        let forged = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap()),
            signature
        );
        assert_eq!(
            rejection(signer().verify_at(Some(&forged), NOW)),
            TokenRejection::BadSignature
        );

        let other_key = TokenSigner::new("another-secret");
        assert_eq!(
            rejection(other_key.verify_at(Some(&token), NOW)),
            TokenRejection::BadSignature
        );
    }

    #[test]
    fn test_shape_and_size_rejections() {
        let s = signer();
        assert_eq!(rejection(s.verify_at(None, NOW)), TokenRejection::Missing);
        assert_eq!(rejection(s.verify_at(Some(""), NOW)), TokenRejection::Missing);
        assert_eq!(rejection(s.verify_at(Some("abc"), NOW)), TokenRejection::Malformed);
        assert_eq!(rejection(s.verify_at(Some("a.b.c"), NOW)), TokenRejection::Malformed);

        let huge = format!("{}.sig", "A".repeat(5000));
        assert_eq!(rejection(s.verify_at(Some(&huge), NOW)), TokenRejection::TooLarge);
        let long_sig = format!("abc.{}", "A".repeat(200));
        assert_eq!(rejection(s.verify_at(Some(&long_sig), NOW)), TokenRejection::TooLarge);

        assert_eq!(rejection(s.verify_at(Some("!!!.sig"), NOW)), TokenRejection::ParseError);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let s = signer();
        let claims = TokenClaims {
            subject: "alice".to_string(),
            exp: NOW + 60_000,
            version: "0".to_string(),
            scope: DEFAULT_SCOPE.to_string(),
        };
        let payload = serde_json::to_vec(&claims).unwrap();
        let token = format!("{}.{}", URL_SAFE_NO_PAD.encode(&payload), s.mac(&payload).unwrap());
        assert_eq!(rejection(s.verify_at(Some(&token), NOW)), TokenRejection::BadVersion);
    }

    #[test]
    fn test_subject_rules() {
        let s = signer();
        assert!(matches!(
            s.issue_at("  ", Duration::from_secs(60), DEFAULT_SCOPE, NOW),
            Err(WardenError::InvalidSubject)
        ));

        let long = "x".repeat(300);
        let token = s.issue_at(&long, Duration::from_secs(60), "", NOW).unwrap();
        let claims = s.verify_at(Some(&token), NOW).unwrap();
        assert_eq!(claims.subject.len(), 256);
        assert_eq!(claims.scope, DEFAULT_SCOPE);
    }

    #[test]
    fn test_scope_grants() {
        let mut claims = TokenClaims {
            subject: "bot_1".to_string(),
            exp: NOW,
            version: TOKEN_VERSION.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
        };
        assert!(claims.grants("bot_1"));
        assert!(!claims.grants("bot_2"));
        claims.scope = ALL_SCOPE.to_string();
        assert!(claims.grants("bot_2"));
    }

    #[test]
    fn test_production_requires_secret() {
        let mut config = StreamConfig {
            environment: crate::config::Environment::Production,
            secret: None,
            ..StreamConfig::default()
        };
        assert!(TokenSigner::from_config(&config).is_err());
        config.secret = Some("s3cret".to_string());
        assert!(TokenSigner::from_config(&config).is_ok());
        config.environment = crate::config::Environment::Development;
        config.secret = None;
        assert!(TokenSigner::from_config(&config).is_ok());
    }
}
