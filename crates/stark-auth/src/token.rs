//! Token issuing and verification.
//!
//! The orchestrator deals in three principal kinds: operators (users calling
//! the admin surface), nodes (agents opening sessions), and pods
//! (short-lived, minted at deploy time to authenticate signaling frames).
//! All three are HS256 JWTs signed with the orchestrator's secret.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use stark_core::PodId;

use crate::error::{AuthError, Result};

/// Who a verified token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// An operator identity.
    User(String),
    /// A node agent identity.
    Node(String),
    /// A single pod.
    Pod(PodId),
}

impl Principal {
    /// The kind tag used in claims and error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Node(_) => "node",
            Self::Pod(_) => "pod",
        }
    }
}

/// Validated claims extracted from a token.
#[derive(Debug, Clone)]
pub struct ValidatedClaims {
    /// Who the token belongs to.
    pub principal: Principal,
    /// When the token expires.
    pub expires_at: DateTime<Utc>,
}

impl ValidatedClaims {
    /// Whether the token is within the refresh threshold of expiry.
    #[must_use]
    pub fn needs_refresh(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now <= threshold
    }
}

/// Trait for verifying bearer tokens.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a token and extract its claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is invalid or expired.
    async fn verify(&self, token: &str) -> Result<ValidatedClaims>;

    /// Verify a token and require a pod principal.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::WrongKind` for non-pod tokens.
    async fn verify_pod(&self, token: &str) -> Result<PodId> {
        let claims = self.verify(token).await?;
        match claims.principal {
            Principal::Pod(pod_id) => Ok(pod_id),
            other => Err(AuthError::WrongKind {
                expected: "pod",
                got: other.kind(),
            }),
        }
    }
}

/// Configuration for the token authority.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC signing secret.
    pub secret: String,
    /// Issuer claim stamped into and required of every token.
    pub issuer: String,
    /// Lifetime of pod tokens in seconds.
    pub pod_token_ttl_secs: u64,
    /// Lifetime of node tokens in seconds.
    pub node_token_ttl_secs: u64,
    /// How close to expiry a holder should refresh, in seconds.
    pub refresh_threshold_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: "stark".to_string(),
            pod_token_ttl_secs: 3600,
            node_token_ttl_secs: 24 * 3600,
            refresh_threshold_secs: 15 * 60,
        }
    }
}

impl AuthConfig {
    /// Build a config around a secret, keeping the other defaults.
    #[must_use]
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..Default::default()
        }
    }

    /// Load from environment variables (`STARK_AUTH_SECRET`,
    /// `STARK_AUTH_ISSUER`, `STARK_POD_TOKEN_TTL_SECS`,
    /// `STARK_TOKEN_REFRESH_THRESHOLD_SECS`).
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = std::env::var("STARK_AUTH_SECRET") {
            config.secret = val;
        }
        if let Ok(val) = std::env::var("STARK_AUTH_ISSUER") {
            config.issuer = val;
        }
        if let Ok(val) = std::env::var("STARK_POD_TOKEN_TTL_SECS") {
            if let Ok(n) = val.parse() {
                config.pod_token_ttl_secs = n;
            }
        }
        if let Ok(val) = std::env::var("STARK_TOKEN_REFRESH_THRESHOLD_SECS") {
            if let Ok(n) = val.parse() {
                config.refresh_threshold_secs = n;
            }
        }
        config
    }

    /// The refresh threshold as a `Duration`.
    #[must_use]
    pub fn refresh_threshold(&self) -> Duration {
        Duration::seconds(i64::try_from(self.refresh_threshold_secs).unwrap_or(i64::MAX))
    }
}

/// Raw claims as encoded in the JWT.
#[derive(Debug, Serialize, Deserialize)]
struct RawClaims {
    iss: String,
    sub: String,
    kind: String,
    exp: u64,
    iat: u64,
}

/// The HS256 token authority: issues and verifies all stark tokens.
pub struct TokenAuthority {
    config: AuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenAuthority {
    /// Create an authority from config.
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// The configuration this authority was built with.
    #[must_use]
    pub const fn config(&self) -> &AuthConfig {
        &self.config
    }

    fn issue(&self, sub: String, kind: &str, ttl_secs: u64) -> Result<String> {
        let now = Utc::now();
        #[allow(clippy::cast_sign_loss)]
        let iat = now.timestamp().max(0) as u64;
        let claims = RawClaims {
            iss: self.config.issuer.clone(),
            sub,
            kind: kind.to_string(),
            exp: iat + ttl_secs,
            iat,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("encode token: {e}")))
    }

    /// Issue an operator token.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn issue_user_token(&self, user: &str, ttl_secs: u64) -> Result<String> {
        self.issue(user.to_string(), "user", ttl_secs)
    }

    /// Issue a node agent token.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn issue_node_token(&self, node_name: &str) -> Result<String> {
        self.issue(node_name.to_string(), "node", self.config.node_token_ttl_secs)
    }

    /// Mint a short-lived pod-scoped token plus its refresh token.
    ///
    /// The pod token authenticates signaling frames from the pod; the
    /// refresh token (same subject, longer lifetime) lets the agent obtain a
    /// fresh pod token when the current one is within the refresh threshold.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn mint_pod_token(&self, pod_id: &PodId) -> Result<PodTokenPair> {
        let token = self.issue(pod_id.to_string(), "pod", self.config.pod_token_ttl_secs)?;
        let refresh_token = self.issue(
            pod_id.to_string(),
            "pod-refresh",
            self.config.pod_token_ttl_secs * 4,
        )?;
        Ok(PodTokenPair {
            token,
            refresh_token,
        })
    }

    /// Exchange a refresh token for a fresh pod token pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the refresh token is invalid, expired, or not a
    /// pod refresh token.
    pub fn refresh_pod_token(&self, refresh_token: &str) -> Result<PodTokenPair> {
        let raw = self.decode(refresh_token)?;
        if raw.kind != "pod-refresh" {
            return Err(AuthError::WrongKind {
                expected: "pod-refresh",
                got: "other",
            });
        }
        let pod_id: PodId = raw
            .sub
            .parse()
            .map_err(|_| AuthError::InvalidSubject(raw.sub.clone()))?;
        self.mint_pod_token(&pod_id)
    }

    fn decode(&self, token: &str) -> Result<RawClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.config.issuer]);
        validation.validate_exp = true;

        let data =
            decode::<RawClaims>(token, &self.decoding_key, &validation).map_err(|e| {
                match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                    jsonwebtoken::errors::ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
                    jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                        AuthError::InvalidSignature
                    }
                    _ => AuthError::InvalidToken(e.to_string()),
                }
            })?;
        Ok(data.claims)
    }

    fn claims_from_raw(raw: RawClaims) -> Result<ValidatedClaims> {
        let principal = match raw.kind.as_str() {
            "user" => Principal::User(raw.sub),
            "node" => Principal::Node(raw.sub),
            "pod" => {
                let pod_id = raw
                    .sub
                    .parse()
                    .map_err(|_| AuthError::InvalidSubject(raw.sub.clone()))?;
                Principal::Pod(pod_id)
            }
            other => {
                return Err(AuthError::InvalidToken(format!(
                    "unknown principal kind {other}"
                )))
            }
        };
        let expires_at = DateTime::from_timestamp(i64::try_from(raw.exp).unwrap_or(0), 0)
            .ok_or_else(|| AuthError::InvalidToken("bad exp".to_string()))?;
        Ok(ValidatedClaims {
            principal,
            expires_at,
        })
    }
}

#[async_trait]
impl TokenVerifier for TokenAuthority {
    async fn verify(&self, token: &str) -> Result<ValidatedClaims> {
        let raw = self.decode(token)?;
        Self::claims_from_raw(raw)
    }
}

/// A pod token and the refresh token that renews it.
#[derive(Debug, Clone)]
pub struct PodTokenPair {
    /// The short-lived pod token.
    pub token: String,
    /// The longer-lived refresh token.
    pub refresh_token: String,
}
