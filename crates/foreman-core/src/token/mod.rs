//! Scoped token generation and validation for worker authentication.
//!
//! Tokens are HMAC-SHA256 based, scoped to a (task_id, expert role) pair
//! and handed to each spawned worker through its environment.
//! Format: `foreman_wt_<task_id>.<role>.<hmac_hex>`

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Token prefix used to identify foreman worker tokens.
const TOKEN_PREFIX: &str = "foreman_wt_";

/// Errors that can occur during token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,

    #[error("missing token secret")]
    MissingSecret,
}

/// Configuration for token generation and validation.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// The HMAC secret key bytes.
    pub secret: Vec<u8>,
}

impl TokenConfig {
    /// Create a new TokenConfig with the given secret.
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Create a TokenConfig from the `FOREMAN_TOKEN_SECRET` environment
    /// variable (hex-encoded, as written by `foreman init`).
    pub fn from_env() -> Result<Self, TokenError> {
        let secret_hex =
            std::env::var("FOREMAN_TOKEN_SECRET").map_err(|_| TokenError::MissingSecret)?;
        let secret = hex::decode(&secret_hex).map_err(|e| {
            TokenError::InvalidFormat(format!("FOREMAN_TOKEN_SECRET is not valid hex: {e}"))
        })?;
        Ok(Self::new(secret))
    }
}

/// Claims extracted from a validated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// The task this token is scoped to.
    pub task_id: String,
    /// The expert role this token is scoped to.
    pub role: String,
}

/// Generate a scoped worker token for a given task and role.
///
/// The HMAC-SHA256 is computed over `<task_id>:<role>`. Task ids never
/// contain `.`, so the dot-separated layout parses unambiguously even for
/// roles that do.
pub fn generate_token(config: &TokenConfig, task_id: &str, role: &str) -> String {
    let message = format!("{task_id}:{role}");
    let mac = compute_hmac(&config.secret, message.as_bytes());
    let hmac_hex = hex::encode(mac);
    format!("{TOKEN_PREFIX}{task_id}.{role}.{hmac_hex}")
}

/// Validate a scoped worker token and extract its claims.
///
/// Recomputes the HMAC and compares in constant time before returning the
/// claims.
pub fn validate_token(config: &TokenConfig, token: &str) -> Result<TokenClaims, TokenError> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        TokenError::InvalidFormat(format!("token must start with {TOKEN_PREFIX:?}"))
    })?;

    // <task_id>.<role>.<hmac_hex>: the task id has no dots, the hex tail
    // has none either, so split once from each end.
    let (task_id, rest) = rest
        .split_once('.')
        .ok_or_else(|| TokenError::InvalidFormat("expected dot after task id".to_string()))?;
    let (role, hmac_hex) = rest
        .rsplit_once('.')
        .ok_or_else(|| TokenError::InvalidFormat("expected dot before hmac".to_string()))?;

    let provided_mac = hex::decode(hmac_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("hmac is not valid hex: {e}")))?;

    let message = format!("{task_id}:{role}");
    let mut mac = HmacSha256::new_from_slice(&config.secret)
        .map_err(|_| TokenError::MissingSecret)?;
    mac.update(message.as_bytes());
    mac.verify_slice(&provided_mac)
        .map_err(|_| TokenError::HmacMismatch)?;

    Ok(TokenClaims {
        task_id: task_id.to_string(),
        role: role.to_string(),
    })
}

fn compute_hmac(secret: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}
