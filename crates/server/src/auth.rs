use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// JWT claims for authenticated API callers and viewers.
///
/// `owner` is the owner scope the caller may act within: agent listings,
/// token mints, relays, and transfers are all authorized against it.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Owner scope
    pub owner: Uuid,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    pub iat: u64,
}

const TOKEN_EXPIRY_SECS: u64 = 24 * 60 * 60; // 24 hours

/// Generate a JWT for an authenticated user within an owner scope.
pub fn generate_jwt(user_id: &str, owner: Uuid, secret: &str) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock error")?
        .as_secs();

    let claims = Claims {
        sub: user_id.to_string(),
        owner,
        iat: now,
        exp: now + TOKEN_EXPIRY_SECS,
    };

    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("Failed to encode JWT")?;

    Ok(token)
}

/// Validate a JWT and return the claims.
pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims> {
    let validation = Validation::new(Algorithm::HS256);

    let token_data: TokenData<Claims> = jsonwebtoken::decode(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .context("Invalid or expired token")?;

    Ok(token_data.claims)
}

/// Generate a cryptographically secure random hex string of `n` bytes
/// (2n hex chars). Used for the JWT secret and for one-shot session tokens.
///
/// Uses `/dev/urandom` for CSPRNG on Linux.
pub fn random_hex(n: usize) -> String {
    use std::fmt::Write;
    use std::io::Read;
    let mut bytes = vec![0u8; n];
    let f = std::fs::File::open("/dev/urandom").expect("Failed to open /dev/urandom");
    (&f).read_exact(&mut bytes)
        .expect("Failed to read random bytes");
    let mut hex = String::with_capacity(n * 2);
    for b in &bytes {
        write!(hex, "{b:02x}").unwrap();
    }
    hex
}

/// Generate a JWT signing secret.
pub fn generate_secret() -> String {
    random_hex(32)
}

/// Generate an opaque one-shot session token.
pub fn generate_session_token() -> String {
    random_hex(24)
}
