// llmlb — authentication & permission gate
//
// Two credential planes, enforced by one middleware:
//   * JWT session cookie (llmlb_session) for dashboard users. Writes also
//     need the X-CSRF-Token header matching the llmlb_csrf cookie.
//   * API keys (Authorization: Bearer sk_...) with a closed permission set
//     and a per-key token bucket.
//
// Route groups declare their requirement via `Requirement` and mount
// `require` with from_fn_with_state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::cookie::CookieJar;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::models::{ApiKeyRow, Permission, Role, UserRow};
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "llmlb_session";
pub const CSRF_COOKIE: &str = "llmlb_csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const SESSION_TTL_SECS: i64 = 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Passwords (argon2id)
// ---------------------------------------------------------------------------

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| ApiError::Internal(format!("password hash failed: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// JWT sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub username: String,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

pub fn issue_session(secret: &str, user: &UserRow) -> Result<String, ApiError> {
    let now = Utc::now().timestamp();
    let claims = SessionClaims {
        sub: user.id.clone(),
        username: user.username.clone(),
        role: user.role.clone(),
        exp: now + SESSION_TTL_SECS,
        iat: now,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(format!("session encode failed: {e}")))
}

pub fn validate_session(secret: &str, token: &str) -> Result<SessionClaims, ApiError> {
    let mut validation = Validation::default();
    validation.validate_exp = true;
    decode::<SessionClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::Unauthorized("invalid or expired session".to_string()))
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

/// Generate a fresh API key. Returns (plaintext, prefix); only the argon2
/// hash and the prefix are stored.
pub fn generate_api_key() -> (String, String) {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let plaintext = format!("sk_{}", URL_SAFE_NO_PAD.encode(bytes));
    let prefix = plaintext.chars().take(7).collect();
    (plaintext, prefix)
}

pub fn generate_csrf_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn generate_invitation_code() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// ---------------------------------------------------------------------------
// Per-key token bucket
// ---------------------------------------------------------------------------

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct KeyRateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    rate_per_sec: f64,
    burst: f64,
}

impl KeyRateLimiter {
    pub fn new(rate_per_minute: u32, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate_per_sec: f64::from(rate_per_minute) / 60.0,
            burst: f64::from(burst.max(1)),
        }
    }

    pub fn check(&self, key_id: &str) -> bool {
        let mut buckets = self.buckets.lock().expect("rate buckets");
        let bucket = buckets.entry(key_id.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: Instant::now(),
        });
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = Instant::now();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Authenticated principal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum AuthContext {
    Session {
        user_id: String,
        username: String,
        role: Role,
    },
    ApiKey {
        key_id: String,
        name: String,
        permissions: Vec<Permission>,
    },
}

impl AuthContext {
    /// Actor string for the audit log.
    pub fn actor(&self) -> String {
        match self {
            AuthContext::Session { username, .. } => format!("user:{username}"),
            AuthContext::ApiKey { name, .. } => format!("key:{name}"),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            AuthContext::Session {
                role: Role::Admin,
                ..
            }
        )
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            AuthContext::Session { user_id, .. } => Some(user_id),
            AuthContext::ApiKey { .. } => None,
        }
    }
}

/// Per-route-class authentication requirement.
#[derive(Debug, Clone, Copy)]
pub enum Requirement {
    /// API keys need this permission; sessions pass by role.
    Permission(Permission),
    /// API keys need any of these permissions.
    AnyOf(&'static [Permission]),
    /// Reads need one permission, writes another (endpoint management).
    ReadWrite { read: Permission, write: Permission },
    /// Sessions only — API keys are rejected outright.
    JwtOnly,
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Resolve the caller's credential. Bearer keys win over cookies so
/// programmatic callers are never confused by a stale session.
pub async fn authenticate(state: &AppState, request: &Request) -> Result<AuthContext, ApiError> {
    let bearer = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if let Some(token) = bearer {
        return authenticate_api_key(state, token).await;
    }

    let jar = CookieJar::from_headers(request.headers());
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        let claims = validate_session(&state.config.jwt_secret, cookie.value())?;
        return Ok(AuthContext::Session {
            user_id: claims.sub,
            username: claims.username,
            role: Role::parse(&claims.role),
        });
    }

    Err(ApiError::Unauthorized("missing credentials".to_string()))
}

async fn authenticate_api_key(state: &AppState, token: &str) -> Result<AuthContext, ApiError> {
    if !token.starts_with("sk_") {
        return Err(ApiError::Unauthorized("malformed API key".to_string()));
    }
    let prefix: String = token.chars().take(7).collect();
    let candidates: Vec<ApiKeyRow> =
        sqlx::query_as("SELECT * FROM api_keys WHERE key_prefix = ?")
            .bind(&prefix)
            .fetch_all(&state.db)
            .await
            .map_err(|e| ApiError::Internal(format!("key lookup failed: {e}")))?;

    let row = candidates
        .into_iter()
        .find(|row| verify_password(token, &row.key_hash))
        .ok_or_else(|| ApiError::Unauthorized("unknown API key".to_string()))?;

    if row.is_expired(Utc::now()) {
        return Err(ApiError::Unauthorized("API key expired".to_string()));
    }
    if !state.key_limiter.check(&row.id) {
        return Err(ApiError::RateLimited("API key rate limit exceeded".to_string()));
    }

    Ok(AuthContext::ApiKey {
        key_id: row.id.clone(),
        name: row.name.clone(),
        permissions: row.permission_set(),
    })
}

/// Route middleware. State carries the AppState plus the route class
/// requirement.
pub async fn require(
    State((state, requirement)): State<(AppState, Requirement)>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let ctx = authenticate(&state, &request).await?;
    check_requirement(&ctx, requirement, request.method())?;

    if matches!(ctx, AuthContext::Session { .. }) && is_write(request.method()) {
        check_csrf(&request)?;
    }

    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}

fn check_requirement(
    ctx: &AuthContext,
    requirement: Requirement,
    method: &Method,
) -> Result<(), ApiError> {
    match (ctx, requirement) {
        (AuthContext::Session { role, .. }, _) => match role {
            Role::Admin => Ok(()),
            Role::Viewer if !is_write(method) => Ok(()),
            Role::Viewer => Err(ApiError::Forbidden(
                "viewer role is read-only".to_string(),
            )),
        },
        (AuthContext::ApiKey { .. }, Requirement::JwtOnly) => Err(ApiError::Forbidden(
            "this route is not accessible with an API key".to_string(),
        )),
        (AuthContext::ApiKey { permissions, .. }, Requirement::Permission(required)) => {
            if permissions.contains(&required) {
                Ok(())
            } else {
                Err(ApiError::Forbidden(format!(
                    "API key lacks permission {}",
                    permission_name(required)
                )))
            }
        }
        (AuthContext::ApiKey { permissions, .. }, Requirement::ReadWrite { read, write }) => {
            let required = if is_write(method) { write } else { read };
            if permissions.contains(&required) {
                Ok(())
            } else {
                Err(ApiError::Forbidden(format!(
                    "API key lacks permission {}",
                    permission_name(required)
                )))
            }
        }
        (AuthContext::ApiKey { permissions, .. }, Requirement::AnyOf(any)) => {
            if any.iter().any(|p| permissions.contains(p)) {
                Ok(())
            } else {
                Err(ApiError::Forbidden(
                    "API key lacks the required permission".to_string(),
                ))
            }
        }
    }
}

fn is_write(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Double-submit CSRF: header must equal the cookie, compared in constant
/// time.
fn check_csrf(request: &Request) -> Result<(), ApiError> {
    let jar = CookieJar::from_headers(request.headers());
    let cookie = jar
        .get(CSRF_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or_else(|| ApiError::Forbidden("missing CSRF cookie".to_string()))?;
    let header = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Forbidden("missing X-CSRF-Token header".to_string()))?;

    if cookie.as_bytes().ct_eq(header.as_bytes()).into() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("CSRF token mismatch".to_string()))
    }
}

fn permission_name(p: Permission) -> String {
    serde_json::to_value(p)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| format!("{p:?}"))
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// First start with an empty user table: create the admin account with a
/// random password, printed once to the log.
pub async fn ensure_bootstrap_admin(db: &sqlx::SqlitePool) -> Result<(), ApiError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(db)
        .await
        .map_err(|e| ApiError::Internal(format!("user count failed: {e}")))?;
    if count > 0 {
        return Ok(());
    }

    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    let password = URL_SAFE_NO_PAD.encode(bytes);
    let hash = hash_password(&password)?;
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        "INSERT INTO users (id, username, password_hash, role, must_change_password, created_at, updated_at) \
         VALUES (?, 'admin', ?, 'admin', 1, ?, ?)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&hash)
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await
    .map_err(|e| ApiError::Internal(format!("bootstrap admin failed: {e}")))?;

    tracing::warn!(
        "created bootstrap admin account — username: admin, password: {password} (change it on first login)"
    );
    Ok(())
}

/// Username constraints shared by register and user creation.
pub fn validate_username(username: &str) -> Result<(), ApiError> {
    let len = username.chars().count();
    if !(3..=64).contains(&len) {
        return Err(ApiError::BadRequest(
            "username must be 3-64 characters".to_string(),
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(ApiError::BadRequest(
            "username may only contain letters, digits, '_', '-', '.'".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("hunter22").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("hunter22", &hash));
        assert!(!verify_password("hunter23", &hash));
    }

    #[test]
    fn session_round_trip_and_tamper() {
        let user = UserRow {
            id: "u1".into(),
            username: "alice".into(),
            password_hash: String::new(),
            role: "admin".into(),
            must_change_password: false,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let token = issue_session("secret", &user).unwrap();
        let claims = validate_session("secret", &token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.role, "admin");
        assert!(validate_session("other-secret", &token).is_err());
        assert!(validate_session("secret", "garbage").is_err());
    }

    #[test]
    fn api_key_shape() {
        let (plaintext, prefix) = generate_api_key();
        assert!(plaintext.starts_with("sk_"));
        assert_eq!(prefix.len(), 7);
        assert!(plaintext.starts_with(&prefix));
        assert_eq!(plaintext.len(), 3 + 43);
    }

    #[test]
    fn token_bucket_rejects_after_burst() {
        let limiter = KeyRateLimiter::new(60, 3);
        assert!(limiter.check("k"));
        assert!(limiter.check("k"));
        assert!(limiter.check("k"));
        assert!(!limiter.check("k"));
        // Other keys have their own bucket.
        assert!(limiter.check("other"));
    }

    #[test]
    fn viewer_is_read_only() {
        let viewer = AuthContext::Session {
            user_id: "u".into(),
            username: "v".into(),
            role: Role::Viewer,
        };
        assert!(check_requirement(
            &viewer,
            Requirement::Permission(Permission::EndpointsManage),
            &Method::GET
        )
        .is_ok());
        assert!(check_requirement(
            &viewer,
            Requirement::Permission(Permission::EndpointsManage),
            &Method::POST
        )
        .is_err());
    }

    #[test]
    fn api_key_permission_matrix() {
        let key = AuthContext::ApiKey {
            key_id: "k".into(),
            name: "ci".into(),
            permissions: vec![Permission::EndpointsRead],
        };
        assert!(check_requirement(
            &key,
            Requirement::Permission(Permission::EndpointsRead),
            &Method::GET
        )
        .is_ok());
        assert!(check_requirement(
            &key,
            Requirement::Permission(Permission::OpenaiInference),
            &Method::POST
        )
        .is_err());
        assert!(check_requirement(&key, Requirement::JwtOnly, &Method::GET).is_err());
        assert!(check_requirement(
            &key,
            Requirement::AnyOf(&[Permission::ModelsManage, Permission::RegistryRead]),
            &Method::GET
        )
        .is_err());
    }

    #[test]
    fn read_write_requirement_switches_on_method() {
        let key = AuthContext::ApiKey {
            key_id: "k".into(),
            name: "ro".into(),
            permissions: vec![Permission::EndpointsRead],
        };
        let rw = Requirement::ReadWrite {
            read: Permission::EndpointsRead,
            write: Permission::EndpointsManage,
        };
        assert!(check_requirement(&key, rw, &Method::GET).is_ok());
        assert!(check_requirement(&key, rw, &Method::POST).is_err());
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("al").is_err());
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("has space").is_err());
        assert!(validate_username(&"x".repeat(65)).is_err());
    }
}
