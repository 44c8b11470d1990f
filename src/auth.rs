//! Password hashing, JWT minting/verification, and the Bearer-token auth
//! middleware (spec.md §6 "Authentication").
//!
//! Grounded on `original_source/internal/auth/jwtgenerator/jwtgenerator.go`
//! (HS256, claims carry `user_id` and an expiry) and
//! `original_source/internal/auth/middleware/authorize.go` (Bearer header
//! parse, 401 on missing/malformed, inject user id into request context).
//! Password hashing is new relative to the Go original (which stored
//! plaintext, spec.md §9 open question 1) — grounded on `argon2`, already a
//! dependency of the sibling crate `openmls-wasm` in the teacher's own
//! repository.

use std::time::Duration;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::handlers::AppState;

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash password: {e}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    user_id: i64,
    exp: usize,
}

pub fn mint_token(user_id: i64, jwt_key: &str, expiration: Duration) -> anyhow::Result<String> {
    let exp = (Utc::now() + chrono::Duration::from_std(expiration)?).timestamp() as usize;
    let claims = Claims { user_id, exp };
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(jwt_key.as_bytes()))?;
    Ok(token)
}

/// Returns the authenticated user id, or `None` if the token is missing,
/// malformed, or expired — mirroring `jwtgenerator.GetUserId`'s `-1` sentinel,
/// collapsed into an `Option` the Rust way.
pub fn verify_token(token: &str, jwt_key: &str) -> Option<i64> {
    let mut validation = Validation::default();
    validation.leeway = 0;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(jwt_key.as_bytes()), &validation).ok()?;
    Some(data.claims.user_id)
}

/// The authenticated user id, injected into request extensions by
/// [`require_auth`] for downstream handlers to extract.
#[derive(Debug, Clone, Copy)]
pub struct AuthUserId(pub i64);

/// Axum middleware enforcing the `Authorization: Bearer <token>` contract
/// (spec.md §6). Mirrors `authorize.go`'s header-split-and-verify sequence.
pub async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.strip_prefix("Bearer ").ok_or(StatusCode::UNAUTHORIZED)?;
    let user_id = verify_token(token, &state.config.jwt_key).ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(AuthUserId(user_id));
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_roundtrips_through_hash_and_verify() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
    }

    #[test]
    fn distinct_hashes_for_same_password_due_to_salting() {
        let a = hash_password("hunter2").unwrap();
        let b = hash_password("hunter2").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn token_roundtrips_to_the_same_user_id() {
        let token = mint_token(42, "test-key", Duration::from_secs(3600)).unwrap();
        assert_eq!(verify_token(&token, "test-key"), Some(42));
    }

    #[test]
    fn token_signed_with_a_different_key_fails_verification() {
        let token = mint_token(42, "test-key", Duration::from_secs(3600)).unwrap();
        assert_eq!(verify_token(&token, "other-key"), None);
    }

    #[test]
    fn expired_token_fails_verification() {
        let token = mint_token(42, "test-key", Duration::from_secs(0)).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(verify_token(&token, "test-key"), None);
    }
}
