use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::AppState;

pub const ADMIN_KEY_HEADER: &str = "X-Super-Admin-Key";

/// Guards the control-plane admin routes: the `X-Super-Admin-Key` header
/// must match `config.super_admin_key`.
pub struct SuperAdminAuth;

impl FromRequestParts<AppState> for SuperAdminAuth {
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let key = parts
            .headers
            .get(ADMIN_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("Missing X-Super-Admin-Key header"))?;

        if !keys_match(key, &state.config.super_admin_key) {
            tracing::warn!("Rejected admin request with an invalid key");
            return Err(unauthorized("Invalid super-admin key"));
        }
        Ok(SuperAdminAuth)
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": message, "code": "UNAUTHORIZED" })),
    )
}

/// Compares digests so neither length nor common prefix shows in timing.
fn keys_match(given: &str, expected: &str) -> bool {
    let a = Sha256::digest(given.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_comparison() {
        assert!(keys_match("s3cret", "s3cret"));
        assert!(!keys_match("s3cret", "s3cre"));
        assert!(!keys_match("", "s3cret"));
    }
}
