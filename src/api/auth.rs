// =============================================================================
// Desktop-token authentication — Axum extractor
// =============================================================================
//
// The internal HTTP surface is protected by a shared secret sent as the
// `X-Desktop-Token` header. The expected value comes from the
// `NAMSAN_DESKTOP_TOKEN` environment variable; comparison is constant time.
//
// Usage:
//
//   async fn handler(_auth: DesktopToken, ...) { ... }
//
// A missing or invalid token short-circuits with 403 before the handler runs.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

pub const TOKEN_HEADER: &str = "X-Desktop-Token";
pub const TOKEN_ENV: &str = "NAMSAN_DESKTOP_TOKEN";

/// Compare two byte slices in constant time. Every byte of both slices is
/// examined even after a mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Extractor validating the `X-Desktop-Token` header.
pub struct DesktopToken;

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

impl<S> FromRequestParts<S> for DesktopToken
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Read on every request so rotation needs no restart.
        let expected = std::env::var(TOKEN_ENV).unwrap_or_default();
        if expected.is_empty() {
            warn!("NAMSAN_DESKTOP_TOKEN is not set — all authenticated requests rejected");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Server authentication not configured",
            });
        }

        let presented = parts
            .headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if presented.is_empty() {
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Missing desktop token",
            });
        }

        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            warn!("invalid desktop token presented");
            return Err(AuthRejection {
                status: StatusCode::FORBIDDEN,
                message: "Invalid desktop token",
            });
        }

        Ok(DesktopToken)
    }
}
