//! Admin token check for `/admin` routes.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

/// Header carrying the admin token
pub const ADMIN_TOKEN_HEADER: &str = "x-livefire-admin-token";

/// Static admin token
#[derive(Clone)]
pub struct AdminAuth {
    token: Arc<str>,
}

impl std::fmt::Debug for AdminAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAuth").finish_non_exhaustive()
    }
}

impl AdminAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::from(token.into()),
        }
    }

    /// Use the configured token, or generate a random one and print it once.
    pub fn from_config(token: Option<String>) -> Self {
        match token {
            Some(token) if !token.trim().is_empty() => Self::new(token),
            _ => {
                let token = hex::encode(rand::random::<[u8; 32]>());
                eprintln!("LIVEFIRE_ADMIN_TOKEN (generated): {}", token);
                Self::new(token)
            }
        }
    }

    /// Accepts `x-livefire-admin-token: <token>` or `Authorization: Bearer <token>`.
    pub fn check(&self, headers: &HeaderMap) -> bool {
        let presented = headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .or_else(|| {
                headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
            });

        presented
            .map(|v| v.trim() == &*self.token)
            .unwrap_or(false)
    }
}

/// Middleware rejecting requests without a valid admin token
pub async fn require_admin(
    State(auth): State<AdminAuth>,
    request: Request,
    next: Next,
) -> Response {
    if auth.check(request.headers()) {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": "unauthorized",
            "message": "missing or invalid admin token",
            "partial": false,
        })),
    )
        .into_response()
}
