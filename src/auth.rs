//! Injected authorization predicate.
//!
//! The store never decides who is allowed in; it evaluates an opaque yes/no
//! function over the request headers. The predicate is built once in `main`
//! from configuration and carried in the shared state, so there is no
//! process-global auth switch.

use axum::http::{HeaderMap, header};
use std::sync::Arc;

/// Per-request authorization decision.
pub type CheckAuth = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;

/// Build the default predicate: when a token is configured the request must
/// carry `Authorization: Bearer <token>`, otherwise every request passes.
pub fn bearer_token_auth(token: Option<String>) -> CheckAuth {
    Arc::new(move |headers| match &token {
        None => true,
        Some(expected) => headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|presented| presented == expected),
    })
}
