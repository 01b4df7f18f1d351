//! Optional bearer-token middleware.
//!
//! When `--auth-token` is configured, every `/api` request must carry
//! `Authorization: Bearer <token>`. `/health` stays unauthenticated.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::warn;

pub async fn auth_middleware(
    State(expected_token): State<Arc<str>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if presented.is_some_and(|token| token_matches(token, &expected_token)) {
        return Ok(next.run(req).await);
    }

    warn!(
        component = "auth",
        event = "auth.rejected",
        path = %req.uri().path(),
        token_present = presented.is_some(),
        "Rejected unauthenticated request"
    );
    Err(StatusCode::UNAUTHORIZED)
}

/// Compare without bailing out at the first differing byte.
fn token_matches(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && presented
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison() {
        assert!(token_matches("s3cret", "s3cret"));
        assert!(!token_matches("s3cret", "s3cre"));
        assert!(!token_matches("s3creT", "s3cret"));
        assert!(!token_matches("", "s3cret"));
    }
}
