use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    Extension,
};
use std::sync::Arc;

use crate::auth::jwt::{Claims, JwtManager};

/// Bundles the `JwtManager` so a deployment that terminates its own bearer
/// tokens in front of this crate can layer it onto whichever routes need it
/// via `Extension(AuthState { jwt_manager })`. Nothing in the default router
/// requires it: end-user authentication is assumed to happen upstream.
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: Arc<JwtManager>,
}

/// Extracts and validates a `Bearer` token using the `JwtManager` layered
/// onto the request via [`AuthState`]. Returns 401 if the header is missing,
/// malformed, or the token fails validation.
pub struct BearerClaims(pub Claims);

impl<S> FromRequestParts<S> for BearerClaims
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(auth) = Extension::<AuthState>::from_request_parts(parts, state)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let claims = auth
            .jwt_manager
            .validate_token(token)
            .map_err(|_| StatusCode::UNAUTHORIZED)?;

        Ok(BearerClaims(claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_bearer_prefix() {
        let header_value = "Bearer abc.def.ghi";
        assert_eq!(header_value.strip_prefix("Bearer "), Some("abc.def.ghi"));
    }
}
