use std::sync::Arc;

use axum::{middleware::Next, response::Response};
use tracing::debug;

use crate::kernel::auth::JwtService;

/// Authenticated principal from a verified JWT
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub subject: String,
    pub roles: Vec<String>,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin")
    }
}

/// JWT authentication middleware
///
/// Extracts the bearer token, verifies it and attaches AuthUser to request
/// extensions. Requests without a valid token continue unauthenticated;
/// handlers decide what requires a principal.
pub async fn jwt_auth_middleware(
    jwt_service: Arc<JwtService>,
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(user) = extract_auth_user(&request, &jwt_service) {
        debug!(subject = %user.subject, "authenticated request");
        request.extensions_mut().insert(user);
    }
    next.run(request).await
}

/// Extract and verify the JWT from the Authorization header
fn extract_auth_user(
    request: &axum::http::Request<axum::body::Body>,
    jwt_service: &JwtService,
) -> Option<AuthUser> {
    let auth_header = request.headers().get("authorization")?;
    let auth_str = auth_header.to_str().ok()?;
    let token = auth_str.strip_prefix("Bearer ").unwrap_or(auth_str);

    let claims = jwt_service.verify_token(token).ok()?;
    Some(AuthUser {
        subject: claims.sub,
        roles: claims.roles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> JwtService {
        JwtService::new("test_secret", "orchestrator".to_string(), 60)
    }

    fn request_with_header(value: Option<String>) -> axum::http::Request<axum::body::Body> {
        let mut builder = axum::http::Request::builder();
        if let Some(value) = value {
            builder = builder.header("authorization", value);
        }
        builder.body(axum::body::Body::empty()).unwrap()
    }

    #[test]
    fn extracts_user_with_bearer_prefix() {
        let service = service();
        let token = service
            .create_token("user-1", vec!["submitter".to_string()])
            .unwrap();
        let request = request_with_header(Some(format!("Bearer {token}")));

        let user = extract_auth_user(&request, &service).unwrap();
        assert_eq!(user.subject, "user-1");
        assert!(!user.is_admin());
    }

    #[test]
    fn extracts_user_without_bearer_prefix() {
        let service = service();
        let token = service.create_token("user-2", vec![]).unwrap();
        let request = request_with_header(Some(token));
        assert!(extract_auth_user(&request, &service).is_some());
    }

    #[test]
    fn missing_header_yields_no_user() {
        assert!(extract_auth_user(&request_with_header(None), &service()).is_none());
    }

    #[test]
    fn invalid_token_yields_no_user() {
        let request = request_with_header(Some("Bearer garbage".to_string()));
        assert!(extract_auth_user(&request, &service()).is_none());
    }
}
