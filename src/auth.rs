//! Identity and workspace session handling.
//!
//! Authentication itself happens in front of the service: an OAuth proxy
//! forwards the signed-in user in a header. This layer only refuses requests
//! without it and ties each browser to its own workspace through a cookie.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use log::debug;
use std::sync::Arc;
use uuid::Uuid;

use crate::app::AppState;

/// Cookie holding the workspace identifier.
pub const WORKSPACE_COOKIE: &str = "workspace";

/// The caller of the current request, inserted into request extensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// Identity forwarded by the proxy
    pub user: String,
    /// Key of this browser's workspace
    pub key: String,
}

/// Middleware that requires an identity header
///
/// Requests without the configured header (or with an empty one) are refused
/// with 401 before any workspace logic runs. A browser without a valid
/// workspace cookie gets a fresh one.
///
/// # Arguments
/// * `state` - Shared application state, for the header name
/// * `jar` - Cookie jar of the request
/// * `request` - The incoming request
/// * `next` - Next middleware in the chain
///
/// # Returns
/// * `Response` - Either the downstream response or 401
pub async fn require_identity(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let user = request
        .headers()
        .get(state.config.auth_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let Some(user) = user else {
        debug!("refusing request to {} without identity", request.uri().path());
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    let existing = jar
        .get(WORKSPACE_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| Uuid::parse_str(v).is_ok());

    let (workspace_id, jar) = match existing {
        Some(id) => (id, None),
        None => {
            let id = Uuid::new_v4().to_string();
            let cookie = Cookie::build((WORKSPACE_COOKIE, id.clone()))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax)
                .build();
            (id, Some(jar.add(cookie)))
        }
    };

    request.extensions_mut().insert(Session {
        key: format!("{}:{}", user, workspace_id),
        user,
    });

    let response = next.run(request).await;
    match jar {
        Some(jar) => (jar, response).into_response(),
        None => response,
    }
}
