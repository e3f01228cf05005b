//! Session cookie handling and the login guard placed in front of every
//! protected route.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use shared::domain::DriverId;
use tracing::{debug, warn};

use crate::{app_state::AppState, http_error};

pub(crate) const SESSION_COOKIE: &str = "sessionid";

/// The authenticated driver, inserted into request extensions by [`require_login`].
#[derive(Debug, Clone)]
pub(crate) struct CurrentDriver {
    pub(crate) driver_id: DriverId,
    pub(crate) session_key: String,
}

pub(crate) async fn require_login(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(session_key) = session_key(request.headers()) else {
        return redirect_to_login(request.uri());
    };

    match server_api::current_session(&state.api, &session_key).await {
        Ok(Some(session)) => {
            request.extensions_mut().insert(CurrentDriver {
                driver_id: session.driver_id,
                session_key: session.session_key,
            });
            next.run(request).await
        }
        Ok(None) => {
            debug!(path = %request.uri().path(), "stale session cookie");
            let mut response = redirect_to_login(request.uri());
            if let Ok(value) = clear_cookie(state.cookie_secure).parse() {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
            response
        }
        Err(err) => {
            warn!(error = %err, "session lookup failed");
            http_error(err).into_response()
        }
    }
}

pub(crate) fn session_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn session_cookie(session_key: &str, max_age_seconds: i64, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={session_key}; Max-Age={max_age_seconds}; Path=/; HttpOnly; SameSite=Lax"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub(crate) fn clear_cookie(secure: bool) -> String {
    session_cookie("", 0, secure)
}

/// `302` to the login page, remembering where the client wanted to go.
pub(crate) fn redirect_to_login(uri: &Uri) -> Response {
    let wanted = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let next: String = url::form_urlencoded::byte_serialize(wanted.as_bytes()).collect();
    found(&format!("{}?next={next}", server_api::login_route()))
}

pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}
