//! Request identity.
//!
//! Login and sessions live in a fronting gateway; this service only reads
//! the identity the gateway attaches to each request.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, header};
use tracing::warn;

use super::AppState;
use super::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub owner_id: String,
    pub display_name: String,
}

/// Resolves the caller from request headers.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal>;
}

/// Trusts `X-User-Id` and `X-User-Name` set by the gateway. The display
/// name defaults to the id.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderAuthenticator;

impl Authenticator for HeaderAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Option<Principal> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let owner_id = header(USER_ID_HEADER)?;
        let display_name = header(USER_NAME_HEADER).unwrap_or_else(|| owner_id.clone());
        Some(Principal {
            owner_id,
            display_name,
        })
    }
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        state
            .auth
            .authenticate(&parts.headers)
            .ok_or(ApiError::Unauthorized)
    }
}

/// Marker extractor for the worker routes: the caller presented the
/// configured worker token, or none is configured.
#[derive(Debug, Clone, Copy)]
pub struct WorkerCaller;

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

impl FromRequestParts<AppState> for WorkerCaller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let Some(expected) = state.worker_token.as_deref() else {
            return Ok(Self);
        };
        if bearer(&parts.headers) == Some(expected) {
            Ok(Self)
        } else {
            warn!(path = %parts.uri.path(), "Rejected worker call without a valid token");
            Err(ApiError::Unauthorized)
        }
    }
}
