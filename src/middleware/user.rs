//! Caller identity
//!
//! Authentication happens at the gateway, which forwards the verified user id
//! in `x-user-id`. Handlers take [`CurrentUser`] to require it.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

use super::request_id::RequestIdExt;
use crate::error::ErrorResponse;

pub const X_USER_ID: &str = "x-user-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub Uuid);

impl CurrentUser {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

#[derive(Debug)]
pub enum IdentityError {
    Missing(Option<String>),
    Malformed(Option<String>),
}

impl IntoResponse for IdentityError {
    fn into_response(self) -> Response {
        let (message, request_id) = match self {
            IdentityError::Missing(request_id) => ("Missing caller identity", request_id),
            IdentityError::Malformed(request_id) => ("Caller identity is not a valid user id", request_id),
        };

        let body = ErrorResponse {
            code: "UNAUTHORIZED".to_string(),
            message: message.to_string(),
            request_id,
        };

        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = IdentityError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = parts.headers.request_id().map(str::to_string);

        let raw = parts
            .headers
            .get(X_USER_ID)
            .ok_or_else(|| IdentityError::Missing(request_id.clone()))?
            .to_str()
            .map_err(|_| IdentityError::Malformed(request_id.clone()))?;

        let user_id = Uuid::parse_str(raw.trim()).map_err(|_| {
            tracing::debug!(header = X_USER_ID, "Rejected malformed caller id");
            IdentityError::Malformed(request_id)
        })?;

        Ok(CurrentUser(user_id))
    }
}
