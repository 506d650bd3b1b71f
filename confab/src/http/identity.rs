//! Identity forwarded by the authenticating proxy in front of this server

use axum::{extract::FromRequestParts, http::request::Parts};
use confab_sfu::{ParticipantId, UserInfo};

use super::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_NAME_HEADER: &str = "x-user-name";

/// Pre-verified user identity. Requests without a user id are rejected
/// with 401 before any upgrade happens.
#[derive(Debug, Clone)]
pub struct TrustedUser {
    pub id: ParticipantId,
    pub user_info: UserInfo,
}

impl<S> FromRequestParts<S> for TrustedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header(parts, USER_ID_HEADER)
            .ok_or_else(|| AppError::unauthorized(format!("Missing {USER_ID_HEADER} header")))?;

        let user_info = header(parts, USER_NAME_HEADER)
            .map(UserInfo::named)
            .unwrap_or_default();

        Ok(Self {
            id: ParticipantId::from(id),
            user_info,
        })
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
