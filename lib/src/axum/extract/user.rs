use std::ops::Deref;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::app::App;
use crate::error::{Error, ErrorKind};
use crate::user::{find_active_by_email, User};

/// Account of the request, resolved from the header the fronting site sets
/// after authenticating (see `site.user_header`). Absent when the header is
/// not configured, missing, or names no active account.
#[derive(Clone, Debug, Default)]
pub struct MaybeUser(pub Option<User>);

impl Deref for MaybeUser {
    type Target = Option<User>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MaybeUser {
    pub fn is_staff(&self) -> bool {
        self.0.as_ref().map(|u| u.is_staff).unwrap_or(false)
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for MaybeUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let app = parts
            .extensions
            .get::<App>()
            .ok_or_else(|| Error::new(ErrorKind::Other("app extension unavailable".to_string())))?;

        let header = app.config.site.user_header.as_str();
        if header.is_empty() {
            return Ok(MaybeUser(None));
        }
        let Some(email) = parts.headers.get(header).and_then(|v| v.to_str().ok()) else {
            return Ok(MaybeUser(None));
        };
        let user = find_active_by_email(&app.db, email)?;
        if user.is_none() {
            tracing::debug!("no active account for {email}");
        }
        Ok(MaybeUser(user))
    }
}
