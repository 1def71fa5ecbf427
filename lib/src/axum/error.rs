use axum::response::{Html, IntoResponse, Response};
use http::StatusCode;

use crate::mailing::render::escape_html;
use crate::{Error, ErrorKind};

/// Maps error kinds onto response statuses.
///
/// Backtraces and internal details are never part of the response, they
/// only end up in the logs.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self.kind {
            ErrorKind::NotFound(_) => {
                tracing::debug!("{self}");
                (StatusCode::NOT_FOUND, Html("Nicht gefunden")).into_response()
            }
            ErrorKind::BadInput(msg) => {
                tracing::debug!("{self}");
                (StatusCode::BAD_REQUEST, Html(escape_html(msg))).into_response()
            }
            ErrorKind::Forbidden => StatusCode::FORBIDDEN.into_response(),
            _ => {
                tracing::error!("{self}");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_statuses() {
        let status = |e: Error| e.into_response().status();
        assert_eq!(status(Error::not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(status(Error::bad_input("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status(ErrorKind::Forbidden.into()), StatusCode::FORBIDDEN);
        assert_eq!(
            status(Error::precondition("x")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
