use axum::http::Uri;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Extension;
use chrono::Utc;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};

use crate::mailing::pixel::{verify, NAMESPACE};
use crate::mailing::pixel_log::{append_line, format_line};

use super::{AppExt, Router};

/// 1×1 transparent gif.
pub const GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

pub fn router() -> Router {
    Router::new().route(&format!("/{NAMESPACE}/:mailing/:token/:file"), get(pixel))
}

/// Serves the gif and appends verified hits to the pixel log, in the
/// format the log reconciler reads.
pub async fn pixel(Extension(app): AppExt, uri: Uri) -> impl IntoResponse {
    let path = uri.path();
    let log = &app.config.mailing.pixel_log;
    if !log.is_empty() && verify(&app.config.mailing, path).is_some() {
        let line = format_line(Utc::now(), "GET", path, "HTTP/1.1");
        if let Err(e) = append_line(log, &line).await {
            tracing::warn!("failed appending to pixel log: {e}");
        }
    }
    (
        [(CONTENT_TYPE, "image/gif"), (CACHE_CONTROL, "no-store")],
        GIF,
    )
}
