//! Receipt backup to a WebDAV share.

use reqwest::{Client, StatusCode};

use crate::error::ErrorKind;
use crate::{config, Error, Id, Result};

/// Gives up on finding a free name after this many attempts.
const MAX_SUFFIX: u32 = 100;

fn backup_error(msg: impl std::fmt::Display) -> Error {
    ErrorKind::Backup(msg.to_string()).into()
}

/// `name.ext` for 0, `name-N.ext` otherwise.
pub fn numbered(filename: &str, n: u32) -> String {
    if n == 0 {
        return filename.to_string();
    }
    match filename.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}-{n}.{ext}"),
        None => format!("{filename}-{n}"),
    }
}

pub fn receipt_filename(donor: Id, year: i32) -> String {
    format!("jzwb-{donor}-{year}.pdf")
}

/// Uploads `body` under the first free `filename` variant and returns the
/// name used. Existing files are never overwritten.
pub async fn upload(
    client: &Client,
    config: &config::Receipts,
    filename: &str,
    body: Vec<u8>,
) -> Result<String> {
    if config.webdav_url.is_empty() {
        return Err(backup_error("no webdav url configured"));
    }
    let base = config.webdav_url.trim_end_matches('/');

    for n in 0..MAX_SUFFIX {
        let name = numbered(filename, n);
        let url = format!("{base}/{name}");

        let existing = client
            .get(&url)
            .basic_auth(&config.webdav_username, Some(&config.webdav_password))
            .send()
            .await?;
        match existing.status() {
            StatusCode::OK => continue,
            StatusCode::NOT_FOUND => {}
            status => return Err(backup_error(format!("GET {name} returned {status}"))),
        }

        let response = client
            .put(&url)
            .basic_auth(&config.webdav_username, Some(&config.webdav_password))
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(backup_error(format!(
                "PUT {name} returned {}",
                response.status()
            )));
        }
        tracing::info!(file = name, "backed up receipt");
        return Ok(name);
    }
    Err(backup_error(format!("no free name for {filename}")))
}
