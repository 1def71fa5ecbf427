//! Signed open-tracking pixels.
//!
//! A pixel url looks like
//! `<origin>/<namespace>/<mailing_id>/<token>/<signature>.gif`. The
//! signature is the lowercase, unpadded base32 HMAC-SHA1 of
//! `<namespace>/<mailing_id>/<token>`, keyed with the SHA-1 of salt and
//! secret.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use url::Url;

use crate::config;
use crate::db::Id;
use crate::util::random_token;

pub const NAMESPACE: &str = "mailing";
pub const TOKEN_LENGTH: usize = 12;

const BASE32_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// RFC 4648 base32, lowercase, without padding.
pub fn base32(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes).to_ascii_lowercase()
}

pub fn sign(config: &config::Mailing, data: &str) -> String {
    let key = Sha1::digest(format!("{}{}", config.pixel_salt, config.pixel_secret));
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(&key) else {
        return String::new();
    };
    mac.update(data.as_bytes());
    base32(&mac.finalize().into_bytes())
}

pub fn generate_pixel_url(config: &config::Mailing, mailing: Id) -> String {
    generate_pixel_url_in(config, NAMESPACE, mailing)
}

/// Fresh pixel url with a random token.
pub fn generate_pixel_url_in(config: &config::Mailing, namespace: &str, mailing: Id) -> String {
    let token = random_token(TOKEN_LENGTH, BASE32_ALPHABET);
    let path = format!("{namespace}/{mailing}/{token}");
    let signature = sign(config, &path);
    format!(
        "{}/{}/{}.gif",
        config.pixel_origin.trim_end_matches('/'),
        path,
        signature
    )
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PixelPath {
    pub namespace: String,
    pub mailing_id: Id,
    pub token: String,
    pub signature: String,
}

impl PixelPath {
    /// Signed part of the path.
    pub fn data(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.mailing_id, self.token)
    }

    pub fn is_valid(&self, config: &config::Mailing) -> bool {
        !self.signature.is_empty() && sign(config, &self.data()) == self.signature
    }
}

/// Parses a pixel url or bare path. Urls on hosts other than the pixel
/// origin are rejected. The signature is not checked here.
pub fn parse_pixel_path(config: &config::Mailing, input: &str) -> Option<PixelPath> {
    let path = if input.starts_with("http://") || input.starts_with("https://") {
        let url = Url::parse(input).ok()?;
        let origin = Url::parse(&config.pixel_origin).ok()?;
        if url.host_str() != origin.host_str() {
            return None;
        }
        url.path().to_string()
    } else {
        input.split(['?', '#']).next().unwrap_or_default().to_string()
    };

    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let [namespace, mailing_id, token, filename] = parts.as_slice() else {
        return None;
    };
    let signature = filename.strip_suffix(".gif")?;
    let mailing_id = mailing_id.parse().ok()?;
    Some(PixelPath {
        namespace: namespace.to_string(),
        mailing_id,
        token: token.to_string(),
        signature: signature.to_string(),
    })
}

/// Parses and verifies in one go.
pub fn verify(config: &config::Mailing, input: &str) -> Option<PixelPath> {
    parse_pixel_path(config, input).filter(|p| p.is_valid(config))
}
