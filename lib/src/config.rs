use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use url::Url;

use crate::Result;

pub static CONFIG_FILE: &str = "donorbase.toml";

/// Application configuration.
///
/// # Sensible defaults
///
/// `Config::default()` describes a local development setup: a sled database
/// under `./db`, formatted logs, an SMTP relay on localhost and a site
/// origin of `http://localhost:8080`.
///
/// Using the *struct update syntax* one can initialize a new `Config`, making
/// a few changes right in the definition.
///
/// ```ignore
/// let cfg = Config {
///     tracing: Tracing {
///         enabled: false,
///         ..Default::default()
///     },
///     ..Default::default()
/// }
/// ```
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub version: String,

    /// Address on which to serve the http routes.
    pub address: SocketAddr,

    pub site: Site,
    pub db: Db,
    pub tracing: Tracing,

    pub email: Email,
    pub mailing: Mailing,
    pub newsletter: Newsletter,
    pub onboarding: Onboarding,

    pub payments: Payments,
    pub receipts: Receipts,
    pub notify: Notify,

    /// Development mode configuration.
    pub dev: DevMode,

    pub init: Init,
    /// Selectively enable/disable route groups
    pub routes: Routes,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            site: Site::default(),
            db: Db::default(),
            tracing: Tracing::default(),
            email: Email::default(),
            mailing: Mailing::default(),
            newsletter: Newsletter::default(),
            onboarding: Onboarding::default(),
            payments: Payments::default(),
            receipts: Receipts::default(),
            notify: Notify::default(),
            dev: DevMode::default(),
            init: Init::default(),
            routes: Routes::default(),
        }
    }
}

impl Config {
    /// Parsed site origin. Only URLs on this origin get campaign tags.
    pub fn site_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.site.url)?)
    }

    /// Joins a path onto the site url, avoiding double slashes.
    pub fn absolute_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.site.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Loads application config from toml file at default location.
pub fn load<T: DeserializeOwned>() -> Result<T> {
    load_from(CONFIG_FILE)
}

/// Loads application config from toml file at standard path using provided
/// name.
///
/// For example for `name` == `donorbase.toml` we will load both
/// `donorbase.toml` and `secret.donorbase.toml` from the working directory.
/// Environment variables override both, e.g. `EMAIL__SMTP_PASSWORD`.
pub fn load_from<T: DeserializeOwned>(name: impl AsRef<str>) -> Result<T> {
    let config = config::Config::builder()
        .add_source(config::File::with_name(name.as_ref()))
        .add_source(config::File::with_name(&format!("secret.{}", name.as_ref())).required(false))
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix_separator("__"),
        )
        .build()?;

    let config: T = config.try_deserialize()?;

    Ok(config)
}

/// Loads application config from multiple toml files at given paths.
pub fn load_from_many<T: DeserializeOwned>(paths: &[impl AsRef<str>]) -> Result<T> {
    let mut builder = config::Config::builder().add_source(
        config::Environment::default()
            .separator("__")
            .prefix_separator("__"),
    );

    for path in paths {
        builder = builder.add_source(config::File::with_name(path.as_ref()));
    }
    let config = builder.build()?;

    let config: T = config.try_deserialize()?;

    Ok(config)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Site {
    pub name: String,
    /// Public origin of the site, e.g. `https://fragdenstaat.de`.
    pub url: String,
    /// Zone used for interpreting naive dates in imports and for display.
    /// Everything persisted is UTC.
    pub timezone: chrono_tz::Tz,
    /// Request header carrying the email of the account authenticated by
    /// the fronting site. Empty disables account lookup on requests.
    pub user_header: String,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            name: "FragDenStaat".to_string(),
            url: "http://localhost:8080".to_string(),
            timezone: chrono_tz::Europe::Berlin,
            user_header: String::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Db {
    pub path: String,
}

impl Default for Db {
    fn default() -> Self {
        Self {
            path: "./db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Tracing {
    pub enabled: bool,

    pub mode: crate::tracing::Mode,
    pub level: crate::tracing::Level,

    pub loki_address: String,

    /// Directory for daily rotated log files. Logs only go to stdout when
    /// not set.
    pub file_dir: Option<String>,
}

impl Default for Tracing {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: crate::tracing::Mode::default(),
            level: crate::tracing::Level::default(),
            loki_address: "".to_string(),
            file_dir: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Email {
    /// Default sender address for transactional mail.
    pub address: String,
    /// Default sender display name.
    pub name: String,

    // Smtp server and credentials.
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,

    /// Recipients of admin notifications and the weekly digest.
    pub admins: Vec<String>,
}

impl Default for Email {
    fn default() -> Self {
        Self {
            address: "info@localhost".to_string(),
            name: "FragDenStaat".to_string(),
            smtp_server: "localhost".to_string(),
            smtp_port: 587,
            smtp_user: "".to_string(),
            smtp_password: "".to_string(),
            admins: vec![],
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Mailing {
    /// Origin the open-tracking pixels are served from.
    pub pixel_origin: String,
    pub pixel_secret: String,
    pub pixel_salt: String,
    /// Access log containing pixel requests. The rotated predecessor is
    /// expected at `<pixel_log>.1`.
    pub pixel_log: String,
    pub pixel_offset: String,

    /// Domain of the inbound unsubscribe mailbox, used for the
    /// `List-Unsubscribe` header.
    pub unsubscribe_domain: String,
    pub unsubscribe_token: String,

    /// Additional mail intents available to templates.
    pub intents: Vec<IntentEntry>,
}

impl Default for Mailing {
    fn default() -> Self {
        Self {
            pixel_origin: "http://localhost:8080".to_string(),
            pixel_secret: "insecure-development-secret".to_string(),
            pixel_salt: "mailing.pixel".to_string(),
            pixel_log: "./pixel.log".to_string(),
            pixel_offset: "./pixel_log.offset".to_string(),
            unsubscribe_domain: "localhost".to_string(),
            unsubscribe_token: "newsletter".to_string(),
            intents: vec![],
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IntentEntry {
    pub id: String,
    pub label: String,
    pub subject: String,
    pub text: String,
    pub context_vars: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Newsletter {
    /// Slug of the newsletter donors and site users are subscribed to.
    pub default: String,
    /// Optional separate newsletter for donors.
    pub donor: Option<String>,
    /// Salt for the hash kept after anonymizing unsubscribed subscribers.
    pub hash_salt: String,
    /// Minimum distance between two activation mails for one subscriber.
    pub throttle_seconds: i64,
}

impl Default for Newsletter {
    fn default() -> Self {
        Self {
            default: "fragdenstaat".to_string(),
            donor: None,
            hash_salt: "insecure-development-salt".to_string(),
            throttle_seconds: 5 * 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Onboarding {
    /// Days between subscription and the onboarding mail.
    pub lag_days: i64,
}

impl Default for Onboarding {
    fn default() -> Self {
        Self { lag_days: 3 }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Payments {
    /// Shared secret for the HMAC-SHA256 signature of status webhooks.
    pub webhook_secret: String,
    /// Where donors are sent after submitting a donation. `{id}` is
    /// replaced with the payment id.
    pub payment_url: String,
    /// Regex locating the transfer code in bank-transfer references. The
    /// first capture group, if any, is the code.
    pub transfer_code_pattern: String,
    /// Sender names whose bank transfers are not donations.
    pub blocklist: Vec<String>,
}

impl Default for Payments {
    fn default() -> Self {
        Self {
            webhook_secret: "insecure-development-secret".to_string(),
            payment_url: "/payment/{id}/".to_string(),
            transfer_code_pattern: r"\b[A-Z]{2,5}-([A-Z0-9]{2,12})\b".to_string(),
            blocklist: vec![],
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Receipts {
    pub webdav_url: String,
    pub webdav_username: String,
    pub webdav_password: String,

    /// Command reading html on stdin and writing pdf to stdout.
    pub html_to_pdf: Vec<String>,
    /// Command encrypting `{input}` into `{output}` with `{password}`.
    pub encrypt_pdf: Vec<String>,
}

impl Default for Receipts {
    fn default() -> Self {
        Self {
            webdav_url: "".to_string(),
            webdav_username: "".to_string(),
            webdav_password: "".to_string(),
            html_to_pdf: ["wkhtmltopdf", "--quiet", "--page-size", "A4", "-", "-"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            encrypt_pdf: [
                "qpdf",
                "--encrypt",
                "{password}",
                "{password}",
                "256",
                "--",
                "{input}",
                "{output}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Notify {
    /// Chat webhook receiving admin notifications as `{"text": ...}`.
    pub webhook_url: String,
}

/// NOTE: make sure to disable on production.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DevMode {
    /// Global switch for all dev mode items.
    pub enabled: bool,
    /// Populate the database with mock donors, subscribers and a mailing.
    pub mock: bool,
    /// Regenerate mocks even if they are already present.
    pub mock_regen: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Init {
    pub enabled: bool,
    pub newsletters: Vec<NewsletterEntry>,
    /// Path to a yaml file with email templates to create when missing.
    pub templates: Option<String>,
}

impl Default for Init {
    fn default() -> Self {
        Self {
            enabled: true,
            newsletters: vec![NewsletterEntry {
                slug: "fragdenstaat".to_string(),
                title: "FragDenStaat Newsletter".to_string(),
                ..Default::default()
            }],
            templates: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NewsletterEntry {
    pub slug: String,
    pub title: String,
    pub sender_name: String,
    pub sender_email: String,
    pub welcome_intent: Option<String>,
    pub onboarding_intent: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Routes {
    pub enable: Vec<String>,
    pub disable: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_url_joins_without_double_slash() {
        let mut config = Config::default();
        config.site.url = "https://example.com/".to_string();
        assert_eq!(
            config.absolute_url("/newsletter/confirm/1/abc/"),
            "https://example.com/newsletter/confirm/1/abc/"
        );
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [site]
            url = "https://example.com"

            [payments]
            blocklist = ["Finanzamt"]
            "#,
        )
        .unwrap();
        assert_eq!(config.site.url, "https://example.com");
        assert_eq!(config.site.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(config.payments.blocklist, vec!["Finanzamt".to_string()]);
        assert_eq!(config.newsletter.throttle_seconds, 300);
    }
}
