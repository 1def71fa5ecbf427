//! Mail templates, intents and mailings.
//!
//! A [`template::EmailTemplate`] is rendered into an [`EmailContent`] with a
//! text and an html channel. Transactional mail goes through the
//! [`intent`] registry, bulk mail through a [`Mailing`] and its roster of
//! [`MailingMessage`]s.

pub mod archive;
pub mod intent;
pub mod pixel;
pub mod pixel_log;
pub mod render;
pub mod send;
pub mod tagging;
pub mod template;

pub use intent::{send_intent, IntentRegistry, MailIntent, Recipient};
pub use template::{Block, EmailTemplate};

use chrono::{DateTime, Datelike, Utc};

use crate::db::{Collectable, Database, Id, Identifiable};
use crate::{Error, Result};

/// Variables available to templates.
pub type Context = serde_json::Map<String, serde_json::Value>;

/// Rendered mail: subject plus both channels.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct EmailContent {
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

/// Bulk or continuous send of one template.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Mailing {
    pub id: Id,
    pub name: String,

    /// Continuous mailings only collect the messages of transactional mail
    /// sent through their template.
    pub is_continuous: bool,

    pub email_template: Option<Id>,
    pub newsletter: Option<Id>,
    pub segments: Vec<Id>,

    pub sender_name: String,
    pub sender_email: String,

    pub creator_user: Option<Id>,
    pub sender_user: Option<Id>,
    pub created: DateTime<Utc>,

    /// Show in the web archive of the newsletter.
    pub publish: bool,
    pub tracking: bool,

    pub ready: bool,
    pub submitted: bool,
    pub sending_date: Option<DateTime<Utc>>,
    pub sent_date: Option<DateTime<Utc>>,
    pub sent: bool,
    pub sending: bool,

    pub open_count: u64,
    /// Latest pixel hit already accounted for in `open_count`.
    pub open_log_timestamp: Option<DateTime<Utc>>,
}

impl Default for Mailing {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            is_continuous: false,
            email_template: None,
            newsletter: None,
            segments: vec![],
            sender_name: String::new(),
            sender_email: String::new(),
            creator_user: None,
            sender_user: None,
            created: Utc::now(),
            publish: false,
            tracking: false,
            ready: false,
            submitted: false,
            sending_date: None,
            sent_date: None,
            sent: false,
            sending: false,
            open_count: 0,
            open_log_timestamp: None,
        }
    }
}

impl Collectable for Mailing {
    fn get_collection_name() -> &'static str {
        "mailings"
    }
}

impl Identifiable for Mailing {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl Mailing {
    pub fn new(db: &Database, name: &str) -> Result<Self> {
        Ok(Self {
            id: db.generate_id()?,
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// Stable campaign tag, `mailing-<YYYYMMDDhhmm>-<id>`.
    pub fn mailing_ident(&self) -> String {
        match self.sending_date {
            Some(date) => format!("mailing-{}-{}", date.format("%Y%m%d%H%M"), self.id),
            None => format!("mailing--{}", self.id),
        }
    }

    /// Path of the archive page, for published mailings of a newsletter.
    pub fn archive_path(&self, newsletter_slug: &str) -> Option<String> {
        let date = self.sending_date?;
        if !self.publish {
            return None;
        }
        Some(format!(
            "/newsletter/{}/archive/{:04}/{:02}/{:02}/{}/",
            newsletter_slug,
            date.year(),
            date.month(),
            date.day(),
            self.id
        ))
    }

    pub fn sender(&self, config: &crate::Config) -> String {
        let address = if self.sender_email.is_empty() {
            &config.email.address
        } else {
            &self.sender_email
        };
        let name = if self.sender_name.is_empty() {
            &config.email.name
        } else {
            &self.sender_name
        };
        crate::email::mailbox(name, address)
    }

    pub fn template(&self, db: &Database) -> Result<EmailTemplate> {
        let id = self
            .email_template
            .ok_or_else(|| Error::precondition(format!("mailing {} has no template", self.id)))?;
        db.get(id)
    }
}

/// One recipient of a mailing. Doubles as the delivery log.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MailingMessage {
    pub id: Id,
    pub mailing: Id,

    pub name: String,
    pub email: String,

    pub sent: Option<DateTime<Utc>>,
    pub bounced: bool,

    pub subscriber: Option<Id>,
    pub donor: Option<Id>,
    pub user: Option<Id>,

    pub is_continuous: bool,
    /// Last transport error, cleared on successful delivery.
    pub failure: String,
    pub created: DateTime<Utc>,
}

impl Default for MailingMessage {
    fn default() -> Self {
        Self {
            id: 0,
            mailing: 0,
            name: String::new(),
            email: String::new(),
            sent: None,
            bounced: false,
            subscriber: None,
            donor: None,
            user: None,
            is_continuous: false,
            failure: String::new(),
            created: Utc::now(),
        }
    }
}

impl Collectable for MailingMessage {
    fn get_collection_name() -> &'static str {
        "mailing_messages"
    }
}

impl Identifiable for MailingMessage {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl MailingMessage {
    pub fn new(db: &Database, mailing: Id) -> Result<Self> {
        Ok(Self {
            id: db.generate_id()?,
            mailing,
            ..Default::default()
        })
    }
}

pub fn messages_of(db: &Database, mailing: Id) -> Result<Vec<MailingMessage>> {
    db.filter::<MailingMessage, _>(|m| m.mailing == mailing)
}
