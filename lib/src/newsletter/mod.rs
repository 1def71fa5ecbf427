//! Newsletters, subscribers and audience segmentation.

pub mod analytics;
pub mod import;
pub mod listeners;
pub mod maintenance;
pub mod onboarding;
pub mod segment;
pub mod subscribe;
pub mod tags;

pub use segment::Segment;
pub use subscribe::{subscribe, unsubscribe, SubscriptionResult};

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::db::{Collectable, Database, Id, Identifiable};
use crate::mailing::Context;
use crate::user::User;
use crate::util::{normalize_email, random_code};
use crate::{Config, Result};

/// Prefix of the subscriber reference carried in unsubscribe mails.
pub const REFERENCE_PREFIX: &str = "newsletter-";

pub const METHOD_BOUNCED: &str = "bounced";
pub const METHOD_UNSUBSCRIBE_MAIL: &str = "unsubscribe-mail";
pub const METHOD_UNSUBSCRIBE_LINK: &str = "unsubscribe-link";
pub const METHOD_USER_CANCELED: &str = "user_canceled";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Newsletter {
    pub id: Id,
    pub slug: String,
    pub title: String,
    pub description: String,

    pub sender_name: String,
    pub sender_email: String,

    /// Email template overriding the built-in activation mail.
    pub confirm_template: Option<Id>,
    /// Email template overriding the built-in already-subscribed mail.
    pub already_template: Option<Id>,

    pub welcome_intent: Option<String>,
    pub onboarding_intent: Option<String>,

    pub created: Option<DateTime<Utc>>,
}

impl Collectable for Newsletter {
    fn get_collection_name() -> &'static str {
        "newsletters"
    }
}

impl Identifiable for Newsletter {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl Newsletter {
    pub fn new(db: &Database, slug: &str, title: &str) -> Result<Self> {
        Ok(Self {
            id: db.generate_id()?,
            slug: slug.to_string(),
            title: title.to_string(),
            created: Some(Utc::now()),
            ..Default::default()
        })
    }
}

pub fn find_newsletter(db: &Database, slug: &str) -> Result<Option<Newsletter>> {
    db.find::<Newsletter, _>(|n| n.slug == slug)
}

pub fn get_newsletter(db: &Database, slug: &str) -> Result<Newsletter> {
    find_newsletter(db, slug)?
        .ok_or_else(|| crate::Error::not_found(format!("newsletter {slug}")))
}

/// Binding of one identity to one newsletter.
///
/// The identity is either a site account (`user`) or a bare `email`. Both
/// are cleared when the subscriber is anonymized after unsubscribing.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Subscriber {
    pub id: Id,
    pub newsletter: Id,

    pub user: Option<Id>,
    pub email: Option<String>,
    pub name: String,

    pub created: DateTime<Utc>,
    pub subscribed: Option<DateTime<Utc>>,
    pub unsubscribed: Option<DateTime<Utc>>,
    pub unsubscribe_method: String,
    pub unsubscribe_reference: String,

    pub activation_code: String,
    pub last_activation_sent: Option<DateTime<Utc>>,

    pub reference: String,
    pub keyword: String,
    pub tags: BTreeSet<String>,

    /// Salted hash of the address, kept after anonymization.
    pub email_hash: String,
    /// When the onboarding mail went out.
    pub onboarded: Option<DateTime<Utc>>,
}

impl Default for Subscriber {
    fn default() -> Self {
        Self {
            id: 0,
            newsletter: 0,
            user: None,
            email: None,
            name: String::new(),
            created: Utc::now(),
            subscribed: None,
            unsubscribed: None,
            unsubscribe_method: String::new(),
            unsubscribe_reference: String::new(),
            activation_code: random_code(32),
            last_activation_sent: None,
            reference: String::new(),
            keyword: String::new(),
            tags: BTreeSet::new(),
            email_hash: String::new(),
            onboarded: None,
        }
    }
}

impl Collectable for Subscriber {
    fn get_collection_name() -> &'static str {
        "subscribers"
    }
}

impl Identifiable for Subscriber {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl Subscriber {
    pub fn new(db: &Database, newsletter: Id) -> Result<Self> {
        Ok(Self {
            id: db.generate_id()?,
            newsletter,
            ..Default::default()
        })
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.is_some()
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed.is_some()
    }

    /// Neither confirmed nor unsubscribed yet.
    pub fn is_pending(&self) -> bool {
        self.subscribed.is_none() && self.unsubscribed.is_none()
    }

    /// Address the subscriber is reached at, through the account when bound.
    pub fn get_email(&self, db: &Database) -> Result<Option<String>> {
        if let Some(user) = self.user {
            return Ok(db.get_opt::<User>(user)?.map(|u| normalize_email(&u.email)));
        }
        Ok(self.email.clone())
    }

    pub fn get_name(&self, db: &Database) -> Result<String> {
        if let Some(user) = self.user {
            if let Some(user) = db.get_opt::<User>(user)? {
                return Ok(user.full_name());
            }
        }
        Ok(self.name.clone())
    }

    pub fn reference_code(&self) -> String {
        format!("{}{}", REFERENCE_PREFIX, self.id)
    }

    pub fn subscribe_url(&self, config: &Config) -> String {
        config.absolute_url(&format!(
            "/newsletter/confirm/{}/{}/",
            self.id, self.activation_code
        ))
    }

    /// Unsubscribe link. The reference names the campaign the link was
    /// sent with and ends up in `unsubscribe_reference`.
    pub fn unsubscribe_url(&self, config: &Config, reference: Option<&str>) -> String {
        let url = config.absolute_url(&format!(
            "/newsletter/unsubscribe/{}/{}/",
            self.id, self.activation_code
        ));
        match reference {
            Some(reference) if !reference.is_empty() => format!("{url}?reference={reference}"),
            _ => url,
        }
    }

    /// Template context shared by every mail sent to the subscriber.
    pub fn email_context(
        &self,
        db: &Database,
        config: &Config,
        newsletter: &Newsletter,
    ) -> Result<Context> {
        let mut context = Context::new();
        context.insert("subscriber_id".into(), self.id.into());
        context.insert("newsletter".into(), newsletter.title.clone().into());
        context.insert("newsletter_slug".into(), newsletter.slug.clone().into());
        context.insert("site_name".into(), config.site.name.clone().into());
        context.insert("site_url".into(), config.site.url.clone().into());
        context.insert(
            "unsubscribe_url".into(),
            self.unsubscribe_url(config, None).into(),
        );
        context.insert("unsubscribe_reference".into(), self.reference_code().into());
        context.insert("name".into(), self.get_name(db)?.into());
        if let Some(user) = self.user.map(|u| db.get_opt::<User>(u)).transpose()?.flatten() {
            context.insert("first_name".into(), user.first_name.into());
            context.insert("last_name".into(), user.last_name.into());
        }
        Ok(context)
    }
}

pub fn subscribers_of(db: &Database, newsletter: Id) -> Result<Vec<Subscriber>> {
    db.filter::<Subscriber, _>(|s| s.newsletter == newsletter)
}

/// Confirmed subscribers of the newsletter.
pub fn active_subscribers(db: &Database, newsletter: Id) -> Result<Vec<Subscriber>> {
    db.filter::<Subscriber, _>(|s| s.newsletter == newsletter && s.is_subscribed())
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UnsubscribeReason {
    TooMuch,
    ExpectedUpdates,
    SpecificRequest,
    NotInterested,
    Dislike,
    #[default]
    Other,
}

impl UnsubscribeReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::TooMuch => "Ich habe zu viele E-Mails bekommen",
            Self::ExpectedUpdates => "Ich habe mehr Updates zu bestimmten Kampagnen erwartet",
            Self::SpecificRequest => "Ich habe mich nur wegen einer bestimmten Anfrage angemeldet",
            Self::NotInterested => "Die Themen interessieren mich nicht",
            Self::Dislike => "Ich mag eure Arbeit nicht mehr",
            Self::Other => "Anderes",
        }
    }
}

/// Reason given when unsubscribing. The subscriber link is only kept for an
/// hour to prevent repeated submissions.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct UnsubscribeFeedback {
    pub id: Id,
    pub newsletter: Id,
    pub subscriber: Option<Id>,
    pub reason: UnsubscribeReason,
    pub comment: String,
    pub created: DateTime<Utc>,
}

impl Default for UnsubscribeFeedback {
    fn default() -> Self {
        Self {
            id: 0,
            newsletter: 0,
            subscriber: None,
            reason: UnsubscribeReason::Other,
            comment: String::new(),
            created: Utc::now(),
        }
    }
}

impl Collectable for UnsubscribeFeedback {
    fn get_collection_name() -> &'static str {
        "unsubscribe_feedback"
    }
}

impl Identifiable for UnsubscribeFeedback {
    fn get_id(&self) -> Id {
        self.id
    }
}

/// Stores feedback for a subscriber. A subscriber leaves at most one
/// feedback per newsletter, later submissions are ignored.
pub fn submit_feedback(
    db: &Database,
    subscriber: &Subscriber,
    reason: UnsubscribeReason,
    comment: &str,
) -> Result<Option<UnsubscribeFeedback>> {
    let exists = db
        .find::<UnsubscribeFeedback, _>(|f| {
            f.subscriber == Some(subscriber.id) && f.newsletter == subscriber.newsletter
        })?
        .is_some();
    if exists {
        return Ok(None);
    }
    let feedback = UnsubscribeFeedback {
        id: db.generate_id()?,
        newsletter: subscriber.newsletter,
        subscriber: Some(subscriber.id),
        reason,
        comment: comment.trim().to_string(),
        created: Utc::now(),
    };
    db.set(&feedback)?;
    Ok(Some(feedback))
}
