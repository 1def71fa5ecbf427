//! Subscribing, confirming and unsubscribing.
//!
//! A subscriber is bound either to an account or to a bare address. Once
//! an account is known for an address, the account form wins and address
//! duplicates on the same newsletter are collapsed into it.

use std::sync::LazyLock;

use chrono::{Duration, Utc};
use regex::Regex;

use crate::app::App;
use crate::db::{Database, Id};
use crate::donation::Donor;
use crate::events::{dispatch, Event};
use crate::mailing::intent::{
    send_intent_with, Recipient, SendOptions, SUBSCRIBER_ALREADY, SUBSCRIBER_CONFIRM,
};
use crate::user::{find_active_by_email, User};
use crate::util::normalize_email;
use crate::{Error, Result};

use super::{
    find_newsletter, Newsletter, Subscriber, METHOD_BOUNCED, METHOD_UNSUBSCRIBE_LINK,
    METHOD_UNSUBSCRIBE_MAIL, REFERENCE_PREFIX,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionResult {
    AlreadySubscribed,
    Subscribed,
    Confirm,
}

#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
    /// Account asking for the subscription.
    pub user: Option<Id>,
    pub name: String,
    pub reference: String,
    pub keyword: String,
    /// Skip the activation mail, the address is known to be valid.
    pub email_confirmed: bool,
    pub tags: Vec<String>,
}

fn find_by_email(db: &Database, newsletter: Id, email: &str) -> Result<Option<Subscriber>> {
    db.find::<Subscriber, _>(|s| s.newsletter == newsletter && s.email.as_deref() == Some(email))
}

fn find_by_user(db: &Database, newsletter: Id, user: Id) -> Result<Option<Subscriber>> {
    db.find::<Subscriber, _>(|s| s.newsletter == newsletter && s.user == Some(user))
}

pub async fn subscribe(
    app: &App,
    newsletter: &Newsletter,
    email: &str,
    options: SubscribeOptions,
) -> Result<(SubscriptionResult, Subscriber)> {
    let email = normalize_email(email);
    let mut email_confirmed = options.email_confirmed;

    let user = options
        .user
        .map(|id| app.db.get_opt::<User>(id))
        .transpose()?
        .flatten()
        .filter(|u| u.is_active);
    if let Some(user) = &user {
        if normalize_email(&user.email) == email {
            email_confirmed = true;
        }
    }

    if let (Some(user), true) = (&user, email_confirmed) {
        return subscribe_user(app, newsletter, user, &options).await;
    }
    if email.is_empty() {
        return Err(Error::bad_input("email address required"));
    }

    let mut subscriber = match find_by_email(&app.db, newsletter.id, &email)? {
        Some(existing) => existing,
        None => Subscriber {
            email: Some(email.clone()),
            name: options.name.clone(),
            reference: options.reference.clone(),
            keyword: options.keyword.clone(),
            ..Subscriber::new(&app.db, newsletter.id)?
        },
    };
    subscriber.tags.extend(options.tags.iter().cloned());
    app.db.set(&subscriber)?;

    if subscriber.is_subscribed() {
        send_already_email(app, newsletter, &mut subscriber).await?;
        return Ok((SubscriptionResult::AlreadySubscribed, subscriber));
    }
    if !email_confirmed {
        send_activation_email(app, newsletter, &mut subscriber).await?;
        return Ok((SubscriptionResult::Confirm, subscriber));
    }

    let subscriber = activate(app, subscriber, &options.reference, &options.keyword).await?;
    Ok((SubscriptionResult::Subscribed, subscriber))
}

async fn subscribe_user(
    app: &App,
    newsletter: &Newsletter,
    user: &User,
    options: &SubscribeOptions,
) -> Result<(SubscriptionResult, Subscriber)> {
    let mut subscriber = match find_by_user(&app.db, newsletter.id, user.id)? {
        Some(existing) => existing,
        None => Subscriber {
            user: Some(user.id),
            reference: options.reference.clone(),
            keyword: options.keyword.clone(),
            ..Subscriber::new(&app.db, newsletter.id)?
        },
    };
    subscriber.tags.extend(options.tags.iter().cloned());
    app.db.set(&subscriber)?;

    if subscriber.is_subscribed() {
        tracing::debug!(subscriber = subscriber.id, "user already subscribed");
        return Ok((SubscriptionResult::AlreadySubscribed, subscriber));
    }
    let subscriber = activate(app, subscriber, &options.reference, &options.keyword).await?;
    Ok((SubscriptionResult::Subscribed, subscriber))
}

/// Subscribes to the configured default newsletter. `None` when that
/// newsletter does not exist.
pub async fn subscribe_to_default_newsletter(
    app: &App,
    email: &str,
    options: SubscribeOptions,
) -> Result<Option<(SubscriptionResult, Subscriber)>> {
    let slug = app.config.newsletter.default.clone();
    subscribe_to_newsletter(app, &slug, email, options).await
}

pub async fn subscribe_to_newsletter(
    app: &App,
    slug: &str,
    email: &str,
    options: SubscribeOptions,
) -> Result<Option<(SubscriptionResult, Subscriber)>> {
    let Some(newsletter) = find_newsletter(&app.db, slug)? else {
        tracing::debug!(slug, "no such newsletter, not subscribing");
        return Ok(None);
    };
    subscribe(app, &newsletter, email, options).await.map(Some)
}

/// Subscribes the donor to the separate donor newsletter, when configured.
pub async fn subscribe_donor_newsletter(
    app: &App,
    donor: &Donor,
    email_confirmed: bool,
) -> Result<Option<(SubscriptionResult, Subscriber)>> {
    let Some(slug) = app.config.newsletter.donor.clone() else {
        return Ok(None);
    };
    let options = SubscribeOptions {
        user: donor.user,
        name: donor.full_name(),
        reference: "donation".to_string(),
        email_confirmed,
        ..Default::default()
    };
    subscribe_to_newsletter(app, &slug, &donor.email, options).await
}

/// Marks the subscriber subscribed and raises [`Event::Subscribed`].
///
/// An address subscriber whose address belongs to an active account is
/// turned into (or merged with) the account's subscriber first.
pub async fn activate(
    app: &App,
    mut subscriber: Subscriber,
    reference: &str,
    keyword: &str,
) -> Result<Subscriber> {
    let db = &app.db;
    if let Some(email) = subscriber.email.clone() {
        if let Some(user) = find_active_by_email(db, &email)? {
            match find_by_user(db, subscriber.newsletter, user.id)? {
                Some(user_subscriber) => {
                    db.remove(&subscriber)?;
                    tracing::debug!(
                        removed = subscriber.id,
                        kept = user_subscriber.id,
                        "collapsed address subscriber into account subscriber"
                    );
                    subscriber = user_subscriber;
                }
                None => {
                    subscriber.email = None;
                    subscriber.user = Some(user.id);
                }
            }
        }
    }

    if subscriber.is_subscribed() {
        db.set(&subscriber)?;
        return Ok(subscriber);
    }

    subscriber.unsubscribed = None;
    subscriber.subscribed = Some(Utc::now());
    if !reference.is_empty() {
        subscriber.reference = reference.to_string();
    }
    if !keyword.is_empty() {
        subscriber.keyword = keyword.to_string();
    }
    db.set(&subscriber)?;

    if let Some(user) = subscriber.user.map(|id| db.get_opt::<User>(id)).transpose()?.flatten() {
        let email = normalize_email(&user.email);
        let newsletter = subscriber.newsletter;
        for duplicate in db.filter::<Subscriber, _>(|s| {
            s.newsletter == newsletter && s.email.as_deref() == Some(email.as_str())
        })? {
            db.remove(&duplicate)?;
        }
    }

    tracing::info!(
        subscriber = subscriber.id,
        newsletter = subscriber.newsletter,
        "subscribed"
    );
    dispatch(app, Event::Subscribed { subscriber: subscriber.id }).await;
    Ok(subscriber)
}

/// Activation through the link of the confirmation mail. Wrong codes are
/// not found, repeated activation returns the subscriber unchanged.
pub async fn confirm_subscriber(app: &App, subscriber: Id, code: &str) -> Result<Subscriber> {
    let subscriber = app
        .db
        .get_opt::<Subscriber>(subscriber)?
        .filter(|s| !code.is_empty() && s.activation_code == code)
        .ok_or_else(|| Error::not_found(format!("subscriber {subscriber}")))?;
    if subscriber.is_subscribed() {
        return Ok(subscriber);
    }
    let reference = subscriber.reference.clone();
    let keyword = subscriber.keyword.clone();
    activate(app, subscriber, &reference, &keyword).await
}

fn throttled(app: &App, subscriber: &Subscriber) -> bool {
    let window = Duration::seconds(app.config.newsletter.throttle_seconds);
    subscriber
        .last_activation_sent
        .map(|sent| Utc::now() - sent < window)
        .unwrap_or(false)
}

pub async fn send_activation_email(
    app: &App,
    newsletter: &Newsletter,
    subscriber: &mut Subscriber,
) -> Result<bool> {
    if throttled(app, subscriber) {
        tracing::debug!(subscriber = subscriber.id, "activation mail throttled");
        return Ok(false);
    }
    let mut context = subscriber.email_context(&app.db, &app.config, newsletter)?;
    context.insert(
        "action_url".into(),
        subscriber.subscribe_url(&app.config).into(),
    );
    let options = SendOptions {
        template: newsletter.confirm_template,
        ..Default::default()
    };
    let recipient = Recipient::from_subscriber(&app.db, subscriber)?;
    send_intent_with(app, SUBSCRIBER_CONFIRM, &recipient, context, options).await?;

    subscriber.last_activation_sent = Some(Utc::now());
    app.db.set(subscriber)?;
    Ok(true)
}

pub async fn send_already_email(
    app: &App,
    newsletter: &Newsletter,
    subscriber: &mut Subscriber,
) -> Result<bool> {
    if throttled(app, subscriber) {
        tracing::debug!(subscriber = subscriber.id, "already-subscribed mail throttled");
        return Ok(false);
    }
    let context = subscriber.email_context(&app.db, &app.config, newsletter)?;
    let options = SendOptions {
        template: newsletter.already_template,
        ..Default::default()
    };
    let recipient = Recipient::from_subscriber(&app.db, subscriber)?;
    send_intent_with(app, SUBSCRIBER_ALREADY, &recipient, context, options).await?;

    subscriber.last_activation_sent = Some(Utc::now());
    app.db.set(subscriber)?;
    Ok(true)
}

/// Unsubscribes, keeping method and campaign reference. Unsubscribing
/// twice keeps the first record.
pub fn unsubscribe(
    db: &Database,
    subscriber: &Subscriber,
    method: &str,
    reference: &str,
) -> Result<Subscriber> {
    let mut subscriber = subscriber.clone();
    if subscriber.is_unsubscribed() {
        return Ok(subscriber);
    }
    subscriber.subscribed = None;
    subscriber.unsubscribed = Some(Utc::now());
    subscriber.unsubscribe_method = method.to_string();
    subscriber.unsubscribe_reference = reference.to_string();
    db.set(&subscriber)?;
    tracing::info!(
        subscriber = subscriber.id,
        newsletter = subscriber.newsletter,
        method,
        "unsubscribed"
    );
    Ok(subscriber)
}

/// Unsubscribe link. Unknown ids and wrong codes yield `None`.
pub fn unsubscribe_by_code(
    db: &Database,
    subscriber: Id,
    code: &str,
    reference: &str,
) -> Result<Option<Subscriber>> {
    let Some(subscriber) = db
        .get_opt::<Subscriber>(subscriber)?
        .filter(|s| !code.is_empty() && s.activation_code == code)
    else {
        return Ok(None);
    };
    unsubscribe(db, &subscriber, METHOD_UNSUBSCRIBE_LINK, reference).map(Some)
}

/// Unsubscribes every subscriber of the account or address after a hard
/// bounce.
pub fn handle_bounce(db: &Database, email: &str, user: Option<Id>) -> Result<usize> {
    let email = normalize_email(email);
    let subscribers = db.filter::<Subscriber, _>(|s| {
        !s.is_unsubscribed()
            && ((user.is_some() && s.user == user)
                || (!email.is_empty() && s.email.as_deref() == Some(email.as_str())))
    })?;
    for subscriber in &subscribers {
        unsubscribe(db, subscriber, METHOD_BOUNCED, "")?;
    }
    Ok(subscribers.len())
}

static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^(?:unsubscribe-)?{}(\d+)(?:-(.+))?$",
        regex::escape(REFERENCE_PREFIX)
    ))
    .expect("unsubscribe reference pattern")
});

/// Splits `[unsubscribe-]newsletter-<id>[-<campaign>]` into subscriber id
/// and campaign.
pub fn parse_unsubscribe_reference(subject: &str) -> Option<(Id, String)> {
    let caps = REFERENCE_PATTERN.captures(subject.trim())?;
    let id = caps.get(1)?.as_str().parse().ok()?;
    let campaign = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
    Some((id, campaign))
}

/// Inbound mail to the unsubscribe mailbox. The sender has to be the
/// subscriber's address.
pub fn handle_unsubscribe_mail(
    db: &Database,
    sender: &str,
    subject: &str,
) -> Result<Option<Subscriber>> {
    let Some((id, campaign)) = parse_unsubscribe_reference(subject) else {
        tracing::debug!(subject, "not an unsubscribe reference");
        return Ok(None);
    };
    let Some(subscriber) = db.get_opt::<Subscriber>(id)? else {
        return Ok(None);
    };
    let sender = normalize_email(sender);
    if subscriber.get_email(db)?.map(|e| normalize_email(&e)) != Some(sender) {
        tracing::debug!(subscriber = id, "unsubscribe mail from foreign sender");
        return Ok(None);
    }
    unsubscribe(db, &subscriber, METHOD_UNSUBSCRIBE_MAIL, &campaign).map(Some)
}
