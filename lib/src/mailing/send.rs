//! Bulk mailing delivery.
//!
//! A mailing is sent in two steps. [`finalize`] builds the roster of
//! [`MailingMessage`]s from the newsletter audience, [`send`] renders and
//! delivers every message not yet sent. A mailing is claimed through its
//! `sending` flag for the duration of a run, so a second worker backs off.

use chrono::{DateTime, Duration, Utc};

use crate::app::App;
use crate::db::{Changeset, Database, Id};
use crate::donation::{mails::donor_context, Donor};
use crate::email::{mailbox, OutgoingEmail};
use crate::newsletter::{segment::get_subscribers, Newsletter, Subscriber};
use crate::user::User;
use crate::util::normalize_email;
use crate::{Config, Error, Result};

use super::intent::list_unsubscribe;
use super::pixel::generate_pixel_url;
use super::render::render_email;
use super::tagging::tag_urls;
use super::template::EmailTemplate;
use super::{messages_of, Context, EmailContent, Mailing, MailingMessage};

/// Messages to an address sent this long ago or less are marked on bounce.
pub const BOUNCE_WINDOW_HOURS: i64 = 36;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendReport {
    /// The run did not happen, the mailing was not in a sendable state.
    pub skipped: bool,
    pub sent: usize,
    pub failed: usize,
    /// Messages dropped from the roster, without address or no longer
    /// subscribed.
    pub removed: usize,
}

/// Renders the template for a message of the mailing: open pixel when
/// tracking and campaign tags on site links in both channels.
pub fn render_for_mailing(
    config: &Config,
    mailing: &Mailing,
    template: &EmailTemplate,
    context: &Context,
) -> Result<EmailContent> {
    let mut context = context.clone();
    if mailing.tracking && !context.contains_key("pixel_url") {
        context.insert(
            "pixel_url".into(),
            generate_pixel_url(&config.mailing, mailing.id).into(),
        );
    }
    let content = render_email(template, &context, config)?;

    let site = config.site_url()?;
    let campaign = mailing.mailing_ident();
    Ok(EmailContent {
        subject: content.subject,
        text: tag_urls(&content.text, &site, &campaign, false),
        html: content.html.map(|html| tag_urls(&html, &site, &campaign, true)),
    })
}

/// Context for one message, assembled from everything the recipient is
/// linked to.
pub fn message_context(
    db: &Database,
    config: &Config,
    mailing: &Mailing,
    message: &MailingMessage,
) -> Result<Context> {
    let subscriber = message
        .subscriber
        .map(|id| db.get_opt::<Subscriber>(id))
        .transpose()?
        .flatten();

    let mut user_id = message.user;
    if user_id.is_none() {
        user_id = subscriber.as_ref().and_then(|s| s.user);
    }
    let mut donor = message.donor.map(|id| db.get_opt::<Donor>(id)).transpose()?.flatten();
    if user_id.is_none() {
        user_id = donor.as_ref().and_then(|d| d.user);
    }
    let user = user_id.map(|id| db.get_opt::<User>(id)).transpose()?.flatten();

    if donor.is_none() {
        if let Some(user) = &user {
            donor = db.find::<Donor, _>(|d| d.user == Some(user.id))?;
        }
    }
    if donor.is_none() {
        if let Some(subscriber) = &subscriber {
            donor = db.find::<Donor, _>(|d| d.subscriber == Some(subscriber.id))?;
            if donor.is_none() {
                if let Some(email) = &subscriber.email {
                    donor = db.find::<Donor, _>(|d| {
                        d.email_confirmed.is_some() && normalize_email(&d.email) == *email
                    })?;
                }
            }
        }
    }

    let mut context = Context::new();
    context.insert("mailing".into(), mailing.name.clone().into());
    if let Some(subscriber) = &subscriber {
        let newsletter = db.get::<Newsletter>(subscriber.newsletter)?;
        context.extend(subscriber.email_context(db, config, &newsletter)?);
    }
    if let Some(donor) = &donor {
        context.extend(donor_context(donor));
    }
    if let Some(user) = &user {
        context.insert("first_name".into(), user.first_name.clone().into());
        context.insert("last_name".into(), user.last_name.clone().into());
    }
    context
        .entry("name")
        .or_insert_with(|| message.name.clone().into());
    context
        .entry("site_name")
        .or_insert_with(|| config.site.name.clone().into());
    context
        .entry("site_url")
        .or_insert_with(|| config.site.url.clone().into());

    let ident = mailing.mailing_ident();
    if let Some(subscriber) = &subscriber {
        context.insert(
            "unsubscribe_reference".into(),
            format!("{}-{}", subscriber.reference_code(), ident).into(),
        );
        context.insert(
            "unsubscribe_url".into(),
            subscriber.unsubscribe_url(config, Some(&ident)).into(),
        );
    }
    if mailing.tracking {
        context.insert(
            "pixel_url".into(),
            generate_pixel_url(&config.mailing, mailing.id).into(),
        );
    }
    Ok(context)
}

/// Marks the mailing submitted. It goes out with the next run of
/// [`send_due_mailings`] after its sending date.
pub fn submit(
    db: &Database,
    mailing: Id,
    user: Option<Id>,
    sending_date: Option<DateTime<Utc>>,
) -> Result<Mailing> {
    let updated = db.update::<Mailing, _>(mailing, |mut m| {
        if m.sent || m.is_continuous {
            return None;
        }
        m.submitted = true;
        m.sending_date = sending_date.or(m.sending_date).or_else(|| Some(Utc::now()));
        m.sender_user = user;
        Some(m)
    })?;
    updated.ok_or_else(|| Error::precondition(format!("mailing {mailing} can not be submitted")))
}

/// Builds the roster of an unsent mailing.
///
/// Unsent newsletter messages are rebuilt from the current audience, other
/// messages get their address and name filled from the linked records.
/// Messages without address are dropped and addresses appear once.
/// Running it again yields the same roster.
pub fn finalize(db: &Database, mailing: Id) -> Result<usize> {
    let mailing: Mailing = db.get(mailing)?;
    if mailing.sent || mailing.is_continuous {
        return Err(Error::precondition(format!(
            "mailing {} can not be finalized",
            mailing.id
        )));
    }

    let mut changes = Changeset::new();
    let mut kept: Vec<MailingMessage> = vec![];
    for mut message in messages_of(db, mailing.id)? {
        if message.sent.is_none() && message.subscriber.is_some() && mailing.newsletter.is_some() {
            changes.remove(&message);
            continue;
        }
        if message.sent.is_none() {
            fill_recipient(db, &mut message)?;
            if message.email.is_empty() {
                changes.remove(&message);
                continue;
            }
        }
        kept.push(message);
    }

    // Dedupe what is left, sent messages win.
    kept.sort_by_key(|m| (m.sent.is_none(), m.id));
    let mut seen = std::collections::HashSet::new();
    let mut roster = vec![];
    for message in kept {
        if seen.insert(normalize_email(&message.email)) {
            changes.set(&message)?;
            roster.push(message);
        } else {
            changes.remove(&message);
        }
    }

    if let Some(newsletter) = mailing.newsletter {
        let covered: std::collections::HashSet<Id> =
            roster.iter().filter_map(|m| m.subscriber).collect();
        for subscriber in get_subscribers(db, newsletter, &mailing.segments)? {
            if covered.contains(&subscriber.id) {
                continue;
            }
            let Some(email) = subscriber.get_email(db)? else {
                continue;
            };
            if email.is_empty() || !seen.insert(normalize_email(&email)) {
                continue;
            }
            let message = MailingMessage {
                subscriber: Some(subscriber.id),
                name: subscriber.get_name(db)?,
                email,
                ..MailingMessage::new(db, mailing.id)?
            };
            changes.set(&message)?;
            roster.push(message);
        }
    }

    db.apply(changes)?;
    tracing::info!(mailing = mailing.id, recipients = roster.len(), "finalized mailing");
    Ok(roster.len())
}

fn fill_recipient(db: &Database, message: &mut MailingMessage) -> Result<()> {
    if let Some(donor) = message.donor.map(|id| db.get_opt::<Donor>(id)).transpose()?.flatten() {
        message.name = donor.full_name();
        message.email = donor.email;
    } else if let Some(user) = message.user.map(|id| db.get_opt::<User>(id)).transpose()?.flatten() {
        message.name = user.full_name();
        message.email = user.email;
    }
    if message.email.is_empty() {
        if let Some(subscriber) = message
            .subscriber
            .map(|id| db.get_opt::<Subscriber>(id))
            .transpose()?
            .flatten()
        {
            message.email = subscriber.get_email(db)?.unwrap_or_default();
            message.name = subscriber.get_name(db)?;
        }
    }
    Ok(())
}

/// Finalizes and sends a ready, submitted mailing that is neither sent nor
/// being sent.
pub async fn send_mailing(app: &App, mailing: Id) -> Result<SendReport> {
    let current: Mailing = app.db.get(mailing)?;
    if !current.ready || !current.submitted || current.sent || current.sending {
        tracing::debug!(mailing, "mailing not in sendable state");
        return Ok(SendReport {
            skipped: true,
            ..Default::default()
        });
    }
    finalize(&app.db, mailing)?;
    send(app, mailing).await
}

/// Delivers all unsent messages and marks the mailing sent.
///
/// Transport failures are recorded per message and do not stop the run.
/// Failed messages stay unsent for [`continue_sending`].
pub async fn send(app: &App, mailing: Id) -> Result<SendReport> {
    let claimed = app.db.update::<Mailing, _>(mailing, |mut m| {
        if m.sending || m.sent || !m.submitted || m.is_continuous {
            return None;
        }
        m.sending = true;
        Some(m)
    })?;
    let Some(claimed) = claimed else {
        return Ok(SendReport {
            skipped: true,
            ..Default::default()
        });
    };
    run_claimed(app, claimed, true).await
}

/// Resumes delivery of messages left unsent by an earlier run.
pub async fn continue_sending(app: &App, mailing: Id) -> Result<SendReport> {
    let claimed = app.db.update::<Mailing, _>(mailing, |mut m| {
        if m.sending || !m.submitted || m.is_continuous {
            return None;
        }
        m.sending = true;
        Some(m)
    })?;
    let Some(claimed) = claimed else {
        return Ok(SendReport {
            skipped: true,
            ..Default::default()
        });
    };
    run_claimed(app, claimed, false).await
}

async fn run_claimed(app: &App, mailing: Mailing, first_run: bool) -> Result<SendReport> {
    tracing::info!(mailing = mailing.id, "sending mailing {}", mailing.name);
    let result = deliver(app, &mailing).await;

    // Always release the claim.
    let delivered = result.is_ok();
    app.db.update::<Mailing, _>(mailing.id, |mut m| {
        m.sending = false;
        if delivered && (first_run || !m.sent) {
            m.sent = true;
            m.sent_date = m.sent_date.or_else(|| Some(Utc::now()));
        }
        Some(m)
    })?;

    match &result {
        Ok(report) => tracing::info!(
            mailing = mailing.id,
            sent = report.sent,
            failed = report.failed,
            removed = report.removed,
            "mailing run done"
        ),
        Err(e) => tracing::error!(mailing = mailing.id, "mailing run failed: {e}"),
    }
    result
}

async fn deliver(app: &App, mailing: &Mailing) -> Result<SendReport> {
    let db = &app.db;
    let template = mailing.template(db)?;
    let from = mailing.sender(&app.config);
    let mut report = SendReport::default();

    for mut message in messages_of(db, mailing.id)? {
        if message.sent.is_some() || message.is_continuous {
            continue;
        }
        if message.email.is_empty() {
            db.remove(&message)?;
            report.removed += 1;
            continue;
        }
        if let Some(newsletter) = mailing.newsletter {
            let still_subscribed = match message.subscriber {
                Some(id) => db
                    .get_opt::<Subscriber>(id)?
                    .map(|s| s.newsletter == newsletter && s.is_subscribed())
                    .unwrap_or(false),
                None => false,
            };
            if !still_subscribed {
                db.remove(&message)?;
                report.removed += 1;
                continue;
            }
        }

        let context = message_context(db, &app.config, mailing, &message)?;
        let content = render_for_mailing(&app.config, mailing, &template, &context)?;
        let mut headers = vec![];
        if let Some(reference) = context.get("unsubscribe_reference").and_then(|r| r.as_str()) {
            headers.push(list_unsubscribe(&app.config, reference));
        }
        let email = OutgoingEmail {
            subject: content.subject,
            text: content.text,
            html: content.html,
            from: from.clone(),
            to: vec![mailbox(&message.name, &message.email)],
            headers,
            ..Default::default()
        };

        match app.transport.send(&email).await {
            Ok(()) => {
                message.sent = Some(Utc::now());
                message.failure.clear();
                report.sent += 1;
            }
            Err(e) => {
                tracing::warn!(
                    mailing = mailing.id,
                    message = message.id,
                    "mailing message failed: {e}"
                );
                message.failure = e.to_string();
                report.failed += 1;
            }
        }
        db.set(&message)?;
    }
    Ok(report)
}

/// Sends every submitted mailing whose sending date has come.
pub async fn send_due_mailings(app: &App, now: DateTime<Utc>) -> Result<Vec<(Id, SendReport)>> {
    let due = app.db.filter::<Mailing, _>(|m| {
        !m.is_continuous
            && m.ready
            && m.submitted
            && !m.sent
            && !m.sending
            && m.sending_date.map(|d| d <= now).unwrap_or(true)
    })?;
    let mut reports = vec![];
    for mailing in due {
        let report = send_mailing(app, mailing.id).await?;
        reports.push((mailing.id, report));
    }
    Ok(reports)
}

/// Flags recently sent messages to the address as bounced.
pub fn mark_bounced(db: &Database, email: &str, now: DateTime<Utc>) -> Result<usize> {
    let email = normalize_email(email);
    let since = now - Duration::hours(BOUNCE_WINDOW_HOURS);
    let messages = db.filter::<MailingMessage, _>(|m| {
        !m.bounced
            && normalize_email(&m.email) == email
            && m.sent.map(|sent| sent >= since).unwrap_or(false)
    })?;
    let mut changes = Changeset::new();
    for mut message in messages {
        message.bounced = true;
        changes.set(&message)?;
    }
    let count = changes.len();
    db.apply(changes)?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::mailing::Block;

    struct Fixture {
        app: App,
        transport: std::sync::Arc<crate::email::MemoryTransport>,
        newsletter: Newsletter,
        mailing: Mailing,
    }

    fn subscriber(db: &Database, newsletter: Id, email: &str) -> Subscriber {
        let subscriber = Subscriber {
            email: Some(email.to_string()),
            subscribed: Some(Utc::now()),
            ..Subscriber::new(db, newsletter).unwrap()
        };
        db.set(&subscriber).unwrap();
        subscriber
    }

    fn fixture() -> Fixture {
        let mut config = Config::default();
        config.site.url = "https://example.com".to_string();
        let (app, transport) = App::in_memory(config).unwrap();
        let newsletter = Newsletter::new(&app.db, "fragdenstaat", "Newsletter").unwrap();
        app.db.set(&newsletter).unwrap();
        let template = EmailTemplate {
            subject: "Neues für {{ name }}".to_string(),
            blocks: vec![Block::Text {
                text: "Visit https://example.com/page and https://external.com/page".to_string(),
                html: String::new(),
            }],
            ..EmailTemplate::new(&app.db, "monthly").unwrap()
        };
        app.db.set(&template).unwrap();
        let mailing = Mailing {
            id: 1,
            email_template: Some(template.id),
            newsletter: Some(newsletter.id),
            tracking: true,
            ready: true,
            submitted: true,
            sending_date: Some(Utc.with_ymd_and_hms(2024, 12, 13, 12, 42, 0).unwrap()),
            ..Default::default()
        };
        app.db.set(&mailing).unwrap();
        Fixture {
            app,
            transport,
            newsletter,
            mailing,
        }
    }

    #[tokio::test]
    async fn tracked_mailing_tags_site_links_only() {
        let f = fixture();
        subscriber(&f.app.db, f.newsletter.id, "jane@example.org");

        let report = send_mailing(&f.app, f.mailing.id).await.unwrap();
        assert_eq!(report.sent, 1);

        let sent = f.transport.sent_to("jane@example.org");
        let email = &sent[0];
        assert!(email
            .text
            .contains("https://example.com/page?pk_campaign=mailing-202412131242-1"));
        assert!(email.text.contains("https://external.com/page"));
        assert!(!email.text.contains("external.com/page?pk_campaign"));
        let html = email.html.as_ref().unwrap();
        assert!(html.contains("https://example.com/page?pk_campaign=mailing-202412131242-1"));
        assert!(html.contains("/mailing/1/"));
        assert!(email
            .header("List-Unsubscribe")
            .unwrap()
            .contains("-mailing-202412131242-1>"));

        let mailing: Mailing = f.app.db.get(f.mailing.id).unwrap();
        assert!(mailing.sent);
        assert!(!mailing.sending);
        assert!(mailing.sent_date.is_some());
    }

    #[tokio::test]
    async fn finalize_is_idempotent_and_dedupes() {
        let f = fixture();
        let db = &f.app.db;
        subscriber(db, f.newsletter.id, "jane@example.org");
        subscriber(db, f.newsletter.id, "john@example.org");
        let unsubscribed = Subscriber {
            email: Some("gone@example.org".to_string()),
            unsubscribed: Some(Utc::now()),
            ..Subscriber::new(db, f.newsletter.id).unwrap()
        };
        db.set(&unsubscribed).unwrap();

        assert_eq!(finalize(db, f.mailing.id).unwrap(), 2);
        assert_eq!(finalize(db, f.mailing.id).unwrap(), 2);
        assert_eq!(messages_of(db, f.mailing.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failures_are_retried_by_continue_sending() {
        let f = fixture();
        subscriber(&f.app.db, f.newsletter.id, "jane@example.org");
        subscriber(&f.app.db, f.newsletter.id, "john@example.org");
        f.transport.fail_for("john@example.org");

        let report = send_mailing(&f.app, f.mailing.id).await.unwrap();
        assert_eq!((report.sent, report.failed), (1, 1));
        let mailing: Mailing = f.app.db.get(f.mailing.id).unwrap();
        assert!(mailing.sent);

        // A second send of a sent mailing does nothing.
        assert!(send_mailing(&f.app, f.mailing.id).await.unwrap().skipped);

        let f2 = std::sync::Arc::new(crate::email::MemoryTransport::new());
        let app = App {
            transport: f2.clone(),
            ..f.app.clone()
        };
        let report = continue_sending(&app, f.mailing.id).await.unwrap();
        assert_eq!((report.sent, report.failed), (1, 0));
        assert_eq!(f2.sent_to("john@example.org").len(), 1);
        assert!(f2.sent_to("jane@example.org").is_empty());
    }

    #[tokio::test]
    async fn sending_claim_blocks_second_worker() {
        let f = fixture();
        subscriber(&f.app.db, f.newsletter.id, "jane@example.org");
        f.app
            .db
            .update::<Mailing, _>(f.mailing.id, |mut m| {
                m.sending = true;
                Some(m)
            })
            .unwrap();
        assert!(send(&f.app, f.mailing.id).await.unwrap().skipped);
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn unsubscribed_recipients_are_dropped_before_delivery() {
        let f = fixture();
        let db = &f.app.db;
        let mut jane = subscriber(db, f.newsletter.id, "jane@example.org");
        finalize(db, f.mailing.id).unwrap();
        jane.subscribed = None;
        jane.unsubscribed = Some(Utc::now());
        db.set(&jane).unwrap();

        let report = send(&f.app, f.mailing.id).await.unwrap();
        assert_eq!((report.sent, report.removed), (0, 1));
        assert!(messages_of(db, f.mailing.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_mailings_and_bounces() {
        let f = fixture();
        subscriber(&f.app.db, f.newsletter.id, "jane@example.org");
        let before = Utc.with_ymd_and_hms(2024, 12, 13, 12, 0, 0).unwrap();
        assert!(send_due_mailings(&f.app, before).await.unwrap().is_empty());

        let now = Utc::now();
        let reports = send_due_mailings(&f.app, now).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(mark_bounced(&f.app.db, "Jane@example.org", now).unwrap(), 1);
        assert_eq!(
            mark_bounced(&f.app.db, "jane@example.org", now + Duration::hours(48)).unwrap(),
            0
        );
    }
}
