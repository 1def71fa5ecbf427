//! Event handlers keeping subscribers consistent with account changes.

use chrono::Utc;

use crate::app::App;
use crate::db::{Changeset, Database, Id};
use crate::mailing::intent::{send_intent, Recipient};
use crate::mailing::send::mark_bounced;
use crate::user::User;
use crate::util::normalize_email;
use crate::Result;

use super::subscribe::{handle_bounce, unsubscribe};
use super::{Newsletter, Subscriber, METHOD_USER_CANCELED};

/// Sends the newsletter's welcome intent. Newsletters without one stay
/// silent.
pub async fn send_welcome(app: &App, subscriber: Id) -> Result<()> {
    let subscriber: Subscriber = app.db.get(subscriber)?;
    let newsletter: Newsletter = app.db.get(subscriber.newsletter)?;
    let Some(intent) = newsletter.welcome_intent.as_deref().filter(|i| !i.is_empty()) else {
        tracing::debug!(newsletter = %newsletter.slug, "no welcome intent");
        return Ok(());
    };
    let context = subscriber.email_context(&app.db, &app.config, &newsletter)?;
    let recipient = Recipient::from_subscriber(&app.db, &subscriber)?;
    send_intent(app, intent, &recipient, context).await
}

/// Address subscribers carrying the account's new address become account
/// subscribers, or are dropped where the account already has one.
pub fn user_email_changed(db: &Database, user: Id) -> Result<()> {
    let user: User = db.get(user)?;
    let email = normalize_email(&user.email);
    if email.is_empty() {
        return Ok(());
    }
    let mut changes = Changeset::new();
    for mut subscriber in
        db.filter::<Subscriber, _>(|s| s.email.as_deref() == Some(email.as_str()))?
    {
        let newsletter = subscriber.newsletter;
        let bound = db
            .find::<Subscriber, _>(|s| s.newsletter == newsletter && s.user == Some(user.id))?;
        if bound.is_some() {
            changes.remove(&subscriber);
        } else {
            subscriber.email = None;
            subscriber.user = Some(user.id);
            changes.set(&subscriber)?;
        }
    }
    if !changes.is_empty() {
        tracing::info!(user = user.id, changes = changes.len(), "collapsed subscribers after email change");
        db.apply(changes)?;
    }
    Ok(())
}

/// Moves subscribers of account `old` to account `new`. Where both are
/// subscribed to the same newsletter the surviving account's subscriber is
/// kept, taking over a confirmed state from the merged one.
pub fn merge_user(db: &Database, old: Id, new: Id) -> Result<()> {
    let mut changes = Changeset::new();
    for mut subscriber in db.filter::<Subscriber, _>(|s| s.user == Some(old))? {
        let newsletter = subscriber.newsletter;
        match db.find::<Subscriber, _>(|s| s.newsletter == newsletter && s.user == Some(new))? {
            Some(mut existing) => {
                if subscriber.is_subscribed() && !existing.is_subscribed() {
                    existing.subscribed = subscriber.subscribed;
                    existing.unsubscribed = None;
                    changes.set(&existing)?;
                }
                changes.remove(&subscriber);
            }
            None => {
                subscriber.user = Some(new);
                changes.set(&subscriber)?;
            }
        }
    }
    tracing::info!(old, new, changes = changes.len(), "merged account subscribers");
    db.apply(changes)
}

pub fn cancel_user(db: &Database, user: Id) -> Result<()> {
    for subscriber in db.filter::<Subscriber, _>(|s| s.user == Some(user))? {
        unsubscribe(db, &subscriber, METHOD_USER_CANCELED, "")?;
    }
    Ok(())
}

pub fn email_bounced(db: &Database, email: &str, user: Option<Id>) -> Result<()> {
    let unsubscribed = handle_bounce(db, email, user)?;
    let marked = mark_bounced(db, email, Utc::now())?;
    tracing::info!(unsubscribed, marked, "handled bounce");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{dispatch, Event};
    use crate::mailing::intent::SUBSCRIBER_WELCOME;
    use crate::newsletter::subscribe::{subscribe, SubscribeOptions};
    use crate::newsletter::METHOD_BOUNCED;
    use crate::{App, Config};

    fn subscribed(db: &Database, newsletter: Id, user: Option<Id>, email: Option<&str>) -> Subscriber {
        let subscriber = Subscriber {
            user,
            email: email.map(|e| e.to_string()),
            subscribed: Some(Utc::now()),
            ..Subscriber::new(db, newsletter).unwrap()
        };
        db.set(&subscriber).unwrap();
        subscriber
    }

    #[tokio::test]
    async fn welcome_mail_after_subscribing() {
        let (app, transport) = App::in_memory(Config::default()).unwrap();
        let newsletter = Newsletter {
            welcome_intent: Some(SUBSCRIBER_WELCOME.to_string()),
            ..Newsletter::new(&app.db, "fragdenstaat", "FragDenStaat").unwrap()
        };
        app.db.set(&newsletter).unwrap();

        subscribe(
            &app,
            &newsletter,
            "jane@example.org",
            SubscribeOptions {
                email_confirmed: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let sent = transport.sent_to("jane@example.org");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Willkommen beim Newsletter FragDenStaat");
        assert!(sent[0].header("List-Unsubscribe").is_some());
    }

    #[test]
    fn email_change_collapses_address_subscribers() {
        let db = Database::temporary().unwrap();
        let a = Newsletter::new(&db, "a", "A").unwrap();
        let b = Newsletter::new(&db, "b", "B").unwrap();
        let user = User::new(&db, "new@example.org", "Jane", "Doe").unwrap();
        db.set(&user).unwrap();

        subscribed(&db, a.id, Some(user.id), None);
        let dup = subscribed(&db, a.id, None, Some("new@example.org"));
        let other = subscribed(&db, b.id, None, Some("new@example.org"));

        user_email_changed(&db, user.id).unwrap();
        assert!(db.get_opt::<Subscriber>(dup.id).unwrap().is_none());
        let other = db.get::<Subscriber>(other.id).unwrap();
        assert_eq!(other.user, Some(user.id));
        assert!(other.email.is_none());
    }

    #[test]
    fn merging_accounts_keeps_one_subscriber() {
        let db = Database::temporary().unwrap();
        let a = Newsletter::new(&db, "a", "A").unwrap();
        let b = Newsletter::new(&db, "b", "B").unwrap();
        let kept = Subscriber {
            user: Some(2),
            ..Subscriber::new(&db, a.id).unwrap()
        };
        db.set(&kept).unwrap();
        let merged = subscribed(&db, a.id, Some(1), None);
        let moved = subscribed(&db, b.id, Some(1), None);

        merge_user(&db, 1, 2).unwrap();
        assert!(db.get_opt::<Subscriber>(merged.id).unwrap().is_none());
        assert!(db.get::<Subscriber>(kept.id).unwrap().is_subscribed());
        assert_eq!(db.get::<Subscriber>(moved.id).unwrap().user, Some(2));
    }

    #[tokio::test]
    async fn canceled_account_unsubscribes() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let newsletter = Newsletter::new(&app.db, "a", "A").unwrap();
        let subscriber = subscribed(&app.db, newsletter.id, Some(7), None);

        dispatch(&app, Event::UserCanceled { user: 7 }).await;
        let subscriber = app.db.get::<Subscriber>(subscriber.id).unwrap();
        assert!(subscriber.is_unsubscribed());
        assert_eq!(subscriber.unsubscribe_method, METHOD_USER_CANCELED);
    }

    #[tokio::test]
    async fn bounce_event_unsubscribes_address() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let newsletter = Newsletter::new(&app.db, "a", "A").unwrap();
        let subscriber = subscribed(&app.db, newsletter.id, None, Some("jane@example.org"));

        dispatch(
            &app,
            Event::EmailBounced {
                email: "Jane@example.org".to_string(),
                user: None,
            },
        )
        .await;
        let subscriber = app.db.get::<Subscriber>(subscriber.id).unwrap();
        assert_eq!(subscriber.unsubscribe_method, METHOD_BOUNCED);
    }
}
