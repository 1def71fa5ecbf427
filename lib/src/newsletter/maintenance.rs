//! Retention jobs for subscribers and unsubscribe feedback.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::db::{Changeset, Database};
use crate::{Config, Result};

use super::{Subscriber, UnsubscribeFeedback};

/// Unconfirmed subscribers are purged after this many days.
pub const UNCONFIRMED_DAYS: i64 = 30;
/// Unsubscribed subscribers are anonymized after this many days.
pub const ANONYMIZE_DAYS: i64 = 3;
/// Feedback loses its subscriber link after this many minutes.
pub const FEEDBACK_MINUTES: i64 = 60;

pub fn email_hash(salt: &str, email: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(email.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub purged: usize,
    pub anonymized: usize,
}

fn is_anonymized(subscriber: &Subscriber) -> bool {
    subscriber.email.is_none() && subscriber.user.is_none() && subscriber.name.is_empty()
}

pub fn cleanup_subscribers(db: &Database, config: &Config, now: DateTime<Utc>) -> Result<CleanupReport> {
    let purge_before = now - Duration::days(UNCONFIRMED_DAYS);
    let anonymize_before = now - Duration::days(ANONYMIZE_DAYS);

    let mut report = CleanupReport::default();
    let mut changes = Changeset::new();
    for mut subscriber in db.get_collection::<Subscriber>()? {
        if subscriber.is_pending() && subscriber.created < purge_before {
            changes.remove(&subscriber);
            report.purged += 1;
            continue;
        }
        let due = subscriber
            .unsubscribed
            .map(|d| d < anonymize_before)
            .unwrap_or(false);
        if due && !is_anonymized(&subscriber) {
            if let Some(email) = subscriber.get_email(db)? {
                subscriber.email_hash = email_hash(&config.newsletter.hash_salt, &email);
            }
            subscriber.email = None;
            subscriber.user = None;
            subscriber.name.clear();
            changes.set(&subscriber)?;
            report.anonymized += 1;
        }
    }
    db.apply(changes)?;
    tracing::info!(purged = report.purged, anonymized = report.anonymized, "cleaned up subscribers");
    Ok(report)
}

pub fn anonymize_feedback(db: &Database, now: DateTime<Utc>) -> Result<usize> {
    let before = now - Duration::minutes(FEEDBACK_MINUTES);
    let mut changes = Changeset::new();
    for mut feedback in
        db.filter::<UnsubscribeFeedback, _>(|f| f.subscriber.is_some() && f.created < before)?
    {
        feedback.subscriber = None;
        changes.set(&feedback)?;
    }
    let count = changes.len();
    db.apply(changes)?;
    if count > 0 {
        tracing::debug!(count, "anonymized unsubscribe feedback");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newsletter::{submit_feedback, UnsubscribeReason};

    #[test]
    fn purges_and_anonymizes() {
        let db = Database::temporary().unwrap();
        let config = Config::default();
        let now = Utc::now();

        let stale = Subscriber {
            email: Some("stale@example.org".to_string()),
            created: now - Duration::days(31),
            ..Subscriber::new(&db, 1).unwrap()
        };
        let fresh = Subscriber {
            email: Some("fresh@example.org".to_string()),
            ..Subscriber::new(&db, 1).unwrap()
        };
        let gone = Subscriber {
            email: Some("gone@example.org".to_string()),
            name: "Gone".to_string(),
            unsubscribed: Some(now - Duration::days(4)),
            ..Subscriber::new(&db, 1).unwrap()
        };
        for s in [&stale, &fresh, &gone] {
            db.set(s).unwrap();
        }

        let report = cleanup_subscribers(&db, &config, now).unwrap();
        assert_eq!(report, CleanupReport { purged: 1, anonymized: 1 });
        assert!(db.get_opt::<Subscriber>(stale.id).unwrap().is_none());
        assert!(db.get_opt::<Subscriber>(fresh.id).unwrap().is_some());

        let gone = db.get::<Subscriber>(gone.id).unwrap();
        assert!(gone.email.is_none() && gone.name.is_empty());
        assert_eq!(
            gone.email_hash,
            email_hash(&config.newsletter.hash_salt, "gone@example.org")
        );
        // second run has nothing left to do
        let report = cleanup_subscribers(&db, &config, now).unwrap();
        assert_eq!(report, CleanupReport::default());
    }

    #[test]
    fn feedback_loses_link_after_an_hour() {
        let db = Database::temporary().unwrap();
        let subscriber = Subscriber::new(&db, 1).unwrap();
        db.set(&subscriber).unwrap();
        let feedback = submit_feedback(&db, &subscriber, UnsubscribeReason::TooMuch, "zu viel")
            .unwrap()
            .unwrap();
        assert!(submit_feedback(&db, &subscriber, UnsubscribeReason::Other, "")
            .unwrap()
            .is_none());

        assert_eq!(anonymize_feedback(&db, Utc::now()).unwrap(), 0);
        assert_eq!(
            anonymize_feedback(&db, Utc::now() + Duration::minutes(61)).unwrap(),
            1
        );
        let feedback = db.get::<UnsubscribeFeedback>(feedback.id).unwrap();
        assert!(feedback.subscriber.is_none());
        assert_eq!(feedback.comment, "zu viel");
    }
}
