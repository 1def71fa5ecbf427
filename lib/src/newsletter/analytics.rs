//! Weekly subscriber digest for the team.

use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::app::App;
use crate::db::Database;
use crate::donation::Donation;
use crate::money::{format_eur, Amount};
use crate::{notify, Result};

use super::{Newsletter, Subscriber};

pub const DIGEST_DAYS: i64 = 7;

/// Donations carrying this reference are attributed to the newsletter.
pub const NEWSLETTER_REFERENCE: &str = "newsletter";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewsletterStats {
    pub newsletter: String,
    pub subscribed: usize,
    pub subscribed_by_reference: BTreeMap<String, usize>,
    pub unsubscribed: usize,
    pub unsubscribed_by_reference: BTreeMap<String, usize>,
    pub unsubscribed_by_method: BTreeMap<String, usize>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Digest {
    pub since: DateTime<Utc>,
    pub newsletters: Vec<NewsletterStats>,
    pub donations: usize,
    pub donation_total: Amount,
}

fn bump(map: &mut BTreeMap<String, usize>, key: &str) {
    let key = if key.is_empty() { "-" } else { key };
    *map.entry(key.to_string()).or_default() += 1;
}

pub fn collect_digest(db: &Database, now: DateTime<Utc>) -> Result<Digest> {
    let since = now - Duration::days(DIGEST_DAYS);
    let in_window = |d: Option<DateTime<Utc>>| d.map(|d| d > since && d <= now).unwrap_or(false);

    let mut digest = Digest {
        since,
        donation_total: Decimal::ZERO,
        ..Default::default()
    };
    let mut newsletters = db.get_collection::<Newsletter>()?;
    newsletters.sort_by(|a, b| a.slug.cmp(&b.slug));
    for newsletter in newsletters {
        let mut stats = NewsletterStats {
            newsletter: newsletter.title.clone(),
            ..Default::default()
        };
        for subscriber in db.filter::<Subscriber, _>(|s| s.newsletter == newsletter.id)? {
            if in_window(subscriber.subscribed) {
                stats.subscribed += 1;
                bump(&mut stats.subscribed_by_reference, &subscriber.reference);
            }
            if in_window(subscriber.unsubscribed) {
                stats.unsubscribed += 1;
                bump(
                    &mut stats.unsubscribed_by_reference,
                    &subscriber.unsubscribe_reference,
                );
                bump(&mut stats.unsubscribed_by_method, &subscriber.unsubscribe_method);
            }
        }
        digest.newsletters.push(stats);
    }

    for donation in db.filter::<Donation, _>(|d| {
        d.completed && d.reference == NEWSLETTER_REFERENCE && in_window(Some(d.timestamp))
    })? {
        digest.donations += 1;
        digest.donation_total += donation.amount;
    }
    Ok(digest)
}

pub fn format_digest(digest: &Digest) -> String {
    let mut out = String::new();
    for stats in &digest.newsletters {
        let _ = writeln!(out, "{}", stats.newsletter);
        let _ = writeln!(out, "  Neue Abonnent:innen: {}", stats.subscribed);
        for (reference, count) in &stats.subscribed_by_reference {
            let _ = writeln!(out, "    {reference}: {count}");
        }
        let _ = writeln!(out, "  Abmeldungen: {}", stats.unsubscribed);
        for (method, count) in &stats.unsubscribed_by_method {
            let _ = writeln!(out, "    {method}: {count}");
        }
        for (reference, count) in &stats.unsubscribed_by_reference {
            let _ = writeln!(out, "    {reference}: {count}");
        }
    }
    let _ = writeln!(
        out,
        "Spenden über den Newsletter: {} ({})",
        digest.donations,
        format_eur(digest.donation_total)
    );
    out
}

pub async fn send_weekly_digest(app: &App, now: DateTime<Utc>) -> Result<Digest> {
    let digest = collect_digest(&app.db, now)?;
    notify::admin_notification(app, "Newsletter-Wochenbericht", &format_digest(&digest)).await?;
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn counts_only_the_last_week() {
        let db = Database::temporary().unwrap();
        let now = Utc::now();
        let newsletter = Newsletter::new(&db, "fragdenstaat", "FragDenStaat").unwrap();
        db.set(&newsletter).unwrap();
        for (days, reference) in [(1, "web"), (2, "web"), (10, "web"), (3, "")] {
            let subscriber = Subscriber {
                subscribed: Some(now - Duration::days(days)),
                reference: reference.to_string(),
                ..Subscriber::new(&db, newsletter.id).unwrap()
            };
            db.set(&subscriber).unwrap();
        }
        let gone = Subscriber {
            unsubscribed: Some(now - Duration::days(1)),
            unsubscribe_method: "unsubscribe-link".to_string(),
            unsubscribe_reference: "mailing-202403051200-4".to_string(),
            ..Subscriber::new(&db, newsletter.id).unwrap()
        };
        db.set(&gone).unwrap();
        let donation = Donation {
            amount: dec!(25),
            completed: true,
            timestamp: now - Duration::hours(1),
            reference: NEWSLETTER_REFERENCE.to_string(),
            ..Donation::new(&db, 1).unwrap()
        };
        db.set(&donation).unwrap();

        let digest = collect_digest(&db, now).unwrap();
        let stats = &digest.newsletters[0];
        assert_eq!(stats.subscribed, 3);
        assert_eq!(stats.subscribed_by_reference.get("web"), Some(&2));
        assert_eq!(stats.subscribed_by_reference.get("-"), Some(&1));
        assert_eq!(stats.unsubscribed_by_method.get("unsubscribe-link"), Some(&1));
        assert_eq!(digest.donations, 1);
        assert!(format_digest(&digest).contains("25,00 €"));
    }
}
