//! Automatic subscriber tags.
//!
//! Every [`TagContributor`] looks at a subscriber and says which tags it
//! should carry and which it should lose. The nightly job applies all of
//! them to every subscriber.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;

use crate::db::{Changeset, Database};
use crate::donation::{donations_of, Donor};
use crate::util::normalize_email;
use crate::Result;

use super::Subscriber;

pub const TAG_NEW: &str = "newsletter:new";
pub const TAG_DONOR: &str = "donor";
pub const TAG_DONOR_RECURRING: &str = "donor:recurring";

/// Subscribers count as new for this many days.
pub const NEW_SUBSCRIBER_DAYS: i64 = 182;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagChange {
    pub add: BTreeSet<String>,
    pub remove: BTreeSet<String>,
}

impl TagChange {
    fn toggle(&mut self, tag: &str, on: bool) {
        if on {
            self.add.insert(tag.to_string());
        } else {
            self.remove.insert(tag.to_string());
        }
    }
}

pub trait TagContributor: Send + Sync {
    fn tags(&self, db: &Database, subscriber: &Subscriber, now: DateTime<Utc>) -> Result<TagChange>;
}

pub struct NewSubscriberTags;

impl TagContributor for NewSubscriberTags {
    fn tags(&self, _db: &Database, subscriber: &Subscriber, now: DateTime<Utc>) -> Result<TagChange> {
        let since = subscriber.subscribed.unwrap_or(subscriber.created);
        let mut change = TagChange::default();
        change.toggle(TAG_NEW, now - since < Duration::days(NEW_SUBSCRIBER_DAYS));
        Ok(change)
    }
}

pub struct DonorTags;

impl DonorTags {
    fn donor_for(db: &Database, subscriber: &Subscriber) -> Result<Option<Donor>> {
        if let Some(donor) = db.find::<Donor, _>(|d| d.subscriber == Some(subscriber.id))? {
            return Ok(Some(donor));
        }
        if let Some(user) = subscriber.user {
            return db.find::<Donor, _>(|d| d.user == Some(user));
        }
        match &subscriber.email {
            Some(email) => db.find::<Donor, _>(|d| {
                d.email_confirmed.is_some() && normalize_email(&d.email) == *email
            }),
            None => Ok(None),
        }
    }
}

impl TagContributor for DonorTags {
    fn tags(&self, db: &Database, subscriber: &Subscriber, _now: DateTime<Utc>) -> Result<TagChange> {
        let mut change = TagChange::default();
        let donor = Self::donor_for(db, subscriber)?;
        let received = match &donor {
            Some(donor) => donations_of(db, donor.id)?.iter().any(|d| d.is_received()),
            None => false,
        };
        let recurring = donor
            .as_ref()
            .map(|d| d.recurring_amount > Decimal::ZERO)
            .unwrap_or(false);
        change.toggle(TAG_DONOR, received);
        change.toggle(TAG_DONOR_RECURRING, received && recurring);
        Ok(change)
    }
}

pub fn default_contributors() -> Vec<Box<dyn TagContributor>> {
    vec![Box::new(NewSubscriberTags), Box::new(DonorTags)]
}

/// Applies all contributors to the subscriber. Returns whether its tags
/// changed.
pub fn update_tags(
    db: &Database,
    subscriber: &mut Subscriber,
    contributors: &[Box<dyn TagContributor>],
    now: DateTime<Utc>,
) -> Result<bool> {
    let mut change = TagChange::default();
    for contributor in contributors {
        let c = contributor.tags(db, subscriber, now)?;
        change.add.extend(c.add);
        change.remove.extend(c.remove);
    }
    let before = subscriber.tags.clone();
    for tag in &change.remove {
        if !change.add.contains(tag) {
            subscriber.tags.remove(tag);
        }
    }
    subscriber.tags.extend(change.add);
    Ok(subscriber.tags != before)
}

/// Nightly pass over all current subscribers. Returns the number of
/// subscribers whose tags changed.
pub fn gather_tags(db: &Database, now: DateTime<Utc>) -> Result<usize> {
    let contributors = default_contributors();
    let mut changes = Changeset::new();
    for mut subscriber in db.filter::<Subscriber, _>(|s| !s.is_unsubscribed())? {
        if update_tags(db, &mut subscriber, &contributors, now)? {
            changes.set(&subscriber)?;
        }
    }
    let changed = changes.len();
    db.apply(changes)?;
    tracing::info!(changed, "gathered subscriber tags");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::donation::Donation;

    #[test]
    fn new_tag_expires() {
        let db = Database::temporary().unwrap();
        let now = Utc::now();
        let mut subscriber = Subscriber {
            subscribed: Some(now - Duration::days(10)),
            ..Subscriber::new(&db, 1).unwrap()
        };
        db.set(&subscriber).unwrap();
        let contributors = default_contributors();
        assert!(update_tags(&db, &mut subscriber, &contributors, now).unwrap());
        assert!(subscriber.tags.contains(TAG_NEW));

        let later = now + Duration::days(200);
        assert!(update_tags(&db, &mut subscriber, &contributors, later).unwrap());
        assert!(!subscriber.tags.contains(TAG_NEW));
        assert!(!update_tags(&db, &mut subscriber, &contributors, later).unwrap());
    }

    #[test]
    fn donor_tags_follow_donations() {
        let db = Database::temporary().unwrap();
        let subscriber = Subscriber {
            email: Some("jane@example.org".to_string()),
            subscribed: Some(Utc::now()),
            ..Subscriber::new(&db, 1).unwrap()
        };
        db.set(&subscriber).unwrap();
        let donor = Donor {
            email: "jane@example.org".to_string(),
            email_confirmed: Some(Utc::now()),
            recurring_amount: dec!(5),
            ..Donor::new(&db).unwrap()
        };
        db.set(&donor).unwrap();

        assert_eq!(gather_tags(&db, Utc::now()).unwrap(), 1);
        let tags = db.get::<Subscriber>(subscriber.id).unwrap().tags;
        assert!(!tags.contains(TAG_DONOR));

        let donation = Donation {
            amount: dec!(5),
            received_timestamp: Some(Utc::now()),
            ..Donation::new(&db, donor.id).unwrap()
        };
        db.set(&donation).unwrap();
        gather_tags(&db, Utc::now()).unwrap();
        let tags = db.get::<Subscriber>(subscriber.id).unwrap().tags;
        assert!(tags.contains(TAG_DONOR));
        assert!(tags.contains(TAG_DONOR_RECURRING));
    }
}
