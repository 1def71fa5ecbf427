//! Donor identity: lookup, creation, confirmation, duplicate detection and
//! merging.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::app::App;
use crate::db::{Changeset, Database, Id};
use crate::money::{cents, Amount};
use crate::newsletter::subscribe::{
    subscribe_donor_newsletter, subscribe_to_default_newsletter, SubscribeOptions,
};
use crate::payment::Subscription;
use crate::user::{find_active_by_email, User};
use crate::util::normalize_email;
use crate::{Error, Result};

use super::{donations_of, recurrences_of, Donation, Donor, Recurrence, Salutation};

/// Personal data as submitted with a donation or taken from an order.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DonorPayload {
    pub salutation: Salutation,
    pub first_name: String,
    pub last_name: String,
    pub company_name: String,
    pub address: String,
    pub postcode: String,
    pub city: String,
    pub country: String,
    pub email: String,
    /// Newsletter and other contact allowed.
    pub contact: bool,
    /// Wants an account created after confirming.
    pub account: bool,
    pub receipt: bool,
}

fn subscription_monthly(subscription: &Subscription) -> Amount {
    let interval = subscription.plan.interval.max(1);
    cents(subscription.plan.amount / Decimal::from(interval))
}

/// Finds the donor the payment belongs to or creates one.
///
/// Lookup order: the donor bound to the account, then the donor with the
/// same confirmed address, then the donor paying through the subscription.
pub async fn get_or_create_donor(
    app: &App,
    payload: &DonorPayload,
    user: Option<&User>,
    subscription: Option<&Subscription>,
) -> Result<Donor> {
    let db = &app.db;
    if let Some(user) = user {
        if let Some(mut donor) = db.find::<Donor, _>(|d| d.user == Some(user.id))? {
            if let Some(subscription) = subscription {
                donor.subscriptions.insert(subscription.id);
                donor.recurring_amount = subscription_monthly(subscription);
                db.set(&donor)?;
            }
            return Ok(donor);
        }
    }

    let email = normalize_email(&payload.email);
    if !email.is_empty() {
        let confirmed = db.find::<Donor, _>(|d| {
            d.email_confirmed.is_some() && normalize_email(&d.email) == email
        })?;
        if let Some(mut donor) = confirmed {
            if let Some(subscription) = subscription {
                if donor.subscriptions.insert(subscription.id) {
                    db.set(&donor)?;
                }
            }
            return Ok(donor);
        }
    }

    if let Some(subscription) = subscription {
        if let Some(donor) = db.find::<Donor, _>(|d| d.subscriptions.contains(&subscription.id))? {
            return Ok(donor);
        }
    }

    create_donor(app, payload, user, subscription).await
}

pub async fn create_donor(
    app: &App,
    payload: &DonorPayload,
    user: Option<&User>,
    subscription: Option<&Subscription>,
) -> Result<Donor> {
    let email = normalize_email(&payload.email);
    let email_confirmed = user
        .filter(|u| !u.email.is_empty() && normalize_email(&u.email) == email)
        .map(|u| u.date_joined);

    let mut donor = Donor {
        salutation: payload.salutation,
        first_name: payload.first_name.trim().to_string(),
        last_name: payload.last_name.trim().to_string(),
        company_name: payload.company_name.trim().to_string(),
        address: payload.address.trim().to_string(),
        postcode: payload.postcode.trim().to_string(),
        city: payload.city.trim().to_string(),
        email,
        user: user.map(|u| u.id),
        email_confirmed,
        contact_allowed: payload.contact,
        become_user: payload.account,
        receipt: payload.receipt,
        ..Donor::new(&app.db)?
    };
    if !payload.country.is_empty() {
        donor.country = payload.country.trim().to_uppercase();
    }
    if let Some(subscription) = subscription {
        donor.subscriptions.insert(subscription.id);
        donor.recurring_amount = subscription_monthly(subscription);
    }
    app.db.set(&donor)?;
    tracing::info!(donor = donor.id, "donor created");

    if donor.email_confirmed.is_some() && donor.contact_allowed {
        subscribe_donor(app, &mut donor).await?;
    }
    Ok(donor)
}

/// Subscribes the donor to the default and the donor newsletter and
/// remembers the default newsletter subscriber.
async fn subscribe_donor(app: &App, donor: &mut Donor) -> Result<()> {
    let options = SubscribeOptions {
        user: donor.user,
        name: donor.full_name(),
        reference: "donation".to_string(),
        email_confirmed: true,
        ..Default::default()
    };
    if let Some((_, subscriber)) =
        subscribe_to_default_newsletter(app, &donor.email, options).await?
    {
        donor.subscriber = Some(subscriber.id);
        app.db.set(donor)?;
    }
    subscribe_donor_newsletter(app, donor, true).await?;
    Ok(())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConfirmFlags {
    /// The confirmation link asked for the newsletter.
    pub newsletter: bool,
    /// Opened by staff, which must not confirm anything.
    pub staff: bool,
}

/// Confirms the donor's address from the opt-in link.
///
/// Binds the donor to the active account owning the address, merging with
/// that account's confirmed donor. Subscribes to the newsletters when
/// contact is allowed. Confirming twice changes nothing.
pub async fn confirm_donor_email(app: &App, donor: Id, flags: ConfirmFlags) -> Result<Donor> {
    let mut donor: Donor = app.db.get(donor)?;
    if flags.staff {
        tracing::debug!(donor = donor.id, "staff opened confirmation link");
        return Ok(donor);
    }
    if donor.email_confirmed.is_some() {
        tracing::debug!(donor = donor.id, "donor already confirmed");
        return Ok(donor);
    }
    donor.email_confirmed = Some(Utc::now());
    if flags.newsletter {
        donor.contact_allowed = true;
    }
    app.db.set(&donor)?;
    tracing::info!(donor = donor.id, "donor confirmed");

    if donor.user.is_none() {
        if let Some(user) = find_active_by_email(&app.db, &donor.email)? {
            donor = assign_and_merge_donors(&app.db, donor, &user)?;
        }
    }
    if donor.contact_allowed {
        subscribe_donor(app, &mut donor).await?;
    }
    Ok(donor)
}

/// Binds the donor to the account. If the account already has a confirmed
/// donor, both are merged.
pub fn assign_and_merge_donors(db: &Database, mut donor: Donor, user: &User) -> Result<Donor> {
    let other = db.find::<Donor, _>(|d| {
        d.id != donor.id && d.user == Some(user.id) && d.email_confirmed.is_some()
    })?;
    match other {
        Some(other) => merge_donor_list(db, vec![donor, other]),
        None => {
            donor.user = Some(user.id);
            db.set(&donor)?;
            Ok(donor)
        }
    }
}

/// Merges the donors into the first one, filling its empty fields from
/// the others.
pub fn merge_donor_list(db: &Database, donors: Vec<Donor>) -> Result<Donor> {
    let Some(first) = donors.first() else {
        return Err(Error::precondition("no donors to merge"));
    };
    let primary = first.id;
    let mut proposal = propose_donor_merge(&donors);
    proposal.id = primary;
    let ids: Vec<Id> = donors.iter().map(|d| d.id).collect();
    merge_donors(db, &ids, Some(primary), Some(&proposal))
}

fn pick<T: Clone>(values: impl Iterator<Item = T>, empty: impl Fn(&T) -> bool) -> Option<T> {
    values.into_iter().find(|v| !empty(v))
}

/// Best-of donor for interactive confirmation: per field the first
/// non-empty value among the candidates in the given order.
pub fn propose_donor_merge(donors: &[Donor]) -> Donor {
    let Some(first) = donors.first() else {
        return Donor::default();
    };
    let text = |f: fn(&Donor) -> &String| {
        pick(donors.iter().map(|d| f(d).clone()), |s: &String| s.trim().is_empty()).unwrap_or_default()
    };
    Donor {
        id: first.id,
        uuid: first.uuid,
        salutation: pick(donors.iter().map(|d| d.salutation), |s| *s == Salutation::None)
            .unwrap_or_default(),
        first_name: text(|d| &d.first_name),
        last_name: text(|d| &d.last_name),
        company_name: text(|d| &d.company_name),
        address: text(|d| &d.address),
        postcode: text(|d| &d.postcode),
        city: text(|d| &d.city),
        country: text(|d| &d.country),
        email: text(|d| &d.email),
        user: donors.iter().find_map(|d| d.user),
        contact_allowed: donors.iter().any(|d| d.contact_allowed),
        become_user: donors.iter().any(|d| d.become_user),
        receipt: donors.iter().any(|d| d.receipt),
        email_confirmed: donors.iter().filter_map(|d| d.email_confirmed).min(),
        note: text(|d| &d.note),
        ..first.clone()
    }
}

/// Merges the candidates into the primary, by default the highest id.
///
/// Donations and recurrences of the others move to the primary, tags and
/// subscriptions are united, old ids and uuids are recorded and the others
/// are deleted, all in one transaction. `overrides` replaces the primary's
/// personal fields. Running a merge again after it succeeded returns the
/// primary unchanged.
pub fn merge_donors(
    db: &Database,
    candidates: &[Id],
    primary: Option<Id>,
    overrides: Option<&Donor>,
) -> Result<Donor> {
    let ids: BTreeSet<Id> = candidates.iter().copied().collect();
    if ids.len() < 2 {
        return Err(Error::precondition("need at least two donors to merge"));
    }
    let primary_id = match primary {
        Some(id) if ids.contains(&id) => id,
        Some(id) => return Err(Error::bad_input(format!("primary {id} is not a candidate"))),
        None => ids.iter().copied().max().unwrap_or_default(),
    };
    let mut donor: Donor = db.get(primary_id)?;

    let mut others = vec![];
    for id in ids.iter().filter(|id| **id != primary_id) {
        match db.get_opt::<Donor>(*id)? {
            Some(other) => others.push(other),
            None if donor.attributes.old_ids.contains(id) => {}
            None => return Err(Error::not_found(format!("donor {id}"))),
        }
    }
    if others.is_empty() {
        tracing::debug!(donor = donor.id, "donors already merged");
        return Ok(donor);
    }

    if let Some(o) = overrides {
        donor.salutation = o.salutation;
        donor.first_name = o.first_name.clone();
        donor.last_name = o.last_name.clone();
        donor.company_name = o.company_name.clone();
        donor.address = o.address.clone();
        donor.postcode = o.postcode.clone();
        donor.city = o.city.clone();
        donor.country = o.country.clone();
        donor.email = normalize_email(&o.email);
        donor.user = o.user.or(donor.user);
        donor.contact_allowed = o.contact_allowed;
        donor.become_user = o.become_user;
        donor.receipt = o.receipt;
        donor.email_confirmed = o.email_confirmed.or(donor.email_confirmed);
        donor.note = o.note.clone();
    }

    let mut changes = Changeset::new();
    for other in &others {
        for mut donation in donations_of(db, other.id)? {
            donation.donor = donor.id;
            changes.set(&donation)?;
        }
        for mut recurrence in recurrences_of(db, other.id)? {
            recurrence.donor = donor.id;
            changes.set(&recurrence)?;
        }
        donor.tags.extend(other.tags.iter().cloned());
        donor.subscriptions.extend(other.subscriptions.iter().copied());
        donor.user = donor.user.or(other.user);
        donor.subscriber = donor.subscriber.or(other.subscriber);
        donor.email_confirmed = match (donor.email_confirmed, other.email_confirmed) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let attrs = &mut donor.attributes;
        if attrs.iban.is_none() {
            attrs.iban = other.attributes.iban.clone();
        }
        if attrs.paypal_email.is_none() {
            attrs.paypal_email = other.attributes.paypal_email.clone();
        }
        for (k, v) in &other.attributes.extra {
            attrs.extra.entry(k.clone()).or_insert_with(|| v.clone());
        }
        attrs.old_ids.push(other.id);
        attrs.old_ids.extend(other.attributes.old_ids.iter().copied());
        attrs.old_uuids.push(other.uuid);
        attrs.old_uuids.extend(other.attributes.old_uuids.iter().copied());
        changes.remove(other);
    }
    donor.attributes.old_ids.sort_unstable();
    donor.attributes.old_ids.dedup();
    donor.duplicate = None;
    changes.set(&donor)?;
    db.apply(changes)?;
    tracing::info!(donor = donor.id, merged = others.len(), "merged donors");

    recompute_donor(db, donor.id)
}

/// Groups donors sharing an address or a full name, transitively, and
/// marks every group with a shared uuid. Returns (groups, donors in
/// groups).
pub fn detect_duplicates(db: &Database, donors: &[Id]) -> Result<(usize, usize)> {
    let all: Vec<Donor> = if donors.is_empty() {
        db.get_collection::<Donor>()?
    } else {
        db.filter::<Donor, _>(|d| donors.contains(&d.id))?
    };

    // union-find over positions
    let mut parent: Vec<usize> = (0..all.len()).collect();
    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let mut by_email: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_name: BTreeMap<String, usize> = BTreeMap::new();
    for (i, donor) in all.iter().enumerate() {
        let email = normalize_email(&donor.email);
        let name = donor.full_name().to_lowercase();
        for (map, key) in [(&mut by_email, email), (&mut by_name, name)] {
            if key.is_empty() {
                continue;
            }
            match map.get(&key) {
                Some(j) => {
                    let (a, b) = (root(&mut parent, i), root(&mut parent, *j));
                    parent[a] = b;
                }
                None => {
                    map.insert(key, i);
                }
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..all.len() {
        let r = root(&mut parent, i);
        groups.entry(r).or_default().push(i);
    }

    let mut changes = Changeset::new();
    let (mut count, mut members) = (0, 0);
    for group in groups.values().filter(|g| g.len() > 1) {
        let marker = Uuid::new_v4();
        for i in group {
            let mut donor = all[*i].clone();
            donor.duplicate = Some(marker);
            changes.set(&donor)?;
        }
        count += 1;
        members += group.len();
    }
    db.apply(changes)?;
    tracing::info!(groups = count, donors = members, "detected duplicate donors");
    Ok((count, members))
}

/// Whether the postal address is usable for receipts.
pub fn has_valid_address(donor: &Donor) -> bool {
    if donor.city.trim().is_empty()
        || donor.last_name.trim().is_empty()
        || donor.postcode.trim().is_empty()
    {
        return false;
    }
    if donor.country == "DE" {
        let postcode = donor.postcode.trim();
        return postcode.len() == 5 && postcode.chars().all(|c| c.is_ascii_digit());
    }
    true
}

/// Flags donors with unusable addresses as invalid. Returns the number of
/// newly flagged donors.
pub fn mark_invalid_addresses(db: &Database, donors: &[Id]) -> Result<usize> {
    let mut changes = Changeset::new();
    for mut donor in db.filter::<Donor, _>(|d| {
        !d.invalid && (donors.is_empty() || donors.contains(&d.id)) && !has_valid_address(d)
    })? {
        donor.invalid = true;
        changes.set(&donor)?;
    }
    let count = changes.len();
    db.apply(changes)?;
    tracing::info!(count, "marked invalid donor addresses");
    Ok(count)
}

/// Recomputes the aggregates of the donor: first and last donation,
/// monthly recurring amount and the donation numbering.
pub fn recompute_donor(db: &Database, donor: Id) -> Result<Donor> {
    let mut record: Donor = db.get(donor)?;
    let mut donations = donations_of(db, donor)?;
    donations.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

    let mut changes = Changeset::new();
    for (i, donation) in donations.iter_mut().enumerate() {
        let number = i as u32 + 1;
        if donation.number != number {
            donation.number = number;
            changes.set(donation)?;
        }
    }

    let effective = |d: &Donation| d.received_timestamp.unwrap_or(d.timestamp);
    record.first_donation = donations.iter().map(effective).min();
    record.last_donation = donations.iter().map(effective).max();

    let subscription_backed: Amount = record
        .subscriptions
        .iter()
        .filter_map(|id| db.get_opt::<Subscription>(*id).ok().flatten())
        .filter(|s| s.active && s.canceled.is_none())
        .filter(|s| {
            !recurrences_of(db, donor)
                .map(|rs| rs.iter().any(|r| r.subscription == Some(s.id)))
                .unwrap_or(false)
        })
        .map(|s| subscription_monthly(&s))
        .sum();
    let recurring: Amount = recurrences_of(db, donor)?
        .iter()
        .filter(|r| r.active)
        .map(Recurrence::monthly_amount)
        .sum();
    record.recurring_amount = cents(recurring + subscription_backed);

    changes.set(&record)?;
    db.apply(changes)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::{App, Config};

    fn stored(db: &Database, f: impl FnOnce(&mut Donor)) -> Donor {
        let mut donor = Donor::new(db).unwrap();
        f(&mut donor);
        db.set(&donor).unwrap();
        donor
    }

    #[tokio::test]
    async fn lookup_prefers_account_then_confirmed_email() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let user = User::new(&app.db, "jane@example.org", "Jane", "Doe").unwrap();
        app.db.set(&user).unwrap();
        let bound = stored(&app.db, |d| d.user = Some(user.id));
        let confirmed = stored(&app.db, |d| {
            d.email = "john@example.org".to_string();
            d.email_confirmed = Some(Utc::now());
        });

        let payload = DonorPayload {
            email: "JOHN@example.org".to_string(),
            ..Default::default()
        };
        let found = get_or_create_donor(&app, &payload, Some(&user), None).await.unwrap();
        assert_eq!(found.id, bound.id);
        let found = get_or_create_donor(&app, &payload, None, None).await.unwrap();
        assert_eq!(found.id, confirmed.id);

        let payload = DonorPayload {
            email: "new@example.org".to_string(),
            first_name: "New".to_string(),
            ..Default::default()
        };
        let created = get_or_create_donor(&app, &payload, None, None).await.unwrap();
        assert!(created.id != bound.id && created.id != confirmed.id);
        assert!(created.email_confirmed.is_none());
    }

    #[tokio::test]
    async fn confirming_subscribes_when_contact_allowed() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        crate::init::newsletters(&app.config, &app.db).unwrap();
        let donor = stored(&app.db, |d| {
            d.email = "jane@example.org".to_string();
            d.first_name = "Jane".to_string();
        });

        let flags = ConfirmFlags {
            newsletter: true,
            ..Default::default()
        };
        let confirmed = confirm_donor_email(&app, donor.id, flags).await.unwrap();
        assert!(confirmed.email_confirmed.is_some());
        assert!(confirmed.contact_allowed);
        let subscriber = confirmed.subscriber.unwrap();
        assert!(app
            .db
            .get::<crate::newsletter::Subscriber>(subscriber)
            .unwrap()
            .is_subscribed());

        let again = confirm_donor_email(&app, donor.id, flags).await.unwrap();
        assert_eq!(again.email_confirmed, confirmed.email_confirmed);
    }

    #[test]
    fn merge_moves_donations_and_is_idempotent() {
        let db = Database::temporary().unwrap();
        let old = stored(&db, |d| {
            d.first_name = "Jane".to_string();
            d.city = "Berlin".to_string();
            d.tags.insert("press".to_string());
        });
        let new = stored(&db, |d| {
            d.first_name = "Jane".to_string();
            d.last_name = "Doe".to_string();
        });
        let donation = Donation {
            amount: dec!(10),
            timestamp: Utc::now() - Duration::days(3),
            ..Donation::new(&db, old.id).unwrap()
        };
        db.set(&donation).unwrap();

        let merged = merge_donors(&db, &[old.id, new.id], None, None).unwrap();
        assert_eq!(merged.id, new.id);
        assert!(db.get_opt::<Donor>(old.id).unwrap().is_none());
        assert_eq!(db.get::<Donation>(donation.id).unwrap().donor, new.id);
        assert_eq!(db.get::<Donation>(donation.id).unwrap().number, 1);
        assert_eq!(merged.attributes.old_ids, vec![old.id]);
        assert_eq!(merged.attributes.old_uuids, vec![old.uuid]);
        assert!(merged.tags.contains("press"));
        assert_eq!(merged.first_donation, Some(donation.timestamp));

        let again = merge_donors(&db, &[old.id, new.id], None, None).unwrap();
        assert_eq!(again.attributes, merged.attributes);
        assert!(merge_donors(&db, &[new.id], None, None).is_err());
    }

    #[test]
    fn proposal_takes_first_non_empty() {
        let a = Donor {
            id: 2,
            first_name: "Jane".to_string(),
            ..Default::default()
        };
        let b = Donor {
            id: 1,
            first_name: "J.".to_string(),
            city: "Berlin".to_string(),
            salutation: Salutation::Female,
            ..Default::default()
        };
        let proposal = propose_donor_merge(&[a, b]);
        assert_eq!(proposal.id, 2);
        assert_eq!(proposal.first_name, "Jane");
        assert_eq!(proposal.city, "Berlin");
        assert_eq!(proposal.salutation, Salutation::Female);
    }

    #[test]
    fn duplicates_are_grouped_transitively() {
        let db = Database::temporary().unwrap();
        let a = stored(&db, |d| {
            d.email = "jane@example.org".to_string();
            d.first_name = "Jane".to_string();
            d.last_name = "Doe".to_string();
        });
        let b = stored(&db, |d| {
            d.email = "Jane@example.org".to_string();
        });
        let c = stored(&db, |d| {
            d.first_name = "jane".to_string();
            d.last_name = "doe".to_string();
        });
        let single = stored(&db, |d| d.email = "other@example.org".to_string());

        assert_eq!(detect_duplicates(&db, &[]).unwrap(), (1, 3));
        let marker = db.get::<Donor>(a.id).unwrap().duplicate;
        assert!(marker.is_some());
        assert_eq!(db.get::<Donor>(b.id).unwrap().duplicate, marker);
        assert_eq!(db.get::<Donor>(c.id).unwrap().duplicate, marker);
        assert!(db.get::<Donor>(single.id).unwrap().duplicate.is_none());
    }

    #[test]
    fn invalid_addresses() {
        let db = Database::temporary().unwrap();
        let ok = stored(&db, |d| {
            d.last_name = "Doe".to_string();
            d.postcode = "12345".to_string();
            d.city = "Berlin".to_string();
        });
        let short = stored(&db, |d| {
            d.last_name = "Doe".to_string();
            d.postcode = "1234".to_string();
            d.city = "Berlin".to_string();
        });
        let abroad = stored(&db, |d| {
            d.last_name = "Doe".to_string();
            d.postcode = "1010".to_string();
            d.city = "Wien".to_string();
            d.country = "AT".to_string();
        });
        assert_eq!(mark_invalid_addresses(&db, &[]).unwrap(), 1);
        assert!(!db.get::<Donor>(ok.id).unwrap().invalid);
        assert!(db.get::<Donor>(short.id).unwrap().invalid);
        assert!(!db.get::<Donor>(abroad.id).unwrap().invalid);
    }

    #[test]
    fn recompute_sets_aggregates() {
        let db = Database::temporary().unwrap();
        let donor = stored(&db, |_| {});
        let now = Utc::now();
        for days in [40, 10] {
            let donation = Donation {
                amount: dec!(10),
                timestamp: now - Duration::days(days),
                received_timestamp: Some(now - Duration::days(days - 1)),
                ..Donation::new(&db, donor.id).unwrap()
            };
            db.set(&donation).unwrap();
        }
        let recurrence = Recurrence {
            donor: donor.id,
            interval: 3,
            amount: dec!(30),
            ..Default::default()
        };
        let recurrence = Recurrence {
            id: db.generate_id().unwrap(),
            ..recurrence
        };
        db.set(&recurrence).unwrap();

        let donor = recompute_donor(&db, donor.id).unwrap();
        assert_eq!(donor.first_donation, Some(now - Duration::days(39)));
        assert_eq!(donor.last_donation, Some(now - Duration::days(9)));
        assert_eq!(donor.recurring_amount, dec!(10));
        let mut numbers: Vec<u32> = donations_of(&db, donor.id)
            .unwrap()
            .iter()
            .map(|d| d.number)
            .collect();
        numbers.sort();
        assert_eq!(numbers, vec![1, 2]);
    }
}
