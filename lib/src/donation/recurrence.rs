//! Recurrence detection.
//!
//! Recurrences are derived data. Donations paid through a provider
//! subscription belong to the subscription's recurrence. All other
//! received donations are mined for streaks: chains of equal donations
//! (same amount, method and project) whose gaps fit one of the supported
//! intervals. Running the detector again on unchanged donations converges
//! to the same set of recurrences.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Duration, Utc};

use crate::app::App;
use crate::db::{Changeset, Database, Id};
use crate::events::{dispatch_all, Event};
use crate::money::Amount;
use crate::payment::{Order, PaymentMethod, Subscription};
use crate::util::add_months;
use crate::Result;

use super::donor::recompute_donor;
use super::{donations_of, recurrences_of, Donation, Donor, Recurrence};

/// Supported intervals in months with the accepted gap in days between two
/// donations of a streak.
pub const INTERVALS: [(u32, i64, i64); 4] = [(1, 25, 35), (3, 80, 100), (6, 170, 190), (12, 350, 380)];

/// Grace period after the next expected donation before a streak counts as
/// canceled.
pub const GRACE_DAYS: i64 = 10;

/// Day of month after which the late-recurrence sweep runs.
pub const LATE_SWEEP_DAY: u32 = 14;

#[derive(Clone, Debug)]
pub struct DonationStreak {
    /// Donations ordered by received timestamp.
    pub donations: Vec<Donation>,
    pub interval: u32,
    pub method: PaymentMethod,
    pub project: String,
    pub canceled: Option<DateTime<Utc>>,
}

impl DonationStreak {
    pub fn ids(&self) -> BTreeSet<Id> {
        self.donations.iter().map(|d| d.id).collect()
    }

    fn start(&self) -> Option<DateTime<Utc>> {
        self.donations.first().and_then(|d| d.received_timestamp)
    }

    fn amount(&self) -> Amount {
        self.donations.last().map(|d| d.amount).unwrap_or_default()
    }
}

fn received(donation: &Donation) -> DateTime<Utc> {
    donation.received_timestamp.unwrap_or(donation.timestamp)
}

/// Returns the last donation's received timestamp when the next expected
/// donation plus the grace period lies before `now`.
pub fn get_cancel_date(
    donations: &[Donation],
    interval: u32,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let last = donations.last()?.received_timestamp?;
    let expected = add_months(last, interval) + Duration::days(GRACE_DAYS);
    (expected < now).then_some(last)
}

/// Every chain starting at some donation whose successive gaps lie within
/// `[min, max]` days. Donations closer than `min` are skipped, a gap over
/// `max` ends the chain.
fn streaks_for_interval(donations: &[Donation], min: i64, max: i64) -> Vec<Vec<Donation>> {
    let mut out = vec![];
    for start in 0..donations.len() {
        let mut streak = vec![donations[start].clone()];
        for next in &donations[start + 1..] {
            let last = streak.last().map(received).unwrap_or_else(|| received(next));
            let gap = (received(next) - last).num_days();
            if gap > max {
                break;
            }
            if gap >= min {
                streak.push(next.clone());
            }
        }
        if streak.len() >= 2 {
            out.push(streak);
        }
    }
    out
}

/// Finds donation streaks among received donations.
///
/// Donations are bucketed by amount, method and project. Candidate chains
/// for all intervals are then picked greedily, longest first, each donation
/// used by at most one streak.
pub fn find_donation_streaks(donations: &[Donation], now: DateTime<Utc>) -> Vec<DonationStreak> {
    let mut buckets: BTreeMap<(Amount, PaymentMethod, String), Vec<Donation>> = BTreeMap::new();
    for donation in donations.iter().filter(|d| d.is_received()) {
        buckets
            .entry((donation.amount, donation.method, donation.project.clone()))
            .or_default()
            .push(donation.clone());
    }

    let mut candidates: Vec<(u32, Vec<Donation>)> = vec![];
    for group in buckets.values_mut() {
        if group.len() < 2 {
            continue;
        }
        group.sort_by(|a, b| received(a).cmp(&received(b)).then(a.id.cmp(&b.id)));
        for (interval, min, max) in INTERVALS {
            for streak in streaks_for_interval(group, min, max) {
                candidates.push((interval, streak));
            }
        }
    }
    // longest first; ties go to the shorter interval, then the earlier start
    candidates.sort_by(|(ia, a), (ib, b)| {
        b.len()
            .cmp(&a.len())
            .then(ia.cmp(ib))
            .then(received(&a[0]).cmp(&received(&b[0])))
            .then(a[0].id.cmp(&b[0].id))
    });

    let mut used = BTreeSet::new();
    let mut streaks = vec![];
    for (interval, donations) in candidates {
        if donations.iter().any(|d| used.contains(&d.id)) {
            continue;
        }
        used.extend(donations.iter().map(|d| d.id));
        let first = &donations[0];
        streaks.push(DonationStreak {
            interval,
            method: first.method,
            project: first.project.clone(),
            canceled: get_cancel_date(&donations, interval, now),
            donations,
        });
    }
    streaks
}

/// Working copy of one donor's donations and recurrences. Changes are
/// collected and written in one transaction.
struct DonorState {
    donations: BTreeMap<Id, Donation>,
    linked: BTreeMap<Id, Option<Id>>,
    recurrences: BTreeMap<Id, Recurrence>,
    dirty: BTreeSet<Id>,
    created: Vec<Id>,
}

impl DonorState {
    fn load(db: &Database, donor: Id) -> Result<Self> {
        let donations: BTreeMap<Id, Donation> =
            donations_of(db, donor)?.into_iter().map(|d| (d.id, d)).collect();
        let linked = donations.iter().map(|(id, d)| (*id, d.recurrence)).collect();
        let recurrences = recurrences_of(db, donor)?.into_iter().map(|r| (r.id, r)).collect();
        Ok(Self {
            donations,
            linked,
            recurrences,
            dirty: BTreeSet::new(),
            created: vec![],
        })
    }

    fn link(&mut self, donations: impl IntoIterator<Item = Id>, recurrence: Option<Id>) {
        for id in donations {
            if let Some(d) = self.donations.get_mut(&id) {
                d.recurrence = recurrence;
            }
        }
    }

    fn save(self, db: &Database) -> Result<()> {
        let mut changes = Changeset::new();
        for (id, donation) in &self.donations {
            if self.linked.get(id).copied().flatten() != donation.recurrence {
                changes.set(donation)?;
            }
        }
        let used: BTreeSet<Id> = self.donations.values().filter_map(|d| d.recurrence).collect();
        for (id, recurrence) in &self.recurrences {
            if !used.contains(id) && recurrence.subscription.is_none() {
                changes.remove(recurrence);
            } else if self.dirty.contains(id) {
                changes.set(recurrence)?;
            }
        }
        db.apply(changes)
    }
}

fn subscription_of(db: &Database, donation: &Donation) -> Result<Option<Id>> {
    let Some(order) = donation.order else {
        return Ok(None);
    };
    Ok(db.get_opt::<Order>(order)?.and_then(|o| o.subscription))
}

fn set_fields(
    recurrence: &mut Recurrence,
    start: DateTime<Utc>,
    interval: u32,
    amount: Amount,
    method: PaymentMethod,
    cancel_date: Option<DateTime<Utc>>,
) -> bool {
    let before = (
        recurrence.start_date,
        recurrence.interval,
        recurrence.amount,
        recurrence.method,
        recurrence.cancel_date,
        recurrence.active,
    );
    recurrence.start_date = start;
    recurrence.interval = interval;
    recurrence.amount = amount;
    recurrence.method = method;
    recurrence.cancel_date = cancel_date;
    recurrence.active = cancel_date.is_none();
    before
        != (
            recurrence.start_date,
            recurrence.interval,
            recurrence.amount,
            recurrence.method,
            recurrence.cancel_date,
            recurrence.active,
        )
}

/// Reconciles the donor's recurrences with its received donations and
/// recomputes the donor aggregates. Returns the ids of newly created,
/// ongoing recurrences.
pub fn detect_recurrences(db: &Database, donor: Id, now: DateTime<Utc>) -> Result<Vec<Id>> {
    let mut state = DonorState::load(db, donor)?;

    let mut by_subscription: BTreeMap<Id, Vec<Donation>> = BTreeMap::new();
    let mut free = vec![];
    for donation in state.donations.values().filter(|d| d.is_received()) {
        match subscription_of(db, donation)? {
            Some(subscription) => by_subscription.entry(subscription).or_default().push(donation.clone()),
            None => free.push(donation.clone()),
        }
    }

    for (subscription_id, mut donations) in by_subscription {
        donations.sort_by(|a, b| received(a).cmp(&received(b)).then(a.id.cmp(&b.id)));
        let subscription: Option<Subscription> = db.get_opt(subscription_id)?;
        let Some(subscription) = subscription else {
            continue;
        };
        let plan = &subscription.plan;
        let cancel_date = match subscription.canceled {
            Some(canceled) => Some(canceled),
            None if plan.provider.may_expire_silently() => {
                get_cancel_date(&donations, plan.interval.max(1), now)
            }
            None => None,
        };
        let start = subscription
            .created
            .or_else(|| donations.first().map(received))
            .unwrap_or(now);

        let existing = state
            .recurrences
            .values()
            .find(|r| r.subscription == Some(subscription_id))
            .map(|r| r.id);
        let id = match existing {
            Some(id) => id,
            None => {
                let recurrence = Recurrence {
                    id: db.generate_id()?,
                    donor,
                    subscription: Some(subscription_id),
                    project: donations.first().map(|d| d.project.clone()).unwrap_or_default(),
                    ..Default::default()
                };
                let id = recurrence.id;
                state.recurrences.insert(id, recurrence);
                state.dirty.insert(id);
                if cancel_date.is_none() {
                    state.created.push(id);
                }
                id
            }
        };
        if let Some(recurrence) = state.recurrences.get_mut(&id) {
            if set_fields(recurrence, start, plan.interval.max(1), plan.amount, plan.provider, cancel_date) {
                state.dirty.insert(id);
            }
        }
        state.link(donations.iter().map(|d| d.id), Some(id));
    }

    let streaks = find_donation_streaks(&free, now);
    let mut in_streak = BTreeSet::new();
    for streak in &streaks {
        in_streak.extend(streak.ids());
        let touching: BTreeSet<Id> = streak
            .donations
            .iter()
            .filter_map(|d| state.donations.get(&d.id).and_then(|d| d.recurrence))
            .filter(|id| {
                state
                    .recurrences
                    .get(id)
                    .map(|r| r.subscription.is_none())
                    .unwrap_or(false)
            })
            .collect();

        let id = match touching.iter().next() {
            Some(first) => *first,
            None => {
                let recurrence = Recurrence {
                    id: db.generate_id()?,
                    donor,
                    project: streak.project.clone(),
                    ..Default::default()
                };
                let id = recurrence.id;
                state.recurrences.insert(id, recurrence);
                state.dirty.insert(id);
                if streak.canceled.is_none() {
                    state.created.push(id);
                }
                id
            }
        };
        let start = streak.start().unwrap_or(now);
        if let Some(recurrence) = state.recurrences.get_mut(&id) {
            let mut changed = set_fields(
                recurrence,
                start,
                streak.interval,
                streak.amount(),
                streak.method,
                streak.canceled,
            );
            if recurrence.project != streak.project {
                recurrence.project = streak.project.clone();
                changed = true;
            }
            if changed {
                state.dirty.insert(id);
            }
        }
        state.link(streak.ids(), Some(id));
    }

    // free donations outside every streak lose their recurrence
    let unlinked: Vec<Id> = free
        .iter()
        .map(|d| d.id)
        .filter(|id| !in_streak.contains(id))
        .collect();
    state.link(unlinked, None);

    let created = state.created.clone();
    state.save(db)?;
    recompute_donor(db, donor)?;
    Ok(created)
}

/// Runs recurrence detection for the donor and announces new ongoing
/// recurrences.
pub async fn process_recurrence_on_donor(app: &App, donor: Id, now: DateTime<Utc>) -> Result<()> {
    let created = detect_recurrences(&app.db, donor, now)?;
    if !created.is_empty() {
        tracing::info!(donor, created = created.len(), "new recurrences detected");
    }
    let events = created
        .into_iter()
        .map(|recurrence| Event::RecurrenceCreated { recurrence })
        .collect();
    dispatch_all(app, events).await;
    Ok(())
}

/// Active recurrences whose last received donation is overdue by more than
/// the grace period. Empty until the 14th of the month.
pub fn get_late_recurrences(db: &Database, now: DateTime<Utc>) -> Result<Vec<Recurrence>> {
    if now.day() <= LATE_SWEEP_DAY {
        return Ok(vec![]);
    }
    let mut late = vec![];
    for recurrence in db.filter::<Recurrence, _>(|r| r.active)? {
        let mut donations = db.filter::<Donation, _>(|d| {
            d.recurrence == Some(recurrence.id) && d.is_received()
        })?;
        donations.sort_by_key(received);
        let overdue = match donations.last() {
            Some(_) => get_cancel_date(&donations, recurrence.interval.max(1), now).is_some(),
            None => add_months(recurrence.start_date, recurrence.interval.max(1)) + Duration::days(GRACE_DAYS) < now,
        };
        if overdue {
            late.push(recurrence);
        }
    }
    Ok(late)
}

/// Reprocesses the donors of late recurrences. Returns the number of
/// donors processed.
pub async fn sweep_late_recurrences(app: &App, now: DateTime<Utc>) -> Result<usize> {
    let donors: BTreeSet<Id> = get_late_recurrences(&app.db, now)?
        .into_iter()
        .map(|r| r.donor)
        .collect();
    for donor in &donors {
        if let Err(e) = process_recurrence_on_donor(app, *donor, now).await {
            tracing::warn!(donor, "recurrence processing failed: {e}");
        }
    }
    tracing::info!(donors = donors.len(), "late recurrence sweep");
    Ok(donors.len())
}

/// Runs detection for every donor. Returns the number of donors processed.
pub async fn process_all(app: &App, now: DateTime<Utc>) -> Result<usize> {
    let donors = app.db.get_collection::<Donor>()?;
    for donor in &donors {
        process_recurrence_on_donor(app, donor.id, now).await?;
    }
    Ok(donors.len())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::payment::Plan;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap()
    }

    fn received_donation(db: &Database, donor: Id, at: DateTime<Utc>, amount: Amount) -> Donation {
        let donation = Donation {
            amount,
            amount_received: amount,
            method: PaymentMethod::Banktransfer,
            timestamp: at,
            received_timestamp: Some(at),
            completed: true,
            ..Donation::new(db, donor).unwrap()
        };
        db.set(&donation).unwrap();
        donation
    }

    fn donor(db: &Database) -> Id {
        let donor = Donor::new(db).unwrap();
        db.set(&donor).unwrap();
        donor.id
    }

    #[test]
    fn monthly_streak_stays_active() {
        let db = Database::temporary().unwrap();
        let d = donor(&db);
        let a = received_donation(&db, d, t0(), dec!(10.00));
        let b = received_donation(&db, d, t0() + Duration::days(32), dec!(10.00));

        let created = detect_recurrences(&db, d, t0() + Duration::days(40)).unwrap();
        assert_eq!(created.len(), 1);
        let recurrences = recurrences_of(&db, d).unwrap();
        assert_eq!(recurrences.len(), 1);
        let r = &recurrences[0];
        assert_eq!(r.interval, 1);
        assert_eq!(r.amount, dec!(10.00));
        assert_eq!(r.method, PaymentMethod::Banktransfer);
        assert_eq!(r.start_date, t0());
        assert!(r.active);
        assert!(r.cancel_date.is_none());
        assert_eq!(db.get::<Donation>(a.id).unwrap().recurrence, Some(r.id));
        assert_eq!(db.get::<Donation>(b.id).unwrap().recurrence, Some(r.id));
        assert_eq!(db.get::<Donor>(d).unwrap().recurring_amount, dec!(10.00));
    }

    #[test]
    fn missed_months_cancel_the_streak() {
        let db = Database::temporary().unwrap();
        let d = donor(&db);
        received_donation(&db, d, t0(), dec!(10.00));
        received_donation(&db, d, t0() + Duration::days(32), dec!(10.00));

        let created = detect_recurrences(&db, d, t0() + Duration::days(120)).unwrap();
        assert!(created.is_empty());
        let r = &recurrences_of(&db, d).unwrap()[0];
        assert_eq!(r.cancel_date, Some(t0() + Duration::days(32)));
        assert!(!r.active);
        assert_eq!(db.get::<Donor>(d).unwrap().recurring_amount, dec!(0));
    }

    #[test]
    fn detection_converges() {
        let db = Database::temporary().unwrap();
        let d = donor(&db);
        for month in 0..4 {
            received_donation(&db, d, t0() + Duration::days(30 * month), dec!(5));
        }
        received_donation(&db, d, t0() + Duration::days(45), dec!(50));
        let now = t0() + Duration::days(100);

        detect_recurrences(&db, d, now).unwrap();
        let first = recurrences_of(&db, d).unwrap();
        let links: Vec<_> = donations_of(&db, d).unwrap().iter().map(|d| d.recurrence).collect();
        assert!(detect_recurrences(&db, d, now).unwrap().is_empty());
        let second = recurrences_of(&db, d).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(
            links,
            donations_of(&db, d).unwrap().iter().map(|d| d.recurrence).collect::<Vec<_>>()
        );
    }

    #[test]
    fn longest_streak_wins() {
        let db = Database::temporary().unwrap();
        let d = donor(&db);
        let donations: Vec<Donation> = [0, 30, 60, 90, 180]
            .iter()
            .map(|days| received_donation(&db, d, t0() + Duration::days(*days), dec!(10)))
            .collect();
        let streaks = find_donation_streaks(&donations, t0() + Duration::days(200));
        assert_eq!(streaks[0].interval, 1);
        assert_eq!(streaks[0].donations.len(), 4);
        // 90 -> 180 would be quarterly but 90 is taken
        assert_eq!(streaks.len(), 1);
    }

    #[test]
    fn lone_donations_lose_stale_links() {
        let db = Database::temporary().unwrap();
        let d = donor(&db);
        let stale = Recurrence {
            id: db.generate_id().unwrap(),
            donor: d,
            amount: dec!(10),
            ..Default::default()
        };
        db.set(&stale).unwrap();
        let mut lone = received_donation(&db, d, t0(), dec!(10));
        lone.recurrence = Some(stale.id);
        db.set(&lone).unwrap();

        detect_recurrences(&db, d, t0() + Duration::days(5)).unwrap();
        assert!(db.get::<Donation>(lone.id).unwrap().recurrence.is_none());
        assert!(recurrences_of(&db, d).unwrap().is_empty());
    }

    #[test]
    fn subscription_donations_follow_the_plan() {
        let db = Database::temporary().unwrap();
        let d = donor(&db);
        let subscription = Subscription::new(
            &db,
            Plan {
                amount: dec!(15),
                interval: 1,
                provider: PaymentMethod::Sepa,
                ..Default::default()
            },
        )
        .unwrap();
        db.set(&subscription).unwrap();
        let order = Order {
            subscription: Some(subscription.id),
            is_recurring: true,
            ..Order::new(&db).unwrap()
        };
        db.set(&order).unwrap();
        let mut donation = received_donation(&db, d, t0(), dec!(15));
        donation.order = Some(order.id);
        db.set(&donation).unwrap();

        let created = detect_recurrences(&db, d, t0() + Duration::days(200)).unwrap();
        assert_eq!(created.len(), 1);
        let r = db.get::<Recurrence>(created[0]).unwrap();
        assert_eq!(r.subscription, Some(subscription.id));
        // sepa subscriptions don't expire by silence
        assert!(r.active);
        assert_eq!(db.get::<Donation>(donation.id).unwrap().recurrence, Some(r.id));
    }

    #[test]
    fn late_sweep_waits_for_mid_month() {
        let db = Database::temporary().unwrap();
        let d = donor(&db);
        received_donation(&db, d, t0(), dec!(10));
        received_donation(&db, d, t0() + Duration::days(31), dec!(10));
        detect_recurrences(&db, d, t0() + Duration::days(35)).unwrap();

        let early = Utc.with_ymd_and_hms(2024, 5, 10, 6, 0, 0).unwrap();
        assert!(get_late_recurrences(&db, early).unwrap().is_empty());
        let late = Utc.with_ymd_and_hms(2024, 5, 15, 6, 0, 0).unwrap();
        assert_eq!(get_late_recurrences(&db, late).unwrap().len(), 1);
    }
}
