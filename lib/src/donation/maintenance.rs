//! Retention of abandoned donations and empty donors.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::db::{Changeset, Database};
use crate::util::sub_months;
use crate::Result;

use super::{Donation, Donor};

/// Donations never completed are dropped after this many months.
pub const INCOMPLETE_MONTHS: u32 = 3;
/// Completed donations whose money never arrived are dropped after this
/// many months.
pub const UNRECEIVED_MONTHS: u32 = 12;
/// Donors without donations are dropped after this many months.
pub const EMPTY_DONOR_MONTHS: u32 = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub incomplete: usize,
    pub unreceived: usize,
    pub donors: usize,
}

pub fn cleanup_donations(db: &Database, now: DateTime<Utc>) -> Result<CleanupReport> {
    let incomplete_before = sub_months(now, INCOMPLETE_MONTHS);
    let unreceived_before = sub_months(now, UNRECEIVED_MONTHS);
    let donor_before = sub_months(now, EMPTY_DONOR_MONTHS);

    let mut report = CleanupReport::default();
    let mut changes = Changeset::new();
    let mut remaining = BTreeSet::new();
    for donation in db.get_collection::<Donation>()? {
        if !donation.completed && donation.timestamp < incomplete_before {
            changes.remove(&donation);
            report.incomplete += 1;
        } else if donation.completed && !donation.is_received() && donation.timestamp < unreceived_before {
            changes.remove(&donation);
            report.unreceived += 1;
        } else {
            remaining.insert(donation.donor);
        }
    }
    for donor in db.filter::<Donor, _>(|d| d.created < donor_before && !remaining.contains(&d.id))? {
        changes.remove(&donor);
        report.donors += 1;
    }
    db.apply(changes)?;
    tracing::info!(
        incomplete = report.incomplete,
        unreceived = report.unreceived,
        donors = report.donors,
        "cleaned up donations"
    );
    Ok(report)
}
