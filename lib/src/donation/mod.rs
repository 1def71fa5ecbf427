//! Donors, donations and recurring donation series.
//!
//! Aggregates kept on the donor (`first_donation`, `last_donation`,
//! `recurring_amount`, the per-donor donation numbering) are never updated
//! implicitly. They are recomputed by [`donor::recompute_donor`], which every
//! service mutating donations calls when it is done.

pub mod donor;
pub mod form;
pub mod mails;
pub mod maintenance;
pub mod recurrence;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::{Collectable, Database, Id, Identifiable};
use crate::money::Amount;
use crate::payment::PaymentMethod;
use crate::Result;

pub const DEFAULT_PROJECT: &str = "FDS";

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
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Salutation {
    #[default]
    None,
    Female,
    Male,
    Diverse,
}

impl Salutation {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Female => "Frau",
            Self::Male => "Herr",
            Self::Diverse | Self::None => "",
        }
    }
}

/// Out-of-band identifiers collected from payment sources and merges.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DonorAttributes {
    pub iban: Option<String>,
    pub paypal_email: Option<String>,
    pub old_ids: Vec<Id>,
    pub old_uuids: Vec<Uuid>,
    pub extra: BTreeMap<String, String>,
}

/// Contributing party.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Donor {
    pub id: Id,
    pub uuid: Uuid,

    pub salutation: Salutation,
    pub first_name: String,
    pub last_name: String,
    pub company_name: String,
    pub address: String,
    pub postcode: String,
    pub city: String,
    /// ISO 3166 alpha-2 code.
    pub country: String,
    pub email: String,

    pub user: Option<Id>,

    pub active: bool,
    pub invalid: bool,
    /// Shared marker of a group of probable duplicates.
    pub duplicate: Option<Uuid>,

    /// Newsletter subscriber created for the donor.
    pub subscriber: Option<Id>,
    pub contact_allowed: bool,
    pub become_user: bool,
    pub receipt: bool,
    pub email_confirmed: Option<DateTime<Utc>>,
    pub email_confirmation_sent: Option<DateTime<Utc>>,

    pub first_donation: Option<DateTime<Utc>>,
    pub last_donation: Option<DateTime<Utc>>,
    /// Monthly equivalent of all active recurrences.
    pub recurring_amount: Amount,

    /// Provider subscriptions the donor pays through.
    pub subscriptions: BTreeSet<Id>,
    pub tags: BTreeSet<String>,
    pub attributes: DonorAttributes,
    pub note: String,

    pub created: DateTime<Utc>,
}

impl Default for Donor {
    fn default() -> Self {
        Self {
            id: 0,
            uuid: Uuid::new_v4(),
            salutation: Salutation::None,
            first_name: String::new(),
            last_name: String::new(),
            company_name: String::new(),
            address: String::new(),
            postcode: String::new(),
            city: String::new(),
            country: "DE".to_string(),
            email: String::new(),
            user: None,
            active: true,
            invalid: false,
            duplicate: None,
            subscriber: None,
            contact_allowed: false,
            become_user: false,
            receipt: false,
            email_confirmed: None,
            email_confirmation_sent: None,
            first_donation: None,
            last_donation: None,
            recurring_amount: Decimal::ZERO,
            subscriptions: BTreeSet::new(),
            tags: BTreeSet::new(),
            attributes: DonorAttributes::default(),
            note: String::new(),
            created: Utc::now(),
        }
    }
}

impl Collectable for Donor {
    fn get_collection_name() -> &'static str {
        "donors"
    }
}

impl Identifiable for Donor {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl Donor {
    pub fn new(db: &Database) -> Result<Self> {
        Ok(Self {
            id: db.generate_id()?,
            ..Default::default()
        })
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Name as printed on receipts and in greetings.
    pub fn display_name(&self) -> String {
        if !self.company_name.is_empty() && self.full_name().is_empty() {
            return self.company_name.clone();
        }
        self.full_name()
    }

    /// `Frau Jane Doe`
    pub fn salutation_label(&self) -> String {
        let label = self.salutation.label();
        if label.is_empty() {
            self.full_name()
        } else {
            format!("{} {}", label, self.full_name())
        }
    }

    /// Letter salutation: `Sehr geehrte Frau Doe`, `Sehr geehrter Herr Doe`
    /// or `Guten Tag Jane Doe`.
    pub fn letter_salutation(&self) -> String {
        match self.salutation {
            Salutation::Female => format!("Sehr geehrte Frau {}", self.last_name),
            Salutation::Male => format!("Sehr geehrter Herr {}", self.last_name),
            Salutation::Diverse | Salutation::None => {
                let name = self.display_name();
                if name.is_empty() {
                    "Guten Tag".to_string()
                } else {
                    format!("Guten Tag {}", name)
                }
            }
        }
    }

    pub fn has_confirmed_email(&self) -> bool {
        self.email_confirmed.is_some() && !self.email.is_empty()
    }
}

/// Single payment event tied to a donor.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Donation {
    pub id: Id,
    pub donor: Id,

    pub amount: Amount,
    pub amount_received: Amount,
    /// When the donation was intended.
    pub timestamp: DateTime<Utc>,
    /// When the money arrived. Only received donations count.
    pub received_timestamp: Option<DateTime<Utc>>,

    pub method: PaymentMethod,
    pub project: String,
    pub purpose: String,
    pub reference: String,
    pub keyword: String,
    /// Source-specific id used to make imports idempotent.
    pub identifier: String,

    pub recurring: bool,
    pub first_recurring: bool,
    pub completed: bool,

    pub export_date: Option<DateTime<Utc>>,
    pub receipt_date: Option<DateTime<Utc>>,
    pub email_sent: Option<DateTime<Utc>>,

    pub order: Option<Id>,
    pub payment: Option<Id>,
    pub recurrence: Option<Id>,
    /// Snapshot of the form configuration the donation came through.
    pub form_settings: String,

    /// Per-donor ordinal by timestamp, starting at 1.
    pub number: u32,
    pub note: String,
}

impl Default for Donation {
    fn default() -> Self {
        Self {
            id: 0,
            donor: 0,
            amount: Decimal::ZERO,
            amount_received: Decimal::ZERO,
            timestamp: Utc::now(),
            received_timestamp: None,
            method: PaymentMethod::default(),
            project: DEFAULT_PROJECT.to_string(),
            purpose: String::new(),
            reference: String::new(),
            keyword: String::new(),
            identifier: String::new(),
            recurring: false,
            first_recurring: false,
            completed: false,
            export_date: None,
            receipt_date: None,
            email_sent: None,
            order: None,
            payment: None,
            recurrence: None,
            form_settings: String::new(),
            number: 0,
            note: String::new(),
        }
    }
}

impl Collectable for Donation {
    fn get_collection_name() -> &'static str {
        "donations"
    }
}

impl Identifiable for Donation {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl Donation {
    pub fn new(db: &Database, donor: Id) -> Result<Self> {
        Ok(Self {
            id: db.generate_id()?,
            donor,
            ..Default::default()
        })
    }

    pub fn is_received(&self) -> bool {
        self.received_timestamp.is_some()
    }
}

/// Ongoing donation series of one donor.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Recurrence {
    pub id: Id,
    pub donor: Id,
    pub subscription: Option<Id>,

    pub active: bool,
    pub start_date: DateTime<Utc>,
    pub cancel_date: Option<DateTime<Utc>>,
    /// Months between two donations.
    pub interval: u32,
    pub amount: Amount,
    pub method: PaymentMethod,
    pub project: String,

    pub cancel_reason: String,
    pub cancel_feedback: String,
    pub created: DateTime<Utc>,
}

impl Default for Recurrence {
    fn default() -> Self {
        Self {
            id: 0,
            donor: 0,
            subscription: None,
            active: true,
            start_date: Utc::now(),
            cancel_date: None,
            interval: 1,
            amount: Decimal::ZERO,
            method: PaymentMethod::default(),
            project: DEFAULT_PROJECT.to_string(),
            cancel_reason: String::new(),
            cancel_feedback: String::new(),
            created: Utc::now(),
        }
    }
}

impl Collectable for Recurrence {
    fn get_collection_name() -> &'static str {
        "recurrences"
    }
}

impl Identifiable for Recurrence {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl Recurrence {
    /// Amount normalized to one month.
    pub fn monthly_amount(&self) -> Amount {
        if self.interval == 0 {
            return self.amount;
        }
        self.amount / Decimal::from(self.interval)
    }
}

pub fn donations_of(db: &Database, donor: Id) -> Result<Vec<Donation>> {
    db.filter::<Donation, _>(|d| d.donor == donor)
}

pub fn recurrences_of(db: &Database, donor: Id) -> Result<Vec<Recurrence>> {
    db.filter::<Recurrence, _>(|r| r.donor == donor)
}

pub fn find_donation_by_identifier(db: &Database, identifier: &str) -> Result<Option<Donation>> {
    if identifier.is_empty() {
        return Ok(None);
    }
    db.find::<Donation, _>(|d| d.identifier == identifier)
}

pub fn find_donation_by_payment(db: &Database, payment: Id) -> Result<Option<Donation>> {
    db.find::<Donation, _>(|d| d.payment == Some(payment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_salutations() {
        let mut donor = Donor {
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            ..Default::default()
        };
        assert_eq!(donor.letter_salutation(), "Guten Tag Jane Doe");
        donor.salutation = Salutation::Female;
        assert_eq!(donor.letter_salutation(), "Sehr geehrte Frau Doe");
        assert_eq!(donor.salutation_label(), "Frau Jane Doe");
        donor.salutation = Salutation::Male;
        assert_eq!(donor.letter_salutation(), "Sehr geehrter Herr Doe");
    }

    #[test]
    fn monthly_amount_divides_by_interval() {
        let r = Recurrence {
            interval: 3,
            amount: Decimal::from(30),
            ..Default::default()
        };
        assert_eq!(r.monthly_amount(), Decimal::from(10));
    }
}
