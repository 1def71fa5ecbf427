//! Payment records and the integration of external payment events.
//!
//! The payment gateway itself lives outside of this crate. What is kept
//! here is its view of a payment: the [`Payment`] with its status, the
//! [`Order`] describing who pays for what and, for recurring donations, the
//! provider [`Subscription`]. Status changes flow in through
//! [`integrator::status_changed`], bank exports through [`banktransfer`] and
//! [`paypal`].

pub mod banktransfer;
pub mod integrator;
pub mod order;
pub mod paypal;

pub use order::{Order, Plan, Subscription};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::db::{Collectable, Database, Id, Identifiable};
use crate::money::Amount;
use crate::Result;

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentMethod {
    #[default]
    Sepa,
    Banktransfer,
    Paypal,
    Creditcard,
    Lastschrift,
}

impl PaymentMethod {
    /// For these methods a pending payment is already the final signal we
    /// get from the donor, so they are thanked without waiting for the
    /// money.
    pub fn pending_is_final(&self) -> bool {
        matches!(self, Self::Sepa | Self::Banktransfer | Self::Lastschrift)
    }

    /// Methods whose provider may silently stop reporting a subscription.
    pub fn may_expire_silently(&self) -> bool {
        matches!(self, Self::Paypal | Self::Banktransfer)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Waiting,
    Input,
    Preauth,
    Pending,
    Deferred,
    Confirmed,
    Refunded,
    Rejected,
    Canceled,
    Error,
}

impl PaymentStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending | Self::Deferred)
    }
}

/// Payment instance object, as reported by the provider.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Payment {
    pub id: Id,
    pub order: Id,

    pub variant: PaymentMethod,
    pub status: PaymentStatus,

    pub total: Amount,
    pub captured_amount: Amount,
    pub received_amount: Option<Amount>,
    pub received_timestamp: Option<DateTime<Utc>>,

    /// Provider reference. For bank transfers this is the transfer code
    /// the donor is asked to put into the reference line.
    pub transaction_id: String,
    /// Opaque provider data, usually json.
    pub extra_data: String,

    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl Collectable for Payment {
    fn get_collection_name() -> &'static str {
        "payments"
    }
}

impl Identifiable for Payment {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl Payment {
    pub fn new(db: &Database, order: &Order, variant: PaymentMethod) -> Result<Self> {
        Ok(Self {
            id: db.generate_id()?,
            order: order.id,
            variant,
            status: PaymentStatus::Input,
            total: order.total_gross,
            captured_amount: Decimal::ZERO,
            created: Some(Utc::now()),
            ..Default::default()
        })
    }
}

/// Finds the payment carrying the given provider reference.
pub fn find_by_transaction_id(db: &Database, transaction_id: &str) -> Result<Vec<Payment>> {
    db.filter::<Payment, _>(|p| p.transaction_id.eq_ignore_ascii_case(transaction_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_are_lowercase() {
        assert_eq!(PaymentMethod::Banktransfer.to_string(), "banktransfer");
        assert_eq!(
            "paypal".parse::<PaymentMethod>().unwrap(),
            PaymentMethod::Paypal
        );
        assert_eq!(
            serde_json::to_string(&PaymentStatus::Confirmed).unwrap(),
            "\"confirmed\""
        );
    }

    #[test]
    fn pending_is_final_for_transfer_methods() {
        assert!(PaymentMethod::Sepa.pending_is_final());
        assert!(PaymentMethod::Lastschrift.pending_is_final());
        assert!(!PaymentMethod::Paypal.pending_is_final());
        assert!(!PaymentMethod::Creditcard.pending_is_final());
    }
}
