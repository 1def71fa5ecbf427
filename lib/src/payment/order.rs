use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::db::{Collectable, Database, Id, Identifiable};
use crate::money::Amount;
use crate::Result;

use super::PaymentMethod;

/// Order placed through the donation form.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Order {
    pub id: Id,
    pub user: Option<Id>,

    pub user_email: String,
    pub first_name: String,
    pub last_name: String,
    pub street_address_1: String,
    pub city: String,
    pub postcode: String,
    pub country: String,

    /// Provider subscription for recurring donations.
    pub subscription: Option<Id>,

    pub total_gross: Amount,
    pub is_recurring: bool,
    pub is_donation: bool,
    pub description: String,

    pub reference: String,
    pub keyword: String,

    pub created: Option<DateTime<Utc>>,
}

impl Collectable for Order {
    fn get_collection_name() -> &'static str {
        "orders"
    }
}

impl Identifiable for Order {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl Order {
    pub fn new(db: &Database) -> Result<Self> {
        Ok(Self {
            id: db.generate_id()?,
            total_gross: Decimal::ZERO,
            is_donation: true,
            created: Some(Utc::now()),
            ..Default::default()
        })
    }
}

/// Plan a provider subscription runs on.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Plan {
    pub name: String,
    pub amount: Amount,
    /// Months between two payments.
    pub interval: u32,
    pub provider: PaymentMethod,
}

/// Recurring payment handle as kept by the provider.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Subscription {
    pub id: Id,
    pub plan: Plan,
    pub active: bool,
    pub created: Option<DateTime<Utc>>,
    pub canceled: Option<DateTime<Utc>>,
    pub customer_email: String,
    /// Provider side id, e.g. the paypal billing agreement.
    pub remote_reference: String,
}

impl Collectable for Subscription {
    fn get_collection_name() -> &'static str {
        "subscriptions"
    }
}

impl Identifiable for Subscription {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl Subscription {
    pub fn new(db: &Database, plan: Plan) -> Result<Self> {
        Ok(Self {
            id: db.generate_id()?,
            plan,
            active: true,
            created: Some(Utc::now()),
            ..Default::default()
        })
    }
}
