//! Integration of provider payment events into donations.
//!
//! The state of a donation follows its payment:
//!
//! | payment status                  | completed | received_timestamp |
//! |---------------------------------|-----------|--------------------|
//! | confirmed                       | true      | payment or now     |
//! | pending, deferred               | true      | none               |
//! | input, waiting, preauth         | false     | none               |
//! | error, refunded, rejected       | false     | cleared            |
//! | canceled                        | kept      | cleared            |
//!
//! Handling is serialized per payment and safe to replay.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;

use crate::app::App;
use crate::db::{Database, Id};
use crate::donation::donor::{get_or_create_donor, recompute_donor, DonorPayload};
use crate::donation::mails::send_donation_email;
use crate::donation::recurrence::process_recurrence_on_donor;
use crate::donation::{find_donation_by_payment, Donation, Donor, Recurrence};
use crate::events::{dispatch, Event};
use crate::money::Amount;
use crate::user::User;
use crate::{Error, ErrorKind, Result};

use super::{Order, Payment, PaymentStatus, Subscription};

/// Confirmed payments received longer ago than this are integrated
/// silently.
pub const RECEIVED_NOW_HOURS: i64 = 48;

/// Status update as posted by the payment provider.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PaymentUpdate {
    pub id: Id,
    pub status: PaymentStatus,
    pub received_amount: Option<Amount>,
    pub received_timestamp: Option<DateTime<Utc>>,
    pub captured_amount: Option<Amount>,
    pub transaction_id: Option<String>,
    pub extra_data: Option<String>,
}

/// Cancellation of a provider subscription.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriptionCancellation {
    pub subscription: Id,
    pub reason: String,
    pub feedback: String,
}

/// Lowercase hex HMAC-SHA256 of the body.
pub fn sign_webhook(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::from(ErrorKind::Other(e.to_string())))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks the hex signature of a webhook body in constant time.
pub fn verify_webhook(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(signature) = hex::decode(signature.trim().trim_start_matches("sha256=")) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Writes the update onto the stored payment.
pub fn apply_update(db: &Database, update: &PaymentUpdate) -> Result<Payment> {
    let mut payment: Payment = db.get(update.id)?;
    payment.status = update.status;
    if update.received_amount.is_some() {
        payment.received_amount = update.received_amount;
    }
    if update.received_timestamp.is_some() {
        payment.received_timestamp = update.received_timestamp;
    }
    if let Some(captured) = update.captured_amount {
        payment.captured_amount = captured;
    }
    if let Some(transaction_id) = &update.transaction_id {
        payment.transaction_id = transaction_id.clone();
    }
    if let Some(extra_data) = &update.extra_data {
        payment.extra_data = extra_data.clone();
    }
    payment.modified = Some(Utc::now());
    db.set(&payment)?;
    Ok(payment)
}

/// The donation bound to the payment or its order, created together with
/// a donor from the order when there is none yet.
pub async fn create_donation_from_payment(app: &App, payment: &Payment) -> Result<Donation> {
    if let Some(donation) = find_donation_by_payment(&app.db, payment.id)? {
        return Ok(donation);
    }
    if let Some(donation) = app.db.find::<Donation, _>(|d| d.order == Some(payment.order))? {
        return Ok(donation);
    }

    let order: Order = app.db.get(payment.order)?;
    let payload = DonorPayload {
        email: order.user_email.clone(),
        first_name: order.first_name.clone(),
        last_name: order.last_name.clone(),
        address: order.street_address_1.clone(),
        city: order.city.clone(),
        postcode: order.postcode.clone(),
        country: order.country.clone(),
        ..Default::default()
    };
    let user = order.user.map(|id| app.db.get_opt::<User>(id)).transpose()?.flatten();
    let subscription = order
        .subscription
        .map(|id| app.db.get_opt::<Subscription>(id))
        .transpose()?
        .flatten();
    let donor = get_or_create_donor(app, &payload, user.as_ref(), subscription.as_ref()).await?;

    let donation = Donation {
        timestamp: order.created.unwrap_or_else(Utc::now),
        amount: order.total_gross,
        amount_received: payment.received_amount.unwrap_or(Decimal::ZERO),
        order: Some(order.id),
        payment: Some(payment.id),
        method: payment.variant,
        recurring: order.is_recurring,
        reference: order.reference.clone(),
        keyword: order.keyword.clone(),
        ..Donation::new(&app.db, donor.id)?
    };
    app.db.set(&donation)?;
    recompute_donor(&app.db, donor.id)?;
    tracing::info!(donation = donation.id, payment = payment.id, "donation created from payment");
    Ok(donation)
}

/// Applies the payment status to its donation.
pub fn apply_status(donation: &mut Donation, payment: &Payment, now: DateTime<Utc>) {
    if donation.payment.is_none() {
        donation.payment = Some(payment.id);
    }
    donation.amount_received = payment.received_amount.unwrap_or(Decimal::ZERO);
    match payment.status {
        PaymentStatus::Confirmed => {
            donation.completed = true;
            if donation.received_timestamp.is_none() {
                donation.received_timestamp = Some(payment.received_timestamp.unwrap_or(now));
            }
        }
        PaymentStatus::Pending | PaymentStatus::Deferred => {
            donation.completed = true;
            donation.received_timestamp = None;
        }
        PaymentStatus::Input | PaymentStatus::Waiting | PaymentStatus::Preauth => {
            donation.completed = false;
            donation.received_timestamp = None;
        }
        PaymentStatus::Error | PaymentStatus::Refunded | PaymentStatus::Rejected => {
            donation.completed = false;
            donation.received_timestamp = None;
        }
        PaymentStatus::Canceled => {
            donation.received_timestamp = None;
        }
    }
}

/// Whether the donor is thanked and the team notified.
///
/// Only the first donation of a recurring series counts. Methods where a
/// pending payment is the donor's final action notify on pending, all
/// others on a confirmation received within the last 48 hours.
pub fn should_notify(donation: &Donation, payment: &Payment, now: DateTime<Utc>) -> bool {
    if !donation.completed {
        return false;
    }
    if donation.recurring && !donation.first_recurring {
        return false;
    }
    let received_now = donation
        .received_timestamp
        .map(|t| now - t <= Duration::hours(RECEIVED_NOW_HOURS))
        .unwrap_or(false);
    let pending_ok = payment.variant.pending_is_final();
    match payment.status {
        PaymentStatus::Confirmed => received_now && !pending_ok,
        PaymentStatus::Pending => pending_ok,
        _ => false,
    }
}

/// Handles a payment status change.
pub async fn status_changed(app: &App, payment: Id) -> Result<Donation> {
    let lock = app.payment_lock(payment);
    let _guard = lock.lock().await;

    let payment: Payment = app.db.get(payment)?;
    let now = Utc::now();
    let mut donation = create_donation_from_payment(app, &payment).await?;
    apply_status(&mut donation, &payment, now);
    app.db.set(&donation)?;
    tracing::info!(
        donation = donation.id,
        payment = payment.id,
        status = %payment.status,
        "payment status changed"
    );

    if donation.is_received() {
        let mut donor: Donor = app.db.get(donation.donor)?;
        if !donor.active {
            donor.active = true;
            app.db.set(&donor)?;
        }
    }
    recompute_donor(&app.db, donation.donor)?;

    if should_notify(&donation, &payment, now) && send_donation_email(app, donation.id).await? {
        dispatch(app, Event::DonationReceived { donation: donation.id }).await;
    }
    if donation.is_received() {
        process_recurrence_on_donor(app, donation.donor, now).await?;
    }
    app.db.get(donation.id)
}

/// Handles a provider subscription cancellation: the subscription's
/// recurrence ends now.
pub async fn subscription_canceled(
    app: &App,
    cancellation: &SubscriptionCancellation,
) -> Result<Option<Recurrence>> {
    let now = Utc::now();
    let mut subscription: Subscription = app.db.get(cancellation.subscription)?;
    if subscription.canceled.is_none() {
        subscription.canceled = Some(now);
    }
    subscription.active = false;
    app.db.set(&subscription)?;

    let Some(mut recurrence) = app
        .db
        .find::<Recurrence, _>(|r| r.subscription == Some(subscription.id))?
    else {
        tracing::debug!(subscription = subscription.id, "canceled subscription has no recurrence");
        return Ok(None);
    };
    recurrence.active = false;
    recurrence.cancel_date = subscription.canceled;
    recurrence.cancel_reason = cancellation.reason.clone();
    recurrence.cancel_feedback = cancellation.feedback.clone();
    app.db.set(&recurrence)?;
    recompute_donor(&app.db, recurrence.donor)?;
    tracing::info!(recurrence = recurrence.id, "recurrence canceled");
    Ok(Some(recurrence))
}
