//! Mails to donors: thanks, opt-in, transfer reminders and SEPA
//! pre-notifications.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use crate::app::App;
use crate::db::{Database, Id};
use crate::mailing::intent::{
    send_intent, Recipient, DONATION_REMINDER, DONOR_NEW_THANKS, DONOR_OPTIN, DONOR_THANKS,
    DONOR_THANKS_OPTIN, SEPA_NOTIFICATION,
};
use crate::mailing::Context;
use crate::money::format_amount;
use crate::payment::{integrator::create_donation_from_payment, Order, Payment, PaymentMethod};
use crate::{Config, Result};

use super::{Donation, Donor};

/// Marker written into the donation note once a reminder went out.
pub const REMINDER_MARKER: &str = "REMINDER:";
/// Days after which an unpaid bank transfer is reminded.
pub const REMINDER_AFTER_DAYS: i64 = 14;

/// Link confirming the donor's address.
pub fn confirm_url(config: &Config, donor: &Donor) -> String {
    config.absolute_url(&format!("/donation/donor/{}/confirm/", donor.uuid))
}

/// Variables describing the donor, shared by donor mails and mailings.
pub fn donor_context(donor: &Donor) -> Context {
    let mut context = Context::new();
    context.insert("name".into(), donor.display_name().into());
    context.insert("first_name".into(), donor.first_name.clone().into());
    context.insert("last_name".into(), donor.last_name.clone().into());
    context.insert("salutation".into(), donor.letter_salutation().into());
    context.insert(
        "donor".into(),
        json!({
            "id": donor.id,
            "uuid": donor.uuid.to_string(),
            "first_name": donor.first_name,
            "last_name": donor.last_name,
            "company_name": donor.company_name,
            "email": donor.email,
            "salutation": donor.salutation_label(),
            "city": donor.city,
            "postcode": donor.postcode,
            "recurring_amount": format_amount(donor.recurring_amount),
        }),
    );
    context
}

fn donation_value(donation: &Donation) -> Value {
    json!({
        "id": donation.id,
        "amount": format_amount(donation.amount),
        "method": donation.method.to_string(),
        "project": donation.project,
        "recurring": donation.recurring,
        "timestamp": donation.timestamp.to_rfc3339(),
    })
}

fn payment_value(payment: &Payment) -> Value {
    json!({
        "id": payment.id,
        "status": payment.status.to_string(),
        "variant": payment.variant.to_string(),
        "transaction_id": payment.transaction_id,
    })
}

fn order_value(order: &Order) -> Value {
    json!({
        "id": order.id,
        "total_gross": format_amount(order.total_gross),
        "description": order.description,
        "is_recurring": order.is_recurring,
    })
}

/// Donor context plus donation, payment and order.
pub fn donation_context(db: &Database, donor: &Donor, donation: &Donation) -> Result<Context> {
    let mut context = donor_context(donor);
    context.insert("donation".into(), donation_value(donation));
    let payment = donation.payment.map(|id| db.get_opt::<Payment>(id)).transpose()?.flatten();
    let order = match donation.order {
        Some(id) => db.get_opt::<Order>(id)?,
        None => payment
            .as_ref()
            .map(|p| db.get_opt::<Order>(p.order))
            .transpose()?
            .flatten(),
    };
    context.insert(
        "payment".into(),
        payment.as_ref().map(payment_value).unwrap_or(Value::Null),
    );
    context.insert(
        "order".into(),
        order.as_ref().map(order_value).unwrap_or(Value::Null),
    );
    Ok(context)
}

/// Thanks the donor for the donation, once.
///
/// Donors with an unconfirmed address get the thanks combined with the
/// opt-in link. Confirmed donors get the new-donor thanks the first time
/// and the plain thanks afterwards. Orders that are not donations only
/// trigger the opt-in variant.
pub async fn send_donation_email(app: &App, donation: Id) -> Result<bool> {
    let mut donation: Donation = app.db.get(donation)?;
    if donation.email_sent.is_some() {
        tracing::debug!(donation = donation.id, "donation mail already sent");
        return Ok(false);
    }
    let mut donor: Donor = app.db.get(donation.donor)?;
    if donor.email.is_empty() {
        return Ok(false);
    }

    let needs_optin = donor.email_confirmed.is_none();
    let intent = match (needs_optin, donor.email_confirmation_sent.is_some()) {
        (true, _) => DONOR_THANKS_OPTIN,
        (false, true) => DONOR_THANKS,
        (false, false) => DONOR_NEW_THANKS,
    };
    let is_donation = match donation.order {
        Some(order) => app.db.get_opt::<Order>(order)?.map(|o| o.is_donation).unwrap_or(true),
        None => true,
    };
    if !is_donation && !needs_optin {
        return Ok(false);
    }

    let mut context = donation_context(&app.db, &donor, &donation)?;
    if needs_optin {
        context.insert("action_url".into(), confirm_url(&app.config, &donor).into());
    }
    send_intent(app, intent, &Recipient::from_donor(&donor), context).await?;

    let now = Utc::now();
    donation.email_sent = Some(now);
    app.db.set(&donation)?;
    donor.email_confirmation_sent = Some(now);
    app.db.set(&donor)?;
    Ok(true)
}

pub async fn send_donor_optin_email(app: &App, donor: &mut Donor) -> Result<bool> {
    if donor.email.is_empty() {
        return Ok(false);
    }
    let mut context = donor_context(donor);
    context.insert("action_url".into(), confirm_url(&app.config, donor).into());
    send_intent(app, DONOR_OPTIN, &Recipient::from_donor(donor), context).await?;
    donor.email_confirmation_sent = Some(Utc::now());
    app.db.set(donor)?;
    Ok(true)
}

/// Reminds an unpaid bank transfer older than two weeks, once.
pub async fn send_donation_reminder_email(
    app: &App,
    donation: &mut Donation,
    now: DateTime<Utc>,
) -> Result<bool> {
    if donation.is_received()
        || donation.method != PaymentMethod::Banktransfer
        || donation.note.contains(REMINDER_MARKER)
        || now - donation.timestamp < Duration::days(REMINDER_AFTER_DAYS)
    {
        return Ok(false);
    }
    let donor: Donor = app.db.get(donation.donor)?;
    if donor.email.is_empty() {
        return Ok(false);
    }
    let context = donation_context(&app.db, &donor, donation)?;
    send_intent(app, DONATION_REMINDER, &Recipient::from_donor(&donor), context).await?;

    donation.note = format!("{}\n\n{} {}\n", donation.note, REMINDER_MARKER, now.to_rfc3339())
        .trim()
        .to_string();
    app.db.set(donation)?;
    Ok(true)
}

/// Monthly job: reminds all open bank transfers. Returns the number of
/// reminders sent.
pub async fn remind_open_transfers(app: &App, now: DateTime<Utc>) -> Result<usize> {
    let open = app.db.filter::<Donation, _>(|d| {
        !d.is_received() && d.method == PaymentMethod::Banktransfer && !d.note.contains(REMINDER_MARKER)
    })?;
    let mut sent = 0;
    for mut donation in open {
        match send_donation_reminder_email(app, &mut donation, now).await {
            Ok(true) => sent += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(donation = donation.id, "reminder failed: {e}"),
        }
    }
    tracing::info!(sent, "sent transfer reminders");
    Ok(sent)
}

/// SEPA pre-notification. `data` carries the mandate reference and the
/// last digits of the account.
pub async fn send_sepa_notification(app: &App, payment: Id, data: Context) -> Result<bool> {
    let payment: Payment = app.db.get(payment)?;
    let donation = create_donation_from_payment(app, &payment).await?;
    let donor: Donor = app.db.get(donation.donor)?;
    if donor.email.is_empty() {
        return Ok(false);
    }
    let mut context = donation_context(&app.db, &donor, &donation)?;
    context.insert("payment".into(), payment_value(&payment));
    context.extend(data);
    send_intent(app, SEPA_NOTIFICATION, &Recipient::from_donor(&donor), context).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::Config;

    fn donor(app: &App, confirmed: bool) -> Donor {
        let donor = Donor {
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            email: "jane@example.org".to_string(),
            email_confirmed: confirmed.then(Utc::now),
            ..Donor::new(&app.db).unwrap()
        };
        app.db.set(&donor).unwrap();
        donor
    }

    fn donation(app: &App, donor: &Donor) -> Donation {
        let donation = Donation {
            amount: dec!(10),
            method: PaymentMethod::Banktransfer,
            ..Donation::new(&app.db, donor.id).unwrap()
        };
        app.db.set(&donation).unwrap();
        donation
    }

    #[tokio::test]
    async fn unconfirmed_donor_gets_optin_thanks() {
        let (app, transport) = App::in_memory(Config::default()).unwrap();
        let donor = donor(&app, false);
        let donation = donation(&app, &donor);

        assert!(send_donation_email(&app, donation.id).await.unwrap());
        let mail = &transport.sent_to("jane@example.org")[0];
        assert!(mail.subject.contains("bestätigen"));
        assert!(mail.text.contains(&format!("/donation/donor/{}/confirm/", donor.uuid)));
        assert!(mail.text.contains("10,00 Euro"));

        // guarded by email_sent
        assert!(!send_donation_email(&app, donation.id).await.unwrap());
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn confirmed_donors_get_new_then_plain_thanks() {
        let (app, transport) = App::in_memory(Config::default()).unwrap();
        let donor = donor(&app, true);
        let first = donation(&app, &donor);
        let second = donation(&app, &donor);

        send_donation_email(&app, first.id).await.unwrap();
        send_donation_email(&app, second.id).await.unwrap();
        let sent = transport.sent();
        assert_eq!(sent[0].subject, "Danke für Ihre Spende!");
        assert_eq!(sent[1].subject, "Danke für Ihre erneute Spende!");
        assert!(sent[0].text.starts_with("Guten Tag Jane Doe,"));
    }

    #[tokio::test]
    async fn reminds_old_transfers_once() {
        let (app, transport) = App::in_memory(Config::default()).unwrap();
        let donor = donor(&app, true);
        let mut old = donation(&app, &donor);
        old.timestamp = Utc::now() - Duration::days(20);
        app.db.set(&old).unwrap();
        donation(&app, &donor);

        assert_eq!(remind_open_transfers(&app, Utc::now()).await.unwrap(), 1);
        assert_eq!(remind_open_transfers(&app, Utc::now()).await.unwrap(), 0);
        assert_eq!(transport.sent().len(), 1);
        assert!(app.db.get::<Donation>(old.id).unwrap().note.starts_with(REMINDER_MARKER));
    }
}
