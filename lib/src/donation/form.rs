//! Donation form submission.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use validator::{ValidateEmail, ValidateLength};

use crate::app::App;
use crate::db::Id;
use crate::money::{cents, parse_amount, Amount};
use crate::payment::{Order, Payment, PaymentMethod, Plan, Subscription};
use crate::user::User;
use crate::{Error, Result};

use super::donor::{get_or_create_donor, recompute_donor, DonorPayload};
use super::{Donation, Salutation, DEFAULT_PROJECT};

/// Months between donations offered by the form. `0` is a one-off.
pub const INTERVALS: [u32; 5] = [0, 1, 3, 6, 12];
pub const MIN_AMOUNT: Decimal = Decimal::ONE;

/// Raw form input, as posted.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DonationForm {
    pub amount: String,
    pub interval: u32,
    pub payment_method: String,

    pub salutation: String,
    pub first_name: String,
    pub last_name: String,
    pub company_name: String,
    pub address: String,
    pub postcode: String,
    pub city: String,
    pub country: String,
    pub email: String,

    pub contact: bool,
    pub account: bool,
    pub receipt: bool,

    pub project: String,
    pub purpose: String,
    pub reference: String,
    pub keyword: String,
}

/// Field name to message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FieldErrors(pub BTreeMap<String, String>);

impl FieldErrors {
    fn add(&mut self, field: &str, message: &str) {
        self.0.entry(field.to_string()).or_insert_with(|| message.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for FieldErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}: {v}")).collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Form input after validation.
#[derive(Clone, Debug)]
pub struct ValidDonation {
    pub amount: Amount,
    pub interval: u32,
    pub method: PaymentMethod,
    pub donor: DonorPayload,
}

pub fn validate(form: &DonationForm) -> std::result::Result<ValidDonation, FieldErrors> {
    let mut errors = FieldErrors::default();

    let amount = match parse_amount(&form.amount) {
        Ok(amount) if amount >= MIN_AMOUNT => amount,
        Ok(_) => {
            errors.add("amount", "Der Mindestbetrag ist 1 Euro.");
            Decimal::ZERO
        }
        Err(_) => {
            errors.add("amount", "Bitte geben Sie einen gültigen Betrag ein.");
            Decimal::ZERO
        }
    };
    if !INTERVALS.contains(&form.interval) {
        errors.add("interval", "Ungültiges Intervall.");
    }
    let method = match PaymentMethod::from_str(form.payment_method.trim()) {
        Ok(method) => method,
        Err(_) => {
            errors.add("payment_method", "Bitte wählen Sie eine Zahlungsart.");
            PaymentMethod::default()
        }
    };
    if !form.email.trim().validate_email() {
        errors.add("email", "Bitte geben Sie eine gültige E-Mail-Adresse ein.");
    }
    if !form.first_name.trim().validate_length(Some(1), Some(255), None) {
        errors.add("first_name", "Bitte geben Sie Ihren Vornamen an.");
    }
    if !form.last_name.trim().validate_length(Some(1), Some(255), None) {
        errors.add("last_name", "Bitte geben Sie Ihren Nachnamen an.");
    }
    if form.receipt && (form.address.trim().is_empty() || form.postcode.trim().is_empty() || form.city.trim().is_empty()) {
        errors.add("address", "Für eine Spendenbescheinigung brauchen wir Ihre Adresse.");
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    let salutation = Salutation::from_str(form.salutation.trim()).unwrap_or_default();
    Ok(ValidDonation {
        amount: cents(amount),
        interval: form.interval,
        method,
        donor: DonorPayload {
            salutation,
            first_name: form.first_name.clone(),
            last_name: form.last_name.clone(),
            company_name: form.company_name.clone(),
            address: form.address.clone(),
            postcode: form.postcode.clone(),
            city: form.city.clone(),
            country: form.country.clone(),
            email: form.email.clone(),
            contact: form.contact,
            account: form.account,
            receipt: form.receipt,
        },
    })
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub order: Id,
    pub payment: Id,
    pub donor: Id,
    pub donation: Id,
    /// Where to send the donor next.
    pub payment_url: String,
}

/// Validates the form and records the intent: order, payment awaiting
/// input, donor and donation. Validation failures persist nothing.
pub async fn submit_donation(app: &App, form: &DonationForm, user: Option<&User>) -> Result<Submission> {
    let valid = validate(form).map_err(Error::bad_input)?;
    let recurring = valid.interval > 0;

    let subscription = if recurring {
        let plan = Plan {
            name: format!("Spende {} alle {} Monat(e)", valid.amount, valid.interval),
            amount: valid.amount,
            interval: valid.interval,
            provider: valid.method,
        };
        let subscription = Subscription {
            customer_email: valid.donor.email.trim().to_lowercase(),
            ..Subscription::new(&app.db, plan)?
        };
        app.db.set(&subscription)?;
        Some(subscription)
    } else {
        None
    };

    let order = Order {
        user: user.map(|u| u.id),
        user_email: valid.donor.email.trim().to_lowercase(),
        first_name: valid.donor.first_name.trim().to_string(),
        last_name: valid.donor.last_name.trim().to_string(),
        street_address_1: valid.donor.address.trim().to_string(),
        city: valid.donor.city.trim().to_string(),
        postcode: valid.donor.postcode.trim().to_string(),
        country: valid.donor.country.trim().to_string(),
        subscription: subscription.as_ref().map(|s| s.id),
        total_gross: valid.amount,
        is_recurring: recurring,
        is_donation: true,
        description: if form.purpose.is_empty() {
            "Spende".to_string()
        } else {
            form.purpose.clone()
        },
        reference: form.reference.clone(),
        keyword: form.keyword.clone(),
        ..Order::new(&app.db)?
    };
    app.db.set(&order)?;
    let payment = Payment::new(&app.db, &order, valid.method)?;
    app.db.set(&payment)?;

    let donor = get_or_create_donor(app, &valid.donor, user, subscription.as_ref()).await?;
    let donation = Donation {
        amount: valid.amount,
        timestamp: Utc::now(),
        method: valid.method,
        project: if form.project.is_empty() {
            DEFAULT_PROJECT.to_string()
        } else {
            form.project.clone()
        },
        purpose: form.purpose.clone(),
        reference: form.reference.clone(),
        keyword: form.keyword.clone(),
        recurring,
        first_recurring: recurring,
        order: Some(order.id),
        payment: Some(payment.id),
        form_settings: serde_json::to_string(&serde_json::json!({
            "interval": valid.interval,
            "payment_method": valid.method.to_string(),
        }))?,
        ..Donation::new(&app.db, donor.id)?
    };
    app.db.set(&donation)?;
    recompute_donor(&app.db, donor.id)?;
    tracing::info!(donation = donation.id, donor = donor.id, "donation submitted");

    let path = app.config.payments.payment_url.replace("{id}", &payment.id.to_string());
    Ok(Submission {
        order: order.id,
        payment: payment.id,
        donor: donor.id,
        donation: donation.id,
        payment_url: app.config.absolute_url(&path),
    })
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::payment::PaymentStatus;
    use crate::{Config, ErrorKind};

    fn form() -> DonationForm {
        DonationForm {
            amount: "10,00".to_string(),
            interval: 0,
            payment_method: "banktransfer".to_string(),
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            email: "jane@example.org".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn validation_reports_every_field() {
        let bad = DonationForm {
            amount: "0,50".to_string(),
            interval: 2,
            payment_method: "cash".to_string(),
            email: "nope".to_string(),
            ..Default::default()
        };
        let errors = validate(&bad).unwrap_err();
        for field in ["amount", "interval", "payment_method", "email", "first_name", "last_name"] {
            assert!(errors.0.contains_key(field), "missing {field}");
        }
        assert!(validate(&form()).is_ok());
    }

    #[tokio::test]
    async fn invalid_form_persists_nothing() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let err = submit_donation(&app, &DonationForm::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::BadInput(_)));
        assert_eq!(app.db.len::<Order>().unwrap(), 0);
        assert_eq!(app.db.len::<Donation>().unwrap(), 0);
    }

    #[tokio::test]
    async fn recurring_submission_creates_subscription() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let submission = submit_donation(
            &app,
            &DonationForm {
                interval: 3,
                payment_method: "sepa".to_string(),
                amount: "30".to_string(),
                ..form()
            },
            None,
        )
        .await
        .unwrap();

        let payment: Payment = app.db.get(submission.payment).unwrap();
        assert_eq!(payment.status, PaymentStatus::Input);
        assert_eq!(payment.total, dec!(30));
        let order: Order = app.db.get(submission.order).unwrap();
        assert!(order.is_recurring);
        let subscription: Subscription = app.db.get(order.subscription.unwrap()).unwrap();
        assert_eq!(subscription.plan.interval, 3);

        let donation: Donation = app.db.get(submission.donation).unwrap();
        assert!(donation.recurring && donation.first_recurring);
        assert!(!donation.completed);
        assert_eq!(donation.number, 1);
        assert!(submission
            .payment_url
            .ends_with(&format!("/payment/{}/", submission.payment)));
    }
}
