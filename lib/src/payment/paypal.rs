//! PayPal activity export import.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};

use crate::app::App;
use crate::db::{Database, Id};
use crate::donation::donor::recompute_donor;
use crate::donation::recurrence::process_recurrence_on_donor;
use crate::donation::{find_donation_by_identifier, find_donation_by_payment, Donation, Donor};
use crate::money::{parse_amount, Amount};
use crate::util::{localize, normalize_email, parse_date, parse_time};
use crate::{Config, Error, ErrorKind, Result};

use super::{Payment, PaymentMethod, PaymentStatus};

/// Only rows crediting the account are donations.
pub const CREDIT: &str = "Haben";
/// Allowed distance between a row and the payment it belongs to.
pub const MATCH_WINDOW_MINUTES: i64 = 5;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PaypalRow {
    pub date: Option<DateTime<Utc>>,
    pub amount: Amount,
    pub amount_received: Amount,
    pub sale_id: String,
    pub subscription_id: String,
    pub name: String,
    pub country: String,
    pub address: String,
    pub city: String,
    pub postcode: String,
    pub note: String,
    pub email: String,
    pub balance_effect: String,
}

impl PaypalRow {
    pub fn is_credit(&self) -> bool {
        self.balance_effect == CREDIT
    }
}

fn parse_row(config: &Config, record: &BTreeMap<String, String>) -> Result<PaypalRow> {
    let get = |key: &str| record.get(key).map(|s| s.trim().to_string()).unwrap_or_default();
    let date = parse_date(&get("Datum"))?;
    let time = match get("Uhrzeit").as_str() {
        "" => chrono::NaiveTime::MIN,
        value => parse_time(value)?,
    };
    let address = [get("Adresszeile 1"), get("Adresszusatz")]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let amount = parse_amount(&get("Brutto"))?;
    let amount_received = match get("Netto").as_str() {
        "" => amount,
        value => parse_amount(value)?,
    };
    Ok(PaypalRow {
        date: Some(localize(date.and_time(time), config.site.timezone)),
        amount,
        amount_received,
        sale_id: get("Transaktionscode"),
        subscription_id: get("Zugehöriger Transaktionscode"),
        name: get("Name"),
        country: get("Ländervorwahl"),
        address,
        city: get("Ort"),
        postcode: get("PLZ"),
        note: get("Hinweis"),
        email: normalize_email(&get("Absender E-Mail-Adresse")),
        balance_effect: get("Auswirkung auf Guthaben"),
    })
}

/// Reads the export. PayPal writes comma separated, quoted fields.
pub fn read_export(config: &Config, data: &[u8]) -> Result<Vec<PaypalRow>> {
    let data = data.strip_prefix(b"\xef\xbb\xbf").unwrap_or(data);
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(data);
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let mut rows = vec![];
    for record in reader.records() {
        let record = record?;
        let map: BTreeMap<String, String> = headers
            .iter()
            .cloned()
            .zip(record.iter().map(|v| v.to_string()))
            .collect();
        rows.push(parse_row(config, &map)?);
    }
    Ok(rows)
}

/// The confirmed PayPal payment created within five minutes of the row
/// that mentions its sale id, or its subscription id for recurring rows.
/// More than one candidate is an error.
pub fn find_paypal_payment(db: &Database, row: &PaypalRow) -> Result<Option<Payment>> {
    let Some(date) = row.date else {
        return Ok(None);
    };
    let window = Duration::minutes(MATCH_WINDOW_MINUTES);
    let mut candidates = db.filter::<Payment, _>(|p| {
        p.variant == PaymentMethod::Paypal
            && p.status == PaymentStatus::Confirmed
            && p.created
                .map(|c| c >= date - window && c <= date + window)
                .unwrap_or(false)
            && ((!row.sale_id.is_empty() && p.extra_data.contains(&row.sale_id))
                || (!row.subscription_id.is_empty() && p.extra_data.contains(&row.subscription_id)))
    })?;
    match candidates.len() {
        0 => Ok(None),
        1 => Ok(candidates.pop()),
        n => Err(ErrorKind::AmbiguousPayment(format!("{n} payments match sale {}", row.sale_id)).into()),
    }
}

fn donor_for_row(db: &Database, row: &PaypalRow) -> Result<Donor> {
    if !row.email.is_empty() {
        if let Some(donor) =
            db.find::<Donor, _>(|d| d.attributes.paypal_email.as_deref() == Some(row.email.as_str()))?
        {
            return Ok(donor);
        }
    }
    let (first_name, last_name) = match row.name.trim().rsplit_once(' ') {
        Some((first, last)) => (first.trim().to_string(), last.to_string()),
        None => (String::new(), row.name.trim().to_string()),
    };
    let mut donor = Donor {
        first_name,
        last_name,
        address: row.address.clone(),
        city: row.city.clone(),
        postcode: row.postcode.clone(),
        email: row.email.clone(),
        ..Donor::new(db)?
    };
    if !row.country.is_empty() {
        donor.country = row.country.to_uppercase();
    }
    if !row.email.is_empty() {
        donor.attributes.paypal_email = Some(row.email.clone());
    }
    db.set(&donor)?;
    tracing::info!(donor = donor.id, "donor created from paypal export");
    Ok(donor)
}

/// Imports a row. Returns the touched donor and whether a donation was
/// created.
fn import_row(db: &Database, row: &PaypalRow) -> Result<Option<(Id, bool)>> {
    if row.sale_id.is_empty() {
        return Err(Error::bad_input("paypal row without Transaktionscode"));
    }
    if find_donation_by_identifier(db, &row.sale_id)?.is_some() {
        return Ok(None);
    }
    let received = row.date.unwrap_or_else(Utc::now);

    if let Some(payment) = find_paypal_payment(db, row)? {
        if let Some(mut donation) = find_donation_by_payment(db, payment.id)? {
            donation.identifier = row.sale_id.clone();
            donation.amount_received = row.amount_received;
            donation.received_timestamp = donation.received_timestamp.or(Some(received));
            donation.completed = true;
            db.set(&donation)?;
            let mut donor: Donor = db.get(donation.donor)?;
            if donor.attributes.paypal_email.is_none() && !row.email.is_empty() {
                donor.attributes.paypal_email = Some(row.email.clone());
                db.set(&donor)?;
            }
            return Ok(Some((donor.id, false)));
        }
    }

    let donor = donor_for_row(db, row)?;
    let donation = Donation {
        amount: row.amount,
        amount_received: row.amount_received,
        timestamp: received,
        received_timestamp: Some(received),
        method: PaymentMethod::Paypal,
        purpose: row.note.clone(),
        identifier: row.sale_id.clone(),
        recurring: !row.subscription_id.is_empty(),
        completed: true,
        ..Donation::new(db, donor.id)?
    };
    db.set(&donation)?;
    Ok(Some((donor.id, true)))
}

/// Imports credit rows of a PayPal export. Returns (rows, new donations).
pub async fn import_paypal(app: &App, data: &[u8]) -> Result<(usize, usize)> {
    let rows = read_export(&app.config, data)?;
    let (mut count, mut new) = (0, 0);
    let mut touched = BTreeSet::new();
    for row in rows.iter().filter(|r| r.is_credit()) {
        count += 1;
        if let Some((donor, created)) = import_row(&app.db, row)? {
            touched.insert(donor);
            if created {
                new += 1;
            }
        }
    }
    let now = Utc::now();
    for donor in touched {
        recompute_donor(&app.db, donor)?;
        process_recurrence_on_donor(app, donor, now).await?;
    }
    tracing::info!(rows = count, new, "imported paypal export");
    Ok((count, new))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::payment::Order;

    const EXPORT: &str = "\"Datum\",\"Uhrzeit\",\"Name\",\"Brutto\",\"Netto\",\"Absender E-Mail-Adresse\",\"Transaktionscode\",\"Zugehöriger Transaktionscode\",\"Adresszeile 1\",\"Adresszusatz\",\"Ort\",\"PLZ\",\"Ländervorwahl\",\"Hinweis\",\"Auswirkung auf Guthaben\"\n\
\"04.03.2024\",\"12:00:00\",\"Jane Doe\",\"10,00\",\"9,41\",\"Jane@Example.org\",\"SALE1\",\"\",\"Hauptstr. 1\",\"\",\"Berlin\",\"10115\",\"DE\",\"Danke\",\"Haben\"\n\
\"04.03.2024\",\"12:05:00\",\"PayPal\",\"-0,59\",\"-0,59\",\"\",\"FEE1\",\"SALE1\",\"\",\"\",\"\",\"\",\"\",\"\",\"Soll\"\n";

    #[test]
    fn reads_rows() {
        let rows = read_export(&Config::default(), EXPORT.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].amount, dec!(10.00));
        assert_eq!(rows[0].amount_received, dec!(9.41));
        assert_eq!(rows[0].email, "jane@example.org");
        assert!(rows[0].is_credit());
        assert!(!rows[1].is_credit());
    }

    #[tokio::test]
    async fn creates_donation_once() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        assert_eq!(import_paypal(&app, EXPORT.as_bytes()).await.unwrap(), (1, 1));
        assert_eq!(import_paypal(&app, EXPORT.as_bytes()).await.unwrap(), (1, 0));

        let donation = find_donation_by_identifier(&app.db, "SALE1").unwrap().unwrap();
        assert_eq!(donation.method, PaymentMethod::Paypal);
        let donor: Donor = app.db.get(donation.donor).unwrap();
        assert_eq!(donor.city, "Berlin");
        assert_eq!(donor.attributes.paypal_email.as_deref(), Some("jane@example.org"));
    }

    #[test]
    fn payment_match_is_unique() {
        let db = Database::temporary().unwrap();
        let config = Config::default();
        let row = read_export(&config, EXPORT.as_bytes()).unwrap().remove(0);
        let order = Order::new(&db).unwrap();
        db.set(&order).unwrap();
        let make = |minutes: i64| {
            let payment = Payment {
                status: PaymentStatus::Confirmed,
                extra_data: r#"{"sale_id": "SALE1"}"#.to_string(),
                created: row.date.map(|d| d + Duration::minutes(minutes)),
                ..Payment::new(&db, &order, PaymentMethod::Paypal).unwrap()
            };
            db.set(&payment).unwrap();
            payment
        };
        make(30);
        assert!(find_paypal_payment(&db, &row).unwrap().is_none());
        let near = make(2);
        assert_eq!(find_paypal_payment(&db, &row).unwrap().unwrap().id, near.id);
        make(-3);
        let err = find_paypal_payment(&db, &row).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::AmbiguousPayment(_)));
    }
}
