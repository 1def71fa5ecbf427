//! Bank statement import.
//!
//! Statements come as CSV or XLSX with the bank's German column names.
//! Every row gets a synthesized identifier, so importing the same
//! statement twice is a no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::LazyLock;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::app::App;
use crate::db::{Database, Id};
use crate::donation::donor::recompute_donor;
use crate::donation::recurrence::process_recurrence_on_donor;
use crate::donation::{find_donation_by_identifier, Donation, Donor};
use crate::money::{parse_amount, Amount};
use crate::util::{excel_serial_to_date, localize_date, parse_date};
use crate::{Config, Error, Result};

use super::integrator::status_changed;
use super::{find_by_transaction_id, Payment, PaymentMethod, PaymentStatus};

/// Statement column to row field.
const COLUMNS: [(&str, &str); 7] = [
    ("Betrag", "amount"),
    ("Datum", "date_received"),
    ("Wertstellung", "date"),
    ("Name", "name"),
    ("Verwendungszweck", "reference"),
    ("Konto", "iban"),
    ("Bank", "bic"),
];

#[derive(Clone, Debug, PartialEq)]
pub struct TransferRow {
    pub index: usize,
    pub amount: Amount,
    pub date: DateTime<Utc>,
    pub date_received: DateTime<Utc>,
    pub name: String,
    pub reference: String,
    pub iban: String,
    pub bic: String,
}

impl TransferRow {
    /// `date|reference|iban|rowindex`
    pub fn identifier(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.date.format("%Y-%m-%d"),
            self.reference,
            self.iban,
            self.index
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub rows: usize,
    pub new: usize,
    pub skipped: usize,
}

static DIRECT_DEBIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(P(\d+)\)").expect("direct debit pattern"));

fn is_xlsx(data: &[u8]) -> bool {
    // zip container
    data.starts_with(b"PK\x03\x04")
}

fn parse_row(config: &Config, index: usize, fields: &BTreeMap<&str, String>) -> Result<TransferRow> {
    let get = |key: &str| fields.get(key).map(|s| s.trim().to_string()).unwrap_or_default();
    let tz = config.site.timezone;
    let date_received = localize_date(parse_date(&get("date_received"))?, tz);
    let date = match get("date").as_str() {
        "" => date_received,
        value => localize_date(parse_date(value)?, tz),
    };
    Ok(TransferRow {
        index,
        amount: parse_amount(&get("amount"))?,
        date,
        date_received,
        name: get("name"),
        reference: get("reference"),
        iban: get("iban").replace(' ', "").to_uppercase(),
        bic: get("bic"),
    })
}

fn field_of(header: &str) -> Option<&'static str> {
    COLUMNS
        .iter()
        .find(|(column, _)| column.eq_ignore_ascii_case(header.trim()))
        .map(|(_, field)| *field)
}

fn rows_from_table(config: &Config, header: Vec<String>, records: Vec<Vec<String>>) -> Result<Vec<TransferRow>> {
    let fields: Vec<Option<&'static str>> = header.iter().map(|h| field_of(h)).collect();
    if !fields.contains(&Some("amount")) || !fields.contains(&Some("date_received")) {
        return Err(Error::bad_input("statement lacks the Betrag or Datum column"));
    }
    let mut rows = vec![];
    for (index, record) in records.into_iter().enumerate() {
        if record.iter().all(|v| v.trim().is_empty()) {
            continue;
        }
        let map: BTreeMap<&str, String> = fields
            .iter()
            .zip(record)
            .filter_map(|(field, value)| field.map(|f| (f, value)))
            .collect();
        rows.push(parse_row(config, index, &map)?);
    }
    Ok(rows)
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64())
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        Data::Float(f) => format!("{f:.2}"),
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

/// Reads statement rows from CSV (`;` or `,` separated) or XLSX.
pub fn read_statement(config: &Config, data: &[u8]) -> Result<Vec<TransferRow>> {
    if is_xlsx(data) {
        let mut workbook = open_workbook_auto_from_rs(Cursor::new(data.to_vec()))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| Error::bad_input("workbook has no sheets"))??;
        let mut rows = range.rows().map(|r| r.iter().map(cell_to_string).collect::<Vec<_>>());
        let header = rows.next().unwrap_or_default();
        return rows_from_table(config, header, rows.collect());
    }

    let first_line = data.split(|b| *b == b'\n').next().unwrap_or_default();
    let delimiter = if first_line.contains(&b';') { b';' } else { b',' };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(data);
    let header = reader.headers()?.iter().map(|s| s.to_string()).collect();
    let mut records = vec![];
    for record in reader.records() {
        records.push(record?.iter().map(|s| s.to_string()).collect());
    }
    rows_from_table(config, header, records)
}

pub fn transfer_code_pattern(config: &Config) -> Result<Regex> {
    Ok(Regex::new(&config.payments.transfer_code_pattern)?)
}

/// Transfer code in the reference, upper-cased. The pattern's first capture
/// group is the code, the whole match otherwise.
pub fn transfer_code(pattern: &Regex, reference: &str) -> Option<(String, String)> {
    let upper = reference.to_uppercase();
    pattern.captures(&upper).map(|c| {
        let whole = c.get(0).map(|m| m.as_str().to_string()).unwrap_or_default();
        let code = c.get(1).map(|m| m.as_str().to_string()).unwrap_or_else(|| whole.clone());
        (code, whole)
    })
}

fn is_blocked(config: &Config, name: &str) -> bool {
    let name = name.to_lowercase();
    config
        .payments
        .blocklist
        .iter()
        .any(|b| !b.is_empty() && name.contains(&b.to_lowercase()))
}

/// Pending donation of a payment whose transfer code appears in the row.
fn donation_by_transfer_code(pattern: &Regex, db: &Database, row: &TransferRow) -> Result<Option<Donation>> {
    let Some((code, whole)) = transfer_code(pattern, &row.reference) else {
        return Ok(None);
    };
    let mut payments = find_by_transaction_id(db, &code)?;
    if payments.is_empty() && whole != code {
        payments = find_by_transaction_id(db, &whole)?;
    }
    let Some(payment) = payments.first() else {
        return Ok(None);
    };
    db.find::<Donation, _>(|d| d.payment == Some(payment.id) && d.identifier.is_empty())
}

fn donor_for_row(db: &Database, row: &TransferRow) -> Result<Donor> {
    if !row.iban.is_empty() {
        if let Some(donor) = db.find::<Donor, _>(|d| d.attributes.iban.as_deref() == Some(row.iban.as_str()))? {
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
        ..Donor::new(db)?
    };
    if let Some(country) = row.iban.get(..2) {
        donor.country = country.to_string();
        donor.attributes.iban = Some(row.iban.clone());
    }
    db.set(&donor)?;
    tracing::info!(donor = donor.id, "donor created from bank transfer");
    Ok(donor)
}

enum RowOutcome {
    New(Id),
    Updated(Id),
    Unchanged,
    Skipped,
}

/// Marks the payment named by a `(P<id>)` reference as paid.
async fn import_direct_debit(app: &App, row: &TransferRow, payment: Id) -> Result<RowOutcome> {
    let Some(mut payment) = app.db.get_opt::<Payment>(payment)? else {
        tracing::warn!(payment, "direct debit references unknown payment");
        return Ok(RowOutcome::Skipped);
    };
    if payment.status == PaymentStatus::Confirmed {
        return Ok(RowOutcome::Unchanged);
    }
    payment.status = PaymentStatus::Confirmed;
    payment.captured_amount = row.amount;
    payment.received_amount = Some(row.amount);
    payment.received_timestamp = Some(row.date_received);
    payment.modified = Some(Utc::now());
    app.db.set(&payment)?;
    let donation = status_changed(app, payment.id).await?;
    Ok(RowOutcome::Updated(donation.donor))
}

async fn import_row(app: &App, pattern: &Regex, row: &TransferRow) -> Result<RowOutcome> {
    if is_blocked(&app.config, &row.name) {
        tracing::debug!(name = %row.name, "blocked sender");
        return Ok(RowOutcome::Skipped);
    }
    if let Some(payment) = DIRECT_DEBIT
        .captures(&row.reference)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<Id>().ok())
    {
        return import_direct_debit(app, row, payment).await;
    }

    let db = &app.db;
    let identifier = row.identifier();
    if let Some(donation) = find_donation_by_identifier(db, &identifier)? {
        if donation.amount == row.amount && donation.received_timestamp == Some(row.date_received) {
            return Ok(RowOutcome::Unchanged);
        }
        let donation = Donation {
            amount: row.amount,
            amount_received: row.amount,
            received_timestamp: Some(row.date_received),
            ..donation
        };
        db.set(&donation)?;
        return Ok(RowOutcome::Updated(donation.donor));
    }

    if let Some(mut donation) = donation_by_transfer_code(pattern, db, row)? {
        donation.identifier = identifier;
        donation.amount = row.amount;
        donation.amount_received = row.amount;
        donation.received_timestamp = Some(row.date_received);
        donation.method = PaymentMethod::Banktransfer;
        donation.completed = true;
        db.set(&donation)?;

        let mut donor: Donor = db.get(donation.donor)?;
        if donor.attributes.iban.is_none() && !row.iban.is_empty() {
            donor.attributes.iban = Some(row.iban.clone());
            db.set(&donor)?;
        }
        if let Some(payment) = donation.payment {
            let mut payment: Payment = db.get(payment)?;
            if payment.status != PaymentStatus::Confirmed {
                payment.status = PaymentStatus::Confirmed;
                payment.captured_amount = row.amount;
                payment.received_amount = Some(row.amount);
                payment.received_timestamp = Some(row.date_received);
                payment.modified = Some(Utc::now());
                db.set(&payment)?;
                status_changed(app, payment.id).await?;
            }
        }
        tracing::info!(donation = donation.id, "bank transfer matched by transfer code");
        return Ok(RowOutcome::Updated(donation.donor));
    }

    let donor = donor_for_row(db, row)?;
    let donation = Donation {
        amount: row.amount,
        amount_received: row.amount,
        timestamp: row.date,
        received_timestamp: Some(row.date_received),
        method: PaymentMethod::Banktransfer,
        purpose: row.reference.clone(),
        identifier,
        completed: true,
        ..Donation::new(db, donor.id)?
    };
    db.set(&donation)?;
    Ok(RowOutcome::New(donor.id))
}

/// Imports a statement. Rows commit one at a time, a failing row is
/// logged and skipped. Touched donors get their aggregates and recurrences
/// refreshed.
pub async fn import_banktransfers(app: &App, data: &[u8]) -> Result<ImportReport> {
    let pattern = transfer_code_pattern(&app.config)?;
    let rows = read_statement(&app.config, data)?;
    let mut report = ImportReport::default();
    let mut touched = BTreeSet::new();
    for row in &rows {
        report.rows += 1;
        match import_row(app, &pattern, row).await {
            Ok(RowOutcome::New(donor)) => {
                report.new += 1;
                touched.insert(donor);
            }
            Ok(RowOutcome::Updated(donor)) => {
                touched.insert(donor);
            }
            Ok(RowOutcome::Unchanged) => {}
            Ok(RowOutcome::Skipped) => report.skipped += 1,
            Err(e) => {
                tracing::warn!(row = row.index, "bank transfer row failed: {e}");
                report.skipped += 1;
            }
        }
    }
    let now = Utc::now();
    for donor in touched {
        recompute_donor(&app.db, donor)?;
        process_recurrence_on_donor(app, donor, now).await?;
    }
    tracing::info!(rows = report.rows, new = report.new, "imported bank transfers");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::payment::Order;

    const STATEMENT: &str = "Betrag;Datum;Wertstellung;Name;Verwendungszweck;Konto;Bank\n\
        10,00;05.03.2024;04.03.2024;Jane Doe;Spende XYZ-42;DE00123456780000000000;GENODEF1\n\
        99,00;06.03.2024;06.03.2024;Finanzamt Berlin;Erstattung;DE11000000000000000000;BANK\n";

    fn app() -> App {
        let mut config = Config::default();
        config.payments.blocklist = vec!["finanzamt".to_string()];
        App::in_memory(config).unwrap().0
    }

    #[test]
    fn reads_semicolon_csv() {
        let rows = read_statement(&Config::default(), STATEMENT.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].amount, dec!(10.00));
        assert_eq!(rows[0].iban, "DE00123456780000000000");
        assert_eq!(
            rows[0].identifier(),
            format!("{}|Spende XYZ-42|DE00123456780000000000|0", rows[0].date.format("%Y-%m-%d"))
        );
    }

    #[test]
    fn extracts_transfer_code() {
        let pattern = transfer_code_pattern(&Config::default()).unwrap();
        assert_eq!(
            transfer_code(&pattern, "Spende xyz-42 danke"),
            Some(("42".to_string(), "XYZ-42".to_string()))
        );
        assert_eq!(transfer_code(&pattern, "Spende"), None);
    }

    #[test]
    fn direct_debit_reference() {
        let caps = DIRECT_DEBIT.captures("Lastschrift (P17) FragDenStaat").unwrap();
        assert_eq!(&caps[1], "17");
    }

    #[tokio::test]
    async fn invalid_transfer_code_pattern_fails_import() {
        let mut config = Config::default();
        config.payments.transfer_code_pattern = "([A-Z".to_string();
        let (app, _) = App::in_memory(config).unwrap();
        assert!(import_banktransfers(&app, STATEMENT.as_bytes()).await.is_err());
        assert_eq!(app.db.len::<Donation>().unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_code_creates_donor_and_is_idempotent() {
        let app = app();
        let report = import_banktransfers(&app, STATEMENT.as_bytes()).await.unwrap();
        assert_eq!(report, ImportReport { rows: 2, new: 1, skipped: 1 });

        let donations = app.db.get_collection::<Donation>().unwrap();
        assert_eq!(donations.len(), 1);
        let donation = &donations[0];
        assert_eq!(donation.method, PaymentMethod::Banktransfer);
        assert!(donation.is_received());
        assert!(donation.completed);
        let donor: Donor = app.db.get(donation.donor).unwrap();
        assert_eq!(donor.first_name, "Jane");
        assert_eq!(donor.last_name, "Doe");
        assert_eq!(donor.attributes.iban.as_deref(), Some("DE00123456780000000000"));

        let again = import_banktransfers(&app, STATEMENT.as_bytes()).await.unwrap();
        assert_eq!(again.new, 0);
        assert_eq!(app.db.len::<Donation>().unwrap(), 1);
        assert_eq!(app.db.len::<Donor>().unwrap(), 1);
    }

    #[tokio::test]
    async fn transfer_code_binds_pending_donation() {
        let app = app();
        let order = Order {
            user_email: "jane@example.org".to_string(),
            total_gross: dec!(10),
            ..Order::new(&app.db).unwrap()
        };
        app.db.set(&order).unwrap();
        let payment = Payment {
            transaction_id: "42".to_string(),
            status: PaymentStatus::Pending,
            ..Payment::new(&app.db, &order, PaymentMethod::Banktransfer).unwrap()
        };
        app.db.set(&payment).unwrap();
        let donor = Donor::new(&app.db).unwrap();
        app.db.set(&donor).unwrap();
        let pending = Donation {
            amount: dec!(10),
            completed: true,
            payment: Some(payment.id),
            order: Some(order.id),
            method: PaymentMethod::Banktransfer,
            ..Donation::new(&app.db, donor.id).unwrap()
        };
        app.db.set(&pending).unwrap();

        let report = import_banktransfers(&app, STATEMENT.as_bytes()).await.unwrap();
        assert_eq!(report.new, 0);
        let donation: Donation = app.db.get(pending.id).unwrap();
        assert!(donation.is_received());
        assert!(!donation.identifier.is_empty());
        assert_eq!(
            app.db.get::<Payment>(payment.id).unwrap().status,
            PaymentStatus::Confirmed
        );
        assert_eq!(
            app.db.get::<Donor>(donor.id).unwrap().attributes.iban.as_deref(),
            Some("DE00123456780000000000")
        );
    }
}
