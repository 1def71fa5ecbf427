//! Annual donation receipts (Zuwendungsbestätigungen).
//!
//! Receipt data is computed per donor and year, then exported as csv, pdf,
//! postcode-encrypted pdf or mailed to the donor. Exports can mark the
//! donations as receipted and back the pdf up to WebDAV.

pub mod backup;
pub mod pdf;

use std::io::Write;

use askama::Template;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;

use crate::app::App;
use crate::db::{Changeset, Database, Id};
use crate::donation::{donations_of, mails::donor_context, Donation, Donor};
use crate::email::Attachment;
use crate::mailing::intent::{send_intent_with, Recipient, SendOptions, DONOR_RECEIPT};
use crate::money::{amount_to_words, format_eur};
use crate::util::format_date_de;
use crate::{Config, Error, Result};

/// Donation slots on the receipt form.
pub const MAX_DONATIONS: usize = 26;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum ReceiptFormat {
    #[default]
    Csv,
    Pdf,
    Encrypted,
    Mail,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ExportOptions {
    /// Set `receipt_date` on every exported donation.
    pub mark: bool,
    /// Upload each pdf to the WebDAV share before marking.
    pub backup: bool,
}

/// Ordered field map of one receipt, keyed by the form field names.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReceiptData {
    fields: Vec<(String, String)>,
}

impl ReceiptData {
    fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(_, v)| v.as_str())
    }
}

fn country_name(code: &str) -> &str {
    match code {
        "DE" => "Deutschland",
        "AT" => "Österreich",
        "CH" => "Schweiz",
        "LU" => "Luxemburg",
        "FR" => "Frankreich",
        "NL" => "Niederlande",
        "BE" => "Belgien",
        _ => code,
    }
}

fn address_name(donor: &Donor) -> String {
    if donor.company_name.is_empty() {
        return donor.full_name();
    }
    if donor.last_name.is_empty() {
        return donor.company_name.clone();
    }
    format!("{}\nz.Hd. {}", donor.company_name, donor.full_name())
}

/// Received donations of the donor in the year, oldest first. The year is
/// taken in the site zone.
pub fn receipt_donations(
    db: &Database,
    config: &Config,
    donor: Id,
    year: i32,
) -> Result<Vec<Donation>> {
    let tz = config.site.timezone;
    let mut donations: Vec<Donation> = donations_of(db, donor)?
        .into_iter()
        .filter(|d| {
            d.received_timestamp
                .map(|ts| ts.with_timezone(&tz).year() == year)
                .unwrap_or(false)
        })
        .collect();
    donations.sort_by_key(|d| (d.received_timestamp, d.id));
    Ok(donations)
}

/// Computes the receipt fields. Invalid donors and years with more
/// donations than the form has slots are refused.
pub fn receipt_data(
    config: &Config,
    donor: &Donor,
    donations: &[Donation],
    year: i32,
    now: DateTime<Utc>,
) -> Result<ReceiptData> {
    if donor.invalid {
        return Err(Error::precondition(format!(
            "donor {} has an invalid address",
            donor.id
        )));
    }
    if donations.is_empty() {
        return Err(Error::precondition(format!(
            "donor {} has no donations in {year}",
            donor.id
        )));
    }
    if donations.len() > MAX_DONATIONS {
        return Err(Error::precondition(format!(
            "donor {} has {} donations in {year}, at most {MAX_DONATIONS} fit",
            donor.id,
            donations.len()
        )));
    }

    let tz = config.site.timezone;
    let total: Decimal = donations.iter().map(|d| d.amount).sum();
    let account = if donor.user.is_some() {
        "Ihre Spendenübersicht können Sie in Ihrem Nutzerkonto unter „Ihre Spenden“ einsehen."
    } else {
        "Ihre Spendenübersicht finden Sie auch in einem Nutzerkonto. Melden Sie sich bei uns, falls Sie noch nicht registriert sind."
    };

    let mut data = ReceiptData::default();
    data.insert("Adressname", address_name(donor));
    data.insert("Spendenname", donor.display_name());
    data.insert("Vorname", donor.first_name.as_str());
    data.insert("Nachname", donor.last_name.as_str());
    data.insert("Firma", donor.company_name.as_str());
    data.insert("Strasse", donor.address.as_str());
    data.insert("PLZ", donor.postcode.as_str());
    data.insert("Ort", donor.city.as_str());
    data.insert("Land", country_name(&donor.country));
    data.insert("Anrede", donor.salutation.label());
    data.insert("Briefanrede", donor.letter_salutation());
    data.insert("Jahressumme", format_eur(total));
    data.insert("JahressummeInWorten", amount_to_words(total));
    data.insert("Datum", format_date_de(now, tz));
    data.insert("Jahr", year.to_string());
    data.insert("NutzerKonto", account);
    data.insert(
        "BereitsAusgestellt",
        if donations.iter().any(|d| d.receipt_date.is_some()) {
            "Ja"
        } else {
            "Nein"
        },
    );

    for i in 1..=MAX_DONATIONS {
        match donations.get(i - 1) {
            Some(donation) => {
                let date = donation
                    .received_timestamp
                    .map(|ts| format_date_de(ts, tz))
                    .unwrap_or_default();
                data.insert(format!("Datum{i}"), date);
                data.insert(format!("Betrag{i}"), format_eur(donation.amount));
                data.insert(format!("Zuwendung{i}"), "Geldzuwendung");
                data.insert(format!("Verzicht{i}"), "Nein");
            }
            None => {
                for key in ["Datum", "Betrag", "Zuwendung", "Verzicht"] {
                    data.insert(format!("{key}{i}"), "");
                }
            }
        }
    }
    Ok(data)
}

struct ReceiptRow {
    date: String,
    amount: String,
    kind: String,
    waiver: String,
}

#[derive(Template)]
#[template(path = "receipt/jzwb.html")]
struct ReceiptPage<'a> {
    site_name: &'a str,
    year: i32,
    address: String,
    donor_line: String,
    date: &'a str,
    total: &'a str,
    total_words: &'a str,
    letter_salutation: &'a str,
    account_note: &'a str,
    already_issued: bool,
    rows: Vec<ReceiptRow>,
}

pub fn render_receipt_html(config: &Config, data: &ReceiptData, year: i32) -> Result<String> {
    let field = |key: &str| data.get(key).unwrap_or_default();
    let address = [
        field("Adressname").to_string(),
        field("Strasse").to_string(),
        format!("{} {}", field("PLZ"), field("Ort")).trim().to_string(),
        field("Land").to_string(),
    ]
    .into_iter()
    .filter(|line| !line.is_empty())
    .collect::<Vec<_>>()
    .join("\n");
    let donor_line = [
        field("Spendenname"),
        field("Strasse"),
        &format!("{} {}", field("PLZ"), field("Ort")),
    ]
    .iter()
    .map(|s| s.trim())
    .filter(|s| !s.is_empty())
    .collect::<Vec<_>>()
    .join(", ");

    let rows = (1..=MAX_DONATIONS)
        .filter(|i| !field(&format!("Datum{i}")).is_empty())
        .map(|i| ReceiptRow {
            date: field(&format!("Datum{i}")).to_string(),
            amount: field(&format!("Betrag{i}")).to_string(),
            kind: field(&format!("Zuwendung{i}")).to_string(),
            waiver: field(&format!("Verzicht{i}")).to_string(),
        })
        .collect();

    let page = ReceiptPage {
        site_name: &config.site.name,
        year,
        address,
        donor_line,
        date: field("Datum"),
        total: field("Jahressumme"),
        total_words: field("JahressummeInWorten"),
        letter_salutation: field("Briefanrede"),
        account_note: field("NutzerKonto"),
        already_issued: field("BereitsAusgestellt") == "Ja",
        rows,
    };
    Ok(page.render()?)
}

/// Donors getting a receipt for the year: the given ids, or every donor
/// asking for receipts with received donations in that year.
pub fn receipt_donors(
    db: &Database,
    config: &Config,
    year: i32,
    ids: &[Id],
) -> Result<Vec<Donor>> {
    if !ids.is_empty() {
        return ids.iter().map(|id| db.get::<Donor>(*id)).collect();
    }
    let mut donors = vec![];
    for donor in db.filter::<Donor, _>(|d| d.receipt && !d.invalid)? {
        if !receipt_donations(db, config, donor.id, year)?.is_empty() {
            donors.push(donor);
        }
    }
    donors.sort_by_key(|d| d.id);
    Ok(donors)
}

fn mark_receipted(db: &Database, donations: &[Donation], now: DateTime<Utc>) -> Result<()> {
    let mut changes = Changeset::new();
    for donation in donations {
        let mut donation = donation.clone();
        donation.receipt_date = Some(now);
        changes.set(&donation)?;
    }
    db.apply(changes)
}

/// Backup and marking after a pdf went out. A failed backup leaves the
/// donations unmarked.
async fn finish_pdf(
    app: &App,
    donor: &Donor,
    donations: &[Donation],
    year: i32,
    pdf: &[u8],
    options: ExportOptions,
) -> Result<()> {
    if options.backup {
        backup::upload(
            &app.http,
            &app.config.receipts,
            &backup::receipt_filename(donor.id, year),
            pdf.to_vec(),
        )
        .await?;
    }
    if options.mark {
        mark_receipted(&app.db, donations, Utc::now())?;
    }
    Ok(())
}

/// One csv row per donor, columns as in [`ReceiptData`].
pub fn export_receipts_csv(
    app: &App,
    donors: &[Donor],
    year: i32,
    options: ExportOptions,
) -> Result<Vec<u8>> {
    let now = Utc::now();
    let mut writer = csv::Writer::from_writer(vec![]);
    let mut header_written = false;
    let mut exported = vec![];
    for donor in donors {
        let donations = receipt_donations(&app.db, &app.config, donor.id, year)?;
        let data = receipt_data(&app.config, donor, &donations, year, now)?;
        if !header_written {
            writer.write_record(data.keys())?;
            header_written = true;
        }
        writer.write_record(data.values())?;
        exported.extend(donations);
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| Error::new(e.into_error().into()))?;

    if options.mark {
        mark_receipted(&app.db, &exported, now)?;
    }
    tracing::info!(year, donors = donors.len(), "exported receipt csv");
    Ok(bytes)
}

async fn receipt_pdf(app: &App, donor: &Donor, year: i32) -> Result<(Vec<Donation>, Vec<u8>)> {
    let donations = receipt_donations(&app.db, &app.config, donor.id, year)?;
    let data = receipt_data(&app.config, donor, &donations, year, Utc::now())?;
    let html = render_receipt_html(&app.config, &data, year)?;
    let pdf = app.pdf.render(&html).await?;
    Ok((donations, pdf))
}

/// Pdf for a single donor, a zip of pdfs for several. Returns file name and
/// content.
pub async fn export_receipts_pdf(
    app: &App,
    donors: &[Donor],
    year: i32,
    options: ExportOptions,
) -> Result<(String, Vec<u8>)> {
    if let [donor] = donors {
        let (donations, pdf) = receipt_pdf(app, donor, year).await?;
        finish_pdf(app, donor, &donations, year, &pdf, options).await?;
        return Ok((backup::receipt_filename(donor.id, year), pdf));
    }

    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(vec![]));
    let file_options = zip::write::SimpleFileOptions::default();
    let mut rendered = Vec::with_capacity(donors.len());
    for donor in donors {
        let (donations, pdf) = receipt_pdf(app, donor, year).await?;
        zip.start_file(backup::receipt_filename(donor.id, year), file_options)?;
        zip.write_all(&pdf)?;
        rendered.push((donor, donations, pdf));
    }
    let bytes = zip.finish()?.into_inner();

    // Only a complete batch gets backed up and marked.
    for (donor, donations, pdf) in &rendered {
        finish_pdf(app, donor, donations, year, pdf, options).await?;
    }
    tracing::info!(year, donors = donors.len(), "exported receipt pdfs");
    Ok((format!("jzwb-{year}.zip"), bytes))
}

/// Pdf encrypted with the donor's postcode.
pub async fn export_receipt_encrypted_pdf(
    app: &App,
    donor: &Donor,
    year: i32,
    options: ExportOptions,
) -> Result<Vec<u8>> {
    let (donations, pdf, encrypted) = encrypted_receipt_pdf(app, donor, year).await?;
    finish_pdf(app, donor, &donations, year, &pdf, options).await?;
    Ok(encrypted)
}

/// Plain and encrypted pdf of one donor. The postcode is the password.
async fn encrypted_receipt_pdf(
    app: &App,
    donor: &Donor,
    year: i32,
) -> Result<(Vec<Donation>, Vec<u8>, Vec<u8>)> {
    let password = donor.postcode.trim();
    if password.is_empty() {
        return Err(Error::precondition(format!(
            "donor {} has no postcode to encrypt with",
            donor.id
        )));
    }
    let (donations, pdf) = receipt_pdf(app, donor, year).await?;
    let encrypted = app.pdf.encrypt(&pdf, password).await?;
    Ok((donations, pdf, encrypted))
}

/// Mails the encrypted receipt to the donor.
pub async fn send_receipt_mailing(
    app: &App,
    donor: &Donor,
    year: i32,
    options: ExportOptions,
) -> Result<()> {
    if !donor.has_confirmed_email() {
        return Err(Error::precondition(format!(
            "donor {} has no confirmed email",
            donor.id
        )));
    }
    let (donations, pdf, encrypted) = encrypted_receipt_pdf(app, donor, year).await?;

    let mut context = donor_context(donor);
    context.insert("year".into(), year.into());
    let options_mail = SendOptions {
        attachments: vec![Attachment {
            filename: format!("jzwb-fds-{year}.pdf"),
            content_type: "application/pdf".to_string(),
            body: encrypted,
        }],
        ..Default::default()
    };
    send_intent_with(app, DONOR_RECEIPT, &Recipient::from_donor(donor), context, options_mail).await?;

    finish_pdf(app, donor, &donations, year, &pdf, options).await
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailingReport {
    pub sent: usize,
    /// Donors without confirmed email or postcode.
    pub skipped: Vec<Id>,
}

/// Mails receipts to every eligible donor of the list.
pub async fn send_receipt_mailings(
    app: &App,
    donors: &[Donor],
    year: i32,
    options: ExportOptions,
) -> Result<MailingReport> {
    let mut report = MailingReport::default();
    for donor in donors {
        if !donor.has_confirmed_email() || donor.postcode.trim().is_empty() {
            tracing::debug!(donor = donor.id, "no receipt mail, missing email or postcode");
            report.skipped.push(donor.id);
            continue;
        }
        send_receipt_mailing(app, donor, year, options).await?;
        report.sent += 1;
    }
    tracing::info!(year, sent = report.sent, skipped = report.skipped.len(), "sent receipt mails");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::donation::Salutation;
    use crate::receipt::pdf::PdfRenderer;

    fn donor(db: &Database) -> Donor {
        let donor = Donor {
            salutation: Salutation::Female,
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            address: "Musterstraße 1".to_string(),
            postcode: "12345".to_string(),
            city: "Berlin".to_string(),
            email: "jane@example.org".to_string(),
            email_confirmed: Some(Utc::now()),
            receipt: true,
            ..Donor::new(db).unwrap()
        };
        db.set(&donor).unwrap();
        donor
    }

    fn donation(db: &Database, donor: Id, amount: Decimal, received: DateTime<Utc>) -> Donation {
        let donation = Donation {
            amount,
            completed: true,
            received_timestamp: Some(received),
            ..Donation::new(db, donor).unwrap()
        };
        db.set(&donation).unwrap();
        donation
    }

    #[test]
    fn fills_slots_and_totals() {
        let db = Database::temporary().unwrap();
        let config = Config::default();
        let donor = donor(&db);
        donation(&db, donor.id, dec!(10.00), Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap());
        donation(&db, donor.id, dec!(15.50), Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
        donation(&db, donor.id, dec!(99.00), Utc.with_ymd_and_hms(2023, 3, 1, 10, 0, 0).unwrap());

        let donations = receipt_donations(&db, &config, donor.id, 2024).unwrap();
        let data = receipt_data(&config, &donor, &donations, 2024, Utc::now()).unwrap();
        assert_eq!(data.get("Jahressumme"), Some("25,50 €"));
        assert_eq!(
            data.get("JahressummeInWorten"),
            Some("- fünfundzwanzig Euro und fünfzig Cent -")
        );
        assert_eq!(data.get("Datum1"), Some("01.02.2024"));
        assert_eq!(data.get("Betrag2"), Some("15,50 €"));
        assert_eq!(data.get("Zuwendung2"), Some("Geldzuwendung"));
        assert_eq!(data.get("Datum3"), Some(""));
        assert_eq!(data.get("Briefanrede"), Some("Sehr geehrte Frau Doe"));
        assert_eq!(data.get("Land"), Some("Deutschland"));
        assert_eq!(data.get("BereitsAusgestellt"), Some("Nein"));
        assert_eq!(data.keys().filter(|k| k.starts_with("Verzicht")).count(), MAX_DONATIONS);

        let html = render_receipt_html(&config, &data, 2024).unwrap();
        assert!(html.contains("15,50 €"));
        assert!(html.contains("Musterstraße 1"));
    }

    #[test]
    fn refuses_invalid_donor_and_overflow() {
        let db = Database::temporary().unwrap();
        let config = Config::default();
        let mut donor = donor(&db);
        let received = Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap();
        let donations: Vec<Donation> = (0..27)
            .map(|_| donation(&db, donor.id, dec!(1), received))
            .collect();
        assert!(receipt_data(&config, &donor, &donations, 2024, Utc::now()).is_err());

        donor.invalid = true;
        let err = receipt_data(&config, &donor, &donations[..2], 2024, Utc::now()).unwrap_err();
        assert!(matches!(err.kind, crate::ErrorKind::Precondition(_)));
    }

    #[test]
    fn company_address_names_contact() {
        let donor = Donor {
            company_name: "ACME GmbH".to_string(),
            first_name: "Max".to_string(),
            last_name: "Muster".to_string(),
            ..Default::default()
        };
        assert_eq!(address_name(&donor), "ACME GmbH\nz.Hd. Max Muster");
    }

    #[tokio::test]
    async fn csv_export_marks_donations() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let donor = donor(&app.db);
        let received = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let donation = donation(&app.db, donor.id, dec!(10), received);

        let options = ExportOptions {
            mark: true,
            backup: false,
        };
        let csv = export_receipts_csv(&app, &[donor.clone()], 2024, options).unwrap();
        let csv = String::from_utf8(csv).unwrap();
        assert!(csv.starts_with("Adressname,Spendenname,"));
        assert!(csv.contains("Jane Doe"));

        let donation: Donation = app.db.get(donation.id).unwrap();
        assert!(donation.receipt_date.is_some());
    }

    #[tokio::test]
    async fn encrypted_pdf_needs_postcode() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let mut donor = donor(&app.db);
        donation(&app.db, donor.id, dec!(10), Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        let encrypted = export_receipt_encrypted_pdf(&app, &donor, 2024, ExportOptions::default())
            .await
            .unwrap();
        assert!(encrypted.starts_with(b"encrypted:12345\n"));

        donor.postcode.clear();
        assert!(
            export_receipt_encrypted_pdf(&app, &donor, 2024, ExportOptions::default())
                .await
                .is_err()
        );
    }
    #[tokio::test]
    async fn zip_export_marks_nothing_when_a_donor_fails() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let received = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let first = donor(&app.db);
        let first_donation = donation(&app.db, first.id, dec!(10), received);
        let second = Donor {
            invalid: true,
            ..donor(&app.db)
        };
        app.db.set(&second).unwrap();
        donation(&app.db, second.id, dec!(20), received);

        let options = ExportOptions {
            mark: true,
            backup: false,
        };
        assert!(export_receipts_pdf(&app, &[first.clone(), second], 2024, options)
            .await
            .is_err());
        let stored: Donation = app.db.get(first_donation.id).unwrap();
        assert!(stored.receipt_date.is_none());
    }

    #[tokio::test]
    async fn zip_export_packs_and_marks_every_donor() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let received = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let first = donor(&app.db);
        let second = donor(&app.db);
        let a = donation(&app.db, first.id, dec!(10), received);
        let b = donation(&app.db, second.id, dec!(20), received);

        let options = ExportOptions {
            mark: true,
            backup: false,
        };
        let (name, bytes) = export_receipts_pdf(&app, &[first.clone(), second.clone()], 2024, options)
            .await
            .unwrap();
        assert_eq!(name, "jzwb-2024.zip");
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        for id in [a.id, b.id] {
            let stored: Donation = app.db.get(id).unwrap();
            assert!(stored.receipt_date.is_some());
        }
    }

    struct CountingRenderer(std::sync::atomic::AtomicUsize);

    #[async_trait::async_trait]
    impl PdfRenderer for CountingRenderer {
        async fn render(&self, html: &str) -> Result<Vec<u8>> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(html.as_bytes().to_vec())
        }

        async fn encrypt(&self, pdf: &[u8], _password: &str) -> Result<Vec<u8>> {
            Ok(pdf.to_vec())
        }
    }

    #[tokio::test]
    async fn receipt_mail_renders_once() {
        let renderer = std::sync::Arc::new(CountingRenderer(Default::default()));
        let (app, transport) = App::in_memory(Config::default()).unwrap();
        let app = app.with_pdf(renderer.clone());
        let donor = donor(&app.db);
        let donation = donation(&app.db, donor.id, dec!(10), Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());

        let options = ExportOptions {
            mark: true,
            backup: false,
        };
        send_receipt_mailing(&app, &donor, 2024, options).await.unwrap();
        assert_eq!(renderer.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(transport.sent_to("jane@example.org").len(), 1);
        let stored: Donation = app.db.get(donation.id).unwrap();
        assert!(stored.receipt_date.is_some());
    }
}
