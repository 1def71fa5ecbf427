//! Small helpers shared across modules: calendar arithmetic, date parsing
//! for imports and random tokens.

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::{Error, Result};

/// Adds calendar months, clamping to the last day of shorter months.
pub fn add_months(dt: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    dt.checked_add_months(Months::new(months)).unwrap_or(dt)
}

pub fn sub_months(dt: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    dt.checked_sub_months(Months::new(months)).unwrap_or(dt)
}

/// Interprets a naive wall-clock time in the given zone and converts it to
/// UTC. Ambiguous times (DST fold) resolve to the earlier instant, skipped
/// times fall back to reading the value as UTC.
pub fn localize(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive).earliest() {
        Some(local) => local.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&naive),
    }
}

pub fn localize_date(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    localize(date.and_time(NaiveTime::MIN), tz)
}

/// Parses the date formats found in bank and PayPal exports.
pub fn parse_date(input: &str) -> Result<NaiveDate> {
    let input = input.trim();
    for format in ["%d.%m.%Y", "%Y-%m-%d", "%d.%m.%y", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(input, format) {
            return Ok(date);
        }
    }
    // Spreadsheet cells sometimes carry a time component.
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d.%m.%Y %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, format) {
            return Ok(dt.date());
        }
    }
    Err(Error::bad_input(format!("unrecognized date: {input:?}")))
}

pub fn parse_time(input: &str) -> Result<NaiveTime> {
    let input = input.trim();
    NaiveTime::parse_from_str(input, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(input, "%H:%M"))
        .map_err(|_| Error::bad_input(format!("unrecognized time: {input:?}")))
}

/// Converts an excel serial date (days since 1899-12-30) to a date.
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
    base.checked_add_signed(chrono::Duration::days(serial.floor() as i64))
}

/// `dd.mm.yyyy` in the site zone.
pub fn format_date_de(dt: DateTime<Utc>, tz: Tz) -> String {
    dt.with_timezone(&tz).format("%d.%m.%Y").to_string()
}

pub fn first_of_month(dt: DateTime<Utc>) -> DateTime<Utc> {
    let date = NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1).unwrap_or(dt.date_naive());
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Random alphanumeric string, used for activation codes.
pub fn random_code(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Random string over the given alphabet.
pub fn random_token(len: usize, alphabet: &[u8]) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_months_clamps_to_month_end() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        assert_eq!(
            add_months(dt, 1),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn german_and_iso_dates_parse() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(parse_date("05.03.2024").unwrap(), expected);
        assert_eq!(parse_date("2024-03-05").unwrap(), expected);
        assert_eq!(parse_date(" 2024-03-05 00:00:00 ").unwrap(), expected);
        assert!(parse_date("5th of March").is_err());
    }

    #[test]
    fn localize_date_uses_berlin_midnight() {
        let date = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        let utc = localize_date(date, chrono_tz::Europe::Berlin);
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 6, 30, 22, 0, 0).unwrap());
    }

    #[test]
    fn excel_serials() {
        assert_eq!(
            excel_serial_to_date(45292.0),
            NaiveDate::from_ymd_opt(2024, 1, 1)
        );
    }

    #[test]
    fn tokens_use_alphabet() {
        let token = random_token(12, b"ab");
        assert_eq!(token.len(), 12);
        assert!(token.chars().all(|c| c == 'a' || c == 'b'));
    }
}
