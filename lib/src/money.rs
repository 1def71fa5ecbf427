//! Money helpers. All amounts are EUR held as `Decimal` with two places.

use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::{Error, Result};

pub type Amount = Decimal;

/// Rounds to cents, half away from zero.
pub fn cents(amount: Amount) -> Amount {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Parses amounts as they appear in bank and PayPal exports, accepting both
/// `1.234,56` and `1234.56`, with or without currency markers.
pub fn parse_amount(input: &str) -> Result<Amount> {
    let cleaned: String = input
        .trim()
        .trim_end_matches("EUR")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '€' && *c != '\u{a0}')
        .collect();
    if cleaned.is_empty() {
        return Err(Error::bad_input("empty amount"));
    }
    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };
    let amount = Decimal::from_str(&normalized)
        .map_err(|e| Error::bad_input(format!("invalid amount {input:?}: {e}")))?;
    Ok(cents(amount))
}

/// `10,00`
pub fn format_amount(amount: Amount) -> String {
    format!("{:.2}", cents(amount)).replace('.', ",")
}

/// `10,00 €`, the form used on receipts.
pub fn format_eur(amount: Amount) -> String {
    format!("{} €", format_amount(amount))
}

const ONES: [&str; 20] = [
    "null", "eins", "zwei", "drei", "vier", "fünf", "sechs", "sieben", "acht", "neun", "zehn",
    "elf", "zwölf", "dreizehn", "vierzehn", "fünfzehn", "sechzehn", "siebzehn", "achtzehn",
    "neunzehn",
];

const TENS: [&str; 10] = [
    "", "", "zwanzig", "dreißig", "vierzig", "fünfzig", "sechzig", "siebzig", "achtzig",
    "neunzig",
];

fn below_hundred(n: u64, compound: bool) -> String {
    match n {
        1 if compound => "ein".to_string(),
        0..=19 => ONES[n as usize].to_string(),
        _ => {
            let (ten, unit) = (n / 10, n % 10);
            match unit {
                0 => TENS[ten as usize].to_string(),
                1 => format!("einund{}", TENS[ten as usize]),
                _ => format!("{}und{}", ONES[unit as usize], TENS[ten as usize]),
            }
        }
    }
}

fn below_thousand(n: u64, compound: bool) -> String {
    let (hundreds, rest) = (n / 100, n % 100);
    let mut out = String::new();
    if hundreds > 0 {
        out.push_str(if hundreds == 1 {
            "ein"
        } else {
            ONES[hundreds as usize]
        });
        out.push_str("hundert");
    }
    if rest > 0 {
        out.push_str(&below_hundred(rest, compound));
    }
    out
}

/// Cardinal number in German words, e.g. `einhunderteinundzwanzig`.
pub fn number_to_words(n: u64) -> String {
    if n == 0 {
        return ONES[0].to_string();
    }
    let millions = n / 1_000_000;
    let thousands = (n / 1000) % 1000;
    let rest = n % 1000;

    let mut parts = vec![];
    if millions == 1 {
        parts.push("eine Million".to_string());
    } else if millions > 1 {
        parts.push(format!("{} Millionen", below_thousand(millions, true)));
    }

    let mut tail = String::new();
    if thousands > 0 {
        tail.push_str(&below_thousand(thousands, true));
        tail.push_str("tausend");
    }
    if rest > 0 {
        tail.push_str(&below_thousand(rest, false));
    }
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts.join(" ")
}

fn unit_words(n: u64) -> String {
    if n == 1 {
        "ein".to_string()
    } else {
        number_to_words(n)
    }
}

/// Amount spelled out for receipts: `- zehn Euro und fünfzig Cent -`.
pub fn amount_to_words(amount: Amount) -> String {
    let amount = cents(amount.abs());
    let euros = amount.trunc();
    let cent = ((amount - euros) * Decimal::ONE_HUNDRED).to_u64().unwrap_or(0);
    let euro_words = unit_words(euros.to_u64().unwrap_or(0));
    if cent > 0 {
        format!("- {} Euro und {} Cent -", euro_words, unit_words(cent))
    } else {
        format!("- {} Euro -", euro_words)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn parses_export_formats() {
        assert_eq!(parse_amount("1.234,56").unwrap(), dec!(1234.56));
        assert_eq!(parse_amount("10,5").unwrap(), dec!(10.50));
        assert_eq!(parse_amount("25.00").unwrap(), dec!(25.00));
        assert_eq!(parse_amount("-5,00 €").unwrap(), dec!(-5.00));
        assert_eq!(parse_amount("30 EUR").unwrap(), dec!(30));
        assert!(parse_amount("").is_err());
        assert!(parse_amount("zehn").is_err());
    }

    #[test]
    fn formats_with_comma() {
        assert_eq!(format_eur(dec!(25)), "25,00 €");
        assert_eq!(format_eur(dec!(1234.5)), "1234,50 €");
    }

    #[test]
    fn number_words() {
        assert_eq!(number_to_words(0), "null");
        assert_eq!(number_to_words(1), "eins");
        assert_eq!(number_to_words(21), "einundzwanzig");
        assert_eq!(number_to_words(35), "fünfunddreißig");
        assert_eq!(number_to_words(100), "einhundert");
        assert_eq!(number_to_words(101), "einhunderteins");
        assert_eq!(number_to_words(1000), "eintausend");
        assert_eq!(number_to_words(2512), "zweitausendfünfhundertzwölf");
        assert_eq!(number_to_words(1_000_001), "eine Million eins");
        assert_eq!(number_to_words(3_200_000), "drei Millionen zweihunderttausend");
    }

    #[test]
    fn amount_words() {
        assert_eq!(amount_to_words(dec!(25.00)), "- fünfundzwanzig Euro -");
        assert_eq!(amount_to_words(dec!(10.50)), "- zehn Euro und fünfzig Cent -");
        assert_eq!(amount_to_words(dec!(1.01)), "- ein Euro und ein Cent -");
    }
}
