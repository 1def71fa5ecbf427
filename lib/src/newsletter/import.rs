//! Subscriber import from CSV.
//!
//! Columns: `email`, optionally `name` or `first_name` and `last_name`, and
//! `tags` as a comma separated list. Rows are subscribed one at a time, an
//! invalid row is reported and skipped.

use crate::app::App;
use crate::email::is_valid_address;
use crate::Result;

use super::subscribe::{subscribe, SubscribeOptions, SubscriptionResult};
use super::Newsletter;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Row {
    email: String,
    name: String,
    first_name: String,
    last_name: String,
    tags: String,
}

impl Row {
    fn name(&self) -> String {
        if !self.name.trim().is_empty() {
            return self.name.trim().to_string();
        }
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }

    fn tags(&self) -> Vec<String> {
        self.tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub rows: usize,
    pub subscribed: usize,
    pub confirm: usize,
    pub already: usize,
    /// Line numbers (1-based, header excluded) of rejected rows.
    pub invalid: Vec<usize>,
}

pub async fn import_subscribers(
    app: &App,
    newsletter: &Newsletter,
    data: &[u8],
    email_confirmed: bool,
    reference: &str,
) -> Result<ImportReport> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(data);

    let mut report = ImportReport::default();
    for (i, row) in reader.deserialize::<Row>().enumerate() {
        report.rows += 1;
        let row = match row {
            Ok(row) if is_valid_address(row.email.trim()) => row,
            Ok(row) => {
                tracing::debug!(line = i + 1, email = %row.email, "skipping invalid address");
                report.invalid.push(i + 1);
                continue;
            }
            Err(e) => {
                tracing::debug!(line = i + 1, "skipping malformed row: {e}");
                report.invalid.push(i + 1);
                continue;
            }
        };
        let options = SubscribeOptions {
            name: row.name(),
            reference: reference.to_string(),
            email_confirmed,
            tags: row.tags(),
            ..Default::default()
        };
        let (result, _) = subscribe(app, newsletter, &row.email, options).await?;
        match result {
            SubscriptionResult::Subscribed => report.subscribed += 1,
            SubscriptionResult::Confirm => report.confirm += 1,
            SubscriptionResult::AlreadySubscribed => report.already += 1,
        }
    }
    tracing::info!(
        newsletter = %newsletter.slug,
        rows = report.rows,
        subscribed = report.subscribed,
        confirm = report.confirm,
        "imported subscribers"
    );
    Ok(report)
}
