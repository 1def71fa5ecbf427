//! Onboarding mail a few days after subscribing.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};

use crate::app::App;
use crate::mailing::intent::{send_intent, Recipient};
use crate::Result;

use super::{Newsletter, Subscriber};

/// Subscription dates served by a tick on `today`. Sundays serve nobody,
/// so Saturdays also take the cohort Sunday would have had.
pub fn cohort_dates(today: NaiveDate, lag_days: i64) -> Vec<NaiveDate> {
    match today.weekday() {
        Weekday::Sun => vec![],
        Weekday::Sat => vec![
            today - Duration::days(lag_days),
            today - Duration::days(lag_days - 1),
        ],
        _ => vec![today - Duration::days(lag_days)],
    }
}

/// Daily tick. Returns the number of onboarding mails sent.
pub async fn onboarding_tick(app: &App, now: DateTime<Utc>) -> Result<usize> {
    let tz = app.config.site.timezone;
    let dates = cohort_dates(now.with_timezone(&tz).date_naive(), app.config.onboarding.lag_days);
    if dates.is_empty() {
        tracing::debug!("no onboarding on sundays");
        return Ok(0);
    }

    let mut sent = 0;
    for newsletter in app.db.get_collection::<Newsletter>()? {
        let Some(intent) = newsletter.onboarding_intent.clone().filter(|i| !i.is_empty()) else {
            continue;
        };
        let cohort = app.db.filter::<Subscriber, _>(|s| {
            s.newsletter == newsletter.id
                && s.onboarded.is_none()
                && s.subscribed
                    .map(|d| dates.contains(&d.with_timezone(&tz).date_naive()))
                    .unwrap_or(false)
        })?;
        for mut subscriber in cohort {
            let context = subscriber.email_context(&app.db, &app.config, &newsletter)?;
            let recipient = Recipient::from_subscriber(&app.db, &subscriber)?;
            if let Err(e) = send_intent(app, &intent, &recipient, context).await {
                tracing::warn!(subscriber = subscriber.id, "onboarding mail failed: {e}");
                continue;
            }
            subscriber.onboarded = Some(now);
            app.db.set(&subscriber)?;
            sent += 1;
        }
    }
    tracing::info!(sent, "onboarding tick");
    Ok(sent)
}
