//! Bodies of the scheduled jobs. The worker only knows the schedule and
//! calls [`run`].

use chrono::{DateTime, Utc};
use strum::IntoEnumIterator;
use tracing::Instrument;

use crate::app::App;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Job {
    RemindOpenTransfers,
    CleanupDonations,
    CleanupSubscribers,
    AnonymizeFeedback,
    GatherTags,
    WeeklyDigest,
    Onboarding,
    IngestPixels,
    SweepLateRecurrences,
    SendDueMailings,
}

impl Job {
    /// Cron expression with seconds, evaluated in the site timezone.
    pub fn schedule(&self) -> &'static str {
        match self {
            Job::RemindOpenTransfers => "0 0 9 15 * *",
            Job::CleanupDonations => "0 30 3 * * *",
            Job::CleanupSubscribers => "0 0 4 * * *",
            Job::AnonymizeFeedback => "0 0 * * * *",
            Job::GatherTags => "0 0 2 * * *",
            Job::WeeklyDigest => "0 0 8 * * Mon",
            Job::Onboarding => "0 0 10 * * *",
            Job::IngestPixels => "0 */10 * * * *",
            Job::SweepLateRecurrences => "0 0 6 * * *",
            Job::SendDueMailings => "0 * * * * *",
        }
    }

    pub fn all() -> Vec<Job> {
        Job::iter().collect()
    }
}

/// Runs a job once. Returns a count of what the job touched.
pub async fn run(app: &App, job: Job, now: DateTime<Utc>) -> Result<usize> {
    let span = tracing::info_span!("job", name = %job);
    async move {
        let count = run_job(app, job, now).await?;
        tracing::debug!(count, "job finished");
        Ok(count)
    }
    .instrument(span)
    .await
}

async fn run_job(app: &App, job: Job, now: DateTime<Utc>) -> Result<usize> {
    Ok(match job {
        Job::RemindOpenTransfers => remind_open_transfers(app, now).await?,
        Job::CleanupDonations => cleanup_donations(app, now)?,
        Job::CleanupSubscribers => cleanup_subscribers(app, now)?,
        Job::AnonymizeFeedback => anonymize_feedback(app, now)?,
        Job::GatherTags => gather_tags(app, now)?,
        Job::WeeklyDigest => send_weekly_digest(app, now).await?,
        Job::Onboarding => onboarding_tick(app, now).await?,
        Job::IngestPixels => ingest_pixels(app)?,
        Job::SweepLateRecurrences => sweep_late_recurrences(app, now).await?,
        Job::SendDueMailings => send_due_mailings(app, now).await?,
    })
}

pub async fn remind_open_transfers(app: &App, now: DateTime<Utc>) -> Result<usize> {
    crate::donation::mails::remind_open_transfers(app, now).await
}

pub fn cleanup_donations(app: &App, now: DateTime<Utc>) -> Result<usize> {
    let report = crate::donation::maintenance::cleanup_donations(&app.db, now)?;
    Ok(report.incomplete + report.unreceived + report.donors)
}

pub fn cleanup_subscribers(app: &App, now: DateTime<Utc>) -> Result<usize> {
    let report = crate::newsletter::maintenance::cleanup_subscribers(&app.db, &app.config, now)?;
    Ok(report.purged + report.anonymized)
}

pub fn anonymize_feedback(app: &App, now: DateTime<Utc>) -> Result<usize> {
    crate::newsletter::maintenance::anonymize_feedback(&app.db, now)
}

pub fn gather_tags(app: &App, now: DateTime<Utc>) -> Result<usize> {
    crate::newsletter::tags::gather_tags(&app.db, now)
}

pub async fn send_weekly_digest(app: &App, now: DateTime<Utc>) -> Result<usize> {
    let digest = crate::newsletter::analytics::send_weekly_digest(app, now).await?;
    Ok(digest.newsletters.len())
}

pub async fn onboarding_tick(app: &App, now: DateTime<Utc>) -> Result<usize> {
    crate::newsletter::onboarding::onboarding_tick(app, now).await
}

/// Pixel logs are optional; without a configured log there is nothing to
/// read.
pub fn ingest_pixels(app: &App) -> Result<usize> {
    if app.config.mailing.pixel_log.is_empty() {
        return Ok(0);
    }
    Ok(crate::mailing::pixel_log::ingest(app)? as usize)
}

pub async fn sweep_late_recurrences(app: &App, now: DateTime<Utc>) -> Result<usize> {
    crate::donation::recurrence::sweep_late_recurrences(app, now).await
}

pub async fn send_due_mailings(app: &App, now: DateTime<Utc>) -> Result<usize> {
    Ok(crate::mailing::send::send_due_mailings(app, now).await?.len())
}
