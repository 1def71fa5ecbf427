use std::str::FromStr;

use anyhow::Result;
use chrono::Utc;
use clap::{Arg, ArgMatches, Command};
use strum::IntoEnumIterator;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tokio_util::sync::CancellationToken;

use donorbase::tasks::{self, Job};
use donorbase::App;

pub fn cmd() -> Command {
    Command::new("worker")
        .about("Run the scheduled jobs")
        .display_order(15)
        .arg(
            Arg::new("once")
                .long("once")
                .value_name("JOB")
                .value_parser(Job::iter().map(|j| j.to_string()).collect::<Vec<_>>())
                .help("Run a single job now and exit"),
        )
}

pub async fn run(matches: &ArgMatches, app: App, cancel: CancellationToken) -> Result<()> {
    if let Some(name) = matches.get_one::<String>("once") {
        let job = Job::from_str(name)?;
        let count = tasks::run(&app, job, Utc::now()).await?;
        println!("{job}: {count}");
        return Ok(());
    }

    let mut scheduler = JobScheduler::new().await?;
    let timezone = app.config.site.timezone;
    for job in Job::all() {
        let app = app.clone();
        scheduler
            .add(CronJob::new_async_tz(job.schedule(), timezone, move |_uuid, _l| {
                let app = app.clone();
                Box::pin(async move {
                    if let Err(e) = tasks::run(&app, job, Utc::now()).await {
                        tracing::error!("job {job} failed: {e}");
                    }
                })
            })?)
            .await?;
        tracing::debug!("scheduled {job} at {}", job.schedule());
    }
    scheduler.start().await?;
    tracing::info!("worker started with {} jobs", Job::all().len());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("Initiating graceful shutdown...");
            cancel.cancel();
        },
        _ = cancel.cancelled() => {},
    }

    scheduler.shutdown().await?;
    Ok(())
}
