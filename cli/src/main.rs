mod donors;
mod feedback;
mod import;
mod mailing;
mod receipts;
mod worker;

mod util;

use std::time::Duration;

use clap::{Arg, ArgMatches, Command};
use tokio_util::sync::CancellationToken;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let matches = cmd().get_matches();
    let config = util::load_config(&matches)?;
    let _guard = donorbase::tracing::init(&config)?;

    match matches.subcommand() {
        Some(("serve", _)) => {
            let db = util::open_db(&config)?;
            tokio::select! {
                res = donorbase::axum::start_with(db, config) => res?,
                _ = tokio::signal::ctrl_c() => {
                    println!("Initiating graceful shutdown...");
                }
            }
        }
        Some(("worker", m)) => worker::run(m, util::open_app(config)?, cancel.clone()).await?,
        Some((name, m)) => {
            let app = util::open_app(config)?;
            run_oneshot(name, m, &app).await?;
        }
        None => unreachable!("subcommand is required"),
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    Ok(())
}

async fn run_oneshot(name: &str, matches: &ArgMatches, app: &donorbase::App) -> anyhow::Result<()> {
    match name {
        "import" => import::run(matches, app).await,
        "recurrence" => donors::run_recurrence(matches, app).await,
        "receipts" => receipts::run(matches, app).await,
        "mailing" => mailing::run(matches, app).await,
        "pixel" => {
            let events = donorbase::mailing::pixel_log::ingest(app)?;
            println!("recorded {events} open events");
            Ok(())
        }
        "donors" => donors::run(matches, app).await,
        "feedback" => feedback::run(matches, app).await,
        _ => unimplemented!(),
    }
}

pub fn cmd() -> Command {
    Command::new("donorbase")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .infer_subcommands(true)
        .version(VERSION)
        .author(AUTHORS)
        .about("Donations, newsletters and mailings.")
        .subcommand(Command::new("serve").about("Serve the public http routes").display_order(10))
        .subcommand(worker::cmd())
        .subcommand(import::cmd())
        .subcommand(donors::recurrence_cmd())
        .subcommand(receipts::cmd())
        .subcommand(mailing::cmd())
        .subcommand(
            Command::new("pixel")
                .about("Open tracking")
                .display_order(60)
                .subcommand_required(true)
                .subcommand(
                    Command::new("ingest").about("Read new lines from the pixel log and record open events"),
                ),
        )
        .subcommand(feedback::cmd())
        .subcommand(donors::cmd())
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("PATH")
                .global(true)
                .help("Path to the config file"),
        )
        .arg(
            Arg::new("verbosity")
                .long("verbosity")
                .short('v')
                .display_order(100)
                .value_name("level")
                .value_parser(["trace", "debug", "info", "warn", "error", "none"])
                .global(true)
                .help("Set the verbosity of the log output"),
        )
}
