use anyhow::{Error, Result};
use chrono::Utc;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};

use donorbase::donation::donor::{detect_duplicates, mark_invalid_addresses, merge_donors};
use donorbase::donation::recurrence::{process_all, process_recurrence_on_donor};
use donorbase::{App, Id};

use crate::util;

fn donors_arg() -> Arg {
    Arg::new("donors")
        .num_args(0..)
        .value_parser(value_parser!(Id))
        .help("Donor ids, defaults to every donor")
}

pub fn cmd() -> Command {
    Command::new("donors")
        .about("Donor maintenance")
        .display_order(70)
        .subcommand_required(true)
        .subcommand(
            Command::new("duplicates")
                .about("Group donors sharing an address or a name")
                .arg(donors_arg()),
        )
        .subcommand(
            Command::new("invalid")
                .about("Flag donors with unusable postal addresses")
                .arg(donors_arg()),
        )
        .subcommand(
            Command::new("merge")
                .about("Merge donors into one, the first id is kept")
                .arg(
                    Arg::new("donors")
                        .required(true)
                        .num_args(2..)
                        .value_parser(value_parser!(Id)),
                ),
        )
}

pub fn recurrence_cmd() -> Command {
    Command::new("recurrence")
        .about("Detect recurring donations")
        .display_order(30)
        .arg(
            Arg::new("donor")
                .value_parser(value_parser!(Id))
                .required_unless_present("all"),
        )
        .arg(
            Arg::new("all")
                .long("all")
                .action(ArgAction::SetTrue)
                .conflicts_with("donor")
                .help("Process every donor"),
        )
}

pub async fn run(matches: &ArgMatches, app: &App) -> Result<()> {
    let Some((action, m)) = matches.subcommand() else {
        return Ok(());
    };
    let donors = util::ids(m, "donors");
    match action {
        "duplicates" => {
            let (groups, count) = detect_duplicates(&app.db, &donors)?;
            println!("{count} donors in {groups} duplicate groups");
        }
        "invalid" => {
            let count = mark_invalid_addresses(&app.db, &donors)?;
            println!("{count} donors flagged invalid");
        }
        "merge" => {
            let donor = merge_donors(&app.db, &donors, donors.first().copied(), None)?;
            println!("merged into donor {}", donor.id);
        }
        _ => unimplemented!(),
    }
    Ok(())
}

pub async fn run_recurrence(matches: &ArgMatches, app: &App) -> Result<()> {
    let now = Utc::now();
    if matches.get_flag("all") {
        let count = process_all(app, now).await?;
        println!("processed {count} donors");
        return Ok(());
    }
    let donor = *matches
        .get_one::<Id>("donor")
        .ok_or_else(|| Error::msg("donor id is required"))?;
    process_recurrence_on_donor(app, donor, now).await?;
    println!("processed donor {donor}");
    Ok(())
}
