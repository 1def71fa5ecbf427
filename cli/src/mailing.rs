use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};

use donorbase::mailing::send::{continue_sending, finalize, send, submit, SendReport};
use donorbase::newsletter::get_newsletter;
use donorbase::newsletter::segment::generate_random_split;
use donorbase::{App, Id};

use crate::util;

fn mailing_arg() -> Arg {
    Arg::new("mailing").required(true).value_parser(value_parser!(Id))
}

pub fn cmd() -> Command {
    Command::new("mailing")
        .about("Send and manage mailings")
        .display_order(50)
        .subcommand_required(true)
        .subcommand(
            Command::new("send")
                .about("Build the roster and send a mailing now")
                .arg(mailing_arg()),
        )
        .subcommand(
            Command::new("continue")
                .about("Resume sending messages that were not sent yet")
                .arg(mailing_arg()),
        )
        .subcommand(
            Command::new("submit")
                .about("Schedule a mailing for the send job")
                .arg(mailing_arg())
                .arg(
                    Arg::new("date")
                        .long("date")
                        .value_parser(value_parser!(DateTime<Utc>))
                        .help("Sending date (RFC 3339), defaults to now"),
                ),
        )
        .subcommand(
            Command::new("finalize")
                .about("Build the roster without sending")
                .arg(mailing_arg()),
        )
        .subcommand(
            Command::new("split")
                .about("Split subscribers randomly into lettered test groups")
                .arg(Arg::new("name").required(true))
                .arg(Arg::new("newsletter").required(true).help("Newsletter slug"))
                .arg(
                    Arg::new("groups")
                        .required(true)
                        .num_args(1..)
                        .value_parser(value_parser!(u32))
                        .help("Group sizes"),
                )
                .arg(
                    Arg::new("segment")
                        .long("segment")
                        .action(ArgAction::Append)
                        .value_parser(value_parser!(Id))
                        .help("Only draw from these segments"),
                ),
        )
}

pub async fn run(matches: &ArgMatches, app: &App) -> Result<()> {
    let Some((action, m)) = matches.subcommand() else {
        return Ok(());
    };

    if action == "split" {
        let name = m.get_one::<String>("name").map(String::as_str).unwrap_or_default();
        let slug = m.get_one::<String>("newsletter").map(String::as_str).unwrap_or_default();
        let newsletter = get_newsletter(&app.db, slug)?;
        let groups: Vec<u32> = m
            .get_many::<u32>("groups")
            .map(|g| g.copied().collect())
            .unwrap_or_default();
        let segments = generate_random_split(&app.db, name, newsletter.id, &util::ids(m, "segment"), &groups)?;
        for segment in segments {
            println!("{}: {}", segment.id, segment.name);
        }
        return Ok(());
    }

    let mailing = *m
        .get_one::<Id>("mailing")
        .ok_or_else(|| Error::msg("mailing id is required"))?;
    match action {
        "send" => print_report(send(app, mailing).await?),
        "continue" => print_report(continue_sending(app, mailing).await?),
        "submit" => {
            let date = m.get_one::<DateTime<Utc>>("date").copied();
            let submitted = submit(&app.db, mailing, None, date)?;
            if let Some(date) = submitted.sending_date {
                println!("mailing {mailing} goes out after {date}");
            }
        }
        "finalize" => {
            let count = finalize(&app.db, mailing)?;
            println!("{count} recipients");
        }
        _ => unimplemented!(),
    }
    Ok(())
}

fn print_report(report: SendReport) {
    if report.skipped {
        println!("mailing is not in a sendable state");
        return;
    }
    println!(
        "{} sent, {} failed, {} removed from roster",
        report.sent, report.failed, report.removed
    );
}
