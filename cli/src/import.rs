use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};

use donorbase::newsletter::get_newsletter;
use donorbase::newsletter::import::import_subscribers;
use donorbase::payment::banktransfer::import_banktransfers;
use donorbase::payment::paypal::import_paypal;
use donorbase::App;

pub fn cmd() -> Command {
    Command::new("import")
        .about("Import bank statements, PayPal exports or subscriber lists")
        .display_order(20)
        .subcommand_required(true)
        .subcommand(
            Command::new("banktransfer")
                .about("Import a bank statement (csv or xlsx)")
                .arg(Arg::new("file").required(true)),
        )
        .subcommand(
            Command::new("paypal")
                .about("Import a PayPal activity export (csv)")
                .arg(Arg::new("file").required(true)),
        )
        .subcommand(
            Command::new("subscribers")
                .about("Import subscribers from a csv with an email column")
                .arg(Arg::new("newsletter").required(true).help("Newsletter slug"))
                .arg(Arg::new("file").required(true))
                .arg(
                    Arg::new("confirmed")
                        .long("confirmed")
                        .action(ArgAction::SetTrue)
                        .help("Addresses are already confirmed, skip the double opt-in"),
                )
                .arg(
                    Arg::new("reference")
                        .long("reference")
                        .default_value("import")
                        .help("Reference stored on new subscribers"),
                ),
        )
}

pub async fn run(matches: &ArgMatches, app: &App) -> Result<()> {
    let Some((kind, m)) = matches.subcommand() else {
        return Ok(());
    };
    let Some(file) = m.get_one::<String>("file") else {
        return Ok(());
    };
    let data = tokio::fs::read(file).await?;

    match kind {
        "banktransfer" => {
            let report = import_banktransfers(app, &data).await?;
            println!(
                "{} rows, {} new, {} skipped",
                report.rows, report.new, report.skipped
            );
        }
        "paypal" => {
            let (rows, new) = import_paypal(app, &data).await?;
            println!("{rows} rows, {new} new");
        }
        "subscribers" => {
            let slug = m.get_one::<String>("newsletter").map(String::as_str).unwrap_or_default();
            let newsletter = get_newsletter(&app.db, slug)?;
            let reference = m.get_one::<String>("reference").map(String::as_str).unwrap_or_default();
            let report =
                import_subscribers(app, &newsletter, &data, m.get_flag("confirmed"), reference).await?;
            println!(
                "{} rows, {} subscribed, {} awaiting confirmation, {} already subscribed",
                report.rows, report.subscribed, report.confirm, report.already
            );
            if !report.invalid.is_empty() {
                println!("invalid rows: {:?}", report.invalid);
            }
        }
        _ => unimplemented!(),
    }
    Ok(())
}
