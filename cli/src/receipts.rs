use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Error, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use strum::IntoEnumIterator;

use donorbase::receipt::{
    export_receipt_encrypted_pdf, export_receipts_csv, export_receipts_pdf, receipt_donors,
    send_receipt_mailings, ExportOptions, ReceiptFormat,
};
use donorbase::{App, Id};

use crate::util;

pub fn cmd() -> Command {
    Command::new("receipts")
        .about("Export or mail the annual donation receipts")
        .display_order(40)
        .arg(
            Arg::new("year")
                .required(true)
                .value_parser(value_parser!(i32)),
        )
        .arg(
            Arg::new("format")
                .long("format")
                .short('f')
                .default_value("csv")
                .value_parser(ReceiptFormat::iter().map(|f| f.to_string()).collect::<Vec<_>>()),
        )
        .arg(
            Arg::new("donor")
                .long("donor")
                .action(ArgAction::Append)
                .value_parser(value_parser!(Id))
                .help("Limit to the given donors, defaults to every donor due a receipt"),
        )
        .arg(
            Arg::new("mark")
                .long("mark")
                .action(ArgAction::SetTrue)
                .help("Record the receipt date on the exported donations"),
        )
        .arg(
            Arg::new("backup")
                .long("backup")
                .action(ArgAction::SetTrue)
                .help("Upload generated pdfs to the WebDAV share"),
        )
        .arg(
            Arg::new("out")
                .long("out")
                .short('o')
                .value_name("DIR")
                .default_value(".")
                .help("Directory the exported files are written to"),
        )
}

pub async fn run(matches: &ArgMatches, app: &App) -> Result<()> {
    let year = *matches
        .get_one::<i32>("year")
        .ok_or_else(|| Error::msg("year is required"))?;
    let format = matches
        .get_one::<String>("format")
        .map(|f| ReceiptFormat::from_str(f))
        .transpose()?
        .unwrap_or_default();
    let options = ExportOptions {
        mark: matches.get_flag("mark"),
        backup: matches.get_flag("backup"),
    };
    let out = PathBuf::from(matches.get_one::<String>("out").map(String::as_str).unwrap_or("."));

    let donors = receipt_donors(&app.db, &app.config, year, &util::ids(matches, "donor"))?;
    tracing::info!(year, donors = donors.len(), %format, "exporting receipts");

    match format {
        ReceiptFormat::Csv => {
            let csv = export_receipts_csv(app, &donors, year, options)?;
            let path = out.join(format!("receipts-{year}.csv"));
            tokio::fs::write(&path, csv).await?;
            println!("wrote {}", path.display());
        }
        ReceiptFormat::Pdf => {
            let (name, pdf) = export_receipts_pdf(app, &donors, year, options).await?;
            let path = out.join(name);
            tokio::fs::write(&path, pdf).await?;
            println!("wrote {}", path.display());
        }
        ReceiptFormat::Encrypted => {
            for donor in &donors {
                let pdf = export_receipt_encrypted_pdf(app, donor, year, options).await?;
                let path = out.join(format!("receipt-{year}-{}.pdf", donor.id));
                tokio::fs::write(&path, pdf).await?;
                println!("wrote {}", path.display());
            }
        }
        ReceiptFormat::Mail => {
            let report = send_receipt_mailings(app, &donors, year, options).await?;
            println!("sent {} receipts", report.sent);
            if !report.skipped.is_empty() {
                println!("skipped donors: {:?}", report.skipped);
            }
        }
    }
    Ok(())
}
