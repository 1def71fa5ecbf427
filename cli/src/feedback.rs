use anyhow::Result;
use clap::{Arg, ArgMatches, Command};

use donorbase::events::{dispatch, Event};
use donorbase::newsletter::subscribe::handle_unsubscribe_mail;
use donorbase::App;

pub fn cmd() -> Command {
    Command::new("feedback")
        .about("Feed bounces and unsubscribe mails back by hand")
        .display_order(65)
        .subcommand_required(true)
        .subcommand(
            Command::new("bounce")
                .about("Handle a hard bounce for the address")
                .arg(Arg::new("email").required(true)),
        )
        .subcommand(
            Command::new("unsubscribe-mail")
                .about("Handle a mail that reached the unsubscribe mailbox")
                .arg(Arg::new("sender").required(true))
                .arg(Arg::new("subject").required(true)),
        )
}

pub async fn run(matches: &ArgMatches, app: &App) -> Result<()> {
    let Some((action, m)) = matches.subcommand() else {
        return Ok(());
    };
    let arg = |name: &str| m.get_one::<String>(name).cloned().unwrap_or_default();
    match action {
        "bounce" => {
            dispatch(
                app,
                Event::EmailBounced {
                    email: arg("email"),
                    user: None,
                },
            )
            .await;
            println!("handled bounce for {}", arg("email"));
        }
        "unsubscribe-mail" => match handle_unsubscribe_mail(&app.db, &arg("sender"), &arg("subject"))? {
            Some(subscriber) => println!("unsubscribed subscriber {}", subscriber.id),
            None => println!("no matching subscriber"),
        },
        _ => unimplemented!(),
    }
    Ok(())
}
