//! Out-of-band notifications for the team.
//!
//! A notification goes to the chat webhook when one is configured and is
//! mailed to every admin address.

use crate::app::App;
use crate::db::Id;
use crate::donation::{Donation, Donor, Recurrence};
use crate::error::ErrorKind;
use crate::mailing::intent::{send_intent, Recipient, ADMIN_NOTIFICATION};
use crate::mailing::Context;
use crate::money::format_eur;
use crate::Result;

pub async fn admin_notification(app: &App, title: &str, message: &str) -> Result<()> {
    let webhook = &app.config.notify.webhook_url;
    if !webhook.is_empty() {
        let text = if message.is_empty() {
            title.to_string()
        } else {
            format!("{title}\n{message}")
        };
        let response = app
            .http
            .post(webhook)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ErrorKind::Other(format!(
                "notification webhook returned {}",
                response.status()
            ))
            .into());
        }
    }

    let mut context = Context::new();
    context.insert("title".into(), title.into());
    context.insert("message".into(), message.into());
    for admin in &app.config.email.admins {
        send_intent(app, ADMIN_NOTIFICATION, &Recipient::new(admin, ""), context.clone()).await?;
    }
    tracing::info!("admin notification: {title}");
    Ok(())
}

pub async fn donation_received(app: &App, donation: Id) -> Result<()> {
    let donation: Donation = app.db.get(donation)?;
    let donor: Donor = app.db.get(donation.donor)?;
    let title = format!("Neue Spende: {}", format_eur(donation.amount));
    let mut message = format!(
        "{} ({}) via {} für {}",
        donor.display_name(),
        donor.email,
        donation.method,
        donation.project
    );
    if donation.recurring {
        message.push_str(", wiederkehrend");
    }
    admin_notification(app, &title, &message).await
}

pub async fn recurrence_created(app: &App, recurrence: Id) -> Result<()> {
    let recurrence: Recurrence = app.db.get(recurrence)?;
    let donor: Donor = app.db.get(recurrence.donor)?;
    let title = format!(
        "Neue Dauerspende: {} alle {} Monat(e)",
        format_eur(recurrence.amount),
        recurrence.interval
    );
    let message = format!("{} via {}", donor.display_name(), recurrence.method);
    admin_notification(app, &title, &message).await
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::Config;

    #[tokio::test]
    async fn donation_goes_to_webhook_and_admins() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "text": "Neue Spende: 10,00 €\nJane Doe (jane@example.org) via banktransfer für FDS"
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = Config::default();
        config.notify.webhook_url = server.uri();
        config.email.admins = vec!["team@example.org".to_string()];
        let (app, transport) = App::in_memory(config).unwrap();

        let donor = Donor {
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            email: "jane@example.org".to_string(),
            ..Donor::new(&app.db).unwrap()
        };
        app.db.set(&donor).unwrap();
        let donation = Donation {
            amount: dec!(10),
            method: crate::payment::PaymentMethod::Banktransfer,
            ..Donation::new(&app.db, donor.id).unwrap()
        };
        app.db.set(&donation).unwrap();

        donation_received(&app, donation.id).await.unwrap();
        let sent = transport.sent_to("team@example.org");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Neue Spende: 10,00 €");
    }
}
