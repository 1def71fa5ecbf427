//! Transactional mail.
//!
//! Every system mail is sent through a registered intent. An intent names
//! the variables it provides and carries a fallback subject and text, used
//! until an editor creates an [`EmailTemplate`] for it.

use std::collections::BTreeMap;

use chrono::Utc;

use crate::app::App;
use crate::db::{Database, Id};
use crate::donation::Donor;
use crate::email::{mailbox, Attachment, OutgoingEmail};
use crate::newsletter::{find_newsletter, Subscriber};
use crate::user::User;
use crate::{config, Config, Error, Result};

use super::render::render_email;
use super::send::render_for_mailing;
use super::template::{find_for_intent, EmailTemplate};
use super::{Context, Mailing, MailingMessage};

pub const DONOR_NEW_THANKS: &str = "donor_new_thanks";
pub const DONOR_THANKS: &str = "donor_thanks";
pub const DONOR_THANKS_OPTIN: &str = "donor_thanks_optin";
pub const DONOR_OPTIN: &str = "donor_optin";
pub const DONATION_REMINDER: &str = "donation_reminder";
pub const SEPA_NOTIFICATION: &str = "sepa_notification";
pub const DONOR_RECEIPT: &str = "donor_receipt";
pub const SUBSCRIBER_CONFIRM: &str = "subscriber_confirm";
pub const SUBSCRIBER_ALREADY: &str = "subscriber_already";
pub const SUBSCRIBER_WELCOME: &str = "subscriber_welcome";
pub const SUBSCRIBER_ONBOARDING: &str = "subscriber_onboarding";
pub const ADMIN_NOTIFICATION: &str = "admin_notification";

const DONOR_VARS: &[&str] = &["name", "first_name", "last_name", "salutation", "donor"];
const DONATION_VARS: &[&str] = &[
    "name",
    "first_name",
    "last_name",
    "salutation",
    "payment",
    "order",
    "donor",
    "donation",
];
const SUBSCRIBER_VARS: &[&str] = &["name", "newsletter", "action_url", "unsubscribe_url"];

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MailIntent {
    pub id: String,
    pub label: String,
    pub subject: String,
    pub text: String,
    /// Variables the sender puts into the context.
    pub context_vars: Vec<String>,
}

impl MailIntent {
    fn new(id: &str, label: &str, subject: &str, text: &str, vars: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            subject: subject.to_string(),
            text: text.to_string(),
            context_vars: vars.iter().map(|v| v.to_string()).collect(),
        }
    }

    /// Template used when no stored template exists for the intent.
    pub fn fallback_template(&self) -> EmailTemplate {
        EmailTemplate {
            name: self.label.clone(),
            subject: self.subject.clone(),
            text: self.text.clone(),
            mail_intent: Some(self.id.clone()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct IntentRegistry {
    intents: BTreeMap<String, MailIntent>,
}

impl IntentRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for intent in [
            MailIntent::new(
                DONOR_NEW_THANKS,
                "Dank an neue Spender:innen",
                "Danke für Ihre Spende!",
                "{{ salutation }},\n\nvielen Dank für Ihre Spende über {{ donation.amount }} Euro. \
                 Schön, dass Sie {{ site_name }} unterstützen!\n\nIhr Team von {{ site_name }}",
                DONATION_VARS,
            ),
            MailIntent::new(
                DONOR_THANKS,
                "Dank für eine Spende",
                "Danke für Ihre erneute Spende!",
                "{{ salutation }},\n\nvielen Dank für Ihre Spende über {{ donation.amount }} Euro.\n\n\
                 Ihr Team von {{ site_name }}",
                DONATION_VARS,
            ),
            MailIntent::new(
                DONOR_THANKS_OPTIN,
                "Dank mit Bestätigung der E-Mail-Adresse",
                "Danke für Ihre Spende! Bitte bestätigen Sie Ihre E-Mail-Adresse",
                "{{ salutation }},\n\nvielen Dank für Ihre Spende über {{ donation.amount }} Euro.\n\n\
                 Bitte bestätigen Sie Ihre E-Mail-Adresse:\n{{ action_url }}\n\n\
                 Ihr Team von {{ site_name }}",
                DONATION_VARS,
            ),
            MailIntent::new(
                DONOR_OPTIN,
                "Bestätigung der E-Mail-Adresse",
                "Bitte bestätigen Sie Ihre E-Mail-Adresse",
                "{{ salutation }},\n\nbitte bestätigen Sie Ihre E-Mail-Adresse:\n{{ action_url }}\n\n\
                 Ihr Team von {{ site_name }}",
                DONOR_VARS,
            ),
            MailIntent::new(
                DONATION_REMINDER,
                "Erinnerung an eine Überweisung",
                "Erinnerung an Ihre Spende",
                "{{ salutation }},\n\nSie wollten uns {{ donation.amount }} Euro per Überweisung \
                 spenden. Bisher ist die Überweisung bei uns nicht eingegangen. Bitte geben Sie \
                 als Verwendungszweck {{ payment.transaction_id }} an.\n\nIhr Team von {{ site_name }}",
                DONATION_VARS,
            ),
            MailIntent::new(
                SEPA_NOTIFICATION,
                "SEPA-Vorabankündigung",
                "Ankündigung Ihrer Lastschrift",
                "{{ salutation }},\n\nwir ziehen {{ order.total_gross }} Euro per Lastschrift von \
                 Ihrem Konto mit der Endung {{ last4 }} ein. Mandatsreferenz: \
                 {{ mandate_reference }}\n\nIhr Team von {{ site_name }}",
                &[
                    "name",
                    "first_name",
                    "last_name",
                    "salutation",
                    "donor",
                    "payment",
                    "order",
                    "mandate_reference",
                    "last4",
                ],
            ),
            MailIntent::new(
                DONOR_RECEIPT,
                "Zuwendungsbestätigung",
                "Ihre Zuwendungsbestätigung für {{ year }}",
                "{{ salutation }},\n\nanbei erhalten Sie Ihre Zuwendungsbestätigung für das Jahr \
                 {{ year }}. Das PDF ist mit Ihrer Postleitzahl geschützt.\n\n\
                 Ihr Team von {{ site_name }}",
                &["name", "salutation", "donor", "year"],
            ),
            MailIntent::new(
                SUBSCRIBER_CONFIRM,
                "Newsletter-Anmeldung bestätigen",
                "Bitte bestätigen Sie Ihre Anmeldung zum Newsletter {{ newsletter }}",
                "Hallo {{ name }},\n\nbitte bestätigen Sie Ihre Anmeldung zum Newsletter \
                 {{ newsletter }}:\n{{ action_url }}",
                SUBSCRIBER_VARS,
            ),
            MailIntent::new(
                SUBSCRIBER_ALREADY,
                "Bereits angemeldet",
                "Sie sind bereits beim Newsletter {{ newsletter }} angemeldet",
                "Hallo {{ name }},\n\nSie sind bereits beim Newsletter {{ newsletter }} angemeldet.",
                &["name", "newsletter", "unsubscribe_url"],
            ),
            MailIntent::new(
                SUBSCRIBER_WELCOME,
                "Willkommen beim Newsletter",
                "Willkommen beim Newsletter {{ newsletter }}",
                "Hallo {{ name }},\n\nschön, dass Sie dabei sind!",
                &["name", "newsletter", "unsubscribe_url"],
            ),
            MailIntent::new(
                SUBSCRIBER_ONBOARDING,
                "Onboarding nach der Anmeldung",
                "Was Sie bei {{ site_name }} tun können",
                "Hallo {{ name }},\n\nvor ein paar Tagen haben Sie sich für den Newsletter \
                 {{ newsletter }} angemeldet.",
                &["name", "newsletter", "unsubscribe_url"],
            ),
            MailIntent::new(
                ADMIN_NOTIFICATION,
                "Benachrichtigung an das Team",
                "{{ title }}",
                "{{ message }}",
                &["title", "message"],
            ),
        ] {
            registry.register(intent);
        }
        registry
    }

    /// Built-in intents plus the ones enumerated in config. Config entries
    /// replace built-ins of the same id.
    pub fn from_config(config: &config::Mailing) -> Self {
        let mut registry = Self::builtin();
        for entry in &config.intents {
            registry.register(MailIntent {
                id: entry.id.clone(),
                label: entry.label.clone(),
                subject: entry.subject.clone(),
                text: entry.text.clone(),
                context_vars: entry.context_vars.clone(),
            });
        }
        registry
    }

    pub fn register(&mut self, intent: MailIntent) {
        self.intents.insert(intent.id.clone(), intent);
    }

    pub fn get(&self, id: &str) -> Option<&MailIntent> {
        self.intents.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.intents.keys().map(|k| k.as_str())
    }
}

/// Addressee of a transactional mail, with the records it belongs to.
#[derive(Clone, Debug, Default)]
pub struct Recipient {
    pub email: String,
    pub name: String,
    pub user: Option<Id>,
    pub donor: Option<Id>,
    pub subscriber: Option<Id>,
}

impl Recipient {
    pub fn new(email: &str, name: &str) -> Self {
        Self {
            email: email.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn from_donor(donor: &Donor) -> Self {
        Self {
            email: donor.email.clone(),
            name: donor.full_name(),
            user: donor.user,
            donor: Some(donor.id),
            subscriber: None,
        }
    }

    pub fn from_user(user: &User) -> Self {
        Self {
            email: user.email.clone(),
            name: user.full_name(),
            user: Some(user.id),
            ..Default::default()
        }
    }

    pub fn from_subscriber(db: &Database, subscriber: &Subscriber) -> Result<Self> {
        Ok(Self {
            email: subscriber.get_email(db)?.unwrap_or_default(),
            name: subscriber.get_name(db)?,
            user: subscriber.user,
            donor: None,
            subscriber: Some(subscriber.id),
        })
    }
}

/// Optional parts of a transactional mail.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Sender, defaults to the configured address.
    pub from: Option<String>,
    pub attachments: Vec<Attachment>,
    pub headers: Vec<(String, String)>,
    /// Template to use instead of the one registered for the intent.
    pub template: Option<Id>,
}

/// `List-Unsubscribe` header pointing at the inbound unsubscribe mailbox.
pub fn list_unsubscribe(config: &Config, reference: &str) -> (String, String) {
    (
        "List-Unsubscribe".to_string(),
        format!(
            "<mailto:unsub+{}@{}?subject=unsubscribe-{}>",
            config.mailing.unsubscribe_token, config.mailing.unsubscribe_domain, reference
        ),
    )
}

/// Whether the recipient is subscribed to the default newsletter.
fn has_newsletter(db: &Database, config: &Config, recipient: &Recipient) -> Result<bool> {
    let Some(newsletter) = find_newsletter(db, &config.newsletter.default)? else {
        return Ok(false);
    };
    let email = crate::util::normalize_email(&recipient.email);
    Ok(db
        .find::<Subscriber, _>(|s| {
            s.newsletter == newsletter.id
                && s.is_subscribed()
                && match (recipient.user, &s.user, &s.email) {
                    (Some(user), Some(bound), _) => user == *bound,
                    (_, _, Some(address)) => !email.is_empty() && *address == email,
                    _ => false,
                }
        })?
        .is_some())
}

/// Continuous mailing collecting the messages sent through the template.
pub fn continuous_mailing_for(db: &Database, template: Id) -> Result<Option<Mailing>> {
    db.find::<Mailing, _>(|m| m.is_continuous && m.ready && m.email_template == Some(template))
}

pub async fn send_intent(
    app: &App,
    intent: &str,
    recipient: &Recipient,
    context: Context,
) -> Result<()> {
    send_intent_with(app, intent, recipient, context, SendOptions::default()).await
}

/// Renders and sends the intent's mail to one recipient.
///
/// When a continuous mailing is registered for the template, the mail is
/// logged as a message of that mailing and tagged with its campaign.
pub async fn send_intent_with(
    app: &App,
    intent: &str,
    recipient: &Recipient,
    mut context: Context,
    options: SendOptions,
) -> Result<()> {
    let registered = app
        .intents
        .get(intent)
        .ok_or_else(|| Error::not_found(format!("mail intent {intent}")))?;
    if recipient.email.is_empty() {
        return Err(Error::precondition(format!("no address for {intent} mail")));
    }

    let template = match options.template {
        Some(id) => app.db.get::<EmailTemplate>(id)?,
        None => find_for_intent(&app.db, intent)?.unwrap_or_else(|| registered.fallback_template()),
    };

    context
        .entry("site_name")
        .or_insert_with(|| app.config.site.name.clone().into());
    context
        .entry("site_url")
        .or_insert_with(|| app.config.site.url.clone().into());
    context
        .entry("name")
        .or_insert_with(|| recipient.name.clone().into());
    context.insert(
        "has_newsletter".into(),
        has_newsletter(&app.db, &app.config, recipient)?.into(),
    );

    let continuous = if template.id != 0 {
        continuous_mailing_for(&app.db, template.id)?
    } else {
        None
    };

    let (content, mut message) = match continuous {
        Some(mailing) => {
            let message = MailingMessage {
                name: recipient.name.clone(),
                email: recipient.email.clone(),
                user: recipient.user,
                donor: recipient.donor,
                subscriber: recipient.subscriber,
                is_continuous: true,
                ..MailingMessage::new(&app.db, mailing.id)?
            };
            let content = render_for_mailing(&app.config, &mailing, &template, &context)?;
            (content, Some(message))
        }
        None => (render_email(&template, &context, &app.config)?, None),
    };

    let mut headers = options.headers;
    if let Some(reference) = context.get("unsubscribe_reference").and_then(|r| r.as_str()) {
        headers.push(list_unsubscribe(&app.config, reference));
    }

    let email = OutgoingEmail {
        subject: content.subject,
        text: content.text,
        html: content.html,
        from: options
            .from
            .unwrap_or_else(|| mailbox(&app.config.email.name, &app.config.email.address)),
        to: vec![mailbox(&recipient.name, &recipient.email)],
        reply_to: None,
        attachments: options.attachments,
        headers,
    };

    let result = app.transport.send(&email).await;
    if let Some(message) = message.as_mut() {
        match &result {
            Ok(()) => {
                message.sent = Some(Utc::now());
                message.failure.clear();
            }
            Err(e) => message.failure = e.to_string(),
        }
        app.db.set(message)?;
    }

    match result {
        Ok(()) => {
            tracing::info!(intent, to = %recipient.email, "sent mail");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(intent, to = %recipient.email, "failed sending mail: {e}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mailing::template::EmailTemplate;

    fn context(value: serde_json::Value) -> Context {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn config_entries_extend_builtins() {
        let mut config = crate::config::Mailing::default();
        config.intents.push(crate::config::IntentEntry {
            id: "gift_shipped".to_string(),
            label: "Geschenk verschickt".to_string(),
            subject: "Ihr Geschenk ist unterwegs".to_string(),
            text: "Hallo {{ name }}".to_string(),
            context_vars: vec!["name".to_string()],
        });
        let registry = IntentRegistry::from_config(&config);
        assert!(registry.get(DONOR_THANKS).is_some());
        assert_eq!(
            registry.get("gift_shipped").unwrap().subject,
            "Ihr Geschenk ist unterwegs"
        );
        assert!(registry.ids().any(|id| id == SUBSCRIBER_CONFIRM));
    }

    #[tokio::test]
    async fn falls_back_to_intent_text() {
        let (app, transport) = App::in_memory(Config::default()).unwrap();
        send_intent(
            &app,
            SUBSCRIBER_CONFIRM,
            &Recipient::new("jane@example.com", "Jane"),
            context(json!({"newsletter": "Wochenrückblick", "action_url": "http://localhost:8080/c/"})),
        )
        .await
        .unwrap();

        let sent = transport.sent_to("jane@example.com");
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].subject,
            "Bitte bestätigen Sie Ihre Anmeldung zum Newsletter Wochenrückblick"
        );
        assert!(sent[0].text.contains("http://localhost:8080/c/"));
    }

    #[tokio::test]
    async fn stored_template_wins_and_continuous_mailing_logs() {
        let (app, transport) = App::in_memory(Config::default()).unwrap();
        let template = EmailTemplate {
            subject: "Willkommen {{ name }}".to_string(),
            text: "Mehr unter http://localhost:8080/mitmachen/".to_string(),
            mail_intent: Some(SUBSCRIBER_WELCOME.to_string()),
            ..EmailTemplate::new(&app.db, "welcome").unwrap()
        };
        app.db.set(&template).unwrap();
        let mailing = Mailing {
            is_continuous: true,
            ready: true,
            email_template: Some(template.id),
            ..Mailing::new(&app.db, "welcome series").unwrap()
        };
        app.db.set(&mailing).unwrap();

        send_intent(
            &app,
            SUBSCRIBER_WELCOME,
            &Recipient::new("jane@example.com", "Jane"),
            Context::new(),
        )
        .await
        .unwrap();

        let sent = transport.sent_to("jane@example.com");
        assert_eq!(sent[0].subject, "Willkommen Jane");
        assert!(sent[0]
            .text
            .contains(&format!("/mitmachen/?pk_campaign={}", mailing.mailing_ident())));

        let messages = crate::mailing::messages_of(&app.db, mailing.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_continuous);
        assert!(messages[0].sent.is_some());
    }

    #[tokio::test]
    async fn unsubscribe_reference_adds_list_unsubscribe() {
        let (app, transport) = App::in_memory(Config::default()).unwrap();
        send_intent(
            &app,
            SUBSCRIBER_ALREADY,
            &Recipient::new("jane@example.com", "Jane"),
            context(json!({"unsubscribe_reference": "newsletter-12"})),
        )
        .await
        .unwrap();
        let sent = transport.sent();
        assert_eq!(
            sent[0].header("List-Unsubscribe"),
            Some("<mailto:unsub+newsletter@localhost?subject=unsubscribe-newsletter-12>")
        );
    }

    #[tokio::test]
    async fn unknown_intent_is_not_found() {
        let (app, _) = App::in_memory(Config::default()).unwrap();
        let err = send_intent(&app, "nope", &Recipient::new("a@example.com", ""), Context::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
