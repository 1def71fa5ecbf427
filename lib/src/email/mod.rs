//! Outbound mail.
//!
//! Everything that leaves the system as an email is first assembled into an
//! [`OutgoingEmail`] and then handed to a [`Transport`]. Production uses
//! [`SmtpTransport`], tests use [`MemoryTransport`].

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use lettre::{
    address::AddressError,
    message::{
        header::{ContentType, HeaderName, HeaderValue},
        Attachment as LettreAttachment, Mailbox, MultiPart, SinglePart,
    },
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use validator::ValidateEmail;

use crate::{Error, ErrorKind, Result};

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Fully rendered email ready for delivery.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct OutgoingEmail {
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    /// Sender as `Name <address>` or a bare address.
    pub from: String,
    pub to: Vec<String>,
    pub reply_to: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Extra headers, e.g. `List-Unsubscribe`.
    pub headers: Vec<(String, String)>,
}

impl OutgoingEmail {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn to_message(&self) -> Result<Message> {
        let mut builder = Message::builder()
            .from(parse_mailbox(&self.from)?)
            .subject(self.subject.clone());
        for to in &self.to {
            builder = builder.to(parse_mailbox(to)?);
        }
        if let Some(reply_to) = &self.reply_to {
            builder = builder.reply_to(parse_mailbox(reply_to)?);
        }
        for (name, value) in &self.headers {
            let name = HeaderName::new_from_ascii(name.clone())
                .map_err(|e| ErrorKind::BadInput(format!("invalid header name: {e}")))?;
            builder = builder.raw_header(HeaderValue::new(name, value.clone()));
        }

        let body = match &self.html {
            Some(html) => MultiPart::alternative_plain_html(self.text.clone(), html.clone()),
            None => MultiPart::mixed().singlepart(SinglePart::plain(self.text.clone())),
        };

        let message = if self.attachments.is_empty() {
            match &self.html {
                Some(_) => builder.multipart(body)?,
                None => builder.singlepart(SinglePart::plain(self.text.clone()))?,
            }
        } else {
            let mut mixed = MultiPart::mixed().multipart(body);
            for attachment in &self.attachments {
                let content_type = ContentType::parse(&attachment.content_type)
                    .map_err(|e| ErrorKind::BadInput(format!("invalid content type: {e}")))?;
                mixed = mixed.singlepart(
                    LettreAttachment::new(attachment.filename.clone())
                        .body(attachment.body.clone(), content_type),
                );
            }
            builder.multipart(mixed)?
        };
        Ok(message)
    }
}

fn parse_mailbox(input: &str) -> Result<Mailbox> {
    input
        .parse()
        .map_err(|e: AddressError| Error::new(ErrorKind::EmailParseError(format!("{input}: {e}"))))
}

/// Formats a sender with display name, quoting as necessary.
pub fn mailbox(name: &str, address: &str) -> String {
    if name.is_empty() {
        return address.to_string();
    }
    match address.parse() {
        Ok(addr) => Mailbox::new(Some(name.to_string()), addr).to_string(),
        Err(_) => address.to_string(),
    }
}

pub fn is_valid_address(address: &str) -> bool {
    address.validate_email()
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<()>;
}

/// Delivers through an SMTP relay with STARTTLS.
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    pub fn new(config: &crate::config::Email) -> Result<Self> {
        let creds = Credentials::new(config.smtp_user.clone(), config.smtp_password.clone());

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        Ok(Self { mailer })
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        let message = email.to_message()?;
        let response = self.mailer.send(message).await?;
        if response.is_positive() {
            Ok(())
        } else {
            Err(ErrorKind::EmailBadResponse(response.code().to_string()).into())
        }
    }
}

/// Keeps delivered mail in memory. Addresses marked as failing are
/// rejected with a transport error.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<OutgoingEmail>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, address: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(address.to_lowercase());
        }
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, address: &str) -> Vec<OutgoingEmail> {
        self.sent()
            .into_iter()
            .filter(|m| m.to.iter().any(|to| to.contains(address)))
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<()> {
        // Build the message anyway so malformed mail fails like it would
        // over smtp.
        email.to_message()?;
        let failing = self
            .failing
            .lock()
            .map(|f| {
                email
                    .to
                    .iter()
                    .any(|to| f.iter().any(|addr| to.to_lowercase().contains(addr)))
            })
            .unwrap_or(false);
        if failing {
            return Err(ErrorKind::Transport(format!("rejected: {:?}", email.to)).into());
        }
        self.sent
            .lock()
            .map_err(|e| ErrorKind::Transport(e.to_string()))?
            .push(email.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email() -> OutgoingEmail {
        OutgoingEmail {
            subject: "Hallo".to_string(),
            text: "Text".to_string(),
            html: Some("<p>Text</p>".to_string()),
            from: mailbox("FragDenStaat", "info@example.com"),
            to: vec!["jane@example.com".to_string()],
            headers: vec![(
                "List-Unsubscribe".to_string(),
                "<mailto:unsub+newsletter@example.com?subject=newsletter-1>".to_string(),
            )],
            ..Default::default()
        }
    }

    #[test]
    fn builds_message_with_headers_and_attachment() {
        let mut email = email();
        email.attachments.push(Attachment {
            filename: "jzwb-fds-2024.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            body: b"%PDF-1.4".to_vec(),
        });
        let formatted = String::from_utf8(email.to_message().unwrap().formatted()).unwrap();
        assert!(formatted.contains("List-Unsubscribe: <mailto:unsub+newsletter@example.com"));
        assert!(formatted.contains("jzwb-fds-2024.pdf"));
        assert!(formatted.contains("Subject: Hallo"));
    }

    #[test]
    fn rejects_malformed_recipient() {
        let mut email = email();
        email.to = vec!["not an address".to_string()];
        assert!(email.to_message().is_err());
    }

    #[tokio::test]
    async fn memory_transport_records_and_fails() {
        let transport = MemoryTransport::new();
        transport.send(&email()).await.unwrap();
        assert_eq!(transport.sent_to("jane@example.com").len(), 1);

        transport.fail_for("jane@example.com");
        assert!(transport.send(&email()).await.is_err());
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn validates_addresses() {
        assert!(is_valid_address("jane@example.com"));
        assert!(!is_valid_address("jane"));
    }
}
