//! Mock data for development instances.

use chrono::{Duration, Utc};
use rust_decimal_macros::dec;

use crate::db::Changeset;
use crate::donation::donor::recompute_donor;
use crate::donation::{Donation, Donor};
use crate::mailing::{EmailTemplate, Mailing};
use crate::newsletter::{find_newsletter, Newsletter, Subscriber};
use crate::payment::PaymentMethod;
use crate::{Config, Database, Error, Result, User};

pub const MOCK_EMAIL: &str = "test@mail.com";
const MOCK_MAILING: &str = "Mock mailing";

/// Generates and saves mock donors, subscribers and a draft mailing.
pub fn generate(config: &Config, db: &Database) -> Result<()> {
    let user = user(config, db)?;
    let newsletter = newsletter(config, db)?;
    donors(db, &user)?;
    subscribers(db, &newsletter, &user)?;
    mailing(config, db, &newsletter)?;
    tracing::info!("generated mock data");
    Ok(())
}

pub fn user(config: &Config, db: &Database) -> Result<User> {
    if let Some(existing) = db.find::<User, _>(|u| u.email == MOCK_EMAIL)? {
        if !config.dev.mock_regen {
            return Err(Error::precondition(format!("mock user {MOCK_EMAIL} already exists")));
        }
        db.remove(&existing)?;
    }
    let user = User {
        is_staff: true,
        ..User::new(db, MOCK_EMAIL, "Test", "User")?
    };
    db.set(&user)?;
    Ok(user)
}

fn newsletter(config: &Config, db: &Database) -> Result<Newsletter> {
    if let Some(newsletter) = find_newsletter(db, &config.newsletter.default)? {
        return Ok(newsletter);
    }
    let newsletter = Newsletter::new(db, &config.newsletter.default, &config.site.name)?;
    db.set(&newsletter)?;
    Ok(newsletter)
}

/// One donor bound to the mock user with a monthly streak, one anonymous
/// one-off donor.
fn donors(db: &Database, user: &User) -> Result<()> {
    let now = Utc::now();
    let regular = Donor {
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        email: user.email.clone(),
        user: Some(user.id),
        address: "Musterstraße 1".to_string(),
        postcode: "10115".to_string(),
        city: "Berlin".to_string(),
        email_confirmed: Some(now),
        contact_allowed: true,
        ..Donor::new(db)?
    };
    let one_off = Donor {
        first_name: "Erika".to_string(),
        last_name: "Mustermann".to_string(),
        email: "erika@mail.com".to_string(),
        ..Donor::new(db)?
    };

    let mut changes = Changeset::new();
    changes.set(&regular)?;
    changes.set(&one_off)?;
    for month in 0..6 {
        let at = now - Duration::days(30 * (6 - month));
        let donation = Donation {
            amount: dec!(10),
            amount_received: dec!(10),
            timestamp: at,
            received_timestamp: Some(at),
            method: PaymentMethod::Sepa,
            completed: true,
            ..Donation::new(db, regular.id)?
        };
        changes.set(&donation)?;
    }
    let donation = Donation {
        amount: dec!(50),
        timestamp: now - Duration::days(3),
        method: PaymentMethod::Banktransfer,
        completed: true,
        ..Donation::new(db, one_off.id)?
    };
    changes.set(&donation)?;
    db.apply(changes)?;

    recompute_donor(db, regular.id)?;
    recompute_donor(db, one_off.id)?;
    Ok(())
}

fn subscribers(db: &Database, newsletter: &Newsletter, user: &User) -> Result<()> {
    let now = Utc::now();
    let mut changes = Changeset::new();
    changes.set(&Subscriber {
        user: Some(user.id),
        subscribed: Some(now - Duration::days(40)),
        reference: "mock".to_string(),
        ..Subscriber::new(db, newsletter.id)?
    })?;
    for i in 0..5 {
        changes.set(&Subscriber {
            email: Some(format!("subscriber{i}@mail.com")),
            subscribed: Some(now - Duration::days(i)),
            reference: "mock".to_string(),
            ..Subscriber::new(db, newsletter.id)?
        })?;
    }
    changes.set(&Subscriber {
        email: Some("pending@mail.com".to_string()),
        ..Subscriber::new(db, newsletter.id)?
    })?;
    db.apply(changes)
}

fn mailing(config: &Config, db: &Database, newsletter: &Newsletter) -> Result<Mailing> {
    let template = EmailTemplate {
        subject: "Neuigkeiten von {{ site_name }}".to_string(),
        text: "Hallo {{ name }},\n\nes gibt Neuigkeiten.".to_string(),
        category: "newsletter".to_string(),
        ..EmailTemplate::new(db, "mock-newsletter")?
    };
    db.set(&template)?;
    let mailing = Mailing {
        email_template: Some(template.id),
        newsletter: Some(newsletter.id),
        sender_name: config.email.name.clone(),
        sender_email: config.email.address.clone(),
        publish: true,
        tracking: true,
        ready: true,
        ..Mailing::new(db, MOCK_MAILING)?
    };
    db.set(&mailing)?;
    Ok(mailing)
}
