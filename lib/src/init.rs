//! Data initialization procedures.
//!
//! The app config can contain entries describing items expected to exist
//! after the application is started: newsletters and, through a yaml file,
//! email templates. Existing items are matched by slug or name and left
//! alone, so initialization can run on every start.

use crate::mailing::template::EmailTemplate;
use crate::newsletter::{find_newsletter, Newsletter};
use crate::{Config, Database, Result};

/// Initializes database state based on entries found in the configuration.
pub fn initialize(config: &Config, db: &Database) -> Result<()> {
    if !config.init.enabled {
        return Ok(());
    }
    newsletters(config, db)?;
    templates(config, db)?;
    Ok(())
}

/// Creates the configured newsletters that don't exist yet.
pub fn newsletters(config: &Config, db: &Database) -> Result<usize> {
    let mut created = 0;
    for entry in &config.init.newsletters {
        if find_newsletter(db, &entry.slug)?.is_some() {
            continue;
        }
        let newsletter = Newsletter {
            sender_name: entry.sender_name.clone(),
            sender_email: entry.sender_email.clone(),
            welcome_intent: entry.welcome_intent.clone(),
            onboarding_intent: entry.onboarding_intent.clone(),
            ..Newsletter::new(db, &entry.slug, &entry.title)?
        };
        db.set(&newsletter)?;
        tracing::info!(slug = %newsletter.slug, "created newsletter");
        created += 1;
    }
    Ok(created)
}

/// Creates email templates from the yaml file named in the config.
pub fn templates(config: &Config, db: &Database) -> Result<usize> {
    let Some(path) = &config.init.templates else {
        return Ok(0);
    };
    let source = std::fs::read_to_string(path)?;
    templates_from_yaml(db, &source)
}

/// Creates the templates listed in the yaml document, skipping names that
/// already exist.
pub fn templates_from_yaml(db: &Database, source: &str) -> Result<usize> {
    let entries: Vec<EmailTemplate> = serde_yaml::from_str(source)?;
    let existing = db.get_collection::<EmailTemplate>()?;
    let mut created = 0;
    for entry in entries {
        if existing.iter().any(|t| t.name == entry.name) {
            continue;
        }
        let template = EmailTemplate {
            id: db.generate_id()?,
            ..entry
        };
        db.set(&template)?;
        tracing::info!(name = %template.name, "created email template");
        created += 1;
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newsletters_are_created_once() {
        let db = Database::temporary().unwrap();
        let config = Config::default();
        assert_eq!(newsletters(&config, &db).unwrap(), 1);
        assert_eq!(newsletters(&config, &db).unwrap(), 0);
        assert!(find_newsletter(&db, "fragdenstaat").unwrap().is_some());
    }

    #[test]
    fn templates_from_yaml_skip_existing_names() {
        let db = Database::temporary().unwrap();
        let source = r#"
- name: welcome
  subject: "Willkommen, {{ name }}"
  text: "Hallo {{ name }}"
  mail_intent: subscriber_welcome
- name: goodbye
  subject: Tschüss
"#;
        assert_eq!(templates_from_yaml(&db, source).unwrap(), 2);
        assert_eq!(templates_from_yaml(&db, source).unwrap(), 0);
        let welcome = crate::mailing::template::find_for_intent(&db, "subscriber_welcome")
            .unwrap()
            .unwrap();
        assert_eq!(welcome.subject, "Willkommen, {{ name }}");
    }
}
