//! Web archive of published mailings.

use askama::Template;
use chrono::{Datelike, Utc};

use crate::db::{Database, Id};
use crate::newsletter::{get_newsletter, Newsletter};
use crate::util::format_date_de;
use crate::{Config, Error, Result};

use super::render::{render_subject, render_web_html};
use super::{Context, Mailing};

pub struct ArchiveEntry {
    pub subject: String,
    pub date: String,
    pub url: String,
}

#[derive(Template)]
#[template(path = "archive/list.html")]
struct ArchiveList<'a> {
    site_name: &'a str,
    newsletter: &'a str,
    entries: Vec<ArchiveEntry>,
}

#[derive(Template)]
#[template(path = "archive/mailing.html")]
struct ArchivePage<'a> {
    site_name: &'a str,
    newsletter: &'a str,
    list_url: &'a str,
    subject: &'a str,
    date: &'a str,
    body: &'a str,
}

/// Published, sent mailings of the newsletter, newest first.
pub fn published_mailings(db: &Database, newsletter: Id) -> Result<Vec<Mailing>> {
    let mut mailings = db.filter::<Mailing, _>(|m| {
        m.newsletter == Some(newsletter) && m.publish && m.sent && m.sending_date.is_some()
    })?;
    mailings.sort_by(|a, b| b.sending_date.cmp(&a.sending_date).then(b.id.cmp(&a.id)));
    Ok(mailings)
}

fn archive_context(config: &Config, newsletter: &Newsletter) -> Context {
    let mut context = Context::new();
    context.insert("site_name".into(), config.site.name.clone().into());
    context.insert("site_url".into(), config.site.url.clone().into());
    context.insert("newsletter".into(), newsletter.title.clone().into());
    context.insert("name".into(), "".into());
    context
}

fn subject_of(db: &Database, config: &Config, newsletter: &Newsletter, mailing: &Mailing) -> Result<String> {
    let template = mailing.template(db)?;
    render_subject(&template.subject, &archive_context(config, newsletter))
}

pub fn render_archive_list(db: &Database, config: &Config, slug: &str) -> Result<String> {
    let newsletter = get_newsletter(db, slug)?;
    let mut entries = vec![];
    for mailing in published_mailings(db, newsletter.id)? {
        let (Some(url), Some(date)) = (mailing.archive_path(&newsletter.slug), mailing.sending_date)
        else {
            continue;
        };
        entries.push(ArchiveEntry {
            subject: subject_of(db, config, &newsletter, &mailing)?,
            date: format_date_de(date, config.site.timezone),
            url,
        });
    }
    let page = ArchiveList {
        site_name: &config.site.name,
        newsletter: &newsletter.title,
        entries,
    };
    Ok(page.render()?)
}

/// Looks up a published mailing by its archive path. The date has to match
/// the sending date, anything else is not found.
pub fn find_archived(
    db: &Database,
    slug: &str,
    year: i32,
    month: u32,
    day: u32,
    id: Id,
) -> Result<(Newsletter, Mailing)> {
    let newsletter = get_newsletter(db, slug)?;
    let mailing = db
        .get_opt::<Mailing>(id)?
        .filter(|m| m.newsletter == Some(newsletter.id) && m.publish && m.sent)
        .filter(|m| {
            m.sending_date
                .map(|d| (d.year(), d.month(), d.day()) == (year, month, day))
                .unwrap_or(false)
        })
        .ok_or_else(|| Error::not_found(format!("archived mailing {id}")))?;
    Ok((newsletter, mailing))
}

pub fn render_archive_page(
    db: &Database,
    config: &Config,
    newsletter: &Newsletter,
    mailing: &Mailing,
) -> Result<String> {
    let template = mailing.template(db)?;
    let context = archive_context(config, newsletter);
    let subject = render_subject(&template.subject, &context)?;
    let body = render_web_html(&template, &context)?;
    let date = format_date_de(mailing.sending_date.unwrap_or_else(Utc::now), config.site.timezone);
    let list_url = format!("/newsletter/{}/archive/", newsletter.slug);
    let page = ArchivePage {
        site_name: &config.site.name,
        newsletter: &newsletter.title,
        list_url: &list_url,
        subject: &subject,
        date: &date,
        body: &body,
    };
    Ok(page.render()?)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::mailing::{Block, EmailTemplate};

    fn setup() -> (Database, Newsletter, Mailing) {
        let db = Database::temporary().unwrap();
        let newsletter = Newsletter::new(&db, "fragdenstaat", "FragDenStaat Newsletter").unwrap();
        db.set(&newsletter).unwrap();
        let template = EmailTemplate {
            subject: "Ausgabe März".to_string(),
            blocks: vec![
                Block::Header {
                    title: "Doppelte Überschrift".to_string(),
                    image: None,
                },
                Block::Text {
                    text: "Hallo {{ name }}, neue Anfragen.".to_string(),
                    html: String::new(),
                },
            ],
            ..EmailTemplate::new(&db, "march").unwrap()
        };
        db.set(&template).unwrap();
        let mailing = Mailing {
            email_template: Some(template.id),
            newsletter: Some(newsletter.id),
            publish: true,
            sent: true,
            sending_date: Some(Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap()),
            ..Mailing::new(&db, "März").unwrap()
        };
        db.set(&mailing).unwrap();
        (db, newsletter, mailing)
    }

    #[test]
    fn lists_published_mailings() {
        let (db, newsletter, mailing) = setup();
        let draft = Mailing {
            newsletter: Some(newsletter.id),
            ..Mailing::new(&db, "Entwurf").unwrap()
        };
        db.set(&draft).unwrap();

        let list = published_mailings(&db, newsletter.id).unwrap();
        assert_eq!(list.len(), 1);
        let html = render_archive_list(&db, &Config::default(), "fragdenstaat").unwrap();
        assert!(html.contains(&format!("/newsletter/fragdenstaat/archive/2024/03/05/{}/", mailing.id)));
        assert!(html.contains("Ausgabe März"));
    }

    #[test]
    fn page_requires_matching_date() {
        let (db, _, mailing) = setup();
        assert!(find_archived(&db, "fragdenstaat", 2024, 3, 5, mailing.id).is_ok());
        let err = find_archived(&db, "fragdenstaat", 2024, 3, 6, mailing.id).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn page_drops_leading_heading() {
        let (db, newsletter, mailing) = setup();
        let html = render_archive_page(&db, &Config::default(), &newsletter, &mailing).unwrap();
        assert!(!html.contains("Doppelte Überschrift"));
        assert!(html.contains("neue Anfragen"));
        assert!(html.contains("<h1>Ausgabe März</h1>"));
    }
}
