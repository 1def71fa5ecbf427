//! Two-channel mail rendering.
//!
//! Block sources are assembled first, wrapped into the askama base layout
//! (html) or followed by the askama footer (text), and then all template
//! variables are resolved in a single minijinja pass. Output still carrying
//! `{{` or `}}` is refused.

use std::sync::LazyLock;

use askama::Template;
use minijinja::Environment;
use regex::Regex;

use crate::error::ErrorKind;
use crate::{Config, Result};

use super::template::{BaseLayout, EmailTemplate};
use super::{Context, EmailContent};

#[derive(Template)]
#[template(path = "email/base_default.html")]
struct DefaultLayout<'a> {
    subject: &'a str,
    preheader: &'a str,
    body: &'a str,
    site_name: &'a str,
    site_url: &'a str,
}

#[derive(Template)]
#[template(path = "email/base_mjml.html")]
struct MjmlLayout<'a> {
    subject: &'a str,
    preheader: &'a str,
    body: &'a str,
    site_name: &'a str,
    site_url: &'a str,
}

#[derive(Template)]
#[template(path = "email/footer.txt")]
struct TextFooter<'a> {
    site_name: &'a str,
    site_url: &'a str,
}

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($re).expect(stringify!($name)));
    };
}

pattern!(COLLAPSE_NEWLINES, r"(?:\r?\n){3,}");
pattern!(BREAKS, r"(?i)<br\s*/?>");
pattern!(BLOCK_ENDS, r"(?i)</(p|div|h[1-6]|li|ul|ol|blockquote)>");
pattern!(TAGS, r"<[^>]+>");
pattern!(LEADING_H1, r"(?is)\A\s*(<img[^>]*>\s*)?<h1[^>]*>.*?</h1>");

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape_html(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", "\u{a0}")
        .replace("&amp;", "&")
}

/// Paragraphs separated by blank lines become `<p>`, single newlines `<br>`.
pub fn text_to_html(text: &str) -> String {
    text.replace("\r\n", "\n")
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", escape_html(p).replace('\n', "<br>\n")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Crude plain rendition of editor html.
pub fn html_to_text(html: &str) -> String {
    let text = BREAKS.replace_all(html, "\n");
    let text = BLOCK_ENDS.replace_all(&text, "\n\n");
    let text = TAGS.replace_all(&text, "");
    let text = unescape_html(&text);
    collapse_newlines(&text).trim().to_string()
}

/// Three or more line breaks collapse into one blank line.
pub fn collapse_newlines(text: &str) -> String {
    COLLAPSE_NEWLINES.replace_all(text, "\r\n\r\n").into_owned()
}

/// Resolves template variables. Undefined variables render empty.
pub fn render_str(source: &str, context: &Context) -> Result<String> {
    let env = Environment::new();
    Ok(env.render_str(source, context)?)
}

pub fn ensure_resolved(output: &str, channel: &str) -> Result<()> {
    if output.contains("{{") || output.contains("}}") {
        return Err(ErrorKind::UnresolvedTemplate(channel.to_string()).into());
    }
    Ok(())
}

/// Copy of the context with every string html-escaped, for the html
/// channel.
pub fn escape_context(context: &Context) -> Context {
    fn escape(value: &serde_json::Value) -> serde_json::Value {
        use serde_json::Value;
        match value {
            Value::String(s) => Value::String(escape_html(s)),
            Value::Array(items) => Value::Array(items.iter().map(escape).collect()),
            Value::Object(map) => {
                Value::Object(map.iter().map(|(k, v)| (k.clone(), escape(v))).collect())
            }
            other => other.clone(),
        }
    }
    context
        .iter()
        .map(|(k, v)| (k.clone(), escape(v)))
        .collect()
}

pub fn render_subject(source: &str, context: &Context) -> Result<String> {
    let subject = render_str(source, context)?;
    let subject = subject.split_whitespace().collect::<Vec<_>>().join(" ");
    ensure_resolved(&subject, "subject")?;
    Ok(subject)
}

pub fn render_text(template: &EmailTemplate, context: &Context, config: &Config) -> Result<String> {
    let body = collapse_newlines(&template.body_text(context));
    let footer = TextFooter {
        site_name: &config.site.name,
        site_url: &config.site.url,
    }
    .render()?;
    let text = render_str(&format!("{}\r\n\r\n{}", body.trim_end(), footer), context)?;
    let text = collapse_newlines(&text);
    ensure_resolved(&text, "text")?;
    Ok(text)
}

pub fn render_html(
    template: &EmailTemplate,
    subject: &str,
    preheader: &str,
    context: &Context,
    config: &Config,
) -> Result<String> {
    let body = template.body_html(context);
    let source = match template.layout {
        BaseLayout::Default => DefaultLayout {
            subject,
            preheader,
            body: &body,
            site_name: &config.site.name,
            site_url: &config.site.url,
        }
        .render()?,
        BaseLayout::Mjml => MjmlLayout {
            subject,
            preheader,
            body: &body,
            site_name: &config.site.name,
            site_url: &config.site.url,
        }
        .render()?,
    };
    let html = render_str(&source, &escape_context(context))?;
    ensure_resolved(&html, "html")?;
    Ok(html)
}

/// Renders all channels of the template for one recipient.
pub fn render_email(
    template: &EmailTemplate,
    context: &Context,
    config: &Config,
) -> Result<EmailContent> {
    let mut context = context.clone();
    let subject = render_subject(&template.subject, &context)?;
    let preheader = render_subject(&template.preheader, &context)?;
    context.insert("subject".into(), subject.clone().into());
    context.insert("preheader".into(), preheader.clone().into());

    let text = render_text(template, &context, config)?;
    let html = render_html(template, &subject, &preheader, &context, config)?;
    Ok(EmailContent {
        subject,
        text,
        html: Some(html),
    })
}

/// Html body for the web archive: no layout, no recipient data, leading
/// heading removed so the page can supply its own.
pub fn render_web_html(template: &EmailTemplate, context: &Context) -> Result<String> {
    let body = template.body_html(context);
    let html = render_str(&body, &escape_context(context))?;
    Ok(LEADING_H1.replace(&html, "$1").into_owned())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mailing::Block;

    fn context(value: serde_json::Value) -> Context {
        value.as_object().cloned().unwrap_or_default()
    }

    fn template() -> EmailTemplate {
        EmailTemplate {
            subject: "Hallo\n {{ name }}".to_string(),
            blocks: vec![
                Block::Header {
                    title: "Neuigkeiten".to_string(),
                    image: None,
                },
                Block::Text {
                    text: "Liebe*r {{ name }},\n\n\n\nschön, dass du da bist.".to_string(),
                    html: String::new(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn renders_both_channels() {
        let config = Config::default();
        let ctx = context(json!({"name": "Jane <Doe>", "unsubscribe_url": "https://example.com/u/1/"}));
        let content = render_email(&template(), &ctx, &config).unwrap();
        assert_eq!(content.subject, "Hallo Jane <Doe>");
        assert!(content.text.contains("Liebe*r Jane <Doe>,\r\n\r\nschön"));
        assert!(content.text.contains("https://example.com/u/1/"));
        let html = content.html.unwrap();
        assert!(html.contains("Jane &lt;Doe&gt;"));
        assert!(html.contains("href=\"https://example.com/u/1/\""));
    }

    #[test]
    fn leftover_markers_are_fatal() {
        let config = Config::default();
        let mut template = template();
        template.text = "Kaputt {{ name".to_string();
        let err = render_text(&template, &Context::new(), &config);
        assert!(err.is_err());

        template.text = "Literal }} braces".to_string();
        let err = render_text(&template, &Context::new(), &config).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnresolvedTemplate(_)));
    }

    #[test]
    fn patterns_compile() {
        for pattern in [&COLLAPSE_NEWLINES, &BREAKS, &BLOCK_ENDS, &TAGS, &LEADING_H1] {
            LazyLock::force(pattern);
        }
        assert_eq!(collapse_newlines("a\n\n\n\nb"), "a\r\n\r\nb");
    }

    #[test]
    fn html_to_text_keeps_paragraphs() {
        assert_eq!(
            html_to_text("<p>Eins &amp; zwei</p><p>drei<br>vier</p>"),
            "Eins & zwei\n\ndrei\nvier"
        );
    }

    #[test]
    fn web_html_drops_leading_heading() {
        let html = render_web_html(&template(), &Context::new()).unwrap();
        assert!(!html.contains("<h1>"));
        assert!(html.contains("schön"));
    }
}
