use chrono::{DateTime, Utc};

use crate::db::{Collectable, Database, Id, Identifiable};
use crate::Result;

use super::render::{escape_html, html_to_text, text_to_html};
use super::Context;

/// Base layout the html channel is wrapped in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseLayout {
    #[default]
    Default,
    /// Table based layout in the style of mjml output.
    Mjml,
}

/// Presence or equality test on a context value.
///
/// `key` may be a dotted path into nested objects, e.g. `donor.city`. With
/// an empty `value` the test checks that the key is present and truthy.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Condition {
    pub key: String,
    pub value: String,
    pub negate: bool,
}

impl Condition {
    pub fn matches(&self, context: &Context) -> bool {
        let mut parts = self.key.split('.');
        let mut current = parts.next().and_then(|first| context.get(first));
        for part in parts {
            current = current.and_then(|v| v.get(part));
        }
        let result = match current {
            None => false,
            Some(value) if self.value.is_empty() => is_truthy(value),
            Some(serde_json::Value::String(s)) => *s == self.value,
            Some(value) => value.to_string() == self.value,
        };
        result != self.negate
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Content block of a template body.
///
/// Text fields may contain template variables, which are resolved after
/// the blocks are assembled.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    /// Rich text, pre-rendered to html by the editor. `text` is the plain
    /// rendition, derived from the html when empty.
    Text {
        #[serde(default)]
        text: String,
        #[serde(default)]
        html: String,
    },
    Action {
        heading: String,
        text: String,
        url: String,
        label: String,
    },
    Button {
        url: String,
        label: String,
    },
    Section {
        heading: String,
        blocks: Vec<Block>,
    },
    Story {
        heading: String,
        text: String,
        url: String,
        #[serde(default)]
        label: String,
        #[serde(default)]
        image: Option<String>,
    },
    Header {
        title: String,
        #[serde(default)]
        image: Option<String>,
    },
    Picture {
        src: String,
        #[serde(default)]
        alt: String,
        #[serde(default)]
        url: Option<String>,
    },
    Condition {
        condition: Condition,
        blocks: Vec<Block>,
    },
}

impl Block {
    pub fn render_text(&self, context: &Context) -> String {
        match self {
            Block::Text { text, html } => {
                if text.is_empty() {
                    html_to_text(html)
                } else {
                    text.clone()
                }
            }
            Block::Action {
                heading,
                text,
                url,
                label,
            } => format!("{heading}\n\n{text}\n\n{label}: {url}"),
            Block::Button { url, label } => format!("{label}: {url}"),
            Block::Section { heading, blocks } => {
                let underline = "=".repeat(heading.chars().count());
                let children = render_blocks_text(blocks, context);
                format!("{heading}\n{underline}\n\n{children}")
            }
            Block::Story {
                heading,
                text,
                url,
                label,
                ..
            } => {
                let label = if label.is_empty() { "Weiterlesen" } else { label };
                format!("{heading}\n\n{text}\n\n{label}: {url}")
            }
            Block::Header { title, .. } => title.clone(),
            Block::Picture { .. } => String::new(),
            Block::Condition { condition, blocks } => {
                if condition.matches(context) {
                    render_blocks_text(blocks, context)
                } else {
                    String::new()
                }
            }
        }
    }

    pub fn render_html(&self, context: &Context) -> String {
        match self {
            Block::Text { text, html } => {
                if html.is_empty() {
                    text_to_html(text)
                } else {
                    html.clone()
                }
            }
            Block::Action {
                heading,
                text,
                url,
                label,
            } => format!(
                "<div class=\"action\"><h3>{}</h3>{}<p><a class=\"button\" href=\"{}\">{}</a></p></div>",
                escape_html(heading),
                text_to_html(text),
                escape_html(url),
                escape_html(label)
            ),
            Block::Button { url, label } => format!(
                "<p class=\"button\"><a class=\"button\" href=\"{}\">{}</a></p>",
                escape_html(url),
                escape_html(label)
            ),
            Block::Section { heading, blocks } => format!(
                "<div class=\"section\"><h2>{}</h2>{}</div>",
                escape_html(heading),
                render_blocks_html(blocks, context)
            ),
            Block::Story {
                heading,
                text,
                url,
                label,
                image,
            } => {
                let label = if label.is_empty() { "Weiterlesen" } else { label };
                let image = image
                    .as_ref()
                    .map(|src| format!("<img src=\"{}\" alt=\"\" width=\"100%\">", escape_html(src)))
                    .unwrap_or_default();
                format!(
                    "<div class=\"story\">{}<h3><a href=\"{}\">{}</a></h3>{}<p><a href=\"{}\">{}</a></p></div>",
                    image,
                    escape_html(url),
                    escape_html(heading),
                    text_to_html(text),
                    escape_html(url),
                    escape_html(label)
                )
            }
            Block::Header { title, image } => {
                let image = image
                    .as_ref()
                    .map(|src| format!("<img src=\"{}\" alt=\"\" width=\"100%\">", escape_html(src)))
                    .unwrap_or_default();
                format!("{}<h1>{}</h1>", image, escape_html(title))
            }
            Block::Picture { src, alt, url } => {
                let img = format!(
                    "<img src=\"{}\" alt=\"{}\" width=\"100%\">",
                    escape_html(src),
                    escape_html(alt)
                );
                match url {
                    Some(url) => format!("<p><a href=\"{}\">{}</a></p>", escape_html(url), img),
                    None => format!("<p>{}</p>", img),
                }
            }
            Block::Condition { condition, blocks } => {
                if condition.matches(context) {
                    render_blocks_html(blocks, context)
                } else {
                    String::new()
                }
            }
        }
    }
}

pub fn render_blocks_text(blocks: &[Block], context: &Context) -> String {
    blocks
        .iter()
        .map(|b| b.render_text(context))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn render_blocks_html(blocks: &[Block], context: &Context) -> String {
    blocks
        .iter()
        .map(|b| b.render_html(context))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Named, versioned mail template.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EmailTemplate {
    pub id: Id,
    pub name: String,
    pub category: String,

    pub subject: String,
    pub preheader: String,
    /// Plain text body. When empty the text channel is derived from the
    /// blocks.
    pub text: String,
    pub blocks: Vec<Block>,
    pub layout: BaseLayout,

    pub active: bool,
    /// Intent this template renders, e.g. `subscriber_welcome`.
    pub mail_intent: Option<String>,
    pub version: u32,

    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Default for EmailTemplate {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            category: String::new(),
            subject: String::new(),
            preheader: String::new(),
            text: String::new(),
            blocks: vec![],
            layout: BaseLayout::Default,
            active: true,
            mail_intent: None,
            version: 1,
            created: Utc::now(),
            updated: Utc::now(),
        }
    }
}

impl Collectable for EmailTemplate {
    fn get_collection_name() -> &'static str {
        "email_templates"
    }
}

impl Identifiable for EmailTemplate {
    fn get_id(&self) -> Id {
        self.id
    }
}

impl EmailTemplate {
    pub fn new(db: &Database, name: &str) -> Result<Self> {
        Ok(Self {
            id: db.generate_id()?,
            name: name.to_string(),
            ..Default::default()
        })
    }

    /// Text body source, before variables are resolved.
    pub fn body_text(&self, context: &Context) -> String {
        if !self.text.is_empty() {
            return self.text.clone();
        }
        render_blocks_text(&self.blocks, context)
    }

    /// Html body source, before variables are resolved.
    pub fn body_html(&self, context: &Context) -> String {
        if self.blocks.is_empty() {
            return text_to_html(&self.text);
        }
        render_blocks_html(&self.blocks, context)
    }
}

/// Active template for the intent, newest version first.
pub fn find_for_intent(db: &Database, intent: &str) -> Result<Option<EmailTemplate>> {
    let mut templates = db.filter::<EmailTemplate, _>(|t| {
        t.active && t.mail_intent.as_deref() == Some(intent)
    })?;
    templates.sort_by(|a, b| b.version.cmp(&a.version).then(b.id.cmp(&a.id)));
    Ok(templates.into_iter().next())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn context(value: serde_json::Value) -> Context {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn condition_presence_and_value() {
        let ctx = context(json!({"donor": {"city": "Berlin"}, "is_donor": true, "tags": []}));
        let presence = Condition {
            key: "is_donor".to_string(),
            ..Default::default()
        };
        assert!(presence.matches(&ctx));

        let equality = Condition {
            key: "donor.city".to_string(),
            value: "Berlin".to_string(),
            ..Default::default()
        };
        assert!(equality.matches(&ctx));

        let negated = Condition {
            key: "tags".to_string(),
            negate: true,
            ..Default::default()
        };
        assert!(negated.matches(&ctx));

        let missing = Condition {
            key: "subscriber_id".to_string(),
            ..Default::default()
        };
        assert!(!missing.matches(&ctx));
    }

    #[test]
    fn conditional_blocks_render_only_when_matching() {
        let block = Block::Condition {
            condition: Condition {
                key: "is_donor".to_string(),
                ..Default::default()
            },
            blocks: vec![Block::Button {
                url: "https://example.com/spenden/".to_string(),
                label: "Danke".to_string(),
            }],
        };
        let donor = context(json!({"is_donor": true}));
        let other = context(json!({"is_donor": false}));
        assert_eq!(block.render_text(&donor), "Danke: https://example.com/spenden/");
        assert_eq!(block.render_text(&other), "");
        assert!(block.render_html(&donor).contains("href=\"https://example.com/spenden/\""));
    }

    #[test]
    fn blocks_deserialize_from_tagged_yaml() {
        let blocks: Vec<Block> = serde_yaml::from_str(
            r#"
            - type: header
              title: Hallo {{ name }}
            - type: text
              html: "<p>Neu bei uns</p>"
            "#,
        )
        .unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            render_blocks_text(&blocks, &Context::new()),
            "Hallo {{ name }}\n\nNeu bei uns"
        );
    }
}
