//! Campaign tagging of links in rendered mail.
//!
//! Links to the site origin get a `pk_campaign` query parameter. External
//! links, links that already carry a campaign and tracking pixels are left
//! alone.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use url::Url;

pub const CAMPAIGN_PARAM: &str = "pk_campaign";

static URL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'()\[\]]+"#).expect("url pattern"));

/// Tags every site-internal URL in `text` with the campaign. With `html`
/// set, `&amp;` inside matched URLs is understood as `&` and written back
/// escaped.
pub fn tag_urls(text: &str, site: &Url, campaign: &str, html: bool) -> String {
    URL_PATTERN
        .replace_all(text, |caps: &Captures| {
            let matched = &caps[0];
            let url = matched.trim_end_matches(['.', ',', ';', ':', '!', '?']);
            let rest = &matched[url.len()..];
            match tag_url(url, site, campaign, html) {
                Some(tagged) => format!("{tagged}{rest}"),
                None => matched.to_string(),
            }
        })
        .into_owned()
}

fn tag_url(url: &str, site: &Url, campaign: &str, html: bool) -> Option<String> {
    let raw = if html {
        url.replace("&amp;", "&")
    } else {
        url.to_string()
    };
    let parsed = Url::parse(&raw).ok()?;
    if parsed.origin() != site.origin() {
        return None;
    }
    if parsed.path().ends_with(".gif") {
        return None;
    }
    if parsed.query_pairs().any(|(key, _)| key == CAMPAIGN_PARAM) {
        return None;
    }

    let (base, fragment) = match raw.find('#') {
        Some(pos) => raw.split_at(pos),
        None => (raw.as_str(), ""),
    };
    let separator = match base.find('?') {
        None => "?",
        Some(_) if base.ends_with('?') || base.ends_with('&') => "",
        Some(_) => "&",
    };
    let tagged = format!("{base}{separator}{CAMPAIGN_PARAM}={campaign}{fragment}");
    Some(if html {
        tagged.replace('&', "&amp;")
    } else {
        tagged
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> Url {
        Url::parse("https://example.com").unwrap()
    }

    #[test]
    fn tags_internal_link_before_punctuation() {
        assert_eq!(
            tag_urls(
                "Visit https://example.com/page for more info.",
                &site(),
                "campaign123",
                false
            ),
            "Visit https://example.com/page?pk_campaign=campaign123 for more info."
        );
        assert_eq!(
            tag_urls("See https://example.com/page.", &site(), "c", false),
            "See https://example.com/page?pk_campaign=c."
        );
    }

    #[test]
    fn appends_to_existing_query() {
        assert_eq!(
            tag_urls(
                "https://example.com/page?empty_param=",
                &site(),
                "campaign123",
                false
            ),
            "https://example.com/page?empty_param=&pk_campaign=campaign123"
        );
    }

    #[test]
    fn leaves_external_and_tagged_links() {
        let text = "https://external.com/page and https://example.com/?pk_campaign=old";
        assert_eq!(tag_urls(text, &site(), "new", false), text);
    }

    #[test]
    fn keeps_fragment_last() {
        assert_eq!(
            tag_urls("https://example.com/faq#spenden", &site(), "c", false),
            "https://example.com/faq?pk_campaign=c#spenden"
        );
    }

    #[test]
    fn html_entities_round_trip() {
        assert_eq!(
            tag_urls(
                r#"<a href="https://example.com/action/?foo=bar&amp;bar=baz">x</a>"#,
                &site(),
                "mailing-202412131242-1",
                true
            ),
            r#"<a href="https://example.com/action/?foo=bar&amp;bar=baz&amp;pk_campaign=mailing-202412131242-1">x</a>"#
        );
    }

    #[test]
    fn skips_tracking_pixels() {
        let text = r#"<img src="https://example.com/mailing/1/abc/def.gif">"#;
        assert_eq!(tag_urls(text, &site(), "c", true), text);
    }
}
