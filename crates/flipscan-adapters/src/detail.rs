//! Listing detail page helpers: visible text, contact reveal, first picture.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;
use scraper::{Html, Node};

use crate::{select_first_attr, text_or_none};

/// Placeholder the marketplace embeds in reply links in place of its reply service path.
pub const SERVICE_ID_PLACEHOLDER: &str = "__SERVICE_ID__";

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("valid email regex")
});

static SERVICE_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"/__SERVICE_ID__/[^"'\s<>]+"#).expect("valid token regex")
});

static SCRIPT_IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""url"\s*:\s*"(https?:(?:\\?/){2}[^"]+?\.(?:jpe?g|png|webp))""#).expect("valid image regex")
});

/// Page text with `script`, `style` and `noscript` content removed.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut parts = Vec::new();
    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript"))
        });
        if !hidden {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed.to_string());
            }
        }
    }
    parts.join(" ")
}

/// Reply-service token from the detail markup, still carrying the placeholder.
pub fn contact_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let from_markup = [
        (".reply-button", "data-href"),
        ("button.reply-button", "data-href"),
        ("a#replylink", "href"),
    ]
    .iter()
    .find_map(|(selector, attr)| select_first_attr(&document, selector, attr).ok().flatten());

    from_markup.or_else(|| {
        SERVICE_TOKEN_RE
            .find(html)
            .map(|m| m.as_str().to_string())
    })
}

/// Absolute reveal URL for a listing, with the placeholder replaced by `service_id`.
pub fn reveal_contact_url(listing_url: &str, token: &str, service_id: &str) -> Option<String> {
    let base = Url::parse(listing_url).ok()?;
    let path = token.replace(SERVICE_ID_PLACEHOLDER, service_id.trim_matches('/'));
    base.join(&path).ok().map(|u| u.to_string())
}

pub fn first_email(text: &str) -> Option<String> {
    EMAIL_RE.find(text).map(|m| m.as_str().to_string())
}

/// Email from a contact-reveal response: a mailto anchor first, then any address in the text.
pub fn email_from_contact_page(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let mailto = select_first_attr(&document, "a[href^='mailto:']", "href")
        .ok()
        .flatten()
        .and_then(|href| {
            let address = href.trim_start_matches("mailto:");
            let address = address.split('?').next().unwrap_or_default();
            text_or_none(address.to_string())
        });
    mailto.or_else(|| first_email(&visible_text(html)))
}

/// First listing image: gallery markup, then image data embedded in scripts.
/// Relative links resolve against `listing_url`.
pub fn first_picture_url(html: &str, listing_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let from_markup = [
        ("div.slide.first img", "src"),
        ("div.gallery img", "src"),
        ("#thumbs a", "href"),
        ("meta[property='og:image']", "content"),
    ]
    .iter()
    .find_map(|(selector, attr)| select_first_attr(&document, selector, attr).ok().flatten());

    let raw = from_markup.or_else(|| {
        SCRIPT_IMAGE_RE
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().replace("\\/", "/"))
    })?;
    match Url::parse(listing_url) {
        Ok(base) => base.join(&raw).ok().map(|u| u.to_string()),
        Err(_) => Url::parse(&raw).ok().map(|u| u.to_string()),
    }
}

/// Lowercase image extension from the URL path, defaulting to `jpg`.
pub fn picture_extension(url: &str) -> &'static str {
    let Ok(parsed) = Url::parse(url) else {
        return "jpg";
    };
    let ext = parsed
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .and_then(|last| last.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpeg") => "jpeg",
        Some("png") => "png",
        Some("webp") => "webp",
        Some("gif") => "gif",
        _ => "jpg",
    }
}
