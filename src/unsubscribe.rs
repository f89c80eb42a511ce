//! List-Unsubscribe header extraction (RFC 2369 / RFC 8058)

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{Message, UnsubscribeInfo};

pub const LIST_UNSUBSCRIBE: &str = "List-Unsubscribe";
pub const LIST_UNSUBSCRIBE_POST: &str = "List-Unsubscribe-Post";

static BRACKETED_HTTP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(https?://[^>]+)>").expect("valid regex"));

static BARE_HTTP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(https?://[^\s,<>]+)").expect("valid regex"));

static BRACKETED_MAILTO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(mailto:[^>]+)>").expect("valid regex"));

static BARE_MAILTO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(mailto:[^\s,<>]+)").expect("valid regex"));

fn first_capture(re: &Regex, value: &str) -> Option<String> {
    re.captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Extract unsubscribe affordances from the raw header values
///
/// `list_unsubscribe` is the `List-Unsubscribe` value, `list_unsubscribe_post`
/// the companion `List-Unsubscribe-Post` value. Without a `List-Unsubscribe`
/// header the message has no affordance, whatever the companion says.
pub fn extract(list_unsubscribe: Option<&str>, list_unsubscribe_post: Option<&str>) -> UnsubscribeInfo {
    let value = match list_unsubscribe {
        Some(v) if !v.trim().is_empty() => v,
        _ => return UnsubscribeInfo::default(),
    };

    let http_link =
        first_capture(&BRACKETED_HTTP, value).or_else(|| first_capture(&BARE_HTTP, value));

    // Extracted even when an HTTP link exists: senders often offer both
    let mailto_link =
        first_capture(&BRACKETED_MAILTO, value).or_else(|| first_capture(&BARE_MAILTO, value));

    let one_click = list_unsubscribe_post
        .map(|post| post.to_ascii_lowercase().contains("list-unsubscribe=one-click"))
        .unwrap_or(false);

    UnsubscribeInfo {
        http_link,
        mailto_link,
        one_click,
    }
}

/// Extract from a message's own headers
pub fn extract_from_message(message: &Message) -> UnsubscribeInfo {
    extract(
        message.header(LIST_UNSUBSCRIBE),
        message.header(LIST_UNSUBSCRIBE_POST),
    )
}

/// Store the extraction result on the message
pub fn annotate(message: &mut Message) {
    message.unsubscribe = extract_from_message(message);
}
