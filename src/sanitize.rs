use std::sync::LazyLock;

use regex::Regex;

/// Telegram's hard limit for a text message, in characters
pub const MAX_MESSAGE_CHARS: usize = 4096;
/// Telegram's limit for a media caption
pub const MAX_CAPTION_CHARS: usize = 1024;

const TRUNCATION_MARKER: &str = "...";
const EMPTY_BODY: &str = "(no text content)";

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bhttps?://\S+").expect("valid URL pattern"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Strip invisible characters, URLs and redundant whitespace from a body
pub fn clean_text(text: &str) -> String {
    let visible: String = text.chars().filter(|c| is_kept(*c)).collect();
    let without_urls = URL_RE.replace_all(&visible, " ");
    WHITESPACE_RE
        .replace_all(&without_urls, " ")
        .trim()
        .to_string()
}

fn is_kept(c: char) -> bool {
    if c == '\n' || c == '\t' {
        return true;
    }
    if c.is_control() {
        return false;
    }
    // zero-width and bidi formatting characters
    !matches!(
        c,
        '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}'
    )
}

/// Cut `text` to at most `limit` characters, ending with a marker when cut
pub fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let keep = limit.saturating_sub(TRUNCATION_MARKER.chars().count());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Cut to at most `limit` characters without a marker
pub fn take_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Build the relayed text: attribution header, separator, cleaned body
pub fn compose(source: &str, timestamp: &str, body: &str) -> String {
    let body = if body.is_empty() { EMPTY_BODY } else { body };
    let text = format!(
        "🔄 Forwarded from: {}\n⏰ Time: {}\n{}\n\n{}",
        source,
        timestamp,
        "=".repeat(30),
        body
    );
    truncate(&text, MAX_MESSAGE_CHARS)
}

/// HTML parse-mode form of a composed text; user content must never be read
/// as markup
pub fn to_html(text: &str) -> String {
    teloxide::utils::html::escape(text)
}

/// Text-only fallback when media could not be relayed
pub fn media_note(forward_text: &str, media_description: &str) -> String {
    let note = format!(
        "\n\n[Note: the original message contained {}, which could not be relayed]",
        media_description
    );
    let room = MAX_MESSAGE_CHARS.saturating_sub(note.chars().count());
    format!("{}{}", truncate(forward_text, room), note)
}
