/// Bound on the body text kept in a stored record.
pub const STORED_BODY_CHARS: usize = 500;

const ELLIPSIS: &str = "...";

/// Keep the first 500 characters, marking the cut with "...".
pub fn truncate_body(body: &str) -> String {
    truncate_chars(body, STORED_BODY_CHARS)
}

pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{ELLIPSIS}", &s[..idx]),
        None => s.to_string(),
    }
}

/// First `max_chars` characters, no marker.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
