//! Outbound text framing for size-limited channels.
//!
//! Chat front-ends cap message length (4 000 characters for the bridge
//! variant; the direct-web path is unbounded). Oversized text is split into
//! chunks prefixed `[i/N]`, cutting preferentially at the last newline in
//! the window, then at the last whitespace past the halfway mark, then hard.
//! Channels that render inline HTML get `&`, `<` and `>` escaped; a failed
//! markup send falls back to the plain-text form.

/// Message-length cap for the chat front-end variant.
pub const CHAT_CHUNK_LIMIT: usize = 4000;

/// Room reserved for the `[i/N]\n` prefix when a message must be split.
const PREFIX_RESERVE: usize = 10;

/// Split `text` into at most `limit`-character pieces.
///
/// A message that fits is returned whole and unprefixed. Otherwise each
/// chunk is prefixed `[i/N]\n`. Cut preference within each window: last
/// newline, else last whitespace past the halfway mark, else a hard cut at
/// the window edge. Cuts always land on `char` boundaries.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let budget = limit.saturating_sub(PREFIX_RESERVE).max(1);
    let mut bodies: Vec<String> = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let chars: Vec<(usize, char)> = rest.char_indices().take(budget + 1).collect();
        if chars.len() <= budget {
            bodies.push(rest.to_string());
            break;
        }
        // Byte offset one past the last character that fits.
        let window_end = chars[budget].0;
        let window = &rest[..window_end];

        let cut = match window.rfind('\n') {
            Some(pos) if pos > 0 => CutAt::Separator(pos),
            _ => {
                let half = chars[budget / 2].0;
                match window[half..]
                    .rfind(char::is_whitespace)
                    .map(|pos| half + pos)
                {
                    Some(pos) => CutAt::Separator(pos),
                    None => CutAt::Hard(window_end),
                }
            }
        };

        match cut {
            CutAt::Separator(pos) => {
                bodies.push(rest[..pos].to_string());
                // The separator itself is replaced by the chunk boundary.
                let sep_len = rest[pos..].chars().next().map_or(0, char::len_utf8);
                rest = &rest[pos + sep_len..];
            }
            CutAt::Hard(pos) => {
                bodies.push(rest[..pos].to_string());
                rest = &rest[pos..];
            }
        }
    }

    let total = bodies.len();
    bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| format!("[{}/{}]\n{}", i + 1, total, body))
        .collect()
}

enum CutAt {
    Separator(usize),
    Hard(usize),
}

/// Strict escaping of interpolated content for HTML-rendering channels.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}
