//! Input preparation and keyword post-processing.

use crate::result::{FailureKind, Keyword};

/// Longest input passed to the model, in characters.
pub const MAX_INPUT_CHARS: usize = 800;

/// Longest keyword string kept, in characters.
pub const MAX_KEYWORD_CHARS: usize = 40;

const QUOTE_PAIRS: [(char, char); 4] = [('"', '"'), ('\'', '\''), ('“', '”'), ('‘', '’')];

/// Places where a truncated keyword may be cut.
const BREAK_CHARS: &[char] = &['。', '，', '、', '；', '.', ',', ';', '!', '?', '！', '？'];

/// Characters trimmed from both ends of the final keyword.
const EDGE_PUNCTUATION: &[char] = &[
    '，', '。', '、', '；', '：', '！', '？', '.', ',', ';', ':', '!', '?',
];

/// Trim and bound the text sent to the model.
///
/// Empty input can never succeed, so it is classified `Permanent` up front.
pub fn prepare_text(text: &str) -> Result<String, FailureKind> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(FailureKind::permanent("input text is empty"));
    }
    Ok(trimmed.chars().take(MAX_INPUT_CHARS).collect())
}

/// Normalize raw model output into a [`Keyword`]. Returns `None` when
/// nothing usable is left.
pub fn clean_keyword(raw: &str) -> Option<Keyword> {
    let mut s = strip_quotes(raw.trim()).trim();

    let truncated: String;
    if s.chars().count() > MAX_KEYWORD_CHARS {
        let head: String = s.chars().take(MAX_KEYWORD_CHARS).collect();
        truncated = match head.rfind(BREAK_CHARS) {
            Some(idx) => {
                // Keep the break character itself; edge trimming removes it below.
                let end = idx + head[idx..].chars().next().map_or(0, char::len_utf8);
                head[..end].to_string()
            }
            None => head,
        };
        s = &truncated;
    }

    let cleaned = s
        .trim_matches(|c: char| c.is_whitespace() || EDGE_PUNCTUATION.contains(&c))
        .to_string();

    if cleaned.is_empty() {
        None
    } else {
        Some(Keyword::new_unchecked(cleaned))
    }
}

fn strip_quotes(s: &str) -> &str {
    for (open, close) in QUOTE_PAIRS {
        if let Some(inner) = s.strip_prefix(open).and_then(|rest| rest.strip_suffix(close)) {
            return inner;
        }
    }
    s
}
