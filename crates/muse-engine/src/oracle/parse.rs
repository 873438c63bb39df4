use serde::Deserialize;

/// One grid position the judge picked, 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pick {
    pub position: usize,
    pub reason: Option<String>,
}

/// Which link of the parse chain produced the picks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    Structured,
    FreeText,
    Nothing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSelection {
    pub picks: Vec<Pick>,
    pub strategy: ParseStrategy,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Position {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Position {
    fn value(&self) -> Option<i64> {
        match self {
            Position::Int(value) => Some(*value),
            Position::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            Position::Float(_) => None,
            Position::Text(raw) => raw.trim().trim_start_matches('#').parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Entry {
    Bare(Position),
    Object {
        #[serde(default)]
        number: Option<Position>,
        #[serde(default)]
        image_number: Option<Position>,
        #[serde(default)]
        rank: Option<Position>,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl Entry {
    fn into_candidate(self) -> Option<(i64, Option<String>)> {
        match self {
            Entry::Bare(position) => position.value().map(|value| (value, None)),
            Entry::Object {
                number,
                image_number,
                rank,
                reason,
            } => number
                .or(image_number)
                .or(rank)
                .and_then(|position| position.value())
                .map(|value| (value, reason.filter(|text| !text.trim().is_empty()))),
        }
    }
}

/// Accepted reply shapes, most preferred first.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope {
    Canonical {
        best_images: Vec<Entry>,
    },
    Rankings {
        rankings: Vec<Entry>,
    },
    Ranking {
        ranking: Vec<Entry>,
    },
    CamelCase {
        #[serde(rename = "bestImages")]
        best_images: Vec<Entry>,
    },
    List(Vec<Entry>),
}

impl Envelope {
    fn into_entries(self) -> Vec<Entry> {
        match self {
            Envelope::Canonical { best_images } => best_images,
            Envelope::Rankings { rankings } => rankings,
            Envelope::Ranking { ranking } => ranking,
            Envelope::CamelCase { best_images } => best_images,
            Envelope::List(entries) => entries,
        }
    }
}

/// Turns a judge reply into at most `limit` distinct positions in `1..=total`.
///
/// Structured payloads are looked for in a fenced block, the whole reply, the
/// first balanced object and the first balanced array, in that order. Only
/// when none of them decodes are bare integers pulled from the prose.
pub fn parse_selection(text: &str, total: usize, limit: usize) -> ParsedSelection {
    let structured = payload_candidates(text)
        .into_iter()
        .find_map(|candidate| serde_json::from_str::<Envelope>(candidate).ok());

    let (raw, strategy) = match structured {
        Some(envelope) => (
            envelope
                .into_entries()
                .into_iter()
                .filter_map(Entry::into_candidate)
                .collect::<Vec<_>>(),
            ParseStrategy::Structured,
        ),
        None => (
            bare_integers(text)
                .into_iter()
                .map(|value| (value, None))
                .collect(),
            ParseStrategy::FreeText,
        ),
    };

    let mut picks: Vec<Pick> = Vec::new();
    for (value, reason) in raw {
        if picks.len() >= limit {
            break;
        }
        if value < 1 || value as u64 > total as u64 {
            continue;
        }
        let position = value as usize;
        if picks.iter().any(|pick| pick.position == position) {
            continue;
        }
        picks.push(Pick { position, reason });
    }

    let strategy = if picks.is_empty() {
        ParseStrategy::Nothing
    } else {
        strategy
    };
    ParsedSelection { picks, strategy }
}

fn payload_candidates(text: &str) -> Vec<&str> {
    let trimmed = text.trim();
    let mut candidates = Vec::new();
    if let Some(block) = fenced_block(trimmed) {
        candidates.push(block);
    }
    candidates.push(trimmed);
    if let Some(object) = first_balanced(trimmed, '{', '}') {
        candidates.push(object);
    }
    if let Some(array) = first_balanced(trimmed, '[', ']') {
        candidates.push(array);
    }
    candidates
}

/// Body of the first ``` fence, minus an optional language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n').map_or(0, |idx| idx + 1);
    let tag = after[..body_start].trim();
    let body_start = if tag.is_empty() || tag.chars().all(char::is_alphanumeric) {
        body_start
    } else {
        0
    };
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// First `open`..`close` span with balanced nesting, ignoring string contents.
fn first_balanced(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(&text[start..start + offset + ch.len_utf8()]);
            }
        }
    }
    None
}

/// Integers standing alone as words (`3`, `#4`, `(5)`), not glued to letters.
fn bare_integers(text: &str) -> Vec<i64> {
    let chars: Vec<char> = text.chars().collect();
    let is_word = |ch: char| ch.is_alphanumeric() || ch == '_';
    let mut values = Vec::new();
    let mut idx = 0;
    while idx < chars.len() {
        if !chars[idx].is_ascii_digit() {
            idx += 1;
            continue;
        }
        let start = idx;
        while idx < chars.len() && chars[idx].is_ascii_digit() {
            idx += 1;
        }
        let before_ok = start == 0 || !is_word(chars[start - 1]);
        let after_ok = idx == chars.len() || !is_word(chars[idx]);
        if before_ok && after_ok {
            let digits: String = chars[start..idx].iter().collect();
            if let Ok(value) = digits.parse::<i64>() {
                values.push(value);
            }
        }
    }
    values
}
