use crate::protocol::ServerMessage;
use crate::transport::TransportError;

const BULLET_MARKERS: [char; 3] = ['*', '-', '•'];

/// Result of a single send/await round.
#[derive(Debug)]
pub enum RoundOutcome {
    /// One or more normalized labels, not yet deduplicated.
    Usable(Vec<String>),
    /// Well-formed reply without any label in it.
    Empty,
    /// No reply within the response window.
    Timeout,
    /// Reply did not carry a model turn.
    ParseError(String),
    TransportError(TransportError),
}

impl RoundOutcome {
    /// Short name used as a metric attribute and log field.
    pub fn kind(&self) -> &'static str {
        match self {
            RoundOutcome::Usable(_) => "usable",
            RoundOutcome::Empty => "empty",
            RoundOutcome::Timeout => "timeout",
            RoundOutcome::ParseError(_) => "parse_error",
            RoundOutcome::TransportError(_) => "transport_error",
        }
    }
}

pub struct ResponseParser;

impl ResponseParser {
    pub fn parse(raw: &str) -> RoundOutcome {
        let message: ServerMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => return RoundOutcome::ParseError(format!("invalid server message: {}", e)),
        };

        let Some(model_turn) = message
            .server_content
            .and_then(|content| content.model_turn)
        else {
            return RoundOutcome::ParseError("message carries no model turn".to_string());
        };

        let full_text = model_turn
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .map(str::trim)
            .collect::<Vec<_>>()
            .join(" ");

        let labels = extract_labels(&full_text);
        if labels.is_empty() {
            RoundOutcome::Empty
        } else {
            RoundOutcome::Usable(labels)
        }
    }
}

pub fn extract_labels(text: &str) -> Vec<String> {
    text.lines().filter_map(normalize_line).collect()
}

fn normalize_line(line: &str) -> Option<String> {
    let label = strip_marker(line.trim()).trim_matches(|c: char| c == '*' || c.is_whitespace());
    if label.is_empty() {
        None
    } else {
        Some(label.to_string())
    }
}

/// Drops a leading `* `, `- `, `• `, `1. ` or `1) ` marker.
fn strip_marker(line: &str) -> &str {
    let mut chars = line.chars();
    if let Some(first) = chars.next() {
        if BULLET_MARKERS.contains(&first) {
            let rest = chars.as_str();
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                return rest.trim_start();
            }
        }
    }

    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(after) = rest.strip_prefix(|c: char| c == '.' || c == ')') {
            if after.is_empty() || after.starts_with(char::is_whitespace) {
                return after.trim_start();
            }
        }
    }

    line
}
