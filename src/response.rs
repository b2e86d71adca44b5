//! Parser for free-text classifier responses.
//!
//! The classifier is asked for `{"column": ..., "value": ...}` and nothing
//! else, but models wrap answers in prose, markdown fences, or Python-style
//! single quotes. [`parse_signature`] handles those shapes explicitly:
//!
//! 1. Find every balanced `{...}` block, honouring both quote styles so braces
//!    inside strings don't count.
//! 2. Normalize each block to strict JSON: single-quoted strings become
//!    double-quoted, typographic quotes become ASCII, a stray literal `\n`
//!    between tokens is treated as whitespace.
//! 3. Parse the first block that is valid JSON and validate its field set.
//!
//! Each way this can go wrong has its own [`ResponseParseError`] variant.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::Signature;

const FIELDS: [&str; 2] = ["column", "value"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResponseParseError {
    #[error("response is empty")]
    Empty,
    #[error("response contains no '{{' ... '}}' block")]
    MissingBraces,
    #[error("response has an opening brace at byte {0} that is never closed")]
    Unbalanced(usize),
    #[error("invalid escape sequence outside a string at byte {0}")]
    InvalidEscape(usize),
    #[error("no JSON block in the response could be parsed: {0}")]
    InvalidJson(String),
    #[error("response JSON is not an object")]
    NotAnObject,
    #[error("response JSON is missing field '{0}'")]
    MissingField(&'static str),
    #[error("response JSON has unexpected field '{0}'")]
    UnexpectedField(String),
    #[error("response field '{0}' has an unusable type")]
    InvalidValue(&'static str),
    #[error("response 'column' is empty")]
    EmptyColumn,
}

/// Extracts and validates a [`Signature`] from raw classifier output.
pub fn parse_signature(raw: &str) -> Result<Signature, ResponseParseError> {
    let object = extract_object(raw)?;
    signature_from_object(&object)
}

/// Finds the first balanced block that parses as JSON after normalization.
pub fn extract_object(raw: &str) -> Result<Value, ResponseParseError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ResponseParseError::Empty);
    }

    let blocks = balanced_blocks(text)?;
    let mut first_error = None;
    for (start, end) in blocks {
        let candidate = match normalize_quotes(&text[start..end]) {
            Ok(c) => c,
            Err(ResponseParseError::InvalidEscape(offset)) => {
                first_error.get_or_insert(ResponseParseError::InvalidEscape(start + offset));
                continue;
            }
            Err(e) => return Err(e),
        };
        match serde_json::from_str::<Value>(&candidate) {
            Ok(value) => return Ok(value),
            Err(e) => {
                first_error.get_or_insert(ResponseParseError::InvalidJson(e.to_string()));
            }
        }
    }
    Err(first_error.unwrap_or(ResponseParseError::MissingBraces))
}

/// Byte ranges of every top-level balanced `{...}` block, in order.
fn balanced_blocks(text: &str) -> Result<Vec<(usize, usize)>, ResponseParseError> {
    let bytes: Vec<(usize, char)> = text.char_indices().collect();
    let mut blocks = Vec::new();
    let mut i = 0;
    let mut unbalanced = None;

    while i < bytes.len() {
        let (start, c) = bytes[i];
        if c != '{' {
            i += 1;
            continue;
        }
        match block_end(&bytes, i) {
            Some(end_idx) => {
                let end = bytes[end_idx].0 + bytes[end_idx].1.len_utf8();
                blocks.push((start, end));
                i = end_idx + 1;
            }
            None => {
                unbalanced.get_or_insert(start);
                i += 1;
            }
        }
    }

    if blocks.is_empty() {
        return Err(match unbalanced {
            Some(offset) => ResponseParseError::Unbalanced(offset),
            None => ResponseParseError::MissingBraces,
        });
    }
    Ok(blocks)
}

/// Index of the `}` closing the `{` at `open`, skipping quoted text.
fn block_end(chars: &[(usize, char)], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (idx, &(_, c)) in chars.iter().enumerate().skip(open) {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q || (q == '"' && c == '\u{201d}') || (q == '\'' && c == '\u{2019}') {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\u{201c}' => quote = Some('"'),
            '\'' | '\u{2018}' => quote = Some('\''),
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Rewrites a block into strict JSON quoting.
fn normalize_quotes(block: &str) -> Result<String, ResponseParseError> {
    let mut out = String::with_capacity(block.len());
    let mut quote: Option<char> = None;
    let mut chars = block.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        match quote {
            None => match c {
                '"' | '\u{201c}' | '\u{201d}' => {
                    quote = Some('"');
                    out.push('"');
                }
                '\'' | '\u{2018}' | '\u{2019}' => {
                    quote = Some('\'');
                    out.push('"');
                }
                '\\' => match chars.peek() {
                    Some((_, 'n')) | Some((_, 'r')) | Some((_, 't')) => {
                        chars.next();
                        out.push(' ');
                    }
                    _ => return Err(ResponseParseError::InvalidEscape(offset)),
                },
                _ => out.push(c),
            },
            Some('"') => match c {
                '\\' => {
                    out.push('\\');
                    if let Some((_, next)) = chars.next() {
                        out.push(next);
                    }
                }
                '"' | '\u{201d}' => {
                    quote = None;
                    out.push('"');
                }
                _ => out.push(c),
            },
            Some(_) => match c {
                '\\' => match chars.next() {
                    Some((_, '\'')) => out.push('\''),
                    Some((_, next)) => {
                        out.push('\\');
                        out.push(next);
                    }
                    None => out.push('\\'),
                },
                '\'' | '\u{2019}' => {
                    quote = None;
                    out.push('"');
                }
                '"' => out.push_str("\\\""),
                _ => out.push(c),
            },
        }
    }
    Ok(out)
}

fn signature_from_object(value: &Value) -> Result<Signature, ResponseParseError> {
    let object: &Map<String, Value> = value.as_object().ok_or(ResponseParseError::NotAnObject)?;

    if let Some(extra) = object.keys().find(|k| !FIELDS.contains(&k.as_str())) {
        return Err(ResponseParseError::UnexpectedField(extra.clone()));
    }

    let column = match object.get("column") {
        None => return Err(ResponseParseError::MissingField("column")),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(ResponseParseError::InvalidValue("column")),
    };
    let value = match object.get("value") {
        None => return Err(ResponseParseError::MissingField("value")),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(_) => return Err(ResponseParseError::InvalidValue("value")),
    };

    Signature::new(&column, &value).ok_or(ResponseParseError::EmptyColumn)
}
