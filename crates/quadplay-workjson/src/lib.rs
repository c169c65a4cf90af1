//! Relaxed JSON used by game manifests and asset descriptors.
//!
//! Accepted on top of strict JSON: `//` and `/* */` comments, trailing commas,
//! unquoted `[A-Za-z_][A-Za-z0-9_]*` keys, single-quoted and backtick strings
//! (backtick strings may span lines), hexadecimal numbers, an explicit `+`
//! sign, bare leading or trailing decimal points, and `NaN`/`Infinity`
//! (loaded as `null`). Output is always strict JSON.

use anyhow::{Context, Result};
use serde_json::Value;
use serde_json::ser::PrettyFormatter;
use std::fs;
use std::path::Path;

pub fn loads(text: &str) -> Result<Value> {
    let strict = to_strict_json(text);
    serde_json::from_str(&strict).context("failed parsing relaxed JSON")
}

pub fn load(path: &Path) -> Result<Value> {
    let bytes =
        fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let text = String::from_utf8_lossy(&bytes);
    loads(&text).with_context(|| format!("failed parsing {}", path.display()))
}

/// Serializes `value` as strict JSON. `indent` of `None` gives the compact
/// form; otherwise nested levels are indented by that many spaces.
pub fn dumps(value: &Value, indent: Option<usize>) -> Result<String> {
    let Some(width) = indent else {
        return serde_json::to_string(value).context("failed serializing JSON");
    };
    let pad = vec![b' '; width];
    let mut out = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(&pad));
    serde::Serialize::serialize(value, &mut serializer).context("failed serializing JSON")?;
    String::from_utf8(out).context("serialized JSON was not UTF-8")
}

pub fn dump(path: &Path, value: &Value, indent: Option<usize>) -> Result<()> {
    let text = dumps(value, indent)?;
    fs::write(path, text).with_context(|| format!("failed writing {}", path.display()))
}

/// Rewrites relaxed JSON into strict JSON without interpreting values.
pub fn to_strict_json(src: &str) -> String {
    let chars: Vec<char> = src.chars().collect();
    let mut out = String::with_capacity(src.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => i = copy_double_quoted(&chars, i, &mut out),
            '\'' | '`' => i = convert_quoted(&chars, i, c, &mut out),
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    if chars[i] == '\n' {
                        out.push('\n');
                    }
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            ',' => {
                if !matches!(next_significant(&chars, i + 1), Some(']') | Some('}')) {
                    out.push(',');
                }
                i += 1;
            }
            '\r' => {
                out.push('\n');
                i += if chars.get(i + 1) == Some(&'\n') { 2 } else { 1 };
            }
            '+' if starts_number(&chars, skip_spaces(&chars, i + 1)) => {
                i = skip_spaces(&chars, i + 1);
            }
            '-' if word_at(&chars, i + 1) == "Infinity" => {
                out.push_str("null");
                i += 1 + "Infinity".len();
            }
            _ if starts_number(&chars, i) => i = convert_number(&chars, i, &mut out),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let word = word_at(&chars, i);
                i += word.chars().count();
                if next_significant(&chars, i) == Some(':') {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else if word == "NaN" || word == "Infinity" {
                    out.push_str("null");
                } else {
                    out.push_str(&word);
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn copy_double_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            out.push(c);
            if let Some(next) = chars.get(i + 1) {
                out.push(*next);
            }
            i += 2;
            continue;
        }
        match c {
            '"' => {
                out.push('"');
                return i + 1;
            }
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(c),
        }
        i += 1;
    }
    i
}

fn convert_quoted(chars: &[char], start: usize, delimiter: char, out: &mut String) -> usize {
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            match chars.get(i + 1) {
                Some(&next) if next == delimiter => out.push(next),
                Some(&next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => {}
            }
            i += 2;
            continue;
        }
        if c == delimiter {
            out.push('"');
            return i + 1;
        }
        match c {
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => {}
            _ => out.push(c),
        }
        i += 1;
    }
    out.push('"');
    i
}

fn convert_number(chars: &[char], start: usize, out: &mut String) -> usize {
    let mut i = start;
    let mut text = String::new();
    if chars[i] == '-' {
        text.push('-');
        i += 1;
    }

    if chars.get(i) == Some(&'0') && matches!(chars.get(i + 1), Some('x') | Some('X')) {
        let digits_start = i + 2;
        let mut end = digits_start;
        while end < chars.len() && chars[end].is_ascii_hexdigit() {
            end += 1;
        }
        let digits: String = chars[digits_start..end].iter().collect();
        match u64::from_str_radix(&digits, 16) {
            Ok(value) => {
                out.push_str(&text);
                out.push_str(&value.to_string());
            }
            Err(_) => {
                out.push_str(&text);
                out.extend(&chars[i..end]);
            }
        }
        return end;
    }

    if chars.get(i) == Some(&'.') {
        text.push('0');
    }
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        text.push(chars[i]);
        i += 1;
    }
    if text.ends_with('.') {
        text.pop();
    }
    if matches!(chars.get(i), Some('e') | Some('E')) {
        text.push(chars[i]);
        i += 1;
        if matches!(chars.get(i), Some('+') | Some('-')) {
            text.push(chars[i]);
            i += 1;
        }
        while i < chars.len() && chars[i].is_ascii_digit() {
            text.push(chars[i]);
            i += 1;
        }
    }
    out.push_str(&text);
    i
}

fn starts_number(chars: &[char], i: usize) -> bool {
    let digit_or_dot = |at: usize| match chars.get(at) {
        Some(c) if c.is_ascii_digit() => true,
        Some('.') => chars.get(at + 1).is_some_and(char::is_ascii_digit),
        _ => false,
    };
    match chars.get(i) {
        Some('-') => digit_or_dot(i + 1),
        Some(_) => digit_or_dot(i),
        None => false,
    }
}

fn word_at(chars: &[char], start: usize) -> String {
    chars[start.min(chars.len())..]
        .iter()
        .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
        .collect()
}

fn skip_spaces(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

fn next_significant(chars: &[char], mut i: usize) -> Option<char> {
    loop {
        i = skip_spaces(chars, i);
        match (chars.get(i), chars.get(i + 1)) {
            (Some('/'), Some('/')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            (Some('/'), Some('*')) => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            (Some(c), _) => return Some(*c),
            (None, _) => return None,
        }
    }
}
