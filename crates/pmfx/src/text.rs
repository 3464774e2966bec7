//! Byte-level scanning helpers shared by the loader, extractor, and emitters.
//!
//! All lowering in this crate is textual, so these helpers only ever split a
//! string at ASCII delimiters; every returned index lies on a char boundary.
use std::collections::HashSet;

pub fn is_ident_char(byte: u8) -> bool {
    byte == b'_' || byte.is_ascii_alphanumeric()
}

fn is_token_delimiter(byte: u8) -> bool {
    !is_ident_char(byte)
}

/// Index of the delimiter matching the opener at `open`.
pub fn match_delimiter(text: &str, open: usize, open_ch: u8, close_ch: u8) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(open) != Some(&open_ch) {
        return None;
    }
    let mut depth = 0usize;
    for (index, &byte) in bytes.iter().enumerate().skip(open) {
        if byte == open_ch {
            depth += 1;
        } else if byte == close_ch {
            depth -= 1;
            if depth == 0 {
                return Some(index);
            }
        }
    }
    None
}

pub fn match_brace(text: &str, open: usize) -> Option<usize> {
    match_delimiter(text, open, b'{', b'}')
}

pub fn match_paren(text: &str, open: usize) -> Option<usize> {
    match_delimiter(text, open, b'(', b')')
}

pub fn find_from(text: &str, needle: &str, from: usize) -> Option<usize> {
    text.get(from..)?.find(needle).map(|pos| pos + from)
}

pub fn find_byte_from(text: &str, byte: u8, from: usize) -> Option<usize> {
    text.as_bytes()
        .iter()
        .skip(from)
        .position(|&b| b == byte)
        .map(|pos| pos + from)
}

/// First occurrence of `token` at or after `from` that is not part of a
/// longer identifier.
pub fn find_token_from(text: &str, token: &str, from: usize) -> Option<usize> {
    if token.is_empty() {
        return None;
    }
    let bytes = text.as_bytes();
    let mut start = from;
    while let Some(pos) = find_from(text, token, start) {
        let end = pos + token.len();
        let left_ok = pos == 0 || is_token_delimiter(bytes[pos - 1]);
        let right_ok = end >= bytes.len() || is_token_delimiter(bytes[end]);
        if left_ok && right_ok {
            return Some(pos);
        }
        start = pos + 1;
    }
    None
}

pub fn find_token(text: &str, token: &str) -> Option<usize> {
    find_token_from(text, token, 0)
}

pub fn find_last_token(text: &str, token: &str) -> Option<usize> {
    let mut last = None;
    let mut cursor = 0;
    while let Some(pos) = find_token_from(text, token, cursor) {
        last = Some(pos);
        cursor = pos + token.len();
    }
    last
}

pub fn contains_token(text: &str, token: &str) -> bool {
    find_token(text, token).is_some()
}

/// Replaces every standalone occurrence of `token`.
pub fn replace_token(text: &str, token: &str, replacement: &str) -> String {
    let mut output = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(pos) = find_token_from(text, token, cursor) {
        output.push_str(&text[cursor..pos]);
        output.push_str(replacement);
        cursor = pos + token.len();
    }
    output.push_str(&text[cursor..]);
    output
}

/// Occurrences of `name(` (whitespace allowed before the paren) as a
/// standalone identifier; yields the index of the `(`.
pub fn find_calls(text: &str, name: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut calls = Vec::new();
    let mut cursor = 0;
    while let Some(pos) = find_token_from(text, name, cursor) {
        let mut next = pos + name.len();
        while next < bytes.len() && bytes[next].is_ascii_whitespace() {
            next += 1;
        }
        if bytes.get(next) == Some(&b'(') {
            calls.push(next);
        }
        cursor = pos + name.len();
    }
    calls
}

pub fn calls_function(text: &str, name: &str) -> bool {
    !find_calls(text, name).is_empty()
}

/// Splits source into identifier-like tokens, dropping punctuation.
pub fn tokens(text: &str) -> HashSet<&str> {
    text.split(|ch: char| !(ch == '_' || ch.is_ascii_alphanumeric()))
        .filter(|token| !token.is_empty())
        .collect()
}

/// Identifier immediately before `end` (exclusive), skipping whitespace.
pub fn identifier_before(text: &str, end: usize) -> Option<(usize, &str)> {
    let bytes = text.as_bytes();
    let mut stop = end;
    while stop > 0 && bytes[stop - 1].is_ascii_whitespace() {
        stop -= 1;
    }
    let mut start = stop;
    while start > 0 && is_ident_char(bytes[start - 1]) {
        start -= 1;
    }
    if start == stop {
        None
    } else {
        Some((start, &text[start..stop]))
    }
}

/// Identifier starting at or after `from`, skipping whitespace.
pub fn identifier_after(text: &str, from: usize) -> Option<(usize, &str)> {
    let bytes = text.as_bytes();
    let mut start = from;
    while start < bytes.len() && bytes[start].is_ascii_whitespace() {
        start += 1;
    }
    let mut end = start;
    while end < bytes.len() && is_ident_char(bytes[end]) {
        end += 1;
    }
    if start == end {
        None
    } else {
        Some((end, &text[start..end]))
    }
}

/// Re-indents generated source: one level per open brace, blank lines and
/// standalone `[[...]]` attribute lines dropped.
pub fn format_source(source: &str, indent_size: usize) -> String {
    let mut formatted = String::with_capacity(source.len());
    let mut indent: usize = 0;
    for raw in source.lines() {
        let line = raw.trim();
        if line.is_empty() || (line.starts_with("[[") && line.ends_with("]]")) {
            continue;
        }
        let opens = line.matches('{').count();
        let mut closes = line.matches('}').count();
        if line.starts_with('}') {
            indent = indent.saturating_sub(1);
            closes -= 1;
        }
        for _ in 0..indent * indent_size {
            formatted.push(' ');
        }
        formatted.push_str(line);
        formatted.push('\n');
        indent = (indent + opens).saturating_sub(closes);
    }
    formatted
}

/// Splits a `{ ... }` block into bare words, dropping `; : ( ) ,`.
pub fn split_block(block: &str) -> Vec<String> {
    let start = block.find('{').map(|pos| pos + 1).unwrap_or(0);
    let end = block.rfind('}').unwrap_or(block.len()).max(start);
    block[start..end]
        .split(|ch: char| ch.is_whitespace() || matches!(ch, ';' | ':' | '(' | ')' | ','))
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_nested_braces() {
        let text = "a { b { c } d } e";
        assert_eq!(match_brace(text, 2), Some(14));
        assert_eq!(match_brace(text, 0), None);
    }

    #[test]
    fn token_search_respects_identifier_boundaries() {
        let text = "float4 input_color = input.color;";
        assert_eq!(find_token(text, "input"), Some(21));
        assert!(!contains_token("instance_input.x", "input"));
    }

    #[test]
    fn replaces_only_standalone_tokens() {
        let text = "vs_output output; output.pos = input.pos; position_vs_input;";
        assert_eq!(
            replace_token(&replace_token(text, "input", "_input"), "output", "_output"),
            "vs_output _output; _output.pos = _input.pos; position_vs_input;"
        );
    }

    #[test]
    fn finds_call_sites() {
        let text = "x = lighting (n); lighting_model(n); y = lighting(m);";
        assert_eq!(find_calls(text, "lighting").len(), 2);
    }

    #[test]
    fn formats_with_brace_depth() {
        let source = "void main()\n{\nif (a) {\nb();\n}\n\n[[attr]]\n}\n";
        assert_eq!(
            format_source(source, 4),
            "void main()\n{\n    if (a) {\n        b();\n    }\n}\n"
        );
    }

    #[test]
    fn splits_blocks_into_words() {
        let words = split_block("cbuffer per_pass : register(b0)\n{\n float4x4 vp;\n float4 lights[4];\n};");
        assert_eq!(words, vec!["float4x4", "vp", "float4", "lights[4]"]);
    }

    #[test]
    fn identifiers_around_positions() {
        let text = "float4 lighting (float3 n)";
        let paren = text.find('(').unwrap();
        assert_eq!(identifier_before(text, paren), Some((7, "lighting")));
        assert_eq!(identifier_after(text, paren + 1), Some((23, "float3")));
    }
}
