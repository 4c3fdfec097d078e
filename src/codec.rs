//! Tcl list literal codec.
//!
//! Converts the interpreter's native list syntax to and from Rust values.
//! Every function here is pure: there is no helper interpreter and no shared
//! state, so calls are independent and reentrant.
//!
//! # Syntax
//!
//! Elements are separated by whitespace. An element may be grouped with an
//! outer pair of braces, which allows embedded whitespace and nesting; the
//! braced content is taken verbatim. Double-quoted elements and bare words
//! have backslash sequences substituted.
//!
//! ```text
//! a b {c {d e} f} {g h}
//! ```
//!
//! ```ignore
//! use tclpipe::codec::{parse_list, parse_nested, Value};
//!
//! assert_eq!(parse_list("a {b c}")?, vec!["a", "b c"]);
//! let nested = parse_nested("{a b} c", None)?;
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// A parsed list literal: either an atom or an ordered sequence of values.
///
/// Serializes untagged, so a nested list becomes a nested JSON array of
/// strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum Value {
    Atom(String),
    List(Vec<Value>),
}

impl Value {
    /// Build a list of atoms.
    pub fn atoms<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(items.into_iter().map(|s| Value::Atom(s.into())).collect())
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Value::Atom(s) => Some(s),
            Value::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::Atom(_) => None,
            Value::List(items) => Some(items),
        }
    }

    /// Collect every atom, left to right, depth first.
    pub fn leaves(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Value::Atom(s) => out.push(s),
            Value::List(items) => items.iter().for_each(|item| item.collect_leaves(out)),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Atom(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Atom(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_nested(self))
    }
}

/// Malformed list literal. Positions are byte offsets into the input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListError {
    #[error("unmatched open brace in list at byte {0}")]
    UnmatchedBrace(usize),

    #[error("unmatched open quote in list at byte {0}")]
    UnmatchedQuote(usize),

    #[error("list element in braces followed by {found:?} instead of space at byte {at}")]
    GarbageAfterBrace { at: usize, found: char },

    #[error("list element in quotes followed by {found:?} instead of space at byte {at}")]
    GarbageAfterQuote { at: usize, found: char },
}

/// Tcl list separators.
fn is_list_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

/// Split one level of a list literal.
///
/// Empty (or all-whitespace) input yields an empty vector.
pub fn parse_list(text: &str) -> Result<Vec<String>, ListError> {
    let bytes = text.as_bytes();
    let mut elements = Vec::new();
    let mut pos = 0;

    loop {
        while pos < bytes.len() && is_list_space(bytes[pos]) {
            pos += 1;
        }
        if pos >= bytes.len() {
            return Ok(elements);
        }

        let (element, next) = match bytes[pos] {
            b'{' => parse_braced(text, pos)?,
            b'"' => parse_quoted(text, pos)?,
            _ => parse_bare(text, pos),
        };
        elements.push(element);
        pos = next;
    }
}

/// Braced element starting at `start`; content is verbatim.
fn parse_braced(text: &str, start: usize) -> Result<(String, usize), ListError> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = start;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let content = text[start + 1..i].to_string();
                    let end = i + 1;
                    if let Some(found) = garbage_at(text, end) {
                        return Err(ListError::GarbageAfterBrace { at: end, found });
                    }
                    return Ok((content, end));
                }
            }
            _ => {}
        }
        i += 1;
    }

    Err(ListError::UnmatchedBrace(start))
}

/// Quoted element starting at `start`; backslash sequences are substituted.
fn parse_quoted(text: &str, start: usize) -> Result<(String, usize), ListError> {
    let bytes = text.as_bytes();
    let mut i = start + 1;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => {
                let content = unescape(&text[start + 1..i]);
                let end = i + 1;
                if let Some(found) = garbage_at(text, end) {
                    return Err(ListError::GarbageAfterQuote { at: end, found });
                }
                return Ok((content, end));
            }
            _ => i += 1,
        }
    }

    Err(ListError::UnmatchedQuote(start))
}

fn parse_bare(text: &str, start: usize) -> (String, usize) {
    let bytes = text.as_bytes();
    let mut i = start;

    while i < bytes.len() && !is_list_space(bytes[i]) {
        i += if bytes[i] == b'\\' { 2 } else { 1 };
    }
    let end = i.min(bytes.len());
    (unescape(&text[start..end]), end)
}

/// Character directly after a closing brace/quote, if it is not a separator.
fn garbage_at(text: &str, pos: usize) -> Option<char> {
    match text.as_bytes().get(pos) {
        Some(&b) if !is_list_space(b) => text[pos..].chars().next(),
        _ => None,
    }
}

/// Backslash substitution for quoted elements and bare words.
fn unescape(raw: &str) -> String {
    if !raw.contains('\\') {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            None => out.push('\\'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('f') => out.push('\x0c'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\x0b'),
            Some('\n') => {
                while matches!(chars.peek(), Some(' ' | '\t')) {
                    chars.next();
                }
                out.push(' ');
            }
            Some(first @ '0'..='7') => {
                let mut value = first.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(digit) => {
                            value = value * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                // Octal escapes denote a single byte value
                out.push(char::from((value & 0xff) as u8));
            }
            Some(kind @ ('x' | 'u' | 'U')) => {
                let max_digits = match kind {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let mut digits = String::new();
                while digits.len() < max_digits {
                    match chars.peek() {
                        Some(d) if d.is_ascii_hexdigit() => {
                            digits.push(*d);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                match u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push(kind);
                        out.push_str(&digits);
                    }
                }
            }
            Some(other) => out.push(other),
        }
    }

    out
}

/// Recursively split a list literal.
///
/// With `levels = None` every element is split again until it no longer
/// holds more than one word; the top level is always a list. With
/// `levels = Some(0)` the text is returned unsplit as an atom. With
/// `levels = Some(n)` exactly `n` levels are split, so atoms shallower than
/// `n` end up wrapped in single-element lists.
pub fn parse_nested(text: &str, levels: Option<usize>) -> Result<Value, ListError> {
    match levels {
        Some(0) => Ok(Value::Atom(text.to_string())),
        Some(n) => parse_list(text)?
            .iter()
            .map(|element| parse_nested(element, Some(n - 1)))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        None => Ok(Value::List(
            parse_list(text)?.into_iter().map(split_element).collect(),
        )),
    }
}

/// Unlimited-depth split of a single element. Elements that do not parse
/// as a list, or hold a single word, stay atoms.
fn split_element(element: String) -> Value {
    match parse_list(&element) {
        Ok(mut items) if items.len() == 1 => Value::Atom(items.remove(0)),
        Ok(items) if items.len() > 1 => Value::List(items.into_iter().map(split_element).collect()),
        _ => Value::Atom(element),
    }
}

/// Treat every brace as whitespace and split: all atoms, structure dropped.
pub fn flatten(text: &str) -> Vec<String> {
    text.split(|c: char| c == '{' || c == '}' || c.is_whitespace())
        .filter(|atom| !atom.is_empty())
        .map(str::to_string)
        .collect()
}

/// Inverse of [`parse_list`].
pub fn format_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|item| quote_element(item.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Inverse of [`parse_nested`]: nested lists are wrapped in braces,
/// recursively. A top-level atom is returned as-is.
pub fn format_nested(value: &Value) -> String {
    match value {
        Value::Atom(s) => s.clone(),
        Value::List(items) => items
            .iter()
            .map(|item| match item {
                Value::Atom(s) => quote_element(s),
                Value::List(_) => format!("{{{}}}", format_nested(item)),
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// Quote an element so that a list parse yields it back unchanged.
///
/// Braces are preferred since their content is taken verbatim. An element
/// that braces cannot carry (unbalanced braces, or a trailing backslash
/// that would escape the closing brace) is written as a backslash-escaped
/// bare word instead.
fn quote_element(element: &str) -> String {
    let needs_quoting = element.is_empty()
        || element.bytes().any(|b| is_list_space(b) || b == b'\\')
        || element.starts_with('"')
        || element.starts_with('{')
        || element.contains('}');

    if !needs_quoting {
        element.to_string()
    } else if brace_safe(element) {
        format!("{{{element}}}")
    } else {
        escape_word(element)
    }
}

/// Quote text as a single literal word of an interpreter script.
///
/// Unlike [`quote_element`] this never leaves a word bare, since a bare
/// script word would still undergo `$` and `[` substitution.
pub(crate) fn quote_word(text: &str) -> String {
    if brace_safe(text) {
        format!("{{{text}}}")
    } else {
        escape_word(text)
    }
}

/// Whether `{element}` parses back as exactly one braced element.
fn brace_safe(element: &str) -> bool {
    let braced = format!("{{{element}}}");
    matches!(parse_braced(&braced, 0), Ok((_, end)) if end == braced.len())
}

/// Backslash-escape every character a bare word cannot hold literally.
fn escape_word(element: &str) -> String {
    let mut out = String::with_capacity(element.len() * 2);
    for c in element.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\x0b' => out.push_str("\\v"),
            '\x0c' => out.push_str("\\f"),
            '\\' | '{' | '}' | '[' | ']' | '$' | '"' | ';' | ' ' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn list(items: Vec<Value>) -> Value {
        Value::List(items)
    }

    fn atom(s: &str) -> Value {
        Value::Atom(s.to_string())
    }

    #[test]
    fn test_parse_list_basic() {
        assert_eq!(parse_list("").unwrap(), Vec::<String>::new());
        assert_eq!(parse_list("   \n\t").unwrap(), Vec::<String>::new());
        assert_eq!(parse_list("abc").unwrap(), vec!["abc"]);
        assert_eq!(parse_list("a b  c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(
            parse_list("a {b c} {d {e f}}").unwrap(),
            vec!["a", "b c", "d {e f}"]
        );
    }

    #[test]
    fn test_parse_list_empty_braces_is_empty_element() {
        assert_eq!(parse_list("{} a {}").unwrap(), vec!["", "a", ""]);
    }

    #[test]
    fn test_parse_list_quotes_and_escapes() {
        assert_eq!(
            parse_list(r#""a b" c\ d e\tf"#).unwrap(),
            vec!["a b", "c d", "e\tf"]
        );
        assert_eq!(parse_list(r"ét\x41").unwrap(), vec!["étA"]);
        // Braced content is verbatim
        assert_eq!(parse_list(r"{a\nb}").unwrap(), vec![r"a\nb"]);
        assert_eq!(parse_list(r"{a \} b}").unwrap(), vec![r"a \} b"]);
    }

    #[test]
    fn test_parse_list_errors() {
        assert_eq!(parse_list("a {b c"), Err(ListError::UnmatchedBrace(2)));
        assert_eq!(parse_list("\"abc"), Err(ListError::UnmatchedQuote(0)));
        assert_eq!(
            parse_list("{a}b"),
            Err(ListError::GarbageAfterBrace { at: 3, found: 'b' })
        );
        assert_eq!(
            parse_list("\"a\"x"),
            Err(ListError::GarbageAfterQuote { at: 3, found: 'x' })
        );
    }

    #[test]
    fn test_parse_list_numeric_escapes() {
        assert_eq!(
            parse_list(r"\101 \7 x\0610 \U1F600 \u00e9").unwrap(),
            vec!["A", "\x07", "x10", "\u{1F600}", "é"]
        );
        assert_eq!(parse_list(r"\Uzz").unwrap(), vec!["Uzz"]);
    }

    #[test]
    fn test_parse_list_non_ascii() {
        assert_eq!(parse_list("héllo {wörld ü}").unwrap(), vec!["héllo", "wörld ü"]);
    }

    #[test]
    fn test_parse_nested_unlimited() {
        assert_eq!(parse_nested("", None).unwrap(), list(vec![]));
        assert_eq!(parse_nested("a", None).unwrap(), list(vec![atom("a")]));
        assert_eq!(
            parse_nested("a b c", None).unwrap(),
            Value::atoms(["a", "b", "c"])
        );
        assert_eq!(
            parse_nested("{a b} c", None).unwrap(),
            list(vec![Value::atoms(["a", "b"]), atom("c")])
        );
        assert_eq!(
            parse_nested("{a {b c}} d", None).unwrap(),
            list(vec![
                list(vec![atom("a"), Value::atoms(["b", "c"])]),
                atom("d")
            ])
        );
    }

    #[test]
    fn test_parse_nested_with_levels() {
        let text = "a b c  d";
        assert_eq!(parse_nested(text, Some(0)).unwrap(), atom(text));
        assert_eq!(
            parse_nested(text, Some(1)).unwrap(),
            Value::atoms(["a", "b", "c", "d"])
        );
        assert_eq!(
            parse_nested(text, Some(2)).unwrap(),
            list(vec![
                Value::atoms(["a"]),
                Value::atoms(["b"]),
                Value::atoms(["c"]),
                Value::atoms(["d"]),
            ])
        );
        assert_eq!(
            parse_nested(text, Some(3)).unwrap(),
            list(
                ["a", "b", "c", "d"]
                    .iter()
                    .map(|s| list(vec![Value::atoms([*s])]))
                    .collect()
            )
        );

        let pairs = "{a b} {c d} {e f} {g h}";
        assert_eq!(
            parse_nested(pairs, Some(1)).unwrap(),
            Value::atoms(["a b", "c d", "e f", "g h"])
        );
        assert_eq!(
            parse_nested(pairs, Some(2)).unwrap(),
            list(vec![
                Value::atoms(["a", "b"]),
                Value::atoms(["c", "d"]),
                Value::atoms(["e", "f"]),
                Value::atoms(["g", "h"]),
            ])
        );

        let deep = "{a {b c}} d";
        assert_eq!(
            parse_nested(deep, Some(1)).unwrap(),
            Value::atoms(["a {b c}", "d"])
        );
        assert_eq!(
            parse_nested(deep, Some(2)).unwrap(),
            list(vec![Value::atoms(["a", "b c"]), Value::atoms(["d"])])
        );
    }

    #[test]
    fn test_parse_nested_levels_zero_keeps_malformed_text() {
        assert_eq!(parse_nested("a {b", Some(0)).unwrap(), atom("a {b"));
        assert!(parse_nested("a {b", Some(1)).is_err());
        assert!(parse_nested("a {b", None).is_err());
    }

    #[test]
    fn test_flatten() {
        assert_eq!(
            flatten("a b {c {d e} f} {g h}"),
            vec!["a", "b", "c", "d", "e", "f", "g", "h"]
        );
        assert_eq!(flatten(""), Vec::<String>::new());
        assert_eq!(flatten("{{{x}}}"), vec!["x"]);
    }

    #[test]
    fn test_format_list() {
        assert_eq!(format_list(["a", "b c", "d"]), "a {b c} d");
        assert_eq!(format_list(Vec::<String>::new()), "");
        assert_eq!(format_list(["", "x"]), "{} x");
        assert_eq!(format_list([r"a\b"]), r"{a\b}");
    }

    #[test]
    fn test_format_list_elements_braces_cannot_hold() {
        let items = [r"a\", "b", "a}", "{", "b c}", r"x\\\", "}{ $"];
        let text = format_list(items);
        assert_eq!(text, r"a\\ b a\} \{ b\ c\} x\\\\\\ \}\{\ \$");
        assert_eq!(parse_list(&text).unwrap(), items);

        // Even backslash runs still fit in braces
        assert_eq!(format_list([r"a\\ b"]), r"{a\\ b}");
    }

    #[test]
    fn test_format_nested_trailing_backslash() {
        let value = list(vec![atom(r"x\"), Value::atoms(["p", r"q\"])]);
        let text = format_nested(&value);
        assert_eq!(text, r"x\\ {p q\\}");
        assert_eq!(parse_nested(&text, None).unwrap(), value);
    }

    #[test]
    fn test_quote_word_is_always_literal() {
        assert_eq!(quote_word("pwd"), "{pwd}");
        assert_eq!(quote_word("$x [y]"), "{$x [y]}");
        assert_eq!(quote_word("set x }"), r"set\ x\ \}");
        assert_eq!(quote_word("a\nb"), "{a\nb}");
        assert_eq!(quote_word("{\n"), r"\{\n");
    }

    #[test]
    fn test_format_nested() {
        let value = list(vec![
            atom("a"),
            atom("b"),
            list(vec![atom("c"), Value::atoms(["d", "e"]), atom("f")]),
            Value::atoms(["g", "h"]),
        ]);
        assert_eq!(format_nested(&value), "a b {c {d e} f} {g h}");
        assert_eq!(value.to_string(), "a b {c {d e} f} {g h}");
        assert_eq!(format_nested(&atom("x y")), "x y");
        assert_eq!(format_nested(&Value::atoms(["x y", "z"])), "{x y} z");
    }

    #[test]
    fn test_leaves_are_depth_first() {
        let value = parse_nested("a {b {c d}} e", None).unwrap();
        assert_eq!(value.leaves(), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_value_serializes_as_nested_arrays() {
        let value = parse_nested("a {b c}", None).unwrap();
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"["a",["b","c"]]"#
        );
    }
}
