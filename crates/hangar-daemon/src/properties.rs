// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Property tables and the `.properties` file codec.
//!
//! A [`PropertyTable`] is the durable form of a handle: the start parameters
//! it was created with, including nested tables (`containerProperties`) and
//! lists of tables (`deployableFiles`). Tables are exchanged as JSON objects
//! and stored one per line in a Java-style `.properties` file.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::{Error, Result};

/// Errors from reading a `.properties` stream.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PropertiesError {
    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A `\u` escape was not followed by four hex digits.
    #[error("Malformed \\uxxxx encoding on line {line}")]
    MalformedEscape {
        /// 1-based line number where the logical line starts.
        line: usize,
    },
}

/// A single property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum PropertyValue {
    /// Plain text.
    Text(String),
    /// Ordered list of values.
    List(Vec<PropertyValue>),
    /// Nested table.
    Table(PropertyTable),
}

impl PropertyValue {
    /// Text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Nested table, if this is a table value.
    pub fn as_table(&self) -> Option<&PropertyTable> {
        match self {
            PropertyValue::Table(table) => Some(table),
            _ => None,
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => PropertyValue::Text(text),
            Value::Null => PropertyValue::Text(String::new()),
            Value::Bool(flag) => PropertyValue::Text(flag.to_string()),
            Value::Number(number) => PropertyValue::Text(number.to_string()),
            Value::Array(items) => {
                PropertyValue::List(items.into_iter().map(PropertyValue::from).collect())
            }
            Value::Object(map) => PropertyValue::Table(PropertyTable::from(map)),
        }
    }
}

impl From<PropertyValue> for Value {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::Text(text) => Value::String(text),
            PropertyValue::List(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            PropertyValue::Table(table) => Value::Object(table.into()),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(text: &str) -> Self {
        PropertyValue::Text(text.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(text: String) -> Self {
        PropertyValue::Text(text)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(items: Vec<String>) -> Self {
        PropertyValue::List(items.into_iter().map(PropertyValue::Text).collect())
    }
}

impl From<PropertyTable> for PropertyValue {
    fn from(table: PropertyTable) -> Self {
        PropertyValue::Table(table)
    }
}

/// Key-ordered map of property values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct PropertyTable(BTreeMap<String, PropertyValue>);

impl PropertyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value for `key`.
    pub fn get_value(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    /// Text value for `key`; lists and tables yield `None`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(PropertyValue::as_text)
    }

    /// Text value for `key`, failing when it is missing or empty.
    pub fn get_required(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(Error::MissingParameter(key.to_string())),
        }
    }

    /// Boolean value for `key`: only a case-insensitive `true` is true.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
    }

    /// Text items of the list at `key`. A single non-empty text value counts
    /// as a one-element list.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(PropertyValue::List(items)) => items
                .iter()
                .filter_map(PropertyValue::as_text)
                .map(String::from)
                .collect(),
            Some(PropertyValue::Text(text)) if !text.is_empty() => vec![text.clone()],
            _ => Vec::new(),
        }
    }

    /// Nested table at `key`.
    pub fn get_table(&self, key: &str) -> Option<&PropertyTable> {
        self.0.get(key).and_then(PropertyValue::as_table)
    }

    /// Tables in the list at `key`.
    pub fn get_tables(&self, key: &str) -> Vec<&PropertyTable> {
        match self.0.get(key) {
            Some(PropertyValue::List(items)) => {
                items.iter().filter_map(PropertyValue::as_table).collect()
            }
            Some(PropertyValue::Table(table)) => vec![table],
            _ => Vec::new(),
        }
    }

    /// Insert a value, returning the previous one.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Option<PropertyValue> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.0.remove(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Copy every entry of `other` into this table, overwriting existing keys.
    pub fn merge(&mut self, other: &PropertyTable) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compact JSON object text of this table.
    pub fn to_json_string(&self) -> String {
        Value::Object(self.clone().into()).to_string()
    }
}

impl From<Map<String, Value>> for PropertyTable {
    fn from(map: Map<String, Value>) -> Self {
        Self(
            map.into_iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, value)| (key, PropertyValue::from(value)))
                .collect(),
        )
    }
}

impl From<PropertyTable> for Map<String, Value> {
    fn from(table: PropertyTable) -> Self {
        table
            .0
            .into_iter()
            .map(|(key, value)| (key, Value::from(value)))
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for PropertyTable
where
    K: Into<String>,
    V: Into<PropertyValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

/// Write `key=value` records in `.properties` format.
///
/// Output is pure ASCII; anything outside the printable range is written as
/// `\uXXXX` escapes.
pub fn write_properties<'a, W, I>(writer: &mut W, comment: Option<&str>, entries: I) -> std::io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    if let Some(comment) = comment {
        writeln!(writer, "#{}", escape(comment, false))?;
    }
    writeln!(
        writer,
        "#{}",
        chrono::Utc::now().format("%a %b %d %H:%M:%S UTC %Y")
    )?;
    for (key, value) in entries {
        writeln!(writer, "{}={}", escape(key, true), escape(value, false))?;
    }
    writer.flush()
}

/// Read every record of a `.properties` stream, in file order.
pub fn read_properties<R: Read>(mut reader: R) -> std::result::Result<Vec<(String, String)>, PropertiesError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        // ISO-8859-1 maps every byte onto the code point of the same value
        Err(err) => err.into_bytes().iter().map(|&b| b as char).collect(),
    };
    parse_properties(&text)
}

/// Parse `.properties` text.
pub fn parse_properties(text: &str) -> std::result::Result<Vec<(String, String)>, PropertiesError> {
    let mut entries = Vec::new();
    let mut lines = natural_lines(text).into_iter().enumerate();

    while let Some((index, line)) = lines.next() {
        let first = trim_leading(line);
        if first.is_empty() || first.starts_with('#') || first.starts_with('!') {
            continue;
        }

        let mut logical = String::new();
        let mut current = first;
        loop {
            if !ends_with_continuation(current) {
                logical.push_str(current);
                break;
            }
            logical.push_str(&current[..current.len() - 1]);
            match lines.next() {
                Some((_, next)) => current = trim_leading(next),
                None => break,
            }
        }

        let (key, value) = split_entry(&logical);
        let line_number = index + 1;
        entries.push((unescape(key, line_number)?, unescape(value, line_number)?));
    }

    Ok(entries)
}

fn natural_lines(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                lines.push(&text[start..i]);
                i += 1;
                start = i;
            }
            b'\r' => {
                lines.push(&text[start..i]);
                i += 1;
                if i < bytes.len() && bytes[i] == b'\n' {
                    i += 1;
                }
                start = i;
            }
            _ => i += 1,
        }
    }
    if start < bytes.len() {
        lines.push(&text[start..]);
    }
    lines
}

fn trim_leading(line: &str) -> &str {
    line.trim_start_matches([' ', '\t', '\x0c'])
}

fn ends_with_continuation(line: &str) -> bool {
    line.bytes().rev().take_while(|&b| b == b'\\').count() % 2 == 1
}

fn split_entry(line: &str) -> (&str, &str) {
    let mut escaped = false;
    let mut key_end = line.len();
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' | ' ' | '\t' | '\x0c' => {
                key_end = i;
                break;
            }
            _ => {}
        }
    }

    let mut rest = trim_leading(&line[key_end..]);
    if let Some(stripped) = rest.strip_prefix(['=', ':']) {
        rest = trim_leading(stripped);
    }
    (&line[..key_end], rest)
}

fn unescape(text: &str, line: usize) -> std::result::Result<String, PropertiesError> {
    let mut out = String::with_capacity(text.len());
    let mut units: Vec<u16> = Vec::new();
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            flush_units(&mut units, &mut out);
            out.push(c);
            continue;
        }
        let Some(escaped) = chars.next() else {
            break;
        };
        if escaped == 'u' {
            let mut unit: u32 = 0;
            for _ in 0..4 {
                let digit = chars
                    .next()
                    .and_then(|h| h.to_digit(16))
                    .ok_or(PropertiesError::MalformedEscape { line })?;
                unit = unit * 16 + digit;
            }
            units.push(unit as u16);
            continue;
        }
        flush_units(&mut units, &mut out);
        out.push(match escaped {
            't' => '\t',
            'n' => '\n',
            'r' => '\r',
            'f' => '\x0c',
            other => other,
        });
    }
    flush_units(&mut units, &mut out);

    Ok(out)
}

fn flush_units(units: &mut Vec<u16>, out: &mut String) {
    if !units.is_empty() {
        out.push_str(&String::from_utf16_lossy(units));
        units.clear();
    }
}

fn escape(text: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, c) in text.chars().enumerate() {
        match c {
            ' ' if is_key || i == 0 => out.push_str("\\ "),
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x0c' => out.push_str("\\f"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            ' '..='~' => out.push(c),
            _ => {
                let mut buf = [0u16; 2];
                for unit in c.encode_utf16(&mut buf) {
                    out.push_str(&format!("\\u{:04X}", unit));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(entries: &[(&str, &str)]) -> String {
        let mut buf = Vec::new();
        write_properties(&mut buf, Some("handles"), entries.iter().copied()).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_write_escapes_special_characters() {
        let text = written(&[("a key", "x=y:z #1 !")]);
        let record = text.lines().nth(2).unwrap();
        assert_eq!(record, "a\\ key=x\\=y\\:z \\#1 \\!");
    }

    #[test]
    fn test_write_is_ascii_and_reads_back() {
        let entries = [
            ("h1", " leading space"),
            ("żółw", "naïve 日本 🚀"),
            ("tabs", "a\tb\nc\rd\\e"),
        ];
        let text = written(&entries);
        assert!(text.is_ascii());

        let parsed = parse_properties(&text).unwrap();
        let expected: Vec<(String, String)> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_parse_separators_comments_and_blank_lines() {
        let text = "# comment\n! other\n\n  key1 = value1\nkey2:value2\nkey3 value3\nkey4\n";
        let parsed = parse_properties(text).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("key1".to_string(), "value1".to_string()),
                ("key2".to_string(), "value2".to_string()),
                ("key3".to_string(), "value3".to_string()),
                ("key4".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_parse_continuation_lines() {
        let text = "fruits = apple, \\\n         banana\r\nescaped = ends\\\\\nnext = 1";
        let parsed = parse_properties(text).unwrap();
        assert_eq!(parsed[0], ("fruits".to_string(), "apple, banana".to_string()));
        assert_eq!(parsed[1], ("escaped".to_string(), "ends\\".to_string()));
        assert_eq!(parsed[2], ("next".to_string(), "1".to_string()));
    }

    #[test]
    fn test_parse_malformed_unicode_escape() {
        let err = parse_properties("ok=1\nbad=\\u12G4\n").unwrap_err();
        assert!(matches!(err, PropertiesError::MalformedEscape { line: 2 }));
    }

    #[test]
    fn test_read_latin1_fallback() {
        let bytes: &[u8] = b"name=caf\xe9\n";
        let parsed = read_properties(bytes).unwrap();
        assert_eq!(parsed[0].1, "café");
    }

    #[test]
    fn test_table_from_json_normalizes_scalars() {
        let value = serde_json::json!({
            "port": 8080,
            "debug": true,
            "skip": null,
            "items": ["a", null, 2],
            "nested": {"k": "v"}
        });
        let table: PropertyTable = serde_json::from_value(value).unwrap();
        assert_eq!(table.get("port"), Some("8080"));
        assert!(table.get_bool("debug"));
        assert!(!table.contains_key("skip"));
        assert_eq!(table.get_list("items"), vec!["a", "", "2"]);
        assert_eq!(table.get_table("nested").unwrap().get("k"), Some("v"));
    }

    #[test]
    fn test_table_rejects_non_object_json() {
        assert!(serde_json::from_str::<PropertyTable>("[1, 2]").is_err());
        assert!(serde_json::from_str::<PropertyTable>("\"text\"").is_err());
    }

    #[test]
    fn test_accessors() {
        let mut table = PropertyTable::new();
        table.insert("empty", "");
        table.insert("flag", "TRUE");
        table.insert("single", "one");
        let mut deployable = PropertyTable::new();
        deployable.insert("filename", "app.war");
        table.insert("deployables", PropertyValue::List(vec![deployable.into()]));

        assert!(matches!(
            table.get_required("empty"),
            Err(Error::MissingParameter(name)) if name == "empty"
        ));
        assert!(table.get_required("absent").is_err());
        assert!(table.get_bool("flag"));
        assert!(!table.get_bool("single"));
        assert_eq!(table.get_list("single"), vec!["one"]);
        assert_eq!(table.get_tables("deployables")[0].get("filename"), Some("app.war"));
        assert!(table.get("deployables").is_none());
    }

    #[test]
    fn test_merge_overwrites() {
        let mut base: PropertyTable = [("a", "1"), ("b", "2")].into_iter().collect();
        let other: PropertyTable = [("b", "3"), ("c", "4")].into_iter().collect();
        base.merge(&other);
        assert_eq!(base.get("a"), Some("1"));
        assert_eq!(base.get("b"), Some("3"));
        assert_eq!(base.get("c"), Some("4"));
        assert_eq!(base.len(), 3);
    }
}
