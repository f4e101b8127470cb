//! Plain-text record format shared by the identity stores.
//!
//! ```text
//! user 1
//!   name alice
//!   hostmask *!alice@example.org
//!
//! network libera
//!   sts irc.libera.chat
//!     port 6697
//!     expires 1700000000
//! ```
//!
//! A record starts at column 0 with `kind name`. Fields are indented two
//! spaces (`key value`); a field may own sub-fields indented four spaces.
//! Blank lines separate records and `#` starts a comment line. Rendering a
//! parsed file reproduces it byte for byte as long as it was written by
//! [`render`].

use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub key: String,
    pub value: String,
    pub children: Vec<Field>,
}

impl Field {
    pub fn new(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, key: &str, value: impl Into<String>) -> Self {
        self.children.push(Field::new(key, value));
        self
    }

    pub fn child(&self, key: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: String,
    pub name: String,
    pub fields: Vec<Field>,
}

impl Record {
    pub fn new(kind: &str, name: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.fields.push(Field::new(key, value));
    }

    pub fn push_field(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.key == key)
            .map(|f| f.value.as_str())
    }

    pub fn all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Field> + 'a {
        self.fields.iter().filter(move |f| f.key == key)
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        self.get(key).map(|v| v.eq_ignore_ascii_case("true"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {reason}")]
pub struct RecordError {
    pub line: usize,
    pub reason: &'static str,
}

pub fn parse(text: &str) -> Result<Vec<Record>, RecordError> {
    let mut records: Vec<Record> = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        if raw.trim().is_empty() || raw.trim_start().starts_with('#') {
            continue;
        }
        let err = |reason| RecordError { line: line_no, reason };
        if let Some(sub) = raw.strip_prefix("    ") {
            let (key, value) = split_kv(sub);
            let field = records
                .last_mut()
                .and_then(|r| r.fields.last_mut())
                .ok_or_else(|| err("sub-field without a parent field"))?;
            field.children.push(Field::new(key, value));
        } else if let Some(body) = raw.strip_prefix("  ") {
            if body.starts_with(' ') {
                return Err(err("unexpected indentation"));
            }
            let (key, value) = split_kv(body);
            records
                .last_mut()
                .ok_or_else(|| err("field outside of a record"))?
                .push(key, value);
        } else if raw.starts_with(' ') {
            return Err(err("unexpected indentation"));
        } else {
            let (kind, name) = split_kv(raw);
            if name.is_empty() {
                return Err(err("record header needs a kind and a name"));
            }
            records.push(Record::new(kind, name));
        }
    }
    Ok(records)
}

fn split_kv(s: &str) -> (&str, &str) {
    match s.split_once(' ') {
        Some((k, v)) => (k, v),
        None => (s, ""),
    }
}

pub fn render(records: &[Record]) -> String {
    let mut out = String::new();
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = writeln!(out, "{} {}", record.kind, record.name);
        for field in &record.fields {
            write_kv(&mut out, "  ", &field.key, &field.value);
            for child in &field.children {
                write_kv(&mut out, "    ", &child.key, &child.value);
            }
        }
    }
    out
}

fn write_kv(out: &mut String, indent: &str, key: &str, value: &str) {
    if value.is_empty() {
        let _ = writeln!(out, "{indent}{key}");
    } else {
        let _ = writeln!(out, "{indent}{key} {value}");
    }
}

/// Timestamps are stored as whole seconds when they have no fraction.
pub fn format_time(t: f64) -> String {
    if t.fract() == 0.0 {
        format!("{}", t as i64)
    } else {
        format!("{t}")
    }
}
