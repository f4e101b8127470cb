//! Typed registry values and their validators.

use std::collections::BTreeSet;
use std::fmt;

/// The type a registry key accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    Boolean,
    Integer,
    NonNegativeInteger,
    PositiveInteger,
    PositiveFloat,
    String,
    Regex,
    SpaceSeparatedSet,
    /// One of a fixed list of lowercase words.
    Enum(Vec<&'static str>),
}

/// A registry value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Regex(String),
    Set(BTreeSet<String>),
}

impl Value {
    pub fn set<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Set(items.into_iter().map(Into::into).collect())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Regex(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) | Value::Regex(s) => f.write_str(s),
            Value::Set(items) => {
                let joined: Vec<&str> = items.iter().map(String::as_str).collect();
                f.write_str(&joined.join(" "))
            }
        }
    }
}

impl Kind {
    /// Parse and validate the textual form of a value.
    pub fn parse(&self, raw: &str) -> Result<Value, String> {
        let raw = raw.trim();
        match self {
            Kind::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "on" | "yes" | "enable" | "enabled" | "1" => Ok(Value::Bool(true)),
                "false" | "off" | "no" | "disable" | "disabled" | "0" => Ok(Value::Bool(false)),
                _ => Err(format!("{raw:?} is not a valid boolean")),
            },
            Kind::Integer => raw
                .parse()
                .map(Value::Int)
                .map_err(|_| format!("{raw:?} is not a valid integer")),
            Kind::NonNegativeInteger => match raw.parse::<i64>() {
                Ok(i) if i >= 0 => Ok(Value::Int(i)),
                _ => Err(format!("{raw:?} is not a non-negative integer")),
            },
            Kind::PositiveInteger => match raw.parse::<i64>() {
                Ok(i) if i > 0 => Ok(Value::Int(i)),
                _ => Err(format!("{raw:?} is not a positive integer")),
            },
            Kind::PositiveFloat => match raw.parse::<f64>() {
                Ok(x) if x > 0.0 && x.is_finite() => Ok(Value::Float(x)),
                _ => Err(format!("{raw:?} is not a positive number")),
            },
            Kind::String => Ok(Value::Str(unquote(raw))),
            Kind::Regex => {
                let pattern = unquote(raw);
                regex::Regex::new(&pattern)
                    .map(|_| Value::Regex(pattern))
                    .map_err(|e| format!("invalid regular expression: {e}"))
            }
            Kind::SpaceSeparatedSet => Ok(Value::set(raw.split_whitespace())),
            Kind::Enum(choices) => {
                let lowered = raw.to_ascii_lowercase();
                if choices.contains(&lowered.as_str()) {
                    Ok(Value::Str(lowered))
                } else {
                    Err(format!("{raw:?} is not one of {}", choices.join(", ")))
                }
            }
        }
    }

    /// Whether `value` has the shape this kind produces.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Kind::Boolean, Value::Bool(_)) => true,
            (Kind::Integer, Value::Int(_)) => true,
            (Kind::NonNegativeInteger, Value::Int(i)) => *i >= 0,
            (Kind::PositiveInteger, Value::Int(i)) => *i > 0,
            (Kind::PositiveFloat, Value::Float(x)) => *x > 0.0,
            (Kind::String, Value::Str(_)) => true,
            (Kind::Regex, Value::Regex(p)) => regex::Regex::new(p).is_ok(),
            (Kind::SpaceSeparatedSet, Value::Set(_)) => true,
            (Kind::Enum(choices), Value::Str(s)) => choices.contains(&s.as_str()),
            _ => false,
        }
    }
}

/// Strings may be written quoted to keep leading or trailing spaces.
fn unquote(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        raw[1..raw.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        raw.to_string()
    }
}

/// Textual form for the config file, quoting strings that would not
/// survive trimming.
pub fn serialize(value: &Value) -> String {
    match value {
        Value::Str(s) | Value::Regex(s)
            if s.is_empty() || s.trim() != s || (s.starts_with('"') && s.ends_with('"')) =>
        {
            format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
        }
        other => other.to_string(),
    }
}
