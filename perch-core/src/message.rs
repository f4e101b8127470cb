//! IRC wire codec.
//!
//! Parses a single protocol line into a [`Message`] and serializes it back.
//! Tags are kept in a sorted map so serialization is deterministic; equality
//! therefore ignores the order tags appeared in on the wire.

use std::collections::BTreeMap;
use std::fmt;

/// Message tags. `None` means the tag was present without a value.
pub type Tags = BTreeMap<String, Option<String>>;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// IRCv3 tags. Client-only tags keep their `+` prefix in the key.
    pub tags: Tags,
    /// Origin: `nick!user@host` or a server name.
    pub prefix: Option<String>,
    /// Uppercased command word or three-digit numeric.
    pub command: String,
    pub params: Vec<String>,
}

/// The line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed message ({reason}): {line:?}")]
pub struct MalformedMessage {
    pub reason: &'static str,
    pub line: String,
}

impl Message {
    pub fn new(command: &str, params: Vec<String>) -> Self {
        Self {
            tags: Tags::new(),
            prefix: None,
            command: command.to_ascii_uppercase(),
            params,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.tags.insert(key.into(), value.filter(|v| !v.is_empty()));
        self
    }

    /// Parse raw bytes, replacing invalid UTF-8 sequences.
    pub fn parse_bytes(line: &[u8]) -> Result<Self, MalformedMessage> {
        Self::parse(&String::from_utf8_lossy(line))
    }

    /// Parse one line. A trailing CR/LF is ignored.
    pub fn parse(line: &str) -> Result<Self, MalformedMessage> {
        let malformed = |reason| MalformedMessage {
            reason,
            line: line.to_string(),
        };
        let mut rest = line.trim_end_matches(['\r', '\n']);
        let mut msg = Message::default();

        if let Some(after) = rest.strip_prefix('@') {
            let Some((raw_tags, tail)) = after.split_once(' ') else {
                return Err(malformed("unterminated tag section"));
            };
            for raw in raw_tags.split(';').filter(|t| !t.is_empty()) {
                let (key, value) = match raw.split_once('=') {
                    Some((k, v)) => (k, Some(unescape_tag_value(v))),
                    None => (raw, None),
                };
                if key.is_empty() || key == "+" {
                    return Err(malformed("empty tag key"));
                }
                msg.tags
                    .insert(key.to_string(), value.filter(|v| !v.is_empty()));
            }
            rest = tail;
        }

        rest = rest.trim_start_matches(' ');
        if let Some(after) = rest.strip_prefix(':') {
            let (prefix, tail) = after.split_once(' ').unwrap_or((after, ""));
            if prefix.is_empty() {
                return Err(malformed("empty prefix"));
            }
            msg.prefix = Some(prefix.to_string());
            rest = tail.trim_start_matches(' ');
        }

        let (command, mut rest) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return Err(malformed("missing command"));
        }
        if !command.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(malformed("invalid command"));
        }
        msg.command = command.to_ascii_uppercase();

        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                msg.params.push(trailing.to_string());
                break;
            }
            let (param, tail) = rest.split_once(' ').unwrap_or((rest, ""));
            msg.params.push(param.to_string());
            rest = tail;
        }

        Ok(msg)
    }

    // ── Accessors ──

    /// Nick part of the prefix (the whole prefix for server origins).
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split('!').next().unwrap_or(prefix))
    }

    /// The prefix if it is a full `nick!user@host`.
    pub fn hostmask(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .filter(|p| crate::ident::hostmask::is_user_hostmask(p))
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// The last parameter, conventionally the trailing text.
    pub fn trailing(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).and_then(|v| v.as_deref())
    }

    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    /// Tags whose names start with `+`.
    pub fn client_tags(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.tags
            .iter()
            .filter(|(k, _)| k.starts_with('+'))
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn server_tags(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.tags
            .iter()
            .filter(|(k, _)| !k.starts_with('+'))
            .map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            f.write_str("@")?;
            for (i, (key, value)) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                f.write_str(key)?;
                if let Some(v) = value {
                    write!(f, "={}", escape_tag_value(v))?;
                }
            }
            f.write_str(" ")?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        let Some((last, middle)) = self.params.split_last() else {
            return Ok(());
        };
        for param in middle {
            write!(f, " {param}")?;
        }
        if last.is_empty() || last.starts_with(':') || last.contains(' ') {
            write!(f, " :{last}")
        } else {
            write!(f, " {last}")
        }
    }
}

impl std::str::FromStr for Message {
    type Err = MalformedMessage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Message::parse(s)
    }
}

/// Undo IRCv3 tag value escaping. A lone trailing backslash is dropped.
pub fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

pub fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}
