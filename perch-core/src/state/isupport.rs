//! RPL_ISUPPORT (005) tokens.

use std::collections::BTreeMap;

use crate::ident::{Casemap, DEFAULT_CHANTYPES, ModeClasses};

/// Structured view of the server's 005 advertisements, with the RFC
/// defaults for anything not advertised.
#[derive(Debug, Clone)]
pub struct Isupport {
    /// Every token as received; `None` for value-less tokens.
    pub raw: BTreeMap<String, Option<String>>,
    pub chantypes: String,
    pub modes: ModeClasses,
    /// Membership mode → status symbol, highest first (`o` → `@`).
    pub prefix: Vec<(char, char)>,
    /// Maximum argument-taking mode changes per MODE line.
    pub max_modes: usize,
    pub topiclen: Option<usize>,
    pub nicklen: Option<usize>,
    pub network: Option<String>,
    pub casemapping: Casemap,
    /// `EXTBAN=<prefix>,<types>`.
    pub extban: Option<(Option<char>, String)>,
    /// Extban masks that match account names.
    pub accountextban: Vec<String>,
    pub statusmsg: String,
    pub linelen: usize,
}

impl Default for Isupport {
    fn default() -> Self {
        Self {
            raw: BTreeMap::new(),
            chantypes: DEFAULT_CHANTYPES.to_string(),
            modes: ModeClasses::default(),
            prefix: vec![('o', '@'), ('h', '%'), ('v', '+')],
            max_modes: 3,
            topiclen: None,
            nicklen: None,
            network: None,
            casemapping: Casemap::Rfc1459,
            extban: None,
            accountextban: Vec::new(),
            statusmsg: String::new(),
            linelen: 512,
        }
    }
}

impl Isupport {
    /// Apply the tokens of one 005 line (params between the nick and the
    /// trailing "are supported" text).
    pub fn apply<S: AsRef<str>>(&mut self, tokens: &[S]) {
        for token in tokens {
            let token = token.as_ref();
            if let Some(name) = token.strip_prefix('-') {
                self.raw.remove(&name.to_ascii_uppercase());
                self.reset(&name.to_ascii_uppercase());
                continue;
            }
            let (name, value) = match token.split_once('=') {
                Some((n, v)) => (n.to_ascii_uppercase(), Some(unescape(v))),
                None => (token.to_ascii_uppercase(), None),
            };
            self.set(&name, value.as_deref());
            self.raw.insert(name, value);
        }
    }

    fn reset(&mut self, name: &str) {
        let defaults = Isupport::default();
        match name {
            "CHANTYPES" => self.chantypes = defaults.chantypes,
            "CHANMODES" | "PREFIX" => {
                self.modes = defaults.modes;
                self.prefix = defaults.prefix;
            }
            "MODES" => self.max_modes = defaults.max_modes,
            "TOPICLEN" => self.topiclen = None,
            "NICKLEN" => self.nicklen = None,
            "NETWORK" => self.network = None,
            "CASEMAPPING" => self.casemapping = defaults.casemapping,
            "EXTBAN" => self.extban = None,
            "ACCOUNTEXTBAN" => self.accountextban.clear(),
            "STATUSMSG" => self.statusmsg.clear(),
            "LINELEN" => self.linelen = defaults.linelen,
            _ => {}
        }
    }

    fn set(&mut self, name: &str, value: Option<&str>) {
        let value = value.unwrap_or("");
        match name {
            "CHANTYPES" => self.chantypes = value.to_string(),
            "CHANMODES" => {
                let mut parts = value.split(',');
                self.modes.list = parts.next().unwrap_or("").to_string();
                self.modes.always = parts.next().unwrap_or("").to_string();
                self.modes.on_set = parts.next().unwrap_or("").to_string();
                self.modes.never = parts.next().unwrap_or("").to_string();
            }
            "PREFIX" => {
                if let Some((modes, symbols)) = value
                    .strip_prefix('(')
                    .and_then(|v| v.split_once(')'))
                {
                    self.prefix = modes.chars().zip(symbols.chars()).collect();
                    self.modes.prefix = modes.to_string();
                } else if value.is_empty() {
                    self.prefix.clear();
                    self.modes.prefix.clear();
                }
            }
            // No value means no limit.
            "MODES" => self.max_modes = value.parse().unwrap_or(if value.is_empty() { 100 } else { 3 }),
            "TOPICLEN" => self.topiclen = value.parse().ok(),
            "NICKLEN" => self.nicklen = value.parse().ok(),
            "NETWORK" => self.network = Some(value.to_string()),
            "CASEMAPPING" => match Casemap::from_token(value) {
                Some(c) => self.casemapping = c,
                None => tracing::debug!(value, "Unknown CASEMAPPING, keeping rfc1459"),
            },
            "EXTBAN" => {
                self.extban = value.split_once(',').map(|(prefix, types)| {
                    (prefix.chars().next(), types.to_string())
                });
            }
            "ACCOUNTEXTBAN" => {
                self.accountextban = value.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect();
            }
            "STATUSMSG" => self.statusmsg = value.to_string(),
            "LINELEN" => self.linelen = value.parse().unwrap_or(512),
            _ => {}
        }
    }

    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.raw.get(&name.to_ascii_uppercase()).map(Option::as_deref)
    }

    /// Status symbol for a membership mode, e.g. `o` → `@`.
    pub fn symbol_for(&self, mode: char) -> Option<char> {
        self.prefix.iter().find(|(m, _)| *m == mode).map(|(_, s)| *s)
    }

    pub fn mode_for(&self, symbol: char) -> Option<char> {
        self.prefix.iter().find(|(_, s)| *s == symbol).map(|(m, _)| *m)
    }

    /// An account extban for `account`, e.g. `~a:alice`.
    pub fn account_extban(&self, account: &str) -> Option<String> {
        let name = self.accountextban.first()?;
        let (prefix, _) = self.extban.as_ref()?;
        let prefix = prefix.map(String::from).unwrap_or_default();
        Some(format!("{prefix}{name}:{account}"))
    }
}

/// ISUPPORT values escape `\xHH`.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(idx) = rest.find("\\x") {
        out.push_str(&rest[..idx]);
        let hex = rest.get(idx + 2..idx + 4);
        match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
            Some(byte) => {
                out.push(byte as char);
                rest = &rest[idx + 4..];
            }
            None => {
                out.push_str("\\x");
                rest = &rest[idx + 2..];
            }
        }
    }
    out.push_str(rest);
    out
}
