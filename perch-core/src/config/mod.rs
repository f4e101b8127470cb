//! Configuration registry.
//!
//! Every setting is a dot-separated key with a typed value. Keys may be
//! channel- and/or network-specific; a lookup for `(key, network, channel)`
//! resolves to the most specific explicitly set value, falling back through
//! network+channel → channel → network → global → default.
//!
//! The registry persists to a plain `key: value` file. Scoped values carry a
//! suffix on the key: `.#channel`, `.:network` or `.:network.#channel`.

mod defaults;
mod network;
mod value;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

pub use defaults::register_core;
pub use network::{NetworkSettings, SaslSettings, ServerAddr};
pub use value::{Kind, Value};

use crate::ident::Casemap;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no such configuration key: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("{key} cannot be set for {scope}")]
    ScopeNotAllowed { key: String, scope: String },
    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a value applies. Names are stored case-folded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Scope {
    pub network: Option<String>,
    pub channel: Option<String>,
}

impl Scope {
    pub fn global() -> Self {
        Self::default()
    }

    pub fn new(network: Option<&str>, channel: Option<&str>) -> Self {
        Self {
            network: network.map(|n| n.to_ascii_lowercase()),
            channel: channel.map(|c| Casemap::Rfc1459.to_lower(c)),
        }
    }

    pub fn network(network: &str) -> Self {
        Self::new(Some(network), None)
    }

    pub fn channel(channel: &str) -> Self {
        Self::new(None, Some(channel))
    }

    pub fn is_global(&self) -> bool {
        self.network.is_none() && self.channel.is_none()
    }

    /// Key suffix used in the config file.
    fn suffix(&self) -> String {
        let mut out = String::new();
        if let Some(net) = &self.network {
            let _ = write!(out, ".:{net}");
        }
        if let Some(chan) = &self.channel {
            let _ = write!(out, ".{chan}");
        }
        out
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.network, &self.channel) {
            (None, None) => f.write_str("global scope"),
            (Some(n), None) => write!(f, "network {n}"),
            (None, Some(c)) => write!(f, "channel {c}"),
            (Some(n), Some(c)) => write!(f, "{c} on {n}"),
        }
    }
}

/// Declaration of a key: its type, default and where it may be scoped.
#[derive(Debug, Clone)]
pub struct Decl {
    pub name: String,
    pub kind: Kind,
    pub default: Value,
    pub help: String,
    pub channel_specific: bool,
    pub network_specific: bool,
    pub private: bool,
}

impl Decl {
    pub fn new(name: &str, kind: Kind, default: Value) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default,
            help: String::new(),
            channel_specific: false,
            network_specific: false,
            private: false,
        }
    }

    pub fn help(mut self, help: &str) -> Self {
        self.help = help.to_string();
        self
    }

    /// May be overridden per channel (and per network+channel).
    pub fn channel(mut self) -> Self {
        self.channel_specific = true;
        self.network_specific = true;
        self
    }

    pub fn network(mut self) -> Self {
        self.network_specific = true;
        self
    }

    /// Never logged or shown by `config` listings.
    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn boolean(name: &str, default: bool) -> Self {
        Self::new(name, Kind::Boolean, Value::Bool(default))
    }

    pub fn string(name: &str, default: &str) -> Self {
        Self::new(name, Kind::String, Value::Str(default.to_string()))
    }

    pub fn set(name: &str, default: &[&str]) -> Self {
        Self::new(name, Kind::SpaceSeparatedSet, Value::set(default.iter().copied()))
    }

    pub fn int(name: &str, kind: Kind, default: i64) -> Self {
        Self::new(name, kind, Value::Int(default))
    }

    pub fn float(name: &str, default: f64) -> Self {
        Self::new(name, Kind::PositiveFloat, Value::Float(default))
    }

    fn allows(&self, scope: &Scope) -> bool {
        (scope.channel.is_none() || self.channel_specific)
            && (scope.network.is_none() || self.network_specific)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    decl: Decl,
    values: BTreeMap<Scope, Value>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    templates: Vec<Decl>,
    /// Raw values read from file for keys nobody has registered yet.
    pending: BTreeMap<(String, Scope), (String, String)>,
}

impl Inner {
    /// Find the entry for `key`, materializing it from a template.
    fn entry(&mut self, key: &str) -> Option<&mut Entry> {
        let lower = key.to_ascii_lowercase();
        if !self.entries.contains_key(&lower) {
            let template = self
                .templates
                .iter()
                .find(|t| template_matches(&t.name, key))?;
            let mut decl = template.clone();
            decl.name = key.to_string();
            self.insert(decl);
        }
        self.entries.get_mut(&lower)
    }

    fn insert(&mut self, decl: Decl) {
        let lower = decl.name.to_ascii_lowercase();
        let entry = self.entries.entry(lower.clone()).or_insert_with(|| Entry {
            decl: decl.clone(),
            values: BTreeMap::new(),
        });
        entry.decl = decl;

        let pending: Vec<(Scope, String)> = self
            .pending
            .range((lower.clone(), Scope::default())..)
            .take_while(|((k, _), _)| *k == lower)
            .map(|((_, scope), (_, raw))| (scope.clone(), raw.clone()))
            .collect();
        for (scope, raw) in pending {
            self.pending.remove(&(lower.clone(), scope.clone()));
            match entry.decl.kind.parse(&raw) {
                Ok(value) if entry.decl.allows(&scope) => {
                    entry.values.insert(scope, value);
                }
                Ok(_) => tracing::warn!(key = %entry.decl.name, %scope, "Dropping value for scope the key does not allow"),
                Err(reason) => tracing::warn!(key = %entry.decl.name, %reason, "Dropping invalid stored value"),
            }
        }
    }
}

fn template_matches(template: &str, key: &str) -> bool {
    let t: Vec<&str> = template.split('.').collect();
    let k: Vec<&str> = key.split('.').collect();
    t.len() == k.len()
        && t
            .iter()
            .zip(&k)
            .all(|(t, k)| *t == "*" || t.eq_ignore_ascii_case(k))
}

/// Split `base.:net.#chan` into the base key and its scope.
fn split_scope(key: &str) -> (&str, Scope) {
    if let Some(idx) = key.find(".:") {
        let rest = &key[idx + 2..];
        let (net, chan) = match rest.split_once('.') {
            Some((net, chan)) => (net, Some(chan)),
            None => (rest, None),
        };
        return (&key[..idx], Scope::new(Some(net), chan));
    }
    let channel_start = key
        .match_indices('.')
        .map(|(i, _)| i)
        .find(|&i| key[i + 1..].starts_with(['#', '&', '!', '+']));
    match channel_start {
        Some(idx) => (&key[..idx], Scope::new(None, Some(&key[idx + 1..]))),
        None => (key, Scope::global()),
    }
}

/// The process-wide configuration registry.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Inner>,
    path: RwLock<Option<PathBuf>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every core key registered.
    pub fn with_core() -> Self {
        let registry = Self::new();
        register_core(&registry);
        registry
    }

    /// Declare a key. Re-registering keeps the values already set.
    pub fn register(&self, decl: Decl) {
        if decl.name.split('.').any(|s| s == "*") {
            let mut inner = self.inner.write();
            inner.templates.retain(|t| !t.name.eq_ignore_ascii_case(&decl.name));
            inner.templates.push(decl);
        } else {
            self.inner.write().insert(decl);
        }
    }

    pub fn is_registered(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        inner.entry(key).is_some()
    }

    /// Resolve `key` for the given network and channel.
    pub fn get(&self, key: &str, network: Option<&str>, channel: Option<&str>) -> Result<Value, ConfigError> {
        let mut inner = self.inner.write();
        let entry = inner
            .entry(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let net = network.map(|n| n.to_ascii_lowercase());
        let chan = channel.map(|c| Casemap::Rfc1459.to_lower(c));
        let mut candidates = Vec::with_capacity(4);
        if entry.decl.channel_specific && chan.is_some() {
            if entry.decl.network_specific && net.is_some() {
                candidates.push(Scope { network: net.clone(), channel: chan.clone() });
            }
            candidates.push(Scope { network: None, channel: chan.clone() });
        }
        if entry.decl.network_specific && net.is_some() {
            candidates.push(Scope { network: net.clone(), channel: None });
        }
        candidates.push(Scope::global());
        Ok(candidates
            .iter()
            .find_map(|scope| entry.values.get(scope))
            .unwrap_or(&entry.decl.default)
            .clone())
    }

    /// Parse `raw` and store it for `scope`.
    pub fn set(&self, key: &str, scope: &Scope, raw: &str) -> Result<(), ConfigError> {
        let mut inner = self.inner.write();
        let entry = inner
            .entry(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let value = entry.decl.kind.parse(raw).map_err(|reason| ConfigError::InvalidValue {
            key: key.to_string(),
            reason,
        })?;
        store(entry, key, scope, value)
    }

    pub fn set_value(&self, key: &str, scope: &Scope, value: Value) -> Result<(), ConfigError> {
        let mut inner = self.inner.write();
        let entry = inner
            .entry(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        if !entry.decl.kind.accepts(&value) {
            return Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("{value} does not fit {:?}", entry.decl.kind),
            });
        }
        store(entry, key, scope, value)
    }

    /// Forget the explicit value at `scope` so it inherits again.
    pub fn reset(&self, key: &str, scope: &Scope) -> Result<bool, ConfigError> {
        let mut inner = self.inner.write();
        let entry = inner
            .entry(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        Ok(entry.values.remove(scope).is_some())
    }

    /// Whether a value was explicitly set at exactly `scope`.
    pub fn is_set(&self, key: &str, scope: &Scope) -> bool {
        let mut inner = self.inner.write();
        inner
            .entry(key)
            .is_some_and(|e| e.values.contains_key(scope))
    }

    pub fn help(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.write();
        inner.entry(key).map(|e| e.decl.help.clone())
    }

    pub fn is_private(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        inner.entry(key).is_some_and(|e| e.decl.private)
    }

    /// Registered keys directly below `prefix` (`plugins` → `plugins.Admin`).
    pub fn children(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.read();
        let depth = prefix.split('.').count() + 1;
        let lower = format!("{}.", prefix.to_ascii_lowercase());
        let mut out: Vec<String> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(&lower) && k.split('.').count() == depth)
            .map(|(_, e)| e.decl.name.clone())
            .collect();
        // Keys still waiting for registration count too.
        for ((k, _), (display, _)) in &inner.pending {
            if k.starts_with(&lower) && k.split('.').count() == depth && !out.contains(display) {
                out.push(display.clone());
            }
        }
        out
    }

    // ── Typed accessors ──
    //
    // These log and fall back to a neutral value when the key is unknown
    // or has a different type, so call sites stay readable.

    pub fn bool(&self, key: &str, network: Option<&str>, channel: Option<&str>) -> bool {
        self.typed(key, network, channel, Value::as_bool).unwrap_or(false)
    }

    pub fn int(&self, key: &str, network: Option<&str>, channel: Option<&str>) -> i64 {
        self.typed(key, network, channel, Value::as_int).unwrap_or(0)
    }

    pub fn float(&self, key: &str, network: Option<&str>, channel: Option<&str>) -> f64 {
        self.typed(key, network, channel, Value::as_float).unwrap_or(0.0)
    }

    pub fn string(&self, key: &str, network: Option<&str>, channel: Option<&str>) -> String {
        self.typed(key, network, channel, |v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    pub fn set_of(&self, key: &str, network: Option<&str>, channel: Option<&str>) -> BTreeSet<String> {
        self.typed(key, network, channel, |v| v.as_set().cloned())
            .unwrap_or_default()
    }

    fn typed<T>(
        &self,
        key: &str,
        network: Option<&str>,
        channel: Option<&str>,
        extract: impl FnOnce(&Value) -> Option<T>,
    ) -> Option<T> {
        match self.get(key, network, channel) {
            Ok(value) => {
                let out = extract(&value);
                if out.is_none() {
                    tracing::warn!(key, "Configuration value has unexpected type");
                }
                out
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Configuration lookup failed");
                None
            }
        }
    }

    // ── Persistence ──

    /// Read a config file and remember its path for [`Registry::save`].
    pub fn load_file(&self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path)?;
        self.load_str(&text)?;
        *self.path.write() = Some(path.to_path_buf());
        Ok(())
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.read().clone()
    }

    pub fn set_path(&self, path: &Path) {
        *self.path.write() = Some(path.to_path_buf());
    }

    pub fn load_str(&self, text: &str) -> Result<(), ConfigError> {
        for (index, line) in text.lines().enumerate() {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (key, raw) = match line.split_once(": ") {
                Some((k, v)) => (k.trim(), v),
                None => match line.trim_end().strip_suffix(':') {
                    Some(k) => (k.trim(), ""),
                    None => {
                        return Err(ConfigError::Parse {
                            line: index + 1,
                            reason: "expected `key: value`".into(),
                        });
                    }
                },
            };
            let (base, scope) = split_scope(key);
            let mut inner = self.inner.write();
            match inner.entry(base) {
                Some(entry) => {
                    let value = entry.decl.kind.parse(raw).map_err(|reason| ConfigError::Parse {
                        line: index + 1,
                        reason: format!("{base}: {reason}"),
                    })?;
                    store(entry, base, &scope, value).map_err(|e| ConfigError::Parse {
                        line: index + 1,
                        reason: e.to_string(),
                    })?;
                }
                None => {
                    inner.pending.insert(
                        (base.to_ascii_lowercase(), scope),
                        (base.to_string(), raw.to_string()),
                    );
                }
            }
        }
        Ok(())
    }

    /// Render every explicitly set value, sorted by key.
    pub fn dump(&self) -> String {
        let inner = self.inner.read();
        let mut lines: BTreeMap<(String, Scope), String> = BTreeMap::new();
        for (lower, entry) in &inner.entries {
            for (scope, value) in &entry.values {
                lines.insert(
                    (lower.clone(), scope.clone()),
                    format!("{}{}: {}", entry.decl.name, scope.suffix(), value::serialize(value)),
                );
            }
        }
        for ((lower, scope), (display, raw)) in &inner.pending {
            lines.insert(
                (lower.clone(), scope.clone()),
                format!("{display}{}: {raw}", scope.suffix()),
            );
        }
        let mut out = String::from("# perch configuration\n");
        for line in lines.values() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Atomically write the registry to its file.
    pub fn save(&self, tmp_dir: Option<&Path>, backup_dir: Option<&Path>) -> Result<(), ConfigError> {
        let Some(path) = self.path() else {
            return Ok(());
        };
        let text = self.dump();
        crate::atomic_file::write_atomic(&path, text.as_bytes(), tmp_dir, backup_dir)?;
        tracing::debug!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}

fn store(entry: &mut Entry, key: &str, scope: &Scope, value: Value) -> Result<(), ConfigError> {
    if !entry.decl.allows(scope) {
        return Err(ConfigError::ScopeNotAllowed {
            key: key.to_string(),
            scope: scope.to_string(),
        });
    }
    entry.values.insert(scope.clone(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let r = Registry::new();
        r.register(Decl::string("replies.whenAddressedBy.chars", "").channel());
        r.register(Decl::int("protocols.irc.throttleBurst", Kind::PositiveInteger, 5));
        r.register(Decl::set("networks.*.servers", &[]));
        r
    }

    #[test]
    fn scoped_inheritance_resolves_most_specific() {
        let r = registry();
        let key = "replies.whenAddressedBy.chars";
        r.set(key, &Scope::global(), "!").unwrap();
        r.set(key, &Scope::network("libera"), "@").unwrap();
        r.set(key, &Scope::channel("#rust"), "$").unwrap();
        r.set(key, &Scope::new(Some("libera"), Some("#Rust")), "%").unwrap();

        assert_eq!(r.string(key, None, None), "!");
        assert_eq!(r.string(key, Some("libera"), None), "@");
        assert_eq!(r.string(key, Some("oftc"), Some("#rust")), "$");
        assert_eq!(r.string(key, Some("LIBERA"), Some("#RUST")), "%");
        assert_eq!(r.string(key, Some("libera"), Some("#other")), "@");
        assert_eq!(r.string(key, Some("oftc"), Some("#other")), "!");
    }

    #[test]
    fn reset_reverts_to_inheritance() {
        let r = registry();
        let key = "replies.whenAddressedBy.chars";
        r.set(key, &Scope::global(), "!").unwrap();
        r.set(key, &Scope::channel("#a"), "@").unwrap();
        assert!(r.is_set(key, &Scope::channel("#a")));
        assert!(!r.is_set(key, &Scope::channel("#b")));
        assert!(r.reset(key, &Scope::channel("#a")).unwrap());
        assert_eq!(r.string(key, None, Some("#a")), "!");
        assert!(r.is_set(key, &Scope::global()));
    }

    #[test]
    fn scope_restrictions_and_validation() {
        let r = registry();
        let err = r
            .set("protocols.irc.throttleBurst", &Scope::channel("#a"), "3")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ScopeNotAllowed { .. }));
        let err = r
            .set("protocols.irc.throttleBurst", &Scope::global(), "0")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert!(matches!(
            r.get("no.such.key", None, None),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn templates_materialize_keys() {
        let r = registry();
        assert!(r.is_registered("networks.libera.servers"));
        r.set("networks.libera.servers", &Scope::global(), "irc.libera.chat:6697")
            .unwrap();
        assert_eq!(
            r.set_of("networks.libera.servers", None, None),
            BTreeSet::from(["irc.libera.chat:6697".to_string()])
        );
        assert!(!r.is_registered("networks.libera.servers.extra"));
    }

    #[test]
    fn file_round_trip_keeps_pending_keys() {
        let r = registry();
        let text = "# perch configuration\n\
                    plugins.Weather.units: metric\n\
                    protocols.irc.throttleBurst: 7\n\
                    replies.whenAddressedBy.chars: !\n\
                    replies.whenAddressedBy.chars.#rust: $\n\
                    replies.whenAddressedBy.chars.:libera.#rust: @\n";
        r.load_str(text).unwrap();
        assert_eq!(r.int("protocols.irc.throttleBurst", None, None), 7);
        assert_eq!(r.string("replies.whenAddressedBy.chars", Some("libera"), Some("#rust")), "@");
        assert_eq!(r.dump(), text);

        r.register(Decl::string("plugins.Weather.units", "imperial"));
        assert_eq!(r.string("plugins.Weather.units", None, None), "metric");
        assert_eq!(r.children("plugins"), Vec::<String>::new());
        assert_eq!(r.dump(), text);
    }

    #[test]
    fn children_lists_plugin_flags() {
        let r = registry();
        r.register(Decl::boolean("plugins.*", false));
        r.load_str("plugins.Admin: True\nplugins.Misc: False\n").unwrap();
        let mut kids = r.children("plugins");
        kids.sort();
        assert_eq!(kids, vec!["plugins.Admin", "plugins.Misc"]);
    }

    #[test]
    fn parse_errors_report_line() {
        let r = registry();
        let err = r.load_str("# ok\nthis line has no separator\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 2, .. }));
        let err = r.load_str("protocols.irc.throttleBurst: many\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 1, .. }));
    }

    #[test]
    fn split_scope_forms() {
        assert_eq!(split_scope("a.b"), ("a.b", Scope::global()));
        assert_eq!(split_scope("a.b.#c.d"), ("a.b", Scope::channel("#c.d")));
        assert_eq!(split_scope("a.b.:net"), ("a.b", Scope::network("net")));
        assert_eq!(
            split_scope("a.b.:net.#c"),
            ("a.b", Scope::new(Some("net"), Some("#c")))
        );
    }
}
