//! IRC case mapping and the case-folded containers built on it.

use std::collections::HashMap;

/// How nicks and channel names compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Casemap {
    /// `[]\~` fold to `{}|^`.
    #[default]
    Rfc1459,
    /// `[]\` fold to `{}|`; `~` and `^` stay distinct.
    StrictRfc1459,
    /// Only `A-Z` fold.
    Ascii,
}

impl Casemap {
    /// Parse an ISUPPORT `CASEMAPPING` value.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "rfc1459" => Some(Casemap::Rfc1459),
            "strict-rfc1459" => Some(Casemap::StrictRfc1459),
            "ascii" => Some(Casemap::Ascii),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Casemap::Rfc1459 => "rfc1459",
            Casemap::StrictRfc1459 => "strict-rfc1459",
            Casemap::Ascii => "ascii",
        }
    }

    pub fn fold_char(self, c: char) -> char {
        match (self, c) {
            (_, 'A'..='Z') => c.to_ascii_lowercase(),
            (Casemap::Ascii, _) => c,
            (_, '[') => '{',
            (_, ']') => '}',
            (_, '\\') => '|',
            (Casemap::Rfc1459, '~') => '^',
            _ => c,
        }
    }

    pub fn to_lower(self, s: &str) -> String {
        s.chars().map(|c| self.fold_char(c)).collect()
    }

    pub fn equals(self, a: &str, b: &str) -> bool {
        a.len() == b.len() && a.chars().map(|c| self.fold_char(c)).eq(b.chars().map(|c| self.fold_char(c)))
    }
}

/// Map keyed by nick or channel name under a casemap.
///
/// The original spelling of each key is kept for display.
#[derive(Debug, Clone)]
pub struct IrcDict<V> {
    casemap: Casemap,
    entries: HashMap<String, (String, V)>,
}

impl<V> Default for IrcDict<V> {
    fn default() -> Self {
        Self::new(Casemap::default())
    }
}

impl<V> IrcDict<V> {
    pub fn new(casemap: Casemap) -> Self {
        Self {
            casemap,
            entries: HashMap::new(),
        }
    }

    pub fn casemap(&self) -> Casemap {
        self.casemap
    }

    /// Re-fold every key under a new casemap. Keys that collide keep the
    /// entry inserted last.
    pub fn set_casemap(&mut self, casemap: Casemap) {
        if casemap == self.casemap {
            return;
        }
        self.casemap = casemap;
        let old = std::mem::take(&mut self.entries);
        for (_, (name, value)) in old {
            self.entries.insert(casemap.to_lower(&name), (name, value));
        }
    }

    pub fn insert(&mut self, key: &str, value: V) -> Option<V> {
        self.entries
            .insert(self.casemap.to_lower(key), (key.to_string(), value))
            .map(|(_, v)| v)
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(&self.casemap.to_lower(key)).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.entries
            .get_mut(&self.casemap.to_lower(key))
            .map(|(_, v)| v)
    }

    /// Stored spelling of `key`.
    pub fn original_key(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&self.casemap.to_lower(key))
            .map(|(k, _)| k.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries
            .remove(&self.casemap.to_lower(key))
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&self.casemap.to_lower(key))
    }

    /// Move an entry to a new key, keeping its value.
    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        match self.remove(from) {
            Some(v) => {
                self.insert(to, v);
                true
            }
            None => false,
        }
    }

    pub fn entry_or_insert_with(&mut self, key: &str, f: impl FnOnce() -> V) -> &mut V {
        &mut self
            .entries
            .entry(self.casemap.to_lower(key))
            .or_insert_with(|| (key.to_string(), f()))
            .1
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut V)> {
        self.entries.values_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Set of nicks or channels under a casemap.
#[derive(Debug, Clone, Default)]
pub struct IrcSet {
    inner: IrcDict<()>,
}

impl IrcSet {
    pub fn new(casemap: Casemap) -> Self {
        Self {
            inner: IrcDict::new(casemap),
        }
    }

    pub fn set_casemap(&mut self, casemap: Casemap) {
        self.inner.set_casemap(casemap);
    }

    /// Returns true if the name was not present.
    pub fn insert(&mut self, name: &str) -> bool {
        self.inner.insert(name, ()).is_none()
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.inner.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn rename(&mut self, from: &str, to: &str) -> bool {
        self.inner.rename(from, to)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.inner.keys()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Members in case-folded sorted order.
    pub fn sorted(&self) -> Vec<String> {
        let casemap = self.inner.casemap();
        let mut names: Vec<String> = self.iter().map(str::to_string).collect();
        names.sort_by_key(|n| casemap.to_lower(n));
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Casemap; 3] = [Casemap::Rfc1459, Casemap::StrictRfc1459, Casemap::Ascii];

    #[test]
    fn folding_is_idempotent() {
        for cm in ALL {
            for nick in ["Foo[]\\~", "BAR^{}|", "mIxEd-_`", "日本語Nick"] {
                let once = cm.to_lower(nick);
                assert_eq!(cm.to_lower(&once), once, "{cm:?} {nick}");
            }
        }
    }

    #[test]
    fn casemap_variants_differ() {
        assert!(Casemap::Rfc1459.equals("foo[~]", "FOO{^}"));
        assert!(!Casemap::StrictRfc1459.equals("foo~", "foo^"));
        assert!(Casemap::StrictRfc1459.equals("foo[", "FOO{"));
        assert!(!Casemap::Ascii.equals("foo[", "foo{"));
        assert!(Casemap::Ascii.equals("FOO", "foo"));
    }

    #[test]
    fn equality_is_an_equivalence() {
        let names = ["a[b", "A{B", "a{b", "A[b", "axb"];
        for cm in ALL {
            for a in names {
                assert!(cm.equals(a, a));
                for b in names {
                    assert_eq!(cm.equals(a, b), cm.equals(b, a));
                    for c in names {
                        if cm.equals(a, b) && cm.equals(b, c) {
                            assert!(cm.equals(a, c));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn dict_lookup_and_rename() {
        let mut d = IrcDict::new(Casemap::Rfc1459);
        d.insert("Alice[away]", 1);
        assert_eq!(d.get("alice{AWAY}"), Some(&1));
        assert_eq!(d.original_key("ALICE[AWAY]"), Some("Alice[away]"));
        assert!(d.rename("alice{away}", "Bob"));
        assert_eq!(d.get("bob"), Some(&1));
        assert!(!d.contains_key("alice[away]"));
    }

    #[test]
    fn dict_refolds_on_casemap_change() {
        let mut d = IrcDict::new(Casemap::Ascii);
        d.insert("a[", 1);
        assert!(!d.contains_key("a{"));
        d.set_casemap(Casemap::Rfc1459);
        assert!(d.contains_key("a{"));
    }

    #[test]
    fn set_basics() {
        let mut s = IrcSet::new(Casemap::Rfc1459);
        assert!(s.insert("Nick"));
        assert!(!s.insert("NICK"));
        assert_eq!(s.len(), 1);
        assert!(s.remove("nick"));
        assert!(s.is_empty());
    }
}
