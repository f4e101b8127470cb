//! Per-channel access records.

use std::collections::BTreeSet;
use std::path::Path;

use parking_lot::RwLock;

use crate::ident::{Casemap, IrcDict, canonical_capability, invert_capability};
use crate::structures::ExpiringHostmaskDict;

use super::record::{Field, Record, format_time};
use super::{DbError, Store};

#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub name: String,
    /// The bot ignores everything said here.
    pub lobotomized: bool,
    /// Unset channel capabilities are granted (except op/halfop/voice).
    pub default_allow: bool,
    /// Bare capability names, `cap` or `-cap`.
    pub capabilities: BTreeSet<String>,
    pub bans: ExpiringHostmaskDict,
    pub ignores: ExpiringHostmaskDict,
}

impl ChannelRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lobotomized: false,
            default_allow: true,
            capabilities: BTreeSet::new(),
            bans: ExpiringHostmaskDict::default(),
            ignores: ExpiringHostmaskDict::default(),
        }
    }

    pub fn add_capability(&mut self, cap: &str) {
        let cap = canonical_capability(cap);
        self.capabilities.remove(&invert_capability(&cap));
        self.capabilities.insert(cap);
    }

    pub fn remove_capability(&mut self, cap: &str) -> bool {
        self.capabilities.remove(&canonical_capability(cap))
    }

    /// Whether `hostmask` is on this channel's ignore list.
    pub fn is_ignored(&self, hostmask: &str, now: f64) -> bool {
        self.ignores.matching(hostmask, now).is_some()
    }

    pub fn is_banned(&self, hostmask: &str, now: f64) -> bool {
        self.bans.matching(hostmask, now).is_some()
    }

    fn to_record(&self) -> Record {
        let mut r = Record::new("channel", &self.name);
        r.push("lobotomized", bool_str(self.lobotomized));
        r.push("defaultAllow", bool_str(self.default_allow));
        for cap in &self.capabilities {
            r.push("capability", cap);
        }
        for (key, list) in [("ban", &self.bans), ("ignore", &self.ignores)] {
            for (pattern, expires, _) in list.iter() {
                r.push_field(Field::new(key, pattern).with_child("expires", expires.map_or("0".into(), format_time)));
            }
        }
        r
    }

    fn from_record(r: &Record) -> Result<Self, String> {
        let mut c = ChannelRecord::new(&r.name);
        c.lobotomized = r.flag("lobotomized").unwrap_or(false);
        c.default_allow = r.flag("defaultAllow").unwrap_or(true);
        for field in &r.fields {
            match field.key.as_str() {
                "capability" => c.add_capability(&field.value),
                "ban" | "ignore" => {
                    let expires = match field.child("expires") {
                        None | Some("0") => None,
                        Some(t) => Some(
                            t.parse::<f64>()
                                .map_err(|_| format!("{}: bad expiry {t:?}", r.name))?,
                        ),
                    };
                    let list = if field.key == "ban" { &mut c.bans } else { &mut c.ignores };
                    list.add(&field.value, expires, ());
                }
                _ => {}
            }
        }
        Ok(c)
    }
}

fn bool_str(b: bool) -> &'static str {
    if b { "True" } else { "False" }
}

/// All channel records, keyed by folded name.
#[derive(Debug)]
pub struct ChannelsDb {
    channels: RwLock<IrcDict<ChannelRecord>>,
    store: Store,
}

impl ChannelsDb {
    pub fn in_memory() -> Self {
        Self {
            channels: RwLock::new(IrcDict::new(Casemap::default())),
            store: Store::memory(),
        }
    }

    pub fn open(path: &Path, tmp_dir: Option<&Path>, backup_dir: Option<&Path>) -> Result<Self, DbError> {
        let store = Store::file(path, tmp_dir, backup_dir);
        let mut channels = IrcDict::new(Casemap::default());
        for record in store.read()? {
            if record.kind != "channel" {
                continue;
            }
            let c = ChannelRecord::from_record(&record).map_err(|reason| DbError::Parse {
                path: path.display().to_string(),
                reason,
            })?;
            channels.insert(&c.name.clone(), c);
        }
        tracing::debug!(path = %path.display(), channels = channels.len(), "Channels database loaded");
        Ok(Self {
            channels: RwLock::new(channels),
            store,
        })
    }

    pub fn get(&self, name: &str) -> Option<ChannelRecord> {
        self.channels.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.read().values().map(|c| c.name.clone()).collect()
    }

    /// Whether the bot should stay silent in `name`.
    pub fn is_lobotomized(&self, name: &str) -> bool {
        self.channels.read().get(name).is_some_and(|c| c.lobotomized)
    }

    /// Mutate the record for `name`, creating it on first use, and flush.
    pub fn update<R>(&self, name: &str, f: impl FnOnce(&mut ChannelRecord) -> R) -> Result<R, DbError> {
        let (out, text) = {
            let mut channels = self.channels.write();
            let record = channels.entry_or_insert_with(name, || ChannelRecord::new(name));
            let out = f(record);
            (out, render(&channels))
        };
        self.store.write(&text)?;
        Ok(out)
    }

    /// Drop expired bans and ignores. Returns whether anything changed.
    pub fn expire(&self, now: f64) -> Result<bool, DbError> {
        let text = {
            let mut channels = self.channels.write();
            let mut dropped = 0;
            for (_, c) in channels.iter_mut() {
                dropped += c.bans.expire(now) + c.ignores.expire(now);
            }
            if dropped == 0 {
                return Ok(false);
            }
            render(&channels)
        };
        self.store.write(&text)?;
        Ok(true)
    }

    pub fn flush(&self) -> Result<(), DbError> {
        let text = render(&self.channels.read());
        self.store.write(&text)
    }
}

fn render(channels: &IrcDict<ChannelRecord>) -> String {
    let mut records: Vec<Record> = channels.values().map(ChannelRecord::to_record).collect();
    records.sort_by(|a, b| Casemap::default().to_lower(&a.name).cmp(&Casemap::default().to_lower(&b.name)));
    super::record::render(&records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_created_on_demand() {
        let db = ChannelsDb::in_memory();
        assert!(db.get("#perch").is_none());
        db.update("#Perch", |c| c.lobotomized = true).unwrap();
        assert!(db.is_lobotomized("#perch"));
        assert_eq!(db.get("#PERCH").unwrap().name, "#Perch");
    }

    #[test]
    fn capabilities_replace_their_inverse() {
        let mut c = ChannelRecord::new("#c");
        c.add_capability("topic");
        c.add_capability("-topic");
        assert_eq!(c.capabilities.len(), 1);
        assert!(c.capabilities.contains("-topic"));
    }

    #[test]
    fn bans_and_ignores_expire() {
        let db = ChannelsDb::in_memory();
        db.update("#c", |c| {
            c.bans.add("*!*@spam.example", Some(100.0), ());
            c.ignores.add("*!*@noise.example", None, ());
        })
        .unwrap();
        let c = db.get("#c").unwrap();
        assert!(c.is_banned("x!y@spam.example", 50.0));
        assert!(!c.is_banned("x!y@spam.example", 150.0));
        assert!(db.expire(150.0).unwrap());
        assert!(!db.expire(150.0).unwrap());
        assert!(db.get("#c").unwrap().is_ignored("a!b@noise.example", 1e12));
    }

    #[test]
    fn persisted_records_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.conf");
        {
            let db = ChannelsDb::open(&path, None, None).unwrap();
            db.update("#b", |c| {
                c.default_allow = false;
                c.add_capability("-op");
                c.bans.add("*!*@x", Some(1700000000.0), ());
            })
            .unwrap();
            db.update("#a", |c| c.lobotomized = true).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("channel #a\n"));
        let db = ChannelsDb::open(&path, None, None).unwrap();
        let b = db.get("#b").unwrap();
        assert!(!b.default_allow);
        assert!(b.capabilities.contains("-op"));
        assert!(b.is_banned("n!u@x", 0.0));
        db.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
    }
}
