//! Global ignore list.
//!
//! Persistent entries come from the `ignore` commands; temporary ones are
//! added by flood control and only live in memory.

use std::path::Path;

use parking_lot::RwLock;

use crate::structures::ExpiringHostmaskDict;

use super::record::{Field, Record, format_time};
use super::{DbError, Store};

#[derive(Debug)]
pub struct IgnoresDb {
    persistent: RwLock<ExpiringHostmaskDict>,
    /// Pattern → reason.
    temporary: RwLock<ExpiringHostmaskDict<String>>,
    store: Store,
}

impl IgnoresDb {
    pub fn in_memory() -> Self {
        Self {
            persistent: RwLock::new(ExpiringHostmaskDict::default()),
            temporary: RwLock::new(ExpiringHostmaskDict::default()),
            store: Store::memory(),
        }
    }

    pub fn open(path: &Path, tmp_dir: Option<&Path>, backup_dir: Option<&Path>) -> Result<Self, DbError> {
        let store = Store::file(path, tmp_dir, backup_dir);
        let mut persistent = ExpiringHostmaskDict::default();
        for record in store.read()? {
            if record.kind != "ignore" {
                continue;
            }
            let expires = match record.get("expires") {
                None | Some("0") => None,
                Some(t) => Some(t.parse::<f64>().map_err(|_| DbError::Parse {
                    path: path.display().to_string(),
                    reason: format!("bad expiry {t:?} for {}", record.name),
                })?),
            };
            persistent.add(&record.name, expires, ());
        }
        Ok(Self {
            persistent: RwLock::new(persistent),
            temporary: RwLock::new(ExpiringHostmaskDict::default()),
            store,
        })
    }

    pub fn add(&self, pattern: &str, expires: Option<f64>) -> Result<(), DbError> {
        let text = {
            let mut list = self.persistent.write();
            list.add(pattern, expires, ());
            render(&list)
        };
        self.store.write(&text)
    }

    pub fn remove(&self, pattern: &str) -> Result<bool, DbError> {
        let text = {
            let mut list = self.persistent.write();
            if !list.remove(pattern) {
                return Ok(false);
            }
            render(&list)
        };
        self.store.write(&text)?;
        Ok(true)
    }

    pub fn list(&self) -> Vec<(String, Option<f64>)> {
        self.persistent
            .read()
            .iter()
            .map(|(p, e, _)| (p.to_string(), e))
            .collect()
    }

    /// Ignore `pattern` until `until` without persisting it.
    pub fn add_temporary(&self, pattern: &str, until: f64, reason: &str) {
        self.temporary.write().add(pattern, Some(until), reason.to_string());
    }

    pub fn remove_temporary(&self, pattern: &str) -> bool {
        self.temporary.write().remove(pattern)
    }

    /// Whether `hostmask` matches a live persistent or temporary entry.
    pub fn is_ignored(&self, hostmask: &str, now: f64) -> bool {
        self.persistent.read().matching(hostmask, now).is_some()
            || self.temporary.read().matching(hostmask, now).is_some()
    }

    /// Drop expired entries from both lists.
    pub fn expire(&self, now: f64) -> Result<(), DbError> {
        self.temporary.write().expire(now);
        let text = {
            let mut list = self.persistent.write();
            if list.expire(now) == 0 {
                return Ok(());
            }
            render(&list)
        };
        self.store.write(&text)
    }

    pub fn flush(&self) -> Result<(), DbError> {
        let text = render(&self.persistent.read());
        self.store.write(&text)
    }
}

fn render(list: &ExpiringHostmaskDict) -> String {
    let records: Vec<Record> = list
        .iter()
        .map(|(pattern, expires, _)| {
            let mut r = Record::new("ignore", pattern);
            r.push_field(Field::new("expires", expires.map_or("0".into(), format_time)));
            r
        })
        .collect();
    super::record::render(&records)
}
