//! Per-network persisted state: STS policies and disconnect times.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;

use super::record::{Field, Record, format_time};
use super::{DbError, Store};

/// A cached Strict Transport Security policy for one host.
#[derive(Debug, Clone, PartialEq)]
pub struct StsPolicy {
    pub port: u16,
    /// Seconds the policy stays valid after the last disconnect.
    pub duration: f64,
    /// Absolute expiry.
    pub expires: f64,
    pub preload: bool,
}

impl StsPolicy {
    /// Parse the value of the `sts` capability, e.g.
    /// `duration=2592000,port=6697,preload`. Returns the advertised port
    /// (only meaningful on plaintext connections) and the duration.
    pub fn parse_advertisement(value: &str) -> (Option<u16>, Option<f64>, bool) {
        let mut port = None;
        let mut duration = None;
        let mut preload = false;
        for item in value.split(',') {
            match item.split_once('=') {
                Some(("port", p)) => port = p.parse().ok(),
                Some(("duration", d)) => duration = d.parse().ok(),
                None if item == "preload" => preload = true,
                _ => {}
            }
        }
        (port, duration, preload)
    }

    pub fn is_expired(&self, now: f64) -> bool {
        now >= self.expires
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkRecord {
    pub name: String,
    pub sts: BTreeMap<String, StsPolicy>,
    pub last_disconnect: BTreeMap<String, f64>,
}

impl NetworkRecord {
    fn to_record(&self) -> Record {
        let mut r = Record::new("network", &self.name);
        for (host, policy) in &self.sts {
            let mut field = Field::new("sts", host)
                .with_child("port", policy.port.to_string())
                .with_child("duration", format_time(policy.duration))
                .with_child("expires", format_time(policy.expires));
            if policy.preload {
                field = field.with_child("preload", "True");
            }
            r.push_field(field);
        }
        for (host, at) in &self.last_disconnect {
            r.push("disconnect", format!("{host} {}", format_time(*at)));
        }
        r
    }

    fn from_record(r: &Record) -> Result<Self, String> {
        let mut n = NetworkRecord {
            name: r.name.clone(),
            ..Default::default()
        };
        let num = |field: &Field, key: &str| -> Result<f64, String> {
            field
                .child(key)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| format!("{}: sts {} lacks a valid {key}", r.name, field.value))
        };
        for field in &r.fields {
            match field.key.as_str() {
                "sts" => {
                    let policy = StsPolicy {
                        port: num(field, "port")? as u16,
                        duration: num(field, "duration")?,
                        expires: num(field, "expires")?,
                        preload: field.child("preload").is_some_and(|v| v.eq_ignore_ascii_case("true")),
                    };
                    n.sts.insert(field.value.clone(), policy);
                }
                "disconnect" => {
                    let (host, at) = field
                        .value
                        .split_once(' ')
                        .and_then(|(h, t)| Some((h, t.parse::<f64>().ok()?)))
                        .ok_or_else(|| format!("{}: bad disconnect entry {:?}", r.name, field.value))?;
                    n.last_disconnect.insert(host.to_string(), at);
                }
                _ => {}
            }
        }
        Ok(n)
    }
}

#[derive(Debug)]
pub struct NetworksDb {
    networks: RwLock<BTreeMap<String, NetworkRecord>>,
    store: Store,
}

impl NetworksDb {
    pub fn in_memory() -> Self {
        Self {
            networks: RwLock::new(BTreeMap::new()),
            store: Store::memory(),
        }
    }

    pub fn open(path: &Path, tmp_dir: Option<&Path>, backup_dir: Option<&Path>) -> Result<Self, DbError> {
        let store = Store::file(path, tmp_dir, backup_dir);
        let mut networks = BTreeMap::new();
        for record in store.read()? {
            if record.kind != "network" {
                continue;
            }
            let n = NetworkRecord::from_record(&record).map_err(|reason| DbError::Parse {
                path: path.display().to_string(),
                reason,
            })?;
            networks.insert(n.name.to_ascii_lowercase(), n);
        }
        Ok(Self {
            networks: RwLock::new(networks),
            store,
        })
    }

    pub fn get(&self, network: &str) -> Option<NetworkRecord> {
        self.networks.read().get(&network.to_ascii_lowercase()).cloned()
    }

    fn update<R>(&self, network: &str, f: impl FnOnce(&mut NetworkRecord) -> R) -> Result<R, DbError> {
        let (out, text) = {
            let mut networks = self.networks.write();
            let record = networks
                .entry(network.to_ascii_lowercase())
                .or_insert_with(|| NetworkRecord {
                    name: network.to_string(),
                    ..Default::default()
                });
            let out = f(record);
            (out, render(&networks))
        };
        self.store.write(&text)?;
        Ok(out)
    }

    /// The live STS policy for `host`; an expired one is purged.
    pub fn sts_policy(&self, network: &str, host: &str, now: f64) -> Result<Option<StsPolicy>, DbError> {
        let Some(policy) = self.get(network).and_then(|n| n.sts.get(host).cloned()) else {
            return Ok(None);
        };
        if !policy.is_expired(now) {
            return Ok(Some(policy));
        }
        tracing::info!(network, host, "STS policy expired");
        self.update(network, |n| n.sts.remove(host))?;
        Ok(None)
    }

    /// Record a policy seen on a secure connection. A zero duration
    /// removes the policy.
    pub fn set_sts_policy(&self, network: &str, host: &str, port: u16, duration: f64, preload: bool, now: f64) -> Result<(), DbError> {
        self.update(network, |n| {
            if duration <= 0.0 {
                n.sts.remove(host);
            } else {
                n.sts.insert(
                    host.to_string(),
                    StsPolicy {
                        port,
                        duration,
                        expires: now + duration,
                        preload,
                    },
                );
            }
        })
    }

    /// Note a disconnect from `host`. STS policies restart their validity
    /// window at this point.
    pub fn record_disconnect(&self, network: &str, host: &str, now: f64) -> Result<(), DbError> {
        self.update(network, |n| {
            n.last_disconnect.insert(host.to_string(), now);
            if let Some(policy) = n.sts.get_mut(host) {
                policy.expires = now + policy.duration;
            }
        })
    }

    pub fn last_disconnect(&self, network: &str, host: &str) -> Option<f64> {
        self.get(network).and_then(|n| n.last_disconnect.get(host).copied())
    }

    pub fn flush(&self) -> Result<(), DbError> {
        let text = render(&self.networks.read());
        self.store.write(&text)
    }
}

fn render(networks: &BTreeMap<String, NetworkRecord>) -> String {
    let records: Vec<Record> = networks.values().map(NetworkRecord::to_record).collect();
    super::record::render(&records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertisement_parsing() {
        assert_eq!(
            StsPolicy::parse_advertisement("port=6697,duration=300,preload"),
            (Some(6697), Some(300.0), true)
        );
        assert_eq!(StsPolicy::parse_advertisement("duration=0"), (None, Some(0.0), false));
    }

    #[test]
    fn policies_expire_and_are_purged() {
        let db = NetworksDb::in_memory();
        db.set_sts_policy("Libera", "irc.libera.chat", 6697, 100.0, false, 1000.0).unwrap();
        assert_eq!(db.sts_policy("libera", "irc.libera.chat", 1050.0).unwrap().map(|p| p.port), Some(6697));
        db.record_disconnect("libera", "irc.libera.chat", 1090.0).unwrap();
        assert!(db.sts_policy("libera", "irc.libera.chat", 1150.0).unwrap().is_some());
        assert!(db.sts_policy("libera", "irc.libera.chat", 1200.0).unwrap().is_none());
        assert!(db.get("libera").unwrap().sts.is_empty());
        assert_eq!(db.last_disconnect("libera", "irc.libera.chat"), Some(1090.0));
    }

    #[test]
    fn zero_duration_clears_policy() {
        let db = NetworksDb::in_memory();
        db.set_sts_policy("n", "h", 6697, 100.0, false, 0.0).unwrap();
        db.set_sts_policy("n", "h", 6697, 0.0, false, 1.0).unwrap();
        assert!(db.sts_policy("n", "h", 2.0).unwrap().is_none());
    }

    #[test]
    fn records_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("networks.conf");
        {
            let db = NetworksDb::open(&path, None, None).unwrap();
            db.set_sts_policy("libera", "irc.libera.chat", 6697, 2592000.0, true, 1700000000.0).unwrap();
            db.record_disconnect("libera", "irc.libera.chat", 1700000100.5).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let db = NetworksDb::open(&path, None, None).unwrap();
        let record = db.get("libera").unwrap();
        assert!(record.sts["irc.libera.chat"].preload);
        db.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
    }
}
