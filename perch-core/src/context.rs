//! Shared services handed to every session and plugin call.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{ConfigError, Registry};
use crate::db::{self, ChannelsDb, DbError, IgnoresDb, NetworksDb, UsersDb};
use crate::ident;
use crate::structures::Timeout;
use crate::worker::WorkerPool;

#[derive(Debug, Clone)]
pub struct Context {
    pub registry: Arc<Registry>,
    pub users: Arc<UsersDb>,
    pub channels: Arc<ChannelsDb>,
    pub networks: Arc<NetworksDb>,
    pub ignores: Arc<IgnoresDb>,
    pub clock: Clock,
    pub workers: WorkerPool,
}

impl Context {
    /// Memory-only databases; nothing touches disk.
    pub fn in_memory(registry: Arc<Registry>, clock: Clock) -> Self {
        let users = UsersDb::in_memory(clock.clone());
        users.set_auth_timeout(auth_timeout(&registry));
        Self {
            users: Arc::new(users),
            channels: Arc::new(ChannelsDb::in_memory()),
            networks: Arc::new(NetworksDb::in_memory()),
            ignores: Arc::new(IgnoresDb::in_memory()),
            registry,
            clock,
            workers: WorkerPool::default(),
        }
    }

    /// Open the databases under `directories.data`.
    pub fn open(registry: Arc<Registry>, clock: Clock) -> Result<Self, DbError> {
        let data = directory(&registry, "directories.data");
        let tmp = directory(&registry, "directories.data.tmp");
        let backup = directory(&registry, "directories.backup");
        for dir in [&data, &tmp, &backup] {
            std::fs::create_dir_all(dir)?;
        }
        let (tmp, backup) = (Some(tmp.as_path()), Some(backup.as_path()));
        let users = UsersDb::open(&data.join("users.conf"), tmp, backup, clock.clone())?;
        users.set_auth_timeout(auth_timeout(&registry));
        Ok(Self {
            users: Arc::new(users),
            channels: Arc::new(ChannelsDb::open(&data.join("channels.conf"), tmp, backup)?),
            networks: Arc::new(NetworksDb::open(&data.join("networks.conf"), tmp, backup)?),
            ignores: Arc::new(IgnoresDb::open(&data.join("ignores.conf"), tmp, backup)?),
            registry,
            clock,
            workers: WorkerPool::default(),
        })
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    // ── Capabilities ──

    /// Whether the user behind `identifier` (account name or hostmask)
    /// holds `capability`. Undecided lookups fall back to the configured
    /// `capabilities` set and then `capabilities.default`.
    pub fn check_capability(&self, identifier: &str, capability: &str) -> bool {
        match db::check_capability(&self.users, &self.channels, identifier, capability) {
            Ok(granted) => granted,
            Err(DbError::Unresolved(_)) => self.default_capability(capability),
            Err(e) => {
                tracing::warn!(%identifier, %capability, error = %e, "Capability check failed");
                false
            }
        }
    }

    fn default_capability(&self, capability: &str) -> bool {
        let defaults: BTreeSet<String> = self
            .registry
            .set_of("capabilities", None, None)
            .iter()
            .map(|c| ident::canonical_capability(c))
            .collect();
        let capability = ident::canonical_capability(capability);
        let bare = ident::from_channel_capability(&capability)
            .map(|(_, cap)| cap.to_string())
            .unwrap_or_else(|| capability.clone());
        for candidate in [&capability, &bare] {
            if defaults.contains(candidate.as_str()) {
                return true;
            }
            if defaults.contains(&ident::invert_capability(candidate)) {
                return false;
            }
        }
        // Channel privileges are never granted by default.
        if ident::is_channel_capability(&capability) && db::capability::is_privileged(&bare) {
            return false;
        }
        let default = self.registry.bool("capabilities.default", None, None);
        if ident::is_anti_capability(&bare) { !default } else { default }
    }

    pub fn is_owner(&self, hostmask: &str) -> bool {
        self.users.get_user(hostmask).is_ok_and(|u| u.is_owner())
    }

    /// Trusted users are exempt from flood punishment.
    pub fn is_trusted(&self, hostmask: &str) -> bool {
        self.is_owner(hostmask) || self.check_capability(hostmask, "trusted")
    }

    // ── Ignores ──

    /// Whether messages from `hostmask` (in `channel`, if any) are dropped
    /// before plugins see them. Owners are never ignored; channel ignores
    /// do not apply to the channel's ops.
    pub fn is_ignored(&self, hostmask: &str, channel: Option<&str>) -> bool {
        let now = self.now();
        if let Ok(user) = self.users.get_user(hostmask) {
            if user.is_owner() {
                return false;
            }
            if user.ignore {
                return true;
            }
        }
        if self.ignores.is_ignored(hostmask, now) {
            return true;
        }
        if let Some(channel) = channel
            && let Some(record) = self.channels.get(channel)
            && record.is_ignored(hostmask, now)
        {
            return !self.check_capability(hostmask, &ident::make_channel_capability(channel, "op"));
        }
        false
    }

    /// Drop expired bans and ignores everywhere.
    pub fn expire(&self) -> Result<(), DbError> {
        let now = self.now();
        self.ignores.expire(now)?;
        self.channels.expire(now)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), DbError> {
        self.users.flush()?;
        self.channels.flush()?;
        self.networks.flush()?;
        self.ignores.flush()?;
        Ok(())
    }

    /// Write the configuration back to its file, if it came from one.
    pub fn save_config(&self) -> Result<(), ConfigError> {
        if self.registry.path().is_none() {
            return Ok(());
        }
        let tmp = directory(&self.registry, "directories.data.tmp");
        let backup = directory(&self.registry, "directories.backup");
        self.registry.save(Some(&tmp), Some(&backup))
    }
}

fn auth_timeout(registry: &Arc<Registry>) -> Timeout {
    let registry = registry.clone();
    Timeout::Dynamic(Arc::new(move || {
        registry.int("databases.users.timeoutIdentification", None, None) as f64
    }))
}

/// A configured directory; relative paths resolve against the
/// configuration file's directory.
pub fn directory(registry: &Registry, key: &str) -> PathBuf {
    let dir = PathBuf::from(registry.string(key, None, None));
    if dir.is_absolute() {
        return dir;
    }
    match registry.path().as_deref().and_then(Path::parent) {
        Some(base) => base.join(dir),
        None => dir,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scope;

    fn ctx() -> Context {
        Context::in_memory(Arc::new(Registry::with_core()), Clock::manual(1000.0))
    }

    #[test]
    fn unresolved_capabilities_use_configured_defaults() {
        let ctx = ctx();
        let mask = "stranger!s@nowhere";
        assert!(!ctx.check_capability(mask, "admin"));
        assert!(!ctx.check_capability(mask, "owner"));
        assert!(ctx.check_capability(mask, "Seen.seen"));
        assert!(!ctx.check_capability(mask, "-Seen.seen"));
        ctx.registry.set("capabilities.default", &Scope::global(), "False").unwrap();
        assert!(!ctx.check_capability(mask, "Seen.seen"));
        ctx.registry.set("capabilities", &Scope::global(), "-owner -admin Seen.seen").unwrap();
        assert!(ctx.check_capability(mask, "Seen.seen"));
    }

    #[test]
    fn registered_capabilities_win_over_defaults() {
        let ctx = ctx();
        let user = ctx.users.create_user("alice").unwrap();
        ctx.users
            .update(user.id, |u| {
                u.add_hostmask("alice!*@home");
                u.add_capability("admin");
            })
            .unwrap();
        assert!(ctx.check_capability("alice!a@home", "admin"));
        assert!(ctx.check_capability("alice", "admin"));
        assert!(!ctx.check_capability("alice!a@elsewhere", "admin"));
        assert!(!ctx.is_owner("alice!a@home"));
    }

    #[test]
    fn ignores_respect_owners_and_channel_ops() {
        let ctx = ctx();
        let owner = ctx.users.create_user("root").unwrap();
        ctx.users
            .update(owner.id, |u| {
                u.add_hostmask("root!*@admin.host");
                u.add_capability("owner");
            })
            .unwrap();
        ctx.ignores.add("*!*@*.host", None).unwrap();
        assert!(ctx.is_ignored("spam!s@bad.host", None));
        assert!(!ctx.is_ignored("root!r@admin.host", None));

        ctx.channels
            .update("#perch", |c| c.ignores.add("*!*@loud", None, ()))
            .unwrap();
        assert!(ctx.is_ignored("x!x@loud", Some("#perch")));
        assert!(!ctx.is_ignored("x!x@loud", Some("#other")));
        let op = ctx.users.create_user("chanop").unwrap();
        ctx.users
            .update(op.id, |u| {
                u.add_hostmask("op!*@loud");
                u.add_capability("#perch,op");
            })
            .unwrap();
        assert!(!ctx.is_ignored("op!o@loud", Some("#perch")));
    }

    #[test]
    fn open_creates_data_files_next_to_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::with_core());
        registry.set_path(&dir.path().join("perch.conf"));
        let ctx = Context::open(registry, Clock::manual(0.0)).unwrap();
        ctx.users.create_user("alice").unwrap();
        ctx.flush().unwrap();
        assert!(dir.path().join("data").join("users.conf").exists());
    }
}
