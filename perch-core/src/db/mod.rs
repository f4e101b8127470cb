//! Identity and access database.
//!
//! Four stores, each persisted to its own plain-text file with an
//! atomic replace on every mutation:
//! - [`UsersDb`]: accounts, hostmasks, capabilities, passwords, sessions
//! - [`ChannelsDb`]: per-channel capabilities, lobotomy, bans and ignores
//! - [`NetworksDb`]: STS policies and last-disconnect times
//! - [`IgnoresDb`]: global ignores plus the temporary flood ignores
//!
//! Records are referenced by stable integer id (users) or folded name
//! (channels, networks); nothing holds a pointer into another store.

pub mod capability;
pub mod channel;
pub mod ignores;
pub mod network;
pub mod record;
pub mod user;

use std::path::{Path, PathBuf};

pub use channel::{ChannelRecord, ChannelsDb};
pub use ignores::IgnoresDb;
pub use network::{NetworkRecord, NetworksDb, StsPolicy};
pub use user::{Password, User, UsersDb};

use record::Record;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("no such user: {0}")]
    NoSuchUser(String),
    #[error("hostmask {hostmask} is already claimed by user {owner}")]
    DuplicateHostmask { hostmask: String, owner: String },
    #[error("password mismatch")]
    PasswordMismatch,
    #[error("a user named {0} already exists")]
    DuplicateName(String),
    /// Neither the user nor the channel decides the capability; the caller
    /// falls back to configured defaults.
    #[error("capability {0} is unresolved")]
    Unresolved(String),
    #[error("{path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("database I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a store lives on disk. A store without a path is memory-only.
#[derive(Debug, Clone, Default)]
pub struct Store {
    path: Option<PathBuf>,
    tmp_dir: Option<PathBuf>,
    backup_dir: Option<PathBuf>,
}

impl Store {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn file(path: &Path, tmp_dir: Option<&Path>, backup_dir: Option<&Path>) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            tmp_dir: tmp_dir.map(Path::to_path_buf),
            backup_dir: backup_dir.map(Path::to_path_buf),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records currently on disk; a missing file is an empty store.
    fn read(&self) -> Result<Vec<Record>, DbError> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        record::parse(&text).map_err(|e| DbError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Replace the file with `text`. Callers render under their lock and
    /// write after releasing it.
    fn write(&self, text: &str) -> Result<(), DbError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        crate::atomic_file::write_atomic(
            path,
            text.as_bytes(),
            self.tmp_dir.as_deref(),
            self.backup_dir.as_deref(),
        )?;
        tracing::debug!(path = %path.display(), "Database flushed");
        Ok(())
    }
}

/// Resolve `capability` for the user named or matched by `identifier`.
///
/// Returns `Ok(true)` when granted, `Ok(false)` when an anti-capability
/// wins, and [`DbError::Unresolved`] when nothing decides; unknown users
/// are resolved against the channel alone.
pub fn check_capability(
    users: &UsersDb,
    channels: &ChannelsDb,
    identifier: &str,
    capability: &str,
) -> Result<bool, DbError> {
    let user = match users.get_user(identifier) {
        Ok(user) => Some(user),
        Err(DbError::NoSuchUser(_)) => None,
        Err(e) => return Err(e),
    };
    let channel = ident_channel(capability).and_then(|chan| channels.get(chan));
    capability::resolve(user.as_ref(), channel.as_ref(), capability)
        .ok_or_else(|| DbError::Unresolved(capability.to_string()))
}

fn ident_channel(capability: &str) -> Option<&str> {
    crate::ident::from_channel_capability(capability).map(|(chan, _)| chan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[test]
    fn unknown_users_resolve_through_the_channel() {
        let users = UsersDb::in_memory(Clock::manual(0.0));
        let channels = ChannelsDb::in_memory();
        let hostmask = "stranger!s@example.org";
        assert!(matches!(
            check_capability(&users, &channels, hostmask, "#perch,voice"),
            Err(DbError::Unresolved(_))
        ));

        channels
            .update("#perch", |c| {
                c.add_capability("-voice");
            })
            .unwrap();
        assert!(!check_capability(&users, &channels, hostmask, "#perch,voice").unwrap());
        assert!(check_capability(&users, &channels, hostmask, "#perch,topic").unwrap());
    }

    #[test]
    fn memory_store_reads_empty() {
        assert!(Store::memory().read().unwrap().is_empty());
        Store::memory().write("ignored").unwrap();
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::file(&dir.path().join("users.conf"), None, None);
        assert!(store.read().unwrap().is_empty());
    }
}
