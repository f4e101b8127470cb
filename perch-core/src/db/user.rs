//! User accounts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::ident::{Casemap, canonical_capability, hostmask_pattern_equal, invert_capability, is_user_hostmask};
use crate::ident::hostmask::patterns_overlap;
use crate::structures::Timeout;

use super::record::{Field, Record};
use super::{DbError, Store};

// ── Passwords ──

/// Salted SHA-256 password, stored as `sha256$<salt>$<hex digest>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Password {
    salt: String,
    digest: String,
}

impl Password {
    pub fn new(plain: &str) -> Self {
        let salt = hex::encode(rand::random::<[u8; 8]>());
        let digest = Self::digest(&salt, plain);
        Self { salt, digest }
    }

    fn digest(salt: &str, plain: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(plain.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify(&self, plain: &str) -> bool {
        let candidate = Self::digest(&self.salt, plain);
        // Compare every byte so timing does not leak the matching prefix.
        candidate.len() == self.digest.len()
            && candidate
                .bytes()
                .zip(self.digest.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    pub fn parse(stored: &str) -> Option<Self> {
        let mut parts = stored.splitn(3, '$');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("sha256"), Some(salt), Some(digest)) if !digest.is_empty() => Some(Self {
                salt: salt.to_string(),
                digest: digest.to_string(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256${}${}", self.salt, self.digest)
    }
}

// ── User ──

/// An identification: the exact hostmask that authenticated, and when it
/// was last used.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSession {
    pub hostmask: String,
    pub last_seen: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: u32,
    pub name: String,
    /// Patterns in the order they were added.
    pub hostmasks: Vec<String>,
    /// Canonical capability strings, see [`canonical_capability`].
    pub capabilities: BTreeSet<String>,
    pub password: Option<Password>,
    /// Recognize only through identification, never by hostmask alone.
    pub secure: bool,
    /// Everything this user says is ignored.
    pub ignore: bool,
    /// Client certificate fingerprints for SASL EXTERNAL / CertFP.
    pub fingerprints: BTreeSet<String>,
    /// Identifications, not persisted.
    pub auth: Vec<AuthSession>,
    /// Fields this version does not understand, written back untouched.
    extra: Vec<Field>,
}

impl User {
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            hostmasks: Vec::new(),
            capabilities: BTreeSet::new(),
            password: None,
            secure: false,
            ignore: false,
            fingerprints: BTreeSet::new(),
            auth: Vec::new(),
            extra: Vec::new(),
        }
    }

    pub fn add_hostmask(&mut self, pattern: &str) -> bool {
        if self.hostmasks.iter().any(|h| h == pattern) {
            return false;
        }
        self.hostmasks.push(pattern.to_string());
        true
    }

    pub fn remove_hostmask(&mut self, pattern: &str) -> bool {
        let before = self.hostmasks.len();
        self.hostmasks.retain(|h| h != pattern);
        before != self.hostmasks.len()
    }

    /// Grant `cap`, replacing its inverse if present.
    pub fn add_capability(&mut self, cap: &str) {
        let cap = canonical_capability(cap);
        self.capabilities.remove(&invert_capability(&cap));
        self.capabilities.insert(cap);
    }

    pub fn remove_capability(&mut self, cap: &str) -> bool {
        self.capabilities.remove(&canonical_capability(cap))
    }

    pub fn is_owner(&self) -> bool {
        self.capabilities.contains("owner")
    }

    pub fn set_password(&mut self, plain: &str) {
        self.password = Some(Password::new(plain));
    }

    pub fn check_password(&self, plain: &str) -> bool {
        self.password.as_ref().is_some_and(|p| p.verify(plain))
    }

    /// Whether `hostmask` is this user. Secure users only match an active
    /// identification; others also match by pattern. A matching session
    /// is refreshed.
    pub fn check_hostmask(&mut self, hostmask: &str, casemap: Casemap, now: f64, idle_timeout: f64) -> bool {
        self.expire_auth(now, idle_timeout);
        if let Some(session) = self
            .auth
            .iter_mut()
            .find(|s| casemap.equals(&s.hostmask, hostmask))
        {
            session.last_seen = now;
            return true;
        }
        !self.secure
            && self
                .hostmasks
                .iter()
                .any(|p| hostmask_pattern_equal(p, hostmask, casemap))
    }

    pub fn add_auth(&mut self, hostmask: &str, now: f64) {
        self.auth.retain(|s| s.hostmask != hostmask);
        self.auth.push(AuthSession {
            hostmask: hostmask.to_string(),
            last_seen: now,
        });
    }

    pub fn clear_auth(&mut self) {
        self.auth.clear();
    }

    /// Drop sessions idle for longer than `idle_timeout` (0 never expires).
    pub fn expire_auth(&mut self, now: f64, idle_timeout: f64) {
        if idle_timeout > 0.0 {
            self.auth.retain(|s| now - s.last_seen <= idle_timeout);
        }
    }

    fn to_record(&self) -> Record {
        let mut r = Record::new("user", self.id.to_string());
        r.push("name", &self.name);
        r.push("secure", bool_str(self.secure));
        if self.ignore {
            r.push("ignore", "True");
        }
        if let Some(password) = &self.password {
            r.push("password", password.to_string());
        }
        for hostmask in &self.hostmasks {
            r.push("hostmask", hostmask);
        }
        for cap in &self.capabilities {
            r.push("capability", cap);
        }
        for fp in &self.fingerprints {
            r.push("fingerprint", fp);
        }
        for field in &self.extra {
            r.push_field(field.clone());
        }
        r
    }

    fn from_record(r: &Record) -> Result<Self, String> {
        let id = r
            .name
            .parse()
            .map_err(|_| format!("user id {:?} is not a number", r.name))?;
        let name = r.get("name").ok_or_else(|| format!("user {id} has no name"))?;
        let mut user = User::new(id, name);
        for field in &r.fields {
            match field.key.as_str() {
                "name" => {}
                "secure" => user.secure = field.value.eq_ignore_ascii_case("true"),
                "ignore" => user.ignore = field.value.eq_ignore_ascii_case("true"),
                "password" => {
                    user.password = Some(
                        Password::parse(&field.value)
                            .ok_or_else(|| format!("user {id} has an unreadable password"))?,
                    );
                }
                "hostmask" => {
                    user.add_hostmask(&field.value);
                }
                "capability" => user.add_capability(&field.value),
                "fingerprint" => {
                    user.fingerprints.insert(field.value.clone());
                }
                _ => user.extra.push(field.clone()),
            }
        }
        Ok(user)
    }
}

fn bool_str(b: bool) -> &'static str {
    if b { "True" } else { "False" }
}

// ── Store ──

#[derive(Debug, Default)]
struct Inner {
    users: BTreeMap<u32, User>,
    /// Lowercased name → id.
    names: HashMap<String, u32>,
    next_id: u32,
}

impl Inner {
    fn render(&self) -> String {
        let records: Vec<Record> = self.users.values().map(User::to_record).collect();
        super::record::render(&records)
    }

    fn check_conflicts(&self, user: &User, casemap: Casemap) -> Result<(), DbError> {
        for other in self.users.values().filter(|o| o.id != user.id) {
            if other.name.eq_ignore_ascii_case(&user.name) {
                return Err(DbError::DuplicateName(user.name.clone()));
            }
            for mine in &user.hostmasks {
                if other.hostmasks.iter().any(|theirs| patterns_overlap(mine, theirs, casemap)) {
                    return Err(DbError::DuplicateHostmask {
                        hostmask: mine.clone(),
                        owner: other.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn reindex(&mut self) {
        self.names = self
            .users
            .values()
            .map(|u| (u.name.to_lowercase(), u.id))
            .collect();
        self.next_id = self.users.keys().next_back().map_or(1, |id| id + 1);
    }
}

/// All user accounts.
#[derive(Debug)]
pub struct UsersDb {
    inner: RwLock<Inner>,
    store: Store,
    clock: Clock,
    casemap: Casemap,
    /// Idle timeout for identifications; read live so config changes apply.
    auth_timeout: RwLock<Timeout>,
}

impl UsersDb {
    pub fn in_memory(clock: Clock) -> Self {
        Self {
            inner: RwLock::new(Inner { next_id: 1, ..Default::default() }),
            store: Store::memory(),
            clock,
            casemap: Casemap::default(),
            auth_timeout: RwLock::new(Timeout::Fixed(0.0)),
        }
    }

    pub fn open(path: &Path, tmp_dir: Option<&Path>, backup_dir: Option<&Path>, clock: Clock) -> Result<Self, DbError> {
        let store = Store::file(path, tmp_dir, backup_dir);
        let mut inner = Inner::default();
        for record in store.read()? {
            if record.kind != "user" {
                tracing::warn!(kind = %record.kind, "Skipping unknown record in users database");
                continue;
            }
            let user = User::from_record(&record).map_err(|reason| DbError::Parse {
                path: path.display().to_string(),
                reason,
            })?;
            inner.users.insert(user.id, user);
        }
        inner.reindex();
        tracing::info!(path = %path.display(), users = inner.users.len(), "Users database loaded");
        Ok(Self {
            inner: RwLock::new(inner),
            store,
            clock,
            casemap: Casemap::default(),
            auth_timeout: RwLock::new(Timeout::Fixed(0.0)),
        })
    }

    pub fn set_auth_timeout(&self, timeout: Timeout) {
        *self.auth_timeout.write() = timeout;
    }

    pub fn len(&self) -> usize {
        self.inner.read().users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn users(&self) -> Vec<User> {
        self.inner.read().users.values().cloned().collect()
    }

    pub fn get_by_id(&self, id: u32) -> Option<User> {
        self.inner.read().users.get(&id).cloned()
    }

    /// Look a user up by name or by a concrete `nick!user@host`.
    pub fn get_user(&self, identifier: &str) -> Result<User, DbError> {
        self.get_user_id(identifier)
            .and_then(|id| self.get_by_id(id).ok_or_else(|| DbError::NoSuchUser(identifier.to_string())))
    }

    pub fn get_user_id(&self, identifier: &str) -> Result<u32, DbError> {
        if is_user_hostmask(identifier) {
            let now = self.clock.now();
            let timeout = self.auth_timeout.read().get();
            let mut inner = self.inner.write();
            return inner
                .users
                .values_mut()
                .find_map(|u| u.check_hostmask(identifier, self.casemap, now, timeout).then_some(u.id))
                .ok_or_else(|| DbError::NoSuchUser(identifier.to_string()));
        }
        self.inner
            .read()
            .names
            .get(&identifier.to_lowercase())
            .copied()
            .ok_or_else(|| DbError::NoSuchUser(identifier.to_string()))
    }

    pub fn get_by_fingerprint(&self, fingerprint: &str) -> Option<User> {
        self.inner
            .read()
            .users
            .values()
            .find(|u| u.fingerprints.iter().any(|f| f.eq_ignore_ascii_case(fingerprint)))
            .cloned()
    }

    /// Create an empty account under a fresh id.
    pub fn create_user(&self, name: &str) -> Result<User, DbError> {
        let (user, text) = {
            let mut inner = self.inner.write();
            if inner.names.contains_key(&name.to_lowercase()) {
                return Err(DbError::DuplicateName(name.to_string()));
            }
            let id = inner.next_id;
            let user = User::new(id, name);
            inner.users.insert(id, user.clone());
            inner.reindex();
            (user, inner.render())
        };
        self.store.write(&text)?;
        tracing::info!(user = %name, id = user.id, "User created");
        Ok(user)
    }

    /// Store `user`, rejecting hostmask patterns that overlap another
    /// user's or a name already taken.
    pub fn set_user(&self, user: User) -> Result<(), DbError> {
        let text = {
            let mut inner = self.inner.write();
            inner.check_conflicts(&user, self.casemap)?;
            inner.users.insert(user.id, user);
            inner.reindex();
            inner.render()
        };
        self.store.write(&text)
    }

    /// Apply `f` to a stored user and write the result back, all under one
    /// lock so concurrent identifications are not lost. `f` must not call
    /// back into the database.
    pub fn update<R>(&self, id: u32, f: impl FnOnce(&mut User) -> R) -> Result<R, DbError> {
        let (out, text) = {
            let mut inner = self.inner.write();
            let mut user = inner
                .users
                .get(&id)
                .cloned()
                .ok_or_else(|| DbError::NoSuchUser(id.to_string()))?;
            let out = f(&mut user);
            inner.check_conflicts(&user, self.casemap)?;
            inner.users.insert(id, user);
            inner.reindex();
            (out, inner.render())
        };
        self.store.write(&text)?;
        Ok(out)
    }

    pub fn del_user(&self, id: u32) -> Result<User, DbError> {
        let (user, text) = {
            let mut inner = self.inner.write();
            let user = inner
                .users
                .remove(&id)
                .ok_or_else(|| DbError::NoSuchUser(id.to_string()))?;
            inner.reindex();
            (user, inner.render())
        };
        self.store.write(&text)?;
        tracing::info!(user = %user.name, "User removed");
        Ok(user)
    }

    // ── Identification ──

    /// Identify `hostmask` as user `name` with `password`.
    pub fn identify(&self, name: &str, password: &str, hostmask: &str) -> Result<User, DbError> {
        let id = self.get_user_id(name)?;
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let user = inner
            .users
            .get_mut(&id)
            .ok_or_else(|| DbError::NoSuchUser(name.to_string()))?;
        if !user.check_password(password) {
            return Err(DbError::PasswordMismatch);
        }
        user.add_auth(hostmask, now);
        tracing::info!(user = %user.name, %hostmask, "User identified");
        Ok(user.clone())
    }

    pub fn add_auth(&self, id: u32, hostmask: &str) -> Result<(), DbError> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let user = inner
            .users
            .get_mut(&id)
            .ok_or_else(|| DbError::NoSuchUser(id.to_string()))?;
        user.add_auth(hostmask, now);
        Ok(())
    }

    pub fn clear_auth(&self, id: u32) -> Result<(), DbError> {
        let mut inner = self.inner.write();
        let user = inner
            .users
            .get_mut(&id)
            .ok_or_else(|| DbError::NoSuchUser(id.to_string()))?;
        user.clear_auth();
        Ok(())
    }

    /// Write the whole store out again.
    pub fn flush(&self) -> Result<(), DbError> {
        let text = self.inner.read().render();
        self.store.write(&text)
    }
}
