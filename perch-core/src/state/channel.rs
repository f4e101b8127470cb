//! Live state of one joined channel.

use std::collections::BTreeMap;

use crate::ident::{Casemap, IrcSet, ModeChange};

#[derive(Debug, Clone)]
pub struct ChannelState {
    pub name: String,
    pub topic: String,
    pub topic_setter: Option<String>,
    pub topic_time: Option<i64>,
    pub users: IrcSet,
    /// Members per membership mode (`o`, `h`, `v`, and any others the
    /// server's PREFIX declares).
    pub members: BTreeMap<char, IrcSet>,
    pub bans: Vec<String>,
    /// Simple and parameter modes currently set (`k` → key, `l` → limit).
    pub modes: BTreeMap<char, Option<String>>,
    casemap: Casemap,
}

impl ChannelState {
    pub fn new(name: &str, casemap: Casemap) -> Self {
        Self {
            name: name.to_string(),
            topic: String::new(),
            topic_setter: None,
            topic_time: None,
            users: IrcSet::new(casemap),
            members: BTreeMap::new(),
            bans: Vec::new(),
            modes: BTreeMap::new(),
            casemap,
        }
    }

    pub fn set_casemap(&mut self, casemap: Casemap) {
        self.casemap = casemap;
        self.users.set_casemap(casemap);
        for set in self.members.values_mut() {
            set.set_casemap(casemap);
        }
    }

    /// Add a member, with the membership modes its NAMES symbols imply.
    pub fn add_user(&mut self, nick: &str, modes: &[char]) {
        self.users.insert(nick);
        for mode in modes {
            self.members
                .entry(*mode)
                .or_insert_with(|| IrcSet::new(self.casemap))
                .insert(nick);
        }
    }

    pub fn remove_user(&mut self, nick: &str) -> bool {
        for set in self.members.values_mut() {
            set.remove(nick);
        }
        self.users.remove(nick)
    }

    pub fn rename_user(&mut self, old: &str, new: &str) {
        if !self.users.rename(old, new) {
            return;
        }
        for set in self.members.values_mut() {
            set.rename(old, new);
        }
    }

    pub fn has_user(&self, nick: &str) -> bool {
        self.users.contains(nick)
    }

    pub fn has_mode(&self, nick: &str, mode: char) -> bool {
        self.members.get(&mode).is_some_and(|s| s.contains(nick))
    }

    pub fn is_op(&self, nick: &str) -> bool {
        self.has_mode(nick, 'o')
    }

    /// Halfop or better.
    pub fn is_halfop_plus(&self, nick: &str) -> bool {
        ['h', 'o', 'a', 'q'].iter().any(|m| self.has_mode(nick, *m))
    }

    /// Voice or better.
    pub fn is_voice_plus(&self, nick: &str) -> bool {
        self.has_mode(nick, 'v') || self.is_halfop_plus(nick)
    }

    pub fn limit(&self) -> Option<usize> {
        self.modes.get(&'l')?.as_deref()?.parse().ok()
    }

    pub fn key(&self) -> Option<&str> {
        self.modes.get(&'k')?.as_deref()
    }

    /// Apply one primitive mode change. `membership` are the PREFIX modes
    /// and `lists` the type-A list modes of the network.
    pub fn apply_mode(&mut self, change: &ModeChange, membership: &str, lists: &str) {
        let mode = change.mode;
        if membership.contains(mode) {
            let Some(nick) = change.arg.as_deref() else { return };
            let set = self
                .members
                .entry(mode)
                .or_insert_with(|| IrcSet::new(self.casemap));
            if change.adding {
                set.insert(nick);
            } else {
                set.remove(nick);
            }
        } else if mode == 'b' {
            let Some(mask) = change.arg.as_deref() else { return };
            if change.adding {
                if !self.bans.iter().any(|b| b == mask) {
                    self.bans.push(mask.to_string());
                }
            } else {
                self.bans.retain(|b| !self.casemap.equals(b, mask));
            }
        } else if lists.contains(mode) {
            // Other list modes (exceptions, invex) are not tracked.
        } else if change.adding {
            self.modes.insert(mode, change.arg.clone());
        } else {
            self.modes.remove(&mode);
        }
    }

    /// Modes rendered like `+ntl 20`.
    pub fn mode_string(&self) -> String {
        let mut flags = String::from("+");
        let mut args = Vec::new();
        for (mode, arg) in &self.modes {
            flags.push(*mode);
            if let Some(arg) = arg {
                args.push(arg.as_str());
            }
        }
        if args.is_empty() {
            flags
        } else {
            format!("{flags} {}", args.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_modes_follow_renames_and_parts() {
        let mut c = ChannelState::new("#perch", Casemap::Rfc1459);
        c.add_user("Alice", &['o']);
        c.add_user("bob", &[]);
        assert!(c.is_op("alice"));
        c.rename_user("alice", "Alicia");
        assert!(c.is_op("alicia"));
        assert!(!c.has_user("alice"));
        c.apply_mode(&ModeChange::new(true, 'v', Some("bob")), "ohv", "beI");
        assert!(c.is_voice_plus("BOB"));
        assert!(!c.is_halfop_plus("bob"));
        c.remove_user("bob");
        assert!(!c.has_mode("bob", 'v'));
    }

    #[test]
    fn parameter_and_list_modes() {
        let mut c = ChannelState::new("#perch", Casemap::Rfc1459);
        c.apply_mode(&ModeChange::new(true, 'l', Some("20")), "ohv", "beI");
        c.apply_mode(&ModeChange::new(true, 'k', Some("sekrit")), "ohv", "beI");
        c.apply_mode(&ModeChange::new(true, 't', None), "ohv", "beI");
        c.apply_mode(&ModeChange::new(true, 'b', Some("*!*@bad")), "ohv", "beI");
        c.apply_mode(&ModeChange::new(true, 'e', Some("*!*@ok")), "ohv", "beI");
        assert_eq!(c.limit(), Some(20));
        assert_eq!(c.key(), Some("sekrit"));
        assert_eq!(c.mode_string(), "+klt sekrit 20");
        assert_eq!(c.bans, vec!["*!*@bad"]);
        c.apply_mode(&ModeChange::new(false, 'b', Some("*!*@BAD")), "ohv", "beI");
        c.apply_mode(&ModeChange::new(false, 'l', None), "ohv", "beI");
        assert!(c.bans.is_empty());
        assert_eq!(c.limit(), None);
    }
}
