//! Channel and network state tracker.
//!
//! [`NetworkState::feed`] is a pure reducer over inbound messages: it
//! updates membership, modes, topics, ISUPPORT and enabled capabilities,
//! and keeps a bounded history window. It never produces output; the
//! session decides what to send based on the state it leaves behind.

pub mod batch;
pub mod channel;
pub mod fsm;
pub mod isupport;

use std::collections::{BTreeMap, BTreeSet};

pub use batch::BatchAssembler;
pub use channel::ChannelState;
pub use fsm::{ConnState, Transition};
pub use isupport::Isupport;

use crate::clock::Clock;
use crate::ident::{self, Casemap, IrcDict, separate_modes, split_hostmask};
use crate::message::Message;
use crate::numeric::*;
use crate::structures::RingBuffer;

/// What we know about a nick seen on the network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NickInfo {
    pub hostmask: Option<String>,
    /// Services account, from account-notify, account-tag or extended-join.
    pub account: Option<String>,
    pub away: bool,
}

#[derive(Debug)]
pub struct NetworkState {
    pub network: String,
    pub nick: String,
    /// Our own `nick!user@host` once the server has shown it.
    pub hostmask: Option<String>,
    pub server: Option<String>,
    pub casemap: Casemap,
    /// Set when configuration pins the casemap instead of following ISUPPORT.
    casemap_pinned: bool,
    pub isupport: Isupport,
    pub channels: IrcDict<ChannelState>,
    pub nicks: IrcDict<NickInfo>,
    pub history: RingBuffer<Message>,
    pub caps_available: BTreeMap<String, Option<String>>,
    pub caps_enabled: BTreeSet<String>,
    pub motd_done: bool,
    /// Stamps locally observed topic changes.
    clock: Clock,
}

impl NetworkState {
    pub fn new(network: &str, nick: &str, history_len: usize) -> Self {
        Self {
            network: network.to_string(),
            nick: nick.to_string(),
            hostmask: None,
            server: None,
            casemap: Casemap::default(),
            casemap_pinned: false,
            isupport: Isupport::default(),
            channels: IrcDict::new(Casemap::default()),
            nicks: IrcDict::new(Casemap::default()),
            history: RingBuffer::new(history_len),
            caps_available: BTreeMap::new(),
            caps_enabled: BTreeSet::new(),
            motd_done: false,
            clock: Clock::system(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Pin the casemap (`Some`) or follow the server's CASEMAPPING (`None`).
    pub fn pin_casemap(&mut self, casemap: Option<Casemap>) {
        self.casemap_pinned = casemap.is_some();
        self.set_casemap(casemap.unwrap_or(self.isupport.casemapping));
    }

    fn set_casemap(&mut self, casemap: Casemap) {
        if casemap == self.casemap {
            return;
        }
        tracing::debug!(network = %self.network, casemap = casemap.as_str(), "Casemap changed");
        self.casemap = casemap;
        self.channels.set_casemap(casemap);
        self.nicks.set_casemap(casemap);
        for (_, chan) in self.channels.iter_mut() {
            chan.set_casemap(casemap);
        }
    }

    /// Forget everything learned from the server, keeping history.
    pub fn reset(&mut self) {
        self.channels.clear();
        self.nicks.clear();
        self.caps_available.clear();
        self.caps_enabled.clear();
        self.motd_done = false;
        self.server = None;
        self.hostmask = None;
        self.isupport = Isupport::default();
        if !self.casemap_pinned {
            self.set_casemap(Casemap::default());
        }
    }

    // ── Queries ──

    pub fn is_me(&self, nick: &str) -> bool {
        self.casemap.equals(nick, &self.nick)
    }

    pub fn is_channel(&self, target: &str) -> bool {
        ident::is_channel(
            ident::strip_statusmsg(target, &self.isupport.statusmsg),
            &self.isupport.chantypes,
        )
    }

    pub fn nick_equals(&self, a: &str, b: &str) -> bool {
        self.casemap.equals(a, b)
    }

    pub fn hostmask_of(&self, nick: &str) -> Option<String> {
        self.nicks.get(nick).and_then(|n| n.hostmask.clone())
    }

    pub fn account_of(&self, nick: &str) -> Option<String> {
        self.nicks.get(nick).and_then(|n| n.account.clone())
    }

    pub fn has_cap(&self, cap: &str) -> bool {
        self.caps_enabled.contains(cap)
    }

    /// Our hostmask as the server would prefix our messages; a guess until
    /// the server reveals it.
    pub fn bot_hostmask(&self) -> String {
        match &self.hostmask {
            Some(mask) => mask.clone(),
            None => format!("{}!~{}@{}", self.nick, self.nick, "x".repeat(63)),
        }
    }

    /// Channels `nick` shares with us.
    pub fn channels_of(&self, nick: &str) -> Vec<String> {
        self.channels
            .values()
            .filter(|c| c.has_user(nick))
            .map(|c| c.name.clone())
            .collect()
    }

    // ── Reducer ──

    pub fn feed(&mut self, msg: &Message) {
        if msg.command != "PING" && msg.command != "PONG" {
            self.history.push(msg.clone());
        }
        self.note_origin(msg);
        match msg.command.as_str() {
            RPL_WELCOME => {
                if let Some(nick) = msg.param(0) {
                    self.nick = nick.to_string();
                }
                self.server = msg.prefix.clone();
            }
            RPL_ISUPPORT if msg.params.len() > 2 => {
                self.isupport.apply(&msg.params[1..msg.params.len() - 1]);
                if !self.casemap_pinned {
                    self.set_casemap(self.isupport.casemapping);
                }
            }
            RPL_ENDOFMOTD | ERR_NOMOTD => self.motd_done = true,
            RPL_HOSTHIDDEN => {
                if let Some(host) = msg.param(1) {
                    let user = self
                        .hostmask
                        .as_deref()
                        .and_then(split_hostmask)
                        .map_or(format!("~{}", self.nick), |(_, u, _)| u.to_string());
                    self.hostmask = Some(format!("{}!{user}@{host}", self.nick));
                }
            }
            "JOIN" => self.on_join(msg),
            "PART" => {
                if let (Some(nick), Some(chan)) = (msg.nick(), msg.param(0)) {
                    self.leave(chan, nick);
                }
            }
            "KICK" => {
                if let (Some(chan), Some(victim)) = (msg.param(0), msg.param(1)) {
                    self.leave(chan, victim);
                }
            }
            "QUIT" => {
                if let Some(nick) = msg.nick() {
                    for (_, chan) in self.channels.iter_mut() {
                        chan.remove_user(nick);
                    }
                    self.nicks.remove(nick);
                }
            }
            "NICK" => self.on_nick(msg),
            "MODE" => self.on_mode(msg),
            RPL_CHANNELMODEIS if msg.params.len() > 2 => {
                let classes = self.isupport.modes.clone();
                let changes = separate_modes(&msg.params[2..], &classes);
                if let Some(chan) = self.channels.get_mut(&msg.params[1]) {
                    for change in &changes {
                        chan.apply_mode(change, &classes.prefix, &classes.list);
                    }
                }
            }
            "TOPIC" => {
                if let (Some(chan), Some(topic)) = (msg.param(0), msg.param(1))
                    && let Some(state) = self.channels.get_mut(chan)
                {
                    state.topic = topic.to_string();
                    state.topic_setter = msg.prefix.clone();
                    state.topic_time = Some(self.clock.now() as i64);
                }
            }
            RPL_TOPIC => {
                if let (Some(chan), Some(topic)) = (msg.param(1), msg.param(2))
                    && let Some(state) = self.channels.get_mut(chan)
                {
                    state.topic = topic.to_string();
                }
            }
            RPL_TOPICWHOTIME => {
                if let Some(chan) = msg.param(1)
                    && let Some(state) = self.channels.get_mut(chan)
                {
                    state.topic_setter = msg.param(2).map(str::to_string);
                    state.topic_time = msg.param(3).and_then(|t| t.parse().ok());
                }
            }
            RPL_NAMREPLY => self.on_names(msg),
            RPL_WHOREPLY => {
                // me chan user host server nick flags :hops realname
                if let (Some(user), Some(host), Some(nick), Some(flags)) =
                    (msg.param(2), msg.param(3), msg.param(5), msg.param(6))
                {
                    let info = self.nicks.entry_or_insert_with(nick, NickInfo::default);
                    info.hostmask = Some(format!("{nick}!{user}@{host}"));
                    info.away = flags.starts_with('G');
                }
            }
            "ACCOUNT" => {
                if let (Some(nick), Some(account)) = (msg.nick(), msg.param(0)) {
                    let info = self.nicks.entry_or_insert_with(nick, NickInfo::default);
                    info.account = (account != "*").then(|| account.to_string());
                }
            }
            "AWAY" => {
                if let Some(nick) = msg.nick() {
                    self.nicks.entry_or_insert_with(nick, NickInfo::default).away = msg.param(0).is_some();
                }
            }
            "CHGHOST" => {
                if let (Some(nick), Some(user), Some(host)) = (msg.nick(), msg.param(0), msg.param(1)) {
                    let mask = format!("{nick}!{user}@{host}");
                    if self.is_me(nick) {
                        self.hostmask = Some(mask.clone());
                    }
                    self.nicks.entry_or_insert_with(nick, NickInfo::default).hostmask = Some(mask);
                }
            }
            "CAP" => self.on_cap(msg),
            _ => {}
        }
    }

    /// Learn hostmasks and account tags from any user-originated message.
    fn note_origin(&mut self, msg: &Message) {
        let Some(mask) = msg.hostmask() else { return };
        let Some(nick) = msg.nick() else { return };
        if matches!(msg.command.as_str(), "QUIT" | "NICK") {
            return;
        }
        let info = self.nicks.entry_or_insert_with(nick, NickInfo::default);
        info.hostmask = Some(mask.to_string());
        if let Some(account) = msg.tag("account") {
            info.account = Some(account.to_string());
        }
        if self.casemap.equals(nick, &self.nick) {
            self.hostmask = Some(mask.to_string());
        }
    }

    fn on_join(&mut self, msg: &Message) {
        let (Some(nick), Some(chan)) = (msg.nick(), msg.param(0)) else {
            return;
        };
        if self.is_me(nick) {
            tracing::info!(network = %self.network, channel = chan, "Joined");
            self.channels.insert(chan, ChannelState::new(chan, self.casemap));
        }
        // extended-join: JOIN #chan account :realname
        if let Some(account) = msg.param(1) {
            let info = self.nicks.entry_or_insert_with(nick, NickInfo::default);
            info.account = (account != "*").then(|| account.to_string());
        }
        if let Some(state) = self.channels.get_mut(chan) {
            state.add_user(nick, &[]);
        }
    }

    fn leave(&mut self, chan: &str, nick: &str) {
        if self.is_me(nick) {
            tracing::info!(network = %self.network, channel = chan, "Left channel");
            self.channels.remove(chan);
        } else if let Some(state) = self.channels.get_mut(chan) {
            state.remove_user(nick);
        }
        if !self.is_me(nick) && self.channels_of(nick).is_empty() {
            self.nicks.remove(nick);
        }
    }

    fn on_nick(&mut self, msg: &Message) {
        let (Some(old), Some(new)) = (msg.nick(), msg.param(0)) else {
            return;
        };
        let old = old.to_string();
        for (_, chan) in self.channels.iter_mut() {
            chan.rename_user(&old, new);
        }
        let mut info = self.nicks.remove(&old).unwrap_or_default();
        if let Some((_, user, host)) = msg.prefix.as_deref().and_then(split_hostmask) {
            info.hostmask = Some(format!("{new}!{user}@{host}"));
        }
        if self.is_me(&old) {
            self.nick = new.to_string();
            self.hostmask = info.hostmask.clone();
        }
        self.nicks.insert(new, info);
    }

    fn on_mode(&mut self, msg: &Message) {
        let Some(target) = msg.param(0) else { return };
        if !self.is_channel(target) || msg.params.len() < 2 {
            return;
        }
        let classes = self.isupport.modes.clone();
        let changes = separate_modes(&msg.params[1..], &classes);
        if let Some(chan) = self.channels.get_mut(target) {
            for change in &changes {
                chan.apply_mode(change, &classes.prefix, &classes.list);
            }
        }
    }

    fn on_names(&mut self, msg: &Message) {
        // me = #chan :names...
        let (Some(chan), Some(names)) = (msg.param(2), msg.param(3)) else {
            return;
        };
        let prefix = self.isupport.prefix.clone();
        let mut seen: Vec<(String, Option<String>)> = Vec::new();
        if let Some(state) = self.channels.get_mut(chan) {
            for entry in names.split_whitespace() {
                let bare = entry.trim_start_matches(|c| prefix.iter().any(|(_, s)| *s == c));
                let modes: Vec<char> = entry[..entry.len() - bare.len()]
                    .chars()
                    .filter_map(|s| prefix.iter().find(|(_, sym)| *sym == s).map(|(m, _)| *m))
                    .collect();
                // userhost-in-names
                let (nick, mask) = match split_hostmask(bare) {
                    Some((n, _, _)) => (n, Some(bare.to_string())),
                    None => (bare, None),
                };
                state.add_user(nick, &modes);
                seen.push((nick.to_string(), mask));
            }
        }
        for (nick, mask) in seen {
            let info = self.nicks.entry_or_insert_with(&nick, NickInfo::default);
            if mask.is_some() {
                info.hostmask = mask;
            }
        }
    }

    fn on_cap(&mut self, msg: &Message) {
        let Some(sub) = msg.param(1) else { return };
        let list = msg.trailing().unwrap_or_default();
        match sub.to_ascii_uppercase().as_str() {
            "LS" | "NEW" => {
                for item in list.split_whitespace() {
                    let (name, value) = match item.split_once('=') {
                        Some((n, v)) => (n, Some(v.to_string())),
                        None => (item, None),
                    };
                    self.caps_available.insert(name.to_string(), value);
                }
            }
            "DEL" => {
                for name in list.split_whitespace() {
                    self.caps_available.remove(name);
                    self.caps_enabled.remove(name);
                }
            }
            "ACK" => {
                for item in list.split_whitespace() {
                    match item.strip_prefix('-') {
                        Some(name) => {
                            self.caps_enabled.remove(name);
                        }
                        None => {
                            self.caps_enabled.insert(item.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }
}
