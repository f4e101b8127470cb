//! Turning reply text into outbound messages.
//!
//! A reply goes to the channel it was invoked in (or privately, per
//! `replies.inPrivate`), as PRIVMSG or NOTICE, optionally prefixed with
//! the caller's nick. Text longer than one line is split at whitespace;
//! the first `replies.mores.instant` chunks go out now and the rest wait
//! in the caller's [`MoreStore`] for the `more` command.

use std::collections::{HashMap, VecDeque};

use crate::config::Registry;
use crate::ident::Casemap;
use crate::message::Message;
use crate::msgs;
use crate::state::NetworkState;

/// Who asked, and where.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyTo {
    pub nick: String,
    pub hostmask: String,
    /// Channel the request came from; `None` for private messages.
    pub channel: Option<String>,
}

impl ReplyTo {
    pub fn new(nick: &str, hostmask: &str, channel: Option<&str>) -> Self {
        Self {
            nick: nick.to_string(),
            hostmask: hostmask.to_string(),
            channel: channel.map(str::to_string),
        }
    }
}

/// Per-reply overrides of the configured behavior.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyOpts {
    pub notice: Option<bool>,
    pub private: Option<bool>,
    pub prefix_nick: Option<bool>,
    pub action: bool,
    /// Explicit target, bypassing the channel/private choice.
    pub to: Option<String>,
    pub error: bool,
}

impl ReplyOpts {
    pub fn private() -> Self {
        Self { private: Some(true), ..Self::default() }
    }

    pub fn notice() -> Self {
        Self { notice: Some(true), ..Self::default() }
    }

    pub fn action() -> Self {
        Self { action: true, prefix_nick: Some(false), ..Self::default() }
    }

    pub fn error() -> Self {
        Self { error: true, ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub opts: ReplyOpts,
}

impl Reply {
    pub fn new(text: impl Into<String>, opts: ReplyOpts) -> Self {
        Self { text: text.into(), opts }
    }
}

// ── More buffers ──

/// Reply chunks held back per nick.
#[derive(Debug, Default)]
pub struct MoreStore {
    casemap: Casemap,
    pending: HashMap<String, Pending>,
}

#[derive(Debug)]
struct Pending {
    chunks: VecDeque<String>,
    target: String,
    notice: bool,
}

impl MoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_casemap(&mut self, casemap: Casemap) {
        if casemap == self.casemap {
            return;
        }
        self.casemap = casemap;
        let pending = std::mem::take(&mut self.pending);
        self.pending = pending
            .into_iter()
            .map(|(k, v)| (casemap.to_lower(&k), v))
            .collect();
    }

    fn store(&mut self, nick: &str, target: &str, notice: bool, chunks: Vec<String>) {
        let key = self.casemap.to_lower(nick);
        if chunks.is_empty() {
            self.pending.remove(&key);
            return;
        }
        self.pending.insert(
            key,
            Pending { chunks: chunks.into(), target: target.to_string(), notice },
        );
    }

    pub fn remaining(&self, nick: &str) -> usize {
        self.pending
            .get(&self.casemap.to_lower(nick))
            .map_or(0, |p| p.chunks.len())
    }

    /// Next held chunk for `nick`, as a ready message with the count
    /// suffix when more remain.
    pub fn next(&mut self, nick: &str) -> Option<Message> {
        let key = self.casemap.to_lower(nick);
        let pending = self.pending.get_mut(&key)?;
        let mut chunk = pending.chunks.pop_front()?;
        let left = pending.chunks.len();
        if left > 0 {
            chunk.push_str(&more_suffix(left));
        }
        let msg = if pending.notice {
            msgs::notice(&pending.target, &chunk)
        } else {
            msgs::privmsg(&pending.target, &chunk)
        };
        if left == 0 {
            self.pending.remove(&key);
        }
        Some(msg)
    }

    pub fn rename(&mut self, old: &str, new: &str) {
        if let Some(p) = self.pending.remove(&self.casemap.to_lower(old)) {
            self.pending.insert(self.casemap.to_lower(new), p);
        }
    }

    pub fn forget(&mut self, nick: &str) {
        self.pending.remove(&self.casemap.to_lower(nick));
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

pub fn more_suffix(remaining: usize) -> String {
    let noun = if remaining == 1 { "message" } else { "messages" };
    format!(" \x02({remaining} more {noun})\x02")
}

// ── Rendering ──

/// Render one reply into messages, holding overflow in `mores`.
pub fn render(reply: &Reply, to: &ReplyTo, registry: &Registry, net: &NetworkState, mores: &mut MoreStore) -> Vec<Message> {
    let network = Some(net.network.as_str());
    let channel = to.channel.as_deref();
    let opts = &reply.opts;
    let private = opts
        .private
        .unwrap_or_else(|| channel.is_none() || registry.bool("replies.inPrivate", network, channel));
    let target = match &opts.to {
        Some(to) => to.clone(),
        None => match channel {
            Some(chan) if !private => chan.to_string(),
            _ => to.nick.clone(),
        },
    };
    let notice = opts.notice.unwrap_or_else(|| {
        let key = if opts.error { "replies.error.withNotice" } else { "replies.withNotice" };
        registry.bool(key, network, channel)
    });
    let in_channel = net.is_channel(&target);
    let prefix_nick = in_channel
        && !opts.action
        && opts
            .prefix_nick
            .unwrap_or_else(|| registry.bool("replies.withNickPrefix", network, channel));

    let command = if notice && !opts.action { "NOTICE" } else { "PRIVMSG" };
    let mut budget = line_budget(registry, net, command, &target);
    if opts.action {
        budget = budget.saturating_sub("\x01ACTION \x01".len());
    }
    let prefix = if prefix_nick { format!("{}: ", to.nick) } else { String::new() };

    let instant = registry.int("replies.mores.instant", network, channel).max(1) as usize;
    let maximum = registry.int("replies.mores.maximum", network, None).max(1) as usize;

    let mut chunks = split_lines(&reply.text, &prefix, budget);
    if chunks.len() > instant {
        // Any chunk may end up carrying a count suffix; none may outgrow the line.
        chunks = split_lines(&reply.text, &prefix, budget.saturating_sub(more_suffix(maximum).len()));
    }
    if chunks.is_empty() {
        return Vec::new();
    }
    let held: Vec<String> = if chunks.len() > instant {
        chunks.drain(instant..).take(maximum).collect()
    } else {
        Vec::new()
    };
    if !held.is_empty()
        && let Some(last) = chunks.last_mut()
    {
        last.push_str(&more_suffix(held.len()));
    }
    let more_target = if notice { to.nick.as_str() } else { target.as_str() };
    mores.store(&to.nick, more_target, notice, held);

    chunks
        .into_iter()
        .map(|chunk| {
            if opts.action {
                msgs::action(&target, &chunk)
            } else if notice {
                msgs::notice(&target, &chunk)
            } else {
                msgs::privmsg(&target, &chunk)
            }
        })
        .collect()
}

fn split_lines(text: &str, prefix: &str, budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    for line in text.split('\n').filter(|l| !l.is_empty()) {
        let line = format!("{prefix}{line}");
        if line.len() <= budget {
            chunks.push(line);
        } else {
            chunks.extend(split_text(&line, budget));
        }
    }
    chunks
}

/// Bytes available for the text of one `command target :text` line once
/// the server prepends our hostmask.
pub fn line_budget(registry: &Registry, net: &NetworkState, command: &str, target: &str) -> usize {
    let configured = registry.int("replies.mores.length", Some(net.network.as_str()), None);
    if configured > 0 {
        return configured as usize;
    }
    let overhead = format!(":{} {command} {target} :", net.bot_hostmask()).len();
    net.isupport.linelen.saturating_sub(2).saturating_sub(overhead).max(32)
}

/// Split at the last whitespace before each `budget` boundary; words
/// longer than the budget are cut at a character boundary.
pub fn split_text(text: &str, budget: usize) -> Vec<String> {
    let budget = budget.max(16);
    let mut chunks = Vec::new();
    let mut rest = text.trim();
    while rest.len() > budget {
        let mut cut = budget;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let at = rest[..cut]
            .rfind(char::is_whitespace)
            .filter(|&i| i > 0)
            .unwrap_or(cut);
        chunks.push(rest[..at].trim_end().to_string());
        rest = rest[at..].trim_start();
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scope;

    fn net() -> NetworkState {
        let mut net = NetworkState::new("testnet", "perch", 10);
        net.hostmask = Some("perch!p@bot.host".into());
        net
    }

    fn alice_in(channel: Option<&str>) -> ReplyTo {
        ReplyTo::new("alice", "alice!a@h", channel)
    }

    #[test]
    fn channel_and_private_targets() {
        let r = Registry::with_core();
        let mut mores = MoreStore::new();
        let out = render(&Reply::new("hi", ReplyOpts::default()), &alice_in(Some("#perch")), &r, &net(), &mut mores);
        assert_eq!(out, vec![msgs::privmsg("#perch", "hi")]);
        let out = render(&Reply::new("hi", ReplyOpts::private()), &alice_in(Some("#perch")), &r, &net(), &mut mores);
        assert_eq!(out[0].params[0], "alice");
        let out = render(&Reply::new("hi", ReplyOpts::default()), &alice_in(None), &r, &net(), &mut mores);
        assert_eq!(out[0].params[0], "alice");
    }

    #[test]
    fn nick_prefix_and_notice_follow_config() {
        let r = Registry::with_core();
        r.set("replies.withNickPrefix", &Scope::channel("#perch"), "True").unwrap();
        r.set("replies.error.withNotice", &Scope::global(), "True").unwrap();
        let mut mores = MoreStore::new();
        let out = render(&Reply::new("done", ReplyOpts::default()), &alice_in(Some("#perch")), &r, &net(), &mut mores);
        assert_eq!(out[0].params[1], "alice: done");
        let out = render(&Reply::new("Error: no", ReplyOpts::error()), &alice_in(Some("#other")), &r, &net(), &mut mores);
        assert_eq!(out[0].command, "NOTICE");
        assert_eq!(out[0].params[1], "Error: no");
    }

    #[test]
    fn a_full_line_body_is_preserved() {
        let r = Registry::with_core();
        let body = "x".repeat(432);
        let mut mores = MoreStore::new();
        let out = render(&Reply::new(body.clone(), ReplyOpts::default()), &alice_in(Some("#perch")), &r, &net(), &mut mores);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].params[1], body);
    }

    #[test]
    fn long_replies_split_and_hold_the_rest() {
        let r = Registry::with_core();
        let net = net();
        let text = (0..400).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let mut mores = MoreStore::new();
        let out = render(&Reply::new(text.clone(), ReplyOpts::default()), &alice_in(Some("#perch")), &r, &net, &mut mores);
        assert_eq!(out.len(), 1);
        let first = &out[0].params[1];
        assert!(first.ends_with("more messages)\x02"));
        let line = format!(":{} {}", net.bot_hostmask(), out[0]);
        assert!(line.len() <= 510, "{} bytes", line.len());

        let mut rebuilt = first[..first.find(" \x02(").unwrap()].to_string();
        let mut count = 0;
        while let Some(msg) = mores.next("ALICE") {
            assert_eq!(msg.params[0], "#perch");
            let text = msg.params[1].clone();
            let body = text.find(" \x02(").map_or(text.as_str(), |i| &text[..i]);
            rebuilt.push(' ');
            rebuilt.push_str(body);
            count += 1;
        }
        assert!(count >= 4);
        assert_eq!(rebuilt, text);
        assert_eq!(mores.remaining("alice"), 0);
    }

    #[test]
    fn lines_that_fill_the_budget_leave_room_for_the_count() {
        let r = Registry::with_core();
        let net = net();
        let budget = line_budget(&r, &net, "PRIVMSG", "#perch");
        let text = format!("{}\nsecond\nthird", "x".repeat(budget));
        let mut mores = MoreStore::new();
        let out = render(&Reply::new(text, ReplyOpts::default()), &alice_in(Some("#perch")), &r, &net, &mut mores);
        assert_eq!(out.len(), 1);
        assert!(out[0].params[1].ends_with("more messages)\x02"));

        let mut sent = out;
        while let Some(msg) = mores.next("alice") {
            sent.push(msg);
        }
        for msg in &sent {
            assert!(msg.params[1].len() <= budget, "{} > {budget}", msg.params[1].len());
            let wire = format!(":{} {}", net.bot_hostmask(), msg);
            assert!(wire.len() <= 510, "{} bytes", wire.len());
        }
        let bodies: String = sent
            .iter()
            .map(|m| {
                let text = &m.params[1];
                text.find(" \x02(").map_or(text.as_str(), |i| &text[..i]).to_string()
            })
            .collect();
        assert_eq!(bodies, format!("{}secondthird", "x".repeat(budget)));
    }

    #[test]
    fn split_prefers_whitespace_and_respects_char_boundaries() {
        assert_eq!(split_text("aaaa bbbb cccc dddd eeee", 16), vec!["aaaa bbbb cccc", "dddd eeee"]);
        let wide = "é".repeat(20);
        let chunks = split_text(&wide, 17);
        assert!(chunks.iter().all(|c| c.len() <= 17));
        assert_eq!(chunks.concat(), wide);
    }

    #[test]
    fn mores_follow_renames() {
        let mut mores = MoreStore::new();
        mores.store("alice", "#c", false, vec!["a".into(), "b".into()]);
        mores.rename("Alice", "alicia");
        assert_eq!(mores.remaining("alicia"), 2);
        assert_eq!(mores.next("alicia").unwrap().params[1], format!("a{}", more_suffix(1)));
        mores.forget("alicia");
        assert!(mores.next("alicia").is_none());
    }
}
