//! Builders for outbound messages and CTCP helpers.

use crate::ident::modes::{ModeChange, chunk_modes};
use crate::message::Message;

fn msg(command: &str, params: &[&str]) -> Message {
    Message::new(command, params.iter().map(|p| p.to_string()).collect())
}

pub fn privmsg(target: &str, text: &str) -> Message {
    msg("PRIVMSG", &[target, text])
}

pub fn notice(target: &str, text: &str) -> Message {
    msg("NOTICE", &[target, text])
}

/// CTCP ACTION (`/me`).
pub fn action(target: &str, text: &str) -> Message {
    privmsg(target, &format!("\x01ACTION {text}\x01"))
}

pub fn join(channel: &str, key: Option<&str>) -> Message {
    match key {
        Some(key) if !key.is_empty() => msg("JOIN", &[channel, key]),
        _ => msg("JOIN", &[channel]),
    }
}

pub fn part(channel: &str, reason: Option<&str>) -> Message {
    match reason {
        Some(reason) => msg("PART", &[channel, reason]),
        None => msg("PART", &[channel]),
    }
}

pub fn quit(reason: &str) -> Message {
    msg("QUIT", &[reason])
}

pub fn nick(nick: &str) -> Message {
    msg("NICK", &[nick])
}

pub fn user(ident: &str, realname: &str) -> Message {
    msg("USER", &[ident, "0", "*", realname])
}

pub fn pass(password: &str) -> Message {
    msg("PASS", &[password])
}

pub fn ping(token: &str) -> Message {
    msg("PING", &[token])
}

pub fn pong(token: &str) -> Message {
    msg("PONG", &[token])
}

pub fn mode(target: &str, args: &[String]) -> Message {
    let mut params = vec![target.to_string()];
    params.extend(args.iter().cloned());
    Message::new("MODE", params)
}

pub fn kick(channel: &str, nick: &str, reason: &str) -> Message {
    msg("KICK", &[channel, nick, reason])
}

pub fn topic(channel: &str, text: &str) -> Message {
    msg("TOPIC", &[channel, text])
}

pub fn invite(nick: &str, channel: &str) -> Message {
    msg("INVITE", &[nick, channel])
}

pub fn who(target: &str) -> Message {
    msg("WHO", &[target])
}

pub fn cap(subcommand: &str, args: &[&str]) -> Message {
    let mut params = vec![subcommand];
    params.extend_from_slice(args);
    msg("CAP", &params)
}

pub fn authenticate(payload: &str) -> Message {
    msg("AUTHENTICATE", &[payload])
}

/// Set or unset one membership/list mode on many targets, split by the
/// server's `MODES` limit.
pub fn batch_modes(channel: &str, adding: bool, mode: char, args: &[&str], max: usize) -> Vec<Message> {
    let changes: Vec<ModeChange> = args
        .iter()
        .map(|a| ModeChange::new(adding, mode, Some(a)))
        .collect();
    chunk_modes(&changes, max)
        .into_iter()
        .map(|chunk| self::mode(channel, &chunk))
        .collect()
}

pub fn ops(channel: &str, nicks: &[&str], max: usize) -> Vec<Message> {
    batch_modes(channel, true, 'o', nicks, max)
}

pub fn deops(channel: &str, nicks: &[&str], max: usize) -> Vec<Message> {
    batch_modes(channel, false, 'o', nicks, max)
}

pub fn voices(channel: &str, nicks: &[&str], max: usize) -> Vec<Message> {
    batch_modes(channel, true, 'v', nicks, max)
}

pub fn devoices(channel: &str, nicks: &[&str], max: usize) -> Vec<Message> {
    batch_modes(channel, false, 'v', nicks, max)
}

pub fn bans(channel: &str, masks: &[&str], max: usize) -> Vec<Message> {
    batch_modes(channel, true, 'b', masks, max)
}

pub fn unbans(channel: &str, masks: &[&str], max: usize) -> Vec<Message> {
    batch_modes(channel, false, 'b', masks, max)
}

// ── CTCP ──

pub fn is_ctcp(text: &str) -> bool {
    text.len() >= 2 && text.starts_with('\x01') && text.ends_with('\x01')
}

pub fn is_action(text: &str) -> bool {
    is_ctcp(text) && text[1..].starts_with("ACTION")
}

/// Text of a CTCP ACTION without the framing.
pub fn unaction(text: &str) -> Option<&str> {
    text.strip_prefix("\x01ACTION")
        .and_then(|rest| rest.strip_suffix('\x01'))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_serialize() {
        assert_eq!(privmsg("#c", "hi there").to_string(), "PRIVMSG #c :hi there");
        assert_eq!(join("#c", Some("key")).to_string(), "JOIN #c key");
        assert_eq!(join("#c", Some("")).to_string(), "JOIN #c");
        assert_eq!(user("perch", "Perch Bot").to_string(), "USER perch 0 * :Perch Bot");
        assert_eq!(cap("LS", &["302"]).to_string(), "CAP LS 302");
        assert_eq!(
            kick("#c", "troll", "bye").to_string(),
            "KICK #c troll bye"
        );
    }

    #[test]
    fn action_framing() {
        let m = action("#c", "waves");
        let text = m.trailing().unwrap();
        assert!(is_ctcp(text));
        assert!(is_action(text));
        assert_eq!(unaction(text), Some("waves"));
        assert_eq!(unaction("plain"), None);
    }

    #[test]
    fn ops_are_batched() {
        let out = ops("#c", &["a", "b", "c", "d"], 3);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].to_string(), "MODE #c +ooo a b c");
        assert_eq!(out[1].to_string(), "MODE #c +o d");
    }
}
