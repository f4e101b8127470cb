//! Channel operator commands. Everything that changes modes needs the bot
//! to hold ops in the channel; everything else lives in the channels
//! database.

use perch_core::dispatch::CommandError;
use perch_core::dispatch::converter::{Arg, Conv};
use perch_core::format::comma_and_list;
use perch_core::ident::{hostmask_pattern_equal, make_channel_capability};
use perch_core::message::Message;
use perch_core::msgs;
use perch_core::plugin::{CommandSpec, Invocation, Plugin};

use super::bot_is_op;

pub struct Channel;

const UNBAN_EVENT: &str = "unban ";

impl Plugin for Channel {
    fn description(&self) -> &str {
        "Ops, voices, kicks, bans and per-channel access."
    }

    fn commands(&self) -> Vec<CommandSpec> {
        let nicks = || Conv::additional(Conv::many(Conv::Nick));
        vec![
            CommandSpec::new("op", "[<channel>] [<nick> ...]\nGives ops to <nick>s, or to you.")
                .args(vec![Conv::InChannel, Conv::CheckChannelCapability("op"), nicks()]),
            CommandSpec::new("deop", "[<channel>] [<nick> ...]\nTakes ops from <nick>s, or from you.")
                .args(vec![Conv::InChannel, Conv::CheckChannelCapability("op"), nicks()]),
            CommandSpec::new(
                "voice",
                "[<channel>] [<nick> ...]\nVoices <nick>s. Voicing yourself needs the voice capability, others op.",
            )
            .args(vec![Conv::InChannel, nicks()]),
            CommandSpec::new("devoice", "[<channel>] [<nick> ...]\nUndoes voice.").args(vec![Conv::InChannel, nicks()]),
            CommandSpec::new("kick", "[<channel>] <nick> [<reason>]\nKicks <nick>; the reason defaults to your nick.")
                .args(vec![Conv::InChannel, Conv::CheckChannelCapability("op"), Conv::Nick, Conv::Rest]),
            CommandSpec::new(
                "ban",
                "[<channel>] <nick|hostmask> [<seconds>]\nBans <nick>'s mask, or <hostmask>, for <seconds> (0 or nothing is forever).",
            )
            .args(vec![
                Conv::InChannel,
                Conv::CheckChannelCapability("op"),
                Conv::Banmask,
                Conv::additional_or(Conv::Expiry, Arg::Expiry(None)),
            ]),
            CommandSpec::new("unban", "[<channel>] <hostmask>\nLifts a ban.")
                .args(vec![Conv::InChannel, Conv::CheckChannelCapability("op"), Conv::Banmask]),
            CommandSpec::new("topic", "[<channel>] <text>\nSets the topic.")
                .args(vec![Conv::InChannel, Conv::CheckChannelCapability("topic"), Conv::Topic]),
            CommandSpec::new("lobotomy", "add|remove [<channel>]\nMakes the bot ignore everyone but owners in <channel>.")
                .args(vec![
                    Conv::Literal(vec!["add", "remove"]),
                    Conv::Channel,
                    Conv::CheckChannelCapability("op"),
                ]),
            CommandSpec::new(
                "capability",
                "set|unset [<channel>] <capability> ... | setdefault [<channel>] <true|false>\nChanges what everyone may do in <channel>.",
            )
            .args(vec![
                Conv::Literal(vec!["set", "unset", "setdefault"]),
                Conv::Channel,
                Conv::CheckChannelCapability("op"),
                Conv::many(Conv::Something),
            ]),
            CommandSpec::new(
                "ignore",
                "add|remove|list [<channel>] [<hostmask|nick>] [<seconds>]\nManages who the bot ignores in <channel>.",
            )
            .args(vec![
                Conv::Literal(vec!["add", "remove", "list"]),
                Conv::Channel,
                Conv::CheckChannelCapability("op"),
                Conv::additional(Conv::Hostmask),
                Conv::additional_or(Conv::Expiry, Arg::Expiry(None)),
            ]),
        ]
    }

    fn call(&mut self, command: &str, inv: &mut Invocation<'_>, args: Vec<Arg>) -> Result<(), CommandError> {
        let channel = args[0].to_string();
        match command {
            "op" | "deop" | "voice" | "devoice" => modes(command, inv, &channel, &args),
            "kick" => kick(inv, &channel, &args),
            "ban" => ban(inv, &channel, &args),
            "unban" => unban(inv, &channel, &args),
            "topic" => {
                let text = args[2].to_string();
                let locked = inv.net.channels.get(&channel).is_some_and(|c| c.modes.contains_key(&'t'));
                if locked && !bot_is_op(inv, &channel) {
                    return Err(CommandError::Failed(format!(
                        "{channel} is +t and I'm not opped, so I can't change the topic."
                    )));
                }
                inv.send(msgs::topic(&channel, &text));
                Ok(())
            }
            "lobotomy" => {
                let on = args[0].str() == Some("add");
                let chan = args[1].to_string();
                inv.ctx.channels.update(&chan, |c| c.lobotomized = on)?;
                tracing::info!(channel = %chan, lobotomized = on, "Lobotomy changed");
                inv.reply_success(None);
                Ok(())
            }
            "capability" => capability(inv, &args),
            "ignore" => ignore(inv, &args),
            other => Err(CommandError::InvalidCommand(other.to_string())),
        }
    }

    fn on_event(&mut self, inv: &mut Invocation<'_>, name: &str) {
        let Some((channel, mask)) = name.strip_prefix(UNBAN_EVENT).and_then(|rest| rest.split_once(' ')) else {
            return;
        };
        if let Err(e) = inv.ctx.channels.update(channel, |c| c.bans.remove(mask)) {
            tracing::warn!(%channel, %mask, error = %e, "Could not drop expired ban");
        }
        if bot_is_op(inv, channel) {
            for msg in msgs::unbans(channel, &[mask], inv.net.isupport.max_modes) {
                inv.send(msg);
            }
        } else {
            tracing::info!(%channel, %mask, "Ban expired but I'm not opped to lift it");
        }
    }
}

fn require_op(inv: &Invocation<'_>, channel: &str) -> Result<(), CommandError> {
    if bot_is_op(inv, channel) {
        Ok(())
    } else {
        Err(CommandError::Failed(format!("I need to be opped in {channel} to do that.")))
    }
}

fn modes(command: &str, inv: &mut Invocation<'_>, channel: &str, args: &[Arg]) -> Result<(), CommandError> {
    let nicks_arg = args.last().map(Arg::list).unwrap_or_default();
    let nicks: Vec<String> = if nicks_arg.is_empty() {
        vec![inv.nick().to_string()]
    } else {
        nicks_arg.iter().map(ToString::to_string).collect()
    };
    if matches!(command, "voice" | "devoice") {
        let only_self = nicks.iter().all(|n| inv.net.nick_equals(n, inv.nick()));
        let needed = if only_self { "voice" } else { "op" };
        let full = make_channel_capability(channel, needed);
        if !inv.check_capability(&full) {
            return Err(CommandError::Capability(full));
        }
    }
    require_op(inv, channel)?;
    let state = inv.net.channels.get(channel);
    let missing: Vec<&str> = nicks
        .iter()
        .filter(|n| !state.is_some_and(|c| c.has_user(n)))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(CommandError::Failed(format!("{} not in {channel}.", comma_and_list(&missing))));
    }
    let targets: Vec<&str> = nicks.iter().map(String::as_str).collect();
    let max = inv.net.isupport.max_modes;
    let batch: Vec<Message> = match command {
        "op" => msgs::ops(channel, &targets, max),
        "deop" => msgs::deops(channel, &targets, max),
        "voice" => msgs::voices(channel, &targets, max),
        _ => msgs::devoices(channel, &targets, max),
    };
    for msg in batch {
        inv.send(msg);
    }
    Ok(())
}

fn kick(inv: &mut Invocation<'_>, channel: &str, args: &[Arg]) -> Result<(), CommandError> {
    let nick = args[2].to_string();
    if inv.net.is_me(&nick) {
        return Err(CommandError::Failed("I'm not going to kick myself.".into()));
    }
    if !inv.net.channels.get(channel).is_some_and(|c| c.has_user(&nick)) {
        return Err(CommandError::Failed(format!("{nick} is not in {channel}.")));
    }
    require_op(inv, channel)?;
    let reason = match args[3].to_string() {
        r if r.is_empty() => inv.nick().to_string(),
        r => r,
    };
    inv.send(msgs::kick(channel, &nick, &reason));
    Ok(())
}

fn ban(inv: &mut Invocation<'_>, channel: &str, args: &[Arg]) -> Result<(), CommandError> {
    let mask = args[2].to_string();
    let expires = match args[3] {
        Arg::Expiry(t) => t,
        _ => None,
    };
    if hostmask_pattern_equal(&mask, &inv.net.bot_hostmask(), inv.net.casemap) {
        return Err(CommandError::Failed("I'm not going to ban myself.".into()));
    }
    inv.ctx.channels.update(channel, |c| c.bans.add(&mask, expires, ()))?;
    if bot_is_op(inv, channel) {
        for msg in msgs::bans(channel, &[&mask], inv.net.isupport.max_modes) {
            inv.send(msg);
        }
    } else {
        inv.reply(format!("I'll remember the ban on {mask}, but I need ops in {channel} to set it."));
    }
    if let Some(at) = expires {
        inv.schedule(&format!("{UNBAN_EVENT}{channel} {mask}"), at, None);
    }
    Ok(())
}

fn unban(inv: &mut Invocation<'_>, channel: &str, args: &[Arg]) -> Result<(), CommandError> {
    let mask = args[2].to_string();
    let opped = bot_is_op(inv, channel);
    let remembered = inv.ctx.channels.get(channel).is_some_and(|c| c.bans.contains(&mask));
    if !opped && !remembered {
        return require_op(inv, channel);
    }
    if remembered {
        inv.ctx.channels.update(channel, |c| c.bans.remove(&mask))?;
    }
    if opped {
        for msg in msgs::unbans(channel, &[&mask], inv.net.isupport.max_modes) {
            inv.send(msg);
        }
    } else {
        inv.reply(format!("I've forgotten the ban on {mask}, but I need ops in {channel} to lift it."));
    }
    Ok(())
}

fn capability(inv: &mut Invocation<'_>, args: &[Arg]) -> Result<(), CommandError> {
    let channel = args[1].to_string();
    let words: Vec<String> = args[3].list().iter().map(ToString::to_string).collect();
    match args[0].str() {
        Some("setdefault") => {
            let allow = match words.as_slice() {
                [w] if matches!(w.to_ascii_lowercase().as_str(), "true" | "on" | "yes") => true,
                [w] if matches!(w.to_ascii_lowercase().as_str(), "false" | "off" | "no") => false,
                _ => return Err(CommandError::Argument),
            };
            inv.ctx.channels.update(&channel, |c| c.default_allow = allow)?;
        }
        Some("set") => {
            inv.ctx.channels.update(&channel, |c| {
                for cap in &words {
                    c.add_capability(cap);
                }
            })?;
        }
        _ => {
            let missing: Vec<&str> = inv.ctx.channels.update(&channel, |c| {
                words.iter().filter(|cap| !c.remove_capability(cap)).map(String::as_str).collect()
            })?;
            if !missing.is_empty() {
                return Err(CommandError::Failed(format!(
                    "{channel} did not have {}.",
                    comma_and_list(&missing)
                )));
            }
        }
    }
    inv.reply_success(None);
    Ok(())
}

fn ignore(inv: &mut Invocation<'_>, args: &[Arg]) -> Result<(), CommandError> {
    let channel = args[1].to_string();
    let ctx = inv.ctx;
    match (args[0].str(), args[3].str()) {
        (Some("list"), _) => {
            let masks: Vec<String> = ctx
                .channels
                .get(&channel)
                .map(|c| c.ignores.iter().map(|(m, _, _)| m.to_string()).collect())
                .unwrap_or_default();
            if masks.is_empty() {
                inv.reply(format!("I'm not ignoring anyone in {channel}."));
            } else {
                inv.reply(comma_and_list(&masks));
            }
        }
        (Some("add"), Some(mask)) => {
            let expires = match args[4] {
                Arg::Expiry(t) => t,
                _ => None,
            };
            ctx.channels.update(&channel, |c| c.ignores.add(mask, expires, ()))?;
            inv.reply_success(None);
        }
        (Some("remove"), Some(mask)) => {
            if !ctx.channels.update(&channel, |c| c.ignores.remove(mask))? {
                return Err(CommandError::Failed(format!("{mask} is not ignored in {channel}.")));
            }
            inv.reply_success(None);
        }
        _ => return Err(CommandError::Argument),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::plugins::testing::Bench;

    fn bench() -> Bench {
        let b = Bench::new();
        b.user("alice", "alice!*@alice.host", &["owner"]);
        b.user("bob", "bob!*@bob.host", &["#perch,voice"]);
        b
    }

    fn lines(b: &mut Bench, line: &str) -> Vec<String> {
        b.send(line).iter().map(ToString::to_string).collect()
    }

    #[test]
    fn ops_need_the_bot_opped() {
        let mut b = bench();
        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: op");
        assert_eq!(texts, vec!["Error: I need to be opped in #perch to do that."]);
        b.op_bot();
        assert_eq!(lines(&mut b, ":alice!a@alice.host PRIVMSG #perch :perch: op"), vec!["MODE #perch +o alice"]);
        assert_eq!(
            lines(&mut b, ":alice!a@alice.host PRIVMSG #perch :perch: deop alice bob"),
            vec!["MODE #perch -oo alice bob"]
        );
        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: op ghost");
        assert_eq!(texts, vec!["Error: ghost not in #perch."]);
    }

    #[test]
    fn voicing_yourself_needs_only_voice() {
        let mut b = bench();
        b.op_bot();
        assert_eq!(lines(&mut b, ":bob!b@bob.host PRIVMSG #perch :perch: voice"), vec!["MODE #perch +v bob"]);
        let texts = b.texts(":bob!b@bob.host PRIVMSG #perch :perch: voice alice");
        assert!(texts[0].contains("#perch,op"), "{texts:?}");
        let texts = b.texts(":bob!b@bob.host PRIVMSG #perch :perch: op");
        assert!(texts[0].contains("#perch,op"), "{texts:?}");
    }

    #[test]
    fn kicks() {
        let mut b = bench();
        b.op_bot();
        assert_eq!(
            lines(&mut b, ":alice!a@alice.host PRIVMSG #perch :perch: kick bob go away"),
            vec!["KICK #perch bob :go away"]
        );
        assert_eq!(
            lines(&mut b, ":alice!a@alice.host PRIVMSG #perch :perch: kick bob"),
            vec!["KICK #perch bob alice"]
        );
        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: kick perch");
        assert_eq!(texts, vec!["Error: I'm not going to kick myself."]);
        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: kick ghost");
        assert_eq!(texts, vec!["Error: ghost is not in #perch."]);
    }

    #[test]
    fn timed_bans_are_lifted() {
        let mut b = bench();
        b.op_bot();
        assert_eq!(
            lines(&mut b, ":alice!a@alice.host PRIVMSG #perch :perch: ban *!*@bob.host 10m"),
            vec!["MODE #perch +b *!*@bob.host"]
        );
        assert!(b.ctx().channels.get("#perch").unwrap().bans.contains("*!*@bob.host"));

        b.ctx().clock.advance(601.0);
        let now = b.ctx().now();
        b.session.tick(now);
        let sent: Vec<String> = b.session.drain_outbound().iter().map(ToString::to_string).collect();
        assert_eq!(sent, vec!["MODE #perch -b *!*@bob.host"]);
        assert!(!b.ctx().channels.get("#perch").unwrap().bans.contains("*!*@bob.host"));

        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: ban *!*@bot.host");
        assert_eq!(texts, vec!["Error: I'm not going to ban myself."]);
    }

    #[test]
    fn unbanning_without_ops_says_what_happened() {
        let mut b = bench();
        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: ban *!*@bob.host");
        assert!(texts[0].starts_with("I'll remember the ban"), "{texts:?}");

        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: unban *!*@bob.host");
        assert_eq!(
            texts,
            vec!["I've forgotten the ban on *!*@bob.host, but I need ops in #perch to lift it."]
        );
        assert!(!b.ctx().channels.get("#perch").unwrap().bans.contains("*!*@bob.host"));

        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: unban *!*@carol.host");
        assert_eq!(texts, vec!["Error: I need to be opped in #perch to do that."]);

        b.op_bot();
        assert_eq!(
            lines(&mut b, ":alice!a@alice.host PRIVMSG #perch :perch: unban *!*@carol.host"),
            vec!["MODE #perch -b *!*@carol.host"]
        );
    }

    #[test]
    fn topic_respects_plus_t() {
        let mut b = bench();
        assert_eq!(
            lines(&mut b, ":alice!a@alice.host PRIVMSG #perch :perch: topic hello there"),
            vec!["TOPIC #perch :hello there"]
        );
        b.send(":ChanServ!cs@services MODE #perch +t");
        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: topic hello again");
        assert!(texts[0].contains("+t"), "{texts:?}");
        let long = "x".repeat(60);
        let texts = b.texts(&format!(":alice!a@alice.host PRIVMSG #perch :perch: topic {long}"));
        assert!(texts[0].contains("too long"), "{texts:?}");
    }

    #[test]
    fn lobotomized_channels_answer_only_owners() {
        let mut b = bench();
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: lobotomy add"),
            vec!["The operation succeeded."]
        );
        assert!(b.send(":bob!b@bob.host PRIVMSG #perch :perch: echo hi").is_empty());
        assert_eq!(b.texts(":alice!a@alice.host PRIVMSG #perch :perch: echo hi"), vec!["hi"]);
        b.send(":alice!a@alice.host PRIVMSG #perch :perch: lobotomy remove");
        assert_eq!(b.texts(":bob!b@bob.host PRIVMSG #perch :perch: echo hi"), vec!["hi"]);
    }

    #[test]
    fn channel_capabilities_and_ignores() {
        let mut b = bench();
        b.send(":alice!a@alice.host PRIVMSG #perch :perch: channel capability set -topic");
        let texts = b.texts(":carol!c@carol.host PRIVMSG #perch :perch: topic mine now");
        assert!(texts[0].contains("#perch,topic"), "{texts:?}");
        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: channel capability unset kick");
        assert_eq!(texts, vec!["Error: #perch did not have kick."]);

        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: channel ignore add carol!*@*"),
            vec!["The operation succeeded."]
        );
        assert!(b.send(":carol!c@carol.host PRIVMSG #perch :perch: echo hi").is_empty());
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: channel ignore list"),
            vec!["carol!*@*"]
        );
        b.send(":alice!a@alice.host PRIVMSG #perch :perch: channel ignore remove carol!*@*");
        assert_eq!(b.texts(":carol!c@carol.host PRIVMSG #perch :perch: echo hi"), vec!["hi"]);
    }
}
