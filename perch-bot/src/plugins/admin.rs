//! Administering the bot on a network: channels, nick, capabilities,
//! the global ignore list, and services account registration.

use perch_core::config::{Scope, Value};
use perch_core::dispatch::CommandError;
use perch_core::dispatch::converter::{Arg, Conv};
use perch_core::format::{comma_and_list, quoted, time_elapsed};
use perch_core::ident::canonical_capability;
use perch_core::message::Message;
use perch_core::msgs;
use perch_core::plugin::{Action, CommandSpec, Invocation, Plugin};

pub struct Admin;

const ACCOUNT_REGISTRATION: &str = "draft/account-registration";

impl Plugin for Admin {
    fn description(&self) -> &str {
        "Joining and parting, the bot's nick, capabilities and global ignores."
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("join", "<channel> [<key>]\nJoins <channel> now and on every later connect.")
                .args(vec![Conv::Something, Conv::additional(Conv::Something)])
                .capability("admin"),
            CommandSpec::new("part", "[<channel>] [<reason>]\nLeaves <channel> and forgets it.")
                .args(vec![Conv::Channel, Conv::Rest])
                .capability("admin"),
            CommandSpec::new("nick", "[<nick>]\nChanges the bot's nick on this network, or shows it.")
                .args(vec![Conv::additional(Conv::Nick)])
                .capability("admin"),
            CommandSpec::new(
                "capability",
                "add|remove <user> <capability>\nGives <user> <capability> or takes it away. Only owners manage the owner capability.",
            )
            .args(vec![Conv::Literal(vec!["add", "remove"]), Conv::OtherUser, Conv::Capability])
            .capability("admin"),
            CommandSpec::new(
                "ignore",
                "add|remove|list [<hostmask|nick>] [<seconds>]\nManages the global ignore list; 0 seconds never expires.",
            )
            .args(vec![
                Conv::Literal(vec!["add", "remove", "list"]),
                Conv::additional(Conv::Hostmask),
                Conv::additional_or(Conv::Expiry, Arg::Expiry(None)),
            ])
            .capability("admin"),
            CommandSpec::new(
                "account",
                "register <email> <password> | verify <account> <code>\nRegisters the bot's nick with network services.",
            )
            .args(vec![Conv::Literal(vec!["register", "verify"]), Conv::Something, Conv::Something])
            .capability("admin"),
        ]
    }

    fn call(&mut self, command: &str, inv: &mut Invocation<'_>, args: Vec<Arg>) -> Result<(), CommandError> {
        match command {
            "join" => join(inv, &args),
            "part" => part(inv, &args),
            "nick" => match args[0].str() {
                None => {
                    inv.reply(inv.net.nick.clone());
                    Ok(())
                }
                Some(nick) => {
                    let key = format!("networks.{}.nick", inv.net.network);
                    inv.ctx
                        .registry
                        .set(&key, &Scope::global(), nick)
                        .map_err(|e| CommandError::Failed(e.to_string()))?;
                    inv.send(msgs::nick(nick));
                    Ok(())
                }
            },
            "capability" => capability(inv, &args),
            "ignore" => ignore(inv, &args),
            "account" => account(inv, &args),
            other => Err(CommandError::InvalidCommand(other.to_string())),
        }
    }
}

fn channels_key(inv: &Invocation<'_>) -> String {
    format!("networks.{}.channels", inv.net.network)
}

fn join(inv: &mut Invocation<'_>, args: &[Arg]) -> Result<(), CommandError> {
    let channel = args[0].to_string();
    if !inv.net.is_channel(&channel) {
        return Err(CommandError::Failed(format!("{} is not a valid channel.", quoted(&channel))));
    }
    let key = args[1].str();
    let mut configured = inv.ctx.registry.set_of(&channels_key(inv), None, None);
    configured.insert(channel.clone());
    inv.ctx
        .registry
        .set_value(&channels_key(inv), &Scope::global(), Value::Set(configured))
        .map_err(|e| CommandError::Failed(e.to_string()))?;
    if let Some(k) = key {
        let key_name = format!("{}.key", channels_key(inv));
        inv.ctx
            .registry
            .set(&key_name, &Scope::channel(&channel), k)
            .map_err(|e| CommandError::Failed(e.to_string()))?;
    }
    inv.send(msgs::join(&channel, key));
    Ok(())
}

fn part(inv: &mut Invocation<'_>, args: &[Arg]) -> Result<(), CommandError> {
    let channel = args[0].to_string();
    let mut configured = inv.ctx.registry.set_of(&channels_key(inv), None, None);
    let forgotten = configured.remove(&channel);
    if forgotten {
        inv.ctx
            .registry
            .set_value(&channels_key(inv), &Scope::global(), Value::Set(configured))
            .map_err(|e| CommandError::Failed(e.to_string()))?;
    }
    if !inv.net.channels.contains_key(&channel) {
        if forgotten {
            inv.reply_success(None);
            return Ok(());
        }
        return Err(CommandError::Failed(format!("I'm not in {channel}.")));
    }
    let reason = args[1].to_string();
    inv.send(msgs::part(&channel, (!reason.is_empty()).then_some(reason.as_str())));
    // The reply would go to a channel we just left.
    if inv.channel().is_none_or(|c| !c.eq_ignore_ascii_case(&channel)) {
        inv.reply_success(None);
    }
    Ok(())
}

fn capability(inv: &mut Invocation<'_>, args: &[Arg]) -> Result<(), CommandError> {
    let Some(target) = args[1].user() else {
        return Err(CommandError::Argument);
    };
    let cap = args[2].to_string();
    let bare = cap.trim_start_matches('-');
    let caller_is_owner = inv.ctx.is_owner(inv.hostmask());
    if bare.eq_ignore_ascii_case("owner") && !caller_is_owner {
        return Err(CommandError::Capability("owner".into()));
    }
    let holds = inv.user().is_some_and(|u| u.capabilities.contains(&canonical_capability(bare)));
    if !caller_is_owner && !holds {
        return Err(CommandError::Failed(format!(
            "You can't {} capabilities you don't have.",
            if args[0].str() == Some("add") { "give" } else { "take away" }
        )));
    }
    let id = target.id;
    if args[0].str() == Some("add") {
        inv.ctx.users.update(id, |u| u.add_capability(&cap))?;
        inv.reply_success(None);
    } else {
        let removed = inv.ctx.users.update(id, |u| u.remove_capability(&cap))?;
        if !removed {
            return Err(CommandError::Failed(format!("{} doesn't have the {cap} capability.", target.name)));
        }
        inv.reply_success(None);
    }
    Ok(())
}

fn ignore(inv: &mut Invocation<'_>, args: &[Arg]) -> Result<(), CommandError> {
    let ctx = inv.ctx;
    let ignores = &ctx.ignores;
    match (args[0].str(), args[1].str()) {
        (Some("list"), _) => {
            let now = ctx.now();
            let entries: Vec<String> = ignores
                .list()
                .into_iter()
                .map(|(mask, expires)| match expires {
                    Some(t) => format!("{mask} (for {})", time_elapsed((t - now).max(0.0) as u64)),
                    None => mask,
                })
                .collect();
            if entries.is_empty() {
                inv.reply("I'm not currently globally ignoring anyone.");
            } else {
                inv.reply(comma_and_list(&entries));
            }
        }
        (Some("add"), Some(mask)) => {
            let expires = match &args[2] {
                Arg::Expiry(t) => *t,
                _ => None,
            };
            ignores.add(mask, expires)?;
            inv.reply_success(None);
        }
        (Some("remove"), Some(mask)) => {
            if !ignores.remove(mask)? {
                return Err(CommandError::Failed(format!("{mask} wasn't in the ignores database.")));
            }
            inv.reply_success(None);
        }
        _ => return Err(CommandError::Argument),
    }
    Ok(())
}

fn account(inv: &mut Invocation<'_>, args: &[Arg]) -> Result<(), CommandError> {
    if !inv.net.caps_enabled.contains(ACCOUNT_REGISTRATION) {
        return Err(CommandError::Failed(
            "This network does not support account registration.".into(),
        ));
    }
    let (a, b) = (args[1].to_string(), args[2].to_string());
    let msg = if args[0].str() == Some("register") {
        Message::new("REGISTER", vec!["*".into(), a, b])
    } else {
        Message::new("VERIFY", vec![a, b])
    };
    inv.act(Action::Labeled(msg));
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::plugins::testing::Bench;

    fn bench() -> Bench {
        let b = Bench::new();
        b.user("alice", "alice!*@alice.host", &["owner"]);
        b.user("carol", "carol!*@carol.host", &["admin"]);
        b.user("bob", "bob!*@bob.host", &[]);
        b
    }

    #[test]
    fn join_and_part_remember_channels() {
        let mut b = bench();
        let sent = b.send(":alice!a@alice.host PRIVMSG #perch :perch: join #secret hunter2");
        assert_eq!(sent[0].to_string(), "JOIN #secret hunter2");
        let registry = &b.ctx().registry;
        assert!(registry.set_of("networks.testnet.channels", None, None).contains("#secret"));
        assert_eq!(registry.string("networks.testnet.channels.key", None, Some("#secret")), "hunter2");

        b.send(":perch!p@bot.host JOIN #secret");
        let sent = b.send(":alice!a@alice.host PRIVMSG #perch :perch: part #secret bye");
        assert_eq!(sent[0].to_string(), "PART #secret bye");
        assert_eq!(sent[1].trailing(), Some("The operation succeeded."));
        assert!(!b.ctx().registry.set_of("networks.testnet.channels", None, None).contains("#secret"));

        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: part #nowhere");
        assert_eq!(texts, vec!["Error: I'm not in #nowhere."]);
    }

    #[test]
    fn nick_is_shown_and_changed() {
        let mut b = bench();
        assert_eq!(b.texts(":alice!a@alice.host PRIVMSG #perch :perch: nick"), vec!["perch"]);
        let sent = b.send(":alice!a@alice.host PRIVMSG #perch :perch: nick robin");
        assert_eq!(sent[0].to_string(), "NICK robin");
        assert_eq!(b.ctx().registry.string("networks.testnet.nick", None, None), "robin");
    }

    #[test]
    fn capabilities_need_the_capability_itself() {
        let mut b = bench();
        assert_eq!(
            b.texts(":carol!c@carol.host PRIVMSG #perch :perch: capability add bob admin"),
            vec!["The operation succeeded."]
        );
        assert!(b.ctx().users.get_user("bob").unwrap().capabilities.contains("admin"));

        let texts = b.texts(":carol!c@carol.host PRIVMSG #perch :perch: capability add bob trusted");
        assert_eq!(texts, vec!["Error: You can't give capabilities you don't have."]);
        let texts = b.texts(":carol!c@carol.host PRIVMSG #perch :perch: capability add bob owner");
        assert!(texts[0].contains("owner"), "{texts:?}");

        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: capability add bob trusted"),
            vec!["The operation succeeded."]
        );
        b.send(":alice!a@alice.host PRIVMSG #perch :perch: capability remove bob admin");
        assert!(!b.ctx().users.get_user("bob").unwrap().capabilities.contains("admin"));
    }

    #[test]
    fn global_ignores_silence_people() {
        let mut b = bench();
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: ignore list"),
            vec!["I'm not currently globally ignoring anyone."]
        );
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: admin ignore add dave!*@* 1h"),
            vec!["The operation succeeded."]
        );
        assert!(b.send(":dave!d@dave.host PRIVMSG #perch :perch: echo hi").is_empty());
        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: ignore list");
        assert_eq!(texts, vec!["dave!*@* (for 1 hour)"]);
        b.send(":alice!a@alice.host PRIVMSG #perch :perch: ignore remove dave!*@*");
        assert_eq!(b.texts(":dave!d@dave.host PRIVMSG #perch :perch: echo hi"), vec!["hi"]);
    }

    #[test]
    fn account_registration_needs_the_server_capability() {
        let mut b = bench();
        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: account register me@example.org pw");
        assert_eq!(texts, vec!["Error: This network does not support account registration."]);
    }

    #[test]
    fn admin_commands_are_gated() {
        let mut b = bench();
        let texts = b.texts(":bob!b@bob.host PRIVMSG #perch :perch: join #elsewhere");
        assert!(texts[0].starts_with("Error: ") && texts[0].contains("admin"), "{texts:?}");
    }
}
