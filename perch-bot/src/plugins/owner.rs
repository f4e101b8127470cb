//! Running the bot itself: plugins, command names, persistence, quitting.

use perch_core::config::Scope;
use perch_core::dispatch::CommandError;
use perch_core::dispatch::converter::{Arg, Conv};
use perch_core::format::quoted;
use perch_core::plugin::{Action, CommandSpec, Invocation, Plugin};

pub struct Owner;

impl Plugin for Owner {
    fn description(&self) -> &str {
        "Loading plugins, renaming and disabling commands, and shutting down."
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("load", "<plugin>\nLoads <plugin>.")
                .args(vec![Conv::Something])
                .capability("admin"),
            CommandSpec::new("unload", "<plugin>\nUnloads <plugin>.")
                .args(vec![Conv::Plugin])
                .capability("admin"),
            CommandSpec::new("reload", "<plugin>\nUnloads and loads <plugin> again, keeping its state.")
                .args(vec![Conv::Plugin])
                .capability("admin"),
            CommandSpec::new("rename", "<plugin> <command> <new name>\nMakes <plugin>'s <command> answer to <new name>.")
                .args(vec![Conv::Plugin, Conv::Something, Conv::Something])
                .capability("owner"),
            CommandSpec::new("unrename", "<plugin> <name>\nUndoes a rename of one of <plugin>'s commands.")
                .args(vec![Conv::Plugin, Conv::Something])
                .capability("owner"),
            CommandSpec::new("disable", "[<plugin>] <command>\nHides <command> (of <plugin> only, if given) from everyone.")
                .args(vec![Conv::optional(Conv::Plugin), Conv::Something])
                .capability("owner"),
            CommandSpec::new("enable", "[<plugin>] <command>\nUndoes disable.")
                .args(vec![Conv::optional(Conv::Plugin), Conv::Something])
                .capability("owner"),
            CommandSpec::new(
                "defaultplugin",
                "<command> [<plugin>]\nMakes <plugin> answer <command> when several plugins offer it; shows the current choice without <plugin>.",
            )
            .args(vec![Conv::Something, Conv::additional(Conv::Plugin)])
            .capability("owner"),
            CommandSpec::new("flush", "\nWrites the configuration and databases to disk.").capability("owner"),
            CommandSpec::new("quit", "[<text>]\nDisconnects from every network with <text> as the quit message.")
                .args(vec![Conv::Rest])
                .capability("owner"),
        ]
    }

    fn call(&mut self, command: &str, inv: &mut Invocation<'_>, args: Vec<Arg>) -> Result<(), CommandError> {
        let name = |i: usize| args[i].to_string();
        match command {
            "load" => inv.act(Action::Load(name(0))),
            "unload" => inv.act(Action::Unload(name(0))),
            "reload" => inv.act(Action::Reload(name(0))),
            "rename" => {
                let to = name(2).to_lowercase();
                if to.contains(['.', ' ']) {
                    return Err(CommandError::Failed("Command names may not contain dots or spaces.".into()));
                }
                inv.act(Action::Rename { plugin: name(0), from: name(1), to });
            }
            "unrename" => inv.act(Action::Unrename { plugin: name(0), name: name(1) }),
            "disable" | "enable" => {
                let target = match args[0].str() {
                    Some(plugin) => format!("{plugin}.{}", name(1)),
                    None => name(1),
                };
                if command == "disable" {
                    let lowered = target.to_lowercase();
                    if lowered == "enable" || lowered.starts_with("owner.") {
                        return Err(CommandError::Failed("You probably don't want to disable that.".into()));
                    }
                    inv.act(Action::Disable(target));
                } else {
                    inv.act(Action::Enable(target));
                }
            }
            "defaultplugin" => {
                let command = name(0).to_lowercase();
                let key = format!("commands.defaultPlugins.{command}");
                match args[1].str() {
                    None => {
                        let current = inv.ctx.registry.string(&key, None, None);
                        if current.is_empty() {
                            inv.reply(format!("No default plugin is set for {}.", quoted(&command)));
                        } else {
                            inv.reply(current);
                        }
                    }
                    Some(plugin) => {
                        if inv.index.lookup(plugin, &command).is_none() {
                            return Err(CommandError::Failed(format!(
                                "{plugin} has no command named {}.",
                                quoted(&command)
                            )));
                        }
                        inv.ctx
                            .registry
                            .set(&key, &Scope::global(), plugin)
                            .map_err(|e| CommandError::Failed(e.to_string()))?;
                        inv.reply_success(None);
                    }
                }
            }
            "flush" => inv.act(Action::Flush),
            "quit" => {
                tracing::info!(by = %inv.hostmask(), "Quit requested");
                inv.act(Action::Shutdown(name(0)));
            }
            other => return Err(CommandError::InvalidCommand(other.to_string())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use perch_core::session::Request;

    use crate::plugins::testing::Bench;

    fn bench() -> Bench {
        let b = Bench::new();
        b.user("alice", "alice!*@alice.host", &["owner"]);
        b
    }

    #[test]
    fn plugins_load_and_unload() {
        let mut b = bench();
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: unload Utilities"),
            vec!["The operation succeeded."]
        );
        assert!(b.send(":alice!a@alice.host PRIVMSG #perch :perch: echo hi").is_empty());
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: load Utilities"),
            vec!["The operation succeeded."]
        );
        assert_eq!(b.texts(":alice!a@alice.host PRIVMSG #perch :perch: echo hi"), vec!["hi"]);
        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: load Nonsense");
        assert!(texts[0].starts_with("Error: "), "{texts:?}");
    }

    #[test]
    fn reload_needs_admin() {
        let mut b = bench();
        let texts = b.texts(":bob!b@bob.host PRIVMSG #perch :perch: reload Utilities");
        assert!(texts[0].starts_with("Error: ") && texts[0].contains("admin"), "{texts:?}");
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: reload Utilities"),
            vec!["The operation succeeded."]
        );
    }

    #[test]
    fn renames_and_disables() {
        let mut b = bench();
        b.send(":alice!a@alice.host PRIVMSG #perch :perch: rename Utilities echo say");
        assert_eq!(b.texts(":alice!a@alice.host PRIVMSG #perch :perch: say hi"), vec!["hi"]);
        b.send(":alice!a@alice.host PRIVMSG #perch :perch: unrename Utilities say");
        assert_eq!(b.texts(":alice!a@alice.host PRIVMSG #perch :perch: echo hi"), vec!["hi"]);

        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: disable Utilities last"),
            vec!["The operation succeeded."]
        );
        assert!(b.send(":alice!a@alice.host PRIVMSG #perch :perch: last a b").is_empty());
        b.send(":alice!a@alice.host PRIVMSG #perch :perch: enable Utilities last");
        assert_eq!(b.texts(":alice!a@alice.host PRIVMSG #perch :perch: last a b"), vec!["b"]);

        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: disable enable");
        assert_eq!(texts, vec!["Error: You probably don't want to disable that."]);
    }

    #[test]
    fn default_plugins_are_shown_and_set() {
        let mut b = bench();
        assert_eq!(b.texts(":alice!a@alice.host PRIVMSG #perch :perch: defaultplugin help"), vec!["Misc"]);
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: defaultplugin ignore Channel"),
            vec!["The operation succeeded."]
        );
        assert_eq!(b.ctx().registry.string("commands.defaultPlugins.ignore", None, None), "Channel");
        let texts = b.texts(":alice!a@alice.host PRIVMSG #perch :perch: defaultplugin echo Misc");
        assert_eq!(texts, vec!["Error: Misc has no command named \"echo\"."]);
    }

    #[test]
    fn flush_and_quit() {
        let mut b = bench();
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: flush"),
            vec!["The operation succeeded."]
        );
        assert!(b.send(":alice!a@alice.host PRIVMSG #perch :perch: quit see you").is_empty());
        assert_eq!(b.session.take_requests(), vec![Request::Shutdown("see you".into())]);
        let texts = b.texts(":bob!b@bob.host PRIVMSG #perch :perch: quit");
        assert!(texts[0].contains("owner"), "{texts:?}");
    }
}
