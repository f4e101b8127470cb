//! Commands every bot answers: help, list, more, version.

use perch_core::dispatch::CommandError;
use perch_core::dispatch::converter::{Arg, Conv};
use perch_core::dispatch::reply::ReplyOpts;
use perch_core::format::{comma_and_list, comma_or_list, quoted};
use perch_core::plugin::{Action, CommandSpec, Invocation, Plugin};

pub struct Misc;

impl Plugin for Misc {
    fn description(&self) -> &str {
        "Help, command listings and the rest of a long reply."
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("help", "[<plugin>] [<command>]\nDescribes <command>, or what <plugin> is for.")
                .args(vec![Conv::Something, Conv::additional(Conv::Something)]),
            CommandSpec::new("list", "[<plugin>]\nLists loaded plugins, or the commands <plugin> offers.")
                .args(vec![Conv::additional(Conv::Plugin)]),
            CommandSpec::new("more", "[<nick>]\nContinues a reply that was too long for one message.")
                .args(vec![Conv::additional(Conv::Nick)]),
            CommandSpec::new("version", "\nThe version of this bot."),
        ]
    }

    fn call(&mut self, command: &str, inv: &mut Invocation<'_>, args: Vec<Arg>) -> Result<(), CommandError> {
        match command {
            "help" => help(inv, &args),
            "list" => {
                let index = inv.index;
                match args[0].str() {
                    Some(plugin) => {
                        let info = index
                            .plugin(plugin)
                            .ok_or_else(|| CommandError::Failed(format!("There is no plugin named {plugin} loaded.")))?;
                        if info.commands.is_empty() {
                            inv.reply(format!("{} has no commands.", info.name));
                        } else {
                            inv.reply(comma_and_list(&info.commands));
                        }
                    }
                    None => {
                        let mut names: Vec<&str> = index.plugins().map(|p| p.name.as_str()).collect();
                        names.sort_unstable_by_key(|n| n.to_lowercase());
                        inv.reply(comma_and_list(&names));
                    }
                }
                Ok(())
            }
            "more" => {
                let nick = args[0].str().unwrap_or(inv.nick()).to_string();
                inv.act(Action::More { nick });
                Ok(())
            }
            "version" => {
                inv.reply(format!("perch {}", env!("CARGO_PKG_VERSION")));
                Ok(())
            }
            other => Err(CommandError::InvalidCommand(other.to_string())),
        }
    }

    fn invalid_command(&mut self, inv: &mut Invocation<'_>, tokens: &[String]) -> bool {
        let network = inv.net.network.clone();
        if !inv.ctx.registry.bool("replies.whenNotCommand", Some(&network), inv.channel()) {
            return false;
        }
        let Some(word) = tokens.first().map(|t| t.to_lowercase()) else {
            return false;
        };
        let suggestions = near_matches(&word, inv.index.command_names());
        if suggestions.is_empty() {
            return false;
        }
        inv.reply_with(
            format!(
                "Error: {} is not a valid command. Did you mean {}?",
                quoted(&word),
                comma_or_list(&suggestions)
            ),
            ReplyOpts::error(),
        );
        true
    }
}

fn help(inv: &mut Invocation<'_>, args: &[Arg]) -> Result<(), CommandError> {
    let index = inv.index;
    let first = args[0].to_string();
    if let Some(command) = args[1].str() {
        let entry = index.lookup(&first, command).ok_or_else(|| {
            CommandError::Failed(format!("There is no command {} in the {first} plugin.", quoted(command)))
        })?;
        inv.reply(entry.usage());
        return Ok(());
    }

    match index.providers(&first) {
        [] => match index.plugin(&first) {
            Some(info) => {
                let about = if info.description.is_empty() {
                    format!("{} has no description.", info.name)
                } else {
                    info.description.clone()
                };
                inv.reply(format!("{about} Use the list command to see the commands {} offers.", info.name));
                Ok(())
            }
            None => Err(CommandError::Failed(format!("There is no command {}.", quoted(&first)))),
        },
        [only] => {
            inv.reply(only.usage());
            Ok(())
        }
        several => {
            let key = format!("commands.defaultPlugins.{}", first.to_lowercase());
            let preferred = inv.ctx.registry.string(&key, None, None);
            if let Some(entry) = several.iter().find(|e| e.plugin.eq_ignore_ascii_case(&preferred)) {
                inv.reply(entry.usage());
                return Ok(());
            }
            let plugins: Vec<&str> = several.iter().map(|e| e.plugin.as_str()).collect();
            Err(CommandError::Failed(format!(
                "That command exists in the {} plugins. Please specify exactly which plugin command you want help with.",
                comma_and_list(&plugins)
            )))
        }
    }
}

/// Command names within two edits of `word`, closest first.
fn near_matches<'a>(word: &str, names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut scored: Vec<(usize, &str)> = names
        .map(|name| (edit_distance(word, name), name))
        .filter(|(d, _)| *d > 0 && *d <= 2)
        .collect();
    scored.sort();
    scored.into_iter().take(3).map(|(_, n)| n.to_string()).collect()
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == *cb { diagonal } else { 1 + diagonal.min(above).min(row[j]) };
            diagonal = above;
        }
    }
    row[b.len()]
}
