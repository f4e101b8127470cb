//! Small commands that mostly make sense nested inside others.

use perch_core::dispatch::CommandError;
use perch_core::dispatch::converter::{Arg, Conv};
use perch_core::plugin::{CommandSpec, Invocation, Plugin};

pub struct Utilities;

impl Plugin for Utilities {
    fn description(&self) -> &str {
        "Building blocks for nested commands."
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new(
                "echo",
                "<text>\nReturns <text>. $nick, $channel and $botnick are replaced with the caller's nick, the current channel and the bot's nick.",
            )
            .args(vec![Conv::Text]),
            CommandSpec::new("success", "[<text>]\nReplies with the success message, followed by <text> if given.")
                .args(vec![Conv::Rest]),
            CommandSpec::new("last", "<text> [<text> ...]\nReturns the last argument given.")
                .args(vec![Conv::many(Conv::Something)]),
            CommandSpec::new("ignore", "<text>\nDoes nothing. Useful to run a nested command without a reply.")
                .args(vec![Conv::Rest]),
        ]
    }

    fn call(&mut self, command: &str, inv: &mut Invocation<'_>, args: Vec<Arg>) -> Result<(), CommandError> {
        match command {
            "echo" => {
                let text = substitute(&args[0].to_string(), inv);
                inv.reply(text);
            }
            "success" => {
                let extra = args[0].to_string();
                inv.reply_success((!extra.is_empty()).then_some(extra.as_str()));
            }
            "last" => {
                let last = args[0].list().last().map(ToString::to_string).unwrap_or_default();
                inv.reply(last);
            }
            "ignore" => {}
            other => return Err(CommandError::InvalidCommand(other.to_string())),
        }
        Ok(())
    }
}

fn substitute(text: &str, inv: &Invocation<'_>) -> String {
    text.replace("$nick", inv.nick())
        .replace("$channel", inv.channel().unwrap_or_default())
        .replace("$botnick", &inv.net.nick)
}

#[cfg(test)]
mod tests {
    use crate::plugins::testing::Bench;

    #[test]
    fn echo_substitutes_names() {
        let mut b = Bench::new();
        assert_eq!(b.texts(":alice!a@alice.host PRIVMSG #perch :perch: echo hello"), vec!["hello"]);
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: echo $nick in $channel with $botnick"),
            vec!["alice in #perch with perch"]
        );
    }

    #[test]
    fn success_last_and_ignore() {
        let mut b = Bench::new();
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: success"),
            vec!["The operation succeeded."]
        );
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: success and then some"),
            vec!["The operation succeeded. and then some"]
        );
        assert_eq!(b.texts(":alice!a@alice.host PRIVMSG #perch :perch: last a b c"), vec!["c"]);
        assert!(b.send(":alice!a@alice.host PRIVMSG #perch :perch: utilities ignore [echo hi]").is_empty());
    }
}
