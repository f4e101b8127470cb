//! Accounts in the user database: registering, identifying and the
//! hostmasks that recognize you.

use perch_core::db::DbError;
use perch_core::dispatch::CommandError;
use perch_core::dispatch::converter::{Arg, Conv};
use perch_core::format::comma_and_list;
use perch_core::plugin::{CommandSpec, Invocation, Plugin};

pub struct User;

fn private_only(inv: &Invocation<'_>) -> Result<(), CommandError> {
    if inv.channel().is_some() {
        return Err(CommandError::Failed("That operation cannot be done in a channel.".into()));
    }
    Ok(())
}

impl Plugin for User {
    fn description(&self) -> &str {
        "Registering with the bot and proving who you are."
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("register", "<name> <password>\nCreates the user <name> and identifies you as it.")
                .args(vec![Conv::Something, Conv::Something]),
            CommandSpec::new("identify", "<name> <password>\nIdentifies you as <name> until you leave.")
                .args(vec![Conv::Something, Conv::Something]),
            CommandSpec::new("unidentify", "\nForgets every identification of your user.")
                .args(vec![Conv::User]),
            CommandSpec::new("whoami", "\nThe user the bot thinks you are."),
            CommandSpec::new(
                "hostmask",
                "add|remove|list [<hostmask>]\nManages the hostmasks that recognize you without a password; defaults to your current hostmask.",
            )
            .args(vec![
                Conv::User,
                Conv::Literal(vec!["add", "remove", "list"]),
                Conv::additional(Conv::Something),
            ]),
            CommandSpec::new("capabilities", "[<user>]\nThe capabilities of <user>, or yours.")
                .args(vec![Conv::First(vec![Conv::OtherUser, Conv::User])]),
            CommandSpec::new(
                "set",
                "password <old> <new> | secure <true|false>\nChanges your password, or whether you are only recognized after identifying.",
            )
            .args(vec![Conv::User, Conv::Literal(vec!["password", "secure"]), Conv::Text]),
        ]
    }

    fn call(&mut self, command: &str, inv: &mut Invocation<'_>, args: Vec<Arg>) -> Result<(), CommandError> {
        let ctx = inv.ctx;
        match command {
            "register" => {
                private_only(inv)?;
                let (name, password) = (args[0].to_string(), args[1].to_string());
                if ctx.users.get_user(inv.hostmask()).is_ok() {
                    return Err(CommandError::Failed(
                        "You are already registered; unidentify first to register a new user.".into(),
                    ));
                }
                let user = ctx.users.create_user(&name).map_err(|e| match e {
                    DbError::DuplicateName(_) => CommandError::Failed("That name is already taken.".into()),
                    e => e.into(),
                })?;
                ctx.users.update(user.id, |u| u.set_password(&password))?;
                ctx.users.add_auth(user.id, inv.hostmask())?;
                inv.reply_success(None);
            }
            "identify" => {
                private_only(inv)?;
                let name = args[0].to_string();
                match ctx.users.identify(&name, &args[1].to_string(), inv.hostmask()) {
                    Ok(_) => inv.reply_success(None),
                    Err(DbError::PasswordMismatch | DbError::NoSuchUser(_)) => {
                        tracing::info!(user = %name, hostmask = %inv.hostmask(), "Failed identification");
                        return Err(CommandError::Failed("Your password is wrong.".into()));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            "unidentify" => {
                let Some(user) = args[0].user() else {
                    return Err(CommandError::Argument);
                };
                ctx.users.clear_auth(user.id)?;
                inv.reply_success(Some(
                    "If you remain recognized after this, it is because of a hostmask on your user.",
                ));
            }
            "whoami" => match ctx.users.get_user(inv.hostmask()) {
                Ok(user) => inv.reply(user.name),
                Err(DbError::NoSuchUser(_)) => inv.reply("I don't recognize you."),
                Err(e) => return Err(e.into()),
            },
            "hostmask" => {
                let Some(user) = args[0].user() else {
                    return Err(CommandError::Argument);
                };
                let mask = args[2].str().unwrap_or(inv.hostmask()).to_string();
                match args[1].str() {
                    Some("list") => {
                        if user.hostmasks.is_empty() {
                            inv.reply("You have no hostmasks.");
                        } else {
                            inv.reply(comma_and_list(&user.hostmasks));
                        }
                    }
                    Some("add") => {
                        if !perch_core::ident::is_user_hostmask(&mask) {
                            return Err(CommandError::Failed(format!("{mask} is not a valid hostmask.")));
                        }
                        if !ctx.users.update(user.id, |u| u.add_hostmask(&mask))? {
                            return Err(CommandError::Failed("That hostmask is already registered.".into()));
                        }
                        inv.reply_success(None);
                    }
                    _ => {
                        if !ctx.users.update(user.id, |u| u.remove_hostmask(&mask))? {
                            return Err(CommandError::Failed(format!("{mask} isn't one of your hostmasks.")));
                        }
                        inv.reply_success(None);
                    }
                }
            }
            "capabilities" => {
                let Some(user) = args[0].user() else {
                    return Err(CommandError::Argument);
                };
                let caps: Vec<&str> = user.capabilities.iter().map(String::as_str).collect();
                inv.reply(format!("[{}]", caps.join(", ")));
            }
            "set" => {
                let Some(user) = args[0].user() else {
                    return Err(CommandError::Argument);
                };
                let id = user.id;
                let value = args[2].to_string();
                if args[1].str() == Some("password") {
                    private_only(inv)?;
                    let Some((old, new)) = value.split_once(' ') else {
                        return Err(CommandError::Argument);
                    };
                    if !user.check_password(old) {
                        return Err(CommandError::Failed("Your password is wrong.".into()));
                    }
                    ctx.users.update(id, |u| u.set_password(new.trim()))?;
                } else {
                    let secure = match value.to_ascii_lowercase().as_str() {
                        "true" | "on" | "yes" => true,
                        "false" | "off" | "no" => false,
                        _ => return Err(CommandError::Argument),
                    };
                    ctx.users.update(id, |u| u.secure = secure)?;
                }
                inv.reply_success(None);
            }
            other => return Err(CommandError::InvalidCommand(other.to_string())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::plugins::testing::Bench;

    #[test]
    fn register_only_in_private() {
        let mut b = Bench::new();
        let texts = b.texts(":carol!c@carol.host PRIVMSG #perch :perch: register carol pw");
        assert_eq!(texts, vec!["Error: That operation cannot be done in a channel."]);
        assert_eq!(
            b.texts(":carol!c@carol.host PRIVMSG perch :register carol pw"),
            vec!["The operation succeeded."]
        );
        assert_eq!(b.texts(":carol!c@carol.host PRIVMSG perch :whoami"), vec!["carol"]);
        let texts = b.texts(":dave!d@dave.host PRIVMSG perch :register carol other");
        assert_eq!(texts, vec!["Error: That name is already taken."]);
    }

    #[test]
    fn identify_checks_the_password() {
        let mut b = Bench::new();
        b.send(":carol!c@carol.host PRIVMSG perch :register carol pw");
        assert_eq!(b.texts(":carol!c@elsewhere PRIVMSG perch :whoami"), vec!["I don't recognize you."]);
        let texts = b.texts(":carol!c@elsewhere PRIVMSG perch :identify carol nope");
        assert_eq!(texts, vec!["Error: Your password is wrong."]);
        assert_eq!(
            b.texts(":carol!c@elsewhere PRIVMSG perch :identify carol pw"),
            vec!["The operation succeeded."]
        );
        assert_eq!(b.texts(":carol!c@elsewhere PRIVMSG perch :whoami"), vec!["carol"]);
        b.send(":carol!c@elsewhere PRIVMSG perch :unidentify");
        assert_eq!(b.texts(":carol!c@elsewhere PRIVMSG perch :whoami"), vec!["I don't recognize you."]);
    }

    #[test]
    fn hostmasks_recognize_without_identifying() {
        let mut b = Bench::new();
        b.send(":carol!c@carol.host PRIVMSG perch :register carol pw");
        assert_eq!(
            b.texts(":carol!c@carol.host PRIVMSG perch :hostmask add carol!*@*.host"),
            vec!["The operation succeeded."]
        );
        assert_eq!(b.texts(":carol!c@carol.host PRIVMSG perch :hostmask list"), vec!["carol!*@*.host"]);
        b.send(":carol!c@carol.host PRIVMSG perch :unidentify");
        assert_eq!(b.texts(":carol!x@other.host PRIVMSG perch :whoami"), vec!["carol"]);

        b.send(":carol!c@carol.host PRIVMSG perch :set secure on");
        assert_eq!(b.texts(":carol!x@other.host PRIVMSG perch :whoami"), vec!["I don't recognize you."]);
    }

    #[test]
    fn capabilities_and_password_changes() {
        let mut b = Bench::new();
        b.user("alice", "alice!*@alice.host", &["admin", "-trusted"]);
        assert_eq!(
            b.texts(":alice!a@alice.host PRIVMSG #perch :perch: capabilities"),
            vec!["[-trusted, admin]"]
        );
        let texts = b.texts(":bob!b@bob.host PRIVMSG #perch :perch: capabilities");
        assert_eq!(texts, vec!["Error: You must be registered to use this command."]);

        b.send(":carol!c@carol.host PRIVMSG perch :register carol pw");
        let texts = b.texts(":carol!c@carol.host PRIVMSG perch :set password wrong new");
        assert_eq!(texts, vec!["Error: Your password is wrong."]);
        b.send(":carol!c@carol.host PRIVMSG perch :set password pw new");
        assert!(b.ctx().users.get_user("carol").unwrap().check_password("new"));
    }
}
