//! perch-wizard: ask a few questions and write a first configuration,
//! with an owner account so the bot can be managed from IRC.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use perch_core::config::Scope;
use perch_core::context::directory;
use perch_core::{Clock, Context, Registry};

#[derive(Parser)]
#[command(name = "perch-wizard", about = "Create a perch configuration")]
struct Args {
    /// Where to write the configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overwrite an existing configuration
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Clone)]
struct Directories {
    data: String,
    backup: String,
    log: String,
    conf: String,
    plugins: Vec<String>,
}

#[derive(Debug, Clone)]
struct Answers {
    nick: String,
    ident: String,
    realname: String,
    language: String,
    network: String,
    server: String,
    tls: bool,
    server_password: Option<String>,
    /// SASL account and password.
    sasl: Option<(String, String)>,
    channels: Vec<(String, Option<String>)>,
    prefix_chars: String,
    dirs: Directories,
    plugins: Vec<String>,
    owner: String,
    password: String,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("perch")
        .join("perch.conf")
}

fn ask<R: BufRead, W: Write>(input: &mut R, out: &mut W, question: &str, default: &str) -> Result<String> {
    if default.is_empty() {
        write!(out, "{question}: ")?;
    } else {
        write!(out, "{question} [{default}]: ")?;
    }
    out.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        bail!("input ended before setup was complete");
    }
    let answer = line.trim();
    Ok(if answer.is_empty() { default.to_string() } else { answer.to_string() })
}

fn ask_required<R: BufRead, W: Write>(input: &mut R, out: &mut W, question: &str) -> Result<String> {
    loop {
        let answer = ask(input, out, question, "")?;
        if !answer.is_empty() {
            return Ok(answer);
        }
        writeln!(out, "An answer is required.")?;
    }
}

fn ask_yes<R: BufRead, W: Write>(input: &mut R, out: &mut W, question: &str, default: bool) -> Result<bool> {
    let answer = ask(input, out, &format!("{question} (yes/no)"), if default { "yes" } else { "no" })?;
    Ok(answer.to_lowercase().starts_with('y'))
}

fn optional(answer: String) -> Option<String> {
    (!answer.is_empty()).then_some(answer)
}

/// `#chan` or `#chan:key` entries.
fn parse_channels(line: &str) -> Result<Vec<(String, Option<String>)>> {
    line.split_whitespace()
        .map(|entry| {
            let (name, key) = match entry.split_once(':') {
                Some((name, key)) => (name, optional(key.to_string())),
                None => (entry, None),
            };
            if !name.starts_with(['#', '&', '!', '+']) || name.len() < 2 {
                bail!("{name:?} is not a channel name");
            }
            Ok((name.to_string(), key))
        })
        .collect()
}

fn interview<R: BufRead, W: Write>(input: &mut R, out: &mut W) -> Result<Answers> {
    writeln!(out, "Setting up perch. Press enter to accept the [default].")?;
    let nick = ask(input, out, "Bot nick", "perch")?;
    let ident = ask(input, out, "Ident (username)", "perch")?;
    let realname = ask(input, out, "Full name", "perch IRC bot")?;
    let language = ask(input, out, "Language", "en")?;

    let network = ask(input, out, "Network name", "libera")?.to_lowercase();
    if network.contains(|c: char| c == '.' || c.is_whitespace()) {
        bail!("network names may not contain dots or spaces");
    }
    let tls = ask_yes(input, out, "Connect with TLS?", true)?;
    let default_server = if tls { "irc.libera.chat:6697" } else { "irc.libera.chat:6667" };
    let server = ask(input, out, "Server (host:port)", default_server)?;
    let server_password = optional(ask(input, out, "Server password (blank for none)", "")?);
    let sasl = match optional(ask(input, out, "SASL account (blank for none)", "")?) {
        Some(account) => Some((account, ask_required(input, out, "SASL password")?)),
        None => None,
    };
    let channels = parse_channels(&ask(input, out, "Channels to join (space separated, #chan:key for keyed)", "")?)?;
    let prefix_chars = ask(input, out, "Command prefix characters (blank to answer only to the nick)", "")?;

    let dirs = Directories {
        data: ask(input, out, "Data directory", "data")?,
        backup: ask(input, out, "Backup directory", "backup")?,
        log: ask(input, out, "Log directory", "logs")?,
        conf: ask(input, out, "Plugin configuration directory", "conf")?,
        plugins: ask(input, out, "Extra plugin directories (space separated)", "")?
            .split_whitespace()
            .map(str::to_string)
            .collect(),
    };

    let plugins = if ask_yes(input, out, "Load every built-in plugin?", true)? {
        perch_bot::DEFAULT_PLUGINS.iter().map(|p| p.to_string()).collect()
    } else {
        let mut chosen = Vec::new();
        for plugin in perch_bot::DEFAULT_PLUGINS {
            if ask_yes(input, out, &format!("Load {plugin}?"), true)? {
                chosen.push(plugin.to_string());
            }
        }
        chosen
    };

    let owner = ask_required(input, out, "Owner user name")?;
    let password = ask_required(input, out, "Owner password")?;
    Ok(Answers {
        nick,
        ident,
        realname,
        language,
        network,
        server,
        tls,
        server_password,
        sasl,
        channels,
        prefix_chars,
        dirs,
        plugins,
        owner,
        password,
    })
}

fn yes_no(b: bool) -> &'static str {
    if b { "True" } else { "False" }
}

/// Write `answers` to `path`, plus a users database with the owner.
fn write_config(answers: &Answers, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let registry = Registry::with_core();
    let global = Scope::global();
    let net = &answers.network;
    let key = |suffix: &str| format!("networks.{net}.{suffix}");

    registry.set("nick", &global, &answers.nick)?;
    registry.set("ident", &global, &answers.ident)?;
    registry.set("user", &global, &answers.realname)?;
    registry.set("language", &global, &answers.language)?;
    registry.set("networks", &global, net)?;
    registry.set(&key("servers"), &global, &answers.server)?;
    registry.set(&key("ssl"), &global, yes_no(answers.tls))?;
    if let Some(password) = &answers.server_password {
        registry.set(&key("password"), &global, password)?;
    }
    if let Some((account, password)) = &answers.sasl {
        registry.set(&key("sasl.username"), &global, account)?;
        registry.set(&key("sasl.password"), &global, password)?;
    }
    let names: Vec<&str> = answers.channels.iter().map(|(name, _)| name.as_str()).collect();
    registry.set(&key("channels"), &global, &names.join(" "))?;
    for (name, channel_key) in &answers.channels {
        if let Some(k) = channel_key {
            registry.set(&key("channels.key"), &Scope::channel(name), k)?;
        }
    }
    registry.set("replies.whenAddressedBy.chars", &global, &answers.prefix_chars)?;

    let dirs = &answers.dirs;
    registry.set("directories.data", &global, &dirs.data)?;
    registry.set("directories.data.tmp", &global, &format!("{}/tmp", dirs.data))?;
    registry.set("directories.backup", &global, &dirs.backup)?;
    registry.set("directories.log", &global, &dirs.log)?;
    registry.set("directories.conf", &global, &dirs.conf)?;
    registry.set("directories.plugins", &global, &dirs.plugins.join(" "))?;

    for plugin in perch_bot::DEFAULT_PLUGINS {
        let load = answers.plugins.iter().any(|p| p == plugin);
        registry.set(&format!("plugins.{plugin}"), &global, yes_no(load))?;
    }
    perch_bot::apply_default_providers(&registry);
    registry.set_path(path);

    for dir in ["directories.log", "directories.conf"] {
        let dir = directory(&registry, dir);
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let ctx = Context::open(Arc::new(registry), Clock::system()).context("creating the data directory")?;
    let owner = ctx.users.create_user(&answers.owner)?;
    ctx.users.update(owner.id, |u| {
        u.set_password(&answers.password);
        u.add_capability("owner");
    })?;
    ctx.flush()?;
    ctx.save_config()?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let path = args.config.unwrap_or_else(default_config_path);
    if path.exists() && !args.force {
        bail!("{} already exists; pass --force to replace it", path.display());
    }

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut out = io::stdout();
    let answers = interview(&mut input, &mut out)?;
    write_config(&answers, &path)?;

    writeln!(out, "Wrote {}.", path.display())?;
    writeln!(out, "Start the bot with: perch {}", path.display())?;
    writeln!(
        out,
        "Then /msg {} identify {} <password> to manage it.",
        answers.nick, answers.owner
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answers_from(lines: &[&str]) -> Result<Answers> {
        let mut script = lines.join("\n");
        script.push('\n');
        let mut out = Vec::new();
        interview(&mut script.as_bytes(), &mut out)
    }

    /// Blank answers up to the channel question.
    const DEFAULT_CONNECTION: [&str; 9] = ["", "", "", "", "", "", "", "", ""];
    /// Blank answers for prefix chars, the five directories and the bulk plugin question.
    const DEFAULT_REST: [&str; 7] = ["", "", "", "", "", "", ""];

    #[test]
    fn defaults_fill_blank_answers() {
        let mut lines = DEFAULT_CONNECTION.to_vec();
        lines.push("#perch #test:sekrit");
        lines.extend(DEFAULT_REST);
        lines.extend(["root", "secret"]);
        let a = answers_from(&lines).unwrap();
        assert_eq!(a.nick, "perch");
        assert_eq!(a.ident, "perch");
        assert_eq!(a.network, "libera");
        assert!(a.tls);
        assert_eq!(a.server, "irc.libera.chat:6697");
        assert!(a.server_password.is_none() && a.sasl.is_none());
        assert_eq!(
            a.channels,
            vec![("#perch".to_string(), None), ("#test".to_string(), Some("sekrit".to_string()))]
        );
        assert_eq!(a.dirs.data, "data");
        assert_eq!(a.plugins.len(), perch_bot::DEFAULT_PLUGINS.len());
        assert_eq!(a.owner, "root");
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(answers_from(&["robin", "example"]).is_err());
        assert!(answers_from(&["robin", "", "", "", "my.net"]).is_err());
        let mut bad_channel = DEFAULT_CONNECTION.to_vec();
        bad_channel.push("perch");
        assert!(answers_from(&bad_channel).is_err());
    }

    #[test]
    fn plugins_can_be_picked_one_by_one() {
        let mut lines = DEFAULT_CONNECTION.to_vec();
        lines.push("");
        lines.extend(&DEFAULT_REST[..6]);
        // "no" to every plugin, then Admin, Channel, Misc, Owner, User, Utilities
        lines.extend(["no", "no", "no", "", "yes", "y", "no"]);
        lines.extend(["root", "secret"]);
        let a = answers_from(&lines).unwrap();
        assert_eq!(a.plugins, vec!["Misc", "Owner", "User"]);
    }

    #[test]
    fn written_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perch.conf");
        let answers = answers_from(&[
            "robin",
            "rob",
            "Robin Bot",
            "",
            "example",
            "no",
            "irc.example.org:6667",
            "",
            "robin",
            "saslpass",
            "#a #b:key",
            "!",
            "store",
            "",
            "",
            "",
            "",
            "",
            "root",
            "secret",
        ])
        .unwrap();
        write_config(&answers, &path).unwrap();

        let registry = Registry::with_core();
        registry.load_file(&path).unwrap();
        assert_eq!(registry.string("nick", None, None), "robin");
        assert_eq!(registry.string("replies.whenAddressedBy.chars", None, None), "!");
        assert!(registry.bool("plugins.Owner", None, None));
        assert_eq!(registry.string("commands.defaultPlugins.help", None, None), "Misc");
        let settings = perch_core::config::NetworkSettings::from_registry(&registry, "example").unwrap();
        assert_eq!(settings.servers[0].to_string(), "irc.example.org:6667");
        assert!(!settings.tls);
        assert_eq!(settings.ident, "rob");
        assert_eq!(settings.realname, "Robin Bot");
        assert_eq!(settings.sasl.as_ref().map(|s| s.username.as_str()), Some("robin"));
        assert!(settings.channels.contains(&("#b".to_string(), Some("key".to_string()))));
        assert!(dir.path().join("logs").is_dir());

        let ctx = Context::open(Arc::new(registry), Clock::manual(0.0)).unwrap();
        assert!(dir.path().join("store").join("users.conf").is_file());
        let owner = ctx.users.get_user("root").unwrap();
        assert!(owner.is_owner());
        assert!(owner.check_password("secret"));
    }
}
