//! Argument conversion.
//!
//! A command declares its arguments as a list of [`Conv`]s. Each one
//! consumes zero or more tokens from the front and appends one typed
//! [`Arg`]; wrappers (`Optional`, `Additional`, `Many`, `First`,
//! `Getopts`) combine them. Tokens left over at the end are an argument
//! error, which the dispatcher answers with the command's usage.

use std::collections::VecDeque;
use std::fmt;

use regex::Regex;

use super::CommandError;
use crate::context::Context;
use crate::db::{DbError, User};
use crate::ident::{self, banmask, is_user_hostmask};
use crate::plugin::CommandIndex;
use crate::state::NetworkState;

#[derive(Debug, Clone)]
pub enum Conv {
    /// One non-empty token.
    Something,
    /// All remaining tokens joined with spaces; at least one.
    Text,
    /// All remaining tokens joined with spaces; may be empty.
    Rest,
    Int,
    NonNegativeInt,
    PositiveInt,
    Float,
    Boolean,
    /// Seconds from now (with optional `s`/`m`/`h`/`d`/`w` suffix); 0 is
    /// "never". Yields [`Arg::Expiry`].
    Expiry,
    Nick,
    /// A channel token, or the channel the message was sent to.
    Channel,
    /// Like `Channel`, and the bot must be in it.
    InChannel,
    /// The caller's own registered user; consumes nothing.
    User,
    /// A registered user by name, or by the hostmask of a nick.
    OtherUser,
    /// A hostmask, or the hostmask of a known nick.
    Hostmask,
    /// A ban pattern, or the ban mask of a known nick.
    Banmask,
    Capability,
    /// A name some loaded plugin provides as a command.
    CommandName,
    /// A loaded plugin's name.
    Plugin,
    /// `/pattern/flags`, `m/pattern/flags` or a bare pattern.
    Regexp,
    /// `s/pattern/replacement/flags`.
    RegexpReplacer,
    /// Remaining text, checked against the server's TOPICLEN.
    Topic,
    /// One of a fixed set of words, case-insensitively.
    Literal(Vec<&'static str>),
    /// Try the inner converter; on failure consume nothing and push the default.
    Optional(Box<Conv>, Arg),
    /// Push the default when no tokens remain, else convert.
    Additional(Box<Conv>, Arg),
    /// One or more repetitions, collected into [`Arg::List`].
    Many(Box<Conv>),
    /// The first alternative that succeeds.
    First(Vec<Conv>),
    /// Leading `--name [value]` options, collected into [`Arg::Opts`].
    Getopts(Vec<(&'static str, Option<Conv>)>),
    /// Gate on a capability; consumes and pushes nothing.
    CheckCapability(&'static str),
    /// Gate on a capability in the channel converted so far (or the
    /// message's channel).
    CheckChannelCapability(&'static str),
}

impl Conv {
    pub fn optional(inner: Conv) -> Self {
        Conv::Optional(Box::new(inner), Arg::None)
    }

    pub fn additional(inner: Conv) -> Self {
        Conv::Additional(Box::new(inner), Arg::None)
    }

    pub fn additional_or(inner: Conv, default: Arg) -> Self {
        Conv::Additional(Box::new(inner), default)
    }

    pub fn many(inner: Conv) -> Self {
        Conv::Many(Box::new(inner))
    }
}

/// `s/pattern/replacement/flags`, applied once or globally.
#[derive(Debug, Clone)]
pub struct Replacer {
    pub regex: Regex,
    pub replacement: String,
    pub global: bool,
}

impl Replacer {
    pub fn apply(&self, text: &str) -> String {
        if self.global {
            self.regex.replace_all(text, self.replacement.as_str()).into_owned()
        } else {
            self.regex.replace(text, self.replacement.as_str()).into_owned()
        }
    }
}

#[derive(Debug, Clone)]
pub enum Arg {
    None,
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Channel(String),
    User(Box<User>),
    /// Absolute expiry time; `None` never expires.
    Expiry(Option<f64>),
    Regex(Regex),
    Replacer(Replacer),
    List(Vec<Arg>),
    Opts(Vec<(String, Option<Arg>)>),
}

impl Arg {
    pub fn str(&self) -> Option<&str> {
        match self {
            Arg::Str(s) | Arg::Channel(s) => Some(s),
            _ => None,
        }
    }

    pub fn int(&self) -> Option<i64> {
        match self {
            Arg::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn float(&self) -> Option<f64> {
        match self {
            Arg::Float(f) => Some(*f),
            Arg::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            Arg::User(u) => Some(u),
            _ => None,
        }
    }

    pub fn list(&self) -> &[Arg] {
        match self {
            Arg::List(items) => items,
            _ => &[],
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Arg::None)
    }

    /// Value of `--name` in an [`Arg::Opts`]: `Some(None)` for a flag.
    pub fn opt(&self, name: &str) -> Option<Option<&Arg>> {
        match self {
            Arg::Opts(opts) => opts
                .iter()
                .rev()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::None => Ok(()),
            Arg::Str(s) | Arg::Channel(s) => f.write_str(s),
            Arg::Int(i) => write!(f, "{i}"),
            Arg::Float(x) => write!(f, "{x}"),
            Arg::Bool(b) => write!(f, "{b}"),
            Arg::User(u) => f.write_str(&u.name),
            Arg::Expiry(Some(t)) => write!(f, "{t}"),
            Arg::Expiry(None) => f.write_str("never"),
            Arg::Regex(r) => f.write_str(r.as_str()),
            Arg::Replacer(r) => write!(f, "s/{}/{}/", r.regex.as_str(), r.replacement),
            Arg::List(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                f.write_str(&parts.join(" "))
            }
            Arg::Opts(_) => Ok(()),
        }
    }
}

/// What converters can see.
pub struct Env<'a> {
    pub ctx: &'a Context,
    pub net: &'a NetworkState,
    pub index: &'a CommandIndex,
    pub hostmask: &'a str,
    /// Channel the message was sent to.
    pub channel: Option<&'a str>,
}

struct State<'e, 'a> {
    env: &'e Env<'a>,
    tokens: VecDeque<String>,
    /// Most recent channel a converter produced.
    channel: Option<String>,
}

/// Convert `tokens` according to `specs`.
pub fn convert(specs: &[Conv], tokens: Vec<String>, env: &Env<'_>) -> Result<Vec<Arg>, CommandError> {
    let mut state = State { env, tokens: tokens.into(), channel: None };
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        out.push(state.convert(spec)?);
    }
    if !state.tokens.is_empty() {
        return Err(CommandError::Argument);
    }
    Ok(out)
}

fn invalid(what: &str, token: &str) -> CommandError {
    CommandError::Failed(format!("{} is not a valid {what}.", crate::format::quoted(token)))
}

impl State<'_, '_> {
    fn next(&mut self) -> Result<String, CommandError> {
        self.tokens.pop_front().ok_or(CommandError::Argument)
    }

    fn peek(&self) -> Option<&str> {
        self.tokens.front().map(String::as_str)
    }

    fn rest(&mut self) -> String {
        let all: Vec<String> = self.tokens.drain(..).collect();
        all.join(" ")
    }

    fn convert(&mut self, spec: &Conv) -> Result<Arg, CommandError> {
        let env = self.env;
        let network = Some(env.net.network.as_str());
        match spec {
            Conv::Something => {
                let token = self.next()?;
                if token.is_empty() {
                    return Err(CommandError::Argument);
                }
                Ok(Arg::Str(token))
            }
            Conv::Text => {
                if self.tokens.is_empty() {
                    return Err(CommandError::Argument);
                }
                Ok(Arg::Str(self.rest()))
            }
            Conv::Rest => Ok(Arg::Str(self.rest())),
            Conv::Int | Conv::NonNegativeInt | Conv::PositiveInt => {
                let token = self.next()?;
                let n: i64 = token.parse().map_err(|_| invalid("integer", &token))?;
                match spec {
                    Conv::NonNegativeInt if n < 0 => Err(invalid("non-negative integer", &token)),
                    Conv::PositiveInt if n <= 0 => Err(invalid("positive integer", &token)),
                    _ => Ok(Arg::Int(n)),
                }
            }
            Conv::Float => {
                let token = self.next()?;
                token
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Arg::Float)
                    .ok_or_else(|| invalid("floating point number", &token))
            }
            Conv::Boolean => {
                let token = self.next()?;
                match token.to_ascii_lowercase().as_str() {
                    "true" | "on" | "yes" | "enable" | "enabled" | "1" => Ok(Arg::Bool(true)),
                    "false" | "off" | "no" | "disable" | "disabled" | "0" => Ok(Arg::Bool(false)),
                    _ => Err(invalid("boolean", &token)),
                }
            }
            Conv::Expiry => {
                let token = self.next()?;
                let secs = parse_duration(&token).ok_or_else(|| invalid("duration", &token))?;
                if secs == 0 {
                    Ok(Arg::Expiry(None))
                } else {
                    Ok(Arg::Expiry(Some(env.ctx.now() + secs as f64)))
                }
            }
            Conv::Nick => {
                let token = self.next()?;
                let strict = env.ctx.registry.bool("protocols.irc.strictRfc", network, None);
                if ident::is_nick(&token, strict, env.net.isupport.nicklen) {
                    Ok(Arg::Str(token))
                } else {
                    Err(invalid("nick", &token))
                }
            }
            Conv::Channel | Conv::InChannel => {
                let explicit = self.peek().is_some_and(|t| env.net.is_channel(t));
                let channel = match (explicit, env.channel) {
                    (true, _) => self.next()?,
                    (false, Some(chan)) => chan.to_string(),
                    (false, None) => {
                        return Err(CommandError::Failed(
                            "This command may only be given in a channel that I am in.".into(),
                        ));
                    }
                };
                if matches!(spec, Conv::InChannel) && !env.net.channels.contains_key(&channel) {
                    return Err(CommandError::Failed(format!("I'm not in {channel}.")));
                }
                self.channel = Some(channel.clone());
                Ok(Arg::Channel(channel))
            }
            Conv::User => match env.ctx.users.get_user(env.hostmask) {
                Ok(user) => Ok(Arg::User(Box::new(user))),
                Err(DbError::NoSuchUser(_)) => Err(CommandError::Failed(
                    env.ctx.registry.string("replies.notRegistered", network, None),
                )),
                Err(e) => Err(e.into()),
            },
            Conv::OtherUser => {
                let token = self.next()?;
                let by_nick = env.net.hostmask_of(&token);
                let found = env
                    .ctx
                    .users
                    .get_user(&token)
                    .or_else(|e| by_nick.as_deref().map_or(Err(e), |mask| env.ctx.users.get_user(mask)));
                match found {
                    Ok(user) => Ok(Arg::User(Box::new(user))),
                    Err(DbError::NoSuchUser(_)) => Err(CommandError::Failed(format!(
                        "I can't find {token} in my user database."
                    ))),
                    Err(e) => Err(e.into()),
                }
            }
            Conv::Hostmask => {
                let token = self.next()?;
                if is_user_hostmask(&token) {
                    return Ok(Arg::Str(token));
                }
                env.net
                    .hostmask_of(&token)
                    .map(Arg::Str)
                    .ok_or_else(|| CommandError::Failed(format!("I haven't seen {token}.")))
            }
            Conv::Banmask => {
                let token = self.next()?;
                if token.contains('!') || token.contains('@') || token.starts_with('$') {
                    return Ok(Arg::Str(token));
                }
                env.net
                    .hostmask_of(&token)
                    .map(|mask| Arg::Str(banmask(&mask)))
                    .ok_or_else(|| CommandError::Failed(format!("I haven't seen {token}.")))
            }
            Conv::Capability => {
                let token = self.next()?;
                if token.is_empty() || token.contains(char::is_whitespace) {
                    return Err(invalid("capability", &token));
                }
                Ok(Arg::Str(token))
            }
            Conv::CommandName => {
                let token = self.next()?.to_lowercase();
                if env.index.has_command(&token) {
                    Ok(Arg::Str(token))
                } else {
                    Err(invalid("command", &token))
                }
            }
            Conv::Plugin => {
                let token = self.next()?;
                env.index
                    .plugin(&token)
                    .map(|p| Arg::Str(p.name.clone()))
                    .ok_or_else(|| CommandError::Failed(format!("There is no plugin named {token} loaded.")))
            }
            Conv::Regexp => {
                let token = self.next()?;
                parse_regexp(&token).map(Arg::Regex).ok_or_else(|| invalid("regular expression", &token))
            }
            Conv::RegexpReplacer => {
                let token = self.next()?;
                parse_replacer(&token)
                    .map(Arg::Replacer)
                    .ok_or_else(|| invalid("regular expression replacer", &token))
            }
            Conv::Topic => {
                if self.tokens.is_empty() {
                    return Err(CommandError::Argument);
                }
                let topic = self.rest();
                if let Some(max) = env.net.isupport.topiclen
                    && topic.len() > max
                {
                    return Err(CommandError::Failed(format!(
                        "That topic is too long for this server (maximum length: {max}; this topic: {}).",
                        topic.len()
                    )));
                }
                Ok(Arg::Str(topic))
            }
            Conv::Literal(words) => {
                let token = self.next()?;
                let lower = token.to_lowercase();
                words
                    .iter()
                    .find(|w| **w == lower)
                    .map(|w| Arg::Str(w.to_string()))
                    .ok_or_else(|| {
                        CommandError::Failed(format!(
                            "{} is not one of {}.",
                            crate::format::quoted(&token),
                            words.join(", ")
                        ))
                    })
            }
            Conv::Optional(inner, default) => {
                let saved = (self.tokens.clone(), self.channel.clone());
                match self.convert(inner) {
                    Ok(arg) => Ok(arg),
                    Err(CommandError::Argument | CommandError::Failed(_)) => {
                        (self.tokens, self.channel) = saved;
                        Ok(default.clone())
                    }
                    Err(e) => Err(e),
                }
            }
            Conv::Additional(inner, default) => {
                if self.tokens.is_empty() {
                    Ok(default.clone())
                } else {
                    self.convert(inner)
                }
            }
            Conv::Many(inner) => {
                let mut items = vec![self.convert(inner)?];
                while !self.tokens.is_empty() {
                    let saved = self.tokens.clone();
                    match self.convert(inner) {
                        Ok(arg) => items.push(arg),
                        Err(CommandError::Argument | CommandError::Failed(_)) => {
                            self.tokens = saved;
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(Arg::List(items))
            }
            Conv::First(alternatives) => {
                let mut last = CommandError::Argument;
                for alt in alternatives {
                    let saved = self.tokens.clone();
                    match self.convert(alt) {
                        Ok(arg) => return Ok(arg),
                        Err(e @ (CommandError::Argument | CommandError::Failed(_))) => {
                            self.tokens = saved;
                            last = e;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(last)
            }
            Conv::Getopts(options) => {
                let mut found = Vec::new();
                loop {
                    let Some(name) = self.peek().and_then(|t| t.strip_prefix("--")).map(str::to_lowercase) else {
                        break;
                    };
                    if name.is_empty() {
                        self.next()?;
                        break;
                    }
                    let Some((_, value_conv)) = options.iter().find(|(o, _)| *o == name) else {
                        return Err(CommandError::Argument);
                    };
                    self.next()?;
                    let value = match value_conv {
                        Some(conv) => Some(self.convert(conv)?),
                        None => None,
                    };
                    found.push((name, value));
                }
                Ok(Arg::Opts(found))
            }
            Conv::CheckCapability(cap) => {
                if env.ctx.check_capability(env.hostmask, cap) {
                    Ok(Arg::None)
                } else {
                    Err(CommandError::Capability(cap.to_string()))
                }
            }
            Conv::CheckChannelCapability(cap) => {
                let channel = self
                    .channel
                    .clone()
                    .or_else(|| env.channel.map(str::to_string))
                    .ok_or(CommandError::Argument)?;
                let full = ident::make_channel_capability(&channel, cap);
                if env.ctx.check_capability(env.hostmask, &full) {
                    Ok(Arg::None)
                } else {
                    Err(CommandError::Capability(full))
                }
            }
        }
    }
}

/// `90`, `90s`, `15m`, `2h`, `1d`, `1w`.
pub fn parse_duration(token: &str) -> Option<u64> {
    let (digits, unit) = match token.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((i, _)) => token.split_at(i),
        None => (token, ""),
    };
    let n: u64 = digits.parse().ok()?;
    let scale = match unit.to_ascii_lowercase().as_str() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        "w" => 7 * 86_400,
        _ => return None,
    };
    n.checked_mul(scale)
}

fn regex_with_flags(pattern: &str, flags: &str) -> Option<Regex> {
    let mut inline = String::new();
    for flag in flags.chars() {
        match flag {
            'i' | 'm' | 's' | 'x' => inline.push(flag),
            'g' => {}
            _ => return None,
        }
    }
    let full = if inline.is_empty() { pattern.to_string() } else { format!("(?{inline}){pattern}") };
    Regex::new(&full).ok()
}

/// Split `a<d>b<d>...` on unescaped delimiters.
fn split_delimited(body: &str, delimiter: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(d) if d == delimiter => current.push(d),
                Some(other) => {
                    current.push('\\');
                    current.push(other);
                }
                None => current.push('\\'),
            },
            c if c == delimiter => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

pub fn parse_regexp(token: &str) -> Option<Regex> {
    let delimited = match token.strip_prefix('m') {
        Some(body) if body.starts_with(|c: char| !c.is_alphanumeric() && !c.is_whitespace()) => Some(body),
        _ => token.starts_with('/').then_some(token),
    };
    let Some(body) = delimited else {
        return Regex::new(token).ok();
    };
    let delimiter = body.chars().next()?;
    match split_delimited(&body[delimiter.len_utf8()..], delimiter).as_slice() {
        [pattern, flags] => regex_with_flags(pattern, flags),
        _ => None,
    }
}

pub fn parse_replacer(token: &str) -> Option<Replacer> {
    let body = token.strip_prefix('s')?;
    let delimiter = body.chars().next().filter(|c| !c.is_alphanumeric() && *c != ' ')?;
    let parts = split_delimited(&body[delimiter.len_utf8()..], delimiter);
    let [pattern, replacement, flags] = parts.as_slice() else {
        return None;
    };
    let regex = regex_with_flags(pattern, flags)?;
    Some(Replacer {
        regex,
        replacement: backrefs(replacement),
        global: flags.contains('g'),
    })
}

/// `\1` → `${1}`; a literal `$` is escaped.
fn backrefs(replacement: &str) -> String {
    let mut out = String::new();
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek().is_some_and(char::is_ascii_digit) => {
                let mut n = String::new();
                while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    n.push(*d);
                    chars.next();
                }
                out.push_str(&format!("${{{n}}}"));
            }
            '$' => out.push_str("$$"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::Clock;
    use crate::config::Registry;

    struct Fixture {
        ctx: Context,
        net: NetworkState,
        index: CommandIndex,
    }

    impl Fixture {
        fn new() -> Self {
            let ctx = Context::in_memory(Arc::new(Registry::with_core()), Clock::manual(1000.0));
            let mut net = NetworkState::new("testnet", "perch", 10);
            for line in [
                ":perch!p@bot JOIN #perch",
                ":alice!a@alice.host JOIN #perch",
                ":srv 005 perch TOPICLEN=20 :are supported",
            ] {
                net.feed(&crate::message::Message::parse(line).unwrap());
            }
            Self { ctx, net, index: CommandIndex::default() }
        }

        fn run(&self, specs: &[Conv], line: &str, channel: Option<&str>) -> Result<Vec<Arg>, CommandError> {
            let env = Env {
                ctx: &self.ctx,
                net: &self.net,
                index: &self.index,
                hostmask: "alice!a@alice.host",
                channel,
            };
            let tokens = line.split_whitespace().map(str::to_string).collect();
            convert(specs, tokens, &env)
        }
    }

    #[test]
    fn channel_defaults_to_the_current_one() {
        let f = Fixture::new();
        let args = f.run(&[Conv::Channel, Conv::Nick], "bob", Some("#perch")).unwrap();
        assert_eq!(args[0].str(), Some("#perch"));
        let args = f.run(&[Conv::Channel, Conv::Nick], "#other bob", Some("#perch")).unwrap();
        assert_eq!(args[0].str(), Some("#other"));
        assert!(matches!(f.run(&[Conv::Channel], "", None), Err(CommandError::Failed(_))));
        assert!(matches!(f.run(&[Conv::InChannel], "#other", None), Err(CommandError::Failed(_))));
    }

    #[test]
    fn missing_and_leftover_tokens_are_argument_errors() {
        let f = Fixture::new();
        assert!(matches!(f.run(&[Conv::Int], "", None), Err(CommandError::Argument)));
        assert!(matches!(f.run(&[Conv::Int], "1 2", None), Err(CommandError::Argument)));
        assert!(matches!(f.run(&[Conv::PositiveInt], "0", None), Err(CommandError::Failed(_))));
        let args = f.run(&[Conv::Int, Conv::Text], "3 the rest here", None).unwrap();
        assert_eq!(args[0].int(), Some(3));
        assert_eq!(args[1].str(), Some("the rest here"));
    }

    #[test]
    fn wrappers() {
        let f = Fixture::new();
        let args = f
            .run(&[Conv::optional(Conv::Int), Conv::Something], "word", None)
            .unwrap();
        assert!(args[0].is_none());
        let args = f
            .run(&[Conv::Something, Conv::additional_or(Conv::Int, Arg::Int(7))], "x", None)
            .unwrap();
        assert_eq!(args[1].int(), Some(7));
        let args = f.run(&[Conv::many(Conv::Int), Conv::Rest], "1 2 3 go", None).unwrap();
        assert_eq!(args[0].list().len(), 3);
        assert_eq!(args[1].str(), Some("go"));
        let args = f
            .run(&[Conv::First(vec![Conv::Int, Conv::Boolean])], "on", None)
            .unwrap();
        assert_eq!(args[0].bool(), Some(true));
    }

    #[test]
    fn getopts_collects_leading_options() {
        let f = Fixture::new();
        let specs = [
            Conv::Getopts(vec![("exact", None), ("limit", Some(Conv::PositiveInt))]),
            Conv::Text,
        ];
        let args = f.run(&specs, "--limit 5 --exact foo bar", None).unwrap();
        assert_eq!(args[0].opt("limit").flatten().and_then(Arg::int), Some(5));
        assert_eq!(args[0].opt("exact"), Some(None));
        assert_eq!(args[0].opt("other"), None);
        assert_eq!(args[1].str(), Some("foo bar"));
        assert!(matches!(f.run(&specs, "--bogus x", None), Err(CommandError::Argument)));
    }

    #[test]
    fn hostmasks_come_from_state() {
        let f = Fixture::new();
        let args = f.run(&[Conv::Hostmask], "alice", None).unwrap();
        assert_eq!(args[0].str(), Some("alice!a@alice.host"));
        let args = f.run(&[Conv::Banmask], "alice", None).unwrap();
        assert_eq!(args[0].str(), Some("*!*@alice.host"));
        assert!(f.run(&[Conv::Hostmask], "ghost", None).is_err());
    }

    #[test]
    fn capability_gates() {
        let f = Fixture::new();
        assert!(matches!(
            f.run(&[Conv::CheckCapability("admin")], "", None),
            Err(CommandError::Capability(c)) if c == "admin"
        ));
        assert!(matches!(
            f.run(&[Conv::Channel, Conv::CheckChannelCapability("op")], "#perch", None),
            Err(CommandError::Capability(c)) if c == "#perch,op"
        ));
        // Capability errors are not swallowed by Optional.
        assert!(f.run(&[Conv::optional(Conv::CheckCapability("owner"))], "", None).is_err());
    }

    #[test]
    fn users_and_topics() {
        let f = Fixture::new();
        assert!(matches!(f.run(&[Conv::User], "", None), Err(CommandError::Failed(_))));
        let u = f.ctx.users.create_user("alice").unwrap();
        f.ctx.users.update(u.id, |u| u.add_hostmask("*!a@alice.host")).unwrap();
        let args = f.run(&[Conv::User], "", None).unwrap();
        assert_eq!(args[0].user().map(|u| u.name.as_str()), Some("alice"));
        let args = f.run(&[Conv::OtherUser], "alice", None).unwrap();
        assert_eq!(args[0].to_string(), "alice");
        assert!(f.run(&[Conv::Topic], "short topic", None).is_ok());
        assert!(f.run(&[Conv::Topic], "this topic is far too long", None).is_err());
    }

    #[test]
    fn expiry_and_durations() {
        let f = Fixture::new();
        let args = f.run(&[Conv::Expiry], "2m", None).unwrap();
        assert!(matches!(args[0], Arg::Expiry(Some(t)) if t == 1120.0));
        let args = f.run(&[Conv::Expiry], "0", None).unwrap();
        assert!(matches!(args[0], Arg::Expiry(None)));
        assert_eq!(parse_duration("1w"), Some(604_800));
        assert_eq!(parse_duration("5x"), None);
    }

    #[test]
    fn regexps_and_replacers() {
        let re = parse_regexp("/HeLLo/i").unwrap();
        assert!(re.is_match("say hello"));
        assert!(parse_regexp("m{a+}").is_none());
        assert!(parse_regexp("m|a+|").unwrap().is_match("aaa"));
        assert!(parse_regexp("plain.*").unwrap().is_match("plain text"));
        let r = parse_replacer("s/(\\w+) (\\w+)/\\2 \\1/").unwrap();
        assert_eq!(r.apply("hello world again"), "world hello again");
        let r = parse_replacer("s/o/0/g").unwrap();
        assert_eq!(r.apply("foo boo"), "f00 b00");
        let r = parse_replacer("s/a\\/b/c/").unwrap();
        assert_eq!(r.apply("a/b"), "c");
        assert!(parse_replacer("s/only/").is_none());
    }
}
