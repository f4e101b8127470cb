//! Command dispatch.
//!
//! For every inbound message the dispatcher runs the plugins' message
//! hooks, then, when the bot is addressed, tokenizes the command line,
//! evaluates nested commands innermost first, resolves the command name
//! against the [`CommandIndex`], checks flood limits and capabilities,
//! converts arguments and calls the plugin. Errors never escape: they
//! become `Error: ...` replies.

pub mod address;
pub mod converter;
pub mod flood;
pub mod reply;
pub mod tokenizer;

use crate::config::Registry;
use crate::context::Context;
use crate::db::DbError;
use crate::format;
use crate::ident::{self, is_user_hostmask};
use crate::message::Message;
use crate::msgs;
use crate::plugin::{Action, CommandIndex, IndexEntry, Invocation, PluginError, SharedHost};
use crate::state::NetworkState;

use converter::Env;
use flood::{FloodControl, FloodKind, Punishment};
use reply::{MoreStore, Reply, ReplyOpts, ReplyTo};
use tokenizer::{Syntax, Token};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// A user-visible failure from a command.
    #[error("{0}")]
    Failed(String),
    /// Arguments did not convert; answered with the command's usage.
    #[error("invalid arguments")]
    Argument,
    /// Argument error with the usage text already resolved.
    #[error("{0}")]
    Usage(String),
    #[error("missing capability {0}")]
    Capability(String),
    #[error("You've attempted more nesting than is currently allowed on this bot.")]
    NestingTooDeep,
    #[error(
        "The command {command:?} is available in the {} plugins. Please specify the plugin whose command you wish to call by using its name as a command before {command:?}.",
        format::comma_and_list(candidates)
    )]
    AmbiguousCommand { command: String, candidates: Vec<String> },
    #[error("{0:?} is not a valid command.")]
    InvalidCommand(String),
    #[error("The command timed out.")]
    ProcessTimeout,
    /// The handler panicked; answered with `replies.genericError`.
    #[error("the command handler panicked")]
    Panicked,
    #[error("{0}")]
    Syntax(String),
    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<PluginError> for CommandError {
    fn from(e: PluginError) -> Self {
        CommandError::Failed(e.to_string())
    }
}

impl CommandError {
    /// The reply text, `Error: ` prefix included where one belongs.
    pub fn reply_text(&self, registry: &Registry, network: &str, channel: Option<&str>) -> String {
        match self {
            CommandError::Usage(usage) => usage.clone(),
            CommandError::Capability(cap) => {
                let template = registry.string("replies.noCapability", Some(network), channel);
                format!("Error: {}", template.replace("%s", cap))
            }
            CommandError::Panicked => {
                format!("Error: {}", registry.string("replies.genericError", Some(network), channel))
            }
            CommandError::Database(DbError::NoSuchUser(_)) => {
                format!("Error: {}", registry.string("replies.notRegistered", Some(network), channel))
            }
            other => format!("Error: {other}"),
        }
    }
}

/// What handling one message produced.
#[derive(Debug, Default)]
pub struct Outcome {
    pub messages: Vec<Message>,
    /// Host requests, with whoever caused them for error replies.
    pub actions: Vec<(Option<ReplyTo>, Action)>,
}

/// One addressed command line being evaluated.
struct Call<'a> {
    ctx: &'a Context,
    host: &'a SharedHost,
    net: &'a NetworkState,
    index: &'a CommandIndex,
    msg: &'a Message,
    to: &'a ReplyTo,
}

pub struct Dispatcher {
    flood: FloodControl,
    pub mores: MoreStore,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(ctx: &Context) -> Self {
        Self {
            flood: FloodControl::new(&ctx.registry),
            mores: MoreStore::new(),
        }
    }

    pub fn gc(&mut self, now: f64) {
        self.flood.gc(now);
    }

    pub fn render(&mut self, ctx: &Context, net: &NetworkState, to: &ReplyTo, reply: &Reply) -> Vec<Message> {
        reply::render(reply, to, &ctx.registry, net, &mut self.mores)
    }

    pub fn render_error(&mut self, ctx: &Context, net: &NetworkState, to: &ReplyTo, error: &CommandError) -> Vec<Message> {
        let text = error.reply_text(&ctx.registry, &net.network, to.channel.as_deref());
        let opts = if matches!(error, CommandError::Usage(_)) { ReplyOpts::default() } else { ReplyOpts::error() };
        self.render(ctx, net, to, &Reply::new(text, opts))
    }

    /// Handle one inbound message, already applied to `net`.
    pub fn handle(&mut self, ctx: &Context, host: &SharedHost, net: &NetworkState, msg: &Message) -> Outcome {
        let mut out = Outcome::default();
        let source = msg.prefix.as_deref().filter(|p| is_user_hostmask(p));
        let target = msg.param(0).filter(|t| net.is_channel(t));
        let channel = target.map(|t| ident::strip_statusmsg(t, &net.isupport.statusmsg));

        if let Some(hostmask) = source {
            if msg.nick().is_some_and(|n| net.is_me(n)) {
                return out;
            }
            if ctx.is_ignored(hostmask, channel) {
                tracing::debug!(%hostmask, command = %msg.command, "Ignoring message");
                return out;
            }
        }

        let index = host.lock().index();
        let reply_to = source.map(|hostmask| ReplyTo::new(msg.nick().unwrap_or_default(), hostmask, channel));
        let mut inv = Invocation::new(ctx, net, &index, Some(msg), reply_to.clone());
        host.lock().run_hooks(&mut inv, msg);
        self.collect(ctx, net, reply_to.as_ref(), inv, &mut out);

        if msg.command != "PRIVMSG" {
            return out;
        }
        let (Some(to), Some(target), Some(text)) = (reply_to.as_ref(), msg.param(0), msg.param(1)) else {
            return out;
        };
        let Some(line) = address::addressed(text, target, net, &ctx.registry) else {
            return out;
        };
        if let Some(chan) = channel
            && ctx.channels.get(chan).is_some_and(|c| c.lobotomized)
            && !ctx.is_owner(&to.hostmask)
        {
            tracing::debug!(channel = %chan, "Not answering in lobotomized channel");
            return out;
        }
        tracing::debug!(network = %net.network, from = %to.hostmask, command = %line, "Dispatching");

        let call = Call { ctx, host, net, index: &index, msg, to };
        match self.run_line(&call, &line, &mut out) {
            Ok(replies) => {
                for reply in &replies {
                    out.messages.extend(self.render(ctx, net, to, reply));
                }
            }
            Err(e) => {
                if matches!(e, CommandError::Database(_)) {
                    tracing::error!(command = %line, error = %e, "Command failed on database error");
                }
                let messages = self.render_error(ctx, net, to, &e);
                out.messages.extend(messages);
            }
        }
        out
    }

    fn run_line(&mut self, call: &Call<'_>, line: &str, out: &mut Outcome) -> Result<Vec<Reply>, CommandError> {
        let registry = &call.ctx.registry;
        let (network, channel) = (Some(call.net.network.as_str()), call.to.channel.as_deref());

        if let Some(punishment) = self.flood.check(call.ctx, FloodKind::Command, &call.to.hostmask) {
            punish(&punishment, call.to, out);
            return Ok(Vec::new());
        }

        let mut syntax = Syntax { quotes: registry.string("commands.quotes", None, None), ..Syntax::default() };
        syntax = if registry.bool("commands.nested", network, channel) {
            syntax.with_brackets(&registry.string("commands.nested.brackets", network, channel))
        } else {
            syntax.with_brackets("")
        };
        syntax.pipe = registry.bool("commands.nested.pipeSyntax", network, channel);
        let tokens = tokenizer::tokenize(line, &syntax)?;

        let maximum = registry.int("commands.nested.maximum", None, None);
        let depth = 1 + tokens.iter().map(Token::depth).max().unwrap_or(0);
        if maximum > 0 && depth as i64 > maximum {
            return Err(CommandError::NestingTooDeep);
        }
        self.evaluate(call, tokens, true, out)
    }

    /// Evaluate nested commands, then run the outer one.
    fn evaluate(&mut self, call: &Call<'_>, tokens: Vec<Token>, top: bool, out: &mut Outcome) -> Result<Vec<Reply>, CommandError> {
        let mut words = Vec::with_capacity(tokens.len());
        for token in tokens {
            match token {
                Token::Word(word) => words.push(word),
                Token::Nested(inner) => {
                    let replies = self.evaluate(call, inner, false, out)?;
                    let text: Vec<&str> = replies.iter().map(|r| r.text.as_str()).collect();
                    words.push(text.join(" "));
                }
            }
        }

        let (entry, consumed) = match resolve(call.index, &call.ctx.registry, &words) {
            Ok(found) => found,
            Err(CommandError::InvalidCommand(_)) if top => {
                self.invalid_command(call, &words, out);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        let args = words.split_off(consumed);
        check_command_capability(call, &entry)?;
        if let Some(cap) = &entry.capability
            && !call.ctx.check_capability(&call.to.hostmask, cap)
        {
            return Err(CommandError::Capability(cap.clone()));
        }

        let env = Env {
            ctx: call.ctx,
            net: call.net,
            index: call.index,
            hostmask: &call.to.hostmask,
            channel: call.to.channel.as_deref(),
        };
        let args = match converter::convert(&entry.args, args, &env) {
            Ok(args) => args,
            Err(CommandError::Argument) => return Err(CommandError::Usage(entry.usage())),
            Err(e) => return Err(e),
        };

        tracing::debug!(plugin = %entry.plugin, command = %entry.name, nested = !top, "Calling command");
        let mut inv = Invocation::new(call.ctx, call.net, call.index, Some(call.msg), Some(call.to.clone()));
        let result = call.host.lock().call(&entry, &mut inv, args);
        let (replies, actions) = inv.into_parts();
        out.actions.extend(actions.into_iter().map(|a| (Some(call.to.clone()), a)));
        result.map(|()| replies)
    }

    fn invalid_command(&mut self, call: &Call<'_>, words: &[String], out: &mut Outcome) {
        let Some(first) = words.first() else { return };
        // Another bot answering our errors with its own.
        if first.starts_with("Error:") {
            tracing::debug!(from = %call.to.hostmask, "Not answering what looks like another bot's error");
            return;
        }
        if let Some(punishment) = self.flood.check(call.ctx, FloodKind::Invalid, &call.to.hostmask) {
            punish(&punishment, call.to, out);
            return;
        }
        let mut inv = Invocation::new(call.ctx, call.net, call.index, Some(call.msg), Some(call.to.clone()));
        let handled = call.host.lock().invalid_command(&mut inv, words);
        self.collect(call.ctx, call.net, Some(call.to), inv, out);
        let (network, channel) = (Some(call.net.network.as_str()), call.to.channel.as_deref());
        if !handled && call.ctx.registry.bool("replies.whenNotCommand", network, channel) {
            let messages = self.render_error(call.ctx, call.net, call.to, &CommandError::InvalidCommand(first.clone()));
            out.messages.extend(messages);
        }
    }

    fn collect(&mut self, ctx: &Context, net: &NetworkState, to: Option<&ReplyTo>, inv: Invocation<'_>, out: &mut Outcome) {
        let (replies, actions) = inv.into_parts();
        if let Some(to) = to {
            for reply in &replies {
                out.messages.extend(self.render(ctx, net, to, reply));
            }
        }
        out.actions.extend(actions.into_iter().map(|a| (to.cloned(), a)));
    }
}

fn punish(punishment: &Punishment, to: &ReplyTo, out: &mut Outcome) {
    tracing::warn!(hostmask = %to.hostmask, mask = %punishment.mask, count = punishment.count, "Flood punishment");
    if punishment.notify {
        out.messages.push(msgs::notice(&to.nick, &punishment.notice_text()));
    }
}

/// Find the command `words` names; returns it and how many words the
/// name took.
fn resolve(index: &CommandIndex, registry: &Registry, words: &[String]) -> Result<(IndexEntry, usize), CommandError> {
    let Some(first) = words.first() else {
        return Err(CommandError::InvalidCommand(String::new()));
    };
    if let Some(second) = words.get(1)
        && index.plugin(first).is_some()
        && let Some(entry) = index.lookup(first, second)
    {
        return Ok((entry.clone(), 2));
    }
    match index.providers(first) {
        [] => Err(CommandError::InvalidCommand(first.clone())),
        [only] => Ok((only.clone(), 1)),
        several => {
            let preferred = registry.string(&format!("commands.defaultPlugins.{}", first.to_lowercase()), None, None);
            if !preferred.is_empty()
                && let Some(entry) = several.iter().find(|e| e.plugin.eq_ignore_ascii_case(&preferred))
            {
                return Ok((entry.clone(), 1));
            }
            Err(CommandError::AmbiguousCommand {
                command: first.clone(),
                candidates: several.iter().map(|e| e.plugin.clone()).collect(),
            })
        }
    }
}

/// Deny when the caller holds an anti-capability for the command, or
/// when defaults are off and nothing grants it.
fn check_command_capability(call: &Call<'_>, entry: &IndexEntry) -> Result<(), CommandError> {
    let ctx = call.ctx;
    let hostmask = call.to.hostmask.as_str();
    let full = format!("{}.{}", entry.plugin, entry.name);
    let mut wanted = vec![full.clone(), entry.name.clone()];
    let mut default = ctx.registry.bool("capabilities.default", None, None);
    if let Some(channel) = call.to.channel.as_deref() {
        wanted.push(ident::make_channel_capability(channel, &full));
        wanted.push(ident::make_channel_capability(channel, &entry.name));
        default &= ctx.channels.get(channel).is_none_or(|c| c.default_allow);
    }
    for cap in &wanted {
        let anti = match ident::from_channel_capability(cap) {
            Some((chan, bare)) => ident::make_channel_capability(chan, &ident::make_anti_capability(bare)),
            None => ident::make_anti_capability(cap),
        };
        if ctx.check_capability(hostmask, &anti) {
            return Err(CommandError::Capability(cap.clone()));
        }
    }
    if default || wanted.iter().any(|cap| ctx.check_capability(hostmask, cap)) {
        Ok(())
    } else {
        Err(CommandError::Capability(full))
    }
}
