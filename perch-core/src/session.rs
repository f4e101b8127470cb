//! One network connection's protocol logic, without I/O.
//!
//! The driver feeds the [`Session`] inbound lines and ticks, and takes
//! back what it should write ([`Session::pop_priority`],
//! [`Session::pop_outbound`]), jobs to run off the loop and requests
//! that concern the connection itself (reconnect, shut down). Everything
//! in between lives here: registration and CAP negotiation, SASL, nick
//! collisions, auto-join, batch reassembly, state tracking, dispatch and
//! the plugin actions that dispatch returns.

use std::collections::{HashSet, VecDeque};

use rand::Rng;

use crate::config::{NetworkSettings, ServerAddr};
use crate::context::Context;
use crate::dispatch::reply::{Reply, ReplyOpts, ReplyTo};
use crate::dispatch::{CommandError, Dispatcher};
use crate::driver::labels::{self, LabelTracker};
use crate::driver::sasl::{SaslNegotiation, SaslStep};
use crate::driver::sts::{self, StsDecision};
use crate::ident::Casemap;
use crate::message::Message;
use crate::msgs;
use crate::numeric::*;
use crate::plugin::{Action, Invocation, SharedHost};
use crate::schedule::Scheduler;
use crate::state::batch::BATCH_TIMEOUT;
use crate::state::{BatchAssembler, ConnState, NetworkState, Transition};
use crate::worker::{Job, JobResult};

/// IRCv3 capabilities requested whenever the server offers them.
pub const WANTED_CAPS: &[&str] = &[
    "account-notify",
    "account-tag",
    "away-notify",
    "batch",
    "cap-notify",
    "chghost",
    "draft/account-registration",
    "draft/multiline",
    "extended-join",
    "labeled-response",
    "message-tags",
    "multi-prefix",
    "server-time",
    "standard-replies",
    "userhost-in-names",
];

/// Longest capability list put in one `CAP REQ`.
const REQ_BUDGET: usize = 400;

/// Attempts at a random nick after the configured ones run out.
const RANDOM_NICK_ATTEMPTS: usize = 5;

/// Things only the driver can do.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Drop this connection and reconnect, e.g. for an STS upgrade.
    Reconnect { tls: bool, port: u16, reason: String },
    /// Shut the whole bot down.
    Shutdown(String),
}

pub struct Session {
    settings: NetworkSettings,
    ctx: Context,
    host: SharedHost,
    pub state: NetworkState,
    conn: ConnState,
    batches: BatchAssembler,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    priority: VecDeque<Message>,
    outbound: VecDeque<Message>,
    jobs: Vec<Job>,
    pending_jobs: HashSet<u64>,
    next_job: u64,
    requests: Vec<Request>,
    sasl: Option<SaslNegotiation>,
    /// `CAP REQ`s not yet ACKed or NAKed.
    caps_requested: usize,
    cap_ended: bool,
    nick_attempt: usize,
    labels: LabelTracker,
    server: Option<ServerAddr>,
    tls: bool,
    next_nick_recovery: Option<f64>,
    joined: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("network", &self.settings.name)
            .field("conn", &self.conn)
            .field("nick", &self.state.nick)
            .field("outbound", &self.outbound.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(settings: NetworkSettings, ctx: Context, host: SharedHost) -> Self {
        let registry = &ctx.registry;
        let history = registry.int("protocols.irc.maxHistoryLength", Some(&settings.name), None).max(0) as usize;
        let mut state = NetworkState::new(&settings.name, &settings.nick, history).with_clock(ctx.clock.clone());
        let casemap = registry.string("protocols.irc.casemapping", Some(&settings.name), None);
        state.pin_casemap(Casemap::from_token(&casemap));
        let dispatcher = Dispatcher::new(&ctx);
        Self {
            settings,
            host,
            state,
            conn: ConnState::Disconnected,
            batches: BatchAssembler::new(),
            dispatcher,
            scheduler: Scheduler::new(),
            priority: VecDeque::new(),
            outbound: VecDeque::new(),
            jobs: Vec::new(),
            pending_jobs: HashSet::new(),
            next_job: 0,
            requests: Vec::new(),
            sasl: None,
            caps_requested: 0,
            cap_ended: false,
            nick_attempt: 0,
            labels: LabelTracker::new(),
            server: None,
            tls: false,
            next_nick_recovery: None,
            joined: false,
            ctx,
        }
    }

    // ── Accessors ──

    pub fn network(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn host(&self) -> &SharedHost {
        &self.host
    }

    pub fn conn_state(&self) -> ConnState {
        self.conn
    }

    pub fn server(&self) -> Option<&ServerAddr> {
        self.server.as_ref()
    }

    /// Earliest time [`Session::tick`] has something to do.
    pub fn next_deadline(&self) -> Option<f64> {
        [self.scheduler.next_deadline(), self.next_nick_recovery]
            .into_iter()
            .flatten()
            .min_by(f64::total_cmp)
    }

    fn transition(&mut self, transition: Transition) {
        match self.conn.next(transition) {
            Ok(next) => {
                if next != self.conn {
                    tracing::debug!(network = %self.settings.name, from = ?self.conn, to = ?next, "Connection state");
                }
                self.conn = next;
            }
            Err(e) => tracing::warn!(network = %self.settings.name, error = %e, "Ignoring connection state change"),
        }
    }

    // ── Driver interface ──

    /// The socket to `server` is open: start registration.
    pub fn on_connected(&mut self, server: &ServerAddr, tls: bool) {
        if self.conn != ConnState::Disconnected {
            self.on_disconnect("reconnecting");
        }
        self.transition(Transition::Connect);
        self.transition(Transition::Opened);
        tracing::info!(network = %self.settings.name, %server, tls, "Connected, registering");
        self.server = Some(server.clone());
        self.tls = tls;
        self.state.reset();
        self.state.nick = self.settings.nick.clone();
        self.caps_requested = 0;
        self.cap_ended = false;
        self.nick_attempt = 0;
        self.joined = false;
        self.next_nick_recovery = None;

        if let Some(password) = &self.settings.password {
            self.outbound.push_back(msgs::pass(password));
        }
        self.outbound.push_back(msgs::cap("LS", &["302"]));
        self.outbound.push_back(msgs::nick(&self.settings.nick));
        self.outbound.push_back(msgs::user(&self.settings.ident, &self.settings.realname));
    }

    /// The socket closed. Everything scoped to the connection is dropped.
    pub fn on_disconnect(&mut self, reason: &str) {
        tracing::info!(network = %self.settings.name, %reason, queued = self.outbound.len(), "Disconnected");
        self.transition(Transition::Closed);
        self.priority.clear();
        self.outbound.clear();
        self.batches.clear();
        self.sasl = None;
        self.labels.clear();
        self.dispatcher.mores.clear();
        self.jobs.clear();
        self.pending_jobs.clear();
        self.next_nick_recovery = None;
        self.state.reset();
        if let Some(server) = self.server.take() {
            let now = self.ctx.now();
            if let Err(e) = self.ctx.networks.record_disconnect(&self.settings.name, &server.host, now) {
                tracing::error!(network = %self.settings.name, error = %e, "Could not record disconnect");
            }
        }
    }

    /// Say goodbye; the QUIT goes out after what is already queued.
    pub fn quit(&mut self, reason: &str) {
        if self.conn == ConnState::Disconnected {
            return;
        }
        self.transition(Transition::Quit);
        self.outbound.push_back(msgs::quit(reason));
    }

    /// Feed one raw line from the server.
    pub fn feed_line(&mut self, line: &str) {
        match Message::parse(line) {
            Ok(msg) => self.feed(msg),
            Err(e) => tracing::warn!(network = %self.settings.name, error = %e, %line, "Dropping malformed line"),
        }
    }

    pub fn feed(&mut self, msg: Message) {
        let now = self.ctx.now();
        for msg in self.batches.feed(msg, now) {
            self.handle(msg);
        }
    }

    /// Run what is due: scheduled events, label expiry, nick recovery.
    pub fn tick(&mut self, now: f64) {
        for fired in self.scheduler.due(now) {
            let Some(plugin) = fired.owner else { continue };
            let index = self.host.lock().index();
            let mut inv = Invocation::new(&self.ctx, &self.state, &index, None, None);
            self.host.lock().fire_event(&plugin, &fired.name, &mut inv);
            let (_, actions) = inv.into_parts();
            for action in actions {
                self.apply(None, action);
            }
        }

        self.batches.expire(now, BATCH_TIMEOUT);
        for to in self.labels.expire(now) {
            self.reply(&to, "The server did not answer the request.");
        }

        if let Some(at) = self.next_nick_recovery
            && now >= at
        {
            self.next_nick_recovery = None;
            if self.conn.is_connected() && !self.state.is_me(&self.settings.nick) {
                tracing::debug!(network = %self.settings.name, nick = %self.settings.nick, "Trying to regain nick");
                self.outbound.push_back(msgs::nick(&self.settings.nick));
                self.schedule_nick_recovery(now);
            }
        }
        self.dispatcher.gc(now);
    }

    pub fn pop_priority(&mut self) -> Option<Message> {
        self.priority.pop_front()
    }

    pub fn pop_outbound(&mut self) -> Option<Message> {
        self.outbound.pop_front()
    }

    pub fn has_outbound(&self) -> bool {
        !self.priority.is_empty() || !self.outbound.is_empty()
    }

    /// Everything queued, priority messages first.
    pub fn drain_outbound(&mut self) -> Vec<Message> {
        let mut out: Vec<Message> = self.priority.drain(..).collect();
        out.extend(self.outbound.drain(..));
        out
    }

    pub fn take_jobs(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.jobs)
    }

    pub fn take_requests(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.requests)
    }

    /// A job finished; its result becomes a reply. Results of jobs from
    /// an earlier connection are dropped.
    pub fn deliver_job(&mut self, result: JobResult) {
        if !self.pending_jobs.remove(&result.id) {
            tracing::debug!(network = %self.settings.name, job = result.id, "Dropping result of a cancelled job");
            return;
        }
        match result.outcome {
            Ok(text) if text.is_empty() => {}
            Ok(text) => self.reply(&result.reply_to, &text),
            Err(e) => self.reply_error(&result.reply_to, &e),
        }
    }

    // ── Inbound ──

    fn handle(&mut self, msg: Message) {
        match msg.command.as_str() {
            "PING" => {
                self.priority.push_back(msgs::pong(msg.param(0).unwrap_or_default()));
                return;
            }
            "PONG" => return,
            _ => {}
        }

        let previous_nick = msg.nick().map(str::to_string);
        self.state.feed(&msg);
        self.protocol(&msg, previous_nick.as_deref());

        if let Some((command, to)) = self.labels.resolve(&msg) {
            tracing::debug!(network = %self.settings.name, %command, "Answer to a labeled request");
            self.reply(&to, &labels::describe(&msg));
        }

        let outcome = self.dispatcher.handle(&self.ctx, &self.host, &self.state, &msg);
        for out in outcome.messages {
            self.queue(out);
        }
        for (to, action) in outcome.actions {
            self.apply(to, action);
        }
    }

    /// Registration, negotiation and other protocol bookkeeping.
    fn protocol(&mut self, msg: &Message, source: Option<&str>) {
        match msg.command.as_str() {
            "CAP" => self.on_cap(msg),
            "AUTHENTICATE" => {
                if let Some(sasl) = self.sasl.as_mut() {
                    let step = sasl.challenge(msg.param(0).unwrap_or("+"));
                    self.sasl_step(step);
                }
            }
            RPL_LOGGEDIN => {
                tracing::info!(network = %self.settings.name, account = msg.param(2).unwrap_or_default(), "Logged in");
            }
            RPL_LOGGEDOUT => tracing::info!(network = %self.settings.name, "Logged out"),
            ERR_NICKLOCKED => tracing::warn!(network = %self.settings.name, "Account is locked"),
            RPL_SASLSUCCESS | ERR_SASLFAIL | ERR_SASLTOOLONG | ERR_SASLABORTED | ERR_SASLALREADY | RPL_SASLMECHS => {
                if let Some(sasl) = self.sasl.as_mut() {
                    let step = sasl.numeric(&msg.command, &msg.params);
                    self.sasl_step(step);
                }
            }
            RPL_WELCOME => self.on_welcome(),
            RPL_ISUPPORT => self.dispatcher.mores.set_casemap(self.state.casemap),
            RPL_ENDOFMOTD | ERR_NOMOTD => self.auto_join(),
            ERR_NICKNAMEINUSE | ERR_ERRONEUSNICKNAME | ERR_NICKCOLLISION | ERR_UNAVAILRESOURCE => {
                if self.conn.is_registering() {
                    let nick = self.alternate_nick();
                    tracing::warn!(network = %self.settings.name, code = %msg.command, %nick, "Nick unavailable, trying another");
                    self.state.nick = nick.clone();
                    self.outbound.push_back(msgs::nick(&nick));
                }
            }
            "JOIN" => {
                if let Some(chan) = msg.param(0)
                    && msg.nick().is_some_and(|n| self.state.is_me(n))
                {
                    tracing::info!(network = %self.settings.name, channel = %chan, "Joined");
                    self.outbound.push_back(msgs::who(chan));
                }
            }
            "NICK" => {
                if let (Some(old), Some(new)) = (source, msg.param(0)) {
                    self.dispatcher.mores.rename(old, new);
                }
            }
            "QUIT" => {
                if let Some(nick) = source {
                    self.dispatcher.mores.forget(nick);
                }
            }
            "ERROR" => {
                tracing::warn!(network = %self.settings.name, reason = msg.param(0).unwrap_or_default(), "Server error");
            }
            _ => {}
        }
    }

    fn on_cap(&mut self, msg: &Message) {
        let Some(sub) = msg.param(1).map(str::to_ascii_uppercase) else { return };
        let list = msg.trailing().unwrap_or_default();
        match sub.as_str() {
            // `CAP * LS * :...` continues on the next line.
            "LS" if msg.params.len() > 3 && msg.param(2) == Some("*") => {}
            "LS" => {
                if self.check_sts() {
                    return;
                }
                if self.conn.is_registering() && !self.cap_ended {
                    let names: Vec<String> = self.state.caps_available.keys().cloned().collect();
                    self.request_caps(&names);
                }
            }
            "NEW" => {
                let names: Vec<String> = list
                    .split_whitespace()
                    .map(|item| item.split_once('=').map_or(item, |(n, _)| n).to_string())
                    .collect();
                self.request_caps(&names);
            }
            "ACK" => {
                self.caps_requested = self.caps_requested.saturating_sub(1);
                let acked_sasl = list.split_whitespace().any(|c| c == "sasl");
                if acked_sasl && self.conn.is_registering() && self.start_sasl() {
                    return;
                }
                self.end_negotiation();
            }
            "NAK" => {
                tracing::warn!(network = %self.settings.name, caps = %list, "Capabilities refused");
                self.caps_requested = self.caps_requested.saturating_sub(1);
                self.end_negotiation();
            }
            _ => {}
        }
    }

    /// Handle an `sts` advertisement. True when the connection is being
    /// replaced.
    fn check_sts(&mut self) -> bool {
        let Some(Some(value)) = self.state.caps_available.get("sts").cloned() else {
            return false;
        };
        match sts::decide(&value, self.tls) {
            StsDecision::Upgrade { port } => {
                tracing::info!(network = %self.settings.name, port, "STS upgrade requested");
                self.requests.push(Request::Reconnect { tls: true, port, reason: "STS upgrade".into() });
                true
            }
            StsDecision::Persist { duration, preload } => {
                if let Some(server) = &self.server {
                    let now = self.ctx.now();
                    let result =
                        self.ctx.networks.set_sts_policy(&self.settings.name, &server.host, server.port, duration, preload, now);
                    if let Err(e) = result {
                        tracing::error!(network = %self.settings.name, error = %e, "Could not store STS policy");
                    }
                }
                false
            }
            StsDecision::Nothing => false,
        }
    }

    fn wanted(&self, cap: &str) -> bool {
        if cap == "sasl" {
            return self.settings.sasl.is_some();
        }
        WANTED_CAPS.contains(&cap) || self.settings.extra_capabilities.iter().any(|c| c == cap)
    }

    fn request_caps(&mut self, offered: &[String]) {
        let wanted: Vec<&str> = offered
            .iter()
            .map(String::as_str)
            .filter(|c| self.wanted(c) && !self.state.has_cap(c))
            .collect();
        let mut line = String::new();
        let mut lines = Vec::new();
        for cap in wanted {
            if !line.is_empty() && line.len() + cap.len() + 1 > REQ_BUDGET {
                lines.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(cap);
        }
        if !line.is_empty() {
            lines.push(line);
        }
        if lines.is_empty() {
            self.end_negotiation();
            return;
        }
        tracing::debug!(network = %self.settings.name, caps = ?lines, "Requesting capabilities");
        self.caps_requested += lines.len();
        for line in lines {
            self.outbound.push_back(msgs::cap("REQ", &[&line]));
        }
    }

    /// `CAP END` once nothing is outstanding.
    fn end_negotiation(&mut self) {
        if self.conn == ConnState::Registering && self.caps_requested == 0 && !self.cap_ended {
            self.cap_ended = true;
            self.outbound.push_back(msgs::cap("END", &[]));
        }
    }

    fn start_sasl(&mut self) -> bool {
        let Some(settings) = &self.settings.sasl else { return false };
        let advertised = self.state.caps_available.get("sasl").cloned().flatten();
        let has_cert = self.tls && self.settings.certfile.is_some();
        let Some(mut sasl) = SaslNegotiation::new(settings, has_cert, advertised.as_deref()) else {
            tracing::warn!(network = %self.settings.name, "No usable SASL mechanism");
            return false;
        };
        let step = sasl.start();
        self.sasl = Some(sasl);
        self.transition(Transition::SaslStart);
        self.sasl_step(step);
        true
    }

    fn sasl_step(&mut self, step: SaslStep) {
        match step {
            SaslStep::Send(lines) => self.outbound.extend(lines),
            SaslStep::Done { success } => {
                let mechanism = self.sasl.as_ref().and_then(|s| s.mechanism().map(str::to_string));
                if success {
                    tracing::info!(network = %self.settings.name, ?mechanism, "SASL authentication succeeded");
                } else {
                    tracing::warn!(network = %self.settings.name, "SASL authentication failed");
                }
                self.sasl = None;
                if self.conn == ConnState::Sasl {
                    self.transition(Transition::SaslEnd);
                }
                self.end_negotiation();
            }
        }
    }

    fn on_welcome(&mut self) {
        self.transition(Transition::Welcome);
        self.sasl = None;
        tracing::info!(network = %self.settings.name, nick = %self.state.nick, "Registered");
        if !self.settings.umodes.is_empty() {
            let nick = self.state.nick.clone();
            self.outbound.push_back(msgs::mode(&nick, &[self.settings.umodes.clone()]));
        }
        if !self.state.is_me(&self.settings.nick) {
            let now = self.ctx.now();
            self.schedule_nick_recovery(now);
        }
    }

    fn schedule_nick_recovery(&mut self, now: f64) {
        let interval = self.ctx.registry.int("protocols.irc.nickRecovery.interval", Some(&self.settings.name), None);
        self.next_nick_recovery = (interval > 0).then(|| now + interval as f64);
    }

    fn auto_join(&mut self) {
        if self.joined {
            return;
        }
        self.joined = true;
        for (chan, key) in &self.settings.channels {
            self.outbound.push_back(msgs::join(chan, key.as_deref()));
        }
    }

    /// Alternates first, then underscores, then random digits.
    fn alternate_nick(&mut self) -> String {
        let attempt = self.nick_attempt;
        self.nick_attempt += 1;
        let base = &self.settings.nick;
        let alternates = &self.settings.alternate_nicks;
        if let Some(nick) = alternates.get(attempt) {
            return nick.clone();
        }
        match attempt - alternates.len() {
            0 => format!("{base}_"),
            1 => format!("{base}__"),
            n => {
                if n == 2 + RANDOM_NICK_ATTEMPTS {
                    tracing::warn!(network = %self.settings.name, "Ran out of nick alternatives");
                }
                let digits: u32 = rand::thread_rng().gen_range(0..1000);
                format!("{base}{digits:03}")
            }
        }
    }

    // ── Outbound ──

    /// Queue through the plugins' outbound filters.
    fn queue(&mut self, msg: Message) {
        if let Some(msg) = self.host.lock().filter_outbound(msg, &self.state) {
            self.outbound.push_back(msg);
        }
    }

    fn reply(&mut self, to: &ReplyTo, text: &str) {
        let messages = self.dispatcher.render(&self.ctx, &self.state, to, &Reply::new(text, ReplyOpts::default()));
        for msg in messages {
            self.queue(msg);
        }
    }

    fn reply_error(&mut self, to: &ReplyTo, error: &CommandError) {
        let messages = self.dispatcher.render_error(&self.ctx, &self.state, to, error);
        for msg in messages {
            self.queue(msg);
        }
    }

    fn reply_result(&mut self, to: Option<&ReplyTo>, result: Result<(), CommandError>) {
        let Some(to) = to else {
            if let Err(e) = result {
                tracing::warn!(network = %self.settings.name, error = %e, "Action failed");
            }
            return;
        };
        match result {
            Ok(()) => {
                let text = self.ctx.registry.string("replies.success", Some(&self.settings.name), to.channel.as_deref());
                self.reply(to, &text);
            }
            Err(e) => self.reply_error(to, &e),
        }
    }

    /// Carry out what a plugin asked for.
    fn apply(&mut self, to: Option<ReplyTo>, action: Action) {
        let now = self.ctx.now();
        match action {
            Action::Send(msg) => self.queue(msg),
            Action::Labeled(msg) => {
                let msg = match &to {
                    Some(to) => {
                        let timeout = self.ctx.registry.int("protocols.irc.labelTimeout", Some(&self.settings.name), None);
                        self.labels.issue(msg, to.clone(), now, timeout as f64)
                    }
                    None => msg,
                };
                self.queue(msg);
            }
            Action::More { nick } => match self.dispatcher.mores.next(&nick) {
                Some(msg) => self.queue(msg),
                None => {
                    if let Some(to) = &to {
                        self.reply(to, "That's all, there is no more.");
                    }
                }
            },
            Action::Load(name) => {
                let result = self.host.lock().load(&name).map(drop).map_err(CommandError::from);
                self.reply_result(to.as_ref(), result);
            }
            Action::Unload(name) => {
                let result = self.host.lock().unload(&name);
                let result = result.map(|canonical| {
                    self.scheduler.remove_owned_by(&canonical);
                });
                self.reply_result(to.as_ref(), result.map_err(CommandError::from));
            }
            Action::Reload(name) => {
                let result = self.host.lock().reload(&name).map(drop).map_err(CommandError::from);
                self.reply_result(to.as_ref(), result);
            }
            Action::Rename { plugin, from, to: new } => {
                let result = self.host.lock().rename(&plugin, &from, &new).map_err(CommandError::from);
                self.reply_result(to.as_ref(), result);
            }
            Action::Unrename { plugin, name } => {
                let result = self.host.lock().unrename(&plugin, &name).map_err(CommandError::from);
                self.reply_result(to.as_ref(), result);
            }
            Action::Disable(name) => {
                self.host.lock().disable(&name);
                self.reply_result(to.as_ref(), Ok(()));
            }
            Action::Enable(name) => {
                let enabled = self.host.lock().enable(&name);
                let result = if enabled { Ok(()) } else { Err(CommandError::Failed(format!("{name} is not disabled."))) };
                self.reply_result(to.as_ref(), result);
            }
            Action::Schedule { name, owner, at, period } => match period {
                Some(period) => self.scheduler.add_periodic(&name, period, now, Some(&owner)),
                None => self.scheduler.add(&name, at, Some(&owner)),
            },
            Action::Unschedule(name) => {
                self.scheduler.remove(&name);
            }
            Action::Job(mut job) => {
                self.next_job += 1;
                job.id = self.next_job;
                self.pending_jobs.insert(job.id);
                self.jobs.push(job);
            }
            Action::Flush => {
                let result = self.flush().map_err(CommandError::Failed);
                self.reply_result(to.as_ref(), result);
            }
            Action::Shutdown(reason) => self.requests.push(Request::Shutdown(reason)),
        }
    }

    fn flush(&self) -> Result<(), String> {
        self.ctx.flush().map_err(|e| e.to_string())?;
        self.ctx.save_config().map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    use super::*;
    use crate::clock::Clock;
    use crate::config::{Registry, SaslSettings};
    use crate::dispatch::converter::{Arg, Conv};
    use crate::plugin::{Catalog, CommandSpec, Plugin, PluginHost};

    struct Tools;

    impl Plugin for Tools {
        fn commands(&self) -> Vec<CommandSpec> {
            vec![
                CommandSpec::new("echo", "<text>\nSays <text>.").args(vec![Conv::Text]),
                CommandSpec::new("signup", "\nRegisters the bot's account."),
                CommandSpec::new("slow", "\nAnswers later."),
                CommandSpec::new("later", "\nSchedules a tick."),
            ]
        }

        fn call(&mut self, command: &str, inv: &mut Invocation<'_>, args: Vec<Arg>) -> Result<(), CommandError> {
            match command {
                "echo" => inv.reply(args[0].to_string()),
                "signup" => inv.act(Action::Labeled(Message::new(
                    "REGISTER",
                    vec!["perch".into(), "*".into(), "hunter2".into()],
                ))),
                "slow" => inv.defer(Duration::from_secs(5), || Ok("done".into())),
                _ => {
                    let at = inv.ctx.now() + 10.0;
                    inv.schedule("tick", at, None);
                }
            }
            Ok(())
        }

        fn on_event(&mut self, inv: &mut Invocation<'_>, name: &str) {
            inv.send(msgs::privmsg("#perch", &format!("event {name}")));
        }
    }

    fn session_with(settings: NetworkSettings) -> Session {
        let registry = Arc::new(Registry::with_core());
        let ctx = Context::in_memory(registry.clone(), Clock::manual(1000.0));
        let mut catalog = Catalog::new();
        catalog.register("Tools", |_| Box::new(Tools));
        let mut host = PluginHost::new(catalog, registry);
        host.load("Tools").unwrap();
        Session::new(settings, ctx, host.shared())
    }

    fn session() -> Session {
        session_with(NetworkSettings::simple("testnet", "perch"))
    }

    fn registered(mut s: Session) -> Session {
        s.on_connected(&ServerAddr { host: "irc.test".into(), port: 6667 }, false);
        s.feed_line(":srv 001 perch :Welcome");
        s.drain_outbound();
        s
    }

    fn commands(s: &mut Session) -> Vec<String> {
        s.drain_outbound().into_iter().map(|m| m.command).collect()
    }

    #[test]
    fn registration_negotiates_caps_then_joins() {
        let mut settings = NetworkSettings::simple("testnet", "perch");
        settings.channels = vec![("#perch".into(), None), ("#secret".into(), Some("key".into()))];
        let mut s = session_with(settings);
        s.on_connected(&ServerAddr { host: "irc.test".into(), port: 6667 }, false);
        assert_eq!(s.conn_state(), ConnState::Registering);
        let out = s.drain_outbound();
        assert_eq!(out[0], msgs::cap("LS", &["302"]));
        assert_eq!(out[1], msgs::nick("perch"));
        assert_eq!(out[2].command, "USER");

        s.feed_line(":srv CAP * LS * :multi-prefix sasl");
        assert!(s.drain_outbound().is_empty());
        s.feed_line(":srv CAP * LS :server-time unknown-cap");
        let out = s.drain_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].param(1), Some("REQ"));
        let requested = out[0].trailing().unwrap();
        assert!(requested.contains("multi-prefix") && requested.contains("server-time"));
        assert!(!requested.contains("sasl") && !requested.contains("unknown-cap"));

        s.feed_line(":srv CAP * ACK :multi-prefix server-time");
        assert_eq!(s.drain_outbound(), vec![msgs::cap("END", &[])]);
        assert!(s.state.has_cap("server-time"));

        s.feed_line(":srv 001 perch :Welcome");
        assert!(s.conn_state().is_connected());
        s.feed_line(":srv 376 perch :End of MOTD");
        assert_eq!(s.drain_outbound(), vec![msgs::join("#perch", None), msgs::join("#secret", Some("key"))]);
        s.feed_line(":srv 422 perch :No MOTD");
        assert!(s.drain_outbound().is_empty());

        s.feed_line(":perch!p@bot.host JOIN #perch");
        assert_eq!(s.drain_outbound(), vec![msgs::who("#perch")]);
    }

    #[test]
    fn sasl_plain_runs_before_cap_end() {
        let mut settings = NetworkSettings::simple("testnet", "perch");
        settings.sasl = Some(SaslSettings {
            username: "perch".into(),
            password: "pw".into(),
            mechanisms: vec!["PLAIN".into()],
        });
        let mut s = session_with(settings);
        s.on_connected(&ServerAddr { host: "irc.test".into(), port: 6697 }, true);
        s.drain_outbound();
        s.feed_line(":srv CAP * LS :sasl=PLAIN,EXTERNAL multi-prefix");
        let out = s.drain_outbound();
        assert!(out[0].trailing().unwrap().contains("sasl"));

        s.feed_line(":srv CAP * ACK :multi-prefix sasl");
        assert_eq!(s.drain_outbound(), vec![msgs::authenticate("PLAIN")]);
        assert_eq!(s.conn_state(), ConnState::Sasl);

        s.feed_line("AUTHENTICATE +");
        let out = s.drain_outbound();
        assert_eq!(STANDARD.decode(&out[0].params[0]).unwrap(), b"perch\0perch\0pw");

        s.feed_line(":srv 900 perch perch!p@h perch :You are now logged in");
        s.feed_line(":srv 903 perch :SASL authentication successful");
        assert_eq!(s.drain_outbound(), vec![msgs::cap("END", &[])]);
        assert_eq!(s.conn_state(), ConnState::Registering);
    }

    #[test]
    fn nick_collisions_walk_the_alternatives() {
        let mut settings = NetworkSettings::simple("testnet", "perch");
        settings.alternate_nicks = vec!["roost".into()];
        let mut s = session_with(settings);
        s.on_connected(&ServerAddr { host: "irc.test".into(), port: 6667 }, false);
        s.drain_outbound();
        let mut tried = Vec::new();
        for _ in 0..4 {
            s.feed_line(":srv 433 * perch :Nickname is already in use");
            let out = s.drain_outbound();
            tried.push(out[0].params[0].clone());
        }
        assert_eq!(tried[..3], ["roost", "perch_", "perch__"]);
        assert!(tried[3].starts_with("perch") && tried[3].len() == 8);

        // Registered under an alternate: the configured nick is retried later.
        s.feed_line(&format!(":srv 001 {} :Welcome", tried[3]));
        s.tick(1000.0 + 59.0);
        assert!(s.drain_outbound().is_empty());
        s.tick(1000.0 + 60.0);
        assert_eq!(s.drain_outbound(), vec![msgs::nick("perch")]);
    }

    #[test]
    fn pings_jump_the_queue() {
        let mut s = registered(session());
        s.feed_line(":alice!a@h PRIVMSG perch :echo one");
        s.feed_line("PING :token");
        let out = s.drain_outbound();
        assert_eq!(out[0], msgs::pong("token"));
        assert_eq!(out[1], msgs::privmsg("alice", "one"));
    }

    #[test]
    fn sts_on_plaintext_requests_an_upgrade() {
        let mut s = session();
        s.on_connected(&ServerAddr { host: "irc.test".into(), port: 6667 }, false);
        s.drain_outbound();
        s.feed_line(":srv CAP * LS :sts=port=6697,duration=300 multi-prefix");
        assert_eq!(
            s.take_requests(),
            vec![Request::Reconnect { tls: true, port: 6697, reason: "STS upgrade".into() }]
        );
        assert!(s.drain_outbound().is_empty());
    }

    #[test]
    fn sts_on_tls_is_cached() {
        let mut s = session();
        s.on_connected(&ServerAddr { host: "irc.test".into(), port: 6697 }, true);
        s.feed_line(":srv CAP * LS :sts=duration=300");
        assert!(s.take_requests().is_empty());
        let policy = s.context().networks.sts_policy("testnet", "irc.test", 1000.0).unwrap().unwrap();
        assert_eq!(policy.port, 6697);
    }

    #[test]
    fn disconnect_drops_everything_queued() {
        let mut s = registered(session());
        s.feed_line(":alice!a@h PRIVMSG perch :echo one");
        s.feed_line(":alice!a@h PRIVMSG perch :slow");
        assert!(s.has_outbound());
        s.on_disconnect("connection reset");
        assert!(!s.has_outbound());
        assert!(s.take_jobs().is_empty());
        assert_eq!(s.conn_state(), ConnState::Disconnected);
        assert!(s.context().networks.last_disconnect("testnet", "irc.test").is_some());

        // The next connection starts clean.
        s.on_connected(&ServerAddr { host: "irc.test".into(), port: 6667 }, false);
        assert_eq!(commands(&mut s), vec!["CAP", "NICK", "USER"]);
    }

    #[test]
    fn labeled_responses_reach_the_caller() {
        let mut s = registered(session());
        s.feed_line(":alice!a@h PRIVMSG perch :signup");
        let out = s.drain_outbound();
        assert_eq!(out[0].command, "REGISTER");
        let label = out[0].tag("label").unwrap().to_string();
        s.feed_line(&format!("@label={label} :srv REGISTER SUCCESS perch :Account created"));
        assert_eq!(
            s.drain_outbound(),
            vec![msgs::privmsg("alice", "Registration of perch succeeded: Account created")]
        );
    }

    #[test]
    fn batched_labeled_answers_go_to_their_own_caller() {
        let mut s = registered(session());
        s.feed_line(":alice!a@h PRIVMSG perch :signup");
        s.feed_line(":bob!b@h PRIVMSG perch :signup");
        let out = s.drain_outbound();
        let bobs = out[1].tag("label").unwrap().to_string();

        for line in [
            format!("@label={bobs} :srv BATCH +x labeled-response"),
            "@batch=x :srv NOTE REGISTER MAIL_SENT :Check your mail".to_string(),
            "@batch=x :srv REGISTER SUCCESS bobacct :Account created".to_string(),
            ":srv BATCH -x".to_string(),
        ] {
            s.feed_line(&line);
        }
        assert_eq!(
            s.drain_outbound(),
            vec![
                msgs::privmsg("bob", "Check your mail"),
                msgs::privmsg("bob", "Registration of bobacct succeeded: Account created"),
            ]
        );

        // Alice's request is still waiting for its own answer.
        let alices = out[0].tag("label").unwrap().to_string();
        s.feed_line(&format!("@label={alices} :srv FAIL REGISTER ACCOUNT_EXISTS alice :Taken"));
        let out = s.drain_outbound();
        assert_eq!(out[0].param(0), Some("alice"));
    }

    #[test]
    fn job_results_become_replies_once() {
        let mut s = registered(session());
        s.feed_line(":alice!a@h PRIVMSG #perch :perch: slow");
        let jobs = s.take_jobs();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.id, 1);
        let result = || JobResult { id: 1, reply_to: job.reply_to.clone(), outcome: Ok("done".into()) };
        s.deliver_job(result());
        assert_eq!(s.drain_outbound(), vec![msgs::privmsg("#perch", "done")]);
        s.deliver_job(result());
        assert!(s.drain_outbound().is_empty());
    }

    #[test]
    fn scheduled_events_reach_their_plugin() {
        let mut s = registered(session());
        s.feed_line(":alice!a@h PRIVMSG perch :later");
        s.drain_outbound();
        assert_eq!(s.next_deadline(), Some(1010.0));
        s.tick(1005.0);
        assert!(s.drain_outbound().is_empty());
        s.tick(1010.0);
        assert_eq!(s.drain_outbound(), vec![msgs::privmsg("#perch", "event tick")]);
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let mut s = registered(session());
        s.feed_line("@unterminated");
        s.feed_line("");
        assert!(s.drain_outbound().is_empty());
    }
}
