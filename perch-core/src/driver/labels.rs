//! `labeled-response` correlation for account registration.
//!
//! `REGISTER` and `VERIFY` are sent with a `label` tag; the server's
//! answer (`REGISTER SUCCESS`, `FAIL REGISTER ...`, numerics) echoes it
//! and is routed back to whoever asked. Servers without labeled-response
//! are matched by command, oldest first. Unanswered labels expire.

use std::collections::BTreeMap;

use crate::dispatch::reply::ReplyTo;
use crate::message::Message;

#[derive(Debug, Clone)]
struct Pending {
    reply_to: ReplyTo,
    command: String,
    expires: f64,
}

#[derive(Debug, Default)]
pub struct LabelTracker {
    next: u64,
    pending: BTreeMap<String, Pending>,
}

impl LabelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag `msg` with a fresh label and remember who asked.
    pub fn issue(&mut self, msg: Message, reply_to: ReplyTo, now: f64, timeout: f64) -> Message {
        self.next += 1;
        let label = format!("perch{}", self.next);
        self.pending.insert(
            label.clone(),
            Pending { reply_to, command: msg.command.clone(), expires: now + timeout },
        );
        msg.with_tag("label", Some(label))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Who a response belongs to, if it answers one of ours. The label is
    /// released when the response is final.
    pub fn resolve(&mut self, msg: &Message) -> Option<(String, ReplyTo)> {
        let command = answered_command(msg)?;
        let label = match msg.tag("label") {
            Some(label) => label.to_string(),
            None => self
                .pending
                .iter()
                .filter(|(_, p)| p.command.eq_ignore_ascii_case(&command))
                .min_by_key(|(label, _)| label_number(label))
                .map(|(label, _)| label.clone())?,
        };
        let pending = if is_final(msg) { self.pending.remove(&label)? } else { self.pending.get(&label)?.clone() };
        Some((pending.command, pending.reply_to))
    }

    pub fn expire(&mut self, now: f64) -> Vec<ReplyTo> {
        let expired: Vec<String> = self.pending.iter().filter(|(_, p)| p.expires <= now).map(|(l, _)| l.clone()).collect();
        expired.into_iter().filter_map(|l| self.pending.remove(&l)).map(|p| p.reply_to).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

fn label_number(label: &str) -> u64 {
    label.trim_start_matches("perch").parse().unwrap_or(u64::MAX)
}

/// The command a response is about: `REGISTER` for `REGISTER SUCCESS`
/// and `FAIL REGISTER ...`.
fn answered_command(msg: &Message) -> Option<String> {
    match msg.command.as_str() {
        "REGISTER" | "VERIFY" => Some(msg.command.clone()),
        "FAIL" | "WARN" | "NOTE" => msg.param(0).map(str::to_ascii_uppercase),
        _ if msg.tag("label").is_some() => Some(String::new()),
        _ => None,
    }
}

fn is_final(msg: &Message) -> bool {
    match msg.command.as_str() {
        "WARN" | "NOTE" => false,
        "REGISTER" | "VERIFY" | "FAIL" => true,
        // Other lines of a labeled-response batch.
        _ => !msg.has_tag("batch"),
    }
}

/// Human text for a registration response.
pub fn describe(msg: &Message) -> String {
    let last = msg.params.last().map(String::as_str).unwrap_or_default();
    match (msg.command.as_str(), msg.param(0)) {
        ("REGISTER" | "VERIFY", Some("SUCCESS")) => {
            let account = msg.param(1).unwrap_or("*");
            format!("{} of {account} succeeded: {last}", noun(&msg.command))
        }
        ("REGISTER", Some("VERIFICATION_REQUIRED")) => {
            let account = msg.param(1).unwrap_or("*");
            format!("Registration of {account} needs verification: {last}")
        }
        ("FAIL", Some(cmd)) => {
            let code = msg.param(1).unwrap_or("UNKNOWN");
            format!("{} failed: {last} ({code})", noun(cmd))
        }
        ("WARN" | "NOTE", _) => last.to_string(),
        _ => format!("{}: {last}", msg.command),
    }
}

fn noun(command: &str) -> &'static str {
    if command.eq_ignore_ascii_case("VERIFY") { "Verification" } else { "Registration" }
}
