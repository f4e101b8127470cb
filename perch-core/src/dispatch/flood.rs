//! Command flood protection.
//!
//! Each caller's commands are counted in a sliding `abuse.flood.interval`
//! window keyed by their ban mask, so nick changes do not reset it.
//! Crossing the maximum puts the mask on the temporary ignore list for the
//! punishment period. Invalid commands have their own, lower threshold.

use std::sync::Arc;

use crate::config::Registry;
use crate::context::Context;
use crate::format::time_elapsed;
use crate::ident::banmask;
use crate::structures::{FloodQueue, Timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodKind {
    Command,
    Invalid,
}

impl FloodKind {
    fn key(self) -> &'static str {
        match self {
            FloodKind::Command => "abuse.flood.command",
            FloodKind::Invalid => "abuse.flood.command.invalid",
        }
    }
}

/// A caller just crossed a threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Punishment {
    pub kind: FloodKind,
    pub mask: String,
    pub count: usize,
    pub interval: i64,
    pub duration: i64,
    pub until: f64,
    /// Whether to tell the caller.
    pub notify: bool,
}

impl Punishment {
    pub fn notice_text(&self) -> String {
        let what = match self.kind {
            FloodKind::Command => "commands",
            FloodKind::Invalid => "invalid commands",
        };
        format!(
            "You've given me {} {what} within the last {}; I'm now ignoring you for {}.",
            self.count,
            time_elapsed(self.interval.max(0) as u64),
            time_elapsed(self.duration.max(0) as u64),
        )
    }
}

#[derive(Debug)]
pub struct FloodControl {
    commands: FloodQueue<String>,
    invalid: FloodQueue<String>,
}

impl FloodControl {
    pub fn new(registry: &Arc<Registry>) -> Self {
        let interval = {
            let registry = registry.clone();
            Timeout::Dynamic(Arc::new(move || registry.int("abuse.flood.interval", None, None) as f64))
        };
        Self {
            commands: FloodQueue::new(interval.clone()),
            invalid: FloodQueue::new(interval),
        }
    }

    /// Count one event for `hostmask`; returns the punishment when this
    /// event crosses the threshold. The temporary ignore is already in
    /// place when this returns.
    pub fn check(&mut self, ctx: &Context, kind: FloodKind, hostmask: &str) -> Option<Punishment> {
        let registry = &ctx.registry;
        let key = kind.key();
        if !registry.bool(key, None, None) || ctx.is_trusted(hostmask) {
            return None;
        }
        let now = ctx.now();
        let mask = banmask(hostmask);
        let queue = match kind {
            FloodKind::Command => &mut self.commands,
            FloodKind::Invalid => &mut self.invalid,
        };
        let count = queue.enqueue(&mask, now);
        let maximum = registry.int(&format!("{key}.maximum"), None, None).max(1) as usize;
        if count <= maximum {
            return None;
        }
        queue.clear(&mask);
        let duration = registry.int(&format!("{key}.punishment"), None, None);
        let until = now + duration as f64;
        let reason = match kind {
            FloodKind::Command => "command flood",
            FloodKind::Invalid => "invalid command flood",
        };
        ctx.ignores.add_temporary(&mask, until, reason);
        tracing::info!(%hostmask, %mask, count, duration, reason, "Ignoring flooder");
        Some(Punishment {
            kind,
            mask,
            count,
            interval: registry.int("abuse.flood.interval", None, None),
            duration,
            until,
            notify: kind == FloodKind::Command
                || registry.bool("abuse.flood.command.invalid.notify", None, None),
        })
    }

    pub fn gc(&mut self, now: f64) {
        self.commands.gc(now);
        self.invalid.gc(now);
    }
}
