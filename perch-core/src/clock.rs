//! Wall-clock source shared by every expiring structure.
//!
//! Production code uses [`Clock::system`]; tests build a [`Clock::manual`]
//! and move time forward explicitly.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Source of "now" as UNIX seconds.
#[derive(Clone, Default)]
pub enum Clock {
    #[default]
    System,
    Manual(Arc<Mutex<f64>>),
}

impl Clock {
    pub fn system() -> Self {
        Clock::System
    }

    /// A clock frozen at `start` until advanced.
    pub fn manual(start: f64) -> Self {
        Clock::Manual(Arc::new(Mutex::new(start)))
    }

    pub fn now(&self) -> f64 {
        match self {
            Clock::System => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
            Clock::Manual(t) => *t.lock(),
        }
    }

    /// Move a manual clock forward. No-op on the system clock.
    pub fn advance(&self, secs: f64) {
        if let Clock::Manual(t) = self {
            *t.lock() += secs;
        }
    }

    pub fn set(&self, at: f64) {
        if let Clock::Manual(t) = self {
            *t.lock() = at;
        }
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Clock::System => f.write_str("Clock::System"),
            Clock::Manual(t) => write!(f, "Clock::Manual({})", *t.lock()),
        }
    }
}
