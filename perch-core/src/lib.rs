//! perch-core: the runtime of the perch IRC bot.
//!
//! Inbound lines flow `driver` → [`message`] codec → [`state`] tracker →
//! [`dispatch`], which resolves commands against the [`plugin`] host and
//! queues replies back through the session's outbound queue. Identity and
//! access data live in [`db`], settings in [`config`].

pub mod atomic_file;
pub mod bot;
pub mod clock;
pub mod config;
pub mod context;
pub mod db;
pub mod dispatch;
pub mod driver;
pub mod format;
pub mod ident;
pub mod message;
pub mod msgs;
pub mod numeric;
pub mod plugin;
pub mod schedule;
pub mod session;
pub mod state;
pub mod structures;
pub mod worker;

pub use bot::Bot;
pub use clock::Clock;
pub use config::Registry;
pub use context::Context;
pub use message::{MalformedMessage, Message};
pub use plugin::{Plugin, PluginHost};
pub use session::Session;
