//! perch-bot: the perch IRC bot.
//!
//! The protocol engine, databases and dispatcher live in `perch-core`;
//! this crate adds the plugins every installation starts with:
//!
//! - Admin: channels, nick, capabilities, global ignores
//! - Channel: ops, kicks, bans, lobotomies, channel capabilities
//! - Misc: help, list, more, version
//! - Owner: loading plugins, renames, disabling commands, quitting
//! - User: registration, identification, hostmasks
//! - Utilities: echo, success, last, ignore

pub mod plugins;

pub use plugins::{DEFAULT_PLUGINS, apply_default_providers, builtin_catalog};
