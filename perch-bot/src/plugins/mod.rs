//! Plugins compiled into the perch binary.

pub mod admin;
pub mod channel;
pub mod misc;
pub mod owner;
pub mod user;
pub mod utilities;

use perch_core::config::{Registry, Scope};
use perch_core::plugin::Catalog;

/// Every built-in plugin, by name.
pub fn builtin_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog.register("Admin", |_| Box::new(admin::Admin));
    catalog.register("Channel", |_| Box::new(channel::Channel));
    catalog.register("Misc", |_| Box::new(misc::Misc));
    catalog.register("Owner", |_| Box::new(owner::Owner));
    catalog.register("User", |_| Box::new(user::User));
    catalog.register("Utilities", |_| Box::new(utilities::Utilities));
    catalog
}

/// Plugins a fresh configuration loads.
pub const DEFAULT_PLUGINS: [&str; 6] = ["Admin", "Channel", "Misc", "Owner", "User", "Utilities"];

/// Which plugin answers a command name several built-ins share.
const DEFAULT_PROVIDERS: [(&str, &str); 5] = [
    ("capability", "Admin"),
    ("help", "Misc"),
    ("ignore", "Admin"),
    ("list", "Misc"),
    ("more", "Misc"),
];

/// Fill in `commands.defaultPlugins.*` for shared names the
/// configuration leaves unset.
pub fn apply_default_providers(registry: &Registry) {
    for (command, plugin) in DEFAULT_PROVIDERS {
        let key = format!("commands.defaultPlugins.{command}");
        if registry.string(&key, None, None).is_empty()
            && let Err(e) = registry.set(&key, &Scope::global(), plugin)
        {
            tracing::warn!(%key, error = %e, "Could not set default plugin");
        }
    }
}

/// The bot must hold ops in `channel` for mode changes and kicks.
pub(crate) fn bot_is_op(inv: &perch_core::plugin::Invocation<'_>, channel: &str) -> bool {
    inv.net.channels.get(channel).is_some_and(|c| c.is_op(&inv.net.nick))
}
