//! Core configuration keys.

use super::{Decl, Kind, Registry, Value};

pub fn register_core(r: &Registry) {
    // ── Identity ──
    r.register(Decl::string("nick", "perch").help("Default nick on every network."));
    r.register(Decl::set("nick.alternates", &[]).help("Nicks to try when the main one is taken."));
    r.register(Decl::string("ident", "perch").help("Username sent in USER."));
    r.register(Decl::string("user", "perch IRC bot").help("Real name sent in USER."));
    r.register(Decl::string("language", "en"));

    // ── Networks ──
    r.register(Decl::set("networks", &[]).help("Networks to connect to."));
    r.register(Decl::set("networks.*.servers", &[]).help("host:port entries, tried in order."));
    r.register(Decl::boolean("networks.*.ssl", true));
    r.register(Decl::boolean("networks.*.ssl.insecure", false).help("Skip certificate verification."));
    r.register(Decl::string("networks.*.certfile", "").help("PEM file with client certificate and key (SASL EXTERNAL / CertFP)."));
    r.register(Decl::string("networks.*.password", "").private());
    r.register(Decl::string("networks.*.nick", "").help("Overrides `nick` on this network."));
    r.register(Decl::string("networks.*.umodes", ""));
    r.register(Decl::set("networks.*.channels", &[]).help("Channels joined after the MOTD."));
    r.register(Decl::string("networks.*.channels.key", "").channel().private());
    r.register(Decl::set("networks.*.capabilities", &[]).help("Extra IRCv3 capabilities to request."));
    r.register(Decl::string("networks.*.sasl.username", ""));
    r.register(Decl::string("networks.*.sasl.password", "").private());
    r.register(Decl::set("networks.*.sasl.mechanisms", &["EXTERNAL", "PLAIN"]));

    // ── Protocol ──
    r.register(
        Decl::new(
            "protocols.irc.casemapping",
            Kind::Enum(vec!["auto", "rfc1459", "strict-rfc1459", "ascii"]),
            Value::Str("auto".into()),
        )
        .help("Casemap for nick and channel comparison; auto follows ISUPPORT."),
    );
    r.register(Decl::boolean("protocols.irc.strictRfc", false).help("Validate nicks with RFC 2812 rules."));
    r.register(Decl::int("protocols.irc.maxHistoryLength", Kind::NonNegativeInteger, 1000));
    r.register(Decl::float("protocols.irc.throttleTime", 1.0).help("Seconds to refill one outbound message token."));
    r.register(Decl::int("protocols.irc.throttleBurst", Kind::PositiveInteger, 5));
    r.register(Decl::boolean("protocols.irc.ping", true));
    r.register(Decl::int("protocols.irc.ping.interval", Kind::PositiveInteger, 120));
    r.register(Decl::string("protocols.irc.quitMessage", "perch shutting down"));
    r.register(Decl::float("protocols.irc.shutdownTimeout", 5.0));
    r.register(Decl::float("protocols.irc.reconnect.initialDelay", 2.0));
    r.register(Decl::float("protocols.irc.reconnect.maximumDelay", 300.0));
    r.register(Decl::int("protocols.irc.labelTimeout", Kind::PositiveInteger, 300));
    r.register(Decl::int("protocols.irc.nickRecovery.interval", Kind::NonNegativeInteger, 60));

    // ── Commands ──
    r.register(Decl::boolean("commands.nested", true).channel());
    r.register(Decl::int("commands.nested.maximum", Kind::NonNegativeInteger, 10));
    r.register(Decl::string("commands.nested.brackets", "[]").channel());
    r.register(Decl::boolean("commands.nested.pipeSyntax", false).channel());
    r.register(Decl::string("commands.quotes", "\""));
    r.register(Decl::set("commands.disabled", &[]).help("Plugin.command or command names hidden from dispatch."));
    r.register(Decl::string("commands.defaultPlugins.*", "").help("Plugin that wins when several provide this command."));
    r.register(Decl::set("commands.renames.*", &[]).help("original=new pairs for this plugin."));

    // ── Capabilities ──
    r.register(Decl::set("capabilities", &["-owner", "-admin", "-trusted"]).help("Defaults for unresolved capabilities."));
    r.register(Decl::boolean("capabilities.default", true));
    r.register(Decl::int("databases.users.timeoutIdentification", Kind::NonNegativeInteger, 0)
        .help("Idle seconds before an identification expires; 0 never."));
    r.register(Decl::int("databases.flushInterval", Kind::PositiveInteger, 60)
        .help("Seconds between expiring bans and ignores and writing databases to disk."));

    // ── Replies ──
    r.register(Decl::string("replies.whenAddressedBy.chars", "").channel());
    r.register(Decl::set("replies.whenAddressedBy.strings", &[]).channel());
    r.register(Decl::boolean("replies.whenAddressedBy.nick", true).channel());
    r.register(Decl::boolean("replies.whenNotCommand", false).channel());
    r.register(Decl::boolean("replies.withNickPrefix", false).channel());
    r.register(Decl::boolean("replies.inPrivate", false).channel());
    r.register(Decl::boolean("replies.withNotice", false).channel());
    r.register(Decl::boolean("replies.error.withNotice", false).channel());
    r.register(Decl::int("replies.mores.length", Kind::NonNegativeInteger, 0));
    r.register(Decl::int("replies.mores.instant", Kind::PositiveInteger, 1).channel());
    r.register(Decl::int("replies.mores.maximum", Kind::PositiveInteger, 50));
    r.register(Decl::string("replies.success", "The operation succeeded."));
    r.register(Decl::string(
        "replies.noCapability",
        "You don't have the %s capability. If you think that you should have this capability, be sure that you are identified before trying again.",
    ));
    r.register(Decl::string(
        "replies.genericError",
        "An error has occurred and has been logged. Please contact this bot's administrator for more information.",
    ));
    r.register(Decl::string("replies.notRegistered", "You must be registered to use this command."));

    // ── Abuse ──
    r.register(Decl::int("abuse.flood.interval", Kind::PositiveInteger, 60));
    r.register(Decl::boolean("abuse.flood.command", true));
    r.register(Decl::int("abuse.flood.command.maximum", Kind::PositiveInteger, 12));
    r.register(Decl::int("abuse.flood.command.punishment", Kind::PositiveInteger, 300));
    r.register(Decl::boolean("abuse.flood.command.invalid", true));
    r.register(Decl::int("abuse.flood.command.invalid.maximum", Kind::PositiveInteger, 5));
    r.register(Decl::int("abuse.flood.command.invalid.punishment", Kind::PositiveInteger, 600));
    r.register(Decl::boolean("abuse.flood.command.invalid.notify", true));

    // ── Directories ──
    r.register(Decl::string("directories.data", "data"));
    r.register(Decl::string("directories.data.tmp", "data/tmp"));
    r.register(Decl::string("directories.conf", "conf"));
    r.register(Decl::string("directories.log", "logs"));
    r.register(Decl::string("directories.backup", "backup"));
    r.register(Decl::set("directories.plugins", &[]));

    // ── Plugins ──
    r.register(Decl::boolean("plugins.*", false).help("Load this plugin at startup."));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_defaults_resolve() {
        let r = Registry::with_core();
        assert_eq!(r.string("nick", None, None), "perch");
        assert_eq!(r.int("commands.nested.maximum", None, None), 10);
        assert!(r.bool("replies.whenAddressedBy.nick", Some("net"), Some("#c")));
        assert!(r.set_of("capabilities", None, None).contains("-admin"));
        assert_eq!(r.string("protocols.irc.casemapping", None, None), "auto");
        assert!(r.bool("networks.libera.ssl", None, None));
        assert!(!r.bool("plugins.Admin", None, None));
    }
}
