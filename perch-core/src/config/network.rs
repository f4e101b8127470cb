//! Per-network connection settings assembled from the registry.

use std::path::PathBuf;

use super::{ConfigError, Registry};

/// A `host:port` entry from `networks.<net>.servers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    /// Parse `host:port`, `[v6]:port` or a bare host (defaulting the port
    /// from `tls`).
    pub fn parse(raw: &str, tls: bool) -> Option<Self> {
        let default_port = if tls { 6697 } else { 6667 };
        if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None => default_port,
            };
            return Some(Self { host: host.to_string(), port });
        }
        match raw.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => Some(Self {
                host: host.to_string(),
                port: port.parse().ok()?,
            }),
            Some(_) => Some(Self { host: raw.to_string(), port: default_port }),
            None if !raw.is_empty() => Some(Self { host: raw.to_string(), port: default_port }),
            None => None,
        }
    }
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SaslSettings {
    pub username: String,
    pub password: String,
    /// Preference order.
    pub mechanisms: Vec<String>,
}

/// Everything the driver needs to connect to one network.
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub name: String,
    pub servers: Vec<ServerAddr>,
    pub tls: bool,
    pub tls_insecure: bool,
    pub certfile: Option<PathBuf>,
    pub password: Option<String>,
    pub nick: String,
    pub alternate_nicks: Vec<String>,
    pub ident: String,
    pub realname: String,
    pub umodes: String,
    /// Auto-join list with optional keys.
    pub channels: Vec<(String, Option<String>)>,
    pub sasl: Option<SaslSettings>,
    pub extra_capabilities: Vec<String>,
}

impl NetworkSettings {
    pub fn from_registry(registry: &Registry, name: &str) -> Result<Self, ConfigError> {
        let key = |suffix: &str| format!("networks.{name}.{suffix}");
        let tls = registry.bool(&key("ssl"), None, None);
        let servers: Vec<ServerAddr> = registry
            .set_of(&key("servers"), None, None)
            .iter()
            .filter_map(|raw| ServerAddr::parse(raw, tls))
            .collect();
        if servers.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: key("servers"),
                reason: "no usable servers configured".into(),
            });
        }

        let nick = match registry.string(&key("nick"), None, None) {
            n if n.is_empty() => registry.string("nick", None, None),
            n => n,
        };
        let channels = registry
            .set_of(&key("channels"), None, None)
            .into_iter()
            .map(|chan| {
                let k = registry.string(&key("channels.key"), None, Some(&chan));
                (chan, (!k.is_empty()).then_some(k))
            })
            .collect();

        let username = registry.string(&key("sasl.username"), None, None);
        let sasl_password = registry.string(&key("sasl.password"), None, None);
        let certfile = registry.string(&key("certfile"), None, None);
        let mut mechanisms: Vec<String> = registry
            .set_of(&key("sasl.mechanisms"), None, None)
            .into_iter()
            .map(|m| m.to_ascii_uppercase())
            .collect();
        // EXTERNAL first when a client certificate is available.
        mechanisms.sort_by_key(|m| (m != "EXTERNAL", m.clone()));
        let sasl = (!username.is_empty() || !certfile.is_empty()).then(|| SaslSettings {
            username,
            password: sasl_password,
            mechanisms,
        });

        let password = registry.string(&key("password"), None, None);
        Ok(Self {
            name: name.to_string(),
            servers,
            tls,
            tls_insecure: registry.bool(&key("ssl.insecure"), None, None),
            certfile: (!certfile.is_empty()).then(|| PathBuf::from(certfile)),
            password: (!password.is_empty()).then_some(password),
            nick,
            alternate_nicks: registry.set_of("nick.alternates", None, None).into_iter().collect(),
            ident: registry.string("ident", None, None),
            realname: registry.string("user", None, None),
            umodes: registry.string(&key("umodes"), None, None),
            channels,
            sasl,
            extra_capabilities: registry.set_of(&key("capabilities"), None, None).into_iter().collect(),
        })
    }

    /// Settings for tests and embedders that bypass the registry.
    pub fn simple(name: &str, nick: &str) -> Self {
        Self {
            name: name.to_string(),
            servers: vec![ServerAddr { host: "127.0.0.1".into(), port: 6667 }],
            tls: false,
            tls_insecure: false,
            certfile: None,
            password: None,
            nick: nick.to_string(),
            alternate_nicks: Vec::new(),
            ident: nick.to_string(),
            realname: nick.to_string(),
            umodes: String::new(),
            channels: Vec::new(),
            sasl: None,
            extra_capabilities: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scope;

    #[test]
    fn server_addresses() {
        assert_eq!(
            ServerAddr::parse("irc.libera.chat:6697", true),
            Some(ServerAddr { host: "irc.libera.chat".into(), port: 6697 })
        );
        assert_eq!(ServerAddr::parse("irc.example", false).map(|s| s.port), Some(6667));
        assert_eq!(ServerAddr::parse("[::1]:7000", false).map(|s| s.port), Some(7000));
        assert_eq!(ServerAddr::parse("::1", true).map(|s| s.host), Some("::1".into()));
        assert_eq!(ServerAddr::parse("host:notaport", true), None);
        assert_eq!(ServerAddr { host: "::1".into(), port: 1 }.to_string(), "[::1]:1");
    }

    #[test]
    fn settings_from_registry() {
        let r = Registry::with_core();
        r.load_str(
            "nick: perch\n\
             networks: libera\n\
             networks.libera.servers: irc.libera.chat:6697\n\
             networks.libera.channels: #perch #secret\n\
             networks.libera.channels.key.#secret: hunter2\n\
             networks.libera.sasl.username: perch\n\
             networks.libera.sasl.password: pw\n",
        )
        .unwrap();
        let s = NetworkSettings::from_registry(&r, "libera").unwrap();
        assert!(s.tls);
        assert_eq!(s.nick, "perch");
        assert_eq!(s.servers[0].port, 6697);
        assert!(s.channels.contains(&("#secret".into(), Some("hunter2".into()))));
        assert!(s.channels.contains(&("#perch".into(), None)));
        let sasl = s.sasl.unwrap();
        assert_eq!(sasl.mechanisms, vec!["EXTERNAL", "PLAIN"]);

        r.set("networks.libera.nick", &Scope::global(), "perch_libera").unwrap();
        let s = NetworkSettings::from_registry(&r, "libera").unwrap();
        assert_eq!(s.nick, "perch_libera");
    }

    #[test]
    fn missing_servers_is_an_error() {
        let r = Registry::with_core();
        assert!(NetworkSettings::from_registry(&r, "nowhere").is_err());
    }
}
