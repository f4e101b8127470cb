//! Strict Transport Security.
//!
//! On plaintext, an `sts` advertisement with a `port` means "reconnect
//! over TLS there now". On TLS, a `duration` is a policy to cache: later
//! connections to that host go straight to TLS on the secure port until
//! the policy expires.

use crate::config::ServerAddr;
use crate::db::{DbError, NetworksDb, StsPolicy};

#[derive(Debug, Clone, PartialEq)]
pub enum StsDecision {
    Nothing,
    /// Drop this plaintext connection and reconnect with TLS.
    Upgrade { port: u16 },
    /// Cache (or with duration 0, forget) the policy for this host.
    Persist { duration: f64, preload: bool },
}

/// What to do with an `sts=<value>` capability seen on a connection.
pub fn decide(value: &str, tls: bool) -> StsDecision {
    let (port, duration, preload) = StsPolicy::parse_advertisement(value);
    match (tls, port, duration) {
        (false, Some(port), _) => StsDecision::Upgrade { port },
        (true, _, Some(duration)) => StsDecision::Persist { duration, preload },
        _ => StsDecision::Nothing,
    }
}

/// The address and TLS flag to use for `server` given cached policies.
pub fn effective(
    networks: &NetworksDb,
    network: &str,
    server: &ServerAddr,
    tls: bool,
    now: f64,
) -> Result<(ServerAddr, bool), DbError> {
    match networks.sts_policy(network, &server.host, now)? {
        Some(policy) if !tls => {
            tracing::info!(network, host = %server.host, port = policy.port, "STS policy forces TLS");
            Ok((ServerAddr { host: server.host.clone(), port: policy.port }, true))
        }
        _ => Ok((server.clone(), tls)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_upgrades_and_tls_persists() {
        assert_eq!(decide("port=6697,duration=300", false), StsDecision::Upgrade { port: 6697 });
        assert_eq!(decide("duration=300", false), StsDecision::Nothing);
        assert_eq!(
            decide("port=6697,duration=300,preload", true),
            StsDecision::Persist { duration: 300.0, preload: true }
        );
        assert_eq!(decide("port=6697", true), StsDecision::Nothing);
    }

    #[test]
    fn cached_policies_force_tls_until_expiry() {
        let db = NetworksDb::in_memory();
        let server = ServerAddr { host: "irc.example.org".into(), port: 6667 };
        assert_eq!(effective(&db, "net", &server, false, 0.0).unwrap(), (server.clone(), false));
        db.set_sts_policy("net", "irc.example.org", 6697, 100.0, false, 0.0).unwrap();
        let (addr, tls) = effective(&db, "net", &server, false, 50.0).unwrap();
        assert!(tls);
        assert_eq!(addr.port, 6697);
        assert_eq!(effective(&db, "net", &server, false, 150.0).unwrap(), (server, false));
    }
}
