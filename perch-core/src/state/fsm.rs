//! Connection state machine.
//!
//! ```text
//! DISCONNECTED → CONNECTING → REGISTERING ⇄ SASL
//!                                  │          │
//!                                  └── 001 ───┴→ CONNECTED → DISCONNECTING
//! ```
//!
//! Any state returns to DISCONNECTED when the socket closes.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Disconnected,
    Connecting,
    /// CAP negotiation, NICK and USER in flight.
    Registering,
    /// AUTHENTICATE exchange in progress.
    Sasl,
    Connected,
    /// QUIT sent, waiting for the server to close.
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Driver starts opening the socket.
    Connect,
    /// Socket is up and registration was sent.
    Opened,
    /// `CAP ACK` included `sasl`.
    SaslStart,
    /// 903, 904, 905, 906 or 907.
    SaslEnd,
    /// 001.
    Welcome,
    /// We sent QUIT.
    Quit,
    /// The socket closed.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no transition {transition:?} from {from}")]
pub struct InvalidTransition {
    pub from: ConnState,
    pub transition: Transition,
}

impl ConnState {
    pub fn next(self, transition: Transition) -> Result<ConnState, InvalidTransition> {
        use ConnState::*;
        use Transition::*;
        let to = match (self, transition) {
            (_, Closed) => Disconnected,
            (Disconnected, Quit) => Disconnected,
            (_, Quit) => Disconnecting,
            (Disconnected, Connect) => Connecting,
            (Connecting, Opened) => Registering,
            (Registering, SaslStart) => Sasl,
            (Sasl, SaslEnd) => Registering,
            (Registering | Sasl, Welcome) => Connected,
            (from, transition) => return Err(InvalidTransition { from, transition }),
        };
        Ok(to)
    }

    /// Registered with the server.
    pub fn is_connected(self) -> bool {
        self == ConnState::Connected
    }

    /// Between socket open and 001.
    pub fn is_registering(self) -> bool {
        matches!(self, ConnState::Registering | ConnState::Sasl)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Disconnected => "DISCONNECTED",
            ConnState::Connecting => "CONNECTING",
            ConnState::Registering => "REGISTERING",
            ConnState::Sasl => "SASL",
            ConnState::Connected => "CONNECTED",
            ConnState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnState::*;
    use Transition::*;

    #[test]
    fn happy_path_with_sasl() {
        let mut s = Disconnected;
        for t in [Connect, Opened, SaslStart, SaslEnd, Welcome, Quit, Closed] {
            s = s.next(t).unwrap();
        }
        assert_eq!(s, Disconnected);
    }

    #[test]
    fn welcome_during_sasl_connects() {
        assert_eq!(Sasl.next(Welcome), Ok(Connected));
        assert!(Sasl.is_registering());
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        assert!(Disconnected.next(Welcome).is_err());
        assert!(Connected.next(SaslEnd).is_err());
        assert!(Connected.next(SaslStart).is_err());
        assert_eq!(Connected.next(Closed), Ok(Disconnected));
    }
}
