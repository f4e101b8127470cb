//! SASL negotiation (PLAIN and EXTERNAL).
//!
//! The session starts a [`SaslNegotiation`] when the server ACKs `sasl`,
//! feeds it `AUTHENTICATE` challenges and the 90x numerics, and sends
//! whatever it returns. Mechanisms are tried in preference order; a
//! failure moves on to the next one the server supports.

use std::collections::VecDeque;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::config::SaslSettings;
use crate::message::Message;
use crate::msgs;

/// Base64 payload bytes per AUTHENTICATE line.
pub const CHUNK: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslStep {
    /// Send these and keep waiting.
    Send(Vec<Message>),
    /// Authentication is over; end CAP negotiation.
    Done { success: bool },
}

#[derive(Debug, Clone)]
pub struct SaslNegotiation {
    username: String,
    password: String,
    remaining: VecDeque<String>,
    current: Option<String>,
}

impl SaslNegotiation {
    /// Mechanisms usable with these settings, narrowed to what the server
    /// advertised in `sasl=` (if anything). `None` when nothing is usable.
    pub fn new(settings: &SaslSettings, has_cert: bool, advertised: Option<&str>) -> Option<Self> {
        let offered: Option<Vec<String>> =
            advertised.filter(|a| !a.is_empty()).map(|a| a.split(',').map(|m| m.to_ascii_uppercase()).collect());
        let remaining: VecDeque<String> = settings
            .mechanisms
            .iter()
            .map(|m| m.to_ascii_uppercase())
            .filter(|m| match m.as_str() {
                "EXTERNAL" => has_cert,
                "PLAIN" => !settings.username.is_empty() && !settings.password.is_empty(),
                _ => false,
            })
            .filter(|m| offered.as_ref().is_none_or(|o| o.contains(m)))
            .collect();
        if remaining.is_empty() {
            return None;
        }
        Some(Self {
            username: settings.username.clone(),
            password: settings.password.clone(),
            remaining,
            current: None,
        })
    }

    pub fn mechanism(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// `AUTHENTICATE <mech>` for the next untried mechanism.
    pub fn start(&mut self) -> SaslStep {
        match self.remaining.pop_front() {
            Some(mech) => {
                tracing::debug!(mechanism = %mech, "Starting SASL");
                let msg = msgs::authenticate(&mech);
                self.current = Some(mech);
                SaslStep::Send(vec![msg])
            }
            None => {
                self.current = None;
                SaslStep::Done { success: false }
            }
        }
    }

    /// Answer an `AUTHENTICATE` challenge from the server.
    pub fn challenge(&mut self, payload: &str) -> SaslStep {
        if payload != "+" {
            tracing::debug!("Unexpected SASL challenge payload");
        }
        match self.current.as_deref() {
            Some("PLAIN") => {
                let raw = format!("{user}\0{user}\0{pass}", user = self.username, pass = self.password);
                SaslStep::Send(encode(raw.as_bytes()))
            }
            Some("EXTERNAL") => SaslStep::Send(encode(b"")),
            _ => SaslStep::Send(vec![msgs::authenticate("*")]),
        }
    }

    /// React to a SASL numeric.
    pub fn numeric(&mut self, code: &str, params: &[String]) -> SaslStep {
        match code {
            crate::numeric::RPL_SASLSUCCESS | crate::numeric::ERR_SASLALREADY => SaslStep::Done { success: true },
            crate::numeric::RPL_SASLMECHS => {
                // nick mechs :are available
                if let Some(mechs) = params.get(1) {
                    let offered: Vec<String> = mechs.split(',').map(|m| m.to_ascii_uppercase()).collect();
                    self.remaining.retain(|m| offered.contains(m));
                }
                SaslStep::Send(Vec::new())
            }
            crate::numeric::ERR_SASLFAIL | crate::numeric::ERR_SASLTOOLONG => {
                tracing::warn!(mechanism = ?self.current, code, "SASL mechanism failed");
                self.start()
            }
            crate::numeric::ERR_SASLABORTED => SaslStep::Done { success: false },
            _ => SaslStep::Send(Vec::new()),
        }
    }
}

/// Base64-encode `payload` into AUTHENTICATE lines. A payload whose
/// encoding is a multiple of the chunk size (or empty) ends with `+`.
pub fn encode(payload: &[u8]) -> Vec<Message> {
    let encoded = STANDARD.encode(payload);
    let mut out: Vec<Message> = encoded
        .as_bytes()
        .chunks(CHUNK)
        .map(|c| msgs::authenticate(&String::from_utf8_lossy(c)))
        .collect();
    if encoded.len() % CHUNK == 0 {
        out.push(msgs::authenticate("+"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(mechs: &[&str]) -> SaslSettings {
        SaslSettings {
            username: "perch".into(),
            password: "hunter2".into(),
            mechanisms: mechs.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn plain_sends_encoded_credentials() {
        let mut sasl = SaslNegotiation::new(&settings(&["EXTERNAL", "PLAIN"]), false, None).unwrap();
        assert_eq!(sasl.start(), SaslStep::Send(vec![msgs::authenticate("PLAIN")]));
        let SaslStep::Send(lines) = sasl.challenge("+") else { panic!() };
        assert_eq!(lines.len(), 1);
        let decoded = STANDARD.decode(&lines[0].params[0]).unwrap();
        assert_eq!(decoded, b"perch\0perch\0hunter2");
        assert_eq!(sasl.numeric("903", &[]), SaslStep::Done { success: true });
    }

    #[test]
    fn failure_falls_back_to_the_next_mechanism() {
        let mut sasl = SaslNegotiation::new(&settings(&["EXTERNAL", "PLAIN"]), true, Some("PLAIN,EXTERNAL")).unwrap();
        sasl.start();
        assert_eq!(sasl.mechanism(), Some("EXTERNAL"));
        assert_eq!(sasl.challenge("+"), SaslStep::Send(vec![msgs::authenticate("+")]));
        assert_eq!(sasl.numeric("904", &[]), SaslStep::Send(vec![msgs::authenticate("PLAIN")]));
        assert_eq!(sasl.numeric("904", &[]), SaslStep::Done { success: false });
    }

    #[test]
    fn unusable_settings_yield_nothing() {
        assert!(SaslNegotiation::new(&settings(&["EXTERNAL"]), false, None).is_none());
        assert!(SaslNegotiation::new(&settings(&["PLAIN"]), false, Some("EXTERNAL")).is_none());
    }

    #[test]
    fn long_payloads_are_chunked() {
        // 300 bytes encode to exactly 400 characters.
        let lines = encode(&[b'a'; 300]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].params[0].len(), 400);
        assert_eq!(lines[1].params[0], "+");
        let lines = encode(&[b'a'; 301]);
        assert_eq!(lines.len(), 2);
        assert_ne!(lines[1].params[0], "+");
    }
}
