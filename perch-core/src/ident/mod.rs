//! Identifier utilities: casemaps, hostmasks, nick and channel syntax,
//! mode strings and capability naming.

pub mod casemap;
pub mod hostmask;
pub mod modes;

pub use casemap::{Casemap, IrcDict, IrcSet};
pub use hostmask::{banmask, hostmask_pattern_equal, is_user_hostmask, split_hostmask};
pub use modes::{ModeChange, ModeClasses, join_modes, separate_modes};

/// Channel prefixes assumed before the server sends `CHANTYPES`.
/// `+` channels are only recognized when the server lists them.
pub const DEFAULT_CHANTYPES: &str = "#&!";

const NICK_SPECIAL: &str = "[]\\`_^{|}";

/// Nick syntax check. Strict mode follows RFC 2812; the lenient mode
/// only rejects characters that would break the protocol.
pub fn is_nick(s: &str, strict: bool, nicklen: Option<usize>) -> bool {
    let Some(first) = s.chars().next() else {
        return false;
    };
    if let Some(max) = nicklen
        && s.chars().count() > max
    {
        return false;
    }
    if strict {
        (first.is_ascii_alphabetic() || NICK_SPECIAL.contains(first))
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || NICK_SPECIAL.contains(c))
    } else {
        !first.is_ascii_digit()
            && first != '-'
            && !DEFAULT_CHANTYPES.contains(first)
            && !s.contains(|c: char| c.is_whitespace() || "!@,*?:".contains(c) || c.is_control())
    }
}

/// Whether `s` names a channel under the server's `CHANTYPES`.
pub fn is_channel(s: &str, chantypes: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) if chantypes.contains(first) => {
            s.len() > 1 && !s.contains(|c: char| c == ' ' || c == ',' || c == '\x07')
        }
        _ => false,
    }
}

/// Strip `STATUSMSG` prefixes (`@#chan` → `#chan`).
pub fn strip_statusmsg<'a>(target: &'a str, statusmsg: &str) -> &'a str {
    target.trim_start_matches(|c| statusmsg.contains(c))
}

// ── Capability naming ──

pub fn is_anti_capability(cap: &str) -> bool {
    match cap.split_once(',') {
        Some((_, c)) => c.starts_with('-'),
        None => cap.starts_with('-'),
    }
}

/// `#chan,cap` form.
pub fn is_channel_capability(cap: &str) -> bool {
    cap.split_once(',')
        .is_some_and(|(chan, c)| !chan.is_empty() && !c.is_empty())
}

pub fn make_channel_capability(channel: &str, cap: &str) -> String {
    format!("{channel},{cap}")
}

/// Split `#chan,cap` into `("#chan", "cap")`.
pub fn from_channel_capability(cap: &str) -> Option<(&str, &str)> {
    cap.split_once(',').filter(|(chan, c)| !chan.is_empty() && !c.is_empty())
}

pub fn make_anti_capability(cap: &str) -> String {
    match cap.split_once(',') {
        Some((chan, c)) => format!("{chan},-{c}"),
        None => format!("-{cap}"),
    }
}

/// Flip between `cap` and `-cap`, keeping any channel qualifier.
pub fn invert_capability(cap: &str) -> String {
    match cap.split_once(',') {
        Some((chan, c)) => match c.strip_prefix('-') {
            Some(plain) => format!("{chan},{plain}"),
            None => format!("{chan},-{c}"),
        },
        None => match cap.strip_prefix('-') {
            Some(plain) => plain.to_string(),
            None => format!("-{cap}"),
        },
    }
}

/// Capabilities compare case-insensitively except for the channel part,
/// which is folded by the caller's casemap.
pub fn canonical_capability(cap: &str) -> String {
    match cap.split_once(',') {
        Some((chan, c)) => format!("{},{}", Casemap::Rfc1459.to_lower(chan), c.to_lowercase()),
        None => cap.to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nick_validation() {
        assert!(is_nick("alice", true, None));
        assert!(is_nick("[away]", true, None));
        assert!(!is_nick("1abc", true, None));
        assert!(!is_nick("a b", false, None));
        assert!(!is_nick("#chan", false, None));
        assert!(is_nick("ünicode", false, None));
        assert!(!is_nick("ünicode", true, None));
        assert!(!is_nick("toolongnick", true, Some(9)));
        assert!(!is_nick("", false, None));
    }

    #[test]
    fn channel_validation_uses_chantypes() {
        assert!(is_channel("#rust", DEFAULT_CHANTYPES));
        assert!(is_channel("&local", DEFAULT_CHANTYPES));
        assert!(!is_channel("+modeless", DEFAULT_CHANTYPES));
        assert!(is_channel("+modeless", "#+"));
        assert!(!is_channel("#", DEFAULT_CHANTYPES));
        assert!(!is_channel("#a,b", DEFAULT_CHANTYPES));
        assert!(!is_channel("alice", DEFAULT_CHANTYPES));
        assert_eq!(strip_statusmsg("@+#chan", "@+"), "#chan");
    }

    #[test]
    fn capability_naming() {
        assert!(is_anti_capability("-admin"));
        assert!(is_anti_capability("#c,-op"));
        assert!(!is_anti_capability("#c,op"));
        assert!(is_channel_capability("#c,op"));
        assert!(!is_channel_capability("op"));
        assert_eq!(from_channel_capability("#c,op"), Some(("#c", "op")));
        assert_eq!(make_anti_capability("#c,op"), "#c,-op");
        assert_eq!(invert_capability("#c,-op"), "#c,op");
        assert_eq!(invert_capability("admin"), "-admin");
        assert_eq!(canonical_capability("#Chan[1],OP"), "#chan{1},op");
    }
}
