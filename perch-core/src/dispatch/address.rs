//! Deciding whether a message is addressed to the bot.

use crate::config::Registry;
use crate::ident;
use crate::msgs;
use crate::state::NetworkState;

/// The command text of `text` sent to `target`, or `None` when the bot
/// is not being addressed.
///
/// Private messages are always addressed. In channels, the text must
/// start with one of `replies.whenAddressedBy.chars`, one of the
/// `replies.whenAddressedBy.strings`, or the bot's nick followed by
/// `:`, `,`, `;` or a space.
pub fn addressed(text: &str, target: &str, net: &NetworkState, registry: &Registry) -> Option<String> {
    if msgs::is_ctcp(text) {
        return None;
    }
    let network = Some(net.network.as_str());
    let channel = ident::strip_statusmsg(target, &net.isupport.statusmsg);
    let private = !net.is_channel(target);
    let scope_channel = if private { None } else { Some(channel) };

    let chars = registry.string("replies.whenAddressedBy.chars", network, scope_channel);
    let strings = registry.set_of("replies.whenAddressedBy.strings", network, scope_channel);
    let by_nick = registry.bool("replies.whenAddressedBy.nick", network, scope_channel);

    let stripped = strip_nick(text, net)
        .filter(|_| by_nick || private)
        .or_else(|| {
            let first = text.chars().next()?;
            chars
                .contains(first)
                .then(|| &text[first.len_utf8()..])
        })
        .or_else(|| {
            strings
                .iter()
                .filter(|s| !s.is_empty())
                .find_map(|s| text.strip_prefix(s.as_str()))
        });

    let command = match stripped {
        Some(rest) => rest,
        None if private => text,
        None => return None,
    };
    let command = command.trim();
    (!command.is_empty()).then(|| command.to_string())
}

fn strip_nick<'a>(text: &'a str, net: &NetworkState) -> Option<&'a str> {
    let nick_len = net.nick.len();
    if text.len() <= nick_len || !text.is_char_boundary(nick_len) {
        return None;
    }
    let (head, rest) = text.split_at(nick_len);
    if !net.is_me(head) {
        return None;
    }
    let mut chars = rest.chars();
    match chars.next()? {
        ':' | ',' | ';' => Some(chars.as_str()),
        c if c.is_whitespace() => Some(rest),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scope;

    fn net() -> NetworkState {
        NetworkState::new("testnet", "perch", 10)
    }

    #[test]
    fn nick_addressing_in_channels() {
        let r = Registry::with_core();
        let net = net();
        assert_eq!(addressed("perch: echo hi", "#c", &net, &r).as_deref(), Some("echo hi"));
        assert_eq!(addressed("PERCH, echo hi", "#c", &net, &r).as_deref(), Some("echo hi"));
        assert_eq!(addressed("perch echo", "#c", &net, &r).as_deref(), Some("echo"));
        assert_eq!(addressed("perchy: echo", "#c", &net, &r), None);
        assert_eq!(addressed("hello perch", "#c", &net, &r), None);
        assert_eq!(addressed("perch:", "#c", &net, &r), None);
    }

    #[test]
    fn prefix_chars_and_strings() {
        let r = Registry::with_core();
        r.set("replies.whenAddressedBy.chars", &Scope::channel("#c"), "!@").unwrap();
        r.set("replies.whenAddressedBy.strings", &Scope::global(), "perch->").unwrap();
        let mut net = net();
        net.isupport.statusmsg = "@+".into();
        assert_eq!(addressed("!echo hi", "#c", &net, &r).as_deref(), Some("echo hi"));
        assert_eq!(addressed("!echo hi", "#d", &net, &r), None);
        assert_eq!(addressed("perch-> echo", "#d", &net, &r).as_deref(), Some("echo"));
        assert_eq!(addressed("!echo", "@#c", &net, &r).as_deref(), Some("echo"));
    }

    #[test]
    fn private_messages_are_always_addressed() {
        let r = Registry::with_core();
        r.set("replies.whenAddressedBy.chars", &Scope::global(), "!").unwrap();
        let net = net();
        assert_eq!(addressed("echo hi", "perch", &net, &r).as_deref(), Some("echo hi"));
        assert_eq!(addressed("!echo hi", "perch", &net, &r).as_deref(), Some("echo hi"));
        assert_eq!(addressed("\x01VERSION\x01", "perch", &net, &r), None);
    }
}
