//! Capability resolution over user and channel records.
//!
//! Precedence, highest first:
//! 1. `owner` grants everything the user does not explicitly deny
//! 2. the user's own `#chan,cap` / `#chan,-cap`
//! 3. the user's `#chan,op`, which implies every capability on `#chan`
//! 4. the channel's capability set
//! 5. the user's global `cap` / `-cap`
//! 6. the channel's default-allow flag (never for op, halfop, voice)
//!
//! Anything left is unresolved and falls back to configured defaults.

use std::collections::BTreeSet;

use crate::ident::{canonical_capability, from_channel_capability, invert_capability, is_anti_capability};

use super::{ChannelRecord, User};

/// Channel capabilities that default-allow never hands out.
pub const PRIVILEGED: [&str; 3] = ["op", "halfop", "voice"];

pub fn is_privileged(cap: &str) -> bool {
    PRIVILEGED.contains(&cap)
}

/// Explicit answer of a capability set: `Some(true)` if it holds `cap`,
/// `Some(false)` if it holds the inverse.
pub fn explicit(set: &BTreeSet<String>, cap: &str) -> Option<bool> {
    if set.contains(cap) {
        Some(true)
    } else if set.contains(&invert_capability(cap)) {
        Some(false)
    } else {
        None
    }
}

pub fn resolve(user: Option<&User>, channel: Option<&ChannelRecord>, capability: &str) -> Option<bool> {
    let cap = canonical_capability(capability);
    if let Some(user) = user
        && user.capabilities.contains("owner")
    {
        // Owners only hold an anti-capability they were given explicitly.
        if is_anti_capability(&cap) {
            return Some(user.capabilities.contains(&cap));
        }
        if !user.capabilities.contains(&invert_capability(&cap)) {
            return Some(true);
        }
    }

    let Some((chan, bare)) = from_channel_capability(&cap) else {
        return user.and_then(|u| explicit(&u.capabilities, &cap));
    };

    if let Some(user) = user {
        if let Some(answer) = explicit(&user.capabilities, &cap) {
            return Some(answer);
        }
        if user.capabilities.contains(&format!("{chan},op")) {
            return Some(true);
        }
    }
    if let Some(channel) = channel
        && let Some(answer) = explicit(&channel.capabilities, bare)
    {
        return Some(answer);
    }
    if let Some(user) = user
        && let Some(answer) = explicit(&user.capabilities, bare)
    {
        return Some(answer);
    }
    channel.map(|c| c.default_allow && !is_privileged(bare))
}
