//! Hostmask splitting, glob matching and ban pattern derivation.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use parking_lot::Mutex;

use super::casemap::Casemap;

/// True for a full `nick!user@host` with non-empty parts.
pub fn is_user_hostmask(s: &str) -> bool {
    split_hostmask(s).is_some()
}

/// Split at the first `!` and the last `@`.
pub fn split_hostmask(s: &str) -> Option<(&str, &str, &str)> {
    let (nick, rest) = s.split_once('!')?;
    let (user, host) = rest.rsplit_once('@')?;
    if nick.is_empty() || user.is_empty() || host.is_empty() {
        return None;
    }
    Some((nick, user, host))
}

pub fn join_hostmask(nick: &str, user: &str, host: &str) -> String {
    format!("{nick}!{user}@{host}")
}

pub fn nick_from_hostmask(s: &str) -> &str {
    s.split('!').next().unwrap_or(s)
}

/// Derive a default ban pattern: any nick and ident on the same host,
/// widened to the /24 (or last IPv6 group) or to the parent domain.
pub fn banmask(hostmask: &str) -> String {
    let host = split_hostmask(hostmask).map_or(hostmask, |(_, _, h)| h);
    if host.parse::<Ipv4Addr>().is_ok() {
        let (net, _) = host.rsplit_once('.').unwrap_or((host, ""));
        return format!("*!*@{net}.*");
    }
    if host.parse::<Ipv6Addr>().is_ok() {
        let (net, _) = host.rsplit_once(':').unwrap_or((host, ""));
        return format!("*!*@{net}:*");
    }
    if host.split('.').count() > 2
        && let Some(dot) = host.find('.')
    {
        return format!("*!*@*{}", &host[dot..]);
    }
    format!("*!*@{host}")
}

/// Match `text` against a `*`/`?` glob. Both sides must already be folded.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

const CACHE_CAPACITY: usize = 1000;

type CacheKey = (Casemap, String, String);

#[derive(Default)]
struct MatchCache {
    entries: HashMap<CacheKey, (bool, u64)>,
    tick: u64,
}

impl MatchCache {
    fn get(&mut self, key: &CacheKey) -> Option<bool> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|(hit, used)| {
            *used = tick;
            *hit
        })
    }

    fn put(&mut self, key: CacheKey, value: bool) {
        if self.entries.len() >= CACHE_CAPACITY {
            // Drop the least recently used half in one pass.
            let mut ages: Vec<u64> = self.entries.values().map(|(_, used)| *used).collect();
            ages.sort_unstable();
            let cutoff = ages[ages.len() / 2];
            self.entries.retain(|_, (_, used)| *used > cutoff);
        }
        self.tick += 1;
        self.entries.insert(key, (value, self.tick));
    }
}

static MATCH_CACHE: LazyLock<Mutex<MatchCache>> = LazyLock::new(Default::default);

/// Whether `hostmask` matches the glob `pattern` under `casemap`.
///
/// Results are memoized per casemap, so a casemap change never serves an
/// answer computed under the previous one.
pub fn hostmask_pattern_equal(pattern: &str, hostmask: &str, casemap: Casemap) -> bool {
    let key = (casemap, pattern.to_string(), hostmask.to_string());
    if let Some(hit) = MATCH_CACHE.lock().get(&key) {
        return hit;
    }
    let matched = glob_match(&casemap.to_lower(pattern), &casemap.to_lower(hostmask));
    MATCH_CACHE.lock().put(key, matched);
    matched
}

/// Whether two patterns could match a common hostmask in the obvious
/// sense: either one matches the other literally.
pub fn patterns_overlap(a: &str, b: &str, casemap: Casemap) -> bool {
    hostmask_pattern_equal(a, b, casemap) || hostmask_pattern_equal(b, a, casemap)
}
