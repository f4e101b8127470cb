//! Text formatting helpers for replies.

pub const BOLD: char = '\x02';
pub const COLOR: char = '\x03';
pub const REVERSE: char = '\x16';
pub const UNDERLINE: char = '\x1f';
pub const RESET: char = '\x0f';

pub fn bold(s: &str) -> String {
    format!("{BOLD}{s}{BOLD}")
}

pub fn underline(s: &str) -> String {
    format!("{UNDERLINE}{s}{UNDERLINE}")
}

pub fn reverse(s: &str) -> String {
    format!("{REVERSE}{s}{REVERSE}")
}

/// mIRC colour codes 0-15.
pub fn color(s: &str, fg: u8, bg: Option<u8>) -> String {
    match bg {
        Some(bg) => format!("{COLOR}{fg:02},{bg:02}{s}{COLOR}"),
        None => format!("{COLOR}{fg:02}{s}{COLOR}"),
    }
}

/// Remove bold, colour, italics, underline and reset codes.
pub fn strip_formatting(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            COLOR => {
                skip_digits(&mut chars);
                if chars.peek() == Some(&',') {
                    chars.next();
                    skip_digits(&mut chars);
                }
            }
            '\x02' | '\x0f' | '\x11' | '\x16' | '\x1d' | '\x1e' | '\x1f' => {}
            c => out.push(c),
        }
    }
    out
}

fn skip_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    for _ in 0..2 {
        if chars.peek().is_some_and(char::is_ascii_digit) {
            chars.next();
        }
    }
}

/// `a`, `a and b`, `a, b, and c`.
pub fn comma_and_list<S: AsRef<str>>(items: &[S]) -> String {
    join_list(items, "and")
}

/// `a`, `a or b`, `a, b, or c`.
pub fn comma_or_list<S: AsRef<str>>(items: &[S]) -> String {
    join_list(items, "or")
}

fn join_list<S: AsRef<str>>(items: &[S], conjunction: &str) -> String {
    match items {
        [] => String::new(),
        [one] => one.as_ref().to_string(),
        [a, b] => format!("{} {conjunction} {}", a.as_ref(), b.as_ref()),
        [head @ .., last] => {
            let head: Vec<&str> = head.iter().map(AsRef::as_ref).collect();
            format!("{}, {conjunction} {}", head.join(", "), last.as_ref())
        }
    }
}

/// `1 command`, `3 commands`.
pub fn n_items(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {noun}")
    } else if let Some(stem) = noun.strip_suffix('y')
        && !stem.ends_with(['a', 'e', 'o', 'u'])
    {
        format!("{n} {stem}ies")
    } else if noun.ends_with('s') || noun.ends_with("sh") || noun.ends_with("ch") {
        format!("{n} {noun}es")
    } else {
        format!("{n} {noun}s")
    }
}

/// `2 hours, 5 minutes, and 3 seconds`.
pub fn time_elapsed(total_secs: u64) -> String {
    if total_secs == 0 {
        return "0 seconds".to_string();
    }
    let units = [
        (7 * 24 * 3600, "week"),
        (24 * 3600, "day"),
        (3600, "hour"),
        (60, "minute"),
        (1, "second"),
    ];
    let mut rest = total_secs;
    let mut parts = Vec::new();
    for (size, name) in units {
        let n = rest / size;
        if n > 0 {
            parts.push(n_items(n as usize, name));
            rest %= size;
        }
    }
    comma_and_list(&parts)
}

/// Quote a value so it tokenizes back to a single argument.
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
