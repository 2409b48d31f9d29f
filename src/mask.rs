use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use regex::Regex;
use strum::{Display, EnumString};

/// A concrete `nick!user@host` identity split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hostmask {
    pub nick: String,
    pub user: String,
    pub host: String,
}

impl Hostmask {
    /// Parses `nick!user@host`, tolerating a leading `:`. Malformed input
    /// yields `None` rather than an error.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.strip_prefix(':').unwrap_or(text);

        if !is_hostmask(text) {
            return None;
        }

        let (nick, rest) = text.split_once('!')?;
        let (user, host) = rest.split_once('@')?;

        Some(Self {
            nick: nick.to_string(),
            user: user.to_string(),
            host: host.to_string(),
        })
    }

    /// The username with ident decorations (`~`, `i=`, `n=`) stripped.
    pub fn trimmed_user(&self) -> &str {
        if let Some(user) = self.user.strip_prefix('~') {
            user
        } else if let Some(user) = self.user.strip_prefix("i=") {
            user
        } else if let Some(user) = self.user.strip_prefix("n=") {
            user
        } else {
            &self.user
        }
    }
}

impl fmt::Display for Hostmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}@{}", self.nick, self.user, self.host)
    }
}

/// Whether `text` has the `nick!user@host` shape.
pub fn is_hostmask(text: &str) -> bool {
    let text = text.strip_prefix(':').unwrap_or(text);

    match (text.find('!'), text.find('@')) {
        (Some(n), Some(m)) => n >= 1 && n + 1 < m && m >= 3 && m + 1 < text.len(),
        _ => false,
    }
}

/// Whether `text` could be a bare nickname (no wildcard or hostmask syntax).
pub fn is_nick(text: &str) -> bool {
    const SPECIAL: &str = r"[]\`_^{|}";

    let mut chars = text.chars();

    let Some(first) = chars.next() else {
        return false;
    };

    (first.is_ascii_alphabetic() || SPECIAL.contains(first))
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || SPECIAL.contains(c))
}

/// Compiled `*`/`?` wildcard matchers, cached by the literal pattern string.
/// The cache is unbounded; the pattern vocabulary is small and operator-driven.
#[derive(Debug, Default)]
pub struct Patterns {
    cache: HashMap<String, Option<Regex>>,
}

impl Patterns {
    pub fn matches(&mut self, pattern: &str, candidate: &str) -> bool {
        let regex = self
            .cache
            .entry(pattern.to_string())
            .or_insert_with(|| compile(pattern));

        regex
            .as_ref()
            .is_some_and(|regex| regex.is_match(candidate))
    }

    /// Matches only when the pattern itself is hostmask-shaped; a bare nick or
    /// word never matches a full hostmask.
    pub fn hostmask_matches(&mut self, pattern: &str, hostmask: &str) -> bool {
        is_hostmask(pattern) && self.matches(pattern, hostmask)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?i)^");

    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            _ => source.push_str(&regex::escape(&c.to_string())),
        }
    }

    source.push('$');

    match Regex::new(&source) {
        Ok(regex) => Some(regex),
        Err(error) => {
            log::warn!("failed to compile mask pattern {pattern:?}: {error}");
            None
        }
    }
}

/// How a ban mask is derived from a member's hostmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Strategy {
    Nick,
    User,
    Host,
    Exact,
    /// Like `Host`, but smarter against web-gateway users: when the hostname
    /// is not a valid hostname and the username decodes as a hex-encoded IPv4
    /// address that is not already part of the hostname, match the username.
    Webchat,
}

/// Builds a ban mask from a hostmask according to the given strategies.
pub fn build(hostmask: &Hostmask, strategies: &[Strategy]) -> String {
    if strategies.contains(&Strategy::Exact) {
        return hostmask.to_string();
    }

    if strategies.contains(&Strategy::Webchat) {
        let decoded = hex_to_ip(hostmask.trimmed_user());

        if !is_hostname(&hostmask.host)
            && decoded
                .as_deref()
                .is_some_and(|ip| is_ip(ip) && !hostmask.host.contains(ip))
        {
            return format!("*!{}@*", hostmask.user);
        }

        return format!("*!*@{}", hostmask.host);
    }

    let nick = if strategies.contains(&Strategy::Nick) {
        &hostmask.nick
    } else {
        "*"
    };
    let user = if strategies.contains(&Strategy::User) {
        &hostmask.user
    } else {
        "*"
    };
    let host = if strategies.contains(&Strategy::Host) {
        &hostmask.host
    } else {
        "*"
    };

    format!("{nick}!{user}@{host}")
}

/// `"7f000001"` → `"127.0.0.1"`.
pub fn hex_to_ip(text: &str) -> Option<String> {
    if text.len() != 8 || !text.is_ascii() {
        return None;
    }

    let octets = (0..4)
        .map(|i| u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok())
        .collect::<Option<Vec<_>>>()?;

    Some(format!(
        "{}.{}.{}.{}",
        octets[0], octets[1], octets[2], octets[3]
    ))
}

pub fn is_ip(text: &str) -> bool {
    text.parse::<Ipv4Addr>().is_ok()
}

pub fn is_hostname(text: &str) -> bool {
    if text.is_empty() || text.len() > 255 {
        return false;
    }

    let text = text.strip_suffix('.').unwrap_or(text);

    text.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
