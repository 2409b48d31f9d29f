use std::fmt;

/// The channel buffer a command originates from: the server and channel it
/// targets, plus our own nickname on that server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Context {
    pub server: String,
    pub channel: String,
    pub nick: String,
}

impl Context {
    pub fn new(server: &str, channel: &str, nick: &str) -> Self {
        Self {
            server: server.to_string(),
            channel: channel.to_string(),
            nick: nick.to_string(),
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.server, self.channel)
    }
}

/// A channel member as reported by the live connection state.
#[derive(Debug, Clone)]
pub struct Member {
    pub nick: String,
    /// The `user@host` part of the member's identity.
    pub userhost: String,
    pub op: bool,
    pub voice: bool,
}

impl Member {
    pub fn hostmask(&self) -> String {
        format!("{}!{}", self.nick, self.userhost)
    }
}

/// Capabilities the embedding client provides to the operator service.
///
/// Commands are issued as client command lines (`/mode`, `/kick`, ...) scoped
/// to a channel buffer. `delay` is in transport time units; the transport is
/// expected to perform the delay itself rather than the caller sleeping.
pub trait Host {
    fn send(&mut self, context: &Context, command: &str, delay: u64);

    /// Current member snapshot for a channel, or `None` when not joined.
    fn members(&self, server: &str, channel: &str) -> Option<Vec<Member>>;

    /// Our own nickname on a server, or `None` when disconnected.
    fn own_nick(&self, server: &str) -> Option<String>;
}
