use crate::time::Posix;

/// A decoded protocol event delivered by the host environment. These are the
/// only place asynchronous network activity enters the service.
#[derive(Debug, Clone)]
pub enum Event {
    Connected {
        server: String,
    },
    /// RPL_ISUPPORT advertisement tokens, e.g. `["CHANMODES=eIbq,k,flj,..."]`.
    Isupport {
        server: String,
        tokens: Vec<String>,
    },
    Join {
        server: String,
        channel: String,
        nick: String,
        hostmask: String,
    },
    Part {
        server: String,
        channel: String,
        nick: String,
    },
    Quit {
        server: String,
        nick: String,
    },
    NickChange {
        server: String,
        old_nick: String,
        new_nick: String,
        /// The old full hostmask; the user and host parts carry over.
        hostmask: String,
    },
    Mode {
        server: String,
        channel: String,
        /// Hostmask of the actor, or a server name.
        set_by: String,
        modes: String,
        args: Vec<String>,
    },
    /// One entry of a bulk access-list reply (RPL_BANLIST and friends).
    ListEntry {
        server: String,
        channel: String,
        mask: String,
        set_by: Option<String>,
        set_at: Option<Posix>,
    },
    /// End of a bulk access-list reply.
    ListEnd {
        server: String,
        channel: String,
    },
}

impl Event {
    /// Decodes a raw MODE parameter string (`"-bo+v asd!*@* m4v dude"`) into
    /// a mode event.
    pub fn mode_from_params(server: &str, channel: &str, set_by: &str, params: &str) -> Self {
        let mut words = params.split_whitespace();
        let modes = words.next().unwrap_or_default().to_string();
        let args = words.map(String::from).collect();

        Event::Mode {
            server: server.to_string(),
            channel: channel.to_string(),
            set_by: set_by.to_string(),
            modes,
            args,
        }
    }

    /// Decodes a raw 005 parameter string into its tokens, dropping the
    /// trailing `:are supported by this server` text.
    pub fn isupport_from_params(server: &str, params: &str) -> Self {
        let params = params.split(" :").next().unwrap_or(params);

        Event::Isupport {
            server: server.to_string(),
            tokens: params.split_whitespace().map(String::from).collect(),
        }
    }
}

/// One applied access-list change, e.g. `+b asd!*@*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub add: bool,
    pub mode: char,
    pub arg: String,
}

/// Splits a mode string into the list-mode changes it applies. Only modes in
/// `list_modes` matter here; the prefix modes `o`/`v` consume an argument
/// which is dropped.
pub fn list_mode_changes(modes: &str, args: &[String], list_modes: &str) -> Vec<ModeChange> {
    let mut args = args.iter();
    let mut add = true;
    let mut changes = vec![];

    for c in modes.chars() {
        match c {
            '+' => add = true,
            '-' => add = false,
            c if list_modes.contains(c) => {
                if let Some(arg) = args.next() {
                    changes.push(ModeChange {
                        add,
                        mode: c,
                        arg: arg.clone(),
                    });
                }
            }
            'o' | 'v' => {
                args.next();
            }
            _ => (),
        }
    }

    changes
}

/// Nicks granted `+o` by a mode string, with the same argument-consumption
/// rules as `list_mode_changes`.
pub fn op_grants(modes: &str, args: &[String], list_modes: &str) -> Vec<String> {
    let mut args = args.iter();
    let mut add = true;
    let mut grants = vec![];

    for c in modes.chars() {
        match c {
            '+' => add = true,
            '-' => add = false,
            c if list_modes.contains(c) => {
                args.next();
            }
            'o' => {
                if let Some(nick) = args.next() {
                    if add {
                        grants.push(nick.clone());
                    }
                }
            }
            'v' => {
                args.next();
            }
            _ => (),
        }
    }

    grants
}

/// Whether every changed letter is one the caches do not care about
/// (`+oov` and the like).
pub fn uninteresting(modes: &str, ignored_modes: &str) -> bool {
    modes
        .chars()
        .filter(|c| *c != '+' && *c != '-')
        .all(|c| ignored_modes.contains(c))
}
