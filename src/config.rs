use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::isupport::CaseMap;
use crate::mask::Strategy;

/// Read-only settings for the operator service. Most values can be given
/// globally, per server, or per channel; lookups fall back along that chain.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub global: Overrides,
    #[serde(default)]
    pub servers: HashMap<String, Server>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Server {
    #[serde(flatten)]
    pub overrides: Overrides,
    /// List channel modes the server supports, e.g. `"bq"`. Superseded by
    /// the server's own ISUPPORT advertisement once seen.
    pub chanmodes: Option<String>,
    /// Maximum modes per MODE command. Also superseded by ISUPPORT.
    pub modes: Option<u16>,
    pub casemapping: Option<CaseMap>,
    /// Channels whose users and masks are tracked from connect.
    #[serde(default)]
    pub watchlist: Vec<String>,
    #[serde(default)]
    pub channels: HashMap<String, Overrides>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Overrides {
    /// Command issued to request op, normally a message to a services bot.
    /// Accepts the `$server`, `$channel` and `$nick` variables.
    pub op_command: Option<String>,
    pub deop_command: Option<String>,
    /// Drop op automatically after a privileged command.
    pub autodeop: Option<bool>,
    /// Seconds without further privileged activity before dropping op;
    /// zero drops immediately.
    pub autodeop_delay: Option<u64>,
    /// Comma-separated mask strategies: nick, user, host, exact, webchat.
    pub default_banmask: Option<String>,
    pub kick_reason: Option<String>,
    /// Use `/quote remove` instead of `/kick` on networks that support it.
    pub enable_remove: Option<bool>,
    pub enable_multi_kick: Option<bool>,
    /// Report which cached members a freshly set mask affects.
    pub display_affected: Option<bool>,
    /// Mode letters whose changes never touch the mask caches.
    pub ignored_modes: Option<String>,
}

/// Settings in effect for one channel after resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub op_command: String,
    pub deop_command: String,
    pub autodeop: bool,
    pub autodeop_delay: u64,
    pub default_banmask: Vec<Strategy>,
    pub kick_reason: String,
    pub enable_remove: bool,
    pub enable_multi_kick: bool,
    pub display_affected: bool,
    pub ignored_modes: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            op_command: "/msg chanserv op $channel $nick".to_string(),
            deop_command: "/deop".to_string(),
            autodeop: true,
            autodeop_delay: 180,
            default_banmask: vec![Strategy::Host],
            kick_reason: "kthxbye!".to_string(),
            enable_remove: false,
            enable_multi_kick: false,
            display_affected: false,
            ignored_modes: "ovjl".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = fs::read_to_string(path).map_err(|e| Error::Read(e.to_string()))?;

        toml::from_str(&content).map_err(|e| Error::Parse(e.to_string()))
    }

    pub fn server(&self, server: &str) -> Option<&Server> {
        self.servers.get(server)
    }

    /// Resolves the settings for a channel, channel → server → global.
    pub fn settings(&self, server: &str, channel: &str) -> Settings {
        let defaults = Settings::default();

        let server = self.servers.get(server);
        let channel = server.and_then(|server| server.channels.get(channel));

        let chain = [
            channel,
            server.map(|server| &server.overrides),
            Some(&self.global),
        ];

        let pick = |get: fn(&Overrides) -> Option<String>| {
            chain.iter().flatten().find_map(|overrides| get(overrides))
        };
        let pick_bool = |get: fn(&Overrides) -> Option<bool>| {
            chain.iter().flatten().find_map(|overrides| get(overrides))
        };

        let default_banmask = pick(|o| o.default_banmask.clone())
            .and_then(|value| parse_strategies(&value))
            .unwrap_or(defaults.default_banmask);

        Settings {
            op_command: pick(|o| o.op_command.clone()).unwrap_or(defaults.op_command),
            deop_command: pick(|o| o.deop_command.clone()).unwrap_or(defaults.deop_command),
            autodeop: pick_bool(|o| o.autodeop).unwrap_or(defaults.autodeop),
            autodeop_delay: chain
                .iter()
                .flatten()
                .find_map(|o| o.autodeop_delay)
                .unwrap_or(defaults.autodeop_delay),
            default_banmask,
            kick_reason: pick(|o| o.kick_reason.clone()).unwrap_or(defaults.kick_reason),
            enable_remove: pick_bool(|o| o.enable_remove).unwrap_or(defaults.enable_remove),
            enable_multi_kick: pick_bool(|o| o.enable_multi_kick)
                .unwrap_or(defaults.enable_multi_kick),
            display_affected: pick_bool(|o| o.display_affected)
                .unwrap_or(defaults.display_affected),
            ignored_modes: pick(|o| o.ignored_modes.clone()).unwrap_or(defaults.ignored_modes),
        }
    }

    /// Channels to track on a server from the moment it connects.
    pub fn watchlist(&self, server: &str) -> &[String] {
        self.servers
            .get(server)
            .map(|server| server.watchlist.as_slice())
            .unwrap_or_default()
    }
}

fn parse_strategies(value: &str) -> Option<Vec<Strategy>> {
    let strategies = value
        .split(',')
        .map(|keyword| keyword.trim().parse::<Strategy>())
        .collect::<Result<Vec<_>, _>>();

    match strategies {
        Ok(strategies) if !strategies.is_empty() => Some(strategies),
        _ => {
            log::error!(
                "invalid banmask config {value:?}, allowed: nick, user, host, exact, webchat"
            );
            None
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("config could not be read: {0}")]
    Read(String),
    #[error("{0}")]
    Parse(String),
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> Config {
        toml::from_str(
            r##"
            kick_reason = "bye"

            [servers.libera]
            autodeop_delay = 300
            chanmodes = "bq"
            watchlist = ["#test", "#chanop"]

            [servers.libera.channels."#test"]
            autodeop_delay = 60
            default_banmask = "user,host"

            [servers.quakenet]
            op_command = "/msg q op $channel $nick"
            "##,
        )
        .expect("valid config")
    }

    #[test]
    fn fallback_chain() {
        let config = config();

        let channel = config.settings("libera", "#test");
        assert_eq!(channel.autodeop_delay, 60);
        assert_eq!(channel.kick_reason, "bye");
        assert_eq!(
            channel.default_banmask,
            vec![Strategy::User, Strategy::Host]
        );

        let server = config.settings("libera", "#other");
        assert_eq!(server.autodeop_delay, 300);
        assert_eq!(server.default_banmask, vec![Strategy::Host]);

        let global = config.settings("oftc", "#somewhere");
        assert_eq!(global.autodeop_delay, 180);
        assert_eq!(global.op_command, "/msg chanserv op $channel $nick");

        assert_eq!(
            config.settings("quakenet", "#quake").op_command,
            "/msg q op $channel $nick"
        );
    }

    #[test]
    fn invalid_banmask_falls_back() {
        let config: Config = toml::from_str(r#"default_banmask = "hosts,nope""#)
            .expect("valid config");

        assert_eq!(
            config.settings("libera", "#test").default_banmask,
            vec![Strategy::Host]
        );
    }

    #[test]
    fn watchlist() {
        let config = config();

        assert_eq!(config.watchlist("libera"), ["#test", "#chanop"]);
        assert!(config.watchlist("oftc").is_empty());
    }
}
