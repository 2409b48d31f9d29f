use std::collections::HashMap;

use crate::isupport::CaseMap;
use crate::time::Posix;

/// Parted users stay resolvable this long, so bans can still be built
/// against someone who just left.
pub const REMOVAL_GRACE_SECONDS: u64 = 3600;

/// Nick → hostmask for one channel. Removals are deferred: a departed nick
/// is only marked, stays visible to lookups, and is purged after the grace
/// period unless it comes back first.
#[derive(Debug, Clone, Default)]
pub struct UserList {
    users: HashMap<String, String>,
    parted: HashMap<String, Posix>,
}

impl UserList {
    pub fn insert(&mut self, nick: &str, hostmask: String, casemap: CaseMap) {
        let key = casemap.normalize(nick);

        // back from a cycle or nick change
        self.parted.remove(&key);
        self.users.insert(key, hostmask);
    }

    pub fn hostmask(&self, nick: &str, casemap: CaseMap) -> Option<&str> {
        self.users.get(&casemap.normalize(nick)).map(String::as_str)
    }

    pub fn contains(&self, nick: &str, casemap: CaseMap) -> bool {
        self.users.contains_key(&casemap.normalize(nick))
    }

    pub fn mark_removed(&mut self, nick: &str, now: Posix, casemap: CaseMap) {
        let key = casemap.normalize(nick);

        if self.users.contains_key(&key) {
            self.parted.insert(key, now);
        }
    }

    pub fn purge(&mut self, now: Posix) {
        let expired = self
            .parted
            .iter()
            .filter(|(_, marked)| now.since(**marked) > REMOVAL_GRACE_SECONDS)
            .map(|(nick, _)| nick.clone())
            .collect::<Vec<_>>();

        for nick in expired {
            self.parted.remove(&nick);
            self.users.remove(&nick);
        }
    }

    pub fn hostmasks(&self) -> impl Iterator<Item = &str> {
        self.users.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn pending_removal(&self) -> usize {
        self.parted.len()
    }
}

/// Per `(server, channel)` user lists, keyed case-insensitively.
#[derive(Debug, Default)]
pub struct UserCache {
    channels: HashMap<(String, String), UserList>,
}

impl UserCache {
    fn key(server: &str, channel: &str, casemap: CaseMap) -> (String, String) {
        (casemap.normalize(server), casemap.normalize(channel))
    }

    /// Replaces a channel's list wholesale from a membership snapshot.
    pub fn replace(
        &mut self,
        server: &str,
        channel: &str,
        members: impl IntoIterator<Item = (String, String)>,
        casemap: CaseMap,
    ) {
        let mut list = UserList::default();

        for (nick, hostmask) in members {
            list.insert(&nick, hostmask, casemap);
        }

        self.channels
            .insert(Self::key(server, channel, casemap), list);
    }

    pub fn get(&self, server: &str, channel: &str, casemap: CaseMap) -> Option<&UserList> {
        self.channels.get(&Self::key(server, channel, casemap))
    }

    pub fn get_mut(
        &mut self,
        server: &str,
        channel: &str,
        casemap: CaseMap,
    ) -> Option<&mut UserList> {
        self.channels.get_mut(&Self::key(server, channel, casemap))
    }

    /// Channels on `server` where `nick` is currently resolvable.
    pub fn channels_with(&self, server: &str, nick: &str, casemap: CaseMap) -> Vec<String> {
        let server = casemap.normalize(server);
        let nick = casemap.normalize(nick);

        self.channels
            .iter()
            .filter(|((serv, _), list)| *serv == server && list.users.contains_key(&nick))
            .map(|((_, channel), _)| channel.clone())
            .collect()
    }

    /// Resolves a nick to its hostmask, searching one channel or all of them.
    pub fn host_for_nick(
        &self,
        server: &str,
        channel: Option<&str>,
        nick: &str,
        casemap: CaseMap,
    ) -> Option<String> {
        if let Some(channel) = channel {
            if let Some(hostmask) = self
                .get(server, channel, casemap)
                .and_then(|list| list.hostmask(nick, casemap))
            {
                return Some(hostmask.to_string());
            }
        }

        let server = casemap.normalize(server);
        let nick = casemap.normalize(nick);

        self.channels
            .iter()
            .filter(|((serv, _), _)| *serv == server)
            .find_map(|(_, list)| list.users.get(&nick).cloned())
    }

    pub fn purge(&mut self, now: Posix) {
        for list in self.channels.values_mut() {
            list.purge(now);
        }
    }

    /// Drops lists for channels no longer of interest.
    pub fn retain_tracked(&mut self, is_tracked: impl Fn(&str, &str) -> bool) {
        self.channels.retain(|(server, channel), list| {
            let keep = is_tracked(server, channel);

            if !keep {
                log::debug!(
                    "removing {server}.{channel} user list, not in watchlist ({} users)",
                    list.len()
                );
            }

            keep
        });
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CASEMAP: CaseMap = CaseMap::RFC1459;

    #[test]
    fn lookups_ignore_case() {
        let mut list = UserList::default();
        list.insert("Alice", "Alice!~a@host".to_string(), CASEMAP);

        assert_eq!(list.hostmask("alice", CASEMAP), Some("Alice!~a@host"));
        assert_eq!(list.hostmask("ALICE", CASEMAP), Some("Alice!~a@host"));
        assert!(list.contains("aLiCe", CASEMAP));

        list.insert("alice", "alice!~a@elsewhere".to_string(), CASEMAP);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn rejoin_clears_pending_removal() {
        let now = Posix::from_seconds(1_000);
        let mut list = UserList::default();

        list.insert("dude", "dude!~d@host".to_string(), CASEMAP);
        list.mark_removed("dude", now, CASEMAP);

        // still resolvable during the grace period
        assert_eq!(list.hostmask("dude", CASEMAP), Some("dude!~d@host"));

        list.insert("dude", "dude!~d@newhost".to_string(), CASEMAP);
        assert_eq!(list.pending_removal(), 0);

        list.purge(now.plus(REMOVAL_GRACE_SECONDS + 1));
        assert_eq!(list.hostmask("dude", CASEMAP), Some("dude!~d@newhost"));
    }

    #[test]
    fn purge_drops_expired_marks_only() {
        let now = Posix::from_seconds(1_000);
        let mut list = UserList::default();

        list.insert("old", "old!~o@host".to_string(), CASEMAP);
        list.insert("recent", "recent!~r@host".to_string(), CASEMAP);
        list.mark_removed("old", now, CASEMAP);
        list.mark_removed("recent", now.plus(REMOVAL_GRACE_SECONDS), CASEMAP);

        list.purge(now.plus(REMOVAL_GRACE_SECONDS + 1));

        assert!(!list.contains("old", CASEMAP));
        assert!(list.contains("recent", CASEMAP));
        assert_eq!(list.pending_removal(), 1);
    }

    #[test]
    fn nick_resolution_across_channels() {
        let mut cache = UserCache::default();
        cache.replace(
            "libera",
            "#Test",
            [("Dude".to_string(), "Dude!~d@host".to_string())],
            CASEMAP,
        );

        assert_eq!(
            cache.host_for_nick("libera", Some("#test"), "dude", CASEMAP),
            Some("Dude!~d@host".to_string())
        );
        assert_eq!(
            cache.host_for_nick("libera", None, "dude", CASEMAP),
            Some("Dude!~d@host".to_string())
        );
        assert_eq!(cache.host_for_nick("oftc", None, "dude", CASEMAP), None);

        assert_eq!(
            cache.channels_with("libera", "DUDE", CASEMAP),
            vec!["#test".to_string()]
        );
    }
}
