use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;

use crate::isupport::CaseMap;
use crate::mask::Patterns;
use crate::time::Posix;

/// A completed bulk fetch is considered fresh this long.
pub const FETCH_FRESH_SECONDS: u64 = 60;

/// One ban or quiet entry as known to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskEntry {
    pub mask: String,
    /// Hostmask of a member the mask was seen to affect, when known.
    pub hostmask: Option<String>,
    /// Who set it, when known.
    pub set_by: Option<String>,
    pub set_at: Posix,
    pub expires: Option<Posix>,
}

/// Fields merged into an entry on repeated sets. Empty fields preserve
/// whatever the entry already holds; most information wins.
#[derive(Debug, Clone, Default)]
pub struct MaskUpdate {
    pub hostmask: Option<String>,
    pub set_by: Option<String>,
    pub set_at: Option<Posix>,
    pub expires: Option<Posix>,
}

/// The masks of one channel for one list mode, in the order the server
/// reported them.
#[derive(Debug, Clone, Default)]
pub struct MaskList {
    entries: IndexMap<String, MaskEntry>,
    pub fetch_time: Option<Posix>,
}

impl MaskList {
    pub fn upsert(&mut self, mask: &str, update: MaskUpdate, now: Posix, casemap: CaseMap) {
        let key = casemap.normalize(mask);

        if let Some(entry) = self.entries.get_mut(&key) {
            if let Some(hostmask) = update.hostmask {
                entry.hostmask = Some(hostmask);
            }
            if let Some(set_by) = update.set_by {
                entry.set_by = Some(set_by);
            }
            if let Some(set_at) = update.set_at {
                entry.set_at = set_at;
            }
            if let Some(expires) = update.expires {
                entry.expires = Some(expires);
            }
        } else {
            self.entries.insert(
                key,
                MaskEntry {
                    mask: mask.to_string(),
                    hostmask: update.hostmask,
                    set_by: update.set_by,
                    set_at: update.set_at.unwrap_or(now),
                    expires: update.expires,
                },
            );
        }
    }

    pub fn remove(&mut self, mask: &str, casemap: CaseMap) -> Option<MaskEntry> {
        self.entries.shift_remove(&casemap.normalize(mask))
    }

    pub fn get(&self, mask: &str, casemap: CaseMap) -> Option<&MaskEntry> {
        self.entries.get(&casemap.normalize(mask))
    }

    /// Masks whose wildcard pattern matches the given hostmask.
    pub fn matching_hostmask(&self, hostmask: &str, patterns: &mut Patterns) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| patterns.hostmask_matches(&entry.mask, hostmask))
            .map(|entry| entry.mask.clone())
            .collect()
    }

    /// Masks matched by a wildcard pattern over the mask strings themselves.
    pub fn matching_pattern(&self, pattern: &str, patterns: &mut Patterns) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| patterns.matches(pattern, &entry.mask))
            .map(|entry| entry.mask.clone())
            .collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MaskEntry> {
        self.entries.values()
    }

    /// Drops entries past their expiry, if any carry one.
    pub fn purge(&mut self, now: Posix) {
        self.entries
            .retain(|_, entry| entry.expires.is_none_or(|expires| expires > now));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All known mask lists for one channel-list mode (bans or quiets).
#[derive(Debug)]
pub struct MaskCache {
    pub mode: char,
    lists: HashMap<(String, String), MaskList>,
}

impl MaskCache {
    pub fn new(mode: char) -> Self {
        Self {
            mode,
            lists: HashMap::new(),
        }
    }

    fn key(server: &str, channel: &str, casemap: CaseMap) -> (String, String) {
        (casemap.normalize(server), casemap.normalize(channel))
    }

    pub fn add(
        &mut self,
        server: &str,
        channel: &str,
        mask: &str,
        update: MaskUpdate,
        now: Posix,
        casemap: CaseMap,
    ) {
        self.lists
            .entry(Self::key(server, channel, casemap))
            .or_default()
            .upsert(mask, update, now, casemap);
    }

    /// Removes one mask, or the channel's whole list when no mask is given.
    pub fn remove(&mut self, server: &str, channel: &str, mask: Option<&str>, casemap: CaseMap) {
        let key = Self::key(server, channel, casemap);

        match mask {
            Some(mask) => {
                if let Some(list) = self.lists.get_mut(&key) {
                    list.remove(mask, casemap);
                }
            }
            None => {
                self.lists.remove(&key);
            }
        }
    }

    pub fn get(&self, server: &str, channel: &str, casemap: CaseMap) -> Option<&MaskList> {
        self.lists.get(&Self::key(server, channel, casemap))
    }

    pub fn ensure(&mut self, server: &str, channel: &str, casemap: CaseMap) -> &mut MaskList {
        self.lists
            .entry(Self::key(server, channel, casemap))
            .or_default()
    }

    pub fn search_by_hostmask(
        &self,
        server: &str,
        channel: &str,
        hostmask: &str,
        patterns: &mut Patterns,
        casemap: CaseMap,
    ) -> Vec<String> {
        self.get(server, channel, casemap)
            .map(|list| list.matching_hostmask(hostmask, patterns))
            .unwrap_or_default()
    }

    pub fn search_by_pattern(
        &self,
        server: &str,
        channel: &str,
        pattern: &str,
        patterns: &mut Patterns,
        casemap: CaseMap,
    ) -> Vec<String> {
        self.get(server, channel, casemap)
            .map(|list| list.matching_pattern(pattern, patterns))
            .unwrap_or_default()
    }

    pub fn purge(&mut self, now: Posix) {
        for list in self.lists.values_mut() {
            list.purge(now);
        }
    }

    /// Drops lists for channels no longer of interest.
    pub fn retain_tracked(&mut self, is_tracked: impl Fn(&str, &str) -> bool) {
        let mode = self.mode;

        self.lists.retain(|(server, channel), list| {
            let keep = is_tracked(server, channel);

            if !keep {
                log::debug!(
                    "removing {server}.{channel} +{mode} list, not in watchlist ({} masks)",
                    list.len()
                );
            }

            keep
        });
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

/// One queued bulk-fetch exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchKey {
    pub server: String,
    pub channel: String,
    pub mode: char,
}

/// In-flight bulk list fetches, oldest first. At most one per key; the head
/// is the exchange the next list replies are reconciled against.
#[derive(Debug, Default)]
pub struct FetchQueue {
    pending: VecDeque<FetchKey>,
}

impl FetchQueue {
    pub fn contains(&self, key: &FetchKey) -> bool {
        self.pending.contains(key)
    }

    /// Appends a key and returns the new queue depth.
    pub fn push(&mut self, key: FetchKey) -> usize {
        self.pending.push_back(key);
        self.pending.len()
    }

    pub fn head(&self) -> Option<&FetchKey> {
        self.pending.front()
    }

    pub fn pop(&mut self) -> Option<FetchKey> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CASEMAP: CaseMap = CaseMap::RFC1459;

    #[test]
    fn merge_keeps_prior_fields() {
        let mut list = MaskList::default();

        list.upsert(
            "*!*@host",
            MaskUpdate {
                set_by: Some("alice".to_string()),
                set_at: Some(Posix::from_seconds(100)),
                ..MaskUpdate::default()
            },
            Posix::from_seconds(100),
            CASEMAP,
        );
        list.upsert(
            "*!*@host",
            MaskUpdate {
                set_at: Some(Posix::from_seconds(200)),
                ..MaskUpdate::default()
            },
            Posix::from_seconds(200),
            CASEMAP,
        );

        let entry = list.get("*!*@host", CASEMAP).expect("entry exists");
        assert_eq!(entry.set_by.as_deref(), Some("alice"));
        assert_eq!(entry.set_at, Posix::from_seconds(200));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn keys_ignore_case() {
        let mut list = MaskList::default();

        list.upsert(
            "Dude!*@*",
            MaskUpdate::default(),
            Posix::from_seconds(0),
            CASEMAP,
        );

        assert!(list.get("dude!*@*", CASEMAP).is_some());
        assert!(list.get("DUDE!*@*", CASEMAP).is_some());
        // the literal spelling is preserved for display
        assert_eq!(
            list.get("dude!*@*", CASEMAP).map(|e| e.mask.as_str()),
            Some("Dude!*@*")
        );

        list.remove("dUdE!*@*", CASEMAP);
        assert!(list.is_empty());
    }

    #[test]
    fn searches() {
        let mut patterns = Patterns::default();
        let mut cache = MaskCache::new('b');
        let now = Posix::from_seconds(0);

        cache.add("libera", "#test", "*!*@10.0.0.?", MaskUpdate::default(), now, CASEMAP);
        cache.add("libera", "#test", "troll!*@*", MaskUpdate::default(), now, CASEMAP);

        assert_eq!(
            cache.search_by_hostmask(
                "libera",
                "#test",
                "troll!~t@example.com",
                &mut patterns,
                CASEMAP
            ),
            vec!["troll!*@*".to_string()]
        );
        assert_eq!(
            cache.search_by_pattern("libera", "#test", "*10.0*", &mut patterns, CASEMAP),
            vec!["*!*@10.0.0.?".to_string()]
        );
        assert!(
            cache
                .search_by_pattern("libera", "#other", "*", &mut patterns, CASEMAP)
                .is_empty()
        );
    }

    #[test]
    fn fetch_queue_is_per_key() {
        let mut queue = FetchQueue::default();
        let key = FetchKey {
            server: "libera".to_string(),
            channel: "#test".to_string(),
            mode: 'b',
        };

        assert_eq!(queue.push(key.clone()), 1);
        assert!(queue.contains(&key));

        let other = FetchKey {
            mode: 'q',
            ..key.clone()
        };
        assert!(!queue.contains(&other));
        assert_eq!(queue.push(other), 2);

        assert_eq!(queue.pop().as_ref(), Some(&key));
        assert_eq!(queue.len(), 1);
    }
}
