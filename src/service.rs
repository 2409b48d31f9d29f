use std::collections::{HashMap, HashSet};

use crate::config::Config;
use crate::event::{self, Event};
use crate::host::{Context, Host};
use crate::isupport::{CaseMap, Operation, ServerParams};
use crate::mask::Patterns;
use crate::masklist::{FETCH_FRESH_SECONDS, FetchKey, FetchQueue, MaskCache, MaskList, MaskUpdate};
use crate::queue::Queue;
use crate::time::Posix;
use crate::user::{UserCache, UserList};

/// How long a firing release timer backs off while the queue is still busy.
const DEOP_RECHECK_SECONDS: u64 = 5;

/// The operator service: owns the channel-state caches, the command queue
/// and the fetch pipeline, and consumes decoded protocol events. One
/// instance per client; all state is confined to the caller's thread.
pub struct Service {
    pub(crate) config: Config,
    isupport: HashMap<String, ServerParams>,
    pub(crate) users: UserCache,
    pub(crate) bans: MaskCache,
    pub(crate) quiets: MaskCache,
    pub(crate) queue: Queue,
    pub(crate) fetches: FetchQueue,
    pub(crate) patterns: Patterns,
    tracked: HashSet<(String, String)>,
    pub(crate) deop_at: HashMap<(String, String), (Context, Posix)>,
}

impl Service {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            isupport: HashMap::new(),
            users: UserCache::default(),
            bans: MaskCache::new('b'),
            quiets: MaskCache::new('q'),
            queue: Queue::default(),
            fetches: FetchQueue::default(),
            patterns: Patterns::default(),
            tracked: HashSet::new(),
            deop_at: HashMap::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn casemap(&self, server: &str) -> CaseMap {
        self.isupport
            .get(&server.to_ascii_lowercase())
            .and_then(|params| params.casemap)
            .or_else(|| {
                self.config
                    .server(server)
                    .and_then(|server| server.casemapping)
            })
            .unwrap_or_default()
    }

    /// List channel modes the server supports, from its ISUPPORT
    /// advertisement, the config, or the universal default `b`.
    pub(crate) fn supported_modes(&self, server: &str) -> String {
        self.isupport
            .get(&server.to_ascii_lowercase())
            .and_then(|params| params.list_modes.clone())
            .or_else(|| {
                self.config
                    .server(server)
                    .and_then(|server| server.chanmodes.clone())
            })
            .unwrap_or_else(|| "b".to_string())
    }

    /// Maximum modes per MODE command.
    pub(crate) fn max_modes(&self, server: &str) -> usize {
        let max = self
            .isupport
            .get(&server.to_ascii_lowercase())
            .and_then(|params| params.max_modes)
            .or_else(|| self.config.server(server).and_then(|server| server.modes))
            .unwrap_or(4);

        usize::from(max).max(1)
    }

    pub(crate) fn mask_cache(&mut self, mode: char) -> Option<&mut MaskCache> {
        match mode {
            'b' => Some(&mut self.bans),
            'q' => Some(&mut self.quiets),
            _ => None,
        }
    }

    pub fn is_tracked(&self, server: &str, channel: &str) -> bool {
        let casemap = self.casemap(server);

        self.tracked
            .contains(&(casemap.normalize(server), casemap.normalize(channel)))
    }

    pub fn track(&mut self, server: &str, channel: &str) {
        let casemap = self.casemap(server);
        let key = (casemap.normalize(server), casemap.normalize(channel));

        if self.tracked.insert(key) {
            log::debug!("adding {channel} to the watchlist");
        }
    }

    /// Cached users of a channel, if any.
    pub fn users(&self, server: &str, channel: &str) -> Option<&UserList> {
        self.users.get(server, channel, self.casemap(server))
    }

    /// Cached masks of a channel for one list mode, if any.
    pub fn masks(&self, server: &str, channel: &str, mode: char) -> Option<&MaskList> {
        let casemap = self.casemap(server);

        match mode {
            'b' => self.bans.get(server, channel, casemap),
            'q' => self.quiets.get(server, channel, casemap),
            _ => None,
        }
    }

    /// Replaces the channel's user list from the live membership snapshot.
    pub(crate) fn snapshot_users(&mut self, server: &str, channel: &str, host: &dyn Host) -> bool {
        let casemap = self.casemap(server);

        match host.members(server, channel) {
            Some(members) => {
                self.users.replace(
                    server,
                    channel,
                    members
                        .into_iter()
                        .map(|member| (member.nick.clone(), member.hostmask())),
                    casemap,
                );
                true
            }
            None => false,
        }
    }

    /// Cached users, populating lazily from the live snapshot when absent.
    pub(crate) fn users_or_snapshot(
        &mut self,
        server: &str,
        channel: &str,
        host: &dyn Host,
    ) -> Option<&UserList> {
        let casemap = self.casemap(server);

        if self.users.get(server, channel, casemap).is_none()
            && !self.snapshot_users(server, channel, host)
        {
            return None;
        }

        self.users.get(server, channel, casemap)
    }

    /// Starts a bulk fetch of a channel's mask list, reconciling the cache
    /// with the server. Skipped when the mode is unsupported, a fetch for
    /// the key is already queued, or one completed less than a minute ago.
    pub fn fetch(&mut self, server: &str, channel: &str, mode: char, now: Posix, host: &mut dyn Host) {
        if !self.supported_modes(server).contains(mode) {
            return;
        }

        let casemap = self.casemap(server);

        let fresh = self
            .masks(server, channel, mode)
            .and_then(|list| list.fetch_time)
            .is_some_and(|fetched| now.since(fetched) < FETCH_FRESH_SECONDS);
        if fresh {
            return;
        }

        let key = FetchKey {
            server: casemap.normalize(server),
            channel: casemap.normalize(channel),
            mode,
        };
        if self.fetches.contains(&key) {
            return;
        }

        // space concurrent fetches out instead of letting them collide
        let depth = self.fetches.push(key) as u64;
        let nick = host.own_nick(server).unwrap_or_default();
        let context = Context::new(server, channel, &nick);

        log::info!("fetching {channel} masks (+{mode} channelmode)");
        host.send(&context, &format!("/mode {channel} {mode}"), depth);
    }

    /// Refreshes the user cache and every supported mask list of a channel.
    pub fn sync(&mut self, context: &Context, now: Posix, host: &mut dyn Host) {
        self.snapshot_users(&context.server, &context.channel, host);

        let supported = self.supported_modes(&context.server);
        for mode in ['b', 'q'] {
            if supported.contains(mode) {
                self.fetch(&context.server, &context.channel, mode, now, host);
            }
        }
    }

    /// Feeds one decoded protocol event through the reconciliation handlers.
    pub fn handle(&mut self, event: Event, now: Posix, host: &mut dyn Host) {
        match event {
            Event::Connected { server } => self.on_connected(&server, host),
            Event::Isupport { server, tokens } => self.on_isupport(&server, &tokens),
            Event::Join {
                server,
                channel,
                nick,
                hostmask,
            } => self.on_join(&server, &channel, &nick, hostmask, host),
            Event::Part {
                server,
                channel,
                nick,
            } => self.on_part(&server, &channel, &nick, now),
            Event::Quit { server, nick } => self.on_quit(&server, &nick, now),
            Event::NickChange {
                server,
                old_nick,
                new_nick,
                hostmask,
            } => self.on_nick_change(&server, &old_nick, &new_nick, &hostmask, now),
            Event::Mode {
                server,
                channel,
                set_by,
                modes,
                args,
            } => self.on_mode(&server, &channel, &set_by, &modes, &args, now, host),
            Event::ListEntry {
                server,
                channel,
                mask,
                set_by,
                set_at,
            } => self.on_list_entry(&server, &channel, &mask, set_by, set_at, now),
            Event::ListEnd { server, channel } => self.on_list_end(&server, &channel, now),
        }
    }

    /// Drives pending timeouts: the op-confirmation deadline and the
    /// auto-release timers. Invoke on a coarse periodic timer.
    pub fn tick(&mut self, now: Posix, host: &mut dyn Host) {
        let timed_out = self
            .queue
            .timed_out(now)
            .map(|suspension| suspension.context.clone());
        if let Some(context) = timed_out {
            log::error!("couldn't get op in {context}, purging command queue");
            self.queue.clear();
        }

        let due = self
            .deop_at
            .iter()
            .filter(|(_, (_, deadline))| now >= *deadline)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        for key in due {
            if self.queue.is_busy() {
                // commands still in flight, don't drop op mid-sequence
                if let Some((_, deadline)) = self.deop_at.get_mut(&key) {
                    *deadline = now.plus(DEOP_RECHECK_SECONDS);
                }
            } else if let Some((context, _)) = self.deop_at.remove(&key) {
                self.drop_op(&context, now, host);
            }
        }
    }

    /// Prunes expired cache entries and caches for untracked channels.
    pub fn collect_garbage(&mut self, now: Posix) {
        let tracked = self.tracked.clone();
        let is_tracked =
            |server: &str, channel: &str| tracked.contains(&(server.to_string(), channel.to_string()));

        self.bans.retain_tracked(is_tracked);
        self.quiets.retain_tracked(is_tracked);
        self.bans.purge(now);
        self.quiets.purge(now);

        self.users.retain_tracked(is_tracked);
        self.users.purge(now);

        log::debug!(
            "collector: {} ban lists, {} quiet lists, {} user lists, {} cached patterns",
            self.bans.len(),
            self.quiets.len(),
            self.users.len(),
            self.patterns.len()
        );
    }

    pub(crate) fn run_queue(&mut self, now: Posix, host: &mut dyn Host) {
        let run = self.queue.run(now, host);

        for (server, channel) in run.tracked {
            self.track(&server, &channel);
        }
    }

    fn on_connected(&mut self, server: &str, host: &mut dyn Host) {
        let channels = self.config.watchlist(server).to_vec();

        for channel in channels {
            self.track(server, &channel);
            self.snapshot_users(server, &channel, host);
        }
    }

    fn on_isupport(&mut self, server: &str, tokens: &[String]) {
        let params = self.isupport.entry(server.to_ascii_lowercase()).or_default();

        for token in tokens {
            if let Ok(operation) = token.parse::<Operation>() {
                params.apply(operation);
            }
        }
    }

    fn on_join(&mut self, server: &str, channel: &str, nick: &str, hostmask: String, host: &dyn Host) {
        let casemap = self.casemap(server);
        let own = host
            .own_nick(server)
            .is_some_and(|own| casemap.normalize(&own) == casemap.normalize(nick));

        if own {
            if self.is_tracked(server, channel) {
                self.snapshot_users(server, channel, host);
            }
        } else if let Some(list) = self.users.get_mut(server, channel, casemap) {
            list.insert(nick, hostmask, casemap);
        }
    }

    fn on_part(&mut self, server: &str, channel: &str, nick: &str, now: Posix) {
        let casemap = self.casemap(server);

        if let Some(list) = self.users.get_mut(server, channel, casemap) {
            list.mark_removed(nick, now, casemap);
        }
    }

    fn on_quit(&mut self, server: &str, nick: &str, now: Posix) {
        let casemap = self.casemap(server);

        for channel in self.users.channels_with(server, nick, casemap) {
            if let Some(list) = self.users.get_mut(server, &channel, casemap) {
                list.mark_removed(nick, now, casemap);
            }
        }
    }

    fn on_nick_change(
        &mut self,
        server: &str,
        old_nick: &str,
        new_nick: &str,
        hostmask: &str,
        now: Posix,
    ) {
        let casemap = self.casemap(server);
        let userhost = hostmask
            .split_once('!')
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        let new_hostmask = format!("{new_nick}!{userhost}");

        for channel in self.users.channels_with(server, old_nick, casemap) {
            if let Some(list) = self.users.get_mut(server, &channel, casemap) {
                list.mark_removed(old_nick, now, casemap);
                list.insert(new_nick, new_hostmask.clone(), casemap);
            }
        }
    }

    fn on_mode(
        &mut self,
        server: &str,
        channel: &str,
        set_by: &str,
        modes: &str,
        args: &[String],
        now: Posix,
        host: &mut dyn Host,
    ) {
        let casemap = self.casemap(server);
        let list_modes = self.supported_modes(server);

        // a pending privilege request resumes regardless of what the mask
        // caches think of the change
        if self.queue.is_suspended() {
            for nick in event::op_grants(modes, args, &list_modes) {
                if self.queue.confirm(server, channel, &nick, casemap) {
                    log::debug!("got op in {server}.{channel}, resuming queue");
                    self.run_queue(now, host);
                    break;
                }
            }
        }

        if args.is_empty() {
            // modes without argument, not interesting
            return;
        }

        let settings = self.config.settings(server, channel);
        if event::uninteresting(modes, &settings.ignored_modes) {
            return;
        }

        let known = self.bans.get(server, channel, casemap).is_some()
            || self.quiets.get(server, channel, casemap).is_some();
        if !known && !self.is_tracked(server, channel) {
            // from a channel we're not tracking
            return;
        }

        for change in event::list_mode_changes(modes, args, &list_modes) {
            if self.mask_cache(change.mode).is_none() {
                log::debug!("ignoring mode {} change on {server}.{channel}", change.mode);
                continue;
            }

            if change.add {
                let mut affected = vec![];
                if let Some(list) = self.users.get(server, channel, casemap) {
                    for hostmask in list.hostmasks() {
                        if self.patterns.hostmask_matches(&change.arg, hostmask) {
                            affected.push(hostmask.to_string());
                        }
                    }
                }

                if settings.display_affected && !affected.is_empty() {
                    log::info!(
                        "mask {} affects ({}): {}",
                        change.arg,
                        affected.len(),
                        affected.join(" ")
                    );
                }

                let update = MaskUpdate {
                    hostmask: affected.first().cloned(),
                    set_by: Some(set_by.to_string()),
                    set_at: Some(now),
                    expires: None,
                };

                if let Some(cache) = self.mask_cache(change.mode) {
                    cache.add(server, channel, &change.arg, update, now, casemap);
                }
            } else if let Some(cache) = self.mask_cache(change.mode) {
                cache.remove(server, channel, Some(&change.arg), casemap);
            }
        }
    }

    fn on_list_entry(
        &mut self,
        server: &str,
        channel: &str,
        mask: &str,
        set_by: Option<String>,
        set_at: Option<Posix>,
        now: Posix,
    ) {
        let Some(head) = self.fetches.head().cloned() else {
            log::debug!("ignoring list entry for {server}.{channel}, no fetch in flight");
            return;
        };

        let casemap = self.casemap(server);
        if (casemap.normalize(server), casemap.normalize(channel))
            != (head.server.clone(), head.channel.clone())
        {
            log::warn!(
                "got mask from unexpected server/channel: expected {}.{}, got {server}.{channel}",
                head.server,
                head.channel
            );
        }

        let update = MaskUpdate {
            hostmask: None,
            set_by,
            set_at,
            expires: None,
        };

        if let Some(cache) = self.mask_cache(head.mode) {
            cache.add(&head.server, &head.channel, mask, update, now, casemap);
        }
    }

    fn on_list_end(&mut self, server: &str, channel: &str, now: Posix) {
        let Some(head) = self.fetches.pop() else {
            log::debug!("ignoring list end for {server}.{channel}, no fetch in flight");
            return;
        };

        let casemap = self.casemap(&head.server);
        let remaining = self.fetches.len();

        if let Some(cache) = self.mask_cache(head.mode) {
            let list = cache.ensure(&head.server, &head.channel, casemap);
            list.fetch_time = Some(now);

            log::info!(
                "got {}.{} +{} masks ({} masks)",
                head.server,
                head.channel,
                head.mode,
                list.len()
            );
        }

        if remaining == 0 {
            log::debug!("mask fetch complete");
        }
    }
}
