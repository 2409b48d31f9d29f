use itertools::Itertools;
use thiserror::Error;

use crate::config::Settings;
use crate::host::{Context, Host, Member};
use crate::mask::{self, Hostmask, Strategy};
use crate::queue::{Action, Overflow};
use crate::service::Service;
use crate::time::Posix;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no command defined for get op")]
    NoOpCommand,
    #[error("not in an IRC channel")]
    NotJoined,
    #[error(transparent)]
    QueueOverflow(#[from] Overflow),
    #[error("found nothing matching the given targets")]
    NoTargets,
}

/// Expands the `$server`, `$channel` and `$nick` variables of a configured
/// command.
pub(crate) fn replace_vars(command: &str, context: &Context) -> String {
    command
        .replace("$server", &context.server)
        .replace("$channel", &context.channel)
        .replace("$nick", &context.nick)
}

impl Service {
    /// Whether we currently hold op on the context's channel. `None` when
    /// not joined.
    pub fn has_op(&self, context: &Context, host: &dyn Host) -> Option<bool> {
        self.member_flag(context, &context.nick, host, |member| member.op)
    }

    pub fn has_voice(&self, context: &Context, nick: &str, host: &dyn Host) -> Option<bool> {
        self.member_flag(context, nick, host, |member| member.voice)
    }

    fn member_flag(
        &self,
        context: &Context,
        nick: &str,
        host: &dyn Host,
        flag: impl Fn(&Member) -> bool,
    ) -> Option<bool> {
        let casemap = self.casemap(&context.server);
        let members = host.members(&context.server, &context.channel)?;
        let nick = casemap.normalize(nick);

        members
            .iter()
            .find(|member| casemap.normalize(&member.nick) == nick)
            .map(flag)
    }

    fn buffer_key(&self, context: &Context) -> (String, String) {
        let casemap = self.casemap(&context.server);

        (
            casemap.normalize(&context.server),
            casemap.normalize(&context.channel),
        )
    }

    /// Queues a privilege request unless op is already held, and marks the
    /// channel tracked either way. Returns whether op was already held.
    fn request_op(
        &mut self,
        context: &Context,
        settings: &Settings,
        host: &mut dyn Host,
    ) -> Result<bool, Error> {
        let held = self.has_op(context, host).ok_or(Error::NotJoined)?;

        if !held {
            if settings.op_command.is_empty() {
                return Err(Error::NoOpCommand);
            }

            self.queue.push(
                context.clone(),
                Action::AwaitPrivilege(replace_vars(&settings.op_command, context)),
            )?;
        }

        self.queue.push(context.clone(), Action::Track)?;

        Ok(held)
    }

    /// Starts a privileged action. Returns whether op is held independently
    /// of this service, in which case it is never dropped on the
    /// operator's behalf.
    fn begin_privileged(
        &mut self,
        context: &Context,
        settings: &Settings,
        host: &mut dyn Host,
    ) -> Result<bool, Error> {
        let held = self.request_op(context, settings, host)?;

        Ok(held && !self.deop_at.contains_key(&self.buffer_key(context)))
    }

    /// Runs the queued steps and schedules the auto-release. Repeated
    /// privileged activity extends the pending release instead of stacking
    /// timers.
    fn end_privileged(
        &mut self,
        context: &Context,
        settings: &Settings,
        manual: bool,
        now: Posix,
        host: &mut dyn Host,
    ) {
        self.run_queue(now, host);

        if manual || !settings.autodeop {
            return;
        }

        if settings.autodeop_delay > 0 {
            self.deop_at.insert(
                self.buffer_key(context),
                (context.clone(), now.plus(settings.autodeop_delay)),
            );
        } else {
            // release as soon as the queued actions have gone out
            let command = replace_vars(&settings.deop_command, context);
            if self
                .queue
                .push(context.clone(), Action::Command(command))
                .is_ok()
            {
                self.run_queue(now, host);
            }
        }
    }

    /// Requests op and keeps it: a pending auto-release for the channel is
    /// cancelled, on the assumption the operator wants to stay opped.
    pub fn op(&mut self, context: &Context, now: Posix, host: &mut dyn Host) -> Result<(), Error> {
        let settings = self.config.settings(&context.server, &context.channel);
        let held = self.request_op(context, &settings, host)?;

        if held && self.deop_at.remove(&self.buffer_key(context)).is_some() {
            log::debug!("cancelling pending deop for {context}");
        }

        self.run_queue(now, host);
        Ok(())
    }

    pub fn deop(&mut self, context: &Context, now: Posix, host: &mut dyn Host) {
        self.deop_at.remove(&self.buffer_key(context));
        self.drop_op(context, now, host);
    }

    pub(crate) fn drop_op(&mut self, context: &Context, now: Posix, host: &mut dyn Host) {
        if self.has_op(context, host) == Some(true) {
            let settings = self.config.settings(&context.server, &context.channel);
            let command = replace_vars(&settings.deop_command, context);

            if self
                .queue
                .push(context.clone(), Action::Command(command))
                .is_ok()
            {
                self.run_queue(now, host);
            }
        }
    }

    pub fn kick(
        &mut self,
        context: &Context,
        nicks: &[String],
        reason: Option<&str>,
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        let settings = self.config.settings(&context.server, &context.channel);
        let nicks = limit_multi(nicks, settings.enable_multi_kick);

        if nicks.is_empty() {
            return Err(Error::NoTargets);
        }

        let manual = self.begin_privileged(context, &settings, host)?;
        let reason = reason.unwrap_or(&settings.kick_reason).to_string();

        for nick in nicks {
            self.push_kick(context, nick, &reason, &settings)?;
        }

        self.end_privileged(context, &settings, manual, now, host);
        Ok(())
    }

    fn push_kick(
        &mut self,
        context: &Context,
        nick: &str,
        reason: &str,
        settings: &Settings,
    ) -> Result<(), Overflow> {
        let command = if settings.enable_remove {
            format!("/quote remove {} {nick} :{reason}", context.channel)
        } else {
            format!("/kick {nick} {reason}")
        };

        self.queue.push(context.clone(), Action::Command(command))
    }

    pub fn ban(
        &mut self,
        context: &Context,
        targets: &[String],
        strategies: Option<&[Strategy]>,
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        self.set_masks(context, 'b', targets, strategies, now, host)
    }

    /// Sets quiets instead of bans, on networks whose mode `q` supports it.
    pub fn mute(
        &mut self,
        context: &Context,
        targets: &[String],
        strategies: Option<&[Strategy]>,
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        self.set_masks(context, 'q', targets, strategies, now, host)
    }

    pub fn unban(
        &mut self,
        context: &Context,
        targets: &[String],
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        self.remove_masks(context, 'b', targets, now, host)
    }

    pub fn unmute(
        &mut self,
        context: &Context,
        targets: &[String],
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        self.remove_masks(context, 'q', targets, now, host)
    }

    /// Bans and kicks in one go: the independent ban and kick operations,
    /// invoked together, ban first.
    pub fn ban_kick(
        &mut self,
        context: &Context,
        nicks: &[String],
        reason: Option<&str>,
        strategies: Option<&[Strategy]>,
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        let settings = self.config.settings(&context.server, &context.channel);
        let nicks = limit_multi(nicks, settings.enable_multi_kick);
        let manual = self.begin_privileged(context, &settings, host)?;
        let strategies = strategies.unwrap_or(&settings.default_banmask);
        let reason = reason.unwrap_or(&settings.kick_reason).to_string();
        let casemap = self.casemap(&context.server);

        let mut kicked = false;
        for nick in nicks {
            let hostmask = self
                .users_or_snapshot(&context.server, &context.channel, host)
                .and_then(|list| list.hostmask(nick, casemap))
                .and_then(Hostmask::parse);

            if let Some(hostmask) = hostmask {
                let banmask = mask::build(&hostmask, strategies);
                self.push_mode_masks(context, '+', 'b', &[banmask])?;
                self.push_kick(context, nick, &reason, &settings)?;
                kicked = true;
            }
        }

        if !kicked {
            self.queue.clear();
            return Err(Error::NoTargets);
        }

        self.end_privileged(context, &settings, manual, now, host);
        Ok(())
    }

    pub fn topic(
        &mut self,
        context: &Context,
        topic: &str,
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        self.simple_privileged(context, format!("/topic {topic}"), now, host)
    }

    pub fn channel_mode(
        &mut self,
        context: &Context,
        modes: &str,
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        self.simple_privileged(context, format!("/mode {modes}"), now, host)
    }

    pub fn voice(
        &mut self,
        context: &Context,
        nicks: &str,
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        self.simple_privileged(context, format!("/voice {nicks}"), now, host)
    }

    pub fn devoice(
        &mut self,
        context: &Context,
        nicks: &str,
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        self.simple_privileged(context, format!("/devoice {nicks}"), now, host)
    }

    fn simple_privileged(
        &mut self,
        context: &Context,
        command: String,
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        let settings = self.config.settings(&context.server, &context.channel);
        let manual = self.begin_privileged(context, &settings, host)?;

        self.queue.push(context.clone(), Action::Command(command))?;
        self.end_privileged(context, &settings, manual, now, host);
        Ok(())
    }

    fn set_masks(
        &mut self,
        context: &Context,
        mode: char,
        targets: &[String],
        strategies: Option<&[Strategy]>,
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        let settings = self.config.settings(&context.server, &context.channel);
        let manual = self.begin_privileged(context, &settings, host)?;
        let strategies = strategies.unwrap_or(&settings.default_banmask);
        let casemap = self.casemap(&context.server);

        let mode = if mode != 'b' && !self.supported_modes(&context.server).contains(mode) {
            log::error!(
                "{} doesn't seem to support channel mode '{mode}', using regular ban",
                context.server
            );
            'b'
        } else {
            mode
        };

        let mut masks = vec![];
        let mut devoice = vec![];

        for target in targets {
            if mask::is_hostmask(target) {
                masks.push(target.clone());
                continue;
            }

            let hostmask = self
                .users_or_snapshot(&context.server, &context.channel, host)
                .and_then(|list| list.hostmask(target, casemap))
                .and_then(Hostmask::parse);

            match hostmask {
                Some(hostmask) => {
                    masks.push(mask::build(&hostmask, strategies));

                    if self.has_voice(context, target, host) == Some(true) {
                        devoice.push(target.clone());
                    }
                }
                // let the server make sense of whatever this is
                None => masks.push(target.clone()),
            }
        }

        let masks = masks.into_iter().unique().collect::<Vec<_>>();

        if masks.is_empty() {
            self.queue.clear();
            return Err(Error::NoTargets);
        }

        if !devoice.is_empty() {
            self.queue.push(
                context.clone(),
                Action::Command(format!("/devoice {}", devoice.join(" "))),
            )?;
        }

        self.push_mode_masks(context, '+', mode, &masks)?;
        self.end_privileged(context, &settings, manual, now, host);
        Ok(())
    }

    fn remove_masks(
        &mut self,
        context: &Context,
        mode: char,
        targets: &[String],
        now: Posix,
        host: &mut dyn Host,
    ) -> Result<(), Error> {
        let settings = self.config.settings(&context.server, &context.channel);
        let manual = self.begin_privileged(context, &settings, host)?;

        let mode = if mode != 'b' && !self.supported_modes(&context.server).contains(mode) {
            log::error!(
                "{} doesn't seem to support channel mode '{mode}', using regular ban",
                context.server
            );
            'b'
        } else {
            mode
        };

        let mut masks = vec![];
        for target in targets {
            let found = self.search_masks(context, mode, target);

            if found.is_empty() {
                masks.push(target.clone());
            } else {
                masks.extend(found);
            }
        }

        let masks = masks.into_iter().unique().collect::<Vec<_>>();

        if masks.is_empty() {
            self.queue.clear();
            return Err(Error::NoTargets);
        }

        self.push_mode_masks(context, '-', mode, &masks)?;
        self.end_privileged(context, &settings, manual, now, host);
        Ok(())
    }

    /// Cached masks matching a target: a nick resolves through the user
    /// cache, a hostmask matches mask patterns, anything else is a wildcard
    /// pattern over the masks themselves.
    pub fn search_masks(&mut self, context: &Context, mode: char, target: &str) -> Vec<String> {
        let casemap = self.casemap(&context.server);
        let cache = match mode {
            'b' => &self.bans,
            'q' => &self.quiets,
            _ => return vec![],
        };

        if mask::is_hostmask(target) {
            cache.search_by_hostmask(
                &context.server,
                &context.channel,
                target,
                &mut self.patterns,
                casemap,
            )
        } else if mask::is_nick(target) {
            let Some(hostmask) = self.users.host_for_nick(
                &context.server,
                Some(&context.channel),
                target,
                casemap,
            ) else {
                return vec![];
            };

            cache.search_by_hostmask(
                &context.server,
                &context.channel,
                &hostmask,
                &mut self.patterns,
                casemap,
            )
        } else {
            cache.search_by_pattern(
                &context.server,
                &context.channel,
                target,
                &mut self.patterns,
                casemap,
            )
        }
    }

    fn push_mode_masks(
        &mut self,
        context: &Context,
        prefix: char,
        mode: char,
        masks: &[String],
    ) -> Result<(), Overflow> {
        let max_modes = self.max_modes(&context.server);

        for chunk in masks.chunks(max_modes) {
            let command = format!(
                "/mode {prefix}{} {}",
                mode.to_string().repeat(chunk.len()),
                chunk.join(" ")
            );

            self.queue.push(context.clone(), Action::Command(command))?;
        }

        Ok(())
    }
}

fn limit_multi(nicks: &[String], multi: bool) -> &[String] {
    if multi || nicks.len() <= 1 {
        nicks
    } else {
        &nicks[..1]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::event::Event;
    use crate::host::fake::{FakeHost, member};

    fn context() -> Context {
        Context::new("libera", "#test", "m4v")
    }

    fn service() -> Service {
        let config: Config = toml::from_str(
            r##"
            [servers.libera]
            chanmodes = "bq"
            modes = 4
            "##,
        )
        .expect("valid config");

        Service::new(config)
    }

    fn host_without_op() -> FakeHost {
        let mut host = FakeHost::new("m4v");
        host.join(
            "libera",
            "#test",
            vec![
                member("m4v", "~m@home", false, false),
                member("troll", "~t@bad.example", false, false),
                member("noisy", "~n@loud.example", false, true),
            ],
        );
        host
    }

    fn host_with_op() -> FakeHost {
        let mut host = host_without_op();
        host.join(
            "libera",
            "#test",
            vec![
                member("m4v", "~m@home", true, false),
                member("troll", "~t@bad.example", false, false),
                member("noisy", "~n@loud.example", false, true),
            ],
        );
        host
    }

    #[test]
    fn op_request_suspends_then_confirmation_resumes() {
        let mut service = service();
        let mut host = host_without_op();
        let now = Posix::from_seconds(1_000);

        service
            .ban(&context(), &["troll".to_string()], None, now, &mut host)
            .expect("ban queues");

        // only the privilege request went out
        assert_eq!(host.commands(), vec!["/msg chanserv op #test m4v"]);
        assert!(service.queue.is_suspended());
        assert!(!service.is_tracked("libera", "#test"));

        // grant for somebody else does not resume
        service.handle(
            Event::mode_from_params("libera", "#test", "ChanServ!s@services.", "+o somebody"),
            now,
            &mut host,
        );
        assert!(service.queue.is_suspended());

        service.handle(
            Event::mode_from_params("libera", "#test", "ChanServ!s@services.", "+o m4v"),
            now.plus(2),
            &mut host,
        );

        assert_eq!(
            host.commands(),
            vec!["/msg chanserv op #test m4v", "/mode +b *!*@bad.example"]
        );
        assert!(service.is_tracked("libera", "#test"));
        assert!(!service.queue.is_busy());
    }

    #[test]
    fn release_timers_coalesce() {
        let mut service = service();
        let mut host = host_without_op();
        let now = Posix::from_seconds(1_000);
        let key = ("libera".to_string(), "#test".to_string());

        service
            .ban(&context(), &["troll".to_string()], None, now, &mut host)
            .expect("ban queues");

        assert_eq!(service.deop_at[&key].1, now.plus(180));

        service.handle(
            Event::mode_from_params("libera", "#test", "ChanServ!s@services.", "+o m4v"),
            now.plus(2),
            &mut host,
        );
        host = host_with_op();

        // further privileged activity extends the hold instead of stacking
        service
            .kick(&context(), &["troll".to_string()], None, now.plus(100), &mut host)
            .expect("kick queues");

        assert_eq!(service.deop_at.len(), 1);
        assert_eq!(service.deop_at[&key].1, now.plus(280));

        service.tick(now.plus(279), &mut host);
        assert!(!host.commands().contains(&"/deop"));

        service.tick(now.plus(280), &mut host);
        assert_eq!(host.commands().last(), Some(&"/deop"));
        assert!(service.deop_at.is_empty());
    }

    #[test]
    fn already_opped_is_manual_and_never_released() {
        let mut service = service();
        let mut host = host_with_op();
        let now = Posix::from_seconds(0);

        service
            .kick(&context(), &["troll".to_string()], None, now, &mut host)
            .expect("kick queues");

        assert_eq!(host.commands(), vec!["/kick troll kthxbye!"]);
        assert!(service.deop_at.is_empty());
    }

    #[test]
    fn confirmation_timeout_purges_queue() {
        let mut service = service();
        let mut host = host_without_op();
        let now = Posix::from_seconds(0);

        service
            .ban(&context(), &["troll".to_string()], None, now, &mut host)
            .expect("ban queues");
        assert!(service.queue.is_busy());

        service.tick(now.plus(60), &mut host);

        assert!(!service.queue.is_busy());
        assert_eq!(host.commands().len(), 1);
    }

    #[test]
    fn missing_op_command_queues_nothing() {
        let config: Config =
            toml::from_str(r#"op_command = """#).expect("valid config");
        let mut service = Service::new(config);
        let mut host = host_without_op();

        let result = service.ban(
            &context(),
            &["troll".to_string()],
            None,
            Posix::from_seconds(0),
            &mut host,
        );

        assert!(matches!(result, Err(Error::NoOpCommand)));
        assert!(host.sent.is_empty());
        assert!(!service.queue.is_busy());
    }

    #[test]
    fn masks_are_batched_up_to_max_modes() {
        let mut service = service();
        let mut host = host_with_op();
        let now = Posix::from_seconds(0);

        let targets = (1..=6)
            .map(|n| format!("*!*@host{n}"))
            .collect::<Vec<_>>();

        service
            .ban(&context(), &targets, None, now, &mut host)
            .expect("ban queues");

        assert_eq!(
            host.commands(),
            vec![
                "/mode +bbbb *!*@host1 *!*@host2 *!*@host3 *!*@host4",
                "/mode +bb *!*@host5 *!*@host6",
            ]
        );
    }

    #[test]
    fn banning_a_voiced_member_devoices_first() {
        let mut service = service();
        let mut host = host_with_op();
        let now = Posix::from_seconds(0);

        service
            .ban(&context(), &["noisy".to_string()], None, now, &mut host)
            .expect("ban queues");

        assert_eq!(
            host.commands(),
            vec!["/devoice noisy", "/mode +b *!*@loud.example"]
        );
    }

    #[test]
    fn unban_resolves_through_the_caches() {
        let mut service = service();
        let mut host = host_with_op();
        let now = Posix::from_seconds(0);

        service.track("libera", "#test");
        service.snapshot_users("libera", "#test", &host);
        service.handle(
            Event::mode_from_params("libera", "#test", "m4v!~m@home", "+b *!*@bad.example"),
            now,
            &mut host,
        );

        service
            .unban(&context(), &["troll".to_string()], now, &mut host)
            .expect("unban queues");

        assert_eq!(host.commands().last(), Some(&"/mode -b *!*@bad.example"));
    }

    #[test]
    fn ban_kick_composes_both_operations() {
        let mut service = service();
        let mut host = host_with_op();
        let now = Posix::from_seconds(0);

        service
            .ban_kick(
                &context(),
                &["troll".to_string()],
                Some("bye"),
                None,
                now,
                &mut host,
            )
            .expect("bankick queues");

        assert_eq!(
            host.commands(),
            vec!["/mode +b *!*@bad.example", "/kick troll bye"]
        );
    }

    #[test]
    fn mute_falls_back_to_ban_when_unsupported() {
        let mut service = Service::new(Config::default());
        let mut host = host_with_op();
        let now = Posix::from_seconds(0);

        service
            .mute(&context(), &["troll".to_string()], None, now, &mut host)
            .expect("mute queues");

        assert_eq!(host.commands(), vec!["/mode +b *!*@bad.example"]);
    }

    #[test]
    fn explicit_op_cancels_pending_release() {
        let mut service = service();
        let mut host = host_with_op();
        let now = Posix::from_seconds(0);

        service.deop_at.insert(
            ("libera".to_string(), "#test".to_string()),
            (context(), now.plus(180)),
        );

        service.op(&context(), now, &mut host).expect("op runs");

        assert!(service.deop_at.is_empty());
        service.tick(now.plus(1_000), &mut host);
        assert!(!host.commands().contains(&"/deop"));
    }

    #[test]
    fn multi_kick_is_gated_by_config() {
        let mut service = service();
        let mut host = host_with_op();
        let now = Posix::from_seconds(0);

        service
            .kick(
                &context(),
                &["troll".to_string(), "noisy".to_string()],
                Some("out"),
                now,
                &mut host,
            )
            .expect("kick queues");

        assert_eq!(host.commands(), vec!["/kick troll out"]);
    }
}
