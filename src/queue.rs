use std::collections::VecDeque;

use crate::host::{Context, Host};
use crate::isupport::CaseMap;
use crate::time::Posix;

/// More pending steps than this aborts the whole queue. It happened once and
/// it wasn't pretty.
pub const MAX_PENDING: usize = 20;

/// How long a privilege request may stay unconfirmed.
pub const CONFIRM_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug, thiserror::Error)]
#[error("limit of {MAX_PENDING} commands in queue reached, aborting")]
pub struct Overflow;

/// A single queued protocol action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a command and continue.
    Command(String),
    /// Send a privilege request, then halt the queue until a matching grant
    /// is confirmed or the request times out.
    AwaitPrivilege(String),
    /// Add the channel to the tracked set. No network effect; applies even
    /// when the privilege request later fails.
    Track,
}

#[derive(Debug, Clone)]
struct Step {
    context: Context,
    action: Action,
    delay: u64,
}

/// The outstanding privilege request a suspended queue is waiting on.
#[derive(Debug, Clone)]
pub struct Suspension {
    pub context: Context,
    pub deadline: Posix,
}

/// What a `run` pass did.
#[derive(Debug, Default)]
pub struct Run {
    /// Channels marked tracked by executed `Track` steps.
    pub tracked: Vec<(String, String)>,
    /// True when the pass halted on an unconfirmed privilege request.
    pub suspended: bool,
}

/// An ordered, resumable sequence of outgoing commands. Steps execute in
/// insertion order; a privilege request suspends execution until the grant
/// arrives, and the remaining steps run from where it left off.
#[derive(Debug, Default)]
pub struct Queue {
    steps: VecDeque<Step>,
    delay: u64,
    suspension: Option<Suspension>,
}

impl Queue {
    /// Appends a step with default spacing: each command is scheduled one
    /// transport time unit after the previous, throttling bursts.
    pub fn push(&mut self, context: Context, action: Action) -> Result<(), Overflow> {
        let spacing = match action {
            Action::Track => 0,
            _ => 1,
        };

        self.steps.push_back(Step {
            context,
            action,
            delay: self.delay,
        });
        self.delay += spacing;

        if self.steps.len() > MAX_PENDING {
            log::error!("{}", Overflow);
            self.clear();
            return Err(Overflow);
        }

        Ok(())
    }

    /// Executes steps until the queue drains or a privilege request suspends
    /// it. Does nothing while already suspended.
    pub fn run(&mut self, now: Posix, host: &mut dyn Host) -> Run {
        let mut run = Run::default();

        if self.suspension.is_some() {
            run.suspended = true;
            return run;
        }

        while let Some(step) = self.steps.pop_front() {
            match step.action {
                Action::Command(command) => {
                    log::debug!("sending: {command:?}");
                    host.send(&step.context, &command, step.delay);
                }
                Action::Track => {
                    run.tracked
                        .push((step.context.server.clone(), step.context.channel.clone()));
                }
                Action::AwaitPrivilege(command) => {
                    log::debug!("sending: {command:?}, waiting for op");
                    host.send(&step.context, &command, step.delay);
                    self.suspension = Some(Suspension {
                        context: step.context,
                        deadline: now.plus(CONFIRM_TIMEOUT_SECONDS),
                    });
                    run.suspended = true;
                    return run;
                }
            }
        }

        self.delay = 0;
        run
    }

    /// Resumes a suspended queue if the grant matches the awaited server,
    /// channel and nick. Returns whether anything was resumed.
    pub fn confirm(
        &mut self,
        server: &str,
        channel: &str,
        nick: &str,
        casemap: CaseMap,
    ) -> bool {
        let matches = self.suspension.as_ref().is_some_and(|suspension| {
            casemap.normalize(&suspension.context.server) == casemap.normalize(server)
                && casemap.normalize(&suspension.context.channel) == casemap.normalize(channel)
                && casemap.normalize(&suspension.context.nick) == casemap.normalize(nick)
        });

        if matches {
            self.suspension = None;
        }

        matches
    }

    /// The awaited privilege request past its deadline, if any.
    pub fn timed_out(&self, now: Posix) -> Option<&Suspension> {
        self.suspension
            .as_ref()
            .filter(|suspension| now >= suspension.deadline)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension.is_some()
    }

    /// Whether any work remains, queued or awaiting confirmation.
    pub fn is_busy(&self) -> bool {
        !self.steps.is_empty() || self.suspension.is_some()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
        self.delay = 0;
        self.suspension = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::fake::FakeHost;

    fn context() -> Context {
        Context::new("libera", "#test", "m4v")
    }

    #[test]
    fn default_spacing_accumulates() {
        let mut queue = Queue::default();
        let mut host = FakeHost::new("m4v");

        for n in 0..5 {
            queue
                .push(context(), Action::Command(format!("/kick dude{n}")))
                .expect("queue has room");
        }

        let run = queue.run(Posix::from_seconds(0), &mut host);
        assert!(!run.suspended);

        let delays = host.sent.iter().map(|(_, _, delay)| *delay).collect::<Vec<_>>();
        assert_eq!(delays, vec![0, 1, 2, 3, 4]);

        // a full drain resets the offset
        queue
            .push(context(), Action::Command("/kick another".to_string()))
            .expect("queue has room");
        queue.run(Posix::from_seconds(0), &mut host);
        assert_eq!(host.sent.last().map(|(_, _, delay)| *delay), Some(0));
    }

    #[test]
    fn track_does_not_advance_spacing() {
        let mut queue = Queue::default();
        let mut host = FakeHost::new("m4v");

        queue
            .push(context(), Action::Command("/mode +b a!*@*".to_string()))
            .expect("queue has room");
        queue.push(context(), Action::Track).expect("queue has room");
        queue
            .push(context(), Action::Command("/mode +b b!*@*".to_string()))
            .expect("queue has room");

        let run = queue.run(Posix::from_seconds(0), &mut host);

        assert_eq!(run.tracked, vec![("libera".to_string(), "#test".to_string())]);
        let delays = host.sent.iter().map(|(_, _, delay)| *delay).collect::<Vec<_>>();
        assert_eq!(delays, vec![0, 1]);
    }

    #[test]
    fn overflow_aborts_everything() {
        let mut queue = Queue::default();

        for _ in 0..MAX_PENDING {
            queue
                .push(context(), Action::Command("/kick dude".to_string()))
                .expect("queue has room");
        }

        assert!(queue.push(context(), Action::Command("/kick dude".to_string())).is_err());
        assert!(queue.is_empty());
        assert!(!queue.is_busy());
    }

    #[test]
    fn suspension_halts_and_resumes() {
        let mut queue = Queue::default();
        let mut host = FakeHost::new("m4v");
        let now = Posix::from_seconds(0);

        queue
            .push(
                context(),
                Action::AwaitPrivilege("/msg chanserv op #test m4v".to_string()),
            )
            .expect("queue has room");
        queue.push(context(), Action::Track).expect("queue has room");
        queue
            .push(context(), Action::Command("/kick dude bye".to_string()))
            .expect("queue has room");

        let run = queue.run(now, &mut host);
        assert!(run.suspended);
        assert_eq!(host.commands(), vec!["/msg chanserv op #test m4v"]);

        // an unrelated grant does not resume
        assert!(!queue.confirm("libera", "#test", "somebody", CaseMap::RFC1459));
        assert!(queue.is_suspended());

        assert!(queue.confirm("libera", "#TEST", "M4V", CaseMap::RFC1459));
        let run = queue.run(now.plus(1), &mut host);

        assert!(!run.suspended);
        assert_eq!(run.tracked.len(), 1);
        assert_eq!(
            host.commands(),
            vec!["/msg chanserv op #test m4v", "/kick dude bye"]
        );
    }

    #[test]
    fn timeout_is_reported_by_deadline() {
        let mut queue = Queue::default();
        let mut host = FakeHost::new("m4v");
        let now = Posix::from_seconds(100);

        queue
            .push(context(), Action::AwaitPrivilege("/oper up".to_string()))
            .expect("queue has room");
        queue
            .push(context(), Action::Command("/kick dude".to_string()))
            .expect("queue has room");
        queue.run(now, &mut host);

        assert!(queue.timed_out(now.plus(CONFIRM_TIMEOUT_SECONDS - 1)).is_none());
        assert!(queue.timed_out(now.plus(CONFIRM_TIMEOUT_SECONDS)).is_some());

        queue.clear();
        assert!(!queue.is_busy());
        assert_eq!(host.commands().len(), 1);
    }
}
