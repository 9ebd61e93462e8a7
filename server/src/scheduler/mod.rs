//! Tick-driven reconciliation of remote call results with live game state.
//!
//! The scheduler owns two queues of [`Continuation`]s:
//!
//! - the **session** queue holds effects on the current game session. It is
//!   replaced wholesale by [`Scheduler::begin_session`]; unresolved entries
//!   are dropped, which is safe because they only touch that session.
//! - the **process** queue holds effects whose remote write must outlive a
//!   session, such as team saves. It is created with the scheduler and
//!   force-drained by [`Scheduler::on_shutdown`], which records every
//!   durable entry in the fallback log.
//!
//! All evaluation happens inline on the caller's thread. No continuation is
//! evaluated twice in one tick, and continuations enqueued while a tick is
//! running are first evaluated on the following tick.

mod continuation;
mod queue;

pub use continuation::{Continuation, Cx, Enqueue, Evaluation, Outcome};
pub use queue::{PendingQueue, SweepStats};

use continuation::Staged;
use log::{debug, info, warn};

use crate::epoch::EpochSource;
use crate::fallback::FallbackSink;

/// Result of one call to [`Scheduler::on_tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub session: SweepStats,
    pub process: SweepStats,
    pub session_pending: usize,
    pub process_pending: usize,
}

/// Result of [`Scheduler::on_shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Durable continuations written to the fallback log.
    pub recorded: usize,
    /// Durable continuations whose record could not be written.
    pub lost: usize,
    /// Non-durable continuations dropped without effect.
    pub discarded: usize,
}

pub struct Scheduler<C> {
    session: PendingQueue<C>,
    process: PendingQueue<C>,
    fallback: Box<dyn FallbackSink>,
    process_deadline: Option<u64>,
    tick: u64,
    totals: SweepStats,
    shut_down: bool,
}

impl<C> Scheduler<C> {
    pub fn new(fallback: Box<dyn FallbackSink>) -> Self {
        Self {
            session: PendingQueue::new(),
            process: PendingQueue::new(),
            fallback,
            process_deadline: None,
            tick: 0,
            totals: SweepStats::default(),
            shut_down: false,
        }
    }

    /// Default number of ticks a process-scoped call may stay unresolved.
    pub fn with_process_deadline(mut self, ticks: Option<u64>) -> Self {
        self.process_deadline = ticks;
        self
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn session_len(&self) -> usize {
        self.session.len()
    }

    pub fn process_len(&self) -> usize {
        self.process.len()
    }

    pub fn process_queue(&self) -> &PendingQueue<C> {
        &self.process
    }

    /// Totals over every tick so far.
    pub fn totals(&self) -> SweepStats {
        self.totals
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Starts a new game session. Every session-scoped continuation is
    /// dropped without being evaluated. Returns how many were dropped.
    pub fn begin_session(&mut self) -> usize {
        let dropped = self.session.drain().len();
        if dropped > 0 {
            debug!("New session, dropped {} pending session calls", dropped);
        }
        dropped
    }

    /// Force-drains the process queue. Durable continuations that have not
    /// completed are written to the fallback log whether or not their call
    /// has settled; the rest are discarded. The session queue is discarded.
    /// Calling this more than once has no further effect.
    pub fn on_shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.shut_down {
            return report;
        }
        self.shut_down = true;

        report.discarded += self.session.drain().len();
        for continuation in self.process.drain() {
            if continuation.is_durable() {
                if continuation.record(self.fallback.as_mut()) {
                    report.recorded += 1;
                } else {
                    report.lost += 1;
                }
            } else {
                report.discarded += 1;
            }
        }

        info!(
            "Scheduler shut down: {} recorded, {} lost, {} discarded",
            report.recorded, report.lost, report.discarded
        );
        report
    }

    fn push_process(&mut self, mut continuation: Continuation<C>) {
        if self.shut_down {
            if continuation.is_durable() {
                warn!(
                    "{} enqueued after shutdown, recording it",
                    continuation.verb()
                );
                continuation.record(self.fallback.as_mut());
            }
            return;
        }
        if let Some(ticks) = self.process_deadline {
            continuation.set_deadline_if_unset(self.tick + ticks);
        }
        self.process.push(continuation);
    }
}

impl<C: EpochSource> Scheduler<C> {
    /// Evaluates both queues once. Must be called once per simulation step.
    pub fn on_tick(&mut self, game: &mut C) -> TickReport {
        self.tick += 1;
        let tick = self.tick;
        let mut staged = Staged::default();

        let (session, process) = {
            let mut cx = Cx::new(game, tick, &mut staged, self.fallback.as_mut());
            let session = self.session.sweep(&mut cx);
            let process = self.process.sweep(&mut cx);
            (session, process)
        };

        for continuation in staged.session {
            self.session.push(continuation);
        }
        for continuation in staged.process {
            self.push_process(continuation);
        }

        self.totals.merge(session);
        self.totals.merge(process);

        TickReport {
            tick,
            session,
            process,
            session_pending: self.session.len(),
            process_pending: self.process.len(),
        }
    }
}

impl<C> Enqueue<C> for Scheduler<C> {
    fn enqueue_session(&mut self, continuation: Continuation<C>) {
        if self.shut_down {
            return;
        }
        self.session.push(continuation);
    }

    fn enqueue_process(&mut self, continuation: Continuation<C>) {
        self.push_process(continuation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::{EpochGuard, RunId, SlotEpochs};
    use crate::fallback::MemoryFallback;
    use crate::rpc::{RpcError, RpcFuture};
    use shared::rpc::{Request, TeamLoadRequest, Text};

    struct Game {
        epochs: SlotEpochs,
        run: RunId,
        chat: Vec<String>,
    }

    impl EpochSource for Game {
        fn slot_epoch(&self, slot: usize) -> Option<u64> {
            self.epochs.get(slot)
        }

        fn run_id(&self) -> RunId {
            self.run
        }
    }

    fn game() -> Game {
        Game {
            epochs: SlotEpochs::new(4),
            run: RunId::from_raw(1),
            chat: Vec::new(),
        }
    }

    fn scheduler(sink: &MemoryFallback) -> Scheduler<Game> {
        Scheduler::new(Box::new(sink.clone()))
    }

    fn say(future: RpcFuture<Text>) -> Continuation<Game> {
        Continuation::new("show_times", future, |text: Text, cx: &mut Cx<'_, Game>| {
            cx.game.chat.push(text.text)
        })
    }

    fn done_request(code: &str) -> Request {
        Request::LoadingTeamDone(TeamLoadRequest {
            code: code.to_string(),
            map_name: "Tutorial".to_string(),
        })
    }

    #[test]
    fn test_applied_on_resolving_tick_only() {
        let sink = MemoryFallback::new();
        let mut scheduler = scheduler(&sink);
        let mut game = game();
        let (resolver, future) = RpcFuture::channel();
        scheduler.enqueue_session(say(future));

        for _ in 0..3 {
            scheduler.on_tick(&mut game);
        }
        assert!(game.chat.is_empty());
        assert_eq!(scheduler.session_len(), 1);

        resolver
            .send(Ok(shared::rpc::Response::Text(Text {
                text: "7 times".to_string(),
            })))
            .unwrap();
        let report = scheduler.on_tick(&mut game);
        assert_eq!(report.session.applied, 1);
        assert_eq!(report.session_pending, 0);

        scheduler.on_tick(&mut game);
        assert_eq!(game.chat, vec!["7 times"]);
        assert_eq!(scheduler.totals().applied, 1);
    }

    #[test]
    fn test_begin_session_drops_session_work_only() {
        let sink = MemoryFallback::new();
        let mut scheduler = scheduler(&sink);
        let (_a, session_future) = RpcFuture::channel();
        let (_b, process_future) = RpcFuture::channel();
        scheduler.enqueue_session(say(session_future));
        scheduler.enqueue_process(say(process_future).durable(done_request("x")));

        assert_eq!(scheduler.begin_session(), 1);
        assert_eq!(scheduler.session_len(), 0);
        assert_eq!(scheduler.process_len(), 1);
    }

    #[test]
    fn test_run_guard_goes_stale_on_new_session() {
        let sink = MemoryFallback::new();
        let mut scheduler = scheduler(&sink);
        let mut game = game();
        let (resolver, future) = RpcFuture::channel();
        scheduler.enqueue_process(say(future).guarded(EpochGuard::Run(game.run)));

        game.run = RunId::from_raw(2);
        resolver
            .send(Ok(shared::rpc::Response::Text(Text {
                text: "old record".to_string(),
            })))
            .unwrap();
        let report = scheduler.on_tick(&mut game);
        assert_eq!(report.process.stale, 1);
        assert!(game.chat.is_empty());
    }

    #[test]
    fn test_shutdown_records_durable_regardless_of_readiness() {
        let sink = MemoryFallback::new();
        let mut scheduler = scheduler(&sink);
        let (_unresolved, pending) = RpcFuture::channel();
        scheduler.enqueue_process(say(pending).durable(done_request("pending")));
        scheduler.enqueue_process(
            say(RpcFuture::resolved(Ok(Text {
                text: String::new(),
            })))
            .durable(done_request("ready")),
        );
        let (_other, lookup) = RpcFuture::channel();
        scheduler.enqueue_process(say(lookup));
        let (_session, session) = RpcFuture::channel();
        scheduler.enqueue_session(say(session));

        let report = scheduler.on_shutdown();
        assert_eq!(report.recorded, 2);
        assert_eq!(report.discarded, 2);
        assert_eq!(
            sink.requests(),
            vec![done_request("pending"), done_request("ready")]
        );

        // Idempotent.
        assert_eq!(scheduler.on_shutdown(), ShutdownReport::default());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_process_deadline_applies_to_staged_continuations() {
        let sink = MemoryFallback::new();
        let mut scheduler = scheduler(&sink).with_process_deadline(Some(2));
        let mut game = game();

        scheduler.enqueue_session(Continuation::new(
            "load_team",
            RpcFuture::resolved(Ok(Text {
                text: String::new(),
            })),
            |_: Text, cx: &mut Cx<'_, Game>| {
                let (resolver, never) = RpcFuture::<()>::channel();
                cx.enqueue_process(
                    Continuation::new(
                        "loading_team_done",
                        never,
                        move |_: (), _: &mut Cx<'_, Game>| drop(resolver),
                    )
                    .durable(done_request("abc")),
                );
            },
        ));

        let first = scheduler.on_tick(&mut game);
        assert_eq!(first.session.applied, 1);
        assert_eq!(first.process.evaluated, 0);
        assert_eq!(scheduler.process_len(), 1);
        assert_eq!(
            scheduler.process_queue().verbs(),
            vec!["loading_team_done"]
        );

        // Enqueued on tick 1 with a two tick budget.
        let second = scheduler.on_tick(&mut game);
        assert_eq!(second.process.evaluated, 1);
        assert_eq!(second.process.expired, 0);
        let third = scheduler.on_tick(&mut game);
        assert_eq!(third.process.expired, 1);
        assert_eq!(sink.len(), 1);
        assert_eq!(scheduler.process_len(), 0);
    }

    #[test]
    fn test_failure_without_durability_is_not_recorded() {
        let sink = MemoryFallback::new();
        let mut scheduler = scheduler(&sink);
        let mut game = game();
        scheduler.enqueue_session(say(RpcFuture::resolved(Err(RpcError::Transport(
            "reset".to_string(),
        )))));

        let report = scheduler.on_tick(&mut game);
        assert_eq!(report.session.failed, 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_enqueue_after_shutdown() {
        let sink = MemoryFallback::new();
        let mut scheduler = scheduler(&sink);
        scheduler.on_shutdown();

        let (_r, future) = RpcFuture::channel();
        scheduler.enqueue_process(say(future).durable(done_request("late")));
        let (_s, lookup) = RpcFuture::channel();
        scheduler.enqueue_session(say(lookup));

        assert_eq!(scheduler.process_len(), 0);
        assert_eq!(scheduler.session_len(), 0);
        assert_eq!(sink.requests(), vec![done_request("late")]);
        assert!(scheduler.is_shut_down());
    }
}
