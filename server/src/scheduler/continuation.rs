//! Deferred work that reconciles one remote call with live game state.

use log::{debug, error, warn};
use shared::rpc::Request;

use crate::epoch::{EpochGuard, EpochSource};
use crate::fallback::{record_request, FallbackSink};
use crate::rpc::{FromResponse, RpcError, RpcFuture};

/// Whether a continuation stays in its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Done,
}

/// What happened to a continuation during one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Result not available yet.
    Pending,
    /// Result applied to live state.
    Applied,
    /// Database reported the entity as absent.
    Absent,
    /// Remote call failed.
    Failed,
    /// Addressee changed since the call was issued; effect suppressed.
    Stale,
    /// Deadline passed before the call settled.
    Expired,
}

impl Evaluation {
    pub fn outcome(self) -> Outcome {
        match self {
            Evaluation::Pending => Outcome::Pending,
            _ => Outcome::Done,
        }
    }
}

/// Anything continuations can be queued on.
pub trait Enqueue<C> {
    fn enqueue_session(&mut self, continuation: Continuation<C>);
    fn enqueue_process(&mut self, continuation: Continuation<C>);
}

/// Continuations created while a queue is being swept. They are appended
/// after the sweep, so they are first evaluated on the next tick.
pub(crate) struct Staged<C> {
    pub(crate) session: Vec<Continuation<C>>,
    pub(crate) process: Vec<Continuation<C>>,
}

impl<C> Default for Staged<C> {
    fn default() -> Self {
        Self {
            session: Vec::new(),
            process: Vec::new(),
        }
    }
}

/// Context handed to continuation callbacks.
pub struct Cx<'a, C> {
    pub game: &'a mut C,
    tick: u64,
    staged: &'a mut Staged<C>,
    fallback: &'a mut dyn FallbackSink,
}

impl<'a, C> Cx<'a, C> {
    pub(crate) fn new(
        game: &'a mut C,
        tick: u64,
        staged: &'a mut Staged<C>,
        fallback: &'a mut dyn FallbackSink,
    ) -> Self {
        Self {
            game,
            tick,
            staged,
            fallback,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }
}

impl<C> Enqueue<C> for Cx<'_, C> {
    fn enqueue_session(&mut self, continuation: Continuation<C>) {
        self.staged.session.push(continuation);
    }

    fn enqueue_process(&mut self, continuation: Continuation<C>) {
        self.staged.process.push(continuation);
    }
}

type Callback<C> = Box<dyn FnOnce(&mut Cx<'_, C>)>;

/// Type-erased future plus the closure that consumes its value.
trait Settle<C> {
    fn is_ready(&mut self) -> bool;

    /// Takes the result. On success runs the callback when `apply` is set.
    fn settle(self: Box<Self>, cx: &mut Cx<'_, C>, apply: bool) -> Result<(), RpcError>;
}

struct Call<R, F> {
    future: RpcFuture<R>,
    on_found: F,
}

impl<C, R, F> Settle<C> for Call<R, F>
where
    R: FromResponse + Clone,
    F: FnOnce(R, &mut Cx<'_, C>),
{
    fn is_ready(&mut self) -> bool {
        self.future.is_ready()
    }

    fn settle(self: Box<Self>, cx: &mut Cx<'_, C>, apply: bool) -> Result<(), RpcError> {
        let Call {
            mut future,
            on_found,
        } = *self;
        let value = future
            .take()
            .unwrap_or_else(|| Err(RpcError::Transport("settled before ready".to_string())))?;
        if apply {
            on_found(value, cx);
        }
        Ok(())
    }
}

/// A pending remote call together with what to do once it settles.
///
/// Evaluation order is fixed:
/// 1. a stale guard ends the continuation without applying anything;
/// 2. an unsettled future leaves it pending;
/// 3. a settled future is taken once and routed to the found, absent or
///    failure branch.
///
/// Durable continuations carry the original request. If the call fails, or
/// the process shuts down first, the request goes to the fallback log. A
/// stale guard does not end a durable continuation early: its effect is
/// suppressed, but it still waits for the write to be confirmed.
pub struct Continuation<C> {
    verb: &'static str,
    guard: Option<EpochGuard>,
    durable: Option<Request>,
    deadline: Option<u64>,
    call: Option<Box<dyn Settle<C>>>,
    on_absent: Option<Callback<C>>,
}

impl<C: 'static> Continuation<C> {
    pub fn new<R, F>(verb: &'static str, future: RpcFuture<R>, on_found: F) -> Self
    where
        R: FromResponse + Clone + 'static,
        F: FnOnce(R, &mut Cx<'_, C>) + 'static,
    {
        Self {
            verb,
            guard: None,
            durable: None,
            deadline: None,
            call: Some(Box::new(Call { future, on_found })),
            on_absent: None,
        }
    }

    pub fn guarded(mut self, guard: EpochGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Runs `f` when the database answers "not found".
    pub fn on_absent<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut Cx<'_, C>) + 'static,
    {
        self.on_absent = Some(Box::new(f));
        self
    }

    /// Marks the continuation durable; `request` is what gets recorded.
    pub fn durable(mut self, request: Request) -> Self {
        self.durable = Some(request);
        self
    }

    /// Tick at which an unsettled call is given up.
    pub fn deadline(mut self, tick: u64) -> Self {
        self.deadline = Some(tick);
        self
    }
}

impl<C> Continuation<C> {
    pub fn verb(&self) -> &'static str {
        self.verb
    }

    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }

    pub fn deadline_tick(&self) -> Option<u64> {
        self.deadline
    }

    pub(crate) fn set_deadline_if_unset(&mut self, tick: u64) {
        if self.deadline.is_none() {
            self.deadline = Some(tick);
        }
    }

    /// Appends the durable request to the fallback log. Returns false for
    /// non-durable continuations or when the append failed.
    pub(crate) fn record(&self, fallback: &mut dyn FallbackSink) -> bool {
        match &self.durable {
            Some(request) => record_request(fallback, request),
            None => false,
        }
    }
}

impl<C: EpochSource> Continuation<C> {
    pub(crate) fn evaluate(&mut self, cx: &mut Cx<'_, C>) -> Evaluation {
        let stale = match &self.guard {
            Some(guard) => !guard.is_current(&*cx.game),
            None => false,
        };
        if stale && self.durable.is_none() {
            debug!("Dropping stale {} continuation", self.verb);
            return Evaluation::Stale;
        }

        let Some(call) = self.call.as_mut() else {
            return Evaluation::Stale;
        };

        if !call.is_ready() {
            return match self.deadline {
                Some(deadline) if cx.tick >= deadline => {
                    if self.durable.is_some() {
                        warn!("{} call timed out, recording it", self.verb);
                        self.record(cx.fallback);
                    } else {
                        warn!("{} call timed out, dropping it", self.verb);
                    }
                    self.call = None;
                    Evaluation::Expired
                }
                _ => Evaluation::Pending,
            };
        }

        let Some(call) = self.call.take() else {
            return Evaluation::Stale;
        };

        match call.settle(cx, !stale) {
            Ok(()) if stale => Evaluation::Stale,
            Ok(()) => Evaluation::Applied,
            Err(e) if e.is_not_found() => {
                debug!("{}: not found", self.verb);
                if stale {
                    return Evaluation::Stale;
                }
                if let Some(on_absent) = self.on_absent.take() {
                    on_absent(cx);
                }
                Evaluation::Absent
            }
            Err(e) => {
                error!("{} failed: {}", self.verb, e);
                self.record(cx.fallback);
                Evaluation::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::{RunId, SlotEpochs, SlotGuard};
    use crate::fallback::MemoryFallback;
    use shared::rpc::{MapName, Response, Text};

    struct Game {
        epochs: SlotEpochs,
        chat: Vec<String>,
    }

    impl EpochSource for Game {
        fn slot_epoch(&self, slot: usize) -> Option<u64> {
            self.epochs.get(slot)
        }

        fn run_id(&self) -> RunId {
            RunId::from_raw(1)
        }
    }

    fn game() -> Game {
        Game {
            epochs: SlotEpochs::new(4),
            chat: Vec::new(),
        }
    }

    fn text(s: &str) -> Response {
        Response::Text(Text {
            text: s.to_string(),
        })
    }

    fn evaluate(continuation: &mut Continuation<Game>, game: &mut Game, sink: &mut MemoryFallback) -> Evaluation {
        let mut staged = Staged::default();
        let mut cx = Cx::new(game, 0, &mut staged, sink);
        continuation.evaluate(&mut cx)
    }

    fn chat_continuation(future: RpcFuture<Text>) -> Continuation<Game> {
        Continuation::new("map_info", future, |text: Text, cx: &mut Cx<'_, Game>| {
            cx.game.chat.push(text.text)
        })
        .on_absent(|cx| cx.game.chat.push("absent".to_string()))
    }

    #[test]
    fn test_pending_then_applied_once() {
        let mut game = game();
        let mut sink = MemoryFallback::new();
        let (resolver, future) = RpcFuture::channel();
        let mut continuation = chat_continuation(future);

        assert_eq!(evaluate(&mut continuation, &mut game, &mut sink), Evaluation::Pending);
        resolver.send(Ok(text("hello"))).unwrap();
        assert_eq!(evaluate(&mut continuation, &mut game, &mut sink), Evaluation::Applied);
        assert_eq!(game.chat, vec!["hello"]);

        // Settled continuations never apply again.
        assert_eq!(evaluate(&mut continuation, &mut game, &mut sink), Evaluation::Stale);
        assert_eq!(game.chat.len(), 1);
    }

    #[test]
    fn test_not_found_runs_absent_branch() {
        let mut game = game();
        let mut sink = MemoryFallback::new();
        let mut continuation = chat_continuation(RpcFuture::resolved(Err(RpcError::NotFound)));

        assert_eq!(evaluate(&mut continuation, &mut game, &mut sink), Evaluation::Absent);
        assert_eq!(game.chat, vec!["absent"]);
        assert!(sink.is_empty());
    }

    /// Collects the levels logged on the current test thread.
    struct LevelCapture;

    thread_local! {
        static LEVELS: std::cell::RefCell<Vec<log::Level>> = std::cell::RefCell::new(Vec::new());
    }

    impl log::Log for LevelCapture {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            LEVELS.with(|levels| levels.borrow_mut().push(record.level()));
        }

        fn flush(&self) {}
    }

    static CAPTURE: LevelCapture = LevelCapture;

    fn captured_levels(run: impl FnOnce()) -> Vec<log::Level> {
        let _ = log::set_logger(&CAPTURE);
        log::set_max_level(log::LevelFilter::Trace);
        LEVELS.with(|levels| levels.borrow_mut().clear());
        run();
        LEVELS.with(|levels| levels.borrow().clone())
    }

    #[test]
    fn test_not_found_is_never_logged_as_error() {
        let levels = captured_levels(|| {
            let mut game = game();
            let mut sink = MemoryFallback::new();
            let request = Request::MapInfo(MapName {
                name: "Kobra".to_string(),
            });
            let mut continuation = chat_continuation(RpcFuture::resolved(Err(RpcError::NotFound)))
                .durable(request);
            assert_eq!(evaluate(&mut continuation, &mut game, &mut sink), Evaluation::Absent);
            assert!(sink.is_empty());
        });
        assert!(!levels.is_empty());
        assert!(levels.iter().all(|level| *level > log::Level::Warn));
    }

    #[test]
    fn test_transport_failure_is_logged_as_error() {
        let levels = captured_levels(|| {
            let mut game = game();
            let mut sink = MemoryFallback::new();
            let mut continuation = chat_continuation(RpcFuture::resolved(Err(
                RpcError::Transport("reset".to_string()),
            )));
            assert_eq!(evaluate(&mut continuation, &mut game, &mut sink), Evaluation::Failed);
        });
        assert!(levels.contains(&log::Level::Error));
    }

    #[test]
    fn test_stale_guard_suppresses_effect() {
        let mut game = game();
        let mut sink = MemoryFallback::new();
        game.epochs.advance(1);
        let guard = game.guard_slot(1).unwrap();
        let mut continuation =
            chat_continuation(RpcFuture::resolved(Ok(Text { text: "late".to_string() })))
                .guarded(EpochGuard::Slot(guard));

        game.epochs.advance(1);
        assert_eq!(evaluate(&mut continuation, &mut game, &mut sink), Evaluation::Stale);
        assert!(game.chat.is_empty());
    }

    #[test]
    fn test_failed_durable_call_is_recorded() {
        let mut game = game();
        let mut sink = MemoryFallback::new();
        let request = Request::MapInfo(MapName {
            name: "Kobra".to_string(),
        });
        let mut continuation = chat_continuation(RpcFuture::resolved(Err(RpcError::Transport(
            "reset".to_string(),
        ))))
        .durable(request.clone());

        assert_eq!(evaluate(&mut continuation, &mut game, &mut sink), Evaluation::Failed);
        assert!(game.chat.is_empty());
        assert_eq!(sink.requests(), vec![request]);
    }

    #[test]
    fn test_stale_durable_call_waits_for_result() {
        let mut game = game();
        let mut sink = MemoryFallback::new();
        game.epochs.advance(0);
        let guard = SlotGuard { slot: 0, epoch: 1 };
        let (resolver, future) = RpcFuture::channel();
        let request = Request::MapInfo(MapName {
            name: "Kobra".to_string(),
        });
        let mut continuation = chat_continuation(future)
            .guarded(EpochGuard::Slot(guard))
            .durable(request.clone());

        game.epochs.advance(0);
        assert_eq!(evaluate(&mut continuation, &mut game, &mut sink), Evaluation::Pending);

        resolver
            .send(Err(RpcError::Service("boom".to_string())))
            .unwrap();
        assert_eq!(evaluate(&mut continuation, &mut game, &mut sink), Evaluation::Failed);
        assert_eq!(sink.requests(), vec![request]);
        assert!(game.chat.is_empty());
    }

    #[test]
    fn test_deadline_expires_unsettled_call() {
        let mut game = game();
        let mut sink = MemoryFallback::new();
        let (_resolver, future) = RpcFuture::<Text>::channel();
        let request = Request::MapInfo(MapName {
            name: "Kobra".to_string(),
        });
        let mut continuation = chat_continuation(future).durable(request).deadline(0);

        assert_eq!(evaluate(&mut continuation, &mut game, &mut sink), Evaluation::Expired);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_outcomes() {
        assert_eq!(Evaluation::Pending.outcome(), Outcome::Pending);
        for done in [
            Evaluation::Applied,
            Evaluation::Absent,
            Evaluation::Failed,
            Evaluation::Stale,
            Evaluation::Expired,
        ] {
            assert_eq!(done.outcome(), Outcome::Done);
        }
    }
}
