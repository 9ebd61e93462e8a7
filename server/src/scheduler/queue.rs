use super::continuation::{Continuation, Cx, Evaluation};
use crate::epoch::EpochSource;

/// Counts of what one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub evaluated: usize,
    pub applied: usize,
    pub absent: usize,
    pub failed: usize,
    pub stale: usize,
    pub expired: usize,
}

impl SweepStats {
    fn count(&mut self, evaluation: Evaluation) {
        self.evaluated += 1;
        match evaluation {
            Evaluation::Pending => {}
            Evaluation::Applied => self.applied += 1,
            Evaluation::Absent => self.absent += 1,
            Evaluation::Failed => self.failed += 1,
            Evaluation::Stale => self.stale += 1,
            Evaluation::Expired => self.expired += 1,
        }
    }

    pub fn completed(&self) -> usize {
        self.applied + self.absent + self.failed + self.stale + self.expired
    }

    pub(crate) fn merge(&mut self, other: SweepStats) {
        self.evaluated += other.evaluated;
        self.applied += other.applied;
        self.absent += other.absent;
        self.failed += other.failed;
        self.stale += other.stale;
        self.expired += other.expired;
    }
}

/// Ordered collection of continuations, swept once per tick.
pub struct PendingQueue<C> {
    entries: Vec<Continuation<C>>,
}

impl<C> Default for PendingQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> PendingQueue<C> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, continuation: Continuation<C>) {
        self.entries.push(continuation);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verbs of the queued continuations, in queue order.
    pub fn verbs(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.verb()).collect()
    }

    /// Removes every entry without evaluating it.
    pub(crate) fn drain(&mut self) -> Vec<Continuation<C>> {
        std::mem::take(&mut self.entries)
    }
}

impl<C: EpochSource> PendingQueue<C> {
    /// Evaluates every entry exactly once, in insertion order, and keeps
    /// the ones still pending. Entries enqueued through `cx` during the
    /// sweep are staged outside the queue and not seen here.
    pub(crate) fn sweep(&mut self, cx: &mut Cx<'_, C>) -> SweepStats {
        let mut stats = SweepStats::default();
        let entries = std::mem::take(&mut self.entries);
        let mut pending = Vec::with_capacity(entries.len());

        for mut continuation in entries {
            let evaluation = continuation.evaluate(cx);
            stats.count(evaluation);
            if evaluation == Evaluation::Pending {
                pending.push(continuation);
            }
        }

        self.entries = pending;
        stats
    }
}
