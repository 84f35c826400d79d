use std::time::Duration;

use tokio::sync::watch;

/// The pair of counters describing how far a cache is from answering every request.
///
/// Both counters always change together under a single lock, so a snapshot never shows a torn
/// pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    /// Keys the cache has been asked to hold and expects to materialize.
    pub requested: i64,
    /// Keys currently present in the cache.
    pub materialized: i64,
}

impl Counters {
    /// Requested keys which are not materialized yet, never negative.
    pub fn pending(&self) -> u64 {
        (self.requested - self.materialized).max(0) as u64
    }

    pub fn is_ready(&self) -> bool {
        self.requested == self.materialized
    }
}

/// Tracks the [`Counters`] of a cache and wakes up everyone waiting for it to become ready.
#[derive(Debug)]
pub struct ReadyTracker {
    counters: watch::Sender<Counters>,
}

impl Default for ReadyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyTracker {
    pub fn new() -> Self {
        let (counters, _) = watch::channel(Counters::default());
        Self { counters }
    }

    pub fn counters(&self) -> Counters {
        *self.counters.borrow()
    }

    /// Applies `f` to the counters.
    ///
    /// `f` runs while the counters are locked, so bookkeeping that has to stay in step with the
    /// counters can be done inside of it. Waiters are only woken if the counters changed.
    pub(crate) fn update(&self, f: impl FnOnce(&mut Counters)) {
        self.counters.send_if_modified(|counters| {
            let before = *counters;
            f(counters);
            *counters != before
        });
    }

    /// Sets both counters to `count`, as done after loading a snapshot.
    pub(crate) fn reset(&self, count: i64) {
        self.counters.send_replace(Counters {
            requested: count,
            materialized: count,
        });
    }

    /// Waits up to `timeout` for the counters to become equal.
    ///
    /// Returns immediately if they already are. Any number of callers may wait at the same time.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut receiver = self.counters.subscribe();
        let ready = tokio::time::timeout(timeout, receiver.wait_for(Counters::is_ready)).await;
        matches!(ready, Ok(Ok(_)))
    }
}
