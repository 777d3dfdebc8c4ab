//! Per-worker request pacing
//!
//! The registry throttles aggressive clients, so every worker keeps a minimum
//! interval between the requests it issues (listing searches, page turns,
//! attachment fetches). Aggregate throughput is therefore bounded by
//! `max_workers / min_request_interval`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Minimum-interval gate for one worker's requests
///
/// # Implementation
///
/// Lock-free slot reservation: `next_slot` holds the earliest instant (in
/// nanoseconds since `epoch`) at which the next request may start. A caller
/// reserves `max(now, next_slot)` with a compare-and-swap, advances the slot by
/// one interval and sleeps until its reserved instant. Clones share the slot.
#[derive(Clone, Debug)]
pub struct RequestPacer {
    /// Minimum gap between requests in nanoseconds (0 = unpaced)
    interval_nanos: u64,
    /// Earliest start of the next request, nanoseconds since `epoch`
    next_slot: Arc<AtomicU64>,
    epoch: Instant,
}

impl RequestPacer {
    /// Create a pacer enforcing `interval` between requests
    ///
    /// # Examples
    ///
    /// ```
    /// use mediador_crawler::pacer::RequestPacer;
    /// use std::time::Duration;
    ///
    /// let pacer = RequestPacer::new(Duration::from_secs(1));
    /// assert_eq!(pacer.interval(), Duration::from_secs(1));
    /// ```
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_nanos: duration_nanos(interval),
            next_slot: Arc::new(AtomicU64::new(0)),
            epoch: Instant::now(),
        }
    }

    /// Current minimum interval
    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos)
    }

    /// Wait until this worker may issue its next request
    pub async fn acquire(&self) {
        let interval = self.interval_nanos;
        if interval == 0 {
            return;
        }

        let slot = loop {
            let now = self.now_nanos();
            let current = self.next_slot.load(Ordering::SeqCst);
            let slot = current.max(now);
            if self
                .next_slot
                .compare_exchange(
                    current,
                    slot.saturating_add(interval),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break slot;
            }
        };

        let wait = slot.saturating_sub(self.now_nanos());
        if wait > 0 {
            tokio::time::sleep(Duration::from_nanos(wait)).await;
        }
    }

    fn now_nanos(&self) -> u64 {
        duration_nanos(self.epoch.elapsed())
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
