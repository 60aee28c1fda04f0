//! # Buffered Write Coalescer
//!
//! Every session hands its records to one shared `Coalescer`. Records are not
//! written one by one: they accumulate in a process-wide buffer that is drained
//! either when it reaches `buffer_size` entries, or when a one-shot timer
//! armed by the first record of a generation fires.
//!
//! ## Flush semantics
//!
//! 1.  **Whole-buffer drain**: a flush takes the entire buffer in one step. The
//!     buffer is never read partially, and records enqueued while a flush is
//!     writing land in the next generation.
//! 2.  **Per-category batches**: the drained generation is partitioned by
//!     category, keeping the insertion order inside each category. Each
//!     category becomes exactly one `batch_upsert` call.
//! 3.  **Failure isolation**: a failed category is logged and dropped. Other
//!     categories are still written, and nothing is retried.
//! 4.  **Single timer**: at most one flush timer is armed. Arming while armed is
//!     a no-op; a flush always disarms it.
//! 5.  **Single flight**: writes of two generations never overlap.
//! 6.  **Non-blocking hand-off**: `enqueue` only appends. A flush triggered by
//!     the size threshold runs on its own task, so a subscription keeps
//!     reading while the store is slow.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::configs::EngineSettings;
use crate::store::{Store, StoreError};
use crate::telemetry::{Category, Destined, Record};

/// Errors raised when handing a record to the coalescer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// The coalescer was closed by shutdown; the record was not buffered.
    #[error("Coalescer is closed; record for {internal_id} rejected")]
    Closed {
        /// Entity the rejected record belonged to.
        internal_id: String,
    },
}

/// Flush thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescerSettings {
    /// Buffer length that triggers an immediate flush.
    pub buffer_size: usize,
    /// Delay of the one-shot flush timer.
    pub flush_interval: Duration,
}

impl Default for CoalescerSettings {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            flush_interval: Duration::from_millis(10_000),
        }
    }
}

impl From<&EngineSettings> for CoalescerSettings {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            buffer_size: settings.buffer_size,
            flush_interval: settings.flush_interval(),
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Categories written, with their record counts, in category order.
    pub written: Vec<(Category, usize)>,
    /// Categories whose write failed. Their records are gone.
    pub failed: Vec<(Category, usize, StoreError)>,
}

impl FlushReport {
    /// Number of records drained from the buffer by this flush.
    pub fn total(&self) -> usize {
        self.written.iter().map(|(_, n)| n).sum::<usize>() + self.failed.iter().map(|(_, n, _)| n).sum::<usize>()
    }

    /// True when the flush found nothing to write.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

struct Pending {
    record: Record,
    category: Category,
}

#[derive(Default)]
struct BufferState {
    pending: Vec<Pending>,
    timer: Option<CancellationToken>,
    // A threshold flush is queued and has not drained yet.
    flush_scheduled: bool,
    closed: bool,
}

// What started a flush.
enum Trigger {
    Manual,
    Threshold,
    Timer(CancellationToken),
}

struct CoalescerInner {
    store: Arc<dyn Store>,
    settings: CoalescerSettings,
    state: Mutex<BufferState>,
    // Held across the store writes of one generation.
    flush_gate: tokio::sync::Mutex<()>,
    // Threshold flushes and flush timers.
    tasks: TaskTracker,
}

/// # Coalescer
///
/// Cheap to clone; all clones share one buffer.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<CoalescerInner>,
}

impl Coalescer {
    /// Creates an empty, open coalescer writing to `store`.
    pub fn new(store: Arc<dyn Store>, settings: CoalescerSettings) -> Self {
        Self {
            inner: Arc::new(CoalescerInner {
                store,
                settings,
                state: Mutex::new(BufferState::default()),
                flush_gate: tokio::sync::Mutex::new(()),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Appends `record` to the buffer under `category` and returns at once.
    ///
    /// Reaching the size threshold schedules a flush in the background.
    /// Otherwise the flush timer is armed if it is not already. The only
    /// failure is a closed coalescer.
    pub fn enqueue(&self, record: Record, category: Category) -> Result<(), IngestError> {
        let mut state = self.inner.state.lock().expect("Coalescer lock poisoned");
        if state.closed {
            return Err(IngestError::Closed {
                internal_id: record.internal_id().to_string(),
            });
        }

        state.pending.push(Pending { record, category });

        if state.flush_scheduled {
            // The scheduled flush takes this record too.
        } else if state.pending.len() >= self.inner.settings.buffer_size {
            state.flush_scheduled = true;
            let this = self.clone();
            self.inner.tasks.spawn(async move {
                this.flush_for(Trigger::Threshold).await;
            });
        } else if state.timer.is_none() {
            state.timer = Some(self.arm_timer());
        }
        Ok(())
    }

    /// Drains the whole buffer and writes it, one batch per category.
    pub async fn flush(&self) -> FlushReport {
        self.flush_for(Trigger::Manual).await
    }

    async fn flush_for(&self, trigger: Trigger) -> FlushReport {
        let _gate = self.inner.flush_gate.lock().await;

        let generation = {
            let mut state = self.inner.state.lock().expect("Coalescer lock poisoned");
            // Another flush may have drained this trigger's generation while
            // it waited at the gate.
            match &trigger {
                Trigger::Timer(token) if token.is_cancelled() => return FlushReport::default(),
                Trigger::Threshold if !state.flush_scheduled => return FlushReport::default(),
                _ => {}
            }
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            state.flush_scheduled = false;
            std::mem::take(&mut state.pending)
        };

        let mut report = FlushReport::default();
        if generation.is_empty() {
            return report;
        }

        let representative = generation[0].record.internal_id().to_string();
        let total = generation.len();

        let mut batches: BTreeMap<Category, Vec<Record>> = BTreeMap::new();
        for Pending { record, category } in generation {
            batches.entry(category).or_default().push(record);
        }

        for (category, records) in batches {
            match self.inner.store.batch_upsert(&category, &records).await {
                Ok(()) => report.written.push((category, records.len())),
                Err(e) => {
                    log::error!("Failed to write {} records to '{}': {}", records.len(), category, e);
                    report.failed.push((category, records.len(), e));
                }
            }
        }

        log::info!(
            "Flushed {} records in {} categories ({} failed), e.g. user {}",
            total,
            report.written.len() + report.failed.len(),
            report.failed.len(),
            representative
        );
        report
    }

    /// Refuses further records and disarms the timer. Already buffered
    /// records stay until the next `flush`.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().expect("Coalescer lock poisoned");
        state.closed = true;
        if let Some(timer) = state.timer.take() {
            timer.cancel();
        }
    }

    /// Closes the coalescer, waits for background flushes and writes
    /// whatever is left.
    pub async fn shutdown(&self) -> FlushReport {
        self.close();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.flush().await
    }

    /// Number of records waiting for the next flush.
    pub fn buffered_len(&self) -> usize {
        self.inner.state.lock().expect("Coalescer lock poisoned").pending.len()
    }

    /// True while a flush timer is armed.
    pub fn is_timer_armed(&self) -> bool {
        self.inner.state.lock().expect("Coalescer lock poisoned").timer.is_some()
    }

    /// True after `close`.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().expect("Coalescer lock poisoned").closed
    }

    // Called with the state lock held.
    fn arm_timer(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let fired = token.clone();
        let this = self.clone();
        let delay = self.inner.settings.flush_interval;

        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = fired.cancelled() => {}
                _ = sleep(delay) => {
                    log::debug!("Flush timer fired after {:?}", delay);
                    this.flush_for(Trigger::Timer(fired)).await;
                }
            }
        });

        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChangeStream;
    use crate::telemetry::{MemberFilter, MemberRow, MemberStatus};
    use crate::testkit::MemoryStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap as Bands;
    use tokio::sync::Notify;

    /// Store whose writes wait until the test releases them.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Store for GatedStore {
        async fn select_members(&self, filter: &MemberFilter) -> Result<Vec<MemberRow>, StoreError> {
            self.inner.select_members(filter).await
        }

        async fn watch_changes(&self, table: &str) -> Result<ChangeStream, StoreError> {
            self.inner.watch_changes(table).await
        }

        async fn batch_upsert(&self, category: &Category, records: &[Record]) -> Result<(), StoreError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.batch_upsert(category, records).await
        }

        async fn update_status(&self, external_id: &str, status: &MemberStatus) -> Result<(), StoreError> {
            self.inner.update_status(external_id, status).await
        }
    }

    fn gated(store: &Arc<GatedStore>, buffer_size: usize) -> Coalescer {
        Coalescer::new(
            store.clone(),
            CoalescerSettings {
                buffer_size,
                flush_interval: Duration::from_millis(10_000),
            },
        )
    }

    fn coalescer(store: &Arc<MemoryStore>, buffer_size: usize) -> Coalescer {
        Coalescer::new(
            store.clone(),
            CoalescerSettings {
                buffer_size,
                flush_interval: Duration::from_millis(10_000),
            },
        )
    }

    fn band(id: &str, alpha: f64) -> Record {
        let mut bands = Bands::new();
        bands.insert("alpha".to_string(), vec![alpha]);
        Record::band_power(id, bands, "neurosity")
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_groups_by_category_in_order() {
        let store = Arc::new(MemoryStore::default());
        let c = coalescer(&store, 100);
        let states = Category::states();
        let events = Category::new("events");

        // 1. Interleave two categories
        c.enqueue(band("E1", 1.0), states.clone()).unwrap();
        c.enqueue(Record::probability("E1", 0.1, "focus", "neurosity"), events.clone()).unwrap();
        c.enqueue(band("E2", 2.0), states.clone()).unwrap();
        c.enqueue(Record::probability("E2", 0.2, "calm", "neurosity"), events.clone()).unwrap();
        c.enqueue(band("E1", 3.0), states.clone()).unwrap();

        // 2. One batch per category, insertion order kept
        let report = c.flush().await;
        assert_eq!(report.total(), 5);
        assert_eq!(store.batches().len(), 2);
        assert_eq!(store.records_in(&states), vec![band("E1", 1.0), band("E2", 2.0), band("E1", 3.0)]);
        assert_eq!(
            store.records_in(&events),
            vec![
                Record::probability("E1", 0.1, "focus", "neurosity"),
                Record::probability("E2", 0.2, "calm", "neurosity"),
            ]
        );

        // 3. Buffer and timer are reset
        assert_eq!(c.buffered_len(), 0);
        assert!(!c.is_timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_flushes_before_timer() {
        let store = Arc::new(MemoryStore::default());
        let c = coalescer(&store, 100);

        for i in 0..100 {
            c.enqueue(band("E1", i as f64), Category::states()).unwrap();
        }
        assert_eq!(c.buffered_len(), 100);

        // The flush runs on its own task.
        sleep(Duration::from_millis(1)).await;
        let batches = store.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, Category::states());
        assert_eq!(batches[0].1.len(), 100);
        assert_eq!(c.buffered_len(), 0);
        assert!(!c.is_timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_below_threshold() {
        let store = Arc::new(MemoryStore::default());
        let c = coalescer(&store, 100);

        c.enqueue(band("E1", 1.0), Category::states()).unwrap();
        c.enqueue(band("E1", 2.0), Category::states()).unwrap();
        assert!(c.is_timer_armed());

        // 1. Nothing before the interval elapses
        sleep(Duration::from_millis(9_900)).await;
        assert!(store.batches().is_empty());

        // 2. Exactly one flush of both records after it
        sleep(Duration::from_millis(200)).await;
        let batches = store.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 2);
        assert!(!c.is_timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_is_not_rearmed_while_armed() {
        let store = Arc::new(MemoryStore::default());
        let c = coalescer(&store, 100);

        c.enqueue(band("E1", 1.0), Category::states()).unwrap();
        sleep(Duration::from_millis(5_000)).await;
        c.enqueue(band("E1", 2.0), Category::states()).unwrap();

        // The first timer still fires at 10 s and takes both records.
        sleep(Duration::from_millis(5_100)).await;
        assert_eq!(store.batches().len(), 1);
        assert_eq!(store.batches()[0].1.len(), 2);

        // No second timer was left behind.
        sleep(Duration::from_millis(20_000)).await;
        assert_eq!(store.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_category_does_not_block_others() {
        let store = Arc::new(MemoryStore::default());
        store.fail_category(&Category::states());
        let c = coalescer(&store, 100);

        c.enqueue(band("E1", 1.0), Category::states()).unwrap();
        c.enqueue(Record::probability("E1", 0.5, "focus", "neurosity"), Category::new("events")).unwrap();

        let report = c.flush().await;
        assert_eq!(report.written, vec![(Category::new("events"), 1)]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, Category::states());

        assert_eq!(store.records_in(&Category::new("events")).len(), 1);
        assert!(store.records_in(&Category::states()).is_empty());
        assert_eq!(c.buffered_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_coalescer_rejects_records() {
        let store = Arc::new(MemoryStore::default());
        let c = coalescer(&store, 100);

        c.enqueue(band("E1", 1.0), Category::states()).unwrap();
        let report = c.shutdown().await;
        assert_eq!(report.total(), 1);

        let err = c.enqueue(band("E1", 2.0), Category::states()).unwrap_err();
        assert_eq!(err, IngestError::Closed { internal_id: "E1".into() });
        assert!(c.is_closed());
        assert!(c.flush().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_enqueued_during_flush_go_to_next_generation() {
        let store = Arc::new(GatedStore::default());
        let c = gated(&store, 100);
        let states = Category::states();

        c.enqueue(band("E1", 1.0), states.clone()).unwrap();
        c.enqueue(band("E1", 2.0), states.clone()).unwrap();

        // 1. The flush is stuck inside the store write
        let flushing = tokio::spawn({
            let c = c.clone();
            async move { c.flush().await }
        });
        store.entered.notified().await;

        // 2. A record arriving now waits for the next flush
        c.enqueue(band("E1", 3.0), states.clone()).unwrap();
        assert_eq!(c.buffered_len(), 1);

        store.release.notify_one();
        let report = flushing.await.unwrap();
        assert_eq!(report.total(), 2);
        assert_eq!(store.inner.batches(), vec![(states.clone(), vec![band("E1", 1.0), band("E1", 2.0)])]);

        // 3. The next flush writes it on its own
        store.release.notify_one();
        assert_eq!(c.flush().await.total(), 1);
        assert_eq!(store.inner.batches().len(), 2);
        assert_eq!(store.inner.batches()[1].1, vec![band("E1", 3.0)]);
        assert_eq!(
            store.inner.records_in(&states),
            vec![band("E1", 1.0), band("E1", 2.0), band("E1", 3.0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_drain_next_generation() {
        let store = Arc::new(GatedStore::default());
        let c = gated(&store, 3);
        let states = Category::states();

        // 1. A manual flush holds the gate
        c.enqueue(band("E1", 1.0), states.clone()).unwrap();
        let first = tokio::spawn({
            let c = c.clone();
            async move { c.flush().await }
        });
        store.entered.notified().await;

        // 2. Next generation arms a timer, then reaches the threshold
        c.enqueue(band("E1", 2.0), states.clone()).unwrap();
        c.enqueue(band("E1", 3.0), states.clone()).unwrap();
        c.enqueue(band("E1", 4.0), states.clone()).unwrap();

        // 3. The timer fires and queues behind the threshold flush
        sleep(Duration::from_millis(10_100)).await;
        store.release.notify_one();
        first.await.unwrap();
        store.entered.notified().await;

        // 4. A record of the following generation, then the threshold write ends
        c.enqueue(band("E1", 5.0), states.clone()).unwrap();
        store.release.notify_one();
        sleep(Duration::from_millis(1)).await;

        assert_eq!(store.inner.batches().len(), 2);
        assert_eq!(store.inner.batches()[1].1.len(), 3);
        assert_eq!(c.buffered_len(), 1);
        assert!(c.is_timer_armed());

        // 5. Its own timer takes it
        store.release.notify_one();
        sleep(Duration::from_millis(10_100)).await;
        assert_eq!(store.inner.batches().len(), 3);
        assert_eq!(store.inner.batches()[2].1, vec![band("E1", 5.0)]);
    }
}
