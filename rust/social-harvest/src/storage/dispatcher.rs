//! Persistence workers draining the bus into storage.
//!
//! One worker per [`RecordKind`]. Every worker sees every record on
//! [`HARVEST_TOPIC`] and keeps only its own kind. A failed write is logged
//! and the worker moves on; nothing is retried here.
//!
//! Workers subscribe with their own buffer ([`DispatcherOptions::worker_buffer`])
//! rather than the bus default used by stream clients, so a harvest burst
//! that a paced stream would drop still reaches storage.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Persistence;
use crate::domain::{HARVEST_TOPIC, HarvestEvent, RecordKind};
use crate::events::{HarvestBus, Subscription};
use crate::scheduler::Job;

/// Display name of the maintenance job.
pub const CLEANUP_JOB_NAME: &str = "Empty document cleanup";

/// Records buffered per storage worker by default.
pub const DEFAULT_WORKER_BUFFER: usize = 4096;

/// Number of storage workers currently running.
///
/// Cloned handles share the count. A worker is counted from the moment
/// [`StorageDispatcher::start_with`] creates it until its task exits.
#[derive(Debug, Clone, Default)]
pub struct WorkerGauge(Arc<AtomicUsize>);

impl WorkerGauge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn running(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn enter(&self) -> GaugeGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        GaugeGuard(Arc::clone(&self.0))
    }
}

/// Held by a running worker; releases its slot in the gauge on drop.
struct GaugeGuard(Arc<AtomicUsize>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Records buffered per worker subscription.
    pub worker_buffer: usize,
    /// Gauge the workers report into.
    pub gauge: WorkerGauge,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            worker_buffer: DEFAULT_WORKER_BUFFER,
            gauge: WorkerGauge::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    persisted: AtomicU64,
    failed: AtomicU64,
}

/// Per-worker throughput counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub kind: RecordKind,
    pub persisted: u64,
    pub failed: u64,
    /// Records lost because the worker fell behind the bus.
    pub dropped: u64,
}

struct Worker {
    kind: RecordKind,
    counters: Arc<Counters>,
    dropped: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

/// The set of running persistence workers.
pub struct StorageDispatcher {
    workers: Vec<Worker>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for StorageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageDispatcher")
            .field(
                "workers",
                &self.workers.iter().map(|w| w.kind).collect::<Vec<_>>(),
            )
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl StorageDispatcher {
    /// Subscribe one worker per record kind and start them, with default
    /// [`DispatcherOptions`].
    ///
    /// Subscriptions are registered before this returns, so every record
    /// published afterwards reaches every worker. Workers stop when `cancel`
    /// fires or [`shutdown`](Self::shutdown) is called.
    pub fn start(
        bus: &HarvestBus,
        store: Arc<dyn Persistence>,
        cancel: &CancellationToken,
    ) -> Self {
        Self::start_with(bus, store, DispatcherOptions::default(), cancel)
    }

    /// Like [`start`](Self::start), with explicit options.
    pub fn start_with(
        bus: &HarvestBus,
        store: Arc<dyn Persistence>,
        options: DispatcherOptions,
        cancel: &CancellationToken,
    ) -> Self {
        let cancel = cancel.child_token();
        let workers = RecordKind::ALL
            .into_iter()
            .map(|kind| {
                let subscription =
                    bus.subscribe_with_capacity(HARVEST_TOPIC, options.worker_buffer);
                let counters = Arc::new(Counters::default());
                let dropped = subscription.dropped_counter();
                let handle = tokio::spawn(run_worker(
                    kind,
                    subscription,
                    Arc::clone(&store),
                    Arc::clone(&counters),
                    options.gauge.enter(),
                    cancel.clone(),
                ));
                Worker {
                    kind,
                    counters,
                    dropped,
                    handle,
                }
            })
            .collect();

        tracing::info!(
            backend = store.backend(),
            worker_buffer = options.worker_buffer,
            "Storage dispatcher started"
        );
        Self { workers, cancel }
    }

    /// Counters for every worker, in [`RecordKind::ALL`] order.
    #[must_use]
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers
            .iter()
            .map(|worker| WorkerStats {
                kind: worker.kind,
                persisted: worker.counters.persisted.load(Ordering::Relaxed),
                failed: worker.counters.failed.load(Ordering::Relaxed),
                dropped: worker.dropped.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Stop every worker and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for worker in self.workers {
            if let Err(e) = worker.handle.await {
                tracing::error!(kind = %worker.kind, error = %e, "Storage worker ended abnormally");
            }
        }
        tracing::info!("Storage dispatcher stopped");
    }
}

async fn run_worker(
    kind: RecordKind,
    mut subscription: Subscription<HarvestEvent>,
    store: Arc<dyn Persistence>,
    counters: Arc<Counters>,
    _running: GaugeGuard,
    cancel: CancellationToken,
) {
    tracing::debug!(%kind, subscription_id = %subscription.id(), "Storage worker started");

    loop {
        let envelope = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = subscription.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        if envelope.event.kind() != kind {
            continue;
        }

        match store.persist(kind, &envelope.event).await {
            Ok(()) => {
                counters.persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    %kind,
                    collection = kind.collection(),
                    harvest_id = envelope.event.harvest_id(),
                    error = %e,
                    "Failed to persist record"
                );
            }
        }
    }

    tracing::debug!(%kind, "Storage worker stopped");
}

/// Scheduled job removing empty documents from every record collection.
#[derive(Clone)]
pub struct EmptyDocumentCleanup {
    store: Arc<dyn Persistence>,
}

impl std::fmt::Debug for EmptyDocumentCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmptyDocumentCleanup")
            .field("backend", &self.store.backend())
            .finish()
    }
}

impl EmptyDocumentCleanup {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Job for EmptyDocumentCleanup {
    fn name(&self) -> &str {
        CLEANUP_JOB_NAME
    }

    /// Sweeps all five collections even when one of them fails; the first
    /// failure is returned afterwards.
    async fn run(&self) -> anyhow::Result<()> {
        let mut first_error = None;

        for kind in RecordKind::ALL {
            let collection = kind.collection();
            match self.store.remove_empty_documents(collection).await {
                Ok(0) => {}
                Ok(removed) => {
                    tracing::info!(collection, removed, "Removed empty documents");
                }
                Err(e) => {
                    tracing::warn!(collection, error = %e, "Empty document cleanup failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ContributorGrowth, HarvestHashtag, HarvestMention, HarvestMessage, HarvestSharedLink,
    };
    use crate::events::EventBus;
    use crate::storage::{FieldCounts, FieldQuery, MemoryStore, StorageError};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    /// Records every persist call; fails for harvest ids starting with "bad".
    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<(RecordKind, RecordKind)>>,
        swept: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Persistence for RecordingStore {
        fn backend(&self) -> &'static str {
            "recording"
        }

        async fn persist(&self, kind: RecordKind, event: &HarvestEvent) -> Result<(), StorageError> {
            self.calls.lock().push((kind, event.kind()));
            if event.harvest_id().starts_with("bad") {
                return Err(StorageError::Backend("disk full".to_string()));
            }
            Ok(())
        }

        async fn remove_empty_documents(&self, collection: &str) -> Result<u64, StorageError> {
            self.swept.lock().push(collection.to_string());
            if collection == "mentions" {
                return Err(StorageError::Backend("locked".to_string()));
            }
            Ok(0)
        }

        async fn field_counts(
            &self,
            _query: &FieldQuery,
            _fields: &[String],
        ) -> Result<FieldCounts, StorageError> {
            Ok(FieldCounts::default())
        }
    }

    fn one_of_each(harvest_id: &str) -> Vec<HarvestEvent> {
        let id = harvest_id.to_string();
        vec![
            HarvestEvent::Message(HarvestMessage {
                harvest_id: id.clone(),
                ..Default::default()
            }),
            HarvestEvent::Mention(HarvestMention {
                harvest_id: id.clone(),
                ..Default::default()
            }),
            HarvestEvent::SharedLink(HarvestSharedLink {
                harvest_id: id.clone(),
                ..Default::default()
            }),
            HarvestEvent::Hashtag(HarvestHashtag {
                harvest_id: id.clone(),
                ..Default::default()
            }),
            HarvestEvent::ContributorGrowth(ContributorGrowth {
                harvest_id: id,
                ..Default::default()
            }),
        ]
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_each_worker_persists_only_its_kind() {
        let bus = EventBus::new();
        let store = Arc::new(RecordingStore::default());
        let cancel = CancellationToken::new();
        let dispatcher = StorageDispatcher::start(&bus, store.clone(), &cancel);
        assert_eq!(bus.subscriber_count(HARVEST_TOPIC), 5);

        for round in 0..3 {
            for event in one_of_each(&format!("h{round}")) {
                bus.publish(HARVEST_TOPIC, event);
            }
        }

        wait_for(|| store.calls.lock().len() == 15).await;

        for (worker_kind, record_kind) in store.calls.lock().iter() {
            assert_eq!(worker_kind, record_kind);
        }
        for stats in dispatcher.stats() {
            assert_eq!(stats.persisted, 3, "{:?}", stats.kind);
            assert_eq!(stats.failed, 0);
        }

        dispatcher.shutdown().await;
        assert_eq!(bus.subscriber_count(HARVEST_TOPIC), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_stop_worker() {
        let bus = EventBus::new();
        let store = Arc::new(RecordingStore::default());
        let cancel = CancellationToken::new();
        let dispatcher = StorageDispatcher::start(&bus, store.clone(), &cancel);

        let message = |id: &str| {
            HarvestEvent::Message(HarvestMessage {
                harvest_id: id.to_string(),
                ..Default::default()
            })
        };
        bus.publish(HARVEST_TOPIC, message("bad-1"));
        bus.publish(HARVEST_TOPIC, message("good-1"));

        wait_for(|| store.calls.lock().len() == 2).await;

        let message_stats = dispatcher.stats()[0];
        assert_eq!(message_stats.kind, RecordKind::Message);
        assert_eq!(message_stats.failed, 1);
        assert_eq!(message_stats.persisted, 1);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_parent_cancel_stops_workers() {
        let bus = EventBus::<HarvestEvent>::new();
        let cancel = CancellationToken::new();
        let dispatcher = StorageDispatcher::start(&bus, Arc::new(MemoryStore::new()), &cancel);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), dispatcher.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_every_collection_despite_failure() {
        let store = Arc::new(RecordingStore::default());
        let job = EmptyDocumentCleanup::new(store.clone());

        assert_eq!(job.name(), CLEANUP_JOB_NAME);
        assert!(job.run().await.is_err());
        assert_eq!(
            *store.swept.lock(),
            vec![
                "messages",
                "mentions",
                "shared_links",
                "hashtags",
                "contributor_growth"
            ]
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_empty_documents() {
        let store = Arc::new(MemoryStore::new());
        store.insert_raw("hashtags", json!({ "tag": "" }));
        store.insert_raw("hashtags", json!({ "tag": "rust" }));
        store.insert_raw("contributor_growth", serde_json::Value::Null);

        EmptyDocumentCleanup::new(store.clone()).run().await.unwrap();

        assert_eq!(store.count("hashtags"), 1);
        assert_eq!(store.count("contributor_growth"), 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_default_records() {
        let store = Arc::new(MemoryStore::new());
        for event in one_of_each("") {
            store.persist(event.kind(), &event).await.unwrap();
        }
        store
            .persist(
                RecordKind::Message,
                &HarvestEvent::Message(HarvestMessage::default()),
            )
            .await
            .unwrap();
        store
            .persist(
                RecordKind::Message,
                &HarvestEvent::Message(HarvestMessage {
                    harvest_id: "h1".to_string(),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        EmptyDocumentCleanup::new(store.clone()).run().await.unwrap();

        assert_eq!(store.count("messages"), 1);
        for kind in &RecordKind::ALL[1..] {
            assert_eq!(store.count(kind.collection()), 0, "{kind:?}");
        }
    }

    #[tokio::test]
    async fn test_gauge_tracks_running_workers() {
        let bus = EventBus::<HarvestEvent>::new();
        let cancel = CancellationToken::new();
        let gauge = WorkerGauge::new();
        let options = DispatcherOptions {
            gauge: gauge.clone(),
            ..Default::default()
        };

        let dispatcher =
            StorageDispatcher::start_with(&bus, Arc::new(MemoryStore::new()), options, &cancel);
        assert_eq!(gauge.running(), RecordKind::ALL.len());

        dispatcher.shutdown().await;
        assert_eq!(gauge.running(), 0);
    }

    #[tokio::test]
    async fn test_burst_beyond_bus_capacity_is_fully_persisted() {
        let bus = EventBus::with_capacity(4);
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let dispatcher = StorageDispatcher::start(&bus, store.clone(), &cancel);

        // Published without yielding, so no worker drains in between.
        for i in 0..200 {
            bus.publish(
                HARVEST_TOPIC,
                HarvestEvent::Hashtag(HarvestHashtag {
                    harvest_id: format!("h{i}"),
                    tag: "burst".to_string(),
                    ..Default::default()
                }),
            );
        }

        wait_for(|| store.count("hashtags") == 200).await;
        assert!(dispatcher.stats().iter().all(|s| s.dropped == 0));

        dispatcher.shutdown().await;
    }
}
