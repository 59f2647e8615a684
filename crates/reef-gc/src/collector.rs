//! [`GarbageCollector`] implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reef_cluster::EpochClock;
use reef_meta::{GcMark, MetaStore};
use reef_store::{PayloadStore, RecordLocks};
use reef_types::events::{CollectReason, EventBus, GcPassCompleted, ObjectCollected};
use reef_types::{ContainerId, Epoch, ObjectAddress};
use tracing::{debug, error, info};

use crate::GcError;

/// Configuration for the garbage collector.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Interval between passes when the epoch does not move.
    pub interval: Duration,
}

impl GcConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            interval: Duration::from_millis(200),
        }
    }

    /// Create a default config for production use.
    pub fn default_config() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcSummary {
    /// Epoch the pass ran at.
    pub epoch: Epoch,
    /// Sequence number of the pass.
    pub pass: u64,
    /// Marks written during this pass.
    pub marked: usize,
    /// Objects removed during this pass, resumed marks included.
    pub collected: usize,
}

/// Removes expired objects and objects of deleted containers.
pub struct GarbageCollector {
    config: GcConfig,
    clock: Arc<EpochClock>,
    meta: Arc<MetaStore>,
    store: Arc<dyn PayloadStore>,
    locks: Arc<RecordLocks>,
    events: EventBus,
    passes: AtomicU64,
    /// Serializes passes triggered concurrently.
    running: tokio::sync::Mutex<()>,
}

impl GarbageCollector {
    /// Create a collector.
    pub fn new(
        config: GcConfig,
        clock: Arc<EpochClock>,
        meta: Arc<MetaStore>,
        store: Arc<dyn PayloadStore>,
        locks: Arc<RecordLocks>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            clock,
            meta,
            store,
            locks,
            events,
            passes: AtomicU64::new(0),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Number of passes completed since the collector was created.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    /// Run one full mark-and-sweep pass at the current epoch.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> Result<GcSummary, GcError> {
        let _running = self.running.lock().await;
        let epoch = self.clock.current();

        let marked = self.mark(epoch)?;
        let collected = self.collect_marked().await?;

        let pass = self.passes.fetch_add(1, Ordering::AcqRel) + 1;
        if collected > 0 {
            info!(epoch, pass, collected, "gc pass finished");
        } else {
            debug!(epoch, pass, "gc pass finished, nothing to collect");
        }
        self.events.emit(GcPassCompleted {
            epoch,
            pass,
            collected,
        });

        Ok(GcSummary {
            epoch,
            pass,
            marked,
            collected,
        })
    }

    /// Phase 1: durably mark everything collectable at `epoch`.
    fn mark(&self, epoch: Epoch) -> Result<usize, GcError> {
        let already: HashSet<ObjectAddress> = self
            .meta
            .list_gc_marks()?
            .into_iter()
            .map(|(addr, _)| addr)
            .collect();

        // Tombstone epochs per container, looked up once.
        let mut deleted_at: HashMap<ContainerId, Option<Epoch>> = HashMap::new();
        let mut marked = 0;

        for header in self.meta.list_objects()? {
            let addr = header.address();
            if already.contains(&addr) {
                continue;
            }

            let tombstone = match deleted_at.get(&header.container_id) {
                Some(t) => *t,
                None => {
                    let t = self
                        .meta
                        .get_container(&header.container_id)?
                        .and_then(|r| r.deleted_at);
                    deleted_at.insert(header.container_id, t);
                    t
                }
            };

            let reason = if tombstone.is_some_and(|d| d < epoch) {
                CollectReason::ContainerDeleted
            } else if header.is_expired(epoch) {
                CollectReason::Expired
            } else {
                continue;
            };

            self.meta.put_gc_mark(
                &addr,
                GcMark {
                    reason,
                    marked_epoch: epoch,
                },
            )?;
            marked += 1;
        }
        Ok(marked)
    }

    /// Phase 2: execute every pending mark.
    async fn collect_marked(&self) -> Result<usize, GcError> {
        let mut collected = 0;
        for (addr, mark) in self.meta.list_gc_marks()? {
            let _guard = self.locks.lock(&addr).await;
            self.store.delete(addr).await?;
            self.meta.remove_object(&addr)?;
            self.meta.remove_replicas(&addr)?;
            self.meta.remove_gc_mark(&addr)?;

            debug!(%addr, reason = ?mark.reason, "collected object");
            self.events.emit(ObjectCollected {
                address: addr,
                reason: mark.reason,
            });
            collected += 1;
        }
        Ok(collected)
    }

    async fn run(&self, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
        info!("garbage collector started");
        let mut interval = tokio::time::interval(self.config.interval);
        let mut epoch_rx = self.clock.subscribe();

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = epoch_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!(epoch = *epoch_rx.borrow(), "epoch changed, collecting");
                }
                _ = shutdown_rx.changed() => {
                    info!("garbage collector shutting down");
                    break;
                }
            }

            if let Err(e) = self.sweep().await {
                error!(%e, "gc pass failed");
            }
        }

        info!("garbage collector stopped");
    }
}

/// Handle to a running [`GarbageCollector`].
pub struct GcHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl GcHandle {
    /// Ask the background task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Abort the background task.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Check whether the background task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Run `collector` in the background.
pub fn start(collector: Arc<GarbageCollector>) -> GcHandle {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let task = tokio::spawn(async move {
        collector.run(shutdown_rx).await;
    });
    GcHandle { shutdown_tx, task }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bytes::Bytes;
    use reef_store::MemoryStore;
    use reef_types::{
        BasicAcl, Container, ContainerRecord, ObjectHeader, OwnerId, PlacementRule, Replica,
    };

    use super::*;

    struct Fixture {
        clock: Arc<EpochClock>,
        meta: Arc<MetaStore>,
        store: Arc<MemoryStore>,
        events: EventBus,
        gc: Arc<GarbageCollector>,
        container: Container,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(EpochClock::new(1));
        let meta = Arc::new(MetaStore::open_temporary().unwrap());
        let store = Arc::new(MemoryStore::new(64 * 1024 * 1024));
        let events = EventBus::new();
        let gc = Arc::new(GarbageCollector::new(
            GcConfig::test_config(),
            clock.clone(),
            meta.clone(),
            store.clone(),
            Arc::new(RecordLocks::default()),
            events.clone(),
        ));
        let rule = PlacementRule {
            replicas: vec![Replica {
                count: 1,
                selector: None,
            }],
            backup_factor: None,
            selectors: vec![],
            filters: vec![],
        };
        let container = Container::new(
            OwnerId::from_data(b"owner"),
            rule,
            BasicAcl::Private,
            None,
            1,
            [0u8; 16],
        );
        meta.put_container(&ContainerRecord::live(container.clone()))
            .unwrap();
        Fixture {
            clock,
            meta,
            store,
            events,
            gc,
            container,
        }
    }

    impl Fixture {
        async fn put(&self, payload: &'static [u8], expire_at: Option<Epoch>) -> ObjectAddress {
            let header = ObjectHeader::new(
                self.container.id,
                self.container.owner,
                payload,
                self.clock.current(),
                expire_at,
                BTreeMap::new(),
            );
            self.meta.put_object(&header).unwrap();
            self.meta
                .put_replicas(&header.address(), &[reef_types::NodeId::from_data(b"n")])
                .unwrap();
            self.store
                .put(header.address(), Bytes::from_static(payload))
                .await
                .unwrap();
            header.address()
        }

        async fn exists(&self, addr: ObjectAddress) -> bool {
            self.meta.get_object(&addr).unwrap().is_some()
                || self.store.contains(addr).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_expired_object_survives_until_epoch_passes() {
        let f = fixture();
        let addr = f.put(b"short lived", Some(2)).await;

        f.clock.tick().unwrap(); // epoch 2 == expire_at: still readable
        let summary = f.gc.sweep().await.unwrap();
        assert_eq!(summary.collected, 0);
        assert!(f.exists(addr).await);

        f.clock.tick().unwrap(); // epoch 3 > expire_at
        let summary = f.gc.sweep().await.unwrap();
        assert_eq!(summary.collected, 1);
        assert!(!f.exists(addr).await);
        assert!(f.meta.get_replicas(&addr).unwrap().is_none());
        assert!(f.meta.list_gc_marks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_objects_without_expiry_are_kept() {
        let f = fixture();
        let addr = f.put(b"forever", None).await;
        for _ in 0..5 {
            f.clock.tick().unwrap();
        }
        assert_eq!(f.gc.sweep().await.unwrap().collected, 0);
        assert!(f.exists(addr).await);
    }

    #[tokio::test]
    async fn test_deleted_container_collected_after_next_epoch() {
        let f = fixture();
        let addr = f.put(b"orphan", None).await;

        let mut record = ContainerRecord::live(f.container.clone());
        record.deleted_at = Some(f.clock.current());
        f.meta.put_container(&record).unwrap();

        assert_eq!(f.gc.sweep().await.unwrap().collected, 0);
        f.clock.tick().unwrap();
        let mut collected = f.events.subscribe::<ObjectCollected>();
        assert_eq!(f.gc.sweep().await.unwrap().collected, 1);
        assert!(!f.exists(addr).await);
        assert_eq!(
            collected.try_recv().unwrap().reason,
            CollectReason::ContainerDeleted
        );

        // The tombstone itself is retained.
        assert!(f.meta.get_container(&f.container.id).unwrap().unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn test_interrupted_pass_is_resumed() {
        let f = fixture();
        let addr = f.put(b"marked", Some(1)).await;
        // A previous pass wrote the mark and died before deleting anything.
        f.meta
            .put_gc_mark(
                &addr,
                GcMark {
                    reason: CollectReason::Expired,
                    marked_epoch: 2,
                },
            )
            .unwrap();

        let summary = f.gc.sweep().await.unwrap();
        assert_eq!(summary.marked, 0);
        assert_eq!(summary.collected, 1);
        assert!(!f.exists(addr).await);
    }

    #[tokio::test]
    async fn test_pass_counter_and_event() {
        let f = fixture();
        let mut done = f.events.subscribe::<GcPassCompleted>();

        assert_eq!(f.gc.sweep().await.unwrap().pass, 1);
        assert_eq!(f.gc.sweep().await.unwrap().pass, 2);
        assert_eq!(f.gc.passes(), 2);

        let first = done.try_recv().unwrap();
        assert_eq!(first.pass, 1);
        assert_eq!(first.epoch, 1);
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn test_background_pass_on_epoch_change() {
        let f = fixture();
        let addr = f.put(b"ticking", Some(1)).await;
        let mut collected = f.events.subscribe::<ObjectCollected>();
        let handle = start(f.gc.clone());

        f.clock.tick().unwrap();
        let event = collected.recv().await.unwrap();
        assert_eq!(event.address, addr);
        assert_eq!(event.reason, CollectReason::Expired);

        handle.shutdown();
    }
}
