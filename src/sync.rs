//! Background sync engine.
//!
//! Drains the durable operation store against the remote gateway. A cycle
//! runs once at startup and then on a fixed interval; the UI can also ask
//! for one through [`SyncEngineContext::trigger_sync_now`]. Only one cycle
//! runs at a time: a trigger that arrives mid-drain is skipped, not queued.
//!
//! Per operation: success removes it from the store; failure bumps the
//! retry counter and keeps it for the next cycle until `max_retries` is
//! reached, at which point it is moved to the dropped-operations audit
//! table and an [`SyncEvent::OperationDropped`] is broadcast.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::apply::{apply_operation, AppliedEffect, ApplyOptions};
use crate::cache::InvalidationCoordinator;
use crate::config::AppConfig;
use crate::gateway::{GatewayError, RemoteGateway};
use crate::models::{OperationKind, PendingOperation};
use crate::queue::OperationStore;

const EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Events and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Retries exhausted; the operator has to redo this one by hand.
    OperationDropped {
        id: String,
        resi_number: String,
        kind: OperationKind,
        message: String,
    },
    CycleFinished(CycleReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub attempted: usize,
    pub synced: usize,
    pub retried: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was already draining.
    Skipped,
    Completed(CycleReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending_operations: usize,
    pub is_running: bool,
    pub is_draining: bool,
    pub last_sync: Option<String>,
}

/// Clears the draining flag when a cycle ends, including on panic.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| DrainGuard(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn drop_message(op: &PendingOperation) -> String {
    format!(
        "{} for resi {} failed after {} attempts and was removed from the queue. Please retry it manually.",
        op.operation.kind(),
        op.operation.resi_number(),
        op.retry_count
    )
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the sync timer, the store handle and the gateway for one process.
pub struct SyncEngineContext<G: RemoteGateway + 'static> {
    store: OperationStore,
    gateway: Arc<G>,
    coordinator: InvalidationCoordinator,
    config: AppConfig,
    is_running: AtomicBool,
    is_draining: AtomicBool,
    last_sync: Mutex<Option<String>>,
    events: broadcast::Sender<SyncEvent>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<G: RemoteGateway + 'static> SyncEngineContext<G> {
    pub fn new(
        store: OperationStore,
        gateway: Arc<G>,
        coordinator: InvalidationCoordinator,
        config: AppConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            store,
            gateway,
            coordinator,
            config,
            is_running: AtomicBool::new(false),
            is_draining: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            events,
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &OperationStore {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn coordinator(&self) -> &InvalidationCoordinator {
        &self.coordinator
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn pending_operation_count(&self) -> usize {
        self.store.count()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            pending_operations: self.store.count(),
            is_running: self.is_running.load(Ordering::SeqCst),
            is_draining: self.is_draining.load(Ordering::SeqCst),
            last_sync: self
                .last_sync
                .lock()
                .ok()
                .and_then(|guard| guard.clone()),
        }
    }

    /// Spawn the background loop: one cycle now, then one per interval.
    ///
    /// Calling `start` on an engine that is already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            debug!("Sync loop already running");
            return;
        }

        let engine = Arc::clone(self);
        let token = self.shutdown.clone();
        let period = self.config.sync_interval();
        let handle = tokio::spawn(async move {
            info!("Sync loop started (interval: {}s)", period.as_secs());
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let CycleOutcome::Completed(report) = engine.trigger_sync_now().await {
                    if report.synced > 0 || report.dropped > 0 {
                        info!(
                            synced = report.synced,
                            retried = report.retried,
                            dropped = report.dropped,
                            "Sync cycle complete"
                        );
                    }
                }
            }
            engine.is_running.store(false, Ordering::SeqCst);
            info!("Sync loop stopped");
        });

        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle);
        }
    }

    /// Stop the timer and wait for an in-flight cycle to finish on its own.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Sync loop task ended abnormally: {e}");
            }
        }
        self.is_running.store(false, Ordering::SeqCst);
    }

    /// Run one drain cycle now unless one is already in progress.
    pub async fn trigger_sync_now(&self) -> CycleOutcome {
        let Some(_guard) = DrainGuard::acquire(&self.is_draining) else {
            debug!("Drain already in progress; trigger skipped");
            return CycleOutcome::Skipped;
        };

        let report = self.run_cycle().await;

        if let Ok(mut last) = self.last_sync.lock() {
            *last = Some(Utc::now().to_rfc3339());
        }
        let _ = self.events.send(SyncEvent::CycleFinished(report.clone()));
        CycleOutcome::Completed(report)
    }

    async fn run_cycle(&self) -> CycleReport {
        // Operations enqueued from here on wait for the next cycle.
        let snapshot = self.store.list_all();
        let mut report = CycleReport {
            attempted: snapshot.len(),
            ..CycleReport::default()
        };
        if snapshot.is_empty() {
            return report;
        }
        debug!(pending = snapshot.len(), "Drain cycle started");

        let mut effects: Vec<AppliedEffect> = Vec::new();
        for op in snapshot {
            let options = ApplyOptions::new(self.config.default_sack.clone());
            match apply_operation(self.gateway.as_ref(), &op.operation, &options).await {
                Ok(effect) => {
                    if let Err(e) = self.store.remove(&op.id) {
                        warn!(id = %op.id, error = %e, "Applied operation could not be removed");
                    }
                    debug!(
                        id = %op.id,
                        kind = %op.operation.kind(),
                        resi = %op.operation.resi_number(),
                        "Operation synced"
                    );
                    report.synced += 1;
                    effects.push(effect);
                }
                Err(e) => self.record_failure(op, &e, &mut report),
            }
        }

        if report.synced > 0 {
            self.after_successful_cycle(&effects).await;
        }
        report
    }

    fn record_failure(&self, mut op: PendingOperation, err: &GatewayError, report: &mut CycleReport) {
        op.retry_count += 1;
        op.last_attempt_at = Some(Utc::now());
        op.last_error = Some(err.to_string());

        if op.retry_count >= self.config.max_retries {
            let message = drop_message(&op);
            error!(
                id = %op.id,
                kind = %op.operation.kind(),
                resi = %op.operation.resi_number(),
                retries = op.retry_count,
                error = %err,
                "Operation dropped after exhausting retries"
            );
            if let Err(e) = self.store.drop_exhausted(&op) {
                error!(id = %op.id, error = %e, "Failed to drop exhausted operation");
            }
            let _ = self.events.send(SyncEvent::OperationDropped {
                id: op.id.clone(),
                resi_number: op.operation.resi_number().to_string(),
                kind: op.operation.kind(),
                message,
            });
            report.dropped += 1;
            return;
        }

        if err.is_transient() {
            warn!(
                id = %op.id,
                resi = %op.operation.resi_number(),
                attempt = op.retry_count,
                "Transient sync failure: {err}"
            );
        } else {
            warn!(
                id = %op.id,
                resi = %op.operation.resi_number(),
                attempt = op.retry_count,
                "Sync failure (will retry): {err}"
            );
        }
        if let Err(e) = self.store.update(&op) {
            warn!(id = %op.id, error = %e, "Failed to persist retry state");
        }
        report.retried += 1;
    }

    /// Invalidate today plus every touched scope, then refresh the input
    /// screen's aggregates. Refresh failures are logged and ignored.
    async fn after_successful_cycle(&self, effects: &[AppliedEffect]) {
        let today = Utc::now().date_naive();
        self.coordinator.invalidate_batch(
            today,
            effects.iter().map(|e| (e.date, e.courier.as_deref())),
        );

        let scopes: Vec<_> = effects
            .iter()
            .filter_map(|e| e.courier.clone().map(|c| (e.date, c)))
            .collect();
        if scopes.is_empty() {
            return;
        }
        if let Err(e) = self
            .coordinator
            .refresh_input_caches(self.gateway.as_ref(), &scopes)
            .await
        {
            warn!("Input cache refresh after sync failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{QueryCache, QueryKey};
    use crate::db;
    use crate::gateway::testing::MemoryGateway;
    use crate::models::{
        CancelPayload, ExpeditionFlag, ExpeditionRecord, Operation, ScanPayload, Schedule,
    };
    use serde_json::json;
    use std::time::Duration;

    fn engine(gateway: Arc<MemoryGateway>) -> Arc<SyncEngineContext<MemoryGateway>> {
        let db = Arc::new(db::init_in_memory().unwrap());
        let coordinator = InvalidationCoordinator::new(Arc::new(QueryCache::new()));
        SyncEngineContext::new(OperationStore::new(db), gateway, coordinator, AppConfig::default())
    }

    fn scan(resi: &str, sack: &str) -> Operation {
        Operation::Scan(ScanPayload {
            resi_number: resi.into(),
            sack_number: sack.into(),
            courier_name: Some("JNE".into()),
            is_rescan: false,
        })
    }

    fn completed(outcome: CycleOutcome) -> CycleReport {
        match outcome {
            CycleOutcome::Completed(report) => report,
            CycleOutcome::Skipped => panic!("cycle unexpectedly skipped"),
        }
    }

    #[tokio::test]
    async fn test_always_failing_operation_is_dropped_after_five_cycles() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_always("A");
        let engine = engine(gateway);
        let mut events = engine.subscribe();
        let op = engine.store().enqueue(scan("A", "1")).unwrap();

        for cycle in 1..=4u32 {
            let report = completed(engine.trigger_sync_now().await);
            assert_eq!(report.retried, 1);
            let pending = engine.store().list_all();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].retry_count, cycle);
            assert!(pending[0].last_error.is_some());
        }

        let report = completed(engine.trigger_sync_now().await);
        assert_eq!(report.dropped, 1);
        assert!(engine.store().list_all().is_empty());

        let dropped = engine.store().list_dropped(10);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, op.id);
        assert_eq!(dropped[0].retry_count, 5);

        let mut saw_drop = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::OperationDropped { resi_number, message, .. } = event {
                assert_eq!(resi_number, "A");
                assert!(message.contains("resi A"));
                saw_drop = true;
            }
        }
        assert!(saw_drop);
    }

    #[tokio::test]
    async fn test_operation_succeeds_after_transient_failures() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_next("B", 3);
        let engine = engine(gateway.clone());
        engine.store().enqueue(scan("B", "2")).unwrap();

        for _ in 0..3 {
            completed(engine.trigger_sync_now().await);
            assert_eq!(engine.pending_operation_count(), 1);
        }
        let report = completed(engine.trigger_sync_now().await);
        assert_eq!(report.synced, 1);
        assert_eq!(engine.pending_operation_count(), 0);
        assert!(gateway.receipt("B").is_some());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_the_batch() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_always("X");
        let engine = engine(gateway.clone());
        engine.store().enqueue(scan("X", "1")).unwrap();
        engine.store().enqueue(scan("Y", "1")).unwrap();

        let report = completed(engine.trigger_sync_now().await);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.synced, 1);
        assert_eq!(report.retried, 1);
        let pending = engine.store().list_all();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation.resi_number(), "X");
        assert!(gateway.receipt("Y").is_some());
    }

    #[tokio::test]
    async fn test_scan_then_cancel_ends_cancelled() {
        let gateway = Arc::new(MemoryGateway::new());
        let engine = engine(gateway.clone());
        engine.store().enqueue(scan("A", "3")).unwrap();
        engine
            .store()
            .enqueue(Operation::Cancel(CancelPayload {
                resi_number: "A".into(),
                fallback_created: None,
                keterangan: None,
            }))
            .unwrap();

        let report = completed(engine.trigger_sync_now().await);
        assert_eq!(report.synced, 2);

        let receipt = gateway.receipt("A").unwrap();
        assert_eq!(receipt.schedule, Some(Schedule::Batal));
        assert_eq!(receipt.sack_number.as_deref(), Some("0"));
        assert_eq!(gateway.receipt_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_then_scan_ends_ontime() {
        let gateway = Arc::new(MemoryGateway::new());
        let engine = engine(gateway.clone());
        engine
            .store()
            .enqueue(Operation::Cancel(CancelPayload {
                resi_number: "A".into(),
                fallback_created: None,
                keterangan: None,
            }))
            .unwrap();
        engine.store().enqueue(scan("A", "3")).unwrap();

        let report = completed(engine.trigger_sync_now().await);
        assert_eq!(report.synced, 2);

        let receipt = gateway.receipt("A").unwrap();
        assert_eq!(receipt.schedule, Some(Schedule::OnTime));
        assert_eq!(receipt.sack_number.as_deref(), Some("3"));
        assert_eq!(receipt.keterangan.as_deref(), Some("JNE"));
        assert_eq!(gateway.receipt_count(), 1);
    }

    #[tokio::test]
    async fn test_trigger_is_skipped_while_draining() {
        let engine = engine(Arc::new(MemoryGateway::new()));
        {
            let _guard = DrainGuard::acquire(&engine.is_draining).unwrap();
            assert_eq!(engine.trigger_sync_now().await, CycleOutcome::Skipped);
            assert!(engine.status().is_draining);
        }
        assert!(matches!(
            engine.trigger_sync_now().await,
            CycleOutcome::Completed(_)
        ));
        assert!(!engine.status().is_draining);
        assert!(engine.status().last_sync.is_some());
    }

    #[tokio::test]
    async fn test_successful_cycle_invalidates_and_refreshes_input_caches() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.seed_expedition(ExpeditionRecord {
            resi: "S1".into(),
            courier: Some("JNE".into()),
            order_number: None,
            sales_channel: None,
            purchased_at: None,
            flag: Some(ExpeditionFlag::No),
            follow_up_checked: false,
            created: Some(Utc::now()),
        });
        let engine = engine(gateway.clone());
        let today = Utc::now().date_naive();
        let cache = engine.coordinator().cache().clone();
        cache.put(QueryKey::SummaryCounts { date: today }, json!({ "total": 0 }));

        engine.store().enqueue(scan("S1", "4")).unwrap();
        completed(engine.trigger_sync_now().await);

        assert!(cache.is_stale(&QueryKey::SummaryCounts { date: today }));
        let last = cache
            .get(&QueryKey::LastUsedSack {
                date: today,
                courier: "JNE".into(),
            })
            .unwrap();
        assert!(!last.stale);
        assert_eq!(last.value, json!("4"));
        assert_eq!(gateway.expedition("S1").unwrap().flag, Some(ExpeditionFlag::Yes));
    }

    #[tokio::test]
    async fn test_start_runs_immediately_and_shutdown_stops_loop() {
        let gateway = Arc::new(MemoryGateway::new());
        let engine = engine(gateway.clone());
        engine.store().enqueue(scan("L1", "1")).unwrap();

        engine.start();
        engine.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.pending_operation_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(engine.status().is_running);

        engine.shutdown().await;
        assert!(!engine.status().is_running);
        assert!(gateway.receipt("L1").is_some());
    }
}
