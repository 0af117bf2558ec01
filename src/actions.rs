//! Operations the dashboard UI calls.
//!
//! Queued actions (scan, confirm, cancel, follow-up) patch the local
//! projection, persist a pending operation and return without waiting for
//! the remote write. Deleting a receipt is the one direct path: it goes to
//! the gateway immediately and rolls the projection back on failure.

use chrono::{NaiveDate, Utc};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::QueryKey;
use crate::gateway::{GatewayError, RemoteGateway};
use crate::models::{
    normalize_key, CancelPayload, ConfirmPayload, ExpeditionFlag, Operation, PendingOperation,
    ReceiptRecord, ScanPayload, Schedule, ToggleFollowUpPayload, CANCELLED_SACK,
    COURIER_CANCELLED,
};
use crate::optimistic::{with_optimistic_update, LocalProjection};
use crate::queue::StoreError;
use crate::summary::{self, CourierSummary, SummaryInputs};
use crate::sync::{CycleOutcome, SyncEngineContext};

pub const MIN_RESI_LEN: usize = 3;
pub const MAX_RESI_LEN: usize = 50;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("invalid resi number '{0}': expected 3 to 50 characters")]
    InvalidResi(String),
    #[error("sack number is required")]
    MissingSack,
    #[error("resi {0} was already scanned")]
    AlreadyScanned(String),
    #[error("no expedition record found for resi {0}")]
    ExpeditionNotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Trim and upper-case a scanned resi, rejecting implausible lengths.
pub fn normalize_resi(raw: &str) -> Result<String, ActionError> {
    let resi = normalize_key(raw);
    let len = resi.chars().count();
    if !(MIN_RESI_LEN..=MAX_RESI_LEN).contains(&len) {
        return Err(ActionError::InvalidResi(raw.trim().to_string()));
    }
    Ok(resi)
}

pub struct ResiActions<G: RemoteGateway + 'static> {
    engine: Arc<SyncEngineContext<G>>,
    projection: Arc<Mutex<LocalProjection>>,
}

impl<G: RemoteGateway + 'static> ResiActions<G> {
    pub fn new(engine: Arc<SyncEngineContext<G>>, projection: Arc<Mutex<LocalProjection>>) -> Self {
        Self { engine, projection }
    }

    pub fn projection(&self) -> &Arc<Mutex<LocalProjection>> {
        &self.projection
    }

    pub fn engine(&self) -> &Arc<SyncEngineContext<G>> {
        &self.engine
    }

    fn snapshot<T>(&self, f: impl FnOnce(&LocalProjection) -> T) -> T {
        let projection = self.projection.lock().unwrap_or_else(|e| e.into_inner());
        f(&projection)
    }

    /// Patch the projection, persist `operation`, and undo the patch if the
    /// local store refuses it.
    async fn enqueue_with<P, I>(
        &self,
        operation: Operation,
        patch: P,
        inverse: I,
    ) -> Result<PendingOperation, ActionError>
    where
        P: FnOnce(&mut LocalProjection),
        I: FnOnce(&mut LocalProjection),
    {
        let store = self.engine.store().clone();
        let pending = with_optimistic_update(&*self.projection, patch, inverse, move || async move {
            store.enqueue(operation).map_err(ActionError::from)
        })
        .await?;
        debug!(
            id = %pending.id,
            kind = %pending.operation.kind(),
            resi = %pending.operation.resi_number(),
            "Operation enqueued"
        );
        Ok(pending)
    }

    pub async fn enqueue_scan(&self, payload: ScanPayload) -> Result<PendingOperation, ActionError> {
        let resi = normalize_resi(&payload.resi_number)?;
        let sack = payload.sack_number.trim().to_string();
        if sack.is_empty() {
            return Err(ActionError::MissingSack);
        }
        let courier = payload
            .courier_name
            .as_deref()
            .map(normalize_key)
            .filter(|c| !c.is_empty());

        let (previous_receipt, previous_flag) = self.snapshot(|p| {
            (
                p.receipt(&resi).cloned(),
                p.expedition(&resi).map(|e| e.flag),
            )
        });
        if !payload.is_rescan {
            if let Some(existing) = &previous_receipt {
                if existing.schedule != Some(Schedule::Batal) {
                    return Err(ActionError::AlreadyScanned(resi));
                }
            }
        }

        let optimistic = ReceiptRecord {
            resi: resi.clone(),
            sack_number: Some(sack.clone()),
            created: previous_receipt
                .as_ref()
                .filter(|_| payload.is_rescan)
                .map(|r| r.created)
                .unwrap_or_else(Utc::now),
            keterangan: courier.clone(),
            schedule: Some(Schedule::OnTime),
        };
        let operation = Operation::Scan(ScanPayload {
            resi_number: resi.clone(),
            sack_number: sack,
            courier_name: courier,
            is_rescan: payload.is_rescan,
        });

        let undo_resi = resi.clone();
        self.enqueue_with(
            operation,
            move |p| {
                p.put_receipt(optimistic);
                p.set_flag(&resi, Some(ExpeditionFlag::Yes));
            },
            move |p| {
                p.restore_receipt(&undo_resi, previous_receipt);
                if let Some(flag) = previous_flag {
                    p.set_flag(&undo_resi, flag);
                }
            },
        )
        .await
    }

    /// Queue a confirm after checking the expedition exists.
    ///
    /// The projection is consulted first, then the backend. A backend that
    /// cannot be reached does not block the confirm; the sync engine looks
    /// the expedition up again when it applies the operation.
    pub async fn enqueue_confirm(
        &self,
        payload: ConfirmPayload,
    ) -> Result<PendingOperation, ActionError> {
        let resi = normalize_resi(&payload.resi_number)?;
        let mut created = payload.expedisi_created;
        let mut courier = payload.courier_name.as_deref().map(normalize_key);

        let local = self.snapshot(|p| p.expedition(&resi).cloned());
        let expedition = match local {
            Some(row) => Some(row),
            None => match self.engine.gateway().find_expedition(&resi).await {
                Ok(Some(row)) => Some(row),
                Ok(None) => return Err(ActionError::ExpeditionNotFound(resi)),
                Err(e) if e.is_transient() => {
                    warn!(resi = %resi, error = %e, "Expedition lookup unavailable; confirming offline");
                    None
                }
                Err(e) => return Err(e.into()),
            },
        };
        if let Some(row) = &expedition {
            created = created.or(row.created).or(row.purchased_at);
            courier = courier.or_else(|| row.courier.as_deref().map(normalize_key));
        }

        let (previous_receipt, previous_flag) = self.snapshot(|p| {
            (
                p.receipt(&resi).cloned(),
                p.expedition(&resi).map(|e| e.flag),
            )
        });
        let optimistic = ReceiptRecord {
            resi: resi.clone(),
            sack_number: Some(self.engine.config().default_sack.clone()),
            created: created.unwrap_or_else(Utc::now),
            keterangan: courier.clone(),
            schedule: Some(Schedule::OnTime),
        };
        let operation = Operation::Confirm(ConfirmPayload {
            resi_number: resi.clone(),
            expedisi_created: created,
            courier_name: courier,
        });

        let undo_resi = resi.clone();
        self.enqueue_with(
            operation,
            move |p| {
                p.set_flag(&resi, Some(ExpeditionFlag::Yes));
                p.put_receipt(optimistic);
            },
            move |p| {
                p.restore_receipt(&undo_resi, previous_receipt);
                if let Some(flag) = previous_flag {
                    p.set_flag(&undo_resi, flag);
                }
            },
        )
        .await
    }

    pub async fn enqueue_cancel(&self, payload: CancelPayload) -> Result<PendingOperation, ActionError> {
        let resi = normalize_resi(&payload.resi_number)?;
        let (previous_receipt, expedition_created) = self.snapshot(|p| {
            (
                p.receipt(&resi).cloned(),
                p.expedition(&resi).and_then(|e| e.created.or(e.purchased_at)),
            )
        });

        let fallback_created = payload
            .fallback_created
            .or_else(|| previous_receipt.as_ref().map(|r| r.created));
        let keterangan = payload
            .keterangan
            .as_deref()
            .map(normalize_key)
            .or_else(|| previous_receipt.as_ref().and_then(|r| r.keterangan.clone()))
            .filter(|k| !k.is_empty() && k != COURIER_CANCELLED);

        let optimistic = ReceiptRecord {
            resi: resi.clone(),
            sack_number: Some(CANCELLED_SACK.to_string()),
            created: expedition_created
                .or(fallback_created)
                .unwrap_or_else(Utc::now),
            keterangan: Some(COURIER_CANCELLED.to_string()),
            schedule: Some(Schedule::Batal),
        };
        let operation = Operation::Cancel(CancelPayload {
            resi_number: resi.clone(),
            fallback_created,
            keterangan,
        });

        self.enqueue_with(
            operation,
            move |p| {
                p.put_receipt(optimistic);
            },
            move |p| p.restore_receipt(&resi, previous_receipt),
        )
        .await
    }

    pub async fn enqueue_toggle_follow_up(
        &self,
        payload: ToggleFollowUpPayload,
    ) -> Result<PendingOperation, ActionError> {
        let resi = normalize_resi(&payload.resi_number)?;
        let checked = payload.new_follow_up_status;
        let previous = self.snapshot(|p| p.expedition(&resi).map(|e| e.follow_up_checked));
        let operation = Operation::ToggleFollowUp(ToggleFollowUpPayload {
            resi_number: resi.clone(),
            new_follow_up_status: checked,
        });

        let undo_resi = resi.clone();
        self.enqueue_with(
            operation,
            move |p| {
                p.set_follow_up(&resi, checked);
            },
            move |p| {
                if let Some(prev) = previous {
                    p.set_follow_up(&undo_resi, prev);
                }
            },
        )
        .await
    }

    /// Delete a receipt directly on the backend.
    ///
    /// Returns whether a remote row was removed. Errors are returned to the
    /// caller after the projection has been restored.
    pub async fn delete_receipt(&self, raw_resi: &str) -> Result<bool, ActionError> {
        let resi = normalize_key(raw_resi);
        if resi.is_empty() {
            return Err(ActionError::InvalidResi(raw_resi.to_string()));
        }
        let (previous, expedition_courier) = self.snapshot(|p| {
            (
                p.receipt(&resi).cloned(),
                p.expedition(&resi).and_then(|e| e.courier.as_deref().map(normalize_key)),
            )
        });
        let scope_date = previous
            .as_ref()
            .map(|r| r.created.date_naive())
            .unwrap_or_else(|| Utc::now().date_naive());
        // A cancelled receipt is labelled BATAL; its caches live under the real courier.
        let scope_courier = expedition_courier
            .or_else(|| previous.as_ref().and_then(|r| r.keterangan.as_deref().map(normalize_key)))
            .filter(|c| !c.is_empty() && c != COURIER_CANCELLED);

        let gateway = self.engine.gateway().clone();
        let remote_resi = resi.clone();
        let patch_resi = resi.clone();
        let undo_resi = resi.clone();
        let deleted = with_optimistic_update(
            &*self.projection,
            move |p| {
                p.remove_receipt(&patch_resi);
            },
            move |p| p.restore_receipt(&undo_resi, previous),
            move || async move { gateway.delete_receipt(&remote_resi).await },
        )
        .await?;

        let coordinator = self.engine.coordinator();
        coordinator.invalidate(scope_date, scope_courier.as_deref());
        if scope_date != Utc::now().date_naive() {
            coordinator.invalidate(Utc::now().date_naive(), None);
        }
        info!(resi = %resi, deleted, "Receipt deleted");
        Ok(deleted)
    }

    pub fn pending_operation_count(&self) -> usize {
        self.engine.pending_operation_count()
    }

    pub async fn trigger_sync_now(&self) -> CycleOutcome {
        self.engine.trigger_sync_now().await
    }

    pub fn compute_courier_summaries(&self, inputs: &SummaryInputs) -> Vec<CourierSummary> {
        summary::compute_courier_summaries(inputs, &self.engine.config().known_couriers)
    }

    /// Fetch the three datasets for `date`, aggregate them and cache the result.
    pub async fn load_courier_summaries(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<CourierSummary>, ActionError> {
        let config = self.engine.config();
        let inputs = summary::load_summary_inputs(
            self.engine.gateway().as_ref(),
            date,
            config.expedition_window_days,
        )
        .await?;
        let summaries = self.compute_courier_summaries(&inputs);

        if let Ok(value) = serde_json::to_value(&summaries) {
            self.engine
                .coordinator()
                .cache()
                .put(QueryKey::CourierSummaries { date }, value);
        }
        if date == Utc::now().date_naive() {
            let mut projection = self.projection.lock().unwrap_or_else(|e| e.into_inner());
            projection.load_expeditions(inputs.date_expeditions);
            projection.load_receipts(inputs.date_receipts);
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InvalidationCoordinator, QueryCache};
    use crate::config::AppConfig;
    use crate::db;
    use crate::gateway::testing::MemoryGateway;
    use crate::models::ExpeditionRecord;
    use crate::queue::OperationStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn actions(gateway: Arc<MemoryGateway>) -> ResiActions<MemoryGateway> {
        let db = Arc::new(db::init_in_memory().unwrap());
        let coordinator = InvalidationCoordinator::new(Arc::new(QueryCache::new()));
        let engine = SyncEngineContext::new(
            OperationStore::new(db),
            gateway,
            coordinator,
            AppConfig::default(),
        );
        ResiActions::new(engine, Arc::new(Mutex::new(LocalProjection::new())))
    }

    fn expedition(resi: &str, courier: &str) -> ExpeditionRecord {
        ExpeditionRecord {
            resi: resi.into(),
            courier: Some(courier.into()),
            order_number: Some("ORD-9".into()),
            sales_channel: Some("shopee".into()),
            purchased_at: None,
            flag: Some(ExpeditionFlag::No),
            follow_up_checked: false,
            created: Some(Utc.with_ymd_and_hms(2024, 1, 4, 7, 30, 0).unwrap()),
        }
    }

    fn scan(resi: &str, sack: &str) -> ScanPayload {
        ScanPayload {
            resi_number: resi.into(),
            sack_number: sack.into(),
            courier_name: Some("jne".into()),
            is_rescan: false,
        }
    }

    #[test]
    fn test_normalize_resi_bounds() {
        assert_eq!(normalize_resi("  jp1234 ").unwrap(), "JP1234");
        assert!(matches!(normalize_resi("ab"), Err(ActionError::InvalidResi(_))));
        assert!(normalize_resi(&"X".repeat(51)).is_err());
        assert!(normalize_resi(&"X".repeat(50)).is_ok());
    }

    #[tokio::test]
    async fn test_enqueue_scan_persists_and_patches_projection() {
        let actions = actions(Arc::new(MemoryGateway::new()));
        actions
            .projection()
            .lock()
            .unwrap()
            .load_expeditions([expedition("JX100", "JNE")]);

        let pending = actions.enqueue_scan(scan(" jx100 ", "3")).await.unwrap();

        assert_eq!(pending.retry_count, 0);
        assert_eq!(pending.operation.resi_number(), "JX100");
        assert_eq!(actions.pending_operation_count(), 1);
        let projection = actions.projection().lock().unwrap();
        assert_eq!(projection.receipt("JX100").unwrap().sack_number.as_deref(), Some("3"));
        assert_eq!(projection.expedition("JX100").unwrap().flag, Some(ExpeditionFlag::Yes));
    }

    #[tokio::test]
    async fn test_enqueue_scan_rejects_bad_input_and_duplicates() {
        let actions = actions(Arc::new(MemoryGateway::new()));
        assert!(matches!(
            actions.enqueue_scan(scan("JX", "1")).await,
            Err(ActionError::InvalidResi(_))
        ));
        assert!(matches!(
            actions.enqueue_scan(scan("JX200", " ")).await,
            Err(ActionError::MissingSack)
        ));

        actions.enqueue_scan(scan("JX200", "1")).await.unwrap();
        assert!(matches!(
            actions.enqueue_scan(scan("JX200", "2")).await,
            Err(ActionError::AlreadyScanned(_))
        ));
        let rescan = ScanPayload {
            is_rescan: true,
            ..scan("JX200", "2")
        };
        actions.enqueue_scan(rescan).await.unwrap();
        assert_eq!(actions.pending_operation_count(), 2);
    }

    #[tokio::test]
    async fn test_confirm_missing_everywhere_fails_immediately() {
        let actions = actions(Arc::new(MemoryGateway::new()));
        let result = actions
            .enqueue_confirm(ConfirmPayload {
                resi_number: "NOPE123".into(),
                expedisi_created: None,
                courier_name: None,
            })
            .await;
        assert!(matches!(result, Err(ActionError::ExpeditionNotFound(_))));
        assert_eq!(actions.pending_operation_count(), 0);
    }

    #[tokio::test]
    async fn test_confirm_fills_payload_from_backend() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.seed_expedition(expedition("CF100", "sicepat"));
        let actions = actions(gateway);

        let pending = actions
            .enqueue_confirm(ConfirmPayload {
                resi_number: "cf100".into(),
                expedisi_created: None,
                courier_name: None,
            })
            .await
            .unwrap();

        match pending.operation {
            Operation::Confirm(p) => {
                assert_eq!(p.courier_name.as_deref(), Some("SICEPAT"));
                assert_eq!(
                    p.expedisi_created,
                    Some(Utc.with_ymd_and_hms(2024, 1, 4, 7, 30, 0).unwrap())
                );
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_confirm_offline_is_still_queued() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.set_offline(true);
        let actions = actions(gateway);
        actions
            .enqueue_confirm(ConfirmPayload {
                resi_number: "OFF100".into(),
                expedisi_created: None,
                courier_name: None,
            })
            .await
            .unwrap();
        assert_eq!(actions.pending_operation_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_carries_previous_receipt_details() {
        let actions = actions(Arc::new(MemoryGateway::new()));
        actions.enqueue_scan(scan("CX100", "5")).await.unwrap();

        let pending = actions
            .enqueue_cancel(CancelPayload {
                resi_number: "CX100".into(),
                fallback_created: None,
                keterangan: None,
            })
            .await
            .unwrap();

        match pending.operation {
            Operation::Cancel(p) => {
                assert!(p.fallback_created.is_some());
                assert_eq!(p.keterangan.as_deref(), Some("JNE"));
            }
            other => panic!("unexpected operation {other:?}"),
        }
        let projection = actions.projection().lock().unwrap();
        let receipt = projection.receipt("CX100").unwrap();
        assert_eq!(receipt.schedule, Some(Schedule::Batal));
        assert_eq!(receipt.sack_number.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_toggle_follow_up_patches_projection() {
        let actions = actions(Arc::new(MemoryGateway::new()));
        actions
            .projection()
            .lock()
            .unwrap()
            .load_expeditions([expedition("FU100", "JNE")]);
        actions
            .enqueue_toggle_follow_up(ToggleFollowUpPayload {
                resi_number: "FU100".into(),
                new_follow_up_status: true,
            })
            .await
            .unwrap();
        assert!(
            actions
                .projection()
                .lock()
                .unwrap()
                .expedition("FU100")
                .unwrap()
                .follow_up_checked
        );
    }

    #[tokio::test]
    async fn test_delete_receipt_invalidates_caches() {
        let gateway = Arc::new(MemoryGateway::new());
        let record = ReceiptRecord {
            resi: "DL100".into(),
            sack_number: Some("2".into()),
            created: Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap(),
            keterangan: Some("JNE".into()),
            schedule: Some(Schedule::OnTime),
        };
        gateway.seed_receipt(record.clone());
        let actions = actions(gateway.clone());
        actions.projection().lock().unwrap().load_receipts([record]);

        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let key = QueryKey::SackSummary {
            date,
            courier: "JNE".into(),
        };
        let cache = actions.engine().coordinator().cache().clone();
        cache.put(key.clone(), json!([]));

        assert!(actions.delete_receipt("dl100").await.unwrap());
        assert!(gateway.receipt("DL100").is_none());
        assert!(actions.projection().lock().unwrap().receipt("DL100").is_none());
        assert!(cache.is_stale(&key));
    }

    #[tokio::test]
    async fn test_delete_cancelled_receipt_invalidates_expedition_courier() {
        let gateway = Arc::new(MemoryGateway::new());
        let record = ReceiptRecord {
            resi: "DL300".into(),
            sack_number: Some(CANCELLED_SACK.into()),
            created: Utc.with_ymd_and_hms(2024, 1, 5, 9, 0, 0).unwrap(),
            keterangan: Some(COURIER_CANCELLED.into()),
            schedule: Some(Schedule::Batal),
        };
        gateway.seed_receipt(record.clone());
        let actions = actions(gateway);
        {
            let mut projection = actions.projection().lock().unwrap();
            projection.load_expeditions([expedition("DL300", "sicepat")]);
            projection.load_receipts([record]);
        }

        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let courier_key = QueryKey::SackSummary {
            date,
            courier: "SICEPAT".into(),
        };
        let sentinel_key = QueryKey::SackSummary {
            date,
            courier: COURIER_CANCELLED.into(),
        };
        let cache = actions.engine().coordinator().cache().clone();
        cache.put(courier_key.clone(), json!([]));
        cache.put(sentinel_key.clone(), json!([]));

        assert!(actions.delete_receipt("DL300").await.unwrap());
        assert!(cache.is_stale(&courier_key));
        assert!(cache.is_fresh(&sentinel_key));
    }

    #[tokio::test]
    async fn test_delete_receipt_failure_restores_projection() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_next("DL200", 1);
        let actions = actions(gateway);
        let record = ReceiptRecord {
            resi: "DL200".into(),
            sack_number: Some("1".into()),
            created: Utc::now(),
            keterangan: Some("JNE".into()),
            schedule: Some(Schedule::OnTime),
        };
        actions.projection().lock().unwrap().load_receipts([record.clone()]);

        let result = actions.delete_receipt("DL200").await;
        assert!(matches!(result, Err(ActionError::Gateway(_))));
        assert_eq!(
            actions.projection().lock().unwrap().receipt("DL200"),
            Some(&record)
        );
    }

    #[tokio::test]
    async fn test_enqueue_then_sync_applies_remotely() {
        let gateway = Arc::new(MemoryGateway::new());
        let actions = actions(gateway.clone());
        actions.enqueue_scan(scan("SY100", "7")).await.unwrap();

        match actions.trigger_sync_now().await {
            CycleOutcome::Completed(report) => assert_eq!(report.synced, 1),
            CycleOutcome::Skipped => panic!("cycle skipped"),
        }
        assert_eq!(actions.pending_operation_count(), 0);
        assert_eq!(gateway.receipt("SY100").unwrap().sack_number.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_load_courier_summaries_caches_result() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.seed_expedition(expedition("SM100", "JNE"));
        let actions = actions(gateway);
        let date = NaiveDate::from_ymd_opt(2024, 1, 4).unwrap();

        let summaries = actions.load_courier_summaries(date).await.unwrap();
        let jne = summaries.iter().find(|s| s.courier == "JNE").unwrap();
        assert_eq!(jne.total_transactions, 1);
        assert_eq!(jne.remaining, 1);
        assert_eq!(summaries.len(), AppConfig::default().known_couriers.len());
        assert!(actions
            .engine()
            .coordinator()
            .cache()
            .is_fresh(&QueryKey::CourierSummaries { date }));
    }
}
