//! Remote-apply routines, one per operation type.
//!
//! Every routine can be run again with the same payload without creating
//! a second receipt row. Each reports the business date and courier it
//! touched so the caller can invalidate the right caches.

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::gateway::{GatewayError, GatewayResult, RemoteGateway, RECEIPT_CONFLICT_KEY};
use crate::models::{
    normalize_key, CancelPayload, ConfirmPayload, ExpeditionFlag, Operation, ReceiptPatch,
    ReceiptRecord, ScanPayload, Schedule, ToggleFollowUpPayload, CANCELLED_SACK,
    COURIER_CANCELLED,
};

/// Scope of a successfully applied operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEffect {
    pub date: NaiveDate,
    pub courier: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Sack written by a confirm when none is known.
    pub default_sack: String,
    pub now: DateTime<Utc>,
}

impl ApplyOptions {
    pub fn new(default_sack: impl Into<String>) -> Self {
        Self {
            default_sack: default_sack.into(),
            now: Utc::now(),
        }
    }
}

fn courier_label(raw: Option<&str>) -> Option<String> {
    raw.map(normalize_key).filter(|c| !c.is_empty())
}

/// Dispatch an operation to its remote-apply routine.
pub async fn apply_operation<G: RemoteGateway>(
    gateway: &G,
    operation: &Operation,
    options: &ApplyOptions,
) -> GatewayResult<AppliedEffect> {
    match operation {
        Operation::Scan(payload) => apply_scan(gateway, payload, options).await,
        Operation::Confirm(payload) => apply_confirm(gateway, payload, options).await,
        Operation::Cancel(payload) => apply_cancel(gateway, payload, options).await,
        Operation::ToggleFollowUp(payload) => {
            apply_toggle_follow_up(gateway, payload, options).await
        }
    }
}

/// Record a scan and mark the matching expedition row as scanned.
///
/// A duplicate-key insert falls back to updating the existing row, so a
/// retried scan never produces a second receipt. Either way the row ends up
/// `ontime`, including one a previous cancel marked `batal`. A rescan keeps
/// the row's original timestamp; a plain scan stamps the current time.
pub async fn apply_scan<G: RemoteGateway>(
    gateway: &G,
    payload: &ScanPayload,
    options: &ApplyOptions,
) -> GatewayResult<AppliedEffect> {
    let resi = payload.resi_number.trim();
    let courier = courier_label(payload.courier_name.as_deref());
    let sack = payload.sack_number.trim().to_string();

    let rescan_patch = ReceiptPatch {
        sack_number: Some(sack.clone()),
        keterangan: courier.clone(),
        schedule: Some(Schedule::OnTime),
        ..ReceiptPatch::default()
    };

    let mut applied = false;
    if payload.is_rescan {
        applied = gateway.update_receipt(resi, &rescan_patch).await?;
        if !applied {
            debug!(resi = %resi, "Rescan found no receipt, inserting");
        }
    }

    if !applied {
        let record = ReceiptRecord {
            resi: resi.to_string(),
            sack_number: Some(sack),
            created: options.now,
            keterangan: courier.clone(),
            schedule: Some(Schedule::OnTime),
        };
        match gateway.insert_receipt(&record).await {
            Ok(()) => {}
            Err(GatewayError::Conflict(_)) => {
                debug!(resi = %resi, "Receipt already exists, overwriting");
                let patch = ReceiptPatch {
                    created: (!payload.is_rescan).then_some(options.now),
                    ..rescan_patch
                };
                gateway.update_receipt(resi, &patch).await?;
            }
            Err(e) => return Err(e),
        }
    }

    let matched = gateway
        .update_expedition_flag(resi, ExpeditionFlag::Yes)
        .await?;
    if !matched {
        debug!(resi = %resi, "No expedition row for scan, kept as recommendation");
    }

    Ok(AppliedEffect {
        date: options.now.date_naive(),
        courier,
    })
}

/// Mark the expedition as scanned and upsert its receipt using the
/// expedition's own creation time and courier.
pub async fn apply_confirm<G: RemoteGateway>(
    gateway: &G,
    payload: &ConfirmPayload,
    options: &ApplyOptions,
) -> GatewayResult<AppliedEffect> {
    let resi = payload.resi_number.trim();
    gateway
        .update_expedition_flag(resi, ExpeditionFlag::Yes)
        .await?;

    let mut created = payload.expedisi_created;
    let mut courier = courier_label(payload.courier_name.as_deref());
    if created.is_none() || courier.is_none() {
        if let Some(expedition) = gateway.find_expedition(resi).await? {
            created = created.or(expedition.created).or(expedition.purchased_at);
            courier = courier.or_else(|| courier_label(expedition.courier.as_deref()));
        }
    }
    let created = created.unwrap_or_else(|| {
        warn!(resi = %resi, "Confirm without expedition timestamp, using current time");
        options.now
    });

    let record = ReceiptRecord {
        resi: resi.to_string(),
        sack_number: Some(options.default_sack.clone()),
        created,
        keterangan: courier.clone(),
        schedule: Some(Schedule::OnTime),
    };
    gateway.upsert_receipt(&record, RECEIPT_CONFLICT_KEY).await?;

    Ok(AppliedEffect {
        date: created.date_naive(),
        courier,
    })
}

/// Write the cancellation markers onto the receipt, creating it if needed.
pub async fn apply_cancel<G: RemoteGateway>(
    gateway: &G,
    payload: &CancelPayload,
    options: &ApplyOptions,
) -> GatewayResult<AppliedEffect> {
    let resi = payload.resi_number.trim();
    let expedition = gateway.find_expedition(resi).await?;

    let created = expedition
        .as_ref()
        .and_then(|e| e.created.or(e.purchased_at))
        .or(payload.fallback_created)
        .unwrap_or(options.now);
    let courier = expedition
        .as_ref()
        .and_then(|e| courier_label(e.courier.as_deref()))
        .or_else(|| courier_label(payload.keterangan.as_deref()))
        .filter(|c| c != COURIER_CANCELLED);

    let record = ReceiptRecord {
        resi: resi.to_string(),
        sack_number: Some(CANCELLED_SACK.to_string()),
        created,
        keterangan: Some(COURIER_CANCELLED.to_string()),
        schedule: Some(Schedule::Batal),
    };
    gateway.upsert_receipt(&record, RECEIPT_CONFLICT_KEY).await?;
    info!(resi = %resi, "Receipt cancelled");

    Ok(AppliedEffect {
        date: created.date_naive(),
        courier,
    })
}

pub async fn apply_toggle_follow_up<G: RemoteGateway>(
    gateway: &G,
    payload: &ToggleFollowUpPayload,
    options: &ApplyOptions,
) -> GatewayResult<AppliedEffect> {
    let resi = payload.resi_number.trim();
    let matched = gateway
        .update_expedition_follow_up(resi, payload.new_follow_up_status)
        .await?;
    if !matched {
        warn!(resi = %resi, "Follow-up toggle matched no expedition row");
    }
    Ok(AppliedEffect {
        date: options.now.date_naive(),
        courier: None,
    })
}
