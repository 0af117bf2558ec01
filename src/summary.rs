//! Per-courier dashboard summaries.
//!
//! Merges three datasets into one [`CourierSummary`] per known courier:
//! expedition rows for a trailing window (to attribute late scans of older
//! shipments), expedition rows for the selected date, and receipt rows for
//! the selected date. The computation is a pure function of its inputs.
//!
//! Rows that do not resolve to a known courier are left out of every
//! counter. They are logged at debug level, never folded into a catch-all.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::gateway::{self, GatewayResult, RemoteGateway};
use crate::models::{
    normalize_key, parent_courier, ExpeditionFlag, ExpeditionRecord, ReceiptRecord, Schedule,
    COURIER_CANCELLED, COURIER_ID_RECOMMENDATION,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourierSummary {
    pub courier: String,
    /// Expected shipments on the selected date.
    pub total_transactions: u64,
    /// Receipts scanned on time.
    pub total_scanned: u64,
    /// Expected shipments still flagged `NO` ("sisa").
    pub remaining: u64,
    pub sack_count: u64,
    pub recommended_count: u64,
    pub cancelled_count: u64,
    pub late_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SummaryInputs {
    pub window_expeditions: Vec<ExpeditionRecord>,
    pub date_expeditions: Vec<ExpeditionRecord>,
    pub date_receipts: Vec<ReceiptRecord>,
}

/// Normalized resi number to normalized courier name.
pub type ResiCourierMap = HashMap<String, String>;

pub fn build_resi_courier_map(expeditions: &[ExpeditionRecord]) -> ResiCourierMap {
    let mut map = ResiCourierMap::with_capacity(expeditions.len());
    for record in expeditions {
        let resi = normalize_key(&record.resi);
        if resi.is_empty() {
            continue;
        }
        let courier = record
            .courier
            .as_deref()
            .map(normalize_key)
            .unwrap_or_default();
        if courier.is_empty() {
            continue;
        }
        map.insert(resi, courier);
    }
    map
}

struct Accumulator {
    summary: CourierSummary,
    sacks: HashSet<String>,
}

pub fn compute_courier_summaries(
    inputs: &SummaryInputs,
    known_couriers: &[String],
) -> Vec<CourierSummary> {
    let resi_map = build_resi_courier_map(&inputs.window_expeditions);

    let mut buckets: Vec<Accumulator> = Vec::with_capacity(known_couriers.len() + 1);
    let mut index: HashMap<String, usize> = HashMap::with_capacity(known_couriers.len() + 1);
    // Cancelled receipts without an expedition row still count somewhere.
    let sentinel = COURIER_CANCELLED.to_string();
    for courier in known_couriers.iter().chain(std::iter::once(&sentinel)) {
        let name = normalize_key(courier);
        if name.is_empty() || index.contains_key(&name) {
            continue;
        }
        index.insert(name.clone(), buckets.len());
        buckets.push(Accumulator {
            summary: CourierSummary {
                courier: name,
                ..CourierSummary::default()
            },
            sacks: HashSet::new(),
        });
    }

    let resolve = |raw: &str| -> Option<usize> {
        let normalized = normalize_key(raw);
        index.get(parent_courier(&normalized)).copied()
    };

    for record in &inputs.date_expeditions {
        let courier = record.courier.as_deref().unwrap_or_default();
        let Some(slot) = resolve(courier) else {
            debug!(resi = %record.resi, courier = %courier, "Expedition row with unknown courier skipped");
            continue;
        };
        let summary = &mut buckets[slot].summary;
        summary.total_transactions += 1;
        if record.flag == Some(ExpeditionFlag::No) {
            summary.remaining += 1;
        }
    }

    for record in &inputs.date_receipts {
        let classification = record
            .keterangan
            .as_deref()
            .map(normalize_key)
            .unwrap_or_default();
        let target = resi_map
            .get(&normalize_key(&record.resi))
            .map(String::as_str)
            .unwrap_or(classification.as_str());
        let Some(slot) = resolve(target) else {
            debug!(resi = %record.resi, courier = %target, "Receipt with unknown courier skipped");
            continue;
        };

        let bucket = &mut buckets[slot];
        match record.schedule {
            Some(Schedule::OnTime) => bucket.summary.total_scanned += 1,
            Some(Schedule::Batal) => bucket.summary.cancelled_count += 1,
            Some(Schedule::Late) => bucket.summary.late_count += 1,
            None => {}
        }
        if classification == COURIER_ID_RECOMMENDATION {
            bucket.summary.recommended_count += 1;
        }
        if let Some(sack) = record.sack_number.as_deref().map(str::trim) {
            if !sack.is_empty() {
                bucket.sacks.insert(sack.to_string());
            }
        }
    }

    buckets
        .into_iter()
        .map(|mut bucket| {
            bucket.summary.sack_count = bucket.sacks.len() as u64;
            bucket.summary
        })
        .collect()
}

/// `[start, end)` of a calendar day in UTC.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
    (start, start + ChronoDuration::days(1))
}

/// Fetch the three datasets for `date`.
///
/// The expedition window covers `window_days` days ending with `date`; the
/// per-date expedition list is taken from that window.
pub async fn load_summary_inputs<G: RemoteGateway>(
    gateway: &G,
    date: NaiveDate,
    window_days: u32,
) -> GatewayResult<SummaryInputs> {
    let (day_start, day_end) = day_bounds(date);
    let window_start = day_start - ChronoDuration::days(i64::from(window_days.max(1)) - 1);

    let window_expeditions =
        gateway::list_expeditions_by_date_range(gateway, window_start, day_end).await?;
    let date_receipts = gateway::list_receipts_by_date_range(gateway, day_start, day_end).await?;
    let date_expeditions = window_expeditions
        .iter()
        .filter(|r| r.effective_date() == Some(date))
        .cloned()
        .collect();

    debug!(
        date = %date,
        window_rows = window_expeditions.len(),
        receipts = date_receipts.len(),
        "Summary inputs loaded"
    );

    Ok(SummaryInputs {
        window_expeditions,
        date_expeditions,
        date_receipts,
    })
}
