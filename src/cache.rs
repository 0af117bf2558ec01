//! Query cache and the invalidation coordinator.
//!
//! Dashboard queries are cached as JSON values under a [`QueryKey`].
//! Mutations never edit cached values in place; they mark the affected keys
//! stale and the owning screen refetches. The input screen's two aggregates
//! (sack summary and last-used sack) are refreshed eagerly after a sync
//! cycle so the operator sees the result without waiting for the next poll.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::gateway::{self, GatewayResult, RemoteGateway};
use crate::models::{normalize_key, parent_courier, ReceiptRecord, Schedule};
use crate::summary::day_bounds;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKey {
    SummaryCounts { date: NaiveDate },
    CourierSummaries { date: NaiveDate },
    ReceiptsByDate { date: NaiveDate },
    ExpeditionsByDate { date: NaiveDate },
    SackSummary { date: NaiveDate, courier: String },
    LastUsedSack { date: NaiveDate, courier: String },
    ExpeditionRecords { date: NaiveDate, courier: String },
    /// Rolling multi-day expedition list.
    AllExpeditionsWindow,
    /// Recently scanned resi numbers used for duplicate detection.
    RecentResiNumbers,
}

impl QueryKey {
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            QueryKey::SummaryCounts { date }
            | QueryKey::CourierSummaries { date }
            | QueryKey::ReceiptsByDate { date }
            | QueryKey::ExpeditionsByDate { date }
            | QueryKey::SackSummary { date, .. }
            | QueryKey::LastUsedSack { date, .. }
            | QueryKey::ExpeditionRecords { date, .. } => Some(*date),
            QueryKey::AllExpeditionsWindow | QueryKey::RecentResiNumbers => None,
        }
    }

    pub fn courier(&self) -> Option<&str> {
        match self {
            QueryKey::SackSummary { courier, .. }
            | QueryKey::LastUsedSack { courier, .. }
            | QueryKey::ExpeditionRecords { courier, .. } => Some(courier.as_str()),
            _ => None,
        }
    }

    fn is_rolling(&self) -> bool {
        matches!(self, QueryKey::AllExpeditionsWindow | QueryKey::RecentResiNumbers)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: Value,
    pub stale: bool,
    pub updated_at: DateTime<Utc>,
}

/// Thread-safe store of cached query results.
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: Mutex<HashMap<QueryKey, CachedValue>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<QueryKey, CachedValue>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a fresh value.
    pub fn put(&self, key: QueryKey, value: Value) {
        self.lock().insert(
            key,
            CachedValue {
                value,
                stale: false,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, key: &QueryKey) -> Option<CachedValue> {
        self.lock().get(key).cloned()
    }

    /// Cached and not yet invalidated.
    pub fn is_fresh(&self, key: &QueryKey) -> bool {
        self.lock().get(key).map(|e| !e.stale).unwrap_or(false)
    }

    pub fn is_stale(&self, key: &QueryKey) -> bool {
        self.lock().get(key).map(|e| e.stale).unwrap_or(false)
    }

    /// Mark every entry matching `predicate` stale. Returns how many flipped.
    pub fn mark_stale_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&QueryKey) -> bool,
    {
        let mut entries = self.lock();
        let mut flipped = 0;
        for (key, entry) in entries.iter_mut() {
            if !entry.stale && predicate(key) {
                entry.stale = true;
                flipped += 1;
            }
        }
        flipped
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Input-screen aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SackCount {
    pub sack_number: String,
    pub count: u64,
}

fn belongs_to(record: &ReceiptRecord, courier: &str) -> bool {
    let label = record
        .keterangan
        .as_deref()
        .map(normalize_key)
        .unwrap_or_default();
    parent_courier(&label) == courier
}

fn sack_order(sack: &str) -> (u64, String) {
    (sack.parse::<u64>().unwrap_or(u64::MAX), sack.to_string())
}

/// Receipts per sack for one courier, cancelled scans excluded.
pub fn sack_summary(receipts: &[ReceiptRecord], courier: &str) -> Vec<SackCount> {
    let mut counts: BTreeMap<(u64, String), u64> = BTreeMap::new();
    for record in receipts {
        if record.schedule == Some(Schedule::Batal) || !belongs_to(record, courier) {
            continue;
        }
        let Some(sack) = record.sack_number.as_deref().map(str::trim) else {
            continue;
        };
        if sack.is_empty() {
            continue;
        }
        *counts.entry(sack_order(sack)).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|((_, sack_number), count)| SackCount { sack_number, count })
        .collect()
}

/// Sack of the most recent non-cancelled scan for `courier`.
pub fn last_used_sack(receipts: &[ReceiptRecord], courier: &str) -> Option<String> {
    receipts
        .iter()
        .filter(|r| r.schedule != Some(Schedule::Batal) && belongs_to(r, courier))
        .filter_map(|r| {
            r.sack_number
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| (r.created, s.to_string()))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, sack)| sack)
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Translates "something changed at (date, courier)" into stale cache keys.
#[derive(Debug, Clone)]
pub struct InvalidationCoordinator {
    cache: Arc<QueryCache>,
}

impl InvalidationCoordinator {
    pub fn new(cache: Arc<QueryCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Mark stale every query affected by a mutation on `date`.
    ///
    /// Date-keyed queries are always hit; courier-keyed queries only for
    /// the given courier, after mapping sentinel labels onto their parent
    /// bucket. The rolling window caches are always hit.
    pub fn invalidate(&self, date: NaiveDate, courier: Option<&str>) -> usize {
        let courier = courier
            .map(normalize_key)
            .filter(|c| !c.is_empty())
            .map(|c| parent_courier(&c).to_string());

        let flipped = self.cache.mark_stale_where(|key| {
            if key.is_rolling() {
                return true;
            }
            if key.date() != Some(date) {
                return false;
            }
            match key.courier() {
                None => true,
                Some(keyed) => courier.as_deref() == Some(keyed),
            }
        });
        debug!(
            date = %date,
            courier = courier.as_deref().unwrap_or("-"),
            flipped,
            "Caches invalidated"
        );
        flipped
    }

    /// Invalidate a batch of (date, courier) scopes plus `today`.
    pub fn invalidate_batch<'a, I>(&self, today: NaiveDate, scopes: I) -> usize
    where
        I: IntoIterator<Item = (NaiveDate, Option<&'a str>)>,
    {
        let mut total = self.invalidate(today, None);
        let mut seen = BTreeSet::new();
        for (date, courier) in scopes {
            if seen.insert((date, courier.map(str::to_string))) {
                total += self.invalidate(date, courier);
            }
        }
        total
    }

    /// Refetch the sack summary and last-used sack for each (date, courier).
    ///
    /// Receipts are fetched once per date. A failing date is logged and
    /// skipped; the stale marks stay in place for the screen to refetch.
    pub async fn refresh_input_caches<G: RemoteGateway>(
        &self,
        gateway: &G,
        scopes: &[(NaiveDate, String)],
    ) -> GatewayResult<usize> {
        let mut by_date: BTreeMap<NaiveDate, BTreeSet<String>> = BTreeMap::new();
        for (date, courier) in scopes {
            let normalized = normalize_key(courier);
            if normalized.is_empty() {
                continue;
            }
            by_date
                .entry(*date)
                .or_default()
                .insert(parent_courier(&normalized).to_string());
        }

        let mut refreshed = 0;
        let mut last_error = None;
        for (date, couriers) in by_date {
            let (start, end) = day_bounds(date);
            let receipts = match gateway::list_receipts_by_date_range(gateway, start, end).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(date = %date, error = %e, "Input cache refresh failed");
                    last_error = Some(e);
                    continue;
                }
            };
            for courier in couriers {
                let sacks = sack_summary(&receipts, &courier);
                let last = last_used_sack(&receipts, &courier);
                self.cache.put(
                    QueryKey::SackSummary {
                        date,
                        courier: courier.clone(),
                    },
                    serde_json::to_value(&sacks).unwrap_or(Value::Null),
                );
                self.cache.put(
                    QueryKey::LastUsedSack { date, courier },
                    last.map(Value::String).unwrap_or(Value::Null),
                );
                refreshed += 1;
            }
        }

        match (refreshed, last_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(refreshed),
        }
    }
}
