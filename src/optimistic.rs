//! Optimistic local state.
//!
//! UI actions patch an in-memory [`LocalProjection`] before the write is
//! confirmed, then undo the patch if the write fails. The two phases are
//! captured once in [`with_optimistic_update`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::models::{normalize_key, ExpeditionFlag, ExpeditionRecord, ReceiptRecord};

fn lock<S>(state: &Mutex<S>) -> MutexGuard<'_, S> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Apply `patch`, run `remote`, and apply `inverse` if `remote` fails.
///
/// The lock is released while `remote` runs, so other actions may patch the
/// same state concurrently; each inverse only undoes its own patch.
pub async fn with_optimistic_update<S, P, I, F, Fut, T, E>(
    state: &Mutex<S>,
    patch: P,
    inverse: I,
    remote: F,
) -> Result<T, E>
where
    P: FnOnce(&mut S),
    I: FnOnce(&mut S),
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    patch(&mut lock(state));
    match remote().await {
        Ok(value) => Ok(value),
        Err(e) => {
            inverse(&mut lock(state));
            debug!("Optimistic update rolled back");
            Err(e)
        }
    }
}

/// What the active screen currently shows, keyed by normalized resi.
#[derive(Debug, Clone, Default)]
pub struct LocalProjection {
    expeditions: HashMap<String, ExpeditionRecord>,
    receipts: HashMap<String, ReceiptRecord>,
}

impl LocalProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the expedition rows with a freshly fetched list.
    pub fn load_expeditions<I: IntoIterator<Item = ExpeditionRecord>>(&mut self, rows: I) {
        self.expeditions = rows
            .into_iter()
            .map(|r| (normalize_key(&r.resi), r))
            .collect();
    }

    pub fn load_receipts<I: IntoIterator<Item = ReceiptRecord>>(&mut self, rows: I) {
        self.receipts = rows
            .into_iter()
            .map(|r| (normalize_key(&r.resi), r))
            .collect();
    }

    pub fn expedition(&self, resi: &str) -> Option<&ExpeditionRecord> {
        self.expeditions.get(&normalize_key(resi))
    }

    pub fn receipt(&self, resi: &str) -> Option<&ReceiptRecord> {
        self.receipts.get(&normalize_key(resi))
    }

    pub fn receipt_count(&self) -> usize {
        self.receipts.len()
    }

    /// Returns the previous flag, or `None` when the row is not shown.
    pub fn set_flag(&mut self, resi: &str, flag: Option<ExpeditionFlag>) -> Option<Option<ExpeditionFlag>> {
        self.expeditions
            .get_mut(&normalize_key(resi))
            .map(|row| std::mem::replace(&mut row.flag, flag))
    }

    pub fn set_follow_up(&mut self, resi: &str, checked: bool) -> Option<bool> {
        self.expeditions
            .get_mut(&normalize_key(resi))
            .map(|row| std::mem::replace(&mut row.follow_up_checked, checked))
    }

    /// Insert or replace a receipt, returning the row it replaced.
    pub fn put_receipt(&mut self, record: ReceiptRecord) -> Option<ReceiptRecord> {
        self.receipts.insert(normalize_key(&record.resi), record)
    }

    pub fn remove_receipt(&mut self, resi: &str) -> Option<ReceiptRecord> {
        self.receipts.remove(&normalize_key(resi))
    }

    /// Put back whatever `put_receipt`/`remove_receipt` displaced.
    pub fn restore_receipt(&mut self, resi: &str, previous: Option<ReceiptRecord>) {
        let key = normalize_key(resi);
        match previous {
            Some(record) => {
                self.receipts.insert(key, record);
            }
            None => {
                self.receipts.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn expedition(resi: &str) -> ExpeditionRecord {
        ExpeditionRecord {
            resi: resi.into(),
            courier: Some("JNE".into()),
            order_number: None,
            sales_channel: None,
            purchased_at: None,
            flag: Some(ExpeditionFlag::No),
            follow_up_checked: false,
            created: Some(Utc.with_ymd_and_hms(2024, 1, 5, 8, 0, 0).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_success_keeps_patch() {
        let state = Mutex::new(LocalProjection::new());
        state.lock().unwrap().load_expeditions([expedition("a1")]);

        let result: Result<u8, String> = with_optimistic_update(
            &state,
            |s| {
                s.set_flag("A1", Some(ExpeditionFlag::Yes));
            },
            |s| {
                s.set_flag("A1", Some(ExpeditionFlag::No));
            },
            || async { Ok(7) },
        )
        .await;

        assert_eq!(result, Ok(7));
        let projection = state.lock().unwrap();
        assert_eq!(projection.expedition("a1").unwrap().flag, Some(ExpeditionFlag::Yes));
    }

    #[tokio::test]
    async fn test_failure_applies_inverse() {
        let state = Mutex::new(LocalProjection::new());
        state.lock().unwrap().load_expeditions([expedition("F1")]);

        let result: Result<(), String> = with_optimistic_update(
            &state,
            |s| {
                s.set_follow_up("F1", true);
            },
            |s| {
                s.set_follow_up("F1", false);
            },
            || async { Err("backend down".to_string()) },
        )
        .await;

        assert_eq!(result, Err("backend down".to_string()));
        assert!(!state.lock().unwrap().expedition("F1").unwrap().follow_up_checked);
    }

    #[test]
    fn test_restore_receipt_undoes_remove() {
        let mut projection = LocalProjection::new();
        let record = ReceiptRecord {
            resi: "R1".into(),
            sack_number: Some("2".into()),
            created: Utc.with_ymd_and_hms(2024, 1, 5, 8, 0, 0).unwrap(),
            keterangan: Some("JNE".into()),
            schedule: None,
        };
        projection.put_receipt(record.clone());
        let removed = projection.remove_receipt(" r1 ");
        assert_eq!(projection.receipt_count(), 0);
        projection.restore_receipt("R1", removed);
        assert_eq!(projection.receipt("R1"), Some(&record));

        projection.restore_receipt("R1", None);
        assert!(projection.receipt("R1").is_none());
    }

    #[test]
    fn test_patches_on_unknown_rows_report_none() {
        let mut projection = LocalProjection::new();
        assert_eq!(projection.set_flag("nope", Some(ExpeditionFlag::Yes)), None);
        assert_eq!(projection.set_follow_up("nope", true), None);
    }
}
