//! Change notifications from the remote tables.
//!
//! The transport (push or polling) lives behind [`ChangeFeed`]. This module
//! only debounces bursts of notifications and hands the touched scopes to
//! the [`InvalidationCoordinator`].

use chrono::{NaiveDate, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::InvalidationCoordinator;
use crate::gateway::{EXPEDITION_TABLE, RECEIPT_TABLE};
use crate::models::{normalize_key, ExpeditionRecord, ReceiptRecord};

const FEED_CAPACITY: usize = 256;
/// A batch is flushed at the latest this many quiet periods after its first
/// notification, even while notifications keep arriving.
const MAX_WAIT_FACTOR: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub table: String,
    pub resi: Option<String>,
    /// Business date of the changed row when known; otherwise "today".
    pub date: Option<NaiveDate>,
    pub courier: Option<String>,
}

impl ChangeNotification {
    pub fn for_receipt(record: &ReceiptRecord) -> Self {
        Self {
            table: RECEIPT_TABLE.to_string(),
            resi: Some(record.resi.clone()),
            date: Some(record.created.date_naive()),
            courier: record.keterangan.as_deref().map(normalize_key),
        }
    }

    pub fn for_expedition(record: &ExpeditionRecord) -> Self {
        Self {
            table: EXPEDITION_TABLE.to_string(),
            resi: Some(record.resi.clone()),
            date: record.effective_date(),
            courier: record.courier.as_deref().map(normalize_key),
        }
    }

    /// A change whose row is unknown, e.g. after lagging behind the feed.
    pub fn unscoped(table: &str) -> Self {
        Self {
            table: table.to_string(),
            resi: None,
            date: None,
            courier: None,
        }
    }
}

/// Source of change notifications, one stream per table.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, table: &str) -> broadcast::Receiver<ChangeNotification>;
}

/// In-process feed; whatever transport receives remote changes publishes here.
#[derive(Debug, Default)]
pub struct ChannelChangeFeed {
    channels: Mutex<HashMap<String, broadcast::Sender<ChangeNotification>>>,
}

impl ChannelChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, table: &str) -> broadcast::Sender<ChangeNotification> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    /// Returns the number of subscribers that received the notification.
    pub fn publish(&self, notification: ChangeNotification) -> usize {
        self.sender(&notification.table).send(notification).unwrap_or(0)
    }
}

impl ChangeFeed for ChannelChangeFeed {
    fn subscribe(&self, table: &str) -> broadcast::Receiver<ChangeNotification> {
        self.sender(table).subscribe()
    }
}

/// Invalidate every distinct scope in `batch`. Unscoped changes map to `today`.
pub fn dispatch_batch(
    coordinator: &InvalidationCoordinator,
    batch: &[ChangeNotification],
    today: NaiveDate,
) -> usize {
    let scopes: BTreeSet<(NaiveDate, Option<String>)> = batch
        .iter()
        .map(|n| (n.date.unwrap_or(today), n.courier.clone().filter(|c| !c.is_empty())))
        .collect();
    for (date, courier) in &scopes {
        coordinator.invalidate(*date, courier.as_deref());
    }
    scopes.len()
}

fn forward(
    table: String,
    mut rx: broadcast::Receiver<ChangeNotification>,
    tx: mpsc::UnboundedSender<ChangeNotification>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = rx.recv() => next,
            };
            let notification = match next {
                Ok(n) => n,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(table = %table, skipped, "Change feed lagged");
                    ChangeNotification::unscoped(&table)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if tx.send(notification).is_err() {
                break;
            }
        }
    })
}

/// Subscribe to `tables` and invalidate caches once per quiet period.
///
/// Each notification restarts the `debounce` timer; the batch is dispatched
/// when no new notification arrives within it, or once it has been open for
/// `debounce * MAX_WAIT_FACTOR`. Cancelling `token` flushes the pending
/// batch and stops the listener.
pub fn spawn_invalidation_listener<F: ChangeFeed + ?Sized>(
    feed: &F,
    tables: &[&str],
    coordinator: InvalidationCoordinator,
    debounce: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    for table in tables {
        let _ = forward(
            table.to_string(),
            feed.subscribe(table),
            tx.clone(),
            token.clone(),
        );
    }
    drop(tx);

    tokio::spawn(async move {
        loop {
            let first = tokio::select! {
                _ = token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(n) => n,
                    None => break,
                },
            };
            let mut batch = vec![first];
            let mut stop = false;
            let deadline = tokio::time::Instant::now() + debounce * MAX_WAIT_FACTOR;
            loop {
                tokio::select! {
                    _ = token.cancelled() => { stop = true; break; }
                    _ = tokio::time::sleep(debounce) => break,
                    _ = tokio::time::sleep_until(deadline) => {
                        debug!(notifications = batch.len(), "Change batch reached max wait");
                        break;
                    }
                    next = rx.recv() => match next {
                        Some(n) => batch.push(n),
                        None => { stop = true; break; }
                    },
                }
            }
            let scopes = dispatch_batch(&coordinator, &batch, Utc::now().date_naive());
            debug!(notifications = batch.len(), scopes, "Change batch dispatched");
            if stop {
                break;
            }
        }
        debug!("Change listener stopped");
    })
}

/// Convenience for the two dashboard tables.
pub fn spawn_default_listener(
    feed: Arc<dyn ChangeFeed>,
    coordinator: InvalidationCoordinator,
    debounce: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    spawn_invalidation_listener(
        feed.as_ref(),
        &[RECEIPT_TABLE, EXPEDITION_TABLE],
        coordinator,
        debounce,
        token,
    )
}
