//! Remote data gateway.
//!
//! The hosted backend exposes `tbl_resi` and `tbl_expedisi` through a
//! PostgREST endpoint. [`RemoteGateway`] is the contract the sync engine,
//! the aggregation loader and the direct UI actions depend on;
//! [`SupabaseGateway`] is the HTTP implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{ExpeditionFlag, ExpeditionRecord, ReceiptPatch, ReceiptRecord};
use crate::storage;

/// Rows per page for date-range listings.
pub const PAGE_SIZE: usize = 1000;

pub const RECEIPT_TABLE: &str = "tbl_resi";
pub const EXPEDITION_TABLE: &str = "tbl_expedisi";
/// Unique key of `tbl_resi`, used as the upsert conflict target.
pub const RECEIPT_CONFLICT_KEY: &str = "resi";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("backend not configured: {0}")]
    NotConfigured(String),
    #[error("cannot reach backend: {0}")]
    Network(String),
    #[error("backend request timed out: {0}")]
    Timeout(String),
    #[error("duplicate key: {0}")]
    Conflict(String),
    #[error("backend error (HTTP {status}): {body}")]
    Status { status: u16, body: String },
    #[error("invalid response from backend: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Network(_) | GatewayError::Timeout(_) => true,
            GatewayError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Logical operations the core needs from the hosted backend.
///
/// Mutations that target a single row report whether a row matched.
pub trait RemoteGateway: Send + Sync {
    fn insert_receipt(
        &self,
        record: &ReceiptRecord,
    ) -> impl Future<Output = GatewayResult<()>> + Send;

    fn upsert_receipt(
        &self,
        record: &ReceiptRecord,
        conflict_key: &str,
    ) -> impl Future<Output = GatewayResult<()>> + Send;

    fn update_receipt(
        &self,
        resi: &str,
        patch: &ReceiptPatch,
    ) -> impl Future<Output = GatewayResult<bool>> + Send;

    fn delete_receipt(&self, resi: &str) -> impl Future<Output = GatewayResult<bool>> + Send;

    fn update_expedition_flag(
        &self,
        resi: &str,
        flag: ExpeditionFlag,
    ) -> impl Future<Output = GatewayResult<bool>> + Send;

    fn update_expedition_follow_up(
        &self,
        resi: &str,
        checked: bool,
    ) -> impl Future<Output = GatewayResult<bool>> + Send;

    fn find_expedition(
        &self,
        resi: &str,
    ) -> impl Future<Output = GatewayResult<Option<ExpeditionRecord>>> + Send;

    /// One page of receipts created in `[start, end)`, ordered by creation time.
    fn list_receipts_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = GatewayResult<Vec<ReceiptRecord>>> + Send;

    /// One page of expedition rows created in `[start, end)`.
    fn list_expeditions_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> impl Future<Output = GatewayResult<Vec<ExpeditionRecord>>> + Send;
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Drain an offset-paginated listing until a short page comes back.
pub async fn fetch_all_pages<T, F, Fut>(page_size: usize, mut fetch: F) -> GatewayResult<Vec<T>>
where
    F: FnMut(usize, usize) -> Fut,
    Fut: Future<Output = GatewayResult<Vec<T>>>,
{
    let page_size = page_size.max(1);
    let mut rows = Vec::new();
    let mut offset = 0;
    loop {
        let page = fetch(offset, page_size).await?;
        let fetched = page.len();
        rows.extend(page);
        if fetched < page_size {
            break;
        }
        offset += fetched;
    }
    Ok(rows)
}

pub async fn list_receipts_by_date_range<G: RemoteGateway>(
    gateway: &G,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> GatewayResult<Vec<ReceiptRecord>> {
    fetch_all_pages(PAGE_SIZE, |offset, limit| {
        gateway.list_receipts_page(start, end, offset, limit)
    })
    .await
}

pub async fn list_expeditions_by_date_range<G: RemoteGateway>(
    gateway: &G,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> GatewayResult<Vec<ExpeditionRecord>> {
    fetch_all_pages(PAGE_SIZE, |offset, limit| {
        gateway.list_expeditions_page(start, end, offset, limit)
    })
    .await
}

// ---------------------------------------------------------------------------
// PostgREST implementation
// ---------------------------------------------------------------------------

/// Default timeout for backend requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

pub struct SupabaseGateway {
    client: Client,
    base_url: String,
    anon_key: String,
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Convert a `reqwest::Error` into a gateway error.
fn transport_error(base: &str, err: &reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        return GatewayError::Timeout(format!("Connection to {base} timed out"));
    }
    if err.is_connect() {
        return GatewayError::Network(format!("Cannot reach backend at {base}"));
    }
    if err.is_builder() {
        return GatewayError::NotConfigured(format!("Invalid backend URL: {base}"));
    }
    GatewayError::Network(format!("Network error communicating with {base}: {err}"))
}

fn status_error(status: StatusCode, body: String) -> GatewayError {
    // 23505 is the Postgres unique_violation code surfaced by PostgREST.
    if status == StatusCode::CONFLICT || body.contains("23505") {
        return GatewayError::Conflict(body);
    }
    GatewayError::Status {
        status: status.as_u16(),
        body,
    }
}

fn rows_affected(value: &Value) -> bool {
    value.as_array().map(|rows| !rows.is_empty()).unwrap_or(false)
}

impl SupabaseGateway {
    pub fn new(base_url: &str, anon_key: &str, timeout: Option<Duration>) -> GatewayResult<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(GatewayError::NotConfigured("missing backend URL".into()));
        }
        if anon_key.trim().is_empty() {
            return Err(GatewayError::NotConfigured("missing backend anon key".into()));
        }
        let client = Client::builder()
            .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(|e| GatewayError::NotConfigured(format!("HTTP client error: {e}")))?;
        Ok(Self {
            client,
            base_url,
            anon_key: anon_key.trim().to_string(),
        })
    }

    /// Build a gateway from the stored backend credentials.
    pub fn from_credentials(timeout: Option<Duration>) -> GatewayResult<Self> {
        let url = storage::backend_url()
            .ok_or_else(|| GatewayError::NotConfigured("missing backend URL".into()))?;
        let key = storage::backend_anon_key()
            .ok_or_else(|| GatewayError::NotConfigured("missing backend anon key".into()))?;
        Self::new(&url, &key, timeout)
    }

    fn table_url(&self, table: &str, query: &[(&str, String)]) -> GatewayResult<Url> {
        let mut url = Url::parse(&format!("{}/rest/v1/{table}", self.base_url))
            .map_err(|e| GatewayError::NotConfigured(format!("Invalid backend URL: {e}")))?;
        if !query.is_empty() {
            let mut qp = url.query_pairs_mut();
            for (k, v) in query {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn request(
        &self,
        method: Method,
        table: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        prefer: Option<&str>,
    ) -> GatewayResult<Value> {
        let url = self.table_url(table, query)?;
        let mut headers = HeaderMap::new();
        if let Some(prefer) = prefer {
            if let Ok(value) = prefer.parse::<HeaderValue>() {
                headers.insert("Prefer", value);
            }
        }

        let mut req = self
            .client
            .request(method.clone(), url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
            .header("Content-Type", "application/json")
            .headers(headers);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(
                table,
                method = %method,
                status = status.as_u16(),
                "Backend request failed"
            );
            return Err(status_error(status, body_text.trim().to_string()));
        }

        debug!(table, method = %method, status = status.as_u16(), "Backend request ok");
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    fn decode_rows<T: serde::de::DeserializeOwned>(value: Value) -> GatewayResult<Vec<T>> {
        match value {
            Value::Null => Ok(Vec::new()),
            other => serde_json::from_value(other).map_err(|e| GatewayError::Decode(e.to_string())),
        }
    }

    fn range_query(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
        order: &str,
    ) -> Vec<(&'static str, String)> {
        vec![
            ("select", "*".to_string()),
            ("created", format!("gte.{}", format_ts(start))),
            ("created", format!("lt.{}", format_ts(end))),
            ("order", order.to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ]
    }
}

impl RemoteGateway for SupabaseGateway {
    async fn insert_receipt(&self, record: &ReceiptRecord) -> GatewayResult<()> {
        let body = serde_json::to_value(record).map_err(|e| GatewayError::Decode(e.to_string()))?;
        self.request(Method::POST, RECEIPT_TABLE, &[], Some(body), Some("return=minimal"))
            .await?;
        Ok(())
    }

    async fn upsert_receipt(&self, record: &ReceiptRecord, conflict_key: &str) -> GatewayResult<()> {
        let body = serde_json::to_value(record).map_err(|e| GatewayError::Decode(e.to_string()))?;
        self.request(
            Method::POST,
            RECEIPT_TABLE,
            &[("on_conflict", conflict_key.to_string())],
            Some(body),
            Some("resolution=merge-duplicates,return=minimal"),
        )
        .await?;
        Ok(())
    }

    async fn update_receipt(&self, resi: &str, patch: &ReceiptPatch) -> GatewayResult<bool> {
        let body = serde_json::to_value(patch).map_err(|e| GatewayError::Decode(e.to_string()))?;
        let rows = self
            .request(
                Method::PATCH,
                RECEIPT_TABLE,
                &[("resi", format!("eq.{resi}"))],
                Some(body),
                Some("return=representation"),
            )
            .await?;
        Ok(rows_affected(&rows))
    }

    async fn delete_receipt(&self, resi: &str) -> GatewayResult<bool> {
        let rows = self
            .request(
                Method::DELETE,
                RECEIPT_TABLE,
                &[("resi", format!("eq.{resi}"))],
                None,
                Some("return=representation"),
            )
            .await?;
        Ok(rows_affected(&rows))
    }

    async fn update_expedition_flag(&self, resi: &str, flag: ExpeditionFlag) -> GatewayResult<bool> {
        let rows = self
            .request(
                Method::PATCH,
                EXPEDITION_TABLE,
                &[("resino", format!("eq.{resi}"))],
                Some(serde_json::json!({ "flag": flag })),
                Some("return=representation"),
            )
            .await?;
        Ok(rows_affected(&rows))
    }

    async fn update_expedition_follow_up(&self, resi: &str, checked: bool) -> GatewayResult<bool> {
        let rows = self
            .request(
                Method::PATCH,
                EXPEDITION_TABLE,
                &[("resino", format!("eq.{resi}"))],
                Some(serde_json::json!({ "cekfu": checked })),
                Some("return=representation"),
            )
            .await?;
        Ok(rows_affected(&rows))
    }

    async fn find_expedition(&self, resi: &str) -> GatewayResult<Option<ExpeditionRecord>> {
        let rows = self
            .request(
                Method::GET,
                EXPEDITION_TABLE,
                &[
                    ("select", "*".to_string()),
                    ("resino", format!("eq.{resi}")),
                    ("limit", "1".to_string()),
                ],
                None,
                None,
            )
            .await?;
        Ok(Self::decode_rows::<ExpeditionRecord>(rows)?.into_iter().next())
    }

    async fn list_receipts_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> GatewayResult<Vec<ReceiptRecord>> {
        let query = Self::range_query(start, end, offset, limit, "created.asc,resi.asc");
        let rows = self
            .request(Method::GET, RECEIPT_TABLE, &query, None, None)
            .await?;
        Self::decode_rows(rows)
    }

    async fn list_expeditions_page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> GatewayResult<Vec<ExpeditionRecord>> {
        let query = Self::range_query(start, end, offset, limit, "created.asc,resino.asc");
        let rows = self
            .request(Method::GET, EXPEDITION_TABLE, &query, None, None)
            .await?;
        Self::decode_rows(rows)
    }
}

// ---------------------------------------------------------------------------
// In-memory double
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod testing {
    //! Scriptable in-memory backend with per-resi failure injection.

    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryState {
        receipts: BTreeMap<String, ReceiptRecord>,
        expeditions: BTreeMap<String, ExpeditionRecord>,
        /// Remaining forced failures per resi; `u32::MAX` fails forever.
        failures: HashMap<String, u32>,
        offline: bool,
        calls: Vec<String>,
    }

    #[derive(Default)]
    pub struct MemoryGateway {
        state: Mutex<MemoryState>,
    }

    impl MemoryGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed_expedition(&self, record: ExpeditionRecord) {
            let mut state = self.state.lock().unwrap();
            state.expeditions.insert(record.resi.clone(), record);
        }

        pub fn seed_receipt(&self, record: ReceiptRecord) {
            let mut state = self.state.lock().unwrap();
            state.receipts.insert(record.resi.clone(), record);
        }

        /// Fail the next `times` calls that touch `resi`.
        pub fn fail_next(&self, resi: &str, times: u32) {
            self.state
                .lock()
                .unwrap()
                .failures
                .insert(resi.to_string(), times);
        }

        pub fn fail_always(&self, resi: &str) {
            self.fail_next(resi, u32::MAX);
        }

        pub fn set_offline(&self, offline: bool) {
            self.state.lock().unwrap().offline = offline;
        }

        pub fn receipt(&self, resi: &str) -> Option<ReceiptRecord> {
            self.state.lock().unwrap().receipts.get(resi).cloned()
        }

        pub fn receipt_count(&self) -> usize {
            self.state.lock().unwrap().receipts.len()
        }

        pub fn expedition(&self, resi: &str) -> Option<ExpeditionRecord> {
            self.state.lock().unwrap().expeditions.get(resi).cloned()
        }

        pub fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        fn check(state: &mut MemoryState, call: &str, resi: &str) -> GatewayResult<()> {
            state.calls.push(format!("{call}:{resi}"));
            if state.offline {
                return Err(GatewayError::Network("offline".into()));
            }
            if let Some(remaining) = state.failures.get_mut(resi) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(GatewayError::Status {
                        status: 503,
                        body: format!("injected failure for {resi}"),
                    });
                }
            }
            Ok(())
        }
    }

    impl RemoteGateway for MemoryGateway {
        async fn insert_receipt(&self, record: &ReceiptRecord) -> GatewayResult<()> {
            let mut state = self.state.lock().unwrap();
            Self::check(&mut state, "insert_receipt", &record.resi)?;
            if state.receipts.contains_key(&record.resi) {
                return Err(GatewayError::Conflict(format!(
                    "duplicate key value violates unique constraint (23505): {}",
                    record.resi
                )));
            }
            state.receipts.insert(record.resi.clone(), record.clone());
            Ok(())
        }

        async fn upsert_receipt(
            &self,
            record: &ReceiptRecord,
            _conflict_key: &str,
        ) -> GatewayResult<()> {
            let mut state = self.state.lock().unwrap();
            Self::check(&mut state, "upsert_receipt", &record.resi)?;
            state.receipts.insert(record.resi.clone(), record.clone());
            Ok(())
        }

        async fn update_receipt(&self, resi: &str, patch: &ReceiptPatch) -> GatewayResult<bool> {
            let mut state = self.state.lock().unwrap();
            Self::check(&mut state, "update_receipt", resi)?;
            match state.receipts.get_mut(resi) {
                Some(record) => {
                    patch.apply_to(record);
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn delete_receipt(&self, resi: &str) -> GatewayResult<bool> {
            let mut state = self.state.lock().unwrap();
            Self::check(&mut state, "delete_receipt", resi)?;
            Ok(state.receipts.remove(resi).is_some())
        }

        async fn update_expedition_flag(
            &self,
            resi: &str,
            flag: ExpeditionFlag,
        ) -> GatewayResult<bool> {
            let mut state = self.state.lock().unwrap();
            Self::check(&mut state, "update_expedition_flag", resi)?;
            match state.expeditions.get_mut(resi) {
                Some(record) => {
                    record.flag = Some(flag);
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn update_expedition_follow_up(
            &self,
            resi: &str,
            checked: bool,
        ) -> GatewayResult<bool> {
            let mut state = self.state.lock().unwrap();
            Self::check(&mut state, "update_expedition_follow_up", resi)?;
            match state.expeditions.get_mut(resi) {
                Some(record) => {
                    record.follow_up_checked = checked;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn find_expedition(&self, resi: &str) -> GatewayResult<Option<ExpeditionRecord>> {
            let mut state = self.state.lock().unwrap();
            Self::check(&mut state, "find_expedition", resi)?;
            Ok(state.expeditions.get(resi).cloned())
        }

        async fn list_receipts_page(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            offset: usize,
            limit: usize,
        ) -> GatewayResult<Vec<ReceiptRecord>> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("list_receipts_page:{offset}"));
            if state.offline {
                return Err(GatewayError::Network("offline".into()));
            }
            let mut rows: Vec<ReceiptRecord> = state
                .receipts
                .values()
                .filter(|r| r.created >= start && r.created < end)
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.resi.cmp(&b.resi)));
            Ok(rows.into_iter().skip(offset).take(limit).collect())
        }

        async fn list_expeditions_page(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            offset: usize,
            limit: usize,
        ) -> GatewayResult<Vec<ExpeditionRecord>> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("list_expeditions_page:{offset}"));
            if state.offline {
                return Err(GatewayError::Network("offline".into()));
            }
            let mut rows: Vec<ExpeditionRecord> = state
                .expeditions
                .values()
                .filter(|r| r.created.map(|c| c >= start && c < end).unwrap_or(false))
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.resi.cmp(&b.resi)));
            Ok(rows.into_iter().skip(offset).take(limit).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryGateway;
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn receipt(resi: &str, minute: u32) -> ReceiptRecord {
        ReceiptRecord {
            resi: resi.to_string(),
            sack_number: Some("1".into()),
            created: Utc
                .with_ymd_and_hms(2024, 1, 5, 8, 0, 0)
                .unwrap()
                + chrono::Duration::seconds(minute as i64),
            keterangan: Some("JNE".into()),
            schedule: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_all_pages_merges_full_page_and_short_page() {
        let requested = std::sync::Mutex::new(Vec::new());
        let rows = fetch_all_pages(PAGE_SIZE, |offset, limit| {
            requested.lock().unwrap().push(offset);
            async move {
                let total = 1001usize;
                let end = (offset + limit).min(total);
                Ok::<_, GatewayError>((offset..end).collect::<Vec<usize>>())
            }
        })
        .await
        .unwrap();

        assert_eq!(rows.len(), 1001);
        let unique: HashSet<usize> = rows.iter().copied().collect();
        assert_eq!(unique.len(), 1001, "no duplicates");
        assert_eq!(rows, (0..1001).collect::<Vec<_>>(), "no gaps");
        assert_eq!(*requested.lock().unwrap(), vec![0, 1000]);
    }

    #[tokio::test]
    async fn test_fetch_all_pages_stops_on_empty_first_page() {
        let rows = fetch_all_pages(PAGE_SIZE, |_, _| async {
            Ok::<Vec<u8>, GatewayError>(Vec::new())
        })
        .await
        .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_all_pages_propagates_errors() {
        let result = fetch_all_pages(2, |offset, _| async move {
            if offset == 0 {
                Ok(vec![1, 2])
            } else {
                Err(GatewayError::Network("down".into()))
            }
        })
        .await;
        assert_eq!(result, Err(GatewayError::Network("down".into())));
    }

    #[tokio::test]
    async fn test_list_receipts_by_date_range_reads_past_page_boundary() {
        let gateway = MemoryGateway::new();
        for i in 0..1001u32 {
            gateway.seed_receipt(receipt(&format!("R{i:05}"), i));
        }
        let start = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap();

        let rows = list_receipts_by_date_range(&gateway, start, end).await.unwrap();
        assert_eq!(rows.len(), 1001);
        let unique: HashSet<&str> = rows.iter().map(|r| r.resi.as_str()).collect();
        assert_eq!(unique.len(), 1001);
        assert_eq!(
            gateway.calls(),
            vec!["list_receipts_page:0".to_string(), "list_receipts_page:1000".to_string()]
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(GatewayError::Network("x".into()).is_transient());
        assert!(GatewayError::Timeout("x".into()).is_transient());
        assert!(GatewayError::Status { status: 503, body: String::new() }.is_transient());
        assert!(GatewayError::Status { status: 429, body: String::new() }.is_transient());
        assert!(!GatewayError::Status { status: 400, body: String::new() }.is_transient());
        assert!(!GatewayError::Conflict("dup".into()).is_transient());
    }

    #[test]
    fn test_status_error_detects_unique_violation() {
        let err = status_error(
            StatusCode::BAD_REQUEST,
            r#"{"code":"23505","message":"duplicate key"}"#.into(),
        );
        assert!(matches!(err, GatewayError::Conflict(_)));
        let err = status_error(StatusCode::BAD_GATEWAY, "upstream".into());
        assert_eq!(
            err,
            GatewayError::Status {
                status: 502,
                body: "upstream".into()
            }
        );
    }

    #[test]
    fn test_supabase_gateway_requires_credentials() {
        assert!(matches!(
            SupabaseGateway::new("", "key", None),
            Err(GatewayError::NotConfigured(_))
        ));
        assert!(matches!(
            SupabaseGateway::new("https://example.supabase.co", " ", None),
            Err(GatewayError::NotConfigured(_))
        ));
        let gw = SupabaseGateway::new("https://example.supabase.co/", "anon", None).unwrap();
        let url = gw
            .table_url(RECEIPT_TABLE, &[("resi", "eq.JX 1".to_string())])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.supabase.co/rest/v1/tbl_resi?resi=eq.JX+1"
        );
    }
}
