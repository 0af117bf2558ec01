//! Domain types shared by the queue, the sync engine and the aggregation engine.
//!
//! Remote rows (`tbl_resi`, `tbl_expedisi`) are deserialized leniently: the
//! hosted backend stores some enum-like columns as free text and mixes
//! timestamps with and without offsets.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Classification written on cancelled receipts.
pub const COURIER_CANCELLED: &str = "BATAL";
/// Classification for "ID" expedition scans that matched no expected shipment.
pub const COURIER_ID_RECOMMENDATION: &str = "ID_REKOMENDASI";
/// Parent courier bucket of [`COURIER_ID_RECOMMENDATION`].
pub const COURIER_ID: &str = "ID";
/// Sack number written on cancelled receipts.
pub const CANCELLED_SACK: &str = "0";

/// Trim and case-fold a receipt number or courier name for lookups.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Map sentinel classifications onto the courier bucket they belong to.
pub fn parent_courier(normalized: &str) -> &str {
    if normalized == COURIER_ID_RECOMMENDATION {
        COURIER_ID
    } else {
        normalized
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    pub resi_number: String,
    #[serde(default)]
    pub fallback_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub keterangan: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPayload {
    pub resi_number: String,
    #[serde(default)]
    pub expedisi_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub courier_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleFollowUpPayload {
    pub resi_number: String,
    pub new_follow_up_status: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanPayload {
    pub resi_number: String,
    pub sack_number: String,
    #[serde(default)]
    pub courier_name: Option<String>,
    #[serde(default)]
    pub is_rescan: bool,
}

/// A mutation the UI wants applied to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Operation {
    Cancel(CancelPayload),
    Confirm(ConfirmPayload),
    ToggleFollowUp(ToggleFollowUpPayload),
    Scan(ScanPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Cancel,
    Confirm,
    ToggleFollowUp,
    Scan,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Cancel => "Cancel",
            OperationKind::Confirm => "Confirm",
            OperationKind::ToggleFollowUp => "ToggleFollowUp",
            OperationKind::Scan => "Scan",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Cancel(_) => OperationKind::Cancel,
            Operation::Confirm(_) => OperationKind::Confirm,
            Operation::ToggleFollowUp(_) => OperationKind::ToggleFollowUp,
            Operation::Scan(_) => OperationKind::Scan,
        }
    }

    /// Receipt number the operation targets.
    pub fn resi_number(&self) -> &str {
        match self {
            Operation::Cancel(p) => &p.resi_number,
            Operation::Confirm(p) => &p.resi_number,
            Operation::ToggleFollowUp(p) => &p.resi_number,
            Operation::Scan(p) => &p.resi_number,
        }
    }
}

/// Durable record of an operation not yet confirmed applied remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: String,
    pub operation: Operation,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Remote rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Schedule {
    #[serde(rename = "ontime")]
    OnTime,
    #[serde(rename = "late")]
    Late,
    #[serde(rename = "batal")]
    Batal,
}

impl Schedule {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ontime" | "on_time" | "on-time" => Some(Schedule::OnTime),
            "late" => Some(Schedule::Late),
            "batal" => Some(Schedule::Batal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExpeditionFlag {
    #[serde(rename = "YES")]
    Yes,
    #[serde(rename = "NO")]
    No,
    #[serde(rename = "BATAL")]
    Batal,
}

impl ExpeditionFlag {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "YES" => Some(ExpeditionFlag::Yes),
            "NO" => Some(ExpeditionFlag::No),
            "BATAL" => Some(ExpeditionFlag::Batal),
            _ => None,
        }
    }
}

/// One physical scan event (`tbl_resi`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    #[serde(rename = "resi")]
    pub resi: String,
    #[serde(rename = "nokarung", default)]
    pub sack_number: Option<String>,
    #[serde(rename = "created", deserialize_with = "deserialize_timestamp")]
    pub created: DateTime<Utc>,
    #[serde(rename = "Keterangan", default)]
    pub keterangan: Option<String>,
    #[serde(
        rename = "schedule",
        default,
        deserialize_with = "deserialize_schedule"
    )]
    pub schedule: Option<Schedule>,
}

/// Partial update of a receipt row. Unset fields are left untouched remotely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReceiptPatch {
    #[serde(rename = "nokarung", skip_serializing_if = "Option::is_none")]
    pub sack_number: Option<String>,
    #[serde(rename = "created", skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(rename = "Keterangan", skip_serializing_if = "Option::is_none")]
    pub keterangan: Option<String>,
    #[serde(rename = "schedule", skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
}

impl ReceiptPatch {
    pub fn apply_to(&self, record: &mut ReceiptRecord) {
        if let Some(sack) = &self.sack_number {
            record.sack_number = Some(sack.clone());
        }
        if let Some(created) = self.created {
            record.created = created;
        }
        if let Some(keterangan) = &self.keterangan {
            record.keterangan = Some(keterangan.clone());
        }
        if let Some(schedule) = self.schedule {
            record.schedule = Some(schedule);
        }
    }
}

/// An expected shipment (`tbl_expedisi`), populated upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpeditionRecord {
    #[serde(rename = "resino")]
    pub resi: String,
    #[serde(rename = "expedisi", default)]
    pub courier: Option<String>,
    #[serde(rename = "orderid", default)]
    pub order_number: Option<String>,
    #[serde(rename = "chanelsales", default)]
    pub sales_channel: Option<String>,
    #[serde(
        rename = "datetrans",
        default,
        deserialize_with = "deserialize_opt_timestamp"
    )]
    pub purchased_at: Option<DateTime<Utc>>,
    #[serde(rename = "flag", default, deserialize_with = "deserialize_flag")]
    pub flag: Option<ExpeditionFlag>,
    #[serde(rename = "cekfu", default)]
    pub follow_up_checked: bool,
    #[serde(
        rename = "created",
        default,
        deserialize_with = "deserialize_opt_timestamp"
    )]
    pub created: Option<DateTime<Utc>>,
}

impl ExpeditionRecord {
    /// Business date the record belongs to, used for cache invalidation.
    pub fn effective_date(&self) -> Option<NaiveDate> {
        self.created.or(self.purchased_at).map(|ts| ts.date_naive())
    }
}

// ---------------------------------------------------------------------------
// Lenient deserializers
// ---------------------------------------------------------------------------

/// Parse RFC 3339 or offset-less Postgres timestamps (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

fn deserialize_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

fn deserialize_schedule<'de, D>(deserializer: D) -> Result<Option<Schedule>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(Schedule::parse))
}

fn deserialize_flag<'de, D>(deserializer: D) -> Result<Option<ExpeditionFlag>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(ExpeditionFlag::parse))
}
