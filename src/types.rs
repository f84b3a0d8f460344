//! Core types for the Ringkit sync stack
//!
//! This module defines the data structures that flow through a sync: device
//! identity, the raw vendor payload, the canonical normalized record, and the
//! scheduler status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::mapping::FieldMapping;

/// Ring vendor identifier for provenance tracking.
///
/// Each vendor ships its own SDK with its own payload shapes; the field
/// mapping tables in `mapping` are keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Yc,
    Qc,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Yc => "yc",
            Vendor::Qc => "qc",
        }
    }
}

/// Host platform; vendors report different field names per platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }
}

/// Identity of one physical ring.
///
/// Created on discovery or connect, persisted until explicit disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable hardware key (MAC on Android, CoreBluetooth UUID on iOS)
    pub uuid: String,
    /// Vendor SDK family this ring speaks
    pub vendor: Vendor,
    /// Advertised display name
    pub display_name: String,
    /// Backend-assigned identifier, if the device has been registered
    pub server_id: Option<String>,
}

impl DeviceIdentity {
    pub fn new(uuid: impl Into<String>, vendor: Vendor, display_name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            vendor,
            display_name: display_name.into(),
            server_id: None,
        }
    }

    /// Reject empty and placeholder identifiers.
    ///
    /// Native layers have been seen handing back "unknown" or an all-zero
    /// address when a peripheral vanished mid-call.
    pub fn validate(&self) -> Result<(), SyncError> {
        let trimmed = self.uuid.trim();
        if trimmed.is_empty() {
            return Err(SyncError::InvalidDevice("uuid is empty".into()));
        }
        if trimmed.eq_ignore_ascii_case("unknown") {
            return Err(SyncError::InvalidDevice("uuid is a placeholder".into()));
        }
        let zeroed = trimmed
            .chars()
            .all(|c| c == '0' || c == ':' || c == '-');
        if zeroed {
            return Err(SyncError::InvalidDevice(format!("uuid is zeroed: {trimmed}")));
        }
        Ok(())
    }
}

/// One row of a discovery sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Vendor-reported identifier, not yet canonicalized
    pub id: String,
    pub name: String,
    pub rssi: i32,
    /// Vendor inferred from the advertisement, when known
    pub vendor: Option<Vendor>,
}

/// Raw vendor-native health response.
///
/// The payload keeps the vendor's own JSON shape; all knowledge about where
/// each metric lives is held by the `FieldMapping` tables. A payload may be
/// partially populated; absence of every mapped array classifies it as empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawHealthPayload {
    raw: Value,
}

impl RawHealthPayload {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn from_str(raw_json: &str) -> Result<Self, SyncError> {
        Ok(Self {
            raw: serde_json::from_str(raw_json)?,
        })
    }

    pub fn as_value(&self) -> &Value {
        &self.raw
    }

    /// The metric array at `path`, or an empty slice when absent or not an array
    pub fn metric_array(&self, path: &str) -> &[Value] {
        self.raw
            .get(path)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The optional summary scalar block, first present key wins
    pub fn summary(&self) -> Option<&serde_json::Map<String, Value>> {
        const SUMMARY_KEYS: [&str; 3] = ["summary", "daily", "today"];
        SUMMARY_KEYS
            .iter()
            .find_map(|key| self.raw.get(*key).and_then(Value::as_object))
    }

    /// Whether every mapped metric array is absent or empty
    pub fn is_empty(&self, mapping: &FieldMapping) -> bool {
        mapping
            .all_data_paths()
            .iter()
            .all(|path| self.metric_array(path).is_empty())
    }

    /// Meaningfulness check used by the retrieval protocol: at least one
    /// mapped metric array is non-empty, or the summary block carries at
    /// least one positive scalar.
    pub fn has_meaningful_data(&self, mapping: &FieldMapping) -> bool {
        if !self.is_empty(mapping) {
            return true;
        }
        self.summary()
            .map(|block| {
                block
                    .values()
                    .filter_map(Value::as_f64)
                    .any(|v| v > 0.0)
            })
            .unwrap_or(false)
    }
}

/// A single normalized metric reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// Most recent plausible reading within the current day
    pub current: f64,
    /// Reading timestamp, epoch milliseconds
    pub timestamp_ms: i64,
    /// Display unit, e.g. "bpm"
    pub unit: String,
}

impl MetricValue {
    pub fn new(current: f64, timestamp_ms: i64, unit: &str) -> Self {
        Self {
            current,
            timestamp_ms,
            unit: unit.to_string(),
        }
    }
}

/// Normalized blood pressure reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloodPressureValue {
    /// Systolic pressure (mmHg)
    pub systolic: f64,
    /// Diastolic pressure (mmHg)
    pub diastolic: f64,
    /// Reading timestamp, epoch milliseconds
    pub timestamp_ms: i64,
}

/// Aggregated sleep for the current day.
///
/// Components are minutes; `total_minutes` is their sum and never exceeds
/// 1440 (components are scaled down proportionally when a vendor reports
/// more sleep than the day holds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepSummary {
    pub deep_minutes: f64,
    pub light_minutes: f64,
    pub rem_minutes: f64,
    pub total_minutes: f64,
}

/// Canonical health record produced once per sync.
///
/// Every metric slot is always present, possibly `None`; downstream consumers
/// never need to null-check the record shape itself. Immutable after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedHealthData {
    /// Step total for the current day
    pub steps: Option<MetricValue>,
    /// Calories burned (kcal); forced to 0 whenever steps are 0
    pub calories: Option<f64>,
    /// Distance covered (meters); estimated from steps when absent
    pub distance: Option<f64>,
    /// Latest plausible heart rate (bpm)
    pub heart_rate: Option<MetricValue>,
    /// Latest plausible blood oxygen saturation (percent)
    pub spo2: Option<MetricValue>,
    /// Latest plausible skin temperature (celsius)
    pub temperature: Option<MetricValue>,
    /// Latest plausible blood pressure
    pub blood_pressure: Option<BloodPressureValue>,
    /// Sleep aggregate for the current day
    pub sleep: Option<SleepSummary>,
    /// Battery level (percent)
    pub battery: Option<i64>,
    /// When this record was produced
    pub last_sync: DateTime<Utc>,
    /// Vendor the record came from; `None` for OS-sourced records
    pub device_type: Option<Vendor>,
    /// Host platform the record was produced on
    pub platform: Platform,
}

impl NormalizedHealthData {
    /// A fully-shaped record with every metric slot empty
    pub fn empty(device_type: Option<Vendor>, platform: Platform, last_sync: DateTime<Utc>) -> Self {
        Self {
            steps: None,
            calories: None,
            distance: None,
            heart_rate: None,
            spo2: None,
            temperature: None,
            blood_pressure: None,
            sleep: None,
            battery: None,
            last_sync,
            device_type,
            platform,
        }
    }
}

/// Which lane produced the last successful sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
    Device,
    Os,
}

/// Orchestrator status snapshot exposed to the embedding app
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub is_running: bool,
    pub is_paused: bool,
    pub is_initializing: bool,
    pub device_sync_active: bool,
    pub os_sync_active: bool,
    pub consecutive_errors: u32,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_source: Option<SyncSource>,
    pub exclusion_active: bool,
    /// Remaining cooldown, milliseconds, when the scheduler is backing off
    pub cooldown_remaining_ms: Option<u64>,
}
