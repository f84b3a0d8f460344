//! Health payload normalization
//!
//! This module converts a raw vendor payload into the canonical
//! `NormalizedHealthData` record using the vendor's field mapping:
//! - Best-value-in-range selection for scalar metrics (latest plausible
//!   reading within the current day)
//! - Step/calorie/distance aggregation with the zero-steps calorie guard
//! - Sleep aggregation with proportional scaling to the 1440-minute day
//!
//! Normalization never fails: a metric that cannot be read degrades to
//! `None` and the record keeps its full shape.

use chrono::{DateTime, Local, Utc};
use serde_json::Value;

use crate::mapping::{mapping_for, CombinedMapping, FieldMapping};
use crate::types::{
    BloodPressureValue, MetricValue, NormalizedHealthData, Platform, RawHealthPayload,
    SleepSummary, Vendor,
};

/// Raw timestamps below this magnitude are second-scale and are multiplied
/// by 1000. Millisecond epoch values for any modern date are well above it.
const SECOND_SCALE_THRESHOLD: i64 = 100_000_000_000;

/// Minutes in one calendar day; sleep totals are clamped to this
const MINUTES_PER_DAY: f64 = 1440.0;

/// Average stride in meters for the steps-derived distance estimate
const STRIDE_METERS: f64 = 0.7;

/// Half-open `[start, end)` millisecond window for one local calendar day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl DayWindow {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }

    /// The current local calendar day
    pub fn today_local() -> Self {
        let today = Local::now().date_naive();
        let start_ms = today
            .and_hms_opt(0, 0, 0)
            .and_then(|dt| dt.and_local_timezone(Local).earliest())
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0);
        Self {
            start_ms,
            end_ms: start_ms + 86_400_000,
        }
    }

    pub fn contains(&self, ts_ms: i64) -> bool {
        ts_ms >= self.start_ms && ts_ms < self.end_ms
    }
}

/// Normalizer for converting raw vendor payloads to canonical records
pub struct Normalizer;

impl Normalizer {
    /// Normalize a payload against the current local day.
    pub fn normalize(
        payload: &RawHealthPayload,
        vendor: Vendor,
        platform: Platform,
    ) -> NormalizedHealthData {
        Self::normalize_for_window(payload, vendor, platform, DayWindow::today_local(), Utc::now())
    }

    /// Normalize a payload against an explicit day window.
    ///
    /// Pure function of payload, mapping, and window: the same inputs always
    /// produce the same record.
    pub fn normalize_for_window(
        payload: &RawHealthPayload,
        vendor: Vendor,
        platform: Platform,
        window: DayWindow,
        synced_at: DateTime<Utc>,
    ) -> NormalizedHealthData {
        let mapping = mapping_for(vendor, platform);
        let mut record = NormalizedHealthData::empty(Some(vendor), platform, synced_at);

        let (steps, calories, distance) = extract_steps(payload, &mapping, window, synced_at);
        record.steps = steps;
        record.calories = calories;
        record.distance = distance;

        record.heart_rate = extract_scalar_metric(
            payload,
            &mapping,
            MetricKind::HeartRate,
            window,
        );
        record.spo2 = extract_scalar_metric(payload, &mapping, MetricKind::Spo2, window);
        record.temperature =
            extract_scalar_metric(payload, &mapping, MetricKind::Temperature, window);
        record.blood_pressure = extract_blood_pressure(payload, &mapping, window);
        record.sleep = extract_sleep(payload, &mapping, window);
        record.battery = extract_battery(payload, &mapping, window);

        record
    }
}

/// Scalar metrics that share the best-value-in-range selection rule
#[derive(Debug, Clone, Copy)]
enum MetricKind {
    HeartRate,
    Spo2,
    Temperature,
}

impl MetricKind {
    fn unit(&self) -> &'static str {
        match self {
            MetricKind::HeartRate => "bpm",
            MetricKind::Spo2 => "%",
            MetricKind::Temperature => "°C",
        }
    }

    fn plausible(&self, value: f64) -> bool {
        match self {
            MetricKind::HeartRate => value > 0.0 && value < 200.0,
            MetricKind::Spo2 => value > 0.0 && value <= 100.0,
            MetricKind::Temperature => value > 30.0 && value < 45.0,
        }
    }

    fn combined_tags<'a>(&self, combined: &'a CombinedMapping) -> &'a [&'a str] {
        match self {
            MetricKind::HeartRate => combined.heart_rate_tags,
            MetricKind::Spo2 => combined.spo2_tags,
            MetricKind::Temperature => combined.temperature_tags,
        }
    }
}

/// First present, non-null numeric field. Numeric strings are accepted
/// because some SDK bridges stringify every value.
fn field_number(record: &Value, fields: &[&str]) -> Option<f64> {
    for field in fields {
        match record.get(*field) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(parsed) = s.trim().parse::<f64>() {
                    return Some(parsed);
                }
            }
            _ => continue,
        }
    }
    None
}

/// First present timestamp field, normalized to millisecond scale.
/// Accepts epoch numbers (seconds or millis) and RFC 3339 strings.
fn field_timestamp(record: &Value, fields: &[&str]) -> Option<i64> {
    for field in fields {
        match record.get(*field) {
            Some(Value::Number(n)) => {
                if let Some(ts) = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)) {
                    return Some(normalize_timestamp(ts));
                }
            }
            Some(Value::String(s)) => {
                if let Ok(parsed) = s.trim().parse::<i64>() {
                    return Some(normalize_timestamp(parsed));
                }
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    return Some(dt.timestamp_millis());
                }
            }
            _ => continue,
        }
    }
    None
}

fn normalize_timestamp(ts: i64) -> i64 {
    if ts != 0 && ts.abs() < SECOND_SCALE_THRESHOLD {
        ts * 1000
    } else {
        ts
    }
}

/// Whether a combined-stream record carries one of the wanted type tags
fn has_tag(record: &Value, type_fields: &[&str], tags: &[&str]) -> bool {
    for field in type_fields {
        if let Some(tag) = record.get(*field).and_then(Value::as_str) {
            return tags.iter().any(|t| t.eq_ignore_ascii_case(tag));
        }
    }
    false
}

/// Best-value-in-range: the latest in-window record whose value passes the
/// plausibility filter. Ties on timestamp go to the later record.
fn best_in_range<'a>(
    records: impl Iterator<Item = &'a Value>,
    value_fields: &[&str],
    timestamp_fields: &[&str],
    window: DayWindow,
    plausible: impl Fn(f64) -> bool,
) -> Option<(f64, i64)> {
    let mut best: Option<(f64, i64)> = None;
    for record in records {
        let Some(ts) = field_timestamp(record, timestamp_fields) else {
            continue;
        };
        if !window.contains(ts) {
            continue;
        }
        let Some(value) = field_number(record, value_fields) else {
            continue;
        };
        if !plausible(value) {
            continue;
        }
        if best.map(|(_, best_ts)| ts >= best_ts).unwrap_or(true) {
            best = Some((value, ts));
        }
    }
    best
}

/// Scalar metric extraction: combined stream first, dedicated array fallback
fn extract_scalar_metric(
    payload: &RawHealthPayload,
    mapping: &FieldMapping,
    kind: MetricKind,
    window: DayWindow,
) -> Option<MetricValue> {
    let combined = &mapping.combined;
    let tags = kind.combined_tags(combined);
    let from_combined = best_in_range(
        payload
            .metric_array(combined.data_path)
            .iter()
            .filter(|r| has_tag(r, combined.type_fields, tags)),
        combined.value_fields,
        combined.timestamp_fields,
        window,
        |v| kind.plausible(v),
    );

    let dedicated = match kind {
        MetricKind::HeartRate => &mapping.heart_rate,
        MetricKind::Spo2 => &mapping.spo2,
        MetricKind::Temperature => &mapping.temperature,
    };
    let selected = from_combined.or_else(|| {
        best_in_range(
            payload.metric_array(dedicated.data_path).iter(),
            dedicated.value_fields,
            dedicated.timestamp_fields,
            window,
            |v| kind.plausible(v),
        )
    });

    if selected.is_none() && !payload.metric_array(dedicated.data_path).is_empty() {
        log::debug!(
            "no plausible {} reading in the current day, metric degraded to null",
            kind.unit()
        );
    }
    selected.map(|(value, ts)| MetricValue::new(value, ts, kind.unit()))
}

fn extract_blood_pressure(
    payload: &RawHealthPayload,
    mapping: &FieldMapping,
    window: DayWindow,
) -> Option<BloodPressureValue> {
    let plausible_pair = |sys: f64, dia: f64| {
        sys > 50.0 && sys < 300.0 && dia > 30.0 && dia < 200.0
    };

    let mut best: Option<BloodPressureValue> = None;
    let combined = &mapping.combined;

    let combined_iter = payload
        .metric_array(combined.data_path)
        .iter()
        .filter(|r| has_tag(r, combined.type_fields, combined.blood_pressure_tags))
        .map(|r| (r, combined.systolic_fields, combined.diastolic_fields, combined.timestamp_fields));
    let dedicated = &mapping.blood_pressure;
    let dedicated_iter = payload
        .metric_array(dedicated.data_path)
        .iter()
        .map(|r| (r, dedicated.systolic_fields, dedicated.diastolic_fields, dedicated.timestamp_fields));

    // Combined records sort ahead of dedicated ones only through the shared
    // latest-timestamp rule; both sources feed one selection.
    for (record, sys_fields, dia_fields, ts_fields) in combined_iter.chain(dedicated_iter) {
        let Some(ts) = field_timestamp(record, ts_fields) else {
            continue;
        };
        if !window.contains(ts) {
            continue;
        }
        let (Some(sys), Some(dia)) = (
            field_number(record, sys_fields),
            field_number(record, dia_fields),
        ) else {
            continue;
        };
        if !plausible_pair(sys, dia) {
            continue;
        }
        if best
            .as_ref()
            .map(|b| ts >= b.timestamp_ms)
            .unwrap_or(true)
        {
            best = Some(BloodPressureValue {
                systolic: sys,
                diastolic: dia,
                timestamp_ms: ts,
            });
        }
    }
    best
}

/// Step aggregation over the day's sessions, with the calorie guard and the
/// steps-derived distance fallback.
fn extract_steps(
    payload: &RawHealthPayload,
    mapping: &FieldMapping,
    window: DayWindow,
    synced_at: DateTime<Utc>,
) -> (Option<MetricValue>, Option<f64>, Option<f64>) {
    let steps_mapping = &mapping.steps;
    let mut total_steps = 0.0;
    let mut total_calories = 0.0;
    let mut total_distance = 0.0;
    let mut latest_ts: Option<i64> = None;
    let mut sessions_in_day = 0u32;

    for record in payload.metric_array(steps_mapping.data_path) {
        let Some(ts) = field_timestamp(record, steps_mapping.timestamp_fields) else {
            continue;
        };
        if !window.contains(ts) {
            continue;
        }
        sessions_in_day += 1;
        total_steps += field_number(record, steps_mapping.step_fields).unwrap_or(0.0);
        total_calories += field_number(record, steps_mapping.calorie_fields).unwrap_or(0.0);
        total_distance += field_number(record, steps_mapping.distance_fields).unwrap_or(0.0);
        latest_ts = Some(latest_ts.map_or(ts, |t: i64| t.max(ts)));
    }

    // Summary scalar fallback when the device sends day totals only
    if sessions_in_day == 0 {
        if let Some(summary) = payload.summary() {
            let block = Value::Object(summary.clone());
            if let Some(steps) = field_number(&block, &["totalStep", "totalSteps", "step", "steps"])
            {
                sessions_in_day = 1;
                total_steps = steps;
                total_calories =
                    field_number(&block, &["totalCalorie", "calorie", "calories"]).unwrap_or(0.0);
                total_distance =
                    field_number(&block, &["totalDistance", "distance"]).unwrap_or(0.0);
                latest_ts = Some(synced_at.timestamp_millis());
            }
        }
    }

    if sessions_in_day == 0 {
        return (None, None, None);
    }

    let ts = latest_ts.unwrap_or_else(|| synced_at.timestamp_millis());
    let steps = MetricValue::new(total_steps, ts, "steps");

    // Rings occasionally report calories against a zeroed step counter;
    // zero steps always means zero calories.
    let calories = if total_steps == 0.0 {
        Some(0.0)
    } else {
        Some(total_calories)
    };

    let distance = if total_distance > 0.0 {
        Some(total_distance)
    } else if total_steps > 0.0 {
        Some(total_steps * STRIDE_METERS)
    } else {
        Some(0.0)
    };

    (Some(steps), calories, distance)
}

/// Sleep aggregation: stage seconds summed across the day's sessions,
/// converted to minutes, proportionally scaled when the total exceeds a day.
fn extract_sleep(
    payload: &RawHealthPayload,
    mapping: &FieldMapping,
    window: DayWindow,
) -> Option<SleepSummary> {
    let sleep_mapping = &mapping.sleep;
    let mut deep_seconds = 0.0;
    let mut light_seconds = 0.0;
    let mut rem_seconds = 0.0;
    let mut matched = false;

    for record in payload.metric_array(sleep_mapping.data_path) {
        let Some(start) = field_timestamp(record, sleep_mapping.start_fields) else {
            continue;
        };
        if !window.contains(start) {
            continue;
        }
        matched = true;
        deep_seconds += field_number(record, sleep_mapping.deep_fields).unwrap_or(0.0);
        light_seconds += field_number(record, sleep_mapping.light_fields).unwrap_or(0.0);
        rem_seconds += field_number(record, sleep_mapping.rem_fields).unwrap_or(0.0);
    }

    if !matched {
        return None;
    }

    let mut deep = deep_seconds / 60.0;
    let mut light = light_seconds / 60.0;
    let mut rem = rem_seconds / 60.0;
    let total = deep + light + rem;
    if total <= 0.0 {
        return None;
    }

    if total > MINUTES_PER_DAY {
        let scale = MINUTES_PER_DAY / total;
        log::debug!(
            "sleep total {total:.0} min exceeds a day, scaling components by {scale:.4}"
        );
        deep *= scale;
        light *= scale;
        rem *= scale;
    }

    Some(SleepSummary {
        deep_minutes: deep,
        light_minutes: light,
        rem_minutes: rem,
        total_minutes: (deep + light + rem).min(MINUTES_PER_DAY),
    })
}

fn extract_battery(
    payload: &RawHealthPayload,
    mapping: &FieldMapping,
    window: DayWindow,
) -> Option<i64> {
    let battery = &mapping.battery;
    let from_array = best_in_range(
        payload.metric_array(battery.data_path).iter(),
        battery.value_fields,
        battery.timestamp_fields,
        window,
        |v| (0.0..=100.0).contains(&v),
    )
    .map(|(value, _)| value as i64);

    from_array.or_else(|| {
        payload.summary().and_then(|summary| {
            let block = Value::Object(summary.clone());
            field_number(&block, &["battery", "batteryLevel", "batteryValue"])
                .filter(|v| (0.0..=100.0).contains(v))
                .map(|v| v as i64)
        })
    })
}
