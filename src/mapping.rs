//! Vendor field mapping tables
//!
//! Each ring vendor reports the same metrics under different array names and
//! field names, and the names shift again between Android and iOS builds of
//! the vendor SDKs. This module holds that knowledge as pure data: per
//! vendor, per metric, an array path plus ordered field-name priority lists.
//! Lookup is always "first present, non-null field wins"; there is no
//! per-vendor branching anywhere else in the crate.

use crate::types::{Platform, Vendor};

/// Where and how to read one scalar metric
#[derive(Debug, Clone, Copy)]
pub struct MetricMapping {
    /// Key of the dedicated metric array in the raw payload
    pub data_path: &'static str,
    /// Value field candidates, priority order
    pub value_fields: &'static [&'static str],
    /// Timestamp field candidates, priority order, platform-adjusted
    pub timestamp_fields: &'static [&'static str],
}

/// Step-session mapping; sessions also carry calories and distance
#[derive(Debug, Clone, Copy)]
pub struct StepsMapping {
    pub data_path: &'static str,
    pub step_fields: &'static [&'static str],
    pub calorie_fields: &'static [&'static str],
    pub distance_fields: &'static [&'static str],
    pub timestamp_fields: &'static [&'static str],
}

/// Sleep-session mapping; durations are seconds per stage
#[derive(Debug, Clone, Copy)]
pub struct SleepMapping {
    pub data_path: &'static str,
    pub deep_fields: &'static [&'static str],
    pub light_fields: &'static [&'static str],
    pub rem_fields: &'static [&'static str],
    /// Session start timestamp candidates, platform-adjusted
    pub start_fields: &'static [&'static str],
}

/// Blood pressure mapping; systolic and diastolic live in one record
#[derive(Debug, Clone, Copy)]
pub struct BloodPressureMapping {
    pub data_path: &'static str,
    pub systolic_fields: &'static [&'static str],
    pub diastolic_fields: &'static [&'static str],
    pub timestamp_fields: &'static [&'static str],
}

/// Combined-stream mapping.
///
/// Some firmware revisions deliver one interleaved record stream tagged with
/// a type field instead of dedicated per-metric arrays. Extraction tries this
/// stream first and falls back to the dedicated arrays.
#[derive(Debug, Clone, Copy)]
pub struct CombinedMapping {
    pub data_path: &'static str,
    pub type_fields: &'static [&'static str],
    pub value_fields: &'static [&'static str],
    pub systolic_fields: &'static [&'static str],
    pub diastolic_fields: &'static [&'static str],
    pub timestamp_fields: &'static [&'static str],
    pub heart_rate_tags: &'static [&'static str],
    pub spo2_tags: &'static [&'static str],
    pub temperature_tags: &'static [&'static str],
    pub blood_pressure_tags: &'static [&'static str],
}

/// Complete mapping for one vendor on one platform
#[derive(Debug, Clone, Copy)]
pub struct FieldMapping {
    pub vendor: Vendor,
    pub steps: StepsMapping,
    pub heart_rate: MetricMapping,
    pub spo2: MetricMapping,
    pub temperature: MetricMapping,
    pub battery: MetricMapping,
    pub blood_pressure: BloodPressureMapping,
    pub sleep: SleepMapping,
    pub combined: CombinedMapping,
}

impl FieldMapping {
    /// Every array path this mapping can read, used for the empty-payload check
    pub fn all_data_paths(&self) -> [&'static str; 8] {
        [
            self.steps.data_path,
            self.heart_rate.data_path,
            self.spo2.data_path,
            self.temperature.data_path,
            self.battery.data_path,
            self.blood_pressure.data_path,
            self.sleep.data_path,
            self.combined.data_path,
        ]
    }
}

// Timestamp priority lists. Android SDK builds report epoch fields under
// "startTime"/"time"; the iOS builds of the same SDKs rename them.
const YC_TS_ANDROID: &[&str] = &["startTime", "timestamp", "time"];
const YC_TS_IOS: &[&str] = &["startDate", "startTime", "timeStamp"];
const QC_TS_ANDROID: &[&str] = &["time", "timestamp", "startTime"];
const QC_TS_IOS: &[&str] = &["date", "time", "timeStamp"];

/// The mapping for one vendor, with timestamp priority lists overridden for
/// the host platform. First present field wins throughout.
pub fn mapping_for(vendor: Vendor, platform: Platform) -> FieldMapping {
    match vendor {
        Vendor::Yc => {
            let ts = match platform {
                Platform::Android => YC_TS_ANDROID,
                Platform::Ios => YC_TS_IOS,
            };
            FieldMapping {
                vendor,
                steps: StepsMapping {
                    data_path: "sportList",
                    step_fields: &["sportStep", "step", "steps"],
                    calorie_fields: &["sportCalorie", "calorie", "calories"],
                    distance_fields: &["sportDistance", "distance"],
                    timestamp_fields: ts,
                },
                heart_rate: MetricMapping {
                    data_path: "heartList",
                    value_fields: &["heartValue", "heart", "value"],
                    timestamp_fields: ts,
                },
                spo2: MetricMapping {
                    data_path: "bloodOxygenList",
                    value_fields: &["bloodOxygen", "oxygenValue", "value"],
                    timestamp_fields: ts,
                },
                temperature: MetricMapping {
                    data_path: "temperatureList",
                    value_fields: &["temperatureValue", "temp", "value"],
                    timestamp_fields: ts,
                },
                battery: MetricMapping {
                    data_path: "batteryList",
                    value_fields: &["batteryValue", "level", "value"],
                    timestamp_fields: ts,
                },
                blood_pressure: BloodPressureMapping {
                    data_path: "bloodPressureList",
                    systolic_fields: &["systolicValue", "sbp", "systolic"],
                    diastolic_fields: &["diastolicValue", "dbp", "diastolic"],
                    timestamp_fields: ts,
                },
                sleep: SleepMapping {
                    data_path: "sleepList",
                    deep_fields: &["deepSleepTotal", "deepSleep", "deep"],
                    light_fields: &["lightSleepTotal", "lightSleep", "light"],
                    rem_fields: &["remSleepTotal", "rapidEyeMovementTotal", "rem"],
                    start_fields: ts,
                },
                combined: CombinedMapping {
                    data_path: "healthList",
                    type_fields: &["dataType", "type"],
                    value_fields: &["value", "dataValue"],
                    systolic_fields: &["systolicValue", "systolic"],
                    diastolic_fields: &["diastolicValue", "diastolic"],
                    timestamp_fields: ts,
                    heart_rate_tags: &["heartRate", "heart"],
                    spo2_tags: &["bloodOxygen", "spo2"],
                    temperature_tags: &["temperature", "temp"],
                    blood_pressure_tags: &["bloodPressure", "bp"],
                },
            }
        }
        Vendor::Qc => {
            let ts = match platform {
                Platform::Android => QC_TS_ANDROID,
                Platform::Ios => QC_TS_IOS,
            };
            FieldMapping {
                vendor,
                steps: StepsMapping {
                    data_path: "stepRecords",
                    step_fields: &["step", "stepCount", "steps"],
                    calorie_fields: &["calory", "calorie", "kcal"],
                    distance_fields: &["distance", "meters"],
                    timestamp_fields: ts,
                },
                heart_rate: MetricMapping {
                    data_path: "hrRecords",
                    value_fields: &["hr", "heartRate", "pulse"],
                    timestamp_fields: ts,
                },
                spo2: MetricMapping {
                    data_path: "spo2Records",
                    value_fields: &["spo2", "oxygen", "value"],
                    timestamp_fields: ts,
                },
                temperature: MetricMapping {
                    data_path: "tempRecords",
                    value_fields: &["temperature", "tempValue", "value"],
                    timestamp_fields: ts,
                },
                battery: MetricMapping {
                    data_path: "batteryRecords",
                    value_fields: &["battery", "level", "value"],
                    timestamp_fields: ts,
                },
                blood_pressure: BloodPressureMapping {
                    data_path: "bpRecords",
                    systolic_fields: &["sbp", "high", "systolic"],
                    diastolic_fields: &["dbp", "low", "diastolic"],
                    timestamp_fields: ts,
                },
                sleep: SleepMapping {
                    data_path: "sleepRecords",
                    deep_fields: &["deep", "deepSeconds"],
                    light_fields: &["light", "lightSeconds"],
                    rem_fields: &["rem", "remSeconds"],
                    start_fields: ts,
                },
                combined: CombinedMapping {
                    data_path: "records",
                    type_fields: &["type", "dataType"],
                    value_fields: &["value", "val"],
                    systolic_fields: &["sbp", "systolic"],
                    diastolic_fields: &["dbp", "diastolic"],
                    timestamp_fields: ts,
                    heart_rate_tags: &["hr", "heartRate"],
                    spo2_tags: &["spo2", "oxygen"],
                    temperature_tags: &["temp", "temperature"],
                    blood_pressure_tags: &["bp", "bloodPressure"],
                },
            }
        }
    }
}
