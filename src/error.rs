//! Error types for Ringkit
//!
//! The sync stack distinguishes failures that are safe to retry from those
//! that must terminate a sync immediately. `SyncError` carries the typed
//! failure; `ErrorClass` is the scheduler-facing classification derived from
//! it.

use thiserror::Error;

/// Errors that can occur while connecting to or syncing a ring
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("resource is locked: {0}")]
    Locked(String),

    #[error("device returned no usable health data")]
    EmptyData,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("bluetooth unavailable: {0}")]
    BluetoothUnavailable(String),

    #[error("unexpected null in native response: {0}")]
    NullReference(String),

    #[error("invalid device identity: {0}")]
    InvalidDevice(String),

    #[error("sync requires an authenticated session")]
    NotAuthorized,

    #[error("invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("sync failed: {0}")]
    Unknown(String),
}

/// Scheduler-facing failure classification.
///
/// Every failure maps to exactly one class. The orchestrator keeps a
/// consecutive-failure counter per class and compares it against the class
/// ceiling configured in `SyncConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Bluetooth,
    Timeout,
    NullReference,
    ConnectionFailure,
    Locked,
    EmptyData,
    Other,
}

impl ErrorClass {
    /// Classify a typed sync error
    pub fn classify(error: &SyncError) -> Self {
        match error {
            SyncError::Locked(_) => ErrorClass::Locked,
            SyncError::EmptyData => ErrorClass::EmptyData,
            SyncError::Timeout(_) => ErrorClass::Timeout,
            SyncError::ConnectionFailed(_) => ErrorClass::ConnectionFailure,
            SyncError::BluetoothUnavailable(_) => ErrorClass::Bluetooth,
            SyncError::NullReference(_) => ErrorClass::NullReference,
            SyncError::InvalidDevice(_) => ErrorClass::NullReference,
            SyncError::NotAuthorized => ErrorClass::Other,
            SyncError::JsonError(_) => ErrorClass::Other,
            SyncError::Unknown(msg) => Self::classify_message(msg),
        }
    }

    /// Classify a failure from its message alone.
    ///
    /// Collaborator SDKs surface errors as strings; the match order mirrors
    /// specificity, with the lock and empty-data checks first because those
    /// classes terminate a sync outright.
    pub fn classify_message(message: &str) -> Self {
        let msg = message.to_lowercase();
        if msg.contains("lock") || msg.contains("busy") || msg.contains("in progress") {
            ErrorClass::Locked
        } else if msg.contains("empty") || msg.contains("no data") || msg.contains("no usable") {
            ErrorClass::EmptyData
        } else if msg.contains("bluetooth") || msg.contains("radio") || msg.contains("adapter") {
            ErrorClass::Bluetooth
        } else if msg.contains("timeout") || msg.contains("timed out") {
            ErrorClass::Timeout
        } else if msg.contains("null") || msg.contains("undefined") {
            ErrorClass::NullReference
        } else if msg.contains("connect") || msg.contains("disconnected") {
            ErrorClass::ConnectionFailure
        } else {
            ErrorClass::Other
        }
    }

    /// Whether a failure of this class may be retried at all.
    ///
    /// Locked means another operation owns the hardware; empty data means the
    /// device answered correctly but has nothing to give. Retrying either
    /// within the same sync cannot succeed.
    pub fn retryable(&self) -> bool {
        !matches!(self, ErrorClass::Locked | ErrorClass::EmptyData)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Bluetooth => "bluetooth",
            ErrorClass::Timeout => "timeout",
            ErrorClass::NullReference => "null_reference",
            ErrorClass::ConnectionFailure => "connection_failure",
            ErrorClass::Locked => "locked",
            ErrorClass::EmptyData => "empty_data",
            ErrorClass::Other => "other",
        }
    }
}
