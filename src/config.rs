//! Engine configuration
//!
//! Every tuning constant of the sync stack lives here. The per-class error
//! ceilings are deliberately asymmetric; they were tuned against observed
//! hardware failure rates and must stay independently adjustable.

use std::time::Duration;

use crate::types::Platform;

/// Configuration for the sync engine with tunable thresholds
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Host platform; selects vendor field-name overrides and connect timeout
    pub platform: Platform,

    /// Whether the embedding app has an authenticated session.
    /// The scheduler refuses to start without one.
    pub authorized: bool,

    /// Interval between scheduled sync ticks
    pub sync_interval: Duration,

    /// Delay after `start()` before the readiness probe and first tick
    pub settle_delay: Duration,

    /// Tick suppression window entered after repeated failures
    pub cooldown: Duration,

    /// Global consecutive-failure ceiling, any class
    pub max_consecutive_errors: u32,

    /// Per-class consecutive-failure ceilings; crossing one surfaces a
    /// notification and backs the scheduler off
    pub max_timeout_errors: u32,
    pub max_connection_errors: u32,
    pub max_null_reference_errors: u32,

    /// Connectivity answers younger than this are served from cache
    pub connection_cache_ttl: Duration,

    /// Bound on one connectivity probe; exceeding it reads as "not connected"
    pub probe_timeout: Duration,

    /// Bound on one discovery sweep
    pub scan_timeout: Duration,

    /// Extra discovery sweeps when the first returns zero devices
    pub scan_retries: u32,

    /// Fixed wait between scan attempts while the connect lock is held
    pub scan_lock_wait: Duration,

    /// Scan attempts against a held connect lock before giving up
    pub scan_lock_attempts: u32,

    /// Bound on one raw-payload fetch
    pub fetch_timeout: Duration,

    /// Health retrieval attempts per sync
    pub fetch_attempts: u32,

    /// Base delay of the disconnect/reconnect recovery sequence; the
    /// between-attempt wait is this multiplied by the attempt index
    pub recovery_delay: Duration,

    /// Connect timeouts differ per platform; iOS needs longer for its
    /// restore-state dance
    pub connect_timeout_android: Duration,
    pub connect_timeout_ios: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            platform: Platform::Android,
            authorized: false,
            sync_interval: Duration::from_secs(30 * 60),
            settle_delay: Duration::from_secs(3),
            cooldown: Duration::from_secs(5 * 60),
            max_consecutive_errors: 3,
            max_timeout_errors: 2,
            max_connection_errors: 2,
            max_null_reference_errors: 1,
            connection_cache_ttl: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(9),
            scan_timeout: Duration::from_secs(25),
            scan_retries: 2,
            scan_lock_wait: Duration::from_millis(1500),
            scan_lock_attempts: 5,
            fetch_timeout: Duration::from_secs(65),
            fetch_attempts: 3,
            recovery_delay: Duration::from_secs(2),
            connect_timeout_android: Duration::from_secs(12),
            connect_timeout_ios: Duration::from_secs(15),
        }
    }
}

impl SyncConfig {
    /// The connect timeout for the configured platform
    pub fn connect_timeout(&self) -> Duration {
        match self.platform {
            Platform::Android => self.connect_timeout_android,
            Platform::Ios => self.connect_timeout_ios,
        }
    }

    /// Ceiling for one error class; 0 means the first failure of that class
    /// already surfaces and backs the scheduler off
    pub fn class_ceiling(&self, class: crate::error::ErrorClass) -> u32 {
        use crate::error::ErrorClass;
        match class {
            ErrorClass::Locked | ErrorClass::EmptyData => 0,
            ErrorClass::NullReference => self.max_null_reference_errors,
            ErrorClass::ConnectionFailure => self.max_connection_errors,
            ErrorClass::Timeout => self.max_timeout_errors,
            ErrorClass::Bluetooth => self.max_connection_errors,
            ErrorClass::Other => self.max_consecutive_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_defaults_match_tuned_values() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_interval, Duration::from_secs(1800));
        assert_eq!(config.cooldown, Duration::from_secs(300));
        assert_eq!(config.fetch_attempts, 3);
        assert_eq!(config.connection_cache_ttl, Duration::from_secs(2));
    }

    #[test]
    fn test_class_ceilings_are_asymmetric() {
        let config = SyncConfig::default();
        assert_eq!(config.class_ceiling(ErrorClass::Locked), 0);
        assert_eq!(config.class_ceiling(ErrorClass::EmptyData), 0);
        assert_eq!(config.class_ceiling(ErrorClass::NullReference), 1);
        assert_eq!(config.class_ceiling(ErrorClass::Timeout), 2);
        assert_eq!(config.class_ceiling(ErrorClass::Other), 3);
    }

    #[test]
    fn test_platform_connect_timeout() {
        let mut config = SyncConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(12));
        config.platform = Platform::Ios;
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
    }
}
