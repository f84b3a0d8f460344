//! Ringkit - on-device connection and sync engine for smart-ring wearables
//!
//! Ringkit connects to ring devices over their vendor SDKs, pulls raw health
//! telemetry, and produces one canonical, always fully-shaped health record
//! through a deterministic pipeline: coordination → retrieval → normalization.
//!
//! ## Modules
//!
//! - **Coordinator**: process-wide serialization of connect/scan operations,
//!   probe caching, single-flight deduplication
//! - **Retrieval**: bounded-retry health payload fetch with
//!   disconnect/reconnect recovery
//! - **Normalizer**: vendor payload → canonical record, driven by pure
//!   field-mapping tables
//! - **Orchestrator**: periodic and manual sync scheduling with error
//!   classification, cooldown, pause/resume, and exclusion windows
//!
//! The wireless transport, storage, backend, and notification delivery are
//! collaborator traits in [`transport`]; the embedding app supplies them.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod normalizer;
pub mod orchestrator;
pub mod retrieval;
pub mod transport;
pub mod types;

pub use config::SyncConfig;
pub use coordinator::ConnectionCoordinator;
pub use engine::{RingEngine, RingEngineBuilder};
pub use error::{ErrorClass, SyncError};
pub use normalizer::{DayWindow, Normalizer};
pub use orchestrator::{RunState, SyncOrchestrator};
pub use retrieval::{HealthRetriever, RetrievedHealth};
pub use transport::{
    BackendSync, DeviceStore, Notifier, OsHealthProvider, RingTransport, SyncEvent,
};
pub use types::{
    DeviceIdentity, DiscoveredDevice, NormalizedHealthData, Platform, RawHealthPayload,
    SyncSource, SyncStatus, Vendor,
};

/// Engine version, embedded in diagnostics
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
