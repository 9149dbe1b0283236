//! Field-client side of TripTeller presence: one monitored socket to the
//! presence server, a sampler that turns raw fixes into significant samples,
//! and an offline-tolerant save path for location history.

pub mod backoff;
pub mod connection;
pub mod offline;
pub mod sampler;
pub mod simulate;
pub mod tracker;

pub use backoff::{Backoff, BackoffPolicy};
pub use connection::{
    ConnectError, Connector, HealthMonitor, Link, LinkPeer, MonitorConfig, Phase, WsConnector,
};
pub use offline::{
    HttpSampleStore, OfflineBuffer, OfflineSync, SampleStore, StoreError, StoredSample, SyncError,
    SyncStatus,
};
pub use sampler::{
    FilterConfig, Fix, LocationSampler, Permission, PositionError, PositionSource, SampleFilter,
    SamplerError, SamplerState,
};
pub use simulate::WalkingSource;
pub use tracker::{Tracker, TrackerConfig, TrackerError, TrackingReport};
