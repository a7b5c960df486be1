//! Sliding-window buffering for streaming metric samples.
//!
//! Each inbound sample is appended to a per-entity sorted buffer held by a
//! [`WindowStore`], the buffer is trimmed, and once enough history exists the
//! most recent values are emitted as an [`OutputRecord`] ready for model
//! inference. [`WindowAggregator`] ties the pieces together.

mod aggregator;
mod config;
mod model;
mod payload;
mod retry;
mod sanitize;
mod store;

pub use aggregator::{DropReason, WindowAggregator, WindowOutcome};
pub use config::{
    MetricConfig, MetricConfigEntry, MetricConfigSource, StaticMetricConfigs, WindowSettings,
    DEFAULT_BUFFER_FACTOR,
};
pub use model::{
    EntityKey, Header, InputRecord, OutputRecord, RawTimestamp, RawValue, Status,
    TimestampedValue, WindowResult, KEY_SEPARATOR,
};
pub use payload::{build_payload, new_record_id};
pub use retry::{RetryOutcome, RetryPolicy};
pub use sanitize::{clean_values, DEFAULT_INF_REPLACEMENT, DEFAULT_NAN_REPLACEMENT};
pub use store::{
    decode_member, encode_member, trim_bounds, ConnectionProvider, InMemoryWindowStore,
    SharedStoreProvider, StoreError, StoreHandle, WindowStore, DEFAULT_TRIM_SLACK,
    MEMBER_SEPARATOR,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WindowError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("store failure after {attempts} attempt(s): {source}")]
    Store {
        attempts: u32,
        #[source]
        source: StoreError,
    },
}
