//! The statistics pipeline: per-request recording into KV, periodic
//! aggregation into durable roll-ups.

mod aggregator;
mod keys;
mod recorder;

pub use aggregator::{AggregationOutcome, RunMode, StatsAggregator};
pub use keys::{StatsKeys, api_fields};
pub use recorder::{ApiCall, LATENCY_SAMPLE_CAP, RecorderConfig, RequestEvent, StatsRecorder};
