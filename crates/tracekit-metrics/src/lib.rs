//! On-process measurement aggregation for the tracekit agent.
//!
//! This crate owns everything the reporter flushes: per-layer token-bucket
//! samplers, tagged measurements, per-transaction response-time histograms,
//! host identity and the periodic metrics document itself. It performs no
//! network I/O of its own apart from the one-shot EC2 metadata probe.

pub mod document;
pub mod gauges;
pub mod histogram;
pub mod host;
pub mod measurements;
pub mod rate_counter;

pub use document::{build_metrics_message, connection_init_document, ReporterStats};
pub use gauges::SystemGauges;
pub use histogram::{EncodedHistogram, HistogramConfig};
pub use host::{host_identity, HostIdentity};
pub use measurements::{
    transaction_for_url, HttpSpanSummary, Measurement, MeasurementSet, MetricsSnapshot,
};
pub use rate_counter::{
    RateCounter, RateCounterRegistry, RateCounts, DEFAULT_BUCKET_CAPACITY, DEFAULT_BUCKET_RATE,
};
