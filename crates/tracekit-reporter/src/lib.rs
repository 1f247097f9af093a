//! Collector client for the tracekit agent.
//!
//! The reporter lives inside the application process, consumes finalized
//! event buffers and HTTP span summaries from the instrumentation layer, and
//! forwards them to the collector over two long-lived connections: one
//! dedicated to events, one shared by metrics, status and settings traffic.
//! Sampling policy flows the other way, refreshed periodically and applied to
//! per-layer token buckets.
//!
//! Nothing here ever blocks or fails the host application: configuration
//! problems install a [`NullReporter`], full queues drop and count, and the
//! connections heal themselves with bounded backoff.

pub mod config;
mod connection;
pub mod reporter;
pub mod rpc;
pub mod sampling;
pub mod settings;
mod transport;

pub use config::{AgentConfig, ConfigError, ServiceKey, TracingMode, DEFAULT_COLLECTOR};
pub use reporter::{init_from_env, NullReporter, Reporter, ReporterError, RpcReporter};
pub use sampling::{SampleDecision, SampleSource, SAMPLE_RATE_SCALE};
pub use settings::SettingsStore;
pub use tracekit_metrics::HttpSpanSummary;
