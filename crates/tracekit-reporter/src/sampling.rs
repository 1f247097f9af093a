//! Per-request sampling decisions.
//!
//! The span layer asks the reporter whether to trace a request before it
//! builds any events. The decision combines the configured tracing mode, the
//! collector-issued sample rate for the layer, and finally the layer's token
//! bucket for admission.

use crate::config::TracingMode;

/// Sample rates are expressed in parts per million.
pub const SAMPLE_RATE_SCALE: i64 = 1_000_000;

/// Where the effective sample rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    /// Built-in default; no collector setting applied.
    Default,
    /// A collector-issued setting for this layer (or the global default
    /// setting).
    Remote,
    /// The request continued an upstream trace, bypassing the dice roll.
    Continued,
}

/// Outcome handed back to the span layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleDecision {
    pub sampled: bool,
    /// Effective rate in parts per million.
    pub rate: i64,
    pub source: SampleSource,
}

/// The pure policy half of the decision; the caller still runs the result
/// through the layer's rate counter. `roll` is a uniform draw from
/// `0..SAMPLE_RATE_SCALE`.
pub(crate) fn decide(
    mode: TracingMode,
    remote_rate: Option<i64>,
    has_upstream: bool,
    roll: i64,
) -> SampleDecision {
    let rate = remote_rate
        .unwrap_or(SAMPLE_RATE_SCALE)
        .clamp(0, SAMPLE_RATE_SCALE);
    let source = if has_upstream {
        SampleSource::Continued
    } else if remote_rate.is_some() {
        SampleSource::Remote
    } else {
        SampleSource::Default
    };

    // An inherited trace context continues the upstream decision outright;
    // the tracing mode only gates fresh traces, which also roll against the
    // effective rate.
    let sampled = if has_upstream {
        true
    } else {
        match mode {
            TracingMode::Always => roll < rate,
            TracingMode::Through | TracingMode::Never => false,
        }
    };

    SampleDecision {
        sampled,
        rate,
        source,
    }
}
