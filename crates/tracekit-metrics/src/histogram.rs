//! Response-time histograms.
//!
//! One HDR histogram per transaction name accumulates between flushes; the
//! flush encodes each histogram into the compressed V2 representation the
//! collector ingests (base64 of the deflated payload).

use std::time::Duration;

use data_encoding::BASE64;
use hdrhistogram::serialization::{Serializer, V2DeflateSerializer};
use hdrhistogram::{CreationError, Histogram};
use tracing::{debug, warn};

/// Bounds and precision for the response-time histograms, surfaced so
/// deployments with unusual latency profiles can widen the range.
#[derive(Debug, Clone, Copy)]
pub struct HistogramConfig {
    /// Lowest discernible value in microseconds.
    pub lowest: u64,
    /// Highest trackable value in microseconds (one hour by default).
    pub highest: u64,
    /// Number of significant value digits kept (0..=5).
    pub sigfig: u8,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        HistogramConfig {
            lowest: 1,
            highest: 3_600_000_000,
            sigfig: 3,
        }
    }
}

/// One transaction's latency distribution for the current flush period.
pub(crate) struct ResponseTimeHistogram {
    hist: Histogram<u64>,
}

impl ResponseTimeHistogram {
    pub(crate) fn new(config: &HistogramConfig) -> Result<Self, CreationError> {
        let hist = Histogram::new_with_bounds(config.lowest, config.highest, config.sigfig)?;
        Ok(ResponseTimeHistogram { hist })
    }

    /// Records one response time. A duration outside the tracked range is
    /// dropped rather than failing the caller.
    pub(crate) fn record(&mut self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        if let Err(err) = self.hist.record(micros) {
            debug!(micros, %err, "response time outside histogram range, dropped");
        }
    }

    /// Serializes the histogram into its wire form. Returns `None` (after
    /// logging) when serialization fails; the flush simply omits the entry.
    pub(crate) fn encode(&self, transaction: String) -> Option<EncodedHistogram> {
        let mut compressed = Vec::new();
        match V2DeflateSerializer::new().serialize(&self.hist, &mut compressed) {
            Ok(_) => Some(EncodedHistogram {
                transaction,
                encoded: BASE64.encode(&compressed),
            }),
            Err(err) => {
                warn!(transaction, %err, "failed to serialize response-time histogram");
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> u64 {
        self.hist.len()
    }
}

/// Wire-ready histogram: the transaction tag plus the base64 blob.
#[derive(Debug, Clone)]
pub struct EncodedHistogram {
    pub transaction: String,
    pub encoded: String,
}
