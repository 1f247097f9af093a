//! Tagged measurement aggregation.
//!
//! Producers record measurements keyed by a deterministic fingerprint of
//! `(name, report-sum, sorted tags)`. The metrics task swaps the maps out
//! wholesale once per flush, so the insert path only ever holds the lock for
//! a map operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::histogram::{EncodedHistogram, HistogramConfig, ResponseTimeHistogram};

pub const MAX_TAG_NAME_LEN: usize = 64;
pub const MAX_TAG_VALUE_LEN: usize = 255;
/// Transaction-name cap applied until the collector overrides it.
pub const DEFAULT_MAX_TRANSACTIONS: usize = 200;

/// Metric name carrying every HTTP span rollup.
pub const TRANSACTION_RESPONSE_TIME: &str = "TransactionResponseTime";
/// Bucket that absorbs transaction names past the cap.
pub const OTHER_TRANSACTION: &str = "other";

/// Summary of one finished HTTP span, handed over by the span layer.
#[derive(Debug, Clone)]
pub struct HttpSpanSummary {
    /// Explicit transaction name; derived from the URL when empty.
    pub transaction: Option<String>,
    pub url: String,
    pub method: String,
    pub status: u16,
    pub duration: Duration,
    pub has_error: bool,
}

/// One aggregated measurement between flushes.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub count: i64,
    pub sum: f64,
    pub report_sum: bool,
}

/// Everything drained out of the aggregator by one flush.
#[derive(Debug, Default)]
pub struct MetricsSnapshot {
    pub measurements: Vec<Measurement>,
    pub histograms: Vec<EncodedHistogram>,
    pub transaction_name_overflow: bool,
}

struct Inner {
    measurements: HashMap<String, Measurement>,
    histograms: HashMap<String, ResponseTimeHistogram>,
    transaction_names: HashSet<String>,
    transaction_name_overflow: bool,
}

impl Inner {
    fn empty() -> Self {
        Inner {
            measurements: HashMap::new(),
            histograms: HashMap::new(),
            transaction_names: HashSet::new(),
            transaction_name_overflow: false,
        }
    }
}

/// Thread-safe measurement and histogram aggregator.
pub struct MeasurementSet {
    max_transactions: AtomicUsize,
    histogram_config: HistogramConfig,
    inner: Mutex<Inner>,
}

impl Default for MeasurementSet {
    fn default() -> Self {
        MeasurementSet::new(HistogramConfig::default())
    }
}

impl MeasurementSet {
    pub fn new(histogram_config: HistogramConfig) -> Self {
        MeasurementSet {
            max_transactions: AtomicUsize::new(DEFAULT_MAX_TRANSACTIONS),
            histogram_config,
            inner: Mutex::new(Inner::empty()),
        }
    }

    /// Updates the transaction-name cap; applied to decisions from the next
    /// recorded span onward.
    pub fn set_max_transactions(&self, max: usize) {
        self.max_transactions.store(max, Ordering::Relaxed);
    }

    pub fn max_transactions(&self) -> usize {
        self.max_transactions.load(Ordering::Relaxed)
    }

    /// Adds `count`/`value` to the measurement identified by the name and tag
    /// set, creating it on first sight. The caller keeps ownership of its tag
    /// map.
    pub fn record(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
        value: f64,
        count: i64,
        report_sum: bool,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        record_locked(&mut inner, name, tags, value, count, report_sum);
    }

    /// Rolls one finished HTTP span into the aggregate: the four
    /// `TransactionResponseTime` measurements plus the per-transaction
    /// response-time histogram.
    pub fn record_span(&self, span: &HttpSpanSummary) {
        let requested = match &span.transaction {
            Some(name) if !name.is_empty() => name.clone(),
            _ => transaction_for_url(&span.url),
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let transaction = self.admit_transaction(&mut inner, requested);
        let duration_us = span.duration.as_micros() as f64;

        let mut tags = BTreeMap::new();
        tags.insert("TransactionName".to_string(), transaction.clone());
        record_locked(
            &mut inner,
            TRANSACTION_RESPONSE_TIME,
            &tags,
            duration_us,
            1,
            true,
        );

        let mut with_method = tags.clone();
        with_method.insert("HttpMethod".to_string(), span.method.clone());
        record_locked(
            &mut inner,
            TRANSACTION_RESPONSE_TIME,
            &with_method,
            duration_us,
            1,
            true,
        );

        let mut with_status = tags.clone();
        with_status.insert("HttpStatus".to_string(), span.status.to_string());
        record_locked(
            &mut inner,
            TRANSACTION_RESPONSE_TIME,
            &with_status,
            duration_us,
            1,
            true,
        );

        if span.has_error {
            let mut with_error = tags.clone();
            with_error.insert("Errors".to_string(), "true".to_string());
            record_locked(
                &mut inner,
                TRANSACTION_RESPONSE_TIME,
                &with_error,
                duration_us,
                1,
                true,
            );
        }

        self.record_histogram_locked(&mut inner, &transaction, span.duration);
    }

    /// Records one response time into the transaction's histogram. Values
    /// outside the tracked range are dropped.
    pub fn record_histogram(&self, transaction: &str, duration: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.record_histogram_locked(&mut inner, transaction, duration);
    }

    fn record_histogram_locked(&self, inner: &mut Inner, transaction: &str, duration: Duration) {
        if !inner.histograms.contains_key(transaction) {
            match ResponseTimeHistogram::new(&self.histogram_config) {
                Ok(histogram) => {
                    inner
                        .histograms
                        .insert(transaction.to_string(), histogram);
                }
                Err(err) => {
                    debug!(transaction, %err, "cannot create response-time histogram");
                    return;
                }
            }
        }
        if let Some(histogram) = inner.histograms.get_mut(transaction) {
            histogram.record(duration);
        }
    }

    /// Maps a requested transaction name onto either itself or `other` once
    /// the per-flush cap is reached.
    fn admit_transaction(&self, inner: &mut Inner, requested: String) -> String {
        if inner.transaction_names.contains(&requested) {
            return requested;
        }
        if inner.transaction_names.len() < self.max_transactions() {
            inner.transaction_names.insert(requested.clone());
            return requested;
        }
        inner.transaction_name_overflow = true;
        OTHER_TRANSACTION.to_string()
    }

    /// Swaps fresh empty maps in and returns everything accumulated since the
    /// previous flush, with histograms already in their wire encoding.
    pub fn snapshot_and_reset(&self) -> MetricsSnapshot {
        let drained = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *inner, Inner::empty())
        };

        let mut measurements: Vec<Measurement> = drained.measurements.into_values().collect();
        measurements.sort_by(|a, b| {
            fingerprint(&a.name, a.report_sum, &a.tags).cmp(&fingerprint(
                &b.name,
                b.report_sum,
                &b.tags,
            ))
        });

        let mut histograms: Vec<EncodedHistogram> = drained
            .histograms
            .into_iter()
            .filter_map(|(transaction, histogram)| histogram.encode(transaction))
            .collect();
        histograms.sort_by(|a, b| a.transaction.cmp(&b.transaction));

        MetricsSnapshot {
            measurements,
            histograms,
            transaction_name_overflow: drained.transaction_name_overflow,
        }
    }
}

fn record_locked(
    inner: &mut Inner,
    name: &str,
    tags: &BTreeMap<String, String>,
    value: f64,
    count: i64,
    report_sum: bool,
) {
    let tags: BTreeMap<String, String> = tags
        .iter()
        .map(|(k, v)| (truncate(k, MAX_TAG_NAME_LEN), truncate(v, MAX_TAG_VALUE_LEN)))
        .collect();
    let key = fingerprint(name, report_sum, &tags);

    let measurement = inner
        .measurements
        .entry(key)
        .or_insert_with(|| Measurement {
            name: name.to_string(),
            tags,
            count: 0,
            sum: 0.0,
            report_sum,
        });
    measurement.count += count;
    measurement.sum += value;
}

/// Deterministic key for one measurement: name, report-sum flag and the
/// sorted tag pairs.
pub fn fingerprint(name: &str, report_sum: bool, tags: &BTreeMap<String, String>) -> String {
    let mut key = format!("{name}|{report_sum}|");
    for (tag, value) in tags {
        key.push_str(tag);
        key.push('=');
        key.push_str(value);
        key.push('&');
    }
    key
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    // Back off to a char boundary so multi-byte tags cannot split a char.
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

static URL_TRANSACTION_RE: OnceLock<Regex> = OnceLock::new();

/// Derives a transaction name from a URL: the first two path components, a
/// single one, or `/` when the URL carries no path.
pub fn transaction_for_url(url: &str) -> String {
    let re = URL_TRANSACTION_RE.get_or_init(|| {
        Regex::new(r"^(https?://)?[^/]+(/([^/\?]+))?(/([^/\?]+))?")
            .expect("static transaction regex")
    });

    let Some(captures) = re.captures(url) else {
        return "/".to_string();
    };
    match captures.get(3).map(|m| m.as_str()) {
        Some(first) if !first.is_empty() => match captures.get(5).map(|m| m.as_str()) {
            Some(second) if !second.is_empty() => format!("/{first}/{second}"),
            _ => format!("/{first}"),
        },
        _ => "/".to_string(),
    }
}
