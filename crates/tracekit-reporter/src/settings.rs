//! Versioned sampling settings pulled from the collector.
//!
//! Settings install atomically keyed by `(type, layer)` and expire on a TTL;
//! a periodic check restores defaults once a setting lapses. Bucket
//! parameters flow into the rate-counter registry, the flush interval and
//! transaction cap into the reporter and aggregator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use tracekit_metrics::{
    MeasurementSet, RateCounterRegistry, DEFAULT_BUCKET_CAPACITY, DEFAULT_BUCKET_RATE,
};

use crate::rpc::{SettingType, SettingsResult, WireSetting};

/// Metrics flush cadence applied when the collector does not say otherwise.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u32 = 30;
/// Transaction-name cap applied when the collector does not say otherwise.
pub const DEFAULT_MAX_TRANSACTIONS: u32 = 200;

const ARG_BUCKET_CAPACITY: &str = "BucketCapacity";
const ARG_BUCKET_RATE: &str = "BucketRate";
const ARG_FLUSH_INTERVAL: &str = "MetricsFlushInterval";
const ARG_MAX_TRANSACTIONS: &str = "MaxTransactions";

#[derive(Debug, Clone)]
struct SettingEntry {
    value: i64,
    #[allow(dead_code)]
    flags: String,
    expires_at: Instant,
}

/// The reporter's view of collector-issued policy.
pub struct SettingsStore {
    flush_interval: AtomicU32,
    entries: Mutex<HashMap<(SettingType, String), SettingEntry>>,
    registry: Arc<RateCounterRegistry>,
    measurements: Arc<MeasurementSet>,
}

impl SettingsStore {
    pub fn new(registry: Arc<RateCounterRegistry>, measurements: Arc<MeasurementSet>) -> Self {
        SettingsStore {
            flush_interval: AtomicU32::new(DEFAULT_FLUSH_INTERVAL_SECS),
            entries: Mutex::new(HashMap::new()),
            registry,
            measurements,
        }
    }

    /// Current metrics flush cadence in seconds, never zero.
    pub fn flush_interval_secs(&self) -> u32 {
        self.flush_interval.load(Ordering::Relaxed).max(1)
    }

    /// Installs every setting from a successful settings pull. The newest
    /// applied value wins; absent arguments fall back to their defaults.
    pub fn apply(&self, result: &SettingsResult) {
        for setting in &result.settings {
            self.apply_one(setting);
        }
    }

    fn apply_one(&self, setting: &WireSetting) {
        let rate = setting
            .arguments
            .get(ARG_BUCKET_RATE)
            .and_then(|bytes| decode_f64(bytes))
            .unwrap_or(DEFAULT_BUCKET_RATE);
        let capacity = setting
            .arguments
            .get(ARG_BUCKET_CAPACITY)
            .and_then(|bytes| decode_f64(bytes))
            .unwrap_or(DEFAULT_BUCKET_CAPACITY);
        self.registry.configure(&setting.layer, rate, capacity);

        let flush_interval = setting
            .arguments
            .get(ARG_FLUSH_INTERVAL)
            .and_then(|bytes| decode_u32(bytes))
            .unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS);
        self.flush_interval.store(flush_interval, Ordering::Relaxed);

        let max_transactions = setting
            .arguments
            .get(ARG_MAX_TRANSACTIONS)
            .and_then(|bytes| decode_u32(bytes))
            .unwrap_or(DEFAULT_MAX_TRANSACTIONS);
        self.measurements
            .set_max_transactions(max_transactions as usize);

        let ttl = Duration::from_secs(setting.ttl.max(0) as u64);
        debug!(
            setting_type = ?setting.setting_type,
            layer = %setting.layer,
            value = setting.value,
            ttl_secs = setting.ttl,
            "installed collector setting"
        );
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            (setting.setting_type, setting.layer.clone()),
            SettingEntry {
                value: setting.value,
                flags: setting.flags.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// The sampling rate for a layer, preferring its own setting over the
    /// default one. `None` once every applicable setting has expired.
    pub fn sample_value(&self, layer: &str) -> Option<i64> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let unexpired = |key: &(SettingType, String)| {
            entries
                .get(key)
                .filter(|entry| entry.expires_at > now)
                .map(|entry| entry.value)
        };
        unexpired(&(SettingType::LayerSampleRate, layer.to_string()))
            .or_else(|| unexpired(&(SettingType::DefaultSampleRate, String::new())))
    }

    /// Drops settings past their TTL and restores the defaults they had
    /// overridden.
    pub fn check_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(SettingType, String)> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let expired: Vec<_> = entries
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                entries.remove(key);
            }
            expired
        };

        for (setting_type, layer) in &expired {
            info!(?setting_type, %layer, "collector setting expired, restoring defaults");
            self.registry.restore_defaults(layer);
        }
        if !expired.is_empty() {
            self.flush_interval
                .store(DEFAULT_FLUSH_INTERVAL_SECS, Ordering::Relaxed);
            self.measurements
                .set_max_transactions(DEFAULT_MAX_TRANSACTIONS as usize);
        }
    }
}

/// Decodes a little-endian f64 argument; exactly eight bytes.
pub(crate) fn decode_f64(bytes: &[u8]) -> Option<f64> {
    <[u8; 8]>::try_from(bytes).ok().map(f64::from_le_bytes)
}

/// Decodes a little-endian u32 argument; exactly four bytes.
pub(crate) fn decode_u32(bytes: &[u8]) -> Option<u32> {
    <[u8; 4]>::try_from(bytes).ok().map(u32::from_le_bytes)
}
