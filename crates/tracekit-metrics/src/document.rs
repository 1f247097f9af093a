//! The periodic metrics document.
//!
//! One document per flush: host identity, gauges, reporter queue counters,
//! per-layer admission counts, every tagged measurement and the encoded
//! response-time histograms. The reporter treats the result as an opaque
//! message payload.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use crate::gauges::SystemGauges;
use crate::host::HostIdentity;
use crate::measurements::MetricsSnapshot;
use crate::rate_counter::RateCounts;

/// Reporter-side queue counters, drained once per flush.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReporterStats {
    pub num_sent: i64,
    pub num_overflowed: i64,
    pub num_failed: i64,
    pub total_events: i64,
    pub queue_largest: i64,
}

/// Builds the flush document and serializes it to bytes.
pub fn build_metrics_message(
    identity: &HostIdentity,
    flush_interval_secs: u32,
    snapshot: &MetricsSnapshot,
    rate_counts: &[(String, RateCounts)],
    reporter: &ReporterStats,
    gauges: &SystemGauges,
) -> Vec<u8> {
    let document = metrics_document(
        identity,
        flush_interval_secs,
        snapshot,
        rate_counts,
        reporter,
        gauges,
    );
    serde_json::to_vec(&document).unwrap_or_default()
}

pub fn metrics_document(
    identity: &HostIdentity,
    flush_interval_secs: u32,
    snapshot: &MetricsSnapshot,
    rate_counts: &[(String, RateCounts)],
    reporter: &ReporterStats,
    gauges: &SystemGauges,
) -> Value {
    let mut doc = Map::new();
    append_host_fields(&mut doc, identity);
    doc.insert("Timestamp_u".to_string(), json!(timestamp_micros()));
    doc.insert(
        "MetricsFlushInterval".to_string(),
        json!(flush_interval_secs),
    );

    let mut measurements = Vec::new();
    if let Some(load1) = gauges.load1 {
        measurements.push(gauge("Load1", json!(load1)));
    }
    if let Some(total) = gauges.total_ram {
        measurements.push(gauge("TotalRAM", json!(total)));
    }
    if let Some(free) = gauges.free_ram {
        measurements.push(gauge("FreeRAM", json!(free)));
    }
    if let Some(rss) = gauges.process_ram {
        measurements.push(gauge("ProcessRAM", json!(rss)));
    }
    if let Some(threads) = gauges.num_threads {
        measurements.push(gauge("NumThreads", json!(threads)));
    }

    for (name, value) in [
        ("NumSent", reporter.num_sent),
        ("NumOverflowed", reporter.num_overflowed),
        ("NumFailed", reporter.num_failed),
        ("TotalEvents", reporter.total_events),
        ("QueueLargest", reporter.queue_largest),
    ] {
        measurements.push(json!({ "name": name, "count": value }));
    }

    for (layer, counts) in rate_counts {
        for (name, count) in [
            ("RequestCount", counts.requested),
            ("SampleCount", counts.sampled),
            ("TraceCount", counts.traced),
            ("TokenBucketExhaustionCount", counts.limited),
            ("ThroughCount", counts.through),
        ] {
            measurements.push(json!({
                "name": name,
                "count": count,
                "tags": { "Layer": layer },
            }));
        }
    }

    for measurement in &snapshot.measurements {
        let mut entry = Map::new();
        entry.insert("name".to_string(), json!(measurement.name));
        entry.insert("count".to_string(), json!(measurement.count));
        if measurement.report_sum {
            entry.insert("sum".to_string(), json!(measurement.sum));
        }
        if !measurement.tags.is_empty() {
            entry.insert("tags".to_string(), json!(measurement.tags));
        }
        measurements.push(Value::Object(entry));
    }
    doc.insert("measurements".to_string(), Value::Array(measurements));

    let histograms: Vec<Value> = snapshot
        .histograms
        .iter()
        .map(|histogram| {
            json!({
                "name": crate::measurements::TRANSACTION_RESPONSE_TIME,
                "value": histogram.encoded,
                "tags": { "TransactionName": histogram.transaction },
            })
        })
        .collect();
    doc.insert("histograms".to_string(), Value::Array(histograms));

    if snapshot.transaction_name_overflow {
        doc.insert("TransactionNameOverflow".to_string(), json!(true));
    }

    Value::Object(doc)
}

/// The connection-init status document sent after every (re)connect.
pub fn connection_init_document(identity: &HostIdentity) -> Value {
    let mut doc = Map::new();
    doc.insert("ConnectionInit".to_string(), json!(true));
    append_host_fields(&mut doc, identity);
    Value::Object(doc)
}

fn append_host_fields(doc: &mut Map<String, Value>, identity: &HostIdentity) {
    doc.insert("Hostname".to_string(), json!(identity.hostname));
    doc.insert("Distro".to_string(), json!(identity.distro));
    doc.insert("PID".to_string(), json!(identity.pid));
    doc.insert("UUID".to_string(), json!(identity.uuid));
    if let Some(sysname) = &identity.uname_sysname {
        doc.insert("UnameSysName".to_string(), json!(sysname));
    }
    if let Some(version) = &identity.uname_version {
        doc.insert("UnameVersion".to_string(), json!(version));
    }
    doc.insert("IPAddresses".to_string(), json!(identity.ip_addresses));
    doc.insert("MACAddresses".to_string(), json!(identity.mac_addresses));
    if let Some(instance_id) = &identity.ec2_instance_id {
        doc.insert("EC2InstanceID".to_string(), json!(instance_id));
    }
    if let Some(zone) = &identity.ec2_zone {
        doc.insert("EC2AvailabilityZone".to_string(), json!(zone));
    }
    if let Some(container_id) = &identity.container_id {
        doc.insert("DockerContainerID".to_string(), json!(container_id));
    }
}

/// Gauges report a single observation: count 1 with the value as the sum.
fn gauge(name: &str, value: Value) -> Value {
    json!({ "name": name, "count": 1, "sum": value })
}

fn timestamp_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
