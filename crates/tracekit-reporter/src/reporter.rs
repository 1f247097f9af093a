//! The reporter: owns both collector connections, the bounded message
//! channels, and every long-running loop (event sender, status sender, span
//! aggregator, periodic tasks).
//!
//! Producers only ever touch bounded channels with non-blocking sends; a full
//! channel drops the message and bumps the overflow counter instead of
//! stalling application code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use tracekit_metrics::{
    build_metrics_message, host_identity, HttpSpanSummary, MeasurementSet, RateCounterRegistry,
    SystemGauges,
};

use crate::config::{AgentConfig, TracingMode};
use crate::connection::{Connection, SenderId};
use crate::rpc::{Encoding, HostId, MessageRequest, Rpc, SettingsRequest};
use crate::sampling::{decide, SampleDecision, SampleSource, SAMPLE_RATE_SCALE};
use crate::settings::SettingsStore;
use crate::transport::{Dialer, HttpDialer, TransportError};

const CHANNEL_CAPACITY: usize = 1024;
/// Ceiling on the number of messages handed to one PostEvents batch.
const EVENT_BATCH_MAX: usize = 512;
/// Idle trigger for the event sender's dual-trigger batching.
const EVENT_BATCH_IDLE: Duration = Duration::from_millis(100);
const GET_SETTINGS_INTERVAL: Duration = Duration::from_secs(30);
const SETTINGS_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const CLIENT_VERSION: &str = concat!("rust-", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum ReporterError {
    #[error("{0} message queue is full")]
    QueueFull(&'static str),

    #[error("reporter is shut down")]
    Closed,
}

/// What the span layer sees of the reporter.
pub trait Reporter: Send + Sync {
    /// Enqueues one finalized event buffer. Never blocks; a full queue drops
    /// the event and returns an error.
    fn report_event(&self, message: Vec<u8>) -> Result<(), ReporterError>;

    /// Enqueues one status message.
    fn report_status(&self, message: Vec<u8>) -> Result<(), ReporterError>;

    /// Enqueues one finished HTTP span for aggregation.
    fn report_span(&self, span: HttpSpanSummary) -> Result<(), ReporterError>;

    /// Decides whether a request should be traced.
    fn should_sample(&self, layer: &str, incoming_trace_id: Option<&str>) -> SampleDecision;

    fn is_open(&self) -> bool;

    /// Signals every loop to stop. In-flight batches are abandoned.
    fn shutdown(&self);
}

/// Installed when configuration fails so the host application keeps running
/// with reporting disabled.
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report_event(&self, _message: Vec<u8>) -> Result<(), ReporterError> {
        Ok(())
    }

    fn report_status(&self, _message: Vec<u8>) -> Result<(), ReporterError> {
        Ok(())
    }

    fn report_span(&self, _span: HttpSpanSummary) -> Result<(), ReporterError> {
        Ok(())
    }

    fn should_sample(&self, _layer: &str, _incoming_trace_id: Option<&str>) -> SampleDecision {
        SampleDecision {
            sampled: false,
            rate: 0,
            source: SampleSource::Default,
        }
    }

    fn is_open(&self) -> bool {
        false
    }

    fn shutdown(&self) {}
}

/// Builds a reporter from the environment; any configuration or startup
/// failure installs a [`NullReporter`] instead of surfacing an error.
pub async fn init_from_env() -> Arc<dyn Reporter> {
    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            warn!(%err, "reporting disabled");
            return Arc::new(NullReporter);
        }
    };
    match RpcReporter::start(config).await {
        Ok(reporter) => Arc::new(reporter),
        Err(err) => {
            error!(%err, "failed to reach the collector, reporting disabled");
            Arc::new(NullReporter)
        }
    }
}

/// Shared state used by the periodic tasks.
struct PeriodicContext {
    service_key: String,
    event_connection: Arc<Connection>,
    metric_connection: Arc<Connection>,
    settings: Arc<SettingsStore>,
    registry: Arc<RateCounterRegistry>,
    measurements: Arc<MeasurementSet>,
    metrics_tx: mpsc::Sender<Vec<u8>>,
    metrics_rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
}

/// The collector-backed reporter.
pub struct RpcReporter {
    event_tx: mpsc::Sender<Vec<u8>>,
    status_tx: mpsc::Sender<Vec<u8>>,
    span_tx: mpsc::Sender<HttpSpanSummary>,
    event_connection: Arc<Connection>,
    settings: Arc<SettingsStore>,
    registry: Arc<RateCounterRegistry>,
    tracing_mode: TracingMode,
    done: watch::Sender<bool>,
}

impl RpcReporter {
    /// Dials both collector connections and starts every loop.
    pub async fn start(config: AgentConfig) -> Result<RpcReporter, TransportError> {
        let dialer = Arc::new(HttpDialer::new(
            config.trusted_cert_pem.clone(),
            config.insecure_skip_verify,
        ));
        RpcReporter::start_with_dialer(config, dialer).await
    }

    pub(crate) async fn start_with_dialer(
        config: AgentConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Result<RpcReporter, TransportError> {
        // Resolve the identity once up front so every later task reads the
        // cached record.
        host_identity(config.hostname_alias.as_deref()).await;

        info!(
            service_key = %config.service_key,
            collector = %config.collector,
            "starting reporter"
        );
        let service_key = config.service_key.raw();

        let event_connection = Connection::connect(
            "events",
            &config.collector,
            service_key.clone(),
            Arc::clone(&dialer),
        )
        .await?;
        let metric_connection = Connection::connect(
            "metrics",
            &config.collector,
            service_key.clone(),
            dialer,
        )
        .await?;

        let registry = Arc::new(RateCounterRegistry::default());
        let measurements = Arc::new(MeasurementSet::new(config.histogram));
        let settings = Arc::new(SettingsStore::new(
            Arc::clone(&registry),
            Arc::clone(&measurements),
        ));

        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (span_tx, span_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (metrics_tx, metrics_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (done_tx, done_rx) = watch::channel(false);

        spawn_event_loops(
            Arc::clone(&event_connection),
            service_key.clone(),
            event_rx,
            done_rx.clone(),
        );
        tokio::spawn(status_sender(
            Arc::clone(&metric_connection),
            service_key.clone(),
            status_rx,
            done_rx.clone(),
        ));
        tokio::spawn(span_aggregator(
            Arc::clone(&measurements),
            span_rx,
            done_rx.clone(),
        ));

        let context = Arc::new(PeriodicContext {
            service_key,
            event_connection: Arc::clone(&event_connection),
            metric_connection,
            settings: Arc::clone(&settings),
            registry: Arc::clone(&registry),
            measurements,
            metrics_tx,
            metrics_rx: AsyncMutex::new(metrics_rx),
        });
        tokio::spawn(periodic_tasks(context, done_rx));

        Ok(RpcReporter {
            event_tx,
            status_tx,
            span_tx,
            event_connection,
            settings,
            registry,
            tracing_mode: config.tracing_mode,
            done: done_tx,
        })
    }
}

impl Reporter for RpcReporter {
    fn report_event(&self, message: Vec<u8>) -> Result<(), ReporterError> {
        match self.event_tx.try_send(message) {
            Ok(()) => {
                self.event_connection.stats.incr_total_events();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.event_connection.stats.incr_overflowed();
                Err(ReporterError::QueueFull("event"))
            }
            Err(TrySendError::Closed(_)) => Err(ReporterError::Closed),
        }
    }

    fn report_status(&self, message: Vec<u8>) -> Result<(), ReporterError> {
        match self.status_tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ReporterError::QueueFull("status")),
            Err(TrySendError::Closed(_)) => Err(ReporterError::Closed),
        }
    }

    fn report_span(&self, span: HttpSpanSummary) -> Result<(), ReporterError> {
        match self.span_tx.try_send(span) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ReporterError::QueueFull("span")),
            Err(TrySendError::Closed(_)) => Err(ReporterError::Closed),
        }
    }

    fn should_sample(&self, layer: &str, incoming_trace_id: Option<&str>) -> SampleDecision {
        let has_upstream = incoming_trace_id.is_some_and(|id| !id.is_empty());
        let remote_rate = self.settings.sample_value(layer);
        let roll = rand::thread_rng().gen_range(0..SAMPLE_RATE_SCALE);
        let decision = decide(self.tracing_mode, remote_rate, has_upstream, roll);

        let counter = self.registry.get_or_create(layer);
        let sampled = counter.count(decision.sampled, has_upstream);
        SampleDecision {
            sampled,
            ..decision
        }
    }

    fn is_open(&self) -> bool {
        true
    }

    fn shutdown(&self) {
        let _ = self.done.send(true);
    }
}

// ================================ Event handling ====================================

fn spawn_event_loops(
    connection: Arc<Connection>,
    service_key: String,
    event_rx: mpsc::Receiver<Vec<u8>>,
    done: watch::Receiver<bool>,
) {
    let (batch_tx, batch_rx) = mpsc::channel::<Vec<Vec<u8>>>(1);
    let (result_tx, result_rx) = mpsc::channel::<()>(1);
    tokio::spawn(event_batch_sender(
        connection,
        service_key,
        batch_rx,
        result_tx,
    ));
    tokio::spawn(event_sender(event_rx, batch_tx, result_rx, done));
}

/// Drains the event channel with a dual trigger: a completed batch or the
/// idle interval. New events arriving while a batch is in flight accumulate
/// for the next one.
async fn event_sender(
    mut events: mpsc::Receiver<Vec<u8>>,
    batches: mpsc::Sender<Vec<Vec<u8>>>,
    mut results: mpsc::Receiver<()>,
    mut done: watch::Receiver<bool>,
) {
    let mut pending: Vec<Vec<u8>> = Vec::new();
    let mut in_progress = false;

    loop {
        tokio::select! {
            _ = done.changed() => break,
            Some(message) = events.recv() => pending.push(message),
            Some(()) = results.recv() => {
                if pending.is_empty() {
                    in_progress = false;
                } else {
                    in_progress = true;
                    dispatch_batch(&mut pending, &batches).await;
                }
            }
            _ = sleep(EVENT_BATCH_IDLE) => {
                if !in_progress && !pending.is_empty() {
                    in_progress = true;
                    dispatch_batch(&mut pending, &batches).await;
                }
            }
        }
    }
}

async fn dispatch_batch(pending: &mut Vec<Vec<u8>>, batches: &mpsc::Sender<Vec<Vec<u8>>>) {
    let take = pending.len().min(EVENT_BATCH_MAX);
    let batch: Vec<Vec<u8>> = pending.drain(..take).collect();
    if batches.send(batch).await.is_err() {
        debug!("event batch sender stopped");
    }
}

/// Sends one batch at a time, retrying each until it is delivered or
/// abandoned, then signals readiness for the next.
async fn event_batch_sender(
    connection: Arc<Connection>,
    service_key: String,
    mut batches: mpsc::Receiver<Vec<Vec<u8>>>,
    results: mpsc::Sender<()>,
) {
    while let Some(messages) = batches.recv().await {
        connection.stats.record_queue_largest(messages.len());
        let identity = host_identity(None).await;
        let rpc = Rpc::PostEvents(MessageRequest {
            api_key: service_key.clone(),
            messages,
            encoding: Encoding::Bson,
            identity: HostId::from_identity(identity),
        });
        if let Err(err) = connection
            .invoke_with_retry(rpc, SenderId::PostEvents)
            .await
        {
            warn!(%err, "event batch abandoned");
        }
        if results.send(()).await.is_err() {
            break;
        }
    }
}

// ================================ Status handling ====================================

/// Forwards status messages as they arrive, draining the channel into one
/// batch per send.
async fn status_sender(
    connection: Arc<Connection>,
    service_key: String,
    mut status_rx: mpsc::Receiver<Vec<u8>>,
    mut done: watch::Receiver<bool>,
) {
    loop {
        let first = tokio::select! {
            _ = done.changed() => break,
            message = status_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let mut messages = vec![first];
        while let Ok(message) = status_rx.try_recv() {
            messages.push(message);
        }

        let identity = host_identity(None).await;
        let rpc = Rpc::PostStatus(MessageRequest {
            api_key: service_key.clone(),
            messages,
            encoding: Encoding::Bson,
            identity: HostId::from_identity(identity),
        });
        if let Err(err) = connection
            .invoke_with_retry(rpc, SenderId::PostStatus)
            .await
        {
            warn!(%err, "status batch abandoned");
        }
    }
}

// ================================ Span handling ====================================

async fn span_aggregator(
    measurements: Arc<MeasurementSet>,
    mut spans: mpsc::Receiver<HttpSpanSummary>,
    mut done: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = done.changed() => break,
            span = spans.recv() => match span {
                Some(span) => measurements.record_span(&span),
                None => break,
            },
        }
    }
}

// ================================ Periodic tasks ====================================

/// One loop drives every timer: metrics collection (aligned to the wall
/// clock), settings pulls, settings expiry checks and both keep-alive pings.
/// Each task is gated so a slow run is never overlapped by the next tick.
async fn periodic_tasks(context: Arc<PeriodicContext>, mut done: watch::Receiver<bool>) {
    let collect_ready = Arc::new(AtomicBool::new(true));
    let send_ready = Arc::new(AtomicBool::new(true));
    let settings_ready = Arc::new(AtomicBool::new(true));
    let timeout_check_ready = Arc::new(AtomicBool::new(true));
    let event_ping_ready = Arc::new(AtomicBool::new(true));
    let metric_ping_ready = Arc::new(AtomicBool::new(true));

    // First settings pull happens immediately; expiry checks start one
    // interval out.
    let mut settings_at = Instant::now();
    let mut timeout_check_at = Instant::now() + SETTINGS_TIMEOUT_CHECK_INTERVAL;

    loop {
        let flush_delay = next_flush_delay(context.settings.flush_interval_secs());

        tokio::select! {
            _ = done.changed() => break,
            _ = sleep(flush_delay) => {
                dispatch_gated(&collect_ready, {
                    let context = Arc::clone(&context);
                    let send_ready = Arc::clone(&send_ready);
                    move |done| async move {
                        collect_metrics(&context, &send_ready).await;
                        done.store(true, Ordering::SeqCst);
                    }
                });
            }
            _ = sleep_until(settings_at) => {
                settings_at = Instant::now() + GET_SETTINGS_INTERVAL;
                dispatch_gated(&settings_ready, {
                    let context = Arc::clone(&context);
                    move |done| async move {
                        get_settings(&context).await;
                        done.store(true, Ordering::SeqCst);
                    }
                });
            }
            _ = sleep_until(timeout_check_at) => {
                timeout_check_at = Instant::now() + SETTINGS_TIMEOUT_CHECK_INTERVAL;
                dispatch_gated(&timeout_check_ready, {
                    let context = Arc::clone(&context);
                    move |done| async move {
                        context.settings.check_expired();
                        done.store(true, Ordering::SeqCst);
                    }
                });
            }
            _ = sleep_until(context.event_connection.ping_deadline()) => {
                context.event_connection.reset_ping();
                dispatch_gated(&event_ping_ready, {
                    let connection = Arc::clone(&context.event_connection);
                    move |done| async move {
                        connection.ping().await;
                        done.store(true, Ordering::SeqCst);
                    }
                });
            }
            _ = sleep_until(context.metric_connection.ping_deadline()) => {
                context.metric_connection.reset_ping();
                dispatch_gated(&metric_ping_ready, {
                    let connection = Arc::clone(&context.metric_connection);
                    move |done| async move {
                        connection.ping().await;
                        done.store(true, Ordering::SeqCst);
                    }
                });
            }
        }
    }
}

/// Spawns a task only when the previous run has signalled completion through
/// the one-slot gate.
fn dispatch_gated<F, Fut>(gate: &Arc<AtomicBool>, task: F)
where
    F: FnOnce(Arc<AtomicBool>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    if gate.swap(false, Ordering::SeqCst) {
        tokio::spawn(task(Arc::clone(gate)));
    }
}

/// Delay until the next flush boundary, so flushes land on `0 mod interval`
/// of the wall clock.
fn next_flush_delay(interval_secs: u32) -> Duration {
    let interval = u64::from(interval_secs.max(1));
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Duration::from_secs(interval - (now_secs % interval))
}

/// Builds the flush document from the aggregator snapshot and queues it for
/// the metrics sender.
async fn collect_metrics(context: &Arc<PeriodicContext>, send_ready: &Arc<AtomicBool>) {
    let interval = context.settings.flush_interval_secs();
    let snapshot = context.measurements.snapshot_and_reset();
    let rate_counts = context.registry.flush();
    let stats = context.event_connection.stats.flush();
    let gauges = SystemGauges::collect();
    let identity = host_identity(None).await;

    let message = build_metrics_message(identity, interval, &snapshot, &rate_counts, &stats, &gauges);
    if context.metrics_tx.try_send(message).is_err() {
        debug!("metrics channel full, dropping flush document");
    }

    dispatch_gated(send_ready, {
        let context = Arc::clone(context);
        move |done| async move {
            send_metrics(&context).await;
            done.store(true, Ordering::SeqCst);
        }
    });
}

/// Drains the metrics channel into one batch and delivers it.
async fn send_metrics(context: &Arc<PeriodicContext>) {
    let mut messages = Vec::new();
    {
        let mut metrics_rx = context.metrics_rx.lock().await;
        while let Ok(message) = metrics_rx.try_recv() {
            messages.push(message);
        }
    }
    if messages.is_empty() {
        return;
    }

    let identity = host_identity(None).await;
    let rpc = Rpc::PostMetrics(MessageRequest {
        api_key: context.service_key.clone(),
        messages,
        encoding: Encoding::Json,
        identity: HostId::from_identity(identity),
    });
    if let Err(err) = context
        .metric_connection
        .invoke_with_retry(rpc, SenderId::PostMetrics)
        .await
    {
        warn!(%err, "metrics batch abandoned");
    }
}

/// Pulls fresh settings and applies them to the store.
async fn get_settings(context: &Arc<PeriodicContext>) {
    let identity = host_identity(None).await;
    let rpc = Rpc::GetSettings(SettingsRequest {
        api_key: context.service_key.clone(),
        client_version: CLIENT_VERSION.to_string(),
        identity: HostId::from_identity(identity),
    });

    match context
        .metric_connection
        .invoke_with_retry(rpc, SenderId::GetSettings)
        .await
    {
        Ok(response) => {
            if let Some(result) = response.into_settings() {
                debug!(settings = result.settings.len(), "got new settings");
                context.settings.apply(&result);
            }
        }
        Err(err) => warn!(%err, "settings pull abandoned"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceKey;
    use crate::rpc::{ResultCode, SettingType, SettingsResult, WireSetting};
    use crate::transport::testing::{Script, ScriptedDialer, Step};
    use std::collections::BTreeMap;

    fn test_config() -> AgentConfig {
        AgentConfig::new(ServiceKey::parse("1234567890abcdef:rust-test").unwrap())
    }

    async fn scripted_reporter(script: &Arc<Script>) -> RpcReporter {
        RpcReporter::start_with_dialer(
            test_config(),
            Arc::new(ScriptedDialer::new(Arc::clone(script))),
        )
        .await
        .unwrap()
    }

    fn span(url: &str) -> HttpSpanSummary {
        HttpSpanSummary {
            transaction: None,
            url: url.to_string(),
            method: "GET".to_string(),
            status: 200,
            duration: Duration::from_millis(8),
            has_error: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connection_init_is_the_first_traffic() {
        let script = Script::new();
        let reporter = scripted_reporter(&script).await;

        let calls = script.calls.lock().unwrap().clone();
        assert!(!calls.is_empty());
        assert_eq!(calls[0].name(), "PostStatus");
        reporter.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn events_are_batched_and_sent() {
        let script = Script::new();
        let reporter = scripted_reporter(&script).await;

        for i in 0..3u8 {
            reporter.report_event(vec![i]).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let batches = script.calls_named("PostEvents");
        assert!(!batches.is_empty());
        let total: usize = batches.iter().map(Rpc::message_len).sum();
        assert_eq!(total, 3);
        reporter.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn status_messages_are_forwarded() {
        let script = Script::new();
        let reporter = scripted_reporter(&script).await;

        reporter.report_status(b"status-doc".to_vec()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Two init messages (one per connection) plus the forwarded batch.
        let statuses = script.calls_named("PostStatus");
        assert!(statuses.len() >= 3);
        assert!(statuses.iter().any(|rpc| match rpc {
            Rpc::PostStatus(req) => req.messages.contains(&b"status-doc".to_vec()),
            _ => false,
        }));
        reporter.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn settings_drive_flush_interval_and_transaction_cap() {
        let script = Script::new();
        let mut arguments = BTreeMap::new();
        arguments.insert(
            "MetricsFlushInterval".to_string(),
            15u32.to_le_bytes().to_vec(),
        );
        arguments.insert("MaxTransactions".to_string(), 5u32.to_le_bytes().to_vec());
        script.push(
            "GetSettings",
            Step::Settings(SettingsResult {
                result: ResultCode::Ok,
                arg: String::new(),
                settings: vec![WireSetting {
                    setting_type: SettingType::DefaultSampleRate,
                    layer: String::new(),
                    flags: "SAMPLE_START".to_string(),
                    value: 1_000_000,
                    ttl: 600,
                    arguments,
                }],
            }),
        );
        let reporter = scripted_reporter(&script).await;

        // Let the immediate settings pull land, then feed spans past the cap.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 0..8 {
            reporter
                .report_span(span(&format!("http://example.com/endpoint{i}")))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(45)).await;

        let flushes = script.calls_named("PostMetrics");
        assert!(!flushes.is_empty());
        let Rpc::PostMetrics(request) = &flushes[0] else {
            panic!("expected PostMetrics");
        };
        let document: serde_json::Value =
            serde_json::from_slice(&request.messages[0]).unwrap();
        assert_eq!(document["MetricsFlushInterval"], 15);
        assert_eq!(document["TransactionNameOverflow"], true);

        let names: std::collections::HashSet<&str> = document["measurements"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|m| m["tags"]["TransactionName"].as_str())
            .collect();
        assert!(names.contains("other"));
        // Five admitted names plus the overflow bucket.
        assert_eq!(names.len(), 6);
        reporter.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_flush_reports_queue_stats() {
        let script = Script::new();
        let reporter = scripted_reporter(&script).await;

        reporter.report_event(vec![1]).unwrap();
        reporter.report_event(vec![2]).unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;

        let flushes = script.calls_named("PostMetrics");
        assert!(!flushes.is_empty());
        let Rpc::PostMetrics(request) = &flushes[0] else {
            panic!("expected PostMetrics");
        };
        let document: serde_json::Value =
            serde_json::from_slice(&request.messages[0]).unwrap();
        let measurements = document["measurements"].as_array().unwrap();
        let counter = |name: &str| {
            measurements
                .iter()
                .find(|m| m["name"] == name)
                .and_then(|m| m["count"].as_i64())
                .unwrap_or_else(|| panic!("missing {name}"))
        };
        assert_eq!(counter("TotalEvents"), 2);
        assert_eq!(counter("NumSent"), 2);
        assert_eq!(counter("NumOverflowed"), 0);
        reporter.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn full_event_queue_drops_without_blocking() {
        let script = Script::new();
        let dialer: Arc<dyn Dialer> = Arc::new(ScriptedDialer::new(Arc::clone(&script)));
        let event_connection = Connection::connect(
            "events",
            "collector.example.com:443",
            "token:svc".to_string(),
            Arc::clone(&dialer),
        )
        .await
        .unwrap();

        // A reporter with a tiny queue and no sender loops draining it.
        let (event_tx, _event_rx) = mpsc::channel(2);
        let (status_tx, _status_rx) = mpsc::channel(1);
        let (span_tx, _span_rx) = mpsc::channel(1);
        let (done, _) = watch::channel(false);
        let registry = Arc::new(RateCounterRegistry::default());
        let measurements = Arc::new(MeasurementSet::default());
        let reporter = RpcReporter {
            event_tx,
            status_tx,
            span_tx,
            event_connection: Arc::clone(&event_connection),
            settings: Arc::new(SettingsStore::new(
                Arc::clone(&registry),
                Arc::clone(&measurements),
            )),
            registry,
            tracing_mode: TracingMode::Always,
            done,
        };

        reporter.report_event(vec![1]).unwrap();
        reporter.report_event(vec![2]).unwrap();
        let err = reporter.report_event(vec![3]).unwrap_err();
        assert!(matches!(err, ReporterError::QueueFull("event")));

        let stats = event_connection.stats.flush();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.num_overflowed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_updates_the_layer_counters() {
        let script = Script::new();
        let reporter = scripted_reporter(&script).await;

        let mut admitted = 0;
        for _ in 0..10 {
            if reporter.should_sample("web", None).sampled {
                admitted += 1;
            }
        }
        // Default bucket capacity is 3; a same-instant burst cannot admit
        // more than that.
        assert!(admitted <= 3, "admitted={admitted}");

        let drained = reporter.registry.flush();
        let (layer, counts) = &drained[0];
        assert_eq!(layer, "web");
        assert_eq!(counts.requested, 10);
        assert_eq!(counts.sampled, 10);
        assert_eq!(counts.sampled, counts.traced + counts.limited);
        assert_eq!(counts.traced, admitted);
        reporter.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_context_counts_as_through() {
        let script = Script::new();
        let reporter = scripted_reporter(&script).await;

        reporter.should_sample("web", Some("upstream-trace-id"));
        reporter.should_sample("web", Some(""));
        reporter.should_sample("web", None);

        let drained = reporter.registry.flush();
        assert_eq!(drained[0].1.requested, 3);
        // Only the non-empty trace id counts as inherited context.
        assert_eq!(drained[0].1.through, 1);
        reporter.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn never_mode_samples_nothing_but_still_counts() {
        let script = Script::new();
        let mut config = test_config();
        config.tracing_mode = TracingMode::Never;
        let reporter = RpcReporter::start_with_dialer(
            config,
            Arc::new(ScriptedDialer::new(Arc::clone(&script))),
        )
        .await
        .unwrap();

        for _ in 0..5 {
            assert!(!reporter.should_sample("web", None).sampled);
        }
        let drained = reporter.registry.flush();
        assert_eq!(drained[0].1.requested, 5);
        assert_eq!(drained[0].1.sampled, 0);
        reporter.shutdown();
    }

    #[test]
    fn null_reporter_swallows_everything() {
        let reporter = NullReporter;
        assert!(reporter.report_event(vec![1]).is_ok());
        assert!(reporter.report_status(vec![1]).is_ok());
        assert!(!reporter.should_sample("web", None).sampled);
        assert!(!reporter.is_open());
        reporter.shutdown();
    }

    #[test]
    fn flush_delay_stays_within_the_interval() {
        for interval in [1u32, 15, 30, 60] {
            let delay = next_flush_delay(interval);
            assert!(delay <= Duration::from_secs(u64::from(interval)));
            assert!(delay > Duration::ZERO);
        }
        // A zero interval from a misbehaving collector is clamped.
        assert!(next_flush_delay(0) <= Duration::from_secs(1));
    }
}
