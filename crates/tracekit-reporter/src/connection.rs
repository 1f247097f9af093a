//! One logical collector connection.
//!
//! Senders share the stub behind a read/write lock; reconnect and redirect
//! take the write side. At most one sender ever drives a reconnect: ownership
//! is a compare-and-set on an atomic token, and everyone else parks until the
//! owner finishes.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tracekit_metrics::{connection_init_document, host_identity, ReporterStats};

use crate::rpc::{Encoding, HostId, MessageRequest, PingRequest, ResultCode, Rpc, RpcResponse};
use crate::transport::{Dialer, Transport, TransportError};

pub(crate) const RETRY_DELAY_INITIAL: Duration = Duration::from_millis(500);
const RETRY_DELAY_MULTIPLIER: f64 = 1.5;
const RETRY_DELAY_MAX: Duration = Duration::from_secs(60);
/// Redirects tolerated for one in-flight batch before it is abandoned.
pub(crate) const REDIRECT_MAX: u32 = 20;
/// Consecutive INVALID_API_KEY responses tolerated before a batch is
/// abandoned.
pub(crate) const INVALID_KEY_MAX: u32 = 10;
/// Keep-alive cadence; any successful RPC pushes the deadline out.
pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(20);

const OWNER_UNSET: u8 = 0;
/// How long non-owners sleep between checks while a reconnect is in flight.
const OWNER_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Identifies the sender loop driving a reconnect on a shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SenderId {
    PostEvents = 1,
    PostStatus = 2,
    PostMetrics = 3,
    GetSettings = 4,
}

/// Terminal failures of a batch send; everything else retries internally.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SendError {
    #[error("max redirects of {REDIRECT_MAX} exceeded, batch abandoned")]
    RedirectLimit,

    #[error("collector rejected the api key {0} times, batch abandoned")]
    InvalidKeyLimit(u32),

    #[error(transparent)]
    Transport(TransportError),
}

/// Atomic per-connection queue counters, drained into each metrics document.
#[derive(Debug, Default)]
pub(crate) struct QueueStats {
    num_sent: std::sync::atomic::AtomicI64,
    num_overflowed: std::sync::atomic::AtomicI64,
    num_failed: std::sync::atomic::AtomicI64,
    total_events: std::sync::atomic::AtomicI64,
    queue_largest: std::sync::atomic::AtomicI64,
}

impl QueueStats {
    pub(crate) fn add_sent(&self, n: i64) {
        self.num_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_failed(&self, n: i64) {
        self.num_failed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr_overflowed(&self) {
        self.num_overflowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_total_events(&self) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Tracks the largest batch observed during the flush period.
    pub(crate) fn record_queue_largest(&self, len: usize) {
        self.queue_largest
            .fetch_max(len as i64, Ordering::Relaxed);
    }

    /// Swaps every counter back to zero and returns the drained values.
    pub(crate) fn flush(&self) -> ReporterStats {
        ReporterStats {
            num_sent: self.num_sent.swap(0, Ordering::Relaxed),
            num_overflowed: self.num_overflowed.swap(0, Ordering::Relaxed),
            num_failed: self.num_failed.swap(0, Ordering::Relaxed),
            total_events: self.total_events.swap(0, Ordering::Relaxed),
            queue_largest: self.queue_largest.swap(0, Ordering::Relaxed),
        }
    }
}

struct ConnState {
    transport: Box<dyn Transport>,
    address: String,
}

pub(crate) struct Connection {
    name: &'static str,
    service_key: String,
    dialer: Arc<dyn Dialer>,
    state: RwLock<ConnState>,
    owner: AtomicU8,
    ping_deadline: StdMutex<Instant>,
    pub(crate) stats: QueueStats,
}

impl Connection {
    /// Dials the collector and announces the connection with an init message.
    pub(crate) async fn connect(
        name: &'static str,
        address: &str,
        service_key: String,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Arc<Connection>, TransportError> {
        let transport = dialer.dial(address).await?;
        let connection = Arc::new(Connection {
            name,
            service_key,
            dialer,
            state: RwLock::new(ConnState {
                transport,
                address: address.to_string(),
            }),
            owner: AtomicU8::new(OWNER_UNSET),
            ping_deadline: StdMutex::new(Instant::now() + PING_INTERVAL),
            stats: QueueStats::default(),
        });
        connection.send_connection_init().await;
        Ok(connection)
    }

    /// Invokes one RPC through the shared stub and rearms the keep-alive.
    async fn invoke(&self, rpc: &Rpc) -> Result<RpcResponse, TransportError> {
        let result = {
            let state = self.state.read().await;
            state.transport.call(rpc).await
        };
        // We sent something, or at least tried to; the connection is not idle.
        self.reset_ping();
        result
    }

    /// Sends one batch, retrying until the collector accepts it or the batch
    /// has to be abandoned (redirect or invalid-key limits). Transport errors
    /// trigger the reconnect protocol; server-advised backpressure only backs
    /// off.
    pub(crate) async fn invoke_with_retry(
        &self,
        rpc: Rpc,
        sender: SenderId,
    ) -> Result<RpcResponse, SendError> {
        let mut delay = RETRY_DELAY_INITIAL;
        let mut redirects = 0u32;
        let mut invalid_key_rejections = 0u32;
        // Only the event stream feeds the queue-stat counters.
        let accounted = matches!(rpc, Rpc::PostEvents(_));
        let message_len = rpc.message_len() as i64;

        loop {
            match self.invoke(&rpc).await {
                Err(err) => {
                    warn!(connection = self.name, method = rpc.name(), %err, "rpc failed");
                    if !rpc.retry_on_err() {
                        return Err(SendError::Transport(err));
                    }
                    self.reconnect(sender).await;
                }
                Ok(response) => match response.result() {
                    ResultCode::Ok => {
                        debug!(
                            connection = self.name,
                            method = rpc.name(),
                            messages = message_len,
                            "rpc ok"
                        );
                        self.owner.store(OWNER_UNSET, Ordering::Release);
                        if accounted {
                            self.stats.add_sent(message_len);
                        }
                        return Ok(response);
                    }
                    ResultCode::TryLater => {
                        debug!(connection = self.name, method = rpc.name(), "collector says try later");
                        if accounted {
                            self.stats.add_failed(message_len);
                        }
                    }
                    ResultCode::LimitExceeded => {
                        debug!(connection = self.name, method = rpc.name(), "collector says limit exceeded");
                        if accounted {
                            self.stats.add_failed(message_len);
                        }
                    }
                    ResultCode::InvalidApiKey => {
                        invalid_key_rejections += 1;
                        warn!(
                            connection = self.name,
                            method = rpc.name(),
                            rejections = invalid_key_rejections,
                            "collector rejected the api key"
                        );
                        if invalid_key_rejections >= INVALID_KEY_MAX {
                            error!(
                                connection = self.name,
                                method = rpc.name(),
                                "api key rejected {INVALID_KEY_MAX} times, abandoning batch"
                            );
                            if accounted {
                                self.stats.add_failed(message_len);
                            }
                            self.release_ownership(sender);
                            return Err(SendError::InvalidKeyLimit(invalid_key_rejections));
                        }
                    }
                    ResultCode::Redirect => {
                        if redirects >= REDIRECT_MAX {
                            error!(
                                connection = self.name,
                                "max redirects of {REDIRECT_MAX} exceeded, abandoning batch"
                            );
                            if accounted {
                                self.stats.add_failed(message_len);
                            }
                            self.release_ownership(sender);
                            return Err(SendError::RedirectLimit);
                        }
                        self.redirect(sender, response.arg()).await;
                        // A proper redirect is not a failure, so start the
                        // backoff over.
                        delay = RETRY_DELAY_INITIAL;
                        redirects += 1;
                    }
                },
            }

            tokio::time::sleep(delay).await;
            delay = next_delay(delay);
        }
    }

    /// Restores a lost connection. Ownership is claimed with a single
    /// compare-and-set; the owner rebuilds the stub against the current
    /// address while everyone else waits for the token to clear.
    pub(crate) async fn reconnect(&self, sender: SenderId) {
        let _ = self.owner.compare_exchange(
            OWNER_UNSET,
            sender as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        if self.owner.load(Ordering::Acquire) == sender as u8 {
            info!(connection = self.name, "lost connection, attempting reconnect");
            {
                let mut state = self.state.write().await;
                match self.dialer.dial(&state.address).await {
                    Ok(transport) => state.transport = transport,
                    Err(err) => {
                        warn!(connection = self.name, address = %state.address, %err, "reconnect dial failed");
                        return;
                    }
                }
            }
            self.send_connection_init().await;
        } else {
            // Someone else is already rebuilding the stub; wait it out.
            while self.owner.load(Ordering::Acquire) != OWNER_UNSET {
                tokio::time::sleep(OWNER_WAIT_INTERVAL).await;
            }
        }
    }

    /// Follows a collector-issued redirect: swap the address, then run the
    /// normal reconnect protocol against it.
    async fn redirect(&self, sender: SenderId, address: &str) {
        if address.is_empty() {
            warn!(connection = self.name, "redirect without a target address, ignoring");
            return;
        }
        info!(connection = self.name, target = address, "redirecting to new collector address");
        {
            let mut state = self.state.write().await;
            state.address = address.to_string();
        }
        self.reconnect(sender).await;
    }

    fn release_ownership(&self, sender: SenderId) {
        let _ = self.owner.compare_exchange(
            sender as u8,
            OWNER_UNSET,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Announces the agent's identity; sent after every successful
    /// (re)connect before any other traffic.
    pub(crate) async fn send_connection_init(&self) {
        let identity = host_identity(None).await;
        let document = connection_init_document(identity);
        let message = serde_json::to_vec(&document).unwrap_or_default();
        let rpc = Rpc::PostStatus(MessageRequest {
            api_key: self.service_key.clone(),
            messages: vec![message],
            encoding: Encoding::Json,
            identity: HostId::from_identity(identity),
        });

        match self.invoke(&rpc).await {
            Ok(response) if response.result() == ResultCode::Ok => {
                debug!(connection = self.name, "connection init sent");
            }
            Ok(response) => {
                debug!(connection = self.name, result = ?response.result(), "connection init not accepted");
            }
            Err(err) => {
                debug!(connection = self.name, %err, "connection init failed");
            }
        }
    }

    /// Fire-and-forget keep-alive; never retried.
    pub(crate) async fn ping(&self) {
        let rpc = Rpc::Ping(PingRequest {
            api_key: self.service_key.clone(),
        });
        if let Err(err) = self.invoke(&rpc).await {
            debug!(connection = self.name, %err, "ping failed");
        }
    }

    pub(crate) fn reset_ping(&self) {
        let mut deadline = self.ping_deadline.lock().unwrap_or_else(|e| e.into_inner());
        *deadline = Instant::now() + PING_INTERVAL;
    }

    pub(crate) fn ping_deadline(&self) -> Instant {
        *self.ping_deadline.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn next_delay(delay: Duration) -> Duration {
    delay.mul_f64(RETRY_DELAY_MULTIPLIER).min(RETRY_DELAY_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{Script, ScriptedDialer, Step};

    fn event_batch(n: usize) -> Rpc {
        Rpc::PostEvents(MessageRequest {
            api_key: "token:svc".to_string(),
            messages: (0..n).map(|i| vec![i as u8]).collect(),
            encoding: Encoding::Bson,
            identity: HostId {
                hostname: "test".to_string(),
                ip_addresses: Vec::new(),
            },
        })
    }

    async fn scripted_connection(script: &Arc<Script>) -> Arc<Connection> {
        Connection::connect(
            "events",
            "collector.example.com:443",
            "token:svc".to_string(),
            Arc::new(ScriptedDialer::new(Arc::clone(script))),
        )
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_to_a_ceiling() {
        let mut delay = RETRY_DELAY_INITIAL;
        for _ in 0..20 {
            delay = next_delay(delay);
        }
        assert_eq!(delay, RETRY_DELAY_MAX);
        assert_eq!(
            next_delay(RETRY_DELAY_INITIAL),
            Duration::from_millis(750)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_triggers_one_reconnect() {
        let script = Script::new();
        script.push("PostEvents", Step::Fail("connection reset"));
        let connection = scripted_connection(&script).await;
        assert_eq!(script.dial_count(), 1);

        let response = connection
            .invoke_with_retry(event_batch(3), SenderId::PostEvents)
            .await
            .unwrap();
        assert_eq!(response.result(), ResultCode::Ok);

        // One rebuild of the stub, then the retry went through.
        assert_eq!(script.dial_count(), 2);
        assert_eq!(script.calls_named("PostEvents").len(), 2);
        // The init message was replayed on the rebuilt stub.
        assert_eq!(script.calls_named("PostStatus").len(), 2);
        assert_eq!(connection.owner.load(Ordering::Acquire), OWNER_UNSET);
        assert_eq!(connection.stats.flush().num_sent, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn server_backpressure_retries_without_reconnect() {
        let script = Script::new();
        script.push("PostEvents", Step::Respond(ResultCode::TryLater, String::new()));
        script.push(
            "PostEvents",
            Step::Respond(ResultCode::LimitExceeded, String::new()),
        );
        let connection = scripted_connection(&script).await;

        connection
            .invoke_with_retry(event_batch(2), SenderId::PostEvents)
            .await
            .unwrap();

        assert_eq!(script.dial_count(), 1);
        assert_eq!(script.calls_named("PostEvents").len(), 3);
        let stats = connection.stats.flush();
        assert_eq!(stats.num_sent, 2);
        assert_eq!(stats.num_failed, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn redirect_switches_address_and_resets_backoff() {
        let script = Script::new();
        script.push(
            "PostEvents",
            Step::Respond(ResultCode::Redirect, "alt.example.com:443".to_string()),
        );
        let connection = scripted_connection(&script).await;

        connection
            .invoke_with_retry(event_batch(1), SenderId::PostEvents)
            .await
            .unwrap();

        assert_eq!(
            connection.state.read().await.address,
            "alt.example.com:443"
        );
        // Initial dial plus the redirect's fresh channel.
        assert_eq!(script.dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn redirect_cap_abandons_the_batch() {
        let script = Script::new();
        for _ in 0..=REDIRECT_MAX {
            script.push(
                "PostEvents",
                Step::Respond(ResultCode::Redirect, "alt.example.com:443".to_string()),
            );
        }
        let connection = scripted_connection(&script).await;

        let err = connection
            .invoke_with_retry(event_batch(4), SenderId::PostEvents)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::RedirectLimit));

        // One initial attempt plus twenty redirect follow-ups.
        assert_eq!(script.calls_named("PostEvents").len(), 21);
        assert_eq!(connection.stats.flush().num_failed, 4);
        assert_eq!(connection.owner.load(Ordering::Acquire), OWNER_UNSET);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_api_key_is_bounded() {
        let script = Script::new();
        for _ in 0..INVALID_KEY_MAX {
            script.push(
                "PostEvents",
                Step::Respond(ResultCode::InvalidApiKey, String::new()),
            );
        }
        let connection = scripted_connection(&script).await;

        let err = connection
            .invoke_with_retry(event_batch(1), SenderId::PostEvents)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::InvalidKeyLimit(n) if n == INVALID_KEY_MAX));
        assert_eq!(
            script.calls_named("PostEvents").len(),
            INVALID_KEY_MAX as usize
        );
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_sender_rebuilds_the_stub() {
        let script = Script::new();
        script.push("PostMetrics", Step::Fail("connection reset"));
        script.push("GetSettings", Step::Fail("connection reset"));
        let connection = scripted_connection(&script).await;

        let metrics_conn = Arc::clone(&connection);
        let metrics_task = tokio::spawn(async move {
            metrics_conn
                .invoke_with_retry(
                    Rpc::PostMetrics(MessageRequest {
                        api_key: "token:svc".to_string(),
                        messages: vec![vec![1]],
                        encoding: Encoding::Json,
                        identity: HostId {
                            hostname: "test".to_string(),
                            ip_addresses: Vec::new(),
                        },
                    }),
                    SenderId::PostMetrics,
                )
                .await
        });
        let settings_conn = Arc::clone(&connection);
        let settings_task = tokio::spawn(async move {
            settings_conn
                .invoke_with_retry(
                    Rpc::GetSettings(crate::rpc::SettingsRequest {
                        api_key: "token:svc".to_string(),
                        client_version: "rust-test".to_string(),
                        identity: HostId {
                            hostname: "test".to_string(),
                            ip_addresses: Vec::new(),
                        },
                    }),
                    SenderId::GetSettings,
                )
                .await
        });

        metrics_task.await.unwrap().unwrap();
        settings_task.await.unwrap().unwrap();

        // Both senders hit a transport error, but only one of them may have
        // redialed; the other waited for the ownership token to clear.
        assert_eq!(script.dial_count(), 2);
        assert_eq!(connection.owner.load(Ordering::Acquire), OWNER_UNSET);
    }
}
