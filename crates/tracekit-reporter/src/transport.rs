//! The wire seam between connections and the network.
//!
//! A [`Transport`] is one managed client stub bound to one collector address;
//! a [`Dialer`] knows how to build a fresh stub for any address, which is what
//! reconnect and redirect do. Tests substitute scripted implementations.

use std::time::Duration;

use async_trait::async_trait;

use crate::rpc::{Rpc, RpcResponse};

/// Request timeout applied to every RPC.
const RPC_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("dial {address}: {message}")]
    Dial { address: String, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, rpc: &Rpc) -> Result<RpcResponse, TransportError>;
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// Builds HTTPS stubs verified against the configured CA bundle.
pub struct HttpDialer {
    cert_pem: Vec<u8>,
    insecure_skip_verify: bool,
}

impl HttpDialer {
    pub fn new(cert_pem: Vec<u8>, insecure_skip_verify: bool) -> HttpDialer {
        HttpDialer {
            cert_pem,
            insecure_skip_verify,
        }
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn dial(&self, address: &str) -> Result<Box<dyn Transport>, TransportError> {
        let certificate = reqwest::Certificate::from_pem(&self.cert_pem).map_err(|err| {
            TransportError::Dial {
                address: address.to_string(),
                message: format!("bad CA certificate: {err}"),
            }
        })?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(certificate)
            .danger_accept_invalid_certs(self.insecure_skip_verify)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(RPC_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Dial {
                address: address.to_string(),
                message: err.to_string(),
            })?;

        Ok(Box::new(HttpTransport {
            client,
            base: base_url(address),
        }))
    }
}

/// Normalizes a collector address into a base URL. A bare `host:port` gets
/// the `https://` prefix; addresses that already carry a scheme are kept.
fn base_url(address: &str) -> String {
    let trimmed = address.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

struct HttpTransport {
    client: reqwest::Client,
    base: String,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, rpc: &Rpc) -> Result<RpcResponse, TransportError> {
        let url = format!("{}/rpc/{}", self.base, rpc.path());
        let request = self.client.post(&url);
        let response = match rpc {
            Rpc::PostEvents(req) | Rpc::PostMetrics(req) | Rpc::PostStatus(req) => {
                request.json(req).send().await?
            }
            Rpc::GetSettings(req) => request.json(req).send().await?,
            Rpc::Ping(req) => request.json(req).send().await?,
        };
        let response = response.error_for_status()?;

        match rpc {
            Rpc::GetSettings(_) => Ok(RpcResponse::Settings(response.json().await?)),
            _ => Ok(RpcResponse::Message(response.json().await?)),
        }
    }
}
