//! Reporter configuration.
//!
//! Everything is sourced from environment variables; a missing or malformed
//! service key disables reporting (the caller installs a null reporter) and
//! never affects the host application.

use std::env;
use std::io;

use tracekit_metrics::HistogramConfig;

/// Default collector endpoint, overridable via `COLLECTOR`.
pub const DEFAULT_COLLECTOR: &str = "collector.example.com:443";

/// CA bundle used to verify the collector endpoint when `TRUSTED_PATH` is not
/// set.
pub const DEFAULT_CA_PEM: &str = "-----BEGIN CERTIFICATE-----
MIID8TCCAtmgAwIBAgIJAMoDz7Npas2/MA0GCSqGSIb3DQEBCwUAMIGOMQswCQYD
VQQGEwJVUzETMBEGA1UECAwKQ2FsaWZvcm5pYTEWMBQGA1UEBwwNU2FuIEZyYW5j
aXNjbzEVMBMGA1UECgwMTGlicmF0byBJbmMuMRUwEwYDVQQDDAxBcHBPcHRpY3Mg
Q0ExJDAiBgkqhkiG9w0BCQEWFXN1cHBvcnRAYXBwb3B0aWNzLmNvbTAeFw0xNzA5
MTUyMjAxMzlaFw0yNzA5MTMyMjAxMzlaMIGOMQswCQYDVQQGEwJVUzETMBEGA1UE
CAwKQ2FsaWZvcm5pYTEWMBQGA1UEBwwNU2FuIEZyYW5jaXNjbzEVMBMGA1UECgwM
TGlicmF0byBJbmMuMRUwEwYDVQQDDAxBcHBPcHRpY3MgQ0ExJDAiBgkqhkiG9w0B
CQEWFXN1cHBvcnRAYXBwb3B0aWNzLmNvbTCCASIwDQYJKoZIhvcNAQEBBQADggEP
ADCCAQoCggEBAOxO0wsGba3iI4r3L5BMST0rAO/gGaUhpQre6nRwVTmPCnLw1bmn
GdiFgYv/oRRwU+VieumHSQqoOmyFrg+ajGmvUDp2WqQ0It+XhcbaHFiAp2H7+mLf
cUH6S43/em0WUxZHeRzRupRDyO1bX6Hh2jgxykivlFrn5HCIQD5Hx1/SaZoW9v2n
oATCbgFOiPW6kU/AVs4R0VBujon13HCehVelNKkazrAEBT1i6RvdOB6aQQ32seW+
gLV5yVWSPEJvA9ZJqad/nQ8EQUMSSlVN191WOjp4bGpkJE1svs7NmM+Oja50W56l
qOH5eWermr/8qWjdPlDJ+I0VkgN0UyHVuRECAwEAAaNQME4wHQYDVR0OBBYEFOuL
KDTFhRQXwlBRxhPqhukrNYeRMB8GA1UdIwQYMBaAFOuLKDTFhRQXwlBRxhPqhukr
NYeRMAwGA1UdEwQFMAMBAf8wDQYJKoZIhvcNAQELBQADggEBAJQtH446NZhjusy6
iCyvmnD95ybfNPDpjHmNx5n9Y6w9n+9y1o3732HUJE+WjvbLS3h1o7wujGKMcRJn
7I7eTDd26ZhLvnh5/AitYjdxrtUkQDgyxwLFJKhZu0ik2vXqj0fL961/quJL8Gyp
hNj3Nf7WMohQMSohEmCCX2sHyZGVGYmQHs5omAtkH/NNySqmsWNcpgd3M0aPDRBZ
5VFreOSGKBTJnoLNqods/S9RV0by84hm3j6aQ/tMDIVE9VCJtrE6evzC0MWyVFwR
ftgwcxyEq5SkiR+6BCwdzAMqADV37TzXDHLjwSrMIrgLV5xZM20Kk6chxI5QAr/f
7tsqAxw=
-----END CERTIFICATE-----";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing service key")]
    MissingServiceKey,

    #[error("invalid service key")]
    InvalidServiceKey,

    #[error("cannot read certificate {path}: {source}")]
    CertRead { path: String, source: io::Error },
}

/// Collector credential: `<token>:<service-name>`.
///
/// Well-formed iff the raw value contains exactly one `:` with both halves
/// non-empty. Logging always goes through [`ServiceKey::masked`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceKey {
    token: String,
    service_name: String,
}

impl ServiceKey {
    pub fn parse(raw: &str) -> Result<ServiceKey, ConfigError> {
        let mut halves = raw.split(':');
        match (halves.next(), halves.next(), halves.next()) {
            (Some(token), Some(service_name), None)
                if !token.is_empty() && !service_name.is_empty() =>
            {
                Ok(ServiceKey {
                    token: token.to_string(),
                    service_name: service_name.to_string(),
                })
            }
            _ => Err(ConfigError::InvalidServiceKey),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The full credential as sent on the wire.
    pub fn raw(&self) -> String {
        format!("{}:{}", self.token, self.service_name)
    }

    /// Masked form safe for logs: only the first and last four characters of
    /// the token survive. Short tokens are left unchanged.
    pub fn masked(&self) -> String {
        if self.token.len() <= 8 {
            return self.raw();
        }
        let head = &self.token[..4];
        let tail = &self.token[self.token.len() - 4..];
        let stars = "*".repeat(self.token.len() - 8);
        format!("{head}{stars}{tail}:{}", self.service_name)
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Per-layer tracing mode from `TRACING_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TracingMode {
    #[default]
    Always,
    /// Only sample requests that arrive with upstream trace context.
    Through,
    Never,
}

impl TracingMode {
    fn from_env_value(value: &str) -> TracingMode {
        match value.to_ascii_lowercase().as_str() {
            "through" => TracingMode::Through,
            "never" => TracingMode::Never,
            _ => TracingMode::Always,
        }
    }
}

/// Fully resolved reporter configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub service_key: ServiceKey,
    /// Collector endpoint, `host:port` or a full URL.
    pub collector: String,
    /// PEM bundle used to verify the collector.
    pub trusted_cert_pem: Vec<u8>,
    pub insecure_skip_verify: bool,
    pub hostname_alias: Option<String>,
    pub tracing_mode: TracingMode,
    pub histogram: HistogramConfig,
}

impl AgentConfig {
    /// Builds a configuration with defaults for everything but the key.
    pub fn new(service_key: ServiceKey) -> AgentConfig {
        AgentConfig {
            service_key,
            collector: DEFAULT_COLLECTOR.to_string(),
            trusted_cert_pem: DEFAULT_CA_PEM.as_bytes().to_vec(),
            insecure_skip_verify: false,
            hostname_alias: None,
            tracing_mode: TracingMode::default(),
            histogram: HistogramConfig::default(),
        }
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<AgentConfig, ConfigError> {
        let raw_key = env::var("SERVICE_KEY").unwrap_or_default();
        if raw_key.is_empty() {
            return Err(ConfigError::MissingServiceKey);
        }
        let service_key = ServiceKey::parse(&raw_key)?;

        let mut config = AgentConfig::new(service_key);

        if let Ok(collector) = env::var("COLLECTOR") {
            if !collector.trim().is_empty() {
                config.collector = collector.trim().to_string();
            }
        }

        if let Ok(path) = env::var("TRUSTED_PATH") {
            if !path.is_empty() {
                config.trusted_cert_pem =
                    std::fs::read(&path).map_err(|source| ConfigError::CertRead { path, source })?;
            }
        }

        if let Ok(skip) = env::var("INSECURE_SKIP_VERIFY") {
            config.insecure_skip_verify =
                matches!(skip.to_ascii_lowercase().as_str(), "true" | "1" | "yes");
        }

        config.hostname_alias = env::var("HOSTNAME_ALIAS").ok().filter(|s| !s.is_empty());

        if let Ok(mode) = env::var("TRACING_MODE") {
            config.tracing_mode = TracingMode::from_env_value(&mode);
        }

        Ok(config)
    }
}
