//! RPC request and response shapes for the collector protocol.
//!
//! The five collector methods form a closed set, modeled as the [`Rpc`] enum
//! so the connection layer dispatches every call through one function instead
//! of one retry loop per method. Pre-encoded message payloads travel base64
//! inside the JSON envelope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracekit_metrics::HostIdentity;

/// Result codes returned by every collector method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Ok,
    TryLater,
    LimitExceeded,
    InvalidApiKey,
    Redirect,
}

/// Payload encoding advertised with each message batch. Event buffers arrive
/// from the span layer already BSON-encoded; documents built by the reporter
/// itself are JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Bson,
    Json,
}

/// Identity summary attached to outbound requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostId {
    pub hostname: String,
    pub ip_addresses: Vec<String>,
}

impl HostId {
    pub fn from_identity(identity: &HostIdentity) -> HostId {
        HostId {
            hostname: identity.hostname.clone(),
            ip_addresses: identity.ip_addresses.clone(),
        }
    }
}

/// Batch request shared by `post_events`, `post_metrics` and `post_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRequest {
    pub api_key: String,
    #[serde(with = "base64_messages")]
    pub messages: Vec<Vec<u8>>,
    pub encoding: Encoding,
    pub identity: HostId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsRequest {
    pub api_key: String,
    pub client_version: String,
    pub identity: HostId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub api_key: String,
}

/// Envelope returned by the three post methods and `ping`. `arg` carries the
/// new address on `REDIRECT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResult {
    pub result: ResultCode,
    #[serde(default)]
    pub arg: String,
}

/// Type tag of a collector-issued setting. Unknown tags decode to
/// [`SettingType::Unknown`] so a newer collector cannot break the pull loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SettingType {
    DefaultSampleRate,
    LayerSampleRate,
    Unknown,
}

impl From<String> for SettingType {
    fn from(value: String) -> SettingType {
        match value.as_str() {
            "DEFAULT_SAMPLE_RATE" => SettingType::DefaultSampleRate,
            "LAYER_SAMPLE_RATE" => SettingType::LayerSampleRate,
            _ => SettingType::Unknown,
        }
    }
}

impl From<SettingType> for String {
    fn from(value: SettingType) -> String {
        match value {
            SettingType::DefaultSampleRate => "DEFAULT_SAMPLE_RATE",
            SettingType::LayerSampleRate => "LAYER_SAMPLE_RATE",
            SettingType::Unknown => "UNKNOWN",
        }
        .to_string()
    }
}

/// One sampling setting as it appears on the wire. Argument values are raw
/// little-endian bytes, base64 in the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireSetting {
    #[serde(rename = "type")]
    pub setting_type: SettingType,
    #[serde(default)]
    pub layer: String,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub value: i64,
    /// Lifetime of the setting in seconds.
    pub ttl: i64,
    #[serde(default, with = "base64_arguments")]
    pub arguments: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsResult {
    pub result: ResultCode,
    #[serde(default)]
    pub arg: String,
    #[serde(default)]
    pub settings: Vec<WireSetting>,
}

/// One collector RPC, carrying its request payload.
#[derive(Debug, Clone)]
pub enum Rpc {
    PostEvents(MessageRequest),
    PostMetrics(MessageRequest),
    PostStatus(MessageRequest),
    GetSettings(SettingsRequest),
    Ping(PingRequest),
}

impl Rpc {
    /// Wire path of the method below `/rpc/`.
    pub fn path(&self) -> &'static str {
        match self {
            Rpc::PostEvents(_) => "post_events",
            Rpc::PostMetrics(_) => "post_metrics",
            Rpc::PostStatus(_) => "post_status",
            Rpc::GetSettings(_) => "get_settings",
            Rpc::Ping(_) => "ping",
        }
    }

    /// Human-readable method name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Rpc::PostEvents(_) => "PostEvents",
            Rpc::PostMetrics(_) => "PostMetrics",
            Rpc::PostStatus(_) => "PostStatus",
            Rpc::GetSettings(_) => "GetSettings",
            Rpc::Ping(_) => "Ping",
        }
    }

    /// Number of payload messages carried by the request.
    pub fn message_len(&self) -> usize {
        match self {
            Rpc::PostEvents(req) | Rpc::PostMetrics(req) | Rpc::PostStatus(req) => {
                req.messages.len()
            }
            Rpc::GetSettings(_) | Rpc::Ping(_) => 0,
        }
    }

    /// Whether a transport failure is worth a reconnect-and-retry cycle.
    /// Keep-alive pings are fire-and-forget.
    pub fn retry_on_err(&self) -> bool {
        !matches!(self, Rpc::Ping(_))
    }
}

/// Decoded response for one RPC.
#[derive(Debug, Clone)]
pub enum RpcResponse {
    Message(MessageResult),
    Settings(SettingsResult),
}

impl RpcResponse {
    pub fn result(&self) -> ResultCode {
        match self {
            RpcResponse::Message(r) => r.result,
            RpcResponse::Settings(r) => r.result,
        }
    }

    pub fn arg(&self) -> &str {
        match self {
            RpcResponse::Message(r) => &r.arg,
            RpcResponse::Settings(r) => &r.arg,
        }
    }

    pub fn into_settings(self) -> Option<SettingsResult> {
        match self {
            RpcResponse::Settings(r) => Some(r),
            RpcResponse::Message(_) => None,
        }
    }
}

mod base64_messages {
    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(messages: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = messages.iter().map(|m| BASE64.encode(m)).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .iter()
            .map(|m| BASE64.decode(m.as_bytes()).map_err(serde::de::Error::custom))
            .collect()
    }
}

mod base64_arguments {
    use std::collections::BTreeMap;

    use data_encoding::BASE64;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        arguments: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&str, String> = arguments
            .iter()
            .map(|(name, bytes)| (name.as_str(), BASE64.encode(bytes)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, value)| {
                BASE64
                    .decode(value.as_bytes())
                    .map(|bytes| (name, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
