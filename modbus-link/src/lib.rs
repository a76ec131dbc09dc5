use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// The single error every gateway call can fail with. Transport failures,
/// non-2xx replies and body-decode failures are all collapsed into a
/// human-readable message; for non-2xx replies the message is taken from a
/// JSON `{message}` error body when the gateway sent one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RequestError {
    pub message: String,
}

impl RequestError {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(error: reqwest::Error) -> Self {
        Self::new(error.to_string())
    }
}

type Result<T> = std::result::Result<T, RequestError>;

/// Client for the link gateway's HTTP API. Every endpoint goes through the
/// one [`Client::call`] chokepoint so error normalization is uniform.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base: Url,
}

impl Client {
    pub fn new(base: Url) -> Self {
        Client {
            http: reqwest::Client::new(),
            base,
        }
    }

    pub async fn status(&self) -> Result<Option<ConnectionStatus>> {
        self.call(self.get("/api/status")).await
    }

    pub async fn connect(&self, request: &ConnectRequest) -> Result<ActionReply> {
        self.call(self.post("/api/connect").json(request))
            .await?
            .ok_or_else(empty_reply)
    }

    pub async fn disconnect(&self) -> Result<ActionReply> {
        self.call(self.post("/api/disconnect"))
            .await?
            .ok_or_else(empty_reply)
    }

    pub async fn update_params(&self, start_addr: u16, count: u16) -> Result<ActionReply> {
        #[derive(Serialize)]
        struct Params {
            start_addr: u16,
            count: u16,
        }
        self.call(
            self.post("/api/update_params")
                .json(&Params { start_addr, count }),
        )
        .await?
        .ok_or_else(empty_reply)
    }

    pub async fn read_now(&self) -> Result<ActionReply> {
        self.call(self.post("/api/readnow"))
            .await?
            .ok_or_else(empty_reply)
    }

    pub async fn registers(&self, format: DisplayFormat) -> Result<Option<RegisterData>> {
        self.call(
            self.get("/api/registers")
                .query(&[("format", format.as_str())]),
        )
        .await
    }

    pub async fn debug_log(&self) -> Result<Option<DebugLog>> {
        self.call(self.get("/api/debuglog")).await
    }

    async fn call<T>(&self, request: reqwest::RequestBuilder) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            // Prefer the gateway's own {message} body over the status line.
            let fallback = format!(
                "Error {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("request failed")
            );
            let message = match response.json::<ErrorReply>().await {
                Ok(ErrorReply {
                    message: Some(message),
                }) if !message.is_empty() => message,
                _ => fallback,
            };
            return Err(RequestError { message });
        }

        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }

        Ok(Some(response.json::<T>().await?))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        debug!(path, "GET");
        self.http.get(self.url(path))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        debug!(path, "POST");
        self.http.post(self.url(path))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base.as_str().trim_end_matches('/'), path)
    }
}

fn empty_reply() -> RequestError {
    RequestError::new("Empty reply from gateway")
}

#[derive(Deserialize)]
struct ErrorReply {
    #[serde(default)]
    message: Option<String>,
}

/// Transport mode of the device link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Tcp,
    Rtu,
}

impl Mode {
    pub fn default_port(self) -> u16 {
        match self {
            Mode::Tcp => 502,
            Mode::Rtu => 2300,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Mode::Tcp => "TCP",
            Mode::Rtu => "RTU",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Tcp => "tcp",
            Mode::Rtu => "rtu",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Mode::Tcp),
            "rtu" => Ok(Mode::Rtu),
            other => Err(format!("unknown mode '{other}' (expected tcp or rtu)")),
        }
    }
}

/// How register values are rendered by the gateway.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayFormat {
    #[default]
    Dec,
    Hex,
    Bin,
}

impl DisplayFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DisplayFormat::Dec => "dec",
            DisplayFormat::Hex => "hex",
            DisplayFormat::Bin => "bin",
        }
    }
}

impl std::fmt::Display for DisplayFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DisplayFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "dec" => Ok(DisplayFormat::Dec),
            "hex" => Ok(DisplayFormat::Hex),
            "bin" => Ok(DisplayFormat::Bin),
            other => Err(format!(
                "unknown format '{other}' (expected dec, hex or bin)"
            )),
        }
    }
}

/// Outcome of the last keep-alive probe between the gateway and the device.
///
/// The gateway sends `false` when the probe failed, `null` (or nothing) when
/// no probe has completed yet, and an epoch timestamp when the last one
/// succeeded.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum KeepAlive {
    #[default]
    Unknown,
    Failed,
    OkAt(f64),
}

impl<'de> Deserialize<'de> for KeepAlive {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::Bool(false) => KeepAlive::Failed,
            serde_json::Value::Number(n) => KeepAlive::OkAt(n.as_f64().unwrap_or(0.0)),
            _ => KeepAlive::Unknown,
        })
    }
}

/// Derived connection phase; never stored, always computed from the two raw
/// status flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

/// A status snapshot from the gateway. Snapshots may be partial; every field
/// defaults so the client tolerates whatever subset the gateway sent.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConnectionStatus {
    #[serde(default)]
    pub connected: bool,

    #[serde(default)]
    pub is_connecting: bool,

    #[serde(default)]
    pub mode: Option<Mode>,

    #[serde(default)]
    pub ip: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub unit_id: Option<u8>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub uptime_seconds: Option<f64>,

    #[serde(default)]
    pub last_keep_alive_ok: KeepAlive,
}

impl ConnectionStatus {
    pub fn phase(&self) -> Phase {
        if self.is_connecting {
            Phase::Connecting
        } else if self.connected {
            Phase::Connected
        } else {
            Phase::Disconnected
        }
    }
}

/// Body of `POST /api/connect`.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectRequest {
    pub ip: String,
    pub port: u16,
    pub unit_id: u8,
    pub mode: Mode,
}

/// Reply shape shared by all action endpoints. `data` is only attached by
/// read-now (the raw word list, `[]`, or `null`).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ActionReply {
    #[serde(default)]
    pub success: bool,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// A register read result, values already formatted by the gateway per the
/// requested display format. `values` may be empty even on success.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RegisterData {
    #[serde(default)]
    pub start_addr: Option<u16>,

    #[serde(default)]
    pub count: Option<u16>,

    #[serde(default)]
    pub values: Option<Vec<serde_json::Value>>,

    #[serde(default)]
    pub raw_values: Option<Vec<u16>>,

    #[serde(default)]
    pub last_update: Option<f64>,

    #[serde(default)]
    pub format: Option<DisplayFormat>,
}

/// Full diagnostic log buffer, oldest entry first.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DebugLog {
    #[serde(default)]
    pub logs: Vec<String>,
}
