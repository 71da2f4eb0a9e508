//! Host ↔ surface bridge envelope and message catalog.
//!
//! Every frame is a JSON object `{ "type": string, "payload"?: any, "correlationId"?: string }`.
//! `decode` fails closed: anything that is not such an object comes back as a
//! [`DecodeError`] and nothing downstream sees a half-parsed message.

use crate::approval::{DevicePairDetails, ExecDetails};
use crate::connection::ConnectionState;
use crate::settings::Settings;
use crate::theme::ResolvedTheme;
use crate::window::WindowStateKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("frame has no type field")]
    MissingType,
    #[error("frame type is not a string")]
    NonStringType,
    #[error("frame type is empty")]
    EmptyType,
    #[error("invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("envelope type is empty")]
    EmptyType,
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Serialize(String),
}

/// Untyped envelope as it travels over the bridge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn to_text(&self) -> Result<String, EncodeError> {
        if self.kind.trim().is_empty() {
            return Err(EncodeError::EmptyType);
        }
        let encoded =
            serde_json::to_string(self).map_err(|err| EncodeError::Serialize(err.to_string()))?;
        if encoded.len() > DEFAULT_MAX_FRAME_BYTES {
            return Err(EncodeError::Oversized {
                size: encoded.len(),
                max: DEFAULT_MAX_FRAME_BYTES,
            });
        }
        Ok(encoded)
    }
}

pub fn encode(kind: &str, payload: Option<Value>) -> Result<String, EncodeError> {
    Envelope::new(kind, payload).to_text()
}

pub fn decode(raw: &str) -> Result<Envelope, DecodeError> {
    decode_with_limit(raw, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_with_limit(raw: &str, max_frame_bytes: usize) -> Result<Envelope, DecodeError> {
    let raw = raw.trim_end_matches(|c| c == '\n' || c == '\r');
    if raw.len() > max_frame_bytes {
        return Err(DecodeError::Oversized {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }

    let value: Value =
        serde_json::from_str(raw).map_err(|err| DecodeError::Malformed(err.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let kind = match fields.remove("type") {
        None => return Err(DecodeError::MissingType),
        Some(Value::String(kind)) => kind,
        Some(_) => return Err(DecodeError::NonStringType),
    };
    if kind.trim().is_empty() {
        return Err(DecodeError::EmptyType);
    }

    let payload = match fields.remove("payload") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value),
    };

    let correlation_id = match fields.remove("correlationId") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(id),
        Some(_) => {
            return Err(DecodeError::Malformed(
                "correlationId must be a string".to_string(),
            ))
        }
    };

    Ok(Envelope {
        kind,
        payload,
        correlation_id,
    })
}

/// Closed set of message types the surface may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceMessageKind {
    Ready,
    ConnectionStateChanged,
    Notify,
    ThemeChanged,
    TabChanged,
    RequestExecApproval,
    RequestDevicePair,
    OpenExternal,
    Badge,
    GatewayAction,
}

impl SurfaceMessageKind {
    pub const ALL: [SurfaceMessageKind; 10] = [
        SurfaceMessageKind::Ready,
        SurfaceMessageKind::ConnectionStateChanged,
        SurfaceMessageKind::Notify,
        SurfaceMessageKind::ThemeChanged,
        SurfaceMessageKind::TabChanged,
        SurfaceMessageKind::RequestExecApproval,
        SurfaceMessageKind::RequestDevicePair,
        SurfaceMessageKind::OpenExternal,
        SurfaceMessageKind::Badge,
        SurfaceMessageKind::GatewayAction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SurfaceMessageKind::Ready => "shell.ready",
            SurfaceMessageKind::ConnectionStateChanged => "shell.connectionStateChanged",
            SurfaceMessageKind::Notify => "shell.notify",
            SurfaceMessageKind::ThemeChanged => "shell.themeChanged",
            SurfaceMessageKind::TabChanged => "shell.tabChanged",
            SurfaceMessageKind::RequestExecApproval => "shell.requestExecApproval",
            SurfaceMessageKind::RequestDevicePair => "shell.requestDevicePair",
            SurfaceMessageKind::OpenExternal => "shell.openExternal",
            SurfaceMessageKind::Badge => "shell.badge",
            SurfaceMessageKind::GatewayAction => "shell.gatewayAction",
        }
    }
}

impl fmt::Display for SurfaceMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SurfaceMessageKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        SurfaceMessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == input)
            .ok_or_else(|| format!("Unknown surface message type: {input}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadyPayload {
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStatePayload {
    pub state: ConnectionState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyPayload {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThemePayload {
    pub theme: ResolvedTheme,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabChangedPayload {
    pub tab: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecApprovalRequestPayload {
    pub request_id: String,
    #[serde(flatten)]
    pub details: ExecDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePairRequestPayload {
    pub request_id: String,
    #[serde(flatten)]
    pub details: DevicePairDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenExternalPayload {
    pub url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BadgePayload {
    pub count: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAction {
    Restart,
    Stop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayActionPayload {
    pub action: GatewayAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum SurfaceMessage {
    #[serde(rename = "shell.ready")]
    Ready(ReadyPayload),
    #[serde(rename = "shell.connectionStateChanged")]
    ConnectionStateChanged(ConnectionStatePayload),
    #[serde(rename = "shell.notify")]
    Notify(NotifyPayload),
    #[serde(rename = "shell.themeChanged")]
    ThemeChanged(ThemePayload),
    #[serde(rename = "shell.tabChanged")]
    TabChanged(TabChangedPayload),
    #[serde(rename = "shell.requestExecApproval")]
    RequestExecApproval(ExecApprovalRequestPayload),
    #[serde(rename = "shell.requestDevicePair")]
    RequestDevicePair(DevicePairRequestPayload),
    #[serde(rename = "shell.openExternal")]
    OpenExternal(OpenExternalPayload),
    #[serde(rename = "shell.badge")]
    Badge(BadgePayload),
    #[serde(rename = "shell.gatewayAction")]
    GatewayAction(GatewayActionPayload),
}

impl SurfaceMessage {
    pub fn kind(&self) -> SurfaceMessageKind {
        match self {
            SurfaceMessage::Ready(_) => SurfaceMessageKind::Ready,
            SurfaceMessage::ConnectionStateChanged(_) => {
                SurfaceMessageKind::ConnectionStateChanged
            }
            SurfaceMessage::Notify(_) => SurfaceMessageKind::Notify,
            SurfaceMessage::ThemeChanged(_) => SurfaceMessageKind::ThemeChanged,
            SurfaceMessage::TabChanged(_) => SurfaceMessageKind::TabChanged,
            SurfaceMessage::RequestExecApproval(_) => SurfaceMessageKind::RequestExecApproval,
            SurfaceMessage::RequestDevicePair(_) => SurfaceMessageKind::RequestDevicePair,
            SurfaceMessage::OpenExternal(_) => SurfaceMessageKind::OpenExternal,
            SurfaceMessage::Badge(_) => SurfaceMessageKind::Badge,
            SurfaceMessage::GatewayAction(_) => SurfaceMessageKind::GatewayAction,
        }
    }

    /// Types the envelope. `Ok(None)` means the type is not in the catalog.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, DecodeError> {
        let Ok(kind) = envelope.kind.parse::<SurfaceMessageKind>() else {
            return Ok(None);
        };
        let payload = envelope
            .payload
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let mut tagged = Map::new();
        tagged.insert("type".to_string(), Value::String(envelope.kind.clone()));
        tagged.insert("payload".to_string(), payload);
        serde_json::from_value(Value::Object(tagged))
            .map(Some)
            .map_err(|err| DecodeError::InvalidPayload {
                kind: kind.as_str(),
                reason: err.to_string(),
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    pub theme: ResolvedTheme,
    pub gateway_url: String,
    pub token: String,
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NavigatePayload {
    pub tab: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FocusPayload {
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecApprovalResultPayload {
    pub request_id: String,
    pub approved: bool,
    pub remember: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DevicePairResultPayload {
    pub request_id: String,
    pub approved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DroppedFile {
    pub name: String,
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDropPayload {
    pub files: Vec<DroppedFile>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowStatePayload {
    pub state: WindowStateKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum HostMessage {
    #[serde(rename = "host.init")]
    Init(InitPayload),
    #[serde(rename = "host.themeChanged")]
    ThemeChanged(ThemePayload),
    #[serde(rename = "host.navigate")]
    Navigate(NavigatePayload),
    #[serde(rename = "host.focus")]
    Focus(FocusPayload),
    #[serde(rename = "host.execApprovalResult")]
    ExecApprovalResult(ExecApprovalResultPayload),
    #[serde(rename = "host.devicePairResult")]
    DevicePairResult(DevicePairResultPayload),
    #[serde(rename = "host.fileDrop")]
    FileDrop(FileDropPayload),
    #[serde(rename = "host.windowState")]
    WindowState(WindowStatePayload),
    #[serde(rename = "host.settingsChanged")]
    SettingsChanged(Settings),
    #[serde(rename = "host.connectionStateChanged")]
    ConnectionStateChanged(ConnectionStatePayload),
}

impl HostMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HostMessage::Init(_) => "host.init",
            HostMessage::ThemeChanged(_) => "host.themeChanged",
            HostMessage::Navigate(_) => "host.navigate",
            HostMessage::Focus(_) => "host.focus",
            HostMessage::ExecApprovalResult(_) => "host.execApprovalResult",
            HostMessage::DevicePairResult(_) => "host.devicePairResult",
            HostMessage::FileDrop(_) => "host.fileDrop",
            HostMessage::WindowState(_) => "host.windowState",
            HostMessage::SettingsChanged(_) => "host.settingsChanged",
            HostMessage::ConnectionStateChanged(_) => "host.connectionStateChanged",
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, EncodeError> {
        let value =
            serde_json::to_value(self).map_err(|err| EncodeError::Serialize(err.to_string()))?;
        let payload = match value {
            Value::Object(mut fields) => fields.remove("payload"),
            _ => None,
        };
        Ok(Envelope::new(self.kind(), payload))
    }

    pub fn encode(&self, correlation_id: Option<&str>) -> Result<String, EncodeError> {
        self.to_envelope()?
            .with_correlation(correlation_id.map(str::to_string))
            .to_text()
    }
}
