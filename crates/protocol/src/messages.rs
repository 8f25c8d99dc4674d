use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::frame::FrameHeader;

/// Agent power state, reported via heartbeat and state_change frames.
/// Drives the heartbeat cadence the server hands back to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    Active,
    Passive,
    Sleep,
}

impl PowerState {
    /// Heartbeat interval in milliseconds for this power state.
    pub fn heartbeat_interval_ms(self) -> u64 {
        match self {
            PowerState::Active => 5_000,
            PowerState::Passive => 30_000,
            PowerState::Sleep => 300_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Windows,
    Macos,
    Linux,
}

impl OsType {
    pub fn as_str(self) -> &'static str {
        match self {
            OsType::Windows => "windows",
            OsType::Macos => "macos",
            OsType::Linux => "linux",
        }
    }
}

/// License lifecycle of a persistent agent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseState {
    Pending,
    Active,
    Expired,
    Blocked,
}

impl LicenseState {
    pub fn as_str(self) -> &'static str {
        match self {
            LicenseState::Pending => "pending",
            LicenseState::Active => "active",
            LicenseState::Expired => "expired",
            LicenseState::Blocked => "blocked",
        }
    }
}

/// Machine fingerprint block sent with registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineFingerprint {
    pub hostname: String,
    #[serde(default)]
    pub cpu_model: Option<String>,
    #[serde(default)]
    pub mac_addresses: Vec<String>,
}

/// Messages an agent sends to the control plane.
///
/// JSON text frames tagged by `type`. A `stream_frame` header promises that
/// the very next WebSocket frame is binary and exactly `frameSize` bytes.
/// Unknown types deserialize to `Unknown` and are logged, never fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        machine_id: String,
        machine_name: String,
        os_type: OsType,
        os_version: String,
        arch: String,
        agent_version: String,
        fingerprint: MachineFingerprint,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        license_uuid: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        customer_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capabilities: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        has_display: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        timestamp: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        power_state: Option<PowerState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_screen_locked: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        has_display: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_task: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StateChange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        power_state: Option<PowerState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_screen_locked: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_task: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolsChanged {
        browser_bridge_running: bool,
        timestamp: u64,
    },
    Response {
        id: String,
        #[serde(default)]
        result: Option<Value>,
    },
    Error {
        id: String,
        error: String,
    },
    Pong,
    #[serde(rename_all = "camelCase")]
    RelayRequest {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_agent_id: Option<Uuid>,
        method: String,
        #[serde(default)]
        params: Value,
    },
    #[serde(rename_all = "camelCase")]
    StreamStarted {
        session_id: Uuid,
        #[serde(flatten)]
        detail: serde_json::Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    StreamStopped {
        session_id: Uuid,
        #[serde(flatten)]
        detail: serde_json::Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    StreamCursor {
        session_id: Uuid,
        #[serde(flatten)]
        detail: serde_json::Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    StreamError {
        session_id: Uuid,
        error: String,
    },
    StreamFrame(FrameHeader),
    #[serde(other)]
    Unknown,
}

/// Config block handed to an agent inside `registered`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredConfig {
    /// Heartbeat interval in milliseconds for the agent's current power state.
    pub heartbeat_interval: u64,
    /// Hours without a heartbeat before the agent is considered lost.
    pub grace_hours: u32,
}

/// Incremental config pushed inside `heartbeat_ack` or a `config` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
    /// Logical run state: "ACTIVE" or "DEGRADED".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<PowerState>,
}

/// Permission snapshot included in every heartbeat_ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSnapshot {
    pub master_mode: bool,
    pub file_transfer: bool,
    pub local_settings_locked: bool,
}

/// Messages the control plane sends to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Registered {
        /// Ephemeral connection id.
        id: Uuid,
        /// Persistent agent id.
        agent_id: Uuid,
        license_status: LicenseState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        license_uuid: Option<Uuid>,
        /// Logical run state: "ACTIVE" or "DEGRADED".
        state: String,
        power_state: PowerState,
        config: RegisteredConfig,
    },
    #[serde(rename_all = "camelCase")]
    HeartbeatAck {
        id: String,
        license_status: LicenseState,
        license_changed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        license_message: Option<String>,
        pending_commands: bool,
        /// Update flag: 0 = current, 1 = update available, 2 = forced.
        u: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_browser: Option<String>,
        permissions: PermissionSnapshot,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<AgentConfigUpdate>,
    },
    Request {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Config {
        id: String,
        config: AgentConfigUpdate,
    },
    #[serde(rename_all = "camelCase")]
    StreamStart {
        id: String,
        session_id: Uuid,
        display_id: u32,
        quality: u8,
        max_fps: u32,
    },
    #[serde(rename_all = "camelCase")]
    StreamStop {
        id: String,
        session_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    StreamInput {
        id: String,
        session_id: Uuid,
        input: Value,
    },
    RelayResponse {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Ping,
    Error {
        error: String,
    },
}

/// Messages a viewer (browser client) sends over the stream or terminal
/// WebSocket. The first message on either socket must carry the one-shot
/// session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerMessage {
    #[serde(rename_all = "camelCase")]
    StreamStart { session_token: String },
    #[serde(rename_all = "camelCase")]
    TerminalStart { session_token: String },
    #[serde(rename_all = "camelCase")]
    Input {
        input_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        button: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_code: Option<u32>,
        #[serde(flatten)]
        extra: serde_json::Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    QualityChange {
        quality: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_fps: Option<u32>,
    },
    Refresh,
    StreamStop,
    TerminalInput {
        data: String,
    },
    TerminalResize {
        cols: u16,
        rows: u16,
    },
    TerminalStop,
    Ping,
    #[serde(other)]
    Unknown,
}

/// Messages the control plane sends to a viewer. A `frame` event is always
/// followed by exactly one binary frame of `frameSize` bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerEvent {
    #[serde(rename_all = "camelCase")]
    Frame {
        session_id: Uuid,
        sequence: u64,
        timestamp: u64,
        num_rects: u32,
        frame_size: u32,
    },
    #[serde(rename_all = "camelCase")]
    StreamStarted { session_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Cursor {
        session_id: Uuid,
        #[serde(flatten)]
        detail: serde_json::Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    TerminalStarted { session_id: Uuid },
    #[serde(rename_all = "camelCase")]
    TerminalOutput { session_id: Uuid, data: String },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Pong,
}
