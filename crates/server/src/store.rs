//! Persistent-state abstraction.
//!
//! The control plane coordinates with the durable store for everything that
//! must survive a process boundary: agent identity, licenses, one-shot
//! session tokens (minted by an HTTP handler, redeemed by a WebSocket
//! handler), transfer bookkeeping, tool definitions, and published builds.
//! `MemStore` is the bundled implementation; a database-backed store plugs
//! in behind the same trait.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use tether_protocol::{LicenseState, OsType};

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Persistent agent row, keyed by machine fingerprint within an owner scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: Uuid,
    pub owner_id: Uuid,
    pub machine_fingerprint: String,
    pub license_uuid: Option<Uuid>,
    pub license_state: LicenseState,
    pub os_type: OsType,
    pub arch: String,
    pub agent_version: String,
    pub hostname: String,
    pub display_name: Option<String>,
    pub has_display: bool,
    pub master_mode_enabled: bool,
    pub file_transfer_enabled: bool,
    pub local_settings_locked: bool,
    pub default_browser: Option<String>,
    pub created_at: u64,
    pub last_seen_at: u64,
}

impl AgentRecord {
    /// Display name for peer listings: explicit name, else hostname.
    pub fn peer_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.hostname)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub license_uuid: Uuid,
    pub owner_id: Uuid,
    pub state: LicenseState,
    pub expires_at: Option<u64>,
}

/// One-shot stream viewer token. Consumed by deletion on redeem.
#[derive(Debug, Clone)]
pub struct StreamTokenRecord {
    pub token: String,
    pub agent_id: Uuid,
    pub user_id: String,
    pub display_id: u32,
    pub quality: u8,
    pub max_fps: u32,
    pub remote_address: String,
    pub expires_at: u64,
}

/// One-shot terminal viewer token. Consumed by deletion on redeem.
#[derive(Debug, Clone)]
pub struct TerminalTokenRecord {
    pub token: String,
    pub agent_id: Uuid,
    pub user_id: String,
    pub remote_address: String,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: Uuid,
    pub source_agent_id: Uuid,
    pub dest_agent_id: Uuid,
    pub initiator_user_id: String,
    pub source_path: String,
    pub dest_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
    pub error_message: Option<String>,
    pub created_at: u64,
    pub completed_at: Option<u64>,
}

/// Per-platform variant of a tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPlatformVariant {
    pub os_type: OsType,
    pub description: String,
    pub input_schema: Value,
    pub is_available: bool,
    pub requires_display: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub category: String,
    pub enabled: bool,
    pub variants: Vec<ToolPlatformVariant>,
}

impl ToolDefinition {
    pub fn variant_for(&self, os: OsType) -> Option<&ToolPlatformVariant> {
        self.variants.iter().find(|v| v.os_type == os)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub os_type: OsType,
    pub arch: String,
    pub url: String,
    pub forced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    pub released_at: u64,
    pub builds: Vec<BuildRecord>,
}

/// Durable-state operations the control plane depends on.
#[async_trait]
pub trait Store: Send + Sync {
    // Agents
    async fn agent_by_id(&self, agent_id: Uuid) -> Option<AgentRecord>;
    async fn agent_by_license(&self, license_uuid: Uuid) -> Option<AgentRecord>;
    async fn agent_by_fingerprint(&self, owner_id: Uuid, fingerprint: &str)
    -> Option<AgentRecord>;
    async fn agents_by_owner(&self, owner_id: Uuid) -> Vec<AgentRecord>;
    async fn upsert_agent(&self, agent: AgentRecord);
    /// Move `last_seen_at` forward; never backwards.
    async fn touch_agent_seen(&self, agent_id: Uuid, at: u64);

    // Licenses
    async fn license(&self, license_uuid: Uuid) -> Option<LicenseRecord>;
    async fn put_license(&self, license: LicenseRecord);

    // Session tokens (one-shot: take_* removes before returning)
    async fn put_stream_token(&self, token: StreamTokenRecord);
    async fn take_stream_token(&self, token: &str) -> Option<StreamTokenRecord>;
    async fn put_terminal_token(&self, token: TerminalTokenRecord);
    async fn take_terminal_token(&self, token: &str) -> Option<TerminalTokenRecord>;
    /// Delete tokens past their expiry. Returns how many were removed.
    async fn sweep_expired_tokens(&self, now: u64) -> usize;

    // File transfers
    async fn insert_transfer(&self, transfer: TransferRecord);
    async fn transfer(&self, transfer_id: Uuid) -> Option<TransferRecord>;
    /// Raise `bytes_transferred` (monotonic; lower values are ignored).
    async fn update_transfer_progress(&self, transfer_id: Uuid, bytes_transferred: u64);
    async fn update_transfer_size(&self, transfer_id: Uuid, file_size: u64);
    async fn update_transfer_status(
        &self,
        transfer_id: Uuid,
        status: TransferStatus,
        error_message: Option<String>,
    );

    // Tool catalog
    async fn tool_definitions(&self) -> Vec<ToolDefinition>;
    async fn put_tool_definition(&self, tool: ToolDefinition);
    async fn agent_capabilities(&self, agent_id: Uuid) -> Option<Vec<String>>;
    async fn set_agent_capabilities(&self, agent_id: Uuid, capabilities: Vec<String>);

    // Published builds
    async fn versions(&self) -> Vec<VersionRecord>;
    async fn put_version(&self, version: VersionRecord);
}

/// In-memory store. Every table is a map under its own lock; the token
/// tables implement the delete-on-read contract the brokers rely on.
#[derive(Default)]
pub struct MemStore {
    agents: RwLock<HashMap<Uuid, AgentRecord>>,
    licenses: RwLock<HashMap<Uuid, LicenseRecord>>,
    stream_tokens: RwLock<HashMap<String, StreamTokenRecord>>,
    terminal_tokens: RwLock<HashMap<String, TerminalTokenRecord>>,
    transfers: RwLock<HashMap<Uuid, TransferRecord>>,
    tools: RwLock<HashMap<String, ToolDefinition>>,
    capabilities: RwLock<HashMap<Uuid, Vec<String>>>,
    versions: RwLock<Vec<VersionRecord>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn agent_by_id(&self, agent_id: Uuid) -> Option<AgentRecord> {
        self.agents.read().await.get(&agent_id).cloned()
    }

    async fn agent_by_license(&self, license_uuid: Uuid) -> Option<AgentRecord> {
        self.agents
            .read()
            .await
            .values()
            .find(|a| a.license_uuid == Some(license_uuid))
            .cloned()
    }

    async fn agent_by_fingerprint(
        &self,
        owner_id: Uuid,
        fingerprint: &str,
    ) -> Option<AgentRecord> {
        self.agents
            .read()
            .await
            .values()
            .find(|a| a.owner_id == owner_id && a.machine_fingerprint == fingerprint)
            .cloned()
    }

    async fn agents_by_owner(&self, owner_id: Uuid) -> Vec<AgentRecord> {
        let mut agents: Vec<_> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        agents
    }

    async fn upsert_agent(&self, agent: AgentRecord) {
        self.agents.write().await.insert(agent.agent_id, agent);
    }

    async fn touch_agent_seen(&self, agent_id: Uuid, at: u64) {
        if let Some(agent) = self.agents.write().await.get_mut(&agent_id) {
            agent.last_seen_at = agent.last_seen_at.max(at);
        }
    }

    async fn license(&self, license_uuid: Uuid) -> Option<LicenseRecord> {
        self.licenses.read().await.get(&license_uuid).cloned()
    }

    async fn put_license(&self, license: LicenseRecord) {
        self.licenses
            .write()
            .await
            .insert(license.license_uuid, license);
    }

    async fn put_stream_token(&self, token: StreamTokenRecord) {
        self.stream_tokens
            .write()
            .await
            .insert(token.token.clone(), token);
    }

    async fn take_stream_token(&self, token: &str) -> Option<StreamTokenRecord> {
        self.stream_tokens.write().await.remove(token)
    }

    async fn put_terminal_token(&self, token: TerminalTokenRecord) {
        self.terminal_tokens
            .write()
            .await
            .insert(token.token.clone(), token);
    }

    async fn take_terminal_token(&self, token: &str) -> Option<TerminalTokenRecord> {
        self.terminal_tokens.write().await.remove(token)
    }

    async fn sweep_expired_tokens(&self, now: u64) -> usize {
        let mut removed = 0;
        {
            let mut tokens = self.stream_tokens.write().await;
            let before = tokens.len();
            tokens.retain(|_, t| t.expires_at > now);
            removed += before - tokens.len();
        }
        {
            let mut tokens = self.terminal_tokens.write().await;
            let before = tokens.len();
            tokens.retain(|_, t| t.expires_at > now);
            removed += before - tokens.len();
        }
        removed
    }

    async fn insert_transfer(&self, transfer: TransferRecord) {
        self.transfers
            .write()
            .await
            .insert(transfer.transfer_id, transfer);
    }

    async fn transfer(&self, transfer_id: Uuid) -> Option<TransferRecord> {
        self.transfers.read().await.get(&transfer_id).cloned()
    }

    async fn update_transfer_progress(&self, transfer_id: Uuid, bytes_transferred: u64) {
        if let Some(t) = self.transfers.write().await.get_mut(&transfer_id) {
            t.bytes_transferred = t.bytes_transferred.max(bytes_transferred);
        }
    }

    async fn update_transfer_size(&self, transfer_id: Uuid, file_size: u64) {
        if let Some(t) = self.transfers.write().await.get_mut(&transfer_id) {
            t.file_size = file_size;
        }
    }

    async fn update_transfer_status(
        &self,
        transfer_id: Uuid,
        status: TransferStatus,
        error_message: Option<String>,
    ) {
        if let Some(t) = self.transfers.write().await.get_mut(&transfer_id) {
            // Terminal states stick; a late FAILED must not overwrite CANCELLED.
            if t.status.is_terminal() {
                return;
            }
            t.status = status;
            t.error_message = error_message;
            if status.is_terminal() {
                t.completed_at = Some(unix_now());
            }
        }
    }

    async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<_> = self.tools.read().await.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    async fn put_tool_definition(&self, tool: ToolDefinition) {
        self.tools.write().await.insert(tool.name.clone(), tool);
    }

    async fn agent_capabilities(&self, agent_id: Uuid) -> Option<Vec<String>> {
        self.capabilities.read().await.get(&agent_id).cloned()
    }

    async fn set_agent_capabilities(&self, agent_id: Uuid, capabilities: Vec<String>) {
        self.capabilities
            .write()
            .await
            .insert(agent_id, capabilities);
    }

    async fn versions(&self) -> Vec<VersionRecord> {
        self.versions.read().await.clone()
    }

    async fn put_version(&self, version: VersionRecord) {
        let mut versions = self.versions.write().await;
        versions.retain(|v| v.version != version.version);
        versions.push(version);
    }
}
