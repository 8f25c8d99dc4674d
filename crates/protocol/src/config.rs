use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub command: CommandConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTPS port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Serve TLS (self-signed auto-generated if no cert configured).
    /// Disable only behind a TLS-terminating proxy.
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Path to TLS certificate (auto-generated if absent)
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated if absent)
    pub tls_key: Option<String>,
    /// JWT secret (auto-generated and persisted if absent)
    pub jwt_secret: Option<String>,
    /// Directory for persisted secrets and auto-generated certificates
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Require JWT auth for the /metrics endpoint (default: true)
    #[serde(default = "default_true")]
    pub metrics_require_auth: bool,
    /// Interval between expired-token sweeps, in seconds
    #[serde(default = "default_token_sweep_interval_s")]
    pub token_sweep_interval_s: u64,
    /// Serve privileged machine_* methods locally instead of forwarding
    /// (set only when the server is co-located with the agent host)
    #[serde(default)]
    pub local_privileged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Default agent command timeout in seconds
    #[serde(default = "default_cmd_timeout_s")]
    pub default_timeout_s: u64,
    /// Master relay execution timeout in seconds
    #[serde(default = "default_relay_timeout_s")]
    pub relay_timeout_s: u64,
    /// Commands buffered per agent while it sleeps; overflow drops the oldest
    #[serde(default = "default_sleep_queue_cap")]
    pub sleep_queue_cap: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stream session token lifetime in seconds
    #[serde(default = "default_token_ttl_s")]
    pub token_ttl_s: u64,
    /// Concurrent stream sessions allowed per agent
    #[serde(default = "default_max_streams_per_agent")]
    pub max_streams_per_agent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Terminal session token lifetime in seconds
    #[serde(default = "default_token_ttl_s")]
    pub token_ttl_s: u64,
    /// Shell output poll cadence in milliseconds
    #[serde(default = "default_terminal_poll_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size for agent-to-agent file transfer, in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,
    /// Largest transferable file, in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// Whole-transfer wall-clock timeout in seconds
    #[serde(default = "default_transfer_timeout_s")]
    pub timeout_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Hours without a heartbeat before an agent counts as lost
    #[serde(default = "default_grace_hours")]
    pub heartbeat_grace_hours: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls: true,
            tls_cert: None,
            tls_key: None,
            jwt_secret: None,
            state_dir: default_state_dir(),
            metrics_require_auth: true,
            token_sweep_interval_s: default_token_sweep_interval_s(),
            local_privileged: false,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_s: default_cmd_timeout_s(),
            relay_timeout_s: default_relay_timeout_s(),
            sleep_queue_cap: default_sleep_queue_cap(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            token_ttl_s: default_token_ttl_s(),
            max_streams_per_agent: default_max_streams_per_agent(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            token_ttl_s: default_token_ttl_s(),
            poll_interval_ms: default_terminal_poll_ms(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
            max_file_size_bytes: default_max_file_size(),
            timeout_s: default_transfer_timeout_s(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            heartbeat_grace_hours: default_grace_hours(),
        }
    }
}

impl ControlConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!("ERROR: tls_cert '{cert}' does not exist."));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!("ERROR: tls_key '{key}' does not exist."));
                }
            }
            (Some(_), None) => {
                issues.push(
                    "WARNING: tls_cert is set but tls_key is not. \
                     Both must be set for custom TLS, or omit both for auto-generated certificates."
                        .to_string(),
                );
            }
            (None, Some(_)) => {
                issues.push(
                    "WARNING: tls_key is set but tls_cert is not. \
                     Both must be set for custom TLS, or omit both for auto-generated certificates."
                        .to_string(),
                );
            }
            (None, None) => {}
        }

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.server.token_sweep_interval_s == 0 {
            issues.push("ERROR: server.token_sweep_interval_s must be >= 1.".to_string());
        }

        if self.command.default_timeout_s == 0 {
            issues.push("ERROR: command.default_timeout_s must be >= 1.".to_string());
        }
        if self.command.relay_timeout_s < self.command.default_timeout_s {
            issues.push(format!(
                "WARNING: command.relay_timeout_s ({}) is shorter than the default command \
                 timeout ({}). Relays will time out before the forwarded command does.",
                self.command.relay_timeout_s, self.command.default_timeout_s
            ));
        }
        if self.command.sleep_queue_cap == 0 {
            issues.push("ERROR: command.sleep_queue_cap must be >= 1.".to_string());
        }

        if self.stream.max_streams_per_agent == 0 {
            issues.push("ERROR: stream.max_streams_per_agent must be >= 1.".to_string());
        }
        if self.stream.token_ttl_s == 0 || self.terminal.token_ttl_s == 0 {
            issues.push("ERROR: token TTLs must be >= 1 second.".to_string());
        }

        if self.terminal.poll_interval_ms == 0 {
            issues.push("ERROR: terminal.poll_interval_ms must be >= 1.".to_string());
        } else if self.terminal.poll_interval_ms > 2_000 {
            issues.push(format!(
                "WARNING: terminal.poll_interval_ms is {} - shell output will feel sluggish \
                 above ~250 ms.",
                self.terminal.poll_interval_ms
            ));
        }

        if self.transfer.chunk_size_bytes < 4 * 1024 {
            issues.push(format!(
                "ERROR: transfer.chunk_size_bytes must be at least 4096, got {}.",
                self.transfer.chunk_size_bytes
            ));
        }
        if self.transfer.chunk_size_bytes > 4 * 1024 * 1024 {
            issues.push(format!(
                "WARNING: transfer.chunk_size_bytes is {} - chunks above 4 MiB inflate \
                 base64 frames past what most agents accept.",
                self.transfer.chunk_size_bytes
            ));
        }
        if self.transfer.max_file_size_bytes < self.transfer.chunk_size_bytes {
            issues.push(
                "ERROR: transfer.max_file_size_bytes must be >= transfer.chunk_size_bytes."
                    .to_string(),
            );
        }
        if self.transfer.timeout_s == 0 {
            issues.push("ERROR: transfer.timeout_s must be >= 1.".to_string());
        }

        if self.policy.heartbeat_grace_hours == 0 {
            issues.push("ERROR: policy.heartbeat_grace_hours must be >= 1.".to_string());
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8743
}
fn default_true() -> bool {
    true
}
fn default_state_dir() -> String {
    "/var/lib/tether".to_string()
}
fn default_token_sweep_interval_s() -> u64 {
    60
}
fn default_cmd_timeout_s() -> u64 {
    30
}
fn default_relay_timeout_s() -> u64 {
    120
}
fn default_sleep_queue_cap() -> usize {
    64
}
fn default_token_ttl_s() -> u64 {
    300
}
fn default_max_streams_per_agent() -> usize {
    3
}
fn default_terminal_poll_ms() -> u64 {
    100
}
fn default_chunk_size() -> u64 {
    262_144
}
fn default_max_file_size() -> u64 {
    1 << 30
}
fn default_transfer_timeout_s() -> u64 {
    1_800
}
fn default_grace_hours() -> u32 {
    72
}
