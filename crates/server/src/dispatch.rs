//! Command dispatcher.
//!
//! Routes a request to a server-side handler (`tools/list` from the
//! capability catalog, the local system handler) or forwards it to the
//! target agent through the registry. The classification lists below are
//! the routing table; extend them, don't special-case call sites.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use tether_protocol::ControlError;

use crate::local;
use crate::registry::AgentRegistry;
use crate::store::Store;
use crate::tools::ToolCatalog;

/// Methods that only ever run on the agent: anything that touches the
/// display, input devices, or the agent-side browser bridge.
pub const AGENT_ONLY_METHODS: &[&str] = &[
    "screenshot",
    "screen_info",
    "mouse_click",
    "mouse_move",
    "mouse_scroll",
    "key_press",
    "key_type",
    "clipboard_get",
    "clipboard_set",
    "browser_open",
    "browser_navigate",
    "browser_click",
    "browser_fill",
    "browser_screenshot",
    "browser_close",
];

/// Filesystem, shell, and system methods: served in-process when the server
/// itself is the target, forwarded otherwise.
pub const SERVER_CAPABLE_METHODS: &[&str] = &[
    "fs_list",
    "fs_read",
    "fs_write",
    "fs_mkdir",
    "fs_delete",
    "fs_stat",
    "files_info",
    "files_read_chunk",
    "files_write_chunk",
    "shell_exec",
    "shell_start",
    "shell_input",
    "shell_output",
    "shell_stop",
    "shell_resize",
    "system_info",
    "process_list",
];

/// Machine methods handled in-place only in a privileged co-located
/// deployment; forwarded everywhere else.
pub const PRIVILEGED_LOCAL_METHODS: &[&str] = &["machine_lock", "machine_unlock", "machine_info"];

/// Where a request should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTarget {
    /// A connected agent, addressed by connection id.
    Agent(Uuid),
    /// The server's own host.
    Local,
}

/// Map a `terminal_*` alias onto the agent's shell-session method.
pub fn terminal_alias(method: &str) -> Option<&'static str> {
    match method {
        "terminal_start" => Some("shell_start"),
        "terminal_input" => Some("shell_input"),
        "terminal_output" => Some("shell_output"),
        "terminal_stop" => Some("shell_stop"),
        "terminal_resize" => Some("shell_resize"),
        _ => None,
    }
}

pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    catalog: Arc<ToolCatalog>,
    store: Arc<dyn Store>,
    local_privileged: bool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        catalog: Arc<ToolCatalog>,
        store: Arc<dyn Store>,
        local_privileged: bool,
    ) -> Self {
        Self {
            registry,
            catalog,
            store,
            local_privileged,
        }
    }

    pub async fn dispatch(
        &self,
        target: DispatchTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, ControlError> {
        self.dispatch_with_timeout(target, method, params, None)
            .await
    }

    pub async fn dispatch_with_timeout(
        &self,
        target: DispatchTarget,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ControlError> {
        match method {
            "tools/list" => self.tools_list(target).await,
            "tools/call" => {
                // MCP envelope: unwrap {name, arguments} and re-dispatch.
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ControlError::ProtocolError("tools/call requires a name".to_string())
                    })?
                    .to_string();
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                Box::pin(self.dispatch_with_timeout(target, &name, arguments, timeout)).await
            }
            _ => {
                let method = terminal_alias(method).unwrap_or(method);
                self.route(target, method, params, timeout).await
            }
        }
    }

    async fn route(
        &self,
        target: DispatchTarget,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ControlError> {
        match target {
            DispatchTarget::Local => {
                if SERVER_CAPABLE_METHODS.contains(&method)
                    || PRIVILEGED_LOCAL_METHODS.contains(&method)
                {
                    local::handle(method, &params).await
                } else {
                    Err(ControlError::ProtocolError(format!(
                        "unknown method: {method}"
                    )))
                }
            }
            DispatchTarget::Agent(connection_id) => {
                if PRIVILEGED_LOCAL_METHODS.contains(&method) && self.local_privileged {
                    return local::handle(method, &params).await;
                }
                if !AGENT_ONLY_METHODS.contains(&method)
                    && !SERVER_CAPABLE_METHODS.contains(&method)
                    && !PRIVILEGED_LOCAL_METHODS.contains(&method)
                {
                    return Err(ControlError::ProtocolError(format!(
                        "unknown method: {method}"
                    )));
                }
                match timeout {
                    Some(timeout) => {
                        self.registry
                            .send_command_with_timeout(connection_id, method, params, timeout)
                            .await
                    }
                    None => self.registry.send_command(connection_id, method, params).await,
                }
            }
        }
    }

    async fn tools_list(&self, target: DispatchTarget) -> Result<Value, ControlError> {
        let agent_id = match target {
            DispatchTarget::Agent(connection_id) => self
                .registry
                .connection(connection_id)
                .await
                .and_then(|c| c.agent_id())
                .ok_or(ControlError::NotConnected)?,
            DispatchTarget::Local => {
                return Err(ControlError::ProtocolError(
                    "tools/list requires an agent target".to_string(),
                ));
            }
        };
        let agent = self
            .store
            .agent_by_id(agent_id)
            .await
            .ok_or(ControlError::NotConnected)?;
        let tools = self.catalog.tools_for_agent(&agent).await;
        Ok(json!({ "tools": tools }))
    }
}
