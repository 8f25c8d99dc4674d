//! Tool capability store.
//!
//! Answers `tools/list` from persistent tool definitions instead of a round
//! trip to the agent. An agent that has reported a capability set is
//! restricted to it; otherwise every enabled definition with an available
//! variant for the agent's platform is advertised. Headless agents never
//! see display-bound tools.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::store::{AgentRecord, Store};

/// Tool entry as returned to MCP clients.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

pub struct ToolCatalog {
    store: Arc<dyn Store>,
}

impl ToolCatalog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Tools currently available on one agent.
    pub async fn tools_for_agent(&self, agent: &AgentRecord) -> Vec<ToolDescriptor> {
        let definitions = self.store.tool_definitions().await;
        let capabilities = self.store.agent_capabilities(agent.agent_id).await;

        if let Some(capabilities) = &capabilities {
            // Capability names the catalog has no definition for are logged,
            // never rejected: an older server may simply not know the tool.
            for name in capabilities {
                if !definitions.iter().any(|d| &d.name == name) {
                    tracing::debug!(
                        agent_id = %agent.agent_id,
                        tool = %name,
                        "Agent reports unknown tool capability"
                    );
                }
            }
        }

        definitions
            .into_iter()
            .filter(|def| def.enabled)
            .filter(|def| match &capabilities {
                Some(caps) => caps.contains(&def.name),
                None => true,
            })
            .filter_map(|def| {
                let variant = def.variant_for(agent.os_type)?;
                if !variant.is_available {
                    return None;
                }
                if variant.requires_display && !agent.has_display {
                    return None;
                }
                Some(ToolDescriptor {
                    name: def.name.clone(),
                    description: variant.description.clone(),
                    input_schema: variant.input_schema.clone(),
                })
            })
            .collect()
    }

    /// Fleet-wide aggregation for multi-agent clients: names prefixed
    /// `{agent}__{tool}`, descriptions bracketed `[agent] …`. Prefixing is
    /// the whole collision story; no further disambiguation.
    pub async fn tools_for_fleet(&self, agents: &[AgentRecord]) -> Vec<ToolDescriptor> {
        let mut all = Vec::new();
        for agent in agents {
            let peer = agent.peer_name().to_string();
            for tool in self.tools_for_agent(agent).await {
                all.push(ToolDescriptor {
                    name: format!("{peer}__{}", tool.name),
                    description: format!("[{peer}] {}", tool.description),
                    input_schema: tool.input_schema,
                });
            }
        }
        all
    }
}
