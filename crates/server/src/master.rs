//! Master relay: scope-checked command fan-out from privileged agents.
//!
//! An agent whose persistent row has `master_mode_enabled` is registered as
//! a master session when it connects. Its `relay_request` frames are
//! authorized (registered master, same owner scope, target connected) and
//! executed through the registry with the relay timeout; the result comes
//! back as `relay_response` on the master's own socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use uuid::Uuid;

use tether_protocol::{ControlError, ServerMessage};

use crate::registry::{AgentRegistry, OutboundFrame};
use crate::store::{AgentRecord, Store, unix_now};

pub struct MasterSession {
    pub agent_id: Uuid,
    pub owner_id: Uuid,
    pub connection_id: Uuid,
    pub registered_at: u64,
    last_activity: AtomicU64,
    /// In-flight relays, aborted if the master disconnects.
    relays: std::sync::Mutex<HashMap<String, AbortHandle>>,
}

impl MasterSession {
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

/// Peer entry returned by getAccessibleAgents.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub agent_id: Uuid,
    pub name: String,
    pub os_type: String,
    pub connected: bool,
}

pub struct MasterRelay {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn Store>,
    relay_timeout: Duration,
    /// Keyed by connection id: duplicate connections for one master agent
    /// each get their own session.
    sessions: RwLock<HashMap<Uuid, Arc<MasterSession>>>,
    pub relays_executed: AtomicU64,
    pub relays_denied: AtomicU64,
}

impl MasterRelay {
    pub fn new(registry: Arc<AgentRegistry>, store: Arc<dyn Store>, relay_timeout: Duration) -> Self {
        Self {
            registry,
            store,
            relay_timeout,
            sessions: RwLock::new(HashMap::new()),
            relays_executed: AtomicU64::new(0),
            relays_denied: AtomicU64::new(0),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_master(&self, connection_id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&connection_id)
    }

    /// Register the connection as a master session if its persistent row
    /// allows it. Called from the transport after registration.
    pub async fn maybe_register(&self, connection_id: Uuid, agent: &AgentRecord) {
        if !agent.master_mode_enabled {
            return;
        }
        let session = Arc::new(MasterSession {
            agent_id: agent.agent_id,
            owner_id: agent.owner_id,
            connection_id,
            registered_at: unix_now(),
            last_activity: AtomicU64::new(unix_now()),
            relays: std::sync::Mutex::new(HashMap::new()),
        });
        self.sessions.write().await.insert(connection_id, session);
        tracing::info!(%connection_id, agent_id = %agent.agent_id, "Master session registered");
    }

    /// Handle one relay_request frame. Always answers on the master socket,
    /// with either a result or a denial reason.
    pub async fn handle_relay(
        self: &Arc<Self>,
        connection_id: Uuid,
        request_id: String,
        target_agent_id: Option<Uuid>,
        method: String,
        params: Value,
    ) {
        let Some(session) = self.sessions.read().await.get(&connection_id).cloned() else {
            self.relays_denied.fetch_add(1, Ordering::Relaxed);
            self.respond(
                connection_id,
                request_id,
                Err("Not a registered master session".to_string()),
            )
            .await;
            return;
        };
        session.last_activity.fetch_max(unix_now(), Ordering::Relaxed);

        // Server-side method: enumerate reachable peers.
        if method == "getAccessibleAgents" {
            let peers = self.accessible_agents(&session).await;
            self.respond(
                connection_id,
                request_id,
                Ok(json!({ "agents": peers })),
            )
            .await;
            return;
        }

        let Some(target_agent_id) = target_agent_id else {
            self.relays_denied.fetch_add(1, Ordering::Relaxed);
            self.respond(
                connection_id,
                request_id,
                Err("Relay request is missing targetAgentId".to_string()),
            )
            .await;
            return;
        };

        let target = self.store.agent_by_id(target_agent_id).await;
        match target {
            Some(target) if target.owner_id == session.owner_id => {}
            _ => {
                self.relays_denied.fetch_add(1, Ordering::Relaxed);
                self.respond(
                    connection_id,
                    request_id,
                    Err(format!("Access denied: agent {target_agent_id} is outside your scope")),
                )
                .await;
                return;
            }
        }

        let Some(target_conn) = self.registry.connection_for_agent(target_agent_id).await else {
            self.relays_denied.fetch_add(1, Ordering::Relaxed);
            self.respond(
                connection_id,
                request_id,
                Err(format!("Target agent not connected: {target_agent_id}")),
            )
            .await;
            return;
        };

        let relay = Arc::clone(self);
        let timeout = self.relay_timeout;
        let id_for_task = request_id.clone();
        let session_for_task = Arc::clone(&session);
        let handle = tokio::spawn(async move {
            let result = relay
                .registry
                .send_command_with_timeout(target_conn.connection_id, &method, params, timeout)
                .await;
            session_for_task
                .relays
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id_for_task);
            relay.relays_executed.fetch_add(1, Ordering::Relaxed);
            match result {
                Ok(value) => relay.respond(connection_id, id_for_task, Ok(value)).await,
                Err(err) => {
                    relay
                        .respond(connection_id, id_for_task, Err(err.to_string()))
                        .await
                }
            }
        });
        session
            .relays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id, handle.abort_handle());
    }

    /// Peers in the master's owner scope, excluding the master itself.
    async fn accessible_agents(&self, session: &MasterSession) -> Vec<PeerSummary> {
        let mut peers = Vec::new();
        for agent in self.store.agents_by_owner(session.owner_id).await {
            if agent.agent_id == session.agent_id {
                continue;
            }
            let connected = self.registry.is_agent_connected(agent.agent_id).await;
            peers.push(PeerSummary {
                agent_id: agent.agent_id,
                name: agent.peer_name().to_string(),
                os_type: agent.os_type.as_str().to_string(),
                connected,
            });
        }
        peers
    }

    async fn respond(&self, connection_id: Uuid, id: String, result: Result<Value, String>) {
        let Some(conn) = self.registry.connection(connection_id).await else {
            return;
        };
        let message = match result {
            Ok(value) => ServerMessage::RelayResponse {
                id,
                result: Some(value),
                error: None,
            },
            Err(error) => ServerMessage::RelayResponse {
                id,
                result: None,
                error: Some(error),
            },
        };
        let _ = conn.send(OutboundFrame::Message(message));
    }

    /// Disconnect hook body: unregister and cancel in-flight relays.
    pub async fn unregister(&self, connection_id: Uuid) {
        let Some(session) = self.sessions.write().await.remove(&connection_id) else {
            return;
        };
        let relays: Vec<(String, AbortHandle)> = session
            .relays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (request_id, handle) in relays {
            handle.abort();
            tracing::debug!(
                %connection_id,
                %request_id,
                "Relay cancelled: master session disconnected"
            );
        }
        tracing::info!(%connection_id, agent_id = %session.agent_id, "Master session unregistered");
    }
}

#[async_trait::async_trait]
impl crate::registry::DisconnectHook for MasterRelay {
    async fn agent_disconnected(&self, connection_id: Uuid, _agent_id: Option<Uuid>) {
        self.unregister(connection_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{OutboundFrame, Registration};
    use crate::store::MemStore;
    use tokio::sync::mpsc;

    use tether_protocol::OsType;

    struct Peer {
        agent_id: Uuid,
        connection_id: Uuid,
        rx: mpsc::UnboundedReceiver<OutboundFrame>,
    }

    struct Fixture {
        relay: Arc<MasterRelay>,
        registry: Arc<AgentRegistry>,
        store: Arc<MemStore>,
        owner: Uuid,
        master: Peer,
        target: Peer,
    }

    async fn connect(
        registry: &AgentRegistry,
        store: &MemStore,
        owner: Uuid,
        fingerprint: &str,
        master_mode: bool,
    ) -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.attach("10.0.1.1:2".to_string(), tx).await;
        let agent = registry
            .register(
                conn.connection_id,
                Registration {
                    machine_fingerprint: fingerprint.to_string(),
                    hostname: format!("host-{fingerprint}"),
                    os_type: OsType::Linux,
                    arch: "x86_64".to_string(),
                    agent_version: "0.3.0".to_string(),
                    license_uuid: None,
                    customer_id: Some(owner),
                    agent_name: None,
                    capabilities: None,
                    has_display: false,
                },
            )
            .await
            .unwrap();
        if master_mode {
            let mut row = store.agent_by_id(agent.agent_id).await.unwrap();
            row.master_mode_enabled = true;
            store.upsert_agent(row).await;
        }
        Peer {
            agent_id: agent.agent_id,
            connection_id: conn.connection_id,
            rx,
        }
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Duration::from_secs(5),
            64,
        ));
        let relay = Arc::new(MasterRelay::new(
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn Store>,
            Duration::from_secs(5),
        ));

        let owner = Uuid::new_v4();
        let master = connect(&registry, &store, owner, "fp-master", true).await;
        let target = connect(&registry, &store, owner, "fp-target", false).await;

        let master_row = store.agent_by_id(master.agent_id).await.unwrap();
        relay.maybe_register(master.connection_id, &master_row).await;

        Fixture {
            relay,
            registry,
            store,
            owner,
            master,
            target,
        }
    }

    async fn next_relay_response(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>) -> (String, Option<Value>, Option<String>) {
        loop {
            match rx.recv().await.expect("master frame") {
                OutboundFrame::Message(ServerMessage::RelayResponse { id, result, error }) => {
                    return (id, result, error);
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn relay_in_scope_returns_target_result() {
        let mut f = fixture().await;
        f.relay
            .handle_relay(
                f.master.connection_id,
                "r1".to_string(),
                Some(f.target.agent_id),
                "shell_exec".to_string(),
                json!({"command": "echo hi"}),
            )
            .await;

        // The target receives the forwarded request.
        let frame = f.target.rx.recv().await.unwrap();
        let (id, method) = match frame {
            OutboundFrame::Message(ServerMessage::Request { id, method, params }) => {
                assert_eq!(params["command"], "echo hi");
                (id, method)
            }
            other => panic!("expected request, got {other:?}"),
        };
        assert_eq!(method, "shell_exec");
        f.registry
            .resolve_response(f.target.connection_id, &id, Ok(json!({"stdout": "hi\n"})))
            .await;

        let (rid, result, error) = next_relay_response(&mut f.master.rx).await;
        assert_eq!(rid, "r1");
        assert!(error.is_none());
        assert_eq!(result.unwrap()["stdout"], "hi\n");
        assert_eq!(f.relay.relays_executed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn relay_outside_scope_denied() {
        let mut f = fixture().await;
        let foreign = connect(&f.registry, &f.store, Uuid::new_v4(), "fp-foreign", false).await;

        f.relay
            .handle_relay(
                f.master.connection_id,
                "r2".to_string(),
                Some(foreign.agent_id),
                "shell_exec".to_string(),
                json!({}),
            )
            .await;

        let (rid, result, error) = next_relay_response(&mut f.master.rx).await;
        assert_eq!(rid, "r2");
        assert!(result.is_none());
        assert!(error.unwrap().starts_with("Access denied"));
        assert_eq!(f.relay.relays_denied.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn relay_to_disconnected_target_denied() {
        let mut f = fixture().await;
        f.registry.detach(f.target.connection_id).await;

        f.relay
            .handle_relay(
                f.master.connection_id,
                "r3".to_string(),
                Some(f.target.agent_id),
                "shell_exec".to_string(),
                json!({}),
            )
            .await;

        let (_, result, error) = next_relay_response(&mut f.master.rx).await;
        assert!(result.is_none());
        assert!(error.unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn non_master_sender_denied() {
        let mut f = fixture().await;
        // The target is not a master; its relay attempts are refused.
        f.relay
            .handle_relay(
                f.target.connection_id,
                "r4".to_string(),
                Some(f.master.agent_id),
                "shell_exec".to_string(),
                json!({}),
            )
            .await;

        let (_, result, error) = next_relay_response(&mut f.target.rx).await;
        assert!(result.is_none());
        assert!(error.unwrap().contains("master"));
    }

    #[tokio::test]
    async fn accessible_agents_excludes_master_and_marks_connected() {
        let mut f = fixture().await;
        // One extra peer in scope, disconnected.
        let offline = connect(&f.registry, &f.store, f.owner, "fp-offline", false).await;
        f.registry.detach(offline.connection_id).await;

        f.relay
            .handle_relay(
                f.master.connection_id,
                "r5".to_string(),
                None,
                "getAccessibleAgents".to_string(),
                json!({}),
            )
            .await;

        let (_, result, error) = next_relay_response(&mut f.master.rx).await;
        assert!(error.is_none());
        let agents = result.unwrap()["agents"].as_array().unwrap().clone();
        assert_eq!(agents.len(), 2);
        assert!(
            agents
                .iter()
                .all(|a| a["agentId"] != f.master.agent_id.to_string())
        );
        let by_id = |id: Uuid| {
            agents
                .iter()
                .find(|a| a["agentId"] == id.to_string())
                .unwrap()
                .clone()
        };
        assert_eq!(by_id(f.target.agent_id)["connected"], true);
        assert_eq!(by_id(offline.agent_id)["connected"], false);
        assert_eq!(
            by_id(f.target.agent_id)["name"],
            "host-fp-target"
        );
    }

    #[tokio::test]
    async fn master_disconnect_aborts_inflight_relays() {
        let mut f = fixture().await;
        f.relay
            .handle_relay(
                f.master.connection_id,
                "r6".to_string(),
                Some(f.target.agent_id),
                "shell_exec".to_string(),
                json!({}),
            )
            .await;
        // The forwarded request is in flight on the target.
        let _ = f.target.rx.recv().await.unwrap();

        f.relay.unregister(f.master.connection_id).await;
        assert_eq!(f.relay.session_count().await, 0);
        assert!(!f.relay.is_master(f.master.connection_id).await);
    }
}
