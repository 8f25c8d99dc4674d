//! Session transport: the WebSocket loop behind every connected agent.
//!
//! One reader loop per socket, one writer task fed by the registry's
//! outbound channel - a single-writer discipline so JSON frames and
//! header/binary pairs never interleave. Inbound frames dispatch on their
//! `type` tag; unknown types are logged and ignored.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::{Instant, interval};
use uuid::Uuid;

use tether_protocol::{
    AgentConfigUpdate, AgentMessage, ControlError, FrameHeader, FramePairError, RegisteredConfig,
    ServerMessage,
};

use crate::registry::{OutboundFrame, Registration, StateDelta};
use crate::store::unix_now;
use crate::web::AppState;

/// Interval between WebSocket ping frames.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum time without a pong before the connection is considered dead.
/// Allows 3 missed pings.
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);

/// Close codes per the agent protocol.
const CLOSE_REGISTRATION_FAILED: u16 = 4000;

/// What the reader loop should do after handling a frame.
enum Flow {
    Continue,
    Close,
}

pub async fn handle_agent_socket(socket: WebSocket, remote_addr: String, state: Arc<AppState>) {
    let (mut sink, mut source) = socket.split();

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<OutboundFrame>();

    // Writer task: sole owner of the sink.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame {
                OutboundFrame::Message(message) => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(err) => {
                            tracing::error!("Failed to serialize outbound frame: {err}");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Ping => {
                    if sink.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let conn = state.registry.attach(remote_addr.clone(), outbound_tx).await;
    let connection_id = conn.connection_id;
    tracing::info!(%connection_id, %remote_addr, "Agent WebSocket connected, awaiting registration");

    let mut session = AgentSession {
        state: Arc::clone(&state),
        connection_id,
        pending_header: None,
        power_dirty: false,
    };

    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await; // consume the immediate first tick
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!(%connection_id, "Agent WebSocket ping timeout, closing");
                    break;
                }
                if conn.send(OutboundFrame::Ping).is_err() {
                    break;
                }
            }
            message = source.next() => {
                let Some(message) = message else { break };
                match message {
                    Ok(Message::Text(text)) => {
                        match session.handle_text(&text).await {
                            Flow::Continue => {}
                            Flow::Close => break,
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        session.handle_binary(data.into()).await;
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                        state.registry.update_ping(connection_id).await;
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!(%connection_id, "Agent WebSocket closed");
                        break;
                    }
                    Err(err) => {
                        tracing::debug!(%connection_id, "Agent WebSocket error: {err}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.registry.detach(connection_id).await;
    // Dropping the last sender lets the writer flush queued frames (the
    // registration-failure close among them) and exit on its own.
    drop(conn);
    if tokio::time::timeout(Duration::from_secs(2), writer)
        .await
        .is_err()
    {
        tracing::debug!(%connection_id, "Writer task did not drain in time");
    }
    tracing::info!(%connection_id, "Agent WebSocket disconnected");
}

struct AgentSession {
    state: Arc<AppState>,
    connection_id: Uuid,
    /// A stream_frame header whose binary payload has not arrived yet.
    pending_header: Option<FrameHeader>,
    /// Power state changed since the last heartbeat_ack carried a config.
    power_dirty: bool,
}

impl AgentSession {
    async fn handle_text(&mut self, text: &str) -> Flow {
        // A header must be chased by its binary payload, nothing else. Any
        // text frame in between (a second header included) leaves the
        // pending header dangling and ends that session.
        if let Some(header) = self.pending_header.take() {
            tracing::warn!(
                connection_id = %self.connection_id,
                session_id = %header.session_id,
                violation = %FramePairError::DanglingHeader,
                "Stream frame pairing violated"
            );
            self.state
                .streams
                .teardown(header.session_id, crate::stream::StreamEnd::ProtocolViolation)
                .await;
        }

        let message: AgentMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(connection_id = %self.connection_id, "Unparseable agent frame: {err}");
                return Flow::Continue;
            }
        };

        match message {
            AgentMessage::Register {
                machine_id,
                machine_name,
                os_type,
                os_version: _,
                arch,
                agent_version,
                fingerprint,
                license_uuid,
                customer_id,
                agent_name,
                capabilities,
                has_display,
            } => {
                let registration = Registration {
                    machine_fingerprint: machine_id,
                    hostname: if fingerprint.hostname.is_empty() {
                        machine_name
                    } else {
                        fingerprint.hostname
                    },
                    os_type,
                    arch,
                    agent_version,
                    license_uuid,
                    customer_id,
                    agent_name,
                    capabilities,
                    has_display: has_display.unwrap_or(false),
                };
                self.handle_register(registration).await
            }
            AgentMessage::Heartbeat {
                timestamp: _,
                power_state,
                is_screen_locked,
                has_display,
                current_task,
            } => {
                self.handle_heartbeat(StateDelta {
                    power_state,
                    is_screen_locked,
                    has_display,
                    current_task: current_task.map(Some),
                })
                .await;
                Flow::Continue
            }
            AgentMessage::StateChange {
                power_state,
                is_screen_locked,
                current_task,
            } => {
                self.handle_state_change(StateDelta {
                    power_state,
                    is_screen_locked,
                    has_display: None,
                    current_task: current_task.map(Some),
                })
                .await;
                Flow::Continue
            }
            AgentMessage::ToolsChanged { .. } => {
                self.refresh_capabilities();
                Flow::Continue
            }
            AgentMessage::Response { id, result } => {
                self.state
                    .registry
                    .resolve_response(
                        self.connection_id,
                        &id,
                        Ok(result.unwrap_or(Value::Null)),
                    )
                    .await;
                Flow::Continue
            }
            AgentMessage::Error { id, error } => {
                self.state
                    .registry
                    .resolve_response(
                        self.connection_id,
                        &id,
                        Err(ControlError::PeerError(error)),
                    )
                    .await;
                Flow::Continue
            }
            AgentMessage::Pong => {
                self.state.registry.update_ping(self.connection_id).await;
                Flow::Continue
            }
            AgentMessage::RelayRequest {
                id,
                target_agent_id,
                method,
                params,
            } => {
                self.state
                    .masters
                    .handle_relay(self.connection_id, id, target_agent_id, method, params)
                    .await;
                Flow::Continue
            }
            AgentMessage::StreamStarted { session_id, .. } => {
                self.state.streams.note_stream_started(session_id).await;
                Flow::Continue
            }
            AgentMessage::StreamStopped { session_id, .. } => {
                self.state.streams.on_stream_stopped(session_id).await;
                Flow::Continue
            }
            AgentMessage::StreamCursor { session_id, detail } => {
                self.state.streams.relay_cursor(session_id, detail).await;
                Flow::Continue
            }
            AgentMessage::StreamError { session_id, error } => {
                self.state.streams.relay_stream_error(session_id, error).await;
                Flow::Continue
            }
            AgentMessage::StreamFrame(header) => {
                if header.validate().is_err() {
                    tracing::warn!(
                        session_id = %header.session_id,
                        frame_size = header.frame_size,
                        "Oversized frame header"
                    );
                    self.state
                        .streams
                        .teardown(header.session_id, crate::stream::StreamEnd::ProtocolViolation)
                        .await;
                } else {
                    self.pending_header = Some(header);
                }
                Flow::Continue
            }
            AgentMessage::Unknown => {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    "Ignoring unknown agent message type"
                );
                Flow::Continue
            }
        }
    }

    async fn handle_binary(&mut self, data: bytes::Bytes) {
        match self.pending_header.take() {
            Some(header) => {
                // relay_frame verifies the announced size and tears the
                // session down on mismatch.
                self.state.streams.relay_frame(header, data).await;
            }
            None => {
                // No session to tear down: the header that would name it
                // never arrived.
                tracing::warn!(
                    connection_id = %self.connection_id,
                    len = data.len(),
                    violation = %FramePairError::MissingHeader,
                    "Binary frame dropped"
                );
            }
        }
    }

    async fn handle_register(&mut self, registration: Registration) -> Flow {
        let conn = match self.state.registry.connection(self.connection_id).await {
            Some(conn) => conn,
            None => return Flow::Close,
        };

        match self.state.registry.register(self.connection_id, registration).await {
            Ok(agent) => {
                let power_state = conn.power_state();
                let state_label = if agent.license_state == tether_protocol::LicenseState::Active {
                    "ACTIVE"
                } else {
                    "DEGRADED"
                };
                let _ = conn.send(OutboundFrame::Message(ServerMessage::Registered {
                    id: self.connection_id,
                    agent_id: agent.agent_id,
                    license_status: agent.license_state,
                    license_uuid: agent.license_uuid,
                    state: state_label.to_string(),
                    power_state,
                    config: RegisteredConfig {
                        heartbeat_interval: power_state.heartbeat_interval_ms(),
                        grace_hours: self.state.config.policy.heartbeat_grace_hours,
                    },
                }));
                self.state
                    .masters
                    .maybe_register(self.connection_id, &agent)
                    .await;
                Flow::Continue
            }
            Err(err) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    code = err.code(),
                    "Registration failed"
                );
                let _ = conn.send(OutboundFrame::Message(ServerMessage::Error {
                    error: "Registration failed".to_string(),
                }));
                let _ = conn.send(OutboundFrame::Close {
                    code: CLOSE_REGISTRATION_FAILED,
                    reason: "registration failed".to_string(),
                });
                Flow::Close
            }
        }
    }

    async fn handle_heartbeat(&mut self, delta: StateDelta) {
        let registry = &self.state.registry;
        registry.update_ping(self.connection_id).await;
        if registry.update_state(self.connection_id, delta).await.is_some() {
            self.power_dirty = true;
        }

        let Some(conn) = registry.connection(self.connection_id).await else {
            return;
        };
        let Some(agent_id) = conn.agent_id() else {
            tracing::debug!(
                connection_id = %self.connection_id,
                "Heartbeat before registration, ignored"
            );
            return;
        };
        let Some(agent) = self.state.store.agent_by_id(agent_id).await else {
            return;
        };

        let decision = self.state.policy.evaluate(&agent, unix_now()).await;
        let pending_commands = registry.has_queued_commands(self.connection_id).await;

        // The ack carries a config whenever the license status flipped or a
        // power transition changed the heartbeat cadence.
        let config = if decision.license_changed || self.power_dirty {
            self.power_dirty = false;
            Some(AgentConfigUpdate {
                heartbeat_interval: Some(conn.power_state().heartbeat_interval_ms()),
                state: Some(decision.agent_state().to_string()),
                power_state: None,
            })
        } else {
            None
        };

        let _ = conn.send(OutboundFrame::Message(ServerMessage::HeartbeatAck {
            id: Uuid::new_v4().to_string(),
            license_status: decision.license_status,
            license_changed: decision.license_changed,
            license_message: decision.license_message,
            pending_commands,
            u: decision.update_flag,
            default_browser: decision.default_browser,
            permissions: decision.permissions,
            config,
        }));
    }

    async fn handle_state_change(&mut self, delta: StateDelta) {
        let transition = self
            .state
            .registry
            .update_state(self.connection_id, delta)
            .await;
        if let Some((old, new)) = transition {
            self.power_dirty = true;
            tracing::info!(
                connection_id = %self.connection_id,
                ?old,
                ?new,
                "Agent power state changed"
            );
            // Tell the agent its new cadence right away; the next
            // heartbeat_ack repeats it.
            if let Some(conn) = self.state.registry.connection(self.connection_id).await {
                let _ = conn.send(OutboundFrame::Message(ServerMessage::Config {
                    id: Uuid::new_v4().to_string(),
                    config: AgentConfigUpdate {
                        heartbeat_interval: Some(new.heartbeat_interval_ms()),
                        state: None,
                        power_state: Some(new),
                    },
                }));
            }
        }
    }

    /// The agent's toolset changed: re-fetch its capability list and update
    /// the persistent set the capability store serves from. Back-to-back
    /// tools_changed bursts collapse into one fetch.
    fn refresh_capabilities(&self) {
        let state = Arc::clone(&self.state);
        let connection_id = self.connection_id;
        tokio::spawn(async move {
            let Some(conn) = state.registry.connection(connection_id).await else {
                return;
            };
            let Some(agent_id) = conn.agent_id() else { return };
            if let Some(fetched_at) = conn.capabilities_fetched_at()
                && unix_now().saturating_sub(fetched_at) < 2
            {
                return;
            }
            match state
                .registry
                .send_command(connection_id, "tools/list", serde_json::json!({}))
                .await
            {
                Ok(result) => {
                    let names = capability_names(&result);
                    tracing::info!(
                        %agent_id,
                        count = names.len(),
                        "Refreshed agent tool capabilities"
                    );
                    state.store.set_agent_capabilities(agent_id, names).await;
                    conn.mark_capabilities_fetched();
                }
                Err(err) => {
                    tracing::debug!(%agent_id, code = err.code(), "Capability refresh failed");
                }
            }
        });
    }
}

/// Extract tool names from an agent's tools/list result. Accepts both bare
/// name arrays and MCP-style `{tools: [{name}]}` shapes.
fn capability_names(result: &Value) -> Vec<String> {
    let list = result
        .get("tools")
        .and_then(Value::as_array)
        .or_else(|| result.as_array());
    let Some(list) = list else { return Vec::new() };
    list.iter()
        .filter_map(|entry| {
            entry
                .as_str()
                .or_else(|| entry.get("name").and_then(Value::as_str))
                .map(str::to_string)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capability_names_from_mcp_shape() {
        let result = json!({"tools": [{"name": "screenshot"}, {"name": "shell_exec"}]});
        assert_eq!(capability_names(&result), vec!["screenshot", "shell_exec"]);
    }

    #[test]
    fn capability_names_from_bare_array() {
        let result = json!(["fs_list", "fs_read"]);
        assert_eq!(capability_names(&result), vec!["fs_list", "fs_read"]);
    }

    #[test]
    fn capability_names_from_garbage() {
        assert!(capability_names(&json!({"weird": true})).is_empty());
        assert!(capability_names(&json!(42)).is_empty());
    }
}
