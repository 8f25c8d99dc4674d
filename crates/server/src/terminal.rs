//! Terminal broker: interactive shell sessions between a viewer and an
//! agent.
//!
//! The token flow mirrors the stream broker. After binding, the broker
//! starts a shell on the agent and keeps the agent's shell session id to
//! itself - the viewer only ever sees the broker-assigned session id, so
//! the shell can be rotated without the viewer noticing. The agent shell
//! API is pull-based, so an output pump polls it on a fixed cadence and
//! forwards non-empty payloads.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use tether_protocol::{ControlError, TerminalConfig, ViewerEvent, ViewerMessage};

use crate::auth::{self, Claims};
use crate::dispatch::{DispatchTarget, Dispatcher};
use crate::registry::AgentRegistry;
use crate::store::{Store, TerminalTokenRecord, unix_now};

const BIND_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive poll failures tolerated before the session is torn down.
const MAX_POLL_FAILURES: u32 = 3;

#[derive(Debug)]
pub enum TerminalFrame {
    Event(ViewerEvent),
    Close { code: u16, reason: String },
}

pub struct TerminalSession {
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub agent_connection_id: Uuid,
    /// Correlator for shell_input/shell_resize/shell_stop on the agent.
    pub shell_session_id: String,
    pub user_id: String,
    viewer_tx: mpsc::UnboundedSender<TerminalFrame>,
    pub created_at: u64,
    last_activity: AtomicU64,
}

impl TerminalSession {
    fn touch(&self) {
        self.last_activity.fetch_max(unix_now(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalConnectRequest {
    pub agent_id: Uuid,
}

pub struct TerminalBroker {
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn Store>,
    config: TerminalConfig,
    sessions: RwLock<HashMap<Uuid, Arc<TerminalSession>>>,
    by_agent: RwLock<HashMap<Uuid, Vec<Uuid>>>,
}

impl TerminalBroker {
    pub fn new(
        registry: Arc<AgentRegistry>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn Store>,
        config: TerminalConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            store,
            config,
            sessions: RwLock::new(HashMap::new()),
            by_agent: RwLock::new(HashMap::new()),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn session(&self, session_id: Uuid) -> Option<Arc<TerminalSession>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Mint a one-shot terminal token for a connected agent in the caller's
    /// owner scope.
    pub async fn mint_token(
        &self,
        claims: &Claims,
        req: &TerminalConnectRequest,
        remote_address: String,
    ) -> Result<(String, u64), ControlError> {
        let agent = self
            .store
            .agent_by_id(req.agent_id)
            .await
            .ok_or(ControlError::NotConnected)?;
        if agent.owner_id != claims.owner {
            return Err(ControlError::NotAuthorized);
        }
        if !self.registry.is_agent_connected(req.agent_id).await {
            return Err(ControlError::NotConnected);
        }

        let token = auth::generate_session_token();
        let expires_at = unix_now() + self.config.token_ttl_s;
        self.store
            .put_terminal_token(TerminalTokenRecord {
                token: token.clone(),
                agent_id: req.agent_id,
                user_id: claims.sub.clone(),
                remote_address,
                expires_at,
            })
            .await;

        tracing::info!(agent_id = %req.agent_id, user = %claims.sub, "Terminal token minted");
        Ok((token, expires_at))
    }

    /// Redeem the token, start the agent-side shell, and register the live
    /// session. Returns the session together with the started shell id.
    async fn bind_session(
        &self,
        token: &str,
        viewer_tx: mpsc::UnboundedSender<TerminalFrame>,
    ) -> Result<Arc<TerminalSession>, ControlError> {
        let record = self
            .store
            .take_terminal_token(token)
            .await
            .filter(|t| t.expires_at > unix_now())
            .ok_or(ControlError::AuthFailed)?;

        let conn = self
            .registry
            .connection_for_agent(record.agent_id)
            .await
            .ok_or(ControlError::NotConnected)?;

        let started = self
            .dispatcher
            .dispatch(
                DispatchTarget::Agent(conn.connection_id),
                "terminal_start",
                json!({}),
            )
            .await?;
        let shell_session_id = started
            .get("sessionId")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                ControlError::PeerError("shell start returned no session id".to_string())
            })?
            .to_string();

        let session = Arc::new(TerminalSession {
            session_id: Uuid::new_v4(),
            agent_id: record.agent_id,
            agent_connection_id: conn.connection_id,
            shell_session_id,
            user_id: record.user_id,
            viewer_tx,
            created_at: unix_now(),
            last_activity: AtomicU64::new(unix_now()),
        });

        self.sessions
            .write()
            .await
            .insert(session.session_id, Arc::clone(&session));
        self.by_agent
            .write()
            .await
            .entry(record.agent_id)
            .or_default()
            .push(session.session_id);

        Ok(session)
    }

    /// Output pump: poll the agent shell until the session is evicted. The
    /// loop observes eviction through the session map, so a teardown from
    /// any path stops it within one cadence tick.
    async fn pump_output(self: Arc<Self>, session: Arc<TerminalSession>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut failures = 0u32;

        loop {
            interval.tick().await;
            if self.session(session.session_id).await.is_none() {
                break;
            }

            let result = self
                .registry
                .send_command_with_timeout(
                    session.agent_connection_id,
                    "shell_output",
                    json!({"sessionId": session.shell_session_id}),
                    POLL_COMMAND_TIMEOUT,
                )
                .await;

            match result {
                Ok(output) => {
                    failures = 0;
                    let data = output
                        .get("data")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("");
                    if !data.is_empty() {
                        session.touch();
                        let _ = session.viewer_tx.send(TerminalFrame::Event(
                            ViewerEvent::TerminalOutput {
                                session_id: session.session_id,
                                data: data.to_string(),
                            },
                        ));
                    }
                }
                Err(ControlError::AgentDisconnected) | Err(ControlError::NotConnected) => {
                    self.teardown(session.session_id, true).await;
                    break;
                }
                Err(err) => {
                    failures += 1;
                    tracing::debug!(
                        session_id = %session.session_id,
                        code = err.code(),
                        failures,
                        "Shell output poll failed"
                    );
                    if failures >= MAX_POLL_FAILURES {
                        self.teardown(session.session_id, false).await;
                        break;
                    }
                }
            }
        }
    }

    /// Forward viewer input to the agent shell.
    async fn forward_input(&self, session: &TerminalSession, data: String) {
        session.touch();
        let result = self
            .dispatcher
            .dispatch(
                DispatchTarget::Agent(session.agent_connection_id),
                "terminal_input",
                json!({"sessionId": session.shell_session_id, "data": data}),
            )
            .await;
        if let Err(err) = result {
            tracing::debug!(
                session_id = %session.session_id,
                code = err.code(),
                "Terminal input relay failed"
            );
        }
    }

    async fn forward_resize(&self, session: &TerminalSession, cols: u16, rows: u16) {
        let result = self
            .dispatcher
            .dispatch(
                DispatchTarget::Agent(session.agent_connection_id),
                "terminal_resize",
                json!({"sessionId": session.shell_session_id, "cols": cols, "rows": rows}),
            )
            .await;
        if let Err(err) = result {
            tracing::debug!(
                session_id = %session.session_id,
                code = err.code(),
                "Terminal resize relay failed"
            );
        }
    }

    /// Disconnect hook body.
    pub async fn end_sessions_for_agent(&self, agent_id: Uuid) {
        let ids = self
            .by_agent
            .read()
            .await
            .get(&agent_id)
            .cloned()
            .unwrap_or_default();
        for session_id in ids {
            self.teardown(session_id, true).await;
        }
    }

    /// Evict the session and best-effort stop the agent shell. Teardown is
    /// tolerant: every leg may already be gone.
    pub async fn teardown(&self, session_id: Uuid, agent_gone: bool) {
        let Some(session) = self.sessions.write().await.remove(&session_id) else {
            return;
        };
        {
            let mut by_agent = self.by_agent.write().await;
            if let Some(ids) = by_agent.get_mut(&session.agent_id) {
                ids.retain(|id| *id != session_id);
                if ids.is_empty() {
                    by_agent.remove(&session.agent_id);
                }
            }
        }

        let close_code = if agent_gone {
            let _ = session.viewer_tx.send(TerminalFrame::Event(ViewerEvent::Error {
                error: "agent disconnected".to_string(),
                code: Some(ControlError::AgentDisconnected.code().to_string()),
            }));
            1001
        } else {
            1000
        };
        let _ = session.viewer_tx.send(TerminalFrame::Close {
            code: close_code,
            reason: String::new(),
        });

        if !agent_gone {
            let dispatcher = Arc::clone(&self.dispatcher);
            let connection_id = session.agent_connection_id;
            let shell_id = session.shell_session_id.clone();
            tokio::spawn(async move {
                let _ = dispatcher
                    .dispatch(
                        DispatchTarget::Agent(connection_id),
                        "terminal_stop",
                        json!({"sessionId": shell_id}),
                    )
                    .await;
            });
        }

        tracing::info!(%session_id, agent_id = %session.agent_id, "Terminal session ended");
    }

    /// End sessions idle past `max_idle`.
    pub async fn sweep_idle(&self, max_idle: Duration) {
        let cutoff = unix_now().saturating_sub(max_idle.as_secs());
        let stale: Vec<Uuid> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.last_activity() < cutoff)
            .map(|s| s.session_id)
            .collect();
        for session_id in stale {
            tracing::info!(%session_id, "Reaping idle terminal session");
            self.teardown(session_id, false).await;
        }
    }

    /// Full viewer socket lifecycle.
    pub async fn handle_viewer_socket(self: Arc<Self>, socket: WebSocket, remote_addr: String) {
        let (mut sink, mut source) = socket.split();

        let first = tokio::time::timeout(BIND_TIMEOUT, source.next()).await;
        let token = match first {
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ViewerMessage>(&text) {
                    Ok(ViewerMessage::TerminalStart { session_token }) => Some(session_token),
                    _ => None,
                }
            }
            _ => None,
        };
        let Some(token) = token else {
            let _ = close_unauthorized(&mut sink).await;
            return;
        };

        let (viewer_tx, mut viewer_rx) = mpsc::unbounded_channel();
        let session = match self.bind_session(&token, viewer_tx).await {
            Ok(session) => session,
            Err(err) => {
                tracing::info!(%remote_addr, code = err.code(), "Terminal bind rejected");
                let _ = close_unauthorized(&mut sink).await;
                return;
            }
        };

        tracing::info!(
            session_id = %session.session_id,
            agent_id = %session.agent_id,
            %remote_addr,
            "Viewer bound to terminal session"
        );

        let _ = session
            .viewer_tx
            .send(TerminalFrame::Event(ViewerEvent::TerminalStarted {
                session_id: session.session_id,
            }));

        let writer = tokio::spawn(async move {
            while let Some(frame) = viewer_rx.recv().await {
                match frame {
                    TerminalFrame::Event(event) => {
                        let Ok(json) = serde_json::to_string(&event) else { continue };
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    TerminalFrame::Close { code, reason } => {
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

        tokio::spawn(Arc::clone(&self).pump_output(Arc::clone(&session)));

        while let Some(message) = source.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            match serde_json::from_str::<ViewerMessage>(&text) {
                Ok(ViewerMessage::TerminalInput { data }) => {
                    self.forward_input(&session, data).await;
                }
                Ok(ViewerMessage::TerminalResize { cols, rows }) => {
                    self.forward_resize(&session, cols, rows).await;
                }
                Ok(ViewerMessage::TerminalStop) => break,
                Ok(ViewerMessage::Ping) => {
                    let _ = session
                        .viewer_tx
                        .send(TerminalFrame::Event(ViewerEvent::Pong));
                }
                Ok(_) => {
                    tracing::debug!(
                        session_id = %session.session_id,
                        "Unexpected viewer message type"
                    );
                }
                Err(err) => {
                    tracing::debug!(
                        session_id = %session.session_id,
                        "Invalid viewer message: {err}"
                    );
                }
            }
        }

        self.teardown(session.session_id, false).await;
        // The teardown queued a close frame; let the writer drain it.
        let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
        tracing::info!(session_id = %session.session_id, "Terminal viewer closed");
    }
}

#[async_trait::async_trait]
impl crate::registry::DisconnectHook for TerminalBroker {
    async fn agent_disconnected(&self, _connection_id: Uuid, agent_id: Option<Uuid>) {
        if let Some(agent_id) = agent_id {
            self.end_sessions_for_agent(agent_id).await;
        }
    }
}

async fn close_unauthorized(sink: &mut (impl SinkExt<Message> + Unpin)) -> Result<(), ()> {
    let event = ViewerEvent::Error {
        error: "authentication failed".to_string(),
        code: Some(ControlError::AuthFailed.code().to_string()),
    };
    if let Ok(json) = serde_json::to_string(&event) {
        let _ = sink.send(Message::Text(json.into())).await;
    }
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: 4001,
            reason: "auth failed".into(),
        })))
        .await;
    Ok(())
}
