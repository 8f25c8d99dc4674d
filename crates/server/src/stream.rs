//! Stream broker: live screen content from an agent to an authenticated
//! viewer.
//!
//! Authorization is a one-shot token minted over HTTP and consumed
//! (delete-on-read) when the viewer's WebSocket presents it. Frames flow
//! agent → transport → broker → viewer as a JSON header + binary payload
//! pair; the pair is never split or reordered. Inputs flow the other way
//! through the registry's correlation machinery.
//!
//! Backpressure: frames ride a bounded lane and are dropped when the viewer
//! cannot keep up; control events and inputs ride an unbounded lane and are
//! never dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use tether_protocol::{
    ControlError, FrameHeader, LicenseState, ServerMessage, StreamConfig, ViewerEvent,
    ViewerMessage,
};

use crate::auth::{self, Claims};
use crate::registry::AgentRegistry;
use crate::store::{Store, StreamTokenRecord, unix_now};

/// Frames queued on a session's bounded lane before the viewer socket.
const FRAME_LANE_DEPTH: usize = 32;

/// How long the viewer has to present its token after connecting.
const BIND_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for best-effort input/stop frames to the agent.
const SIDEBAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Control-lane traffic to the viewer writer task.
#[derive(Debug)]
pub enum ViewerFrame {
    Event(ViewerEvent),
    Close { code: u16, reason: String },
}

/// A header/binary pair in flight to the viewer.
pub struct RelayedFrame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

/// Why a session ended; decides what the viewer is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Normal,
    AgentDisconnected,
    ProtocolViolation,
}

#[derive(Debug)]
pub struct StreamSession {
    pub session_id: Uuid,
    pub agent_id: Uuid,
    pub agent_connection_id: Uuid,
    pub user_id: String,
    pub display_id: u32,
    params: std::sync::Mutex<(u8, u32)>, // (quality, max_fps)
    control_tx: mpsc::UnboundedSender<ViewerFrame>,
    frame_tx: mpsc::Sender<RelayedFrame>,
    pub created_at: u64,
    last_activity: AtomicU64,
    pub frames_relayed: AtomicU64,
    pub bytes_relayed: AtomicU64,
    pub inputs_relayed: AtomicU64,
}

impl StreamSession {
    fn touch(&self) {
        self.last_activity.fetch_max(unix_now(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    fn quality(&self) -> (u8, u32) {
        *self.params.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_quality(&self, quality: u8, max_fps: u32) {
        *self.params.lock().unwrap_or_else(|e| e.into_inner()) = (quality, max_fps);
    }
}

/// Request body for the mint endpoint.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConnectRequest {
    pub agent_id: Uuid,
    #[serde(default)]
    pub display_id: Option<u32>,
    #[serde(default)]
    pub quality: Option<u8>,
    #[serde(default)]
    pub max_fps: Option<u32>,
}

pub struct StreamBroker {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn Store>,
    config: StreamConfig,
    sessions: RwLock<HashMap<Uuid, Arc<StreamSession>>>,
    by_agent: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    pub frames_relayed: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub bytes_relayed: AtomicU64,
}

impl StreamBroker {
    pub fn new(registry: Arc<AgentRegistry>, store: Arc<dyn Store>, config: StreamConfig) -> Self {
        Self {
            registry,
            store,
            config,
            sessions: RwLock::new(HashMap::new()),
            by_agent: RwLock::new(HashMap::new()),
            frames_relayed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn session(&self, session_id: Uuid) -> Option<Arc<StreamSession>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    async fn sessions_for_agent(&self, agent_id: Uuid) -> Vec<Arc<StreamSession>> {
        let ids = self
            .by_agent
            .read()
            .await
            .get(&agent_id)
            .cloned()
            .unwrap_or_default();
        let sessions = self.sessions.read().await;
        ids.iter().filter_map(|id| sessions.get(id).cloned()).collect()
    }

    /// Mint a one-shot stream token. Requires the agent connected, in the
    /// ACTIVE logical state (good license), owned by the caller, and below
    /// the per-agent session cap.
    pub async fn mint_token(
        &self,
        claims: &Claims,
        req: &StreamConnectRequest,
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
        // The gate is the license-derived run state, not the power state: a
        // PASSIVE or sleeping agent is still streamable, a DEGRADED one is
        // not.
        if agent.license_state != LicenseState::Active {
            return Err(ControlError::PolicyDenied(
                "agent is not in the ACTIVE state".to_string(),
            ));
        }
        if !self.registry.is_agent_connected(req.agent_id).await {
            return Err(ControlError::NotConnected);
        }
        let live = self
            .by_agent
            .read()
            .await
            .get(&req.agent_id)
            .map(Vec::len)
            .unwrap_or(0);
        if live >= self.config.max_streams_per_agent {
            return Err(ControlError::LimitExceeded(format!(
                "{live} concurrent streams for agent"
            )));
        }

        let token = auth::generate_session_token();
        let expires_at = unix_now() + self.config.token_ttl_s;
        self.store
            .put_stream_token(StreamTokenRecord {
                token: token.clone(),
                agent_id: req.agent_id,
                user_id: claims.sub.clone(),
                display_id: req.display_id.unwrap_or(0),
                quality: req.quality.unwrap_or(75),
                max_fps: req.max_fps.unwrap_or(30),
                remote_address,
                expires_at,
            })
            .await;

        tracing::info!(agent_id = %req.agent_id, user = %claims.sub, "Stream token minted");
        Ok((token, expires_at))
    }

    /// Redeem a token and create the live session. The token is consumed by
    /// deletion before the session exists; a second redeem can never
    /// succeed. The cap is re-checked under the write lock because mints
    /// and binds race.
    async fn bind_session(
        &self,
        token: &str,
        control_tx: mpsc::UnboundedSender<ViewerFrame>,
        frame_tx: mpsc::Sender<RelayedFrame>,
    ) -> Result<Arc<StreamSession>, ControlError> {
        let record = self
            .store
            .take_stream_token(token)
            .await
            .filter(|t| t.expires_at > unix_now())
            .ok_or(ControlError::AuthFailed)?;

        let conn = self
            .registry
            .connection_for_agent(record.agent_id)
            .await
            .ok_or(ControlError::NotConnected)?;

        let session = Arc::new(StreamSession {
            session_id: Uuid::new_v4(),
            agent_id: record.agent_id,
            agent_connection_id: conn.connection_id,
            user_id: record.user_id,
            display_id: record.display_id,
            params: std::sync::Mutex::new((record.quality, record.max_fps)),
            control_tx,
            frame_tx,
            created_at: unix_now(),
            last_activity: AtomicU64::new(unix_now()),
            frames_relayed: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
            inputs_relayed: AtomicU64::new(0),
        });

        {
            let mut by_agent = self.by_agent.write().await;
            let ids = by_agent.entry(record.agent_id).or_default();
            if ids.len() >= self.config.max_streams_per_agent {
                return Err(ControlError::LimitExceeded(format!(
                    "{} concurrent streams for agent",
                    ids.len()
                )));
            }
            ids.push(session.session_id);
            self.sessions
                .write()
                .await
                .insert(session.session_id, Arc::clone(&session));
        }

        Ok(session)
    }

    /// Relay one agent frame pair to its viewer. A size mismatch tears the
    /// session down; a full frame lane drops the frame (never the pair's
    /// header alone).
    pub async fn relay_frame(&self, header: FrameHeader, payload: Bytes) {
        let Some(session) = self.session(header.session_id).await else {
            tracing::debug!(session_id = %header.session_id, "Frame for unknown stream session");
            return;
        };
        if header.check_payload(payload.len()).is_err() {
            tracing::warn!(
                session_id = %header.session_id,
                announced = header.frame_size,
                actual = payload.len(),
                "Frame payload size mismatch"
            );
            self.teardown(session.session_id, StreamEnd::ProtocolViolation)
                .await;
            return;
        }

        let bytes = payload.len() as u64;
        match session.frame_tx.try_send(RelayedFrame { header, payload }) {
            Ok(()) => {
                session.touch();
                session.frames_relayed.fetch_add(1, Ordering::Relaxed);
                session.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
                self.frames_relayed.fetch_add(1, Ordering::Relaxed);
                self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    session_id = %session.session_id,
                    "Viewer lagging, frame dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.teardown(session.session_id, StreamEnd::Normal).await;
            }
        }
    }

    /// Relay a JSON-only agent event (cursor, stream_error) to the viewer.
    pub async fn relay_cursor(&self, session_id: Uuid, detail: serde_json::Map<String, Value>) {
        if let Some(session) = self.session(session_id).await {
            session.touch();
            let _ = session.control_tx.send(ViewerFrame::Event(ViewerEvent::Cursor {
                session_id,
                detail,
            }));
        }
    }

    pub async fn relay_stream_error(&self, session_id: Uuid, error: String) {
        if let Some(session) = self.session(session_id).await {
            tracing::warn!(%session_id, %error, "Agent reported stream error");
            let _ = session.control_tx.send(ViewerFrame::Event(ViewerEvent::Error {
                error,
                code: Some(ControlError::PeerError(String::new()).code().to_string()),
            }));
        }
    }

    /// Agent announced a started stream; refreshes activity only - the
    /// viewer was already told when the stream_start command was acked.
    pub async fn note_stream_started(&self, session_id: Uuid) {
        if let Some(session) = self.session(session_id).await {
            session.touch();
        }
    }

    /// Agent announced a stopped stream.
    pub async fn on_stream_stopped(&self, session_id: Uuid) {
        self.teardown(session_id, StreamEnd::Normal).await;
    }

    /// Disconnect hook body: end every session for the agent.
    pub async fn end_sessions_for_agent(&self, agent_id: Uuid) {
        for session in self.sessions_for_agent(agent_id).await {
            self.teardown(session.session_id, StreamEnd::AgentDisconnected)
                .await;
        }
    }

    /// Remove the session and tell both sides, best-effort on the agent leg.
    pub async fn teardown(&self, session_id: Uuid, end: StreamEnd) {
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

        let (event, close_code) = match end {
            StreamEnd::Normal => (None, 1000),
            StreamEnd::AgentDisconnected => (
                Some(ViewerEvent::Error {
                    error: "agent disconnected".to_string(),
                    code: Some(ControlError::AgentDisconnected.code().to_string()),
                }),
                1001,
            ),
            StreamEnd::ProtocolViolation => (
                Some(ViewerEvent::Error {
                    error: "frame pairing violated".to_string(),
                    code: Some(ControlError::ProtocolError(String::new()).code().to_string()),
                }),
                1008,
            ),
        };
        if let Some(event) = event {
            let _ = session.control_tx.send(ViewerFrame::Event(event));
        }
        let _ = session.control_tx.send(ViewerFrame::Close {
            code: close_code,
            reason: String::new(),
        });

        if end != StreamEnd::AgentDisconnected {
            let registry = Arc::clone(&self.registry);
            let connection_id = session.agent_connection_id;
            let sid = session.session_id;
            tokio::spawn(async move {
                let _ = registry
                    .send_correlated(
                        connection_id,
                        move |id| ServerMessage::StreamStop {
                            id,
                            session_id: sid,
                        },
                        SIDEBAND_TIMEOUT,
                    )
                    .await;
            });
        }

        tracing::info!(
            %session_id,
            agent_id = %session.agent_id,
            ?end,
            frames = session.frames_relayed.load(Ordering::Relaxed),
            bytes = session.bytes_relayed.load(Ordering::Relaxed),
            inputs = session.inputs_relayed.load(Ordering::Relaxed),
            "Stream session ended"
        );
    }

    /// End sessions with no frames or inputs for `max_idle`.
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
            tracing::info!(%session_id, "Reaping idle stream session");
            self.teardown(session_id, StreamEnd::Normal).await;
        }
    }

    /// Ask the agent to restart the stream with the session's current
    /// parameters. Used for quality changes and keyframe refreshes.
    async fn restart_stream(&self, session: &StreamSession) -> Result<(), ControlError> {
        let (quality, max_fps) = session.quality();
        let sid = session.session_id;
        let display_id = session.display_id;
        let _ = self
            .registry
            .send_correlated(
                session.agent_connection_id,
                move |id| ServerMessage::StreamStop {
                    id,
                    session_id: sid,
                },
                SIDEBAND_TIMEOUT,
            )
            .await;
        self.registry
            .send_correlated(
                session.agent_connection_id,
                move |id| ServerMessage::StreamStart {
                    id,
                    session_id: sid,
                    display_id,
                    quality,
                    max_fps,
                },
                SIDEBAND_TIMEOUT,
            )
            .await
            .map(|_| ())
    }

    /// Full viewer socket lifecycle: token bind, agent stream_start, then
    /// the input/relay loop until either side goes away.
    pub async fn handle_viewer_socket(self: Arc<Self>, socket: WebSocket, remote_addr: String) {
        let (mut sink, mut source) = socket.split();

        // The token must arrive as the first message, promptly.
        let first = tokio::time::timeout(BIND_TIMEOUT, source.next()).await;
        let token = match first {
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ViewerMessage>(&text) {
                    Ok(ViewerMessage::StreamStart { session_token }) => Some(session_token),
                    _ => None,
                }
            }
            _ => None,
        };
        let Some(token) = token else {
            let _ = send_auth_failure(&mut sink).await;
            return;
        };

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (frame_tx, mut frame_rx) = mpsc::channel(FRAME_LANE_DEPTH);
        let session = match self.bind_session(&token, control_tx, frame_tx).await {
            Ok(session) => session,
            Err(err) => {
                tracing::info!(%remote_addr, code = err.code(), "Stream bind rejected");
                let _ = send_auth_failure(&mut sink).await;
                return;
            }
        };

        tracing::info!(
            session_id = %session.session_id,
            agent_id = %session.agent_id,
            %remote_addr,
            "Viewer bound to stream session"
        );

        // Writer task: control events first, frame pairs otherwise. The
        // header and its binary payload are written back-to-back so the
        // pairing invariant holds on the viewer leg.
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    control = control_rx.recv() => match control {
                        Some(ViewerFrame::Event(event)) => {
                            let Ok(json) = serde_json::to_string(&event) else { continue };
                            if sink.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(ViewerFrame::Close { code, reason }) => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code,
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                        None => break,
                    },
                    frame = frame_rx.recv() => match frame {
                        Some(RelayedFrame { header, payload }) => {
                            let event = ViewerEvent::Frame {
                                session_id: header.session_id,
                                sequence: header.sequence,
                                timestamp: header.timestamp,
                                num_rects: header.num_rects,
                                frame_size: header.frame_size,
                            };
                            let Ok(json) = serde_json::to_string(&event) else { continue };
                            if sink.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                            if sink.send(Message::Binary(payload)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // Start the stream on the agent; the viewer learns the session id
        // from the ack.
        let (quality, max_fps) = session.quality();
        let sid = session.session_id;
        let display_id = session.display_id;
        let started = self
            .registry
            .send_correlated(
                session.agent_connection_id,
                move |id| ServerMessage::StreamStart {
                    id,
                    session_id: sid,
                    display_id,
                    quality,
                    max_fps,
                },
                SIDEBAND_TIMEOUT,
            )
            .await;
        match started {
            Ok(_) => {
                let _ = session
                    .control_tx
                    .send(ViewerFrame::Event(ViewerEvent::StreamStarted {
                        session_id: session.session_id,
                    }));
            }
            Err(err) => {
                tracing::warn!(session_id = %sid, code = err.code(), "Agent refused stream start");
                let _ = session.control_tx.send(ViewerFrame::Event(ViewerEvent::Error {
                    error: err.to_string(),
                    code: Some(err.code().to_string()),
                }));
                self.teardown(session.session_id, StreamEnd::Normal).await;
            }
        }

        // Viewer read loop.
        while let Some(message) = source.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let parsed: ViewerMessage = match serde_json::from_str(&text) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::debug!(session_id = %sid, "Invalid viewer message: {err}");
                    continue;
                }
            };
            match parsed {
                ViewerMessage::Input { .. } => {
                    session.touch();
                    session.inputs_relayed.fetch_add(1, Ordering::Relaxed);
                    let mut input = serde_json::to_value(&parsed).unwrap_or(Value::Null);
                    if let Some(map) = input.as_object_mut() {
                        map.remove("type");
                    }
                    let registry = Arc::clone(&self.registry);
                    let connection_id = session.agent_connection_id;
                    tokio::spawn(async move {
                        if let Err(err) = registry
                            .send_correlated(
                                connection_id,
                                move |id| ServerMessage::StreamInput {
                                    id,
                                    session_id: sid,
                                    input,
                                },
                                SIDEBAND_TIMEOUT,
                            )
                            .await
                        {
                            tracing::debug!(session_id = %sid, code = err.code(), "Input relay failed");
                        }
                    });
                }
                ViewerMessage::QualityChange { quality, max_fps } => {
                    let current = session.quality();
                    session.set_quality(quality, max_fps.unwrap_or(current.1));
                    if let Err(err) = self.restart_stream(&session).await {
                        tracing::warn!(session_id = %sid, code = err.code(), "Quality restart failed");
                    }
                }
                ViewerMessage::Refresh => {
                    if let Err(err) = self.restart_stream(&session).await {
                        tracing::warn!(session_id = %sid, code = err.code(), "Refresh restart failed");
                    }
                }
                ViewerMessage::StreamStop => break,
                ViewerMessage::Ping => {
                    let _ = session
                        .control_tx
                        .send(ViewerFrame::Event(ViewerEvent::Pong));
                }
                _ => {
                    tracing::debug!(session_id = %sid, "Unexpected viewer message type");
                }
            }
        }

        self.teardown(session.session_id, StreamEnd::Normal).await;
        // The teardown queued a close frame; let the writer drain it.
        let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
        tracing::info!(session_id = %sid, "Viewer socket closed");
    }
}

#[async_trait::async_trait]
impl crate::registry::DisconnectHook for StreamBroker {
    async fn agent_disconnected(&self, _connection_id: Uuid, agent_id: Option<Uuid>) {
        if let Some(agent_id) = agent_id {
            self.end_sessions_for_agent(agent_id).await;
        }
    }
}

async fn send_auth_failure(
    sink: &mut (impl SinkExt<Message> + Unpin),
) -> Result<(), ()> {
    let event = ViewerEvent::Error {
        error: "authentication failed".to_string(),
        code: Some(ControlError::AuthFailed.code().to_string()),
    };
    let json = serde_json::to_string(&event).map_err(|_| ())?;
    let _ = sink.send(Message::Text(json.into())).await;
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: 4001,
            reason: "auth failed".into(),
        })))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{OutboundFrame, Registration, StateDelta};
    use crate::store::MemStore;
    use tether_protocol::{OsType, PowerState};

    struct Fixture {
        broker: Arc<StreamBroker>,
        registry: Arc<AgentRegistry>,
        store: Arc<MemStore>,
        agent_id: Uuid,
        connection_id: Uuid,
        _agent_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Duration::from_secs(5),
            64,
        ));
        let broker = Arc::new(StreamBroker::new(
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn Store>,
            StreamConfig {
                token_ttl_s: 300,
                max_streams_per_agent: 3,
            },
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.attach("10.0.0.2:7".to_string(), tx).await;
        let owner = Uuid::new_v4();
        let agent = registry
            .register(
                conn.connection_id,
                Registration {
                    machine_fingerprint: "fp-stream".to_string(),
                    hostname: "host-stream".to_string(),
                    os_type: OsType::Linux,
                    arch: "x86_64".to_string(),
                    agent_version: "0.3.0".to_string(),
                    license_uuid: None,
                    customer_id: Some(owner),
                    agent_name: None,
                    capabilities: None,
                    has_display: true,
                },
            )
            .await
            .unwrap();
        // Registration leaves the row pending; streaming needs an active
        // license, granted out of band.
        let mut row = store.agent_by_id(agent.agent_id).await.unwrap();
        row.license_state = LicenseState::Active;
        store.upsert_agent(row).await;

        Fixture {
            broker,
            registry,
            store,
            agent_id: agent.agent_id,
            connection_id: conn.connection_id,
            _agent_rx: rx,
        }
    }

    fn claims(owner: Uuid) -> Claims {
        Claims {
            sub: "u1".to_string(),
            owner,
            exp: unix_now() + 3600,
            iat: unix_now(),
        }
    }

    fn connect_request(agent_id: Uuid) -> StreamConnectRequest {
        StreamConnectRequest {
            agent_id,
            display_id: Some(0),
            quality: Some(75),
            max_fps: Some(30),
        }
    }

    async fn bind(f: &Fixture) -> (
        Arc<StreamSession>,
        mpsc::UnboundedReceiver<ViewerFrame>,
        mpsc::Receiver<RelayedFrame>,
    ) {
        let owner = f.store.agent_by_id(f.agent_id).await.unwrap().owner_id;
        let (token, _) = f
            .broker
            .mint_token(&claims(owner), &connect_request(f.agent_id), "v".to_string())
            .await
            .unwrap();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_LANE_DEPTH);
        let session = f
            .broker
            .bind_session(&token, control_tx, frame_tx)
            .await
            .unwrap();
        (session, control_rx, frame_rx)
    }

    fn header(session_id: Uuid, sequence: u64, frame_size: u32) -> FrameHeader {
        FrameHeader {
            session_id,
            sequence,
            timestamp: 1_700_000_000,
            num_rects: 1,
            frame_size,
        }
    }

    #[tokio::test]
    async fn mint_requires_connected_agent() {
        let f = fixture().await;
        let owner = f.store.agent_by_id(f.agent_id).await.unwrap().owner_id;
        let err = f
            .broker
            .mint_token(&claims(owner), &connect_request(Uuid::new_v4()), "v".to_string())
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::NotConnected);
    }

    #[tokio::test]
    async fn mint_requires_owner_scope() {
        let f = fixture().await;
        let err = f
            .broker
            .mint_token(
                &claims(Uuid::new_v4()),
                &connect_request(f.agent_id),
                "v".to_string(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::NotAuthorized);
    }

    #[tokio::test]
    async fn mint_rejects_degraded_license() {
        let f = fixture().await;
        let mut row = f.store.agent_by_id(f.agent_id).await.unwrap();
        row.license_state = LicenseState::Expired;
        f.store.upsert_agent(row).await;

        let owner = f.store.agent_by_id(f.agent_id).await.unwrap().owner_id;
        let err = f
            .broker
            .mint_token(&claims(owner), &connect_request(f.agent_id), "v".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "POLICY_DENIED");
    }

    #[tokio::test]
    async fn mint_ignores_power_state() {
        // A licensed agent in a low-power state is still streamable; the
        // mint gate is the logical run state, not the power state.
        let f = fixture().await;
        f.registry
            .update_state(
                f.connection_id,
                StateDelta {
                    power_state: Some(PowerState::Sleep),
                    ..StateDelta::default()
                },
            )
            .await;
        let owner = f.store.agent_by_id(f.agent_id).await.unwrap().owner_id;
        assert!(
            f.broker
                .mint_token(&claims(owner), &connect_request(f.agent_id), "v".to_string())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn quality_zero_is_accepted() {
        let f = fixture().await;
        let owner = f.store.agent_by_id(f.agent_id).await.unwrap().owner_id;
        let mut req = connect_request(f.agent_id);
        req.quality = Some(0);
        assert!(
            f.broker
                .mint_token(&claims(owner), &req, "v".to_string())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn session_cap_enforced_at_mint() {
        let f = fixture().await;
        for _ in 0..3 {
            bind(&f).await;
        }
        assert_eq!(f.broker.session_count().await, 3);

        let owner = f.store.agent_by_id(f.agent_id).await.unwrap().owner_id;
        let err = f
            .broker
            .mint_token(&claims(owner), &connect_request(f.agent_id), "v".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn expired_token_cannot_bind() {
        let f = fixture().await;
        f.store
            .put_stream_token(StreamTokenRecord {
                token: "stale".to_string(),
                agent_id: f.agent_id,
                user_id: "u1".to_string(),
                display_id: 0,
                quality: 75,
                max_fps: 30,
                remote_address: "v".to_string(),
                expires_at: unix_now() - 1,
            })
            .await;
        let (control_tx, _control_rx) = mpsc::unbounded_channel();
        let (frame_tx, _frame_rx) = mpsc::channel(1);
        let err = f
            .broker
            .bind_session("stale", control_tx, frame_tx)
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::AuthFailed);
    }

    #[tokio::test]
    async fn frames_relay_in_order_with_counters() {
        let f = fixture().await;
        let (session, _control_rx, mut frame_rx) = bind(&f).await;

        for sequence in 1..=3u64 {
            f.broker
                .relay_frame(
                    header(session.session_id, sequence, 4),
                    Bytes::from_static(b"\x01\x02\x03\x04"),
                )
                .await;
        }

        for expected in 1..=3u64 {
            let frame = frame_rx.recv().await.unwrap();
            assert_eq!(frame.header.sequence, expected);
            assert_eq!(frame.payload.len(), 4);
        }
        assert_eq!(session.frames_relayed.load(Ordering::Relaxed), 3);
        assert_eq!(session.bytes_relayed.load(Ordering::Relaxed), 12);
    }

    #[tokio::test]
    async fn size_mismatch_tears_session_down() {
        let f = fixture().await;
        let (session, mut control_rx, _frame_rx) = bind(&f).await;

        // Header promises 12345 bytes; only 12344 arrive.
        f.broker
            .relay_frame(
                header(session.session_id, 1, 12345),
                Bytes::from(vec![0u8; 12344]),
            )
            .await;

        assert_eq!(f.broker.session_count().await, 0);
        let mut saw_protocol_error = false;
        while let Ok(frame) = control_rx.try_recv() {
            if let ViewerFrame::Event(ViewerEvent::Error { code, .. }) = &frame {
                assert_eq!(code.as_deref(), Some("PROTOCOL_ERROR"));
                saw_protocol_error = true;
            }
        }
        assert!(saw_protocol_error);
    }

    #[tokio::test]
    async fn slow_viewer_drops_frames_not_session() {
        let f = fixture().await;
        let (session, _control_rx, _frame_rx) = bind(&f).await;

        // Nobody drains the frame lane; overflow must drop, not kill.
        for sequence in 0..(FRAME_LANE_DEPTH as u64 + 10) {
            f.broker
                .relay_frame(header(session.session_id, sequence, 1), Bytes::from_static(b"x"))
                .await;
        }
        assert_eq!(f.broker.session_count().await, 1);
        assert_eq!(f.broker.frames_dropped.load(Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn agent_disconnect_ends_sessions_with_1001() {
        let f = fixture().await;
        let (_session, mut control_rx, _frame_rx) = bind(&f).await;

        f.broker.end_sessions_for_agent(f.agent_id).await;
        assert_eq!(f.broker.session_count().await, 0);

        let mut closed_with = None;
        while let Ok(frame) = control_rx.try_recv() {
            if let ViewerFrame::Close { code, .. } = frame {
                closed_with = Some(code);
            }
        }
        assert_eq!(closed_with, Some(1001));
    }

    #[tokio::test]
    async fn idle_sessions_are_swept() {
        let f = fixture().await;
        let (session, _control_rx, _frame_rx) = bind(&f).await;
        session.last_activity.store(unix_now() - 3600, Ordering::Relaxed);
        f.broker.sweep_idle(Duration::from_secs(600)).await;
        assert_eq!(f.broker.session_count().await, 0);
    }
}
