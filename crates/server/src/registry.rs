//! Connected-agent registry.
//!
//! Authoritative in-process index of live agent sessions. Owns command
//! correlation for every outbound request: `send_command` installs a
//! resolver keyed by a fresh correlation id, writes the frame through the
//! connection's single-writer channel, and suspends until the agent's
//! `response`/`error` arrives, the deadline passes, or the socket closes.
//! Resolution fires exactly once because every path removes the pending
//! entry before completing it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc, oneshot};
use uuid::Uuid;

use tether_protocol::{ControlError, OsType, PowerState, ServerMessage};

use crate::store::{AgentRecord, Store, unix_now};

/// Frames queued for a connection's writer task.
#[derive(Debug)]
pub enum OutboundFrame {
    Message(ServerMessage),
    Ping,
    Close { code: u16, reason: String },
}

struct PendingRequest {
    resolver: oneshot::Sender<Result<Value, ControlError>>,
    started_at: Instant,
}

struct ConnectionShared {
    agent_id: Option<Uuid>,
    power_state: PowerState,
    is_screen_locked: bool,
    has_display: bool,
    current_task: Option<String>,
    /// Epoch seconds; only ever moves forward.
    last_activity: u64,
    capabilities_fetched_at: Option<u64>,
    pending: HashMap<String, PendingRequest>,
    /// Commands buffered while the agent sleeps; drained FIFO on wake.
    sleep_queue: VecDeque<ServerMessage>,
}

/// Ephemeral twin of a persistent agent while its socket is open.
pub struct ConnectedAgent {
    pub connection_id: Uuid,
    pub remote_addr: String,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    shared: Mutex<ConnectionShared>,
}

impl ConnectedAgent {
    /// Send a frame through the connection's writer task.
    pub fn send(&self, frame: OutboundFrame) -> Result<(), ControlError> {
        self.outbound
            .send(frame)
            .map_err(|_| ControlError::NotConnected)
    }

    pub fn agent_id(&self) -> Option<Uuid> {
        self.locked().agent_id
    }

    pub fn power_state(&self) -> PowerState {
        self.locked().power_state
    }

    pub fn is_screen_locked(&self) -> bool {
        self.locked().is_screen_locked
    }

    pub fn last_activity(&self) -> u64 {
        self.locked().last_activity
    }

    pub fn has_display(&self) -> bool {
        self.locked().has_display
    }

    pub fn current_task(&self) -> Option<String> {
        self.locked().current_task.clone()
    }

    pub fn capabilities_fetched_at(&self) -> Option<u64> {
        self.locked().capabilities_fetched_at
    }

    pub fn mark_capabilities_fetched(&self) {
        self.locked().capabilities_fetched_at = Some(unix_now());
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, ConnectionShared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// State deltas carried by heartbeat and state_change frames.
#[derive(Debug, Default, Clone)]
pub struct StateDelta {
    pub power_state: Option<PowerState>,
    pub is_screen_locked: Option<bool>,
    pub has_display: Option<bool>,
    pub current_task: Option<Option<String>>,
}

/// Inputs to identity reconciliation, decoupled from the wire envelope.
#[derive(Debug, Clone)]
pub struct Registration {
    pub machine_fingerprint: String,
    pub hostname: String,
    pub os_type: OsType,
    pub arch: String,
    pub agent_version: String,
    pub license_uuid: Option<Uuid>,
    pub customer_id: Option<Uuid>,
    pub agent_name: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub has_display: bool,
}

/// Broker callbacks invoked when an agent connection closes. Registered at
/// startup so the registry never holds a broker reference of its own.
#[async_trait]
pub trait DisconnectHook: Send + Sync {
    async fn agent_disconnected(&self, connection_id: Uuid, agent_id: Option<Uuid>);
}

pub struct AgentRegistry {
    store: Arc<dyn Store>,
    connections: RwLock<HashMap<Uuid, Arc<ConnectedAgent>>>,
    /// agent_id → connection ids in registration order; newest last.
    by_agent: RwLock<HashMap<Uuid, Vec<Uuid>>>,
    hooks: RwLock<Vec<Arc<dyn DisconnectHook>>>,
    default_timeout: Duration,
    sleep_queue_cap: usize,
    pub commands_sent: AtomicU64,
    pub commands_timed_out: AtomicU64,
    pub sleep_queue_drops: AtomicU64,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn Store>, default_timeout: Duration, sleep_queue_cap: usize) -> Self {
        Self {
            store,
            connections: RwLock::new(HashMap::new()),
            by_agent: RwLock::new(HashMap::new()),
            hooks: RwLock::new(Vec::new()),
            default_timeout,
            sleep_queue_cap,
            commands_sent: AtomicU64::new(0),
            commands_timed_out: AtomicU64::new(0),
            sleep_queue_drops: AtomicU64::new(0),
        }
    }

    pub async fn register_hook(&self, hook: Arc<dyn DisconnectHook>) {
        self.hooks.write().await.push(hook);
    }

    /// Create the ephemeral connection record on WebSocket accept, before
    /// the agent has registered.
    pub async fn attach(
        &self,
        remote_addr: String,
        outbound: mpsc::UnboundedSender<OutboundFrame>,
    ) -> Arc<ConnectedAgent> {
        let conn = Arc::new(ConnectedAgent {
            connection_id: Uuid::new_v4(),
            remote_addr,
            outbound,
            shared: Mutex::new(ConnectionShared {
                agent_id: None,
                power_state: PowerState::Active,
                is_screen_locked: false,
                has_display: false,
                current_task: None,
                last_activity: unix_now(),
                capabilities_fetched_at: None,
                pending: HashMap::new(),
                sleep_queue: VecDeque::new(),
            }),
        });
        self.connections
            .write()
            .await
            .insert(conn.connection_id, Arc::clone(&conn));
        conn
    }

    /// Reconcile a `register` frame to a persistent agent row and bind the
    /// connection to it.
    ///
    /// Lookup order: by license uuid when stamped, else by
    /// (owner, machine fingerprint). A hit updates the mutable fields and
    /// reuses the agent id; a miss creates a pending row. The owner scope
    /// comes from the stamped license, falling back to the ambient
    /// customer id.
    pub async fn register(
        &self,
        connection_id: Uuid,
        reg: Registration,
    ) -> Result<AgentRecord, ControlError> {
        let conn = self
            .connection(connection_id)
            .await
            .ok_or(ControlError::NotConnected)?;

        let license = match reg.license_uuid {
            Some(uuid) => self.store.license(uuid).await,
            None => None,
        };
        let owner_id = match (&license, reg.customer_id) {
            (Some(license), _) => license.owner_id,
            (None, Some(customer_id)) => customer_id,
            (None, None) => {
                tracing::warn!(
                    %connection_id,
                    fingerprint = %reg.machine_fingerprint,
                    "Registration carries neither a known license nor a customer id"
                );
                return Err(ControlError::AuthFailed);
            }
        };

        let mut existing = match reg.license_uuid {
            Some(uuid) => self.store.agent_by_license(uuid).await,
            None => None,
        };
        if existing.is_none() {
            existing = self
                .store
                .agent_by_fingerprint(owner_id, &reg.machine_fingerprint)
                .await;
        }

        let now = unix_now();
        let agent = match existing {
            Some(mut agent) => {
                agent.os_type = reg.os_type;
                agent.arch = reg.arch.clone();
                agent.agent_version = reg.agent_version.clone();
                agent.hostname = reg.hostname.clone();
                agent.has_display = reg.has_display;
                if let Some(name) = &reg.agent_name {
                    agent.display_name = Some(name.clone());
                }
                if agent.license_uuid.is_none() {
                    agent.license_uuid = reg.license_uuid;
                }
                if let Some(license) = &license {
                    agent.license_state = license.state;
                }
                agent.last_seen_at = now;
                agent
            }
            None => AgentRecord {
                agent_id: Uuid::new_v4(),
                owner_id,
                machine_fingerprint: reg.machine_fingerprint.clone(),
                license_uuid: reg.license_uuid,
                license_state: license
                    .as_ref()
                    .map(|l| l.state)
                    .unwrap_or(tether_protocol::LicenseState::Pending),
                os_type: reg.os_type,
                arch: reg.arch.clone(),
                agent_version: reg.agent_version.clone(),
                hostname: reg.hostname.clone(),
                display_name: reg.agent_name.clone(),
                has_display: reg.has_display,
                master_mode_enabled: false,
                file_transfer_enabled: false,
                local_settings_locked: false,
                default_browser: None,
                created_at: now,
                last_seen_at: now,
            },
        };
        self.store.upsert_agent(agent.clone()).await;

        if let Some(capabilities) = reg.capabilities {
            self.store
                .set_agent_capabilities(agent.agent_id, capabilities)
                .await;
            conn.mark_capabilities_fetched();
        }

        {
            let mut shared = conn.locked();
            shared.agent_id = Some(agent.agent_id);
            shared.has_display = reg.has_display;
            shared.last_activity = now;
        }

        // Duplicate live connections for the same agent coexist; the newest
        // registration becomes the preferred target for new operations.
        let mut by_agent = self.by_agent.write().await;
        let conns = by_agent.entry(agent.agent_id).or_default();
        conns.retain(|c| *c != connection_id);
        conns.push(connection_id);

        tracing::info!(
            %connection_id,
            agent_id = %agent.agent_id,
            hostname = %agent.hostname,
            duplicates = conns.len() - 1,
            "Agent registered"
        );

        Ok(agent)
    }

    /// Issue a `request` frame and await the correlated response.
    pub async fn send_command(
        &self,
        connection_id: Uuid,
        method: &str,
        params: Value,
    ) -> Result<Value, ControlError> {
        self.send_command_with_timeout(connection_id, method, params, self.default_timeout)
            .await
    }

    pub async fn send_command_with_timeout(
        &self,
        connection_id: Uuid,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        let method = method.to_string();
        self.send_correlated(
            connection_id,
            move |id| ServerMessage::Request {
                id,
                method,
                params,
            },
            timeout,
        )
        .await
    }

    /// Correlation core shared by plain requests and the dedicated
    /// stream_start/stream_stop/stream_input frames: install the resolver,
    /// write (or sleep-queue) the frame, await single-fire resolution.
    pub async fn send_correlated(
        &self,
        connection_id: Uuid,
        build: impl FnOnce(String) -> ServerMessage,
        timeout: Duration,
    ) -> Result<Value, ControlError> {
        let conn = self
            .connection(connection_id)
            .await
            .ok_or(ControlError::NotConnected)?;

        let correlation_id = Uuid::new_v4().to_string();
        let message = build(correlation_id.clone());
        let (tx, rx) = oneshot::channel();

        {
            let mut shared = conn.locked();
            shared.pending.insert(
                correlation_id.clone(),
                PendingRequest {
                    resolver: tx,
                    started_at: Instant::now(),
                },
            );
            if shared.power_state == PowerState::Sleep {
                if shared.sleep_queue.len() >= self.sleep_queue_cap {
                    shared.sleep_queue.pop_front();
                    self.sleep_queue_drops.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        %connection_id,
                        cap = self.sleep_queue_cap,
                        "Sleep queue full, dropped oldest command"
                    );
                }
                shared.sleep_queue.push_back(message);
            } else if conn.outbound.send(OutboundFrame::Message(message)).is_err() {
                shared.pending.remove(&correlation_id);
                return Err(ControlError::NotConnected);
            }
        }

        self.commands_sent.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Resolver dropped without firing: connection torn down between
            // install and resolution.
            Ok(Err(_)) => Err(ControlError::AgentDisconnected),
            Err(_) => {
                conn.locked().pending.remove(&correlation_id);
                self.commands_timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%connection_id, %correlation_id, "Command timed out");
                Err(ControlError::Timeout)
            }
        }
    }

    /// Complete a pending request from an inbound `response`/`error` frame.
    /// Late arrivals (already timed out or resolved) are discarded.
    pub async fn resolve_response(
        &self,
        connection_id: Uuid,
        correlation_id: &str,
        result: Result<Value, ControlError>,
    ) {
        let Some(conn) = self.connection(connection_id).await else {
            return;
        };
        let entry = conn.locked().pending.remove(correlation_id);
        match entry {
            Some(pending) => {
                tracing::trace!(
                    %connection_id,
                    correlation_id,
                    elapsed_ms = pending.started_at.elapsed().as_millis() as u64,
                    "Command resolved"
                );
                let _ = pending.resolver.send(result);
            }
            None => {
                tracing::debug!(
                    %connection_id,
                    correlation_id,
                    "Discarding response for unknown or expired correlation id"
                );
            }
        }
    }

    pub async fn update_ping(&self, connection_id: Uuid) {
        if let Some(conn) = self.connection(connection_id).await {
            let mut shared = conn.locked();
            shared.last_activity = shared.last_activity.max(unix_now());
        }
    }

    /// Apply a state delta. A SLEEP → ACTIVE/PASSIVE transition flushes the
    /// sleep queue FIFO. Returns the (old, new) power states when the power
    /// state changed.
    pub async fn update_state(
        &self,
        connection_id: Uuid,
        delta: StateDelta,
    ) -> Option<(PowerState, PowerState)> {
        let conn = self.connection(connection_id).await?;
        let mut flushed = Vec::new();
        let transition = {
            let mut shared = conn.locked();
            shared.last_activity = shared.last_activity.max(unix_now());
            if let Some(locked) = delta.is_screen_locked {
                shared.is_screen_locked = locked;
            }
            if let Some(display) = delta.has_display {
                shared.has_display = display;
            }
            if let Some(task) = delta.current_task {
                shared.current_task = task;
            }
            match delta.power_state {
                Some(new) if new != shared.power_state => {
                    let old = shared.power_state;
                    shared.power_state = new;
                    if old == PowerState::Sleep && new != PowerState::Sleep {
                        flushed = shared.sleep_queue.drain(..).collect();
                    }
                    Some((old, new))
                }
                _ => None,
            }
        };

        if !flushed.is_empty() {
            tracing::info!(
                %connection_id,
                count = flushed.len(),
                "Flushing commands queued during sleep"
            );
            for message in flushed {
                if conn.outbound.send(OutboundFrame::Message(message)).is_err() {
                    break;
                }
            }
        }

        transition
    }

    /// True when commands are buffered for a sleeping agent, surfaced to the
    /// agent as `pendingCommands` in heartbeat_ack.
    pub async fn has_queued_commands(&self, connection_id: Uuid) -> bool {
        match self.connection(connection_id).await {
            Some(conn) => !conn.locked().sleep_queue.is_empty(),
            None => false,
        }
    }

    pub async fn connection(&self, connection_id: Uuid) -> Option<Arc<ConnectedAgent>> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    /// Preferred connection for new operations targeting a persistent agent:
    /// the most recent registration.
    pub async fn connection_for_agent(&self, agent_id: Uuid) -> Option<Arc<ConnectedAgent>> {
        let connection_id = {
            let by_agent = self.by_agent.read().await;
            by_agent.get(&agent_id)?.last().copied()?
        };
        self.connection(connection_id).await
    }

    pub async fn is_agent_connected(&self, agent_id: Uuid) -> bool {
        self.by_agent
            .read()
            .await
            .get(&agent_id)
            .is_some_and(|c| !c.is_empty())
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Agent ids with at least one live connection.
    pub async fn connected_agent_ids(&self) -> Vec<Uuid> {
        self.by_agent
            .read()
            .await
            .iter()
            .filter(|(_, conns)| !conns.is_empty())
            .map(|(agent_id, _)| *agent_id)
            .collect()
    }

    /// Disconnect cascade: reject every pending request on the connection
    /// with AGENT_DISCONNECTED, unbind it from its agent, touch the
    /// persistent row's last_seen, then let the brokers clean up their
    /// sessions. The persistent row is never deleted here.
    pub async fn detach(&self, connection_id: Uuid) {
        let Some(conn) = self.connections.write().await.remove(&connection_id) else {
            return;
        };

        let (agent_id, pending) = {
            let mut shared = conn.locked();
            shared.sleep_queue.clear();
            (shared.agent_id, std::mem::take(&mut shared.pending))
        };

        let rejected = pending.len();
        for (_, entry) in pending {
            let _ = entry.resolver.send(Err(ControlError::AgentDisconnected));
        }

        if let Some(agent_id) = agent_id {
            {
                let mut by_agent = self.by_agent.write().await;
                if let Some(conns) = by_agent.get_mut(&agent_id) {
                    conns.retain(|c| *c != connection_id);
                    if conns.is_empty() {
                        by_agent.remove(&agent_id);
                    }
                }
            }
            self.store.touch_agent_seen(agent_id, unix_now()).await;
        }

        tracing::info!(
            %connection_id,
            agent_id = ?agent_id,
            remote_addr = %conn.remote_addr,
            rejected_pending = rejected,
            "Agent connection detached"
        );

        let hooks = self.hooks.read().await.clone();
        for hook in hooks {
            hook.agent_disconnected(connection_id, agent_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use tether_protocol::LicenseState;

    fn registry() -> (Arc<AgentRegistry>, Arc<MemStore>) {
        let store = Arc::new(MemStore::new());
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Duration::from_secs(30),
            4,
        ));
        (registry, store)
    }

    fn registration(fingerprint: &str, customer_id: Uuid) -> Registration {
        Registration {
            machine_fingerprint: fingerprint.to_string(),
            hostname: format!("host-{fingerprint}"),
            os_type: OsType::Linux,
            arch: "x86_64".to_string(),
            agent_version: "0.3.0".to_string(),
            license_uuid: None,
            customer_id: Some(customer_id),
            agent_name: None,
            capabilities: None,
            has_display: true,
        }
    }

    async fn attach(
        registry: &AgentRegistry,
    ) -> (Arc<ConnectedAgent>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.attach("10.0.0.1:5000".to_string(), tx).await;
        (conn, rx)
    }

    fn correlation_id_of(frame: &OutboundFrame) -> String {
        match frame {
            OutboundFrame::Message(ServerMessage::Request { id, .. }) => id.clone(),
            other => panic!("expected request frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_command_resolves_with_agent_result() {
        let (registry, _) = registry();
        let (conn, mut rx) = attach(&registry).await;
        let connection_id = conn.connection_id;

        let reg2 = Arc::clone(&registry);
        let task = tokio::spawn(async move {
            reg2.send_command(connection_id, "noop", serde_json::json!({}))
                .await
        });

        let frame = rx.recv().await.expect("request frame written");
        let id = correlation_id_of(&frame);
        registry
            .resolve_response(connection_id, &id, Ok(serde_json::json!({"ok": true})))
            .await;

        let result = task.await.unwrap().unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn send_command_surfaces_peer_error() {
        let (registry, _) = registry();
        let (conn, mut rx) = attach(&registry).await;
        let connection_id = conn.connection_id;

        let reg2 = Arc::clone(&registry);
        let task = tokio::spawn(async move {
            reg2.send_command(connection_id, "screenshot", serde_json::json!({}))
                .await
        });

        let id = correlation_id_of(&rx.recv().await.unwrap());
        registry
            .resolve_response(
                connection_id,
                &id,
                Err(ControlError::PeerError("no display".to_string())),
            )
            .await;

        assert_eq!(
            task.await.unwrap().unwrap_err(),
            ControlError::PeerError("no display".to_string())
        );
    }

    #[tokio::test]
    async fn send_command_times_out_and_discards_late_response() {
        let (registry, _) = registry();
        let (conn, mut rx) = attach(&registry).await;
        let connection_id = conn.connection_id;

        let result = registry
            .send_command_with_timeout(
                connection_id,
                "noop",
                serde_json::json!({}),
                Duration::from_millis(20),
            )
            .await;
        assert_eq!(result.unwrap_err(), ControlError::Timeout);
        assert_eq!(registry.commands_timed_out.load(Ordering::Relaxed), 1);

        // Late arrival must be a no-op, not a panic or a second resolution.
        let id = correlation_id_of(&rx.recv().await.unwrap());
        registry
            .resolve_response(connection_id, &id, Ok(serde_json::json!(1)))
            .await;
    }

    #[tokio::test]
    async fn send_command_to_unknown_connection_fails_immediately() {
        let (registry, _) = registry();
        let result = registry
            .send_command(Uuid::new_v4(), "noop", serde_json::json!({}))
            .await;
        assert_eq!(result.unwrap_err(), ControlError::NotConnected);
    }

    #[tokio::test]
    async fn detach_rejects_all_pending_requests() {
        let (registry, _) = registry();
        let (conn, mut rx) = attach(&registry).await;
        let connection_id = conn.connection_id;

        let reg2 = Arc::clone(&registry);
        let task = tokio::spawn(async move {
            reg2.send_command(connection_id, "noop", serde_json::json!({}))
                .await
        });
        let _ = rx.recv().await.unwrap();

        registry.detach(connection_id).await;
        assert_eq!(
            task.await.unwrap().unwrap_err(),
            ControlError::AgentDisconnected
        );
        assert!(registry.connection(connection_id).await.is_none());
    }

    #[tokio::test]
    async fn sleeping_agent_queues_commands_and_flushes_on_wake() {
        let (registry, _) = registry();
        let (conn, mut rx) = attach(&registry).await;
        let connection_id = conn.connection_id;

        registry
            .update_state(
                connection_id,
                StateDelta {
                    power_state: Some(PowerState::Sleep),
                    ..StateDelta::default()
                },
            )
            .await;

        let reg2 = Arc::clone(&registry);
        let task = tokio::spawn(async move {
            reg2.send_command(connection_id, "noop", serde_json::json!({"n": 1}))
                .await
        });

        // Nothing hits the socket while asleep.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
        assert!(registry.has_queued_commands(connection_id).await);

        // Wake: the queued frame is flushed and can be answered.
        let transition = registry
            .update_state(
                connection_id,
                StateDelta {
                    power_state: Some(PowerState::Active),
                    ..StateDelta::default()
                },
            )
            .await;
        assert_eq!(transition, Some((PowerState::Sleep, PowerState::Active)));

        let id = correlation_id_of(&rx.recv().await.unwrap());
        registry
            .resolve_response(connection_id, &id, Ok(serde_json::json!("done")))
            .await;
        assert_eq!(task.await.unwrap().unwrap(), serde_json::json!("done"));
    }

    #[tokio::test]
    async fn sleep_queue_overflow_drops_oldest_and_counts() {
        let (registry, _) = registry();
        let (conn, _rx) = attach(&registry).await;
        let connection_id = conn.connection_id;

        registry
            .update_state(
                connection_id,
                StateDelta {
                    power_state: Some(PowerState::Sleep),
                    ..StateDelta::default()
                },
            )
            .await;

        // Capacity is 4 in the test registry; the fifth send evicts the oldest.
        for n in 0..5 {
            let reg2 = Arc::clone(&registry);
            tokio::spawn(async move {
                let _ = reg2
                    .send_command_with_timeout(
                        connection_id,
                        "noop",
                        serde_json::json!({ "n": n }),
                        Duration::from_secs(5),
                    )
                    .await;
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.sleep_queue_drops.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn registration_reuses_agent_row_by_fingerprint() {
        let (registry, store) = registry();
        let owner = Uuid::new_v4();

        let (conn1, _rx1) = attach(&registry).await;
        let first = registry
            .register(conn1.connection_id, registration("fp-1", owner))
            .await
            .unwrap();
        assert_eq!(first.license_state, LicenseState::Pending);

        let (conn2, _rx2) = attach(&registry).await;
        let mut reg = registration("fp-1", owner);
        reg.agent_version = "0.3.1".to_string();
        let second = registry.register(conn2.connection_id, reg).await.unwrap();

        assert_eq!(first.agent_id, second.agent_id);
        assert_eq!(second.agent_version, "0.3.1");
        let stored = store.agent_by_id(first.agent_id).await.unwrap();
        assert_eq!(stored.agent_version, "0.3.1");
    }

    #[tokio::test]
    async fn newest_registration_is_preferred_connection() {
        let (registry, _) = registry();
        let owner = Uuid::new_v4();

        let (conn1, _rx1) = attach(&registry).await;
        let agent = registry
            .register(conn1.connection_id, registration("fp-1", owner))
            .await
            .unwrap();

        let (conn2, _rx2) = attach(&registry).await;
        registry
            .register(conn2.connection_id, registration("fp-1", owner))
            .await
            .unwrap();

        let preferred = registry.connection_for_agent(agent.agent_id).await.unwrap();
        assert_eq!(preferred.connection_id, conn2.connection_id);

        // Dropping the newer connection falls back to the older one.
        registry.detach(conn2.connection_id).await;
        let preferred = registry.connection_for_agent(agent.agent_id).await.unwrap();
        assert_eq!(preferred.connection_id, conn1.connection_id);
    }

    #[tokio::test]
    async fn registration_without_identity_fails() {
        let (registry, _) = registry();
        let (conn, _rx) = attach(&registry).await;
        let mut reg = registration("fp-1", Uuid::new_v4());
        reg.customer_id = None;
        let result = registry.register(conn.connection_id, reg).await;
        assert_eq!(result.unwrap_err(), ControlError::AuthFailed);
    }

    #[tokio::test]
    async fn registration_resolves_owner_through_license() {
        let (registry, store) = registry();
        let owner = Uuid::new_v4();
        let license_uuid = Uuid::new_v4();
        store
            .put_license(crate::store::LicenseRecord {
                license_uuid,
                owner_id: owner,
                state: LicenseState::Active,
                expires_at: None,
            })
            .await;

        let (conn, _rx) = attach(&registry).await;
        let mut reg = registration("fp-lic", Uuid::new_v4());
        reg.customer_id = None;
        reg.license_uuid = Some(license_uuid);
        let agent = registry.register(conn.connection_id, reg).await.unwrap();
        assert_eq!(agent.owner_id, owner);
        assert_eq!(agent.license_state, LicenseState::Active);
    }

    #[tokio::test]
    async fn disconnect_hook_receives_agent_id() {
        struct Recorder(Mutex<Vec<(Uuid, Option<Uuid>)>>);

        #[async_trait]
        impl DisconnectHook for Recorder {
            async fn agent_disconnected(&self, connection_id: Uuid, agent_id: Option<Uuid>) {
                self.0
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push((connection_id, agent_id));
            }
        }

        let (registry, _) = registry();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        registry
            .register_hook(Arc::clone(&recorder) as Arc<dyn DisconnectHook>)
            .await;

        let (conn, _rx) = attach(&registry).await;
        let agent = registry
            .register(conn.connection_id, registration("fp-1", Uuid::new_v4()))
            .await
            .unwrap();
        registry.detach(conn.connection_id).await;

        let calls = recorder.0.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert_eq!(calls, vec![(conn.connection_id, Some(agent.agent_id))]);
    }

    #[tokio::test]
    async fn last_activity_only_moves_forward() {
        let (registry, _) = registry();
        let (conn, _rx) = attach(&registry).await;
        let before = conn.last_activity();
        registry.update_ping(conn.connection_id).await;
        assert!(conn.last_activity() >= before);
    }
}
