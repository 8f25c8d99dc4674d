//! File transfer manager: chunked agent-to-agent copies through the
//! control plane.
//!
//! The whole transfer is a sequence of correlated commands: `files_info` on
//! the source, then alternating `files_read_chunk`/`files_write_chunk`
//! until the final chunk, then a checksum compare on the destination.
//! Progress and status land in the persistent record after every step.
//! Cancellation removes the in-memory entry; the chunk loop observes the
//! missing entry and stops. Partial destination files are left in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use uuid::Uuid;

use tether_protocol::{ControlError, TransferConfig};

use crate::auth::Claims;
use crate::registry::AgentRegistry;
use crate::store::{Store, TransferRecord, TransferStatus, unix_now};

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub source_agent_id: Uuid,
    pub dest_agent_id: Uuid,
    pub source_path: String,
    pub dest_path: String,
}

struct ActiveTransfer {
    source_connection_id: Uuid,
    dest_connection_id: Uuid,
}

pub struct FileTransferManager {
    registry: Arc<AgentRegistry>,
    store: Arc<dyn Store>,
    config: TransferConfig,
    active: RwLock<HashMap<Uuid, ActiveTransfer>>,
    pub transfers_completed: AtomicU64,
    pub transfers_failed: AtomicU64,
}

impl FileTransferManager {
    pub fn new(registry: Arc<AgentRegistry>, store: Arc<dyn Store>, config: TransferConfig) -> Self {
        Self {
            registry,
            store,
            config,
            active: RwLock::new(HashMap::new()),
            transfers_completed: AtomicU64::new(0),
            transfers_failed: AtomicU64::new(0),
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Validate preconditions, persist the PENDING record, and spawn the
    /// transfer task. Returns the record for the HTTP response.
    pub async fn start(
        self: &Arc<Self>,
        claims: &Claims,
        req: &TransferRequest,
    ) -> Result<TransferRecord, ControlError> {
        let source = self
            .store
            .agent_by_id(req.source_agent_id)
            .await
            .ok_or(ControlError::NotConnected)?;
        let dest = self
            .store
            .agent_by_id(req.dest_agent_id)
            .await
            .ok_or(ControlError::NotConnected)?;
        if source.owner_id != claims.owner || dest.owner_id != claims.owner {
            return Err(ControlError::NotAuthorized);
        }
        if !source.file_transfer_enabled || !dest.file_transfer_enabled {
            return Err(ControlError::PolicyDenied(
                "file transfer disabled for agent".to_string(),
            ));
        }
        let source_conn = self
            .registry
            .connection_for_agent(req.source_agent_id)
            .await
            .ok_or(ControlError::NotConnected)?;
        let dest_conn = self
            .registry
            .connection_for_agent(req.dest_agent_id)
            .await
            .ok_or(ControlError::NotConnected)?;

        let file_name = req
            .source_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&req.source_path)
            .to_string();

        let record = TransferRecord {
            transfer_id: Uuid::new_v4(),
            source_agent_id: req.source_agent_id,
            dest_agent_id: req.dest_agent_id,
            initiator_user_id: claims.sub.clone(),
            source_path: req.source_path.clone(),
            dest_path: req.dest_path.clone(),
            file_name,
            file_size: 0,
            bytes_transferred: 0,
            status: TransferStatus::Pending,
            error_message: None,
            created_at: unix_now(),
            completed_at: None,
        };
        self.store.insert_transfer(record.clone()).await;
        self.active.write().await.insert(
            record.transfer_id,
            ActiveTransfer {
                source_connection_id: source_conn.connection_id,
                dest_connection_id: dest_conn.connection_id,
            },
        );

        let manager = Arc::clone(self);
        let transfer_id = record.transfer_id;
        tokio::spawn(async move {
            manager.run(transfer_id).await;
        });

        tracing::info!(
            %transfer_id,
            source = %req.source_agent_id,
            dest = %req.dest_agent_id,
            path = %req.source_path,
            "File transfer started"
        );
        Ok(record)
    }

    pub async fn status(&self, transfer_id: Uuid, claims: &Claims) -> Option<TransferRecord> {
        let record = self.store.transfer(transfer_id).await?;
        if record.initiator_user_id != claims.sub {
            return None;
        }
        Some(record)
    }

    /// Flip the record to CANCELLED and evict the in-memory entry; the
    /// running loop notices before its next chunk.
    pub async fn cancel(&self, transfer_id: Uuid, claims: &Claims) -> Result<(), ControlError> {
        let record = self
            .store
            .transfer(transfer_id)
            .await
            .ok_or(ControlError::NotConnected)?;
        if record.initiator_user_id != claims.sub {
            return Err(ControlError::NotAuthorized);
        }
        self.active.write().await.remove(&transfer_id);
        self.store
            .update_transfer_status(transfer_id, TransferStatus::Cancelled, None)
            .await;
        tracing::info!(%transfer_id, "File transfer cancelled");
        Ok(())
    }

    async fn run(self: Arc<Self>, transfer_id: Uuid) {
        let deadline = Duration::from_secs(self.config.timeout_s);
        let result = tokio::time::timeout(deadline, self.copy_loop(transfer_id)).await;

        self.active.write().await.remove(&transfer_id);
        match result {
            Ok(Ok(())) => {
                self.store
                    .update_transfer_status(transfer_id, TransferStatus::Completed, None)
                    .await;
                self.transfers_completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(%transfer_id, "File transfer completed");
            }
            Ok(Err(Cancelled)) => {
                // Status was already set by cancel(); nothing more to do.
                tracing::debug!(%transfer_id, "Transfer loop observed cancellation");
            }
            Ok(Err(Failed(err))) => {
                self.store
                    .update_transfer_status(
                        transfer_id,
                        TransferStatus::Failed,
                        Some(format!("{}: {err}", err.code())),
                    )
                    .await;
                self.transfers_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%transfer_id, code = err.code(), "File transfer failed");
            }
            Err(_) => {
                self.store
                    .update_transfer_status(
                        transfer_id,
                        TransferStatus::Failed,
                        Some(ControlError::Timeout.code().to_string()),
                    )
                    .await;
                self.transfers_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%transfer_id, "File transfer timed out");
            }
        }
    }

    async fn connections(&self, transfer_id: Uuid) -> Result<(Uuid, Uuid), CopyAbort> {
        let active = self.active.read().await;
        let entry = active.get(&transfer_id).ok_or(Cancelled)?;
        Ok((entry.source_connection_id, entry.dest_connection_id))
    }

    async fn copy_loop(&self, transfer_id: Uuid) -> Result<(), CopyAbort> {
        let record = self
            .store
            .transfer(transfer_id)
            .await
            .ok_or(Failed(ControlError::Internal("transfer record lost".to_string())))?;
        let (source, dest) = self.connections(transfer_id).await?;

        // Destination directory, best-effort: agents that cannot mkdir still
        // get the chunks.
        if let Some(dir) = parent_dir(&record.dest_path) {
            let _ = self
                .registry
                .send_command(dest, "fs_mkdir", json!({"path": dir}))
                .await;
        }

        let info = self
            .registry
            .send_command(source, "files_info", json!({"path": record.source_path}))
            .await
            .map_err(Failed)?;
        let file_size = info.get("size").and_then(Value::as_u64).ok_or(Failed(
            ControlError::PeerError("files_info returned no size".to_string()),
        ))?;
        let source_checksum = info
            .get("checksum")
            .and_then(Value::as_str)
            .map(str::to_string);

        if file_size > self.config.max_file_size_bytes {
            return Err(Failed(ControlError::LimitExceeded(format!(
                "file is {file_size} bytes"
            ))));
        }

        self.store.update_transfer_size(transfer_id, file_size).await;
        self.store
            .update_transfer_status(transfer_id, TransferStatus::Transferring, None)
            .await;

        let chunk_size = self.config.chunk_size_bytes;
        let total_chunks = file_size.div_ceil(chunk_size);
        let mut transferred = 0u64;

        for chunk_index in 0..total_chunks {
            // A cancelled transfer vanishes from the active map between
            // chunks; stop without touching the persistent status.
            let (source, dest) = self.connections(transfer_id).await?;

            let chunk = self
                .registry
                .send_command(
                    source,
                    "files_read_chunk",
                    json!({
                        "path": record.source_path,
                        "chunkIndex": chunk_index,
                        "chunkSize": chunk_size,
                    }),
                )
                .await
                .map_err(Failed)?;
            let data = chunk.get("data").and_then(Value::as_str).ok_or(Failed(
                ControlError::PeerError("files_read_chunk returned no data".to_string()),
            ))?;
            let decoded_len = BASE64
                .decode(data)
                .map_err(|e| Failed(ControlError::PeerError(format!("chunk is not base64: {e}"))))?
                .len() as u64;

            self.registry
                .send_command(
                    dest,
                    "files_write_chunk",
                    json!({
                        "path": record.dest_path,
                        "chunkIndex": chunk_index,
                        "data": data,
                        "isFinal": chunk_index == total_chunks - 1,
                    }),
                )
                .await
                .map_err(Failed)?;

            transferred += decoded_len;
            self.store
                .update_transfer_progress(transfer_id, transferred.min(file_size))
                .await;
        }

        if let Some(expected) = source_checksum {
            let (_, dest) = self.connections(transfer_id).await?;
            let info = self
                .registry
                .send_command(dest, "files_info", json!({"path": record.dest_path}))
                .await
                .map_err(Failed)?;
            let actual = info.get("checksum").and_then(Value::as_str).unwrap_or("");
            if actual != expected {
                tracing::warn!(
                    %transfer_id,
                    %expected,
                    %actual,
                    "Destination checksum does not match source"
                );
                return Err(Failed(ControlError::ChecksumMismatch));
            }
        }

        self.store
            .update_transfer_progress(transfer_id, file_size)
            .await;
        Ok(())
    }
}

/// Why the copy loop stopped early.
enum CopyAbort {
    Cancelled,
    Failed(ControlError),
}
use CopyAbort::{Cancelled, Failed};

fn parent_dir(path: &str) -> Option<&str> {
    let idx = path.rfind(['/', '\\'])?;
    if idx == 0 { None } else { Some(&path[..idx]) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{OutboundFrame, Registration};
    use crate::store::MemStore;
    use tether_protocol::{OsType, ServerMessage};
    use tokio::sync::mpsc;

    struct Fixture {
        manager: Arc<FileTransferManager>,
        registry: Arc<AgentRegistry>,
        store: Arc<MemStore>,
        owner: Uuid,
        source_agent: Uuid,
        dest_agent: Uuid,
        source_conn: Uuid,
        dest_conn: Uuid,
        source_rx: mpsc::UnboundedReceiver<OutboundFrame>,
        dest_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    }

    async fn connect_agent(
        registry: &AgentRegistry,
        store: &MemStore,
        owner: Uuid,
        fingerprint: &str,
    ) -> (Uuid, Uuid, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = registry.attach("10.0.0.9:1".to_string(), tx).await;
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
        // Registration creates the row with file transfer disabled; the
        // operator enables it out of band.
        let mut row = store.agent_by_id(agent.agent_id).await.unwrap();
        row.file_transfer_enabled = true;
        store.upsert_agent(row).await;
        (agent.agent_id, conn.connection_id, rx)
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Duration::from_secs(5),
            64,
        ));
        let manager = Arc::new(FileTransferManager::new(
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn Store>,
            TransferConfig {
                chunk_size_bytes: 262_144,
                max_file_size_bytes: 1 << 30,
                timeout_s: 30,
            },
        ));

        let owner = Uuid::new_v4();
        let (source_agent, source_conn, source_rx) =
            connect_agent(&registry, &store, owner, "fp-src").await;
        let (dest_agent, dest_conn, dest_rx) =
            connect_agent(&registry, &store, owner, "fp-dst").await;

        Fixture {
            manager,
            registry,
            store,
            owner,
            source_agent,
            dest_agent,
            source_conn,
            dest_conn,
            source_rx,
            dest_rx,
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

    fn request(f: &Fixture) -> TransferRequest {
        TransferRequest {
            source_agent_id: f.source_agent,
            dest_agent_id: f.dest_agent,
            source_path: "/tmp/x".to_string(),
            dest_path: "/var/y".to_string(),
        }
    }

    async fn next_request(
        rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    ) -> (String, String, Value) {
        loop {
            match rx.recv().await.expect("agent frame") {
                OutboundFrame::Message(ServerMessage::Request { id, method, params }) => {
                    return (id, method, params);
                }
                _ => continue,
            }
        }
    }

    /// Drive a complete transfer of `file_size` bytes with checksum `sum`
    /// on both ends.
    async fn drive_transfer(f: &mut Fixture, file_size: u64, sum: &str, dest_sum: &str) -> Uuid {
        let record = f
            .manager
            .start(&claims(f.owner), &request(f))
            .await
            .unwrap();
        let transfer_id = record.transfer_id;
        assert_eq!(record.status, TransferStatus::Pending);

        // mkdir (best-effort) on destination.
        let (id, method, params) = next_request(&mut f.dest_rx).await;
        assert_eq!(method, "fs_mkdir");
        assert_eq!(params["path"], "/var");
        f.registry
            .resolve_response(f.dest_conn, &id, Ok(json!({})))
            .await;

        // files_info on source.
        let (id, method, _) = next_request(&mut f.source_rx).await;
        assert_eq!(method, "files_info");
        f.registry
            .resolve_response(
                f.source_conn,
                &id,
                Ok(json!({"size": file_size, "checksum": sum})),
            )
            .await;

        let chunk_size = 262_144u64;
        let total_chunks = file_size.div_ceil(chunk_size);
        for chunk_index in 0..total_chunks {
            let expected_len = if chunk_index == total_chunks - 1 {
                file_size - chunk_index * chunk_size
            } else {
                chunk_size
            };
            let payload = BASE64.encode(vec![0u8; expected_len as usize]);

            let (id, method, params) = next_request(&mut f.source_rx).await;
            assert_eq!(method, "files_read_chunk");
            assert_eq!(params["chunkIndex"], chunk_index);
            f.registry
                .resolve_response(f.source_conn, &id, Ok(json!({"data": payload})))
                .await;

            let (id, method, params) = next_request(&mut f.dest_rx).await;
            assert_eq!(method, "files_write_chunk");
            assert_eq!(params["chunkIndex"], chunk_index);
            assert_eq!(
                params["isFinal"],
                chunk_index == total_chunks - 1,
                "isFinal on chunk {chunk_index}"
            );
            f.registry
                .resolve_response(f.dest_conn, &id, Ok(json!({})))
                .await;
        }

        // Destination checksum verification.
        let (id, method, _) = next_request(&mut f.dest_rx).await;
        assert_eq!(method, "files_info");
        f.registry
            .resolve_response(f.dest_conn, &id, Ok(json!({"size": file_size, "checksum": dest_sum})))
            .await;

        // Let the manager task finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        transfer_id
    }

    #[tokio::test]
    async fn transfer_completes_with_expected_chunking() {
        let mut f = fixture().await;
        // 700000 bytes → chunks of 262144, 262144, 175712.
        let transfer_id = drive_transfer(&mut f, 700_000, "H", "H").await;

        let record = f.store.transfer(transfer_id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert_eq!(record.bytes_transferred, 700_000);
        assert_eq!(record.file_size, 700_000);
        assert!(record.completed_at.is_some());
        assert_eq!(f.manager.transfers_completed.load(Ordering::Relaxed), 1);
        assert_eq!(f.manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_transfer() {
        let mut f = fixture().await;
        let transfer_id = drive_transfer(&mut f, 1_000, "H", "NOT-H").await;

        let record = f.store.transfer(transfer_id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
        assert!(
            record
                .error_message
                .as_deref()
                .unwrap()
                .contains("CHECKSUM_MISMATCH")
        );
    }

    #[tokio::test]
    async fn zero_byte_file_completes_with_zero_chunks() {
        let mut f = fixture().await;
        let record = f
            .manager
            .start(&claims(f.owner), &request(&f))
            .await
            .unwrap();
        let transfer_id = record.transfer_id;

        let (id, method, _) = next_request(&mut f.dest_rx).await;
        assert_eq!(method, "fs_mkdir");
        f.registry
            .resolve_response(f.dest_conn, &id, Ok(json!({})))
            .await;

        let (id, method, _) = next_request(&mut f.source_rx).await;
        assert_eq!(method, "files_info");
        // No checksum reported: verification is skipped.
        f.registry
            .resolve_response(f.source_conn, &id, Ok(json!({"size": 0})))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = f.store.transfer(transfer_id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert_eq!(record.bytes_transferred, 0);
    }

    #[tokio::test]
    async fn oversized_file_rejected() {
        let mut f = fixture().await;
        let record = f
            .manager
            .start(&claims(f.owner), &request(&f))
            .await
            .unwrap();

        let (id, method, _) = next_request(&mut f.dest_rx).await;
        assert_eq!(method, "fs_mkdir");
        f.registry
            .resolve_response(f.dest_conn, &id, Ok(json!({})))
            .await;

        let (id, _, _) = next_request(&mut f.source_rx).await;
        f.registry
            .resolve_response(f.source_conn, &id, Ok(json!({"size": (1u64 << 30) + 1})))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = f.store.transfer(record.transfer_id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Failed);
        assert!(
            record
                .error_message
                .as_deref()
                .unwrap()
                .contains("LIMIT_EXCEEDED")
        );
    }

    #[tokio::test]
    async fn cancel_stops_loop_and_keeps_cancelled_status() {
        let mut f = fixture().await;
        let record = f
            .manager
            .start(&claims(f.owner), &request(&f))
            .await
            .unwrap();
        let transfer_id = record.transfer_id;

        let (id, method, _) = next_request(&mut f.dest_rx).await;
        assert_eq!(method, "fs_mkdir");
        f.registry
            .resolve_response(f.dest_conn, &id, Ok(json!({})))
            .await;

        let (id, _, _) = next_request(&mut f.source_rx).await;
        f.registry
            .resolve_response(
                f.source_conn,
                &id,
                Ok(json!({"size": 10 * 262_144, "checksum": "H"})),
            )
            .await;

        // Answer the first chunk read, then cancel mid-flight.
        let (id, method, _) = next_request(&mut f.source_rx).await;
        assert_eq!(method, "files_read_chunk");
        f.manager.cancel(transfer_id, &claims(f.owner)).await.unwrap();
        f.registry
            .resolve_response(
                f.source_conn,
                &id,
                Ok(json!({"data": BASE64.encode([0u8; 16])})),
            )
            .await;
        let (id, method, _) = next_request(&mut f.dest_rx).await;
        assert_eq!(method, "files_write_chunk");
        f.registry
            .resolve_response(f.dest_conn, &id, Ok(json!({})))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let record = f.store.transfer(transfer_id).await.unwrap();
        assert_eq!(record.status, TransferStatus::Cancelled);
        // No further chunk reads after the loop observed the cancellation.
        assert!(f.source_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_requires_file_transfer_permission() {
        let f = fixture().await;
        let mut row = f.store.agent_by_id(f.source_agent).await.unwrap();
        row.file_transfer_enabled = false;
        f.store.upsert_agent(row).await;

        let err = f
            .manager
            .start(&claims(f.owner), &request(&f))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "POLICY_DENIED");
    }

    #[tokio::test]
    async fn start_requires_owner_scope() {
        let f = fixture().await;
        let err = f
            .manager
            .start(&claims(Uuid::new_v4()), &request(&f))
            .await
            .unwrap_err();
        assert_eq!(err, ControlError::NotAuthorized);
    }

    #[test]
    fn parent_dir_extraction() {
        assert_eq!(parent_dir("/var/y"), Some("/var"));
        assert_eq!(parent_dir("/var/data/y.bin"), Some("/var/data"));
        assert_eq!(parent_dir("C:\\data\\y"), Some("C:\\data"));
        assert_eq!(parent_dir("/y"), None);
        assert_eq!(parent_dir("y"), None);
    }
}
