//! Local system handler.
//!
//! Serves filesystem, shell, and machine methods in-process when the server
//! is the target - the bundled local service case - or when it runs
//! co-located with the agent host and `server.local_privileged` is set.

use serde_json::{Value, json};
use tokio::process::Command;

use tether_protocol::ControlError;

fn param_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ControlError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ControlError::ProtocolError(format!("missing parameter: {key}")))
}

pub async fn handle(method: &str, params: &Value) -> Result<Value, ControlError> {
    match method {
        "system_info" | "machine_info" => system_info(),
        "fs_mkdir" => {
            let path = param_str(params, "path")?;
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| ControlError::PeerError(format!("mkdir {path}: {e}")))?;
            Ok(json!({"created": true}))
        }
        "fs_list" => {
            let path = param_str(params, "path")?;
            let mut entries = Vec::new();
            let mut dir = tokio::fs::read_dir(path)
                .await
                .map_err(|e| ControlError::PeerError(format!("read_dir {path}: {e}")))?;
            while let Some(entry) = dir
                .next_entry()
                .await
                .map_err(|e| ControlError::PeerError(format!("read_dir {path}: {e}")))?
            {
                let meta = entry.metadata().await.ok();
                entries.push(json!({
                    "name": entry.file_name().to_string_lossy(),
                    "isDir": meta.as_ref().map(|m| m.is_dir()).unwrap_or(false),
                    "size": meta.map(|m| m.len()).unwrap_or(0),
                }));
            }
            Ok(json!({"entries": entries}))
        }
        "fs_read" => {
            let path = param_str(params, "path")?;
            let data = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| ControlError::PeerError(format!("read {path}: {e}")))?;
            Ok(json!({"content": data}))
        }
        "fs_write" => {
            let path = param_str(params, "path")?;
            let content = param_str(params, "content")?;
            tokio::fs::write(path, content)
                .await
                .map_err(|e| ControlError::PeerError(format!("write {path}: {e}")))?;
            Ok(json!({"written": content.len()}))
        }
        "fs_delete" => {
            let path = param_str(params, "path")?;
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| ControlError::PeerError(format!("delete {path}: {e}")))?;
            Ok(json!({"deleted": true}))
        }
        "shell_exec" => {
            let command = param_str(params, "command")?;
            let output = Command::new("sh")
                .arg("-c")
                .arg(command)
                .output()
                .await
                .map_err(|e| ControlError::PeerError(format!("spawn: {e}")))?;
            Ok(json!({
                "exitCode": output.status.code().unwrap_or(-1),
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
            }))
        }
        "machine_lock" => loginctl("lock-sessions").await,
        "machine_unlock" => loginctl("unlock-sessions").await,
        other => Err(ControlError::ProtocolError(format!(
            "method not served locally: {other}"
        ))),
    }
}

async fn loginctl(verb: &str) -> Result<Value, ControlError> {
    let status = Command::new("loginctl")
        .arg(verb)
        .status()
        .await
        .map_err(|e| ControlError::PeerError(format!("loginctl {verb}: {e}")))?;
    Ok(json!({"ok": status.success()}))
}

fn system_info() -> Result<Value, ControlError> {
    let hostname = std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    Ok(json!({
        "hostname": hostname,
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    }))
}
