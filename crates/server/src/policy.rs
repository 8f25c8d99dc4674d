//! Per-heartbeat policy evaluation.
//!
//! Stateless with respect to the agent (everything derives from the
//! persistent row and the published-build tables); the only memory kept is
//! the previously reported license status and default browser per agent,
//! so the ack can carry deltas instead of repeating itself.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use tether_protocol::{LicenseState, PermissionSnapshot};

use crate::store::{AgentRecord, Store, VersionRecord};

/// Update flag values carried as `u` in heartbeat_ack.
pub const UPDATE_NONE: u8 = 0;
pub const UPDATE_AVAILABLE: u8 = 1;
pub const UPDATE_FORCED: u8 = 2;

#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub license_status: LicenseState,
    pub license_changed: bool,
    pub license_message: Option<String>,
    pub permissions: PermissionSnapshot,
    /// Included only when it differs from what the agent last saw.
    pub default_browser: Option<String>,
    pub update_flag: u8,
}

impl PolicyDecision {
    /// Logical run state handed to the agent: ACTIVE on a good license,
    /// DEGRADED otherwise.
    pub fn agent_state(&self) -> &'static str {
        if self.license_status == LicenseState::Active {
            "ACTIVE"
        } else {
            "DEGRADED"
        }
    }
}

pub struct PolicyEvaluator {
    store: Arc<dyn Store>,
    last_status: RwLock<HashMap<Uuid, LicenseState>>,
    last_browser: RwLock<HashMap<Uuid, String>>,
    grace_hours: u32,
}

impl PolicyEvaluator {
    pub fn new(store: Arc<dyn Store>, grace_hours: u32) -> Self {
        Self {
            store,
            last_status: RwLock::new(HashMap::new()),
            last_browser: RwLock::new(HashMap::new()),
            grace_hours,
        }
    }

    /// Compute license status, permissions, update flag, and browser delta
    /// for one heartbeat.
    pub async fn evaluate(&self, agent: &AgentRecord, now: u64) -> PolicyDecision {
        let (license_status, license_message) = self.license_status(agent, now).await;

        let license_changed = {
            let mut memo = self.last_status.write().await;
            match memo.insert(agent.agent_id, license_status) {
                Some(previous) => previous != license_status,
                // First evaluation for this agent in this process: report the
                // status without flagging a change.
                None => false,
            }
        };

        let default_browser = match &agent.default_browser {
            Some(browser) => {
                let mut memo = self.last_browser.write().await;
                let changed = memo.get(&agent.agent_id) != Some(browser);
                if changed {
                    memo.insert(agent.agent_id, browser.clone());
                    Some(browser.clone())
                } else {
                    None
                }
            }
            None => None,
        };

        let update_flag = update_flag(&self.store.versions().await, agent);

        PolicyDecision {
            license_status,
            license_changed,
            license_message,
            permissions: PermissionSnapshot {
                master_mode: agent.master_mode_enabled,
                file_transfer: agent.file_transfer_enabled,
                local_settings_locked: agent.local_settings_locked,
            },
            default_browser,
            update_flag,
        }
    }

    async fn license_status(&self, agent: &AgentRecord, now: u64) -> (LicenseState, Option<String>) {
        let Some(license_uuid) = agent.license_uuid else {
            return (agent.license_state, None);
        };
        match self.store.license(license_uuid).await {
            Some(license) => match license.expires_at {
                Some(expires_at) if expires_at <= now => (
                    LicenseState::Expired,
                    Some("License has expired".to_string()),
                ),
                _ => (license.state, None),
            },
            None => (
                LicenseState::Blocked,
                Some("License record not found".to_string()),
            ),
        }
    }

    /// Whether the agent has been silent past the heartbeat grace window.
    pub fn is_lost(&self, agent: &AgentRecord, now: u64) -> bool {
        let grace_secs = u64::from(self.grace_hours) * 3_600;
        now.saturating_sub(agent.last_seen_at) > grace_secs
    }
}

/// Compute the update flag: 1 when a newer build exists for the agent's
/// (os, arch), 2 when that build is marked forced.
fn update_flag(versions: &[VersionRecord], agent: &AgentRecord) -> u8 {
    let mut flag = UPDATE_NONE;
    for version in versions {
        if !version_newer(&version.version, &agent.agent_version) {
            continue;
        }
        for build in &version.builds {
            if build.os_type == agent.os_type && build.arch == agent.arch {
                if build.forced {
                    return UPDATE_FORCED;
                }
                flag = UPDATE_AVAILABLE;
            }
        }
    }
    flag
}

/// Dotted-numeric version comparison; non-numeric segments compare as 0.
fn version_newer(candidate: &str, current: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|s| s.parse().unwrap_or(0))
            .collect()
    };
    let c = parse(candidate);
    let cur = parse(current);
    let len = c.len().max(cur.len());
    for i in 0..len {
        let a = c.get(i).copied().unwrap_or(0);
        let b = cur.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BuildRecord, LicenseRecord, MemStore, test_support, unix_now};
    use tether_protocol::OsType;

    fn evaluator(store: Arc<MemStore>) -> PolicyEvaluator {
        PolicyEvaluator::new(store as Arc<dyn Store>, 72)
    }

    #[test]
    fn version_ordering() {
        assert!(version_newer("0.3.1", "0.3.0"));
        assert!(version_newer("1.0.0", "0.9.9"));
        assert!(version_newer("0.3.0.1", "0.3.0"));
        assert!(!version_newer("0.3.0", "0.3.0"));
        assert!(!version_newer("0.2.9", "0.3.0"));
        assert!(version_newer("v0.4.0", "0.3.9"));
    }

    #[tokio::test]
    async fn license_change_is_flagged_once() {
        let store = Arc::new(MemStore::new());
        let mut agent = test_support::agent(Uuid::new_v4(), "fp-1");
        let license_uuid = Uuid::new_v4();
        agent.license_uuid = Some(license_uuid);
        store
            .put_license(LicenseRecord {
                license_uuid,
                owner_id: agent.owner_id,
                state: LicenseState::Pending,
                expires_at: None,
            })
            .await;

        let policy = evaluator(Arc::clone(&store));
        let now = unix_now();

        let first = policy.evaluate(&agent, now).await;
        assert_eq!(first.license_status, LicenseState::Pending);
        assert!(!first.license_changed);

        // License flips to active out-of-band.
        store
            .put_license(LicenseRecord {
                license_uuid,
                owner_id: agent.owner_id,
                state: LicenseState::Active,
                expires_at: None,
            })
            .await;

        let second = policy.evaluate(&agent, now).await;
        assert_eq!(second.license_status, LicenseState::Active);
        assert!(second.license_changed);
        assert_eq!(second.agent_state(), "ACTIVE");

        let third = policy.evaluate(&agent, now).await;
        assert!(!third.license_changed);
    }

    #[tokio::test]
    async fn expired_license_degrades() {
        let store = Arc::new(MemStore::new());
        let mut agent = test_support::agent(Uuid::new_v4(), "fp-1");
        let license_uuid = Uuid::new_v4();
        agent.license_uuid = Some(license_uuid);
        let now = unix_now();
        store
            .put_license(LicenseRecord {
                license_uuid,
                owner_id: agent.owner_id,
                state: LicenseState::Active,
                expires_at: Some(now - 10),
            })
            .await;

        let decision = evaluator(store).evaluate(&agent, now).await;
        assert_eq!(decision.license_status, LicenseState::Expired);
        assert_eq!(decision.agent_state(), "DEGRADED");
        assert!(decision.license_message.is_some());
    }

    #[tokio::test]
    async fn update_flag_matches_platform() {
        let store = Arc::new(MemStore::new());
        let mut agent = test_support::agent(Uuid::new_v4(), "fp-1");
        agent.agent_version = "0.3.0".to_string();
        agent.os_type = OsType::Linux;
        agent.arch = "x86_64".to_string();

        store
            .put_version(VersionRecord {
                version: "0.4.0".to_string(),
                released_at: unix_now(),
                builds: vec![BuildRecord {
                    os_type: OsType::Windows,
                    arch: "x86_64".to_string(),
                    url: "https://dl/0.4.0/win".to_string(),
                    forced: false,
                }],
            })
            .await;

        // Newer version exists but has no build for this platform.
        let policy = evaluator(Arc::clone(&store));
        let decision = policy.evaluate(&agent, unix_now()).await;
        assert_eq!(decision.update_flag, UPDATE_NONE);

        store
            .put_version(VersionRecord {
                version: "0.4.1".to_string(),
                released_at: unix_now(),
                builds: vec![BuildRecord {
                    os_type: OsType::Linux,
                    arch: "x86_64".to_string(),
                    url: "https://dl/0.4.1/linux".to_string(),
                    forced: false,
                }],
            })
            .await;
        let decision = policy.evaluate(&agent, unix_now()).await;
        assert_eq!(decision.update_flag, UPDATE_AVAILABLE);
    }

    #[tokio::test]
    async fn forced_build_wins() {
        let store = Arc::new(MemStore::new());
        let mut agent = test_support::agent(Uuid::new_v4(), "fp-1");
        agent.agent_version = "0.2.0".to_string();

        store
            .put_version(VersionRecord {
                version: "0.3.0".to_string(),
                released_at: unix_now(),
                builds: vec![BuildRecord {
                    os_type: agent.os_type,
                    arch: agent.arch.clone(),
                    url: "https://dl/0.3.0".to_string(),
                    forced: true,
                }],
            })
            .await;

        let decision = evaluator(store).evaluate(&agent, unix_now()).await;
        assert_eq!(decision.update_flag, UPDATE_FORCED);
    }

    #[tokio::test]
    async fn browser_delta_reported_once() {
        let store = Arc::new(MemStore::new());
        let mut agent = test_support::agent(Uuid::new_v4(), "fp-1");
        agent.default_browser = Some("firefox".to_string());

        let policy = evaluator(store);
        let first = policy.evaluate(&agent, unix_now()).await;
        assert_eq!(first.default_browser.as_deref(), Some("firefox"));

        let second = policy.evaluate(&agent, unix_now()).await;
        assert!(second.default_browser.is_none());

        agent.default_browser = Some("chromium".to_string());
        let third = policy.evaluate(&agent, unix_now()).await;
        assert_eq!(third.default_browser.as_deref(), Some("chromium"));
    }

    #[tokio::test]
    async fn lost_agent_detection() {
        let store = Arc::new(MemStore::new());
        let policy = evaluator(store);
        let mut agent = test_support::agent(Uuid::new_v4(), "fp-1");
        let now = unix_now();
        agent.last_seen_at = now - 73 * 3_600;
        assert!(policy.is_lost(&agent, now));
        agent.last_seen_at = now - 71 * 3_600;
        assert!(!policy.is_lost(&agent, now));
    }
}
