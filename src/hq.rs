//! HQ / remote registry (§4.8): accepts remote-node registrations, merges
//! their session listings, routes per-session calls, and health-checks
//! remotes without cascading removals on transient failure.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use jiff::Timestamp;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
pub const SESSIONS_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);
pub const OTHER_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A remote removed once it has been unreachable across this many
/// consecutive health checks (§4.8 "removed when ... unreachable for a
/// configured window").
pub const UNREACHABLE_EVICTION_THRESHOLD: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remote {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub bearer_token: String,
    pub registered_at: Timestamp,
    pub last_seen: Option<Timestamp>,
    pub sessions: Vec<serde_json::Value>,
    #[serde(skip)]
    pub consecutive_failures: u32,
}

/// `remoteId -> Remote` plus the inverse `sessionId -> remoteId` index,
/// protected by a single reader/writer lock (§4.8).
pub struct RemoteRegistry {
    remotes: RwLock<HashMap<String, Remote>>,
    session_index: RwLock<HashMap<String, String>>,
    client: Client,
}

impl RemoteRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            remotes: RwLock::new(HashMap::new()),
            session_index: RwLock::new(HashMap::new()),
            client: Client::builder()
                .timeout(OTHER_CALL_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Registers a new remote, rejecting a duplicate `name` (§4.8 "rejects
    /// duplicate name"). Kicks off an initial session refresh.
    pub fn register(&self, name: String, url: String, bearer_token: String) -> Result<Remote> {
        {
            let remotes = self.remotes.read().unwrap_or_else(|e| e.into_inner());
            if remotes.values().any(|r| r.name == name) {
                return Err(CoreError::Conflict(format!("remote named {name} already registered")));
            }
        }

        let remote = Remote {
            id: Uuid::new_v4().to_string(),
            name,
            url,
            bearer_token,
            registered_at: Timestamp::now(),
            last_seen: None,
            sessions: Vec::new(),
            consecutive_failures: 0,
        };

        self.remotes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(remote.id.clone(), remote.clone());

        let _ = self.refresh_sessions(&remote.id);
        Ok(remote)
    }

    /// Removes all session index entries and the remote. Idempotent once
    /// gone.
    pub fn unregister(&self, remote_id: &str) {
        self.remotes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(remote_id);
        self.session_index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, r| r != remote_id);
    }

    #[must_use]
    pub fn list(&self) -> Vec<Remote> {
        self.remotes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// The shared outbound HTTP client, reused by the HQ proxy (§4.7) so
    /// per-session proxied calls don't each pay a new client's connection
    /// setup cost.
    #[must_use]
    pub fn http_client(&self) -> &Client {
        &self.client
    }

    #[must_use]
    pub fn get(&self, remote_id: &str) -> Option<Remote> {
        self.remotes.read().unwrap_or_else(|e| e.into_inner()).get(remote_id).cloned()
    }

    /// Finds which remote owns `session_id`, if any (the authoritative
    /// routing table for per-session proxying, §4.7).
    #[must_use]
    pub fn route_for_session(&self, session_id: &str) -> Option<Remote> {
        let remote_id = self
            .session_index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()?;
        self.get(&remote_id)
    }

    /// GETs the remote's `/api/sessions` and replaces its session list and
    /// index entries atomically. On error, leaves previous state intact.
    pub fn refresh_sessions(&self, remote_id: &str) -> Result<()> {
        let Some(remote) = self.get(remote_id) else {
            return Err(CoreError::NotFound(remote_id.to_string()));
        };

        let response = self
            .client
            .get(format!("{}/api/sessions", remote.url))
            .bearer_auth(&remote.bearer_token)
            .timeout(SESSIONS_REFRESH_TIMEOUT)
            .send()
            .map_err(|e| CoreError::Upstream(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Upstream(format!("status {}", response.status())));
        }

        let sessions: Vec<serde_json::Value> =
            response.json().map_err(|e| CoreError::Upstream(e.to_string()))?;

        let session_ids: Vec<String> = sessions
            .iter()
            .filter_map(|s| s.get("id").and_then(|v| v.as_str()).map(str::to_string))
            .collect();

        {
            let mut remotes = self.remotes.write().unwrap_or_else(|e| e.into_inner());
            if let Some(r) = remotes.get_mut(remote_id) {
                r.sessions = sessions;
                r.last_seen = Some(Timestamp::now());
                r.consecutive_failures = 0;
            }
        }
        {
            let mut index = self.session_index.write().unwrap_or_else(|e| e.into_inner());
            index.retain(|_, r| r != remote_id);
            for id in session_ids {
                index.insert(id, remote_id.to_string());
            }
        }

        Ok(())
    }

    /// Fans `POST /api/cleanup-exited` out to every remote, collecting
    /// per-remote results (§4.7, §4.8).
    #[must_use]
    pub fn cleanup_exited_all(&self) -> HashMap<String, Result<u64>> {
        let remotes = self.list();
        let mut results = HashMap::new();
        for remote in remotes {
            let outcome = self
                .client
                .post(format!("{}/api/cleanup-exited", remote.url))
                .bearer_auth(&remote.bearer_token)
                .timeout(OTHER_CALL_TIMEOUT)
                .send()
                .map_err(|e| CoreError::Upstream(e.to_string()))
                .and_then(|resp| {
                    resp.json::<serde_json::Value>()
                        .map_err(|e| CoreError::Upstream(e.to_string()))
                })
                .map(|body| body.get("count").and_then(serde_json::Value::as_u64).unwrap_or(0));
            results.insert(remote.id, outcome);
        }
        results
    }

    /// One iteration of the health loop (§4.8): GET each remote's
    /// `/api/health`. Success refreshes its sessions and clears the failure
    /// counter; failure increments it without immediately removing the
    /// remote, and the remote is evicted only past
    /// [`UNREACHABLE_EVICTION_THRESHOLD`] consecutive failures.
    pub fn health_check_once(&self) {
        let remotes = self.list();
        let mut to_evict = Vec::new();

        for remote in remotes {
            let healthy = self
                .client
                .get(format!("{}/api/health", remote.url))
                .bearer_auth(&remote.bearer_token)
                .timeout(HEALTH_TIMEOUT)
                .send()
                .is_ok_and(|resp| resp.status().is_success());

            if healthy {
                let _ = self.refresh_sessions(&remote.id);
            } else {
                let mut remotes = self.remotes.write().unwrap_or_else(|e| e.into_inner());
                if let Some(r) = remotes.get_mut(&remote.id) {
                    r.consecutive_failures += 1;
                    warn!(remote = %remote.name, failures = r.consecutive_failures, "remote health check failed");
                    if r.consecutive_failures >= UNREACHABLE_EVICTION_THRESHOLD {
                        to_evict.push(remote.id.clone());
                    }
                }
            }
        }

        for id in to_evict {
            info!(remote_id = %id, "evicting remote after repeated health-check failures");
            self.unregister(&id);
        }
    }

    /// Runs the health loop on a dedicated thread until the process exits.
    pub fn spawn_health_loop(self: std::sync::Arc<Self>) {
        std::thread::spawn(move || loop {
            std::thread::sleep(HEALTH_CHECK_INTERVAL);
            self.health_check_once();
        });
    }
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers this node with an upstream HQ at startup (§4.8 "remote mode").
pub fn register_with_hq(cfg: &crate::config::RemoteOfConfig) -> Result<String> {
    let client = Client::builder().timeout(OTHER_CALL_TIMEOUT).build().map_err(|e| CoreError::Upstream(e.to_string()))?;
    let response = client
        .post(format!("{}/api/remotes/register", cfg.hq_url))
        .bearer_auth(&cfg.hq_bearer_token)
        .json(&serde_json::json!({"name": cfg.my_name, "url": cfg.my_url}))
        .send()
        .map_err(|e| CoreError::Upstream(e.to_string()))?;
    let body: serde_json::Value =
        response.json().map_err(|e| CoreError::Upstream(e.to_string()))?;
    body.get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| CoreError::Upstream("register response missing id".to_string()))
}

/// Unregisters this node from its HQ at shutdown, best effort (§4.8).
pub fn unregister_from_hq(cfg: &crate::config::RemoteOfConfig, remote_id: &str) {
    let client = Client::new();
    let _ = client
        .delete(format!("{}/api/remotes/{remote_id}", cfg.hq_url))
        .bearer_auth(&cfg.hq_bearer_token)
        .timeout(OTHER_CALL_TIMEOUT)
        .send();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_duplicate_name() {
        let registry = RemoteRegistry::new();
        registry
            .register("alice".to_string(), "http://localhost:1".to_string(), "t".to_string())
            .unwrap();
        let result =
            registry.register("alice".to_string(), "http://localhost:2".to_string(), "t".to_string());
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = RemoteRegistry::new();
        let remote = registry
            .register("bob".to_string(), "http://localhost:1".to_string(), "t".to_string())
            .unwrap();
        registry.unregister(&remote.id);
        registry.unregister(&remote.id);
        assert!(registry.get(&remote.id).is_none());
    }

    #[test]
    fn route_for_session_is_none_when_unknown() {
        let registry = RemoteRegistry::new();
        assert!(registry.route_for_session("nope").is_none());
    }
}
