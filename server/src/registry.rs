//! Session registry: owns every live session, enforces the status state
//! machine, and persists each session to a small file for crash recovery.

use crate::error::ServerError;
use crate::persist;
use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use shared::{SessionConfig, SessionStatus};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

static SESSION_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z]+)-(\d{4})-(\d{3})$").expect("static pattern"));

/// A live translation broadcast. Connection-level fields are transient and
/// never persisted; clients rejoin after a restart.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub owner_admin_id: String,
    pub current_admin_conn: Option<Uuid>,
    pub config: SessionConfig,
    pub listeners: HashSet<Uuid>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn transition(&mut self, next: SessionStatus) -> Result<(), ServerError> {
        if !self.status.can_transition_to(next) {
            return Err(ServerError::Internal(format!(
                "illegal status transition {} -> {} for {}",
                self.status, next, self.id
            )));
        }
        self.status = next;
        self.last_activity = Utc::now();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    fn to_record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id.clone(),
            owner_admin_id: self.owner_admin_id.clone(),
            config: self.config.clone(),
            status: self.status,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    fn from_record(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            owner_admin_id: record.owner_admin_id,
            current_admin_conn: None,
            config: record.config,
            listeners: HashSet::new(),
            status: record.status,
            created_at: record.created_at,
            last_activity: record.last_activity,
        }
    }
}

/// The on-disk shape of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub owner_admin_id: String,
    pub config: SessionConfig,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

pub struct SessionRegistry {
    dir: PathBuf,
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    /// Highest counter seen per (prefix, year), including sessions that are
    /// gone from disk, so restarts never re-mint an id.
    counters: std::sync::Mutex<HashMap<(String, i32), u32>>,
}

impl SessionRegistry {
    /// Opens the registry and rehydrates sessions whose last activity falls
    /// within `retention` and whose status is not terminal. Stale and
    /// terminal records are removed from disk after seeding the id
    /// counters.
    pub async fn open(dir: &Path, retention: Duration) -> Result<Self, ServerError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ServerError::Persistence(format!("{}: {}", dir.display(), e)))?;

        let registry = Self {
            dir: dir.to_path_buf(),
            sessions: DashMap::new(),
            counters: std::sync::Mutex::new(HashMap::new()),
        };

        let cutoff = Utc::now() - chrono::Duration::seconds(retention.as_secs() as i64);
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| ServerError::Persistence(format!("{}: {}", dir.display(), e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ServerError::Persistence(e.to_string()))?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            registry.observe_id(id);

            match persist::read_json::<SessionRecord>(&path).await {
                Ok(Some(record)) => {
                    if record.status.is_terminal() || record.last_activity < cutoff {
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    info!("rehydrated session {} ({})", record.id, record.status);
                    registry.sessions.insert(
                        record.id.clone(),
                        Arc::new(Mutex::new(Session::from_record(record))),
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("skipping unreadable session record {}: {}", name, e);
                    persist::quarantine(&path).await;
                }
            }
        }

        Ok(registry)
    }

    pub fn is_valid_id(id: &str) -> bool {
        SESSION_ID_PATTERN.is_match(id)
    }

    /// Records an id in the counter map so minting skips past it.
    fn observe_id(&self, id: &str) {
        if let Some(caps) = SESSION_ID_PATTERN.captures(id) {
            let prefix = caps[1].to_string();
            let year: i32 = caps[2].parse().unwrap_or(0);
            let seq: u32 = caps[3].parse().unwrap_or(0);
            let mut counters = self.counters.lock().expect("counters poisoned");
            let floor = counters.entry((prefix, year)).or_insert(0);
            if seq > *floor {
                *floor = seq;
            }
        }
    }

    fn mint_id(&self, prefix: &str) -> String {
        let year = Utc::now().year();
        let mut counters = self.counters.lock().expect("counters poisoned");
        let floor = counters.entry((prefix.to_string(), year)).or_insert(0);
        *floor += 1;
        format!("{}-{}-{:03}", prefix, year, floor)
    }

    /// Creates a session under a proposed or minted id. Exactly one of any
    /// set of concurrent creates with the same id succeeds.
    pub async fn create(
        &self,
        proposed_id: Option<String>,
        owner_admin_id: &str,
        config: SessionConfig,
        default_prefix: &str,
    ) -> Result<Arc<Mutex<Session>>, ServerError> {
        config
            .validate()
            .map_err(ServerError::MalformedConfiguration)?;

        let id = match proposed_id {
            Some(id) => {
                if !Self::is_valid_id(&id) {
                    return Err(ServerError::InvalidSessionId(id));
                }
                id
            }
            None => self.mint_id(default_prefix),
        };

        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            owner_admin_id: owner_admin_id.to_string(),
            current_admin_conn: None,
            config,
            listeners: HashSet::new(),
            status: SessionStatus::Started,
            created_at: now,
            last_activity: now,
        };

        let handle = match self.sessions.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ServerError::SessionAlreadyExists(id));
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let handle = Arc::new(Mutex::new(session.clone()));
                vacant.insert(handle.clone());
                handle
            }
        };
        self.observe_id(&id);

        if let Err(e) = self.persist_snapshot(&session).await {
            self.sessions.remove(&id);
            return Err(e);
        }
        info!("session {} created by {}", id, owner_admin_id);
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Persists a point-in-time snapshot. Callers snapshot under the session
    /// lock and write after releasing it.
    pub async fn persist_snapshot(&self, session: &Session) -> Result<(), ServerError> {
        let path = self.dir.join(format!("{}.json", session.id));
        persist::write_json_with_retry(&path, &session.to_record()).await
    }

    /// Drops an ended session from memory and disk.
    pub async fn remove(&self, id: &str) {
        self.sessions.remove(id);
        let _ = tokio::fs::remove_file(self.dir.join(format!("{}.json", id))).await;
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }
}
