//! File-backed store of admin identities.
//!
//! One JSON file per admin keyed by the stable provider id, plus an index
//! file mapping display name and email to id. Writes are atomic and
//! serialized per record; readers see either the old or the new file,
//! never a torn one.

use crate::error::ServerError;
use crate::persist;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminIdentity {
    pub admin_id: String,
    pub display_name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub owned_sessions: BTreeSet<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct IdentityIndex {
    by_display_name: HashMap<String, String>,
    by_email: HashMap<String, String>,
}

pub struct AdminIdentityStore {
    dir: PathBuf,
    records: DashMap<String, AdminIdentity>,
    /// Per-record write serialization.
    locks: DashMap<String, Arc<Mutex<()>>>,
    index: Mutex<IdentityIndex>,
}

impl AdminIdentityStore {
    pub async fn open(dir: &Path) -> Result<Self, ServerError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ServerError::Persistence(format!("{}: {}", dir.display(), e)))?;

        let index: IdentityIndex = persist::read_json(&dir.join("index.json"))
            .await?
            .unwrap_or_default();

        let store = Self {
            dir: dir.to_path_buf(),
            records: DashMap::new(),
            locks: DashMap::new(),
            index: Mutex::new(index),
        };

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
            if name == "index.json" || !name.ends_with(".json") {
                continue;
            }
            match persist::read_json::<AdminIdentity>(&path).await {
                Ok(Some(record)) => {
                    store.records.insert(record.admin_id.clone(), record);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("skipping unreadable admin record {}: {}", name, e);
                    persist::quarantine(&path).await;
                }
            }
        }

        info!("loaded {} admin identities", store.records.len());
        Ok(store)
    }

    fn record_path(&self, admin_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", admin_id))
    }

    fn record_lock(&self, admin_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(admin_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn get(&self, admin_id: &str) -> Option<AdminIdentity> {
        self.records.get(admin_id).map(|r| r.clone())
    }

    pub async fn find_by_display_name(&self, display_name: &str) -> Option<AdminIdentity> {
        let id = self
            .index
            .lock()
            .await
            .by_display_name
            .get(display_name)
            .cloned()?;
        self.get(&id)
    }

    pub async fn find_by_email(&self, email: &str) -> Option<AdminIdentity> {
        let id = self.index.lock().await.by_email.get(email).cloned()?;
        self.get(&id)
    }

    /// Idempotent create-or-touch on successful authentication. An existing
    /// record keeps its creation time and owned sessions; display name and
    /// email follow the identity provider.
    pub async fn upsert_authenticated(
        &self,
        admin_id: &str,
        display_name: &str,
        email: &str,
    ) -> Result<AdminIdentity, ServerError> {
        {
            let index = self.index.lock().await;
            if let Some(existing_id) = index.by_display_name.get(display_name) {
                if existing_id != admin_id {
                    return Err(ServerError::DisplayNameTaken(display_name.to_string()));
                }
            }
        }

        let lock = self.record_lock(admin_id);
        let _guard = lock.lock().await;

        let now = Utc::now();
        let mut record = match self.records.get(admin_id).map(|r| r.clone()) {
            Some(existing) => existing,
            None => AdminIdentity {
                admin_id: admin_id.to_string(),
                display_name: display_name.to_string(),
                email: email.to_string(),
                created_at: now,
                last_seen: now,
                owned_sessions: BTreeSet::new(),
            },
        };
        record.display_name = display_name.to_string();
        record.email = email.to_string();
        record.last_seen = now;

        self.persist_record(&record).await?;
        self.records.insert(admin_id.to_string(), record.clone());
        self.update_index(&record).await?;
        Ok(record)
    }

    pub async fn add_owned_session(
        &self,
        admin_id: &str,
        session_id: &str,
    ) -> Result<(), ServerError> {
        self.mutate_owned(admin_id, |sessions| {
            sessions.insert(session_id.to_string());
        })
        .await
    }

    pub async fn remove_owned_session(
        &self,
        admin_id: &str,
        session_id: &str,
    ) -> Result<(), ServerError> {
        self.mutate_owned(admin_id, |sessions| {
            sessions.remove(session_id);
        })
        .await
    }

    async fn mutate_owned(
        &self,
        admin_id: &str,
        mutate: impl FnOnce(&mut BTreeSet<String>),
    ) -> Result<(), ServerError> {
        let lock = self.record_lock(admin_id);
        let _guard = lock.lock().await;

        let mut record = self
            .records
            .get(admin_id)
            .map(|r| r.clone())
            .ok_or_else(|| ServerError::IdentityNotFound(admin_id.to_string()))?;
        mutate(&mut record.owned_sessions);
        record.last_seen = Utc::now();

        self.persist_record(&record).await?;
        self.records.insert(admin_id.to_string(), record);
        Ok(())
    }

    /// Drops owned-session links that no longer resolve in the session
    /// registry (stale records are discarded across restarts). Returns the
    /// number of links removed.
    pub async fn prune_owned_sessions(&self, exists: impl Fn(&str) -> bool) -> usize {
        let stale: Vec<(String, Vec<String>)> = self
            .records
            .iter()
            .filter_map(|record| {
                let gone: Vec<String> = record
                    .owned_sessions
                    .iter()
                    .filter(|id| !exists(id))
                    .cloned()
                    .collect();
                (!gone.is_empty()).then(|| (record.admin_id.clone(), gone))
            })
            .collect();

        let mut pruned = 0;
        for (admin_id, gone) in stale {
            let count = gone.len();
            let result = self
                .mutate_owned(&admin_id, |sessions| {
                    for id in &gone {
                        sessions.remove(id);
                    }
                })
                .await;
            match result {
                Ok(()) => pruned += count,
                Err(e) => warn!("failed to prune owned sessions for {}: {}", admin_id, e),
            }
        }
        if pruned > 0 {
            info!("pruned {} stale owned-session links", pruned);
        }
        pruned
    }

    /// Removes identities with no owned sessions, no live connection, and a
    /// last-seen older than the retention period. Returns removed count.
    pub async fn sweep_idle(
        &self,
        retention: Duration,
        has_live_connection: impl Fn(&str) -> bool,
    ) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(retention.as_secs() as i64);
        let victims: Vec<AdminIdentity> = self
            .records
            .iter()
            .filter(|r| {
                r.owned_sessions.is_empty()
                    && r.last_seen < cutoff
                    && !has_live_connection(&r.admin_id)
            })
            .map(|r| r.clone())
            .collect();

        let mut removed = 0;
        for record in victims {
            let lock = self.record_lock(&record.admin_id);
            let _guard = lock.lock().await;
            if let Err(e) = tokio::fs::remove_file(self.record_path(&record.admin_id)).await {
                warn!("failed to remove idle admin {}: {}", record.admin_id, e);
                continue;
            }
            self.records.remove(&record.admin_id);
            {
                let mut index = self.index.lock().await;
                index.by_display_name.remove(&record.display_name);
                index.by_email.remove(&record.email);
            }
            removed += 1;
        }
        if removed > 0 {
            info!("retention sweep removed {} idle admin identities", removed);
            let index = self.index.lock().await.clone();
            let _ = persist::write_json_with_retry(&self.dir.join("index.json"), &index).await;
        }
        removed
    }

    async fn persist_record(&self, record: &AdminIdentity) -> Result<(), ServerError> {
        let path = self.record_path(&record.admin_id);
        match persist::write_json_with_retry(&path, record).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Quarantined on disk; drop the in-memory mirror too so the
                // record is re-created from the provider on next auth.
                self.records.remove(&record.admin_id);
                Err(e)
            }
        }
    }

    async fn update_index(&self, record: &AdminIdentity) -> Result<(), ServerError> {
        let snapshot = {
            let mut index = self.index.lock().await;
            index.by_display_name.retain(|_, id| id != &record.admin_id);
            index.by_email.retain(|_, id| id != &record.admin_id);
            index
                .by_display_name
                .insert(record.display_name.clone(), record.admin_id.clone());
            index
                .by_email
                .insert(record.email.clone(), record.admin_id.clone());
            index.clone()
        };
        persist::write_json_with_retry(&self.dir.join("index.json"), &snapshot).await
    }
}
