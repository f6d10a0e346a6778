//! In-memory cache of validated admin tokens, keyed by connection id.
//!
//! Entries are dropped on disconnect; a periodic sweep evicts expired
//! tokens and drives the `token-expiry-warning` / `session-expired`
//! frames.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: String,
    pub admin_id: String,
    pub expires_at: DateTime<Utc>,
    /// Set once a `token-expiry-warning` has been sent for this entry.
    pub warned: bool,
}

#[derive(Default)]
pub struct TokenCache {
    entries: DashMap<Uuid, CachedToken>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        conn_id: Uuid,
        access_token: String,
        admin_id: String,
        expires_at: DateTime<Utc>,
    ) {
        self.entries.insert(
            conn_id,
            CachedToken {
                access_token,
                admin_id,
                expires_at,
                warned: false,
            },
        );
    }

    pub fn get(&self, conn_id: &Uuid) -> Option<CachedToken> {
        self.entries.get(conn_id).map(|e| e.clone())
    }

    pub fn remove(&self, conn_id: &Uuid) {
        self.entries.remove(conn_id);
    }

    /// Entries expiring within `window` that have not been warned yet.
    /// Marks them warned so each connection hears exactly one warning.
    pub fn take_expiring_within(&self, window: Duration) -> Vec<(Uuid, CachedToken)> {
        let horizon = Utc::now() + chrono::Duration::seconds(window.as_secs() as i64);
        let mut due = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if !entry.warned && entry.expires_at <= horizon && entry.expires_at > Utc::now() {
                entry.warned = true;
                due.push((*entry.key(), entry.clone()));
            }
        }
        due
    }

    /// Removes and returns entries whose token has expired.
    pub fn take_expired(&self) -> Vec<(Uuid, CachedToken)> {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| *e.key())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|(k, v)| (k, v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
