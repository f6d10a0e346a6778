//! Per-session mapping from target language to subscribed listener
//! connections.
//!
//! Each session's buckets sit behind one mutex; broadcasts take a snapshot
//! so subscribe/unsubscribe never race an in-progress fan-out. A language
//! change moves the connection between buckets in a single critical
//! section.

use dashmap::DashMap;
use shared::LanguageCode;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

type Buckets = HashMap<LanguageCode, HashSet<Uuid>>;

#[derive(Default)]
pub struct FanoutIndex {
    sessions: DashMap<String, Mutex<Buckets>>,
}

impl FanoutIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_session(&self, session_id: &str) {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Mutex::new(HashMap::new()));
    }

    pub fn drop_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn subscribe(&self, session_id: &str, language: LanguageCode, conn_id: Uuid) {
        self.ensure_session(session_id);
        if let Some(buckets) = self.sessions.get(session_id) {
            let mut buckets = buckets.lock().expect("fanout poisoned");
            buckets.entry(language).or_default().insert(conn_id);
        }
    }

    /// Removes the connection from whatever bucket holds it. Returns the
    /// language it was subscribed to, if any.
    pub fn unsubscribe(&self, session_id: &str, conn_id: Uuid) -> Option<LanguageCode> {
        let buckets = self.sessions.get(session_id)?;
        let mut buckets = buckets.lock().expect("fanout poisoned");
        let mut found = None;
        for (language, members) in buckets.iter_mut() {
            if members.remove(&conn_id) {
                found = Some(*language);
                break;
            }
        }
        found
    }

    /// Atomic bucket move; the connection is never observable in both.
    pub fn change_language(
        &self,
        session_id: &str,
        conn_id: Uuid,
        new_language: LanguageCode,
    ) -> Option<LanguageCode> {
        self.ensure_session(session_id);
        let buckets = self.sessions.get(session_id)?;
        let mut buckets = buckets.lock().expect("fanout poisoned");
        let mut old = None;
        for (language, members) in buckets.iter_mut() {
            if *language != new_language && members.remove(&conn_id) {
                old = Some(*language);
                break;
            }
        }
        buckets.entry(new_language).or_default().insert(conn_id);
        old
    }

    /// Snapshot of the subscribers for one language.
    pub fn subscribers(&self, session_id: &str, language: LanguageCode) -> Vec<Uuid> {
        self.sessions
            .get(session_id)
            .map(|buckets| {
                buckets
                    .lock()
                    .expect("fanout poisoned")
                    .get(&language)
                    .map(|members| members.iter().copied().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Snapshot of every subscriber in the session.
    pub fn all_subscribers(&self, session_id: &str) -> Vec<Uuid> {
        self.sessions
            .get(session_id)
            .map(|buckets| {
                buckets
                    .lock()
                    .expect("fanout poisoned")
                    .values()
                    .flat_map(|members| members.iter().copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Empties and returns the bucket for a language being removed from the
    /// session configuration.
    pub fn drain_language(&self, session_id: &str, language: LanguageCode) -> Vec<Uuid> {
        self.sessions
            .get(session_id)
            .map(|buckets| {
                let mut buckets = buckets.lock().expect("fanout poisoned");
                buckets
                    .remove(&language)
                    .map(|members| members.into_iter().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn listener_count(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|buckets| {
                buckets
                    .lock()
                    .expect("fanout poisoned")
                    .values()
                    .map(HashSet::len)
                    .sum()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = "CHURCH-2025-001";

    #[test]
    fn test_subscribe_and_snapshot() {
        let index = FanoutIndex::new();
        let l1 = Uuid::new_v4();
        let l2 = Uuid::new_v4();

        index.subscribe(SESSION, LanguageCode::En, l1);
        index.subscribe(SESSION, LanguageCode::Es, l2);

        assert_eq!(index.subscribers(SESSION, LanguageCode::En), vec![l1]);
        assert_eq!(index.subscribers(SESSION, LanguageCode::Es), vec![l2]);
        assert!(index.subscribers(SESSION, LanguageCode::Fr).is_empty());
        assert_eq!(index.listener_count(SESSION), 2);
    }

    #[test]
    fn test_change_language_moves_between_buckets() {
        let index = FanoutIndex::new();
        let conn = Uuid::new_v4();

        index.subscribe(SESSION, LanguageCode::Es, conn);
        let old = index.change_language(SESSION, conn, LanguageCode::En);

        assert_eq!(old, Some(LanguageCode::Es));
        assert!(index.subscribers(SESSION, LanguageCode::Es).is_empty());
        assert_eq!(index.subscribers(SESSION, LanguageCode::En), vec![conn]);
        assert_eq!(index.listener_count(SESSION), 1);
    }

    #[test]
    fn test_change_language_to_same_bucket_is_noop() {
        let index = FanoutIndex::new();
        let conn = Uuid::new_v4();

        index.subscribe(SESSION, LanguageCode::En, conn);
        let old = index.change_language(SESSION, conn, LanguageCode::En);

        assert_eq!(old, None);
        assert_eq!(index.subscribers(SESSION, LanguageCode::En), vec![conn]);
    }

    #[test]
    fn test_unsubscribe_reports_language() {
        let index = FanoutIndex::new();
        let conn = Uuid::new_v4();

        index.subscribe(SESSION, LanguageCode::De, conn);
        assert_eq!(index.unsubscribe(SESSION, conn), Some(LanguageCode::De));
        assert_eq!(index.unsubscribe(SESSION, conn), None);
        assert_eq!(index.listener_count(SESSION), 0);
    }

    #[test]
    fn test_drain_language_empties_bucket() {
        let index = FanoutIndex::new();
        let l1 = Uuid::new_v4();
        let l2 = Uuid::new_v4();
        index.subscribe(SESSION, LanguageCode::Es, l1);
        index.subscribe(SESSION, LanguageCode::Es, l2);
        index.subscribe(SESSION, LanguageCode::En, Uuid::new_v4());

        let mut drained = index.drain_language(SESSION, LanguageCode::Es);
        drained.sort();
        let mut expected = vec![l1, l2];
        expected.sort();
        assert_eq!(drained, expected);
        assert!(index.subscribers(SESSION, LanguageCode::Es).is_empty());
        assert_eq!(index.listener_count(SESSION), 1);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let index = FanoutIndex::new();
        let conn = Uuid::new_v4();
        index.subscribe("A-2025-001", LanguageCode::En, conn);

        assert!(index.subscribers("B-2025-001", LanguageCode::En).is_empty());
        index.drop_session("A-2025-001");
        assert!(index.subscribers("A-2025-001", LanguageCode::En).is_empty());
    }
}
