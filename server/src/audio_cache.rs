//! Content-addressed store of synthesized audio blobs.
//!
//! Artifacts are keyed by a SHA-256 fingerprint over (text, language,
//! voice, mode) and served over plain HTTP with a short-lived signed URL.
//! The on-disk footprint is capped; least-recently-accessed artifacts are
//! evicted first, and a periodic sweep removes artifacts past a maximum
//! age.

use crate::error::ServerError;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use shared::{LanguageCode, TtsMode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AudioArtifact {
    pub fingerprint: String,
    pub path: PathBuf,
    pub mime: String,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, AudioArtifact>,
    total_bytes: u64,
}

pub struct AudioCache {
    dir: PathBuf,
    max_bytes: u64,
    url_secret: String,
    url_ttl: Duration,
    public_base_url: String,
    state: Mutex<CacheState>,
}

fn ext_for_mime(mime: &str) -> &'static str {
    match mime {
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" => "wav",
        _ => "bin",
    }
}

impl AudioCache {
    pub async fn open(
        dir: &Path,
        max_bytes: u64,
        url_secret: &str,
        url_ttl: Duration,
        public_base_url: &str,
    ) -> Result<Self, ServerError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ServerError::Persistence(format!("{}: {}", dir.display(), e)))?;

        let mut state = CacheState::default();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| ServerError::Persistence(format!("{}: {}", dir.display(), e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ServerError::Persistence(e.to_string()))?
        {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let mime = mime_guess::from_path(&path)
                .first_or_octet_stream()
                .to_string();
            let stamp = meta
                .modified()
                .ok()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);
            state.total_bytes += meta.len();
            state.entries.insert(
                stem.to_string(),
                AudioArtifact {
                    fingerprint: stem.to_string(),
                    path: path.clone(),
                    mime,
                    bytes: meta.len(),
                    created_at: stamp,
                    last_access: stamp,
                },
            );
        }
        info!(
            "audio cache opened with {} artifacts ({} bytes)",
            state.entries.len(),
            state.total_bytes
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            max_bytes,
            url_secret: url_secret.to_string(),
            url_ttl,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            state: Mutex::new(state),
        })
    }

    /// Fingerprint over everything that determines the synthesized audio.
    pub fn fingerprint(text: &str, language: LanguageCode, voice: &str, mode: TtsMode) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update([0u8]);
        hasher.update(language.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(voice.as_bytes());
        hasher.update([0u8]);
        hasher.update(mode.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Cache hit: touches the artifact and returns a freshly signed URL.
    pub fn lookup(&self, fingerprint: &str) -> Option<String> {
        let mut state = self.state.lock().expect("audio cache poisoned");
        let artifact = state.entries.get_mut(fingerprint)?;
        artifact.last_access = Utc::now();
        let ext = ext_for_mime(&artifact.mime);
        drop(state);
        Some(self.signed_url(fingerprint, ext))
    }

    /// Writes a new blob (temp + rename) and evicts least-recently-accessed
    /// artifacts until the footprint is back under the cap. The artifact
    /// just written is never evicted, so the footprint is bounded by
    /// cap + one blob.
    pub async fn store(
        &self,
        fingerprint: &str,
        bytes: &[u8],
        mime: &str,
    ) -> Result<String, ServerError> {
        let ext = ext_for_mime(mime);
        let path = self.dir.join(format!("{}.{}", fingerprint, ext));
        let tmp = self.dir.join(format!("{}.tmp", fingerprint));

        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| ServerError::Persistence(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ServerError::Persistence(format!("{}: {}", path.display(), e)))?;

        let now = Utc::now();
        let victims = {
            let mut state = self.state.lock().expect("audio cache poisoned");
            if let Some(old) = state.entries.remove(fingerprint) {
                state.total_bytes = state.total_bytes.saturating_sub(old.bytes);
            }
            state.entries.insert(
                fingerprint.to_string(),
                AudioArtifact {
                    fingerprint: fingerprint.to_string(),
                    path: path.clone(),
                    mime: mime.to_string(),
                    bytes: bytes.len() as u64,
                    created_at: now,
                    last_access: now,
                },
            );
            state.total_bytes += bytes.len() as u64;
            self.evict_locked(&mut state, fingerprint)
        };
        self.delete_files(victims).await;

        Ok(self.signed_url(fingerprint, ext))
    }

    fn evict_locked(&self, state: &mut CacheState, keep: &str) -> Vec<AudioArtifact> {
        let mut victims = Vec::new();
        while state.total_bytes > self.max_bytes {
            let oldest = state
                .entries
                .values()
                .filter(|a| a.fingerprint != keep)
                .min_by_key(|a| a.last_access)
                .map(|a| a.fingerprint.clone());
            let Some(fingerprint) = oldest else {
                break;
            };
            if let Some(artifact) = state.entries.remove(&fingerprint) {
                state.total_bytes = state.total_bytes.saturating_sub(artifact.bytes);
                victims.push(artifact);
            }
        }
        victims
    }

    async fn delete_files(&self, victims: Vec<AudioArtifact>) {
        for artifact in victims {
            debug!("evicting audio artifact {}", artifact.fingerprint);
            if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
                warn!("failed to remove {}: {}", artifact.path.display(), e);
            }
        }
    }

    /// Removes artifacts created more than `max_age` ago.
    pub async fn sweep_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(max_age.as_secs() as i64);
        let victims = {
            let mut state = self.state.lock().expect("audio cache poisoned");
            let old: Vec<String> = state
                .entries
                .values()
                .filter(|a| a.created_at < cutoff)
                .map(|a| a.fingerprint.clone())
                .collect();
            old.iter()
                .filter_map(|fp| {
                    state.entries.remove(fp).map(|a| {
                        state.total_bytes = state.total_bytes.saturating_sub(a.bytes);
                        a
                    })
                })
                .collect::<Vec<_>>()
        };
        let count = victims.len();
        self.delete_files(victims).await;
        if count > 0 {
            info!("age sweep removed {} audio artifacts", count);
        }
        count
    }

    /// Resolves a `<fingerprint>.<ext>` request path for serving; touches
    /// the artifact on hit.
    pub fn file_for(&self, file_name: &str) -> Option<(PathBuf, String)> {
        let fingerprint = file_name.rsplit_once('.').map(|(fp, _)| fp)?;
        let mut state = self.state.lock().expect("audio cache poisoned");
        let artifact = state.entries.get_mut(fingerprint)?;
        artifact.last_access = Utc::now();
        Some((artifact.path.clone(), artifact.mime.clone()))
    }

    pub fn signed_url(&self, fingerprint: &str, ext: &str) -> String {
        let expires = (Utc::now() + chrono::Duration::seconds(self.url_ttl.as_secs() as i64))
            .timestamp();
        let token = self.url_token(fingerprint, expires);
        format!(
            "{}/audio/{}.{}?token={}&expires={}",
            self.public_base_url, fingerprint, ext, token, expires
        )
    }

    fn url_token(&self, fingerprint: &str, expires: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.url_secret.as_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint.as_bytes());
        hasher.update([0u8]);
        hasher.update(expires.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify_url_token(&self, fingerprint: &str, expires: i64, token: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        self.url_token(fingerprint, expires) == token
    }

    /// (bytes used, artifact count) for the health endpoint.
    pub fn stats(&self) -> (u64, usize) {
        let state = self.state.lock().expect("audio cache poisoned");
        (state.total_bytes, state.entries.len())
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache(dir: &Path, max_bytes: u64) -> AudioCache {
        AudioCache::open(
            dir,
            max_bytes,
            "url-secret",
            Duration::from_secs(300),
            "http://localhost:8765",
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinct() {
        let a = AudioCache::fingerprint("Hello", LanguageCode::En, "Joanna", TtsMode::Neural);
        let b = AudioCache::fingerprint("Hello", LanguageCode::En, "Joanna", TtsMode::Neural);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other_text =
            AudioCache::fingerprint("Hola", LanguageCode::En, "Joanna", TtsMode::Neural);
        let other_lang =
            AudioCache::fingerprint("Hello", LanguageCode::Es, "Joanna", TtsMode::Neural);
        let other_mode =
            AudioCache::fingerprint("Hello", LanguageCode::En, "Joanna", TtsMode::Standard);
        assert_ne!(a, other_text);
        assert_ne!(a, other_lang);
        assert_ne!(a, other_mode);
    }

    #[tokio::test]
    async fn test_store_lookup_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1024 * 1024).await;
        let fp = AudioCache::fingerprint("Hello", LanguageCode::En, "Joanna", TtsMode::Neural);

        assert!(cache.lookup(&fp).is_none());
        let url = cache.store(&fp, b"mp3-bytes", "audio/mpeg").await.unwrap();
        assert!(url.contains(&format!("/audio/{}.mp3?token=", fp)), "{}", url);

        let hit = cache.lookup(&fp).unwrap();
        assert!(hit.contains(&fp));

        // The blob is retrieved byte-identically through the serving path.
        let (path, mime) = cache.file_for(&format!("{}.mp3", fp)).unwrap();
        assert_eq!(mime, "audio/mpeg");
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"mp3-bytes");
    }

    #[tokio::test]
    async fn test_eviction_keeps_footprint_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 100).await;

        for i in 0..5 {
            let fp = AudioCache::fingerprint(
                &format!("text-{}", i),
                LanguageCode::En,
                "Joanna",
                TtsMode::Neural,
            );
            cache.store(&fp, &[0u8; 40], "audio/mpeg").await.unwrap();
        }

        let (bytes, count) = cache.stats();
        // Cap + at most the newest in-flight blob.
        assert!(bytes <= 100 + 40, "footprint {} exceeds bound", bytes);
        assert!(count <= 3);
    }

    #[tokio::test]
    async fn test_eviction_prefers_least_recently_accessed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 100).await;

        let hot = AudioCache::fingerprint("hot", LanguageCode::En, "Joanna", TtsMode::Neural);
        let cold = AudioCache::fingerprint("cold", LanguageCode::En, "Joanna", TtsMode::Neural);
        cache.store(&cold, &[0u8; 40], "audio/mpeg").await.unwrap();
        cache.store(&hot, &[0u8; 40], "audio/mpeg").await.unwrap();

        // Touch the older artifact so the other becomes the LRU victim.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(cache.lookup(&cold).is_some());

        let third = AudioCache::fingerprint("third", LanguageCode::En, "Joanna", TtsMode::Neural);
        cache.store(&third, &[0u8; 40], "audio/mpeg").await.unwrap();

        assert!(cache.lookup(&cold).is_some());
        assert!(cache.lookup(&hot).is_none());
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        let fp = AudioCache::fingerprint("Hello", LanguageCode::En, "Joanna", TtsMode::Neural);
        {
            let cache = cache(dir.path(), 1024).await;
            cache.store(&fp, b"mp3-bytes", "audio/mpeg").await.unwrap();
        }

        let cache = cache(dir.path(), 1024).await;
        assert!(cache.lookup(&fp).is_some());
        let (bytes, count) = cache.stats();
        assert_eq!(bytes, 9);
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_age_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1024).await;
        let fp = AudioCache::fingerprint("Hello", LanguageCode::En, "Joanna", TtsMode::Neural);
        cache.store(&fp, b"mp3-bytes", "audio/mpeg").await.unwrap();

        assert_eq!(cache.sweep_older_than(Duration::from_secs(3600)).await, 0);
        assert_eq!(cache.sweep_older_than(Duration::from_secs(0)).await, 1);
        assert!(cache.lookup(&fp).is_none());
    }

    #[tokio::test]
    async fn test_url_token_verification() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1024).await;
        let fp = AudioCache::fingerprint("Hello", LanguageCode::En, "Joanna", TtsMode::Neural);

        let url = cache.store(&fp, b"mp3-bytes", "audio/mpeg").await.unwrap();
        let query = url.split_once('?').unwrap().1;
        let mut token = "";
        let mut expires = 0i64;
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("token", v) => token = v,
                ("expires", v) => expires = v.parse().unwrap(),
                _ => {}
            }
        }

        assert!(cache.verify_url_token(&fp, expires, token));
        assert!(!cache.verify_url_token(&fp, expires, "forged"));
        assert!(!cache.verify_url_token(&fp, expires - 1, token));
        // Expired timestamps fail even with a matching signature.
        let past = Utc::now().timestamp() - 10;
        assert!(!cache.verify_url_token(&fp, past, &{
            let mut hasher = Sha256::new();
            hasher.update(b"url-secret");
            hasher.update([0u8]);
            hasher.update(fp.as_bytes());
            hasher.update([0u8]);
            hasher.update(past.to_string().as_bytes());
            hex::encode(hasher.finalize())
        }));
    }
}
