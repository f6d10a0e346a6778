//! TTS pipeline: resolves a translation into an audio URL, a
//! use-local-synthesis marker, or text-only, degrading along the fallback
//! chain when the paid upstream fails.
//!
//! Duplicate in-flight requests for the same fingerprint coalesce onto a
//! single upstream call; followers wait on the leader's result instead of
//! paying for a second synthesis.

use crate::audio_cache::AudioCache;
use crate::cost::{BillableService, CostTracker, CostWarningEvent};
use crate::error::ServerError;
use async_trait::async_trait;
use dashmap::DashMap;
use shared::{AudioQuality, LanguageCode, TtsMode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// What the router attaches to an outbound translation frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsOutcome {
    /// Synthesized audio is ready at this (short-lived) URL.
    Audio { url: String },
    /// Upstream unavailable or mode is `local`: the device synthesizes.
    LocalSynthesis,
    /// No audio hint at all.
    TextOnly,
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    pub language: LanguageCode,
    pub voice: String,
    pub mode: TtsMode,
    pub sample_rate_hertz: u32,
}

#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub mime: String,
}

#[async_trait]
pub trait SynthesisClient: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesizedAudio, ServerError>;
}

/// Voice selection per (language, mode). Defaults can be overridden
/// entry-by-entry from configuration.
pub struct VoiceTable {
    voices: HashMap<(LanguageCode, TtsMode), String>,
}

impl VoiceTable {
    pub fn with_overrides(overrides: &HashMap<(LanguageCode, TtsMode), String>) -> Self {
        let defaults: [(LanguageCode, TtsMode, &str); 10] = [
            (LanguageCode::En, TtsMode::Neural, "Joanna"),
            (LanguageCode::En, TtsMode::Standard, "Joey"),
            (LanguageCode::Es, TtsMode::Neural, "Lupe"),
            (LanguageCode::Es, TtsMode::Standard, "Miguel"),
            (LanguageCode::Fr, TtsMode::Neural, "Lea"),
            (LanguageCode::Fr, TtsMode::Standard, "Celine"),
            (LanguageCode::De, TtsMode::Neural, "Vicki"),
            (LanguageCode::De, TtsMode::Standard, "Hans"),
            (LanguageCode::It, TtsMode::Neural, "Bianca"),
            (LanguageCode::It, TtsMode::Standard, "Giorgio"),
        ];
        let mut voices: HashMap<(LanguageCode, TtsMode), String> = defaults
            .into_iter()
            .map(|(lang, mode, voice)| ((lang, mode), voice.to_string()))
            .collect();
        for (key, voice) in overrides {
            voices.insert(*key, voice.clone());
        }
        Self { voices }
    }

    pub fn voice_for(&self, language: LanguageCode, mode: TtsMode) -> Option<String> {
        self.voices.get(&(language, mode)).cloned()
    }
}

fn sample_rate_for(quality: AudioQuality) -> u32 {
    match quality {
        AudioQuality::High => 24000,
        AudioQuality::Medium => 22050,
        AudioQuality::Low => 16000,
    }
}

enum DedupRole {
    Leader(watch::Sender<Option<TtsOutcome>>),
    Follower(watch::Receiver<Option<TtsOutcome>>),
}

pub struct TtsPipeline {
    cache: Arc<AudioCache>,
    client: Option<Arc<dyn SynthesisClient>>,
    voices: VoiceTable,
    upstream_timeout: Duration,
    in_flight: DashMap<String, watch::Receiver<Option<TtsOutcome>>>,
}

impl TtsPipeline {
    pub fn new(
        cache: Arc<AudioCache>,
        client: Option<Arc<dyn SynthesisClient>>,
        voices: VoiceTable,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            client,
            voices,
            upstream_timeout,
            in_flight: DashMap::new(),
        }
    }

    pub fn upstream_available(&self) -> bool {
        self.client.is_some()
    }

    /// Resolves audio for one translation. The warning event, when present,
    /// came from recording the synthesis spend and belongs to the admin.
    pub async fn resolve(
        &self,
        text: &str,
        language: LanguageCode,
        mode: TtsMode,
        quality: AudioQuality,
        cost: &CostTracker,
    ) -> (TtsOutcome, Option<CostWarningEvent>) {
        match mode {
            TtsMode::Disabled => return (TtsOutcome::TextOnly, None),
            TtsMode::Local => return (TtsOutcome::LocalSynthesis, None),
            TtsMode::Neural | TtsMode::Standard => {}
        }

        let Some(client) = self.client.clone() else {
            debug!("no synthesis upstream configured, degrading to local");
            return (TtsOutcome::LocalSynthesis, None);
        };
        let Some(voice) = self.voices.voice_for(language, mode) else {
            warn!("no voice for {}/{}, degrading to local", language, mode);
            return (TtsOutcome::LocalSynthesis, None);
        };

        let fingerprint = AudioCache::fingerprint(text, language, &voice, mode);
        loop {
            if let Some(url) = self.cache.lookup(&fingerprint) {
                return (TtsOutcome::Audio { url }, None);
            }

            let role = match self.in_flight.entry(fingerprint.clone()) {
                dashmap::mapref::entry::Entry::Occupied(entry) => {
                    DedupRole::Follower(entry.get().clone())
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(rx);
                    DedupRole::Leader(tx)
                }
            };

            match role {
                DedupRole::Follower(mut rx) => {
                    loop {
                        let published = rx.borrow().clone();
                        if let Some(outcome) = published {
                            return (outcome, None);
                        }
                        if rx.changed().await.is_err() {
                            // Leader vanished without publishing; start over.
                            break;
                        }
                    }
                }
                DedupRole::Leader(tx) => {
                    let request = SynthesisRequest {
                        text: text.to_string(),
                        language,
                        voice: voice.clone(),
                        mode,
                        sample_rate_hertz: sample_rate_for(quality),
                    };
                    let (outcome, warning) =
                        self.synthesize_and_store(&client, &fingerprint, &request, cost).await;
                    self.in_flight.remove(&fingerprint);
                    let _ = tx.send(Some(outcome.clone()));
                    return (outcome, warning);
                }
            }
        }
    }

    async fn synthesize_and_store(
        &self,
        client: &Arc<dyn SynthesisClient>,
        fingerprint: &str,
        request: &SynthesisRequest,
        cost: &CostTracker,
    ) -> (TtsOutcome, Option<CostWarningEvent>) {
        let result = tokio::time::timeout(self.upstream_timeout, client.synthesize(request)).await;
        let audio = match result {
            Ok(Ok(audio)) => audio,
            Ok(Err(e)) => {
                warn!("synthesis upstream failed, degrading to local: {}", e);
                return (TtsOutcome::LocalSynthesis, None);
            }
            Err(_) => {
                warn!(
                    "synthesis upstream exceeded {:?} deadline, degrading to local",
                    self.upstream_timeout
                );
                return (TtsOutcome::LocalSynthesis, None);
            }
        };

        let url = match self.cache.store(fingerprint, &audio.bytes, &audio.mime).await {
            Ok(url) => url,
            Err(e) => {
                warn!("failed to cache synthesized audio: {}", e);
                return (TtsOutcome::LocalSynthesis, None);
            }
        };

        let service = match request.mode {
            TtsMode::Standard => BillableService::SynthesisStandard,
            _ => BillableService::SynthesisNeural,
        };
        let warning = cost.record(service, request.text.chars().count() as f64);
        (TtsOutcome::Audio { url }, warning)
    }
}

/// Production upstream: POSTs JSON to the configured endpoint and expects
/// the synthesized audio bytes back.
pub struct HttpSynthesisClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSynthesisClient {
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl SynthesisClient for HttpSynthesisClient {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<SynthesizedAudio, ServerError> {
        let mut builder = self.http.post(&self.endpoint).json(&serde_json::json!({
            "text": request.text,
            "languageCode": request.language.as_str(),
            "voiceId": request.voice,
            "engine": request.mode.as_str(),
            "sampleRateHertz": request.sample_rate_hertz,
        }));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ServerError::SynthesisFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ServerError::SynthesisFailed(format!(
                "upstream returned {}",
                response.status()
            )));
        }

        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ServerError::SynthesisFailed(e.to_string()))?;
        Ok(SynthesizedAudio {
            bytes: bytes.to_vec(),
            mime,
        })
    }
}
