//! Environment-driven server configuration.
//!
//! Everything tunable comes from environment variables, loaded once at
//! startup. Required identity-provider variables abort startup when absent
//! so a misconfigured deployment fails before accepting connections.

use anyhow::{bail, Context};
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::{LanguageCode, TtsMode};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Unit prices for billable upstream services, USD per unit.
#[derive(Debug, Clone, Copy)]
pub struct UnitPrices {
    pub synthesis_neural_per_char: f64,
    pub synthesis_standard_per_char: f64,
    pub translation_per_char: f64,
    pub transcription_per_sec: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub dev_mode: bool,

    pub bind_host: String,
    pub bind_port: u16,
    pub public_base_url: String,

    pub token_secret: String,
    pub identity_provider_url: Option<String>,
    pub identity_client_id: Option<String>,

    pub admin_state_dir: PathBuf,
    pub session_state_dir: PathBuf,
    pub audio_cache_dir: PathBuf,

    pub audio_cache_max_bytes: u64,
    pub audio_cache_max_age: Duration,
    pub audio_url_ttl: Duration,

    pub session_prefix: String,
    pub session_retention: Duration,
    pub admin_retention: Duration,

    pub auth_grace: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub max_listeners_per_session: usize,
    pub max_connections: usize,

    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub token_warn_window: Duration,

    pub tts_endpoint: Option<String>,
    pub tts_api_key: Option<String>,
    pub tts_timeout: Duration,
    pub tts_voice_overrides: HashMap<(LanguageCode, TtsMode), String>,

    pub prices: UnitPrices,
    pub cost_alarm_threshold: f64,
    pub cost_alarm_cooldown: Duration,

    pub shutdown_drain: Duration,
}

impl Config {
    pub fn from_env(dev_mode: bool) -> anyhow::Result<Self> {
        Self::from_lookup(dev_mode, |key| std::env::var(key).ok())
    }

    fn from_lookup(
        dev_mode: bool,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let token_secret = match get("TOKEN_SECRET") {
            Some(secret) => {
                if secret.len() < 32 {
                    bail!("TOKEN_SECRET must be at least 32 bytes");
                }
                secret
            }
            None if dev_mode => {
                warn!("No TOKEN_SECRET set, using a random key (tokens won't survive restarts)");
                rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(48)
                    .map(char::from)
                    .collect()
            }
            None => bail!("TOKEN_SECRET must be set"),
        };

        let identity_provider_url = get("IDENTITY_PROVIDER_URL");
        let identity_client_id = get("IDENTITY_CLIENT_ID");
        if !dev_mode {
            if identity_provider_url.is_none() {
                bail!("IDENTITY_PROVIDER_URL must be set");
            }
            if identity_client_id.is_none() {
                bail!("IDENTITY_CLIENT_ID must be set");
            }
        }

        let bind_host = get("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let bind_port = parse(&get, "PORT", 8765u16)?;
        let public_base_url = get("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{}", bind_port));

        let session_prefix = get("SESSION_PREFIX").unwrap_or_else(|| "SESSION".to_string());
        if !session_prefix.chars().all(|c| c.is_ascii_uppercase()) || session_prefix.is_empty() {
            bail!("SESSION_PREFIX must be non-empty uppercase ASCII");
        }

        Ok(Self {
            dev_mode,
            bind_host,
            bind_port,
            public_base_url,
            token_secret,
            identity_provider_url,
            identity_client_id,
            admin_state_dir: get("ADMIN_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state/admins")),
            session_state_dir: get("SESSION_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state/sessions")),
            audio_cache_dir: get("AUDIO_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state/audio")),
            audio_cache_max_bytes: parse(&get, "AUDIO_CACHE_MAX_BYTES", 256 * 1024 * 1024u64)?,
            audio_cache_max_age: secs(&get, "AUDIO_CACHE_MAX_AGE_SECS", 24 * 3600)?,
            audio_url_ttl: secs(&get, "AUDIO_URL_TTL_SECS", 300)?,
            session_prefix,
            session_retention: secs(&get, "SESSION_RETENTION_SECS", 4 * 3600)?,
            admin_retention: secs(&get, "ADMIN_RETENTION_SECS", 30 * 24 * 3600)?,
            auth_grace: secs(&get, "AUTH_GRACE_SECS", 10)?,
            heartbeat_interval: secs(&get, "HEARTBEAT_INTERVAL_SECS", 30)?,
            heartbeat_timeout: secs(&get, "HEARTBEAT_TIMEOUT_SECS", 90)?,
            outbound_queue_capacity: parse(&get, "OUTBOUND_QUEUE_CAPACITY", 256usize)?,
            max_listeners_per_session: parse(&get, "MAX_LISTENERS_PER_SESSION", 200usize)?,
            max_connections: parse(&get, "MAX_CONNECTIONS", 500usize)?,
            access_token_ttl: secs(&get, "ACCESS_TOKEN_TTL_SECS", 3600)?,
            refresh_token_ttl: secs(&get, "REFRESH_TOKEN_TTL_SECS", 30 * 24 * 3600)?,
            token_warn_window: secs(&get, "TOKEN_WARN_WINDOW_SECS", 300)?,
            tts_endpoint: get("TTS_ENDPOINT"),
            tts_api_key: get("TTS_API_KEY"),
            tts_timeout: secs(&get, "TTS_TIMEOUT_SECS", 8)?,
            tts_voice_overrides: parse_voice_overrides(get("TTS_VOICES").as_deref())?,
            prices: UnitPrices {
                synthesis_neural_per_char: parse(&get, "PRICE_SYNTHESIS_NEURAL_PER_CHAR", 16e-6)?,
                synthesis_standard_per_char: parse(
                    &get,
                    "PRICE_SYNTHESIS_STANDARD_PER_CHAR",
                    4e-6,
                )?,
                translation_per_char: parse(&get, "PRICE_TRANSLATION_PER_CHAR", 15e-6)?,
                transcription_per_sec: parse(&get, "PRICE_TRANSCRIPTION_PER_SEC", 0.0004)?,
            },
            cost_alarm_threshold: parse(&get, "COST_ALARM_THRESHOLD", 3.0f64)?,
            cost_alarm_cooldown: secs(&get, "COST_ALARM_COOLDOWN_SECS", 600)?,
            shutdown_drain: secs(&get, "SHUTDOWN_DRAIN_SECS", 3)?,
        })
    }
}

fn parse<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {}: {}", key, raw)),
        None => Ok(default),
    }
}

fn secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(parse(get, key, default)?))
}

/// `TTS_VOICES` holds comma-separated `lang:mode=VoiceName` entries, e.g.
/// `en:neural=Joanna,es:standard=Miguel`.
fn parse_voice_overrides(
    raw: Option<&str>,
) -> anyhow::Result<HashMap<(LanguageCode, TtsMode), String>> {
    let mut overrides = HashMap::new();
    let Some(raw) = raw else {
        return Ok(overrides);
    };
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (selector, voice) = entry
            .split_once('=')
            .with_context(|| format!("invalid TTS_VOICES entry: {}", entry))?;
        let (lang, mode) = selector
            .split_once(':')
            .with_context(|| format!("invalid TTS_VOICES selector: {}", selector))?;
        let lang = LanguageCode::parse(lang)
            .with_context(|| format!("unknown language in TTS_VOICES: {}", lang))?;
        let mode = TtsMode::parse(mode)
            .with_context(|| format!("unknown TTS mode in TTS_VOICES: {}", mode))?;
        overrides.insert((lang, mode), voice.trim().to_string());
    }
    Ok(overrides)
}
