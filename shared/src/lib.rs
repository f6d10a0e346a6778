use serde::{Deserialize, Serialize};
use std::fmt;

// Wire protocol frames in separate module
pub mod protocol;
pub use protocol::*;

// Stable error codes
pub mod errors;
pub use errors::ErrorCode;

/// Target languages recognized by the translation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageCode {
    En,
    Es,
    Fr,
    De,
    It,
}

impl LanguageCode {
    pub const ALL: [LanguageCode; 5] = [
        LanguageCode::En,
        LanguageCode::Es,
        LanguageCode::Fr,
        LanguageCode::De,
        LanguageCode::It,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LanguageCode::En => "en",
            LanguageCode::Es => "es",
            LanguageCode::Fr => "fr",
            LanguageCode::De => "de",
            LanguageCode::It => "it",
        }
    }

    pub fn parse(code: &str) -> Option<LanguageCode> {
        match code {
            "en" => Some(LanguageCode::En),
            "es" => Some(LanguageCode::Es),
            "fr" => Some(LanguageCode::Fr),
            "de" => Some(LanguageCode::De),
            "it" => Some(LanguageCode::It),
            _ => None,
        }
    }
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session synthesis policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsMode {
    Neural,
    Standard,
    Local,
    Disabled,
}

impl TtsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TtsMode::Neural => "neural",
            TtsMode::Standard => "standard",
            TtsMode::Local => "local",
            TtsMode::Disabled => "disabled",
        }
    }

    pub fn parse(mode: &str) -> Option<TtsMode> {
        match mode {
            "neural" => Some(TtsMode::Neural),
            "standard" => Some(TtsMode::Standard),
            "local" => Some(TtsMode::Local),
            "disabled" => Some(TtsMode::Disabled),
            _ => None,
        }
    }

    /// Whether this mode calls the paid synthesis upstream.
    pub fn uses_upstream(&self) -> bool {
        matches!(self, TtsMode::Neural | TtsMode::Standard)
    }
}

impl fmt::Display for TtsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    High,
    Medium,
    Low,
}

/// Audio framing negotiated with listener devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioEncoding {
    pub sample_rate_hertz: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
}

impl Default for AudioEncoding {
    fn default() -> Self {
        Self {
            sample_rate_hertz: 22050,
            channels: 1,
            frame_duration_ms: 20,
        }
    }
}

/// Per-session translation/synthesis configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub source_language: String,
    pub target_languages: Vec<LanguageCode>,
    pub tts_mode: TtsMode,
    pub audio_quality: AudioQuality,
    #[serde(default)]
    pub audio_encoding: AudioEncoding,
}

impl SessionConfig {
    /// Structural validation; language membership checks happen at the router.
    pub fn validate(&self) -> Result<(), String> {
        if self.source_language.trim().is_empty() {
            return Err("sourceLanguage must not be empty".to_string());
        }
        if self.target_languages.is_empty() {
            return Err("targetLanguages must not be empty".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for lang in &self.target_languages {
            if !seen.insert(*lang) {
                return Err(format!("duplicate target language: {}", lang));
            }
        }
        if self.audio_encoding.sample_rate_hertz == 0 {
            return Err("sampleRateHertz must be non-zero".to_string());
        }
        if self.audio_encoding.channels == 0 {
            return Err("channels must be non-zero".to_string());
        }
        Ok(())
    }

    pub fn has_language(&self, lang: LanguageCode) -> bool {
        self.target_languages.contains(&lang)
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Started,
    Active,
    Paused,
    Ending,
    Ended,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Started => "started",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Ending => "ending",
            SessionStatus::Ended => "ended",
            SessionStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended)
    }

    /// Legal status transitions.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Started, Active) | (Started, Paused) | (Started, Ending) | (Started, Error) => true,
            (Active, Paused) | (Active, Ending) | (Active, Error) => true,
            (Paused, Active) | (Paused, Ending) | (Paused, Error) => true,
            (Ending, Ended) => true,
            (Error, Ending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_code_round_trip() {
        for lang in LanguageCode::ALL {
            assert_eq!(LanguageCode::parse(lang.as_str()), Some(lang));
        }
        assert_eq!(LanguageCode::parse("pt"), None);
    }

    #[test]
    fn test_language_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&LanguageCode::De).unwrap(), "\"de\"");
    }

    #[test]
    fn test_config_validation() {
        let mut config = SessionConfig {
            source_language: "en-US".to_string(),
            target_languages: vec![LanguageCode::En, LanguageCode::Es],
            tts_mode: TtsMode::Disabled,
            audio_quality: AudioQuality::Medium,
            audio_encoding: AudioEncoding::default(),
        };
        assert!(config.validate().is_ok());

        config.target_languages.push(LanguageCode::Es);
        assert!(config.validate().is_err());

        config.target_languages.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_status_transitions() {
        use SessionStatus::*;
        assert!(Started.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Ending.can_transition_to(Ended));
        assert!(Error.can_transition_to(Ending));

        assert!(!Ended.can_transition_to(Active));
        assert!(!Started.can_transition_to(Ended));
        assert!(!Active.can_transition_to(Started));
        assert!(!Ending.can_transition_to(Active));
    }

    #[test]
    fn test_terminal_status() {
        assert!(SessionStatus::Ended.is_terminal());
        assert!(!SessionStatus::Ending.is_terminal());
        assert!(!SessionStatus::Error.is_terminal());
    }
}
