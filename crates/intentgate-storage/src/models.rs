use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Keys of the settings namespace
pub mod keys {
    pub const BLOCKED_APPS: &str = "blocked-application-set";
    pub const CHALLENGE_SENTENCE: &str = "challenge-sentence";
    pub const EXEMPTION_DURATION_MS: &str = "exemption-duration-ms";
    pub const SERVICE_ENABLED: &str = "service-enabled";
    pub const EXEMPTION_TABLE: &str = "exemption-table";
    /// Identity of the monotonic timeline the exemption table was recorded on
    pub const EXEMPTION_CLOCK: &str = "exemption-clock";
}

pub const DEFAULT_CHALLENGE_SENTENCE: &str = "I am conscious of my choice";
pub const DEFAULT_EXEMPTION_DURATION_MS: i64 = 60_000;

/// Upper bound for a single exemption (24 hours)
pub const MAX_EXEMPTION_MS: i64 = 24 * 60 * 60 * 1000;

/// User settings consumed by the watch loop and the challenge flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub blocked_apps: BTreeSet<String>,
    pub challenge_sentence: String,
    pub exemption_duration_ms: i64,
    pub service_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            blocked_apps: BTreeSet::new(),
            challenge_sentence: DEFAULT_CHALLENGE_SENTENCE.to_string(),
            exemption_duration_ms: DEFAULT_EXEMPTION_DURATION_MS,
            service_enabled: true,
        }
    }
}

impl Settings {
    /// Decode settings from raw stored values, falling back per key
    #[must_use]
    pub fn from_raw(
        blocked_apps: Option<&str>,
        challenge_sentence: Option<&str>,
        exemption_duration_ms: Option<&str>,
        service_enabled: Option<&str>,
    ) -> Self {
        Self {
            blocked_apps: decode_or_default(keys::BLOCKED_APPS, blocked_apps, BTreeSet::new),
            challenge_sentence: decode_sentence(challenge_sentence),
            exemption_duration_ms: decode_duration(exemption_duration_ms),
            service_enabled: decode_or_default(keys::SERVICE_ENABLED, service_enabled, || true),
        }
    }
}

/// Persisted form of the exemption table
///
/// `entries` maps an application identifier to its expiry in milliseconds on
/// the monotonic timeline named by `clock_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExemptionSnapshot {
    pub clock_id: Option<String>,
    pub entries: BTreeMap<String, u64>,
}

impl ExemptionSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decode a JSON value, returning `default()` when it is absent or corrupt.
///
/// Corrupt values are logged, never propagated.
pub fn decode_or_default<T, F>(key: &str, raw: Option<&str>, default: F) -> T
where
    T: DeserializeOwned,
    F: FnOnce() -> T,
{
    match raw {
        None => default(),
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
            log::warn!("Ignoring corrupt value for '{key}': {e}");
            default()
        }),
    }
}

pub(crate) fn decode_sentence(raw: Option<&str>) -> String {
    let sentence: String = decode_or_default(keys::CHALLENGE_SENTENCE, raw, || {
        DEFAULT_CHALLENGE_SENTENCE.to_string()
    });
    if sentence.trim().is_empty() {
        log::warn!("Stored challenge sentence is empty, using default");
        return DEFAULT_CHALLENGE_SENTENCE.to_string();
    }
    sentence
}

pub(crate) fn decode_duration(raw: Option<&str>) -> i64 {
    let duration: i64 = decode_or_default(keys::EXEMPTION_DURATION_MS, raw, || {
        DEFAULT_EXEMPTION_DURATION_MS
    });
    if duration <= 0 || duration > MAX_EXEMPTION_MS {
        log::warn!("Stored exemption duration {duration} ms is out of range, using default");
        return DEFAULT_EXEMPTION_DURATION_MS;
    }
    duration
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_when_absent() {
        let settings = Settings::from_raw(None, None, None, None);
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.challenge_sentence, "I am conscious of my choice");
        assert_eq!(settings.exemption_duration_ms, 60_000);
        assert!(settings.service_enabled);
        assert!(settings.blocked_apps.is_empty());
    }

    #[test]
    fn test_settings_decode_stored_values() {
        let settings = Settings::from_raw(
            Some(r#"["com.example.target","org.chat"]"#),
            Some(r#""Slow down""#),
            Some("120000"),
            Some("false"),
        );
        assert!(settings.blocked_apps.contains("com.example.target"));
        assert!(settings.blocked_apps.contains("org.chat"));
        assert_eq!(settings.challenge_sentence, "Slow down");
        assert_eq!(settings.exemption_duration_ms, 120_000);
        assert!(!settings.service_enabled);
    }

    #[test]
    fn test_corrupt_values_fall_back_per_key() {
        let settings = Settings::from_raw(
            Some("{not json"),
            Some("42"),
            Some("\"soon\""),
            Some("false"),
        );
        assert!(settings.blocked_apps.is_empty());
        assert_eq!(settings.challenge_sentence, DEFAULT_CHALLENGE_SENTENCE);
        assert_eq!(settings.exemption_duration_ms, DEFAULT_EXEMPTION_DURATION_MS);
        // Valid keys still decode
        assert!(!settings.service_enabled);
    }

    #[test]
    fn test_out_of_range_duration_falls_back() {
        assert_eq!(decode_duration(Some("0")), DEFAULT_EXEMPTION_DURATION_MS);
        assert_eq!(decode_duration(Some("-5")), DEFAULT_EXEMPTION_DURATION_MS);
        assert_eq!(
            decode_duration(Some(&(MAX_EXEMPTION_MS + 1).to_string())),
            DEFAULT_EXEMPTION_DURATION_MS
        );
        assert_eq!(decode_duration(Some("1")), 1);
    }

    #[test]
    fn test_blank_sentence_falls_back() {
        assert_eq!(decode_sentence(Some(r#""   ""#)), DEFAULT_CHALLENGE_SENTENCE);
        // Surrounding whitespace of a real sentence is kept verbatim
        assert_eq!(decode_sentence(Some(r#"" hi ""#)), " hi ");
    }
}
