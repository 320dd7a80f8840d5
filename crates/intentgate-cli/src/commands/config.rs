/// Challenge settings command handlers
use anyhow::Result;
use intentgate_storage::Settings;
use std::path::Path;

use super::helpers::{format_duration_ms, notify_daemon, open_store, parse_duration_ms};

const KEYS: &str = "sentence, duration";

fn get_config_value(settings: &Settings, key: &str) -> Option<String> {
    match key {
        "sentence" => Some(settings.challenge_sentence.clone()),
        "duration" => Some(settings.exemption_duration_ms.to_string()),
        _ => None,
    }
}

pub fn handle_config_get(data_dir: &Path, key: &str) -> Result<()> {
    let settings = open_store(data_dir)?.settings();
    match get_config_value(&settings, key) {
        Some(v) => println!("{key} = {v}"),
        None => anyhow::bail!("Unknown key '{key}' (expected one of: {KEYS})"),
    }
    Ok(())
}

pub async fn handle_config_set(data_dir: &Path, key: &str, value: &str) -> Result<()> {
    let store = open_store(data_dir)?;
    match key {
        "sentence" => {
            store.set_challenge_sentence(value)?;
            println!("Set sentence = {value}");
        }
        "duration" => {
            let duration_ms = parse_duration_ms(value)?;
            store.set_exemption_duration(duration_ms)?;
            println!(
                "Set duration = {duration_ms} ({})",
                format_duration_ms(duration_ms.unsigned_abs())
            );
        }
        _ => anyhow::bail!("Unknown key '{key}' (expected one of: {KEYS})"),
    }
    notify_daemon(data_dir).await;
    Ok(())
}

pub fn handle_config_list(data_dir: &Path) -> Result<()> {
    let settings = open_store(data_dir)?.settings();

    println!("Configuration:");
    println!("  sentence = {}", settings.challenge_sentence);
    println!(
        "  duration = {} ({})",
        settings.exemption_duration_ms,
        format_duration_ms(settings.exemption_duration_ms.unsigned_abs())
    );
    println!("  enabled  = {}", settings.service_enabled);
    println!("  blocked  = {} apps", settings.blocked_apps.len());
    println!("\nData directory: {}", data_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use intentgate_storage::DEFAULT_CHALLENGE_SENTENCE;

    #[test]
    fn test_get_config_value() {
        let settings = Settings::default();
        assert_eq!(
            get_config_value(&settings, "sentence").as_deref(),
            Some(DEFAULT_CHALLENGE_SENTENCE)
        );
        assert_eq!(
            get_config_value(&settings, "duration").as_deref(),
            Some("60000")
        );
        assert_eq!(get_config_value(&settings, "colour"), None);
    }

    #[tokio::test]
    async fn test_set_values_persist() {
        let dir = tempfile::tempdir().unwrap();
        handle_config_set(dir.path(), "sentence", "Is this worth it?")
            .await
            .unwrap();
        handle_config_set(dir.path(), "duration", "5m").await.unwrap();

        let settings = open_store(dir.path()).unwrap().settings();
        assert_eq!(settings.challenge_sentence, "Is this worth it?");
        assert_eq!(settings.exemption_duration_ms, 300_000);
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(handle_config_set(dir.path(), "sentence", "   ").await.is_err());
        assert!(handle_config_set(dir.path(), "duration", "0").await.is_err());
        assert!(handle_config_set(dir.path(), "duration", "48h").await.is_err());
        assert!(handle_config_set(dir.path(), "colour", "blue").await.is_err());
        assert!(handle_config_get(dir.path(), "colour").is_err());

        let settings = open_store(dir.path()).unwrap().settings();
        assert_eq!(settings, Settings::default());
    }
}
