/// Blocked set and service switch command handlers
use anyhow::Result;
use std::path::Path;

use super::helpers::{notify_daemon, open_store};

pub async fn block(data_dir: &Path, app: &str) -> Result<()> {
    let store = open_store(data_dir)?;
    if store.add_blocked_app(app)? {
        println!("Blocked '{app}'");
        notify_daemon(data_dir).await;
    } else {
        println!("'{app}' is already blocked");
    }
    Ok(())
}

pub async fn unblock(data_dir: &Path, app: &str) -> Result<()> {
    let store = open_store(data_dir)?;
    if store.remove_blocked_app(app)? {
        println!("Unblocked '{app}'");
        notify_daemon(data_dir).await;
    } else {
        println!("'{app}' was not blocked");
    }
    Ok(())
}

pub async fn toggle(data_dir: &Path, app: &str) -> Result<()> {
    let store = open_store(data_dir)?;
    let was_blocked = store.settings().blocked_apps.contains(app);
    store.toggle_blocked_app(app, was_blocked)?;
    println!(
        "{} '{app}'",
        if was_blocked { "Unblocked" } else { "Blocked" }
    );
    notify_daemon(data_dir).await;
    Ok(())
}

pub fn list(data_dir: &Path) -> Result<()> {
    let settings = open_store(data_dir)?.settings();

    if settings.blocked_apps.is_empty() {
        println!("No blocked applications. Add one with `intentgate block <app>`.");
        return Ok(());
    }

    println!("Blocked applications:");
    for app in &settings.blocked_apps {
        println!("  - {app}");
    }
    if !settings.service_enabled {
        println!("\nInterposition is DISABLED (`intentgate enable` to turn it on)");
    }
    Ok(())
}

pub async fn set_enabled(data_dir: &Path, enabled: bool) -> Result<()> {
    let store = open_store(data_dir)?;
    store.set_service_enabled(enabled)?;
    println!(
        "Interposition {}",
        if enabled { "enabled" } else { "disabled" }
    );
    notify_daemon(data_dir).await;
    Ok(())
}
