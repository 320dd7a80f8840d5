//! Running applications that can be put in the blocked set
//!
//! macOS asks System Events for the bundle ids of foreground-capable
//! processes, the same ids the foreground detector reports. Elsewhere the
//! process table is scanned for the user's own programs attached to a
//! display, named by process name.

use anyhow::Result;
use intentgate_core::config::DaemonConfig;
use std::collections::BTreeSet;
use std::path::Path;
use tabled::{Table, Tabled};

use super::helpers::{open_store, truncate_str};

#[derive(Debug, Clone, PartialEq, Eq)]
struct AppEntry {
    app_id: String,
    blocked: bool,
}

#[derive(Tabled)]
struct AppRow {
    #[tabled(rename = "Blocked")]
    marker: &'static str,
    #[tabled(rename = "Application")]
    app_id: String,
}

pub fn list_apps(data_dir: &Path) -> Result<()> {
    let own_app_id = DaemonConfig::load_from_dir(data_dir).own_app_id;
    let blocked = open_store(data_dir)?.settings().blocked_apps;
    let entries = catalogue(running_app_ids()?, &own_app_id, &blocked);

    if entries.is_empty() {
        println!("No running applications found.");
        return Ok(());
    }

    let rows: Vec<AppRow> = entries
        .into_iter()
        .map(|e| AppRow {
            marker: if e.blocked { "[x]" } else { "[ ]" },
            app_id: truncate_str(&e.app_id, 60),
        })
        .collect();
    println!("{}", Table::new(rows));
    println!("\nFlip one with `intentgate toggle <app>`");
    Ok(())
}

/// Deduplicate, drop our own app, sort by name and mark blocked entries
fn catalogue(
    found: impl IntoIterator<Item = String>,
    own_app_id: &str,
    blocked: &BTreeSet<String>,
) -> Vec<AppEntry> {
    let unique: BTreeSet<String> = found
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && id != own_app_id)
        .collect();

    let mut entries: Vec<AppEntry> = unique
        .into_iter()
        .map(|app_id| AppEntry {
            blocked: blocked.contains(&app_id),
            app_id,
        })
        .collect();
    entries.sort_by_cached_key(|e| e.app_id.to_lowercase());
    entries
}

#[cfg(target_os = "macos")]
fn running_app_ids() -> Result<Vec<String>> {
    use anyhow::Context;

    let output = std::process::Command::new("osascript")
        .args([
            "-e",
            "tell application \"System Events\" to get bundle identifier of every application process whose background only is false",
        ])
        .output()
        .context("Failed to run osascript")?;
    if !output.status.success() {
        anyhow::bail!(
            "osascript failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(parse_osascript_list(&String::from_utf8_lossy(&output.stdout)))
}

/// `com.a, com.b, missing value` as printed by osascript
#[cfg(any(target_os = "macos", test))]
fn parse_osascript_list(output: &str) -> Vec<String> {
    output
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty() && *id != "missing value")
        .map(str::to_string)
        .collect()
}

#[cfg(not(target_os = "macos"))]
#[allow(clippy::unnecessary_wraps)]
fn running_app_ids() -> Result<Vec<String>> {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_processes();

    let Some(me) = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid))
        .and_then(|p| p.user_id())
        .cloned()
    else {
        log::warn!("Could not determine the current user; listing no applications");
        return Ok(Vec::new());
    };

    Ok(sys
        .processes()
        .values()
        .filter(|p| p.user_id() == Some(&me))
        .filter(|p| has_display(p.environ()))
        .filter(|p| p.exe().is_some_and(|exe| !is_system_exe(exe)))
        .map(|p| p.name().to_string())
        .collect())
}

/// Daemons and helpers shipped with the operating system
#[cfg(any(not(target_os = "macos"), test))]
fn is_system_exe(exe: &Path) -> bool {
    const SYSTEM_DIRS: &[&str] = &[
        "/sbin",
        "/usr/sbin",
        "/usr/libexec",
        "/usr/lib/systemd",
        "/lib/systemd",
        "/usr/lib/xorg",
    ];
    SYSTEM_DIRS.iter().any(|dir| exe.starts_with(dir))
}

#[cfg(any(not(target_os = "macos"), test))]
fn has_display(environ: &[String]) -> bool {
    environ
        .iter()
        .any(|var| var.starts_with("DISPLAY=") || var.starts_with("WAYLAND_DISPLAY="))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_filters_sorts_and_marks() {
        let blocked: BTreeSet<String> = ["Slack".to_string()].into_iter().collect();
        let found = ["zoom", "Slack", "intentgate", "firefox", "Slack", " ", "Alacritty"]
            .map(String::from);

        let entries = catalogue(found, "intentgate", &blocked);
        let ids: Vec<&str> = entries.iter().map(|e| e.app_id.as_str()).collect();
        assert_eq!(ids, ["Alacritty", "firefox", "Slack", "zoom"]);
        assert!(entries.iter().find(|e| e.app_id == "Slack").unwrap().blocked);
        assert!(!entries.iter().find(|e| e.app_id == "zoom").unwrap().blocked);
    }

    #[test]
    fn test_parse_osascript_list() {
        assert_eq!(
            parse_osascript_list("com.apple.Safari, missing value, com.tinyspeck.slackmacgap\n"),
            ["com.apple.Safari", "com.tinyspeck.slackmacgap"]
        );
        assert!(parse_osascript_list("\n").is_empty());
    }

    #[test]
    fn test_system_executables_are_skipped() {
        assert!(is_system_exe(Path::new("/usr/libexec/gvfsd")));
        assert!(is_system_exe(Path::new("/usr/lib/systemd/systemd")));
        assert!(!is_system_exe(Path::new("/usr/lib/firefox/firefox")));
        assert!(!is_system_exe(Path::new("/opt/zoom/zoom")));
    }

    #[test]
    fn test_has_display() {
        let env = |vars: &[&str]| vars.iter().map(|v| (*v).to_string()).collect::<Vec<_>>();
        assert!(has_display(&env(&["HOME=/home/u", "WAYLAND_DISPLAY=wayland-0"])));
        assert!(has_display(&env(&["DISPLAY=:0"])));
        assert!(!has_display(&env(&["XDG_DISPLAY_HINT=1"])));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_list_apps_runs() {
        let dir = tempfile::tempdir().unwrap();
        list_apps(dir.path()).unwrap();
    }
}
