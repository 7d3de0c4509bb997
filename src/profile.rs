//! Shared AWS config/credentials file parsing.
//!
//! INI form with bracketed profiles: the credentials file uses `[name]`, the
//! config file uses `[default]` / `[profile name]`. Nested s3-style
//! subsections (`s3 =` followed by indented `key = value` lines) flatten to
//! dotted keys. Keys are case-sensitive, values trimmed.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use crate::anomaly::{Anomaly, Category};

pub type ProfileMap = BTreeMap<String, BTreeMap<String, String>>;

/// The profile selected by `AWS_PROFILE`, defaulting to `default`.
pub fn selected_profile() -> String {
    env::var("AWS_PROFILE").unwrap_or_else(|_| "default".to_string())
}

pub fn config_file_path() -> Result<PathBuf, Anomaly> {
    if let Ok(path) = env::var("AWS_CONFIG_FILE") {
        return Ok(PathBuf::from(path));
    }
    Ok(home_dir()?.join(".aws").join("config"))
}

pub fn credentials_file_path() -> Result<PathBuf, Anomaly> {
    if let Ok(path) = env::var("AWS_SHARED_CREDENTIALS_FILE") {
        return Ok(PathBuf::from(path));
    }
    Ok(home_dir()?.join(".aws").join("credentials"))
}

fn home_dir() -> Result<PathBuf, Anomaly> {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .map_err(|_| Anomaly::of(Category::NotFound, "cannot determine home directory"))
}

/// Parses INI content into profile → key → value. Section headers of the
/// form `[profile name]` normalize to `name`.
pub fn parse(content: &str) -> ProfileMap {
    let mut profiles = ProfileMap::new();
    let mut current: Option<String> = None;
    let mut subsection: Option<String> = None;

    for raw_line in content.lines() {
        let line = raw_line.trim_end();
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            let name = trimmed[1..trimmed.len() - 1].trim();
            let name = name.strip_prefix("profile ").unwrap_or(name);
            current = Some(name.to_string());
            subsection = None;
            profiles.entry(name.to_string()).or_default();
            continue;
        }

        let Some(profile) = &current else { continue };
        let indented = raw_line.starts_with(' ') || raw_line.starts_with('\t');

        if let Some((key, value)) = trimmed.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            if value.is_empty() && !indented {
                // Opens a nested subsection whose entries follow indented.
                subsection = Some(key.to_string());
                continue;
            }
            let full_key = match (&subsection, indented) {
                (Some(sub), true) => format!("{sub}.{key}"),
                _ => {
                    if !indented {
                        subsection = None;
                    }
                    key.to_string()
                }
            };
            profiles
                .entry(profile.clone())
                .or_default()
                .insert(full_key, value.to_string());
        }
    }
    profiles
}

/// Merged key/value view of one profile: credentials-file entries win over
/// config-file entries.
pub fn profile_values(profile: &str) -> Result<BTreeMap<String, String>, Anomaly> {
    let mut merged = BTreeMap::new();

    if let Ok(path) = config_file_path() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Some(values) = parse(&content).remove(profile) {
                merged.extend(values);
            }
        }
    }
    if let Ok(path) = credentials_file_path() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Some(values) = parse(&content).remove(profile) {
                merged.extend(values);
            }
        }
    }

    if merged.is_empty() {
        return Err(Anomaly::of(
            Category::NotFound,
            format!("profile {profile:?} not found"),
        ));
    }
    Ok(merged)
}
