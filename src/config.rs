// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use figment::providers::{Env, Format};
use figment::{providers::Toml, Figment};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "settings.toml";
pub const ENV_PREFIX: &str = "SWARMHOST_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub client_id: String,

    // Disk
    pub torrents_dir: PathBuf,
    pub posters_dir: PathBuf,
    pub default_download_folder: Option<PathBuf>,

    // Streaming server
    pub server_bind_address: IpAddr,

    // Progress telemetry
    pub progress_tick_ms: u64,
    pub progress_interval_ms: u64,
    pub progress_change_threshold: f64,
    pub downloaded_change_threshold_bytes: u64,

    // Swarm
    pub global_trackers: Vec<String>,
    pub offline_verify_concurrency: usize,
    /// Serve only local data and never contact peers.
    pub offline: bool,

    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            client_id: String::new(),
            torrents_dir: data_dir.join("torrents"),
            posters_dir: data_dir.join("posters"),
            default_download_folder: None,
            server_bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            progress_tick_ms: 100,
            progress_interval_ms: 250,
            progress_change_threshold: 0.001,
            downloaded_change_threshold_bytes: 1024 * 1024,
            global_trackers: Vec::new(),
            offline_verify_concurrency: 2,
            offline: false,
            log_level: "info".to_string(),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "swarmhost", "swarmhost")
}

fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// This is the single source of truth for app directories.
pub fn get_app_paths() -> Option<(PathBuf, PathBuf)> {
    if let Some(proj_dirs) = project_dirs() {
        let config_dir = proj_dirs.config_dir().to_path_buf();
        let data_dir = proj_dirs.data_local_dir().to_path_buf();

        // Ensure directories exist
        fs::create_dir_all(&config_dir).ok()?;
        fs::create_dir_all(&data_dir).ok()?;

        Some((config_dir, data_dir))
    } else {
        None
    }
}

pub fn settings_path() -> Option<PathBuf> {
    get_app_paths().map(|(config_dir, _)| config_dir.join(SETTINGS_FILE))
}

fn figment_for(config_file: &Path) -> Figment {
    Figment::new()
        .merge(Toml::file(config_file))
        .merge(Env::prefixed(ENV_PREFIX))
}

/// Loads settings from `config_file` (or the default location) and the
/// environment. Unreadable settings fall back to defaults.
pub fn load_settings(config_file: Option<&Path>) -> Settings {
    let path = match config_file {
        Some(path) => Some(path.to_path_buf()),
        None => settings_path(),
    };

    if let Some(path) = path {
        return match figment_for(&path).extract() {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Failed to load settings from {:?}: {}", path, e);
                Settings::default()
            }
        };
    }

    // Fallback if we can't even determine the application paths.
    Settings::default()
}

/// Saves the provided settings to `config_file` (or the default location).
pub fn save_settings(settings: &Settings, config_file: Option<&Path>) -> io::Result<()> {
    let path = match config_file {
        Some(path) => Some(path.to_path_buf()),
        None => settings_path(),
    };

    if let Some(config_file_path) = path {
        let temp_file_path = config_file_path.with_extension("toml.tmp");
        let content = toml::to_string_pretty(settings).map_err(io::Error::other)?;
        fs::write(&temp_file_path, content)?;
        fs::rename(&temp_file_path, &config_file_path)?;
    }
    Ok(())
}
