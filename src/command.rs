// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Messages exchanged with the controlling process.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use crate::audio::AudioMetadata;
use crate::progress::ProgressSnapshot;
use crate::registry::SessionKey;
use crate::swarm::{InfoHash, SeedOptions, SwarmTorrent, TorrentLocator};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostCommand {
    StartTorrenting {
        key: SessionKey,
        locator: TorrentLocator,
        #[serde(default)]
        download_path: Option<PathBuf>,
        #[serde(default, deserialize_with = "index_keyed")]
        file_modtimes: HashMap<usize, u64>,
        #[serde(default)]
        selections: Option<Vec<bool>>,
    },
    StopTorrenting {
        info_hash: InfoHash,
    },
    CreateTorrent {
        key: SessionKey,
        options: SeedOptions,
    },
    SaveTorrentFile {
        key: SessionKey,
    },
    GeneratePoster {
        key: SessionKey,
    },
    GetAudioMetadata {
        info_hash: InfoHash,
        index: usize,
    },
    StartServer {
        info_hash: InfoHash,
    },
    StopServer,
    SelectFiles {
        info_hash: InfoHash,
        #[serde(default)]
        selections: Option<Vec<bool>>,
    },
    SetGlobalTrackers {
        trackers: Vec<String>,
    },
    Shutdown,
}

/// JSON object keys are always strings, and the buffering done for tagged
/// enums keeps them that way, so file indices are parsed by hand.
/// Modtimes arrive either as the `file-modtimes` array (one slot per file,
/// `null` when unknown) or as an object keyed by file index.
#[derive(Deserialize)]
#[serde(untagged)]
enum Modtimes {
    Listed(Vec<Option<u64>>),
    Indexed(HashMap<String, Option<u64>>),
}

fn index_keyed<'de, D>(deserializer: D) -> Result<HashMap<usize, u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Modtimes>::deserialize(deserializer)? {
        None => Ok(HashMap::new()),
        Some(Modtimes::Listed(list)) => Ok(list
            .into_iter()
            .enumerate()
            .filter_map(|(index, modtime)| modtime.map(|modtime| (index, modtime)))
            .collect()),
        Some(Modtimes::Indexed(raw)) => raw
            .into_iter()
            .filter_map(|(index, modtime)| modtime.map(|modtime| (index, modtime)))
            .map(|(index, modtime)| {
                index
                    .parse::<usize>()
                    .map(|index| (index, modtime))
                    .map_err(serde::de::Error::custom)
            })
            .collect(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentFileInfo {
    pub name: String,
    pub path: PathBuf,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentInfo {
    pub info_hash: Option<InfoHash>,
    pub magnet_uri: Option<String>,
    pub name: Option<String>,
    pub path: PathBuf,
    pub files: Vec<TorrentFileInfo>,
    pub bytes_received: u64,
}

impl TorrentInfo {
    pub fn of(torrent: &dyn SwarmTorrent) -> Self {
        Self {
            info_hash: torrent.info_hash(),
            magnet_uri: torrent.magnet_uri(),
            name: torrent.name(),
            path: torrent.path(),
            files: torrent
                .files()
                .into_iter()
                .map(|file| TorrentFileInfo {
                    name: file.name,
                    path: file.path,
                    length: file.length,
                })
                .collect(),
            bytes_received: torrent.stats().received,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub key: SessionKey,
    pub local_url: String,
    pub network_url: String,
    pub network_address: IpAddr,
    pub port: u16,
}

impl ServerInfo {
    pub fn new(key: SessionKey, network_address: IpAddr, port: u16) -> Self {
        Self {
            key,
            local_url: format!("http://localhost:{}", port),
            network_url: format!("http://{}:{}", network_address, port),
            network_address,
            port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostResponse {
    IpcReady,
    Warning {
        key: Option<SessionKey>,
        message: String,
    },
    Error {
        key: Option<SessionKey>,
        message: String,
    },
    Parsed {
        key: SessionKey,
        info_hash: InfoHash,
        magnet_uri: Option<String>,
    },
    Metadata {
        key: SessionKey,
        info: TorrentInfo,
    },
    Ready {
        key: SessionKey,
        info: TorrentInfo,
    },
    ReadyFor {
        info_hash: InfoHash,
        key: SessionKey,
        info: TorrentInfo,
    },
    Done {
        key: SessionKey,
        info: TorrentInfo,
    },
    FileModtimes {
        key: SessionKey,
        modtimes: Vec<Option<u64>>,
    },
    FileSaved {
        key: SessionKey,
        file_name: String,
    },
    Poster {
        key: SessionKey,
        file_name: String,
    },
    AudioMetadata {
        info_hash: InfoHash,
        index: usize,
        metadata: AudioMetadata,
    },
    ServerRunning {
        info: ServerInfo,
    },
    ServerRunningFor {
        info_hash: InfoHash,
        info: ServerInfo,
    },
    Progress {
        snapshot: ProgressSnapshot,
    },
    NewTorrent {
        key: SessionKey,
    },
    UncaughtError {
        message: String,
        stack: String,
    },
}

/// Compact `Debug` for logging commands without dumping descriptors.
pub struct HostCommandSummary<'a>(pub &'a HostCommand);
impl fmt::Debug for HostCommandSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            HostCommand::StartTorrenting {
                key,
                locator,
                selections,
                ..
            } => {
                let locator = match locator {
                    TorrentLocator::Descriptor(bytes) => format!("descriptor({} bytes)", bytes.len()),
                    TorrentLocator::Magnet(_) => "magnet".to_string(),
                    TorrentLocator::InfoHash(hash) => format!("info-hash({})", hash),
                    TorrentLocator::Path(path) => format!("path({})", path.display()),
                };
                write!(
                    f,
                    "START_TORRENTING(key: {}, locator: {}, selections: {:?})",
                    key,
                    locator,
                    selections.as_ref().map(Vec::len)
                )
            }
            HostCommand::CreateTorrent { key, options } => {
                write!(
                    f,
                    "CREATE_TORRENT(key: {}, files: {})",
                    key,
                    options.files.len()
                )
            }

            other => write!(f, "{:?}", other), // Fallback to default Debug for the rest
        }
    }
}
