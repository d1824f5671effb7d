// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The boundary between the host and the peer-to-peer engine.
//!
//! The host never reaches into the engine: it adds and seeds torrents through
//! [`SwarmClient`], inspects them through [`SwarmTorrent`], and learns about
//! lifecycle changes from the [`SwarmEvent`]s the client pushes into the
//! channel it was built with.

pub mod bitfield;
pub mod locator;
pub mod offline;
pub mod rqbit;

#[cfg(test)]
pub mod testing;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use data_encoding::BASE32;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::SwarmError;

pub use bitfield::Bitfield;
pub use locator::TorrentLocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Accepts 40 hex characters or 32 base32 characters.
    pub fn parse(hash_string: &str) -> Result<Self, SwarmError> {
        let bytes = if hash_string.len() == 40 {
            hex::decode(hash_string).map_err(|e| SwarmError::InvalidLocator(e.to_string()))?
        } else if hash_string.len() == 32 {
            BASE32
                .decode(hash_string.to_uppercase().as_bytes())
                .map_err(|e| SwarmError::InvalidLocator(e.to_string()))?
        } else {
            return Err(SwarmError::InvalidLocator(format!(
                "Invalid info_hash length: {}",
                hash_string.len()
            )));
        };

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes);
        Ok(InfoHash(hash))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        InfoHash::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Client-assigned handle id, known before the info hash is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TorrentId(pub u64);

/// One file of a torrent as the swarm lays it out.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentFile {
    pub name: String,
    /// Path relative to the torrent's download path.
    pub path: PathBuf,
    pub length: u64,
    /// Offset of the first byte within the torrent's concatenated data.
    pub offset: u64,
    pub start_piece: u32,
    pub end_piece: u32,
}

impl TorrentFile {
    /// Builds the file table for a torrent given each file's relative path and
    /// length in swarm order.
    pub fn layout(files: &[(PathBuf, u64)], piece_length: u64) -> Vec<TorrentFile> {
        let mut offset = 0u64;
        files
            .iter()
            .map(|(path, length)| {
                let start_piece = (offset / piece_length.max(1)) as u32;
                let last_byte = (offset + length).saturating_sub(1).max(offset);
                let end_piece = (last_byte / piece_length.max(1)) as u32;
                let file = TorrentFile {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    path: path.clone(),
                    length: *length,
                    offset,
                    start_piece,
                    end_piece,
                };
                offset += length;
                file
            })
            .collect()
    }

    pub fn num_pieces(&self) -> u32 {
        self.end_piece - self.start_piece + 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TorrentStats {
    pub progress: f64,
    pub downloaded: u64,
    pub received: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub num_peers: usize,
    pub length: u64,
}

/// Options for [`SwarmClient::add`].
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub download_path: PathBuf,
    /// Last known modification times (ms since epoch) of the files, keyed by
    /// file index. When they all match the data on disk the client may trust
    /// it without rehashing.
    pub file_modtimes: HashMap<usize, u64>,
}

/// Options for [`SwarmClient::seed`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedOptions {
    pub files: Vec<PathBuf>,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub announce: Vec<String>,
    pub private: bool,
    pub piece_length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwarmEventKind {
    Warning(String),
    Error(String),
    InfoHash,
    Metadata,
    Ready,
    Done,
}

/// `torrent` is `None` for client-level warnings and errors.
#[derive(Debug, Clone, PartialEq)]
pub struct SwarmEvent {
    pub torrent: Option<TorrentId>,
    pub kind: SwarmEventKind,
}

impl SwarmEvent {
    pub fn torrent(id: TorrentId, kind: SwarmEventKind) -> Self {
        Self {
            torrent: Some(id),
            kind,
        }
    }
}

/// Wanted piece ranges of a torrent.
///
/// Ranges are kept exactly as they were selected: selecting a range twice
/// stores it once, and deselecting removes only an identical range. A piece
/// is wanted while any stored range covers it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionSet {
    ranges: Vec<(u32, u32)>,
}

impl SelectionSet {
    pub fn everything(piece_count: u32) -> Self {
        let mut set = Self::default();
        if piece_count > 0 {
            set.select(0, piece_count - 1);
        }
        set
    }

    pub fn select(&mut self, start: u32, end: u32) {
        if !self.ranges.contains(&(start, end)) {
            self.ranges.push((start, end));
        }
    }

    pub fn deselect(&mut self, start: u32, end: u32) {
        self.ranges.retain(|r| *r != (start, end));
    }

    pub fn is_wanted(&self, piece: u32) -> bool {
        self.ranges.iter().any(|(s, e)| (*s..=*e).contains(&piece))
    }
}

#[async_trait]
pub trait SwarmTorrent: Send + Sync {
    fn id(&self) -> TorrentId;

    /// `None` until the locator has been resolved.
    fn info_hash(&self) -> Option<InfoHash>;

    fn magnet_uri(&self) -> Option<String>;

    fn name(&self) -> Option<String>;

    fn path(&self) -> PathBuf;

    fn is_ready(&self) -> bool;

    /// Empty until metadata is known.
    fn files(&self) -> Vec<TorrentFile>;

    fn piece_count(&self) -> u32;

    /// Bitfield lookup for a single piece.
    fn has_piece(&self, index: u32) -> bool;

    fn stats(&self) -> TorrentStats;

    fn select(&self, start_piece: u32, end_piece: u32);

    fn deselect(&self, start_piece: u32, end_piece: u32);

    /// The bencoded descriptor, once metadata is known.
    fn torrent_file(&self) -> Option<Bytes>;

    /// Modification time (ms since epoch) of each file on disk, `None` for
    /// files that do not exist yet.
    async fn file_modtimes(&self) -> Result<Vec<Option<u64>>, SwarmError>;

    /// Reads `length` bytes at `offset` within file `file_index`.
    ///
    /// Waits until every piece the range touches is present, fetching those
    /// pieces ahead of the rest of the selection. Fails with
    /// [`SwarmError::Destroyed`] if the torrent is destroyed meanwhile.
    async fn read_file(
        &self,
        file_index: usize,
        offset: u64,
        length: usize,
    ) -> Result<Bytes, SwarmError>;

    /// Stops all work for this torrent. Later calls are no-ops.
    fn destroy(&self);
}

pub trait SwarmClient: Send + Sync {
    fn add(
        &self,
        locator: TorrentLocator,
        options: AddOptions,
    ) -> Result<Arc<dyn SwarmTorrent>, SwarmError>;

    fn seed(&self, options: SeedOptions) -> Result<Arc<dyn SwarmTorrent>, SwarmError>;

    /// Default announce list for torrents created by [`SwarmClient::seed`].
    fn set_global_trackers(&self, trackers: Vec<String>);

    /// Destroys every torrent the client still knows about.
    fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_hex_and_base32() {
        let hex = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";
        let from_hex = InfoHash::parse(hex).unwrap();
        assert_eq!(from_hex.to_string(), hex);

        let b32 = BASE32.encode(&from_hex.0);
        assert_eq!(InfoHash::parse(&b32.to_lowercase()).unwrap(), from_hex);

        assert!(InfoHash::parse("abc").is_err());
    }

    #[test]
    fn test_info_hash_serializes_as_hex_string() {
        let hash = InfoHash([0xAB; 20]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(20)));
        let back: InfoHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn test_file_layout_piece_ranges() {
        let files = vec![
            (PathBuf::from("a.mkv"), 40_000),
            (PathBuf::from("b.srt"), 100),
            (PathBuf::from("empty"), 0),
            (PathBuf::from("c.nfo"), 24_900),
        ];
        let layout = TorrentFile::layout(&files, 16_384);

        assert_eq!((layout[0].start_piece, layout[0].end_piece), (0, 2));
        assert_eq!((layout[1].start_piece, layout[1].end_piece), (2, 2));
        assert_eq!(layout[2].num_pieces(), 1);
        assert_eq!(layout[3].offset, 40_100);
        assert_eq!((layout[3].start_piece, layout[3].end_piece), (2, 3));
    }

    #[test]
    fn test_selection_set_exact_ranges() {
        let mut set = SelectionSet::everything(10);
        set.select(0, 9);
        set.deselect(0, 9);
        assert!(!set.is_wanted(0));

        set.select(0, 3);
        set.select(7, 9);
        set.deselect(4, 6);
        assert!(set.is_wanted(3));
        assert!(!set.is_wanted(5));
        assert!(set.is_wanted(7));
    }
}
