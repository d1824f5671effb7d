// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Tag and stream parameter extraction for audio files inside a torrent.

use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;

use crate::errors::MediaError;
use crate::swarm::SwarmTorrent;

/// Bytes read through the swarm when the file is not fully on disk.
pub const HEAD_BYTES: usize = 4 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AudioMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album_artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<usize>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl AudioMetadata {
    /// What the controller shows until the tags have been read.
    pub fn placeholder(file_name: &str) -> Self {
        Self {
            title: Some(file_name.to_string()),
            ..Default::default()
        }
    }

    fn apply_revision(&mut self, revision: &MetadataRevision) {
        for tag in revision.tags() {
            let Some(key) = tag.std_key else {
                continue;
            };
            let value = tag.value.to_string();
            let slot = match key {
                StandardTagKey::TrackTitle => &mut self.title,
                StandardTagKey::Artist => &mut self.artist,
                StandardTagKey::Album => &mut self.album,
                StandardTagKey::AlbumArtist => &mut self.album_artist,
                StandardTagKey::Date | StandardTagKey::OriginalDate => &mut self.year,
                StandardTagKey::Genre => &mut self.genre,
                StandardTagKey::TrackNumber => {
                    if self.track_number.is_none() {
                        self.track_number = parse_track_number(&value);
                    }
                    continue;
                }
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value);
            }
        }
    }
}

/// "3", "03" and "3/12" all mean track 3.
fn parse_track_number(value: &str) -> Option<u32> {
    value.split('/').next()?.trim().parse().ok()
}

fn read_tags(source: Box<dyn MediaSource>, file_name: &str) -> Result<AudioMetadata, MediaError> {
    let mss = MediaSourceStream::new(source, Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = Path::new(file_name).extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mut found = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut metadata = AudioMetadata::default();

    // Container level tags first (e.g. ID3v2 in front of the stream), then
    // the format's own.
    if let Some(revision) = found.metadata.get().as_ref().and_then(|m| m.current()) {
        metadata.apply_revision(revision);
    }
    if let Some(revision) = found.format.metadata().current() {
        metadata.apply_revision(revision);
    }

    if let Some(track) = found.format.default_track() {
        let params = &track.codec_params;
        metadata.codec = symphonia::default::get_codecs()
            .get_codec(params.codec)
            .map(|descriptor| descriptor.short_name.to_string());
        metadata.sample_rate = params.sample_rate;
        metadata.channels = params.channels.map(|c| c.count());
        metadata.duration = match (params.n_frames, params.time_base, params.sample_rate) {
            (Some(frames), Some(time_base), _) => {
                let time = time_base.calc_time(frames);
                Some(time.seconds as f64 + time.frac)
            }
            (Some(frames), None, Some(rate)) if rate > 0 => Some(frames as f64 / rate as f64),
            _ => None,
        };
    }

    if metadata.title.is_none() {
        metadata.title = Some(file_name.to_string());
    }
    Ok(metadata)
}

/// Blocking.
pub fn parse_file(path: &Path, file_name: &str) -> Result<AudioMetadata, MediaError> {
    let file = File::open(path)?;
    read_tags(Box::new(file), file_name)
}

/// Blocking.
pub fn parse_bytes(bytes: Vec<u8>, file_name: &str) -> Result<AudioMetadata, MediaError> {
    read_tags(Box::new(Cursor::new(bytes)), file_name)
}

/// Reads tags from disk when the whole file is present, otherwise from the
/// first [`HEAD_BYTES`] fetched through the swarm.
pub async fn read_metadata(
    torrent: Arc<dyn SwarmTorrent>,
    index: usize,
) -> Result<AudioMetadata, MediaError> {
    let files = torrent.files();
    let file = files.get(index).cloned().ok_or(MediaError::NoCandidate)?;
    let on_disk = (file.start_piece..=file.end_piece).all(|piece| torrent.has_piece(piece));
    let name = file.name.clone();

    if on_disk {
        let path = torrent.path().join(&file.path);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return tokio::task::spawn_blocking(move || parse_file(&path, &name)).await?;
        }
    }

    let length = (file.length as usize).min(HEAD_BYTES);
    let head = torrent.read_file(index, 0, length).await?;
    tokio::task::spawn_blocking(move || parse_bytes(head.to_vec(), &name)).await?
}
