// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::errors::SwarmError;
use crate::torrent_file::{Info, InfoFile, Torrent};

const MIN_PIECE_LENGTH: u64 = 16 * 1024;
const MAX_PIECE_LENGTH: u64 = 16 * 1024 * 1024;
const TARGET_PIECE_COUNT: u64 = 1024;

pub const CREATED_BY: &str = concat!("swarmhost/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub announce: Vec<String>,
    pub private: bool,
    pub piece_length: Option<u64>,
    pub creation_date: Option<i64>,
}

/// Result of laying out a seed file set: where the data lives on disk and how
/// each file is named inside the torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedLayout {
    pub download_path: PathBuf,
    pub name: String,
    pub files: Vec<(PathBuf, Vec<String>)>,
    pub multi_file: bool,
}

/// Power of two piece length giving roughly `TARGET_PIECE_COUNT` pieces.
pub fn piece_length_for(total_size: u64) -> u64 {
    let ideal = (total_size / TARGET_PIECE_COUNT).max(1);
    ideal
        .next_power_of_two()
        .clamp(MIN_PIECE_LENGTH, MAX_PIECE_LENGTH)
}

/// Works out the torrent root for a set of local files.
///
/// A single file becomes a single-file torrent rooted at its parent directory.
/// Several files become a multi-file torrent named after their deepest common
/// directory, with paths relative to it.
pub fn layout(paths: &[PathBuf], name: Option<&str>) -> Result<SeedLayout, SwarmError> {
    let first = paths.first().ok_or(SwarmError::NothingToSeed)?;

    if paths.len() == 1 {
        let file_name = first
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SwarmError::InvalidLocator(first.display().to_string()))?;
        let download_path = first.parent().map(Path::to_path_buf).unwrap_or_default();
        return Ok(SeedLayout {
            download_path,
            name: name.map(str::to_string).unwrap_or_else(|| file_name.clone()),
            files: vec![(first.clone(), vec![file_name])],
            multi_file: false,
        });
    }

    let mut common = first.parent().map(Path::to_path_buf).unwrap_or_default();
    for path in &paths[1..] {
        while !path.starts_with(&common) {
            if !common.pop() {
                break;
            }
        }
    }

    let dir_name = common
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Unnamed Torrent".to_string());
    let download_path = common.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let relative = path
            .strip_prefix(&common)
            .map_err(|_| SwarmError::InvalidLocator(path.display().to_string()))?;
        let components = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        files.push((path.clone(), components));
    }

    Ok(SeedLayout {
        download_path,
        name: name.map(str::to_string).unwrap_or(dir_name),
        files,
        multi_file: true,
    })
}

/// Hashes the files of `seed_layout` and produces the descriptor. Blocking.
pub fn build(seed_layout: &SeedLayout, options: &BuildOptions) -> Result<Torrent, SwarmError> {
    let mut lengths = Vec::with_capacity(seed_layout.files.len());
    for (path, _) in &seed_layout.files {
        lengths.push(std::fs::metadata(path)?.len());
    }
    let total_size: u64 = lengths.iter().sum();
    let piece_length = options
        .piece_length
        .unwrap_or_else(|| piece_length_for(total_size));
    if piece_length == 0 {
        return Err(SwarmError::InvalidPieceLength(piece_length));
    }

    let pieces = hash_pieces(
        seed_layout.files.iter().map(|(path, _)| path.as_path()),
        piece_length as usize,
    )?;

    let info = if seed_layout.multi_file {
        Info {
            piece_length: piece_length as i64,
            pieces,
            private: options.private.then_some(1),
            files: seed_layout
                .files
                .iter()
                .zip(&lengths)
                .map(|((_, components), length)| InfoFile {
                    length: *length as i64,
                    path: components.clone(),
                    ..Default::default()
                })
                .collect(),
            name: seed_layout.name.clone(),
            ..Default::default()
        }
    } else {
        Info {
            piece_length: piece_length as i64,
            pieces,
            private: options.private.then_some(1),
            name: seed_layout.name.clone(),
            length: total_size as i64,
            ..Default::default()
        }
    };

    let announce_list = if options.announce.len() > 1 {
        Some(options.announce.iter().map(|url| vec![url.clone()]).collect())
    } else {
        None
    };

    let mut torrent = Torrent {
        info,
        announce: options.announce.first().cloned(),
        announce_list,
        comment: options.comment.clone(),
        created_by: Some(CREATED_BY.to_string()),
        creation_date: options.creation_date,
        ..Default::default()
    };
    torrent.info_dict_bencode = serde_bencode::to_bytes(&torrent.info)?;

    Ok(torrent)
}

/// SHA-1 of every `piece_length` chunk of the concatenated files.
pub fn hash_pieces<'a>(
    files: impl Iterator<Item = &'a Path>,
    piece_length: usize,
) -> io::Result<Vec<u8>> {
    let mut pieces = Vec::new();
    let mut hasher = Sha1::new();
    let mut filled = 0usize;
    let mut buffer = vec![0u8; 64 * 1024];

    for path in files {
        let mut file = File::open(path)?;
        loop {
            let want = (piece_length - filled).min(buffer.len());
            let read = file.read(&mut buffer[..want])?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            filled += read;
            if filled == piece_length {
                pieces.extend_from_slice(&hasher.finalize_reset());
                filled = 0;
            }
        }
    }
    if filled > 0 {
        pieces.extend_from_slice(&hasher.finalize());
    }

    Ok(pieces)
}
