// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

use crate::registry::SessionKey;
use crate::swarm::InfoHash;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("An I/O error occurred")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Invalid torrent locator: {0}")]
    InvalidLocator(String),

    #[error("Failed to parse torrent descriptor: {0}")]
    Descriptor(#[from] crate::torrent_file::parser::ParseError),

    #[error("Failed to encode torrent descriptor")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Torrent metadata is not available yet")]
    MetadataUnavailable,

    #[error("File index {index} is out of range ({count} files)")]
    FileIndex { index: usize, count: usize },

    #[error("Invalid piece length {0}")]
    InvalidPieceLength(u64),

    #[error("Cannot seed an empty file set")]
    NothingToSeed,

    #[error("Swarm engine error: {0}")]
    Engine(String),

    #[error("Torrent has been destroyed")]
    Destroyed,

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("An I/O error occurred: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a single host command.
///
/// None of these are retried by the host; the controller decides what to do
/// with the `uncaught-error` it receives.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("No torrent is registered for session key {0}")]
    SessionKeyNotFound(SessionKey),

    #[error("Session key {0} is already registered")]
    DuplicateSessionKey(SessionKey),

    #[error("No torrent is registered for info hash {0}")]
    InfoHashNotFound(InfoHash),

    #[error("got {got} file selections, but the torrent contains {expected} files")]
    SelectionLength { got: usize, expected: usize },

    #[error("Failed to bind streaming server: {0}")]
    ServerBind(std::io::Error),

    #[error(transparent)]
    Swarm(#[from] SwarmError),
}

/// Failures of the poster and audio metadata helpers. Logged, never reported.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No suitable file in torrent")]
    NoCandidate,

    #[error("Failed to read media: {0}")]
    Decode(#[from] symphonia::core::errors::Error),

    #[error("ffmpeg failed: {0}")]
    Ffmpeg(String),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Swarm(#[from] SwarmError),

    #[error("An I/O error occurred: {0}")]
    Io(#[from] std::io::Error),
}
