// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Throttled progress telemetry.
//!
//! The aggregator never runs on its own: the host asks for an update on every
//! tick and lifecycle event, the aggregator arms a single deadline, and when
//! the host calls [`ProgressAggregator::fire`] at that deadline a fresh
//! snapshot is computed and compared to the last one that went out.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::Settings;
use crate::registry::{Registry, SessionKey, TorrentEntry};
use crate::swarm::{SwarmTorrent, TorrentFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProgress {
    pub start_piece: u32,
    pub end_piece: u32,
    pub num_pieces: u32,
    pub num_pieces_present: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentProgress {
    pub key: SessionKey,
    pub ready: bool,
    pub progress: f64,
    pub downloaded: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub num_peers: usize,
    pub length: u64,
    pub files: Vec<FileProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub progress: f64,
    pub has_active_torrents: bool,
    pub torrents: Vec<TorrentProgress>,
}

/// Piece presence counts of a completed torrent, by file piece range.
#[derive(Debug, Default)]
pub struct FileProgressCache {
    present: HashMap<(u32, u32), u32>,
}

fn scan_pieces(torrent: &dyn SwarmTorrent, file: &TorrentFile) -> u32 {
    (file.start_piece..=file.end_piece)
        .filter(|piece| torrent.has_piece(*piece))
        .count() as u32
}

pub fn file_progress(
    torrent: &dyn SwarmTorrent,
    file: &TorrentFile,
    complete: bool,
    cache: &mut FileProgressCache,
) -> FileProgress {
    let num_pieces = file.num_pieces();
    let num_pieces_present = if complete {
        *cache
            .present
            .entry((file.start_piece, file.end_piece))
            .or_insert(num_pieces)
    } else {
        scan_pieces(torrent, file)
    };

    FileProgress {
        start_piece: file.start_piece,
        end_piece: file.end_piece,
        num_pieces,
        num_pieces_present,
    }
}

pub fn torrent_progress(entry: &mut TorrentEntry) -> TorrentProgress {
    let stats = entry.handle.stats();
    let complete = stats.progress >= 1.0;
    let files = entry
        .handle
        .files()
        .iter()
        .map(|file| file_progress(entry.handle.as_ref(), file, complete, &mut entry.cache))
        .collect();

    TorrentProgress {
        key: entry.key.clone(),
        ready: entry.handle.is_ready(),
        progress: stats.progress,
        downloaded: stats.downloaded,
        download_speed: stats.download_speed,
        upload_speed: stats.upload_speed,
        num_peers: stats.num_peers,
        length: stats.length,
        files,
    }
}

pub fn compute_snapshot<'a>(entries: impl Iterator<Item = &'a mut TorrentEntry>) -> ProgressSnapshot {
    let torrents: Vec<TorrentProgress> = entries.map(torrent_progress).collect();

    let (downloaded, length) = torrents
        .iter()
        .filter(|t| t.length > 0)
        .fold((0u64, 0u64), |(d, l), t| (d + t.downloaded, l + t.length));
    let progress = if length > 0 {
        downloaded as f64 / length as f64
    } else {
        0.0
    };

    ProgressSnapshot {
        progress,
        has_active_torrents: torrents.iter().any(|t| t.progress != 1.0),
        torrents,
    }
}

pub struct ProgressAggregator {
    interval: Duration,
    progress_threshold: f64,
    downloaded_threshold: u64,
    deadline: Option<Instant>,
    last: Option<ProgressSnapshot>,
}

impl ProgressAggregator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            interval: Duration::from_millis(settings.progress_interval_ms),
            progress_threshold: settings.progress_change_threshold,
            downloaded_threshold: settings.downloaded_change_threshold_bytes,
            deadline: None,
            last: None,
        }
    }

    /// Arms the emission deadline unless one is already pending.
    pub fn request_update(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.interval);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Computes a snapshot and returns it if it differs enough from the last
    /// emitted one.
    pub fn fire(&mut self, registry: &mut Registry) -> Option<ProgressSnapshot> {
        self.deadline = None;
        let snapshot = compute_snapshot(registry.iter_mut());

        if let Some(ref last) = self.last {
            if self.is_similar(last, &snapshot) {
                return None;
            }
        }
        self.last = Some(snapshot.clone());
        Some(snapshot)
    }

    fn is_similar(&self, last: &ProgressSnapshot, next: &ProgressSnapshot) -> bool {
        if last.progress != next.progress
            || last.has_active_torrents != next.has_active_torrents
            || last.torrents.len() != next.torrents.len()
        {
            return false;
        }

        last.torrents.iter().zip(&next.torrents).all(|(a, b)| {
            a.key == b.key
                && a.ready == b.ready
                && (a.progress - b.progress).abs() <= self.progress_threshold
                && a.downloaded.abs_diff(b.downloaded) <= self.downloaded_threshold
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::testing::FakeTorrent;
    use crate::swarm::InfoHash;
    use std::sync::Arc;

    fn add(registry: &mut Registry, key: &str, id: u64) -> Arc<FakeTorrent> {
        let torrent = Arc::new(FakeTorrent::new(
            id,
            InfoHash([id as u8; 20]),
            &[("a", 64), ("b", 64)],
            16,
        ));
        registry
            .insert(TorrentEntry::new(key.into(), torrent.clone(), None))
            .unwrap();
        torrent
    }

    fn aggregator() -> ProgressAggregator {
        ProgressAggregator::new(&Settings::default())
    }

    #[test]
    fn test_incomplete_torrent_scans_each_file() {
        let mut registry = Registry::default();
        let torrent = add(&mut registry, "k", 1);
        torrent.set_piece(0, true);
        torrent.set_piece(5, true);
        torrent.set_piece(6, true);

        let snapshot = compute_snapshot(registry.iter_mut());
        let files = &snapshot.torrents[0].files;
        assert_eq!(files[0].num_pieces, 4);
        assert_eq!(files[0].num_pieces_present, 1);
        assert_eq!(files[1].num_pieces_present, 2);
        assert_eq!(torrent.has_piece_calls(), 8);
    }

    #[test]
    fn test_completed_torrent_uses_cache() {
        let mut registry = Registry::default();
        let torrent = add(&mut registry, "k", 1);
        torrent.complete();

        let first = compute_snapshot(registry.iter_mut());
        let calls = torrent.has_piece_calls();
        let second = compute_snapshot(registry.iter_mut());

        assert_eq!(first.torrents[0].files, second.torrents[0].files);
        assert_eq!(second.torrents[0].files[1].num_pieces_present, 4);
        assert_eq!(torrent.has_piece_calls(), calls);
        assert_eq!(calls, 0);
        assert!(!second.has_active_torrents);
    }

    #[test]
    fn test_overall_progress_weights_by_length() {
        let mut registry = Registry::default();
        let a = add(&mut registry, "a", 1);
        let b = add(&mut registry, "b", 2);
        a.set_progress(0.5, 64);
        b.set_progress(0.0, 0);

        let snapshot = compute_snapshot(registry.iter_mut());
        assert_eq!(snapshot.progress, 0.25);
        assert!(snapshot.has_active_torrents);
    }

    #[test]
    fn test_empty_registry_reports_zero() {
        let mut registry = Registry::default();
        let snapshot = compute_snapshot(registry.iter_mut());
        assert_eq!(snapshot.progress, 0.0);
        assert!(!snapshot.has_active_torrents);
    }

    #[test]
    fn test_request_update_arms_single_deadline() {
        let mut aggregator = aggregator();
        let now = Instant::now();
        aggregator.request_update(now);
        aggregator.request_update(now + Duration::from_millis(100));
        assert_eq!(aggregator.deadline(), Some(now + Duration::from_millis(250)));

        let mut registry = Registry::default();
        aggregator.fire(&mut registry);
        assert_eq!(aggregator.deadline(), None);
    }

    #[test]
    fn test_small_changes_are_filtered() {
        let mut registry = Registry::default();
        let torrent = add(&mut registry, "k", 1);
        let mut aggregator = aggregator();

        torrent.set_progress(0.5, 64);
        assert!(aggregator.fire(&mut registry).is_some());
        assert!(aggregator.fire(&mut registry).is_none());

        torrent.set_progress(0.5005, 64);
        assert!(aggregator.fire(&mut registry).is_none());

        torrent.set_progress(0.6, 64);
        assert!(aggregator.fire(&mut registry).is_some());

        torrent.set_ready(true);
        assert!(aggregator.fire(&mut registry).is_some());
        assert!(aggregator.fire(&mut registry).is_none());
    }

    #[test]
    fn test_new_torrent_is_not_similar() {
        let mut registry = Registry::default();
        let mut aggregator = aggregator();
        assert!(aggregator.fire(&mut registry).is_some());
        assert!(aggregator.fire(&mut registry).is_none());

        add(&mut registry, "k", 1);
        assert!(aggregator.fire(&mut registry).is_some());
    }
}
