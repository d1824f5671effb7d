// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Scriptable swarm doubles for host tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::errors::SwarmError;
use crate::swarm::{
    AddOptions, Bitfield, InfoHash, SeedOptions, SelectionSet, SwarmClient, SwarmTorrent,
    TorrentFile, TorrentId, TorrentLocator, TorrentStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionCall {
    Select(u32, u32),
    Deselect(u32, u32),
}

struct FakeState {
    bitfield: Bitfield,
    selection: SelectionSet,
    calls: Vec<SelectionCall>,
    stats: TorrentStats,
    descriptor: Option<Bytes>,
    modtimes: Vec<Option<u64>>,
}

pub struct FakeTorrent {
    id: TorrentId,
    info_hash: InfoHash,
    name: String,
    path: PathBuf,
    files: Vec<TorrentFile>,
    piece_length: u64,
    data: Vec<u8>,
    ready: AtomicBool,
    destroyed: AtomicBool,
    has_piece_calls: AtomicUsize,
    arrived: Notify,
    state: Mutex<FakeState>,
}

impl FakeTorrent {
    /// A torrent over `files` whose content byte at global offset `i` is
    /// `i % 251`.
    pub fn new(id: u64, info_hash: InfoHash, files: &[(&str, u64)], piece_length: u64) -> Self {
        let layout: Vec<(PathBuf, u64)> = files
            .iter()
            .map(|(name, length)| (PathBuf::from(name), *length))
            .collect();
        let files = TorrentFile::layout(&layout, piece_length);
        let total: u64 = layout.iter().map(|(_, l)| l).sum();
        let piece_count = total.div_ceil(piece_length.max(1)) as u32;

        Self {
            id: TorrentId(id),
            info_hash,
            name: format!("fake-{}", id),
            path: PathBuf::from("/downloads"),
            files,
            piece_length: piece_length.max(1),
            data: (0..total).map(|i| (i % 251) as u8).collect(),
            ready: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            has_piece_calls: AtomicUsize::new(0),
            arrived: Notify::new(),
            state: Mutex::new(FakeState {
                bitfield: Bitfield::new(piece_count),
                selection: SelectionSet::everything(piece_count),
                calls: Vec::new(),
                stats: TorrentStats {
                    length: total,
                    ..Default::default()
                },
                descriptor: None,
                modtimes: vec![None; layout.len()],
            }),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_piece(&self, index: u32, present: bool) {
        self.state.lock().unwrap().bitfield.set(index, present);
        self.arrived.notify_waiters();
    }

    /// Marks every piece present and progress complete.
    pub fn complete(&self) {
        let mut state = self.state.lock().unwrap();
        state.bitfield = Bitfield::full(state.bitfield.len());
        state.stats.progress = 1.0;
        state.stats.downloaded = state.stats.length;
        drop(state);
        self.arrived.notify_waiters();
    }

    pub fn set_progress(&self, progress: f64, downloaded: u64) {
        let mut state = self.state.lock().unwrap();
        state.stats.progress = progress;
        state.stats.downloaded = downloaded;
    }

    pub fn set_descriptor(&self, descriptor: &[u8]) {
        self.state.lock().unwrap().descriptor = Some(Bytes::copy_from_slice(descriptor));
    }

    pub fn set_modtimes(&self, modtimes: Vec<Option<u64>>) {
        self.state.lock().unwrap().modtimes = modtimes;
    }

    pub fn has_piece_calls(&self) -> usize {
        self.has_piece_calls.load(Ordering::SeqCst)
    }

    pub fn selection_calls(&self) -> Vec<SelectionCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn selection(&self) -> SelectionSet {
        self.state.lock().unwrap().selection.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwarmTorrent for FakeTorrent {
    fn id(&self) -> TorrentId {
        self.id
    }

    fn info_hash(&self) -> Option<InfoHash> {
        Some(self.info_hash)
    }

    fn magnet_uri(&self) -> Option<String> {
        Some(format!("magnet:?xt=urn:btih:{}", self.info_hash))
    }

    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn files(&self) -> Vec<TorrentFile> {
        self.files.clone()
    }

    fn piece_count(&self) -> u32 {
        self.state.lock().unwrap().bitfield.len()
    }

    fn has_piece(&self, index: u32) -> bool {
        self.has_piece_calls.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().bitfield.get(index)
    }

    fn stats(&self) -> TorrentStats {
        self.state.lock().unwrap().stats
    }

    fn select(&self, start_piece: u32, end_piece: u32) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(SelectionCall::Select(start_piece, end_piece));
        state.selection.select(start_piece, end_piece);
    }

    fn deselect(&self, start_piece: u32, end_piece: u32) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(SelectionCall::Deselect(start_piece, end_piece));
        state.selection.deselect(start_piece, end_piece);
    }

    fn torrent_file(&self) -> Option<Bytes> {
        self.state.lock().unwrap().descriptor.clone()
    }

    async fn file_modtimes(&self) -> Result<Vec<Option<u64>>, SwarmError> {
        Ok(self.state.lock().unwrap().modtimes.clone())
    }

    async fn read_file(
        &self,
        file_index: usize,
        offset: u64,
        length: usize,
    ) -> Result<Bytes, SwarmError> {
        let file = self.files.get(file_index).ok_or(SwarmError::FileIndex {
            index: file_index,
            count: self.files.len(),
        })?;
        let start = (file.offset + offset.min(file.length)) as usize;
        let end = (file.offset + (offset + length as u64).min(file.length)) as usize;
        if start == end {
            return Ok(Bytes::new());
        }

        // Like a real swarm, block until every touched piece has arrived.
        let first = (start as u64 / self.piece_length) as u32;
        let last = ((end - 1) as u64 / self.piece_length) as u32;
        loop {
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();
            if self.is_destroyed() {
                return Err(SwarmError::Destroyed);
            }
            let complete = {
                let state = self.state.lock().unwrap();
                (first..=last).all(|piece| state.bitfield.get(piece))
            };
            if complete {
                break;
            }
            arrived.await;
        }
        Ok(Bytes::copy_from_slice(&self.data[start..end]))
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);
        self.arrived.notify_waiters();
    }
}

/// Hands out pre-scripted torrents in order.
#[derive(Default)]
pub struct FakeSwarm {
    scripted: Mutex<VecDeque<Arc<FakeTorrent>>>,
    pub added: Mutex<Vec<(TorrentLocator, AddOptions)>>,
    pub seeded: Mutex<Vec<SeedOptions>>,
    pub global_trackers: Mutex<Vec<String>>,
    pub destroyed: AtomicBool,
}

impl FakeSwarm {
    pub fn script(&self, torrent: Arc<FakeTorrent>) {
        self.scripted.lock().unwrap().push_back(torrent);
    }

    fn next(&self) -> Result<Arc<dyn SwarmTorrent>, SwarmError> {
        let torrent = self
            .scripted
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| SwarmError::InvalidLocator("no scripted torrent".into()))?;
        Ok(torrent)
    }
}

impl SwarmClient for FakeSwarm {
    fn add(
        &self,
        locator: TorrentLocator,
        options: AddOptions,
    ) -> Result<Arc<dyn SwarmTorrent>, SwarmError> {
        self.added.lock().unwrap().push((locator, options));
        self.next()
    }

    fn seed(&self, options: SeedOptions) -> Result<Arc<dyn SwarmTorrent>, SwarmError> {
        self.seeded.lock().unwrap().push(options);
        self.next()
    }

    fn set_global_trackers(&self, trackers: Vec<String>) {
        *self.global_trackers.lock().unwrap() = trackers;
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}
