// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! A swarm client that never talks to peers.
//!
//! Torrents are resolved from descriptors (inline, on disk, or cached in the
//! torrents directory for magnets and bare hashes), their data is verified
//! against the piece hashes, and reads are served straight from disk. A read
//! that touches missing pieces waits, rehashing just those pieces from disk
//! until they match. Seeding hashes the local files into a new descriptor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{event, Level};

use crate::errors::SwarmError;
use crate::storage::{self, MultiFileInfo};
use crate::swarm::locator::magnet_info_hash;
use crate::swarm::{
    AddOptions, Bitfield, InfoHash, SeedOptions, SelectionSet, SwarmClient, SwarmEvent,
    SwarmEventKind, SwarmTorrent, TorrentFile, TorrentId, TorrentLocator, TorrentStats,
};
use crate::torrent_file::builder::{self, BuildOptions};
use crate::torrent_file::{self, parser, Torrent};

/// How often a waiting read rehashes the pieces it is missing.
const RECHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Where the descriptor of an added torrent comes from.
enum Source {
    Descriptor(Vec<u8>),
    File(PathBuf),
    Cached(InfoHash),
}

#[derive(Default)]
struct State {
    info_hash: Option<InfoHash>,
    name: Option<String>,
    trackers: Vec<String>,
    descriptor: Option<Bytes>,
    torrent: Option<Arc<Torrent>>,
    piece_length: u64,
    files: Vec<TorrentFile>,
    storage: Option<MultiFileInfo>,
    bitfield: Bitfield,
    downloaded: u64,
    selection: SelectionSet,
    ready: bool,
    destroyed: bool,
}

impl State {
    fn piece_size(&self, index: u32) -> u64 {
        let total = self.storage.as_ref().map_or(0, |s| s.total_size);
        let start = index as u64 * self.piece_length;
        self.piece_length.min(total.saturating_sub(start))
    }

    fn set_bitfield(&mut self, bitfield: Bitfield) {
        self.downloaded = (0..bitfield.len())
            .filter(|i| bitfield.get(*i))
            .map(|i| self.piece_size(i))
            .sum();
        self.bitfield = bitfield;
    }

    fn mark_piece(&mut self, index: u32) {
        if !self.bitfield.get(index) {
            self.bitfield.set(index, true);
            self.downloaded += self.piece_size(index);
        }
    }
}

/// Where a read lands, and which of its pieces are not verified yet.
struct Span {
    storage: MultiFileInfo,
    offset: u64,
    length: usize,
    missing: Vec<u32>,
}

pub struct OfflineTorrent {
    id: TorrentId,
    download_path: PathBuf,
    events: mpsc::Sender<SwarmEvent>,
    state: RwLock<State>,
    /// Fired whenever pieces arrive or the torrent is destroyed.
    changed: Notify,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl OfflineTorrent {
    fn new(id: TorrentId, download_path: PathBuf, events: mpsc::Sender<SwarmEvent>) -> Self {
        Self {
            id,
            download_path,
            events,
            state: RwLock::new(State::default()),
            changed: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_destroyed(&self) -> bool {
        self.read_state().destroyed
    }

    fn track(&self, handle: AbortHandle) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(handle);
    }

    fn set_info_hash(&self, info_hash: InfoHash) {
        self.write_state().info_hash = Some(info_hash);
    }

    fn set_metadata(&self, torrent: &Torrent, descriptor: Bytes) {
        let piece_length = torrent.info.piece_length.max(1) as u64;
        let files = torrent.file_paths(true);

        let mut state = self.write_state();
        state.info_hash = Some(torrent.info_hash());
        state.name = Some(torrent.info.name.clone());
        state.trackers = torrent.trackers();
        state.descriptor = Some(descriptor);
        state.torrent = Some(Arc::new(torrent.clone()));
        state.piece_length = piece_length;
        state.files = TorrentFile::layout(&files, piece_length);
        state.storage = Some(MultiFileInfo::new(&self.download_path, torrent));
        state.bitfield = Bitfield::new(torrent.piece_count());
        state.downloaded = 0;
        state.selection = SelectionSet::everything(torrent.piece_count());
    }

    fn storage(&self) -> Result<MultiFileInfo, SwarmError> {
        self.read_state()
            .storage
            .clone()
            .ok_or(SwarmError::MetadataUnavailable)
    }

    fn install_bitfield(&self, bitfield: Bitfield) {
        {
            let mut state = self.write_state();
            state.set_bitfield(bitfield);
            state.ready = !state.destroyed;
        }
        self.changed.notify_waiters();
    }

    fn span(&self, file_index: usize, offset: u64, length: usize) -> Result<Span, SwarmError> {
        let state = self.read_state();
        if state.destroyed {
            return Err(SwarmError::Destroyed);
        }
        let storage = state
            .storage
            .clone()
            .ok_or(SwarmError::MetadataUnavailable)?;
        let file = state.files.get(file_index).ok_or(SwarmError::FileIndex {
            index: file_index,
            count: state.files.len(),
        })?;

        let length = (length as u64).min(file.length.saturating_sub(offset)) as usize;
        let global_offset = file.offset + offset;
        let missing = if length == 0 {
            Vec::new()
        } else {
            let first = (global_offset / state.piece_length) as u32;
            let last = ((global_offset + length as u64 - 1) / state.piece_length) as u32;
            (first..=last).filter(|p| !state.bitfield.get(*p)).collect()
        };
        Ok(Span {
            storage,
            offset: global_offset,
            length,
            missing,
        })
    }

    /// Rehashes `pieces` from disk and marks the ones that now match.
    async fn recheck(&self, pieces: &[u32]) {
        let (storage, torrent) = {
            let state = self.read_state();
            if !state.ready {
                return;
            }
            match (state.storage.clone(), state.torrent.clone()) {
                (Some(storage), Some(torrent)) => (storage, torrent),
                _ => return,
            }
        };

        let mut found = Vec::new();
        for &piece in pieces {
            if storage::verify_piece(&storage, &torrent, piece).await {
                found.push(piece);
            }
        }
        if found.is_empty() {
            return;
        }

        let complete = {
            let mut state = self.write_state();
            for &piece in &found {
                state.mark_piece(piece);
            }
            state.bitfield.is_complete()
        };
        event!(Level::DEBUG, id = self.id.0, pieces = ?found, "Pieces appeared on disk");
        self.changed.notify_waiters();
        if complete && !self.is_destroyed() {
            let _ = self
                .events
                .send(SwarmEvent::torrent(self.id, SwarmEventKind::Done))
                .await;
        }
    }
}

#[async_trait]
impl SwarmTorrent for OfflineTorrent {
    fn id(&self) -> TorrentId {
        self.id
    }

    fn info_hash(&self) -> Option<InfoHash> {
        self.read_state().info_hash
    }

    fn magnet_uri(&self) -> Option<String> {
        let state = self.read_state();
        let info_hash = state.info_hash?;
        Some(torrent_file::magnet_uri(
            &info_hash,
            state.name.as_deref(),
            &state.trackers,
        ))
    }

    fn name(&self) -> Option<String> {
        self.read_state().name.clone()
    }

    fn path(&self) -> PathBuf {
        self.download_path.clone()
    }

    fn is_ready(&self) -> bool {
        self.read_state().ready
    }

    fn files(&self) -> Vec<TorrentFile> {
        self.read_state().files.clone()
    }

    fn piece_count(&self) -> u32 {
        self.read_state().bitfield.len()
    }

    fn has_piece(&self, index: u32) -> bool {
        self.read_state().bitfield.get(index)
    }

    fn stats(&self) -> TorrentStats {
        let state = self.read_state();
        let length = state.storage.as_ref().map_or(0, |s| s.total_size);
        let progress = if length == 0 {
            if state.bitfield.is_complete() && state.storage.is_some() {
                1.0
            } else {
                0.0
            }
        } else {
            state.downloaded as f64 / length as f64
        };
        TorrentStats {
            progress,
            downloaded: state.downloaded,
            received: 0,
            download_speed: 0,
            upload_speed: 0,
            num_peers: 0,
            length,
        }
    }

    fn select(&self, start_piece: u32, end_piece: u32) {
        self.write_state().selection.select(start_piece, end_piece);
    }

    fn deselect(&self, start_piece: u32, end_piece: u32) {
        self.write_state().selection.deselect(start_piece, end_piece);
    }

    fn torrent_file(&self) -> Option<Bytes> {
        self.read_state().descriptor.clone()
    }

    async fn file_modtimes(&self) -> Result<Vec<Option<u64>>, SwarmError> {
        let storage = self.storage()?;
        let mut modtimes = Vec::with_capacity(storage.files.len());
        for file in &storage.files {
            modtimes.push(storage::file_modtime(&file.path).await?);
        }
        Ok(modtimes)
    }

    async fn read_file(
        &self,
        file_index: usize,
        offset: u64,
        length: usize,
    ) -> Result<Bytes, SwarmError> {
        let mut recheck = tokio::time::interval(RECHECK_INTERVAL);
        recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let span = self.span(file_index, offset, length)?;
            if span.length == 0 {
                return Ok(Bytes::new());
            }
            if span.missing.is_empty() {
                let data = storage::read_data_from_disk(&span.storage, span.offset, span.length).await?;
                return Ok(Bytes::from(data));
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = recheck.tick() => self.recheck(&span.missing).await,
            }
        }
    }

    fn destroy(&self) {
        {
            let mut state = self.write_state();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.ready = false;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        self.changed.notify_waiters();
        event!(Level::DEBUG, id = self.id.0, "Offline torrent destroyed");
    }
}

/// Shared by every background task a client spawns.
#[derive(Clone)]
struct Loader {
    events: mpsc::Sender<SwarmEvent>,
    torrents_dir: PathBuf,
    verify_permits: Arc<Semaphore>,
}

impl Loader {
    async fn emit(&self, torrent: &OfflineTorrent, kind: SwarmEventKind) {
        if torrent.is_destroyed() {
            return;
        }
        // The host going away is the only way this fails.
        let _ = self.events.send(SwarmEvent::torrent(torrent.id, kind)).await;
    }

    async fn load_descriptor(&self, source: Source) -> Result<(Torrent, Bytes), SwarmError> {
        let (bytes, expected) = match source {
            Source::Descriptor(bytes) => (bytes, None),
            Source::File(path) => (tokio::fs::read(&path).await?, None),
            Source::Cached(info_hash) => {
                let path = self.torrents_dir.join(format!("{}.torrent", info_hash));
                match tokio::fs::read(&path).await {
                    Ok(bytes) => (bytes, Some(info_hash)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(SwarmError::MetadataUnavailable)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let torrent = parser::from_bytes(&bytes)?;
        if let Some(expected) = expected {
            if torrent.info_hash() != expected {
                return Err(SwarmError::InvalidLocator(format!(
                    "cached descriptor does not match {}",
                    expected
                )));
            }
        }
        Ok((torrent, Bytes::from(bytes)))
    }

    async fn verify(
        &self,
        torrent: &OfflineTorrent,
        descriptor: &Torrent,
        known_modtimes: &HashMap<usize, u64>,
    ) -> Result<Bitfield, SwarmError> {
        let storage = torrent.storage()?;
        if modtimes_match(&storage, known_modtimes).await {
            event!(Level::DEBUG, id = torrent.id.0, "Modification times match, skipping hash check");
            return Ok(Bitfield::full(descriptor.piece_count()));
        }

        let _permit = self
            .verify_permits
            .acquire()
            .await
            .map_err(|_| SwarmError::Destroyed)?;
        Ok(storage::verify_pieces(&storage, descriptor).await)
    }

    async fn run_add(&self, torrent: Arc<OfflineTorrent>, source: Source, options: AddOptions) {
        if let Source::Cached(info_hash) = source {
            self.emit(&torrent, SwarmEventKind::InfoHash).await;
            event!(Level::DEBUG, %info_hash, "Looking up cached descriptor");
        }

        let (descriptor, bytes) = match self.load_descriptor(source).await {
            Ok(loaded) => loaded,
            Err(SwarmError::MetadataUnavailable) => {
                self.emit(
                    &torrent,
                    SwarmEventKind::Warning("metadata is not available without peers".into()),
                )
                .await;
                return;
            }
            Err(e) => {
                self.emit(&torrent, SwarmEventKind::Error(e.to_string())).await;
                return;
            }
        };

        let had_hash = torrent.info_hash().is_some();
        torrent.set_metadata(&descriptor, bytes);
        if !had_hash {
            self.emit(&torrent, SwarmEventKind::InfoHash).await;
        }
        self.emit(&torrent, SwarmEventKind::Metadata).await;

        match self.verify(&torrent, &descriptor, &options.file_modtimes).await {
            Ok(bitfield) => {
                let complete = bitfield.is_complete();
                torrent.install_bitfield(bitfield);
                self.emit(&torrent, SwarmEventKind::Ready).await;
                if complete {
                    self.emit(&torrent, SwarmEventKind::Done).await;
                }
            }
            Err(e) => self.emit(&torrent, SwarmEventKind::Error(e.to_string())).await,
        }
    }

    async fn run_seed(
        &self,
        torrent: Arc<OfflineTorrent>,
        seed_layout: builder::SeedLayout,
        options: BuildOptions,
    ) {
        let built = tokio::task::spawn_blocking(move || {
            let descriptor = builder::build(&seed_layout, &options)?;
            let bytes = serde_bencode::to_bytes(&descriptor)?;
            Ok::<_, SwarmError>((descriptor, bytes))
        })
        .await;

        let (descriptor, bytes) = match built {
            Ok(Ok(built)) => built,
            Ok(Err(e)) => {
                self.emit(&torrent, SwarmEventKind::Error(e.to_string())).await;
                return;
            }
            Err(e) => {
                self.emit(&torrent, SwarmEventKind::Error(e.to_string())).await;
                return;
            }
        };

        torrent.set_metadata(&descriptor, Bytes::from(bytes));
        torrent.install_bitfield(Bitfield::full(descriptor.piece_count()));
        event!(Level::INFO, info_hash = %descriptor.info_hash(), "Seeding created torrent");

        self.emit(&torrent, SwarmEventKind::InfoHash).await;
        self.emit(&torrent, SwarmEventKind::Metadata).await;
        self.emit(&torrent, SwarmEventKind::Ready).await;
        self.emit(&torrent, SwarmEventKind::Done).await;
    }
}

async fn modtimes_match(storage: &MultiFileInfo, known: &HashMap<usize, u64>) -> bool {
    if known.is_empty() || storage.files.is_empty() {
        return false;
    }
    for (index, file) in storage.files.iter().enumerate() {
        let Some(expected) = known.get(&index) else {
            return false;
        };
        match storage::file_modtime(&file.path).await {
            Ok(Some(actual)) if actual == *expected => {}
            _ => return false,
        }
    }
    true
}

pub struct OfflineClient {
    loader: Loader,
    next_id: AtomicU64,
    global_trackers: RwLock<Vec<String>>,
    torrents: Mutex<Vec<Weak<OfflineTorrent>>>,
}

impl OfflineClient {
    pub fn new(
        events: mpsc::Sender<SwarmEvent>,
        torrents_dir: PathBuf,
        verify_concurrency: usize,
    ) -> Self {
        Self {
            loader: Loader {
                events,
                torrents_dir,
                verify_permits: Arc::new(Semaphore::new(verify_concurrency.max(1))),
            },
            next_id: AtomicU64::new(1),
            global_trackers: RwLock::new(Vec::new()),
            torrents: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, download_path: &Path) -> Arc<OfflineTorrent> {
        let id = TorrentId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let torrent = Arc::new(OfflineTorrent::new(
            id,
            download_path.to_path_buf(),
            self.loader.events.clone(),
        ));
        let mut torrents = self.torrents.lock().unwrap_or_else(PoisonError::into_inner);
        torrents.retain(|t| t.strong_count() > 0);
        torrents.push(Arc::downgrade(&torrent));
        torrent
    }
}

impl SwarmClient for OfflineClient {
    fn add(
        &self,
        locator: TorrentLocator,
        options: AddOptions,
    ) -> Result<Arc<dyn SwarmTorrent>, SwarmError> {
        let source = match locator {
            TorrentLocator::Magnet(uri) => Source::Cached(magnet_info_hash(&uri)?),
            TorrentLocator::InfoHash(info_hash) => Source::Cached(info_hash),
            TorrentLocator::Path(path) => Source::File(path),
            TorrentLocator::Descriptor(bytes) => Source::Descriptor(bytes),
        };

        let torrent = self.register(&options.download_path);
        if let Source::Cached(info_hash) = source {
            torrent.set_info_hash(info_hash);
        }
        event!(Level::INFO, id = torrent.id.0, path = %options.download_path.display(), "Adding torrent");

        let loader = self.loader.clone();
        let task = tokio::spawn({
            let torrent = torrent.clone();
            async move { loader.run_add(torrent, source, options).await }
        });
        torrent.track(task.abort_handle());

        Ok(torrent)
    }

    fn seed(&self, options: SeedOptions) -> Result<Arc<dyn SwarmTorrent>, SwarmError> {
        let seed_layout = builder::layout(&options.files, options.name.as_deref())?;
        let announce = if options.announce.is_empty() {
            self.global_trackers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        } else {
            options.announce.clone()
        };
        let build_options = BuildOptions {
            name: options.name.clone(),
            comment: options.comment.clone(),
            announce,
            private: options.private,
            piece_length: options.piece_length,
            creation_date: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs() as i64),
        };

        let torrent = self.register(&seed_layout.download_path);
        torrent.write_state().name = Some(seed_layout.name.clone());
        event!(Level::INFO, id = torrent.id.0, name = %seed_layout.name, "Creating torrent");

        let loader = self.loader.clone();
        let task = tokio::spawn({
            let torrent = torrent.clone();
            async move { loader.run_seed(torrent, seed_layout, build_options).await }
        });
        torrent.track(task.abort_handle());

        Ok(torrent)
    }

    fn set_global_trackers(&self, trackers: Vec<String>) {
        *self
            .global_trackers
            .write()
            .unwrap_or_else(PoisonError::into_inner) = trackers;
    }

    fn destroy(&self) {
        let torrents = std::mem::take(&mut *self.torrents.lock().unwrap_or_else(PoisonError::into_inner));
        for torrent in torrents.iter().filter_map(Weak::upgrade) {
            torrent.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::time::{timeout, Duration};

    async fn next_kind(rx: &mut mpsc::Receiver<SwarmEvent>) -> SwarmEventKind {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for swarm event")
            .expect("event channel closed")
            .kind
    }

    fn write_album(root: &Path) -> Vec<PathBuf> {
        let album = root.join("album");
        std::fs::create_dir_all(&album).unwrap();
        let a = album.join("01.flac");
        let b = album.join("02.flac");
        std::fs::write(&a, vec![3u8; 40_000]).unwrap();
        std::fs::write(&b, vec![4u8; 10_000]).unwrap();
        vec![a, b]
    }

    #[tokio::test]
    async fn test_seed_emits_full_lifecycle() {
        let dir = tempdir().unwrap();
        let files = write_album(dir.path());
        let (tx, mut rx) = mpsc::channel(16);
        let client = OfflineClient::new(tx, dir.path().join("torrents"), 2);
        client.set_global_trackers(vec!["wss://tracker.example".to_string()]);

        let torrent = client
            .seed(SeedOptions {
                files,
                piece_length: Some(16_384),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(torrent.name().as_deref(), Some("album"));

        assert_eq!(next_kind(&mut rx).await, SwarmEventKind::InfoHash);
        assert_eq!(next_kind(&mut rx).await, SwarmEventKind::Metadata);
        assert_eq!(next_kind(&mut rx).await, SwarmEventKind::Ready);
        assert_eq!(next_kind(&mut rx).await, SwarmEventKind::Done);

        assert!(torrent.is_ready());
        assert_eq!(torrent.stats().progress, 1.0);
        assert_eq!(torrent.files().len(), 2);
        assert_eq!(torrent.files()[1].path, PathBuf::from("album").join("02.flac"));
        assert!(torrent.magnet_uri().unwrap().contains("tracker.example"));

        let data = torrent.read_file(1, 9_990, 100).await.unwrap();
        assert_eq!(&data[..], &[4u8; 10][..]);
    }

    #[tokio::test]
    async fn test_add_descriptor_verifies_partial_data() {
        let dir = tempdir().unwrap();
        let files = write_album(dir.path());
        let seed_layout = builder::layout(&files, None).unwrap();
        let descriptor = builder::build(
            &seed_layout,
            &BuildOptions {
                name: None,
                comment: None,
                announce: Vec::new(),
                private: false,
                piece_length: Some(16_384),
                creation_date: None,
            },
        )
        .unwrap();
        let bytes = serde_bencode::to_bytes(&descriptor).unwrap();

        // Damage the second file, which covers the last two pieces.
        std::fs::write(&files[1], vec![9u8; 10_000]).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let client = OfflineClient::new(tx, dir.path().join("torrents"), 1);
        let torrent = client
            .add(
                TorrentLocator::Descriptor(bytes),
                AddOptions {
                    download_path: dir.path().to_path_buf(),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(next_kind(&mut rx).await, SwarmEventKind::InfoHash);
        assert_eq!(next_kind(&mut rx).await, SwarmEventKind::Metadata);
        assert_eq!(next_kind(&mut rx).await, SwarmEventKind::Ready);

        assert_eq!(torrent.info_hash(), Some(descriptor.info_hash()));
        assert_eq!(torrent.piece_count(), 4);
        assert!(torrent.has_piece(1));
        assert!(!torrent.has_piece(3));
        assert!(torrent.stats().progress < 1.0);

        let reader = tokio::spawn({
            let torrent = torrent.clone();
            async move { torrent.read_file(1, 9_000, 100).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!reader.is_finished());

        // Repairing the data on disk lets the waiting read through.
        std::fs::write(&files[1], vec![4u8; 10_000]).unwrap();
        let data = timeout(Duration::from_secs(5), reader)
            .await
            .expect("read did not finish after the data was repaired")
            .unwrap()
            .unwrap();
        assert_eq!(&data[..], &[4u8; 100][..]);
        assert!(torrent.has_piece(2));
        assert!(!torrent.has_piece(3));
    }

    #[tokio::test]
    async fn test_waiting_read_fails_when_destroyed() {
        let dir = tempdir().unwrap();
        let files = write_album(dir.path());
        let seed_layout = builder::layout(&files, None).unwrap();
        let descriptor = builder::build(
            &seed_layout,
            &BuildOptions {
                name: None,
                comment: None,
                announce: Vec::new(),
                private: false,
                piece_length: Some(16_384),
                creation_date: None,
            },
        )
        .unwrap();
        let bytes = serde_bencode::to_bytes(&descriptor).unwrap();
        std::fs::remove_file(&files[0]).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let client = OfflineClient::new(tx, dir.path().join("torrents"), 1);
        let torrent = client
            .add(
                TorrentLocator::Descriptor(bytes),
                AddOptions {
                    download_path: dir.path().to_path_buf(),
                    ..Default::default()
                },
            )
            .unwrap();
        loop {
            if next_kind(&mut rx).await == SwarmEventKind::Ready {
                break;
            }
        }

        let reader = tokio::spawn({
            let torrent = torrent.clone();
            async move { torrent.read_file(0, 0, 100).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        torrent.destroy();
        let result = timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
        assert!(matches!(result, Err(SwarmError::Destroyed)));
    }

    #[tokio::test]
    async fn test_matching_modtimes_skip_hashing() {
        let dir = tempdir().unwrap();
        let files = write_album(dir.path());
        let seed_layout = builder::layout(&files, None).unwrap();
        let descriptor = builder::build(
            &seed_layout,
            &BuildOptions {
                name: None,
                comment: None,
                announce: Vec::new(),
                private: false,
                piece_length: Some(16_384),
                creation_date: None,
            },
        )
        .unwrap();
        let bytes = serde_bencode::to_bytes(&descriptor).unwrap();

        let mut file_modtimes = HashMap::new();
        for (index, path) in files.iter().enumerate() {
            let modtime = storage::file_modtime(path).await.unwrap().unwrap();
            file_modtimes.insert(index, modtime);
        }

        let (tx, mut rx) = mpsc::channel(16);
        let client = OfflineClient::new(tx, dir.path().join("torrents"), 1);
        let torrent = client
            .add(
                TorrentLocator::Descriptor(bytes),
                AddOptions {
                    download_path: dir.path().to_path_buf(),
                    file_modtimes,
                },
            )
            .unwrap();

        loop {
            if next_kind(&mut rx).await == SwarmEventKind::Done {
                break;
            }
        }
        assert_eq!(torrent.stats().progress, 1.0);
    }

    #[tokio::test]
    async fn test_magnet_without_cached_descriptor_warns() {
        let dir = tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let client = OfflineClient::new(tx, dir.path().to_path_buf(), 1);
        let hash = "08ada5a7a6183aae1e09d831df6748d566095a10";

        let torrent = client
            .add(
                TorrentLocator::Magnet(format!("magnet:?xt=urn:btih:{}", hash)),
                AddOptions::default(),
            )
            .unwrap();
        assert_eq!(torrent.info_hash().unwrap().to_hex(), hash);

        assert_eq!(next_kind(&mut rx).await, SwarmEventKind::InfoHash);
        assert!(matches!(next_kind(&mut rx).await, SwarmEventKind::Warning(_)));
        assert!(!torrent.is_ready());
        assert!(torrent.files().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_blocks_reads() {
        let dir = tempdir().unwrap();
        let files = write_album(dir.path());
        let (tx, mut rx) = mpsc::channel(16);
        let client = OfflineClient::new(tx, dir.path().join("torrents"), 1);
        let torrent = client
            .seed(SeedOptions {
                files,
                ..Default::default()
            })
            .unwrap();
        loop {
            if next_kind(&mut rx).await == SwarmEventKind::Done {
                break;
            }
        }

        client.destroy();
        torrent.destroy();
        assert!(!torrent.is_ready());
        assert!(matches!(
            torrent.read_file(0, 0, 10).await,
            Err(SwarmError::Destroyed)
        ));
    }
}
