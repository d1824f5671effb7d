// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The networked swarm client, backed by a `librqbit` session.
//!
//! librqbit owns peers, trackers, DHT and disk writes. This module keeps the
//! host's view of each torrent (file table, piece selection, lifecycle
//! events) in step with the session.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use librqbit::api::{Api, TorrentIdOrHash};
use librqbit::dht::Id20;
use librqbit::{
    AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session,
    SessionOptions, TorrentStatsState,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::AbortHandle;
use tracing::{event, Level};

use crate::errors::SwarmError;
use crate::storage;
use crate::swarm::locator::magnet_info_hash;
use crate::swarm::{
    AddOptions, Bitfield, InfoHash, SeedOptions, SelectionSet, SwarmClient, SwarmEvent,
    SwarmEventKind, SwarmTorrent, TorrentFile, TorrentId, TorrentLocator, TorrentStats,
};
use crate::torrent_file::builder::{self, BuildOptions};
use crate::torrent_file::{self, parser, Torrent};

/// Mirrors librqbit's crate-private `ManagedTorrentHandle` alias.
type ManagedTorrentHandle = Arc<ManagedTorrent>;

const STATE_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// How long a derived piece map is trusted before stats are read again.
const PIECE_MAP_TTL: Duration = Duration::from_millis(250);

fn engine_error(e: impl std::fmt::Display) -> SwarmError {
    SwarmError::Engine(format!("{:#}", e))
}

/// Piece presence derived from librqbit's per-file byte counts.
///
/// Each file's verified bytes are taken as a prefix of the file. A piece is
/// present when every file it overlaps covers it.
pub fn pieces_from_file_progress(
    files: &[TorrentFile],
    file_progress: &[u64],
    piece_length: u64,
    piece_count: u32,
) -> Bitfield {
    let piece_length = piece_length.max(1);
    let total: u64 = files.iter().map(|f| f.length).sum();
    let mut bitfield = Bitfield::new(piece_count);

    for piece in 0..piece_count {
        let start = piece as u64 * piece_length;
        let end = (start + piece_length).min(total);
        let covered = files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.length > 0 && f.offset < end && f.offset + f.length > start)
            .all(|(i, f)| {
                let have = file_progress.get(i).copied().unwrap_or(0).min(f.length);
                end.min(f.offset + f.length) <= f.offset + have
            });
        if covered && start < end {
            bitfield.set(piece, true);
        }
    }
    bitfield
}

/// librqbit selects whole files: a file is wanted while all of its pieces are.
pub fn wanted_files(files: &[TorrentFile], selection: &SelectionSet) -> HashSet<usize> {
    files
        .iter()
        .enumerate()
        .filter(|(_, f)| (f.start_piece..=f.end_piece).all(|p| selection.is_wanted(p)))
        .map(|(i, _)| i)
        .collect()
}

#[derive(Default)]
struct State {
    info_hash: Option<InfoHash>,
    magnet: Option<String>,
    name: Option<String>,
    trackers: Vec<String>,
    descriptor: Option<Bytes>,
    piece_length: u64,
    piece_count: u32,
    files: Vec<TorrentFile>,
    selection: SelectionSet,
    ready: bool,
    destroyed: bool,
}

/// The session's id for a torrent together with its handle.
#[derive(Clone)]
struct Attached {
    id: usize,
    handle: ManagedTorrentHandle,
}

pub struct RqbitTorrent {
    id: TorrentId,
    download_path: PathBuf,
    session: Arc<Session>,
    api: Api,
    attached: RwLock<Option<Attached>>,
    attached_notify: Notify,
    state: RwLock<State>,
    pieces: Mutex<Option<(Instant, Bitfield)>>,
    wanted: watch::Sender<Option<HashSet<usize>>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl RqbitTorrent {
    fn new(id: TorrentId, download_path: PathBuf, session: Arc<Session>, api: Api) -> Self {
        let (wanted, _) = watch::channel(None);
        Self {
            id,
            download_path,
            session,
            api,
            attached: RwLock::new(None),
            attached_notify: Notify::new(),
            state: RwLock::new(State::default()),
            pieces: Mutex::new(None),
            wanted,
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

    fn attached(&self) -> Option<Attached> {
        self.attached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn attach(&self, id: usize, handle: ManagedTorrentHandle) {
        *self.attached.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Attached { id, handle });
        self.attached_notify.notify_waiters();
    }

    async fn wait_attached(&self) -> Result<Attached, SwarmError> {
        loop {
            let notified = self.attached_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_destroyed() {
                return Err(SwarmError::Destroyed);
            }
            if let Some(attached) = self.attached() {
                return Ok(attached);
            }
            notified.await;
        }
    }

    fn set_metadata(&self, torrent: &Torrent, descriptor: Bytes) {
        let piece_length = torrent.info.piece_length.max(1) as u64;
        // librqbit writes the files straight into the output folder.
        let files = torrent.file_paths(false);

        let mut state = self.write_state();
        state.info_hash = Some(torrent.info_hash());
        state.name = Some(torrent.info.name.clone());
        if state.trackers.is_empty() {
            state.trackers = torrent.trackers();
        }
        state.descriptor = Some(descriptor);
        state.piece_length = piece_length;
        state.piece_count = torrent.piece_count();
        state.files = TorrentFile::layout(&files, piece_length);
        state.selection = SelectionSet::everything(torrent.piece_count());
    }

    fn publish_selection(&self) {
        let wanted = {
            let state = self.read_state();
            wanted_files(&state.files, &state.selection)
        };
        self.wanted.send_replace(Some(wanted));
    }

    fn piece_map(&self) -> Bitfield {
        let mut cached = self.pieces.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((at, bitfield)) = cached.as_ref() {
            if at.elapsed() < PIECE_MAP_TTL {
                return bitfield.clone();
            }
        }

        let (files, piece_length, piece_count) = {
            let state = self.read_state();
            (state.files.clone(), state.piece_length, state.piece_count)
        };
        let bitfield = match self.attached() {
            Some(attached) => {
                let stats = attached.handle.stats();
                pieces_from_file_progress(&files, &stats.file_progress, piece_length, piece_count)
            }
            None => Bitfield::new(piece_count),
        };
        *cached = Some((Instant::now(), bitfield.clone()));
        bitfield
    }
}

#[async_trait]
impl SwarmTorrent for RqbitTorrent {
    fn id(&self) -> TorrentId {
        self.id
    }

    fn info_hash(&self) -> Option<InfoHash> {
        self.read_state().info_hash
    }

    fn magnet_uri(&self) -> Option<String> {
        let state = self.read_state();
        if let Some(magnet) = &state.magnet {
            return Some(magnet.clone());
        }
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
        self.read_state().piece_count
    }

    fn has_piece(&self, index: u32) -> bool {
        self.piece_map().get(index)
    }

    fn stats(&self) -> TorrentStats {
        let Some(attached) = self.attached() else {
            return TorrentStats::default();
        };
        let stats = attached.handle.stats();
        let progress = if stats.total_bytes == 0 {
            if stats.finished {
                1.0
            } else {
                0.0
            }
        } else {
            stats.progress_bytes as f64 / stats.total_bytes as f64
        };
        let (download_speed, upload_speed, num_peers) = stats
            .live
            .as_ref()
            .map(|live| {
                (
                    (live.download_speed.mbps * 1024.0 * 1024.0) as u64,
                    (live.upload_speed.mbps * 1024.0 * 1024.0) as u64,
                    live.snapshot.peer_stats.live as usize,
                )
            })
            .unwrap_or_default();

        TorrentStats {
            progress,
            downloaded: stats.progress_bytes,
            received: stats.progress_bytes,
            download_speed,
            upload_speed,
            num_peers,
            length: stats.total_bytes,
        }
    }

    fn select(&self, start_piece: u32, end_piece: u32) {
        self.write_state().selection.select(start_piece, end_piece);
        self.publish_selection();
    }

    fn deselect(&self, start_piece: u32, end_piece: u32) {
        self.write_state().selection.deselect(start_piece, end_piece);
        self.publish_selection();
    }

    fn torrent_file(&self) -> Option<Bytes> {
        self.read_state().descriptor.clone()
    }

    async fn file_modtimes(&self) -> Result<Vec<Option<u64>>, SwarmError> {
        let files = self.files();
        if files.is_empty() {
            return Err(SwarmError::MetadataUnavailable);
        }
        let mut modtimes = Vec::with_capacity(files.len());
        for file in &files {
            modtimes.push(storage::file_modtime(&self.download_path.join(&file.path)).await?);
        }
        Ok(modtimes)
    }

    async fn read_file(
        &self,
        file_index: usize,
        offset: u64,
        length: usize,
    ) -> Result<Bytes, SwarmError> {
        let attached = self.wait_attached().await?;
        let file_length = {
            let state = self.read_state();
            let file = state.files.get(file_index).ok_or(SwarmError::FileIndex {
                index: file_index,
                count: state.files.len(),
            })?;
            file.length
        };
        let length = (length as u64).min(file_length.saturating_sub(offset));
        if length == 0 {
            return Ok(Bytes::new());
        }

        // The file stream raises the priority of the pieces under its cursor
        // and blocks until they are downloaded.
        let mut stream = self
            .api
            .api_stream(TorrentIdOrHash::Id(attached.id), file_index)
            .map_err(engine_error)?;
        stream.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = Vec::with_capacity(length as usize);
        stream.take(length).read_to_end(&mut buffer).await?;
        Ok(Bytes::from(buffer))
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
        self.attached_notify.notify_waiters();

        if let Some(attached) = self.attached() {
            let session = self.session.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    // Downloaded data stays on disk.
                    if let Err(e) = session.delete(TorrentIdOrHash::Id(attached.id), false).await {
                        event!(Level::WARN, "Failed to remove torrent from session: {:#}", e);
                    }
                });
            }
        }
        event!(Level::DEBUG, id = self.id.0, "Torrent destroyed");
    }
}

/// What to hand the session once the add task runs.
enum Request {
    Url(String),
    Descriptor(Bytes),
    File(PathBuf),
}

#[derive(Clone)]
struct Driver {
    session: Arc<Session>,
    api: Api,
    events: mpsc::Sender<SwarmEvent>,
}

impl Driver {
    async fn emit(&self, torrent: &RqbitTorrent, kind: SwarmEventKind) {
        if torrent.is_destroyed() {
            return;
        }
        let _ = self.events.send(SwarmEvent::torrent(torrent.id, kind)).await;
    }

    async fn run_add(&self, torrent: Arc<RqbitTorrent>, request: Request, known_hash: bool) {
        if known_hash {
            self.emit(&torrent, SwarmEventKind::InfoHash).await;
        }

        let add = match request {
            Request::Url(url) => AddTorrent::from_url(url),
            Request::Descriptor(bytes) => AddTorrent::from_bytes(bytes),
            Request::File(path) => match tokio::fs::read(&path).await {
                Ok(bytes) => AddTorrent::from_bytes(bytes),
                Err(e) => {
                    self.emit(&torrent, SwarmEventKind::Error(e.to_string())).await;
                    return;
                }
            },
        };
        let options = AddTorrentOptions {
            output_folder: Some(torrent.download_path.to_string_lossy().into_owned()),
            overwrite: true,
            ..Default::default()
        };

        // Resolving a magnet waits for peers to send the info dictionary.
        let (id, handle) = match self.session.add_torrent(add, Some(options)).await {
            Ok(AddTorrentResponse::Added(id, handle))
            | Ok(AddTorrentResponse::AlreadyManaged(id, handle)) => (id, handle),
            Ok(AddTorrentResponse::ListOnly(_)) => {
                self.emit(
                    &torrent,
                    SwarmEventKind::Error("session answered a list-only request".into()),
                )
                .await;
                return;
            }
            Err(e) => {
                self.emit(&torrent, SwarmEventKind::Error(format!("{:#}", e))).await;
                return;
            }
        };
        event!(Level::INFO, id = torrent.id.0, session_id = id, name = ?handle.name(), "Torrent added to session");

        if let Err(e) = self.load_metadata(&torrent, &handle) {
            self.emit(&torrent, SwarmEventKind::Error(e.to_string())).await;
            return;
        }
        torrent.attach(id, handle.clone());
        if !known_hash {
            self.emit(&torrent, SwarmEventKind::InfoHash).await;
        }
        self.emit(&torrent, SwarmEventKind::Metadata).await;
        self.follow(&torrent, id, handle).await;
    }

    fn load_metadata(
        &self,
        torrent: &RqbitTorrent,
        handle: &ManagedTorrentHandle,
    ) -> Result<(), SwarmError> {
        let bytes = handle
            .metadata
            .load()
            .as_ref()
            .map(|meta| meta.torrent_bytes.clone())
            .ok_or(SwarmError::MetadataUnavailable)?;
        let descriptor = parser::from_bytes(&bytes)?;
        torrent.set_metadata(&descriptor, bytes);
        Ok(())
    }

    /// Waits for the session to finish checking the torrent, then for it to
    /// complete. Selection changes are applied while this runs.
    async fn follow(&self, torrent: &Arc<RqbitTorrent>, id: usize, handle: ManagedTorrentHandle) {
        let selection = tokio::spawn({
            let driver = self.clone();
            let wanted = torrent.wanted.subscribe();
            async move { driver.apply_selections(id, wanted).await }
        });
        torrent.track(selection.abort_handle());

        let mut poll = tokio::time::interval(STATE_POLL_INTERVAL);
        loop {
            poll.tick().await;
            if torrent.is_destroyed() {
                return;
            }
            let stats = handle.stats();
            match stats.state {
                TorrentStatsState::Initializing => continue,
                TorrentStatsState::Live | TorrentStatsState::Paused => break,
                TorrentStatsState::Error => {
                    let message = stats.error.unwrap_or_else(|| "torrent failed".to_string());
                    self.emit(torrent, SwarmEventKind::Error(message)).await;
                    return;
                }
            }
        }

        {
            let mut state = torrent.write_state();
            state.ready = !state.destroyed;
        }
        self.emit(torrent, SwarmEventKind::Ready).await;

        match handle.wait_until_completed().await {
            Ok(()) => self.emit(torrent, SwarmEventKind::Done).await,
            Err(e) => self.emit(torrent, SwarmEventKind::Error(format!("{:#}", e))).await,
        }
    }

    async fn apply_selections(&self, id: usize, mut wanted: watch::Receiver<Option<HashSet<usize>>>) {
        while wanted.changed().await.is_ok() {
            let Some(files) = wanted.borrow_and_update().clone() else {
                continue;
            };
            let result = if files.is_empty() {
                self.api
                    .api_torrent_action_pause(TorrentIdOrHash::Id(id))
                    .await
                    .map(|_| ())
            } else {
                match self
                    .api
                    .api_torrent_action_update_only_files(TorrentIdOrHash::Id(id), &files)
                    .await
                {
                    Ok(_) => self
                        .api
                        .api_torrent_action_start(TorrentIdOrHash::Id(id))
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                }
            };
            // Pausing a paused torrent or starting a live one is refused; both are harmless.
            if let Err(e) = result {
                event!(Level::DEBUG, session_id = id, "Selection update: {:#}", e);
            }
        }
    }

    async fn run_seed(
        &self,
        torrent: Arc<RqbitTorrent>,
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
        let bytes = Bytes::from(bytes);
        torrent.set_metadata(&descriptor, bytes.clone());
        event!(Level::INFO, info_hash = %descriptor.info_hash(), "Seeding created torrent");

        // The session hashes the files already in place and starts seeding.
        self.run_add(torrent, Request::Descriptor(bytes), true).await;
    }
}

pub struct RqbitClient {
    driver: Driver,
    next_id: AtomicU64,
    global_trackers: RwLock<Vec<String>>,
    torrents: Mutex<Vec<Weak<RqbitTorrent>>>,
}

impl RqbitClient {
    /// Starts a session that downloads into `download_dir` unless told
    /// otherwise, announcing itself as `client_id`.
    pub async fn new(
        events: mpsc::Sender<SwarmEvent>,
        download_dir: PathBuf,
        client_id: &str,
    ) -> Result<Self, SwarmError> {
        tokio::fs::create_dir_all(&download_dir).await?;
        let options = SessionOptions {
            peer_id: peer_id(client_id).map(Id20::new),
            ..Default::default()
        };
        let session = Session::new_with_opts(download_dir, options)
            .await
            .map_err(engine_error)?;
        let api = Api::new(session.clone(), None);

        Ok(Self {
            driver: Driver {
                session,
                api,
                events,
            },
            next_id: AtomicU64::new(1),
            global_trackers: RwLock::new(Vec::new()),
            torrents: Mutex::new(Vec::new()),
        })
    }

    fn register(&self, download_path: PathBuf) -> Arc<RqbitTorrent> {
        let id = TorrentId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let torrent = Arc::new(RqbitTorrent::new(
            id,
            download_path,
            self.driver.session.clone(),
            self.driver.api.clone(),
        ));
        let mut torrents = self.torrents.lock().unwrap_or_else(PoisonError::into_inner);
        torrents.retain(|t| t.strong_count() > 0);
        torrents.push(Arc::downgrade(&torrent));
        torrent
    }
}

/// The 20 byte peer id, if `client_id` is one.
pub fn peer_id(client_id: &str) -> Option<[u8; 20]> {
    client_id.as_bytes().try_into().ok()
}

impl SwarmClient for RqbitClient {
    fn add(
        &self,
        locator: TorrentLocator,
        options: AddOptions,
    ) -> Result<Arc<dyn SwarmTorrent>, SwarmError> {
        let (request, info_hash, magnet) = match locator {
            TorrentLocator::Magnet(uri) => {
                let info_hash = magnet_info_hash(&uri)?;
                (Request::Url(uri.clone()), Some(info_hash), Some(uri))
            }
            TorrentLocator::InfoHash(info_hash) => {
                let uri = torrent_file::magnet_uri(&info_hash, None, &[]);
                (Request::Url(uri.clone()), Some(info_hash), Some(uri))
            }
            TorrentLocator::Path(path) => (Request::File(path), None, None),
            TorrentLocator::Descriptor(bytes) => {
                let descriptor = parser::from_bytes(&bytes)?;
                (Request::Descriptor(Bytes::from(bytes)), Some(descriptor.info_hash()), None)
            }
        };

        let torrent = self.register(options.download_path.clone());
        {
            let mut state = torrent.write_state();
            state.info_hash = info_hash;
            state.magnet = magnet;
        }
        event!(Level::INFO, id = torrent.id.0, path = %options.download_path.display(), "Adding torrent");

        let driver = self.driver.clone();
        let task = tokio::spawn({
            let torrent = torrent.clone();
            async move { driver.run_add(torrent, request, info_hash.is_some()).await }
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

        // Multi-file torrents are written into a folder named after them.
        let output = if seed_layout.multi_file {
            seed_layout.download_path.join(&seed_layout.name)
        } else {
            seed_layout.download_path.clone()
        };
        let torrent = self.register(output);
        torrent.write_state().name = Some(seed_layout.name.clone());
        event!(Level::INFO, id = torrent.id.0, name = %seed_layout.name, "Creating torrent");

        let driver = self.driver.clone();
        let task = tokio::spawn({
            let torrent = torrent.clone();
            async move { driver.run_seed(torrent, seed_layout, build_options).await }
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
