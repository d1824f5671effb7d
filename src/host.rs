// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The host's single owning task.
//!
//! [`Host::run`] multiplexes controller commands, swarm events, the progress
//! tick and the progress deadline. Everything mutable (the registry, the
//! aggregator, the server slot) lives here, so none of it is locked. Slow
//! work is spawned and reports back through the response channel.

use std::collections::HashMap;
use std::future::pending;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{event, Level};

use crate::audio::{self, AudioMetadata};
use crate::command::{HostCommand, HostCommandSummary, HostResponse, ServerInfo, TorrentInfo};
use crate::config::Settings;
use crate::errors::{HostError, MediaError, SwarmError};
use crate::ipc::IpcInput;
use crate::lifecycle::{Effect, LifecycleEvent};
use crate::poster::{self, PosterSource};
use crate::progress::ProgressAggregator;
use crate::registry::{Registry, SessionKey, TorrentEntry};
use crate::selection::apply_selections;
use crate::server::{self, StreamServer};
use crate::swarm::{
    AddOptions, InfoHash, SwarmClient, SwarmEvent, SwarmEventKind, SwarmTorrent, TorrentLocator,
};

/// Process-wide collaborators handed to the host.
pub struct HostContext {
    pub client: Arc<dyn SwarmClient>,
    pub settings: Settings,
    pub poster: Arc<dyn PosterSource>,
    pub responses: mpsc::UnboundedSender<HostResponse>,
}

pub struct Host {
    ctx: HostContext,
    registry: Registry,
    aggregator: ProgressAggregator,
    server: Option<StreamServer>,
    pending_server: Option<InfoHash>,
    lan_address: IpAddr,
}

impl Host {
    pub fn new(ctx: HostContext) -> Self {
        let aggregator = ProgressAggregator::new(&ctx.settings);
        Self {
            ctx,
            registry: Registry::default(),
            aggregator,
            server: None,
            pending_server: None,
            lan_address: server::lan_address(),
        }
    }

    fn send(&self, response: HostResponse) {
        // Only fails once the writer is gone, at which point nobody is listening.
        let _ = self.ctx.responses.send(response);
    }

    fn report_error(&self, error: &HostError) {
        tracing::error!("Command failed: {}", error);
        self.send(HostResponse::UncaughtError {
            message: error.to_string(),
            stack: format!("{:?}", error),
        });
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<IpcInput>,
        mut events: mpsc::Receiver<SwarmEvent>,
    ) {
        self.send(HostResponse::IpcReady);
        event!(Level::INFO, "Host ready");

        let mut tick = interval(Duration::from_millis(self.ctx.settings.progress_tick_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.aggregator.deadline();
            let progress_due = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending().await,
                }
            };

            tokio::select! {
                input = commands.recv() => match input {
                    Some(IpcInput::Command(HostCommand::Shutdown)) | None => break,
                    Some(IpcInput::Command(command)) => self.handle_command(command).await,
                    Some(IpcInput::Malformed(message)) => {
                        tracing::error!("Malformed command: {}", message);
                        self.send(HostResponse::UncaughtError {
                            stack: String::new(),
                            message,
                        });
                    }
                },
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = tick.tick() => self.aggregator.request_update(Instant::now()),
                _ = progress_due => {
                    if let Some(snapshot) = self.aggregator.fire(&mut self.registry) {
                        self.send(HostResponse::Progress { snapshot });
                    }
                }
            }
        }

        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        event!(Level::INFO, torrents = self.registry.len(), "Host shutting down");
        self.pending_server = None;
        if let Some(server) = self.server.take() {
            server.stop();
        }
        for mut entry in self.registry.drain() {
            entry.lifecycle.on_transition(LifecycleEvent::Destroy);
            entry.handle.destroy();
        }
        self.ctx.client.destroy();
    }

    pub async fn handle_command(&mut self, command: HostCommand) {
        event!(Level::DEBUG, command = ?HostCommandSummary(&command), "Received command");
        if let Err(e) = self.dispatch(command).await {
            self.report_error(&e);
        }
    }

    async fn dispatch(&mut self, command: HostCommand) -> Result<(), HostError> {
        match command {
            HostCommand::StartTorrenting {
                key,
                locator,
                download_path,
                file_modtimes,
                selections,
            } => self.start_torrenting(key, locator, download_path, file_modtimes, selections),
            HostCommand::StopTorrenting { info_hash } => {
                self.stop_torrenting(&info_hash);
                Ok(())
            }
            HostCommand::CreateTorrent { key, options } => {
                self.ensure_unregistered(&key)?;
                let handle = self.ctx.client.seed(options)?;
                self.registry
                    .insert(TorrentEntry::new(key.clone(), handle, None))?;
                self.send(HostResponse::NewTorrent { key });
                Ok(())
            }
            HostCommand::SaveTorrentFile { key } => self.save_torrent_file(key),
            HostCommand::GeneratePoster { key } => self.generate_poster(key),
            HostCommand::GetAudioMetadata { info_hash, index } => {
                self.get_audio_metadata(info_hash, index)
            }
            HostCommand::StartServer { info_hash } => self.start_server(info_hash).await,
            HostCommand::StopServer => {
                self.stop_server();
                Ok(())
            }
            HostCommand::SelectFiles {
                info_hash,
                selections,
            } => self.select_files(&info_hash, selections),
            HostCommand::SetGlobalTrackers { trackers } => {
                self.ctx.client.set_global_trackers(trackers);
                Ok(())
            }
            HostCommand::Shutdown => {
                self.shutdown();
                Ok(())
            }
        }
    }

    fn ensure_unregistered(&self, key: &SessionKey) -> Result<(), HostError> {
        if self.registry.resolve(key).is_ok() {
            return Err(HostError::DuplicateSessionKey(key.clone()));
        }
        Ok(())
    }

    fn start_torrenting(
        &mut self,
        key: SessionKey,
        locator: TorrentLocator,
        download_path: Option<PathBuf>,
        file_modtimes: HashMap<usize, u64>,
        selections: Option<Vec<bool>>,
    ) -> Result<(), HostError> {
        self.ensure_unregistered(&key)?;
        let download_path = download_path
            .or_else(|| self.ctx.settings.default_download_folder.clone())
            .unwrap_or_else(|| PathBuf::from("."));

        let handle = self.ctx.client.add(
            locator,
            AddOptions {
                download_path,
                file_modtimes,
            },
        )?;
        event!(Level::INFO, %key, id = handle.id().0, "Torrent started");
        self.registry
            .insert(TorrentEntry::new(key, handle, selections))
    }

    pub fn stop_torrenting(&mut self, info_hash: &InfoHash) {
        let Some(mut entry) = self.registry.remove_by_hash(info_hash) else {
            event!(Level::DEBUG, %info_hash, "Stop for unknown torrent ignored");
            return;
        };
        entry.lifecycle.on_transition(LifecycleEvent::Destroy);
        entry.handle.destroy();

        if self.pending_server == Some(*info_hash) {
            self.pending_server = None;
        }
        if self
            .server
            .as_ref()
            .is_some_and(|server| server.info_hash() == *info_hash)
        {
            self.stop_server();
        }
        self.aggregator.request_update(Instant::now());
        event!(Level::INFO, key = %entry.key, %info_hash, "Torrent stopped");
    }

    fn save_torrent_file(&self, key: SessionKey) -> Result<(), HostError> {
        let handle = self.registry.resolve(&key)?;
        let info_hash = handle.info_hash().ok_or(SwarmError::MetadataUnavailable)?;
        let descriptor = handle.torrent_file().ok_or(SwarmError::MetadataUnavailable)?;
        let torrents_dir = self.ctx.settings.torrents_dir.clone();
        let responses = self.ctx.responses.clone();

        tokio::spawn(async move {
            match write_torrent_file(&torrents_dir, &info_hash, descriptor).await {
                Ok(file_name) => {
                    let _ = responses.send(HostResponse::FileSaved { key, file_name });
                }
                Err(e) => tracing::error!("Failed to save torrent file for {}: {}", info_hash, e),
            }
        });
        Ok(())
    }

    fn generate_poster(&self, key: SessionKey) -> Result<(), HostError> {
        let handle = self.registry.resolve(&key)?.clone();
        let info_hash = handle.info_hash().ok_or(SwarmError::MetadataUnavailable)?;
        let posters_dir = self.ctx.settings.posters_dir.clone();
        let source = self.ctx.poster.clone();
        let responses = self.ctx.responses.clone();

        tokio::spawn(async move {
            let result = async {
                let poster = source.poster(handle).await?;
                let file_name = poster::save_poster(&posters_dir, &info_hash, &poster).await?;
                Ok::<_, MediaError>(file_name)
            }
            .await;

            match result {
                Ok(file_name) => {
                    let _ = responses.send(HostResponse::Poster { key, file_name });
                }
                Err(e) => tracing::warn!("Failed to generate poster for {}: {}", info_hash, e),
            }
        });
        Ok(())
    }

    fn get_audio_metadata(&self, info_hash: InfoHash, index: usize) -> Result<(), HostError> {
        let handle = self.registry.resolve_hash(&info_hash)?.handle.clone();
        let files = handle.files();
        let file = files.get(index).ok_or(SwarmError::FileIndex {
            index,
            count: files.len(),
        })?;

        self.send(HostResponse::AudioMetadata {
            info_hash,
            index,
            metadata: AudioMetadata::placeholder(&file.name),
        });

        let responses = self.ctx.responses.clone();
        tokio::spawn(async move {
            match audio::read_metadata(handle, index).await {
                Ok(metadata) => {
                    let _ = responses.send(HostResponse::AudioMetadata {
                        info_hash,
                        index,
                        metadata,
                    });
                }
                Err(e) => tracing::warn!("Failed to read audio metadata of {}/{}: {}", info_hash, index, e),
            }
        });
        Ok(())
    }

    async fn start_server(&mut self, info_hash: InfoHash) -> Result<(), HostError> {
        let entry = self.registry.resolve_hash(&info_hash)?;
        if self.server.is_some() {
            return Ok(());
        }
        if !entry.handle.is_ready() {
            event!(Level::DEBUG, %info_hash, "Server start deferred until ready");
            self.pending_server = Some(info_hash);
            return Ok(());
        }

        let key = entry.key.clone();
        let handle = entry.handle.clone();
        let server =
            StreamServer::start(info_hash, handle, self.ctx.settings.server_bind_address).await?;
        let info = ServerInfo::new(key, self.lan_address, server.port());
        self.server = Some(server);
        self.pending_server = None;

        self.send(HostResponse::ServerRunning { info: info.clone() });
        self.send(HostResponse::ServerRunningFor { info_hash, info });
        Ok(())
    }

    pub fn stop_server(&mut self) {
        self.pending_server = None;
        if let Some(server) = self.server.take() {
            server.stop();
        }
    }

    fn select_files(
        &mut self,
        info_hash: &InfoHash,
        selections: Option<Vec<bool>>,
    ) -> Result<(), HostError> {
        let entry = self.registry.resolve_hash_mut(info_hash)?;
        let file_count = entry.handle.files().len();
        if let Some(ref selections) = selections {
            if file_count > 0 && selections.len() != file_count {
                return Err(HostError::SelectionLength {
                    got: selections.len(),
                    expected: file_count,
                });
            }
        }

        if entry.handle.is_ready() {
            apply_selections(entry.handle.as_ref(), selections.as_deref())?;
        }
        entry.pending_selections = selections;
        Ok(())
    }

    pub async fn handle_event(&mut self, event: SwarmEvent) {
        let Some(id) = event.torrent else {
            match event.kind {
                SwarmEventKind::Warning(message) => {
                    tracing::warn!("Swarm warning: {}", message);
                    self.send(HostResponse::Warning { key: None, message });
                }
                SwarmEventKind::Error(message) => {
                    tracing::error!("Swarm error: {}", message);
                    self.send(HostResponse::Error { key: None, message });
                }
                other => event!(Level::DEBUG, ?other, "Ignoring client-level event"),
            }
            return;
        };

        let Some(entry) = self.registry.by_torrent_id(id) else {
            event!(Level::DEBUG, id = id.0, "Event for unregistered torrent dropped");
            return;
        };
        let effects = entry.lifecycle.on_transition(event.kind.into());
        let key = entry.key.clone();
        let handle = entry.handle.clone();
        let selections = entry.pending_selections.clone();

        for effect in effects {
            self.apply_effect(effect, &key, &handle, selections.as_deref())
                .await;
        }
    }

    async fn apply_effect(
        &mut self,
        effect: Effect,
        key: &SessionKey,
        handle: &Arc<dyn SwarmTorrent>,
        selections: Option<&[bool]>,
    ) {
        match effect {
            Effect::SendWarning(message) => {
                tracing::warn!("Torrent {} warning: {}", key, message);
                self.send(HostResponse::Warning {
                    key: Some(key.clone()),
                    message,
                });
            }
            Effect::SendError(message) => {
                tracing::error!("Torrent {} error: {}", key, message);
                self.send(HostResponse::Error {
                    key: Some(key.clone()),
                    message,
                });
            }
            Effect::SendParsed => {
                if let Some(info_hash) = handle.info_hash() {
                    self.send(HostResponse::Parsed {
                        key: key.clone(),
                        info_hash,
                        magnet_uri: handle.magnet_uri(),
                    });
                }
            }
            Effect::SendMetadata => self.send(HostResponse::Metadata {
                key: key.clone(),
                info: TorrentInfo::of(handle.as_ref()),
            }),
            Effect::ApplySelections => {
                if let Err(e) = apply_selections(handle.as_ref(), selections) {
                    self.report_error(&e);
                }
            }
            Effect::SendReady => {
                let info = TorrentInfo::of(handle.as_ref());
                self.send(HostResponse::Ready {
                    key: key.clone(),
                    info: info.clone(),
                });
                if let Some(info_hash) = handle.info_hash() {
                    self.send(HostResponse::ReadyFor {
                        info_hash,
                        key: key.clone(),
                        info,
                    });
                }
            }
            Effect::StartPendingServer => {
                let Some(info_hash) = handle.info_hash() else {
                    return;
                };
                if self.pending_server == Some(info_hash) {
                    self.pending_server = None;
                    if let Err(e) = self.start_server(info_hash).await {
                        self.report_error(&e);
                    }
                }
            }
            Effect::SendDone => self.send(HostResponse::Done {
                key: key.clone(),
                info: TorrentInfo::of(handle.as_ref()),
            }),
            Effect::FetchModtimes => {
                let key = key.clone();
                let handle = handle.clone();
                let responses = self.ctx.responses.clone();
                tokio::spawn(async move {
                    match handle.file_modtimes().await {
                        Ok(modtimes) => {
                            let _ = responses.send(HostResponse::FileModtimes { key, modtimes });
                        }
                        Err(e) => tracing::warn!("Failed to read modification times for {}: {}", key, e),
                    }
                });
            }
            Effect::RequestProgress => self.aggregator.request_update(Instant::now()),
        }
    }
}

/// Writes `<torrents_dir>/<info hash>.torrent` unless it already exists and
/// returns the file name either way.
async fn write_torrent_file(
    torrents_dir: &Path,
    info_hash: &InfoHash,
    descriptor: Bytes,
) -> std::io::Result<String> {
    let file_name = format!("{}.torrent", info_hash);
    let path = torrents_dir.join(&file_name);
    if tokio::fs::try_exists(&path).await? {
        return Ok(file_name);
    }

    tokio::fs::create_dir_all(torrents_dir).await?;
    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(file_name),
        Err(e) => return Err(e),
    };
    file.write_all(&descriptor).await?;
    file.flush().await?;
    event!(Level::INFO, path = %path.display(), "Saved torrent file");
    Ok(file_name)
}
