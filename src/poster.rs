// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{event, Level};

use crate::errors::MediaError;
use crate::swarm::{InfoHash, SwarmTorrent, TorrentFile};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "m4v", "mkv", "webm", "avi", "mov", "ogv", "ts"];

/// Seconds into the video the poster frame is taken from.
const FRAME_OFFSET_SECS: &str = "5";

pub struct Poster {
    pub bytes: Vec<u8>,
    /// Including the leading dot.
    pub extension: String,
}

#[async_trait]
pub trait PosterSource: Send + Sync {
    async fn poster(&self, torrent: Arc<dyn SwarmTorrent>) -> Result<Poster, MediaError>;
}

fn extension_of(file: &TorrentFile) -> Option<String> {
    Path::new(&file.name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

fn largest_with_extension(files: &[TorrentFile], extensions: &[&str]) -> Option<(usize, TorrentFile)> {
    files
        .iter()
        .enumerate()
        .filter(|(_, file)| {
            extension_of(file).is_some_and(|ext| extensions.contains(&ext.as_str()))
        })
        .max_by_key(|(_, file)| file.length)
        .map(|(index, file)| (index, file.clone()))
}

/// Uses the largest image in the torrent as is, or grabs a frame of the
/// largest video with `ffmpeg`.
pub struct DefaultPosterSource {
    ffmpeg: PathBuf,
}

impl DefaultPosterSource {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    async fn extract_frame(&self, video: &Path) -> Result<Vec<u8>, MediaError> {
        let output = Command::new(&self.ffmpeg)
            .arg("-ss")
            .arg(FRAME_OFFSET_SECS)
            .arg("-i")
            .arg(video)
            .args(["-frames:v", "1", "-f", "image2", "-vcodec", "mjpeg", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() || output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().last().unwrap_or("no output").to_string();
            return Err(MediaError::Ffmpeg(last_line));
        }
        Ok(output.stdout)
    }
}

impl Default for DefaultPosterSource {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl PosterSource for DefaultPosterSource {
    async fn poster(&self, torrent: Arc<dyn SwarmTorrent>) -> Result<Poster, MediaError> {
        let files = torrent.files();

        if let Some((index, image)) = largest_with_extension(&files, IMAGE_EXTENSIONS) {
            let bytes = torrent.read_file(index, 0, image.length as usize).await?;
            let extension = format!(".{}", extension_of(&image).unwrap_or_default());
            return Ok(Poster {
                bytes: bytes.to_vec(),
                extension,
            });
        }

        if let Some((_, video)) = largest_with_extension(&files, VIDEO_EXTENSIONS) {
            let path = torrent.path().join(&video.path);
            event!(Level::DEBUG, path = %path.display(), "Extracting poster frame");
            let bytes = self.extract_frame(&path).await?;
            return Ok(Poster {
                bytes,
                extension: ".jpg".to_string(),
            });
        }

        Err(MediaError::NoCandidate)
    }
}

/// Writes `<posters_dir>/<info hash><extension>` and returns the file name.
pub async fn save_poster(
    posters_dir: &Path,
    info_hash: &InfoHash,
    poster: &Poster,
) -> std::io::Result<String> {
    tokio::fs::create_dir_all(posters_dir).await?;
    let file_name = format!("{}{}", info_hash, poster.extension);
    tokio::fs::write(posters_dir.join(&file_name), &poster.bytes).await?;
    Ok(file_name)
}
