// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::StorageError;
use crate::swarm::Bitfield;
use crate::torrent_file::Torrent;

use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,            // The full path to the file on the disk.
    pub length: u64,              // The length of the file in bytes.
    pub global_start_offset: u64, // The starting offset of this file within the torrent's complete data stream.
}

/// Manages the file layout for a torrent, abstracting away the difference
/// between single and multi-file torrents.
#[derive(Debug, Clone)]
pub struct MultiFileInfo {
    pub files: Vec<FileInfo>,
    pub total_size: u64,
}

impl MultiFileInfo {
    /// Multi-file torrents live in a directory named after the torrent under
    /// `root_dir`; single-file torrents are `root_dir/<name>`.
    pub fn new(root_dir: &Path, torrent: &Torrent) -> Self {
        let base = if torrent.is_multi_file() {
            root_dir.join(&torrent.info.name)
        } else {
            root_dir.to_path_buf()
        };

        let mut files = Vec::new();
        let mut current_offset = 0;
        for (components, length) in torrent.file_list() {
            let mut full_path = base.clone();
            for component in &components {
                full_path.push(component);
            }
            files.push(FileInfo {
                path: full_path,
                length,
                global_start_offset: current_offset,
            });
            current_offset += length;
        }

        Self {
            files,
            total_size: current_offset,
        }
    }
}

pub async fn read_data_from_disk(
    multi_file_info: &MultiFileInfo,
    global_offset: u64,
    bytes_to_read: usize,
) -> Result<Vec<u8>, StorageError> {
    let mut buffer = Vec::with_capacity(bytes_to_read);
    let mut bytes_read = 0;

    if bytes_to_read == 0 {
        return Ok(buffer);
    }

    for file_info in &multi_file_info.files {
        let file_start = file_info.global_start_offset;
        let file_end = file_start + file_info.length;
        let read_start = global_offset + bytes_read as u64;

        if read_start < file_end && global_offset < file_end {
            let local_offset = read_start.saturating_sub(file_start);
            let bytes_to_read_in_this_file = std::cmp::min(
                (bytes_to_read - bytes_read) as u64,
                file_info.length - local_offset,
            ) as usize;

            if bytes_to_read_in_this_file > 0 {
                let mut file = File::open(&file_info.path).await?;
                file.seek(SeekFrom::Start(local_offset)).await?;

                let mut temp_buf = vec![0; bytes_to_read_in_this_file];
                file.read_exact(&mut temp_buf).await?;
                buffer.extend_from_slice(&temp_buf);

                bytes_read += bytes_to_read_in_this_file;
            }

            if bytes_read == bytes_to_read {
                return Ok(buffer);
            }
        }
    }

    Err(StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "Failed to read all data, offset likely out of bounds",
    )))
}

/// Hashes every piece found on disk and marks the matching ones.
///
/// Missing or short files simply leave their pieces unset.
pub async fn verify_pieces(
    multi_file_info: &MultiFileInfo,
    torrent: &Torrent,
) -> Bitfield {
    let mut bitfield = Bitfield::new(torrent.piece_count());
    for index in 0..torrent.piece_count() {
        if verify_piece(multi_file_info, torrent, index).await {
            bitfield.set(index, true);
        }
    }
    bitfield
}

/// Whether the data on disk for piece `index` matches its hash.
pub async fn verify_piece(multi_file_info: &MultiFileInfo, torrent: &Torrent, index: u32) -> bool {
    let piece_length = torrent.info.piece_length.max(1) as u64;
    let offset = index as u64 * piece_length;
    let length = piece_length.min(multi_file_info.total_size.saturating_sub(offset)) as usize;
    let Some(expected) = torrent.piece_hash(index) else {
        return false;
    };

    match read_data_from_disk(multi_file_info, offset, length).await {
        Ok(data) => Sha1::digest(&data).as_slice() == expected,
        Err(_) => false,
    }
}

/// Modification time in ms since the epoch, or `None` if the file is missing.
pub async fn file_modtime(path: &Path) -> Result<Option<u64>, StorageError> {
    match fs::metadata(path).await {
        Ok(metadata) => {
            let modified = metadata.modified()?;
            let millis = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            Ok(Some(millis))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_file::builder::hash_pieces;
    use crate::torrent_file::{Info, InfoFile};

    use tempfile::tempdir;

    fn single_file_torrent(length: i64) -> Torrent {
        Torrent {
            info: Info {
                name: "single_file.txt".to_string(),
                piece_length: 16,
                length,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn multi_file_torrent() -> Torrent {
        Torrent {
            info: Info {
                name: "multi_file_torrent".to_string(),
                piece_length: 16,
                files: vec![
                    InfoFile {
                        path: vec!["file_a.txt".to_string()],
                        length: 50,
                        ..Default::default()
                    },
                    InfoFile {
                        path: vec!["subdir".to_string(), "file_b.txt".to_string()],
                        length: 70,
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_multi_file_info_new_single() {
        let dir = tempdir().unwrap();
        let mfi = MultiFileInfo::new(dir.path(), &single_file_torrent(100));
        assert_eq!(mfi.files.len(), 1);
        assert_eq!(mfi.total_size, 100);
        assert_eq!(mfi.files[0].global_start_offset, 0);
        assert_eq!(mfi.files[0].path, dir.path().join("single_file.txt"));
    }

    #[test]
    fn test_multi_file_info_new_multi() {
        let dir = tempdir().unwrap();
        let mfi = MultiFileInfo::new(dir.path(), &multi_file_torrent());
        assert_eq!(mfi.files.len(), 2);
        assert_eq!(mfi.total_size, 120);
        assert_eq!(mfi.files[1].global_start_offset, 50);
        assert_eq!(
            mfi.files[1].path,
            dir.path()
                .join("multi_file_torrent")
                .join("subdir")
                .join("file_b.txt")
        );
    }

    #[tokio::test]
    async fn test_read_across_files() {
        let dir = tempdir().unwrap();
        let mfi = MultiFileInfo::new(dir.path(), &multi_file_torrent());
        std::fs::create_dir_all(mfi.files[1].path.parent().unwrap()).unwrap();
        std::fs::write(&mfi.files[0].path, (0..50).collect::<Vec<u8>>()).unwrap();
        std::fs::write(&mfi.files[1].path, (50..120).collect::<Vec<u8>>()).unwrap();

        let data = read_data_from_disk(&mfi, 40, 30).await.unwrap();
        assert_eq!(data, (40..70).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_read_out_of_bounds() {
        let dir = tempdir().unwrap();
        let mfi = MultiFileInfo::new(dir.path(), &single_file_torrent(100));
        std::fs::write(&mfi.files[0].path, vec![7u8; 100]).unwrap();

        let res = read_data_from_disk(&mfi, 95, 10).await;
        if let Err(StorageError::Io(err)) = res {
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        } else {
            panic!("Expected Io Error");
        }

        let res_ok = read_data_from_disk(&mfi, 90, 10).await.unwrap();
        assert_eq!(res_ok.len(), 10);
    }

    #[tokio::test]
    async fn test_verify_pieces_marks_only_matching_data() {
        let dir = tempdir().unwrap();
        let mut torrent = multi_file_torrent();
        let mfi = MultiFileInfo::new(dir.path(), &torrent);
        std::fs::create_dir_all(mfi.files[1].path.parent().unwrap()).unwrap();
        std::fs::write(&mfi.files[0].path, vec![1u8; 50]).unwrap();
        std::fs::write(&mfi.files[1].path, vec![2u8; 70]).unwrap();

        torrent.info.pieces = hash_pieces(
            mfi.files.iter().map(|f| f.path.as_path()),
            16,
        )
        .unwrap();
        assert_eq!(torrent.piece_count(), 8);

        // Corrupt the second file's tail; pieces 7 (and only 7) must fail.
        std::fs::write(&mfi.files[1].path, {
            let mut data = vec![2u8; 70];
            data[69] = 9;
            data
        })
        .unwrap();

        let bitfield = verify_pieces(&mfi, &torrent).await;
        assert!((0..7).all(|i| bitfield.get(i)));
        assert!(verify_piece(&mfi, &torrent, 6).await);
        assert!(!bitfield.get(7));
    }

    #[tokio::test]
    async fn test_missing_file_has_no_modtime() {
        let dir = tempdir().unwrap();
        assert_eq!(file_modtime(&dir.path().join("nope")).await.unwrap(), None);

        let path = dir.path().join("here");
        std::fs::write(&path, b"x").unwrap();
        assert!(file_modtime(&path).await.unwrap().is_some());
    }
}
