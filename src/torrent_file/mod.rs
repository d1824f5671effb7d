// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod builder;
pub mod parser;

use std::path::PathBuf;

use serde::de::{self};
use serde::{Deserialize, Deserializer, Serialize};
use serde_bencode::value::Value;
use sha1::{Digest, Sha1};

use crate::swarm::InfoHash;

pub const PIECE_HASH_LEN: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Torrent {
    // Not part of the bencode source. Filled in by the parser so the info hash
    // is computed over the exact bytes we received.
    #[serde(skip)]
    pub info_dict_bencode: Vec<u8>,

    pub info: Info,
    pub announce: Option<String>,

    #[serde(rename = "announce-list", default)]
    pub announce_list: Option<Vec<Vec<String>>>,

    #[serde(
        rename = "url-list",
        default,
        deserialize_with = "deserialize_url_list"
    )]
    pub url_list: Option<Vec<String>>,

    #[serde(rename = "creation date", default)]
    pub creation_date: Option<i64>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(rename = "created by", default)]
    pub created_by: Option<String>,

    #[serde(default)]
    pub encoding: Option<String>,
}

impl Torrent {
    pub fn info_hash(&self) -> InfoHash {
        let digest = Sha1::digest(&self.info_dict_bencode);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        InfoHash(bytes)
    }

    pub fn piece_count(&self) -> u32 {
        (self.info.pieces.len() / PIECE_HASH_LEN) as u32
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8]> {
        let start = index as usize * PIECE_HASH_LEN;
        self.info.pieces.get(start..start + PIECE_HASH_LEN)
    }

    /// Every tracker url in announce order, deduplicated.
    pub fn trackers(&self) -> Vec<String> {
        let mut trackers = Vec::new();
        if let Some(ref announce) = self.announce {
            trackers.push(announce.clone());
        }
        if let Some(ref tiers) = self.announce_list {
            for url in tiers.iter().flatten() {
                if !trackers.contains(url) {
                    trackers.push(url.clone());
                }
            }
        }
        trackers
    }

    pub fn file_list(&self) -> Vec<(Vec<String>, u64)> {
        if !self.info.files.is_empty() {
            self.info
                .files
                .iter()
                .map(|f| (f.path.clone(), f.length as u64))
                .collect()
        } else {
            // Single-file torrents name the file after the torrent itself.
            vec![(vec![self.info.name.clone()], self.info.length as u64)]
        }
    }

    pub fn is_multi_file(&self) -> bool {
        !self.info.files.is_empty()
    }

    /// File paths joined from their components, relative to the folder the
    /// files are written into. With `with_root` multi-file torrents keep
    /// their name as the top directory.
    pub fn file_paths(&self, with_root: bool) -> Vec<(PathBuf, u64)> {
        self.file_list()
            .into_iter()
            .map(|(components, length)| {
                let mut path = PathBuf::new();
                if with_root && self.is_multi_file() {
                    path.push(&self.info.name);
                }
                for component in components {
                    path.push(component);
                }
                (path, length)
            })
            .collect()
    }
}

pub fn magnet_uri(info_hash: &InfoHash, name: Option<&str>, trackers: &[String]) -> String {
    let mut uri = format!("magnet:?xt=urn:btih:{}", info_hash);
    if let Some(name) = name {
        uri.push_str("&dn=");
        uri.push_str(&urlencoding::encode(name));
    }
    for tracker in trackers {
        uri.push_str("&tr=");
        uri.push_str(&urlencoding::encode(tracker));
    }
    uri
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Info {
    #[serde(rename = "piece length")]
    pub piece_length: i64,

    #[serde(with = "serde_bytes")]
    #[serde(default)]
    pub pieces: Vec<u8>,

    #[serde(default)]
    pub private: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<InfoFile>,

    pub name: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub length: i64,

    #[serde(default)]
    pub md5sum: Option<String>,
}

impl Info {
    pub fn total_length(&self) -> i64 {
        if self.length > 0 {
            return self.length;
        }
        self.files.iter().map(|f| f.length).sum()
    }
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InfoFile {
    pub length: i64,

    #[serde(default)]
    pub md5sum: Option<String>,

    pub path: Vec<String>,

    #[serde(default)]
    pub attr: Option<String>,
}

fn deserialize_url_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Value = Deserialize::deserialize(deserializer)?;

    match v {
        Value::Bytes(bytes) => {
            let s = String::from_utf8(bytes)
                .map_err(|e| de::Error::custom(format!("Invalid UTF-8 in url-list: {}", e)))?;
            Ok(Some(vec![s]))
        }
        Value::List(list) => {
            let mut urls = Vec::new();
            for item in list {
                if let Value::Bytes(bytes) = item {
                    let s = String::from_utf8(bytes).map_err(|e| {
                        de::Error::custom(format!("Invalid UTF-8 in url-list: {}", e))
                    })?;
                    urls.push(s);
                }
            }
            Ok(Some(urls))
        }
        _ => Ok(None),
    }
}
