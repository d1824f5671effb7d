// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use data_encoding::BASE64;
use magnet_url::Magnet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::SwarmError;
use crate::swarm::InfoHash;

/// Anything the controller may hand us to identify a torrent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TorrentLocator {
    Magnet(String),
    InfoHash(InfoHash),
    /// Path to a `.torrent` file.
    Path(PathBuf),
    /// Raw `.torrent` bytes, base64 on the wire.
    Descriptor(#[serde(with = "base64_bytes")] Vec<u8>),
}

pub fn magnet_info_hash(magnet_link: &str) -> Result<InfoHash, SwarmError> {
    let magnet = Magnet::new(magnet_link)
        .map_err(|e| SwarmError::InvalidLocator(format!("{:?}", e)))?;
    let hash_string = magnet
        .hash()
        .ok_or_else(|| SwarmError::InvalidLocator("Magnet link is missing info_hash".into()))?;
    InfoHash::parse(hash_string)
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "08ada5a7a6183aae1e09d831df6748d566095a10";

    #[test]
    fn test_magnet_info_hash() {
        let magnet = format!("magnet:?xt=urn:btih:{}&dn=Sintel", HASH);
        assert_eq!(magnet_info_hash(&magnet).unwrap().to_hex(), HASH);
        assert!(magnet_info_hash("magnet:?dn=nothing").is_err());
    }

    #[test]
    fn test_locator_json_shapes() {
        let json = r#"{"descriptor":"ZDRpbmZvZGVl"}"#;
        let locator: TorrentLocator = serde_json::from_str(json).unwrap();
        assert_eq!(locator, TorrentLocator::Descriptor(b"d4infodee".to_vec()));
        assert_eq!(serde_json::to_string(&locator).unwrap(), json);

        let json = format!(r#"{{"info-hash":"{}"}}"#, HASH);
        let locator: TorrentLocator = serde_json::from_str(&json).unwrap();
        assert!(matches!(locator, TorrentLocator::InfoHash(_)));
    }
}
