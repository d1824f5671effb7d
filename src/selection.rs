// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::HostError;
use crate::swarm::SwarmTorrent;

/// Applies a per-file wanted vector to `torrent`.
///
/// `None` selects every file. A vector whose length differs from the file
/// count is rejected before anything is touched. The whole-torrent range is
/// dropped first, then unwanted file ranges, then wanted ones, so pieces
/// shared with a wanted file stay wanted. Applying the same vector twice
/// leaves the torrent in the same state.
pub fn apply_selections(
    torrent: &dyn SwarmTorrent,
    selections: Option<&[bool]>,
) -> Result<(), HostError> {
    let files = torrent.files();
    let all;
    let selections = match selections {
        Some(selections) => selections,
        None => {
            all = vec![true; files.len()];
            &all
        }
    };

    if selections.len() != files.len() {
        return Err(HostError::SelectionLength {
            got: selections.len(),
            expected: files.len(),
        });
    }

    let piece_count = torrent.piece_count();
    if piece_count > 0 {
        torrent.deselect(0, piece_count - 1);
    }

    for (file, _) in files.iter().zip(selections).filter(|(_, wanted)| !**wanted) {
        torrent.deselect(file.start_piece, file.end_piece);
    }
    for (file, _) in files.iter().zip(selections).filter(|(_, wanted)| **wanted) {
        torrent.select(file.start_piece, file.end_piece);
    }

    Ok(())
}
