// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Crash recovery (`load` / `loadCorrupted`).

use super::{BlockListEntry, BlockMeta, EngineState};
use crate::block_file;
use crate::error::Result;
use std::path::Path;

/// Restores `state` from the block files in `dir`. When `corrupted` is
/// set, parse errors in the journals are tolerated and the directory is
/// rescanned afterwards for orphan `<index>.jem` files, which are
/// registered as unfinalized blocks of unknown size so later finalize
/// passes can pick them apart.
pub(super) async fn load(dir: &Path, state: &mut EngineState, corrupted: bool) -> Result<i64> {
    *state = EngineState::default();
    let mut max_id: i64 = 0;

    let index_dump: Vec<(i64, u64)> = read_or_empty(
        block_file::read_finalized(&dir.join("blockindex.0")).await,
        corrupted,
    )?;
    for (id, block) in index_dump {
        max_id = max_id.max(id);
        apply_index_entry(state, id, block);
    }

    let index_journal: Vec<(i64, u64)> = read_or_empty(
        block_file::read_journal_tolerant(&dir.join("blockindex.1"), corrupted).await,
        corrupted,
    )?;
    for (id, block) in index_journal {
        max_id = max_id.max(id);
        apply_index_entry(state, id, block);
    }

    let list_dump: Vec<BlockMeta> = read_or_empty(
        block_file::read_finalized(&dir.join("blocklist.0")).await,
        corrupted,
    )?;
    for meta in list_dump {
        state.block_list.insert(meta.index, meta);
    }

    let list_journal: Vec<BlockListEntry> = read_or_empty(
        block_file::read_journal_tolerant(&dir.join("blocklist.1"), corrupted).await,
        corrupted,
    )?;
    for entry in list_journal {
        match entry {
            BlockListEntry::Meta(meta) => {
                state.block_list.insert(meta.index, meta);
            }
            BlockListEntry::Deleted { index, .. } => {
                state.block_list.remove(&index);
            }
        }
    }

    state.current_block_index = state.block_list.keys().copied().max().unwrap_or(0);
    state.last_saved_block_index = state.current_block_index;

    for meta in state.block_list.values() {
        if !meta.final_ {
            state.not_finalized.insert(meta.index);
        }
        state.defrag_candidates.insert(meta.index);
    }

    if state.current_block_index != 0 {
        let rows = super::load_block_rows(state, dir, state.current_block_index).await?;
        state.blocks.insert(state.current_block_index, Some(rows));
    }

    if corrupted {
        rescan_orphans(dir, state).await?;
    }

    Ok(max_id + 1)
}

fn apply_index_entry(state: &mut EngineState, id: i64, block: u64) {
    if block == 0 {
        state.block_index.remove(&id);
    } else {
        state.block_index.insert(id, block);
    }
}

fn read_or_empty<T>(result: Result<Vec<T>>, tolerant: bool) -> Result<Vec<T>> {
    match result {
        Ok(v) => Ok(v),
        Err(e) if tolerant => {
            log::warn!("tolerating recovery error: {e}");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// After a tolerant load, any `<index>.jem` file not already known to
/// `block_list` is an orphan: register it as an unfinalized block of
/// unknown size so a later commit can finalize or defrag it like any
/// other block.
async fn rescan_orphans(dir: &Path, state: &mut EngineState) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(_) => return Ok(()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".jem") else {
            continue;
        };
        let Ok(index) = stem.parse::<u64>() else {
            continue;
        };

        if state.block_list.contains_key(&index) {
            continue;
        }

        log::warn!("registering orphan block file: {name}");
        state.block_list.insert(index, BlockMeta::new(index));
        state.not_finalized.insert(index);
        state.defrag_candidates.insert(index);
        state.current_block_index = state.current_block_index.max(index);
    }

    state.last_saved_block_index = state.current_block_index;
    Ok(())
}
