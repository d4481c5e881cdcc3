// Copyright (c) 2024-present, blockbase-db
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Block file I/O (component C).
//!
//! Every on-disk journal or dump (`blockindex.0/.1`, `blocklist.0/.1`,
//! `<index>.jem`) begins with a one-byte framing flag:
//!
//! | Flag | Meaning               | Body                                   |
//! |------|-----------------------|-----------------------------------------|
//! | `0`  | unfinalized journal   | comma-terminated JSON records, `[` first |
//! | `1`  | finalized plaintext   | a single JSON array                     |
//! | `2`  | finalized compressed  | raw DEFLATE bytes of the finalized JSON |
//!
//! Unfinalized files are append-only; finalized files are written to a
//! temp path and renamed atomically over the original, the same pattern
//! the teacher's `file::rewrite_atomic` uses.

use crate::error::{Error, Result};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Framing byte prefixed to every block-related file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Open append journal (flag `0`).
    Journal,
    /// Finalized, uncompressed JSON array (flag `1`).
    Finalized,
    /// Finalized, DEFLATE-compressed JSON array (flag `2`).
    FinalizedCompressed,
}

impl Frame {
    fn byte(self) -> u8 {
        match self {
            Self::Journal => b'0',
            Self::Finalized => b'1',
            Self::FinalizedCompressed => b'2',
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'0' => Ok(Self::Journal),
            b'1' => Ok(Self::Finalized),
            b'2' => Ok(Self::FinalizedCompressed),
            other => Err(Error::Corrupted(format!("unknown framing flag: {other}"))),
        }
    }
}

/// Reads the leading framing byte of a file, if it exists at all.
pub async fn peek_frame(path: &Path) -> Result<Option<Frame>> {
    match tokio::fs::File::open(path).await {
        Ok(mut file) => {
            let mut byte = [0_u8; 1];
            match file.read_exact(&mut byte).await {
                Ok(()) => Ok(Some(Frame::from_byte(byte[0])?)),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Appends one record to an unfinalized journal file, creating it with
/// the `0[` header on first write.
pub async fn append_journal_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let exists = tokio::fs::metadata(path).await.is_ok();

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    if !exists {
        file.write_all(&[Frame::Journal.byte(), b'[']).await?;
    }

    let mut encoded = serde_json::to_vec(record)?;
    encoded.push(b',');
    file.write_all(&encoded).await?;
    file.flush().await?;
    Ok(())
}

/// Reads and parses a finalized file (flag `1` or `2`).
pub async fn read_finalized<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let bytes = tokio::fs::read(path).await?;
    let Some((&flag, body)) = bytes.split_first() else {
        return Ok(Vec::new());
    };

    match Frame::from_byte(flag)? {
        Frame::Finalized => Ok(serde_json::from_slice(body)?),
        Frame::FinalizedCompressed => {
            let mut decoder = DeflateDecoder::new(body);
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed)?;
            Ok(serde_json::from_slice(&decompressed)?)
        }
        Frame::Journal => Err(Error::Corrupted(format!(
            "expected finalized file, found journal: {}",
            path.display()
        ))),
    }
}

/// Reads and parses an unfinalized journal file (flag `0`).
///
/// A well-formed journal body looks like `[rec,rec,rec,` (always a
/// trailing comma after the last complete record, since writers only
/// ever append `<record>,`). When `allow_corrupted` is set and the file
/// was truncated mid-record (e.g. by a crash), the body is rewound to
/// its last complete comma before parsing; otherwise a malformed tail
/// is a hard error.
pub async fn read_journal_tolerant<T: DeserializeOwned>(
    path: &Path,
    allow_corrupted: bool,
) -> Result<Vec<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let Some((&flag, body)) = bytes.split_first() else {
        return Ok(Vec::new());
    };
    if Frame::from_byte(flag)? != Frame::Journal {
        return Err(Error::Corrupted(format!(
            "expected journal file, found finalized: {}",
            path.display()
        )));
    }

    let Some(open) = body.first() else {
        return Ok(Vec::new());
    };
    if *open != b'[' {
        return Err(Error::Corrupted("journal missing opening bracket".into()));
    }
    let body = &body[1..];

    let closed = close_journal_body(body, allow_corrupted)?;
    if closed.len() <= 2 {
        // Just `[]`
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&closed)?)
}

/// Turns a journal body (sans leading `0[`) into a parseable JSON array
/// by handling the trailing comma, or — if corrupted — truncating to
/// the last complete record.
fn close_journal_body(body: &[u8], allow_corrupted: bool) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(b'[');

    if let Some(last_comma) = body.iter().rposition(|&b| b == b',') {
        let trailing = &body[last_comma + 1..];
        let trailing_is_whitespace = trailing.iter().all(u8::is_ascii_whitespace);

        if trailing_is_whitespace {
            out.extend_from_slice(&body[..=last_comma]);
        } else if allow_corrupted {
            log::warn!("truncating partial journal record ({} trailing bytes)", trailing.len());
            out.extend_from_slice(&body[..=last_comma]);
        } else {
            return Err(Error::Corrupted(
                "journal ends with a partial record".into(),
            ));
        }
    } else if !body.iter().all(u8::is_ascii_whitespace) {
        if allow_corrupted {
            log::warn!("journal has no complete records, treating as empty");
        } else {
            return Err(Error::Corrupted(
                "journal ends with a partial record".into(),
            ));
        }
    }

    out.push(b']');
    Ok(out)
}

/// Writes `records` as a finalized file (flag `1`, or `2` when
/// `compression_level > 0`), atomically replacing whatever was at
/// `path` before.
pub async fn write_finalized<T: Serialize>(
    path: &Path,
    records: &[T],
    compression_level: u32,
) -> Result<()> {
    let json = serde_json::to_vec(records)?;

    let mut buf = Vec::with_capacity(json.len() + 1);
    if compression_level > 0 {
        buf.push(Frame::FinalizedCompressed.byte());
        let mut encoder = DeflateEncoder::new(&mut buf, Compression::new(compression_level.min(9)));
        encoder.write_all(&json)?;
        encoder.finish()?;
    } else {
        buf.push(Frame::Finalized.byte());
        buf.extend_from_slice(&json);
    }

    rewrite_atomic(path, &buf).await
}

/// Atomically rewrites `path` with `content`: write to a sibling temp
/// file, fsync, then rename over the original.
pub async fn rewrite_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let folder = path.parent().ok_or_else(|| {
        Error::Corrupted(format!("path has no parent directory: {}", path.display()))
    })?;
    tokio::fs::create_dir_all(folder).await?;

    let content = content.to_vec();
    let folder = folder.to_path_buf();
    let final_path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut temp = tempfile::NamedTempFile::new_in(&folder)?;
        temp.write_all(&content)?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(&final_path)
            .map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))??;

    Ok(())
}

/// Block file name for `index`: zero-padded decimal, width 6 below one
/// million, 12 beyond, so directory listings sort lexicographically.
#[must_use]
pub fn block_file_name(index: u64) -> String {
    if index < 1_000_000 {
        format!("{index:06}.jem")
    } else {
        format!("{index:012}.jem")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
    struct Rec(i64, String);

    #[tokio::test]
    async fn journal_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockindex.1");

        append_journal_record(&path, &Rec(1, "a".into())).await.unwrap();
        append_journal_record(&path, &Rec(2, "b".into())).await.unwrap();

        let recs: Vec<Rec> = read_journal_tolerant(&path, false).await.unwrap();
        assert_eq!(recs, vec![Rec(1, "a".into()), Rec(2, "b".into())]);
    }

    #[tokio::test]
    async fn journal_tolerates_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockindex.1");

        append_journal_record(&path, &Rec(1, "a".into())).await.unwrap();
        append_journal_record(&path, &Rec(2, "b".into())).await.unwrap();

        // Simulate a crash mid-write: append a partial record with no
        // trailing comma.
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"{\"partial").await.unwrap();
        file.flush().await.unwrap();

        let err = read_journal_tolerant::<Rec>(&path, false).await.unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));

        let recs: Vec<Rec> = read_journal_tolerant(&path, true).await.unwrap();
        assert_eq!(recs, vec![Rec(1, "a".into()), Rec(2, "b".into())]);
    }

    #[tokio::test]
    async fn finalized_round_trip_plain_and_compressed() {
        let dir = tempfile::tempdir().unwrap();

        let plain = dir.path().join("plain.jem");
        write_finalized(&plain, &[Rec(1, "a".into()), Rec(2, "b".into())], 0)
            .await
            .unwrap();
        let recs: Vec<Rec> = read_finalized(&plain).await.unwrap();
        assert_eq!(recs, vec![Rec(1, "a".into()), Rec(2, "b".into())]);

        let compressed = dir.path().join("compressed.jem");
        write_finalized(&compressed, &[Rec(1, "a".into()), Rec(2, "b".into())], 6)
            .await
            .unwrap();
        let recs: Vec<Rec> = read_finalized(&compressed).await.unwrap();
        assert_eq!(recs, vec![Rec(1, "a".into()), Rec(2, "b".into())]);
    }

    #[test]
    fn file_name_padding() {
        assert_eq!(block_file_name(1), "000001.jem");
        assert_eq!(block_file_name(999_999), "999999.jem");
        assert_eq!(block_file_name(1_000_000), "000001000000.jem");
    }
}
