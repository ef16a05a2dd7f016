// SPDX-License-Identifier: Apache-2.0

//! Splits an unpacked image into fixed-size delivery parts.

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// Size of one delivery part; the last part of a file may be shorter.
pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct ImageFileInfo {
    pub relative_path: String,
    pub sha256: Vec<u8>,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ImageContentPart {
    pub request_id: u64,
    pub relative_path: String,
    pub parts_count: u64,
    /// 1-based, strictly ascending per file.
    pub part: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ContentInfo {
    pub request_id: u64,
    pub image_files: Vec<ImageFileInfo>,
    pub image_contents: Vec<ImageContentPart>,
}

/// Walks `root` and produces per-file metadata plus `ceil(size / 1024)`
/// parts per regular file, in deterministic directory order.
pub fn chunk_files(root: &Path, request_id: u64) -> Result<ContentInfo> {
    debug!(root = %root.display(), request_id, "chunking files");

    let mut info = ContentInfo {
        request_id,
        ..Default::default()
    };

    walk(root, root, request_id, &mut info)?;

    Ok(info)
}

fn walk(root: &Path, dir: &Path, request_id: u64, info: &mut ContentInfo) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();

        if path.is_dir() {
            walk(root, &path, request_id, info)?;
        } else if path.is_file() {
            let (file, parts) = chunk_file(root, &path, request_id)?;
            info.image_files.push(file);
            info.image_contents.extend(parts);
        }
    }

    Ok(())
}

fn chunk_file(
    root: &Path,
    path: &Path,
    request_id: u64,
) -> Result<(ImageFileInfo, Vec<ImageContentPart>)> {
    let data = std::fs::read(path)?;

    let relative_path = path
        .strip_prefix(root)
        .map_err(|err| Error::runtime(format!("walk {}: {err}", path.display())))?
        .to_string_lossy()
        .into_owned();

    let size = data.len() as u64;
    let parts_count = size.div_ceil(CHUNK_SIZE as u64);

    let parts = data
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(index, chunk)| ImageContentPart {
            request_id,
            relative_path: relative_path.clone(),
            parts_count,
            part: index as u64 + 1,
            data: chunk.to_vec(),
        })
        .collect();

    let file = ImageFileInfo {
        relative_path,
        sha256: Sha256::digest(&data).to_vec(),
        size,
    };

    Ok((file, parts))
}
