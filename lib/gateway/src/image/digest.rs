// SPDX-License-Identifier: Apache-2.0

//! Content digests: `algorithm:hex` syntax checks and the deterministic
//! directory hash used to content-address an unpacked root filesystem.
//!
//! The directory hash is part of the manifest rewrite contract: entries are
//! visited in sorted name order and each contributes its relative name, mode
//! and size, plus the content hash for regular files and the target for
//! symlinks, folded into one running SHA-256.

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Splits a digest into its algorithm and hex parts.
pub fn parse(digest: &str) -> Result<(&str, &str)> {
    digest
        .split_once(':')
        .ok_or_else(|| Error::InvalidArgument(format!("malformed digest: {digest}")))
}

/// Syntax check: recognized algorithm and a lowercase hex of the right length.
pub fn validate(digest: &str) -> Result<()> {
    let (algorithm, hex) = parse(digest)?;

    let expected = match algorithm {
        "sha256" => 64,
        "sha512" => 128,
        _ => {
            return Err(Error::InvalidArgument(format!(
                "unknown digest algorithm: {algorithm}"
            )))
        }
    };

    if hex.len() != expected || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(Error::InvalidArgument(format!("malformed digest: {digest}")));
    }

    Ok(())
}

/// Deterministic digest over a directory tree, rendered as `sha256:<hex>`.
pub fn hash_dir(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    hash_entries(root, root, &mut hasher)?;

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn hash_entries(root: &Path, dir: &Path, hasher: &mut Sha256) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)?;

        let relative = path
            .strip_prefix(root)
            .map_err(|err| Error::runtime(format!("walk {}: {err}", path.display())))?;

        hasher.update(relative.as_os_str().as_encoded_bytes());
        hasher.update(meta.permissions().mode().to_le_bytes());
        hasher.update(meta.len().to_le_bytes());

        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&path)?;
            hasher.update(target.as_os_str().as_encoded_bytes());
        } else if meta.is_dir() {
            hash_entries(root, &path, hasher)?;
        } else {
            hasher.update(hash_file(&path)?);
        }
    }

    Ok(())
}

fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }

        hasher.update(&buf[..read]);
    }

    Ok(hasher.finalize().into())
}
