// SPDX-License-Identifier: Apache-2.0

//! Service image unpacker.
//!
//! Extracts a downloaded service archive into a fresh directory under the
//! image store, validates every digest the manifest references, then
//! content-addresses the root filesystem: layer 0 is unpacked, hashed with
//! the deterministic directory digest, renamed to its digest hex, and the
//! manifest is rewritten to point at the new digest.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::image::digest;

const MANIFEST_FILE: &str = "manifest.json";
const BLOBS_DIR: &str = "blobs";
const TMP_ROOTFS_DIR: &str = "tmprootfs";
const SERVICE_CONTENT_TYPE: &str = "service";

#[derive(Debug, Deserialize)]
struct Descriptor {
    digest: String,
}

#[derive(Debug, Deserialize)]
struct ServiceManifest {
    config: Descriptor,
    layers: Vec<Descriptor>,
    #[serde(default, rename = "aosService", alias = "aos-service")]
    service_descriptor: Option<Descriptor>,
}

pub struct ImageUnpacker {
    store_dir: PathBuf,
}

impl ImageUnpacker {
    pub fn new(store_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(store_dir).map_err(|err| {
            Error::runtime(format!(
                "create image store {}: {err}",
                store_dir.display()
            ))
        })?;

        Ok(Self {
            store_dir: store_dir.to_owned(),
        })
    }

    /// Unpacks `archive` and returns the prepared image directory.
    pub async fn unpack(&self, archive: &Path, content_type: &str) -> Result<PathBuf> {
        debug!(
            archive = %archive.display(),
            content_type,
            "unpacking archive"
        );

        if content_type != SERVICE_CONTENT_TYPE {
            return Err(Error::InvalidArgument(format!(
                "unsupported content type: {content_type}"
            )));
        }

        let archive = archive.to_owned();
        let store = self.store_dir.clone();

        tokio::task::spawn_blocking(move || unpack_service(&archive, &store))
            .await
            .map_err(|err| Error::runtime(format!("unpack task: {err}")))?
    }
}

fn unpack_service(archive: &Path, store: &Path) -> Result<PathBuf> {
    let image_dir = tempfile::Builder::new()
        .prefix("image-")
        .tempdir_in(store)
        .map_err(Error::from)?
        .keep();

    extract_archive(archive, &image_dir)?;

    let manifest_path = image_dir.join(MANIFEST_FILE);
    let manifest = read_manifest(&manifest_path)?;

    validate_image(&image_dir, &manifest)?;

    let rootfs_digest = prepare_rootfs(&image_dir, &manifest)?;
    update_manifest(&manifest_path, &rootfs_digest)?;

    debug!(image = %image_dir.display(), "service image unpacked");

    Ok(image_dir)
}

fn read_manifest(path: &Path) -> Result<ServiceManifest> {
    let file = File::open(path)
        .map_err(|err| Error::NotFound(format!("manifest {}: {err}", path.display())))?;

    let manifest = serde_json::from_reader(BufReader::new(file))?;

    Ok(manifest)
}

fn validate_image(image_dir: &Path, manifest: &ServiceManifest) -> Result<()> {
    debug!(image = %image_dir.display(), "validating image");

    digest::validate(&manifest.config.digest)?;

    if let Some(service) = &manifest.service_descriptor {
        digest::validate(&service.digest)?;

        // The descriptor must point at well-formed JSON.
        let path = blob_path(image_dir, &service.digest)?;
        let file = File::open(&path)
            .map_err(|err| Error::NotFound(format!("{}: {err}", path.display())))?;
        let _: serde_json::Value = serde_json::from_reader(BufReader::new(file))?;
    }

    let layer = first_layer(manifest)?;
    let rootfs = blob_path(image_dir, &layer.digest)?;

    if !rootfs.exists() {
        return Err(Error::NotFound(format!("rootfs {}", rootfs.display())));
    }

    if rootfs.is_dir() {
        if digest::hash_dir(&rootfs)? != layer.digest {
            return Err(Error::runtime("rootfs digest mismatch"));
        }
    } else {
        digest::validate(&layer.digest)?;
    }

    Ok(())
}

fn prepare_rootfs(image_dir: &Path, manifest: &ServiceManifest) -> Result<String> {
    debug!(image = %image_dir.display(), "preparing root filesystem");

    let layer = first_layer(manifest)?;
    let blob = blob_path(image_dir, &layer.digest)?;

    let tmp_rootfs = image_dir.join(TMP_ROOTFS_DIR);
    std::fs::create_dir_all(&tmp_rootfs)?;

    extract_archive(&blob, &tmp_rootfs)?;
    std::fs::remove_file(&blob)?;

    let rootfs_digest = digest::hash_dir(&tmp_rootfs)?;
    let (_, hex) = digest::parse(&rootfs_digest)?;

    let target = blob
        .parent()
        .ok_or_else(|| Error::runtime("rootfs blob has no parent"))?
        .join(hex);
    std::fs::rename(&tmp_rootfs, &target)?;

    Ok(rootfs_digest)
}

/// Rewrites only the first layer digest, preserving the rest of the manifest.
fn update_manifest(path: &Path, rootfs_digest: &str) -> Result<()> {
    debug!(manifest = %path.display(), "updating manifest");

    let raw = std::fs::read(path)?;
    let mut value: serde_json::Value = serde_json::from_slice(&raw)?;

    let layer = value
        .get_mut("layers")
        .and_then(|layers| layers.get_mut(0))
        .and_then(|layer| layer.as_object_mut())
        .ok_or_else(|| Error::runtime("manifest has no layers"))?;

    layer.insert(
        "digest".to_owned(),
        serde_json::Value::String(rootfs_digest.to_owned()),
    );

    std::fs::write(path, serde_json::to_vec_pretty(&value)?)?;

    Ok(())
}

fn first_layer(manifest: &ServiceManifest) -> Result<&Descriptor> {
    manifest
        .layers
        .first()
        .ok_or_else(|| Error::InvalidArgument("manifest has no layers".to_owned()))
}

fn blob_path(image_dir: &Path, raw: &str) -> Result<PathBuf> {
    let (algorithm, hex) = digest::parse(raw)?;

    Ok(image_dir.join(BLOBS_DIR).join(algorithm).join(hex))
}

/// Plain or gzip-compressed tar, detected by magic bytes.
fn extract_archive(archive: &Path, dst: &Path) -> Result<()> {
    let mut file = File::open(archive)
        .map_err(|err| Error::NotFound(format!("archive {}: {err}", archive.display())))?;

    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    if read == 2 && magic == [0x1f, 0x8b] {
        tar::Archive::new(GzDecoder::new(BufReader::new(file))).unpack(dst)?;
    } else {
        tar::Archive::new(BufReader::new(file)).unpack(dst)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_service_content_is_rejected() {
        let store = tempfile::tempdir().unwrap();
        let unpacker = ImageUnpacker::new(store.path()).unwrap();

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let err = runtime
            .block_on(unpacker.unpack(Path::new("/tmp/whatever.tar"), "layer"))
            .unwrap_err();

        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn manifest_without_layers_is_invalid() {
        let manifest = ServiceManifest {
            config: Descriptor {
                digest: format!("sha256:{}", "a".repeat(64)),
            },
            layers: Vec::new(),
            service_descriptor: None,
        };

        let dir = tempfile::tempdir().unwrap();
        let err = validate_image(dir.path(), &manifest).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn manifest_rewrite_touches_only_the_layer_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);

        std::fs::write(
            &path,
            format!(
                r#"{{
                    "schemaVersion": 2,
                    "config": {{"digest": "sha256:{cfg}"}},
                    "layers": [{{"digest": "sha256:{layer}", "mediaType": "tar"}}]
                }}"#,
                cfg = "b".repeat(64),
                layer = "c".repeat(64),
            ),
        )
        .unwrap();

        let new_digest = format!("sha256:{}", "d".repeat(64));
        update_manifest(&path, &new_digest).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();

        assert_eq!(value["layers"][0]["digest"], new_digest.as_str());
        assert_eq!(value["layers"][0]["mediaType"], "tar");
        assert_eq!(value["schemaVersion"], 2);
        assert_eq!(
            value["config"]["digest"],
            format!("sha256:{}", "b".repeat(64)).as_str()
        );
    }
}
