//
// Copyright (c) 2024 Nathan Fiedler
//

//! Loads and saves the metadata document. The document is JSON under a
//! fixed gzip layer, independent of the archive compression choice, so
//! it can always be fetched without knowing how the packs were built.

use crate::config::SyncConfig;
use crate::domain::entities::Document;
use crate::domain::sources::PackSource;
use anyhow::{Context, Error};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use std::fs;
use std::io::{Read, Write};
use std::sync::Arc;

/// Basename of the metadata object, appended to the reserved prefix.
const META_BASENAME: &str = "META.json.gz";

///
/// Where the metadata document lives: `(true, spec)` for a remote
/// object, `(false, path)` for a local file. An explicit location is
/// remote iff it reads like an rclone remote spec; otherwise the
/// document sits next to the packs on the remote.
///
pub fn metadata_location(remote_path: &str, conf: &SyncConfig) -> (bool, String) {
    match conf.metadata_path {
        None => (
            true,
            store_core::remote_join(
                remote_path,
                &format!("{}{}", conf.reserved_prefix, META_BASENAME),
            ),
        ),
        Some(ref path) => (store_core::is_remote_spec(path), path.clone()),
    }
}

///
/// Repository for the per-tree metadata document.
///
pub struct MetadataRepository {
    source: Arc<dyn PackSource>,
}

impl MetadataRepository {
    pub fn new(source: Arc<dyn PackSource>) -> Self {
        Self { source }
    }

    ///
    /// Fetch and decode the document, `None` when it is absent or
    /// cannot be decoded; a first-time sync starts from nothing.
    ///
    pub fn load(&self, remote_path: &str, conf: &SyncConfig) -> Result<Option<Document>, Error> {
        let (is_remote, path) = metadata_location(remote_path, conf);
        let raw = if is_remote {
            match self.source.get_object(&path)? {
                Some(data) => data,
                None => return Ok(None),
            }
        } else {
            match fs::read(&path) {
                Ok(data) => data,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    warn!("cannot read metadata file {}: {}", path, err);
                    return Ok(None);
                }
            }
        };
        let mut decoder = GzDecoder::new(&raw[..]);
        let mut text = Vec::new();
        if let Err(err) = decoder.read_to_end(&mut text) {
            warn!("metadata at {} is not valid gzip: {}", path, err);
            return Ok(None);
        }
        match serde_json::from_slice(&text) {
            Ok(document) => Ok(Some(document)),
            Err(err) => {
                warn!("metadata at {} is not valid JSON: {}", path, err);
                Ok(None)
            }
        }
    }

    ///
    /// Encode and store the document. Failures fall back to a local
    /// temporary file with loud instructions, since losing the document
    /// means re-uploading the whole tree; only a failure of that last
    /// resort is fatal.
    ///
    pub fn save(
        &self,
        document: &Document,
        remote_path: &str,
        conf: &SyncConfig,
    ) -> Result<(), Error> {
        let text = serde_json::to_vec(document)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&text)?;
        let data = encoder.finish()?;

        let (is_remote, path) = metadata_location(remote_path, conf);
        if is_remote {
            match self.source.put_object(&path, &data) {
                Ok(()) => return Ok(()),
                Err(err) => warn!("cannot store metadata at {}: {}", path, err),
            }
        } else {
            match fs::write(&path, &data) {
                Ok(()) => return Ok(()),
                Err(err) => warn!("cannot open metadata file {} for writing: {}", path, err),
            }
        }

        let mut fallback = tempfile::NamedTempFile::new()
            .context("metadata writing failed and no temporary file could be created")?;
        warn!(
            "writing the metadata failed; trying to write to {} instead...",
            fallback.path().display()
        );
        fallback
            .write_all(&data)
            .context("metadata writing failed, including the temporary fallback")?;
        let (_file, kept) = fallback
            .keep()
            .context("metadata writing failed, including the temporary fallback")?;
        warn!(
            "success! please store the metadata file {} somewhere safe and pass it \
             with --metadata-path on subsequent runs; otherwise downloads will fail \
             and the next upload will ship the whole directory again",
            kept.display()
        );
        Ok(())
    }
}
