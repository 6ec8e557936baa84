//
// Copyright (c) 2024 Nathan Fiedler
//

//! Implementation of the transport contract backed by the rclone pack
//! store.

use crate::config::SyncConfig;
use crate::domain::sources::PackSource;
use anyhow::Error;
use std::path::{Path, PathBuf};
use store_rclone::RcloneStore;

///
/// A `PackSource` that delegates to [`store_rclone::RcloneStore`],
/// configured from the run's settings.
///
pub struct RclonePackSource {
    store: RcloneStore,
}

impl RclonePackSource {
    /// Build a source from the resolved configuration.
    pub fn new(conf: &SyncConfig) -> Self {
        let mut store = RcloneStore::new(&conf.tar_command, &conf.rclone_command)
            .rclone_args(conf.rclone_args.clone())
            .s3_min_chunk_size_kib(conf.s3_min_chunk_size_kib);
        if let Some(ref program) = conf.compression {
            store = store.compression(program.clone());
        }
        Self { store }
    }
}

impl PackSource for RclonePackSource {
    fn store_pack(
        &self,
        base: &Path,
        files: &[PathBuf],
        dest: &str,
        size_hint: u64,
    ) -> Result<u64, Error> {
        self.store.store_pack(base, files, dest, size_hint)
    }

    fn retrieve_pack(&self, src: &str, dest: &Path) -> Result<u64, Error> {
        self.store.retrieve_pack(src, dest)
    }

    fn put_object(&self, dest: &str, content: &[u8]) -> Result<(), Error> {
        self.store.put_object(dest, content)
    }

    fn get_object(&self, src: &str) -> Result<Option<Vec<u8>>, Error> {
        self.store.get_object(src)
    }

    fn delete_object(&self, path: &str, is_dir: bool) -> Result<(), Error> {
        self.store.delete_object(path, is_dir)
    }
}
