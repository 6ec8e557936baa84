//
// Copyright (c) 2024 Nathan Fiedler
//
use anyhow::Error;
#[cfg(test)]
use mockall::automock;
use std::path::{Path, PathBuf};

///
/// The transport contract the planners speak: stream a pack built from
/// listed paths to a remote location, stream one back and unpack it,
/// move small blobs whole, and delete remote objects. Implementations
/// run the external archiver and transport programs; the planners never
/// see a subprocess.
///
#[cfg_attr(test, automock)]
pub trait PackSource: Send + Sync {
    /// Build an archive of `files` (relative to `base`, sorted, taken
    /// literally without recursion) and stream it to `dest`. The size
    /// hint lets the transport pick a sensible chunk size up front.
    /// Returns the number of bytes shipped.
    fn store_pack(&self, base: &Path, files: &[PathBuf], dest: &str, size_hint: u64)
        -> Result<u64, Error>;

    /// Stream the remote object at `src` and unpack it into `dest`.
    /// Returns the number of bytes received.
    fn retrieve_pack(&self, src: &str, dest: &Path) -> Result<u64, Error>;

    /// Upload a small blob in one shot.
    fn put_object(&self, dest: &str, content: &[u8]) -> Result<(), Error>;

    /// Download a small blob in one shot; `None` when it cannot be
    /// fetched (including when it does not exist).
    fn get_object(&self, src: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Remove a single remote object, or a whole prefix when `is_dir`.
    fn delete_object(&self, path: &str, is_dir: bool) -> Result<(), Error>;
}
