//
// Copyright (c) 2024 Nathan Fiedler
//
use std::fmt;

pub mod download;
pub mod upload;

///
/// Final figures for an upload run: what the walk discovered, what it
/// intended to ship, and what actually moved.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct UploadOutcome {
    /// Bytes discovered in the tree.
    pub total_size: u64,
    /// Files discovered in the tree (a directory counts as one file).
    pub total_files: u64,
    /// Bytes the plan intended to transfer.
    pub total_transfer_size: u64,
    /// Files the plan intended to transfer.
    pub total_transfer_files: u64,
    /// Bytes actually shipped to the remote.
    pub real_transfer_size: u64,
    /// Objects actually shipped to the remote.
    pub real_transfer_files: u64,
    /// Remote objects deleted.
    pub deleted_objects: u64,
    /// Per-file and transport failures observed.
    pub error_count: u64,
}

impl fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} files ({} bytes) discovered, {} files ({} bytes) to transfer, \
             {} objects ({} bytes) uploaded, {} objects deleted, {} errors",
            self.total_files,
            self.total_size,
            self.total_transfer_files,
            self.total_transfer_size,
            self.real_transfer_files,
            self.real_transfer_size,
            self.deleted_objects,
            self.error_count
        )
    }
}

/// Final figures for a download run.
#[derive(Clone, Copy, Debug, Default)]
pub struct DownloadOutcome {
    /// Bytes received from the remote.
    pub real_transfer_size: u64,
    /// Objects received from the remote.
    pub real_transfer_files: u64,
    /// Per-file and transport failures observed.
    pub error_count: u64,
}

impl fmt::Display for DownloadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} objects ({} bytes) downloaded, {} errors",
            self.real_transfer_files, self.real_transfer_size, self.error_count
        )
    }
}
