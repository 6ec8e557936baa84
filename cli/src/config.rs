//
// Copyright (c) 2024 Nathan Fiedler
//

//! Runtime configuration for the upload and download commands, along
//! with the parsing and validation helpers the command line relies on.

use crate::domain::entities::HashKind;
use anyhow::{anyhow, Error};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// Order in which pending children are grouped into packs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GroupingOrder {
    Size,
    Name,
    Mtime,
    Ctime,
}

impl FromStr for GroupingOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "size" => Ok(GroupingOrder::Size),
            "name" => Ok(GroupingOrder::Name),
            "mtime" => Ok(GroupingOrder::Mtime),
            "ctime" => Ok(GroupingOrder::Ctime),
            _ => Err(anyhow!(format!("not a recognized grouping order: {}", s))),
        }
    }
}

///
/// Everything the planners, the checksum engine, and the transport need
/// to know for one run. The download path ignores the upload-only
/// fields near the bottom.
///
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Treat the destination as empty, skipping the previous metadata.
    pub dest_as_empty: bool,
    /// Hash file contents rather than relying on size and mtime.
    pub use_file_checksum: bool,
    /// Include ownership (uid/gid) in checksums.
    pub use_owner: bool,
    /// Include directory mtimes in checksums.
    pub use_directory_mtime: bool,
    /// Hash function used for all checksums.
    pub hash: HashKind,
    /// Exit zero even if some files could not be processed.
    pub ignore_errors: bool,
    /// Escalate the first per-file error into a failure of the run.
    pub abort_on_error: bool,
    /// Extra arguments passed to every rclone invocation.
    pub rclone_args: Vec<String>,
    /// Compression program line handed to tar via `-I`, if any.
    pub compression: Option<String>,
    /// The tar binary.
    pub tar_command: PathBuf,
    /// The rclone binary.
    pub rclone_command: PathBuf,
    /// Prefix reserved for this tool's objects on the remote.
    pub reserved_prefix: String,
    /// Explicit metadata location, overriding the remote default.
    pub metadata_path: Option<String>,
    /// Minimum S3 chunk size in KiB.
    pub s3_min_chunk_size_kib: u64,
    /// Metadata document version to write.
    pub metadata_version: u32,
    /// Bytes charged per file on top of its length when sizing groups.
    pub file_base_bytes: u64,
    /// Upper bound on the accumulated size of a pack group.
    pub merge_threshold: u64,
    /// Defer remote deletions until after all uploads.
    pub delete_after_upload: bool,
    /// Sort key for grouping children into packs.
    pub grouping_order: GroupingOrder,
    /// Suffix appended to pack names after `.tar`.
    pub compression_suffix: String,
    /// Paths named by `--include-file`, normalized under the tree root.
    pub include_targets: HashSet<PathBuf>,
    /// The include targets plus every ancestor below the tree root.
    pub include_prefixes: HashSet<PathBuf>,
    /// Paths named by `--exclude-file`, normalized under the tree root.
    pub exclude_paths: HashSet<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dest_as_empty: false,
            use_file_checksum: false,
            use_owner: false,
            use_directory_mtime: false,
            hash: HashKind::SHA1,
            ignore_errors: false,
            abort_on_error: false,
            rclone_args: Vec::new(),
            compression: Some("gzip".to_owned()),
            tar_command: PathBuf::from("tar"),
            rclone_command: PathBuf::from("rclone"),
            reserved_prefix: "_METARCLONE_".to_owned(),
            metadata_path: None,
            s3_min_chunk_size_kib: 5 * 1024,
            metadata_version: 1,
            file_base_bytes: 64,
            merge_threshold: 10 * 1024 * 1024,
            delete_after_upload: true,
            grouping_order: GroupingOrder::Size,
            compression_suffix: ".gz".to_owned(),
            include_targets: HashSet::new(),
            include_prefixes: HashSet::new(),
            exclude_paths: HashSet::new(),
        }
    }
}

impl SyncConfig {
    ///
    /// The header mixed into every checksum so that digests produced
    /// under different settings can never be equal.
    ///
    pub fn head_bytes(&self) -> [u8; 4] {
        let mut first = 0u8;
        if self.use_file_checksum {
            first |= 1;
        }
        if self.use_owner {
            first |= 1 << 1;
        }
        if self.use_directory_mtime {
            first |= 1 << 2;
        }
        [first, 0, 0, 0]
    }

    ///
    /// Derive the pack-name suffix from the compression program, or
    /// return `false` when the program is not recognized and the user
    /// must supply `--compression-suffix` themselves.
    ///
    pub fn deduce_compression_suffix(&mut self) -> bool {
        let line = match self.compression.as_deref() {
            None | Some("none") => {
                self.compression = None;
                self.compression_suffix.clear();
                return true;
            }
            Some(line) => line,
        };
        let program = match line.split_whitespace().next() {
            Some(word) => word,
            None => return false,
        };
        let suffix = match program {
            "gzip" | "gunzip" | "pigz" => ".gz",
            "bzip2" | "bunzip2" | "pbzip2" => ".bz2",
            "xz" | "unxz" => ".xz",
            "zstd" | "unzstd" | "pzstd" => ".zst",
            _ => return false,
        };
        self.compression_suffix = suffix.to_owned();
        true
    }

    ///
    /// Resolve the tar and rclone binaries through `PATH` up front.
    /// Direct process execution does not consult `PATH` on every host
    /// (MinGW in particular), and a missing binary should fail now
    /// rather than in the middle of a walk.
    ///
    pub fn resolve_commands(&mut self) -> Result<(), Error> {
        self.tar_command = resolve_command(&self.tar_command)?;
        self.rclone_command = resolve_command(&self.rclone_command)?;
        Ok(())
    }

    /// Record the paths to exclude from an upload.
    pub fn set_exclude_paths(&mut self, base: &Path, paths: &[PathBuf]) {
        for path in paths {
            self.exclude_paths.insert(normalize_under(base, path));
        }
    }

    ///
    /// Record the paths to include in an upload. Every ancestor of a
    /// target below the tree root must also be walkable for the target
    /// to be reachable, so those are collected separately.
    ///
    pub fn set_include_paths(&mut self, base: &Path, paths: &[PathBuf]) {
        for path in paths {
            let full = normalize_under(base, path);
            self.include_targets.insert(full.clone());
            for ancestor in full.ancestors() {
                if ancestor == base || !ancestor.starts_with(base) {
                    break;
                }
                self.include_prefixes.insert(ancestor.to_path_buf());
            }
        }
    }
}

///
/// Parse a size expression: digits with an optional fraction and an
/// optional unit suffix. A bare number is read as KiB; `b`, `k`, `m`,
/// `g`, and `t` select bytes through TiB. Case-insensitive.
///
pub fn parse_size(input: &str) -> Result<u64, Error> {
    let lower = input.trim().to_ascii_lowercase();
    let (digits, multiplier) = match lower.chars().last() {
        Some('b') => (&lower[..lower.len() - 1], 1u64),
        Some('k') => (&lower[..lower.len() - 1], 1024),
        Some('m') => (&lower[..lower.len() - 1], 1024 * 1024),
        Some('g') => (&lower[..lower.len() - 1], 1024 * 1024 * 1024),
        Some('t') => (&lower[..lower.len() - 1], 1024u64.pow(4)),
        Some(c) if c.is_ascii_digit() => (lower.as_str(), 1024),
        _ => return Err(anyhow!(format!("invalid size: {}", input))),
    };
    let well_formed = match digits.split_once('.') {
        None => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        Some((whole, frac)) => {
            !whole.is_empty()
                && !frac.is_empty()
                && whole.bytes().all(|b| b.is_ascii_digit())
                && frac.bytes().all(|b| b.is_ascii_digit())
        }
    };
    if !well_formed {
        return Err(anyhow!(format!("invalid size: {}", input)));
    }
    let value: f64 = digits
        .parse()
        .map_err(|_| anyhow!(format!("invalid size: {}", input)))?;
    Ok((value * multiplier as f64) as u64)
}

/// Check that a reserved prefix uses only its restricted alphabet.
pub fn valid_reserved_prefix(prefix: &str) -> bool {
    prefix
        .chars()
        .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase() || c == '_')
}

/// Check that a compression suffix uses only its restricted alphabet.
pub fn valid_compression_suffix(suffix: &str) -> bool {
    suffix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
}

///
/// Raised when a required external binary cannot be located, before any
/// walking or transfer has begun.
///
#[derive(thiserror::Error, Debug)]
#[error("cannot find executable: {0}")]
pub struct MissingCommand(pub String);

/// Find an executable on `PATH` unless it was given with a separator.
fn resolve_command(command: &Path) -> Result<PathBuf, Error> {
    let text = command.to_string_lossy();
    if text.contains('/') || text.contains('\\') {
        return Ok(command.to_owned());
    }
    let path_var = std::env::var_os("PATH")
        .ok_or_else(|| Error::new(MissingCommand(text.to_string())))?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(command);
        if candidate.is_file() {
            return Ok(candidate);
        }
        #[cfg(target_family = "windows")]
        {
            let exe = dir.join(format!("{}.exe", text));
            if exe.is_file() {
                return Ok(exe);
            }
        }
    }
    Err(Error::new(MissingCommand(text.to_string())))
}

/// Join a possibly-relative path onto the tree root and collapse any
/// `.` and `..` components lexically.
fn normalize_under(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut result = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            other => result.push(other.as_os_str()),
        }
    }
    result
}
