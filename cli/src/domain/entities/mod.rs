//
// Copyright (c) 2024 Nathan Fiedler
//
use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::str::FromStr;

///
/// The hash function used for every checksum in a run. SHA-1 is the
/// default for digest speed; the choice is recorded in the metadata
/// document so a download can verify with the same function.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashKind {
    SHA1,
    SHA256,
    SHA512,
    BLAKE3,
}

impl HashKind {
    /// Start a new hash computation.
    pub fn hasher(&self) -> Hasher {
        match self {
            HashKind::SHA1 => {
                use sha1::Digest;
                Hasher::SHA1(sha1::Sha1::new())
            }
            HashKind::SHA256 => {
                use sha2::Digest;
                Hasher::SHA256(sha2::Sha256::new())
            }
            HashKind::SHA512 => {
                use sha2::Digest;
                Hasher::SHA512(sha2::Sha512::new())
            }
            HashKind::BLAKE3 => Hasher::BLAKE3(blake3::Hasher::new()),
        }
    }

    /// Digest a single buffer.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HashKind::SHA1 => write!(f, "sha1"),
            HashKind::SHA256 => write!(f, "sha256"),
            HashKind::SHA512 => write!(f, "sha512"),
            HashKind::BLAKE3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for HashKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(HashKind::SHA1),
            "sha256" => Ok(HashKind::SHA256),
            "sha512" => Ok(HashKind::SHA512),
            "blake3" => Ok(HashKind::BLAKE3),
            _ => Err(anyhow!(format!("not a recognized hash function: {}", s))),
        }
    }
}

///
/// An in-progress hash computation. Cloning captures the state so far,
/// which the planner uses to branch one prefix into two digests.
///
#[derive(Clone)]
pub enum Hasher {
    SHA1(sha1::Sha1),
    SHA256(sha2::Sha256),
    SHA512(sha2::Sha512),
    BLAKE3(blake3::Hasher),
}

impl Hasher {
    /// Feed more bytes into the computation.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::SHA1(hasher) => {
                use sha1::Digest;
                hasher.update(data);
            }
            Hasher::SHA256(hasher) => {
                use sha2::Digest;
                hasher.update(data);
            }
            Hasher::SHA512(hasher) => {
                use sha2::Digest;
                hasher.update(data);
            }
            Hasher::BLAKE3(hasher) => {
                hasher.update(data);
            }
        }
    }

    /// Complete the computation and return the digest bytes.
    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::SHA1(hasher) => {
                use sha1::Digest;
                hasher.finalize().to_vec()
            }
            Hasher::SHA256(hasher) => {
                use sha2::Digest;
                hasher.finalize().to_vec()
            }
            Hasher::SHA512(hasher) => {
                use sha2::Digest;
                hasher.finalize().to_vec()
            }
            Hasher::BLAKE3(hasher) => hasher.finalize().as_bytes().to_vec(),
        }
    }

    /// Complete the computation and return the digest in lowercase hex,
    /// the form stored in the metadata document.
    pub fn finalize_hex(self) -> String {
        let digest = self.finalize();
        let mut result = String::with_capacity(digest.len() * 2);
        for byte in digest {
            result.push_str(&format!("{:02x}", byte));
        }
        result
    }
}

/// What kind of filesystem object a stat snapshot describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    Directory,
    Regular,
    Symlink,
    Other,
}

///
/// Snapshot of the stat fields the planners and checksum engine care
/// about, taken without following symbolic links.
///
#[derive(Clone, Copy, Debug)]
pub struct FileMeta {
    /// File mode bits, or a synthesized value on Windows.
    pub mode: u32,
    /// Length in bytes.
    pub size: u64,
    /// Modification time in nanoseconds since the epoch.
    pub mtime_ns: i128,
    /// Change (or creation) time in nanoseconds since the epoch.
    pub ctime_ns: i128,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Device the file lives on.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
    /// Number of hard links.
    pub nlink: u64,
    kind: FileKind,
}

impl FileMeta {
    #[cfg(target_family = "unix")]
    pub fn from_metadata(attr: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            mode: attr.mode(),
            size: attr.size(),
            mtime_ns: (attr.mtime() as i128) * 1_000_000_000 + attr.mtime_nsec() as i128,
            ctime_ns: (attr.ctime() as i128) * 1_000_000_000 + attr.ctime_nsec() as i128,
            uid: attr.uid(),
            gid: attr.gid(),
            dev: attr.dev(),
            ino: attr.ino(),
            nlink: attr.nlink(),
            kind: kind_of(attr),
        }
    }

    #[cfg(target_family = "windows")]
    pub fn from_metadata(attr: &fs::Metadata) -> Self {
        // Windows has no Unix mode; synthesize one so checksums remain
        // stable, the same trick git uses for its tree entries.
        let kind = kind_of(attr);
        let mode = match kind {
            FileKind::Directory => 0o040_000,
            FileKind::Symlink => 0o120_000,
            _ => 0o100_644,
        };
        Self {
            mode,
            size: attr.len(),
            mtime_ns: system_time_ns(attr.modified().ok()),
            ctime_ns: system_time_ns(attr.created().ok()),
            uid: 0,
            gid: 0,
            dev: 0,
            ino: 0,
            nlink: 1,
            kind,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }
}

fn kind_of(attr: &fs::Metadata) -> FileKind {
    let file_type = attr.file_type();
    if file_type.is_dir() {
        FileKind::Directory
    } else if file_type.is_symlink() {
        FileKind::Symlink
    } else if file_type.is_file() {
        FileKind::Regular
    } else {
        FileKind::Other
    }
}

#[cfg(target_family = "windows")]
fn system_time_ns(time: Option<std::time::SystemTime>) -> i128 {
    use std::time::UNIX_EPOCH;
    match time {
        Some(value) => match value.duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_nanos() as i128,
            Err(backward) => -(backward.duration().as_nanos() as i128),
        },
        None => 0,
    }
}

///
/// One packed archive on the remote: the encoded first-level names it
/// covers and the checksum(s) that decide whether it can be kept on a
/// later sync. Exactly one checksum shape is present, matching the
/// document's recorded settings.
///
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PackEntry {
    /// Sorted, encoded first-level child names packed in this archive.
    pub list: Vec<String>,
    /// Stat-only digest, present in content mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_checksum: Option<String>,
    /// Content-bearing digest, present in content mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_checksum: Option<String>,
    /// Stat digest, present in time mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime_checksum: Option<String>,
}

///
/// A retained directory in the metadata document: the packs rooted here
/// and the retained subdirectories, keyed by encoded name.
///
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DirNode {
    pub files: BTreeMap<String, PackEntry>,
    pub children: BTreeMap<String, DirNode>,
}

/// The checksum settings in effect when a document was written.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ChecksumSettings {
    pub use_file_checksum: bool,
    pub use_directory_mtime: bool,
    #[serde(default)]
    pub use_owner: bool,
    pub hash_function: String,
}

/// Encoded paths, relative to the tree root, sharing one inode.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct HardLinkGroup {
    pub group: Vec<String>,
}

///
/// The top-level metadata document, written once at the end of an
/// upload and read once at the start of either direction.
///
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Document {
    pub version: u32,
    pub meta: DirNode,
    pub root_name: String,
    pub checksum: ChecksumSettings,
    pub hard_links: Vec<HardLinkGroup>,
}
