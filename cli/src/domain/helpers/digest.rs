//
// Copyright (c) 2024 Nathan Fiedler
//

//! The checksum engine. Every entry digest starts from a wrapped inner
//! digest over the 4-byte settings header, the raw name, and the mode,
//! so that digests taken under different settings can never collide and
//! no hashed blob ever contains more than one variable-length input.
//!
//! The engine runs in one of two passes: the first hashes stat fields
//! only, the second (content mode) hashes file contents. Directories
//! aggregate their children in raw byte name order, which is the sole
//! source of checksum stability.
//!
//! An entry that cannot be read yields the empty digest, which callers
//! treat as "absent for this run"; a directory that cannot be listed is
//! ignored the same way.

use crate::config::SyncConfig;
use crate::domain::entities::{FileMeta, Hasher};
use crate::domain::helpers::{bytes_to_os, os_bytes};
use anyhow::{Context, Error};
use log::warn;
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Read buffer for content hashing.
const READ_BUF_SIZE: usize = 256 * 1024;

///
/// Accumulates roll-up figures while checksums are computed: sizes and
/// file counts for the group being hashed, hard-link candidates keyed
/// by `(device, inode)`, and the number of entries that could not be
/// read.
///
#[derive(Debug, Default)]
pub struct WalkTotals {
    pub total_size: u64,
    pub total_files: u64,
    pub hard_links: HashMap<(u64, u64), PathBuf>,
    pub errors: u64,
}

/// Log a filesystem failure and either swallow it or escalate,
/// depending on the configuration.
fn soft_error(
    conf: &SyncConfig,
    totals: &mut WalkTotals,
    path: &Path,
    err: &std::io::Error,
) -> Result<(), Error> {
    warn!("error accessing {}: {}", path.display(), err);
    totals.errors += 1;
    if conf.abort_on_error {
        Err(Error::msg(format!(
            "error accessing {}: {}",
            path.display(),
            err
        )))
    } else {
        Ok(())
    }
}

///
/// Start an entry digest: a fresh hash state that has been fed the
/// digest of the header, name, and mode (plus directory mtime and
/// ownership where the settings call for them).
///
pub fn init_entry_hash(name: &[u8], meta: &FileMeta, conf: &SyncConfig) -> Hasher {
    let mut inner = conf.hash.hasher();
    inner.update(&conf.head_bytes());
    inner.update(name);
    inner.update(&meta.mode.to_le_bytes());
    if meta.is_dir() {
        if conf.use_directory_mtime {
            inner.update(&meta.mtime_ns.to_le_bytes());
        }
        if conf.use_owner {
            inner.update(&meta.uid.to_le_bytes());
            inner.update(&meta.gid.to_le_bytes());
        }
    }
    let mut outer = conf.hash.hasher();
    outer.update(&inner.finalize());
    outer
}

/// Digest of an entry's content: file bytes for regular files, the
/// target for symbolic links, empty for everything else. `None` when
/// the entry could not be read.
fn content_digest(
    path: &Path,
    meta: &FileMeta,
    conf: &SyncConfig,
    totals: &mut WalkTotals,
) -> Result<Option<Vec<u8>>, Error> {
    let mut hasher = conf.hash.hasher();
    if meta.is_regular() {
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) => {
                soft_error(conf, totals, path, &err)?;
                return Ok(None);
            }
        };
        let mut buffer = vec![0u8; READ_BUF_SIZE];
        loop {
            match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => hasher.update(&buffer[..count]),
                Err(err) => {
                    soft_error(conf, totals, path, &err)?;
                    return Ok(None);
                }
            }
        }
    } else if meta.is_symlink() {
        match fs::read_link(path) {
            Ok(target) => hasher.update(&os_bytes(target.as_os_str())),
            Err(err) => {
                soft_error(conf, totals, path, &err)?;
                return Ok(None);
            }
        }
    }
    Ok(Some(hasher.finalize()))
}

///
/// Digest of a single non-directory entry. The empty digest marks an
/// entry that could not be read.
///
pub fn entry_checksum(
    name: &[u8],
    path: &Path,
    meta: &FileMeta,
    conf: &SyncConfig,
    second_pass: bool,
    totals: &mut WalkTotals,
) -> Result<Vec<u8>, Error> {
    let mut hash = init_entry_hash(name, meta, conf);
    if conf.use_file_checksum && second_pass {
        match content_digest(path, meta, conf, totals)? {
            Some(digest) => hash.update(&digest),
            None => return Ok(Vec::new()),
        }
    } else {
        hash.update(&(meta.size as u128).to_le_bytes());
        hash.update(&meta.mtime_ns.to_le_bytes());
        if conf.use_owner {
            hash.update(&meta.uid.to_le_bytes());
            hash.update(&meta.gid.to_le_bytes());
        }
    }
    Ok(hash.finalize())
}

///
/// Digest of one entry of any kind, descending into directories with
/// children taken in raw byte name order. Accumulates sizes, counts,
/// and hard-link candidates into `totals`.
///
pub fn tree_checksum(
    name: &[u8],
    path: &Path,
    meta: &FileMeta,
    conf: &SyncConfig,
    second_pass: bool,
    totals: &mut WalkTotals,
) -> Result<Vec<u8>, Error> {
    if meta.is_dir() {
        let mut hash = init_entry_hash(name, meta, conf);
        let listing = match fs::read_dir(path) {
            Ok(listing) => listing,
            Err(err) => {
                soft_error(conf, totals, path, &err)?;
                // the empty digest makes the directory vanish from the
                // parent's aggregation
                return Ok(Vec::new());
            }
        };
        let mut children: Vec<(Vec<u8>, PathBuf, FileMeta)> = Vec::new();
        for entry in listing {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    soft_error(conf, totals, path, &err)?;
                    continue;
                }
            };
            let child_path = entry.path();
            match entry.metadata() {
                Ok(attr) => children.push((
                    os_bytes(&entry.file_name()),
                    child_path,
                    FileMeta::from_metadata(&attr),
                )),
                Err(err) => {
                    soft_error(conf, totals, &child_path, &err)?;
                }
            }
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        for (child_name, child_path, child_meta) in children.iter() {
            let sig = tree_checksum(child_name, child_path, child_meta, conf, second_pass, totals)?;
            hash.update(&sig);
        }
        totals.total_files += 1;
        Ok(hash.finalize())
    } else {
        let sig = entry_checksum(name, path, meta, conf, second_pass, totals)?;
        if sig.is_empty() {
            return Ok(sig);
        }
        totals.total_size += meta.size;
        totals.total_files += 1;
        if meta.nlink > 1 {
            totals
                .hard_links
                .insert((meta.dev, meta.ino), path.to_path_buf());
        }
        Ok(sig)
    }
}

///
/// Digest of a group of same-level entries, sorted internally by raw
/// name, returned in hex for storage in the metadata document.
///
pub fn checksum_walk(
    children: &mut Vec<(Vec<u8>, FileMeta)>,
    dir: &Path,
    conf: &SyncConfig,
    second_pass: bool,
    totals: &mut WalkTotals,
) -> Result<String, Error> {
    children.sort_by(|a, b| a.0.cmp(&b.0));
    let mut hash = conf.hash.hasher();
    for (name, meta) in children.iter() {
        let path = dir.join(bytes_to_os(name));
        let sig = tree_checksum(name, &path, meta, conf, second_pass, totals)
            .with_context(|| format!("while hashing {}", path.display()))?;
        hash.update(&sig);
    }
    Ok(hash.finalize_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(path: &Path) -> FileMeta {
        FileMeta::from_metadata(&fs::symlink_metadata(path).unwrap())
    }

    fn walk_hex(dir: &Path, conf: &SyncConfig, second_pass: bool) -> String {
        let mut children: Vec<(Vec<u8>, FileMeta)> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                (
                    os_bytes(&entry.file_name()),
                    FileMeta::from_metadata(&entry.metadata().unwrap()),
                )
            })
            .collect();
        let mut totals = WalkTotals::default();
        checksum_walk(&mut children, dir, conf, second_pass, &mut totals).unwrap()
    }

    fn sample_tree() -> tempfile::TempDir {
        let outdir = tempfile::tempdir().unwrap();
        fs::write(outdir.path().join("alpha"), b"alpha contents").unwrap();
        fs::write(outdir.path().join("beta"), b"beta contents").unwrap();
        fs::create_dir(outdir.path().join("nested")).unwrap();
        fs::write(outdir.path().join("nested/gamma"), b"gamma contents").unwrap();
        outdir
    }

    #[test]
    fn test_walk_invariant_under_input_order() {
        let tree = sample_tree();
        let conf = SyncConfig::default();
        let mut forward: Vec<(Vec<u8>, FileMeta)> = Vec::new();
        for entry in fs::read_dir(tree.path()).unwrap() {
            let entry = entry.unwrap();
            forward.push((
                os_bytes(&entry.file_name()),
                FileMeta::from_metadata(&entry.metadata().unwrap()),
            ));
        }
        let mut reversed: Vec<(Vec<u8>, FileMeta)> = forward.clone();
        reversed.reverse();
        let mut totals = WalkTotals::default();
        let one = checksum_walk(&mut forward, tree.path(), &conf, false, &mut totals).unwrap();
        let mut totals = WalkTotals::default();
        let two = checksum_walk(&mut reversed, tree.path(), &conf, false, &mut totals).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn test_walk_counts_files_and_sizes() {
        let tree = sample_tree();
        let conf = SyncConfig::default();
        let mut children: Vec<(Vec<u8>, FileMeta)> = fs::read_dir(tree.path())
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                (
                    os_bytes(&entry.file_name()),
                    FileMeta::from_metadata(&entry.metadata().unwrap()),
                )
            })
            .collect();
        let mut totals = WalkTotals::default();
        checksum_walk(&mut children, tree.path(), &conf, false, &mut totals).unwrap();
        // alpha, beta, gamma, and the nested directory itself
        assert_eq!(totals.total_files, 4);
        assert_eq!(totals.total_size, 14 + 13 + 14);
        assert_eq!(totals.errors, 0);
    }

    #[test]
    fn test_settings_change_digests() {
        let tree = sample_tree();
        let mut variants: Vec<String> = Vec::new();
        for (content, owner, dir_mtime) in [
            (false, false, false),
            (true, false, false),
            (false, true, false),
            (false, false, true),
            (true, true, true),
        ] {
            let conf = SyncConfig {
                use_file_checksum: content,
                use_owner: owner,
                use_directory_mtime: dir_mtime,
                ..Default::default()
            };
            variants.push(walk_hex(tree.path(), &conf, false));
        }
        for (i, a) in variants.iter().enumerate() {
            for b in variants.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_second_pass_hashes_content() {
        let tree = sample_tree();
        let conf = SyncConfig {
            use_file_checksum: true,
            ..Default::default()
        };
        let first = walk_hex(tree.path(), &conf, false);
        let second = walk_hex(tree.path(), &conf, true);
        assert_ne!(first, second);
        // the second pass is stable
        assert_eq!(second, walk_hex(tree.path(), &conf, true));
    }

    #[test]
    fn test_name_is_part_of_digest() {
        let tree = sample_tree();
        let conf = SyncConfig::default();
        let before = walk_hex(tree.path(), &conf, false);
        fs::rename(tree.path().join("alpha"), tree.path().join("alpha2")).unwrap();
        let after = walk_hex(tree.path(), &conf, false);
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_file_yields_empty_digest() {
        let tree = sample_tree();
        let conf = SyncConfig {
            use_file_checksum: true,
            ..Default::default()
        };
        let meta = stat(&tree.path().join("alpha"));
        fs::remove_file(tree.path().join("alpha")).unwrap();
        let mut totals = WalkTotals::default();
        let sig = entry_checksum(
            b"alpha",
            &tree.path().join("alpha"),
            &meta,
            &conf,
            true,
            &mut totals,
        )
        .unwrap();
        assert!(sig.is_empty());
        assert_eq!(totals.errors, 1);
    }

    #[test]
    fn test_missing_file_escalates_when_configured() {
        let tree = sample_tree();
        let conf = SyncConfig {
            use_file_checksum: true,
            abort_on_error: true,
            ..Default::default()
        };
        let meta = stat(&tree.path().join("alpha"));
        fs::remove_file(tree.path().join("alpha")).unwrap();
        let mut totals = WalkTotals::default();
        let result = entry_checksum(
            b"alpha",
            &tree.path().join("alpha"),
            &meta,
            &conf,
            true,
            &mut totals,
        );
        assert!(result.is_err());
    }

    #[test]
    #[cfg(target_family = "unix")]
    fn test_symlink_content_digest() {
        let outdir = tempfile::tempdir().unwrap();
        let link_a = outdir.path().join("link_a");
        let link_b = outdir.path().join("link_b");
        std::os::unix::fs::symlink("target/one", &link_a).unwrap();
        std::os::unix::fs::symlink("target/two", &link_b).unwrap();
        let conf = SyncConfig {
            use_file_checksum: true,
            ..Default::default()
        };
        let mut totals = WalkTotals::default();
        let sig_a = entry_checksum(b"n", &link_a, &stat(&link_a), &conf, true, &mut totals).unwrap();
        let sig_b = entry_checksum(b"n", &link_b, &stat(&link_b), &conf, true, &mut totals).unwrap();
        assert_ne!(sig_a, sig_b);
    }

    #[test]
    #[cfg(target_family = "unix")]
    fn test_hard_link_candidates_collected() {
        let outdir = tempfile::tempdir().unwrap();
        let original = outdir.path().join("original");
        fs::write(&original, b"shared").unwrap();
        fs::hard_link(&original, outdir.path().join("duplicate")).unwrap();
        let conf = SyncConfig::default();
        let _ = walk_hex(outdir.path(), &conf, false);
        let mut children: Vec<(Vec<u8>, FileMeta)> = fs::read_dir(outdir.path())
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                (
                    os_bytes(&entry.file_name()),
                    FileMeta::from_metadata(&entry.metadata().unwrap()),
                )
            })
            .collect();
        let mut totals = WalkTotals::default();
        checksum_walk(&mut children, outdir.path(), &conf, false, &mut totals).unwrap();
        // both names share one inode, collapsing to a single candidate
        assert_eq!(totals.hard_links.len(), 1);
    }
}
