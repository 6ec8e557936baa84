//
// Copyright (c) 2024 Nathan Fiedler
//
#![cfg(target_family = "unix")]

//! Round-trip tests: upload a tree with the real tar binary and a
//! stand-in rclone, download it into an empty directory, and compare
//! what came back.

use anyhow::Error;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tsuzura::config::SyncConfig;
use tsuzura::data::sources::RclonePackSource;
use tsuzura::domain::managers::{download, upload};
use tsuzura::domain::sources::PackSource;

fn stub_rclone(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let script = dir.join("rclone");
    fs::write(
        &script,
        "#!/bin/sh\nop=\"$1\"; shift\ncase \"$op\" in\n\
         rcat) mkdir -p \"$(dirname \"$1\")\" && cat > \"$1\" ;;\n\
         cat) cat \"$1\" ;;\n\
         delete) rm \"$1\" ;;\n\
         purge) rm -rf \"$1\" ;;\n\
         esac\n",
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn test_config(stub: &Path) -> SyncConfig {
    SyncConfig {
        rclone_command: stub.to_path_buf(),
        ..Default::default()
    }
}

fn roundtrip(conf: &SyncConfig, local: &Path, remote: &Path, restore: &Path) -> Result<(), Error> {
    let source: Arc<dyn PackSource> = Arc::new(RclonePackSource::new(conf));
    let outcome = upload::upload(local, remote.to_str().unwrap(), conf, source.clone())?;
    assert_eq!(outcome.error_count, 0);
    let outcome = download::download(restore, remote.to_str().unwrap(), conf, source)?;
    assert_eq!(outcome.error_count, 0);
    Ok(())
}

#[test]
fn test_restore_empty_tree() -> Result<(), Error> {
    let work = tempfile::tempdir()?;
    let local = work.path().join("tree");
    let remote = work.path().join("remote");
    let restore = work.path().join("restore");
    fs::create_dir_all(&local)?;
    fs::create_dir_all(&remote)?;
    let conf = test_config(&stub_rclone(work.path()));

    roundtrip(&conf, &local, &remote, &restore)?;
    assert!(restore.is_dir());
    assert_eq!(fs::read_dir(&restore)?.count(), 0);
    Ok(())
}

#[test]
fn test_restore_files_and_attributes() -> Result<(), Error> {
    let work = tempfile::tempdir()?;
    let local = work.path().join("tree");
    let remote = work.path().join("remote");
    let restore = work.path().join("restore");
    let nested = local.join("nested");
    fs::create_dir_all(&nested)?;
    fs::create_dir_all(&remote)?;
    fs::write(local.join("a"), b"hello")?;
    fs::write(nested.join("deep"), b"deep contents")?;
    std::os::unix::fs::symlink("a", local.join("link"))?;
    let stamp = filetime::FileTime::from_unix_time(1_600_000_000, 0);
    filetime::set_file_mtime(local.join("a"), stamp)?;
    let mut permissions = fs::metadata(local.join("a"))?.permissions();
    use std::os::unix::fs::PermissionsExt;
    permissions.set_mode(0o640);
    fs::set_permissions(local.join("a"), permissions)?;
    let conf = test_config(&stub_rclone(work.path()));

    roundtrip(&conf, &local, &remote, &restore)?;

    assert_eq!(fs::read(restore.join("a"))?, b"hello");
    assert_eq!(fs::read(restore.join("nested/deep"))?, b"deep contents");
    let attr = fs::metadata(restore.join("a"))?;
    assert_eq!(attr.mode() & 0o7777, 0o640);
    assert_eq!(attr.mtime(), 1_600_000_000);
    let target = fs::read_link(restore.join("link"))?;
    assert_eq!(target, PathBuf::from("a"));
    Ok(())
}

#[test]
fn test_restore_folded_subtree() -> Result<(), Error> {
    let work = tempfile::tempdir()?;
    let local = work.path().join("tree");
    let remote = work.path().join("remote");
    let restore = work.path().join("restore");
    let small = local.join("small");
    fs::create_dir_all(&small)?;
    fs::create_dir_all(&remote)?;
    for index in 0..5 {
        fs::write(small.join(format!("file{}", index)), format!("data{}", index))?;
    }
    let mut conf = test_config(&stub_rclone(work.path()));
    conf.file_base_bytes = 64;
    conf.merge_threshold = 1024;

    roundtrip(&conf, &local, &remote, &restore)?;
    for index in 0..5 {
        assert_eq!(
            fs::read(restore.join("small").join(format!("file{}", index)))?,
            format!("data{}", index).as_bytes()
        );
    }
    Ok(())
}

#[test]
fn test_restore_hard_links_across_packs() -> Result<(), Error> {
    let work = tempfile::tempdir()?;
    let local = work.path().join("tree");
    let remote = work.path().join("remote");
    let restore = work.path().join("restore");
    let sub = local.join("sub");
    fs::create_dir_all(&sub)?;
    fs::create_dir_all(&remote)?;
    fs::write(local.join("x"), b"shared contents")?;
    fs::hard_link(local.join("x"), sub.join("y"))?;
    fs::write(sub.join("z"), b"unrelated")?;
    // a tiny threshold forces x and sub into separate packs, so the
    // link is split and must be rebuilt from metadata
    let mut conf = test_config(&stub_rclone(work.path()));
    conf.merge_threshold = 1;
    conf.file_base_bytes = 0;

    roundtrip(&conf, &local, &remote, &restore)?;

    let ino_x = fs::metadata(restore.join("x"))?.ino();
    let ino_y = fs::metadata(restore.join("sub/y"))?.ino();
    let ino_z = fs::metadata(restore.join("sub/z"))?.ino();
    assert_eq!(ino_x, ino_y);
    assert_ne!(ino_x, ino_z);
    assert_eq!(fs::read(restore.join("sub/y"))?, b"shared contents");
    Ok(())
}

#[test]
fn test_restore_hard_links_within_one_pack() -> Result<(), Error> {
    let work = tempfile::tempdir()?;
    let local = work.path().join("tree");
    let remote = work.path().join("remote");
    let restore = work.path().join("restore");
    fs::create_dir_all(&local)?;
    fs::create_dir_all(&remote)?;
    fs::write(local.join("x"), b"shared contents")?;
    fs::hard_link(local.join("x"), local.join("y"))?;
    let conf = test_config(&stub_rclone(work.path()));

    roundtrip(&conf, &local, &remote, &restore)?;

    // tar itself preserves links that stayed inside a single pack
    let ino_x = fs::metadata(restore.join("x"))?.ino();
    let ino_y = fs::metadata(restore.join("y"))?.ino();
    assert_eq!(ino_x, ino_y);
    Ok(())
}

#[test]
fn test_restore_retained_directory_layout() -> Result<(), Error> {
    let work = tempfile::tempdir()?;
    let local = work.path().join("tree");
    let remote = work.path().join("remote");
    let restore = work.path().join("restore");
    let sub = local.join("sub");
    fs::create_dir_all(&sub)?;
    fs::create_dir_all(&remote)?;
    fs::write(local.join("top"), vec![1u8; 600])?;
    fs::write(sub.join("one"), vec![2u8; 600])?;
    fs::write(sub.join("two"), vec![3u8; 600])?;
    let mut conf = test_config(&stub_rclone(work.path()));
    conf.merge_threshold = 1024;
    conf.file_base_bytes = 64;

    roundtrip(&conf, &local, &remote, &restore)?;

    assert_eq!(fs::read(restore.join("top"))?, vec![1u8; 600]);
    assert_eq!(fs::read(restore.join("sub/one"))?, vec![2u8; 600]);
    assert_eq!(fs::read(restore.join("sub/two"))?, vec![3u8; 600]);
    Ok(())
}
