//
// Copyright (c) 2024 Nathan Fiedler
//

//! A pack store implementation that streams packed archives to and from
//! an rclone remote, using an external archiver to do the packing.
//!
//! Uploading pipes the archiver's output directly into `rclone rcat` and
//! downloading pipes `rclone cat` into the archiver, so no intermediate
//! copy of a pack ever touches the local disk. Each pipeline copies
//! through a userspace buffer while two auxiliary threads drain the
//! children's standard error, which would otherwise fill its pipe and
//! deadlock both processes.

use anyhow::{anyhow, Context, Error};
use log::{debug, warn};
use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use store_core::ProcessError;

/// Size of the buffer used to shuttle bytes between the two children.
const BUF_SIZE: usize = 256 * 1024;

/// S3 remotes reject uploads of more than 10,000 parts; stay well under.
const S3_MAX_PARTS: u64 = 6000;

/// Default minimum S3 part size in KiB (5 MiB).
const S3_DEFAULT_MIN_CHUNK_KIB: u64 = 5 * 1024;

///
/// A pack store backed by an rclone remote. Packs are built and unpacked
/// by an external tar program and never staged locally.
///
#[derive(Clone, Debug)]
pub struct RcloneStore {
    tar_command: PathBuf,
    rclone_command: PathBuf,
    rclone_args: Vec<String>,
    compression: Option<String>,
    s3_min_chunk_size_kib: u64,
}

impl RcloneStore {
    /// Construct a store that invokes the given tar and rclone binaries.
    pub fn new<T: Into<PathBuf>, R: Into<PathBuf>>(tar_command: T, rclone_command: R) -> Self {
        Self {
            tar_command: tar_command.into(),
            rclone_command: rclone_command.into(),
            rclone_args: Vec::new(),
            compression: None,
            s3_min_chunk_size_kib: S3_DEFAULT_MIN_CHUNK_KIB,
        }
    }

    /// Add extra arguments passed to every rclone invocation.
    pub fn rclone_args(mut self, args: Vec<String>) -> Self {
        self.rclone_args = args;
        self
    }

    /// Set the compression program handed to tar via `-I`.
    pub fn compression<S: Into<String>>(mut self, program: S) -> Self {
        self.compression = Some(program.into());
        self
    }

    /// Set the minimum S3 chunk size in KiB.
    pub fn s3_min_chunk_size_kib(mut self, kib: u64) -> Self {
        self.s3_min_chunk_size_kib = kib;
        self
    }

    ///
    /// Build an archive from the given paths, relative to `base`, and
    /// stream it to the remote location. The paths are taken literally
    /// (no recursion) and must already be sorted. Returns the number of
    /// bytes piped into rclone.
    ///
    pub fn store_pack(
        &self,
        base: &Path,
        files: &[PathBuf],
        dest: &str,
        size_hint: u64,
    ) -> Result<u64, Error> {
        // tar reads the member list from a NUL-separated file so that
        // arbitrary bytes in names survive; the temp path removes itself
        // on every exit from this function.
        let mut list_file = tempfile::NamedTempFile::new()?;
        for file in files {
            list_file.write_all(&path_bytes(file)?)?;
            list_file.write_all(b"\0")?;
        }
        list_file.flush()?;
        let list_path = list_file.into_temp_path();

        let mut tar_cmd = Command::new(&self.tar_command);
        if let Some(ref program) = self.compression {
            tar_cmd.arg("-I").arg(program);
        }
        tar_cmd
            .arg("--null")
            .arg("--ignore-failed-read")
            .arg("--no-recursion")
            .arg("-H")
            .arg("posix")
            .arg("--acls")
            .arg("-C")
            .arg(base)
            .arg("-T")
            .arg(list_path.as_os_str())
            .arg("-Scf")
            .arg("-");

        let mut rclone_cmd = Command::new(&self.rclone_command);
        rclone_cmd.arg("rcat");
        if let Some(chunk_arg) = self.chunk_size_arg(size_hint) {
            rclone_cmd.arg(chunk_arg);
        }
        rclone_cmd.args(&self.rclone_args).arg(dest);

        self.run_pipeline(tar_cmd, rclone_cmd, "tar", "rclone rcat")
    }

    ///
    /// Stream the remote object through the archiver, unpacking it into
    /// the destination directory. Returns the number of bytes piped.
    ///
    pub fn retrieve_pack(&self, src: &str, dest: &Path) -> Result<u64, Error> {
        let mut rclone_cmd = Command::new(&self.rclone_command);
        rclone_cmd.arg("cat").args(&self.rclone_args).arg(src);

        let mut tar_cmd = Command::new(&self.tar_command);
        if let Some(ref program) = self.compression {
            tar_cmd.arg("-I").arg(program);
        }
        tar_cmd
            .arg("-C")
            .arg(extract_dest_arg(dest))
            .arg("-Sxf")
            .arg("-");

        self.run_pipeline(rclone_cmd, tar_cmd, "rclone cat", "tar")
    }

    /// Upload a small blob in a single shot.
    pub fn put_object(&self, dest: &str, content: &[u8]) -> Result<(), Error> {
        let mut cmd = Command::new(&self.rclone_command);
        cmd.arg("rcat").args(&self.rclone_args).arg(dest);
        debug!("invoke command: {:?}", cmd);
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {:?}", self.rclone_command))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("rclone stdin not captured"))?;
        stdin.write_all(content)?;
        drop(stdin);
        let output = child.wait_with_output()?;
        if !output.status.success() {
            warn!(
                "rclone rcat failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
            return Err(Error::new(ProcessError {
                program: "rclone rcat".into(),
                status: output.status,
                stderr: output.stderr,
            }));
        }
        Ok(())
    }

    /// Download a small blob in a single shot, `None` if rclone reports
    /// a failure (which includes the object not existing).
    pub fn get_object(&self, src: &str) -> Result<Option<Vec<u8>>, Error> {
        let mut cmd = Command::new(&self.rclone_command);
        cmd.arg("cat").args(&self.rclone_args).arg(src);
        debug!("invoke command: {:?}", cmd);
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to spawn {:?}", self.rclone_command))?;
        if !output.status.success() {
            warn!(
                "rclone cat failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
            return Ok(None);
        }
        Ok(Some(output.stdout))
    }

    /// Remove a single object, or an entire prefix when `is_dir`.
    pub fn delete_object(&self, path: &str, is_dir: bool) -> Result<(), Error> {
        let verb = if is_dir { "purge" } else { "delete" };
        let mut cmd = Command::new(&self.rclone_command);
        cmd.arg(verb).args(&self.rclone_args).arg(path);
        debug!("invoke command: {:?}", cmd);
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to spawn {:?}", self.rclone_command))?;
        if !output.status.success() {
            warn!(
                "rclone {} failed with {}: {}",
                verb,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
            return Err(Error::new(ProcessError {
                program: format!("rclone {}", verb),
                status: output.status,
                stderr: output.stderr,
            }));
        }
        Ok(())
    }

    /// Compute the `--s3-chunk-size` argument, if one is needed. rclone
    /// reads a bare number as KiB.
    fn chunk_size_arg(&self, size_hint: u64) -> Option<String> {
        if size_hint > S3_MAX_PARTS * self.s3_min_chunk_size_kib * 1024 {
            let kib = std::cmp::max(
                self.s3_min_chunk_size_kib,
                size_hint.div_ceil(S3_MAX_PARTS * 1024),
            );
            Some(format!("--s3-chunk-size={}", kib))
        } else if self.s3_min_chunk_size_kib > S3_DEFAULT_MIN_CHUNK_KIB {
            Some(format!("--s3-chunk-size={}", self.s3_min_chunk_size_kib))
        } else {
            None
        }
    }

    ///
    /// Spawn the producer and consumer, copy producer stdout into
    /// consumer stdin, and report the first failing exit status. A
    /// broken pipe ends the copy without being treated as an error by
    /// itself; whichever process died will report a failure status.
    ///
    fn run_pipeline(
        &self,
        mut producer: Command,
        mut consumer: Command,
        producer_name: &str,
        consumer_name: &str,
    ) -> Result<u64, Error> {
        debug!("invoke command: {:?}", producer);
        let mut prod = producer
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", producer_name))?;
        debug!("invoke command: {:?}", consumer);
        let mut cons = match consumer
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                let _ = prod.kill();
                let _ = prod.wait();
                return Err(Error::new(err).context(format!("failed to spawn {}", consumer_name)));
            }
        };

        let prod_drainer = drain_stderr(&mut prod);
        let cons_drainer = drain_stderr(&mut cons);
        let mut from = prod
            .stdout
            .take()
            .ok_or_else(|| anyhow!("{} stdout not captured", producer_name))?;
        let mut to = cons
            .stdin
            .take()
            .ok_or_else(|| anyhow!("{} stdin not captured", consumer_name))?;

        let mut buffer = vec![0u8; BUF_SIZE];
        let mut total: u64 = 0;
        loop {
            let count = match from.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => count,
                Err(_) => break,
            };
            if to.write_all(&buffer[..count]).is_err() {
                break;
            }
            total += count as u64;
        }
        // closing the pipes lets both children run to completion
        drop(from);
        drop(to);
        let prod_stderr = prod_drainer.join().unwrap_or_default();
        let cons_stderr = cons_drainer.join().unwrap_or_default();
        let prod_status = prod.wait()?;
        let cons_status = cons.wait()?;
        if !cons_status.success() {
            warn!(
                "{} failed with {}: {}",
                consumer_name,
                cons_status,
                String::from_utf8_lossy(&cons_stderr)
            );
            return Err(Error::new(ProcessError {
                program: consumer_name.into(),
                status: cons_status,
                stderr: cons_stderr,
            }));
        }
        if !prod_status.success() {
            warn!(
                "{} failed with {}: {}",
                producer_name,
                prod_status,
                String::from_utf8_lossy(&prod_stderr)
            );
            return Err(Error::new(ProcessError {
                program: producer_name.into(),
                status: prod_status,
                stderr: prod_stderr,
            }));
        }
        Ok(total)
    }
}

/// Collect a child's standard error on a separate thread so the child
/// never blocks writing to a full pipe.
fn drain_stderr(child: &mut Child) -> thread::JoinHandle<Vec<u8>> {
    let stderr = child.stderr.take();
    thread::spawn(move || {
        let mut collected = Vec::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_end(&mut collected);
        }
        collected
    })
}

#[cfg(target_family = "unix")]
fn path_bytes(path: &Path) -> Result<Vec<u8>, Error> {
    use std::os::unix::ffi::OsStrExt;
    Ok(path.as_os_str().as_bytes().to_vec())
}

#[cfg(target_family = "windows")]
fn path_bytes(path: &Path) -> Result<Vec<u8>, Error> {
    path.to_str()
        .map(|value| value.as_bytes().to_vec())
        .ok_or_else(|| anyhow!("path is not valid Unicode: {}", path.display()))
}

// GNU tar under MSYS wants forward slashes in the extraction directory.
#[cfg(target_family = "unix")]
fn extract_dest_arg(dest: &Path) -> OsString {
    dest.as_os_str().to_owned()
}

#[cfg(target_family = "windows")]
fn extract_dest_arg(dest: &Path) -> OsString {
    OsString::from(dest.to_string_lossy().replace('\\', "/"))
}
