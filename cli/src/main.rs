//
// Copyright (c) 2024 Nathan Fiedler
//

//! The command line binary: parses the options, builds the run
//! configuration, and drives an upload or download pass.

use anyhow::{anyhow, Error};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tsuzura::config::{
    parse_size, valid_compression_suffix, valid_reserved_prefix, GroupingOrder, SyncConfig,
};
use tsuzura::data::sources::RclonePackSource;
use tsuzura::domain::entities::HashKind;
use tsuzura::domain::managers::{download, upload};
use tsuzura::domain::sources::PackSource;

#[derive(Parser)]
#[command(
    name = "tsuzura",
    version,
    about = "Synchronize a directory tree to an rclone remote as packed archives"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by both directions of a sync.
#[derive(Args)]
struct CommonArgs {
    /// Treat the destination as empty, skipping the previous metadata
    #[arg(long)]
    dest_as_empty: bool,

    /// Compare file contents rather than sizes and mtimes
    #[arg(short = 'c', long)]
    use_file_checksum: bool,

    /// Include directory mtimes in checksums
    #[arg(long)]
    use_directory_mtime: bool,

    /// Include ownership (uid/gid) in checksums
    #[arg(long)]
    use_owner: bool,

    /// Hash function: sha1, sha256, sha512, or blake3
    #[arg(long, value_name = "name")]
    checksum_choice: Option<String>,

    /// Exit zero even if some files could not be processed
    #[arg(long)]
    ignore_errors: bool,

    /// Stop the run at the first per-file error
    #[arg(long)]
    abort_on_error: bool,

    /// Extra arguments for rclone, split on whitespace
    #[arg(long, value_name = "args")]
    rclone_args: Option<String>,

    /// Compression program for tar -I; "none" disables compression
    #[arg(short = 'I', long, value_name = "prog")]
    use_compress_program: Option<String>,

    /// Path of the tar binary
    #[arg(long, value_name = "path")]
    tar_path: Option<PathBuf>,

    /// Path of the rclone binary
    #[arg(long, value_name = "path")]
    rclone_path: Option<PathBuf>,

    /// Where to keep the metadata document instead of the remote
    #[arg(long, value_name = "path")]
    metadata_path: Option<String>,

    /// Prefix reserved for this tool's objects; [0-9A-Z_] only
    #[arg(long, value_name = "prefix")]
    reserved_prefix: Option<String>,

    /// More logging; repeat for more detail
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Print transfer statistics at the end
    #[arg(long)]
    stats: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local directory tree to an rclone remote
    Upload {
        #[command(flatten)]
        common: CommonArgs,

        /// Bytes charged per file on top of its length when grouping
        #[arg(long, value_name = "int")]
        file_base_bytes: Option<u64>,

        /// Upper bound on the accumulated size of a pack
        #[arg(long, value_name = "size")]
        merge_threshold: Option<String>,

        /// Minimum S3 chunk size passed to rclone
        #[arg(long, value_name = "size")]
        s3_min_chunk_size: Option<String>,

        /// Delete superseded remote objects before uploading
        #[arg(long)]
        delete_before_upload: bool,

        /// Grouping key: size, name, mtime, or ctime
        #[arg(long, value_name = "order")]
        grouping_order: Option<String>,

        /// Pack name suffix when the compression program is unknown
        #[arg(long, value_name = "suffix")]
        compression_suffix: Option<String>,

        /// Only upload these paths; may be repeated
        #[arg(long = "include-file", value_name = "path")]
        include_file: Vec<PathBuf>,

        /// Skip these paths; may be repeated
        #[arg(long = "exclude-file", value_name = "path")]
        exclude_file: Vec<PathBuf>,

        /// Local directory to upload
        local: PathBuf,

        /// rclone remote to upload into
        remote: String,
    },
    /// Download from an rclone remote into a local directory
    Download {
        #[command(flatten)]
        common: CommonArgs,

        /// rclone remote to download from
        remote: String,

        /// Local directory to restore into
        local: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

/// Apply the shared options on top of the defaults.
fn build_config(common: &CommonArgs) -> Result<SyncConfig, Error> {
    let mut conf = SyncConfig::default();
    conf.dest_as_empty = common.dest_as_empty;
    conf.use_file_checksum = common.use_file_checksum;
    conf.use_directory_mtime = common.use_directory_mtime;
    conf.use_owner = common.use_owner;
    if let Some(ref name) = common.checksum_choice {
        conf.hash = HashKind::from_str(name)?;
    }
    conf.ignore_errors = common.ignore_errors;
    conf.abort_on_error = common.abort_on_error;
    if let Some(ref args) = common.rclone_args {
        conf.rclone_args = args.split_whitespace().map(str::to_owned).collect();
    }
    if let Some(ref program) = common.use_compress_program {
        conf.compression = Some(program.clone());
    }
    if let Some(ref path) = common.tar_path {
        conf.tar_command = path.clone();
    }
    if let Some(ref path) = common.rclone_path {
        conf.rclone_command = path.clone();
    }
    if let Some(ref prefix) = common.reserved_prefix {
        if !valid_reserved_prefix(prefix) {
            return Err(anyhow!(
                "the reserved prefix may only contain upper-case alphanumeric characters or '_'"
            ));
        }
        conf.reserved_prefix = prefix.clone();
    }
    conf.metadata_path = common.metadata_path.clone();
    Ok(conf)
}

fn run() -> Result<ExitCode, Error> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Upload {
            common,
            file_base_bytes,
            merge_threshold,
            s3_min_chunk_size,
            delete_before_upload,
            grouping_order,
            compression_suffix,
            include_file,
            exclude_file,
            local,
            remote,
        } => {
            init_logging(common.verbose);
            warn_outside_msys();
            let mut conf = build_config(&common)?;
            if let Some(bytes) = file_base_bytes {
                conf.file_base_bytes = bytes;
            }
            if let Some(ref size) = merge_threshold {
                conf.merge_threshold = parse_size(size)?;
            }
            if let Some(ref size) = s3_min_chunk_size {
                conf.s3_min_chunk_size_kib = std::cmp::max(1, parse_size(size)? / 1024);
            }
            conf.delete_after_upload = !delete_before_upload;
            if let Some(ref order) = grouping_order {
                conf.grouping_order = GroupingOrder::from_str(order)?;
            }
            match compression_suffix {
                Some(ref suffix) => {
                    if !valid_compression_suffix(suffix) {
                        return Err(anyhow!(
                            "the compression suffix may only contain alphanumeric \
                             characters, '.' or '_'"
                        ));
                    }
                    conf.compression_suffix = suffix.clone();
                }
                None => {
                    if !conf.deduce_compression_suffix() {
                        return Err(anyhow!(
                            "unknown compression; please specify --compression-suffix"
                        ));
                    }
                }
            }
            conf.set_include_paths(&local, &include_file);
            conf.set_exclude_paths(&local, &exclude_file);
            conf.resolve_commands()?;

            let source: Arc<dyn PackSource> = Arc::new(RclonePackSource::new(&conf));
            let outcome = match upload::upload(&local, &remote, &conf, source) {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!("upload failed: {:?}", err);
                    eprintln!("tsuzura: {}", err);
                    return Ok(ExitCode::from(1));
                }
            };
            log::info!("upload finished: {}", outcome);
            if common.stats {
                println!("{}", outcome);
            }
            if outcome.error_count > 0 && !conf.ignore_errors {
                Ok(ExitCode::from(1))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Commands::Download {
            common,
            remote,
            local,
        } => {
            init_logging(common.verbose);
            warn_outside_msys();
            let mut conf = build_config(&common)?;
            if !conf.deduce_compression_suffix() {
                // only the program matters on this side; the suffix is
                // read from the metadata document's pack names
                conf.compression_suffix.clear();
            }
            conf.resolve_commands()?;

            let source: Arc<dyn PackSource> = Arc::new(RclonePackSource::new(&conf));
            let outcome = match download::download(&local, &remote, &conf, source) {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!("download failed: {:?}", err);
                    eprintln!("tsuzura: {}", err);
                    return Ok(ExitCode::from(1));
                }
            };
            log::info!("download finished: {}", outcome);
            if common.stats {
                println!("{}", outcome);
            }
            if outcome.error_count > 0 && !conf.ignore_errors {
                Ok(ExitCode::from(1))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

#[cfg(target_family = "windows")]
fn warn_outside_msys() {
    if std::env::var_os("MSYSTEM").is_none() {
        log::warn!("not running under an MSYS-like environment; tar may misbehave");
    }
}

#[cfg(not(target_family = "windows"))]
fn warn_outside_msys() {}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            error!("{:?}", err);
            eprintln!("tsuzura: {}", err);
            ExitCode::from(2)
        }
    }
}
