use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn, LevelFilter};

use cloudarc::cancel::CancelToken;
use cloudarc::config::{Config, Provider};
use cloudarc::pipeline::Pipeline;
use cloudarc::CloudArcError;

#[derive(Parser, Debug)]
#[command(
    name = "cloudarc",
    version,
    about = "Stream local paths into an encrypted tar archive on remote object storage."
)]
struct Args {
    /// Source files or directories to archive (repeatable).
    #[arg(short = 's', long = "source")]
    sources: Vec<PathBuf>,

    /// Remote object name.
    #[arg(short = 'f', long = "filename")]
    filename: Option<String>,

    /// Storage provider: s3, minio, fs, googledrive, mega.
    #[arg(short = 'p', long = "provider")]
    provider: Option<String>,

    /// S3/MinIO bucket name.
    #[arg(short = 'b', long = "bucket")]
    bucket: Option<String>,

    /// Custom S3-compatible endpoint, e.g. http://localhost:9000.
    #[arg(long = "endpoint")]
    endpoint: Option<String>,

    /// AWS region.
    #[arg(long = "region")]
    region: Option<String>,

    /// AWS profile.
    #[arg(long = "profile")]
    profile: Option<String>,

    /// Access key for MinIO or S3-compatible endpoints.
    #[arg(long = "access-key")]
    access_key: Option<String>,

    /// Secret key for MinIO or S3-compatible endpoints.
    #[arg(long = "secret-key")]
    secret_key: Option<String>,

    /// Base directory for the fs provider.
    #[arg(long = "target-dir")]
    target_dir: Option<PathBuf>,

    /// Number of concurrent upload workers.
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,

    /// Part size for multipart uploads, in bytes.
    #[arg(long = "chunk-size")]
    chunk_size: Option<u64>,

    /// Copy buffer size for streaming operations, in bytes.
    #[arg(long = "buffer-size")]
    buffer_size: Option<usize>,

    /// Enable encryption.
    #[arg(short = 'e', long = "encrypt")]
    encrypt: Option<bool>,

    /// Attempt to resume an interrupted upload.
    #[arg(short = 'r', long = "resume")]
    resume: Option<bool>,

    /// Path to a YAML settings file; flags override its values.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    verbose: bool,
}

const EXIT_CANCELLED: u8 = 130;

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::builder()
        .format_timestamp(None)
        .filter_level(if args.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CloudArcError::Cancelled) => {
            error!("Upload cancelled");
            ExitCode::from(EXIT_CANCELLED)
        }
        Err(e) => {
            error!("Upload failed: {}", e);
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                error!("  caused by: {}", cause);
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), CloudArcError> {
    let config = merge_config(args)?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("Received interrupt signal, cancelling");
        handler_token.cancel();
    })
    .map_err(|e| CloudArcError::InvalidConfig {
        description: format!("Failed to install signal handler: {}", e),
    })?;

    let pipeline = Pipeline::new(config.clone(), cancel)?;
    info!(
        "Starting archive upload: {:?} -> {}://{}",
        config.sources,
        config.provider.as_str(),
        config.filename
    );

    pipeline.run().map(|report| {
        info!(
            "Upload completed: {} ({}, {})",
            report.object,
            if report.multipart {
                "multipart"
            } else {
                "single part"
            },
            if report.resumed { "resumed" } else { "fresh" }
        );
    })
}

/// Starts from the optional YAML file and lets every explicitly-passed
/// flag override it.
fn merge_config(args: Args) -> Result<Config, CloudArcError> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };

    if !args.sources.is_empty() {
        config.sources = args.sources;
    }
    if let Some(filename) = args.filename {
        config.filename = filename;
    }
    if let Some(provider) = args.provider {
        config.provider = Provider::parse(&provider)?;
    }
    if let Some(bucket) = args.bucket {
        config.bucket = Some(bucket);
    }
    if let Some(endpoint) = args.endpoint {
        config.endpoint = Some(endpoint);
    }
    if let Some(region) = args.region {
        config.region = Some(region);
    }
    if let Some(profile) = args.profile {
        config.profile = Some(profile);
    }
    if let Some(access_key) = args.access_key {
        config.access_key = Some(access_key);
    }
    if let Some(secret_key) = args.secret_key {
        config.secret_key = Some(secret_key);
    }
    if let Some(target_dir) = args.target_dir {
        config.target_dir = Some(target_dir);
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(buffer_size) = args.buffer_size {
        config.buffer_size = buffer_size;
    }
    if let Some(encrypt) = args.encrypt {
        config.encrypt = encrypt;
    }
    if let Some(resume) = args.resume {
        config.resume = resume;
    }

    Ok(config)
}
