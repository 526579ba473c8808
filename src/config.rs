use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

use crate::{CloudArcError, Result};

pub const ENCRYPTION_KEY_ENV: &str = "ENCRYPTION_KEY";
pub const ENCRYPTION_KEY_LEN: usize = 32;

/// Built-in fallback key. Not secure; only suitable for tests and local
/// experiments, which is why key resolution logs when it is used.
const DEFAULT_ENCRYPTION_KEY: &[u8] = b"default-32-byte-encryption-key!!";

fn default_workers() -> usize {
    4
}

fn default_chunk_size() -> u64 {
    100 * 1024 * 1024
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_encrypt() -> bool {
    true
}

fn default_resume() -> bool {
    true
}

fn default_open_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    S3,
    Minio,
    Fs,
    Googledrive,
    Mega,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::S3 => "s3",
            Provider::Minio => "minio",
            Provider::Fs => "fs",
            Provider::Googledrive => "googledrive",
            Provider::Mega => "mega",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "s3" => Ok(Provider::S3),
            "minio" => Ok(Provider::Minio),
            "fs" => Ok(Provider::Fs),
            "googledrive" => Ok(Provider::Googledrive),
            "mega" => Ok(Provider::Mega),
            other => Err(CloudArcError::InvalidConfig {
                description: format!("Unknown storage provider: {}", other),
            }),
        }
    }
}

/// Fully-resolved settings record consumed by the pipeline. Loaded from an
/// optional YAML file, with CLI flags merged on top by the binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub sources: Vec<PathBuf>,

    #[serde(default)]
    pub filename: String,

    #[serde(default)]
    pub provider: Provider,

    #[serde(default)]
    pub bucket: Option<String>,

    /// Custom S3-compatible endpoint, e.g. a MinIO server.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub profile: Option<String>,

    #[serde(default)]
    pub access_key: Option<String>,

    #[serde(default)]
    pub secret_key: Option<String>,

    /// Base directory for the `fs` provider.
    #[serde(default)]
    pub target_dir: Option<PathBuf>,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_encrypt")]
    pub encrypt: bool,

    #[serde(default = "default_resume")]
    pub resume: bool,

    #[serde(default)]
    pub encryption_key: Option<String>,

    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sources: Vec::new(),
            filename: String::new(),
            provider: Provider::default(),
            bucket: None,
            endpoint: None,
            region: None,
            profile: None,
            access_key: None,
            secret_key: None,
            target_dir: None,
            workers: default_workers(),
            chunk_size: default_chunk_size(),
            buffer_size: default_buffer_size(),
            encrypt: default_encrypt(),
            resume: default_resume(),
            encryption_key: None,
            open_timeout_secs: default_open_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| CloudArcError::InvalidConfig {
                description: format!("Failed to read config file {}: {}", path.display(), e),
            })?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(yaml_str: &str) -> Result<Self> {
        serde_yaml::from_str(yaml_str).map_err(|e| CloudArcError::InvalidConfig {
            description: format!("Failed to parse config YAML: {}", e),
        })
    }

    /// Validates everything that must hold before the first remote call.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(CloudArcError::InvalidConfig {
                description: "At least one source path must be specified".to_string(),
            });
        }
        for source in &self.sources {
            let metadata = std::fs::symlink_metadata(source);
            if metadata.is_err() {
                return Err(CloudArcError::InvalidConfig {
                    description: format!("Source path does not exist: {}", source.display()),
                });
            }
        }
        if self.filename.is_empty() {
            return Err(CloudArcError::InvalidConfig {
                description: "A target filename must be specified".to_string(),
            });
        }
        if self.workers == 0 {
            return Err(CloudArcError::InvalidConfig {
                description: "workers must be at least 1".to_string(),
            });
        }
        if self.chunk_size == 0 {
            return Err(CloudArcError::InvalidConfig {
                description: "chunk_size must be greater than 0".to_string(),
            });
        }
        if self.buffer_size == 0 {
            return Err(CloudArcError::InvalidConfig {
                description: "buffer_size must be greater than 0".to_string(),
            });
        }

        match self.provider {
            Provider::S3 => {
                if self.bucket.is_none() {
                    return Err(CloudArcError::InvalidConfig {
                        description: "S3 provider requires a bucket".to_string(),
                    });
                }
            }
            Provider::Minio => {
                if self.bucket.is_none() {
                    return Err(CloudArcError::InvalidConfig {
                        description: "MinIO provider requires a bucket".to_string(),
                    });
                }
                if self.endpoint.is_none() {
                    return Err(CloudArcError::InvalidConfig {
                        description: "MinIO provider requires an endpoint".to_string(),
                    });
                }
            }
            Provider::Fs => {
                if self.target_dir.is_none() {
                    return Err(CloudArcError::InvalidConfig {
                        description: "fs provider requires target_dir".to_string(),
                    });
                }
            }
            Provider::Googledrive | Provider::Mega => {}
        }

        Ok(())
    }

    /// Resolves the AES-256 key: explicit config value, then the
    /// `ENCRYPTION_KEY` environment variable, then the built-in fallback.
    /// Raw material is zero-padded or truncated to exactly 32 bytes to
    /// match the historical behavior of the tool.
    pub fn resolve_encryption_key(&self) -> [u8; ENCRYPTION_KEY_LEN] {
        let raw: Vec<u8> = if let Some(key) = &self.encryption_key {
            key.as_bytes().to_vec()
        } else if let Ok(key) = std::env::var(ENCRYPTION_KEY_ENV) {
            key.into_bytes()
        } else {
            debug!("No encryption key configured; using built-in fallback key");
            DEFAULT_ENCRYPTION_KEY.to_vec()
        };

        let mut key = [0u8; ENCRYPTION_KEY_LEN];
        let n = raw.len().min(ENCRYPTION_KEY_LEN);
        key[..n].copy_from_slice(&raw[..n]);
        key
    }
}
