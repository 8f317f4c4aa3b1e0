//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file. Storage connections are declared once
//! under `[[storage]]` and referenced by name from each job's `[[job.storages]]`
//! entries; the reserved name `local` means the local filesystem.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name jobs use to reference the local filesystem backend.
pub const LOCAL_STORAGE: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root for per-job temporary artifacts
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default, rename = "storage")]
    pub storages: Vec<StorageConfig>,

    #[serde(default, rename = "job")]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Remote connection establishment timeout in seconds
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
}

/// A named remote storage connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub name: String,

    #[serde(flatten)]
    pub connection: StorageConnection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConnection {
    S3(S3Connection),
    Sftp(SftpConnection),
    Ftp(FtpConnection),
    Smb(MountConnection),
    Nfs(MountConnection),
    Webdav(WebDavConnection),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Connection {
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for S3-compatible services (MinIO, Ceph)
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub access_key_id: Option<String>,

    #[serde(default)]
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpConnection {
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Private key used instead of the password when set
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpConnection {
    pub host: String,

    #[serde(default = "default_ftp_port")]
    pub port: u16,

    #[serde(default = "default_ftp_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,
}

/// SMB and NFS shares are reached through their mount point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConnection {
    pub mount_point: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebDavConnection {
    pub url: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Full archive of every target on every run
    DescFiles,
    /// GNU incremental archives with generation metadata
    IncFiles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub job_type: JobType,

    /// Overrides the global tmp_dir for this job
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,

    /// Run the retention sweep only after a successful delivery
    #[serde(default)]
    pub safety_backup: bool,

    /// 0 = deliver per target, 1 = per source, 2+ = once per job
    #[serde(default)]
    pub deferred_copying_level: u32,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub storages: Vec<JobStorageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    /// Glob patterns of the paths to back up
    pub targets: Vec<String>,

    /// Regex (inc_files) or shell glob (desc_files) exclusions
    #[serde(default)]
    pub excludes: Vec<String>,

    #[serde(default)]
    pub save_abs_path: bool,

    #[serde(default = "default_gzip")]
    pub gzip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStorageConfig {
    /// Name of a `[[storage]]` entry, or `local`
    pub storage: String,

    /// Root directory (or key prefix) on the storage
    pub backup_path: String,

    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Raw retention values; validated into a `RetentionPolicy` at job build time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub days: i64,

    #[serde(default)]
    pub weeks: i64,

    #[serde(default)]
    pub months: i64,
}

// Default values
fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/var/tmp/backup-engine")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_secs() -> u64 {
    30
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ftp_port() -> u16 {
    21
}

fn default_ftp_user() -> String {
    "anonymous".to_string()
}

fn default_gzip() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn storage(&self, name: &str) -> Option<&StorageConfig> {
        self.storages.iter().find(|s| s.name == name)
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }
}
