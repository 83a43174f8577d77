//! Job and runtime configuration.
//!
//! # Key Components
//!
//! - [`JobConfig`]: parallelism and termination settings of one job.
//! - [`RuntimeConfig`]: per-partition runtime environment options.
//! - [`RuntimeType`]: runtime implementation selection.

use std::path::Path;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{AnyResult, FabricError};

mod parsers;
use parsers::parse;

// MAX configuration file size: 16 MB
const MAX_CONFIG_FILE_SIZE: usize = 16 * 1024 * 1024;
// Read buffer size: 8 KB
const READ_BUFFER_SIZE: usize = 8 * 1024;
// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

fn default_entries() -> u32 {
    DEFAULT_ENTRIES
}

fn default_parallelism() -> u32 {
    let num_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    match num_cpus {
        n if n > (u32::MAX as usize) => u32::MAX,
        n => n as u32,
    }
}

fn default_cpu_affinity() -> bool {
    true
}

/// Settings of one parameter-server job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Number of worker partitions.
    #[serde(default = "default_parallelism")]
    pub worker_parallelism: u32,

    /// Number of server partitions.
    #[serde(default = "default_parallelism")]
    pub server_parallelism: u32,

    /// Maximum idle interval of the feedback loop in milliseconds before the
    /// job terminates normally. Zero means the job never self-terminates.
    #[serde(default)]
    pub iteration_wait_ms: u64,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl JobConfig {
    pub fn new(worker_parallelism: u32, server_parallelism: u32, iteration_wait_ms: u64) -> Self {
        Self {
            worker_parallelism,
            server_parallelism,
            iteration_wait_ms,
            runtime: RuntimeConfig::default(),
        }
    }

    pub fn validate(&self) -> AnyResult<()> {
        if self.worker_parallelism == 0 {
            return Err(FabricError::InvalidParallelism(self.worker_parallelism).into());
        }
        if self.server_parallelism == 0 {
            return Err(FabricError::InvalidParallelism(self.server_parallelism).into());
        }
        Ok(())
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self::new(default_parallelism(), default_parallelism(), 0)
    }
}

/// Configuration options for the per-partition runtime environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of I/O entries for event handling for io_uring.
    #[serde(default = "default_entries")]
    pub entries: u32,

    /// Idle timeout for sq polling (io_uring specific).
    pub sqpoll_idle: Option<u32>,

    /// The type of runtime to use.
    #[serde(default)]
    pub runtime_type: RuntimeType,

    /// Whether to bind partition threads to CPU cores.
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }

    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            entries: default_entries(),
            sqpoll_idle: None,
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
        }
    }
}

async fn read_file(path: impl AsRef<Path>) -> AnyResult<Bytes> {
    let mut data = BytesMut::new();

    let file = match monoio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => bail!("Config: error open file: {:?}", e),
    };

    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut current: u64 = 0;

    loop {
        let (res, buf) = file.read_at(buffer, current).await;
        let n = res?;
        buffer = buf;

        if data.len() + n > MAX_CONFIG_FILE_SIZE {
            bail!("Config: max file size: {}", MAX_CONFIG_FILE_SIZE);
        }

        data.extend_from_slice(&buffer[..n]);

        if n < READ_BUFFER_SIZE {
            break;
        }

        current += n as u64;
        buffer.clear();
    }

    Ok(Bytes::from(data))
}

fn parse_extension(path: &impl AsRef<Path>) -> String {
    path.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Load any deserializable config from a TOML or JSON file, selected by
/// extension.
pub async fn load_config<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> AnyResult<T> {
    parse(&parse_extension(&path), &read_file(path).await?)
}
