use crate::shared::{ErrorKind, NetError, NetResult};
use serde_derive::Deserialize;
use std::path::Path;

/// Address family selector for the listener. `Tcp` takes whatever the host
/// resolves to first; `Tcp4`/`Tcp6` restrict resolution to one family.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcpVersion {
    Tcp,
    Tcp4,
    Tcp6,
}

impl Default for TcpVersion {
    fn default() -> TcpVersion {
        TcpVersion::Tcp
    }
}

/// Endpoint configuration. Every field has a default, so a TOML fragment only
/// needs to name what it overrides. Rates are in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub tcp_version: TcpVersion,
    /// Accept limit; 0 means unlimited.
    pub max_connects: i64,
    /// Largest accepted frame payload in bytes.
    pub max_pack_size: u32,
    pub bucket_count: usize,
    pub bucket_read_rate: f64,
    pub little_endian: bool,
    /// Period of the map-compaction tick.
    pub gc_rate: f64,
    /// Message id used by groups to report read errors to clients; 0 disables.
    pub err_msg_id: u32,
    /// Per-call write deadline in seconds; 0 disables the deadline.
    pub write_deadline: f64,
    pub registry: RegistryConfig,
    pub dispatch: DispatchConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: "0.0.0.0".to_owned(),
            port: 5300,
            tcp_version: TcpVersion::default(),
            max_connects: 0,
            max_pack_size: 2048,
            bucket_count: 3,
            bucket_read_rate: 0.2,
            little_endian: true,
            gc_rate: 300.0,
            err_msg_id: 0,
            write_deadline: 10.0,
            registry: RegistryConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Idle cutoff: a connection with no successful I/O for this many seconds
    /// is evicted by the reaper.
    pub un_active_seconds: i64,
    /// Reaper tick period in seconds.
    pub reap_rate: f64,
}

impl Default for RegistryConfig {
    fn default() -> RegistryConfig {
        RegistryConfig {
            un_active_seconds: 60,
            reap_rate: 60.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Handler worker count; clamped to 1..=128 when the pool is spawned.
    pub workers: usize,
    /// Per-worker queue capacity.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> DispatchConfig {
        DispatchConfig {
            workers: 5,
            queue_capacity: 1024,
        }
    }
}

impl Config {
    pub fn from_toml_str(toml: &str) -> NetResult<Config> {
        let config: Config =
            serdeconv::from_toml_str(toml).map_err(|_| NetError::Fatal(ErrorKind::Codec))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> NetResult<Config> {
        let config: Config =
            serdeconv::from_toml_file(path).map_err(|_| NetError::Fatal(ErrorKind::Codec))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NetResult<()> {
        if self.host.is_empty()
            || self.bucket_count == 0
            || self.max_pack_size == 0
            || self.bucket_read_rate <= 0.0
            || self.gc_rate <= 0.0
            || self.write_deadline < 0.0
            || self.max_connects < 0
            || self.registry.un_active_seconds <= 0
            || self.registry.reap_rate <= 0.0
            || self.dispatch.workers == 0
            || self.dispatch.queue_capacity == 0
        {
            return Err(NetError::Fatal(ErrorKind::InvalidArgument));
        }

        Ok(())
    }
}
