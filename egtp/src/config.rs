use crate::framer::DEFAULT_MAX_MESSAGE_SIZE;
use crate::pool::PoolLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration file: {0}")]
    InvalidConfig(#[from] serde_yml::Error),
}

/// Node configuration. Every field has a default, so a configuration file only needs the values it changes.
/// Durations are whole seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EgtpConfig {
    pub max_message_size: usize,
    pub tcp_max_connections: usize,
    pub tcp_maintained_connections: usize,
    #[serde(with = "secs")]
    pub tcp_timeout: Duration,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// Port to listen on. When unset the port is derived from the node id.
    pub listen_port: Option<u16>,
    /// Fail instead of trying the next port when the chosen one is taken.
    pub picky_port: bool,
    pub listen_host: String,
    /// Host to announce instead of the listening address.
    pub announce_host: Option<String>,
    pub announce_port: Option<u16>,
    /// Announce a TCP address even when it is not publicly routable.
    pub allow_nonroutable_ip: bool,
    /// Attach our address record to the first message sent to each counterparty.
    pub send_metainfo: bool,
    #[serde(with = "secs")]
    pub default_timeout_mean: Duration,
    #[serde(with = "secs")]
    pub default_timeout_sigma: Duration,
    #[serde(with = "secs")]
    pub max_timeout: Duration,
    pub rtt_time_constant: f64,
    pub post_timeout_cache_size: usize,
    #[serde(with = "secs")]
    pub post_timeout_max_age: Duration,
    #[serde(with = "secs")]
    pub outstanding_max_age: Duration,
    pub outstanding_handicap_factor: f64,
    pub freshness_cache_size: usize,
    pub hello_cache_size: usize,
    #[serde(with = "secs")]
    pub hello_max_age: Duration,
    #[serde(with = "secs")]
    pub cleanup_interval: Duration,
    pub relay: RelayConfig,
    pub rsa_key_bits: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Poll relayers for messages even when we are reachable directly.
    pub poll_relayer: bool,
    /// Never poll, even when unreachable.
    pub never_poll: bool,
    pub num_preferred_relayers: usize,
    #[serde(with = "secs")]
    pub relayer_shopping_delay: Duration,
    #[serde(with = "secs")]
    pub min_poll_delay: Duration,
    pub stick_with_relayer_handicap: f64,
}

impl Default for EgtpConfig {
    fn default() -> Self {
        EgtpConfig {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            tcp_max_connections: 50,
            tcp_maintained_connections: 5,
            tcp_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            listen_port: None,
            picky_port: false,
            listen_host: "0.0.0.0".to_string(),
            announce_host: None,
            announce_port: None,
            allow_nonroutable_ip: false,
            send_metainfo: true,
            default_timeout_mean: Duration::from_secs(120),
            default_timeout_sigma: Duration::from_secs(20),
            max_timeout: Duration::from_secs(3600),
            rtt_time_constant: 10.0,
            post_timeout_cache_size: 200,
            post_timeout_max_age: Duration::from_secs(900),
            outstanding_max_age: Duration::from_secs(1200),
            outstanding_handicap_factor: 256.0,
            freshness_cache_size: 1000,
            hello_cache_size: 10_000,
            hello_max_age: Duration::from_secs(1800),
            cleanup_interval: Duration::from_secs(150),
            relay: RelayConfig::default(),
            rsa_key_bits: 1024,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            poll_relayer: false,
            never_poll: false,
            num_preferred_relayers: 8,
            relayer_shopping_delay: Duration::from_secs(300),
            min_poll_delay: Duration::from_secs(60),
            stick_with_relayer_handicap: 500.0,
        }
    }
}

impl EgtpConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let config = serde_yml::from_reader(reader)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_yml::to_writer(writer, self)?;
        Ok(())
    }

    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            max_connections: self.tcp_max_connections,
            maintained_connections: self.tcp_maintained_connections,
            idle_timeout: self.tcp_timeout,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempPath;

    #[test]
    fn save_and_load() {
        let mut config = EgtpConfig::default();
        config.listen_port = Some(4545);
        config.relay.poll_relayer = true;
        config.tcp_timeout = Duration::from_secs(7);
        let tmp = TempPath::from_path("test_egtp_config.yml");
        config.save(&tmp).expect("save config");
        let loaded = EgtpConfig::load(&tmp).expect("load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let config: EgtpConfig = serde_yml::from_str("tcp_max_connections: 7\nrelay:\n  min_poll_delay: 5\n")
            .expect("parse partial config");
        assert_eq!(config.tcp_max_connections, 7);
        assert_eq!(config.tcp_maintained_connections, 5);
        assert_eq!(config.relay.min_poll_delay, Duration::from_secs(5));
        assert_eq!(config.relay.num_preferred_relayers, 8);
        assert_eq!(config.pool_limits().max_connections, 7);
    }
}
