use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address
    pub bind_addr: String,

    /// Port for the RESP listener
    pub port: u16,

    /// Optional port for the memcache text-protocol listener
    pub memcache_port: Option<u16>,

    /// Number of engine shards (worker threads). 0 = number of CPUs.
    pub threads: usize,

    /// Initial per-connection read buffer capacity
    pub read_buf_min: usize,

    /// Read buffer growth ceiling; a parser length hint may exceed it
    pub read_buf_max: usize,

    /// TCP nodelay
    pub tcp_nodelay: bool,

    /// Answer `GET ... HTTP/1.1` probes on the RESP port with the
    /// admin console instead of treating them as RESP traffic
    pub http_admin_console: bool,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 6379,
            memcache_port: None,
            threads: num_cpus::get(),
            read_buf_min: 256,
            read_buf_max: 32 * 1024,
            tcp_nodelay: true,
            http_admin_console: true,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use spindle_server::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("config.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.threads == 0 {
            anyhow::bail!("threads must be > 0");
        }

        if self.read_buf_min < 16 {
            anyhow::bail!("read_buf_min must be >= 16");
        }

        if self.read_buf_max < self.read_buf_min {
            anyhow::bail!("read_buf_max must be >= read_buf_min");
        }

        if let Some(mc) = self.memcache_port {
            if mc != 0 && mc == self.port {
                anyhow::bail!("memcache_port must differ from the RESP port");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let mut config = Config::default();
        config.threads = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_threads() {
        let config = Config {
            threads: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_clashing_ports() {
        let config = Config {
            port: 6379,
            memcache_port: Some(6379),
            threads: 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_buffer_bounds() {
        let config = Config {
            read_buf_min: 4096,
            read_buf_max: 1024,
            threads: 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
