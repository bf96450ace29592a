use serde_derive::Deserialize;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "stoker.toml";

/// Top-level worker configuration, loaded from a TOML file. Every section
/// falls back to its defaults, and unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub net: NetConfig,
    pub net_security: NetSecurityConfig,
    pub proc: ProcConfig,
    pub log: LogConfig,
}

/// Listener, pool and timer wiring.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Connection pool size per worker.
    pub worker_connections: usize,
    /// Address the listening sockets bind to.
    pub bind_address: String,
    /// One listening socket is opened per port.
    pub listen_ports: Vec<u16>,
    /// Grace period before a reclaimed connection is reusable, in seconds.
    pub recycle_wait_secs: u64,
    /// Enables the timer wheel.
    pub wait_time_enable: bool,
    /// Idle interval in seconds; connections silent for this long are
    /// eligible for the idle kick.
    pub max_wait_secs: u64,
    /// Close idle connections when their idle timer fires.
    pub timeout_kick: bool,
    /// Allocate overflow connections past the pool size instead of
    /// refusing new sockets.
    pub allow_overflow: bool,
}

/// Flood-defense knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetSecurityConfig {
    pub flood_kick_enable: bool,
    /// Short sliding window, in milliseconds.
    pub flood_time_interval_ms: u64,
    /// Requests allowed inside the short window.
    pub flood_kick_counter: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcConfig {
    /// Handler-execution thread count.
    pub msg_recv_work_thread_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log file path; when absent logging goes to stderr.
    pub file: Option<String>,
    /// One of trace, debug, info, warning, error, critical.
    pub level: String,
    /// Rotate the log file once it reaches this many bytes.
    pub max_file_size: u64,
    /// Number of rotated files to keep.
    pub max_files: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            net: NetConfig::default(),
            net_security: NetSecurityConfig::default(),
            proc: ProcConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for NetConfig {
    fn default() -> NetConfig {
        NetConfig {
            worker_connections: 2048,
            bind_address: "0.0.0.0".to_string(),
            listen_ports: vec![8080],
            recycle_wait_secs: 60,
            wait_time_enable: true,
            max_wait_secs: 1800,
            timeout_kick: false,
            allow_overflow: false,
        }
    }
}

impl Default for NetSecurityConfig {
    fn default() -> NetSecurityConfig {
        NetSecurityConfig {
            flood_kick_enable: false,
            flood_time_interval_ms: 100,
            flood_kick_counter: 10,
        }
    }
}

impl Default for ProcConfig {
    fn default() -> ProcConfig {
        ProcConfig {
            msg_recv_work_thread_count: 5,
        }
    }
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            file: None,
            level: "info".to_string(),
            max_file_size: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ServerConfig, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    pub fn from_toml_str(toml: &str) -> Result<ServerConfig, serdeconv::Error> {
        serdeconv::from_toml_str(toml)
    }
}
