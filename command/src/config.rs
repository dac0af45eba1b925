//! Harness configuration
//!
//! A [`FileConfig`] is what gets deserialized from TOML: every field is
//! optional. [`FileConfig::into_config`] fills in the defaults, validates
//! the values and yields the [`Config`] the harness runs with.
//!
//! ```toml
//! timeout_limit = 5.0
//! fault_mode = "shutdown"
//!
//! [[groups]]
//! name = "default"
//! [[groups.servers]]
//! address = "127.0.0.1:0"
//! conns_n = 4
//! ```

use std::{collections::HashSet, fmt, fs, net::SocketAddr, path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

/// seconds each wait step may last
pub const DEFAULT_TIMEOUT_LIMIT: f64 = 5.0;
pub const DEFAULT_POLL_SLICE_MS: u64 = 100;
pub const DEFAULT_BACKLOG: u32 = 1024;
/// connections a proxy opens to a server when the count is not configured
pub const DEFAULT_CONNS_N: usize = 32;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_LOG_TARGET: &str = "stdout";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {path}: {error}")]
    FileRead { path: String, error: std::io::Error },
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("timeout_limit must be a positive number of seconds, got {0}")]
    InvalidTimeout(f64),
    #[error("poll_slice_ms must be positive")]
    InvalidPollSlice,
    #[error("rounds must be at least 1")]
    InvalidRounds,
    #[error("server group {0} is declared twice")]
    DuplicateGroup(String),
    #[error("server group {0} has no server")]
    EmptyGroup(String),
    #[error("unknown fault mode {0}, expected close or shutdown")]
    UnknownFaultMode(String),
}

/// How the injected faults terminate backend connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultMode {
    /// local close: the proxy sees an orderly close
    Close,
    /// shutdown of both directions, then local close
    Shutdown,
}

impl fmt::Display for FaultMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultMode::Close => write!(f, "close"),
            FaultMode::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl FromStr for FaultMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "close" => Ok(FaultMode::Close),
            "shutdown" => Ok(FaultMode::Shutdown),
            other => Err(ConfigError::UnknownFaultMode(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileServerConfig {
    pub address: SocketAddr,
    pub conns_n: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileGroupConfig {
    pub name: String,
    #[serde(default)]
    pub servers: Vec<FileServerConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub timeout_limit: Option<f64>,
    pub poll_slice_ms: Option<u64>,
    pub fault_mode: Option<FaultMode>,
    pub rounds: Option<usize>,
    pub seed: Option<u64>,
    pub backlog: Option<u32>,
    pub log_level: Option<String>,
    pub log_target: Option<String>,
    #[serde(default)]
    pub groups: Vec<FileGroupConfig>,
}

impl FileConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<FileConfig, ConfigError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|error| ConfigError::FileRead {
            path: path.display().to_string(),
            error,
        })?;
        FileConfig::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<FileConfig, ConfigError> {
        Ok(toml::from_str(data)?)
    }

    pub fn into_config(self) -> Result<Config, ConfigError> {
        let timeout_limit = self.timeout_limit.unwrap_or(DEFAULT_TIMEOUT_LIMIT);
        if !(timeout_limit.is_finite() && timeout_limit > 0.0) {
            return Err(ConfigError::InvalidTimeout(timeout_limit));
        }
        let timeout = Duration::try_from_secs_f64(timeout_limit)
            .map_err(|_| ConfigError::InvalidTimeout(timeout_limit))?;

        let poll_slice_ms = self.poll_slice_ms.unwrap_or(DEFAULT_POLL_SLICE_MS);
        if poll_slice_ms == 0 {
            return Err(ConfigError::InvalidPollSlice);
        }

        let rounds = self.rounds.unwrap_or(1);
        if rounds == 0 {
            return Err(ConfigError::InvalidRounds);
        }

        let mut names = HashSet::new();
        let mut groups = Vec::with_capacity(self.groups.len());
        for group in self.groups {
            if !names.insert(group.name.clone()) {
                return Err(ConfigError::DuplicateGroup(group.name));
            }
            if group.servers.is_empty() {
                return Err(ConfigError::EmptyGroup(group.name));
            }
            let servers = group
                .servers
                .into_iter()
                .map(|server| ServerSpec {
                    address: server.address,
                    conns_n: server.conns_n.unwrap_or(DEFAULT_CONNS_N),
                })
                .collect();
            groups.push(GroupSpec {
                name: group.name,
                servers,
            });
        }

        Ok(Config {
            timeout_limit: timeout,
            poll_slice: Duration::from_millis(poll_slice_ms),
            fault_mode: self.fault_mode.unwrap_or(FaultMode::Close),
            rounds,
            seed: self.seed,
            backlog: self.backlog.unwrap_or(DEFAULT_BACKLOG),
            log_level: self
                .log_level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned()),
            log_target: self
                .log_target
                .unwrap_or_else(|| DEFAULT_LOG_TARGET.to_owned()),
            groups,
        })
    }
}

/// One backend server the proxy keeps `conns_n` connections to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub address: SocketAddr,
    pub conns_n: usize,
}

/// A named group of backend servers, as handed to the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub name: String,
    pub servers: Vec<ServerSpec>,
}

impl GroupSpec {
    pub fn conns_n(&self) -> usize {
        self.servers.iter().map(|server| server.conns_n).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub timeout_limit: Duration,
    pub poll_slice: Duration,
    pub fault_mode: FaultMode,
    pub rounds: usize,
    pub seed: Option<u64>,
    pub backlog: u32,
    pub log_level: String,
    pub log_target: String,
    pub groups: Vec<GroupSpec>,
}

impl Config {
    /// total number of backend connections the proxy should hold
    pub fn expected_conns_n(&self) -> usize {
        self.groups.iter().map(GroupSpec::conns_n).sum()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout_limit: Duration::from_secs_f64(DEFAULT_TIMEOUT_LIMIT),
            poll_slice: Duration::from_millis(DEFAULT_POLL_SLICE_MS),
            fault_mode: FaultMode::Close,
            rounds: 1,
            seed: None,
            backlog: DEFAULT_BACKLOG,
            log_level: DEFAULT_LOG_LEVEL.to_owned(),
            log_target: DEFAULT_LOG_TARGET.to_owned(),
            groups: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_filled_in() {
        let config = FileConfig::default()
            .into_config()
            .expect("empty config should be valid");
        assert_eq!(config, Config::default());
        assert_eq!(config.expected_conns_n(), 0);
    }

    #[test]
    fn parse_groups_and_sum_connections() {
        let data = r#"
            timeout_limit = 2.5
            fault_mode = "shutdown"
            rounds = 3
            seed = 7

            [[groups]]
            name = "main"
            [[groups.servers]]
            address = "127.0.0.1:8000"
            conns_n = 4
            [[groups.servers]]
            address = "127.0.0.1:8001"
            conns_n = 4

            [[groups]]
            name = "spare"
            [[groups.servers]]
            address = "127.0.0.1:8002"
        "#;

        let config = FileConfig::from_toml(data)
            .expect("could not parse config")
            .into_config()
            .expect("invalid config");

        assert_eq!(config.timeout_limit, Duration::from_millis(2500));
        assert_eq!(config.fault_mode, FaultMode::Shutdown);
        assert_eq!(config.rounds, 3);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.groups.len(), 2);
        assert_eq!(config.groups[1].servers[0].conns_n, DEFAULT_CONNS_N);
        assert_eq!(config.expected_conns_n(), 8 + DEFAULT_CONNS_N);
    }

    #[test]
    fn reject_invalid_values() {
        let zero_timeout = FileConfig {
            timeout_limit: Some(0.0),
            ..FileConfig::default()
        };
        assert!(matches!(
            zero_timeout.into_config(),
            Err(ConfigError::InvalidTimeout(_))
        ));

        let huge_timeout = FileConfig {
            timeout_limit: Some(1e20),
            ..FileConfig::default()
        };
        assert!(matches!(
            huge_timeout.into_config(),
            Err(ConfigError::InvalidTimeout(limit)) if limit == 1e20
        ));

        let no_rounds = FileConfig {
            rounds: Some(0),
            ..FileConfig::default()
        };
        assert!(matches!(
            no_rounds.into_config(),
            Err(ConfigError::InvalidRounds)
        ));

        let group = FileGroupConfig {
            name: "twice".to_owned(),
            servers: vec![FileServerConfig {
                address: "127.0.0.1:0".parse().unwrap(),
                conns_n: Some(1),
            }],
        };
        let duplicated = FileConfig {
            groups: vec![group.clone(), group],
            ..FileConfig::default()
        };
        assert!(matches!(
            duplicated.into_config(),
            Err(ConfigError::DuplicateGroup(name)) if name == "twice"
        ));

        assert!(FileConfig::from_toml("fault_mode = \"reset\"").is_err());
        assert!(FileConfig::from_toml("unknown_key = 1").is_err());
    }

    #[test]
    fn fault_mode_from_str() {
        assert_eq!("close".parse::<FaultMode>().ok(), Some(FaultMode::Close));
        assert_eq!(
            "shutdown".parse::<FaultMode>().ok(),
            Some(FaultMode::Shutdown)
        );
        assert!("abort".parse::<FaultMode>().is_err());
    }
}
