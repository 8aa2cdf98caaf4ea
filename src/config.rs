//! Daemon configuration.
//!
//! The configuration is read from a YAML file. Every field has a default, so
//! a partial file (or no file at all) still yields a usable config.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filter::RuleSet;
use crate::upstream::normalize_bootstrap;

/// Default path of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dnsbro/config.yaml";

const DEFAULT_DOH_ENDPOINT: &str = "https://1.1.1.1/dns-query";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RETRIES: usize = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Runtime configuration of the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address both transports bind to.
    pub listen: SocketAddr,
    pub upstream: UpstreamConfig,
    pub rules: RulesConfig,
    pub log: LogConfig,
}

/// DNS-over-HTTPS upstream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub doh_endpoint: String,
    /// Budget for a whole query, retries included.
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Nameservers used only to resolve the endpoint's hostname.
    pub bootstrap: Vec<String>,
    /// Forwarding attempts per query.
    pub retries: usize,
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub blocklist: Vec<String>,
    pub allowlist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 53)),
            upstream: UpstreamConfig::default(),
            rules: RulesConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            doh_endpoint: DEFAULT_DOH_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            bootstrap: normalize_bootstrap(&[]),
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: None,
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Read and validate the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let mut config = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(text)?
        };

        if config.upstream.timeout.is_zero() {
            config.upstream.timeout = DEFAULT_TIMEOUT;
        }
        config.upstream.bootstrap = normalize_bootstrap(&config.upstream.bootstrap);
        config.validate()?;

        Ok(config)
    }

    /// Persist the config, creating parent directories when needed.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_yaml()?)?;
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check the fields the daemon cannot run without.
    pub fn validate(&self) -> Result<()> {
        let endpoint = self.upstream.doh_endpoint.trim();
        if endpoint.is_empty() {
            return Err(Error::config("upstream.doh_endpoint", "required"));
        }
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| Error::config("upstream.doh_endpoint", e.to_string()))?;
        if url.scheme() != "https" {
            return Err(Error::config(
                "upstream.doh_endpoint",
                format!("scheme must be https, got {}", url.scheme()),
            ));
        }
        if url.host_str().is_none() {
            return Err(Error::config("upstream.doh_endpoint", "missing host"));
        }

        for server in normalize_bootstrap(&self.upstream.bootstrap) {
            if server.parse::<SocketAddr>().is_err() {
                return Err(Error::config(
                    "upstream.bootstrap",
                    format!("{server} is not an ip:port address"),
                ));
            }
        }

        Ok(())
    }

    /// Build the rule set described by this config.
    pub fn rule_set(&self) -> RuleSet {
        RuleSet::new(self.rules.blocklist.clone(), self.rules.allowlist.clone())
    }

    /// Configured log file, ignoring an empty path.
    pub fn log_file(&self) -> Option<&Path> {
        self.log
            .file
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

/// Parse durations such as `250ms`, `5s`, `1.5s`, `2m` or `1h`.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let millis_per_unit: u64 = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => return Err(format!("unknown duration unit {other:?} in {text:?}")),
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(millis_per_unit)
            .map(Duration::from_millis)
            .ok_or_else(|| format!("duration {text:?} overflows"));
    }

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {text:?}"))?;
    Duration::try_from_secs_f64(value * millis_per_unit as f64 / 1_000.0)
        .map_err(|e| format!("invalid duration {text:?}: {e}"))
}

fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}
