//! Agent configuration: TOML file + CLI overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use spark_core::{SparkError, SparkResult};
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
}

/// `[agent]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_server")]
    pub server: String,
    /// Seconds between reports.
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
    /// Seconds to wait before reconnecting.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u64,
    #[serde(default)]
    pub device_id: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            server: default_server(),
            report_interval: default_report_interval(),
            reconnect_delay: default_reconnect_delay(),
            device_id: None,
        }
    }
}

fn default_server() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_report_interval() -> u64 {
    3
}
fn default_reconnect_delay() -> u64 {
    3
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server base URL, `http://` or `https://`.
    pub server: String,
    pub report_interval: Duration,
    pub reconnect_delay: Duration,
    pub device_id: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentSection::default().into()
    }
}

impl From<AgentSection> for AgentConfig {
    fn from(section: AgentSection) -> Self {
        Self {
            server: section.server,
            report_interval: Duration::from_secs(section.report_interval.max(1)),
            reconnect_delay: Duration::from_secs(section.reconnect_delay),
            device_id: section.device_id.filter(|id| !id.is_empty()),
        }
    }
}

impl AgentConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_server: Option<&str>,
        cli_device_id: Option<&str>,
    ) -> SparkResult<Self> {
        let mut file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| SparkError::Other(format!("config parse error: {e}")))?
                } else {
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        if let Some(server) = cli_server {
            file_config.agent.server = server.to_string();
        }
        if let Some(id) = cli_device_id {
            file_config.agent.device_id = Some(id.to_string());
        }
        Ok(file_config.agent.into())
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_and_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            "[agent]\nserver = \"https://spark.lan\"\nreport_interval = 10\ndevice_id = \"\"\n",
        )
        .unwrap();

        let config = AgentConfig::load(Some(&path), None, None).unwrap();
        assert_eq!(config.server, "https://spark.lan");
        assert_eq!(config.report_interval, Duration::from_secs(10));
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.device_id, None);

        let config = AgentConfig::load(Some(&path), Some("http://10.0.0.1:8000"), Some("pc-1")).unwrap();
        assert_eq!(config.server, "http://10.0.0.1:8000");
        assert_eq!(config.device_id.as_deref(), Some("pc-1"));
    }

    #[test]
    fn zero_report_interval_is_clamped() {
        let section = AgentSection {
            report_interval: 0,
            ..AgentSection::default()
        };
        assert_eq!(AgentConfig::from(section).report_interval, Duration::from_secs(1));
    }
}
