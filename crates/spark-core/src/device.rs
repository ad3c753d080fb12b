//! Telemetry snapshot an agent reports about its host.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cpu {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: f64,
    #[serde(default)]
    pub cores: u32,
}

/// Memory or disk usage in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub usage: f64,
}

impl Usage {
    pub fn new(total: u64, used: u64) -> Self {
        let usage = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        };
        Self { total, used, usage }
    }
}

/// Network throughput, bytes per second since the previous report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Net {
    #[serde(default)]
    pub sent: u64,
    #[serde(default)]
    pub recv: u64,
}

/// A device as described by its own reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable device identity, independent of the connection.
    pub id: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub lan: String,
    /// Peer address as seen by the server.
    #[serde(default)]
    pub wan: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub cpu: Cpu,
    #[serde(default)]
    pub ram: Usage,
    #[serde(default)]
    pub net: Net,
    #[serde(default)]
    pub disk: Usage,
    /// Seconds since boot.
    #[serde(default)]
    pub uptime: u64,
}
