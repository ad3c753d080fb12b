//! Host telemetry for periodic reports.

use std::time::Instant;

use sha2::{Digest, Sha256};
use spark_core::device::{Cpu, Net, Usage};
use spark_core::Device;
use sysinfo::{Disks, Networks, System};

/// Stable device id: hash of the host name and every non-zero MAC address.
pub fn derive_device_id(hostname: &str, macs: &[String]) -> String {
    let mut macs: Vec<&String> = macs.iter().filter(|m| !is_zero_mac(m)).collect();
    macs.sort();
    macs.dedup();

    let mut hasher = Sha256::new();
    hasher.update(hostname.as_bytes());
    for mac in macs {
        hasher.update(b"|");
        hasher.update(mac.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

fn is_zero_mac(mac: &str) -> bool {
    mac.chars().all(|c| c == '0' || c == ':')
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

/// Per-second rate of `bytes` accumulated over `secs`.
fn rate(bytes: u64, secs: f64) -> u64 {
    if secs <= 0.0 {
        0
    } else {
        (bytes as f64 / secs) as u64
    }
}

pub struct Reporter {
    system: System,
    networks: Networks,
    sampled_at: Instant,
    id: String,
    hostname: String,
    mac: String,
}

impl Reporter {
    /// `id` overrides the derived device id.
    pub fn new(id: Option<String>) -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        let networks = Networks::new_with_refreshed_list();

        let hostname = System::host_name().unwrap_or_default();
        let macs: Vec<String> = networks
            .list()
            .iter()
            .map(|(_, data)| data.mac_address().to_string())
            .collect();
        let mac = macs
            .iter()
            .find(|m| !is_zero_mac(m))
            .cloned()
            .unwrap_or_default();
        let id = id.unwrap_or_else(|| derive_device_id(&hostname, &macs));

        Self {
            system,
            networks,
            sampled_at: Instant::now(),
            id,
            hostname,
            mac,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sample the host. `lan` is the local address of the server connection.
    pub fn collect(&mut self, lan: &str) -> Device {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.networks.refresh();

        let elapsed = self.sampled_at.elapsed().as_secs_f64();
        self.sampled_at = Instant::now();
        let (sent, recv) = self
            .networks
            .list()
            .iter()
            .fold((0u64, 0u64), |(sent, recv), (_, data)| {
                (sent + data.transmitted(), recv + data.received())
            });

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_free) = disks.list().iter().fold((0u64, 0u64), |(t, f), d| {
            (t + d.total_space(), f + d.available_space())
        });

        let cpus = self.system.cpus();
        Device {
            id: self.id.clone(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            lan: lan.to_string(),
            wan: String::new(),
            mac: self.mac.clone(),
            hostname: self.hostname.clone(),
            username: username(),
            cpu: Cpu {
                model: cpus.first().map(|c| c.brand().to_string()).unwrap_or_default(),
                usage: f64::from(self.system.global_cpu_usage()),
                cores: cpus.len() as u32,
            },
            ram: Usage::new(self.system.total_memory(), self.system.used_memory()),
            net: Net {
                sent: rate(sent, elapsed),
                recv: rate(recv, elapsed),
            },
            disk: Usage::new(disk_total, disk_total.saturating_sub(disk_free)),
            uptime: System::uptime(),
        }
    }
}
