//! Registry of reporting devices, keyed by connection id.
//!
//! A device identity may be live on at most one connection. The first report
//! from a new connection evicts any older connection claiming the same
//! identity before the new record is visible.

use std::collections::HashMap;

use spark_core::channel::BoxFuture;
use spark_core::Device;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Tears down a stale connection: offline notice first, then close.
pub trait Evictor: Send + Sync {
    fn evict<'a>(&'a self, conn_id: &'a str) -> BoxFuture<'a, ()>;
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    // Serializes first reports so two new connections for one identity
    // cannot both pass the duplicate check.
    admission: Mutex<()>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a report received on `conn_id`.
    ///
    /// Returns the number of stale connections evicted.
    pub async fn upsert_from_report(
        &self,
        conn_id: &str,
        report: Device,
        evictor: &dyn Evictor,
    ) -> usize {
        {
            let mut devices = self.devices.write().await;
            if let Some(existing) = devices.get_mut(conn_id) {
                merge(existing, report);
                debug!(conn = %conn_id, "device telemetry updated");
                return 0;
            }
        }

        let _admission = self.admission.lock().await;

        let stale: Vec<String> = {
            let devices = self.devices.read().await;
            devices
                .iter()
                .filter(|(id, d)| id.as_str() != conn_id && d.id == report.id)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for old in &stale {
            info!(device = %report.id, old = %old, new = %conn_id, "device reconnected, evicting old connection");
            evictor.evict(old).await;
            self.devices.write().await.remove(old);
        }

        info!(conn = %conn_id, device = %report.id, hostname = %report.hostname, "device registered");
        self.devices.write().await.insert(conn_id.to_string(), report);
        stale.len()
    }

    /// Connection id currently serving device `id`.
    pub async fn resolve_by_identity(&self, id: &str) -> Option<String> {
        self.devices
            .read()
            .await
            .iter()
            .find(|(_, d)| d.id == id)
            .map(|(conn, _)| conn.clone())
    }

    pub async fn remove(&self, conn_id: &str) -> Option<Device> {
        let removed = self.devices.write().await.remove(conn_id);
        if let Some(device) = &removed {
            info!(conn = %conn_id, device = %device.id, "device offline");
        }
        removed
    }

    pub async fn contains(&self, conn_id: &str) -> bool {
        self.devices.read().await.contains_key(conn_id)
    }

    pub async fn get(&self, conn_id: &str) -> Option<Device> {
        self.devices.read().await.get(conn_id).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, Device> {
        self.devices.read().await.clone()
    }
}

/// Fold a later report into an existing record.
fn merge(existing: &mut Device, report: Device) {
    existing.cpu = report.cpu;
    existing.ram = report.ram;
    existing.net = report.net;
    existing.uptime = report.uptime;
    // Agents send an empty disk section when reading disk usage failed.
    if report.disk.total > 0 {
        existing.disk = report.disk;
    }
}
