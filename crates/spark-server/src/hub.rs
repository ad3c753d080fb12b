//! Table of live agent connections.
//!
//! Every duplex connection gets an id at upgrade time and is indexed both by
//! that id and by its secret, which is how side-channel pushes find their
//! channel.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use spark_core::channel::BoxFuture;
use spark_core::{act, Packet, SecureChannel, SparkError, SparkResult};
use tracing::{debug, info, warn};

use crate::device::Evictor;

/// One live agent connection.
pub struct Connection {
    pub id: String,
    pub addr: Option<SocketAddr>,
    pub channel: Arc<SecureChannel>,
}

impl Connection {
    /// Peer IP as text, empty when unknown.
    pub fn ip(&self) -> String {
        self.addr.map(|a| a.ip().to_string()).unwrap_or_default()
    }
}

#[derive(Default)]
pub struct Hub {
    conns: DashMap<String, Arc<Connection>>,
    /// Secret hex to connection id.
    by_secret: DashMap<String, String>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. Fails if its secret is already in use.
    pub fn insert(&self, conn: Arc<Connection>) -> SparkResult<()> {
        let secret = conn.channel.secret().hex().to_string();
        match self.by_secret.entry(secret) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SparkError::Transport("secret already in use".into()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(conn.id.clone());
                debug!(conn = %conn.id, "connection added");
                self.conns.insert(conn.id.clone(), conn);
                Ok(())
            }
        }
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        let (_, conn) = self.conns.remove(id)?;
        self.by_secret.remove(conn.channel.secret().hex());
        Some(conn)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.conns.get(id).map(|c| c.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.conns.contains_key(id)
    }

    pub fn by_secret(&self, secret_hex: &str) -> Option<Arc<Connection>> {
        let id = self.by_secret.get(secret_hex)?.clone();
        self.get(&id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Send a packet to connection `id`.
    pub async fn send(&self, id: &str, packet: &Packet) -> SparkResult<()> {
        let conn = self
            .get(id)
            .ok_or_else(|| SparkError::DeviceUnreachable(id.to_string()))?;
        conn.channel.send_packet(packet).await
    }
}

impl Evictor for Hub {
    fn evict<'a>(&'a self, conn_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(conn) = self.remove(conn_id) else {
                return;
            };
            if let Err(e) = conn.channel.send_packet(&Packet::act(act::OFFLINE)).await {
                warn!(conn = %conn_id, error = %e, "failed to notify evicted connection");
            }
            conn.channel.close().await;
            info!(conn = %conn_id, "evicted stale connection");
        })
    }
}
