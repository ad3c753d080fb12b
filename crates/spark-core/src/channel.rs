//! Encrypted duplex channel shared by the agent and the server.
//!
//! A [`SecureChannel`] wraps one live connection's write half. Writes are
//! serialized and bounded by [`WRITE_DEADLINE`]; frames larger than
//! [`MAX_INLINE_FRAME`] go through a [`SideChannel`] instead.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::crypto::{self, Secret};
use crate::error::{SparkError, SparkResult};
use crate::packet::Packet;

/// Largest sealed frame written to the duplex connection.
pub const MAX_INLINE_FRAME: usize = 32768 + 1024;

/// Upper bound on a single frame write.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(5);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Write half of a framed duplex connection.
pub trait FrameSink: Send + Sync {
    /// Write one binary frame.
    fn send_frame(&self, frame: Vec<u8>) -> BoxFuture<'_, SparkResult<()>>;

    /// Close the connection.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Out-of-band path for frames too large for the duplex connection.
pub trait SideChannel: Send + Sync {
    /// Deliver an already sealed frame, identified by the connection secret.
    fn push<'a>(&'a self, secret_hex: &'a str, sealed: Vec<u8>) -> BoxFuture<'a, SparkResult<()>>;
}

/// One live connection with its secret.
pub struct SecureChannel {
    // The lock also serializes writers.
    sink: Mutex<Option<Arc<dyn FrameSink>>>,
    secret: Secret,
    side_channel: Option<Arc<dyn SideChannel>>,
}

impl SecureChannel {
    pub fn new(sink: Arc<dyn FrameSink>, secret: Secret) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
            secret,
            side_channel: None,
        }
    }

    pub fn with_side_channel(mut self, side_channel: Arc<dyn SideChannel>) -> Self {
        self.side_channel = Some(side_channel);
        self
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn seal(&self, packet: &Packet) -> SparkResult<Vec<u8>> {
        let json = serde_json::to_vec(packet)?;
        crypto::encrypt(&json, &self.secret)
    }

    pub fn open(&self, frame: &[u8]) -> SparkResult<Packet> {
        let json = crypto::decrypt(frame, &self.secret)?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Write a raw frame under the write deadline.
    pub async fn send_frame(&self, frame: Vec<u8>) -> SparkResult<()> {
        let guard = self.sink.lock().await;
        let sink = guard.as_ref().ok_or(SparkError::ChannelUnavailable)?;
        match tokio::time::timeout(WRITE_DEADLINE, sink.send_frame(frame)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("frame write exceeded deadline");
                Err(SparkError::WriteTimeout)
            }
        }
    }

    /// Seal and send a packet, diverting oversized frames to the side channel.
    pub async fn send_packet(&self, packet: &Packet) -> SparkResult<()> {
        let sealed = self.seal(packet)?;
        if sealed.len() <= MAX_INLINE_FRAME {
            return self.send_frame(sealed).await;
        }

        let side = self.side_channel.as_ref().ok_or_else(|| {
            SparkError::Transport(format!(
                "frame of {} bytes exceeds {MAX_INLINE_FRAME} and no side channel is configured",
                sealed.len()
            ))
        })?;
        debug!(len = sealed.len(), act = %packet.act, "frame diverted to side channel");
        side.push(self.secret.hex(), sealed).await
    }

    /// Send `reply` carrying the correlation token of `original`.
    pub async fn send_reply(&self, mut reply: Packet, original: &Packet) -> SparkResult<()> {
        reply.echo_event(original);
        self.send_packet(&reply).await
    }

    /// Detach and close the underlying connection. Later sends fail.
    pub async fn close(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(sink) = sink {
            sink.close().await;
        }
    }

    pub async fn is_open(&self) -> bool {
        self.sink.lock().await.is_some()
    }
}

/// Holder for the agent's single current connection.
///
/// The supervisor swaps channels on reconnect; everything else sends through
/// whichever channel is attached at the time.
#[derive(Default)]
pub struct ChannelSlot {
    current: RwLock<Option<Arc<SecureChannel>>>,
}

impl ChannelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a channel, returning the one it replaces.
    pub async fn attach(&self, channel: Arc<SecureChannel>) -> Option<Arc<SecureChannel>> {
        self.current.write().await.replace(channel)
    }

    /// Remove `channel` if it is still the current one.
    pub async fn detach(&self, channel: &Arc<SecureChannel>) -> bool {
        let mut current = self.current.write().await;
        match current.as_ref() {
            Some(c) if Arc::ptr_eq(c, channel) => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    pub async fn current(&self) -> SparkResult<Arc<SecureChannel>> {
        self.current
            .read()
            .await
            .clone()
            .ok_or(SparkError::ChannelUnavailable)
    }

    pub async fn send_packet(&self, packet: &Packet) -> SparkResult<()> {
        self.current().await?.send_packet(packet).await
    }

    pub async fn send_reply(&self, reply: Packet, original: &Packet) -> SparkResult<()> {
        self.current().await?.send_reply(reply, original).await
    }
}
