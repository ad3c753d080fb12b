//! In-memory channel and pty doubles for agent tests.

use std::io::Read;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spark_core::channel::BoxFuture;
use spark_core::{crypto, ChannelSlot, FrameSink, Packet, Secret, SecureChannel, SparkError, SparkResult};
use tokio::sync::mpsc;

use crate::terminal::{PtyBackend, PtyControl, Spawned};

/// Decrypts every frame the agent writes and hands the packet to the test.
struct DecryptingSink {
    secret: Secret,
    packets: mpsc::UnboundedSender<Packet>,
}

impl FrameSink for DecryptingSink {
    fn send_frame(&self, frame: Vec<u8>) -> BoxFuture<'_, SparkResult<()>> {
        Box::pin(async move {
            let json = crypto::decrypt(&frame, &self.secret)?;
            let _ = self.packets.send(serde_json::from_slice(&json)?);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Attach a recording channel to `slot`.
pub async fn attach_recorder(slot: &ChannelSlot) -> mpsc::UnboundedReceiver<Packet> {
    let secret = Secret::generate();
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = DecryptingSink {
        secret: secret.clone(),
        packets: tx,
    };
    slot.attach(Arc::new(SecureChannel::new(Arc::new(sink), secret)))
        .await;
    rx
}

pub async fn next_packet(packets: &mut mpsc::UnboundedReceiver<Packet>) -> Packet {
    tokio::time::timeout(Duration::from_secs(5), packets.recv())
        .await
        .expect("no packet within 5s")
        .expect("recorder closed")
}

/// Reader fed by [`FakeControl`]; EOF once the pty is closed.
struct FakeReader {
    rx: std_mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(Duration::from_secs(10)) {
                Ok(data) => self.pending = data,
                Err(_) => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Echoes writes back as output and logs every control call.
struct FakeControl {
    output: Option<std_mpsc::Sender<Vec<u8>>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeControl {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl PtyControl for FakeControl {
    fn write(&mut self, data: &[u8]) -> SparkResult<()> {
        self.record(format!("write {}", String::from_utf8_lossy(data)));
        if let Some(output) = &self.output {
            let _ = output.send(data.to_vec());
        }
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> SparkResult<()> {
        self.record(format!("resize {cols}x{rows}"));
        Ok(())
    }

    fn close_pty(&mut self) {
        self.output.take();
        self.record("close".into());
    }

    fn kill(&mut self) -> SparkResult<()> {
        self.record("kill".into());
        Ok(())
    }

    fn wait(&mut self) -> SparkResult<()> {
        self.record("wait".into());
        Ok(())
    }

    fn release(&mut self) {
        self.record("release".into());
    }
}

#[derive(Default)]
pub struct FakeBackend {
    pub log: Arc<Mutex<Vec<String>>>,
    pub fail: Mutex<bool>,
}

impl FakeBackend {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl PtyBackend for FakeBackend {
    fn spawn(&self, _shell: &str) -> SparkResult<Spawned> {
        if *self.fail.lock().unwrap() {
            return Err(SparkError::Other("exec format error".into()));
        }
        let (tx, rx) = std_mpsc::channel();
        Ok(Spawned {
            reader: Box::new(FakeReader {
                rx,
                pending: Vec::new(),
            }),
            control: Box::new(FakeControl {
                output: Some(tx),
                log: self.log.clone(),
            }),
        })
    }
}
