//! Duplex link to the server and the supervisor that keeps it alive.
//!
//! Each connection gets a fresh [`Secret`], sent in the `Secret` header of
//! the websocket upgrade. Frames too large for the socket are posted to the
//! same endpoint over HTTP with that header.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use spark_core::channel::BoxFuture;
use spark_core::{
    act, ChannelSlot, FrameSink, Packet, Secret, SecureChannel, SideChannel, SparkError,
    SparkResult,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::dispatch::{self, Flow};
use crate::files::FileService;
use crate::report::Reporter;
use crate::terminal::{NativePty, PtyBackend, TerminalManager};

pub const SECRET_HEADER: &str = "Secret";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// `http(s)://host` to `ws(s)://host/api/ws`.
pub fn ws_url(server: &str) -> SparkResult<String> {
    let server = server.trim_end_matches('/');
    let rest = if let Some(rest) = server.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_string()
    } else {
        return Err(SparkError::Transport(format!("unsupported server URL: {server}")));
    };
    Ok(format!("{rest}/api/ws"))
}

/// Write half of the agent's websocket.
struct WsSink {
    sink: AsyncMutex<SplitSink<WsStream, Message>>,
}

impl FrameSink for WsSink {
    fn send_frame(&self, frame: Vec<u8>) -> BoxFuture<'_, SparkResult<()>> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Binary(frame))
                .await
                .map_err(|e| SparkError::Transport(format!("WS write error: {e}")))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        })
    }
}

/// Posts oversized frames to `/api/ws`.
pub struct HttpSideChannel {
    http: reqwest::Client,
    url: String,
}

impl HttpSideChannel {
    pub fn new(http: reqwest::Client, server: &str) -> Self {
        Self {
            http,
            url: format!("{}/api/ws", server.trim_end_matches('/')),
        }
    }
}

impl SideChannel for HttpSideChannel {
    fn push<'a>(&'a self, secret_hex: &'a str, sealed: Vec<u8>) -> BoxFuture<'a, SparkResult<()>> {
        Box::pin(async move {
            let response = self
                .http
                .post(&self.url)
                .header(SECRET_HEADER, secret_hex)
                .body(sealed)
                .send()
                .await
                .map_err(|e| SparkError::Transport(e.to_string()))?;
            if !response.status().is_success() {
                return Err(SparkError::Transport(format!(
                    "side channel rejected frame: {}",
                    response.status()
                )));
            }
            Ok(())
        })
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Disconnected,
    /// The server asked the agent to go away for good.
    Offline,
}

/// Everything the agent keeps across reconnects.
pub struct Agent {
    pub config: AgentConfig,
    pub slot: Arc<ChannelSlot>,
    pub terminals: Arc<TerminalManager>,
    pub files: FileService,
    http: reqwest::Client,
    reporter: Mutex<Reporter>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        Self::with_backend(config, Arc::new(NativePty))
    }

    pub fn with_backend(config: AgentConfig, backend: Arc<dyn PtyBackend>) -> Arc<Self> {
        let http = reqwest::Client::new();
        let slot = Arc::new(ChannelSlot::new());
        Arc::new(Self {
            terminals: TerminalManager::new(backend, slot.clone()),
            files: FileService::new(http.clone(), config.server.clone()),
            reporter: Mutex::new(Reporter::new(config.device_id.clone())),
            slot,
            http,
            config,
        })
    }

    pub fn device_id(&self) -> String {
        self.reporter
            .lock()
            .map(|r| r.id().to_string())
            .unwrap_or_default()
    }

    fn report(&self, lan: &str) -> SparkResult<Packet> {
        let device = self
            .reporter
            .lock()
            .map_err(|_| SparkError::Other("reporter poisoned".into()))?
            .collect(lan);
        let serde_json::Value::Object(fields) = serde_json::to_value(device)? else {
            return Err(SparkError::Serialization("device is not an object".into()));
        };
        let mut packet = Packet::act(act::REPORT);
        packet.data = fields;
        Ok(packet)
    }

    /// Connect, serve, and reconnect until the server sends `offline`.
    pub async fn run(self: Arc<Self>) {
        let reaper = tokio::spawn(self.terminals.clone().run_reaper());
        loop {
            match self.connect_once().await {
                Ok(Exit::Offline) => break,
                Ok(Exit::Disconnected) => info!("disconnected from server"),
                Err(e) => warn!(error = %e, "connection failed"),
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
        reaper.abort();
        self.terminals.close_all().await;
        info!("agent going offline");
    }

    async fn open(&self, secret: &Secret) -> SparkResult<(WsStream, Option<SocketAddr>)> {
        let url = ws_url(&self.config.server)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SparkError::Transport(e.to_string()))?;
        let value = HeaderValue::from_str(secret.hex())
            .map_err(|e| SparkError::Transport(e.to_string()))?;
        request.headers_mut().insert(SECRET_HEADER, value);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(spark_core::MAX_INLINE_FRAME);
        ws_config.max_frame_size = Some(spark_core::MAX_INLINE_FRAME);

        let (stream, _response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| SparkError::Transport(format!("WebSocket connect error: {e}")))?;
        let local = match stream.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.local_addr().ok(),
            _ => None,
        };
        info!(url = %url, "connected to server");
        Ok((stream, local))
    }

    /// Serve one connection until it drops or the server sends `offline`.
    pub async fn connect_once(self: &Arc<Self>) -> SparkResult<Exit> {
        let secret = Secret::generate();
        let (stream, local) = self.open(&secret).await?;
        let lan = local.map(|a| a.ip().to_string()).unwrap_or_default();

        let (sink, reader) = stream.split();
        let side = Arc::new(HttpSideChannel::new(self.http.clone(), &self.config.server));
        let channel = Arc::new(
            SecureChannel::new(
                Arc::new(WsSink {
                    sink: AsyncMutex::new(sink),
                }),
                secret,
            )
            .with_side_channel(side),
        );
        if let Some(previous) = self.slot.attach(channel.clone()).await {
            previous.close().await;
        }

        let reporting = tokio::spawn(self.clone().report_loop(lan));
        let exit = self.read_loop(&channel, reader).await;

        reporting.abort();
        self.slot.detach(&channel).await;
        channel.close().await;
        Ok(exit)
    }

    async fn report_loop(self: Arc<Self>, lan: String) {
        let mut ticker = tokio::time::interval(self.config.report_interval);
        loop {
            ticker.tick().await;
            let packet = match self.report(&lan) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(error = %e, "failed to build report");
                    continue;
                }
            };
            if let Err(e) = self.slot.send_packet(&packet).await {
                debug!(error = %e, "report not sent");
            }
        }
    }

    async fn read_loop(self: &Arc<Self>, channel: &SecureChannel, mut reader: SplitStream<WsStream>) -> Exit {
        while let Some(message) = reader.next().await {
            let frame = match message {
                Ok(Message::Binary(frame)) => frame,
                Ok(Message::Close(_)) => {
                    debug!("server closed the connection");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "WebSocket read error");
                    break;
                }
            };
            let packet = match channel.open(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable frame");
                    continue;
                }
            };
            if dispatch::handle(self, packet).await == Flow::Offline {
                return Exit::Offline;
            }
        }
        Exit::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_from_server_base() {
        assert_eq!(ws_url("http://127.0.0.1:8000").unwrap(), "ws://127.0.0.1:8000/api/ws");
        assert_eq!(ws_url("https://spark.example/").unwrap(), "wss://spark.example/api/ws");
        assert_eq!(ws_url("ws://h:1").unwrap(), "ws://h:1/api/ws");
        assert!(ws_url("ftp://h").is_err());
    }
}
