//! Pty-backed terminal sessions driven by the server.
//!
//! Each session owns a pty and its shell process. Output is read on a
//! dedicated blocking thread in chunks of at most [`READ_CHUNK`] bytes and
//! relayed as hex-encoded `TERMINAL_OUTPUT` packets correlated to the request
//! that opened the session. Closing the pty is the only way to stop a reader.
//!
//! Lifecycle: `Starting -> Running -> Closing -> Closed`. Teardown always
//! runs in the order: close pty, kill process, wait for it, release it.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use spark_core::command::{TerminalInput, TerminalResize};
use spark_core::{act, ChannelSlot, Packet, SparkError, SparkResult};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Largest single pty read.
pub const READ_CHUNK: usize = 512;
/// How often idle sessions are looked for.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Sessions idle longer than this are torn down.
pub const IDLE_LIMIT: Duration = Duration::from_secs(300);

pub const SESSION_CLOSED: &str = "${i18n|TERMINAL.SESSION_CLOSED}";

const SHELLS: [&str; 3] = ["zsh", "bash", "sh"];

/// Control half of a spawned pty.
pub trait PtyControl: Send {
    fn write(&mut self, data: &[u8]) -> SparkResult<()>;
    fn resize(&mut self, cols: u16, rows: u16) -> SparkResult<()>;
    /// Close the master side; pending reads fail or hit EOF.
    fn close_pty(&mut self);
    fn kill(&mut self) -> SparkResult<()>;
    fn wait(&mut self) -> SparkResult<()>;
    /// Drop the process handle.
    fn release(&mut self);
}

pub struct Spawned {
    pub reader: Box<dyn Read + Send>,
    pub control: Box<dyn PtyControl>,
}

/// Opens ptys running a shell.
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, shell: &str) -> SparkResult<Spawned>;
}

/// Native ptys via `portable-pty`.
pub struct NativePty;

struct NativeControl {
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

fn pty_error(what: &str, e: impl std::fmt::Display) -> SparkError {
    SparkError::Other(format!("{what}: {e}"))
}

impl PtyBackend for NativePty {
    fn spawn(&self, shell: &str) -> SparkResult<Spawned> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| pty_error("failed to open PTY", e))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", "xterm-256color");
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| pty_error("failed to spawn shell", e))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| pty_error("failed to clone PTY reader", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| pty_error("failed to take PTY writer", e))?;

        info!(shell, "PTY spawned");
        Ok(Spawned {
            reader,
            control: Box::new(NativeControl {
                master: Some(pair.master),
                writer: Some(writer),
                child: Some(child),
            }),
        })
    }
}

impl PtyControl for NativeControl {
    fn write(&mut self, data: &[u8]) -> SparkResult<()> {
        let writer = self.writer.as_mut().ok_or(SparkError::ChannelUnavailable)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> SparkResult<()> {
        let master = self.master.as_ref().ok_or(SparkError::ChannelUnavailable)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| pty_error("PTY resize failed", e))
    }

    fn close_pty(&mut self) {
        self.writer.take();
        self.master.take();
    }

    fn kill(&mut self) -> SparkResult<()> {
        match self.child.as_mut() {
            Some(child) => child.kill().map_err(SparkError::from),
            None => Ok(()),
        }
    }

    fn wait(&mut self) -> SparkResult<()> {
        if let Some(child) = self.child.as_mut() {
            let status = child.wait()?;
            debug!(code = status.exit_code(), "shell exited");
        }
        Ok(())
    }

    fn release(&mut self) {
        self.child.take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Closing,
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Session {
    id: String,
    serial: u64,
    state: Mutex<SessionState>,
    last_activity: Mutex<Instant>,
    control: Mutex<Box<dyn PtyControl>>,
}

impl Session {
    fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    fn idle_since(&self) -> Instant {
        *lock(&self.last_activity)
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Tear the session down once. Blocks until the process is reaped.
    fn teardown(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return false;
            }
            *state = SessionState::Closing;
        }

        let mut control = lock(&self.control);
        control.close_pty();
        if let Err(e) = control.kill() {
            debug!(terminal = %self.id, error = %e, "kill failed");
        }
        if let Err(e) = control.wait() {
            debug!(terminal = %self.id, error = %e, "wait failed");
        }
        control.release();
        drop(control);

        *lock(&self.state) = SessionState::Closed;
        true
    }
}

async fn teardown_blocking(session: Arc<Session>) {
    let id = session.id.clone();
    match tokio::task::spawn_blocking(move || session.teardown()).await {
        Ok(true) => info!(terminal = %id, "terminal closed"),
        Ok(false) => {}
        Err(e) => warn!(terminal = %id, error = %e, "terminal teardown panicked"),
    }
}

/// Table of live terminal sessions.
pub struct TerminalManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    backend: Arc<dyn PtyBackend>,
    channel: Arc<ChannelSlot>,
    /// Shell that last spawned successfully.
    shell: Mutex<Option<String>>,
    next_serial: AtomicU64,
}

impl TerminalManager {
    pub fn new(backend: Arc<dyn PtyBackend>, channel: Arc<ChannelSlot>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            backend,
            channel,
            shell: Mutex::new(None),
            next_serial: AtomicU64::new(1),
        })
    }

    fn resolve_shell(&self) -> String {
        let mut cached = lock(&self.shell);
        if let Some(shell) = cached.as_ref() {
            return shell.clone();
        }
        for name in SHELLS {
            if let Ok(path) = which::which(name) {
                let path = path.to_string_lossy().into_owned();
                *cached = Some(path.clone());
                return path;
            }
        }
        "sh".to_string()
    }

    fn fallback_shell() -> String {
        which::which("sh")
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "sh".to_string())
    }

    /// Open terminal `terminal` for the server request `origin`.
    pub async fn init(self: &Arc<Self>, terminal: &str, origin: &Packet) -> SparkResult<()> {
        let shell = self.resolve_shell();
        let spawned = match self.backend.spawn(&shell) {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(shell = %shell, error = %e, "shell failed to start, falling back to sh");
                *lock(&self.shell) = Some(Self::fallback_shell());
                return Err(e);
            }
        };

        let session = Arc::new(Session {
            id: terminal.to_string(),
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SessionState::Starting),
            last_activity: Mutex::new(Instant::now()),
            control: Mutex::new(spawned.control),
        });

        let replaced = self
            .sessions
            .write()
            .await
            .insert(terminal.to_string(), session.clone());
        if let Some(old) = replaced {
            teardown_blocking(old).await;
        }

        self.spawn_relay(session.clone(), spawned.reader, origin.clone());
        {
            let mut state = lock(&session.state);
            if *state == SessionState::Starting {
                *state = SessionState::Running;
            }
        }
        info!(terminal, shell = %shell, "terminal opened");
        Ok(())
    }

    fn spawn_relay(self: &Arc<Self>, session: Arc<Session>, mut reader: Box<dyn Read + Send>, origin: Packet) {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                session.touch();
                let output = Packet::act(act::TERMINAL_OUTPUT).with_data("output", hex::encode(&chunk));
                if let Err(e) = manager.channel.send_reply(output, &origin).await {
                    debug!(terminal = %session.id, error = %e, "output dropped");
                }
            }

            manager.forget(&session).await;
            teardown_blocking(session.clone()).await;
            let quit = Packet::act(act::TERMINAL_QUIT);
            if let Err(e) = manager.channel.send_reply(quit, &origin).await {
                debug!(terminal = %session.id, error = %e, "quit notice dropped");
            }
        });
    }

    /// Remove `session` from the table unless a newer session took its id.
    async fn forget(&self, session: &Session) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(&session.id).map(|s| s.serial) == Some(session.serial) {
            sessions.remove(&session.id);
        }
    }

    async fn lookup(&self, terminal: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(terminal).cloned()
    }

    /// Tell the requester the terminal is gone.
    async fn not_found(&self, terminal: &str, origin: &Packet) -> SparkError {
        let notice = Packet::act(act::TERMINAL_QUIT).with_msg(SESSION_CLOSED);
        if let Err(e) = self.channel.send_reply(notice, origin).await {
            debug!(terminal, error = %e, "quit notice dropped");
        }
        SparkError::SessionNotFound(terminal.to_string())
    }

    pub async fn input(&self, payload: &TerminalInput, origin: &Packet) -> SparkResult<()> {
        let data = hex::decode(&payload.input)?;
        let Some(session) = self.lookup(&payload.terminal).await else {
            return Err(self.not_found(&payload.terminal, origin).await);
        };
        let writer = session.clone();
        tokio::task::spawn_blocking(move || {
            let mut control = lock(&writer.control);
            control.write(&data)
        })
        .await
        .map_err(|e| SparkError::Other(e.to_string()))??;
        session.touch();
        Ok(())
    }

    pub async fn resize(&self, payload: &TerminalResize, origin: &Packet) -> SparkResult<()> {
        let Some(session) = self.lookup(&payload.terminal).await else {
            return Err(self.not_found(&payload.terminal, origin).await);
        };
        let cols = payload.width.clamp(1.0, u16::MAX as f64) as u16;
        let rows = payload.height.clamp(1.0, u16::MAX as f64) as u16;
        lock(&session.control).resize(cols, rows)?;
        debug!(terminal = %payload.terminal, cols, rows, "terminal resized");
        Ok(())
    }

    pub async fn kill(&self, terminal: &str, origin: &Packet) -> SparkResult<()> {
        let removed = self.sessions.write().await.remove(terminal);
        match removed {
            Some(session) => {
                teardown_blocking(session).await;
                Ok(())
            }
            None => Err(self.not_found(terminal, origin).await),
        }
    }

    /// Refresh activity; unknown sessions are ignored.
    pub async fn ping(&self, terminal: &str) {
        if let Some(session) = self.lookup(terminal).await {
            session.touch();
        }
    }

    /// Tear down every session idle for longer than [`IDLE_LIMIT`] at `now`.
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| now.saturating_duration_since(s.idle_since()) > IDLE_LIMIT)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let count = expired.len();
        for session in expired {
            info!(terminal = %session.id, "terminal idle, closing");
            teardown_blocking(session).await;
        }
        count
    }

    /// Sweep idle sessions every [`SWEEP_INTERVAL`] until the task is dropped.
    pub async fn run_reaper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.sweep_at(Instant::now()).await;
        }
    }

    /// Tear down every session.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            teardown_blocking(session).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn state_of(&self, terminal: &str) -> Option<SessionState> {
        self.lookup(terminal).await.map(|s| s.state())
    }

    #[cfg(test)]
    async fn backdate(&self, terminal: &str, by: Duration) -> Option<Instant> {
        let session = self.lookup(terminal).await?;
        let mut last = lock(&session.last_activity);
        *last -= by;
        Some(*last)
    }
}
