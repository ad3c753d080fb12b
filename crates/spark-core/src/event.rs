//! Event correlation: request/response semantics over a message channel.
//!
//! Flow:
//! 1. Caller mints a token and calls [`EventRegistry::pending`] (or registers
//!    a [`Callback`] directly).
//! 2. Caller sends a packet carrying the token.
//! 3. The receive path calls [`EventRegistry::dispatch`] with the reply.
//! 4. Caller awaits [`PendingReply::wait`], which removes the entry on timeout.
//!
//! Removal is the arbitration point: whichever of dispatch or timeout removes
//! a one-shot entry first owns it, the other side observes nothing.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{SparkError, SparkResult};

/// Default wait for the first reply to a correlated request.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Mint a fresh correlation token.
pub fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Whether an entry survives its first dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    OneShot,
    Persistent,
}

/// A waiting callback.
pub enum Callback<T> {
    Once(Box<dyn FnOnce(T) + Send + Sync>),
    Persistent(Arc<dyn Fn(T) + Send + Sync>),
}

impl<T> Callback<T> {
    pub fn once<F>(f: F) -> Self
    where
        F: FnOnce(T) + Send + Sync + 'static,
    {
        Callback::Once(Box::new(f))
    }

    pub fn persistent<F>(f: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Callback::Persistent(Arc::new(f))
    }

    pub fn mode(&self) -> Mode {
        match self {
            Callback::Once(_) => Mode::OneShot,
            Callback::Persistent(_) => Mode::Persistent,
        }
    }
}

struct Registration<T> {
    callback: Callback<T>,
    /// Connection whose closure should discard this entry.
    owner: Option<String>,
    registered_at: Instant,
}

/// Process-wide table of correlation tokens to waiting callbacks.
pub struct EventRegistry<T> {
    entries: DashMap<String, Registration<T>>,
}

impl<T: Send + 'static> Default for EventRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> EventRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a callback for `token`. Fails if the token is already in flight.
    pub fn register(&self, token: &str, callback: Callback<T>) -> SparkResult<()> {
        self.register_owned(token, None, callback)
    }

    /// Register a callback that is discarded when `owner` disconnects.
    pub fn register_owned(
        &self,
        token: &str,
        owner: Option<&str>,
        callback: Callback<T>,
    ) -> SparkResult<()> {
        match self.entries.entry(token.to_string()) {
            Entry::Occupied(_) => Err(SparkError::DuplicateEvent(token.to_string())),
            Entry::Vacant(slot) => {
                debug!(token, mode = ?callback.mode(), "event registered");
                slot.insert(Registration {
                    callback,
                    owner: owner.map(str::to_string),
                    registered_at: Instant::now(),
                });
                Ok(())
            }
        }
    }

    /// Register a one-shot callback and wait until it fires or `timeout` elapses.
    ///
    /// Returns whether the callback fired.
    pub async fn register_and_wait<F>(
        &self,
        token: &str,
        callback: F,
        timeout: Duration,
    ) -> SparkResult<bool>
    where
        F: FnOnce(T) + Send + Sync + 'static,
    {
        let (fired_tx, mut fired_rx) = oneshot::channel::<()>();
        self.register(
            token,
            Callback::once(move |value| {
                callback(value);
                let _ = fired_tx.send(());
            }),
        )?;

        match tokio::time::timeout(timeout, &mut fired_rx).await {
            Ok(fired) => Ok(fired.is_ok()),
            Err(_) => {
                if self.unregister(token) {
                    Ok(false)
                } else {
                    // Dispatch claimed the entry first; its callback runs to completion.
                    Ok(fired_rx.await.is_ok())
                }
            }
        }
    }

    /// Register a one-shot waiter and return a handle to await the reply.
    pub fn pending(&self, token: &str) -> SparkResult<PendingReply<'_, T>> {
        self.pending_owned(token, None)
    }

    /// Like [`pending`](Self::pending), failing early if `owner` disconnects.
    pub fn pending_owned(&self, token: &str, owner: Option<&str>) -> SparkResult<PendingReply<'_, T>> {
        let (tx, rx) = oneshot::channel();
        self.register_owned(
            token,
            owner,
            Callback::once(move |value| {
                let _ = tx.send(value);
            }),
        )?;
        Ok(PendingReply {
            registry: self,
            token: token.to_string(),
            rx,
        })
    }

    /// Deliver `value` to the callback registered for `token`.
    ///
    /// One-shot entries are removed before the callback runs. Returns false when
    /// nothing was waiting, which is not an error.
    pub fn dispatch(&self, token: &str, value: T) -> bool {
        if token.is_empty() {
            return false;
        }

        let persistent = match self.entries.get(token) {
            None => {
                debug!(token, "no waiter for event, dropped");
                return false;
            }
            Some(entry) => match &entry.callback {
                Callback::Persistent(f) => Some(f.clone()),
                Callback::Once(_) => None,
            },
        };

        // Callbacks run without any shard lock held so they may unregister.
        if let Some(callback) = persistent {
            callback(value);
            return true;
        }

        match self
            .entries
            .remove_if(token, |_, r| r.callback.mode() == Mode::OneShot)
        {
            Some((_, registration)) => {
                debug!(
                    token,
                    waited_ms = registration.registered_at.elapsed().as_millis() as u64,
                    "event fired"
                );
                if let Callback::Once(callback) = registration.callback {
                    callback(value);
                }
                true
            }
            None => {
                debug!(token, "event already consumed");
                false
            }
        }
    }

    /// Remove the entry for `token`. Returns whether it was still registered.
    pub fn unregister(&self, token: &str) -> bool {
        self.entries.remove(token).is_some()
    }

    /// Drop every entry owned by `owner`; their waiters fail immediately.
    pub fn discard_owner(&self, owner: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, r| r.owner.as_deref() != Some(owner));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            warn!(owner, removed, "discarded in-flight events of closed connection");
        }
        removed
    }

    pub fn contains(&self, token: &str) -> bool {
        self.entries.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle to a one-shot correlated reply.
///
/// Dropping the handle discards the registration.
pub struct PendingReply<'a, T: Send + 'static> {
    registry: &'a EventRegistry<T>,
    token: String,
    rx: oneshot::Receiver<T>,
}

impl<T: Send + 'static> PendingReply<'_, T> {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Wait for the reply.
    ///
    /// Fails with `ResponseTimeout` when nothing arrives within `timeout`, and
    /// with `DeviceUnreachable` when the owning connection went away.
    pub async fn wait(mut self, timeout: Duration) -> SparkResult<T> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(SparkError::DeviceUnreachable(self.token.clone())),
            Err(_) => {
                if self.registry.unregister(&self.token) {
                    Err(SparkError::ResponseTimeout)
                } else {
                    (&mut self.rx)
                        .await
                        .map_err(|_| SparkError::DeviceUnreachable(self.token.clone()))
                }
            }
        }
    }
}

impl<T: Send + 'static> Drop for PendingReply<'_, T> {
    fn drop(&mut self) {
        self.registry.entries.remove(&self.token);
    }
}
