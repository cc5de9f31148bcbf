//! Wait sets and readiness subscribers
//!
//! # 1) Waiting for a condition
//!
//! A blocked reader (or writer) must not miss the wake-up issued by the
//! opposite side. The check of the condition and the registration in the
//! wait set therefore happen under the same lock that the producing side
//! takes before it changes the condition:
//!
//! ```ignore
//! let mut state = lock().await?;
//! while is_empty(&state) {
//!     let ticket = state.readers.register("session#3");
//!     drop(state);
//!     interrupt.guard(ticket.wait()).await?;
//!     state = lock().await?;
//! }
//! ```
//!
//! The producing side collects the waiters under the lock and wakes them
//! after releasing it:
//!
//! ```ignore
//! let wakeups = state.readers.take();
//! drop(state);
//! wakeups.wake();
//! ```
//!
//! A woken waiter only learns that the condition may have changed; it
//! must check again.
//!
//! # 2) Subscribing to readiness
//!
//! [`Notifier`] keeps one unbounded sender per subscribed session. Every
//! notification is delivered to every subscriber.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::idgen::SessionId;

// ============================================================================
// Wait set
// ============================================================================

/// A suspended session waiting for a condition
struct Waiter {
    sender: oneshot::Sender<()>,
    debug_hint: String,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("debug_hint", &self.debug_hint)
            .finish_non_exhaustive()
    }
}

/// Sessions suspended until the guarded condition may have changed
///
/// Not synchronized by itself: it lives inside the state it guards.
#[derive(Debug)]
pub struct WaitSet {
    name: &'static str,
    waiters: Vec<Waiter>,
}

impl WaitSet {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: Vec::new(),
        }
    }

    /// Add a waiter; the returned ticket resolves on the next wake-up
    ///
    /// Waiters that gave up (interrupted, or their future was dropped) are
    /// pruned here.
    pub fn register(&mut self, debug_hint: &str) -> WaitTicket {
        self.waiters.retain(|w| !w.sender.is_closed());
        let (sender, receiver) = oneshot::channel();
        self.waiters.push(Waiter {
            sender,
            debug_hint: debug_hint.to_string(),
        });
        WaitTicket { receiver }
    }

    /// Remove all waiters, to be woken once the lock is released
    #[must_use]
    pub fn take(&mut self) -> Wakeups {
        Wakeups {
            name: self.name,
            waiters: std::mem::take(&mut self.waiters),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Pending registration in a [`WaitSet`]
#[derive(Debug)]
pub struct WaitTicket {
    receiver: oneshot::Receiver<()>,
}

impl WaitTicket {
    /// Suspend until woken
    ///
    /// Also returns if the wait set itself is dropped; the caller rechecks
    /// its condition either way.
    pub async fn wait(self) {
        let _ = self.receiver.await;
    }
}

/// Waiters removed from a [`WaitSet`], not yet woken
#[must_use = "waiters stay suspended unless woken"]
pub struct Wakeups {
    name: &'static str,
    waiters: Vec<Waiter>,
}

impl Wakeups {
    pub fn wake(self) {
        if self.waiters.is_empty() {
            return;
        }
        log::debug!("waitq.wake: {}, waiters: {}", self.name, self.waiters.len());
        for waiter in self.waiters {
            if waiter.sender.send(()).is_err() {
                log::debug!(
                    "waitq.wake: {}: waiter gone (hint: {})",
                    self.name,
                    waiter.debug_hint
                );
            }
        }
    }
}

// ============================================================================
// Asynchronous notification
// ============================================================================

/// Message delivered to subscribed sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// New data was written to the channel with this index
    Readable { channel: usize },
}

/// Set of sessions that asked to be told when data arrives
#[derive(Debug)]
pub struct Notifier {
    channel: usize,
    subscribers: Mutex<HashMap<SessionId, mpsc::UnboundedSender<Signal>>>,
}

impl Notifier {
    #[must_use]
    pub fn new(channel: usize) -> Self {
        Self {
            channel,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register `session`; replaces an earlier registration of the same session
    pub fn subscribe(&self, session: SessionId, sender: mpsc::UnboundedSender<Signal>) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.insert(session, sender).is_some() {
            log::debug!("notifier.subscribe: chan{}: {session} re-subscribed", self.channel);
        }
    }

    /// Returns whether `session` was subscribed
    pub fn unsubscribe(&self, session: SessionId) -> bool {
        self.subscribers.lock().remove(&session).is_some()
    }

    /// Deliver `Readable` to every subscriber
    ///
    /// Subscribers whose receiving side is gone are dropped.
    pub fn notify(&self) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        log::debug!(
            "notifier.notify: chan{}, subscribers: {}",
            self.channel,
            subscribers.len()
        );
        let signal = Signal::Readable {
            channel: self.channel,
        };
        subscribers.retain(|session, sender| {
            let alive = sender.send(signal).is_ok();
            if !alive {
                log::warn!("notifier.notify: chan{}: {session} stopped listening", self.channel);
            }
            alive
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
