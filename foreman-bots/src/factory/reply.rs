//! Request/reply correlation for the orchestrator's mailbox.
//!
//! Every request the orchestrator sends registers a waiter keyed by the
//! request id before the request is written. One pump drains the
//! orchestrator inbox and hands each reply to the waiter for its thread.
//! A reply that beats its waiter is parked until the waiter registers.

use std::collections::HashMap;
use std::time::Duration;

use foreman_sdk::{Mailbox, Message};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};

const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Routed,
    Parked,
    Dropped,
}

#[derive(Default)]
struct Routes {
    waiters: HashMap<String, oneshot::Sender<Message>>,
    parked: HashMap<String, (Instant, Message)>,
    abandoned: HashMap<String, Instant>,
}

impl Routes {
    /// Forget parked replies and abandoned threads older than `retention`.
    fn prune(&mut self, retention: Duration) {
        let now = Instant::now();
        let before = self.parked.len() + self.abandoned.len();
        self.parked
            .retain(|_, (at, _)| now.saturating_duration_since(*at) < retention);
        self.abandoned
            .retain(|_, at| now.saturating_duration_since(*at) < retention);
        let pruned = before - self.parked.len() - self.abandoned.len();
        if pruned > 0 {
            debug!(pruned, "Pruned stale reply routes");
        }
    }
}

pub struct ReplyRouter {
    routes: Mutex<Routes>,
    /// How long an unclaimed reply or an abandoned thread is remembered.
    retention: Duration,
}

impl Default for ReplyRouter {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl ReplyRouter {
    pub fn new(retention: Duration) -> Self {
        Self {
            routes: Mutex::new(Routes::default()),
            retention,
        }
    }

    /// Wait for the first reply on `thread_id`.
    pub fn register(&self, thread_id: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        let mut routes = self.routes.lock();
        routes.prune(self.retention);
        routes.abandoned.remove(thread_id);
        match routes.parked.remove(thread_id) {
            Some((_, reply)) => {
                let _ = tx.send(reply);
            }
            None => {
                routes.waiters.insert(thread_id.to_string(), tx);
            }
        }
        rx
    }

    /// Stop waiting on `thread_id`; a late reply is dropped.
    pub fn abandon(&self, thread_id: &str) {
        let mut routes = self.routes.lock();
        routes.waiters.remove(thread_id);
        routes.abandoned.insert(thread_id.to_string(), Instant::now());
    }

    /// Route one message from the orchestrator inbox.
    pub fn deliver(&self, message: Message) -> Delivery {
        if !message.kind().is_reply() {
            warn!(id = %message.id(), from = %message.from(), kind = %message.kind(), "Ignoring non-reply message");
            return Delivery::Dropped;
        }
        let Some(thread_id) = message.thread_id().map(str::to_string) else {
            warn!(id = %message.id(), from = %message.from(), "Reply without thread, dropping");
            return Delivery::Dropped;
        };

        let mut routes = self.routes.lock();
        routes.prune(self.retention);
        if routes.abandoned.remove(&thread_id).is_some() {
            debug!(thread_id = %thread_id, "Late reply for abandoned thread");
            return Delivery::Dropped;
        }
        if let Some(tx) = routes.waiters.remove(&thread_id) {
            return match tx.send(message) {
                Ok(()) => Delivery::Routed,
                Err(_) => Delivery::Dropped,
            };
        }
        if routes.parked.contains_key(&thread_id) {
            debug!(thread_id = %thread_id, "Duplicate reply, keeping the first");
            return Delivery::Dropped;
        }
        routes.parked.insert(thread_id, (Instant::now(), message));
        Delivery::Parked
    }

    /// Replies waiting for a thread that has not registered yet.
    pub fn parked(&self) -> usize {
        self.routes.lock().parked.len()
    }

    /// Number of threads with a registered waiter.
    pub fn waiting(&self) -> usize {
        self.routes.lock().waiters.len()
    }

    /// Drain `name`'s inbox into waiters until `shutdown` is set.
    pub async fn pump(
        &self,
        mailbox: Mailbox,
        name: &str,
        poll_interval: Duration,
        error_cooldown: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match mailbox.receive(name) {
                Ok(Some(message)) => {
                    self.deliver(message);
                    None
                }
                Ok(None) => Some(poll_interval),
                Err(e) => {
                    error!(error = %e, "Reply pump failed to read inbox");
                    Some(error_cooldown)
                }
            };
            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        debug!("Reply pump stopped");
    }
}
