//! In-process broker backed by tokio channels.
//!
//! This is the reference semantics for broker bindings, and the fixture the
//! transport tests run against. Routing is direct: the routing key names a
//! queue and the exchange name is ignored, so every exchange behaves like a
//! direct exchange bound by queue name. Queue names are global to the
//! broker, which models the direct reply-to pseudo-queue as one shared
//! queue: suitable for a single consuming transport per broker, which is
//! all the tests need.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{BrokerError, Connection, Consumer, Delivery, Dial, Gate, Publishing};

const QUEUE_DEPTH: usize = 64;

struct QueueEntry {
    tx: mpsc::Sender<Delivery>,
    owner: u64,
    cancel: CancellationToken,
}

struct SessionEntry {
    id: u64,
    closed: CancellationToken,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueEntry>,
    sessions: Vec<SessionEntry>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    next_session: AtomicU64,
    refuse_declares: AtomicBool,
    refuse_consumes: AtomicBool,
    hold_sessions: AtomicBool,
}

/// An in-process broker. Cheap to clone; clones share the broker state.
#[derive(Clone, Default)]
pub struct MemBroker {
    inner: Arc<Inner>,
}

impl MemBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh session. Its gate fires immediately unless the broker is
    /// currently holding sessions down.
    pub fn connect(&self) -> Arc<MemConnection> {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let up = Gate::new();
        let closed = CancellationToken::new();
        self.inner.state.lock().sessions.push(SessionEntry {
            id,
            closed: closed.clone(),
        });
        if !self.inner.hold_sessions.load(Ordering::Relaxed) {
            up.fire();
        }
        Arc::new(MemConnection {
            inner: self.inner.clone(),
            id,
            up,
            closed,
        })
    }

    /// Fault hook: refuse subsequent queue declarations.
    pub fn refuse_declares(&self, refuse: bool) {
        self.inner.refuse_declares.store(refuse, Ordering::Relaxed);
    }

    /// Fault hook: refuse subsequent consume attempts.
    pub fn refuse_consumes(&self, refuse: bool) {
        self.inner.refuse_consumes.store(refuse, Ordering::Relaxed);
    }

    /// Fault hook: withhold the session-up signal from subsequently dialed
    /// connections.
    pub fn hold_sessions(&self, hold: bool) {
        self.inner.hold_sessions.store(hold, Ordering::Relaxed);
    }

    /// Kill every live session, as a broker restart would: all delivery
    /// streams end and the dead handles refuse further work.
    pub fn drop_sessions(&self) {
        let mut state = self.inner.state.lock();
        for (_, queue) in state.queues.drain() {
            queue.cancel.cancel();
        }
        for session in state.sessions.drain(..) {
            session.closed.cancel();
        }
    }

    /// Number of live queues.
    pub fn queue_count(&self) -> usize {
        self.inner.state.lock().queues.len()
    }
}

impl Dial for MemBroker {
    fn dial(&self) -> Arc<dyn Connection> {
        self.connect()
    }
}

/// One session on a [`MemBroker`].
pub struct MemConnection {
    inner: Arc<Inner>,
    id: u64,
    up: Gate,
    closed: CancellationToken,
}

#[async_trait]
impl Connection for MemConnection {
    fn session_up(&self) -> Gate {
        self.up.clone()
    }

    async fn declare_reply_queue(&self, queue: &str) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::ConnectionClosed);
        }
        if self.inner.refuse_declares.load(Ordering::Relaxed) {
            return Err(BrokerError::DeclareQueue {
                queue: queue.to_string(),
                reason: "declare refused".to_string(),
            });
        }
        // Queues materialize on first consume.
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::ConnectionClosed);
        }
        if self.inner.refuse_consumes.load(Ordering::Relaxed) {
            return Err(BrokerError::Consume {
                queue: queue.to_string(),
                reason: "consume refused".to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        // Last consumer wins; a replaced entry's stream simply ends.
        self.inner.state.lock().queues.insert(
            queue.to_string(),
            QueueEntry {
                tx,
                owner: self.id,
                cancel: cancel.clone(),
            },
        );
        Ok(Consumer::new(rx, cancel))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<(), BrokerError> {
        if self.closed.is_cancelled() {
            return Err(BrokerError::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reason: "connection closed".to_string(),
            });
        }
        let tx = {
            let mut state = self.inner.state.lock();
            match state.queues.get(routing_key) {
                Some(q) if q.cancel.is_cancelled() || q.tx.is_closed() => {
                    state.queues.remove(routing_key);
                    None
                }
                Some(q) => Some(q.tx.clone()),
                None => None,
            }
        };
        let Some(tx) = tx else {
            // Unroutable messages are dropped, as on a real direct exchange.
            trace!(routing_key, "no consumer; publish dropped");
            return Ok(());
        };
        let delivery = Delivery {
            correlation_id: publishing.correlation_id,
            reply_to: publishing.reply_to.unwrap_or_default(),
            routing_key: routing_key.to_string(),
            headers: publishing.headers,
            body: publishing.body,
        };
        if tx.send(delivery).await.is_err() {
            trace!(routing_key, "consumer gone; publish dropped");
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let mut state = self.inner.state.lock();
        state.queues.retain(|_, q| q.owner != self.id);
        state.sessions.retain(|s| s.id != self.id);
    }
}
