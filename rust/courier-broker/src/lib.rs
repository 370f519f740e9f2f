//! Broker connection contract for the courier transport.
//!
//! The transport never talks to a broker client library directly; it goes
//! through the [`Connection`] trait, which models the narrow slice of an
//! AMQP-style session the RPC layer needs: a readiness signal, queue
//! declaration for direct reply-to, consuming, and publishing. A [`Dial`]
//! factory produces a fresh handle for every (re)connect attempt.
//!
//! The [`mem`] module provides an in-process broker that implements the
//! contract over tokio channels. It is the semantic reference: a real broker
//! binding must behave identically as far as the transport can observe.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use courier_wire::Headers;

pub mod mem;

/// A one-shot broadcast: starts pending, fires exactly once, and any number
/// of observers may wait on it. Clones observe the same underlying state.
///
/// This is the closed-channel idiom: both a broker session's readiness
/// signal and the transport's ready gate are `Gate`s.
#[derive(Debug, Clone, Default)]
pub struct Gate {
    token: CancellationToken,
}

impl Gate {
    /// A fresh, unfired gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the gate, waking every current and future waiter. Idempotent.
    pub fn fire(&self) {
        self.token.cancel();
    }

    /// Whether the gate has fired.
    pub fn is_fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until the gate has fired. Returns immediately if it already has.
    pub async fn fired(&self) {
        self.token.cancelled().await;
    }
}

/// A message delivered by the broker to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub correlation_id: String,
    pub reply_to: String,
    pub routing_key: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// A message handed to the broker for publication.
#[derive(Debug, Clone)]
pub struct Publishing {
    pub correlation_id: String,
    pub timestamp: SystemTime,
    pub body: Vec<u8>,
    pub reply_to: Option<String>,
    pub headers: Headers,
}

/// A live subscription to a queue.
///
/// Dropping the consumer cancels the subscription broker-side. The delivery
/// stream ends (yields `None`) when the session is lost or closed.
pub struct Consumer {
    pub deliveries: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
}

impl Consumer {
    /// Wrap a delivery stream together with the token the broker binding
    /// watches to tear the subscription down.
    pub fn new(deliveries: mpsc::Receiver<Delivery>, cancel: CancellationToken) -> Self {
        Self { deliveries, cancel }
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Broker-side failure, surfaced verbatim through the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The queue could not be declared.
    DeclareQueue { queue: String, reason: String },
    /// A consumer could not be started on the queue.
    Consume { queue: String, reason: String },
    /// A publish was refused.
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },
    /// The connection handle is closed.
    ConnectionClosed,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::DeclareQueue { queue, reason } => {
                write!(f, "could not declare queue {queue}: {reason}")
            }
            BrokerError::Consume { queue, reason } => {
                write!(f, "could not consume from {queue}: {reason}")
            }
            BrokerError::Publish {
                exchange,
                routing_key,
                reason,
            } => write!(
                f,
                "could not publish to {exchange:?} routing key {routing_key}: {reason}"
            ),
            BrokerError::ConnectionClosed => write!(f, "broker connection closed"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// The opaque broker connection used by the transport.
///
/// One handle per broker session. The transport's supervisor dials a fresh
/// handle for every (re)connect and closes the old one; a handle is never
/// reused after [`close`](Connection::close).
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Fired once the underlying broker session is usable. A handle that
    /// fails to connect simply never fires it.
    fn session_up(&self) -> Gate;

    /// Ensure the direct reply-to queue exists for this session.
    async fn declare_reply_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Begin consuming from `queue`.
    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError>;

    /// Publish a message to `exchange`, routed by `routing_key`. An empty
    /// exchange name is the default exchange: the routing key names a queue
    /// directly.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<(), BrokerError>;

    /// Tear the session down. Consumers observe their delivery streams
    /// ending. Idempotent.
    async fn close(&self);
}

/// Factory producing a fresh [`Connection`] handle per (re)connect attempt.
///
/// Called by the transport supervisor on first use and after each session
/// loss. Dialing is non-blocking: the returned handle connects in the
/// background and fires [`Connection::session_up`] when usable.
pub trait Dial: Send + Sync + 'static {
    fn dial(&self) -> Arc<dyn Connection>;
}

impl<T: Dial + ?Sized> Dial for Arc<T> {
    fn dial(&self) -> Arc<dyn Connection> {
        (**self).dial()
    }
}
