//! RPC transport over an AMQP-style message broker with direct reply-to.
//!
//! A [`Transport`] couples request/response semantics onto a broker: requests
//! are published to a conventional exchange routed by service name, and
//! responses come back over the broker's direct reply-to pseudo-queue, where
//! a single per-process reply consumer demultiplexes them to in-flight
//! callers by correlation id.
//!
//! # Architecture
//!
//! ```text
//!                    ┌─────────────────────────────────┐
//!                    │            Transport            │
//!                    ├─────────────────────────────────┤
//!                    │  conn + ready gate (swapped     │
//!                    │        together on reconnect)   │
//!                    │  inflight: correlation id →     │
//!                    │            oneshot::Sender      │
//!                    │  listeners: service → kill/done │
//!                    └───────────┬─────────────────────┘
//!                                │
//!                      supervisor task
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        │                       │                       │
//!   reply consumer        send/respond             listener tasks
//!   (demux by id)        (publish paths)       (one per service queue)
//! ```
//!
//! The supervisor owns the connection: it dials lazily on first use, fires
//! the ready gate once the reply consumer is live, and dials a fresh handle
//! whenever the session is lost. Callers never see connection errors
//! directly; they observe readiness (with their own timeout) and, in the
//! worst case, [`TransportError::Timeout`].

#![deny(unsafe_code)]

use std::time::Duration;

mod errors;
mod transport;

pub use errors::TransportError;
pub use transport::Transport;

/// Well-known name of the broker's direct reply-to pseudo-queue.
pub const DIRECT_REPLY_QUEUE: &str = "amq.rabbitmq.reply-to";

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The conventional exchange shared by all services. Requests are
    /// published here, routed by service name.
    pub exchange: String,
    /// How long the supervisor (and each listener) waits for a usable
    /// session before giving up.
    pub connect_timeout: Duration,
    /// Bound on handing one request off into a listener's channel.
    pub handoff_timeout: Duration,
    /// Bound on the readiness wait in [`Transport::respond`].
    pub respond_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: "courier".to_string(),
            connect_timeout: Duration::from_secs(60),
            handoff_timeout: Duration::from_secs(10),
            respond_timeout: Duration::from_secs(10),
        }
    }
}
