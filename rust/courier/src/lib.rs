//! courier - RPC over AMQP-style brokers with direct reply-to.
//!
//! This crate provides a unified API over the component crates. Users should
//! depend on this crate rather than on the individual components.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use courier::{MemBroker, Request, Transport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = MemBroker::new();
//! let transport = Transport::new(broker);
//!
//! let req = Request::new("ledger", "Balance", b"...".to_vec());
//! let rsp = transport.send(req, Duration::from_secs(1)).await?;
//! println!("{} bytes", rsp.payload.len());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub use courier_wire::{
    headers, Headers, Request, Response, ENCODING_REQUEST, ENCODING_RESPONSE,
};

pub use courier_broker::{
    BrokerError, Connection, Consumer, Delivery, Dial, Gate, Publishing,
};

pub use courier_broker::mem::MemBroker;

pub use courier_transport::{
    Config, Transport, TransportError, DIRECT_REPLY_QUEUE,
};

pub use courier_server::{BoxError, Code, Endpoint, Error};
