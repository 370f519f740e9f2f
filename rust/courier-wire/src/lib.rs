//! Wire-level message model for courier RPC.
//!
//! A message is either a [`Request`] or a [`Response`], distinguished on the
//! wire by the `Content-Encoding` header carrying the literal `"request"` or
//! `"response"`. Payloads are opaque byte sequences at this layer; typed
//! encoding and decoding happens above the transport, in `courier-server`.

#![deny(unsafe_code)]

use std::collections::HashMap;

/// Wire header names shared by every courier service.
pub mod headers {
    /// Distinguishes requests from responses on the wire. Exact match,
    /// case-sensitive.
    pub const CONTENT_ENCODING: &str = "Content-Encoding";
    /// Target service name, stamped on every outgoing request.
    pub const SERVICE: &str = "Service";
    /// Target endpoint name, stamped on every outgoing request.
    pub const ENDPOINT: &str = "Endpoint";
    /// The caller's direct reply-to address. Set from the broker delivery on
    /// the way in, used as the routing key for the response on the way out.
    pub const REPLY_TO: &str = "X-Rabbit-ReplyTo";
}

/// `Content-Encoding` marker carried by request messages.
pub const ENCODING_REQUEST: &str = "request";

/// `Content-Encoding` marker carried by response messages.
pub const ENCODING_RESPONSE: &str = "response";

/// Message headers: string keys and values, case-preserving, unique keys.
pub type Headers = HashMap<String, String>;

/// An RPC request addressed to a `service`/`endpoint` pair.
///
/// `id` doubles as the correlation id tying the eventual response back to the
/// caller. An empty id means "not yet assigned": the transport assigns a
/// fresh one on send, and never overwrites a caller-provided id (retries at
/// higher layers depend on this).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub id: String,
    pub service: String,
    pub endpoint: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl Request {
    /// Create a request with no id assigned yet.
    pub fn new(
        service: impl Into<String>,
        endpoint: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: String::new(),
            service: service.into(),
            endpoint: endpoint.into(),
            headers: Headers::new(),
            payload,
        }
    }

    /// Look up a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Set a header, replacing any previous value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// The direct reply-to address this request was delivered with, if any.
    ///
    /// An empty header counts as absent.
    pub fn reply_to(&self) -> Option<&str> {
        self.header(headers::REPLY_TO).filter(|v| !v.is_empty())
    }
}

/// An RPC response, correlated to its request by `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub id: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl Response {
    /// Create a response correlated to the given request id.
    pub fn new(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            headers: Headers::new(),
            payload,
        }
    }

    /// Look up a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Set a header, replacing any previous value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }
}
