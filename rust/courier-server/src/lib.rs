//! Service-side endpoint dispatch for courier RPC.
//!
//! An [`Endpoint`] pairs a name with a typed async handler. Construction
//! captures the handler's request and response shapes, so each dispatch
//! decodes the opaque wire payload into a fresh value of the request type,
//! invokes the handler, and encodes the typed response back into a reply —
//! all without the dispatcher knowing the shapes involved.
//!
//! Handler failures (and decode failures) surface as the canonical
//! [`Error`], enriched with the service and endpoint names unless something
//! deeper in the call stack already attached them.

#![deny(unsafe_code)]

mod endpoint;
mod errors;

pub use endpoint::Endpoint;
pub use errors::{BoxError, Code, Error};
