//! Endpoint dispatch: typed decode of request payloads, handler invocation,
//! and error enrichment.

use std::future::Future;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use courier_wire::{Request, Response};

use crate::errors::{BoxError, Code, Error};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type Handler = Box<dyn Fn(Request) -> BoxFuture<Result<Response, Error>> + Send + Sync>;

/// A named endpoint of a service.
///
/// Construction captures the handler's typed request and response shapes, so
/// each dispatch decodes the wire payload into a fresh value of the request
/// type without this struct knowing the shape.
pub struct Endpoint {
    name: String,
    handler: Handler,
}

impl Endpoint {
    /// Build an endpoint from a typed async handler.
    ///
    /// The handler receives the wire request (for its id, headers and
    /// reply-to address) alongside the decoded body, and returns a typed
    /// response which is encoded into the reply payload.
    pub fn new<Req, Rsp, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Request, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp, BoxError>> + Send + 'static,
    {
        let name = name.into();
        let endpoint_name = name.clone();
        let handler: Handler = Box::new(
            move |req: Request| -> BoxFuture<Result<Response, Error>> {
                let endpoint = endpoint_name.clone();
                let service = req.service.clone();
                let id = req.id.clone();

                let body: Req = match postcard::from_bytes(&req.payload) {
                    Ok(body) => body,
                    Err(decode_err) => {
                        debug!(service = %service, endpoint = %endpoint, error = %decode_err, "could not decode request payload");
                        let err = enrich(
                            Error::bad_request("Could not unmarshal request"),
                            &service,
                            &endpoint,
                        );
                        return Box::pin(async move { Err(err) });
                    }
                };

                debug!(service = %service, endpoint = %endpoint, "handler received request");
                let fut = handler(req, body);
                Box::pin(async move {
                    match fut.await {
                        Ok(rsp) => {
                            debug!(service = %service, endpoint = %endpoint, "handler response");
                            match postcard::to_allocvec(&rsp) {
                                Ok(payload) => Ok(Response::new(id, payload)),
                                Err(encode_err) => {
                                    let err = enrich(
                                        Error::new(Code::BadResponse, "Could not marshal response"),
                                        &service,
                                        &endpoint,
                                    );
                                    error!(service = %service, endpoint = %endpoint, error = %encode_err, "could not encode response payload");
                                    Err(err)
                                }
                            }
                        }
                        Err(handler_err) => {
                            let err = enrich(Error::wrap(handler_err), &service, &endpoint);
                            error!(service = %service, endpoint = %endpoint, error = %err, "handler error");
                            Err(err)
                        }
                    }
                })
            },
        );
        Self { name, handler }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decode, dispatch and encode one request. The returned response is
    /// correlated to the request by id and ready for
    /// `courier_transport::Transport::respond`.
    pub async fn handle(&self, req: Request) -> Result<Response, Error> {
        (self.handler)(req).await
    }
}

/// Attach service/endpoint context unless something deeper already did.
fn enrich(mut err: Error, service: &str, endpoint: &str) -> Error {
    err.context_if_unset("service", service);
    err.context_if_unset("endpoint", endpoint);
    err
}
