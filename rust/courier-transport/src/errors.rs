//! Transport-level errors surfaced to callers.

use courier_broker::BrokerError;

/// Error from the send, listen and respond paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The run loop timed out waiting for a usable broker session.
    CouldNotConnect,
    /// The broker's delivery stream closed underneath a consumer.
    DeliveriesClosed,
    /// The request does not carry a usable `X-Rabbit-ReplyTo` header.
    NoReplyTo,
    /// A bounded wait elapsed.
    Timeout,
    /// A listener is already registered for this service.
    AlreadyListening,
    /// The transport has been stopped.
    Stopped,
    /// A broker operation failed; passed through verbatim.
    Broker(BrokerError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::CouldNotConnect => write!(f, "could not connect to broker"),
            TransportError::DeliveriesClosed => write!(f, "delivery stream closed"),
            TransportError::NoReplyTo => {
                write!(f, "request does not have an X-Rabbit-ReplyTo header")
            }
            TransportError::Timeout => write!(f, "timed out"),
            TransportError::AlreadyListening => {
                write!(f, "a listener is already registered for this service")
            }
            TransportError::Stopped => write!(f, "transport stopped"),
            TransportError::Broker(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Broker(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BrokerError> for TransportError {
    fn from(e: BrokerError) -> Self {
        TransportError::Broker(e)
    }
}
