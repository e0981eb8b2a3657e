//! Bus Error Types
//!
//! Publish-side errors are returned to the caller. Delivery-side errors are
//! handed back to the consumer, which reports the delivery as failed so the
//! broker can redeliver it.

use crate::nsq::ProtocolError;
use codec::CodecError;
use dispatch::DispatchError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    /// The outbound buffer stayed full for the whole enqueue timeout
    #[error("Publish to '{topic}' timed out after {timeout:?} waiting for buffer space")]
    PublishTimeout { topic: String, timeout: Duration },

    #[error("Topic must not be empty")]
    EmptyTopic,

    #[error("Payload for topic '{topic}' must not be empty")]
    EmptyPayload { topic: String },

    /// Topic or channel name nsqd would refuse
    #[error("Invalid topic or channel name '{name}'")]
    InvalidName { name: String },

    #[error("No producers configured")]
    NoProducers,

    /// Publish or delivery attempted after shutdown began
    #[error("Bridge is stopped")]
    Stopped,

    /// Error frame returned by nsqd
    #[error("nsqd {addr} rejected {command}: {message}")]
    Nsq {
        addr: String,
        command: &'static str,
        message: String,
    },

    #[error("Protocol error with {addr}: {source}")]
    Protocol {
        addr: String,
        #[source]
        source: ProtocolError,
    },

    #[error("{operation} against {addr} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        addr: String,
        timeout: Duration,
    },

    /// nsqlookupd query failure
    #[error("Lookup via {url} failed: {message}")]
    Lookup { url: String, message: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },
}

pub type BusResult<T> = std::result::Result<T, BusError>;

impl BusError {
    pub fn protocol(addr: impl Into<String>, source: ProtocolError) -> Self {
        Self::Protocol {
            addr: addr.into(),
            source,
        }
    }

    pub fn timeout(operation: &'static str, addr: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation,
            addr: addr.into(),
            timeout,
        }
    }

    pub fn lookup(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Lookup {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Errors that mean "try again later" rather than "this input is bad"
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PublishTimeout { .. }
                | Self::Protocol { .. }
                | Self::Timeout { .. }
                | Self::Lookup { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_topic() {
        let err = BusError::PublishTimeout {
            topic: "orders".into(),
            timeout: Duration::from_millis(5),
        };
        assert_eq!(
            err.to_string(),
            "Publish to 'orders' timed out after 5ms waiting for buffer space"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_input_errors_are_not_retryable() {
        assert!(!BusError::EmptyTopic.is_retryable());
        assert!(!BusError::EmptyPayload { topic: "t".into() }.is_retryable());
        assert!(!BusError::Stopped.is_retryable());
    }
}
