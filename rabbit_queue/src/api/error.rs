//! Error type can be returned by the APIs.

use std::fmt;
use tokio::sync::{mpsc::error::SendError, oneshot::error::RecvError};

/// A list of errors can be returned by the APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Invalid connection string or client arguments.
    ConfigurationError(String),
    /// Error during opening a connection to the broker.
    ConnectionOpenError(String),
    /// Error during closing a connection.
    ConnectionCloseError(String),
    /// Error during opening a channel on a live connection.
    ChannelOpenError(String),
    /// Error when using a channel, e.g. declare rejected by the broker.
    ChannelUseError(String),
    /// Broker did not answer a queue declaration within the configured timeout.
    DeclareTimeout(String),
    /// No live binding for the queue, usually during an outage.
    NotConnected(String),
    /// Error in sending or receiving messages via internal communication channel.
    InternalChannelError(String),
}

impl From<amqprs::error::Error> for Error {
    fn from(err: amqprs::error::Error) -> Self {
        Self::ChannelUseError(err.to_string())
    }
}
impl<T> From<SendError<T>> for Error {
    fn from(err: SendError<T>) -> Self {
        Self::InternalChannelError(err.to_string())
    }
}
impl From<RecvError> for Error {
    fn from(err: RecvError) -> Self {
        Self::InternalChannelError(err.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ConfigurationError(msg) => write!(f, "configuration error: {}", msg),
            Error::ConnectionOpenError(msg) => write!(f, "connection open error: {}", msg),
            Error::ConnectionCloseError(msg) => write!(f, "connection close error: {}", msg),
            Error::ChannelOpenError(msg) => write!(f, "channel open error: {}", msg),
            Error::ChannelUseError(msg) => write!(f, "channel usage error: {}", msg),
            Error::DeclareTimeout(queue) => {
                write!(f, "declare of queue '{}' was not confirmed in time", queue)
            }
            Error::NotConnected(queue) => write!(f, "queue '{}' has no live channel", queue),
            Error::InternalChannelError(msg) => {
                write!(f, "internal communication error: {}", msg)
            }
        }
    }
}

impl std::error::Error for Error {}
