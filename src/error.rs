//! Error type shared by the transport, the peer list and the lock.

use crate::message::{Address, PeerId, RemoteError};
use serde_json::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The target could not be reached, or the connection broke mid-call.
    #[error("could not reach {address}: {source}")]
    Transport {
        address: Address,
        #[source]
        source: std::io::Error,
    },

    /// A message was empty, not JSON, or had the wrong shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote method ran and returned an error.
    #[error("remote peer raised {name}: {}", render_args(.args))]
    External { name: String, args: Vec<Value> },

    #[error("no peer with id {0}")]
    UnknownPeer(PeerId),

    #[error("the token is not held by this peer")]
    NotHeld,

    #[error("the lock has been destroyed")]
    Destroyed,

    #[error("no such method: {0}")]
    NoSuchMethod(String),

    #[error("invalid arguments for {method}: {reason}")]
    BadArguments { method: String, reason: String },
}

impl Error {
    /// Stable name carried in the `error.name` field of a response.
    pub fn name(&self) -> &str {
        match self {
            Self::Transport { .. } => "TransportError",
            Self::Protocol(_) => "ProtocolError",
            Self::External { name, .. } => name,
            Self::UnknownPeer(_) => "UnknownPeer",
            Self::NotHeld => "NotHeld",
            Self::Destroyed => "Destroyed",
            Self::NoSuchMethod(_) => "NoSuchMethod",
            Self::BadArguments { .. } => "BadArguments",
        }
    }

    pub fn bad_arguments(method: &str, reason: impl ToString) -> Self {
        Self::BadArguments {
            method: method.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<RemoteError> for Error {
    fn from(remote: RemoteError) -> Self {
        Self::External {
            name: remote.name,
            args: remote.args,
        }
    }
}

impl From<&Error> for RemoteError {
    fn from(error: &Error) -> Self {
        // errors relayed from a further hop keep their payload
        match error {
            Error::External { name, args } => RemoteError {
                name: name.clone(),
                args: args.clone(),
            },
            other => RemoteError {
                name: other.name().to_string(),
                args: vec![Value::String(other.to_string())],
            },
        }
    }
}

fn render_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
