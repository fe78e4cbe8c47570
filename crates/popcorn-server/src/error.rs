use popcorn_core::ids::ClientId;
use popcorn_core::MachineError;
use popcorn_protocol::ProtocolError;

use crate::config::ConfigError;

/// Errors returned to consumers by the broker.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("subscribe: bad machine name: {0}")]
    BadMachineName(String),
    #[error("no such client: {0}")]
    NoSuchClient(ClientId),
    #[error("no such machine: {0}")]
    NoSuchMachine(String),
    #[error("bad command: {0}")]
    BadCommand(String),
}

/// Errors returned to producers by the app server.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("bad machine name: {0}")]
    BadMachineName(String),
    #[error("bad transaction: {0}")]
    BadTransaction(String),
    #[error("machine {0} is already provided")]
    AlreadyProvided(String),
    #[error("no such machine: {0}")]
    UnknownMachine(String),
    #[error("machine {machine} is not provided by {app}")]
    NotOwner { machine: String, app: String },
    #[error("machine {0} has no connected app")]
    NoCommandTarget(String),
    #[error("{0}")]
    Machine(#[from] MachineError),
}

impl RegistryError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::BadMachineName(_) | Self::BadTransaction(_) => "bad_request",
            Self::AlreadyProvided(_) | Self::NotOwner { .. } => "ownership",
            Self::UnknownMachine(_) | Self::NoCommandTarget(_) => "unknown_machine",
            Self::Machine(e) => e.error_kind(),
        }
    }
}

/// Why a frame could not be queued for a consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no such client")]
    NoSuchClient,
    #[error("send queue full")]
    QueueFull,
    #[error("client disconnected")]
    Closed,
}

/// Errors seen by the sending side of the app port.
#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server rejected transaction: {0}")]
    Rejected(String),
    #[error("connection closed before a reply arrived")]
    NoReply,
}

/// Why the server could not start.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("binding listener: {0}")]
    Bind(#[from] std::io::Error),
}
