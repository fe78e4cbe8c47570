//! Popcorn broker: producers publish machines on the app port, consumers
//! subscribe to them over WebSocket on the client port.

pub mod admin;
pub mod app_server;
pub mod assets;
pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event_bridge;
pub mod producer;
pub mod sender;
pub mod server;

pub use app_server::{AppEvent, AppServer, Requester};
pub use broker::Broker;
pub use config::{ServerConfig, SubscribePolicy};
pub use error::{BrokerError, RegistryError, SendError, SenderError, StartError};
pub use server::{start, ServerHandle};
