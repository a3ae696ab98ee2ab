pub mod adapter;
pub mod config;
pub mod connectable;
pub mod connection;
pub mod error;
pub mod server;

pub use adapter::{TcpClientAdapter, TcpClientConfig, TcpServerAdapter, TcpServerConfig};
pub use config::{ConfigError, Endpoint, ServiceConfig};
pub use connectable::{
    BusEvent, Connectable, ConnectableCore, ConnectableState, EventBus, EventKind, Listener,
};
pub use connection::{Connection, Transport};
pub use error::{HandlerError, Result, WyomingError};
pub use server::{HandlerSet, HandlerSource, Server, ServerOptions};
pub use wyoming_protocol;
