//! Network endpoints.

pub mod connector;
pub mod listener;

pub use connector::{
    Connector, ConnectorConfig, PlainSocketFactory, SocketFactory, TlsSocketFactory,
};
