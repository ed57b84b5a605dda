//! # based-client
//!
//! Client library for the based realtime platform.
//!
//! This crate provides:
//! - Observables with deduplication, checksum caching and diff patching
//! - Function calls, one-shot gets and channels
//! - Outbound frame queues that survive disconnects
//! - WebSocket connection with automatic reconnection and service discovery
//! - Optional TLS configuration

pub mod channels;
pub mod client;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod listener;
pub mod queue;
pub mod registry;
pub mod requests;
pub mod tls;

pub use client::Client;
pub use config::{ClientConfig, ConfigError};
pub use connection::{ConnectionConfig, ConnectionHandle, ConnectionStatus, ReconnectConfig, Target};
pub use discovery::{Endpoint, ServiceCoordinates};
pub use engine::{ProtocolEngine, Transport};
pub use error::ClientError;
pub use listener::{DataResult, Listener, ObservableData, ObserveResult, Responder, SubId};
pub use tls::TlsClientConfig;
