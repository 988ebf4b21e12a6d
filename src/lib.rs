//! hubrpc - real-time hub RPC client.
//!
//! A client for hub servers that speak the record-separated JSON hub
//! protocol: negotiate a transport, handshake, call hub methods, receive
//! server-to-client invocations and streams, and survive dropped connections
//! with optional replay.
//!
//! # Architecture
//!
//! - **HubConnection** - lifecycle state machine, public API, reconnect loop
//! - **MessageBuffer** - outbound queue with backpressure, acks and replay
//! - **Transport** - WebSocket, server-sent events and long polling, behind
//!   HTTP negotiation
//! - **HubProtocol** - wire codec (JSON)
//! - **InvocationRegistry** - client methods the hub may call
//!
//! # Modules
//!
//! - [`connection`] - [`HubConnection`] and its builder
//! - [`buffer`] - outbound buffering and receive sequencing
//! - [`transport`] - transports and negotiation
//! - [`protocol`] - handshake and hub message codec
//! - [`invocation`] - client method registry
//! - [`retry`] - reconnect delay policies
//! - [`config`] - connection options

pub mod buffer;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod invocation;
pub mod protocol;
pub mod retry;
pub mod transport;

// Re-export commonly used types
pub use buffer::MessageBuffer;
pub use config::{AccessTokenFactory, HttpConnectionOptions, HubConnectionOptions};
pub use connection::{ConnectionState, HubConnection, HubConnectionBuilder, HubStream};
pub use error::HubError;
pub use invocation::{FromArguments, HandlerOutput, IntoArguments, InvocationRegistry};
pub use protocol::{HubMessage, HubProtocol, JsonHubProtocol, Payload, TransferFormat};
pub use retry::{
    DefaultRetryPolicy, ExponentialBackoffPolicy, FixedDelayRetryPolicy, NoRetryPolicy,
    RetryPolicy,
};
pub use transport::{Transport, TransportFactory, TransportKind};
