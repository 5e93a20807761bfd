// twsengine/src/lib.rs
// Main entry point for the engine library

//! # twsengine
//!
//! Connection and dispatch engine for the Interactive Brokers TWS wire protocol:
//!
//! - Session handshake over TCP and length-prefixed framing
//! - Typed requests encoded per negotiated server version
//! - A single reader thread decoding frames into typed replies
//! - Routing of replies to per-request observers by request ID
//! - Optional SQLite session recording and offline replay

mod base;
mod min_server_ver;
pub mod protocol_dec_parser;
mod parser_client;
mod parser_data_market;
mod parser_data_ref;
mod dispatch;
pub mod frame;
pub mod protocol_encoder;
pub mod protocol_decoder;
pub mod message_parser;
pub mod contract;
pub mod request;
pub mod request_id;
pub mod observer;
pub mod registry;
pub mod conn;
pub mod conn_log;
pub mod conn_mock;
pub mod engine;
pub mod wait;

pub use base::EngineError;
pub use min_server_ver::min_server_ver as server_versions;
pub use contract::{Contract, ContractDetails, OptionRight, SecType};
pub use conn::{ConnectOptions, Connection, SocketConnection};
pub use engine::{Engine, EngineConfig, EngineState, SessionLogConfig};
pub use observer::{ChannelObserver, Observer};
pub use protocol_decoder::{IncomingMessageType, Reply, Routing, TickAttrib};
pub use protocol_encoder::OutgoingMessageType;
pub use request::{
  CancelMarketData, Request, RequestContractData, RequestCurrentTime, RequestIds, RequestMarketData,
  RequestMarketDataType,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
