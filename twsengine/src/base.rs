// twsengine/src/base.rs
// Base types and error definitions for the engine

use thiserror::Error;


/// Errors that can occur in the engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
  #[error("Configuration error: {0}")]
  ConfigurationError(String),

  #[error("Connection error: {0}")]
  ConnectionError(String),

  #[error("Handshake failed: {0}")]
  HandshakeError(String),

  #[error("Unknown message type: {0}")]
  UnknownMessageType(i32),

  #[error("Malformed frame: {0}")]
  MalformedFrame(String),

  #[error("Engine is closed")]
  EngineClosed,

  #[error("Precondition violated: {0}")]
  PreconditionViolation(String),

  #[error("Request ID already subscribed: {0}")]
  AlreadySubscribed(i32),

  #[error("Request timeout: {0}")]
  Timeout(String),

  #[error("Unexpected reply: {0}")]
  UnexpectedReply(String),

  #[error("Logging error: {0}")]
  LoggingError(String),

  #[error("Internal error: {0}")]
  InternalError(String),
}

impl EngineError {
  /// True for errors that concern a single undecodable frame. These never
  /// terminate the dispatch loop.
  pub fn is_decode_error(&self) -> bool {
    matches!(self, EngineError::UnknownMessageType(_) | EngineError::MalformedFrame(_))
  }
}
