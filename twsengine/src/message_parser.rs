// twsengine/src/message_parser.rs
//
// Map incoming message types to their decoders.
use std::collections::HashMap;

use log::trace;
use once_cell::sync::Lazy;

use crate::base::EngineError;
use crate::frame::Frame;
use crate::protocol_dec_parser::FieldParser;
use crate::protocol_decoder::{IncomingMessageType, Reply};

use crate::parser_client::*;
use crate::parser_data_market::*;
use crate::parser_data_ref::*;

/// Decodes the fields following the message type, given the server version.
pub type DecodeFn = fn(&mut FieldParser, i32) -> Result<Reply, EngineError>;

/// Supported incoming messages. Adding a message type means adding a
/// `Reply` variant, its decoder, and one entry here.
static DECODE_TABLE: Lazy<HashMap<i32, DecodeFn>> = Lazy::new(|| {
  use IncomingMessageType as T;
  let entries: [(IncomingMessageType, DecodeFn); 12] = [
    (T::TickPrice, decode_tick_price),
    (T::TickSize, decode_tick_size),
    (T::ErrorMessage, decode_error_message),
    (T::NextValidId, decode_next_valid_id),
    (T::ContractData, decode_contract_data),
    (T::ManagedAccounts, decode_managed_accounts),
    (T::TickGeneric, decode_tick_generic),
    (T::TickString, decode_tick_string),
    (T::CurrentTime, decode_current_time),
    (T::ContractDataEnd, decode_contract_data_end),
    (T::TickSnapshotEnd, decode_tick_snapshot_end),
    (T::MarketDataType, decode_market_data_type),
  ];
  entries.into_iter().map(|(t, f)| (t as i32, f)).collect()
});

/// Turns frame bodies into typed replies for one negotiated server version.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
  server_version: i32,
}

impl Decoder {
  pub fn new(server_version: i32) -> Self {
    Decoder { server_version }
  }

  /// True if `msg_type` has a registered decoder.
  pub fn supports(msg_type: i32) -> bool {
    DECODE_TABLE.contains_key(&msg_type)
  }

  /// Decode the fields of one message (everything after the type field).
  pub fn decode(&self, msg_type: i32, fields: &[u8]) -> Result<Reply, EngineError> {
    let decode_fn = DECODE_TABLE.get(&msg_type)
      .ok_or(EngineError::UnknownMessageType(msg_type))?;
    let mut parser = FieldParser::new(fields);
    let reply = decode_fn(&mut parser, self.server_version)?;
    if parser.remaining_fields() > 0 {
      trace!("Message type {} has {} unread trailing fields", msg_type, parser.remaining_fields());
    }
    Ok(reply)
  }

  pub fn decode_frame(&self, frame: &Frame) -> Result<Reply, EngineError> {
    self.decode(frame.msg_type, frame.fields())
  }
}
