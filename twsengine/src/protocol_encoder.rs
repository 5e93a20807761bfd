// twsengine/src/protocol_encoder.rs
// Encoder for outgoing TWS protocol messages

use std::io::{Cursor, Write};

use log::{debug, trace, warn};
use num_enum::TryFromPrimitive;

use crate::base::EngineError;
use crate::contract::{Contract, SecType};
use crate::min_server_ver::min_server_ver;

/// Message tags for outgoing messages
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum OutgoingMessageType {
  RequestMarketData = 1,
  CancelMarketData = 2,
  RequestIds = 8,
  RequestContractData = 9,
  RequestCurrentTime = 49,
  RequestMarketDataType = 59,
  StartApi = 71,
}

impl OutgoingMessageType {
  /// Wire name, as used in session logs.
  pub fn name(&self) -> &'static str {
    match self {
      OutgoingMessageType::RequestMarketData => "REQ_MKT_DATA",
      OutgoingMessageType::CancelMarketData => "CANCEL_MKT_DATA",
      OutgoingMessageType::RequestIds => "REQ_IDS",
      OutgoingMessageType::RequestContractData => "REQ_CONTRACT_DATA",
      OutgoingMessageType::RequestCurrentTime => "REQ_CURRENT_TIME",
      OutgoingMessageType::RequestMarketDataType => "REQ_MARKET_DATA_TYPE",
      OutgoingMessageType::StartApi => "START_API",
    }
  }
}

/// Identifies an outgoing message type from an encoded body.
///
/// Returns `Some((type_id, name))`, or `None` if the leading field is not a
/// known outgoing message type.
pub fn identify_outgoing_type(msg_data: &[u8]) -> Option<(i32, &'static str)> {
  let end_pos = msg_data.iter().position(|&b| b == 0)?;
  let type_id: i32 = std::str::from_utf8(&msg_data[..end_pos]).ok()?.parse().ok()?;
  OutgoingMessageType::try_from(type_id).ok().map(|t| (type_id, t.name()))
}

pub struct Encoder {
  server_version: i32,
}

impl Encoder {
  /// Create a new message encoder for a specific server version.
  pub fn new(server_version: i32) -> Self {
    Self { server_version }
  }

  pub fn server_version(&self) -> i32 { self.server_version }

  // --- Helper methods ---
  fn start_encoding(&self, msg_type: OutgoingMessageType) -> Result<Cursor<Vec<u8>>, EngineError> {
    let mut cursor = Cursor::new(Vec::new());
    self.write_int_to_cursor(&mut cursor, msg_type as i32)?;
    Ok(cursor)
  }

  fn finish_encoding(&self, cursor: Cursor<Vec<u8>>) -> Vec<u8> {
    cursor.into_inner()
  }

  fn write_str_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, s: &str) -> Result<(), EngineError> {
    trace!("Encoding string: {}", s);
    cursor.write_all(s.as_bytes()).map_err(|e| EngineError::InternalError(format!("Buffer write failed: {}", e)))?;
    cursor.write_all(&[0]).map_err(|e| EngineError::InternalError(format!("Buffer write failed: {}", e)))?;
    Ok(())
  }

  fn write_optional_str_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, s: Option<&str>) -> Result<(), EngineError> {
    self.write_str_to_cursor(cursor, s.unwrap_or(""))
  }

  fn write_int_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, val: i32) -> Result<(), EngineError> {
    self.write_str_to_cursor(cursor, &val.to_string())
  }

  fn write_double_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, val: f64) -> Result<(), EngineError> {
    if val.is_nan() {
      warn!("Attempting to encode NaN double value. Sending 0.0.");
      self.write_str_to_cursor(cursor, "0.0")
    } else if val.is_infinite() {
      warn!("Attempting to encode infinite double value. Sending unset.");
      self.write_str_to_cursor(cursor, "")
    } else {
      self.write_str_to_cursor(cursor, &val.to_string())
    }
  }

  fn write_optional_double_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, val: Option<f64>) -> Result<(), EngineError> {
    self.write_double_to_cursor(cursor, val.unwrap_or(0.0))
  }

  fn write_bool_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, val: bool) -> Result<(), EngineError> {
    self.write_int_to_cursor(cursor, if val { 1 } else { 0 })
  }

  fn write_tag_value_list(&self, cursor: &mut Cursor<Vec<u8>>, list: &[(String, String)]) -> Result<(), EngineError> {
    let joined: String = list.iter().map(|(tag, value)| format!("{}={};", tag, value)).collect();
    self.write_str_to_cursor(cursor, &joined)
  }

  // --- Handshake ---

  /// StartApi, the last step of the handshake: version 2, client id, capabilities.
  pub fn encode_start_api(&self, client_id: i32, optional_capabilities: &str) -> Result<Vec<u8>, EngineError> {
    debug!("Encoding start API: ClientID={}", client_id);
    let mut cursor = self.start_encoding(OutgoingMessageType::StartApi)?;
    self.write_int_to_cursor(&mut cursor, 2)?; // Version
    self.write_int_to_cursor(&mut cursor, client_id)?;
    if self.server_version >= min_server_ver::OPTIONAL_CAPABILITIES {
      self.write_str_to_cursor(&mut cursor, optional_capabilities)?;
    }
    Ok(self.finish_encoding(cursor))
  }

  // --- Requests ---

  pub fn encode_request_ids(&self, num_ids: i32) -> Result<Vec<u8>, EngineError> {
    debug!("Encoding request IDs message");
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestIds)?;
    self.write_int_to_cursor(&mut cursor, 1)?; // Version
    self.write_int_to_cursor(&mut cursor, num_ids)?;
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_current_time(&self) -> Result<Vec<u8>, EngineError> {
    debug!("Encoding request current time");
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestCurrentTime)?;
    self.write_int_to_cursor(&mut cursor, 1)?; // Version
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_market_data_type(&self, market_data_type: i32) -> Result<Vec<u8>, EngineError> {
    debug!("Encoding request market data type: {}", market_data_type);
    if self.server_version < min_server_ver::MARKET_DATA_TYPE {
      warn!("Server version {} does not support market data type requests", self.server_version);
    }
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestMarketDataType)?;
    self.write_int_to_cursor(&mut cursor, 1)?; // Version
    self.write_int_to_cursor(&mut cursor, market_data_type)?;
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_market_data(
    &self,
    req_id: i32,
    contract: &Contract,
    generic_tick_list: &str,
    snapshot: bool,
    regulatory_snapshot: bool,
    options: &[(String, String)],
  ) -> Result<Vec<u8>, EngineError> {
    debug!("Encoding request market data message for contract {}: ReqID={}", contract.symbol, req_id);
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestMarketData)?;

    // Version 11 covers everything a server from MIN_CLIENT_VER on understands.
    let version = 11;
    self.write_int_to_cursor(&mut cursor, version)?;
    self.write_int_to_cursor(&mut cursor, req_id)?;

    self.write_int_to_cursor(&mut cursor, contract.con_id)?;
    self.write_str_to_cursor(&mut cursor, &contract.symbol)?;
    self.write_str_to_cursor(&mut cursor, &contract.sec_type.to_string())?;
    self.write_optional_str_to_cursor(&mut cursor, contract.last_trade_date_or_contract_month.as_deref())?;
    self.write_optional_double_to_cursor(&mut cursor, contract.strike)?;
    self.write_optional_str_to_cursor(&mut cursor, contract.right.map(|r| r.to_string()).as_deref())?;
    self.write_optional_str_to_cursor(&mut cursor, contract.multiplier.as_deref())?;
    self.write_str_to_cursor(&mut cursor, &contract.exchange)?;
    self.write_optional_str_to_cursor(&mut cursor, contract.primary_exchange.as_deref())?;
    self.write_str_to_cursor(&mut cursor, &contract.currency)?;
    self.write_optional_str_to_cursor(&mut cursor, contract.local_symbol.as_deref())?;
    if self.server_version >= min_server_ver::TRADING_CLASS {
      self.write_optional_str_to_cursor(&mut cursor, contract.trading_class.as_deref())?;
    }
    if contract.sec_type == SecType::Combo {
      // Combo legs are not modelled; an empty leg list keeps the layout valid.
      self.write_int_to_cursor(&mut cursor, 0)?;
    }
    if self.server_version >= min_server_ver::DELTA_NEUTRAL_CONID {
      self.write_bool_to_cursor(&mut cursor, false)?; // No delta neutral contract
    }

    self.write_str_to_cursor(&mut cursor, generic_tick_list)?;
    self.write_bool_to_cursor(&mut cursor, snapshot)?;
    if self.server_version >= min_server_ver::SMART_COMPONENTS {
      self.write_bool_to_cursor(&mut cursor, regulatory_snapshot)?;
    }
    if self.server_version >= min_server_ver::LINKING {
      self.write_tag_value_list(&mut cursor, options)?;
    }

    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_cancel_market_data(&self, req_id: i32) -> Result<Vec<u8>, EngineError> {
    debug!("Encoding cancel market data: ReqID={}", req_id);
    let mut cursor = self.start_encoding(OutgoingMessageType::CancelMarketData)?;
    self.write_int_to_cursor(&mut cursor, 2)?; // Version
    self.write_int_to_cursor(&mut cursor, req_id)?;
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_contract_data(&self, req_id: i32, contract: &Contract) -> Result<Vec<u8>, EngineError> {
    debug!("Encoding request contract data: ReqID={}", req_id);
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestContractData)?;
    let version = 8;
    self.write_int_to_cursor(&mut cursor, version)?;
    self.write_int_to_cursor(&mut cursor, req_id)?;

    self.write_int_to_cursor(&mut cursor, contract.con_id)?;
    self.write_str_to_cursor(&mut cursor, &contract.symbol)?;
    self.write_str_to_cursor(&mut cursor, &contract.sec_type.to_string())?;
    self.write_optional_str_to_cursor(&mut cursor, contract.last_trade_date_or_contract_month.as_deref())?;
    self.write_optional_double_to_cursor(&mut cursor, contract.strike)?;
    self.write_optional_str_to_cursor(&mut cursor, contract.right.map(|r| r.to_string()).as_deref())?;
    self.write_optional_str_to_cursor(&mut cursor, contract.multiplier.as_deref())?;
    self.write_str_to_cursor(&mut cursor, &contract.exchange)?;
    self.write_optional_str_to_cursor(&mut cursor, contract.primary_exchange.as_deref())?;
    self.write_str_to_cursor(&mut cursor, &contract.currency)?;
    self.write_optional_str_to_cursor(&mut cursor, contract.local_symbol.as_deref())?;
    if self.server_version >= min_server_ver::TRADING_CLASS {
      self.write_optional_str_to_cursor(&mut cursor, contract.trading_class.as_deref())?;
    }
    self.write_bool_to_cursor(&mut cursor, contract.include_expired)?;
    if self.server_version >= min_server_ver::SEC_ID_TYPE {
      self.write_optional_str_to_cursor(&mut cursor, contract.sec_id_type.as_ref().map(|t| t.to_string()).as_deref())?;
      self.write_optional_str_to_cursor(&mut cursor, contract.sec_id.as_deref())?;
    }
    if self.server_version >= min_server_ver::BOND_ISSUERID {
      self.write_optional_str_to_cursor(&mut cursor, contract.issuer_id.as_deref())?;
    }
    Ok(self.finish_encoding(cursor))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol_dec_parser::FieldParser;

  fn fields(body: &[u8]) -> Vec<String> {
    let mut parser = FieldParser::new(body);
    let mut out = Vec::new();
    while parser.remaining_fields() > 0 {
      out.push(parser.read_string().unwrap());
    }
    out
  }

  #[test]
  fn test_cancel_market_data_layout() {
    let enc = Encoder::new(min_server_ver::MAX_SUPPORTED_VERSION);
    let body = enc.encode_cancel_market_data(42).unwrap();
    assert_eq!(body, b"2\02\042\0".to_vec());
  }

  #[test]
  fn test_request_market_data_layout() {
    let enc = Encoder::new(min_server_ver::MAX_SUPPORTED_VERSION);
    let body = enc.encode_request_market_data(1, &Contract::stock("AAPL"), "", false, false, &[]).unwrap();
    let f = fields(&body);
    assert_eq!(f[0], "1"); // type
    assert_eq!(f[1], "11"); // version
    assert_eq!(f[2], "1"); // req id
    assert_eq!(f[4], "AAPL");
    assert_eq!(f[5], "STK");
    assert_eq!(f[10], "SMART");
    assert_eq!(f[12], "USD");
    // trading class, delta neutral flag, ticks, snapshot, reg snapshot, options
    assert_eq!(f.len(), 20);
  }

  #[test]
  fn test_request_contract_data_older_server_drops_fields() {
    let new_enc = Encoder::new(min_server_ver::MAX_SUPPORTED_VERSION);
    let old_enc = Encoder::new(min_server_ver::MIN_CLIENT_VER);
    let c = Contract::stock("AAPL");
    let new_fields = fields(&new_enc.encode_request_contract_data(3, &c).unwrap());
    let old_fields = fields(&old_enc.encode_request_contract_data(3, &c).unwrap());
    assert_eq!(new_fields[0], "9");
    assert_eq!(new_fields[2], "3");
    assert_eq!(new_fields.len(), old_fields.len() + 1); // issuer id
  }

  #[test]
  fn test_start_api() {
    let enc = Encoder::new(min_server_ver::MAX_SUPPORTED_VERSION);
    assert_eq!(enc.encode_start_api(7, "").unwrap(), b"71\02\07\0\0".to_vec());
  }

  #[test]
  fn test_identify_outgoing_type() {
    assert_eq!(identify_outgoing_type(b"9\08\0"), Some((9, "REQ_CONTRACT_DATA")));
    assert_eq!(identify_outgoing_type(b"999\0"), None);
    assert_eq!(identify_outgoing_type(b"API"), None);
  }
}
