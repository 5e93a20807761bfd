// twsengine/src/parser_client.rs
// Decoders for session-level replies: errors, ids, accounts and time.

use chrono::{TimeZone, Utc};

use crate::base::EngineError;
use crate::min_server_ver::min_server_ver;
use crate::protocol_dec_parser::FieldParser;
use crate::protocol_decoder::Reply;

/// Error message (type 4)
pub fn decode_error_message(parser: &mut FieldParser, server_version: i32) -> Result<Reply, EngineError> {
  let version = parser.read_int()?;

  if version < 2 {
    // Very old format, just a single message string
    let message = parser.read_string()?;
    return Ok(Reply::Error { id: -1, code: 0, message, advanced_order_reject_json: None });
  }

  let id = parser.read_int()?;
  let code = parser.read_int()?;
  let message = parser.read_string()?;
  let advanced_order_reject_json = if server_version >= min_server_ver::ADVANCED_ORDER_REJECT && parser.remaining_fields() > 0 {
    let json = parser.read_string()?;
    if json.is_empty() { None } else { Some(json) }
  } else {
    None
  };

  Ok(Reply::Error { id, code, message, advanced_order_reject_json })
}

/// Next valid order id (type 9), sent right after the handshake
pub fn decode_next_valid_id(parser: &mut FieldParser, _server_version: i32) -> Result<Reply, EngineError> {
  let _version = parser.read_int()?;
  let order_id = parser.read_int()?;
  Ok(Reply::NextValidId { order_id })
}

/// Managed accounts (type 15), a comma-separated list
pub fn decode_managed_accounts(parser: &mut FieldParser, _server_version: i32) -> Result<Reply, EngineError> {
  let _version = parser.read_int()?;
  let list = parser.read_string()?;
  let accounts = list.split(',')
    .map(|s| s.trim())
    .filter(|s| !s.is_empty())
    .map(|s| s.to_string())
    .collect();
  Ok(Reply::ManagedAccounts { accounts })
}

/// Current time (type 49)
pub fn decode_current_time(parser: &mut FieldParser, _server_version: i32) -> Result<Reply, EngineError> {
  let _version = parser.read_int()?;
  let time_unix = parser.read_i64()?;
  let time = Utc.timestamp_opt(time_unix, 0).single()
    .ok_or_else(|| EngineError::MalformedFrame(format!("Invalid unix time: {}", time_unix)))?;
  Ok(Reply::CurrentTime { time })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_error_with_request_id() {
    let mut p = FieldParser::new(b"2\03\0200\0No security definition\0\0");
    let reply = decode_error_message(&mut p, min_server_ver::MAX_SUPPORTED_VERSION).unwrap();
    assert_eq!(reply, Reply::Error {
      id: 3,
      code: 200,
      message: "No security definition".to_string(),
      advanced_order_reject_json: None,
    });
  }

  #[test]
  fn test_error_old_format() {
    let mut p = FieldParser::new(b"1\0something broke\0");
    match decode_error_message(&mut p, 100).unwrap() {
      Reply::Error { id, message, .. } => {
        assert_eq!(id, -1);
        assert_eq!(message, "something broke");
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn test_managed_accounts() {
    let mut p = FieldParser::new(b"1\0DU111,DU222,\0");
    assert_eq!(decode_managed_accounts(&mut p, 187).unwrap(),
               Reply::ManagedAccounts { accounts: vec!["DU111".to_string(), "DU222".to_string()] });
  }

  #[test]
  fn test_current_time() {
    let mut p = FieldParser::new(b"1\01700000000\0");
    match decode_current_time(&mut p, 187).unwrap() {
      Reply::CurrentTime { time } => assert_eq!(time.timestamp(), 1_700_000_000),
      other => panic!("unexpected {:?}", other),
    }
  }
}
