// twsengine/src/parser_data_ref.rs
// Decoders for reference data replies.

use std::str::FromStr;

use crate::base::EngineError;
use crate::contract::{ContractDetails, OptionRight, SecType};
use crate::min_server_ver::min_server_ver;
use crate::protocol_dec_parser::FieldParser;
use crate::protocol_decoder::Reply;

fn non_empty(s: String) -> Option<String> {
  if s.is_empty() { None } else { Some(s) }
}

/// Contract data (type 10). Reads the fields up to and including the
/// security id list; anything a newer server appends after that is left
/// unread.
pub fn decode_contract_data(parser: &mut FieldParser, server_version: i32) -> Result<Reply, EngineError> {
  let version = if server_version < min_server_ver::SIZE_RULES { parser.read_int()? } else { 8 };

  let req_id = if version >= 3 { parser.read_int()? } else { -1 };

  let mut details = ContractDetails::default();
  let contract = &mut details.contract;

  contract.symbol = parser.read_string()?;
  contract.sec_type = SecType::from_str(&parser.read_string()?)?;
  contract.last_trade_date_or_contract_month = non_empty(parser.read_string()?);
  if server_version >= min_server_ver::LAST_TRADE_DATE {
    parser.skip_field()?; // last trade date, duplicated in the field above
  }
  let strike = parser.read_double()?;
  contract.strike = if strike != 0.0 { Some(strike) } else { None };
  let right = parser.read_string()?;
  contract.right = match right.as_str() {
    "" | "?" => None,
    code => match OptionRight::from_str(code) {
      Ok(r) => Some(r),
      Err(_) => {
        log::warn!("Unrecognized option right '{}' for {}; leaving it unset", code, contract.symbol);
        None
      }
    },
  };
  contract.exchange = parser.read_string()?;
  contract.currency = parser.read_string()?;
  contract.local_symbol = non_empty(parser.read_string()?);
  details.market_name = parser.read_string()?;
  details.contract.trading_class = non_empty(parser.read_string()?);
  details.contract.con_id = parser.read_int()?;
  details.min_tick = parser.read_double()?;
  if server_version >= min_server_ver::MD_SIZE_MULTIPLIER && server_version < min_server_ver::SIZE_RULES {
    details.md_size_multiplier = Some(parser.read_int()?);
  }
  details.contract.multiplier = non_empty(parser.read_string()?);
  details.order_types = parser.read_string()?;
  details.valid_exchanges = parser.read_string()?;
  if version >= 2 {
    details.price_magnifier = parser.read_int()?;
  }
  if version >= 4 {
    details.underlying_con_id = parser.read_int()?;
  }
  if version >= 5 {
    details.long_name = parser.read_string()?;
    details.contract.primary_exchange = non_empty(parser.read_string()?);
  }
  if version >= 6 {
    details.contract_month = parser.read_string()?;
    details.industry = parser.read_string()?;
    details.category = parser.read_string()?;
    details.subcategory = parser.read_string()?;
    details.time_zone_id = parser.read_string()?;
    details.trading_hours = parser.read_string()?;
    details.liquid_hours = parser.read_string()?;
  }
  if version >= 8 {
    details.ev_rule = parser.read_string()?;
    details.ev_multiplier = parser.read_double()?;
  }
  if version >= 7 {
    let count = parser.read_int()?;
    for _ in 0..count.max(0) {
      let tag = parser.read_string()?;
      let value = parser.read_string()?;
      details.sec_id_list.push((tag, value));
    }
  }

  log::debug!("Contract Data: ReqID={}, Symbol={}, SecType={}, Exchange={}, ConID={}",
              req_id, details.contract.symbol, details.contract.sec_type, details.contract.exchange, details.contract.con_id);
  Ok(Reply::ContractData { req_id, details: Box::new(details) })
}

/// End of a contract data request (type 52)
pub fn decode_contract_data_end(parser: &mut FieldParser, _server_version: i32) -> Result<Reply, EngineError> {
  let _version = parser.read_int()?;
  let req_id = parser.read_int()?;

  log::debug!("Contract Data End: {}", req_id);
  Ok(Reply::ContractDataEnd { req_id })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_contract_data_end() {
    let mut p = FieldParser::new(b"1\05\0");
    assert_eq!(decode_contract_data_end(&mut p, 187).unwrap(), Reply::ContractDataEnd { req_id: 5 });
  }

  fn contract_body(sec_type: &str, expiry: &str, strike: &str, right: &str) -> Vec<u8> {
    let fields = [
      "5", "XYZ", sec_type, expiry, expiry, strike, right, "SMART", "USD", "XYZ 1", "XYZ", "XYZ", "1234", "0.01", "",
      "LMT", "SMART", "1", "0", "XYZ CORP", "ASX", "", "", "", "", "AEST", "", "", "", "0", "0",
    ];
    let mut body = Vec::new();
    for f in fields {
      body.extend_from_slice(f.as_bytes());
      body.push(0);
    }
    body
  }

  #[test]
  fn test_contract_data_unlisted_sec_type_kept() {
    let body = contract_body("IOPT", "", "0", "");
    let reply = decode_contract_data(&mut FieldParser::new(&body), 187).unwrap();
    match reply {
      Reply::ContractData { req_id, details } => {
        assert_eq!(req_id, 5);
        assert_eq!(details.contract.sec_type, SecType::IndexOption);
        assert_eq!(details.contract.con_id, 1234);
      }
      other => panic!("expected ContractData, got {}", other),
    }

    let body = contract_body("NEWTYPE", "", "0", "");
    match decode_contract_data(&mut FieldParser::new(&body), 187).unwrap() {
      Reply::ContractData { details, .. } => {
        assert_eq!(details.contract.sec_type, SecType::Other("NEWTYPE".to_string()));
        assert_eq!(details.long_name, "XYZ CORP");
      }
      other => panic!("expected ContractData, got {}", other),
    }
  }

  #[test]
  fn test_contract_data_option_fields() {
    let body = contract_body("OPT", "20240621", "190", "C");
    match decode_contract_data(&mut FieldParser::new(&body), 187).unwrap() {
      Reply::ContractData { details, .. } => {
        assert_eq!(details.contract.sec_type, SecType::Option);
        assert_eq!(details.contract.last_trade_date_or_contract_month.as_deref(), Some("20240621"));
        assert_eq!(details.contract.strike, Some(190.0));
        assert_eq!(details.contract.right, Some(OptionRight::Call));
      }
      other => panic!("expected ContractData, got {}", other),
    }

    let body = contract_body("OPT", "20240621", "190", "Z");
    match decode_contract_data(&mut FieldParser::new(&body), 187).unwrap() {
      Reply::ContractData { details, .. } => assert_eq!(details.contract.right, None),
      other => panic!("expected ContractData, got {}", other),
    }
  }
}
