// twsengine/src/parser_data_market.rs
// Decoders for streaming market data replies.

use crate::base::EngineError;
use crate::min_server_ver::min_server_ver;
use crate::protocol_dec_parser::FieldParser;
use crate::protocol_decoder::{Reply, TickAttrib};

fn parse_tick_attrib(mask_val: i32, server_version: i32) -> TickAttrib {
  let mut attrib = TickAttrib::default();
  if server_version >= min_server_ver::PAST_LIMIT {
    attrib.can_auto_execute = (mask_val & 1) != 0; // Bit 0
    attrib.past_limit = (mask_val & 2) != 0;       // Bit 1
    if server_version >= min_server_ver::PRE_OPEN_BID_ASK {
      attrib.pre_open = (mask_val & 4) != 0;     // Bit 2
    }
  } else {
    // Older servers: 0=false, 1=true
    attrib.can_auto_execute = mask_val == 1;
  }
  attrib
}

/// Tick price (type 1)
pub fn decode_tick_price(parser: &mut FieldParser, server_version: i32) -> Result<Reply, EngineError> {
  let version = parser.read_int()?;
  let req_id = parser.read_int()?;
  let tick_type = parser.read_int()?;
  let price = parser.read_double()?;
  let size = if version >= 2 { parser.read_decimal_max()? } else { None };
  let attrib = if version >= 3 {
    parse_tick_attrib(parser.read_int()?, server_version)
  } else {
    TickAttrib::default()
  };

  log::trace!("Tick Price: ID={}, Type={}, Price={}, Size={:?}, Attrib={:?}", req_id, tick_type, price, size, attrib);
  Ok(Reply::TickPrice { req_id, tick_type, price, size, attrib })
}

/// Tick size (type 2)
pub fn decode_tick_size(parser: &mut FieldParser, _server_version: i32) -> Result<Reply, EngineError> {
  let _version = parser.read_int()?;
  let req_id = parser.read_int()?;
  let tick_type = parser.read_int()?;
  let size = parser.read_decimal_max()?;

  log::trace!("Tick Size: ID={}, Type={}, Size={:?}", req_id, tick_type, size);
  Ok(Reply::TickSize { req_id, tick_type, size })
}

/// Tick generic (type 45)
pub fn decode_tick_generic(parser: &mut FieldParser, _server_version: i32) -> Result<Reply, EngineError> {
  let _version = parser.read_int()?;
  let req_id = parser.read_int()?;
  let tick_type = parser.read_int()?;
  let value = parser.read_double()?;
  Ok(Reply::TickGeneric { req_id, tick_type, value })
}

/// Tick string (type 46)
pub fn decode_tick_string(parser: &mut FieldParser, _server_version: i32) -> Result<Reply, EngineError> {
  let _version = parser.read_int()?;
  let req_id = parser.read_int()?;
  let tick_type = parser.read_int()?;
  let value = parser.read_string()?;
  Ok(Reply::TickString { req_id, tick_type, value })
}

/// End of a snapshot request (type 57)
pub fn decode_tick_snapshot_end(parser: &mut FieldParser, _server_version: i32) -> Result<Reply, EngineError> {
  let _version = parser.read_int()?;
  let req_id = parser.read_int()?;
  Ok(Reply::TickSnapshotEnd { req_id })
}

/// Market data type switch for a request (type 58)
pub fn decode_market_data_type(parser: &mut FieldParser, _server_version: i32) -> Result<Reply, EngineError> {
  let _version = parser.read_int()?;
  let req_id = parser.read_int()?;
  let market_data_type = parser.read_int()?;
  Ok(Reply::MarketDataType { req_id, market_data_type })
}
