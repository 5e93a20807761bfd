// twsengine/src/protocol_decoder.rs
// Typed replies and the incoming message type codes they are tagged with.

use std::fmt;

use chrono::{DateTime, Utc};
use num_enum::TryFromPrimitive;

use crate::base::EngineError;
use crate::contract::ContractDetails;

/// Message tags for incoming messages
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum IncomingMessageType {
  TickPrice = 1,
  TickSize = 2,
  OrderStatus = 3,
  ErrorMessage = 4,
  OpenOrder = 5,
  AccountValue = 6,
  PortfolioValue = 7,
  AccountUpdateTime = 8,
  NextValidId = 9,
  ContractData = 10,
  ExecutionData = 11,
  MarketDepth = 12,
  MarketDepthL2 = 13,
  NewsBulletins = 14,
  ManagedAccounts = 15,
  ReceiveFA = 16,
  HistoricalData = 17,
  BondContractData = 18,
  ScannerParameters = 19,
  ScannerData = 20,
  TickOptionComputation = 21,
  TickGeneric = 45,
  TickString = 46,
  TickEFP = 47,
  CurrentTime = 49,
  RealTimeBars = 50,
  FundamentalData = 51,
  ContractDataEnd = 52,
  OpenOrderEnd = 53,
  AccountDownloadEnd = 54,
  ExecutionDataEnd = 55,
  DeltaNeutralValidation = 56,
  TickSnapshotEnd = 57,
  MarketDataType = 58,
  CommissionReport = 59,
  Position = 61,
  PositionEnd = 62,
  AccountSummary = 63,
  AccountSummaryEnd = 64,
  TickReqParams = 81,
  HeadTimestamp = 88,
  PnL = 94,
  PnLSingle = 95,
  TickByTick = 99,
  UserInfo = 107,
}

/// Attributes carried by a price tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickAttrib {
  pub can_auto_execute: bool,
  pub past_limit: bool,
  pub pre_open: bool,
}

/// How a decoded reply is routed by the subscription registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
  /// Goes to the observer of this id, or is dropped if none is registered.
  Correlated(i32),
  /// Goes to the observer of this id if registered, otherwise to the fallback.
  CorrelatedOrFallback(i32),
  /// Session-level reply; always goes to the fallback.
  Uncorrelated,
}

/// A decoded incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
  TickPrice { req_id: i32, tick_type: i32, price: f64, size: Option<f64>, attrib: TickAttrib },
  TickSize { req_id: i32, tick_type: i32, size: Option<f64> },
  TickGeneric { req_id: i32, tick_type: i32, value: f64 },
  TickString { req_id: i32, tick_type: i32, value: String },
  TickSnapshotEnd { req_id: i32 },
  MarketDataType { req_id: i32, market_data_type: i32 },
  ContractData { req_id: i32, details: Box<ContractDetails> },
  ContractDataEnd { req_id: i32 },
  /// `id` is -1 for errors not tied to a request.
  Error { id: i32, code: i32, message: String, advanced_order_reject_json: Option<String> },
  NextValidId { order_id: i32 },
  ManagedAccounts { accounts: Vec<String> },
  CurrentTime { time: DateTime<Utc> },
  /// A frame that could not be decoded. Only ever delivered to the fallback observer.
  DecodeFailure { msg_type: i32, error: EngineError },
}

impl Reply {
  /// Message type this reply was decoded from.
  pub fn msg_type(&self) -> Option<IncomingMessageType> {
    use IncomingMessageType as T;
    let t = match self {
      Reply::TickPrice { .. } => T::TickPrice,
      Reply::TickSize { .. } => T::TickSize,
      Reply::TickGeneric { .. } => T::TickGeneric,
      Reply::TickString { .. } => T::TickString,
      Reply::TickSnapshotEnd { .. } => T::TickSnapshotEnd,
      Reply::MarketDataType { .. } => T::MarketDataType,
      Reply::ContractData { .. } => T::ContractData,
      Reply::ContractDataEnd { .. } => T::ContractDataEnd,
      Reply::Error { .. } => T::ErrorMessage,
      Reply::NextValidId { .. } => T::NextValidId,
      Reply::ManagedAccounts { .. } => T::ManagedAccounts,
      Reply::CurrentTime { .. } => T::CurrentTime,
      Reply::DecodeFailure { .. } => return None,
    };
    Some(t)
  }

  /// Numeric type code. 0 is reserved for `DecodeFailure`.
  pub fn code(&self) -> i32 {
    self.msg_type().map_or(0, |t| t as i32)
  }

  /// Request id carried by the reply, if any.
  pub fn correlation_id(&self) -> Option<i32> {
    match self.routing() {
      Routing::Correlated(id) | Routing::CorrelatedOrFallback(id) => Some(id),
      Routing::Uncorrelated => None,
    }
  }

  pub fn routing(&self) -> Routing {
    match self {
      Reply::TickPrice { req_id, .. }
      | Reply::TickSize { req_id, .. }
      | Reply::TickGeneric { req_id, .. }
      | Reply::TickString { req_id, .. }
      | Reply::TickSnapshotEnd { req_id }
      | Reply::MarketDataType { req_id, .. }
      | Reply::ContractData { req_id, .. }
      | Reply::ContractDataEnd { req_id } => Routing::Correlated(*req_id),
      Reply::Error { id, .. } if *id >= 0 => Routing::CorrelatedOrFallback(*id),
      Reply::Error { .. }
      | Reply::NextValidId { .. }
      | Reply::ManagedAccounts { .. }
      | Reply::CurrentTime { .. }
      | Reply::DecodeFailure { .. } => Routing::Uncorrelated,
    }
  }
}

impl fmt::Display for Reply {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Reply::TickPrice { req_id, tick_type, price, .. } =>
        write!(f, "TickPrice(id={}, type={}, price={})", req_id, tick_type, price),
      Reply::TickSize { req_id, tick_type, size } =>
        write!(f, "TickSize(id={}, type={}, size={:?})", req_id, tick_type, size),
      Reply::ContractData { req_id, details } =>
        write!(f, "ContractData(id={}, symbol={}, con_id={})", req_id, details.contract.symbol, details.contract.con_id),
      Reply::Error { id, code, message, .. } =>
        write!(f, "Error(id={}, code={}, msg={})", id, code, message),
      Reply::DecodeFailure { msg_type, error } =>
        write!(f, "DecodeFailure(type={}, error={})", msg_type, error),
      other => write!(f, "{:?}", other),
    }
  }
}
