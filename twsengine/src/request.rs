// twsengine/src/request.rs
// Typed outgoing requests.

use std::fmt::Debug;

use crate::base::EngineError;
use crate::contract::Contract;
use crate::protocol_encoder::{Encoder, OutgoingMessageType};

/// An outgoing request that the engine can encode and send.
///
/// Requests whose replies are correlated carry an id, assigned once by the
/// caller (normally from `Engine::next_request_id`) before sending.
pub trait Request: Send + Sync + Debug {
  fn msg_type(&self) -> OutgoingMessageType;

  /// True if the request must carry an id before it can be sent.
  fn requires_id(&self) -> bool;

  fn id(&self) -> Option<i32>;

  /// Assign the correlation id. Fails if the request takes no id or already has one.
  fn set_id(&mut self, id: i32) -> Result<(), EngineError> {
    let _ = id;
    Err(EngineError::PreconditionViolation(format!("{} does not take a request ID", self.msg_type().name())))
  }

  /// Encode the message body (without the length prefix).
  fn encode(&self, encoder: &Encoder) -> Result<Vec<u8>, EngineError>;
}

fn assign_once(slot: &mut Option<i32>, id: i32, msg_type: OutgoingMessageType) -> Result<(), EngineError> {
  if let Some(existing) = slot {
    return Err(EngineError::PreconditionViolation(format!(
      "{} already has request ID {}", msg_type.name(), existing)));
  }
  *slot = Some(id);
  Ok(())
}

fn missing_id(msg_type: OutgoingMessageType) -> EngineError {
  EngineError::PreconditionViolation(format!("{} has no request ID", msg_type.name()))
}

/// Streaming (or snapshot) quote subscription.
#[derive(Debug, Clone)]
pub struct RequestMarketData {
  pub contract: Contract,
  /// Comma-separated generic tick types, e.g. "100,101,233".
  pub generic_tick_list: String,
  pub snapshot: bool,
  pub regulatory_snapshot: bool,
  pub options: Vec<(String, String)>,
  id: Option<i32>,
}

impl RequestMarketData {
  pub fn new(contract: Contract) -> Self {
    RequestMarketData {
      contract,
      generic_tick_list: String::new(),
      snapshot: false,
      regulatory_snapshot: false,
      options: Vec::new(),
      id: None,
    }
  }

  pub fn with_generic_ticks(mut self, ticks: &str) -> Self {
    self.generic_tick_list = ticks.to_string();
    self
  }

  pub fn with_snapshot(mut self, snapshot: bool) -> Self {
    self.snapshot = snapshot;
    self
  }
}

impl Request for RequestMarketData {
  fn msg_type(&self) -> OutgoingMessageType { OutgoingMessageType::RequestMarketData }
  fn requires_id(&self) -> bool { true }
  fn id(&self) -> Option<i32> { self.id }

  fn set_id(&mut self, id: i32) -> Result<(), EngineError> {
    let msg_type = self.msg_type();
    assign_once(&mut self.id, id, msg_type)
  }

  fn encode(&self, encoder: &Encoder) -> Result<Vec<u8>, EngineError> {
    let id = self.id.ok_or_else(|| missing_id(self.msg_type()))?;
    encoder.encode_request_market_data(
      id, &self.contract, &self.generic_tick_list, self.snapshot, self.regulatory_snapshot, &self.options)
  }
}

/// Cancels the market data subscription with the given id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelMarketData {
  pub req_id: i32,
}

impl CancelMarketData {
  pub fn new(req_id: i32) -> Self {
    CancelMarketData { req_id }
  }
}

impl Request for CancelMarketData {
  fn msg_type(&self) -> OutgoingMessageType { OutgoingMessageType::CancelMarketData }
  // The id names the subscription being cancelled; it is fixed at construction.
  fn requires_id(&self) -> bool { false }
  fn id(&self) -> Option<i32> { Some(self.req_id) }

  fn encode(&self, encoder: &Encoder) -> Result<Vec<u8>, EngineError> {
    encoder.encode_cancel_market_data(self.req_id)
  }
}

/// Contract details lookup; answered by zero or more `ContractData` and one `ContractDataEnd`.
#[derive(Debug, Clone)]
pub struct RequestContractData {
  pub contract: Contract,
  id: Option<i32>,
}

impl RequestContractData {
  pub fn new(contract: Contract) -> Self {
    RequestContractData { contract, id: None }
  }
}

impl Request for RequestContractData {
  fn msg_type(&self) -> OutgoingMessageType { OutgoingMessageType::RequestContractData }
  fn requires_id(&self) -> bool { true }
  fn id(&self) -> Option<i32> { self.id }

  fn set_id(&mut self, id: i32) -> Result<(), EngineError> {
    let msg_type = self.msg_type();
    assign_once(&mut self.id, id, msg_type)
  }

  fn encode(&self, encoder: &Encoder) -> Result<Vec<u8>, EngineError> {
    let id = self.id.ok_or_else(|| missing_id(self.msg_type()))?;
    encoder.encode_request_contract_data(id, &self.contract)
  }
}

/// Server clock query; answered by an uncorrelated `CurrentTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestCurrentTime;

impl Request for RequestCurrentTime {
  fn msg_type(&self) -> OutgoingMessageType { OutgoingMessageType::RequestCurrentTime }
  fn requires_id(&self) -> bool { false }
  fn id(&self) -> Option<i32> { None }

  fn encode(&self, encoder: &Encoder) -> Result<Vec<u8>, EngineError> {
    encoder.encode_request_current_time()
  }
}

/// Asks the server for the next valid order id; answered by `NextValidId`.
#[derive(Debug, Clone, Copy)]
pub struct RequestIds {
  pub num_ids: i32,
}

impl Default for RequestIds {
  fn default() -> Self {
    RequestIds { num_ids: 1 }
  }
}

impl Request for RequestIds {
  fn msg_type(&self) -> OutgoingMessageType { OutgoingMessageType::RequestIds }
  fn requires_id(&self) -> bool { false }
  fn id(&self) -> Option<i32> { None }

  fn encode(&self, encoder: &Encoder) -> Result<Vec<u8>, EngineError> {
    encoder.encode_request_ids(self.num_ids)
  }
}

/// Switches the session between live (1), frozen (2), delayed (3) and
/// delayed-frozen (4) market data.
#[derive(Debug, Clone, Copy)]
pub struct RequestMarketDataType {
  pub market_data_type: i32,
}

impl RequestMarketDataType {
  pub fn new(market_data_type: i32) -> Self {
    RequestMarketDataType { market_data_type }
  }
}

impl Request for RequestMarketDataType {
  fn msg_type(&self) -> OutgoingMessageType { OutgoingMessageType::RequestMarketDataType }
  fn requires_id(&self) -> bool { false }
  fn id(&self) -> Option<i32> { None }

  fn encode(&self, encoder: &Encoder) -> Result<Vec<u8>, EngineError> {
    encoder.encode_request_market_data_type(self.market_data_type)
  }
}
