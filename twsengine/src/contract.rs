// twsengine/src/contract.rs
// Instrument descriptions carried by requests and contract-data replies.
// The engine transports these values; it does not validate them.

use std::fmt;
use std::str::FromStr;
use crate::base::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SecType {
  #[default]
  Stock,          // STK
  Option,         // OPT
  Future,         // FUT
  ContinuousFuture, // CONTFUT
  Forex,          // CASH
  Bond,           // BOND
  Cfd,            // CFD
  FutureOption,   // FOP
  Warrant,        // WAR
  IndexOption,    // IOPT
  Forward,        // FWD
  Combo,          // BAG
  Index,          // IND
  Bill,           // BILL
  Fund,           // FUND
  Fixed,          // FIXED
  Slb,            // SLB
  News,           // NEWS
  Commodity,      // CMDTY
  Basket,         // BSK
  Icu,            // ICU
  Ics,            // ICS
  Crypto,         // CRYPTO
  /// A code this crate has no variant for, kept verbatim.
  Other(String),
}

impl fmt::Display for SecType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      SecType::Stock => "STK",
      SecType::Option => "OPT",
      SecType::Future => "FUT",
      SecType::ContinuousFuture => "CONTFUT",
      SecType::Forex => "CASH",
      SecType::Bond => "BOND",
      SecType::Cfd => "CFD",
      SecType::FutureOption => "FOP",
      SecType::Warrant => "WAR",
      SecType::IndexOption => "IOPT",
      SecType::Forward => "FWD",
      SecType::Combo => "BAG",
      SecType::Index => "IND",
      SecType::Bill => "BILL",
      SecType::Fund => "FUND",
      SecType::Fixed => "FIXED",
      SecType::Slb => "SLB",
      SecType::News => "NEWS",
      SecType::Commodity => "CMDTY",
      SecType::Basket => "BSK",
      SecType::Icu => "ICU",
      SecType::Ics => "ICS",
      SecType::Crypto => "CRYPTO",
      SecType::Other(code) => code.as_str(),
    };
    write!(f, "{}", s)
  }
}

impl FromStr for SecType {
  type Err = EngineError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "STK" => Ok(SecType::Stock),
      "OPT" => Ok(SecType::Option),
      "FUT" => Ok(SecType::Future),
      "CONTFUT" => Ok(SecType::ContinuousFuture),
      "CASH" => Ok(SecType::Forex),
      "BOND" => Ok(SecType::Bond),
      "CFD" => Ok(SecType::Cfd),
      "FOP" => Ok(SecType::FutureOption),
      "WAR" => Ok(SecType::Warrant),
      "IOPT" => Ok(SecType::IndexOption),
      "FWD" => Ok(SecType::Forward),
      "BAG" => Ok(SecType::Combo),
      "IND" => Ok(SecType::Index),
      "BILL" => Ok(SecType::Bill),
      "FUND" => Ok(SecType::Fund),
      "FIXED" => Ok(SecType::Fixed),
      "SLB" => Ok(SecType::Slb),
      "NEWS" => Ok(SecType::News),
      "CMDTY" => Ok(SecType::Commodity),
      "BSK" => Ok(SecType::Basket),
      "ICU" => Ok(SecType::Icu),
      "ICS" => Ok(SecType::Ics),
      "CRYPTO" => Ok(SecType::Crypto),
      other => Ok(SecType::Other(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionRight {
  Call,
  Put,
}

impl fmt::Display for OptionRight {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OptionRight::Call => write!(f, "C"),
      OptionRight::Put => write!(f, "P"),
    }
  }
}

impl FromStr for OptionRight {
  type Err = EngineError;
  fn from_str(s: &str) -> Result<Self, EngineError> {
    match s.trim().to_uppercase().as_str() {
      "C" | "CALL" => Ok(OptionRight::Call),
      "P" | "PUT" => Ok(OptionRight::Put),
      _ => Err(EngineError::MalformedFrame(format!("Unknown option right: {}", s))),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecIdType {
  Cusip,
  Sedol,
  Isin,
  Ric,
}

impl fmt::Display for SecIdType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      SecIdType::Cusip => "CUSIP",
      SecIdType::Sedol => "SEDOL",
      SecIdType::Isin => "ISIN",
      SecIdType::Ric => "RIC",
    };
    write!(f, "{}", s)
  }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Contract {
  pub con_id: i32,
  pub symbol: String,
  pub sec_type: SecType,
  pub last_trade_date_or_contract_month: Option<String>,
  pub strike: Option<f64>,
  pub right: Option<OptionRight>,
  pub multiplier: Option<String>,
  pub exchange: String,
  pub primary_exchange: Option<String>,
  pub currency: String,
  pub local_symbol: Option<String>,
  pub trading_class: Option<String>,
  pub sec_id_type: Option<SecIdType>,
  pub sec_id: Option<String>,
  pub issuer_id: Option<String>,
  pub include_expired: bool,
}

impl Contract {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a new stock contract routed through SMART in USD
  pub fn stock(symbol: &str) -> Self {
    Self::stock_with_exchange(symbol, "SMART", "USD")
  }

  /// Create a new stock contract with specified exchange and currency
  pub fn stock_with_exchange(symbol: &str, exchange: &str, currency: &str) -> Self {
    Contract {
      symbol: symbol.to_string(),
      sec_type: SecType::Stock,
      exchange: exchange.to_string(),
      currency: currency.to_string(),
      ..Default::default()
    }
  }

  /// Create an option contract. Leave `expiry`/`strike`/`right` unset to match a whole chain.
  pub fn option(symbol: &str, expiry: Option<&str>, strike: Option<f64>, right: Option<OptionRight>) -> Self {
    Contract {
      symbol: symbol.to_string(),
      sec_type: SecType::Option,
      last_trade_date_or_contract_month: expiry.map(|s| s.to_string()),
      strike,
      right,
      exchange: "SMART".to_string(),
      currency: "USD".to_string(),
      ..Default::default()
    }
  }
}

/// Detailed contract information returned by a contract data request
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContractDetails {
  pub contract: Contract,
  pub market_name: String,
  pub min_tick: f64,
  pub md_size_multiplier: Option<i32>,
  pub order_types: String,
  pub valid_exchanges: String,
  pub price_magnifier: i32,
  pub underlying_con_id: i32,
  pub long_name: String,
  pub contract_month: String,
  pub industry: String,
  pub category: String,
  pub subcategory: String,
  pub time_zone_id: String,
  pub trading_hours: String,
  pub liquid_hours: String,
  pub ev_rule: String,
  pub ev_multiplier: f64,
  pub sec_id_list: Vec<(String, String)>,
}
