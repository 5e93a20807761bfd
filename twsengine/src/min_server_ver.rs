// twsengine/src/min_server_ver.rs
// Minimum server version constants for the TWS protocol

/// Minimum server versions for specific functionality
pub mod min_server_ver {
  pub const SEC_ID_TYPE: i32 = 45;
  pub const MARKET_DATA_TYPE: i32 = 55;
  pub const DELTA_NEUTRAL_CONID: i32 = 58;
  pub const TRADING_CLASS: i32 = 68;
  pub const LINKING: i32 = 70;
  pub const OPTIONAL_CAPABILITIES: i32 = 72;
  pub const PAST_LIMIT: i32 = 109;
  pub const MD_SIZE_MULTIPLIER: i32 = 110;
  pub const SMART_COMPONENTS: i32 = 114;
  pub const PRE_OPEN_BID_ASK: i32 = 132;
  pub const SIZE_RULES: i32 = 164;
  pub const ADVANCED_ORDER_REJECT: i32 = 166;
  pub const BOND_ISSUERID: i32 = 176;
  pub const LAST_TRADE_DATE: i32 = 182;

  /// Lowest server version this client will talk to.
  pub const MIN_CLIENT_VER: i32 = 100;

  // Highest version whose reply layouts the decoders handle.
  pub const MAX_SUPPORTED_VERSION: i32 = 187;
}
