// engine_demo.rs
// Use it like this:
//   engine_demo live quote --symbol MSFT --db-path demo.db
//   engine_demo replay quote --db-path demo.db
// Live runs record the session when --db-path is given; replay feeds the
// recorded replies back through the engine without a server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn};

use twsengine::conn_mock::MockConnection;
use twsengine::wait::{collect_until, expect_reply};
use twsengine::{
  ChannelObserver, Contract, Engine, EngineConfig, IncomingMessageType, Observer, Reply, RequestContractData,
  RequestCurrentTime, RequestMarketData,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  #[clap(subcommand)]
  command: Command,
}

#[derive(Parser, Debug)]
enum Command {
  /// Run a scenario against TWS/Gateway.
  Live(ModeArgs),
  /// Run a scenario against a recorded session.
  Replay(ModeArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Scenario {
  /// Server clock.
  Time,
  /// One market data snapshot.
  Quote,
  /// Contract details lookup.
  Contract,
}

impl Scenario {
  fn session_name(&self) -> &'static str {
    match self {
      Scenario::Time => "time",
      Scenario::Quote => "quote",
      Scenario::Contract => "contract",
    }
  }
}

#[derive(Parser, Debug)]
struct ModeArgs {
  #[arg(value_enum)]
  scenario: Scenario,

  /// Stock symbol for quote and contract scenarios.
  #[arg(long, default_value = "AAPL")]
  symbol: String,

  /// TWS/Gateway host. Defaults to TWS_HOST or 127.0.0.1.
  #[arg(long)]
  host: Option<String>,

  /// TWS/Gateway port. Defaults to TWS_PORT or 4002.
  #[arg(long)]
  port: Option<u16>,

  /// Client ID. Defaults to TWS_CLIENT_ID or 0.
  #[arg(long)]
  client_id: Option<i32>,

  /// SQLite session log. Recorded to in live mode, read from in replay mode.
  #[arg(long)]
  db_path: Option<PathBuf>,

  /// Seconds to wait for each answer.
  #[arg(long, default_value_t = 10)]
  timeout_secs: u64,
}

fn build_config(args: &ModeArgs) -> Result<EngineConfig> {
  let mut config = EngineConfig::from_env()?;
  if let Some(host) = &args.host {
    config.host = host.clone();
  }
  if let Some(port) = args.port {
    config.port = port;
  }
  if let Some(client_id) = args.client_id {
    config.client_id = client_id;
  }
  Ok(config)
}

fn start_engine(live: bool, args: &ModeArgs, fallback: Arc<dyn Observer>) -> Result<Engine> {
  let config = build_config(args)?;
  let session = args.scenario.session_name();
  if live {
    let config = match &args.db_path {
      Some(path) => config.with_session_log(path, session),
      None => config,
    };
    Engine::new_with_fallback(config, fallback).context("Connecting to TWS")
  } else {
    let path = args.db_path.as_ref().ok_or_else(|| anyhow!("--db-path is required for replay"))?;
    let conn = MockConnection::from_db(path, session)
      .with_context(|| format!("Loading session '{}' from {:?}", session, path))?;
    Ok(Engine::with_connection_and_fallback(Arc::new(conn), config, fallback)?)
  }
}

fn run_time(engine: &Engine, fallback: &crossbeam_channel::Receiver<Reply>, timeout: Duration) -> Result<()> {
  engine.send(&RequestCurrentTime)?;
  match expect_reply(fallback, &[IncomingMessageType::CurrentTime as i32], timeout)? {
    Reply::CurrentTime { time } => info!("Server time: {}", time),
    other => warn!("Unexpected reply: {}", other),
  }
  Ok(())
}

fn run_quote(engine: &Engine, symbol: &str, timeout: Duration) -> Result<()> {
  let request = RequestMarketData::new(Contract::stock(symbol)).with_snapshot(true);
  let (req_id, replies) = engine.submit(request)?;
  let ticks = collect_until(&replies, IncomingMessageType::TickSnapshotEnd as i32, timeout);
  engine.unsubscribe(req_id);
  for tick in ticks? {
    match tick {
      Reply::TickPrice { tick_type, price, size, .. } => info!("{} price[{}] = {} (size {:?})", symbol, tick_type, price, size),
      Reply::TickSize { tick_type, size, .. } => info!("{} size[{}] = {:?}", symbol, tick_type, size),
      other => info!("{} {}", symbol, other),
    }
  }
  Ok(())
}

fn run_contract(engine: &Engine, symbol: &str, timeout: Duration) -> Result<()> {
  let (req_id, replies) = engine.submit(RequestContractData::new(Contract::stock(symbol)))?;
  let details = collect_until(&replies, IncomingMessageType::ContractDataEnd as i32, timeout);
  engine.unsubscribe(req_id);
  let details = details?;
  if details.is_empty() {
    warn!("No contracts found for {}", symbol);
  }
  for reply in details {
    if let Reply::ContractData { details, .. } = reply {
      info!("{} conId={} {} on {} ({}), min tick {}",
            details.contract.symbol, details.contract.con_id, details.long_name,
            details.contract.primary_exchange.as_deref().unwrap_or("?"), details.valid_exchanges, details.min_tick);
    }
  }
  Ok(())
}

fn main() -> Result<()> {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
  let args = Args::parse();
  let (live, mode_args) = match &args.command {
    Command::Live(m) => (true, m),
    Command::Replay(m) => (false, m),
  };
  let timeout = Duration::from_secs(mode_args.timeout_secs);

  let (observer, fallback) = ChannelObserver::unbounded();
  let engine = start_engine(live, mode_args, Arc::new(observer))?;
  // Request ids are seeded from the server's first NextValidId, which keeps
  // ids identical between a live run and its replay.
  match expect_reply(&fallback, &[IncomingMessageType::NextValidId as i32], timeout) {
    Ok(reply) => info!("Session ready: {}", reply),
    Err(e) => warn!("No NextValidId from server: {}", e),
  }

  let result = match mode_args.scenario {
    Scenario::Time => run_time(&engine, &fallback, timeout),
    Scenario::Quote => run_quote(&engine, &mode_args.symbol, timeout),
    Scenario::Contract => run_contract(&engine, &mode_args.symbol, timeout),
  };
  engine.stop();
  result
}
