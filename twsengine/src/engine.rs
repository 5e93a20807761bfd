// twsengine/src/engine.rs
// The engine facade: connection, dispatch loop, registry and id allocator.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::base::EngineError;
use crate::conn::{ConnectOptions, Connection, SocketConnection};
use crate::conn_log::ConnectionLogger;
use crate::dispatch::{self, DispatchContext};
use crate::observer::{ChannelObserver, Observer};
use crate::protocol_decoder::Reply;
use crate::protocol_encoder::Encoder;
use crate::registry::SubscriptionRegistry;
use crate::request::Request;
use crate::request_id::RequestIdAllocator;

/// Where to record the session, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLogConfig {
  pub db_path: PathBuf,
  pub session_name: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
  pub host: String,
  pub port: u16,
  pub client_id: i32,
  pub connect: ConnectOptions,
  /// How long a bounded channel observer waits for a stalled reader before dropping a reply.
  pub delivery_timeout: Duration,
  pub channel_capacity: usize,
  /// First id handed out by `next_request_id`.
  pub request_id_seed: i32,
  pub session_log: Option<SessionLogConfig>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    EngineConfig {
      host: "127.0.0.1".to_string(),
      port: 4002,
      client_id: 0,
      connect: ConnectOptions::default(),
      delivery_timeout: Duration::from_secs(5),
      channel_capacity: 1024,
      request_id_seed: 1,
      session_log: None,
    }
  }
}

impl EngineConfig {
  /// Defaults, overridden by `TWS_HOST`, `TWS_PORT` and `TWS_CLIENT_ID` when set.
  pub fn from_env() -> Result<Self, EngineError> {
    let mut config = EngineConfig::default();
    if let Ok(host) = env::var("TWS_HOST") {
      config.host = host;
    }
    if let Ok(port) = env::var("TWS_PORT") {
      config.port = port.trim().parse()
        .map_err(|e| EngineError::ConfigurationError(format!("Invalid TWS_PORT '{}': {}", port, e)))?;
    }
    if let Ok(client_id) = env::var("TWS_CLIENT_ID") {
      config.client_id = client_id.trim().parse()
        .map_err(|e| EngineError::ConfigurationError(format!("Invalid TWS_CLIENT_ID '{}': {}", client_id, e)))?;
    }
    Ok(config)
  }

  pub fn with_session_log(mut self, db_path: impl Into<PathBuf>, session_name: &str) -> Self {
    self.session_log = Some(SessionLogConfig { db_path: db_path.into(), session_name: session_name.to_string() });
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
  Created,
  Connecting,
  Running,
  Stopping,
  Stopped,
  Failed,
}

impl fmt::Display for EngineState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// A live session with TWS.
///
/// All methods take `&self` and may be called from any thread. Replies are
/// delivered on the engine's dispatch thread to the observers registered
/// with `subscribe` / `set_fallback`.
///
/// ```no_run
/// use twsengine::{Contract, Engine, EngineConfig, RequestContractData};
/// use std::time::Duration;
///
/// let engine = Engine::new(EngineConfig::default())?;
/// let (req_id, replies) = engine.submit(RequestContractData::new(Contract::stock("AAPL")))?;
/// let details = twsengine::wait::collect_until(&replies, 52, Duration::from_secs(10))?;
/// println!("{} contract(s) for request {}", details.len(), req_id);
/// engine.stop();
/// # Ok::<(), twsengine::EngineError>(())
/// ```
pub struct Engine {
  config: EngineConfig,
  conn: Arc<dyn Connection>,
  encoder: Encoder,
  registry: Arc<SubscriptionRegistry>,
  allocator: Arc<RequestIdAllocator>,
  logger: Option<ConnectionLogger>,
  state: Arc<Mutex<EngineState>>,
  stop_flag: Arc<AtomicBool>,
  dispatch_thread: Mutex<Option<JoinHandle<()>>>,
  dispatch_thread_id: ThreadId,
}

impl Engine {
  /// Connect, handshake and start the dispatch loop.
  ///
  /// Session replies TWS sends right after the handshake (`NextValidId`,
  /// `ManagedAccounts`, farm status errors) reach only a fallback that is
  /// already installed; use `new_with_fallback` to receive them.
  pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
    Self::start(Arc::new(Self::connect(&config)?), config, None)
  }

  /// Like `new`, with `fallback` installed before the first frame is read.
  pub fn new_with_fallback(config: EngineConfig, fallback: Arc<dyn Observer>) -> Result<Self, EngineError> {
    Self::start(Arc::new(Self::connect(&config)?), config, Some(fallback))
  }

  /// Run the engine over an already handshaken connection.
  pub fn with_connection(conn: Arc<dyn Connection>, config: EngineConfig) -> Result<Self, EngineError> {
    Self::start(conn, config, None)
  }

  /// Like `with_connection`, with `fallback` installed before the first frame is read.
  pub fn with_connection_and_fallback(
    conn: Arc<dyn Connection>,
    config: EngineConfig,
    fallback: Arc<dyn Observer>,
  ) -> Result<Self, EngineError> {
    Self::start(conn, config, Some(fallback))
  }

  fn connect(config: &EngineConfig) -> Result<SocketConnection, EngineError> {
    debug!("Engine state: {}", EngineState::Connecting);
    SocketConnection::connect(&config.host, config.port, config.client_id, &config.connect)
      .map_err(|e| {
        error!("Engine state: {} ({})", EngineState::Failed, e);
        e
      })
  }

  fn start(
    conn: Arc<dyn Connection>,
    config: EngineConfig,
    fallback: Option<Arc<dyn Observer>>,
  ) -> Result<Self, EngineError> {
    let logger = match &config.session_log {
      Some(log_cfg) => {
        let logger = ConnectionLogger::new(
          &log_cfg.db_path, &log_cfg.session_name, &config.host, config.port, conn.client_id())?;
        logger.set_server_version(conn.server_version())?;
        Some(logger)
      }
      None => None,
    };

    let registry = Arc::new(SubscriptionRegistry::new());
    if let Some(observer) = fallback {
      registry.set_fallback(observer);
    }
    let allocator = Arc::new(RequestIdAllocator::new(config.request_id_seed));
    let state = Arc::new(Mutex::new(EngineState::Running));
    let stop_flag = Arc::new(AtomicBool::new(false));

    let handle = dispatch::spawn(DispatchContext {
      conn: conn.clone(),
      registry: registry.clone(),
      allocator: allocator.clone(),
      logger: logger.clone(),
      state: state.clone(),
      stop_flag: stop_flag.clone(),
    })?;
    let dispatch_thread_id = handle.thread().id();

    info!("Engine running (server version {}, client ID {})", conn.server_version(), conn.client_id());
    Ok(Engine {
      encoder: Encoder::new(conn.server_version()),
      config,
      conn,
      registry,
      allocator,
      logger,
      state,
      stop_flag,
      dispatch_thread: Mutex::new(Some(handle)),
      dispatch_thread_id,
    })
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn state(&self) -> EngineState {
    *self.state.lock()
  }

  pub fn server_version(&self) -> i32 {
    self.conn.server_version()
  }

  pub fn client_id(&self) -> i32 {
    self.conn.client_id()
  }

  pub fn next_request_id(&self) -> i32 {
    self.allocator.next()
  }

  fn ensure_running(&self) -> Result<(), EngineError> {
    match self.state() {
      EngineState::Running => Ok(()),
      _ => Err(EngineError::EngineClosed),
    }
  }

  /// Encode and write one request. Does not wait for replies.
  pub fn send(&self, request: &dyn Request) -> Result<(), EngineError> {
    self.ensure_running()?;
    if request.requires_id() && request.id().is_none() {
      return Err(EngineError::PreconditionViolation(format!(
        "{} requires a request ID", request.msg_type().name())));
    }
    let body = request.encode(&self.encoder)?;
    debug!("Sending {} (id {:?})", request.msg_type().name(), request.id());
    if let Some(logger) = &self.logger {
      logger.log_send(&body);
    }
    self.conn.write_frame(&body).map_err(|e| {
      if self.state() == EngineState::Running { e } else { EngineError::EngineClosed }
    })
  }

  pub fn subscribe(&self, observer: Arc<dyn Observer>, id: i32) -> Result<(), EngineError> {
    self.ensure_running()?;
    self.registry.subscribe(observer, id)
  }

  pub fn unsubscribe(&self, id: i32) {
    self.registry.unsubscribe(id)
  }

  /// Observer for uncorrelated replies, errors without a subscriber and decode failures.
  pub fn set_fallback(&self, observer: Arc<dyn Observer>) {
    self.registry.set_fallback(observer)
  }

  /// Subscribe a bounded channel for `id` and return its receiving end.
  pub fn subscribe_channel(&self, id: i32) -> Result<Receiver<Reply>, EngineError> {
    let (observer, rx) = ChannelObserver::bounded(self.config.channel_capacity, self.config.delivery_timeout);
    self.subscribe(Arc::new(observer), id)?;
    Ok(rx)
  }

  /// Route fallback replies into a new bounded channel.
  pub fn fallback_channel(&self) -> Receiver<Reply> {
    let (observer, rx) = ChannelObserver::bounded(self.config.channel_capacity, self.config.delivery_timeout);
    self.set_fallback(Arc::new(observer));
    rx
  }

  /// Allocate an id for `request`, subscribe a channel for it, and send it.
  /// The subscription is removed again if the send fails.
  pub fn submit<R: Request>(&self, mut request: R) -> Result<(i32, Receiver<Reply>), EngineError> {
    let id = self.next_request_id();
    request.set_id(id)?;
    let rx = self.subscribe_channel(id)?;
    if let Err(e) = self.send(&request) {
      self.unsubscribe(id);
      return Err(e);
    }
    Ok((id, rx))
  }

  /// Stop the engine. Idempotent. After this returns no observer is called,
  /// whichever thread calls it: a concurrent second `stop` waits until the
  /// dispatch thread has been joined.
  pub fn stop(&self) {
    let on_dispatch_thread = thread::current().id() == self.dispatch_thread_id;
    if self.stop_flag.swap(true, Ordering::AcqRel) {
      if !on_dispatch_thread {
        self.join_dispatch_thread();
      }
      return;
    }
    {
      let mut state = self.state.lock();
      if *state == EngineState::Running {
        *state = EngineState::Stopping;
      }
    }
    info!("Stopping engine");
    self.conn.close();

    if on_dispatch_thread {
      debug!("Stop called from the dispatch thread; not joining");
    } else {
      self.join_dispatch_thread();
    }
    self.registry.clear();
    {
      let mut state = self.state.lock();
      if *state == EngineState::Stopping {
        *state = EngineState::Stopped;
      }
    }
    info!("Engine stopped");
  }

  /// The handle stays locked across the join, so concurrent callers return
  /// only once the thread has exited.
  fn join_dispatch_thread(&self) {
    let mut dispatch_thread = self.dispatch_thread.lock();
    if let Some(handle) = dispatch_thread.take() {
      if handle.join().is_err() {
        warn!("Dispatch thread panicked");
      }
    }
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    self.stop();
  }
}
