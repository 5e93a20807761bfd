// twsengine/src/dispatch.rs
// The single background reader: frame -> decode -> route.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::base::EngineError;
use crate::conn::Connection;
use crate::conn_log::ConnectionLogger;
use crate::engine::EngineState;
use crate::frame::Frame;
use crate::message_parser::Decoder;
use crate::protocol_decoder::Reply;
use crate::registry::SubscriptionRegistry;
use crate::request_id::RequestIdAllocator;

pub const DISPATCH_THREAD_NAME: &str = "twsengine-dispatch";

/// Everything the loop shares with the engine.
pub(crate) struct DispatchContext {
  pub conn: Arc<dyn Connection>,
  pub registry: Arc<SubscriptionRegistry>,
  pub allocator: Arc<RequestIdAllocator>,
  pub logger: Option<ConnectionLogger>,
  pub state: Arc<Mutex<EngineState>>,
  pub stop_flag: Arc<AtomicBool>,
}

pub(crate) fn spawn(ctx: DispatchContext) -> Result<thread::JoinHandle<()>, EngineError> {
  thread::Builder::new()
    .name(DISPATCH_THREAD_NAME.to_string())
    .spawn(move || run(ctx))
    .map_err(|e| EngineError::InternalError(format!("Spawning dispatch thread: {}", e)))
}

fn run(ctx: DispatchContext) {
  let decoder = Decoder::new(ctx.conn.server_version());
  debug!("Dispatch loop started (server version {})", ctx.conn.server_version());

  while !ctx.stop_flag.load(Ordering::Acquire) {
    match ctx.conn.read_frame() {
      Ok(None) => continue,
      Ok(Some(body)) => handle_frame(&ctx, &decoder, body),
      Err(e) => {
        if ctx.stop_flag.load(Ordering::Acquire) {
          debug!("Dispatch loop read ended during stop: {}", e);
          break;
        }
        error!("Dispatch loop lost the connection: {}", e);
        {
          let mut state = ctx.state.lock();
          if *state == EngineState::Running {
            *state = EngineState::Failed;
          }
        }
        ctx.conn.close();
        ctx.registry.notify_connection_closed();
        break;
      }
    }
  }
  info!("Dispatch loop ended");
}

fn handle_frame(ctx: &DispatchContext, decoder: &Decoder, body: Vec<u8>) {
  if let Some(logger) = &ctx.logger {
    logger.log_recv(&body);
  }
  let reply = match Frame::from_body(body) {
    Ok(frame) => match decoder.decode_frame(&frame) {
      Ok(reply) => reply,
      Err(e) => {
        warn!("Failed to decode message type {}: {}", frame.msg_type, e);
        Reply::DecodeFailure { msg_type: frame.msg_type, error: e }
      }
    },
    Err(e) => {
      // The type field itself was unreadable.
      warn!("Dropping undecodable frame: {}", e);
      Reply::DecodeFailure { msg_type: -1, error: e }
    }
  };

  if let Reply::NextValidId { order_id } = reply {
    ctx.allocator.advance_to(order_id);
  }

  trace!("Dispatching {}", reply);
  ctx.registry.dispatch(reply);
}
