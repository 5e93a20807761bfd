// twsengine/src/observer.rs
// Sinks that receive decoded replies from the dispatch loop.

use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use log::{debug, warn};

use crate::protocol_decoder::Reply;

/// Receives replies for one subscribed request id, or for the fallback path.
///
/// `observe` runs on the dispatch thread. It should hand the reply off and
/// return quickly: while it runs, later replies for the same id wait, and an
/// `unsubscribe` of that id waits for it to finish.
pub trait Observer: Send + Sync {
  fn observe(&self, reply: Reply);

  /// Called on the fallback observer when the dispatch loop loses the connection.
  fn connection_closed(&self) {}
}

/// Closures can be used as observers directly.
impl<F> Observer for F
where
  F: Fn(Reply) + Send + Sync,
{
  fn observe(&self, reply: Reply) {
    self(reply)
  }
}

/// Forwards each reply onto a crossbeam channel.
///
/// A bounded observer waits at most `delivery_timeout` for room in the
/// channel and drops the reply (with a warning) if the reader stays stalled.
pub struct ChannelObserver {
  sender: Sender<Reply>,
  delivery_timeout: Option<Duration>,
}

impl ChannelObserver {
  /// Bounded hand-off with a delivery timeout.
  pub fn bounded(capacity: usize, delivery_timeout: Duration) -> (Self, Receiver<Reply>) {
    let (sender, receiver) = crossbeam_channel::bounded(capacity);
    (ChannelObserver { sender, delivery_timeout: Some(delivery_timeout) }, receiver)
  }

  /// Unbounded hand-off; never blocks the dispatch loop.
  pub fn unbounded() -> (Self, Receiver<Reply>) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (ChannelObserver { sender, delivery_timeout: None }, receiver)
  }
}

impl Observer for ChannelObserver {
  fn observe(&self, reply: Reply) {
    let code = reply.code();
    match self.delivery_timeout {
      Some(timeout) => match self.sender.send_timeout(reply, timeout) {
        Ok(()) => {}
        Err(SendTimeoutError::Timeout(r)) => {
          warn!("Observer stalled for {:?}; dropping reply {}", timeout, r);
        }
        Err(SendTimeoutError::Disconnected(_)) => {
          debug!("Observer receiver dropped; discarding reply type {}", code);
        }
      },
      None => match self.sender.try_send(reply) {
        Ok(()) => {}
        Err(TrySendError::Full(r)) => warn!("Unbounded observer reported full; dropping reply {}", r),
        Err(TrySendError::Disconnected(_)) => {
          debug!("Observer receiver dropped; discarding reply type {}", code);
        }
      },
    }
  }
}
