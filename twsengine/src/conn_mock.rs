// twsengine/src/conn_mock.rs
// In-memory `Connection` for tests and offline replay of recorded sessions.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::base::EngineError;
use crate::conn::Connection;
use crate::conn_log::{load_session, LogDirection, LoggedMessage};
use crate::frame::split_message_type;

struct MockState {
  server_version: i32,
  client_id: i32,
  connection_time: String,
  poll_interval: Duration,
  incoming_tx: Sender<Result<Vec<u8>, EngineError>>,
  incoming_rx: Receiver<Result<Vec<u8>, EngineError>>,
  sent: Mutex<Vec<Vec<u8>>>,
  // Remaining recorded messages when replaying a logged session.
  replay: Mutex<VecDeque<LoggedMessage>>,
  closed: AtomicBool,
}

/// A fake transport. Frames pushed with `push_frame` (or loaded from a
/// recorded session) are returned by `read_frame` in order; everything
/// written is captured for inspection. Clones share the same state.
#[derive(Clone)]
pub struct MockConnection {
  inner: Arc<MockState>,
}

impl MockConnection {
  pub fn new(server_version: i32, client_id: i32) -> Self {
    let (incoming_tx, incoming_rx) = crossbeam_channel::unbounded();
    MockConnection {
      inner: Arc::new(MockState {
        server_version,
        client_id,
        connection_time: String::new(),
        poll_interval: Duration::from_millis(10),
        incoming_tx,
        incoming_rx,
        sent: Mutex::new(Vec::new()),
        replay: Mutex::new(VecDeque::new()),
        closed: AtomicBool::new(false),
      }),
    }
  }

  /// Replay a session recorded by `ConnectionLogger`.
  ///
  /// Received messages are released in batches: everything up to the next
  /// recorded SEND is available immediately, the following batch once the
  /// client writes its next frame.
  pub fn from_db<P: AsRef<Path>>(db_path: P, session_name: &str) -> Result<Self, EngineError> {
    let session = load_session(db_path, session_name)?;
    info!("Replaying session '{}' ({} messages, server version {})",
          session.session_name, session.messages.len(), session.server_version);
    let mock = MockConnection::new(session.server_version, session.client_id);
    mock.inner.replay.lock().extend(session.messages);
    mock.release_until_send();
    Ok(mock)
  }

  /// Queue one frame body for `read_frame`.
  pub fn push_frame(&self, body: &[u8]) {
    let _ = self.inner.incoming_tx.send(Ok(body.to_vec()));
  }

  /// Queue a body built from NUL-terminated string fields.
  pub fn push_fields(&self, fields: &[&str]) {
    let mut body = Vec::new();
    for f in fields {
      body.extend_from_slice(f.as_bytes());
      body.push(0);
    }
    self.push_frame(&body);
  }

  /// Make the next `read_frame` fail as if the peer went away.
  pub fn hang_up(&self) {
    let _ = self.inner.incoming_tx.send(Err(EngineError::ConnectionError("Connection closed by peer".to_string())));
  }

  /// Bodies written so far, in order.
  pub fn sent_frames(&self) -> Vec<Vec<u8>> {
    self.inner.sent.lock().clone()
  }

  /// Number of recorded messages not yet replayed.
  pub fn remaining_replay(&self) -> usize {
    self.inner.replay.lock().len()
  }

  fn release_until_send(&self) {
    let mut replay = self.inner.replay.lock();
    while let Some(msg) = replay.front() {
      if msg.direction == LogDirection::Send {
        break;
      }
      if let Some(msg) = replay.pop_front() {
        trace!("Mock: releasing recorded {:?}", msg.message_type_name.as_deref().unwrap_or("UNKNOWN"));
        let _ = self.inner.incoming_tx.send(Ok(msg.payload));
      }
    }
  }

  fn advance_replay(&self, body: &[u8]) {
    {
      let mut replay = self.inner.replay.lock();
      if replay.is_empty() {
        return;
      }
      if let Some(expected) = replay.pop_front() {
        let actual = split_message_type(body).ok().map(|(t, _)| t);
        if actual != expected.message_type_id {
          warn!("Mock: sent message type {:?} but the recording has {:?}", actual, expected.message_type_id);
        }
      }
    }
    self.release_until_send();
  }
}

impl Connection for MockConnection {
  fn server_version(&self) -> i32 { self.inner.server_version }
  fn connection_time(&self) -> &str { &self.inner.connection_time }
  fn client_id(&self) -> i32 { self.inner.client_id }

  fn read_frame(&self) -> Result<Option<Vec<u8>>, EngineError> {
    if self.is_closed() {
      return Err(EngineError::ConnectionError("Connection closed".to_string()));
    }
    match self.inner.incoming_rx.recv_timeout(self.inner.poll_interval) {
      Ok(Ok(body)) if body.is_empty() => Ok(None),
      Ok(Ok(body)) => Ok(Some(body)),
      Ok(Err(e)) => Err(e),
      Err(RecvTimeoutError::Timeout) => Ok(None),
      Err(RecvTimeoutError::Disconnected) => Err(EngineError::ConnectionError("Mock script ended".to_string())),
    }
  }

  fn write_frame(&self, body: &[u8]) -> Result<(), EngineError> {
    if self.is_closed() {
      return Err(EngineError::ConnectionError("Connection closed".to_string()));
    }
    self.inner.sent.lock().push(body.to_vec());
    self.advance_replay(body);
    Ok(())
  }

  fn close(&self) {
    if !self.inner.closed.swap(true, Ordering::AcqRel) {
      debug!("Mock: connection closed");
    }
  }

  fn is_closed(&self) -> bool {
    self.inner.closed.load(Ordering::Acquire)
  }
}
