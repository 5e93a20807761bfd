// twsengine/src/wait.rs
// Caller-side bounded waits on a reply channel.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::debug;

use crate::base::EngineError;
use crate::protocol_decoder::Reply;

fn recv_before(rx: &Receiver<Reply>, deadline: Instant, timeout: Duration) -> Result<Reply, EngineError> {
  let remaining = deadline.saturating_duration_since(Instant::now());
  match rx.recv_timeout(remaining) {
    Ok(reply) => Ok(reply),
    Err(RecvTimeoutError::Timeout) => Err(EngineError::Timeout(format!("No reply within {:?}", timeout))),
    Err(RecvTimeoutError::Disconnected) => Err(EngineError::EngineClosed),
  }
}

/// Wait for the first reply whose type code is in `codes`. Other replies are
/// skipped. A decode failure (code 0) ends the wait with `UnexpectedReply`.
pub fn expect_reply(rx: &Receiver<Reply>, codes: &[i32], timeout: Duration) -> Result<Reply, EngineError> {
  let deadline = Instant::now() + timeout;
  loop {
    let reply = recv_before(rx, deadline, timeout)?;
    let code = reply.code();
    if code == 0 {
      return Err(EngineError::UnexpectedReply(reply.to_string()));
    }
    if codes.contains(&code) {
      return Ok(reply);
    }
    debug!("Skipping reply while waiting for {:?}: {}", codes, reply);
  }
}

/// Collect replies until one with type code `end_code` arrives; the end
/// marker itself is not returned. An `Error` reply ends the wait with
/// `UnexpectedReply`.
pub fn collect_until(rx: &Receiver<Reply>, end_code: i32, timeout: Duration) -> Result<Vec<Reply>, EngineError> {
  let deadline = Instant::now() + timeout;
  let mut replies = Vec::new();
  loop {
    let reply = recv_before(rx, deadline, timeout)?;
    match reply.code() {
      0 => return Err(EngineError::UnexpectedReply(reply.to_string())),
      code if code == end_code => return Ok(replies),
      _ => {}
    }
    if let Reply::Error { .. } = reply {
      return Err(EngineError::UnexpectedReply(reply.to_string()));
    }
    replies.push(reply);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_expect_reply_skips_others() {
    let (tx, rx) = crossbeam_channel::unbounded();
    tx.send(Reply::TickSnapshotEnd { req_id: 1 }).unwrap();
    tx.send(Reply::ContractDataEnd { req_id: 1 }).unwrap();
    let reply = expect_reply(&rx, &[52], Duration::from_millis(100)).unwrap();
    assert_eq!(reply, Reply::ContractDataEnd { req_id: 1 });
  }

  #[test]
  fn test_expect_reply_timeout() {
    let (_tx, rx) = crossbeam_channel::unbounded::<Reply>();
    assert!(matches!(expect_reply(&rx, &[52], Duration::from_millis(20)), Err(EngineError::Timeout(_))));
  }

  #[test]
  fn test_expect_reply_decode_failure() {
    let (tx, rx) = crossbeam_channel::unbounded();
    tx.send(Reply::DecodeFailure { msg_type: 1, error: EngineError::MalformedFrame("x".into()) }).unwrap();
    assert!(matches!(expect_reply(&rx, &[1], Duration::from_millis(100)), Err(EngineError::UnexpectedReply(_))));
  }

  #[test]
  fn test_disconnected_is_closed() {
    let (tx, rx) = crossbeam_channel::unbounded::<Reply>();
    drop(tx);
    assert_eq!(expect_reply(&rx, &[52], Duration::from_millis(100)), Err(EngineError::EngineClosed));
  }

  #[test]
  fn test_collect_until() {
    let (tx, rx) = crossbeam_channel::unbounded();
    tx.send(Reply::TickSnapshotEnd { req_id: 1 }).unwrap();
    tx.send(Reply::TickSnapshotEnd { req_id: 1 }).unwrap();
    tx.send(Reply::ContractDataEnd { req_id: 1 }).unwrap();
    assert_eq!(collect_until(&rx, 52, Duration::from_millis(100)).unwrap().len(), 2);

    tx.send(Reply::Error { id: 1, code: 200, message: "No security definition".into(), advanced_order_reject_json: None }).unwrap();
    assert!(matches!(collect_until(&rx, 52, Duration::from_millis(100)), Err(EngineError::UnexpectedReply(_))));
  }
}
