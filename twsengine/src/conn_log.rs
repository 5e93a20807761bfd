// twsengine/src/conn_log.rs
// Optional SQLite recording of every frame sent and received in a session.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{error, info, trace, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection as DbConnection};

use crate::base::EngineError;
use crate::frame::{body_to_text, split_message_type, text_to_body};
use crate::protocol_decoder::IncomingMessageType;
use crate::protocol_encoder::identify_outgoing_type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDirection {
  Send,
  Recv,
}

impl fmt::Display for LogDirection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LogDirection::Send => write!(f, "SEND"),
      LogDirection::Recv => write!(f, "RECV"),
    }
  }
}

impl FromStr for LogDirection {
  type Err = EngineError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "SEND" => Ok(LogDirection::Send),
      "RECV" => Ok(LogDirection::Recv),
      _ => Err(EngineError::LoggingError(format!("Invalid direction in log: {}", s))),
    }
  }
}

/// One message read back from a recorded session.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedMessage {
  pub direction: LogDirection,
  pub message_type_id: Option<i32>,
  pub message_type_name: Option<String>,
  pub payload: Vec<u8>,
  pub relative_timestamp_ms: f64,
}

/// A recorded session: its negotiated server version and messages in order.
#[derive(Debug, Clone)]
pub struct RecordedSession {
  pub session_name: String,
  pub server_version: i32,
  pub client_id: i32,
  pub messages: Vec<LoggedMessage>,
}

struct ConnectionLoggerInner {
  db: DbConnection,
  session_id: i64,
  start: Instant,
}

/// Writes frames to a SQLite database. Cloning shares the same session.
#[derive(Clone)]
pub struct ConnectionLogger {
  inner: Arc<Mutex<ConnectionLoggerInner>>,
}

fn db_err(what: &str, e: rusqlite::Error) -> EngineError {
  EngineError::LoggingError(format!("{}: {}", what, e))
}

fn message_type_name(direction: LogDirection, payload: &[u8]) -> (Option<i32>, Option<String>) {
  match direction {
    LogDirection::Send => match identify_outgoing_type(payload) {
      Some((id, name)) => (Some(id), Some(name.to_string())),
      None => (split_message_type(payload).ok().map(|(id, _)| id), None),
    },
    LogDirection::Recv => {
      let id = split_message_type(payload).ok().map(|(id, _)| id);
      let name = id
        .and_then(|id| IncomingMessageType::try_from(id).ok())
        .map(|t| format!("{:?}", t));
      (id, name)
    }
  }
}

impl ConnectionLogger {
  /// Open (or create) the database and start a session named `session_name`,
  /// replacing any earlier session with the same name.
  pub fn new<P: AsRef<Path>>(
    db_path: P,
    session_name: &str,
    host: &str,
    port: u16,
    client_id: i32,
  ) -> Result<Self, EngineError> {
    info!("Opening session log {:?}, session '{}'", db_path.as_ref(), session_name);
    let mut db = DbConnection::open(db_path).map_err(|e| db_err("Opening log database", e))?;
    db.pragma_update(None, "journal_mode", "WAL").map_err(|e| db_err("Setting WAL mode", e))?;
    db.execute_batch("PRAGMA foreign_keys = ON;").map_err(|e| db_err("Enabling foreign keys", e))?;
    Self::create_tables(&db)?;

    let tx = db.transaction().map_err(|e| db_err("Starting transaction", e))?;
    let deleted = tx.execute("DELETE FROM sessions WHERE session_name = ?1", params![session_name])
      .map_err(|e| db_err("Deleting previous session", e))?;
    if deleted > 0 {
      warn!("Replaced {} previous log session(s) named '{}'", deleted, session_name);
    }
    tx.execute(
      "INSERT INTO sessions (session_name, start_time_unix_ms, host, port, client_id) VALUES (?1, ?2, ?3, ?4, ?5)",
      params![session_name, Utc::now().timestamp_millis(), host, port, client_id],
    ).map_err(|e| db_err("Inserting session", e))?;
    let session_id = tx.last_insert_rowid();
    tx.commit().map_err(|e| db_err("Committing session", e))?;

    Ok(ConnectionLogger {
      inner: Arc::new(Mutex::new(ConnectionLoggerInner { db, session_id, start: Instant::now() })),
    })
  }

  fn create_tables(db: &DbConnection) -> Result<(), EngineError> {
    db.execute_batch(
      "BEGIN;
       CREATE TABLE IF NOT EXISTS sessions (
         session_id          INTEGER PRIMARY KEY AUTOINCREMENT,
         session_name        TEXT NOT NULL UNIQUE,
         start_time_unix_ms  INTEGER NOT NULL,
         host                TEXT NOT NULL,
         port                INTEGER NOT NULL,
         client_id           INTEGER NOT NULL,
         server_version      INTEGER NULL
       );
       CREATE TABLE IF NOT EXISTS messages (
         message_id            INTEGER PRIMARY KEY AUTOINCREMENT,
         session_id            INTEGER NOT NULL,
         direction             TEXT NOT NULL CHECK(direction IN ('SEND', 'RECV')),
         relative_timestamp_ms REAL NOT NULL,
         message_type_id       INTEGER NULL,
         message_type_name     TEXT NULL,
         payload_text          TEXT NOT NULL,
         FOREIGN KEY (session_id) REFERENCES sessions(session_id) ON DELETE CASCADE
       );
       CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id, message_id);
       COMMIT;"
    ).map_err(|e| db_err("Creating log tables", e))
  }

  /// Record the server version once the handshake has completed.
  pub fn set_server_version(&self, server_version: i32) -> Result<(), EngineError> {
    let inner = self.inner.lock();
    inner.db.execute(
      "UPDATE sessions SET server_version = ?1 WHERE session_id = ?2",
      params![server_version, inner.session_id],
    ).map_err(|e| db_err("Updating server version", e))?;
    Ok(())
  }

  /// Record one message body. Failures are logged, never returned: the
  /// session keeps running without its log.
  pub fn log_message(&self, direction: LogDirection, payload: &[u8]) {
    let (type_id, type_name) = message_type_name(direction, payload);
    let text = body_to_text(payload);
    let inner = self.inner.lock();
    let rel_ms = inner.start.elapsed().as_secs_f64() * 1000.0;
    match inner.db.execute(
      "INSERT INTO messages (session_id, direction, relative_timestamp_ms, message_type_id, message_type_name, payload_text)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
      params![inner.session_id, direction.to_string(), rel_ms, type_id, type_name, text],
    ) {
      Ok(_) => trace!("Logged {} {:?} ({} bytes)", direction, type_name.as_deref().unwrap_or("UNKNOWN"), payload.len()),
      Err(e) => error!("Failed to log message to database: {}", e),
    }
  }

  pub fn log_send(&self, payload: &[u8]) {
    self.log_message(LogDirection::Send, payload)
  }

  pub fn log_recv(&self, payload: &[u8]) {
    self.log_message(LogDirection::Recv, payload)
  }
}

/// Load a recorded session by name.
pub fn load_session<P: AsRef<Path>>(db_path: P, session_name: &str) -> Result<RecordedSession, EngineError> {
  let db = DbConnection::open(db_path).map_err(|e| db_err("Opening log database", e))?;
  let (session_id, client_id, server_version): (i64, i32, Option<i32>) = db.query_row(
    "SELECT session_id, client_id, server_version FROM sessions WHERE session_name = ?1",
    params![session_name],
    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
  ).map_err(|e| match e {
    rusqlite::Error::QueryReturnedNoRows =>
      EngineError::ConfigurationError(format!("Log session '{}' not found", session_name)),
    e => db_err("Querying session", e),
  })?;
  let server_version = server_version.ok_or_else(|| EngineError::ConfigurationError(
    format!("Log session '{}' has no server version", session_name)))?;

  let mut stmt = db.prepare(
    "SELECT direction, message_type_id, message_type_name, payload_text, relative_timestamp_ms
     FROM messages WHERE session_id = ?1 ORDER BY message_id ASC",
  ).map_err(|e| db_err("Preparing message query", e))?;
  let rows = stmt.query_map(params![session_id], |row| {
    Ok((
      row.get::<_, String>(0)?,
      row.get::<_, Option<i32>>(1)?,
      row.get::<_, Option<String>>(2)?,
      row.get::<_, String>(3)?,
      row.get::<_, f64>(4)?,
    ))
  }).map_err(|e| db_err("Querying messages", e))?;

  let mut messages = Vec::new();
  for row in rows {
    let (direction, message_type_id, message_type_name, text, relative_timestamp_ms) =
      row.map_err(|e| db_err("Reading message row", e))?;
    messages.push(LoggedMessage {
      direction: direction.parse()?,
      message_type_id,
      message_type_name,
      payload: text_to_body(&text),
      relative_timestamp_ms,
    });
  }
  info!("Loaded {} messages from log session '{}'", messages.len(), session_name);
  Ok(RecordedSession { session_name: session_name.to_string(), server_version, client_id, messages })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_record_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.db");
    let logger = ConnectionLogger::new(&path, "quote", "127.0.0.1", 4002, 3).unwrap();
    logger.set_server_version(187).unwrap();
    logger.log_send(b"1\x0011\x005\x00");
    logger.log_recv(b"1\x006\x005\x002\x00190.25\x00100\x000\x00");
    logger.log_recv(b"\x01garbage");

    let session = load_session(&path, "quote").unwrap();
    assert_eq!(session.server_version, 187);
    assert_eq!(session.client_id, 3);
    assert_eq!(session.messages.len(), 3);

    let sent = &session.messages[0];
    assert_eq!(sent.direction, LogDirection::Send);
    assert_eq!(sent.message_type_id, Some(1));
    assert_eq!(sent.payload, b"1\x0011\x005\x00".to_vec());

    let recv = &session.messages[1];
    assert_eq!(recv.direction, LogDirection::Recv);
    assert_eq!(recv.message_type_name.as_deref(), Some("TickPrice"));

    assert_eq!(session.messages[2].message_type_id, None);
  }

  #[test]
  fn test_same_name_replaces_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.db");
    {
      let logger = ConnectionLogger::new(&path, "s", "h", 1, 0).unwrap();
      logger.set_server_version(180).unwrap();
      logger.log_recv(b"49\x001\x00100\x00");
    }
    let logger = ConnectionLogger::new(&path, "s", "h", 1, 0).unwrap();
    logger.set_server_version(187).unwrap();
    let session = load_session(&path, "s").unwrap();
    assert_eq!(session.server_version, 187);
    assert!(session.messages.is_empty());
  }

  #[test]
  fn test_missing_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.db");
    let _logger = ConnectionLogger::new(&path, "a", "h", 1, 0).unwrap();
    assert!(matches!(load_session(&path, "b"), Err(EngineError::ConfigurationError(_))));
  }
}
