// twsengine/src/conn.rs
// Transport to the server: handshake, framed reads and writes, shutdown.

use std::time::Duration;

use crate::base::EngineError;
use crate::min_server_ver::min_server_ver;
pub use socket::SocketConnection;

/// A live, handshaken session transport.
///
/// Reads happen on the dispatch thread only; writes may come from any thread.
pub trait Connection: Send + Sync {
  fn server_version(&self) -> i32;

  /// Connection time string reported by the server during the handshake.
  fn connection_time(&self) -> &str;

  fn client_id(&self) -> i32;

  /// Read the next complete frame body (length prefix stripped, never
  /// empty). `Ok(None)` means nothing arrived within the poll interval; the
  /// caller should check its stop flag and try again.
  fn read_frame(&self) -> Result<Option<Vec<u8>>, EngineError>;

  /// Write one message body, framed with its length. Frames never interleave.
  fn write_frame(&self, body: &[u8]) -> Result<(), EngineError>;

  /// Shut the transport down. Idempotent; wakes a blocked reader.
  fn close(&self);

  fn is_closed(&self) -> bool;
}

/// Parameters of the connect + handshake sequence.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
  pub connect_timeout: Duration,
  /// How long `read_frame` waits for the first byte before returning `Ok(None)`.
  pub read_poll_interval: Duration,
  pub min_version: i32,
  pub max_version: i32,
  /// Appended to the version range in the first handshake message, e.g. "+PACEAPI".
  pub connect_options: String,
  pub optional_capabilities: String,
}

impl Default for ConnectOptions {
  fn default() -> Self {
    ConnectOptions {
      connect_timeout: Duration::from_secs(10),
      read_poll_interval: Duration::from_millis(500),
      min_version: min_server_ver::MIN_CLIENT_VER,
      max_version: min_server_ver::MAX_SUPPORTED_VERSION,
      connect_options: String::new(),
      optional_capabilities: String::new(),
    }
  }
}

impl ConnectOptions {
  /// Payload of the length-prefixed version announcement.
  pub fn version_payload(&self) -> String {
    let range = if self.min_version < self.max_version {
      format!("v{}..{}", self.min_version, self.max_version)
    } else {
      format!("v{}", self.min_version)
    };
    if self.connect_options.is_empty() {
      range
    } else {
      format!("{} {}", range, self.connect_options)
    }
  }
}

/// Parse the server acknowledgement: `<server_version>\0<connection_time>\0`.
pub fn parse_server_ack(body: &[u8], options: &ConnectOptions) -> Result<(i32, String), EngineError> {
  let parts: Vec<&[u8]> = body.splitn(3, |&b| b == 0).collect();
  if parts.len() < 2 || parts[0].is_empty() {
    return Err(EngineError::HandshakeError(format!("Invalid server ack: {:02X?}", body)));
  }
  let version_str = std::str::from_utf8(parts[0])
    .map_err(|e| EngineError::HandshakeError(format!("Invalid UTF8 in server version: {}", e)))?;
  let server_version = version_str.parse::<i32>()
    .map_err(|e| EngineError::HandshakeError(format!("Parsing server version '{}': {}", version_str, e)))?;
  if server_version < options.min_version || server_version > options.max_version {
    return Err(EngineError::HandshakeError(format!(
      "Server version {} outside supported range {}..={}", server_version, options.min_version, options.max_version)));
  }
  let connection_time = std::str::from_utf8(parts[1])
    .map_err(|e| EngineError::HandshakeError(format!("Invalid UTF8 in connection time: {}", e)))?
    .to_string();
  Ok((server_version, connection_time))
}

mod socket {
  use std::io::{ErrorKind, Write};
  use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::time::Instant;

  use byteorder::{BigEndian, WriteBytesExt};
  use log::{debug, info, warn};
  use parking_lot::Mutex;

  use super::{parse_server_ack, ConnectOptions, Connection};
  use crate::base::EngineError;
  use crate::frame::{read_framed_message_body, write_framed_message};
  use crate::protocol_encoder::Encoder;

  /// TCP connection to TWS or IB Gateway.
  pub struct SocketConnection {
    client_id: i32,
    server_version: i32,
    connection_time: String,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    // Handle used only to shut the socket down without taking the reader lock.
    control: TcpStream,
    closed: AtomicBool,
  }

  fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, EngineError> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()
      .map_err(|e| EngineError::ConfigurationError(format!("Invalid address {}:{}: {}", host, port, e)))?
      .collect();
    if addrs.is_empty() {
      return Err(EngineError::ConfigurationError(format!("Address {}:{} resolved to nothing", host, port)));
    }
    Ok(addrs)
  }

  fn connect_any(addrs: &[SocketAddr], options: &ConnectOptions) -> Result<TcpStream, EngineError> {
    let mut last_err = None;
    for addr in addrs {
      match TcpStream::connect_timeout(addr, options.connect_timeout) {
        Ok(stream) => return Ok(stream),
        Err(e) => {
          debug!("Connect to {} failed: {}", addr, e);
          last_err = Some(e);
        }
      }
    }
    Err(EngineError::ConnectionError(match last_err {
      Some(e) => format!("Connect failed: {}", e),
      None => "Connect failed: no address".to_string(),
    }))
  }

  impl SocketConnection {
    /// Connect and run the handshake. `client_id` is sent as-is; the server
    /// does not echo it, so the effective client id is the one requested.
    pub fn connect(host: &str, port: u16, client_id: i32, options: &ConnectOptions) -> Result<Self, EngineError> {
      info!("Connecting to TWS at {}:{}", host, port);
      let addrs = resolve(host, port)?;
      let mut stream = connect_any(&addrs, options)?;

      let io_err = |what: &str, e: std::io::Error| EngineError::ConnectionError(format!("{}: {}", what, e));
      stream.set_nodelay(true).map_err(|e| io_err("Setting TCP_NODELAY", e))?;
      stream.set_write_timeout(Some(options.connect_timeout)).map_err(|e| io_err("Setting write timeout", e))?;
      stream.set_read_timeout(Some(options.connect_timeout)).map_err(|e| io_err("Setting read timeout", e))?;

      // --- Version announcement: "API\0" + length-prefixed "v<min>..<max>" ---
      let payload = options.version_payload();
      let mut hello = Vec::with_capacity(4 + 4 + payload.len());
      hello.extend_from_slice(b"API\0");
      hello.write_u32::<BigEndian>(payload.len() as u32)
        .map_err(|e| EngineError::InternalError(format!("Encoding handshake length: {}", e)))?;
      hello.extend_from_slice(payload.as_bytes());
      stream.write_all(&hello).map_err(|e| io_err("Sending version announcement", e))?;
      stream.flush().map_err(|e| io_err("Flushing version announcement", e))?;
      debug!("Sent version announcement '{}'", payload);

      // --- Server ack ---
      let deadline = Instant::now() + options.connect_timeout;
      let ack = read_framed_message_body(&mut stream, &|| Instant::now() > deadline)
        .map_err(|e| EngineError::HandshakeError(format!("Reading server ack: {}", e)))?
        .ok_or_else(|| EngineError::HandshakeError("Timed out waiting for server ack".to_string()))?;
      let (server_version, connection_time) = parse_server_ack(&ack, options)?;
      info!("Server version {}, connection time '{}'", server_version, connection_time);

      // --- StartApi ---
      let start_api = Encoder::new(server_version).encode_start_api(client_id, &options.optional_capabilities)?;
      write_framed_message(&mut stream, &start_api, &|| Instant::now() > deadline)?;
      debug!("Sent StartApi for client ID {}", client_id);

      stream.set_read_timeout(Some(options.read_poll_interval)).map_err(|e| io_err("Setting poll interval", e))?;
      let writer = stream.try_clone().map_err(|e| io_err("Cloning stream for writer", e))?;
      let control = stream.try_clone().map_err(|e| io_err("Cloning stream for control", e))?;

      info!("Connected to TWS (server version {}, client ID {})", server_version, client_id);
      Ok(SocketConnection {
        client_id,
        server_version,
        connection_time,
        reader: Mutex::new(stream),
        writer: Mutex::new(writer),
        control,
        closed: AtomicBool::new(false),
      })
    }
  }

  impl Connection for SocketConnection {
    fn server_version(&self) -> i32 { self.server_version }
    fn connection_time(&self) -> &str { &self.connection_time }
    fn client_id(&self) -> i32 { self.client_id }

    fn read_frame(&self) -> Result<Option<Vec<u8>>, EngineError> {
      if self.is_closed() {
        return Err(EngineError::ConnectionError("Connection closed".to_string()));
      }
      let mut stream = self.reader.lock();
      let body = match read_framed_message_body(&mut *stream, &|| self.closed.load(Ordering::Acquire))? {
        Some(body) => body,
        None => return Ok(None),
      };
      if body.is_empty() {
        debug!("Skipping empty frame");
        return Ok(None);
      }
      Ok(Some(body))
    }

    fn write_frame(&self, body: &[u8]) -> Result<(), EngineError> {
      if self.is_closed() {
        return Err(EngineError::ConnectionError("Connection closed".to_string()));
      }
      let mut stream = self.writer.lock();
      let result = write_framed_message(&mut *stream, body, &|| self.closed.load(Ordering::Acquire));
      if let Err(e) = &result {
        // A partial frame may already be on the wire.
        warn!("Write failed, closing connection: {}", e);
        drop(stream);
        self.close();
      }
      result
    }

    fn close(&self) {
      if self.closed.swap(true, Ordering::AcqRel) {
        return;
      }
      info!("Closing connection to TWS");
      if let Err(e) = self.control.shutdown(Shutdown::Both) {
        if e.kind() != ErrorKind::NotConnected {
          warn!("Error shutting down socket: {}", e);
        }
      }
    }

    fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
    }
  }

  impl Drop for SocketConnection {
    fn drop(&mut self) {
      self.close();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::{read_framed_message_body, write_framed_message};
  use byteorder::{BigEndian, ReadBytesExt};
  use std::io::Read;
  use std::net::{TcpListener, TcpStream};
  use std::thread;

  fn fast_options() -> ConnectOptions {
    ConnectOptions {
      connect_timeout: Duration::from_secs(2),
      read_poll_interval: Duration::from_millis(20),
      ..Default::default()
    }
  }

  /// Accepts one client, answers the handshake with `ack`, and returns the
  /// announced version payload and the StartApi body.
  fn serve_handshake(listener: TcpListener, ack: &'static [u8]) -> thread::JoinHandle<(String, Vec<u8>, TcpStream)> {
    thread::spawn(move || {
      let (mut stream, _) = listener.accept().unwrap();
      let mut prefix = [0u8; 4];
      stream.read_exact(&mut prefix).unwrap();
      assert_eq!(&prefix, b"API\0");
      let len = stream.read_u32::<BigEndian>().unwrap() as usize;
      let mut payload = vec![0u8; len];
      stream.read_exact(&mut payload).unwrap();
      write_framed_message(&mut stream, ack, &|| false).unwrap();
      let start_api = read_framed_message_body(&mut stream, &|| false).unwrap().unwrap_or_default();
      (String::from_utf8(payload).unwrap(), start_api, stream)
    })
  }

  #[test]
  fn test_version_payload() {
    let opts = ConnectOptions::default();
    assert_eq!(opts.version_payload(), "v100..187");
    let opts = ConnectOptions { connect_options: "+PACEAPI".to_string(), ..Default::default() };
    assert_eq!(opts.version_payload(), "v100..187 +PACEAPI");
  }

  #[test]
  fn test_parse_server_ack() {
    let opts = ConnectOptions::default();
    assert_eq!(parse_server_ack(b"176\020240102 10:00:00 EST\0", &opts).unwrap(),
               (176, "20240102 10:00:00 EST".to_string()));
    assert!(matches!(parse_server_ack(b"76\0x\0", &opts), Err(EngineError::HandshakeError(_))));
    assert!(matches!(parse_server_ack(b"abc\0x\0", &opts), Err(EngineError::HandshakeError(_))));
    assert!(matches!(parse_server_ack(b"176", &opts), Err(EngineError::HandshakeError(_))));
  }

  #[test]
  fn test_handshake_and_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = serve_handshake(listener, b"187\020240102 10:00:00 EST\0");

    let conn = SocketConnection::connect("127.0.0.1", port, 7, &fast_options()).unwrap();
    assert_eq!(conn.server_version(), 187);
    assert_eq!(conn.connection_time(), "20240102 10:00:00 EST");
    assert_eq!(conn.client_id(), 7);

    let (payload, start_api, mut server_stream) = server.join().unwrap();
    assert_eq!(payload, "v100..187");
    assert_eq!(start_api, b"71\x002\x007\x00\x00".to_vec());

    // Idle poll returns None.
    assert_eq!(conn.read_frame().unwrap(), None);

    write_framed_message(&mut server_stream, b"49\x001\x001700000000\x00", &|| false).unwrap();
    let body = conn.read_frame().unwrap().unwrap();
    assert_eq!(body, b"49\x001\x001700000000\x00".to_vec());

    conn.write_frame(b"49\x001\x00").unwrap();
    let received = read_framed_message_body(&mut server_stream, &|| false).unwrap().unwrap();
    assert_eq!(received, b"49\x001\x00".to_vec());

    conn.close();
    conn.close();
    assert!(conn.is_closed());
    assert!(matches!(conn.write_frame(b"49\x001\x00"), Err(EngineError::ConnectionError(_))));
  }

  #[test]
  fn test_handshake_rejects_old_server() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
      let (mut stream, _) = listener.accept().unwrap();
      let mut hello = [0u8; 8];
      stream.read_exact(&mut hello).unwrap();
      let len = u32::from_be_bytes([hello[4], hello[5], hello[6], hello[7]]) as usize;
      let mut payload = vec![0u8; len];
      stream.read_exact(&mut payload).unwrap();
      write_framed_message(&mut stream, b"76\020240102 10:00:00 EST\0", &|| false).unwrap();
      stream
    });
    let result = SocketConnection::connect("127.0.0.1", port, 0, &fast_options());
    assert!(matches!(result, Err(EngineError::HandshakeError(_))));
    drop(server.join().unwrap());
  }

  #[test]
  fn test_write_failure_closes_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = serve_handshake(listener, b"187\0now\0");
    let conn = SocketConnection::connect("127.0.0.1", port, 0, &fast_options()).unwrap();
    let (_, _, server_stream) = server.join().unwrap();
    drop(server_stream);

    // The first writes may still land in the local send buffer.
    let mut failed = false;
    for _ in 0..100 {
      if conn.write_frame(b"49\x001\x00").is_err() {
        failed = true;
        break;
      }
      thread::sleep(Duration::from_millis(10));
    }
    assert!(failed);
    assert!(conn.is_closed());
    assert!(matches!(conn.write_frame(b"49\x001\x00"), Err(EngineError::ConnectionError(_))));
  }

  #[test]
  fn test_peer_close_is_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = serve_handshake(listener, b"187\0now\0");
    let conn = SocketConnection::connect("127.0.0.1", port, 0, &fast_options()).unwrap();
    let (_, _, server_stream) = server.join().unwrap();
    drop(server_stream);
    let result = loop {
      match conn.read_frame() {
        Ok(None) => continue,
        other => break other,
      }
    };
    assert!(matches!(result, Err(EngineError::ConnectionError(_))));
  }
}
