// twsengine/src/frame.rs
// Length-prefixed framing: 4-byte big-endian size followed by the body.
// The body is a sequence of NUL-terminated ASCII fields; the first one is
// the numeric message type.

use std::io::{self, Cursor, ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::base::EngineError;

/// Upper bound on a single frame body.
pub const MAX_MSG_SIZE: usize = 10 * 1024 * 1024; // 10 MB limit

/// One complete incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
  pub msg_type: i32,
  /// The full body, including the leading message type field.
  pub body: Vec<u8>,
  fields_start: usize,
}

impl Frame {
  /// Build a frame from a raw body, extracting the message type.
  pub fn from_body(body: Vec<u8>) -> Result<Self, EngineError> {
    let (msg_type, fields_start) = split_message_type(&body)?;
    Ok(Frame { msg_type, body, fields_start })
  }

  /// Fields following the message type.
  pub fn fields(&self) -> &[u8] {
    &self.body[self.fields_start..]
  }
}

/// Parse the leading message type field. Returns the type and the offset of
/// the first byte after its terminator.
pub fn split_message_type(body: &[u8]) -> Result<(i32, usize), EngineError> {
  let end = body.iter().position(|&b| b == 0)
    .ok_or_else(|| EngineError::MalformedFrame(format!("No field terminator in frame: {:02X?}", truncate(body))))?;
  let type_str = std::str::from_utf8(&body[..end])
    .map_err(|e| EngineError::MalformedFrame(format!("Invalid UTF8 in message type: {}", e)))?;
  let msg_type = type_str.parse::<i32>()
    .map_err(|e| EngineError::MalformedFrame(format!("Parsing message type '{}': {}", type_str, e)))?;
  Ok((msg_type, end + 1))
}

fn truncate(body: &[u8]) -> &[u8] {
  &body[..body.len().min(32)]
}

fn is_timeout(e: &io::Error) -> bool {
  e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
}

/// Fill `buf` completely, retrying across read timeouts until the transport
/// is reported dead or `is_closed` turns true.
fn read_exact_retrying<R: Read>(stream: &mut R, buf: &mut [u8], is_closed: &dyn Fn() -> bool) -> Result<(), EngineError> {
  let mut bytes_read = 0;
  while bytes_read < buf.len() {
    if is_closed() {
      return Err(EngineError::ConnectionError("Connection closed while reading frame".to_string()));
    }
    match stream.read(&mut buf[bytes_read..]) {
      Ok(0) => return Err(EngineError::ConnectionError("Connection closed by peer".to_string())),
      Ok(n) => bytes_read += n,
      Err(ref e) if is_timeout(e) => {
        thread::sleep(Duration::from_millis(1));
        continue;
      }
      Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
      Err(e) => return Err(EngineError::ConnectionError(format!("Reading frame: {}", e))),
    }
  }
  Ok(())
}

/// Read one framed body. Returns `Ok(None)` if the stream's read timeout
/// elapsed before any byte of a new frame arrived.
pub fn read_framed_message_body<R: Read>(stream: &mut R, is_closed: &dyn Fn() -> bool) -> Result<Option<Vec<u8>>, EngineError> {
  let mut size_buf = [0u8; 4];

  // First byte decides between "idle" and "frame in progress".
  loop {
    match stream.read(&mut size_buf[..1]) {
      Ok(0) => return Err(EngineError::ConnectionError("Connection closed by peer".to_string())),
      Ok(_) => break,
      Err(ref e) if is_timeout(e) => return Ok(None),
      Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
      Err(e) => return Err(EngineError::ConnectionError(format!("Reading message size: {}", e))),
    }
  }
  read_exact_retrying(stream, &mut size_buf[1..], is_closed)?;

  let size = Cursor::new(size_buf).read_u32::<BigEndian>()
    .map_err(|e| EngineError::InternalError(format!("Parsing message size: {}", e)))? as usize;

  if size == 0 { return Ok(Some(Vec::new())); }
  if size > MAX_MSG_SIZE {
    return Err(EngineError::ConnectionError(format!("Message size too large: {}", size)));
  }

  let mut msg_buf = vec![0u8; size];
  read_exact_retrying(stream, &mut msg_buf, is_closed)?;
  Ok(Some(msg_buf))
}

/// Prepend the 4-byte big-endian length to `msg_body`.
pub fn encode_framed_message(msg_body: &[u8]) -> Result<Vec<u8>, EngineError> {
  if msg_body.len() > MAX_MSG_SIZE {
    return Err(EngineError::InternalError(format!("Message size too large: {}", msg_body.len())));
  }
  let mut framed = Vec::with_capacity(4 + msg_body.len());
  framed.write_u32::<BigEndian>(msg_body.len() as u32)
    .map_err(|e| EngineError::InternalError(format!("Failed to encode length: {}", e)))?;
  framed.extend_from_slice(msg_body);
  Ok(framed)
}

/// Write all of `buf`, retrying after write timeouts until it is on the
/// wire or the stream is reported dead or `is_closed` turns true.
fn write_all_retrying<W: Write>(stream: &mut W, buf: &[u8], is_closed: &dyn Fn() -> bool) -> Result<(), EngineError> {
  let mut written = 0;
  while written < buf.len() {
    if is_closed() {
      return Err(EngineError::ConnectionError(format!(
        "Connection closed after {} of {} bytes of a frame", written, buf.len())));
    }
    match stream.write(&buf[written..]) {
      Ok(0) => return Err(EngineError::ConnectionError("Connection closed by peer while writing frame".to_string())),
      Ok(n) => written += n,
      Err(ref e) if is_timeout(e) => {
        thread::sleep(Duration::from_millis(1));
        continue;
      }
      Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
      Err(e) => return Err(EngineError::ConnectionError(format!("Writing frame: {}", e))),
    }
  }
  Ok(())
}

/// Write one framed message (length + body) and flush. A frame is never
/// left half-written while the stream is alive: timeouts part way through
/// are retried.
pub fn write_framed_message<W: Write>(stream: &mut W, msg_body: &[u8], is_closed: &dyn Fn() -> bool) -> Result<(), EngineError> {
  let framed = encode_framed_message(msg_body)?;
  write_all_retrying(stream, &framed, is_closed)?;
  stream.flush().map_err(|e| EngineError::ConnectionError(format!("Flushing frame: {}", e)))?;
  Ok(())
}

/// Render a body as text for the session log. NUL separators become a
/// center dot; a literal center dot or backslash is escaped with a
/// backslash, and bytes that are not valid UTF-8 are written as `\xHH`.
/// `text_to_body` restores the exact bytes.
pub fn body_to_text(body: &[u8]) -> String {
  let mut text = String::with_capacity(body.len());
  let mut rest = body;
  loop {
    match std::str::from_utf8(rest) {
      Ok(valid) => {
        push_escaped(&mut text, valid);
        return text;
      }
      Err(e) => {
        let (valid, after) = rest.split_at(e.valid_up_to());
        if let Ok(valid) = std::str::from_utf8(valid) {
          push_escaped(&mut text, valid);
        }
        let bad_len = e.error_len().unwrap_or(after.len());
        for b in &after[..bad_len] {
          text.push_str(&format!("\\x{:02X}", b));
        }
        rest = &after[bad_len..];
      }
    }
  }
}

fn push_escaped(text: &mut String, s: &str) {
  for c in s.chars() {
    match c {
      '\0' => text.push('·'),
      '·' => text.push_str("\\·"),
      '\\' => text.push_str("\\\\"),
      c => text.push(c),
    }
  }
}

/// Inverse of `body_to_text`.
pub fn text_to_body(text: &str) -> Vec<u8> {
  let mut body = Vec::with_capacity(text.len());
  let mut utf8 = [0u8; 4];
  let mut chars = text.chars();
  while let Some(c) = chars.next() {
    match c {
      '·' => body.push(0),
      '\\' => match chars.next() {
        Some('x') => {
          let hex: String = chars.by_ref().take(2).collect();
          match u8::from_str_radix(&hex, 16) {
            Ok(b) => body.push(b),
            Err(_) => {
              body.extend_from_slice(b"\\x");
              body.extend_from_slice(hex.as_bytes());
            }
          }
        }
        Some(other) => body.extend_from_slice(other.encode_utf8(&mut utf8).as_bytes()),
        None => body.push(b'\\'),
      },
      c => body.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes()),
    }
  }
  body
}

#[cfg(test)]
mod tests {
  use super::*;

  /// A reader that hands out its data in small chunks with timeouts in between.
  struct ChoppyReader {
    chunks: Vec<Result<Vec<u8>, ErrorKind>>,
  }

  impl Read for ChoppyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
      if self.chunks.is_empty() {
        return Ok(0);
      }
      match self.chunks.remove(0) {
        Ok(mut chunk) => {
          let n = chunk.len().min(buf.len());
          buf[..n].copy_from_slice(&chunk[..n]);
          if n < chunk.len() {
            self.chunks.insert(0, Ok(chunk.split_off(n)));
          }
          Ok(n)
        }
        Err(kind) => Err(io::Error::new(kind, "simulated")),
      }
    }
  }

  #[test]
  fn test_frame_roundtrip_through_partial_reads() {
    let framed = encode_framed_message(b"1\06\07\0").unwrap();
    let mut reader = ChoppyReader {
      chunks: vec![
        Ok(framed[..2].to_vec()),
        Err(ErrorKind::WouldBlock),
        Ok(framed[2..5].to_vec()),
        Err(ErrorKind::TimedOut),
        Ok(framed[5..].to_vec()),
      ],
    };
    let body = read_framed_message_body(&mut reader, &|| false).unwrap().unwrap();
    assert_eq!(body, b"1\06\07\0");
  }

  /// A writer that accepts a few bytes per call and fails with the scripted errors in between.
  struct ChoppyWriter {
    written: Vec<u8>,
    max_chunk: usize,
    errors: Vec<ErrorKind>,
  }

  impl Write for ChoppyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      if !self.written.is_empty() && !self.errors.is_empty() {
        return Err(io::Error::new(self.errors.remove(0), "simulated"));
      }
      let n = buf.len().min(self.max_chunk);
      self.written.extend_from_slice(&buf[..n]);
      Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  #[test]
  fn test_write_retries_timeouts_mid_frame() {
    let mut writer = ChoppyWriter {
      written: Vec::new(),
      max_chunk: 3,
      errors: vec![ErrorKind::TimedOut, ErrorKind::WouldBlock, ErrorKind::Interrupted],
    };
    write_framed_message(&mut writer, b"49\01\0", &|| false).unwrap();
    assert_eq!(writer.written, encode_framed_message(b"49\01\0").unwrap());
  }

  #[test]
  fn test_write_hard_error_mid_frame() {
    let mut writer = ChoppyWriter { written: Vec::new(), max_chunk: 3, errors: vec![ErrorKind::BrokenPipe] };
    assert!(matches!(write_framed_message(&mut writer, b"49\01\0", &|| false), Err(EngineError::ConnectionError(_))));
    assert_eq!(writer.written.len(), 3);

    let mut writer = ChoppyWriter { written: Vec::new(), max_chunk: 3, errors: vec![ErrorKind::TimedOut; 1000] };
    assert!(matches!(write_framed_message(&mut writer, b"49\01\0", &|| true), Err(EngineError::ConnectionError(_))));
  }

  #[test]
  fn test_idle_returns_none() {
    let mut reader = ChoppyReader { chunks: vec![Err(ErrorKind::WouldBlock)] };
    assert_eq!(read_framed_message_body(&mut reader, &|| false).unwrap(), None);
  }

  #[test]
  fn test_eof_mid_frame_is_connection_error() {
    let framed = encode_framed_message(b"1\02\0").unwrap();
    let mut reader = ChoppyReader { chunks: vec![Ok(framed[..6].to_vec())] };
    match read_framed_message_body(&mut reader, &|| false) {
      Err(EngineError::ConnectionError(_)) => {}
      other => panic!("expected ConnectionError, got {:?}", other),
    }
  }

  #[test]
  fn test_oversized_frame_rejected() {
    let mut header = Vec::new();
    header.write_u32::<BigEndian>((MAX_MSG_SIZE + 1) as u32).unwrap();
    let mut reader = ChoppyReader { chunks: vec![Ok(header)] };
    assert!(matches!(read_framed_message_body(&mut reader, &|| false), Err(EngineError::ConnectionError(_))));
  }

  #[test]
  fn test_split_message_type() {
    let frame = Frame::from_body(b"52\01\09\0".to_vec()).unwrap();
    assert_eq!(frame.msg_type, 52);
    assert_eq!(frame.fields(), b"1\09\0");
    assert!(matches!(Frame::from_body(b"xx\0".to_vec()), Err(EngineError::MalformedFrame(_))));
    assert!(matches!(Frame::from_body(b"12".to_vec()), Err(EngineError::MalformedFrame(_))));
  }

  #[test]
  fn test_text_rendering() {
    assert_eq!(body_to_text(b"1\0AAPL\0"), "1·AAPL·");
    assert_eq!(text_to_body("1·AAPL·"), b"1\0AAPL\0".to_vec());
  }

  #[test]
  fn test_text_rendering_is_lossless() {
    let mut body = b"4\02\0-1\0".to_vec();
    body.extend_from_slice("price·size C:\\tmp\0".as_bytes());
    body.extend_from_slice(&[0xff, b'x', 0xc3, 0]);
    let text = body_to_text(&body);
    assert!(text.contains("\\xFF"));
    assert!(text.contains("\\·"));
    assert_eq!(text_to_body(&text), body);
  }
}
