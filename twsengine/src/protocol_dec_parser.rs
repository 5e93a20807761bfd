// twsengine/src/protocol_dec_parser.rs
// Field-level reader over a NUL-separated frame body.

use crate::base::EngineError;

pub struct FieldParser<'a> {
  data: &'a [u8],
  fields: Vec<(usize, usize)>, // (start, end) indices for each field
  current_field: usize,
}

impl<'a> FieldParser<'a> {
  /// Create a new field parser
  pub fn new(data: &'a [u8]) -> Self {
    let mut parser = Self {
      data,
      fields: Vec::new(),
      current_field: 0,
    };

    // Pre-parse all fields
    parser.parse_fields();

    parser
  }

  /// Split the body on NUL terminators. Bytes after the last NUL are not a field.
  fn parse_fields(&mut self) {
    let mut start = 0;

    for i in 0..self.data.len() {
      if self.data[i] == 0 {
        self.fields.push((start, i));
        start = i + 1;
      }
    }
  }

  fn next_field(&mut self) -> Result<&'a [u8], EngineError> {
    if self.current_field >= self.fields.len() {
      return Err(EngineError::MalformedFrame(format!(
        "Unexpected end of message at field {} (frame has {} fields)",
        self.current_field, self.fields.len())));
    }
    let (start, end) = self.fields[self.current_field];
    self.current_field += 1;
    Ok(&self.data[start..end])
  }

  /// Read a string field
  pub fn read_string(&mut self) -> Result<String, EngineError> {
    let field = self.next_field()?;
    if field.is_empty() {
      return Ok(String::new());
    }

    std::str::from_utf8(field)
      .map(|s| s.to_string())
      .map_err(|e| EngineError::MalformedFrame(format!("Failed to parse string: {}", e)))
  }

  /// Read an integer field. An empty field reads as 0.
  pub fn read_int(&mut self) -> Result<i32, EngineError> {
    let s = self.read_string()?;

    if s.is_empty() {
      return Ok(0);
    }

    s.parse::<i32>()
      .map_err(|e| EngineError::MalformedFrame(format!("Failed to parse integer '{}': {}", s, e)))
  }

  /// Read a 64-bit integer field. An empty field reads as 0.
  pub fn read_i64(&mut self) -> Result<i64, EngineError> {
    let s = self.read_string()?;

    if s.is_empty() {
      return Ok(0);
    }

    s.parse::<i64>()
      .map_err(|e| EngineError::MalformedFrame(format!("Failed to parse long '{}': {}", s, e)))
  }

  /// Read a double field. An empty field reads as 0.0.
  pub fn read_double(&mut self) -> Result<f64, EngineError> {
    let s = self.read_string()?;

    if s.is_empty() {
      return Ok(0.0);
    }

    s.parse::<f64>()
      .map_err(|e| EngineError::MalformedFrame(format!("Failed to parse double '{}': {}", s, e)))
  }

  /// Read a double where an empty field or the max-value sentinel means "unset".
  pub fn read_double_max(&mut self) -> Result<Option<f64>, EngineError> {
    let s = self.read_string()?;

    if s.is_empty() || s == "1.7976931348623157E308" {
      return Ok(None);
    }

    let v = s.parse::<f64>()
      .map_err(|e| EngineError::MalformedFrame(format!("Failed to parse double '{}': {}", s, e)))?;
    if v == f64::MAX { Ok(None) } else { Ok(Some(v)) }
  }

  /// Read a size field sent as a decimal string. Empty means "unset".
  pub fn read_decimal_max(&mut self) -> Result<Option<f64>, EngineError> {
    self.read_double_max()
  }

  /// Read a boolean field (as 0 or 1)
  pub fn read_bool(&mut self) -> Result<bool, EngineError> {
    let val = self.read_int()?;
    Ok(val != 0)
  }

  /// Skip a field
  pub fn skip_field(&mut self) -> Result<(), EngineError> {
    self.next_field().map(|_| ())
  }

  /// Get the number of remaining fields
  pub fn remaining_fields(&self) -> usize {
    self.fields.len().saturating_sub(self.current_field)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_reads_in_order() {
    let data = b"1\06\0-1\02.5\0AAPL\0\0";
    let mut p = FieldParser::new(data);
    assert_eq!(p.remaining_fields(), 6);
    assert_eq!(p.read_int().unwrap(), 1);
    assert_eq!(p.read_i64().unwrap(), 6);
    assert_eq!(p.read_int().unwrap(), -1);
    assert_eq!(p.read_double().unwrap(), 2.5);
    assert_eq!(p.read_string().unwrap(), "AAPL");
    assert_eq!(p.read_int().unwrap(), 0);
    assert_eq!(p.remaining_fields(), 0);
  }

  #[test]
  fn test_end_of_message_is_malformed() {
    let mut p = FieldParser::new(b"1\0");
    p.skip_field().unwrap();
    match p.read_int() {
      Err(EngineError::MalformedFrame(_)) => {}
      other => panic!("expected MalformedFrame, got {:?}", other),
    }
  }

  #[test]
  fn test_bad_number_is_malformed() {
    let mut p = FieldParser::new(b"abc\0");
    assert!(matches!(p.read_int(), Err(EngineError::MalformedFrame(_))));
  }

  #[test]
  fn test_unterminated_tail_is_ignored() {
    let p = FieldParser::new(b"1\02\0partial");
    assert_eq!(p.remaining_fields(), 2);
  }

  #[test]
  fn test_double_max_sentinel() {
    let mut p = FieldParser::new(b"\01.7976931348623157E308\0100\0");
    assert_eq!(p.read_double_max().unwrap(), None);
    assert_eq!(p.read_double_max().unwrap(), None);
    assert_eq!(p.read_decimal_max().unwrap(), Some(100.0));
  }
}
