/// Readers for the text hex tables the accelerator loads at boot.
///
/// Every table is one record per line. Blank lines and lines starting
/// with `#` or `//` are skipped, as is anything after a trailing comment
/// marker on a data line.
use crate::error::{Result, TpuError};
use std::fs;
use std::path::Path;

fn strip_comment(line: &str) -> &str {
  let end = [line.find("//"), line.find('#')].into_iter().flatten().min().unwrap_or(line.len());
  line[..end].trim()
}

fn parse_error(source: &str, line: usize, msg: impl Into<String>) -> TpuError {
  TpuError::Parse {
    file: source.to_string(),
    line,
    msg: msg.into(),
  }
}

/// Parse a byte table. A data line holds one or more bytes written as
/// consecutive hex pairs; bytes are returned in file order.
pub fn parse_bytes(text: &str, source: &str) -> Result<Vec<u8>> {
  let mut bytes = Vec::new();
  for (idx, raw) in text.lines().enumerate() {
    let line = strip_comment(raw);
    if line.is_empty() {
      continue;
    }
    let digits = line.strip_prefix("0x").unwrap_or(line);
    if digits.len() % 2 != 0 {
      return Err(parse_error(source, idx + 1, format!("odd number of hex digits in '{}'", line)));
    }
    for pair in digits.as_bytes().chunks(2) {
      let s = std::str::from_utf8(pair).map_err(|e| parse_error(source, idx + 1, e.to_string()))?;
      let b = u8::from_str_radix(s, 16).map_err(|e| parse_error(source, idx + 1, format!("'{}': {}", s, e)))?;
      bytes.push(b);
    }
  }
  Ok(bytes)
}

/// Parse a table of wide records, one hex value per line.
pub fn parse_words(text: &str, source: &str, bits: u32) -> Result<Vec<u64>> {
  let limit = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
  let mut words = Vec::new();
  for (idx, raw) in text.lines().enumerate() {
    let line = strip_comment(raw);
    if line.is_empty() {
      continue;
    }
    let digits = line.strip_prefix("0x").unwrap_or(line);
    let value = u64::from_str_radix(digits, 16).map_err(|e| parse_error(source, idx + 1, format!("'{}': {}", line, e)))?;
    if value > limit {
      return Err(parse_error(source, idx + 1, format!("0x{:x} does not fit in {} bits", value, bits)));
    }
    words.push(value);
  }
  Ok(words)
}

pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
  let text = fs::read_to_string(path)?;
  parse_bytes(&text, &path.display().to_string())
}

pub fn read_words(path: &Path, bits: u32) -> Result<Vec<u64>> {
  let text = fs::read_to_string(path)?;
  parse_words(&text, &path.display().to_string(), bits)
}
