/// Read-only parameter stores: weights, biases and per-layer quant records
use crate::arch::tinytpu::requantize::QuantParams;
use crate::error::{Result, TpuError};

/// Flat int8 weight store shared by every layer.
///
/// Convolution kernels are 4×4 planes ordered by (output channel, input
/// channel), each plane stored column-major. Dense matrices are row-major
/// `[input][output]`. Layer regions follow each other in network order.
#[derive(Debug, Clone, Default)]
pub struct WeightRom {
  data: Vec<i8>,
}

impl WeightRom {
  pub fn new(data: Vec<i8>) -> Self {
    Self { data }
  }

  pub fn from_bytes(bytes: &[u8]) -> Self {
    Self {
      data: bytes.iter().map(|&b| b as i8).collect(),
    }
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  /// Out of range reads return 0.
  pub fn read(&self, addr: usize) -> i8 {
    self.data.get(addr).copied().unwrap_or(0)
  }

  /// Check that a layer region lies inside the store.
  pub fn check_region(&self, offset: usize, len: usize, what: &str) -> Result<()> {
    if offset + len > self.data.len() {
      return Err(TpuError::storage(format!(
        "{} weights need [{}, {}) but the weight store holds {} bytes",
        what,
        offset,
        offset + len,
        self.data.len()
      )));
    }
    Ok(())
  }

  pub fn region(&self, offset: usize, len: usize, what: &str) -> Result<&[i8]> {
    self.check_region(offset, len, what)?;
    Ok(&self.data[offset..offset + len])
  }

  pub fn as_bytes(&self) -> Vec<u8> {
    self.data.iter().map(|&v| v as u8).collect()
  }
}

/// Flat int32 bias store, one word per output channel or neuron.
#[derive(Debug, Clone, Default)]
pub struct BiasRom {
  data: Vec<i32>,
}

impl BiasRom {
  pub fn new(data: Vec<i32>) -> Self {
    Self { data }
  }

  /// Decode single-byte records, four per word, little-endian.
  pub fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
    if bytes.len() % 4 != 0 {
      return Err(TpuError::validation(format!(
        "bias table holds {} bytes, not a whole number of 32-bit words",
        bytes.len()
      )));
    }
    let data = bytes
      .chunks_exact(4)
      .map(|w| i32::from_le_bytes([w[0], w[1], w[2], w[3]]))
      .collect();
    Ok(Self { data })
  }

  /// Decode 32-bit word records.
  pub fn from_words(words: &[u64]) -> Result<Self> {
    let mut data = Vec::with_capacity(words.len());
    for &w in words {
      let word = u32::try_from(w).map_err(|_| TpuError::validation(format!("bias word 0x{:x} wider than 32 bits", w)))?;
      data.push(word as i32);
    }
    Ok(Self { data })
  }

  pub fn to_le_bytes(&self) -> Vec<u8> {
    self.data.iter().flat_map(|v| v.to_le_bytes()).collect()
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn read(&self, addr: usize) -> i32 {
    self.data.get(addr).copied().unwrap_or(0)
  }

  pub fn check_region(&self, offset: usize, len: usize, what: &str) -> Result<()> {
    if offset + len > self.data.len() {
      return Err(TpuError::storage(format!(
        "{} biases need [{}, {}) but the bias store holds {} words",
        what,
        offset,
        offset + len,
        self.data.len()
      )));
    }
    Ok(())
  }

  pub fn region(&self, offset: usize, len: usize, what: &str) -> Result<&[i32]> {
    self.check_region(offset, len, what)?;
    Ok(&self.data[offset..offset + len])
  }
}

/// Quantization parameter ROM, one 38-bit record per layer.
#[derive(Debug, Clone, Default)]
pub struct QuantRom {
  entries: Vec<QuantParams>,
}

impl QuantRom {
  pub fn new(entries: Vec<QuantParams>) -> Self {
    Self { entries }
  }

  pub fn from_records(records: &[u64]) -> Result<Self> {
    let entries = records
      .iter()
      .enumerate()
      .map(|(i, &r)| QuantParams::decode(r).map_err(|e| TpuError::validation(format!("quant entry {}: {}", i, e))))
      .collect::<Result<Vec<_>>>()?;
    Ok(Self { entries })
  }

  pub fn to_records(&self) -> Vec<u64> {
    self.entries.iter().map(QuantParams::encode).collect()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn entry(&self, layer: usize) -> Result<QuantParams> {
    self
      .entries
      .get(layer)
      .copied()
      .ok_or_else(|| TpuError::storage(format!("no quant entry for layer {} ({} entries)", layer, self.entries.len())))
  }
}
