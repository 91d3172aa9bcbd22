/// Channel-grouped activation storage
use crate::builtin::{Module, Wire};
use crate::error::{Result, TpuError};

/// Channels packed into one storage word.
pub const LANES: usize = 4;

/// One storage word: up to four channels of one pixel.
pub type PixelWord = [i8; LANES];

pub fn channel_groups(channels: usize) -> usize {
  (channels + LANES - 1) / LANES
}

/// Tensor RAM holding one H×W×C int8 activation map.
///
/// Pixels are stored channel-last in 4-channel words at
/// `address = (row * width + col) * channel_groups + group`.
/// Reads go through a registered port: a request sampled on one edge is
/// answered on `read_resp` by the same edge, and only one address can be
/// outstanding per cycle.
pub struct TensorRam {
  name: String,
  height: usize,
  width: usize,
  channels: usize,

  /// Input: read address
  pub read_req: Wire<usize>,
  /// Output: word at the requested address
  pub read_resp: Wire<PixelWord>,

  words: Vec<PixelWord>,
  read_counts: Vec<u32>,
}

impl TensorRam {
  pub fn new(name: impl Into<String>, height: usize, width: usize, channels: usize) -> Result<Self> {
    if height == 0 || width == 0 || channels == 0 {
      return Err(TpuError::config(format!(
        "tensor dimensions must be non-zero, got {}x{}x{}",
        height, width, channels
      )));
    }
    let depth = height * width * channel_groups(channels);
    Ok(Self {
      name: name.into(),
      height,
      width,
      channels,
      read_req: Wire::default(),
      read_resp: Wire::default(),
      words: vec![[0; LANES]; depth],
      read_counts: vec![0; depth],
    })
  }

  /// Build from a channel-last `[H][W][C]` buffer.
  pub fn from_hwc(name: impl Into<String>, height: usize, width: usize, channels: usize, data: &[i8]) -> Result<Self> {
    let mut ram = Self::new(name, height, width, channels)?;
    if data.len() != height * width * channels {
      return Err(TpuError::storage(format!(
        "{}: expected {} values, got {}",
        ram.name,
        height * width * channels,
        data.len()
      )));
    }
    for (i, v) in data.iter().enumerate() {
      let ch = i % channels;
      let pix = i / channels;
      ram.write_pixel(pix / width, pix % width, ch, *v);
    }
    Ok(ram)
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn channels(&self) -> usize {
    self.channels
  }

  pub fn channel_groups(&self) -> usize {
    channel_groups(self.channels)
  }

  pub fn depth(&self) -> usize {
    self.words.len()
  }

  pub fn address(&self, row: usize, col: usize, group: usize) -> usize {
    (row * self.width + col) * self.channel_groups() + group
  }

  /// Write one channel of one pixel, bypassing the port (loader path).
  pub fn write_pixel(&mut self, row: usize, col: usize, channel: usize, value: i8) {
    if row < self.height && col < self.width && channel < self.channels {
      let addr = self.address(row, col, channel / LANES);
      self.words[addr][channel % LANES] = value;
    }
  }

  /// Read one channel of one pixel without touching the port counters.
  pub fn pixel(&self, row: usize, col: usize, channel: usize) -> i8 {
    if row < self.height && col < self.width && channel < self.channels {
      self.words[self.address(row, col, channel / LANES)][channel % LANES]
    } else {
      0
    }
  }

  /// Direct word read, out of range reads as zero.
  pub fn peek(&self, addr: usize) -> PixelWord {
    self.words.get(addr).copied().unwrap_or([0; LANES])
  }

  /// Dump as a channel-last `[H][W][C]` buffer.
  pub fn to_hwc(&self) -> Vec<i8> {
    let mut out = Vec::with_capacity(self.height * self.width * self.channels);
    for r in 0..self.height {
      for c in 0..self.width {
        for ch in 0..self.channels {
          out.push(self.pixel(r, c, ch));
        }
      }
    }
    out
  }

  /// Number of port reads served at `addr` since the last counter clear.
  pub fn reads_at(&self, addr: usize) -> u32 {
    self.read_counts.get(addr).copied().unwrap_or(0)
  }

  pub fn total_reads(&self) -> u64 {
    self.read_counts.iter().map(|&n| n as u64).sum()
  }

  pub fn clear_read_counters(&mut self) {
    self.read_counts.iter_mut().for_each(|n| *n = 0);
  }
}

impl Module for TensorRam {
  fn run(&mut self) {
    if self.read_req.valid {
      let addr = self.read_req.value;
      if addr < self.words.len() {
        self.read_counts[addr] += 1;
        self.read_resp.set(self.words[addr]);
      } else {
        log::warn!("{}: read at 0x{:x} past depth {}", self.name, addr, self.words.len());
        self.read_resp.set([0; LANES]);
      }
    } else {
      self.read_resp.clear();
    }
  }

  fn reset(&mut self) {
    self.read_req = Wire::default();
    self.read_resp = Wire::default();
    self.clear_read_counters();
  }

  fn name(&self) -> &str {
    &self.name
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_address_mapping() {
    let ram = TensorRam::new("t", 4, 4, 8).unwrap();
    assert_eq!(ram.channel_groups(), 2);
    assert_eq!(ram.address(0, 0, 0), 0);
    assert_eq!(ram.address(0, 0, 1), 1);
    assert_eq!(ram.address(0, 1, 0), 2);
    assert_eq!(ram.address(1, 0, 1), 9);
    assert_eq!(ram.depth(), 32);
  }

  #[test]
  fn test_hwc_round_trip_and_lane_packing() {
    let data: Vec<i8> = (0..2 * 2 * 5).map(|v| v as i8).collect();
    let ram = TensorRam::from_hwc("t", 2, 2, 5, &data).unwrap();
    assert_eq!(ram.to_hwc(), data);
    // channel 4 sits alone in group 1, lanes 1..3 zero
    assert_eq!(ram.peek(ram.address(0, 0, 1)), [4, 0, 0, 0]);
  }

  #[test]
  fn test_port_read_counts() {
    let mut ram = TensorRam::from_hwc("t", 1, 2, 1, &[7, -3]).unwrap();
    ram.read_req.set(1);
    ram.run();
    assert_eq!(ram.read_resp.take(), Some([-3, 0, 0, 0]));
    ram.read_req.clear();
    ram.run();
    assert!(!ram.read_resp.valid);
    assert_eq!(ram.reads_at(1), 1);
    assert_eq!(ram.total_reads(), 1);
  }

  #[test]
  fn test_zero_dimension_rejected() {
    assert!(TensorRam::new("t", 0, 4, 1).is_err());
    assert!(TensorRam::new("t", 4, 0, 1).is_err());
    assert!(TensorRam::from_hwc("t", 2, 2, 1, &[0; 3]).is_err());
  }
}
