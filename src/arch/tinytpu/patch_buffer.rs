/// PatchBuffer: padded sliding-window extraction
///
/// One extraction loads the 7×7 padded input region shared by a 4×4 block
/// of output positions for one channel group. Every in-bounds pixel of the
/// region is fetched from tensor RAM exactly once; padding positions are
/// never fetched and read as zero. Windows for each output position are
/// then served from the region, either directly or through the staggered
/// four-lane stream the MAC array consumes.
use super::topology::{KERNEL, PAD_BOTTOM, PAD_LEFT, PAD_RIGHT, PAD_TOP};
use crate::builtin::{Module, Wire};
use crate::error::{Result, TpuError};
use crate::memdomain::{channel_groups, PixelWord, LANES};
use std::collections::VecDeque;

/// Output positions per block side.
pub const BLOCK: usize = 4;
/// Input rows/columns a block's windows span.
pub const REGION: usize = BLOCK + KERNEL - 1;

/// One 4×4 window, `[kr][kc]`, four channel lanes per tap.
pub type Patch = [[PixelWord; KERNEL]; KERNEL];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchConfig {
  pub height: usize,
  pub width: usize,
  pub channels: usize,
  pub pad_top: usize,
  pub pad_bottom: usize,
  pub pad_left: usize,
  pub pad_right: usize,
}

impl PatchConfig {
  /// "same" padding for the 4×4 kernel: output size equals input size.
  pub fn same(height: usize, width: usize, channels: usize) -> Self {
    Self {
      height,
      width,
      channels,
      pad_top: PAD_TOP,
      pad_bottom: PAD_BOTTOM,
      pad_left: PAD_LEFT,
      pad_right: PAD_RIGHT,
    }
  }

  pub fn validate(&self) -> Result<()> {
    if self.height == 0 || self.width == 0 {
      return Err(TpuError::config(format!(
        "patch buffer needs a non-empty image, got {}x{}",
        self.height, self.width
      )));
    }
    if self.channels == 0 {
      return Err(TpuError::config("patch buffer needs at least one channel"));
    }
    if self.out_height() == 0 || self.out_width() == 0 {
      return Err(TpuError::config("padded image is smaller than the kernel"));
    }
    Ok(())
  }

  pub fn channel_groups(&self) -> usize {
    channel_groups(self.channels)
  }

  pub fn out_height(&self) -> usize {
    (self.height + self.pad_top + self.pad_bottom + 1).saturating_sub(KERNEL)
  }

  pub fn out_width(&self) -> usize {
    (self.width + self.pad_left + self.pad_right + 1).saturating_sub(KERNEL)
  }

  pub fn blocks_high(&self) -> usize {
    (self.out_height() + BLOCK - 1) / BLOCK
  }

  pub fn blocks_wide(&self) -> usize {
    (self.out_width() + BLOCK - 1) / BLOCK
  }

  /// Map a padded coordinate to the stored pixel it reads, if any.
  pub fn source(&self, row: usize, col: usize) -> Option<(usize, usize)> {
    let r = row.checked_sub(self.pad_top)?;
    let c = col.checked_sub(self.pad_left)?;
    if r < self.height && c < self.width {
      Some((r, c))
    } else {
      None
    }
  }

  pub fn address(&self, row: usize, col: usize, group: usize) -> usize {
    (row * self.width + col) * self.channel_groups() + group
  }
}

/// Iteration state over one layer: which block and channel group the
/// next extraction covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCursor {
  pub channel_group: usize,
  pub block_row: usize,
  pub block_col: usize,
  pub layer_complete: bool,
}

impl BlockCursor {
  /// Top-left output position of the current block.
  pub fn origin(&self) -> (usize, usize) {
    (self.block_row * BLOCK, self.block_col * BLOCK)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractState {
  Idle,
  Loading,
  Ready,
}

pub struct PatchBuffer {
  name: String,
  config: Option<PatchConfig>,
  cursor: BlockCursor,
  state: ExtractState,

  /// Output: tensor RAM read address
  pub mem_req: Wire<usize>,
  /// Input: tensor RAM read data
  pub mem_resp: Wire<PixelWord>,
  /// Level signal, high once the region for the current cursor is loaded
  pub patch_ready: bool,

  region: [[PixelWord; REGION]; REGION],
  pending: VecDeque<(usize, usize, usize)>,
  in_flight: VecDeque<(usize, usize)>,
  fetches: u64,
}

impl PatchBuffer {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      config: None,
      cursor: BlockCursor::default(),
      state: ExtractState::Idle,
      mem_req: Wire::default(),
      mem_resp: Wire::default(),
      patch_ready: false,
      region: [[[0; LANES]; REGION]; REGION],
      pending: VecDeque::new(),
      in_flight: VecDeque::new(),
      fetches: 0,
    }
  }

  /// Load a layer geometry. Rejected geometries leave the buffer unchanged.
  pub fn configure(&mut self, config: PatchConfig) -> Result<()> {
    config.validate()?;
    self.reset();
    self.config = Some(config);
    Ok(())
  }

  fn config(&self) -> Result<PatchConfig> {
    self.config.ok_or_else(|| TpuError::config(format!("{}: not configured", self.name)))
  }

  pub fn cursor(&self) -> BlockCursor {
    self.cursor
  }

  /// Fetches issued since the last configure or reset.
  pub fn fetches(&self) -> u64 {
    self.fetches
  }

  pub fn select_channel_group(&mut self, group: usize) -> Result<()> {
    let cfg = self.config()?;
    if group >= cfg.channel_groups() {
      return Err(TpuError::config(format!(
        "channel group {} out of range, layer has {} group(s)",
        group,
        cfg.channel_groups()
      )));
    }
    self.cursor.channel_group = group;
    Ok(())
  }

  /// `next_channel_group` pulse. Returns true when the groups wrap back to 0.
  pub fn advance_channel_group(&mut self) -> Result<bool> {
    let groups = self.config()?.channel_groups();
    self.patch_ready = false;
    self.cursor.channel_group += 1;
    if self.cursor.channel_group >= groups {
      self.cursor.channel_group = 0;
      return Ok(true);
    }
    Ok(false)
  }

  /// `next_spatial_block` pulse: move four output columns right, wrapping
  /// to the next band of four rows. Restarts at channel group 0.
  pub fn advance_spatial_block(&mut self) -> Result<()> {
    let cfg = self.config()?;
    self.patch_ready = false;
    self.cursor.channel_group = 0;
    self.cursor.block_col += 1;
    if self.cursor.block_col >= cfg.blocks_wide() {
      self.cursor.block_col = 0;
      self.cursor.block_row += 1;
      if self.cursor.block_row >= cfg.blocks_high() {
        self.cursor.block_row = 0;
        self.cursor.layer_complete = true;
      }
    }
    Ok(())
  }

  /// `start_extraction` pulse for the block and group under the cursor.
  pub fn start_extraction(&mut self) -> Result<()> {
    let cfg = self.config()?;
    if self.cursor.layer_complete {
      return Err(TpuError::config(format!("{}: layer already complete", self.name)));
    }
    if self.cursor.channel_group >= cfg.channel_groups() {
      return Err(TpuError::config(format!(
        "channel group {} out of range, layer has {} group(s)",
        self.cursor.channel_group,
        cfg.channel_groups()
      )));
    }

    let (row0, col0) = self.cursor.origin();
    self.region = [[[0; LANES]; REGION]; REGION];
    self.pending.clear();
    self.in_flight.clear();
    for r in 0..REGION {
      for c in 0..REGION {
        if let Some((sr, sc)) = cfg.source(row0 + r, col0 + c) {
          self.pending.push_back((r, c, cfg.address(sr, sc, self.cursor.channel_group)));
        }
      }
    }
    log::trace!(
      "{}: extract block ({}, {}) group {}, {} fetches",
      self.name,
      self.cursor.block_row,
      self.cursor.block_col,
      self.cursor.channel_group,
      self.pending.len()
    );
    self.patch_ready = false;
    self.state = ExtractState::Loading;
    Ok(())
  }

  /// Value at a padded coordinate relative to the loaded region.
  pub fn region_value(&self, row: usize, col: usize) -> PixelWord {
    if row < REGION && col < REGION {
      self.region[row][col]
    } else {
      [0; LANES]
    }
  }

  /// Window for output position (`out_r`, `out_c`) inside the current block.
  pub fn patch(&self, out_r: usize, out_c: usize) -> Patch {
    let mut patch = [[[0; LANES]; KERNEL]; KERNEL];
    for (kr, row) in patch.iter_mut().enumerate() {
      for (kc, tap) in row.iter_mut().enumerate() {
        *tap = self.region_value(out_r + kr, out_c + kc);
      }
    }
    patch
  }

  /// Stream the window for (`out_r`, `out_c`) on four staggered lanes.
  pub fn stream(&self, out_r: usize, out_c: usize) -> LaneStream {
    LaneStream::new(self.patch(out_r, out_c))
  }
}

impl Module for PatchBuffer {
  fn run(&mut self) {
    if self.state != ExtractState::Loading {
      self.mem_req.clear();
      return;
    }

    if let Some(word) = self.mem_resp.take() {
      if let Some((r, c)) = self.in_flight.pop_front() {
        self.region[r][c] = word;
      }
    }

    match self.pending.pop_front() {
      Some((r, c, addr)) => {
        self.mem_req.set(addr);
        self.in_flight.push_back((r, c));
        self.fetches += 1;
      },
      None => {
        self.mem_req.clear();
        if self.in_flight.is_empty() {
          self.state = ExtractState::Ready;
          self.patch_ready = true;
        }
      },
    }
  }

  fn reset(&mut self) {
    self.cursor = BlockCursor::default();
    self.state = ExtractState::Idle;
    self.mem_req = Wire::default();
    self.mem_resp = Wire::default();
    self.patch_ready = false;
    self.region = [[[0; LANES]; REGION]; REGION];
    self.pending.clear();
    self.in_flight.clear();
    self.fetches = 0;
  }

  fn name(&self) -> &str {
    &self.name
  }
}

/// Four-lane staggered window stream.
///
/// Lane k carries window row k through a k-deep delay line, so at stream
/// cycle t lane k holds column t-k and is valid for k <= t < k+4.
pub struct LaneStream {
  window: Patch,
  delay: [VecDeque<Option<PixelWord>>; KERNEL],
  cycle: usize,
}

impl LaneStream {
  /// Cycles from first to last valid beat.
  pub const CYCLES: usize = 2 * KERNEL - 1;

  pub fn new(window: Patch) -> Self {
    let delay = std::array::from_fn(|k| std::iter::repeat(None).take(k).collect());
    Self { window, delay, cycle: 0 }
  }

  /// Advance one cycle. Returns `None` once every lane has drained.
  pub fn step(&mut self) -> Option<[Option<PixelWord>; KERNEL]> {
    if self.cycle >= Self::CYCLES {
      return None;
    }
    let t = self.cycle;
    let mut lanes = [None; KERNEL];
    for (k, lane) in lanes.iter_mut().enumerate() {
      let input = if t < KERNEL { Some(self.window[k][t]) } else { None };
      self.delay[k].push_back(input);
      *lane = self.delay[k].pop_front().flatten();
    }
    self.cycle += 1;
    Some(lanes)
  }

  /// Drain the stream and undo the stagger.
  pub fn deskew(mut self) -> Patch {
    let mut patch = [[[0; LANES]; KERNEL]; KERNEL];
    let mut t = 0;
    while let Some(lanes) = self.step() {
      for (k, beat) in lanes.iter().enumerate() {
        if let Some(word) = beat {
          patch[k][t - k] = *word;
        }
      }
      t += 1;
    }
    patch
  }
}
