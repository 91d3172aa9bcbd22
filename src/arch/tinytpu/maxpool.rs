/// MaxPool: streaming reduction of an N×N grid into non-overlapping tiles
use crate::builtin::{Module, Wire};
use crate::error::{Result, TpuError};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolIn {
  pub value: i8,
  pub row: usize,
  pub col: usize,
}

/// A completed tile: its maximum and the input-space coordinate of the
/// tile's top-left element, offset by the grid base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolOut {
  pub value: i8,
  pub row: usize,
  pub col: usize,
}

pub struct MaxPool {
  name: String,
  grid: usize,
  filter_h: usize,
  filter_w: usize,
  base_row: usize,
  base_col: usize,

  pub input: Wire<PoolIn>,
  pub output: Wire<PoolOut>,

  seen: Vec<bool>,
  maxima: Vec<i8>,
  counts: Vec<usize>,
  completed: VecDeque<PoolOut>,
  input_done: bool,
  /// Set when a wire beat was rejected; cleared only by `reset`.
  bad_input: bool,
}

impl MaxPool {
  pub fn new(name: impl Into<String>, grid: usize, filter_h: usize, filter_w: usize) -> Result<Self> {
    if filter_h == 0 || filter_w == 0 || grid == 0 || grid % filter_h != 0 || grid % filter_w != 0 {
      return Err(TpuError::config(format!(
        "pool grid {} does not tile into {}x{} filters",
        grid, filter_h, filter_w
      )));
    }
    let tiles = (grid / filter_h) * (grid / filter_w);
    Ok(Self {
      name: name.into(),
      grid,
      filter_h,
      filter_w,
      base_row: 0,
      base_col: 0,
      input: Wire::default(),
      output: Wire::default(),
      seen: vec![false; grid * grid],
      maxima: vec![i8::MIN; tiles],
      counts: vec![0; tiles],
      completed: VecDeque::new(),
      input_done: false,
      bad_input: false,
    })
  }

  /// Start a new grid whose element (0, 0) sits at (`base_row`, `base_col`).
  pub fn begin(&mut self, base_row: usize, base_col: usize) {
    self.clear_grid();
    self.base_row = base_row;
    self.base_col = base_col;
  }

  fn tiles_wide(&self) -> usize {
    self.grid / self.filter_w
  }

  /// Accept one element. A tile is queued the moment its last element lands.
  pub fn push(&mut self, beat: PoolIn) -> Result<()> {
    if beat.row >= self.grid || beat.col >= self.grid {
      return Err(TpuError::validation(format!(
        "{}: element ({}, {}) outside {}x{} grid",
        self.name, beat.row, beat.col, self.grid, self.grid
      )));
    }
    let cell = beat.row * self.grid + beat.col;
    if self.seen[cell] {
      return Err(TpuError::validation(format!(
        "{}: element ({}, {}) delivered twice",
        self.name, beat.row, beat.col
      )));
    }
    self.seen[cell] = true;

    let (tr, tc) = (beat.row / self.filter_h, beat.col / self.filter_w);
    let tile = tr * self.tiles_wide() + tc;
    self.maxima[tile] = self.maxima[tile].max(beat.value);
    self.counts[tile] += 1;
    if self.counts[tile] == self.filter_h * self.filter_w {
      self.completed.push_back(PoolOut {
        value: self.maxima[tile],
        row: self.base_row + tr * self.filter_h,
        col: self.base_col + tc * self.filter_w,
      });
    }
    Ok(())
  }

  /// Mark the end of the input stream.
  pub fn finish(&mut self) {
    self.input_done = true;
  }

  /// Pull every completed tile not yet delivered, in completion order.
  pub fn drain(&mut self) -> Vec<PoolOut> {
    self.completed.drain(..).collect()
  }

  /// Input ended and every completed tile has left.
  pub fn is_done(&self) -> bool {
    self.input_done && self.completed.is_empty()
  }

  pub fn pending_outputs(&self) -> usize {
    self.completed.len()
  }

  /// A duplicate or out-of-range beat arrived on the input wire since the
  /// last reset.
  pub fn has_error(&self) -> bool {
    self.bad_input
  }

  fn clear_grid(&mut self) {
    self.input = Wire::default();
    self.output = Wire::default();
    self.seen.iter_mut().for_each(|s| *s = false);
    self.maxima.iter_mut().for_each(|m| *m = i8::MIN);
    self.counts.iter_mut().for_each(|c| *c = 0);
    self.completed.clear();
    self.input_done = false;
  }
}

impl Module for MaxPool {
  fn run(&mut self) {
    match self.completed.pop_front() {
      Some(out) => self.output.set(out),
      None => self.output.clear(),
    }
    if let Some(beat) = self.input.take() {
      if let Err(e) = self.push(beat) {
        log::error!("{}", e);
        self.bad_input = true;
      }
    }
  }

  fn reset(&mut self) {
    self.clear_grid();
    self.base_row = 0;
    self.base_col = 0;
    self.bad_input = false;
  }

  fn name(&self) -> &str {
    &self.name
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const GRID: [[i8; 4]; 4] = [[1, 5, 3, 2], [4, 8, 6, 7], [-1, 0, -2, -3], [10, 12, 9, 11]];

  fn feed_row_major(pool: &mut MaxPool) {
    for r in 0..4 {
      for c in 0..4 {
        pool.push(PoolIn { value: GRID[r][c], row: r, col: c }).unwrap();
      }
    }
    pool.finish();
  }

  #[test]
  fn test_whole_grid_filter() {
    let mut pool = MaxPool::new("mp", 4, 4, 4).unwrap();
    feed_row_major(&mut pool);
    assert_eq!(pool.drain(), vec![PoolOut { value: 12, row: 0, col: 0 }]);
    assert!(pool.is_done());
  }

  #[test]
  fn test_two_by_two_tiles_with_base() {
    let mut pool = MaxPool::new("mp", 4, 2, 2).unwrap();
    pool.begin(8, 4);
    feed_row_major(&mut pool);
    let out = pool.drain();
    assert_eq!(
      out,
      vec![
        PoolOut { value: 8, row: 8, col: 4 },
        PoolOut { value: 7, row: 8, col: 6 },
        PoolOut { value: 12, row: 10, col: 4 },
        PoolOut { value: 11, row: 10, col: 6 },
      ]
    );
  }

  #[test]
  fn test_emits_as_soon_as_tile_completes() {
    let mut pool = MaxPool::new("mp", 4, 2, 2).unwrap();
    // tile (1, 1) first, column-major inside the tile
    for &(r, c) in &[(2, 2), (3, 2), (2, 3)] {
      pool.push(PoolIn { value: GRID[r][c], row: r, col: c }).unwrap();
      assert_eq!(pool.pending_outputs(), 0);
    }
    pool.push(PoolIn { value: GRID[3][3], row: 3, col: 3 }).unwrap();
    assert_eq!(pool.drain(), vec![PoolOut { value: 11, row: 2, col: 2 }]);
  }

  #[test]
  fn test_wire_interface_one_output_per_cycle() {
    let mut pool = MaxPool::new("mp", 2, 2, 2).unwrap();
    let mut outputs = Vec::new();
    for (i, v) in [3i8, -7, 9, 0].iter().enumerate() {
      pool.input.set(PoolIn { value: *v, row: i / 2, col: i % 2 });
      pool.run();
      if let Some(o) = pool.output.take() {
        outputs.push(o);
      }
    }
    pool.input.clear();
    pool.finish();
    while !pool.is_done() {
      pool.run();
      if let Some(o) = pool.output.take() {
        outputs.push(o);
      }
    }
    assert_eq!(outputs, vec![PoolOut { value: 9, row: 0, col: 0 }]);
  }

  #[test]
  fn test_bad_wire_beat_sets_sticky_error() {
    let mut pool = MaxPool::new("mp", 2, 2, 2).unwrap();
    pool.input.set(PoolIn { value: 1, row: 0, col: 0 });
    pool.run();
    assert!(!pool.has_error());
    // same cell again, then a cell off the grid
    pool.run();
    assert!(pool.has_error());
    pool.input.set(PoolIn { value: 1, row: 0, col: 5 });
    pool.run();
    assert!(pool.has_error());

    pool.input.clear();
    pool.run();
    pool.begin(0, 0);
    assert!(pool.has_error(), "a new grid keeps the flag");
    pool.reset();
    assert!(!pool.has_error());
  }

  #[test]
  fn test_rejects_bad_input() {
    assert!(MaxPool::new("mp", 5, 2, 2).is_err());
    let mut pool = MaxPool::new("mp", 2, 2, 2).unwrap();
    assert!(pool.push(PoolIn { value: 0, row: 2, col: 0 }).is_err());
    pool.push(PoolIn { value: 0, row: 0, col: 0 }).unwrap();
    assert!(pool.push(PoolIn { value: 1, row: 0, col: 0 }).is_err());
  }
}
