// Tiled MAC grid for the convolution stages.
// Row i of the grid serves one output position, column j one output
// channel; each cell folds a 4-lane channel dot product into its
// accumulator every cycle.

use crate::builtin::{Module, Wire};
use crate::memdomain::{PixelWord, LANES};

/// Grid side.
pub const ARRAY: usize = 4;

pub type AccTile = [[i32; ARRAY]; ARRAY];

fn dot(a: &PixelWord, b: &PixelWord) -> i32 {
  a.iter().zip(b.iter()).map(|(&x, &y)| x as i32 * y as i32).sum()
}

// ===========================================
// Processing Element (PE)
// ===========================================

/// Processing element: one int32 accumulator fed by a 4-wide dot product.
#[derive(Debug, Clone, Default)]
pub struct ProcessingElement {
  /// Row operand (patch lanes)
  a_in: PixelWord,
  /// Column operand (weight lanes)
  b_in: PixelWord,
  acc: i32,
  row: usize,
  col: usize,
}

impl ProcessingElement {
  pub fn new(row: usize, col: usize) -> Self {
    Self {
      a_in: [0; LANES],
      b_in: [0; LANES],
      acc: 0,
      row,
      col,
    }
  }

  /// A operand forwarded to the right neighbour.
  pub fn get_a_right(&self) -> PixelWord {
    self.a_in
  }

  /// B operand forwarded to the bottom neighbour.
  pub fn get_b_down(&self) -> PixelWord {
    self.b_in
  }

  pub fn set_inputs(&mut self, a: PixelWord, b: PixelWord) {
    self.a_in = a;
    self.b_in = b;
  }

  /// Accumulator value after this cycle's control, without committing it.
  pub fn next_acc(&self, control: CellControl, bias: i32, partial: i32) -> i32 {
    if control.reset {
      0
    } else if control.load_bias {
      bias
    } else if control.load_sum {
      partial
    } else {
      self.acc.wrapping_add(dot(&self.a_in, &self.b_in))
    }
  }

  /// acc += dot(a_in, b_in)
  pub fn compute(&mut self) {
    self.acc = self.next_acc(CellControl::default(), 0, 0);
  }

  pub fn get_result(&self) -> i32 {
    self.acc
  }

  fn commit(&mut self, acc: i32) {
    self.acc = acc;
  }

  pub fn reset(&mut self) {
    self.a_in = [0; LANES];
    self.b_in = [0; LANES];
    self.acc = 0;
  }

  pub fn row(&self) -> usize {
    self.row
  }

  pub fn col(&self) -> usize {
    self.col
  }
}

// ===========================================
// Array control
// ===========================================

/// Per-cell control. Priority: reset > load_bias > load_sum > MAC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellControl {
  pub reset: bool,
  pub load_bias: bool,
  pub load_sum: bool,
}

impl CellControl {
  pub const MAC: CellControl = CellControl {
    reset: false,
    load_bias: false,
    load_sum: false,
  };
  pub const RESET: CellControl = CellControl {
    reset: true,
    load_bias: false,
    load_sum: false,
  };
  pub const LOAD_BIAS: CellControl = CellControl {
    reset: false,
    load_bias: true,
    load_sum: false,
  };
  pub const LOAD_SUM: CellControl = CellControl {
    reset: false,
    load_bias: false,
    load_sum: true,
  };
}

/// Everything the grid samples on one clock edge.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayStep {
  /// A_i, one per row
  pub a: [PixelWord; ARRAY],
  /// B_j, one per column
  pub b: [PixelWord; ARRAY],
  pub control: [[CellControl; ARRAY]; ARRAY],
  /// Bias per cell, used by load_bias
  pub bias: AccTile,
  /// Partial sums per cell, used by load_sum
  pub partial: AccTile,
}

impl Default for ArrayStep {
  fn default() -> Self {
    Self {
      a: [[0; LANES]; ARRAY],
      b: [[0; LANES]; ARRAY],
      control: [[CellControl::MAC; ARRAY]; ARRAY],
      bias: [[0; ARRAY]; ARRAY],
      partial: [[0; ARRAY]; ARRAY],
    }
  }
}

impl ArrayStep {
  pub fn mac(a: [PixelWord; ARRAY], b: [PixelWord; ARRAY]) -> Self {
    Self { a, b, ..Self::default() }
  }

  pub fn uniform(control: CellControl) -> Self {
    Self {
      control: [[control; ARRAY]; ARRAY],
      ..Self::default()
    }
  }

  pub fn load_bias(bias: AccTile) -> Self {
    Self {
      bias,
      ..Self::uniform(CellControl::LOAD_BIAS)
    }
  }

  pub fn load_sum(partial: AccTile) -> Self {
    Self {
      partial,
      ..Self::uniform(CellControl::LOAD_SUM)
    }
  }
}

// ===========================================
// MAC grid
// ===========================================

/// 4×4 grid of accumulator cells.
///
/// Every edge is two-phase: all sixteen next values are computed from the
/// current state, then committed together.
pub struct SystolicMacArray {
  name: String,
  pe_grid: Vec<Vec<ProcessingElement>>,

  pub input: Wire<ArrayStep>,

  mac_cycles: u64,
}

impl SystolicMacArray {
  pub fn new(name: impl Into<String>) -> Self {
    let pe_grid = (0..ARRAY)
      .map(|i| (0..ARRAY).map(|j| ProcessingElement::new(i, j)).collect())
      .collect();
    Self {
      name: name.into(),
      pe_grid,
      input: Wire::new(ArrayStep::default()),
      mac_cycles: 0,
    }
  }

  /// Clock one step directly, bypassing the input register.
  pub fn step(&mut self, step: &ArrayStep) {
    // A_i reaches every cell of row i and B_j every cell of column j on the
    // same edge, so latch order does not matter
    for (i, row) in self.pe_grid.iter_mut().enumerate() {
      for (j, pe) in row.iter_mut().enumerate() {
        pe.set_inputs(step.a[i], step.b[j]);
      }
    }

    let mut next = [[0i32; ARRAY]; ARRAY];
    let mut any_mac = false;
    for i in 0..ARRAY {
      for j in 0..ARRAY {
        let ctl = step.control[i][j];
        any_mac |= ctl == CellControl::MAC;
        next[i][j] = self.pe_grid[i][j].next_acc(ctl, step.bias[i][j], step.partial[i][j]);
      }
    }
    for i in 0..ARRAY {
      for j in 0..ARRAY {
        self.pe_grid[i][j].commit(next[i][j]);
      }
    }
    if any_mac {
      self.mac_cycles += 1;
    }
  }

  /// C(i, j)
  pub fn result(&self, row: usize, col: usize) -> i32 {
    self.pe_grid[row][col].get_result()
  }

  pub fn results(&self) -> AccTile {
    let mut out = [[0; ARRAY]; ARRAY];
    for (i, row) in out.iter_mut().enumerate() {
      for (j, v) in row.iter_mut().enumerate() {
        *v = self.result(i, j);
      }
    }
    out
  }

  pub fn mac_cycles(&self) -> u64 {
    self.mac_cycles
  }
}

impl Module for SystolicMacArray {
  fn run(&mut self) {
    if let Some(step) = self.input.take() {
      self.step(&step);
    }
  }

  fn reset(&mut self) {
    for row in self.pe_grid.iter_mut() {
      for pe in row.iter_mut() {
        pe.reset();
      }
    }
    self.input = Wire::new(ArrayStep::default());
    self.mac_cycles = 0;
  }

  fn name(&self) -> &str {
    &self.name
  }
}
