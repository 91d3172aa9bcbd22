/// Array output buffer: small FIFO between the MAC grid and the requantizer
///
/// The grid hands over one row of accumulators per cycle on four parallel
/// write ports; the requantizer takes one beat per cycle. Each beat keeps the
/// grid coordinate of the cell it came from.
use super::requantize::RequantIn;
use super::systolic_array::ARRAY;
use crate::builtin::{Module, Wire};
use std::collections::VecDeque;

/// Entries the FIFO can hold.
pub const OUTPUT_BUFFER_DEPTH: usize = 4;

pub struct ArrayOutputBuffer {
  name: String,
  fifo: VecDeque<RequantIn>,

  /// Write ports, sampled in port order.
  pub input: [Wire<RequantIn>; ARRAY],
  /// Downstream is ready for a beat this cycle.
  pub consume: bool,
  pub output: Wire<RequantIn>,

  overflow: bool,
}

impl ArrayOutputBuffer {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      fifo: VecDeque::with_capacity(OUTPUT_BUFFER_DEPTH),
      input: std::array::from_fn(|_| Wire::default()),
      consume: false,
      output: Wire::default(),
      overflow: false,
    }
  }

  pub fn len(&self) -> usize {
    self.fifo.len()
  }

  pub fn is_empty(&self) -> bool {
    self.fifo.is_empty()
  }

  /// Whether `writes` beats can be taken on the next edge, counting the
  /// slot freed by a consume on that same edge.
  pub fn can_accept(&self, writes: usize) -> bool {
    let leaving = usize::from(self.consume && !self.fifo.is_empty());
    self.fifo.len() - leaving + writes <= OUTPUT_BUFFER_DEPTH
  }

  /// A write arrived while the FIFO was full; sticky until reset.
  pub fn overflowed(&self) -> bool {
    self.overflow
  }
}

impl Module for ArrayOutputBuffer {
  fn run(&mut self) {
    let head = if self.consume { self.fifo.pop_front() } else { None };

    for port in self.input.iter() {
      if let Some(beat) = port.take() {
        if self.fifo.len() < OUTPUT_BUFFER_DEPTH {
          self.fifo.push_back(beat);
        } else {
          log::error!("{}: write of ({}, {}) dropped, buffer full", self.name, beat.row, beat.col);
          self.overflow = true;
        }
      }
    }

    // an empty buffer passes a same-cycle write straight through
    let out = match head {
      Some(beat) => Some(beat),
      None if self.consume => self.fifo.pop_front(),
      None => None,
    };
    match out {
      Some(beat) => self.output.set(beat),
      None => self.output.clear(),
    }
  }

  fn reset(&mut self) {
    self.fifo.clear();
    self.input = std::array::from_fn(|_| Wire::default());
    self.consume = false;
    self.output = Wire::default();
    self.overflow = false;
  }

  fn name(&self) -> &str {
    &self.name
  }
}
