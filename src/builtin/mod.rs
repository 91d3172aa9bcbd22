/// Building blocks shared by every datapath unit
pub mod port;

pub use port::Wire;

/// A clocked hardware unit.
///
/// `run` models one rising clock edge: the unit samples its input wires
/// (driven during the previous cycle) and drives its output wires.
/// `reset` returns the unit to its power-on state and must be idempotent.
pub trait Module {
  fn run(&mut self);
  fn reset(&mut self);
  fn name(&self) -> &str;
}
