/// DenseEngine: sequenced vector-matrix MAC for the fully connected layers
///
/// One output neuron at a time: load its bias, then for every input fetch
/// the activation and weight and accumulate, then present the result.
/// Outputs therefore appear in strictly ascending order.
use super::topology::{DENSE_MAX_INPUTS, DENSE_MAX_OUTPUTS};
use crate::builtin::Wire;
use crate::error::{Result, TpuError};

/// Read side of the three stores the engine walks.
pub trait DenseMemory {
  fn input(&self, idx: usize) -> i8;
  /// Weight at `input_idx * output_size + output_idx`.
  fn weight(&self, addr: usize) -> i8;
  fn bias(&self, idx: usize) -> i32;
}

/// Slice-backed operands. Reads past a slice return 0.
pub struct DenseSlices<'a> {
  pub input: &'a [i8],
  pub weights: &'a [i8],
  pub biases: &'a [i32],
}

impl DenseMemory for DenseSlices<'_> {
  fn input(&self, idx: usize) -> i8 {
    self.input.get(idx).copied().unwrap_or(0)
  }

  fn weight(&self, addr: usize) -> i8 {
    self.weights.get(addr).copied().unwrap_or(0)
  }

  fn bias(&self, idx: usize) -> i32 {
    self.biases.get(idx).copied().unwrap_or(0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenseState {
  Idle,
  LoadBias,
  LoadData,
  ComputeMac,
  OutputReady,
  Complete,
}

/// One finished neuron.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DenseOut {
  pub index: usize,
  pub value: i32,
}

pub struct DenseEngine {
  name: String,
  state: DenseState,
  input_size: usize,
  output_size: usize,
  start_pending: bool,

  out_idx: usize,
  in_idx: usize,
  acc: i32,
  x_reg: i8,
  w_reg: i8,
  outputs: [i32; DENSE_MAX_OUTPUTS],

  /// Pulses for one cycle per finished neuron
  pub output: Wire<DenseOut>,
  cycles: u64,
}

impl DenseEngine {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      state: DenseState::Idle,
      input_size: 1,
      output_size: 1,
      start_pending: false,
      out_idx: 0,
      in_idx: 0,
      acc: 0,
      x_reg: 0,
      w_reg: 0,
      outputs: [0; DENSE_MAX_OUTPUTS],
      output: Wire::default(),
      cycles: 0,
    }
  }

  pub fn state(&self) -> DenseState {
    self.state
  }

  pub fn current_input_size(&self) -> usize {
    self.input_size
  }

  pub fn current_output_size(&self) -> usize {
    self.output_size
  }

  pub fn is_idle(&self) -> bool {
    matches!(self.state, DenseState::Idle | DenseState::Complete)
  }

  /// Level signal, high from completion until the next start or reset.
  pub fn computation_complete(&self) -> bool {
    self.state == DenseState::Complete
  }

  pub fn configure(&mut self, input_size: usize, output_size: usize) -> Result<()> {
    if !self.is_idle() {
      return Err(TpuError::config(format!(
        "{}: reconfiguration while {:?}",
        self.name, self.state
      )));
    }
    if input_size == 0 || input_size > DENSE_MAX_INPUTS {
      return Err(TpuError::config(format!(
        "input size {} outside 1..={}",
        input_size, DENSE_MAX_INPUTS
      )));
    }
    if output_size == 0 || output_size > DENSE_MAX_OUTPUTS {
      return Err(TpuError::config(format!(
        "output size {} outside 1..={}",
        output_size, DENSE_MAX_OUTPUTS
      )));
    }
    self.input_size = input_size;
    self.output_size = output_size;
    self.state = DenseState::Idle;
    log::debug!("{}: configured {} -> {}", self.name, input_size, output_size);
    Ok(())
  }

  /// Start pulse, sampled on the next clock.
  pub fn start(&mut self) -> Result<()> {
    if !self.is_idle() {
      return Err(TpuError::config(format!("{}: start while {:?}", self.name, self.state)));
    }
    self.start_pending = true;
    Ok(())
  }

  /// Result slot `o`. Slots at or past the configured output size read 0.
  pub fn output_at(&self, o: usize) -> i32 {
    if o < self.output_size {
      self.outputs[o]
    } else {
      0
    }
  }

  pub fn outputs(&self) -> Vec<i32> {
    self.outputs[..self.output_size].to_vec()
  }

  pub fn cycles(&self) -> u64 {
    self.cycles
  }

  /// One clock edge against `mem`.
  pub fn clock(&mut self, mem: &dyn DenseMemory) {
    self.output.clear();
    if self.state != DenseState::Idle && self.state != DenseState::Complete {
      self.cycles += 1;
    }
    match self.state {
      DenseState::Idle | DenseState::Complete => {
        if self.start_pending {
          self.start_pending = false;
          self.outputs = [0; DENSE_MAX_OUTPUTS];
          self.out_idx = 0;
          self.cycles = 0;
          self.state = DenseState::LoadBias;
        }
      },
      DenseState::LoadBias => {
        self.acc = mem.bias(self.out_idx);
        self.in_idx = 0;
        self.state = DenseState::LoadData;
      },
      DenseState::LoadData => {
        self.x_reg = mem.input(self.in_idx);
        self.w_reg = mem.weight(self.in_idx * self.output_size + self.out_idx);
        self.state = DenseState::ComputeMac;
      },
      DenseState::ComputeMac => {
        self.acc = self.acc.wrapping_add(self.x_reg as i32 * self.w_reg as i32);
        self.in_idx += 1;
        self.state = if self.in_idx < self.input_size {
          DenseState::LoadData
        } else {
          DenseState::OutputReady
        };
      },
      DenseState::OutputReady => {
        self.outputs[self.out_idx] = self.acc;
        self.output.set(DenseOut {
          index: self.out_idx,
          value: self.acc,
        });
        self.out_idx += 1;
        if self.out_idx < self.output_size {
          self.state = DenseState::LoadBias;
        } else {
          self.state = DenseState::Complete;
          log::trace!("{}: complete after {} cycles", self.name, self.cycles);
        }
      },
    }
  }

  /// Start and clock until complete, collecting outputs as they are presented.
  pub fn run_to_completion(&mut self, mem: &dyn DenseMemory) -> Result<Vec<DenseOut>> {
    self.start()?;
    let bound = 2 + self.output_size * (2 + 2 * self.input_size) + 1;
    let mut seen = Vec::with_capacity(self.output_size);
    let mut ticks = 0;
    loop {
      self.clock(mem);
      if let Some(out) = self.output.take() {
        seen.push(out);
      }
      if self.computation_complete() && !self.start_pending {
        break;
      }
      ticks += 1;
      if ticks > bound {
        return Err(TpuError::config(format!("{}: did not complete in {} cycles", self.name, bound)));
      }
    }
    Ok(seen)
  }

  pub fn reset(&mut self) {
    self.state = DenseState::Idle;
    self.start_pending = false;
    self.out_idx = 0;
    self.in_idx = 0;
    self.acc = 0;
    self.x_reg = 0;
    self.w_reg = 0;
    self.outputs = [0; DENSE_MAX_OUTPUTS];
    self.output = Wire::default();
    self.cycles = 0;
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn run(engine: &mut DenseEngine, input: &[i8], weights: &[i8], biases: &[i32]) -> Vec<DenseOut> {
    engine.configure(input.len(), biases.len()).unwrap();
    let mem = DenseSlices { input, weights, biases };
    engine.run_to_completion(&mem).unwrap()
  }

  #[test]
  fn test_single_output() {
    let mut engine = DenseEngine::new("dense");
    let out = run(&mut engine, &[3, 4], &[2, 1], &[5]);
    assert_eq!(out, vec![DenseOut { index: 0, value: 15 }]);
  }

  #[test]
  fn test_outputs_ascending() {
    let mut engine = DenseEngine::new("dense");
    // weight[i * 2 + o]: column o=0 is (1, 2), column o=1 is (3, 4)
    let out = run(&mut engine, &[1, 2], &[1, 3, 2, 4], &[10, 20]);
    assert_eq!(
      out,
      vec![DenseOut { index: 0, value: 15 }, DenseOut { index: 1, value: 31 }]
    );
  }

  #[test]
  fn test_four_by_three() {
    let mut engine = DenseEngine::new("dense");
    let weights = [1, 2, 0, 1, 1, 1, 1, 0, 2, 1, -1, 1];
    run(&mut engine, &[1, 2, 3, 4], &weights, &[5, -3, 7]);
    assert_eq!(engine.outputs(), vec![15, -3, 19]);
    assert_eq!(engine.output_at(3), 0);
    assert_eq!(engine.output_at(63), 0);
  }

  #[test]
  fn test_full_capacity_all_ones() {
    let mut engine = DenseEngine::new("dense");
    let input = vec![1i8; 256];
    let weights = vec![1i8; 256 * 64];
    let biases = vec![0i32; 64];
    let out = run(&mut engine, &input, &weights, &biases);
    assert_eq!(out.len(), 64);
    assert!(out.iter().all(|o| o.value == 256));
    assert_eq!(engine.current_input_size(), 256);
    assert_eq!(engine.current_output_size(), 64);

    // reconfigure the same engine for the classifier shape
    let out = run(&mut engine, &vec![1i8; 64], &vec![1i8; 640], &vec![0; 10]);
    assert_eq!(out.len(), 10);
    assert!(out.iter().all(|o| o.value == 64));
    assert_eq!(engine.output_at(10), 0, "slot past the new size");
  }

  #[test]
  fn test_reconfigure_only_when_idle() {
    let mut engine = DenseEngine::new("dense");
    engine.configure(2, 1).unwrap();
    engine.start().unwrap();
    let mem = DenseSlices {
      input: &[1, 1],
      weights: &[1, 1],
      biases: &[0],
    };
    engine.clock(&mem);
    assert_eq!(engine.state(), DenseState::LoadBias);
    assert!(engine.configure(4, 4).is_err());
    assert!(engine.start().is_err());
    assert_eq!(engine.current_input_size(), 2);

    engine.reset();
    assert!(engine.configure(4, 4).is_ok());
  }

  #[test]
  fn test_rejects_sizes() {
    let mut engine = DenseEngine::new("dense");
    assert!(engine.configure(0, 4).is_err());
    assert!(engine.configure(257, 4).is_err());
    assert!(engine.configure(4, 65).is_err());
    assert!(engine.configure(4, 0).is_err());
  }

  #[test]
  fn test_state_sequence() {
    let mut engine = DenseEngine::new("dense");
    engine.configure(1, 1).unwrap();
    engine.start().unwrap();
    let mem = DenseSlices {
      input: &[2],
      weights: &[3],
      biases: &[1],
    };
    let mut states = Vec::new();
    for _ in 0..5 {
      engine.clock(&mem);
      states.push(engine.state());
    }
    assert_eq!(
      states,
      vec![
        DenseState::LoadBias,
        DenseState::LoadData,
        DenseState::ComputeMac,
        DenseState::OutputReady,
        DenseState::Complete
      ]
    );
    assert_eq!(engine.output_at(0), 7);
  }
}
