/// SoftmaxUnit: 10-way fixed-point softmax
///
/// Logits are int8 in Q3.4 (code × 0.0625). β is Q8.8, so β·logit lands
/// in Q.12. exp() is evaluated in Q32 by range reduction against ln 2 and
/// a short Taylor series; probabilities leave as Q1.31.
use super::topology::NUM_CLASSES;
use crate::builtin::Module;
use crate::error::{Result, TpuError};

/// β = 1.0 in Q8.8.
pub const BETA_ONE: i32 = 256;

/// Cycles spent in each of the FIND_MAX, EXP and NORMALIZE phases.
pub const PHASE_CYCLES: u32 = 10;

/// ln 2 in Q32.
const LN2_Q32: i64 = 2_977_044_472;
const ONE_Q32: i128 = 1 << 32;
const TAYLOR_TERMS: i128 = 12;
/// Beyond this many halvings exp() is below one Q32 LSB.
const MAX_HALVINGS: i64 = 40;
/// Q.12 to Q32
const S_TO_Q32: u32 = 20;

/// exp(x) for x <= 0, both in Q32.
fn exp_q32(x: i64) -> u64 {
  debug_assert!(x <= 0);
  let k = (-x) / LN2_Q32;
  if k >= MAX_HALVINGS {
    return 0;
  }
  // r in (-ln2, 0]
  let r = (x + k * LN2_Q32) as i128;
  let mut term = ONE_Q32;
  let mut sum = ONE_Q32;
  for n in 1..=TAYLOR_TERMS {
    term = term * r / (n * ONE_Q32);
    sum += term;
  }
  (sum.max(0) as u64) >> k
}

/// Integer softmax of `logits` at inverse temperature `beta` (Q8.8).
pub fn softmax_q31(logits: &[i8; NUM_CLASSES], beta: i32) -> [i32; NUM_CLASSES] {
  let scaled: Vec<i64> = logits.iter().map(|&l| l as i64 * beta as i64).collect();
  let max = scaled.iter().copied().max().unwrap_or(0);
  let exps: Vec<u64> = scaled.iter().map(|&s| exp_q32((s - max) << S_TO_Q32)).collect();
  normalize(&exps)
}

fn normalize(exps: &[u64]) -> [i32; NUM_CLASSES] {
  let sum: i128 = exps.iter().map(|&e| e as i128).sum();
  let mut probs = [0i32; NUM_CLASSES];
  if sum == 0 {
    return probs;
  }
  for (p, &e) in probs.iter_mut().zip(exps.iter()) {
    let q = ((e as i128) << 31) + sum / 2;
    *p = (q / sum).min(i32::MAX as i128) as i32;
  }
  probs
}

pub fn q31_to_f64(q: i32) -> f64 {
  q as f64 / 2_147_483_648.0
}

/// Highest probability, lowest index on ties.
pub fn argmax(probs: &[i32]) -> usize {
  let mut best = 0;
  for (i, &p) in probs.iter().enumerate() {
    if p > probs[best] {
      best = i;
    }
  }
  best
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftmaxState {
  Idle,
  FindMax,
  Exp,
  Normalize,
  Done,
}

pub struct SoftmaxUnit {
  name: String,
  state: SoftmaxState,
  beta: i32,
  phase_count: u32,

  /// Input logits, latched on start
  pub logits: [i8; NUM_CLASSES],
  latched: [i8; NUM_CLASSES],
  start_pending: bool,

  max_scaled: i64,
  exps: [u64; NUM_CLASSES],
  probabilities: [i32; NUM_CLASSES],

  /// One-cycle completion pulse
  pub done_pulse: bool,
}

impl SoftmaxUnit {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      state: SoftmaxState::Idle,
      beta: BETA_ONE,
      phase_count: 0,
      logits: [0; NUM_CLASSES],
      latched: [0; NUM_CLASSES],
      start_pending: false,
      max_scaled: 0,
      exps: [0; NUM_CLASSES],
      probabilities: [0; NUM_CLASSES],
      done_pulse: false,
    }
  }

  pub fn beta(&self) -> i32 {
    self.beta
  }

  pub fn set_beta(&mut self, beta_q8_8: i32) -> Result<()> {
    if beta_q8_8 <= 0 {
      return Err(TpuError::config(format!("softmax beta {} must be positive", beta_q8_8)));
    }
    if self.busy() {
      return Err(TpuError::config(format!("{}: beta change while busy", self.name)));
    }
    self.beta = beta_q8_8;
    Ok(())
  }

  pub fn state(&self) -> SoftmaxState {
    self.state
  }

  fn busy(&self) -> bool {
    matches!(self.state, SoftmaxState::FindMax | SoftmaxState::Exp | SoftmaxState::Normalize)
  }

  /// High when a new start will be accepted.
  pub fn ready(&self) -> bool {
    !self.busy() && !self.start_pending
  }

  /// High from completion until the next start.
  pub fn valid(&self) -> bool {
    self.state == SoftmaxState::Done
  }

  pub fn probabilities(&self) -> [i32; NUM_CLASSES] {
    self.probabilities
  }

  pub fn start(&mut self) -> Result<()> {
    if !self.ready() {
      return Err(TpuError::config(format!("{}: start while busy", self.name)));
    }
    self.start_pending = true;
    Ok(())
  }

  /// Start, then clock until the completion pulse.
  pub fn run_to_completion(&mut self) -> Result<[i32; NUM_CLASSES]> {
    self.start()?;
    let bound = 3 * PHASE_CYCLES + 2;
    for _ in 0..bound {
      self.run();
      if self.done_pulse {
        return Ok(self.probabilities);
      }
    }
    Err(TpuError::config(format!("{}: no completion in {} cycles", self.name, bound)))
  }

  fn enter(&mut self, state: SoftmaxState) {
    self.state = state;
    self.phase_count = 0;
  }
}

impl Module for SoftmaxUnit {
  fn run(&mut self) {
    self.done_pulse = false;
    match self.state {
      SoftmaxState::Idle | SoftmaxState::Done => {
        if self.start_pending {
          self.start_pending = false;
          self.latched = self.logits;
          self.enter(SoftmaxState::FindMax);
        }
      },
      SoftmaxState::FindMax => {
        self.phase_count += 1;
        if self.phase_count == PHASE_CYCLES {
          self.max_scaled = self.latched.iter().map(|&l| l as i64 * self.beta as i64).max().unwrap_or(0);
          self.enter(SoftmaxState::Exp);
        }
      },
      SoftmaxState::Exp => {
        self.phase_count += 1;
        if self.phase_count == PHASE_CYCLES {
          for (e, &l) in self.exps.iter_mut().zip(self.latched.iter()) {
            let d = l as i64 * self.beta as i64 - self.max_scaled;
            *e = exp_q32(d << S_TO_Q32);
          }
          self.enter(SoftmaxState::Normalize);
        }
      },
      SoftmaxState::Normalize => {
        self.phase_count += 1;
        if self.phase_count == PHASE_CYCLES {
          self.probabilities = normalize(&self.exps);
          self.enter(SoftmaxState::Done);
          self.done_pulse = true;
          log::trace!("{}: done, argmax {}", self.name, argmax(&self.probabilities));
        }
      },
    }
  }

  fn reset(&mut self) {
    *self = Self::new(std::mem::take(&mut self.name));
  }

  fn name(&self) -> &str {
    &self.name
  }
}
