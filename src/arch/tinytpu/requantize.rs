/// Requantizer: int32 accumulator to int8 activation
///
/// The rescale is the fixed-point `MultiplyByQuantizedMultiplier` used by
/// int8 inference runtimes: a Q31 multiply with a 2^30 rounding bias,
/// followed by a signed power-of-two shift, the layer zero point and a
/// clamp to `[qmin, qmax]`. Clamping at the activation range is what
/// realises ReLU6 in the quantized domain.
use crate::builtin::{Module, Wire};
use crate::error::{Result, TpuError};
use serde::{Deserialize, Serialize};

pub const QMIN_DEFAULT: i32 = -128;
pub const QMAX_DEFAULT: i32 = 127;

/// Zero point applied to every layer that feeds another int8 layer.
pub const ZP_NORMALIZED: i32 = -128;
/// Zero point applied to the classifier logits.
pub const ZP_SPECIAL: i32 = -1;

/// Smallest legal normalized multiplier (0.5 in Q31).
pub const MULTIPLIER_MIN: i32 = 1 << 30;
pub const SHIFT_MIN: i32 = -32;
pub const SHIFT_MAX: i32 = 31;

const SHIFT_FIELD_BITS: u32 = 6;
const RECORD_BITS: u32 = 32 + SHIFT_FIELD_BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZeroPoint {
  Normalized,
  Special,
}

impl ZeroPoint {
  pub fn value(self) -> i32 {
    match self {
      ZeroPoint::Normalized => ZP_NORMALIZED,
      ZeroPoint::Special => ZP_SPECIAL,
    }
  }
}

/// Per-layer quantization parameters: `scale ~= multiplier * 2^-31 * 2^-shift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantParams {
  pub multiplier: i32,
  pub shift: i32,
}

impl QuantParams {
  /// Checked constructor. A non-positive multiplier is what a scale <= 0
  /// turns into upstream, so it is rejected here along with any
  /// multiplier below the normalized range.
  pub fn new(multiplier: i32, shift: i32) -> Result<Self> {
    if multiplier < MULTIPLIER_MIN {
      return Err(TpuError::validation(format!(
        "quant multiplier 0x{:08x} outside [2^30, 2^31-1]",
        multiplier as u32
      )));
    }
    if !(SHIFT_MIN..=SHIFT_MAX).contains(&shift) {
      return Err(TpuError::validation(format!(
        "quant shift {} outside [{}, {}]",
        shift, SHIFT_MIN, SHIFT_MAX
      )));
    }
    Ok(Self { multiplier, shift })
  }

  /// Unpack a 38-bit ROM record: bits[37:32] shift, bits[31:0] multiplier.
  pub fn decode(record: u64) -> Result<Self> {
    if record >> RECORD_BITS != 0 {
      return Err(TpuError::validation(format!("quant record 0x{:x} wider than 38 bits", record)));
    }
    let raw_shift = ((record >> 32) & 0x3f) as i32;
    let shift = (raw_shift << (32 - SHIFT_FIELD_BITS)) >> (32 - SHIFT_FIELD_BITS);
    let multiplier = (record & 0xffff_ffff) as u32 as i32;
    Self::new(multiplier, shift)
  }

  pub fn encode(&self) -> u64 {
    (((self.shift as u64) & 0x3f) << 32) | (self.multiplier as u32 as u64)
  }
}

/// Bit-exact fixed-point rescale of `acc` by `multiplier * 2^-31 * 2^-shift`.
///
/// Accepts any multiplier and shift, including the out-of-range ones the
/// checked constructor refuses; negative shifts wrap at 32 bits.
pub fn multiply_by_quantized_multiplier(acc: i32, multiplier: i32, shift: i32) -> i32 {
  let prod = acc as i64 * multiplier as i64;
  let rounded = prod + (1i64 << 30);
  let tmp = (rounded >> 31) as i32;
  if shift > 0 {
    tmp >> shift.min(31)
  } else if shift < 0 {
    ((tmp as i64) << (-shift).min(63)) as i32
  } else {
    tmp
  }
}

/// Full requantize: rescale, add the zero point (wrapping at 32 bits) and clamp.
pub fn requantize(acc: i32, multiplier: i32, shift: i32, zero_point: i32, qmin: i32, qmax: i32) -> i8 {
  let scaled = multiply_by_quantized_multiplier(acc, multiplier, shift);
  let with_zp = scaled.wrapping_add(zero_point);
  if with_zp < qmin {
    qmin as i8
  } else if with_zp > qmax {
    qmax as i8
  } else {
    with_zp as i8
  }
}

/// Input beat of the requantizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequantIn {
  pub acc: i32,
  pub row: usize,
  pub col: usize,
}

/// Output beat: the activation plus the coordinates it travelled with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequantOut {
  pub value: i8,
  pub row: usize,
  pub col: usize,
}

/// Single-stage pipelined requantizer.
pub struct Requantizer {
  name: String,
  params: QuantParams,
  zero_point: ZeroPoint,
  qmin: i32,
  qmax: i32,

  pub input: Wire<RequantIn>,
  pub output: Wire<RequantOut>,
}

impl Requantizer {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      params: QuantParams {
        multiplier: MULTIPLIER_MIN,
        shift: 0,
      },
      zero_point: ZeroPoint::Normalized,
      qmin: QMIN_DEFAULT,
      qmax: QMAX_DEFAULT,
      input: Wire::default(),
      output: Wire::default(),
    }
  }

  pub fn with_clamp(mut self, qmin: i32, qmax: i32) -> Result<Self> {
    if qmin > qmax || qmin < i8::MIN as i32 || qmax > i8::MAX as i32 {
      return Err(TpuError::config(format!("clamp range [{}, {}] is not an int8 range", qmin, qmax)));
    }
    self.qmin = qmin;
    self.qmax = qmax;
    Ok(self)
  }

  /// Latch the parameters for the next layer.
  pub fn configure(&mut self, params: QuantParams, zero_point: ZeroPoint) {
    self.params = params;
    self.zero_point = zero_point;
  }

  pub fn params(&self) -> QuantParams {
    self.params
  }

  /// Combinational path, for callers that do not need the pipeline register.
  pub fn apply(&self, acc: i32) -> i8 {
    requantize(
      acc,
      self.params.multiplier,
      self.params.shift,
      self.zero_point.value(),
      self.qmin,
      self.qmax,
    )
  }
}

impl Module for Requantizer {
  fn run(&mut self) {
    match self.input.take() {
      Some(beat) => self.output.set(RequantOut {
        value: self.apply(beat.acc),
        row: beat.row,
        col: beat.col,
      }),
      None => self.output.clear(),
    }
  }

  fn reset(&mut self) {
    self.input = Wire::default();
    self.output = Wire::default();
  }

  fn name(&self) -> &str {
    &self.name
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::{Rng, SeedableRng};
  use rand_pcg::Pcg64;

  const Q30: i32 = 1 << 30;

  fn wrap32(x: i128) -> i32 {
    (x & 0xffff_ffff) as u32 as i32
  }

  /// Wide-integer model of the rescale, zero point and clamp.
  fn model(acc: i32, mult: i32, shift: i32, zp: i32, qmin: i32, qmax: i32) -> i8 {
    let tmp = wrap32((acc as i128 * mult as i128 + (1i128 << 30)) >> 31);
    let scaled = if shift >= 0 {
      wrap32((tmp as i128) >> shift)
    } else {
      wrap32((tmp as i128) << -shift)
    };
    let v = wrap32(scaled as i128 + zp as i128);
    v.clamp(qmin, qmax) as i8
  }

  fn rq(acc: i32, mult: i32, shift: i32, zp: ZeroPoint) -> i8 {
    requantize(acc, mult, shift, zp.value(), QMIN_DEFAULT, QMAX_DEFAULT)
  }

  #[test]
  fn test_directed_cases() {
    assert_eq!(rq(0, Q30, 0, ZeroPoint::Normalized), -128, "zero acc");
    assert_eq!(rq(100, Q30, 0, ZeroPoint::Normalized), -78);
    assert_eq!(rq(200, Q30, 1, ZeroPoint::Normalized), -78, "right shift");
    // 26 * 2^30 >> 31 = 13, then << 1
    assert_eq!(rq(25, Q30, -1, ZeroPoint::Normalized), -102, "left shift");
    assert_eq!(rq(-100, Q30, 0, ZeroPoint::Normalized), -128, "clamp low");
    assert_eq!(rq(260, Q30, 0, ZeroPoint::Special), 127, "special zp clamps high");
    assert_eq!(rq(-300, Q30, 0, ZeroPoint::Normalized), -128);
    assert_eq!(rq(510, Q30, 0, ZeroPoint::Normalized), 127, "exactly qmax");
    assert_eq!(rq(256, Q30, 0, ZeroPoint::Normalized), 0);
    assert_eq!(rq(1000, Q30, 31, ZeroPoint::Normalized), -128, "max right shift");
    assert_eq!(rq(1, 1, -31, ZeroPoint::Normalized), -128);
  }

  #[test]
  fn test_rounding_bias_and_wrap() {
    // 3 * 2^30 + 2^30 = 2^32, >> 31 = 2
    assert_eq!(multiply_by_quantized_multiplier(3, Q30, 0), 2);
    // negative values round toward -inf after the bias
    assert_eq!(multiply_by_quantized_multiplier(-3, Q30, 0), -1);
    // left shift wraps at 32 bits
    assert_eq!(multiply_by_quantized_multiplier(2, Q30, -31), i32::MIN);
    assert_eq!(multiply_by_quantized_multiplier(i32::MAX, i32::MAX, 0), 2147483646);
  }

  #[test]
  fn test_random_full_range_against_wide_model() {
    let mut rng = Pcg64::seed_from_u64(0x7e9a);
    for _ in 0..2000 {
      let acc: i32 = rng.gen();
      let mult: i32 = rng.gen();
      let shift = rng.gen_range(SHIFT_MIN..=SHIFT_MAX);
      let zp = if rng.gen_bool(0.5) { ZP_NORMALIZED } else { ZP_SPECIAL };
      let qmin = rng.gen_range(-128..=127);
      let qmax = rng.gen_range(qmin..=127);
      assert_eq!(
        requantize(acc, mult, shift, zp, qmin, qmax),
        model(acc, mult, shift, zp, qmin, qmax),
        "acc {} mult {} shift {} zp {} clamp [{}, {}]",
        acc,
        mult,
        shift,
        zp,
        qmin,
        qmax
      );
    }
    // corners
    for &acc in &[i32::MIN, -1, 0, 1, i32::MAX] {
      for &mult in &[i32::MIN, -Q30, 0, Q30, i32::MAX] {
        for &shift in &[SHIFT_MIN, -1, 0, 1, SHIFT_MAX] {
          assert_eq!(rq(acc, mult, shift, ZeroPoint::Normalized), model(acc, mult, shift, ZP_NORMALIZED, -128, 127));
        }
      }
    }
  }

  #[test]
  fn test_narrow_clamp() {
    // quantized ReLU6 with 6.0 at code 64
    assert_eq!(requantize(600, Q30, 0, ZP_NORMALIZED, -128, 64), 64);
    assert_eq!(requantize(10, Q30, 0, ZP_NORMALIZED, -128, 64), -123);
  }

  #[test]
  fn test_quant_params_decode() {
    let p = QuantParams::decode(0x3f_4000_0000).unwrap();
    assert_eq!(p.shift, -1);
    assert_eq!(p.multiplier, Q30);
    assert_eq!(p.encode(), 0x3f_4000_0000);

    let p = QuantParams::decode(0x1f_7fff_ffff).unwrap();
    assert_eq!(p.shift, 31);
    assert_eq!(p.multiplier, i32::MAX);

    let p = QuantParams::decode(0x20_4000_0000).unwrap();
    assert_eq!(p.shift, -32);
  }

  #[test]
  fn test_quant_params_reject() {
    assert!(QuantParams::new(0, 0).is_err(), "non-positive scale");
    assert!(QuantParams::new(-Q30, 0).is_err());
    assert!(QuantParams::new(Q30 - 1, 0).is_err());
    assert!(QuantParams::new(Q30, 32).is_err());
    assert!(QuantParams::new(Q30, -33).is_err());
    assert!(QuantParams::decode(1u64 << 38).is_err());
    // multiplier field 0x80000000 is negative as int32
    assert!(QuantParams::decode(0x00_8000_0000).is_err());
  }

  #[test]
  fn test_pipeline_register() {
    let mut unit = Requantizer::new("rq");
    unit.configure(QuantParams::new(Q30, 0).unwrap(), ZeroPoint::Normalized);
    unit.input.set(RequantIn { acc: 256, row: 2, col: 3 });
    unit.run();
    assert_eq!(unit.output.take(), Some(RequantOut { value: 0, row: 2, col: 3 }));
    unit.input.clear();
    unit.run();
    assert!(!unit.output.valid);
  }
}
