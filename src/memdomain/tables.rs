/// The parameter tables one inference needs, loaded together.
use super::hex;
use super::rom::{BiasRom, QuantRom, WeightRom};
use crate::arch::tinytpu::requantize::{QuantParams, MULTIPLIER_MIN};
use crate::arch::tinytpu::topology::{NetworkShape, QUANT_ENTRIES};
use crate::error::{Result, TpuError};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Record width of one quant ROM line.
pub const QUANT_RECORD_BITS: u32 = 38;

/// How bias words are laid out in the bias table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiasFormat {
  /// Four single-byte records per word, little-endian.
  #[default]
  Bytes,
  /// One 32-bit word per line.
  Words,
}

#[derive(Debug, Clone, Default)]
pub struct ModelTables {
  pub weights: WeightRom,
  pub biases: BiasRom,
  pub quant: QuantRom,
}

impl ModelTables {
  pub fn load(weights: &Path, biases: &Path, quant: &Path, bias_format: BiasFormat) -> Result<Self> {
    let weights = WeightRom::from_bytes(&hex::read_bytes(weights)?);
    let biases = match bias_format {
      BiasFormat::Bytes => BiasRom::from_le_bytes(&hex::read_bytes(biases)?)?,
      BiasFormat::Words => BiasRom::from_words(&hex::read_words(biases, 32)?)?,
    };
    let quant = QuantRom::from_records(&hex::read_words(quant, QUANT_RECORD_BITS)?)?;
    log::info!(
      "loaded tables: {} weight bytes, {} bias words, {} quant entries",
      weights.len(),
      biases.len(),
      quant.len()
    );
    Ok(Self { weights, biases, quant })
  }

  /// Check every table against what `shape` will address.
  pub fn validate(&self, shape: &NetworkShape) -> Result<()> {
    for layer in shape.conv_layers() {
      let what = format!("conv{}", layer.index + 1);
      self.weights.check_region(layer.weight_offset, layer.weight_len(), &what)?;
      self.biases.check_region(layer.bias_offset, layer.out_channels, &what)?;
    }
    for layer in shape.dense_layers() {
      let what = format!("dense{}", layer.index + 1);
      self.weights.check_region(layer.weight_offset, layer.weight_len(), &what)?;
      self.biases.check_region(layer.bias_offset, layer.output_size, &what)?;
    }
    if self.quant.len() != QUANT_ENTRIES {
      return Err(TpuError::validation(format!(
        "quant ROM holds {} entries, expected {}",
        self.quant.len(),
        QUANT_ENTRIES
      )));
    }
    if self.weights.len() != shape.total_weights() {
      log::warn!(
        "weight store holds {} bytes, network addresses {}",
        self.weights.len(),
        shape.total_weights()
      );
    }
    Ok(())
  }

  /// Deterministic small-magnitude tables for a given shape, used by
  /// bring-up runs when no table files are configured.
  pub fn synthetic(shape: &NetworkShape, seed: u64) -> Self {
    let mut rng = Pcg64::seed_from_u64(seed);
    let weights = (0..shape.total_weights()).map(|_| rng.gen_range(-3i8..=3)).collect();
    let biases = (0..shape.total_biases()).map(|_| rng.gen_range(-100i32..=100)).collect();
    // conv layers scale 2^-6, dense layers 2^-5
    let quant = (0..QUANT_ENTRIES)
      .map(|i| QuantParams {
        multiplier: MULTIPLIER_MIN,
        shift: if i < QUANT_ENTRIES - 2 { 5 } else { 4 },
      })
      .collect();
    Self {
      weights: WeightRom::new(weights),
      biases: BiasRom::new(biases),
      quant: QuantRom::new(quant),
    }
  }
}

/// Channel-last input image for `shape`, one hex byte per value.
pub fn load_image(path: &Path, shape: &NetworkShape) -> Result<Vec<i8>> {
  let bytes = hex::read_bytes(path)?;
  let expected = shape.input_height * shape.input_width * shape.input_channels;
  if bytes.len() != expected {
    return Err(TpuError::validation(format!(
      "{}: image holds {} values, input is {}x{}x{}",
      path.display(),
      bytes.len(),
      shape.input_height,
      shape.input_width,
      shape.input_channels
    )));
  }
  Ok(bytes.into_iter().map(|b| b as i8).collect())
}

/// Pseudo-random test image covering the full int8 range.
pub fn synthetic_image(shape: &NetworkShape, seed: u64) -> Vec<i8> {
  let mut rng = Pcg64::seed_from_u64(seed.wrapping_add(0x5851_f42d_4c95_7f2d));
  let len = shape.input_height * shape.input_width * shape.input_channels;
  (0..len).map(|_| rng.gen::<i8>()).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_synthetic_tables_validate() {
    let shape = NetworkShape::default();
    let tables = ModelTables::synthetic(&shape, 7);
    tables.validate(&shape).unwrap();
    assert_eq!(tables.weights.len(), shape.total_weights());
    let again = ModelTables::synthetic(&shape, 7);
    assert_eq!(tables.weights.as_bytes(), again.weights.as_bytes(), "same seed, same tables");
    assert!(tables.weights.as_bytes().iter().all(|&w| (-3..=3).contains(&(w as i8))));
    let other = ModelTables::synthetic(&shape, 8);
    assert_ne!(tables.weights.as_bytes(), other.weights.as_bytes());
  }

  #[test]
  fn test_image_helpers() {
    let shape = NetworkShape::default();
    let image = synthetic_image(&shape, 2);
    assert_eq!(image.len(), 32 * 32);
    assert_eq!(image, synthetic_image(&shape, 2));
    assert!(image.iter().any(|&v| v < 0) && image.iter().any(|&v| v > 0));

    let dir = std::env::temp_dir().join(format!("tinytpu-image-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("short.hex");
    std::fs::write(&path, "ff\n01\n").unwrap();
    assert!(load_image(&path, &shape).is_err());

    let text: String = image.iter().map(|&v| format!("{:02x}\n", v as u8)).collect();
    std::fs::write(&path, text).unwrap();
    assert_eq!(load_image(&path, &shape).unwrap(), image);
    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn test_short_tables_rejected() {
    let shape = NetworkShape::default();
    let mut tables = ModelTables::synthetic(&shape, 1);
    tables.quant = QuantRom::new(vec![]);
    assert!(tables.validate(&shape).is_err());

    let mut tables = ModelTables::synthetic(&shape, 1);
    tables.biases = BiasRom::new(vec![0; 10]);
    assert!(tables.validate(&shape).is_err());
  }
}
