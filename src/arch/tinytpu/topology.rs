/// Fixed network topology: four 4×4 conv stages with 2×2 pooling, then
/// flatten, a hidden dense layer and the 10-way classifier.
use super::requantize::ZeroPoint;
use crate::error::{Result, TpuError};
use crate::memdomain::channel_groups;
use serde::{Deserialize, Serialize};

pub const KERNEL: usize = 4;
pub const POOL: usize = 2;

/// "same" padding for an even kernel puts the extra row/column after.
pub const PAD_TOP: usize = 1;
pub const PAD_LEFT: usize = 1;
pub const PAD_BOTTOM: usize = 2;
pub const PAD_RIGHT: usize = 2;

pub const CONV_LAYERS: usize = 4;
pub const NUM_CLASSES: usize = 10;
/// Quant ROM entries: one per conv layer plus two dense layers.
pub const QUANT_ENTRIES: usize = CONV_LAYERS + 2;

pub const DENSE_MAX_INPUTS: usize = 256;
pub const DENSE_MAX_OUTPUTS: usize = 64;

/// Spatial side must survive four 2×2 pools and still tile into 4×4 blocks.
const SPATIAL_ALIGN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkShape {
  pub input_height: usize,
  pub input_width: usize,
  pub input_channels: usize,
  pub conv_channels: [usize; CONV_LAYERS],
  pub hidden_units: usize,
}

impl Default for NetworkShape {
  fn default() -> Self {
    Self {
      input_height: 32,
      input_width: 32,
      input_channels: 1,
      conv_channels: [8, 16, 32, 64],
      hidden_units: 64,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvLayerShape {
  pub index: usize,
  pub in_height: usize,
  pub in_width: usize,
  pub in_channels: usize,
  pub out_channels: usize,
  pub weight_offset: usize,
  pub bias_offset: usize,
  pub quant_index: usize,
}

impl ConvLayerShape {
  pub fn weight_len(&self) -> usize {
    self.out_channels * self.in_channels * KERNEL * KERNEL
  }

  pub fn in_groups(&self) -> usize {
    channel_groups(self.in_channels)
  }

  pub fn out_groups(&self) -> usize {
    channel_groups(self.out_channels)
  }

  pub fn out_height(&self) -> usize {
    self.in_height / POOL
  }

  pub fn out_width(&self) -> usize {
    self.in_width / POOL
  }

  /// Weight address of tap (kr, kc) for output channel `oc`, input channel `ic`.
  /// Planes are column-major.
  pub fn weight_addr(&self, oc: usize, ic: usize, kr: usize, kc: usize) -> usize {
    self.weight_offset + (oc * self.in_channels + ic) * KERNEL * KERNEL + kc * KERNEL + kr
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenseLayerShape {
  pub index: usize,
  pub input_size: usize,
  pub output_size: usize,
  pub weight_offset: usize,
  pub bias_offset: usize,
  pub quant_index: usize,
  pub zero_point: ZeroPoint,
}

impl DenseLayerShape {
  pub fn weight_len(&self) -> usize {
    self.input_size * self.output_size
  }
}

impl NetworkShape {
  pub fn validate(&self) -> Result<()> {
    for (what, side) in [("height", self.input_height), ("width", self.input_width)] {
      if side == 0 || side % SPATIAL_ALIGN != 0 {
        return Err(TpuError::config(format!(
          "input {} {} must be a non-zero multiple of {}",
          what, side, SPATIAL_ALIGN
        )));
      }
    }
    if self.input_channels == 0 {
      return Err(TpuError::config("input needs at least one channel"));
    }
    for (i, &c) in self.conv_channels.iter().enumerate() {
      if c == 0 {
        return Err(TpuError::config(format!("conv{} has no output channels", i + 1)));
      }
    }
    let flat = self.flatten_len();
    if flat > DENSE_MAX_INPUTS {
      return Err(TpuError::config(format!(
        "flattened feature map has {} values, dense engine takes at most {}",
        flat, DENSE_MAX_INPUTS
      )));
    }
    if self.hidden_units == 0 || self.hidden_units > DENSE_MAX_OUTPUTS || self.hidden_units > DENSE_MAX_INPUTS {
      return Err(TpuError::config(format!(
        "hidden layer width {} outside 1..={}",
        self.hidden_units, DENSE_MAX_OUTPUTS
      )));
    }
    Ok(())
  }

  pub fn conv_layers(&self) -> Vec<ConvLayerShape> {
    let mut layers = Vec::with_capacity(CONV_LAYERS);
    let (mut h, mut w, mut c) = (self.input_height, self.input_width, self.input_channels);
    let (mut w_off, mut b_off) = (0, 0);
    for (index, &out_c) in self.conv_channels.iter().enumerate() {
      let layer = ConvLayerShape {
        index,
        in_height: h,
        in_width: w,
        in_channels: c,
        out_channels: out_c,
        weight_offset: w_off,
        bias_offset: b_off,
        quant_index: index,
      };
      w_off += layer.weight_len();
      b_off += out_c;
      h /= POOL;
      w /= POOL;
      c = out_c;
      layers.push(layer);
    }
    layers
  }

  /// Final feature map after the last pool, as (height, width, channels).
  pub fn feature_shape(&self) -> (usize, usize, usize) {
    let div = POOL.pow(CONV_LAYERS as u32);
    (self.input_height / div, self.input_width / div, self.conv_channels[CONV_LAYERS - 1])
  }

  pub fn flatten_len(&self) -> usize {
    let (h, w, c) = self.feature_shape();
    h * w * c
  }

  pub fn dense_layers(&self) -> [DenseLayerShape; 2] {
    let conv = self.conv_layers();
    let w_off: usize = conv.iter().map(ConvLayerShape::weight_len).sum();
    let b_off: usize = self.conv_channels.iter().sum();
    let hidden = DenseLayerShape {
      index: 0,
      input_size: self.flatten_len(),
      output_size: self.hidden_units,
      weight_offset: w_off,
      bias_offset: b_off,
      quant_index: CONV_LAYERS,
      zero_point: ZeroPoint::Normalized,
    };
    let classifier = DenseLayerShape {
      index: 1,
      input_size: self.hidden_units,
      output_size: NUM_CLASSES,
      weight_offset: w_off + hidden.weight_len(),
      bias_offset: b_off + self.hidden_units,
      quant_index: CONV_LAYERS + 1,
      zero_point: ZeroPoint::Special,
    };
    [hidden, classifier]
  }

  pub fn total_weights(&self) -> usize {
    let [_, classifier] = self.dense_layers();
    classifier.weight_offset + classifier.weight_len()
  }

  pub fn total_biases(&self) -> usize {
    self.conv_channels.iter().sum::<usize>() + self.hidden_units + NUM_CLASSES
  }
}
