/// Convolution stage driver: patch extraction, MAC grid, requantize, pool
///
/// The layer is walked one 4×4 spatial block at a time. For each input
/// channel group the block's region is loaded once; every (output channel
/// group, block row) tile then runs one preload step (bias on the first
/// group, the saved partial sums afterwards) and sixteen MAC steps, one per
/// kernel tap. When all groups have contributed, each tile drains row by
/// row through the output buffer into the requantizer and is pooled 2×2
/// per output channel.
use super::maxpool::{MaxPool, PoolIn};
use super::output_buffer::ArrayOutputBuffer;
use super::patch_buffer::{Patch, PatchBuffer, PatchConfig, BLOCK};
use super::requantize::{RequantIn, Requantizer, ZeroPoint};
use super::systolic_array::{AccTile, ArrayStep, SystolicMacArray, ARRAY};
use super::topology::{ConvLayerShape, KERNEL, POOL};
use crate::builtin::Module;
use crate::error::{Result, TpuError};
use crate::memdomain::{ModelTables, PixelWord, TensorRam, LANES};

/// Work counters for one layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvStats {
  pub cycles: u64,
  pub fetches: u64,
  pub array_steps: u64,
  pub blocks: u64,
}

pub struct ConvEngine {
  patch: PatchBuffer,
  array: SystolicMacArray,
  out_buf: ArrayOutputBuffer,
  requant: Requantizer,
  pools: Vec<MaxPool>,
  stats: ConvStats,
}

impl ConvEngine {
  pub fn new(qmin: i32, qmax: i32) -> Result<Self> {
    let pools = (0..ARRAY)
      .map(|j| MaxPool::new(format!("maxpool{}", j), BLOCK, POOL, POOL))
      .collect::<Result<Vec<_>>>()?;
    Ok(Self {
      patch: PatchBuffer::new("patch_buffer"),
      array: SystolicMacArray::new("mac_array"),
      out_buf: ArrayOutputBuffer::new("array_output_buffer"),
      requant: Requantizer::new("conv_requant").with_clamp(qmin, qmax)?,
      pools,
      stats: ConvStats::default(),
    })
  }

  pub fn stats(&self) -> ConvStats {
    self.stats
  }

  /// Run one conv + pool stage, returning the pooled activation map.
  pub fn run_layer(&mut self, layer: &ConvLayerShape, input: &mut TensorRam, tables: &ModelTables) -> Result<TensorRam> {
    let tag = format!("conv{}", layer.index + 1);
    if (input.height(), input.width(), input.channels()) != (layer.in_height, layer.in_width, layer.in_channels) {
      return Err(TpuError::config(format!(
        "{}: input is {}x{}x{}, layer expects {}x{}x{}",
        tag,
        input.height(),
        input.width(),
        input.channels(),
        layer.in_height,
        layer.in_width,
        layer.in_channels
      )));
    }

    let cfg = PatchConfig::same(layer.in_height, layer.in_width, layer.in_channels);
    self.patch.configure(cfg)?;
    self.array.reset();
    self.out_buf.reset();
    self.requant.reset();
    self.requant.configure(tables.quant.entry(layer.quant_index)?, ZeroPoint::Normalized);
    let weights = tables.weights.region(layer.weight_offset, layer.weight_len(), &tag)?;
    let biases = tables.biases.region(layer.bias_offset, layer.out_channels, &tag)?;
    let mut output = TensorRam::new(tag.clone(), layer.out_height(), layer.out_width(), layer.out_channels)?;
    self.stats = ConvStats::default();

    let in_groups = cfg.channel_groups();
    let out_groups = layer.out_groups();
    log::debug!(
      "{}: {}x{}x{} -> {}x{}x{}, {} in group(s), {} out group(s)",
      tag,
      layer.in_height,
      layer.in_width,
      layer.in_channels,
      layer.out_height(),
      layer.out_width(),
      layer.out_channels,
      in_groups,
      out_groups
    );

    while !self.patch.cursor().layer_complete {
      let (row0, col0) = self.patch.cursor().origin();
      let mut partials: Vec<AccTile> = vec![[[0; ARRAY]; ARRAY]; out_groups * BLOCK];

      for group in 0..in_groups {
        self.patch.select_channel_group(group)?;
        self.patch.start_extraction()?;
        self.load_region(input)?;
        let windows = self.windows();

        for og in 0..out_groups {
          for br in 0..BLOCK {
            let tile = &mut partials[og * BLOCK + br];
            let preload = if group == 0 {
              // every row of the tile is a position of the same output channels
              let channel_bias: [i32; ARRAY] =
                std::array::from_fn(|j| biases.get(og * ARRAY + j).copied().unwrap_or(0));
              ArrayStep::load_bias([channel_bias; ARRAY])
            } else {
              ArrayStep::load_sum(*tile)
            };
            self.clock_array(preload);
            for kr in 0..KERNEL {
              for kc in 0..KERNEL {
                let a = std::array::from_fn(|i| windows[br][i][kr][kc]);
                let b = std::array::from_fn(|j| kernel_lanes(layer, weights, og * ARRAY + j, group, kr, kc));
                self.clock_array(ArrayStep::mac(a, b));
              }
            }
            *tile = self.array.results();
          }
        }
      }

      self.drain_block(layer, &partials, row0, col0, &mut output)?;
      self.stats.blocks += 1;
      self.patch.advance_spatial_block()?;
    }

    self.stats.fetches = self.patch.fetches();
    log::debug!(
      "{}: {} blocks, {} fetches, {} array steps, {} cycles",
      tag,
      self.stats.blocks,
      self.stats.fetches,
      self.stats.array_steps,
      self.stats.cycles
    );
    Ok(output)
  }

  /// Clock the patch buffer against tensor RAM until the region is loaded.
  fn load_region(&mut self, ram: &mut TensorRam) -> Result<()> {
    let bound = 2 * (BLOCK + KERNEL) * (BLOCK + KERNEL) + 4;
    let mut ticks = 0;
    while !self.patch.patch_ready {
      ram.run();
      self.patch.run();
      ram.read_req = self.patch.mem_req.clone();
      self.patch.mem_resp = ram.read_resp.clone();
      ticks += 1;
      if ticks > bound {
        return Err(TpuError::storage("patch region load did not finish"));
      }
    }
    ram.read_req.clear();
    self.stats.cycles += ticks as u64;
    Ok(())
  }

  /// All sixteen windows of the loaded block, `[block_row][block_col]`,
  /// pulled through the staggered lane stream.
  fn windows(&self) -> Vec<Vec<Patch>> {
    (0..BLOCK)
      .map(|br| (0..BLOCK).map(|bc| self.patch.stream(br, bc).deskew()).collect())
      .collect()
  }

  fn clock_array(&mut self, step: ArrayStep) {
    self.array.input.set(step);
    self.array.run();
    self.array.input.clear();
    self.stats.array_steps += 1;
    self.stats.cycles += 1;
  }

  fn drain_block(
    &mut self,
    layer: &ConvLayerShape,
    partials: &[AccTile],
    row0: usize,
    col0: usize,
    output: &mut TensorRam,
  ) -> Result<()> {
    self.out_buf.consume = true;
    for og in 0..layer.out_groups() {
      for pool in self.pools.iter_mut() {
        pool.begin(row0, col0);
      }
      for br in 0..BLOCK {
        self.drain_tile(&partials[og * BLOCK + br], br)?;
      }

      for (j, pool) in self.pools.iter_mut().enumerate() {
        pool.finish();
        let oc = og * ARRAY + j;
        for out in pool.drain() {
          if oc < layer.out_channels {
            output.write_pixel(out.row / POOL, out.col / POOL, oc, out.value);
          }
        }
      }
    }
    self.out_buf.consume = false;
    Ok(())
  }

  /// Push one tile through output buffer and requantizer. Grid row `i`
  /// holds block column `i`; grid column `j` is output channel `j` of the
  /// group, which selects the pool.
  fn drain_tile(&mut self, tile: &AccTile, block_row: usize) -> Result<()> {
    let mut next_row = 0;
    loop {
      let feed = next_row < ARRAY && self.out_buf.can_accept(ARRAY);
      for (j, port) in self.out_buf.input.iter_mut().enumerate() {
        if feed {
          port.set(RequantIn {
            acc: tile[next_row][j],
            row: next_row,
            col: j,
          });
        } else {
          port.clear();
        }
      }
      if feed {
        next_row += 1;
      }

      // back to front: requantizer output, requantizer, buffer
      self.requant.run();
      if let Some(q) = self.requant.output.take() {
        self.pools[q.col].push(PoolIn {
          value: q.value,
          row: block_row,
          col: q.row,
        })?;
      }
      self.out_buf.run();
      match self.out_buf.output.take() {
        Some(beat) => self.requant.input.set(beat),
        None => self.requant.input.clear(),
      }
      self.stats.cycles += 1;

      if next_row == ARRAY && self.out_buf.is_empty() && !self.requant.input.valid {
        break;
      }
    }
    if self.out_buf.overflowed() {
      return Err(TpuError::storage("array output buffer overflowed"));
    }
    Ok(())
  }

  pub fn reset(&mut self) {
    self.patch.reset();
    self.array.reset();
    self.out_buf.reset();
    self.requant.reset();
    for pool in self.pools.iter_mut() {
      pool.reset();
    }
    self.stats = ConvStats::default();
  }
}

/// Four input-channel lanes of one kernel tap for output channel `oc`.
fn kernel_lanes(layer: &ConvLayerShape, weights: &[i8], oc: usize, group: usize, kr: usize, kc: usize) -> PixelWord {
  let mut lanes = [0i8; LANES];
  if oc >= layer.out_channels {
    return lanes;
  }
  for (lane, w) in lanes.iter_mut().enumerate() {
    let ic = group * LANES + lane;
    if ic < layer.in_channels {
      *w = weights[layer.weight_addr(oc, ic, kr, kc) - layer.weight_offset];
    }
  }
  lanes
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::tinytpu::requantize::{requantize, QuantParams, MULTIPLIER_MIN};
  use crate::arch::tinytpu::topology::{PAD_LEFT, PAD_TOP};
  use crate::memdomain::{BiasRom, QuantRom, WeightRom};

  fn small_layer(h: usize, w: usize, in_c: usize, out_c: usize) -> ConvLayerShape {
    ConvLayerShape {
      index: 0,
      in_height: h,
      in_width: w,
      in_channels: in_c,
      out_channels: out_c,
      weight_offset: 0,
      bias_offset: 0,
      quant_index: 0,
    }
  }

  fn tables_for(layer: &ConvLayerShape, shift: i32) -> ModelTables {
    let weights = (0..layer.weight_len()).map(|i| ((i * 7 + 3) % 11) as i8 - 5).collect();
    let biases = (0..layer.out_channels).map(|o| o as i32 * 13 - 40).collect();
    ModelTables {
      weights: WeightRom::new(weights),
      biases: BiasRom::new(biases),
      quant: QuantRom::new(vec![QuantParams {
        multiplier: MULTIPLIER_MIN,
        shift,
      }]),
    }
  }

  /// Direct convolution with "same" padding, requantize, then 2×2 max.
  fn reference(layer: &ConvLayerShape, input: &TensorRam, tables: &ModelTables) -> Vec<i8> {
    let q = tables.quant.entry(0).unwrap();
    let (h, w) = (layer.in_height, layer.in_width);
    let mut act = vec![vec![vec![0i8; layer.out_channels]; w]; h];
    for r in 0..h {
      for c in 0..w {
        for oc in 0..layer.out_channels {
          let mut acc = tables.biases.read(oc);
          for kr in 0..KERNEL {
            for kc in 0..KERNEL {
              let (ir, icol) = ((r + kr) as isize - PAD_TOP as isize, (c + kc) as isize - PAD_LEFT as isize);
              if ir < 0 || icol < 0 || ir >= h as isize || icol >= w as isize {
                continue;
              }
              for ic in 0..layer.in_channels {
                let x = input.pixel(ir as usize, icol as usize, ic) as i32;
                let wt = tables.weights.read(layer.weight_addr(oc, ic, kr, kc)) as i32;
                acc += x * wt;
              }
            }
          }
          act[r][c][oc] = requantize(acc, q.multiplier, q.shift, -128, -128, 127);
        }
      }
    }
    let mut out = Vec::new();
    for r in (0..h).step_by(2) {
      for c in (0..w).step_by(2) {
        for oc in 0..layer.out_channels {
          let m = act[r][c][oc].max(act[r][c + 1][oc]).max(act[r + 1][c][oc]).max(act[r + 1][c + 1][oc]);
          out.push(m);
        }
      }
    }
    out
  }

  fn image(h: usize, w: usize, c: usize) -> TensorRam {
    let data: Vec<i8> = (0..h * w * c).map(|i| ((i * 37 + 11) % 61) as i8 - 30).collect();
    TensorRam::from_hwc("in", h, w, c, &data).unwrap()
  }

  #[test]
  fn test_single_group_matches_reference() {
    let layer = small_layer(8, 8, 1, 8);
    let tables = tables_for(&layer, 2);
    let mut input = image(8, 8, 1);
    let mut engine = ConvEngine::new(-128, 127).unwrap();
    let out = engine.run_layer(&layer, &mut input, &tables).unwrap();
    assert_eq!((out.height(), out.width(), out.channels()), (4, 4, 8));
    assert_eq!(out.to_hwc(), reference(&layer, &input, &tables));
  }

  #[test]
  fn test_channel_group_chaining_matches_reference() {
    // 6 input channels: two groups chained through load_sum
    let layer = small_layer(8, 4, 6, 6);
    let tables = tables_for(&layer, 4);
    let mut input = image(8, 4, 6);
    let mut engine = ConvEngine::new(-128, 127).unwrap();
    let out = engine.run_layer(&layer, &mut input, &tables).unwrap();
    assert_eq!(out.to_hwc(), reference(&layer, &input, &tables));

    let stats = engine.stats();
    assert_eq!(stats.blocks, 2);
    // per block: 2 groups * 2 out groups * 4 rows * (1 preload + 16 taps)
    assert_eq!(stats.array_steps, 2 * 2 * 2 * 4 * 17);
    assert_eq!(stats.fetches, input.total_reads());
  }

  #[test]
  fn test_shape_mismatch_rejected() {
    let layer = small_layer(8, 8, 1, 8);
    let tables = tables_for(&layer, 2);
    let mut input = image(4, 4, 1);
    let mut engine = ConvEngine::new(-128, 127).unwrap();
    assert!(engine.run_layer(&layer, &mut input, &tables).is_err());
  }

  #[test]
  fn test_missing_weights_rejected() {
    let layer = small_layer(8, 8, 1, 8);
    let mut tables = tables_for(&layer, 2);
    tables.weights = WeightRom::new(vec![0; 10]);
    let mut input = image(8, 8, 1);
    let mut engine = ConvEngine::new(-128, 127).unwrap();
    assert!(engine.run_layer(&layer, &mut input, &tables).is_err());
  }
}
