use tinytpu::arch::tinytpu::requantize::{requantize, ZeroPoint, QMAX_DEFAULT, QMIN_DEFAULT};
use tinytpu::arch::tinytpu::softmax::{argmax, softmax_q31, BETA_ONE};
use tinytpu::arch::tinytpu::topology::{ConvLayerShape, DenseLayerShape, KERNEL, NUM_CLASSES, PAD_LEFT, PAD_TOP};
use tinytpu::memdomain::{synthetic_image, ModelTables};
use tinytpu::simulator::utils::log::init_log;
use tinytpu::{Datapath, DatapathParams, NetworkShape, Stage};

/// Plain nested-loop network on an HWC buffer.
struct Reference<'a> {
  tables: &'a ModelTables,
}

impl Reference<'_> {
  fn conv_pool(&self, layer: &ConvLayerShape, input: &[i8]) -> Vec<i8> {
    let (h, w, c_in, c_out) = (layer.in_height, layer.in_width, layer.in_channels, layer.out_channels);
    let q = self.tables.quant.entry(layer.quant_index).unwrap();
    let at = |r: isize, c: isize, ch: usize| -> i32 {
      if r < 0 || c < 0 || r >= h as isize || c >= w as isize {
        0
      } else {
        input[(r as usize * w + c as usize) * c_in + ch] as i32
      }
    };

    let mut act = vec![0i8; h * w * c_out];
    for r in 0..h {
      for c in 0..w {
        for oc in 0..c_out {
          let mut acc = self.tables.biases.read(layer.bias_offset + oc);
          for kr in 0..KERNEL {
            for kc in 0..KERNEL {
              let (ir, icol) = ((r + kr) as isize - PAD_TOP as isize, (c + kc) as isize - PAD_LEFT as isize);
              for ic in 0..c_in {
                let wt = self.tables.weights.read(layer.weight_addr(oc, ic, kr, kc)) as i32;
                acc += at(ir, icol, ic) * wt;
              }
            }
          }
          act[(r * w + c) * c_out + oc] = requantize(
            acc,
            q.multiplier,
            q.shift,
            ZeroPoint::Normalized.value(),
            QMIN_DEFAULT,
            QMAX_DEFAULT,
          );
        }
      }
    }

    let (oh, ow) = (h / 2, w / 2);
    let mut out = vec![0i8; oh * ow * c_out];
    for r in 0..oh {
      for c in 0..ow {
        for oc in 0..c_out {
          let px = |dr: usize, dc: usize| act[((2 * r + dr) * w + 2 * c + dc) * c_out + oc];
          out[(r * ow + c) * c_out + oc] = px(0, 0).max(px(0, 1)).max(px(1, 0)).max(px(1, 1));
        }
      }
    }
    out
  }

  fn dense(&self, layer: &DenseLayerShape, input: &[i8]) -> Vec<i8> {
    let q = self.tables.quant.entry(layer.quant_index).unwrap();
    (0..layer.output_size)
      .map(|o| {
        let mut acc = self.tables.biases.read(layer.bias_offset + o);
        for (i, &x) in input.iter().enumerate() {
          acc += x as i32 * self.tables.weights.read(layer.weight_offset + i * layer.output_size + o) as i32;
        }
        requantize(acc, q.multiplier, q.shift, layer.zero_point.value(), QMIN_DEFAULT, QMAX_DEFAULT)
      })
      .collect()
  }

  fn logits(&self, shape: &NetworkShape, image: &[i8]) -> [i8; NUM_CLASSES] {
    let mut act = image.to_vec();
    for layer in shape.conv_layers() {
      act = self.conv_pool(&layer, &act);
    }
    for layer in shape.dense_layers() {
      act = self.dense(&layer, &act);
    }
    let mut logits = [0i8; NUM_CLASSES];
    logits.copy_from_slice(&act);
    logits
  }
}

#[test]
fn test_full_pipeline_matches_reference() {
  init_log();

  let shape = NetworkShape::default();
  for seed in [1u64, 9] {
    let tables = ModelTables::synthetic(&shape, seed);
    let image = synthetic_image(&shape, seed);
    let expected = Reference { tables: &tables }.logits(&shape, &image);

    let mut datapath = Datapath::new(shape.clone(), tables.clone(), DatapathParams::default()).unwrap();
    let result = datapath.infer(&image).unwrap();

    assert_eq!(result.logits, expected, "seed {}", seed);
    assert_eq!(result.probabilities, softmax_q31(&expected, BETA_ONE));
    assert_eq!(result.predicted, argmax(&result.probabilities));
    assert!(result.cycles > 0);
  }
}

#[test]
fn test_stagewise_activations_match_reference() {
  init_log();

  let shape = NetworkShape::default();
  let tables = ModelTables::synthetic(&shape, 4);
  let image = synthetic_image(&shape, 4);
  let reference = Reference { tables: &tables };

  let mut datapath = Datapath::new(shape.clone(), tables.clone(), DatapathParams::default()).unwrap();
  datapath.load_image(&image).unwrap();

  let mut act = image.clone();
  for layer in shape.conv_layers() {
    assert_eq!(datapath.step_stage().unwrap(), Stage::Conv(layer.index));
    act = reference.conv_pool(&layer, &act);
    let ram = datapath.activation().unwrap();
    assert_eq!(
      (ram.height(), ram.width(), ram.channels()),
      (layer.out_height(), layer.out_width(), layer.out_channels)
    );
    assert_eq!(ram.to_hwc(), act, "conv{}", layer.index + 1);
  }

  assert_eq!(datapath.step_stage().unwrap(), Stage::Flatten);
  assert_eq!(datapath.vector(), &act[..]);
  assert_eq!(datapath.vector().len(), shape.flatten_len());

  let [hidden, classifier] = shape.dense_layers();
  assert_eq!(datapath.step_stage().unwrap(), Stage::Dense(0));
  let h = reference.dense(&hidden, &act);
  assert_eq!(datapath.vector(), &h[..]);

  assert_eq!(datapath.step_stage().unwrap(), Stage::Dense(1));
  let logits = reference.dense(&classifier, &h);
  assert_eq!(datapath.vector(), &logits[..]);

  assert_eq!(datapath.step_stage().unwrap(), Stage::Softmax);
  assert_eq!(datapath.stage(), Stage::Done);
  assert_eq!(datapath.step_stage().unwrap(), Stage::Done, "done is sticky");
}

#[test]
fn test_softmax_temperature_changes_confidence() {
  init_log();

  let shape = NetworkShape::default();
  let tables = ModelTables::synthetic(&shape, 2);
  let image = synthetic_image(&shape, 2);

  let mut cool = Datapath::new(shape.clone(), tables.clone(), DatapathParams::default()).unwrap();
  let params = DatapathParams {
    softmax_beta: 4 * BETA_ONE,
    ..DatapathParams::default()
  };
  let mut hot = Datapath::new(shape, tables, params).unwrap();

  let a = cool.infer(&image).unwrap();
  let b = hot.infer(&image).unwrap();
  assert_eq!(a.logits, b.logits);
  assert_eq!(a.predicted, b.predicted);
  assert!(b.probabilities[b.predicted] >= a.probabilities[a.predicted]);
}

#[test]
fn test_rejects_bad_params() {
  let shape = NetworkShape::default();
  let tables = ModelTables::synthetic(&shape, 1);
  let params = DatapathParams {
    softmax_beta: 0,
    ..DatapathParams::default()
  };
  assert!(Datapath::new(shape.clone(), tables.clone(), params).is_err());

  let params = DatapathParams {
    qmin: 5,
    qmax: -5,
    ..DatapathParams::default()
  };
  assert!(Datapath::new(shape, tables, params).is_err());
}
