/// Storage seen by the datapath: activations, weights, biases, quant records
pub mod hex;
pub mod rom;
pub mod tables;
pub mod tensor_ram;

pub use rom::{BiasRom, QuantRom, WeightRom};
pub use tables::{load_image, synthetic_image, BiasFormat, ModelTables};
pub use tensor_ram::{channel_groups, PixelWord, TensorRam, LANES};
