pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod ground_truth;
pub mod npy;
pub mod pickle;
pub mod transform;
pub mod utils;

pub use config::{GtStore, Opts};
pub use dataset::{Dataset, ImageKind, ImageRef, VprDataset, VprDatasetBuilder};
pub use error::{DatasetError, Result};
pub use ground_truth::GroundTruth;
pub use transform::Transform;
