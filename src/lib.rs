//! 米の品種分類: CNNの学習パイプラインと推論サービス

pub mod capture;
pub mod commands;
pub mod dataset;
pub mod error;
pub mod logging;
pub mod matcher;
pub mod model;
pub mod prediction;
pub mod preprocess;
pub mod server;
pub mod service;
#[cfg(feature = "ml")]
pub mod ml;

#[cfg(test)]
mod test_support;

pub use error::ClassifyError;
pub use prediction::{decide, Outcome, DEFAULT_CONFIDENCE_THRESHOLD};
pub use service::{Classifier, RiceService};
