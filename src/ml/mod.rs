pub mod ml_model;
pub mod training;
pub mod inference;

pub use ml_model::{feature_map_size, ModelConfig, RiceCnn};
pub use training::{evaluate, run_training, train_model, EpochReport, Evaluation, RiceBatch, RiceBatcher, TrainingSummary};
pub use inference::{load_classifier, InferenceEngine};
