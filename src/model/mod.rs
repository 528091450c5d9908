pub mod config;
pub mod inference_config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, CaptureSettings, DeviceType, MatcherSettings, ModelSettings, ServerSettings, TrainingSettings};
pub use inference_config::InferenceConfig;
pub use model_metadata::ModelMetadata;
pub use model_storage::{artifact_path, load_metadata, load_model_with_metadata, print_metadata_info, save_model_with_metadata};
