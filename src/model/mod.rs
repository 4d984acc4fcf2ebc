pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, AugmentationSettings, DecodePolicy, DeviceType, TrainingSettings};
pub use model_metadata::ModelMetadata;
pub use model_storage::{
    inspect_archive, load_metadata, print_metadata_info, read_archive, write_archive,
    ArchiveContents, Inspection,
};
#[cfg(feature = "ml")]
pub use model_storage::{load_model, save_model};
