pub mod augmentation;
pub mod dataset;
pub mod inference;
pub mod ml_model;
pub mod training;

pub use augmentation::{AffineParams, Augmenter};
pub use dataset::{DatasetBuilder, DatasetSplit, SymbolDataset, SymbolItem};
pub use inference::{InferenceEngine, Prediction};
pub use ml_model::{
    argmax_first, load_and_normalize_image, normalize_image, SymbolClassifier,
    SymbolClassifierConfig, IMAGE_PIXELS, IMAGE_SIZE,
};
pub use training::{
    train_classifier, train_from_directory, EpochMetrics, PlateauSchedule, TrainingOutcome,
    TrainingReport, TrainingState,
};
