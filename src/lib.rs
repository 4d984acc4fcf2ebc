//! 手書き数式記号の認識
//!
//! サンプル画像の保存、CNN分類器の学習、学習済みモデルによる推論を提供します。

pub mod error;
pub mod labels;
pub mod model;
pub mod sample_store;
#[cfg(feature = "ml")]
pub mod ml;

pub use error::{RecognizerError, Result};
pub use labels::{normalize, LabelMap};
pub use sample_store::SampleStore;
