pub mod classification;
pub mod output;
pub mod preview;
pub mod tracking;

pub use classification::{FaceClassifier, FaceLocator, FaceRegion, FacialClassification, SkinToneClassifier};
pub use output::{OutputDriver, RecordSource};
pub use preview::{HudLayer, PreviewDensity, PreviewRenderer};
pub use tracking::{FaceMapper, MarkerKind};
