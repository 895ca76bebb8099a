pub mod describe;
pub mod detect;
pub mod extractor;
pub mod types;

pub use describe::{DESCRIPTOR_FAMILIES, DescriptorFamily, default_descriptor};
pub use detect::{FEATURE_FAMILIES, FeatureFamily};
pub use extractor::{FeatureExtractor, to_intensity};
pub use types::{DescriptorClass, Descriptors, FeatureSet, Keypoint};
