use glam::Vec2;

/// A detected salient image location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Patch diameter in pixels of the original image.
    pub size: f32,
    /// Orientation in radians, 0 for detectors without one.
    pub angle: f32,
    pub response: f32,
    /// Pyramid level the point was found on.
    pub octave: u8,
}

impl Keypoint {
    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

/// Whether a descriptor family produces bit-vector or float-vector rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorClass {
    Binary,
    Valued,
}

/// Row-major descriptor storage, one row per keypoint.
#[derive(Debug, Clone)]
pub enum Descriptors {
    Binary { bytes_per_row: usize, data: Vec<u8> },
    Valued { dim: usize, data: Vec<f32> },
}

impl Descriptors {
    pub fn empty_binary(bytes_per_row: usize) -> Descriptors {
        Descriptors::Binary {
            bytes_per_row,
            data: Vec::new(),
        }
    }

    pub fn empty_valued(dim: usize) -> Descriptors {
        Descriptors::Valued {
            dim,
            data: Vec::new(),
        }
    }

    pub fn class(&self) -> DescriptorClass {
        match self {
            Descriptors::Binary { .. } => DescriptorClass::Binary,
            Descriptors::Valued { .. } => DescriptorClass::Valued,
        }
    }

    pub fn rows(&self) -> usize {
        match self {
            Descriptors::Binary { bytes_per_row, data } => {
                if *bytes_per_row == 0 {
                    0
                } else {
                    data.len() / bytes_per_row
                }
            }
            Descriptors::Valued { dim, data } => {
                if *dim == 0 { 0 } else { data.len() / dim }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    pub fn binary_row(&self, r: usize) -> &[u8] {
        match self {
            Descriptors::Binary { bytes_per_row, data } => {
                &data[r * bytes_per_row..(r + 1) * bytes_per_row]
            }
            Descriptors::Valued { .. } => panic!("binary_row on valued descriptors"),
        }
    }

    pub fn valued_row(&self, r: usize) -> &[f32] {
        match self {
            Descriptors::Valued { dim, data } => &data[r * dim..(r + 1) * dim],
            Descriptors::Binary { .. } => panic!("valued_row on binary descriptors"),
        }
    }
}

/// Keypoints plus their descriptor matrix for one image.
///
/// Invariant: `descriptors.rows() == keypoints.len()` after every update.
#[derive(Debug, Clone)]
pub struct FeatureSet {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Descriptors,
}

impl FeatureSet {
    pub fn empty_binary(bytes_per_row: usize) -> FeatureSet {
        FeatureSet {
            keypoints: Vec::new(),
            descriptors: Descriptors::empty_binary(bytes_per_row),
        }
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    pub fn clear(&mut self) {
        self.keypoints.clear();
        match &mut self.descriptors {
            Descriptors::Binary { data, .. } => data.clear(),
            Descriptors::Valued { data, .. } => data.clear(),
        }
    }
}
