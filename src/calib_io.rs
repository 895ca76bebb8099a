use nalgebra as na;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::registrar::CameraIntrinsics;

/// On-disk calibration document. The distortion array holds 0, 4, 5 or 8
/// radial-tangential coefficients in OpenCV order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub camera_matrix: [[f64; 3]; 3],
    pub distortion: Vec<f64>,
}

impl CalibrationFile {
    pub fn from_intrinsics(camera: &CameraIntrinsics) -> CalibrationFile {
        let k = &camera.k;
        CalibrationFile {
            camera_matrix: [
                [k[(0, 0)], k[(0, 1)], k[(0, 2)]],
                [k[(1, 0)], k[(1, 1)], k[(1, 2)]],
                [k[(2, 0)], k[(2, 1)], k[(2, 2)]],
            ],
            distortion: camera.dist.iter().copied().collect(),
        }
    }

    pub fn to_intrinsics(&self) -> Result<CameraIntrinsics> {
        let k = na::Matrix3::new(
            self.camera_matrix[0][0],
            self.camera_matrix[0][1],
            self.camera_matrix[0][2],
            self.camera_matrix[1][0],
            self.camera_matrix[1][1],
            self.camera_matrix[1][2],
            self.camera_matrix[2][0],
            self.camera_matrix[2][1],
            self.camera_matrix[2][2],
        );
        let dist = na::DVector::from_vec(self.distortion.clone());
        CameraIntrinsics::new(k, dist)
    }
}

/// Loads intrinsics from a calibration JSON file.
///
/// A missing `distortion` key is rejected; an explicitly empty array is
/// accepted and means an undistorted camera.
pub fn load_intrinsics(path: &str) -> Result<CameraIntrinsics> {
    let contents = std::fs::read_to_string(path).map_err(|e| CoreError::FileReadFailure {
        path: path.to_string(),
        detail: e.to_string(),
    })?;
    let doc: CalibrationFile =
        serde_json::from_str(&contents).map_err(|e| CoreError::FileParseFailure {
            detail: e.to_string(),
        })?;
    doc.to_intrinsics()
}

pub fn save_intrinsics(path: &str, camera: &CameraIntrinsics) -> Result<()> {
    let doc = CalibrationFile::from_intrinsics(camera);
    let json = serde_json::to_string_pretty(&doc).map_err(|e| CoreError::FileParseFailure {
        detail: e.to_string(),
    })?;
    std::fs::write(path, json).map_err(|e| CoreError::FileReadFailure {
        path: path.to_string(),
        detail: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_distortion_key_is_rejected() {
        let json = r#"{"camera_matrix": [[600.0,0.0,320.0],[0.0,600.0,240.0],[0.0,0.0,1.0]]}"#;
        assert!(serde_json::from_str::<CalibrationFile>(json).is_err());
    }

    #[test]
    fn empty_distortion_means_no_distortion() {
        let json = r#"{
            "camera_matrix": [[600.0,0.0,320.0],[0.0,600.0,240.0],[0.0,0.0,1.0]],
            "distortion": []
        }"#;
        let doc: CalibrationFile = serde_json::from_str(json).unwrap();
        let cam = doc.to_intrinsics().unwrap();
        let p = cam.undistort_pixel(100.0, 80.0);
        assert!((p.x as f64 - (100.0 - 320.0) / 600.0).abs() < 1e-6);
    }

    #[test]
    fn bad_coefficient_count_is_rejected() {
        let json = r#"{
            "camera_matrix": [[600.0,0.0,320.0],[0.0,600.0,240.0],[0.0,0.0,1.0]],
            "distortion": [0.1, 0.01, 0.0]
        }"#;
        let doc: CalibrationFile = serde_json::from_str(json).unwrap();
        assert!(doc.to_intrinsics().is_err());
    }
}
