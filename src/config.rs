use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{EventError, Result};

/// Winners above this voltage may produce objects of any size up to the
/// maximum event area.
pub const HIGH_SALIENCE_VOLTAGE: f32 = 0.004;

/// Segmentation window size as a multiple of the FOA bounding box.
pub const SEGMENT_WINDOW_SCALE: f32 = 5.0;

/// Tracking algorithm assigned to each new event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingMode {
    NearestNeighbor,
    Kalman,
    Hough,
    NearestNeighborHough,
    KalmanHough,
}

impl TrackingMode {
    pub fn uses_kalman(self) -> bool {
        matches!(self, TrackingMode::Kalman | TrackingMode::KalmanHough)
    }

    pub fn uses_hough(self) -> bool {
        matches!(
            self,
            TrackingMode::Hough | TrackingMode::NearestNeighborHough | TrackingMode::KalmanHough
        )
    }
}

/// Detection and tracking parameters, fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParameters {
    pub min_event_area: u32,
    pub max_event_area: u32,
    /// Segment around the FOA mask instead of using the mask as the object.
    pub use_foa_mask_region: bool,
    pub remove_overlapping_detections: bool,
    pub tracking_mode: TrackingMode,
    /// Maximum centroid distance (pixels) for a nearest-neighbor match.
    pub max_dist: f32,
    /// Consecutive frames an event may coast before it is closed.
    pub max_frame_skip: u32,
    pub min_event_frames: u32,
    /// 0 disables the limit.
    pub max_event_frames: u32,
    pub min_class_probability: f64,
    pub hough_min_confidence: f32,
    pub cache_size: usize,
    /// 0 disables the degenerate frame check.
    pub min_std_dev: f32,
}

impl Default for DetectionParameters {
    fn default() -> Self {
        Self {
            min_event_area: 10,
            max_event_area: 500,
            use_foa_mask_region: true,
            remove_overlapping_detections: true,
            tracking_mode: TrackingMode::KalmanHough,
            max_dist: 40.0,
            max_frame_skip: 2,
            min_event_frames: 3,
            max_event_frames: 0,
            min_class_probability: 0.0,
            hough_min_confidence: 0.4,
            cache_size: 30,
            min_std_dev: 0.0,
        }
    }
}

impl DetectionParameters {
    /// Load from a JSON file. Missing fields take their default values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let params: DetectionParameters = serde_json::from_str(&data)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_event_area > self.max_event_area {
            return Err(EventError::config(format!(
                "min_event_area {} exceeds max_event_area {}",
                self.min_event_area, self.max_event_area
            )));
        }
        if self.cache_size == 0 {
            return Err(EventError::config("cache_size must be at least 1"));
        }
        if !(self.max_dist >= 0.0) {
            return Err(EventError::config("max_dist must be non-negative"));
        }
        if !(self.min_std_dev >= 0.0) {
            return Err(EventError::config("min_std_dev must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.hough_min_confidence) {
            return Err(EventError::config("hough_min_confidence must lie in [0, 1]"));
        }
        Ok(())
    }

    /// True when `area` lies within the configured event area bounds.
    pub fn area_in_bounds(&self, area: u32) -> bool {
        area >= self.min_event_area && area <= self.max_event_area
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let params = DetectionParameters::default();
        assert!(params.validate().is_ok());
        assert!(params.area_in_bounds(10));
        assert!(params.area_in_bounds(500));
        assert!(!params.area_in_bounds(9));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"min_event_area": 20, "tracking_mode": "NearestNeighbor"}}"#).unwrap();

        let params = DetectionParameters::from_file(file.path()).unwrap();
        assert_eq!(params.min_event_area, 20);
        assert_eq!(params.tracking_mode, TrackingMode::NearestNeighbor);
        assert_eq!(params.max_event_area, 500);
    }

    #[test]
    fn test_inverted_area_bounds_rejected() {
        let params = DetectionParameters {
            min_event_area: 100,
            max_event_area: 50,
            ..Default::default()
        };
        assert!(matches!(params.validate(), Err(EventError::ConfigError(_))));
    }

    #[test]
    fn test_tracking_mode_capabilities() {
        assert!(TrackingMode::KalmanHough.uses_kalman());
        assert!(TrackingMode::KalmanHough.uses_hough());
        assert!(!TrackingMode::NearestNeighbor.uses_hough());
        assert!(!TrackingMode::NearestNeighborHough.uses_kalman());
    }
}
