pub mod bayes;
pub mod bit_object;
pub mod classifier;
pub mod config;
pub mod detection;
pub mod error;
pub mod event;
pub mod event_set;
pub mod hough;
pub mod kalman_filter;
pub mod pipeline;
pub mod preprocess;
pub mod tracker;

// Re-export main types
pub use crate::bayes::{Bayes, ClassInfo};
pub use crate::bit_object::{BitObject, Rect, Winner};
pub use crate::classifier::{BayesClassifier, Classify, FeatureCollection, FeatureData, FeatureRecord, FeatureType};
pub use crate::config::{DetectionParameters, TrackingMode};
pub use crate::detection::ObjectDetection;
pub use crate::error::{EventError, Result};
pub use crate::event::{Classification, EventState, Token, VisualEvent};
pub use crate::event_set::{EventSetHeader, FrameContext, UpdateSummary, VisualEventSet};
pub use crate::pipeline::{FramePipeline, FrameResult};
pub use crate::preprocess::{ImageCache, Preprocess};
pub use crate::tracker::{TrackOutcome, TrackingStrategy};
