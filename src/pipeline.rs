//! One-frame-at-a-time driver: preprocess, detect, track.

use image::RgbImage;
use log::{debug, info};
use std::sync::Arc;

use crate::bit_object::{BitObject, Winner};
use crate::classifier::{Classify, FeatureCollection};
use crate::config::DetectionParameters;
use crate::detection::ObjectDetection;
use crate::error::Result;
use crate::event_set::{FrameContext, UpdateSummary, VisualEventSet};
use crate::preprocess::Preprocess;

/// What one `process` call produced.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub frame_num: u32,
    pub detections: Vec<BitObject>,
    pub summary: UpdateSummary,
    /// Events closed by the trailing clean up.
    pub cleaned: Vec<u32>,
}

pub struct FramePipeline {
    preprocess: Preprocess,
    detection: ObjectDetection,
    events: VisualEventSet,
    prev_frame: Option<RgbImage>,
    last_frame: Option<u32>,
}

impl FramePipeline {
    /// `last_frame`, when known, closes every event once it is reached.
    pub fn new(params: Arc<DetectionParameters>, file_name: &str, last_frame: Option<u32>) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            preprocess: Preprocess::from_params(&params),
            detection: ObjectDetection::new(Arc::clone(&params)),
            events: VisualEventSet::new(params, file_name),
            prev_frame: None,
            last_frame,
        })
    }

    /// Fill the background cache before the first `process` call.
    pub fn prime<I>(&mut self, frames: I, first_frame: u32) -> Result<usize>
    where
        I: IntoIterator<Item = RgbImage>,
    {
        self.preprocess.init(frames, first_frame)
    }

    pub fn process(
        &mut self,
        frame_num: u32,
        frame: &RgbImage,
        winners: &[Winner],
        classifier: Option<&dyn Classify>,
        features: Option<&FeatureCollection>,
    ) -> Result<FrameResult> {
        let enhanced = self.preprocess.contrast_enhance(frame);
        let segment_in = if frame_num >= self.preprocess.min_frame() && !self.preprocess.cache().is_empty() {
            self.preprocess.abs_diff_mean(&enhanced)
        } else {
            enhanced.clone()
        };

        let detections = self.detection.run(winners, &segment_in);
        let ctx = FrameContext::new(frame_num, &enhanced);
        let summary = self.events.update_events(&ctx, &detections, classifier, features);
        let cleaned = self
            .events
            .clean_up(frame_num, self.last_frame.unwrap_or(u32::MAX));

        let active = self.events.bit_objects_for_frame(frame_num);
        let prev = self.prev_frame.take().unwrap_or_else(|| enhanced.clone());
        // Frames below `min_frame` were cached by `prime`.
        if frame_num >= self.preprocess.min_frame() {
            self.preprocess
                .update_with_objects(&enhanced, &prev, frame_num, &active)?;
        }
        self.prev_frame = Some(enhanced);

        debug!(
            "Frame {}: {} winner(s), {} detection(s), {} active object(s)",
            frame_num,
            winners.len(),
            detections.len(),
            active.len()
        );
        Ok(FrameResult {
            frame_num,
            detections,
            summary,
            cleaned,
        })
    }

    /// Close everything still open.
    pub fn finish(&mut self) {
        self.events.close_all();
        info!("Finished with {} event(s) kept", self.events.num_events());
    }

    pub fn events(&self) -> &VisualEventSet {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut VisualEventSet {
        &mut self.events
    }

    pub fn preprocess(&self) -> &Preprocess {
        &self.preprocess
    }

    pub fn into_events(self) -> VisualEventSet {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn disc_frame(cx: i32, cy: i32) -> (RgbImage, BitObject) {
        let mut img = RgbImage::from_pixel(80, 80, Rgb([30, 40, 50]));
        let obj = BitObject::from_pixels(
            (cy - 4..=cy + 4)
                .flat_map(|y| (cx - 4..=cx + 4).map(move |x| (x, y)))
                .filter(|&(x, y)| (x - cx).pow(2) + (y - cy).pow(2) <= 16),
        );
        for (x, y) in obj.pixels() {
            img.put_pixel(x as u32, y as u32, Rgb([230, 220, 200]));
        }
        (img, obj)
    }

    #[test]
    fn test_rejects_invalid_params() {
        let params = DetectionParameters {
            min_event_area: 100,
            max_event_area: 10,
            ..Default::default()
        };
        assert!(FramePipeline::new(Arc::new(params), "clip", None).is_err());
    }

    #[test]
    fn test_primed_frames_are_not_cached_twice() {
        let params = Arc::new(DetectionParameters {
            cache_size: 3,
            ..Default::default()
        });
        let mut pipeline = FramePipeline::new(params, "clip", None).unwrap();
        let frames: Vec<RgbImage> = [20u8, 40, 60]
            .iter()
            .map(|&v| RgbImage::from_pixel(40, 40, Rgb([v, v, v])))
            .collect();
        pipeline.prime(frames.clone(), 0).unwrap();

        for (frame_num, frame) in frames.iter().enumerate() {
            pipeline.process(frame_num as u32, frame, &[], None, None).unwrap();
        }
        let cache = pipeline.preprocess().cache();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.front(), Some(&frames[0]));
        assert_eq!(cache.back(), Some(&frames[2]));

        pipeline.process(3, &frames[2], &[], None, None).unwrap();
        assert_eq!(pipeline.preprocess().cache().front(), Some(&frames[1]));
    }

    #[test]
    fn test_moving_object_forms_one_event() {
        let params = Arc::new(DetectionParameters {
            cache_size: 3,
            ..Default::default()
        });
        let mut pipeline = FramePipeline::new(params, "clip", None).unwrap();
        let empty = RgbImage::from_pixel(80, 80, Rgb([30, 40, 50]));
        assert_eq!(pipeline.prime(vec![empty.clone(), empty.clone(), empty], 0).unwrap(), 3);

        for (i, frame_num) in (3..9).enumerate() {
            let (frame, obj) = disc_frame(20 + 2 * i as i32, 40);
            let winner = Winner {
                x: obj.centroid_px().0,
                y: obj.centroid_px().1,
                voltage: 0.01,
                frame_num,
                foa: obj,
            };
            let result = pipeline.process(frame_num, &frame, &[winner], None, None).unwrap();
            assert_eq!(result.detections.len(), 1);
            assert!(result.summary.assignments.iter().all(Option::is_some));
        }

        let events = pipeline.events();
        assert_eq!(events.num_events(), 1);
        let event = events.event_by_number(0).unwrap();
        assert_eq!(event.num_frames(), 6);
        assert!(event.is_interesting());
        assert!(pipeline.preprocess().cache().len() <= 3);

        pipeline.finish();
        assert!(pipeline.events().iter().all(|e| e.is_closed()));
    }
}
