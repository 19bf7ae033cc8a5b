//! Interchangeable strategies that extend an event into the current frame.

use image::RgbImage;
use log::debug;
use nalgebra::Point2;
use std::cmp::Ordering;

use crate::bit_object::{BitObject, Rect};
use crate::config::{DetectionParameters, TrackingMode};
use crate::event::{KalmanState, VisualEvent};
use crate::hough::HoughModel;
use crate::kalman_filter::{KalmanFilter, Measurement};

/// Everything a strategy may look at for the current frame.
pub struct TrackingContext<'a> {
    pub frame_num: u32,
    pub image: &'a RgbImage,
    pub detections: &'a [BitObject],
    /// `claimed[i]` is true once detection `i` belongs to an event.
    pub claimed: &'a [bool],
    pub params: &'a DetectionParameters,
}

impl<'a> TrackingContext<'a> {
    pub fn frame_rect(&self) -> Rect {
        Rect::frame(self.image.width(), self.image.height())
    }

    fn unclaimed(&self) -> impl Iterator<Item = (usize, &'a BitObject)> + '_ {
        self.detections
            .iter()
            .enumerate()
            .filter(move |(i, d)| !self.claimed.get(*i).copied().unwrap_or(false) && d.is_valid())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackOutcome {
    /// The event continues with `object`; `detection` is the index of the
    /// claimed detection, if the object came from one.
    Success { object: BitObject, detection: Option<usize> },
    /// No data this frame; the event may coast at `predicted`.
    Skip { predicted: Point2<f32> },
    /// Tracker state is unusable; the event closes.
    Fail,
}

impl TrackOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TrackOutcome::Success { .. })
    }
}

pub trait TrackingStrategy {
    fn name(&self) -> &'static str;

    /// Set up tracker state for a newly created event.
    fn initialize(&self, _event: &mut VisualEvent, _ctx: &TrackingContext) {}

    fn attempt_extend(&self, event: &mut VisualEvent, ctx: &TrackingContext) -> TrackOutcome;

    /// Bring tracker state in line with an object another strategy accepted.
    fn absorb(&self, _event: &mut VisualEvent, _object: &BitObject, _ctx: &TrackingContext) {}
}

/// Strategy for an event's tracking mode.
pub fn strategy_for(mode: TrackingMode) -> Box<dyn TrackingStrategy> {
    let motion: Box<dyn TrackingStrategy> = if mode.uses_kalman() {
        Box::new(KalmanTracker::new())
    } else {
        Box::new(NearestNeighborTracker)
    };
    match mode {
        TrackingMode::Hough => Box::new(HoughTracker),
        m if m.uses_hough() => Box::new(HybridTracker::new(Box::new(HoughTracker), motion)),
        _ => motion,
    }
}

/// Order candidates by cost, then smaller area, then lower detection index.
fn compare_candidates(a: &(f32, u32, usize), b: &(f32, u32, usize)) -> Ordering {
    a.0.partial_cmp(&b.0)
        .unwrap_or(Ordering::Equal)
        .then(a.1.cmp(&b.1))
        .then(a.2.cmp(&b.2))
}

fn distance(a: Point2<f32>, b: Point2<f32>) -> f32 {
    (a - b).norm()
}

/// Matches the unclaimed detection closest to the velocity-extrapolated
/// position, within `max_dist`.
pub struct NearestNeighborTracker;

impl TrackingStrategy for NearestNeighborTracker {
    fn name(&self) -> &'static str {
        "nearest-neighbor"
    }

    fn attempt_extend(&self, event: &mut VisualEvent, ctx: &TrackingContext) -> TrackOutcome {
        let predicted = event.latest().token.location + event.velocity();
        let best = ctx
            .unclaimed()
            .map(|(i, d)| (distance(predicted, d.centroid()), d.area(), i))
            .filter(|c| c.0 <= ctx.params.max_dist)
            .min_by(compare_candidates);

        match best {
            Some((dist, _, i)) => {
                debug!("Event {} nearest neighbor {} at distance {:.2}", event.event_num(), i, dist);
                TrackOutcome::Success {
                    object: ctx.detections[i].clone(),
                    detection: Some(i),
                }
            }
            None => TrackOutcome::Skip { predicted },
        }
    }
}

/// Constant-velocity Kalman prediction; candidates inside `max_dist` of the
/// prediction are ranked by Mahalanobis distance.
pub struct KalmanTracker {
    kalman: KalmanFilter,
}

impl KalmanTracker {
    pub fn new() -> Self {
        Self {
            kalman: KalmanFilter::new(),
        }
    }

    fn object_size(object: &BitObject) -> f32 {
        (object.area() as f32).sqrt()
    }

    fn ensure_state(&self, event: &mut VisualEvent) {
        if event.kalman.is_none() {
            let latest = &event.latest().bit_object;
            let c = latest.centroid();
            let (mean, covariance) = self.kalman.initiate(&Measurement::new(c.x, c.y), Self::object_size(latest));
            event.kalman = Some(KalmanState {
                mean,
                covariance,
                predicted_frame: None,
            });
        }
    }

    /// Advance the state into `frame_num`. At most once per frame.
    fn predict(&self, event: &mut VisualEvent, frame_num: u32) {
        self.ensure_state(event);
        let size = Self::object_size(&event.latest().bit_object);
        if let Some(state) = event.kalman.as_mut() {
            if state.predicted_frame == Some(frame_num) {
                return;
            }
            let (mean, covariance) = self.kalman.predict(&state.mean, &state.covariance, size);
            state.mean = mean;
            state.covariance = covariance;
            state.predicted_frame = Some(frame_num);
        }
    }

    fn correct(&self, event: &mut VisualEvent, object: &BitObject) {
        let c = object.centroid();
        let size = Self::object_size(object);
        if let Some(state) = event.kalman.as_mut() {
            let (mean, covariance) =
                self.kalman
                    .update(&state.mean, &state.covariance, &Measurement::new(c.x, c.y), size);
            state.mean = mean;
            state.covariance = covariance;
        }
    }
}

impl Default for KalmanTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingStrategy for KalmanTracker {
    fn name(&self) -> &'static str {
        "kalman"
    }

    fn initialize(&self, event: &mut VisualEvent, _ctx: &TrackingContext) {
        self.ensure_state(event);
    }

    fn attempt_extend(&self, event: &mut VisualEvent, ctx: &TrackingContext) -> TrackOutcome {
        self.predict(event, ctx.frame_num);
        let Some(state) = event.kalman.clone() else {
            return TrackOutcome::Fail;
        };
        let predicted = Point2::new(state.mean[0], state.mean[1]);
        let size = Self::object_size(&event.latest().bit_object);

        let candidates: Vec<(usize, &BitObject)> = ctx
            .unclaimed()
            .filter(|(_, d)| distance(predicted, d.centroid()) <= ctx.params.max_dist)
            .collect();
        let measurements: Vec<Measurement> = candidates
            .iter()
            .map(|(_, d)| Measurement::new(d.centroid().x, d.centroid().y))
            .collect();
        let gating = self.kalman.gating_distance(&state.mean, &state.covariance, size, &measurements);

        let best = candidates
            .iter()
            .zip(gating)
            .map(|((i, d), g)| (g, d.area(), *i))
            .min_by(compare_candidates);

        match best {
            Some((g, _, i)) => {
                debug!("Event {} Kalman match {} with gating distance {:.2}", event.event_num(), i, g);
                let object = ctx.detections[i].clone();
                self.correct(event, &object);
                TrackOutcome::Success {
                    object,
                    detection: Some(i),
                }
            }
            None => TrackOutcome::Skip { predicted },
        }
    }

    fn absorb(&self, event: &mut VisualEvent, object: &BitObject, ctx: &TrackingContext) {
        self.predict(event, ctx.frame_num);
        self.correct(event, object);
    }
}

/// Appearance voting around the last position. Claims the detection at the
/// voted centre, or moves the last mask there when no detection matches.
pub struct HoughTracker;

impl HoughTracker {
    fn rebuild(event: &mut VisualEvent, object: &BitObject, image: &RgbImage) {
        event.hough = Some(HoughModel::build(image, object));
    }
}

impl TrackingStrategy for HoughTracker {
    fn name(&self) -> &'static str {
        "hough"
    }

    fn initialize(&self, event: &mut VisualEvent, ctx: &TrackingContext) {
        let object = event.latest().bit_object.clone();
        Self::rebuild(event, &object, ctx.image);
    }

    fn attempt_extend(&self, event: &mut VisualEvent, ctx: &TrackingContext) -> TrackOutcome {
        let Some(model) = event.hough.as_ref() else {
            return TrackOutcome::Fail;
        };
        let latest = event.latest().bit_object.clone();
        let window = latest.bounding_box().grow(ctx.params.max_dist.ceil() as i32);
        let expected = event.predicted_location();

        let vote = match model.vote(ctx.image, &window, (expected.x.round() as i32, expected.y.round() as i32)) {
            Some(v) if v.confidence >= ctx.params.hough_min_confidence => v,
            other => {
                debug!(
                    "Event {} Hough vote too weak ({:?})",
                    event.event_num(),
                    other.map(|v| v.confidence)
                );
                return TrackOutcome::Skip { predicted: expected };
            }
        };
        // Another event already owns whatever is at the voted centre.
        let taken = ctx
            .detections
            .iter()
            .enumerate()
            .any(|(i, d)| ctx.claimed.get(i).copied().unwrap_or(false) && d.contains(vote.center.0, vote.center.1));
        if taken {
            debug!("Event {} Hough centre lies on a claimed detection", event.event_num());
            return TrackOutcome::Skip { predicted: expected };
        }

        let center = Point2::new(vote.center.0 as f32, vote.center.1 as f32);
        let bbox = latest.bounding_box();
        let reach = (bbox.width.max(bbox.height) as f32 / 2.0).max(1.0);

        let claimed = ctx
            .unclaimed()
            .filter(|(_, d)| d.contains(vote.center.0, vote.center.1) || distance(center, d.centroid()) <= reach)
            .map(|(i, d)| (distance(center, d.centroid()), d.area(), i))
            .min_by(compare_candidates);

        let (object, detection) = match claimed {
            Some((_, _, i)) => (ctx.detections[i].clone(), Some(i)),
            None => {
                let (lx, ly) = latest.centroid_px();
                let moved = latest.translated(vote.center.0 - lx, vote.center.1 - ly, &ctx.frame_rect());
                if !moved.is_valid() {
                    return TrackOutcome::Skip { predicted: expected };
                }
                (moved, None)
            }
        };

        debug!(
            "Event {} Hough centre ({}, {}) confidence {:.2} detection {:?}",
            event.event_num(),
            vote.center.0,
            vote.center.1,
            vote.confidence,
            detection
        );
        Self::rebuild(event, &object, ctx.image);
        TrackOutcome::Success { object, detection }
    }

    fn absorb(&self, event: &mut VisualEvent, object: &BitObject, ctx: &TrackingContext) {
        Self::rebuild(event, object, ctx.image);
    }
}

/// Runs `primary` and falls back on anything short of success. The strategy
/// that did not produce the object absorbs it.
pub struct HybridTracker {
    primary: Box<dyn TrackingStrategy>,
    fallback: Box<dyn TrackingStrategy>,
}

impl HybridTracker {
    pub fn new(primary: Box<dyn TrackingStrategy>, fallback: Box<dyn TrackingStrategy>) -> Self {
        Self { primary, fallback }
    }
}

impl TrackingStrategy for HybridTracker {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn initialize(&self, event: &mut VisualEvent, ctx: &TrackingContext) {
        self.primary.initialize(event, ctx);
        self.fallback.initialize(event, ctx);
    }

    fn attempt_extend(&self, event: &mut VisualEvent, ctx: &TrackingContext) -> TrackOutcome {
        let outcome = self.primary.attempt_extend(event, ctx);
        if let TrackOutcome::Success { object, .. } = &outcome {
            self.fallback.absorb(event, object, ctx);
            return outcome;
        }

        debug!(
            "Event {} {} tracker failed, trying {}",
            event.event_num(),
            self.primary.name(),
            self.fallback.name()
        );
        let outcome = self.fallback.attempt_extend(event, ctx);
        if let TrackOutcome::Success { object, .. } = &outcome {
            self.primary.absorb(event, object, ctx);
        }
        outcome
    }

    fn absorb(&self, event: &mut VisualEvent, object: &BitObject, ctx: &TrackingContext) {
        self.primary.absorb(event, object, ctx);
        self.fallback.absorb(event, object, ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::Rgb;

    fn square(left: i32, top: i32, size: i32) -> BitObject {
        BitObject::from_pixels((top..top + size).flat_map(|y| (left..left + size).map(move |x| (x, y))))
    }

    fn paint(objects: &[&BitObject]) -> RgbImage {
        let mut img = RgbImage::from_pixel(100, 100, Rgb([10, 10, 10]));
        for obj in objects {
            for (x, y) in obj.pixels() {
                img.put_pixel(x as u32, y as u32, Rgb([220, 220, 220]));
            }
        }
        img
    }

    fn ctx<'a>(
        image: &'a RgbImage,
        detections: &'a [BitObject],
        claimed: &'a [bool],
        params: &'a DetectionParameters,
    ) -> TrackingContext<'a> {
        TrackingContext {
            frame_num: 1,
            image,
            detections,
            claimed,
            params,
        }
    }

    #[test]
    fn test_nearest_neighbor_picks_closest() {
        let params = DetectionParameters::default();
        let img = paint(&[]);
        let mut event = VisualEvent::new(0, 0, square(20, 20, 4), TrackingMode::NearestNeighbor);
        let dets = vec![square(30, 20, 4), square(22, 21, 4), square(90, 90, 4)];
        let claimed = vec![false; 3];

        let outcome = NearestNeighborTracker.attempt_extend(&mut event, &ctx(&img, &dets, &claimed, &params));
        assert_eq!(
            outcome,
            TrackOutcome::Success {
                object: dets[1].clone(),
                detection: Some(1)
            }
        );
    }

    #[test]
    fn test_nearest_neighbor_tie_prefers_smaller_area() {
        let params = DetectionParameters::default();
        let img = paint(&[]);
        // Centroid at (21.5, 21.5)
        let mut event = VisualEvent::new(0, 0, square(20, 20, 4), TrackingMode::NearestNeighbor);
        // Both centred 10 px to the right
        let dets = vec![square(29, 19, 6), square(30, 20, 4)];
        let claimed = vec![false; 2];
        match NearestNeighborTracker.attempt_extend(&mut event, &ctx(&img, &dets, &claimed, &params)) {
            TrackOutcome::Success { detection, .. } => assert_eq!(detection, Some(1)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_nearest_neighbor_respects_gate_and_claims() {
        let params = DetectionParameters {
            max_dist: 5.0,
            ..Default::default()
        };
        let img = paint(&[]);
        let mut event = VisualEvent::new(0, 0, square(20, 20, 4), TrackingMode::NearestNeighbor);
        let dets = vec![square(21, 20, 4), square(40, 40, 4)];
        let claimed = vec![true, false];
        let outcome = NearestNeighborTracker.attempt_extend(&mut event, &ctx(&img, &dets, &claimed, &params));
        assert!(matches!(outcome, TrackOutcome::Skip { .. }));
    }

    #[test]
    fn test_kalman_tracks_and_coasts() {
        let params = DetectionParameters::default();
        let img = paint(&[]);
        let tracker = KalmanTracker::new();
        let mut event = VisualEvent::new(0, 0, square(20, 20, 4), TrackingMode::Kalman);
        let claimed = vec![false];
        tracker.initialize(&mut event, &ctx(&img, &[], &[], &params));

        let dets = vec![square(22, 20, 4)];
        let outcome = tracker.attempt_extend(&mut event, &ctx(&img, &dets, &claimed, &params));
        assert!(outcome.is_success());
        event.extend(1, dets[0].clone());
        let vx = event.kalman.as_ref().unwrap().mean[2];
        assert!(vx > 0.0);

        let outcome = tracker.attempt_extend(&mut event, &ctx(&img, &[], &[], &params));
        match outcome {
            TrackOutcome::Skip { predicted } => assert!(predicted.x > 23.5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_hough_claims_detection_at_vote() {
        let params = DetectionParameters::default();
        let start = square(20, 20, 6);
        let first = paint(&[&start]);
        let mut event = VisualEvent::new(0, 0, start.clone(), TrackingMode::Hough);
        HoughTracker.initialize(&mut event, &ctx(&first, &[], &[], &params));

        let moved = square(25, 22, 6);
        let second = paint(&[&moved]);
        let dets = vec![moved.clone()];
        let claimed = vec![false];
        let outcome = HoughTracker.attempt_extend(&mut event, &ctx(&second, &dets, &claimed, &params));
        assert_eq!(
            outcome,
            TrackOutcome::Success {
                object: moved,
                detection: Some(0)
            }
        );
    }

    #[test]
    fn test_hough_without_detection_moves_mask() {
        let params = DetectionParameters::default();
        let start = square(20, 20, 6);
        let mut event = VisualEvent::new(0, 0, start.clone(), TrackingMode::Hough);
        HoughTracker.initialize(&mut event, &ctx(&paint(&[&start]), &[], &[], &params));

        let moved = square(24, 20, 6);
        let outcome = HoughTracker.attempt_extend(&mut event, &ctx(&paint(&[&moved]), &[], &[], &params));
        match outcome {
            TrackOutcome::Success { object, detection } => {
                assert_eq!(detection, None);
                assert_eq!(object.area(), 36);
                assert_eq!(object.bounding_box(), moved.bounding_box());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_hough_weak_vote_coasts() {
        let params = DetectionParameters::default();
        let start = square(20, 20, 6);
        let mut event = VisualEvent::new(0, 0, start.clone(), TrackingMode::Hough);
        HoughTracker.initialize(&mut event, &ctx(&paint(&[&start]), &[], &[], &params));

        let outcome = HoughTracker.attempt_extend(&mut event, &ctx(&paint(&[]), &[], &[], &params));
        assert_eq!(
            outcome,
            TrackOutcome::Skip {
                predicted: Point2::new(22.5, 22.5)
            }
        );
    }

    #[test]
    fn test_hough_vote_on_claimed_detection_coasts() {
        let params = DetectionParameters::default();
        let start = square(20, 20, 6);
        let mut event = VisualEvent::new(0, 0, start.clone(), TrackingMode::Hough);
        HoughTracker.initialize(&mut event, &ctx(&paint(&[&start]), &[], &[], &params));

        let dets = vec![start.clone()];
        let claimed = vec![true];
        let outcome = HoughTracker.attempt_extend(&mut event, &ctx(&paint(&[&start]), &dets, &claimed, &params));
        assert!(matches!(outcome, TrackOutcome::Skip { .. }));
    }

    #[test]
    fn test_absorb_after_skip_predicts_once() {
        let params = DetectionParameters::default();
        let start = square(20, 20, 4);
        let blank = paint(&[]);
        let hybrid = strategy_for(TrackingMode::KalmanHough);
        let mut event = VisualEvent::new(0, 0, start.clone(), TrackingMode::KalmanHough);
        hybrid.initialize(&mut event, &ctx(&paint(&[&start]), &[], &[], &params));

        // Neither Hough nor Kalman finds anything, then a late detection
        // is absorbed in the same frame.
        let outcome = hybrid.attempt_extend(&mut event, &ctx(&blank, &[], &[], &params));
        assert!(matches!(outcome, TrackOutcome::Skip { .. }));
        let late = square(21, 20, 4);
        hybrid.absorb(&mut event, &late, &ctx(&blank, &[], &[], &params));

        let kf = KalmanFilter::new();
        let (mean, cov) = kf.initiate(&Measurement::new(21.5, 21.5), 4.0);
        let (mean, cov) = kf.predict(&mean, &cov, 4.0);
        let (mean, cov) = kf.update(&mean, &cov, &Measurement::new(22.5, 21.5), 4.0);

        let state = event.kalman.as_ref().unwrap();
        assert_eq!(state.predicted_frame, Some(1));
        for i in 0..4 {
            assert_relative_eq!(state.mean[i], mean[i], epsilon = 1e-4);
            assert_relative_eq!(state.covariance[(i, i)], cov[(i, i)], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_hybrid_falls_back_when_hough_fails() {
        let params = DetectionParameters::default();
        let start = square(20, 20, 6);
        let hybrid = strategy_for(TrackingMode::NearestNeighborHough);
        let mut event = VisualEvent::new(0, 0, start.clone(), TrackingMode::NearestNeighborHough);
        hybrid.initialize(&mut event, &ctx(&paint(&[&start]), &[], &[], &params));

        // The object vanished from the image but a detection is still reported.
        let blank = paint(&[]);
        let dets = vec![square(22, 20, 6)];
        let claimed = vec![false];
        let outcome = hybrid.attempt_extend(&mut event, &ctx(&blank, &dets, &claimed, &params));
        assert_eq!(
            outcome,
            TrackOutcome::Success {
                object: dets[0].clone(),
                detection: Some(0)
            }
        );
    }
}
