use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

use crate::bit_object::{BitObject, Rect};
use crate::config::{DetectionParameters, TrackingMode};
use crate::hough::HoughModel;
use crate::kalman_filter::{KalmanCovariance, KalmanMean};

/// Lifecycle of a tracked event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventState {
    Candidate,
    Interesting,
    /// No longer updated. `interesting` records whether it was promoted.
    Closed { interesting: bool },
}

/// Class label assigned by the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub class_id: usize,
    pub class_name: String,
    pub probability: f64,
}

/// Per-frame snapshot of an event used for rendering and export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub frame_num: u32,
    pub location: Point2<f32>,
    pub bbox: Rect,
    pub area: u32,
    pub smv: f32,
    pub class_name: Option<String>,
    pub class_probability: f64,
    /// True when the event coasted through this frame without new data.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub bit_object: BitObject,
    pub token: Token,
}

/// Kalman state carried between frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanState {
    pub mean: KalmanMean,
    pub covariance: KalmanCovariance,
    /// Frame the state was last predicted into.
    #[serde(default)]
    pub predicted_frame: Option<u32>,
}

/// A tracked organism or particle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualEvent {
    event_num: u32,
    state: EventState,
    tracking_mode: TrackingMode,
    history: Vec<Observation>,
    consecutive_skips: u32,
    last_success_frame: u32,
    classification: Option<Classification>,
    foe: Option<Point2<f32>>,
    pub(crate) kalman: Option<KalmanState>,
    pub(crate) hough: Option<HoughModel>,
    flushed: bool,
}

impl VisualEvent {
    /// Start a Candidate event with its first observation.
    pub fn new(event_num: u32, frame_num: u32, object: BitObject, tracking_mode: TrackingMode) -> Self {
        let token = make_token(frame_num, &object, None, false);
        Self {
            event_num,
            state: EventState::Candidate,
            tracking_mode,
            history: vec![Observation { bit_object: object, token }],
            consecutive_skips: 0,
            last_success_frame: frame_num,
            classification: None,
            foe: None,
            kalman: None,
            hough: None,
            flushed: false,
        }
    }

    pub fn event_num(&self) -> u32 {
        self.event_num
    }

    pub fn state(&self) -> EventState {
        self.state
    }

    pub fn tracking_mode(&self) -> TrackingMode {
        self.tracking_mode
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, EventState::Closed { .. })
    }

    pub fn is_interesting(&self) -> bool {
        matches!(self.state, EventState::Interesting | EventState::Closed { interesting: true })
    }

    pub fn start_frame(&self) -> u32 {
        self.history[0].token.frame_num
    }

    pub fn end_frame(&self) -> u32 {
        self.latest().token.frame_num
    }

    pub fn num_frames(&self) -> usize {
        self.history.len()
    }

    /// Frames with a real (not coasted) observation.
    pub fn num_tracked_frames(&self) -> usize {
        self.history.iter().filter(|o| !o.token.skipped).count()
    }

    pub fn history(&self) -> &[Observation] {
        &self.history
    }

    pub fn latest(&self) -> &Observation {
        // history is never empty
        &self.history[self.history.len() - 1]
    }

    pub fn observation_at(&self, frame_num: u32) -> Option<&Observation> {
        let start = self.start_frame();
        if frame_num < start {
            return None;
        }
        self.history
            .get((frame_num - start) as usize)
            .filter(|o| o.token.frame_num == frame_num)
            .or_else(|| self.history.iter().find(|o| o.token.frame_num == frame_num))
    }

    pub fn token_at(&self, frame_num: u32) -> Option<&Token> {
        self.observation_at(frame_num).map(|o| &o.token)
    }

    pub fn consecutive_skips(&self) -> u32 {
        self.consecutive_skips
    }

    pub fn last_success_frame(&self) -> u32 {
        self.last_success_frame
    }

    pub fn classification(&self) -> Option<&Classification> {
        self.classification.as_ref()
    }

    pub fn set_classification(&mut self, classification: Classification) {
        for obs in self.history.iter_mut() {
            obs.token.class_name = Some(classification.class_name.clone());
            obs.token.class_probability = classification.probability;
        }
        self.classification = Some(classification);
    }

    /// Focus of expansion recorded by the last reset.
    pub fn foe(&self) -> Option<Point2<f32>> {
        self.foe
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub(crate) fn mark_flushed(&mut self) {
        self.flushed = true;
    }

    /// Centroid displacement between the last two observations.
    pub fn velocity(&self) -> Vector2<f32> {
        match self.history.len() {
            0 | 1 => Vector2::zeros(),
            n => self.history[n - 1].token.location - self.history[n - 2].token.location,
        }
    }

    /// Mean displacement per frame over the whole history.
    pub fn speed(&self) -> f32 {
        if self.history.len() < 2 {
            return 0.0;
        }
        let total: f32 = self
            .history
            .windows(2)
            .map(|w| (w[1].token.location - w[0].token.location).norm())
            .sum();
        total / (self.history.len() - 1) as f32
    }

    /// Magnitude of the change in velocity over the last three observations.
    pub fn acceleration(&self) -> f32 {
        let n = self.history.len();
        if n < 3 {
            return 0.0;
        }
        let v1 = self.history[n - 2].token.location - self.history[n - 3].token.location;
        let v2 = self.history[n - 1].token.location - self.history[n - 2].token.location;
        (v2 - v1).norm()
    }

    /// Position the event is expected at in the next frame.
    pub fn predicted_location(&self) -> Point2<f32> {
        match &self.kalman {
            Some(k) => Point2::new(k.mean[0] + k.mean[2], k.mean[1] + k.mean[3]),
            None => self.latest().token.location + self.velocity(),
        }
    }

    /// Record a successful update.
    pub fn extend(&mut self, frame_num: u32, object: BitObject) {
        let token = make_token(frame_num, &object, self.classification.as_ref(), false);
        self.history.push(Observation { bit_object: object, token });
        self.consecutive_skips = 0;
        self.last_success_frame = frame_num;
    }

    /// Swap a coasted latest observation for a real one.
    pub(crate) fn replace_coasted(&mut self, frame_num: u32, object: BitObject) {
        if self.history.len() > 1 && self.latest().token.skipped {
            self.history.pop();
        }
        self.extend(frame_num, object);
    }

    /// Advance without new data: the last mask is moved to `predicted`.
    pub fn coast(&mut self, frame_num: u32, predicted: Point2<f32>, frame: &Rect) {
        let last = &self.latest().bit_object;
        let shift = predicted - last.centroid();
        let mut object = last.translated(shift.x.round() as i32, shift.y.round() as i32, frame);
        if !object.is_valid() {
            object = last.clone();
        }
        let mut token = make_token(frame_num, &object, self.classification.as_ref(), true);
        token.location = predicted;
        self.history.push(Observation { bit_object: object, token });
        self.consecutive_skips += 1;
    }

    /// Candidate -> Interesting once enough real frames are tracked and the
    /// class probability, if any, is high enough.
    pub fn promote(&mut self, params: &DetectionParameters) -> bool {
        if self.state != EventState::Candidate {
            return false;
        }
        if self.num_tracked_frames() < params.min_event_frames as usize {
            return false;
        }
        if let Some(c) = &self.classification {
            if c.probability < params.min_class_probability {
                return false;
            }
        }
        self.state = EventState::Interesting;
        true
    }

    /// Stop tracking. Trailing coasted observations are dropped, but never
    /// the last remaining one.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        while self.history.len() > 1 && self.latest().token.skipped {
            self.history.pop();
        }
        self.consecutive_skips = 0;
        self.state = EventState::Closed {
            interesting: self.state == EventState::Interesting,
        };
    }

    /// Replace the latest object's SMV and remember the focus of expansion.
    pub(crate) fn reset_latest(&mut self, smv: f32, foe: Point2<f32>) {
        let n = self.history.len() - 1;
        self.history[n].bit_object.set_smv(smv);
        self.history[n].token.smv = smv;
        self.foe = Some(foe);
    }
}

fn make_token(frame_num: u32, object: &BitObject, class: Option<&Classification>, skipped: bool) -> Token {
    Token {
        frame_num,
        location: object.centroid(),
        bbox: object.bounding_box(),
        area: object.area(),
        smv: object.smv(),
        class_name: class.map(|c| c.class_name.clone()),
        class_probability: class.map_or(0.0, |c| c.probability),
        skipped,
    }
}
