//! The tracking core: owns every event of a run and advances them one frame
//! at a time.

use image::RgbImage;
use log::{debug, info, warn};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, Write};
use std::sync::Arc;

use crate::bit_object::{BitObject, Rect};
use crate::classifier::{Classify, FeatureCollection};
use crate::config::DetectionParameters;
use crate::error::{EventError, Result};
use crate::event::{Token, VisualEvent};
use crate::hough::HoughModel;
use crate::tracker::{strategy_for, TrackOutcome, TrackingContext};

/// Version written into every stream header.
pub const STREAM_VERSION: u32 = 1;

/// The frame being processed.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub frame_num: u32,
    pub image: &'a RgbImage,
}

impl<'a> FrameContext<'a> {
    pub fn new(frame_num: u32, image: &'a RgbImage) -> Self {
        Self { frame_num, image }
    }

    pub fn dims(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Result of one `update_events` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSummary {
    /// `assignments[i]` is the event owning detection `i`. Only invalid
    /// (empty) detections are left unassigned.
    pub assignments: Vec<Option<u32>>,
    pub created: Vec<u32>,
    pub closed: Vec<u32>,
}

/// How `initiate_events` placed one detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub detection: usize,
    pub event_num: u32,
    pub created: bool,
}

/// First line of a serialized event set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSetHeader {
    pub version: u32,
    pub file_name: String,
    pub start_frame: Option<u32>,
    pub end_frame: Option<u32>,
    pub next_event_num: u32,
    pub event_numbers: Vec<u32>,
}

pub struct VisualEventSet {
    params: Arc<DetectionParameters>,
    file_name: String,
    events: BTreeMap<u32, VisualEvent>,
    next_event_num: u32,
}

/// Why `event` should stop, if it should.
fn failure_reason(params: &DetectionParameters, event: &VisualEvent, frame: &Rect) -> Option<&'static str> {
    let latest = &event.latest().token;
    let (x, y) = (latest.location.x, latest.location.y);
    if x < frame.left as f32 || y < frame.top as f32 || x >= frame.right() as f32 || y >= frame.bottom() as f32 {
        return Some("left the frame");
    }
    if event.consecutive_skips() > params.max_frame_skip {
        return Some("too many skipped frames");
    }
    if latest.area < 1 || latest.area > params.max_event_area {
        return Some("area out of bounds");
    }
    if params.max_event_frames > 0 && event.num_frames() > params.max_event_frames as usize {
        return Some("too many frames");
    }
    None
}

impl VisualEventSet {
    pub fn new(params: Arc<DetectionParameters>, file_name: impl Into<String>) -> Self {
        Self {
            params,
            file_name: file_name.into(),
            events: BTreeMap::new(),
            next_event_num: 0,
        }
    }

    /// Load a set previously written by `write_to_stream`.
    pub fn from_stream<R: BufRead>(params: Arc<DetectionParameters>, reader: R) -> Result<Self> {
        let mut set = Self::new(params, String::new());
        set.read_from_stream(reader)?;
        Ok(set)
    }

    pub fn params(&self) -> &DetectionParameters {
        &self.params
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn next_event_num(&self) -> u32 {
        self.next_event_num
    }

    /// Advance every open event into `ctx.frame_num`, then hand each
    /// unclaimed detection to an event.
    ///
    /// Events are visited in ascending number, so a lower-numbered event
    /// claims a contested detection first.
    pub fn update_events(
        &mut self,
        ctx: &FrameContext,
        detections: &[BitObject],
        classifier: Option<&dyn Classify>,
        features: Option<&FeatureCollection>,
    ) -> UpdateSummary {
        let params = Arc::clone(&self.params);
        let frame_rect = Rect::frame(ctx.image.width(), ctx.image.height());
        let mut claimed = vec![false; detections.len()];
        let mut summary = UpdateSummary {
            assignments: vec![None; detections.len()],
            ..Default::default()
        };

        let open: Vec<u32> = self.events.values().filter(|e| e.is_open()).map(|e| e.event_num()).collect();
        for num in open {
            let Some(event) = self.events.get_mut(&num) else {
                continue;
            };
            if event.end_frame() >= ctx.frame_num {
                continue;
            }

            let strategy = strategy_for(event.tracking_mode());
            let outcome = {
                let tctx = TrackingContext {
                    frame_num: ctx.frame_num,
                    image: ctx.image,
                    detections,
                    claimed: &claimed,
                    params: &params,
                };
                strategy.attempt_extend(event, &tctx)
            };

            match outcome {
                TrackOutcome::Success { object, detection } => {
                    if let Some(i) = detection {
                        claimed[i] = true;
                        summary.assignments[i] = Some(num);
                    }
                    event.extend(ctx.frame_num, object);
                }
                TrackOutcome::Skip { predicted } => {
                    debug!("Event {} coasting at ({:.1}, {:.1})", num, predicted.x, predicted.y);
                    event.coast(ctx.frame_num, predicted, &frame_rect);
                }
                TrackOutcome::Fail => {
                    debug!("Event {} {} tracker failed", num, strategy.name());
                    event.close();
                    summary.closed.push(num);
                    continue;
                }
            }

            if let Some(reason) = failure_reason(&params, event, &frame_rect) {
                debug!("Closing event {}: {}", num, reason);
                event.close();
                summary.closed.push(num);
            }
        }

        for assignment in self.initiate_events(ctx, detections, &claimed) {
            claimed[assignment.detection] = true;
            summary.assignments[assignment.detection] = Some(assignment.event_num);
            if assignment.created {
                summary.created.push(assignment.event_num);
            }
        }

        if let (Some(classifier), Some(features)) = (classifier, features) {
            self.classify_current(ctx.frame_num, classifier, features);
        }

        for event in self.events.values_mut() {
            if event.is_open() && event.promote(&params) {
                debug!("Event {} is interesting", event.event_num());
            }
        }

        info!(
            "Frame {}: {} detection(s), {} new event(s), {} closed, {} total",
            ctx.frame_num,
            detections.len(),
            summary.created.len(),
            summary.closed.len(),
            self.events.len()
        );
        summary
    }

    /// Place every unclaimed detection. A detection intersecting an open
    /// event's object in this frame belongs to that event; the rest start
    /// new Candidate events.
    pub fn initiate_events(&mut self, ctx: &FrameContext, detections: &[BitObject], claimed: &[bool]) -> Vec<Assignment> {
        let params = Arc::clone(&self.params);
        let mut taken = claimed.to_vec();
        taken.resize(detections.len(), false);
        let mut placed = Vec::new();

        for (i, det) in detections.iter().enumerate() {
            if taken[i] || !det.is_valid() {
                continue;
            }

            if let Some(num) = self.intersecting_event(det, ctx.frame_num) {
                if let Some(event) = self.events.get_mut(&num) {
                    // A coasted observation is replaced by the real one.
                    if event.latest().token.skipped && event.end_frame() == ctx.frame_num {
                        event.replace_coasted(ctx.frame_num, det.clone());
                        let tctx = TrackingContext {
                            frame_num: ctx.frame_num,
                            image: ctx.image,
                            detections,
                            claimed: &taken,
                            params: &params,
                        };
                        strategy_for(event.tracking_mode()).absorb(event, det, &tctx);
                    }
                }
                debug!("Detection {} absorbed by event {}", i, num);
                taken[i] = true;
                placed.push(Assignment {
                    detection: i,
                    event_num: num,
                    created: false,
                });
                continue;
            }

            let num = self.next_event_num;
            self.next_event_num += 1;
            let mut event = VisualEvent::new(num, ctx.frame_num, det.clone(), params.tracking_mode);
            {
                let tctx = TrackingContext {
                    frame_num: ctx.frame_num,
                    image: ctx.image,
                    detections,
                    claimed: &taken,
                    params: &params,
                };
                strategy_for(params.tracking_mode).initialize(&mut event, &tctx);
            }
            debug!(
                "Starting event {} at ({:.1}, {:.1}) area {}",
                num,
                det.centroid().x,
                det.centroid().y,
                det.area()
            );
            self.events.insert(num, event);
            taken[i] = true;
            placed.push(Assignment {
                detection: i,
                event_num: num,
                created: true,
            });
        }
        placed
    }

    fn classify_current(&mut self, frame_num: u32, classifier: &dyn Classify, features: &FeatureCollection) {
        for event in self.events.values_mut() {
            if !event.is_open() || event.end_frame() != frame_num || event.latest().token.skipped {
                continue;
            }
            let Some(fv) = features.get(event.event_num(), frame_num) else {
                continue;
            };
            match classifier.classify(fv) {
                Ok(class) => event.set_classification(class),
                Err(e) => warn!("Could not classify event {}: {}", event.event_num(), e),
            }
        }
    }

    /// True when `event` should be closed in a frame of size `dims`.
    pub fn check_failure_conditions(&self, event: &VisualEvent, dims: (u32, u32)) -> bool {
        failure_reason(&self.params, event, &Rect::frame(dims.0, dims.1)).is_some()
    }

    /// Close stale events and drop the ones nobody needs any more.
    ///
    /// An open event closes when its last successful update is more than
    /// `max_frame_skip` frames behind `curr_frame`, or when `curr_frame`
    /// reached `last_frame`. Closed events that never became interesting,
    /// or that were already flushed, are removed.
    pub fn clean_up(&mut self, curr_frame: u32, last_frame: u32) -> Vec<u32> {
        let max_skip = self.params.max_frame_skip;
        let mut closed = Vec::new();
        for event in self.events.values_mut().filter(|e| e.is_open()) {
            if curr_frame >= last_frame || curr_frame.saturating_sub(event.last_success_frame()) > max_skip {
                event.close();
                closed.push(event.event_num());
            }
        }

        let before = self.events.len();
        self.events
            .retain(|_, e| !(e.is_closed() && (!e.is_interesting() || e.is_flushed())));
        let removed = before - self.events.len();
        if !closed.is_empty() || removed > 0 {
            debug!("Clean up at frame {}: closed {:?}, removed {}", curr_frame, closed, removed);
        }
        closed
    }

    pub fn close_all(&mut self) {
        for event in self.events.values_mut() {
            event.close();
        }
    }

    pub fn num_events(&self) -> usize {
        self.events.len()
    }

    /// Drop every event. Event numbers keep counting up.
    pub fn reset(&mut self) {
        self.events.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &VisualEvent> {
        self.events.values()
    }

    pub fn event_numbers(&self) -> Vec<u32> {
        self.events.keys().copied().collect()
    }

    /// Smallest latest-object area among open events.
    pub fn min_size(&self) -> Option<u32> {
        self.events
            .values()
            .filter(|e| e.is_open())
            .map(|e| e.latest().token.area)
            .min()
    }

    pub fn tokens(&self, frame_num: u32) -> Vec<Token> {
        self.events
            .values()
            .filter_map(|e| e.token_at(frame_num).cloned())
            .collect()
    }

    /// Events, open or closed, with an observation at `frame_num`.
    pub fn events_for_frame(&self, frame_num: u32) -> Vec<&VisualEvent> {
        self.events
            .values()
            .filter(|e| e.observation_at(frame_num).is_some())
            .collect()
    }

    pub fn bit_objects_for_frame(&self, frame_num: u32) -> Vec<BitObject> {
        self.events
            .values()
            .filter_map(|e| e.observation_at(frame_num).map(|o| o.bit_object.clone()))
            .collect()
    }

    /// Closed, unflushed events that ended at or before `frame_num`.
    pub fn events_ready_to_save(&self, frame_num: u32) -> Vec<&VisualEvent> {
        self.events
            .values()
            .filter(|e| e.is_closed() && !e.is_flushed() && e.end_frame() <= frame_num)
            .collect()
    }

    pub fn mark_flushed(&mut self, event_num: u32) -> bool {
        match self.events.get_mut(&event_num) {
            Some(event) => {
                event.mark_flushed();
                true
            }
            None => false,
        }
    }

    /// Last frame for which every event touching it is closed, i.e. output
    /// up to this frame is final.
    pub fn all_closed_frame_num(&self, curr_frame: u32) -> Option<u32> {
        match self.events.values().filter(|e| e.is_open()).map(|e| e.start_frame()).min() {
            None => Some(curr_frame),
            Some(start) => start.checked_sub(1),
        }
    }

    pub fn does_event_exist(&self, event_num: u32) -> bool {
        self.events.contains_key(&event_num)
    }

    pub fn event_by_number(&self, event_num: u32) -> Option<&VisualEvent> {
        self.events.get(&event_num)
    }

    pub fn event_by_number_mut(&mut self, event_num: u32) -> Option<&mut VisualEvent> {
        self.events.get_mut(&event_num)
    }

    pub fn replace_event(&mut self, event_num: u32, event: VisualEvent) -> Result<()> {
        if event.event_num() != event_num {
            return Err(EventError::config(format!(
                "replacement event has number {} instead of {}",
                event.event_num(),
                event_num
            )));
        }
        match self.events.get_mut(&event_num) {
            Some(slot) => {
                *slot = event;
                Ok(())
            }
            None => Err(EventError::config(format!("no event {}", event_num))),
        }
    }

    /// Add an event built elsewhere. Its number must not be in use.
    pub fn insert(&mut self, event: VisualEvent) -> Result<()> {
        let num = event.event_num();
        if self.events.contains_key(&num) {
            return Err(EventError::config(format!("event {} already exists", num)));
        }
        self.next_event_num = self.next_event_num.max(num + 1);
        self.events.insert(num, event);
        Ok(())
    }

    /// Mean speed of open events with some motion history.
    pub fn average_speed(&self) -> f32 {
        let speeds: Vec<f32> = self
            .events
            .values()
            .filter(|e| e.is_open() && e.num_frames() > 1)
            .map(|e| e.speed())
            .collect();
        if speeds.is_empty() {
            0.0
        } else {
            speeds.iter().sum::<f32>() / speeds.len() as f32
        }
    }

    /// (min, max) latest area over open events.
    pub fn area_range(&self) -> Option<(u32, u32)> {
        self.events
            .values()
            .filter(|e| e.is_open())
            .map(|e| e.latest().token.area)
            .fold(None, |range, a| match range {
                None => Some((a, a)),
                Some((lo, hi)) => Some((lo.min(a), hi.max(a))),
            })
    }

    /// Mean acceleration of open events other than `skip_event`.
    pub fn acceleration(&self, skip_event: u32) -> f32 {
        let values: Vec<f32> = self
            .events
            .values()
            .filter(|e| e.is_open() && e.event_num() != skip_event && e.num_frames() > 2)
            .map(|e| e.acceleration())
            .collect();
        if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f32>() / values.len() as f32
        }
    }

    /// One line per observation: event, frame, x, y.
    pub fn write_positions<W: Write>(&self, writer: &mut W) -> Result<()> {
        for event in self.events.values() {
            for obs in event.history() {
                writeln!(
                    writer,
                    "{} {} {:.2} {:.2}",
                    event.event_num(),
                    obs.token.frame_num,
                    obs.token.location.x,
                    obs.token.location.y
                )?;
            }
        }
        Ok(())
    }

    pub fn does_intersect(&self, obj: &BitObject, frame_num: u32) -> bool {
        self.intersecting_event(obj, frame_num).is_some()
    }

    /// Lowest-numbered open event whose object at `frame_num` intersects `obj`.
    pub fn intersecting_event(&self, obj: &BitObject, frame_num: u32) -> Option<u32> {
        self.events
            .values()
            .filter(|e| e.is_open())
            .find(|e| {
                e.observation_at(frame_num)
                    .map_or(false, |o| o.bit_object.does_intersect(obj))
            })
            .map(|e| e.event_num())
    }

    /// Re-anchor the event intersecting `obj`: its salience becomes `obj`'s,
    /// the focus of expansion is remembered and the appearance model is
    /// rebuilt from `obj`.
    pub fn reset_intersect(&mut self, image: &RgbImage, obj: &BitObject, foe: Point2<f32>, frame_num: u32) -> bool {
        let Some(num) = self.intersecting_event(obj, frame_num) else {
            return false;
        };
        let Some(event) = self.events.get_mut(&num) else {
            return false;
        };
        event.reset_latest(obj.smv(), foe);
        event.hough = Some(HoughModel::build(image, obj));
        debug!("Reset event {} at frame {}", num, frame_num);
        true
    }

    pub fn header(&self) -> EventSetHeader {
        EventSetHeader {
            version: STREAM_VERSION,
            file_name: self.file_name.clone(),
            start_frame: self.events.values().map(|e| e.start_frame()).min(),
            end_frame: self.events.values().map(|e| e.end_frame()).max(),
            next_event_num: self.next_event_num,
            event_numbers: self.event_numbers(),
        }
    }

    pub fn write_header<W: Write>(&self, writer: &mut W) -> Result<()> {
        serde_json::to_writer(&mut *writer, &self.header())?;
        writeln!(writer)?;
        Ok(())
    }

    /// Read only the header line.
    pub fn read_header<R: BufRead>(reader: &mut R) -> Result<EventSetHeader> {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(EventError::malformed("missing header"));
        }
        let header: EventSetHeader = serde_json::from_str(line.trim_end())?;
        if header.version != STREAM_VERSION {
            return Err(EventError::malformed(format!(
                "unsupported version {} (expected {})",
                header.version, STREAM_VERSION
            )));
        }
        Ok(header)
    }

    pub fn write_to_stream<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.write_header(writer)?;
        for event in self.events.values() {
            serde_json::to_writer(&mut *writer, event)?;
            writeln!(writer)?;
        }
        Ok(())
    }

    /// Replace this set's contents with a stream. The set is unchanged if
    /// the stream is malformed.
    pub fn read_from_stream<R: BufRead>(&mut self, mut reader: R) -> Result<()> {
        let header = Self::read_header(&mut reader)?;
        let expected: BTreeSet<u32> = header.event_numbers.iter().copied().collect();
        if expected.len() != header.event_numbers.len() {
            return Err(EventError::malformed("duplicate event numbers in header"));
        }

        let mut events = BTreeMap::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: VisualEvent = serde_json::from_str(&line)
                .map_err(|e| EventError::malformed(format!("event line {}: {}", index + 2, e)))?;
            let num = event.event_num();
            if event.history().is_empty() {
                return Err(EventError::malformed(format!("event {} has no observations", num)));
            }
            if num >= header.next_event_num {
                return Err(EventError::malformed(format!(
                    "event {} not below next event number {}",
                    num, header.next_event_num
                )));
            }
            if !expected.contains(&num) {
                return Err(EventError::malformed(format!("event {} not listed in header", num)));
            }
            if events.insert(num, event).is_some() {
                return Err(EventError::malformed(format!("event {} appears twice", num)));
            }
        }
        if events.len() != expected.len() {
            return Err(EventError::malformed(format!(
                "header lists {} events, stream has {}",
                expected.len(),
                events.len()
            )));
        }

        self.file_name = header.file_name;
        self.next_event_num = header.next_event_num;
        self.events = events;
        info!("Loaded {} event(s)", self.events.len());
        Ok(())
    }
}
