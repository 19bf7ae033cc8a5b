use image::{GrayImage, Luma, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bit_object::{BitObject, Rect, Winner};
use crate::config::{DetectionParameters, HIGH_SALIENCE_VOLTAGE, SEGMENT_WINDOW_SCALE};
use crate::preprocess::{luminance, luminance_std_dev};

/// Turns a frame's saliency winners into a filtered list of objects.
pub struct ObjectDetection {
    params: Arc<DetectionParameters>,
}

impl ObjectDetection {
    pub fn new(params: Arc<DetectionParameters>) -> Self {
        Self { params }
    }

    /// Extract candidate objects for every winner and, if configured, drop
    /// overlapping ones.
    pub fn run(&self, winners: &[Winner], segment_in: &RgbImage) -> Vec<BitObject> {
        let p = &self.params;
        let mut unfiltered: Vec<BitObject> = Vec::new();

        for winner in winners {
            let foa = &winner.foa;
            // Too small a mask can't contain a valid object.
            if foa.area() < p.min_event_area {
                continue;
            }

            if p.use_foa_mask_region {
                let mut found = self.segment_foa_region(winner, segment_in);
                // Newest winner's objects go first.
                found.append(&mut unfiltered);
                unfiltered = found;
            } else if p.area_in_bounds(foa.area()) {
                debug!("Using FOA mask as detected object, area {}", foa.area());
                let mut obj = foa.clone();
                obj.set_smv(winner.voltage);
                unfiltered.push(obj);
            } else {
                debug!(
                    "FOA mask area {} outside [{}, {}]",
                    foa.area(),
                    p.min_event_area,
                    p.max_event_area
                );
            }
        }

        debug!("Found {} unfiltered object(s)", unfiltered.len());
        let filtered = if p.remove_overlapping_detections {
            resolve_overlaps(unfiltered)
        } else {
            unfiltered.into_iter().filter(BitObject::is_valid).collect()
        };
        info!("Found total {} object(s)", filtered.len());
        filtered
    }

    fn segment_foa_region(&self, winner: &Winner, image: &RgbImage) -> Vec<BitObject> {
        let p = &self.params;
        let foa = &winner.foa;
        let frame = Rect::frame(image.width(), image.height());
        let foa_box = foa.bounding_box();
        let center = foa.centroid_px();

        let search = Rect::center_dims(center, foa_box.width, foa_box.height)
            .overlap(&frame)
            .unwrap_or_default();
        let segment = Rect::center_dims(
            center,
            (foa_box.width as f32 * SEGMENT_WINDOW_SCALE) as i32,
            (foa_box.height as f32 * SEGMENT_WINDOW_SCALE) as i32,
        )
        .overlap(&frame)
        .unwrap_or_default();

        // Very salient points are never rejected for size alone.
        let min_area = if winner.voltage > HIGH_SALIENCE_VOLTAGE {
            1
        } else {
            p.min_event_area
        };
        let max_area = p.max_event_area;

        debug!(
            "Extracting objects for frame {} winner ({}, {}) search {:?} min {} max {}",
            winner.frame_num, winner.x, winner.y, search, min_area, max_area
        );

        let segment_area = segment.area() as f64;
        let mut keep: Vec<BitObject> = extract_bit_objects(image, &search, &segment, min_area, max_area)
            .into_iter()
            // An object filling most of the window is background, not a detection.
            .filter(|obj| obj.area() as f64 <= 0.5 * segment_area)
            .collect();
        for obj in keep.iter_mut() {
            obj.set_smv(winner.voltage);
        }

        if keep.is_empty() {
            if foa.area() >= min_area && foa.area() <= max_area {
                debug!("No segmented object, falling back to FOA mask of area {}", foa.area());
                let mut obj = foa.clone();
                obj.set_smv(winner.voltage);
                keep.push(obj);
            } else {
                debug!("FOA mask area {} outside [{}, {}]", foa.area(), min_area, max_area);
            }
        }
        keep
    }
}

/// Connected foreground regions of `segment` that touch `search` and whose
/// area lies in [`min_area`, `max_area`], in label order.
///
/// Foreground is luminance above the window mean plus one standard
/// deviation (at least one grey level).
pub fn extract_bit_objects(
    image: &RgbImage,
    search: &Rect,
    segment: &Rect,
    min_area: u32,
    max_area: u32,
) -> Vec<BitObject> {
    if segment.is_empty() {
        return Vec::new();
    }
    let lum = luminance(image);
    let window = image::imageops::crop_imm(
        &lum,
        segment.left as u32,
        segment.top as u32,
        segment.width as u32,
        segment.height as u32,
    )
    .to_image();

    let mean = window.as_raw().iter().map(|&v| v as f64).sum::<f64>() / window.as_raw().len() as f64;
    let threshold = mean + luminance_std_dev(&window).max(1.0);
    let binary = GrayImage::from_fn(window.width(), window.height(), |x, y| {
        if window.get_pixel(x, y).0[0] as f64 > threshold {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });

    let labels = connected_components(&binary, Connectivity::Eight, Luma([0u8]));
    let mut regions: BTreeMap<u32, Vec<(i32, i32)>> = BTreeMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        if label.0[0] != 0 {
            regions
                .entry(label.0[0])
                .or_default()
                .push((x as i32 + segment.left, y as i32 + segment.top));
        }
    }

    regions
        .into_values()
        .map(BitObject::from_pixels)
        .filter(|obj| obj.bounding_box().intersects(search))
        .filter(|obj| obj.area() >= min_area && obj.area() <= max_area)
        .collect()
}

/// Greedy smallest-first sweep: the smallest remaining object is accepted
/// unless its mask intersects an already accepted one. The first object
/// encountered wins among equal areas.
pub fn resolve_overlaps(mut remaining: Vec<BitObject>) -> Vec<BitObject> {
    let mut accepted: Vec<BitObject> = Vec::new();
    while !remaining.is_empty() {
        let mut smallest = 0;
        for (i, obj) in remaining.iter().enumerate() {
            if obj.area() < remaining[smallest].area() {
                smallest = i;
            }
        }
        let candidate = remaining.remove(smallest);
        if !candidate.is_valid() {
            continue;
        }
        if accepted.iter().any(|kept| kept.does_intersect(&candidate)) {
            debug!("Dropping object of area {} overlapping a smaller one", candidate.area());
            continue;
        }
        accepted.push(candidate);
    }
    accepted
}
