//! Generalized Hough appearance model: every object pixel remembers its
//! offset to the centroid, indexed by luminance bin. Pixels in a new frame
//! vote for the centre positions their bin's offsets point to.

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::bit_object::{BitObject, Rect};
use crate::preprocess::luminance;

const LUMA_BINS: usize = 16;
const MAX_MODEL_POINTS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoughVote {
    pub center: (i32, i32),
    /// Peak votes relative to the model size, in [0, 1].
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawHoughModel")]
pub struct HoughModel {
    offsets: Vec<Vec<(i32, i32)>>,
    num_points: usize,
}

#[derive(Deserialize)]
struct RawHoughModel {
    offsets: Vec<Vec<(i32, i32)>>,
    num_points: usize,
}

impl TryFrom<RawHoughModel> for HoughModel {
    type Error = String;

    fn try_from(raw: RawHoughModel) -> Result<Self, Self::Error> {
        if raw.offsets.len() != LUMA_BINS {
            return Err(format!("expected {} luminance bins, got {}", LUMA_BINS, raw.offsets.len()));
        }
        let points: usize = raw.offsets.iter().map(Vec::len).sum();
        if points != raw.num_points {
            return Err(format!("model holds {} points, claims {}", points, raw.num_points));
        }
        Ok(Self {
            offsets: raw.offsets,
            num_points: raw.num_points,
        })
    }
}

fn bin_of(luma: u8) -> usize {
    luma as usize * LUMA_BINS / 256
}

impl HoughModel {
    /// Model the appearance of `obj` in `image`. Large masks are subsampled.
    pub fn build(image: &RgbImage, obj: &BitObject) -> Self {
        let lum = luminance(image);
        let (cx, cy) = obj.centroid_px();
        let stride = (obj.area() as usize).div_ceil(MAX_MODEL_POINTS).max(1);
        let mut offsets = vec![Vec::new(); LUMA_BINS];
        let mut num_points = 0;

        for (x, y) in obj.pixels().step_by(stride) {
            if x < 0 || y < 0 || x as u32 >= lum.width() || y as u32 >= lum.height() {
                continue;
            }
            let bin = bin_of(lum.get_pixel(x as u32, y as u32).0[0]);
            offsets[bin].push((x - cx, y - cy));
            num_points += 1;
        }
        Self { offsets, num_points }
    }

    pub fn num_points(&self) -> usize {
        self.num_points
    }

    pub fn is_empty(&self) -> bool {
        self.num_points == 0
    }

    /// Vote for the object centre inside `window` (clipped to the frame).
    /// Among equally supported positions the one closest to `expected`
    /// wins, then the first in row-major order.
    pub fn vote(&self, image: &RgbImage, window: &Rect, expected: (i32, i32)) -> Option<HoughVote> {
        if self.is_empty() {
            return None;
        }
        let window = window.overlap(&Rect::frame(image.width(), image.height()))?;
        let lum = luminance(image);
        let width = window.width as usize;
        let mut acc = vec![0u32; width * window.height as usize];

        for y in window.top..window.bottom() {
            for x in window.left..window.right() {
                let bin = bin_of(lum.get_pixel(x as u32, y as u32).0[0]);
                for &(dx, dy) in &self.offsets[bin] {
                    let (cx, cy) = (x - dx, y - dy);
                    if window.contains(cx, cy) {
                        acc[(cy - window.top) as usize * width + (cx - window.left) as usize] += 1;
                    }
                }
            }
        }

        let position = |i: usize| (window.left + (i % width) as i32, window.top + (i / width) as i32);
        let dist2 = |(x, y): (i32, i32)| (x - expected.0).pow(2) + (y - expected.1).pow(2);
        let mut best: Option<(usize, u32)> = None;
        for (i, &votes) in acc.iter().enumerate() {
            if votes == 0 {
                continue;
            }
            best = match best {
                Some((b, bv)) if bv > votes || (bv == votes && dist2(position(b)) <= dist2(position(i))) => {
                    Some((b, bv))
                }
                _ => Some((i, votes)),
            };
        }

        let (index, votes) = best?;
        Some(HoughVote {
            center: position(index),
            confidence: votes as f32 / self.num_points as f32,
        })
    }
}
