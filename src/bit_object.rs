//! Binary-mask regions and the geometry they are measured with.

use image::GrayImage;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle. `right()` and `bottom()` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: i32, height: i32) -> Self {
        Self {
            left,
            top,
            width: width.max(0),
            height: height.max(0),
        }
    }

    /// Rectangle covering a whole `width` x `height` frame.
    pub fn frame(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    /// Rectangle of the given size centered on `center`.
    pub fn center_dims(center: (i32, i32), width: i32, height: i32) -> Self {
        Self::new(center.0 - width / 2, center.1 - height / 2, width, height)
    }

    pub fn right(&self) -> i32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.top + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x < self.right() && y >= self.top && y < self.bottom()
    }

    /// Intersection of two rectangles, `None` when they do not overlap.
    pub fn overlap(&self, other: &Rect) -> Option<Rect> {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return None;
        }
        Some(Rect::new(left, top, right - left, bottom - top))
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.overlap(other).is_some()
    }

    /// Grow on every side by `margin` pixels.
    pub fn grow(&self, margin: i32) -> Rect {
        Rect::new(
            self.left - margin,
            self.top - margin,
            self.width + 2 * margin,
            self.height + 2 * margin,
        )
    }
}

/// A connected region stored as a mask over its bounding box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawBitObject")]
pub struct BitObject {
    bbox: Rect,
    mask: Vec<bool>,
    area: u32,
    centroid: Point2<f32>,
    smv: f32,
}

/// Serialized form, checked before it becomes a `BitObject`.
#[derive(Deserialize)]
struct RawBitObject {
    bbox: Rect,
    mask: Vec<bool>,
    area: u32,
    centroid: Point2<f32>,
    smv: f32,
}

impl TryFrom<RawBitObject> for BitObject {
    type Error = String;

    fn try_from(raw: RawBitObject) -> Result<Self, Self::Error> {
        let bbox = raw.bbox;
        if bbox.width < 0 || bbox.height < 0 {
            return Err(format!("negative bounding box {}x{}", bbox.width, bbox.height));
        }
        if raw.mask.len() as u64 != bbox.area() {
            return Err(format!(
                "mask has {} cells, bounding box {}x{} needs {}",
                raw.mask.len(),
                bbox.width,
                bbox.height,
                bbox.area()
            ));
        }
        let set = raw.mask.iter().filter(|on| **on).count();
        if set != raw.area as usize {
            return Err(format!("area {} does not match {} mask pixels", raw.area, set));
        }
        if !raw.centroid.x.is_finite() || !raw.centroid.y.is_finite() {
            return Err("centroid is not finite".to_string());
        }
        Ok(Self {
            bbox,
            mask: raw.mask,
            area: raw.area,
            centroid: raw.centroid,
            smv: raw.smv,
        })
    }
}

impl Default for BitObject {
    fn default() -> Self {
        Self {
            bbox: Rect::default(),
            mask: Vec::new(),
            area: 0,
            centroid: Point2::origin(),
            smv: 0.0,
        }
    }
}

impl BitObject {
    /// Build an object from absolute pixel coordinates. Duplicates are
    /// counted once; an empty set gives an invalid object.
    pub fn from_pixels<I>(pixels: I) -> Self
    where
        I: IntoIterator<Item = (i32, i32)>,
    {
        let pixels: Vec<(i32, i32)> = pixels.into_iter().collect();
        if pixels.is_empty() {
            return Self::default();
        }

        let (mut min_x, mut min_y) = (i32::MAX, i32::MAX);
        let (mut max_x, mut max_y) = (i32::MIN, i32::MIN);
        for &(x, y) in &pixels {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        let bbox = Rect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1);
        let mut mask = vec![false; bbox.area() as usize];
        let mut area = 0u32;
        let (mut sum_x, mut sum_y) = (0f64, 0f64);
        for &(x, y) in &pixels {
            let idx = ((y - bbox.top) * bbox.width + (x - bbox.left)) as usize;
            if !mask[idx] {
                mask[idx] = true;
                area += 1;
                sum_x += x as f64;
                sum_y += y as f64;
            }
        }

        Self {
            bbox,
            mask,
            area,
            centroid: Point2::new((sum_x / area as f64) as f32, (sum_y / area as f64) as f32),
            smv: 0.0,
        }
    }

    /// Every non-zero pixel of `mask` belongs to the object.
    pub fn from_mask(mask: &GrayImage) -> Self {
        Self::from_pixels(
            mask.enumerate_pixels()
                .filter(|(_, _, p)| p.0[0] > 0)
                .map(|(x, y, _)| (x as i32, y as i32)),
        )
    }

    pub fn is_valid(&self) -> bool {
        self.area > 0
    }

    pub fn area(&self) -> u32 {
        self.area
    }

    pub fn bounding_box(&self) -> Rect {
        self.bbox
    }

    pub fn centroid(&self) -> Point2<f32> {
        self.centroid
    }

    /// Centroid rounded to the nearest pixel.
    pub fn centroid_px(&self) -> (i32, i32) {
        (self.centroid.x.round() as i32, self.centroid.y.round() as i32)
    }

    pub fn smv(&self) -> f32 {
        self.smv
    }

    pub fn set_smv(&mut self, smv: f32) {
        self.smv = smv;
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        if !self.bbox.contains(x, y) {
            return false;
        }
        self.mask[((y - self.bbox.top) * self.bbox.width + (x - self.bbox.left)) as usize]
    }

    /// Absolute coordinates of all mask pixels, row-major.
    pub fn pixels(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        let bbox = self.bbox;
        self.mask.iter().enumerate().filter(|(_, on)| **on).map(move |(i, _)| {
            let i = i as i32;
            (bbox.left + i % bbox.width, bbox.top + i / bbox.width)
        })
    }

    /// Mask-level intersection test.
    pub fn does_intersect(&self, other: &BitObject) -> bool {
        if !self.is_valid() || !other.is_valid() {
            return false;
        }
        let Some(overlap) = self.bbox.overlap(&other.bbox) else {
            return false;
        };
        (overlap.top..overlap.bottom())
            .any(|y| (overlap.left..overlap.right()).any(|x| self.contains(x, y) && other.contains(x, y)))
    }

    /// Copy of this object shifted by (`dx`, `dy`) and clipped to `bounds`.
    /// The SMV is carried over.
    pub fn translated(&self, dx: i32, dy: i32, bounds: &Rect) -> BitObject {
        let mut moved = BitObject::from_pixels(
            self.pixels()
                .map(|(x, y)| (x + dx, y + dy))
                .filter(|&(x, y)| bounds.contains(x, y)),
        );
        moved.smv = self.smv;
        moved
    }
}

/// One saliency fixation for a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Winner {
    pub x: i32,
    pub y: i32,
    pub voltage: f32,
    pub frame_num: u32,
    /// Focus-of-attention mask at the winning point.
    pub foa: BitObject,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square(left: i32, top: i32, size: i32) -> BitObject {
        BitObject::from_pixels((top..top + size).flat_map(|y| (left..left + size).map(move |x| (x, y))))
    }

    #[test]
    fn test_rect_overlap() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 5, 10, 10);
        assert_eq!(a.overlap(&b), Some(Rect::new(5, 5, 5, 5)));
        assert!(a.overlap(&Rect::new(10, 0, 5, 5)).is_none());
        assert_eq!(Rect::center_dims((10, 10), 4, 6), Rect::new(8, 7, 4, 6));
    }

    #[test]
    fn test_deserialize_rejects_inconsistent_mask() {
        let obj = square(2, 3, 4);
        let json = serde_json::to_value(&obj).unwrap();
        let back: BitObject = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back, obj);

        let mut short_mask = json.clone();
        short_mask["mask"] = serde_json::json!([true]);
        assert!(serde_json::from_value::<BitObject>(short_mask).is_err());

        let mut wrong_area = json.clone();
        wrong_area["area"] = serde_json::json!(15);
        assert!(serde_json::from_value::<BitObject>(wrong_area).is_err());

        let mut negative = json;
        negative["bbox"]["width"] = serde_json::json!(-4);
        assert!(serde_json::from_value::<BitObject>(negative).is_err());
    }

    #[test]
    fn test_from_pixels_attributes() {
        let obj = square(2, 3, 4);
        assert!(obj.is_valid());
        assert_eq!(obj.area(), 16);
        assert_eq!(obj.bounding_box(), Rect::new(2, 3, 4, 4));
        assert_relative_eq!(obj.centroid().x, 3.5);
        assert_relative_eq!(obj.centroid().y, 4.5);
        assert!(obj.contains(5, 6));
        assert!(!obj.contains(6, 6));
    }

    #[test]
    fn test_duplicates_counted_once() {
        let obj = BitObject::from_pixels(vec![(1, 1), (1, 1), (2, 1)]);
        assert_eq!(obj.area(), 2);
        assert!(!BitObject::from_pixels(Vec::new()).is_valid());
    }

    #[test]
    fn test_mask_intersection_not_bbox() {
        // Two diagonal strokes whose bounding boxes overlap but masks do not.
        let a = BitObject::from_pixels((0..5).map(|i| (i, i)));
        let b = BitObject::from_pixels((0..5).map(|i| (i + 1, i)));
        assert!(a.bounding_box().intersects(&b.bounding_box()));
        assert!(!a.does_intersect(&b));
        assert!(a.does_intersect(&square(3, 3, 2)));
    }

    #[test]
    fn test_translated_clips() {
        let mut obj = square(0, 0, 4);
        obj.set_smv(0.5);
        let moved = obj.translated(8, 0, &Rect::frame(10, 10));
        assert_eq!(moved.area(), 8);
        assert_relative_eq!(moved.smv(), 0.5);
    }

    #[test]
    fn test_from_mask() {
        let mut mask = GrayImage::new(8, 8);
        mask.put_pixel(3, 4, image::Luma([255]));
        mask.put_pixel(4, 4, image::Luma([1]));
        let obj = BitObject::from_mask(&mask);
        assert_eq!(obj.area(), 2);
        assert_eq!(obj.centroid_px(), (4, 4));
    }
}
