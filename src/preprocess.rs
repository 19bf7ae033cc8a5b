//! Sliding-window background model and entropy-driven contrast enhancement.

use image::{GrayImage, Rgb, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use imageproc::stats::histogram;
use log::{debug, info, warn};
use num_traits::clamp;
use std::collections::VecDeque;

use crate::bit_object::BitObject;
use crate::config::DetectionParameters;
use crate::error::{EventError, Result};

const HIST_BINS: usize = 256;
/// Exponent of the concave pdf reweighting.
const GAMMA_ALPHA: f64 = 0.25;
const BACKGROUND_BLUR_SIGMA: f32 = 1.0;

/// Bounded FIFO of frames keeping a running per-pixel sum so the mean is
/// available without revisiting every frame.
#[derive(Debug, Clone)]
pub struct ImageCache {
    max_size: usize,
    frames: VecDeque<RgbImage>,
    sum: Vec<u32>,
    dims: Option<(u32, u32)>,
}

impl ImageCache {
    /// A `max_size` of 0 leaves the cache unbounded.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            frames: VecDeque::new(),
            sum: Vec::new(),
            dims: None,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Change the bound, dropping the oldest frames if the cache is now too big.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.pop_off_old();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.sum.clear();
        self.dims = None;
    }

    pub fn front(&self) -> Option<&RgbImage> {
        self.frames.front()
    }

    pub fn back(&self) -> Option<&RgbImage> {
        self.frames.back()
    }

    pub fn get(&self, index: usize) -> Option<&RgbImage> {
        self.frames.get(index)
    }

    pub fn push_back(&mut self, frame: RgbImage) -> Result<()> {
        let dims = frame.dimensions();
        match self.dims {
            Some(expected) if expected != dims => {
                return Err(EventError::DimensionMismatch { expected, actual: dims });
            }
            Some(_) => {}
            None => {
                self.dims = Some(dims);
                self.sum = vec![0; frame.as_raw().len()];
            }
        }

        for (acc, &v) in self.sum.iter_mut().zip(frame.as_raw()) {
            *acc += v as u32;
        }
        self.frames.push_back(frame);
        self.pop_off_old();
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<RgbImage> {
        let frame = self.frames.pop_front()?;
        for (acc, &v) in self.sum.iter_mut().zip(frame.as_raw()) {
            *acc -= v as u32;
        }
        if self.frames.is_empty() {
            self.dims = None;
            self.sum.clear();
        }
        Some(frame)
    }

    fn pop_off_old(&mut self) {
        if self.max_size == 0 {
            return;
        }
        while self.frames.len() > self.max_size {
            self.pop_front();
        }
    }

    /// Per-pixel mean of the cached frames, `None` when empty.
    pub fn mean(&self) -> Option<RgbImage> {
        let (width, height) = self.dims?;
        let n = self.frames.len() as u32;
        let data: Vec<u8> = self.sum.iter().map(|&s| (s / n) as u8).collect();
        RgbImage::from_raw(width, height, data)
    }

    /// |frame - mean| per channel; the frame itself when the cache is empty.
    pub fn abs_diff_mean(&self, frame: &RgbImage) -> RgbImage {
        self.diff_mean(frame, |f, m| f.abs_diff(m))
    }

    /// max(frame - mean, 0) per channel; the frame itself when the cache is empty.
    pub fn clamped_diff_mean(&self, frame: &RgbImage) -> RgbImage {
        self.diff_mean(frame, |f, m| f.saturating_sub(m))
    }

    fn diff_mean(&self, frame: &RgbImage, op: impl Fn(u8, u8) -> u8) -> RgbImage {
        match self.mean() {
            Some(mean) if mean.dimensions() == frame.dimensions() => {
                let mut out = frame.clone();
                for (o, m) in out.iter_mut().zip(mean.iter()) {
                    *o = op(*o, *m);
                }
                out
            }
            _ => frame.clone(),
        }
    }
}

pub fn luminance(frame: &RgbImage) -> GrayImage {
    image::imageops::grayscale(frame)
}

/// Normalized luminance histogram.
pub fn luminance_pdf(lum: &GrayImage) -> [f64; HIST_BINS] {
    let mut pdf = [0f64; HIST_BINS];
    let total = (lum.width() as u64 * lum.height() as u64) as f64;
    if total == 0.0 {
        return pdf;
    }
    let hist = histogram(lum);
    for (p, &count) in pdf.iter_mut().zip(hist.channels[0].iter()) {
        *p = count as f64 / total;
    }
    pdf
}

/// Shannon entropy (natural log) of the luminance distribution.
pub fn luminance_entropy(lum: &GrayImage) -> f64 {
    entropy_of(&luminance_pdf(lum))
}

fn entropy_of(pdf: &[f64; HIST_BINS]) -> f64 {
    -pdf.iter().filter(|&&p| p > 0.0).map(|&p| p * p.ln()).sum::<f64>()
}

pub fn luminance_std_dev(lum: &GrayImage) -> f64 {
    let n = lum.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    let mean = lum.as_raw().iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let var = lum.as_raw().iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n as f64;
    var.sqrt()
}

/// Reweighted, normalized cumulative distribution used as the gamma curve.
///
/// pdfw(i) = pdfmax * ((pdf(i) - pdfmin) / (pdfmax - pdfmin))^alpha and
/// cdfw(i) = sum_{k<i} pdfw(k) / sum pdfw. A flat pdf gives a flat pdfw.
pub fn gamma_curve(pdf: &[f64; HIST_BINS]) -> [f64; HIST_BINS] {
    let pdfmin = pdf.iter().copied().fold(f64::INFINITY, f64::min);
    let pdfmax = pdf.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = pdfmax - pdfmin;

    let mut pdfw = [0f64; HIST_BINS];
    for (w, &p) in pdfw.iter_mut().zip(pdf.iter()) {
        *w = if range > f64::EPSILON {
            pdfmax * ((p - pdfmin) / range).powf(GAMMA_ALPHA)
        } else {
            pdfmax
        };
    }

    let total: f64 = pdfw.iter().sum();
    let mut cdfw = [0f64; HIST_BINS];
    if total <= 0.0 {
        return cdfw;
    }
    let mut running = 0.0;
    for i in 0..HIST_BINS {
        cdfw[i] = running / total;
        running += pdfw[i];
    }
    cdfw
}

/// Raise the HSV value of each pixel to `1 - cdfw[luminance]`.
fn enhance_image(frame: &RgbImage, cdfw: &[f64; HIST_BINS]) -> RgbImage {
    let lum = luminance(frame);
    let mut out = frame.clone();
    for (pixel, l) in out.pixels_mut().zip(lum.pixels()) {
        let [r, g, b] = pixel.0.map(|c| c as f64 / 255.0);
        let v = r.max(g).max(b);
        if v <= 0.0 {
            continue;
        }
        let gamma = 1.0 - cdfw[l.0[0] as usize];
        // Scaling all channels by v'/v leaves hue and saturation unchanged.
        let scale = v.powf(gamma) / v;
        *pixel = Rgb([r, g, b].map(|c| clamp(c * scale * 255.0, 0.0, 255.0).round() as u8));
    }
    out
}

/// Replace the pixels under `objects` with the background estimate.
fn erase_objects(frame: &RgbImage, mean: Option<&RgbImage>, prev: &RgbImage, objects: &[BitObject]) -> RgbImage {
    let (width, height) = frame.dimensions();
    let source = match mean {
        Some(m) if m.dimensions() == frame.dimensions() => m,
        _ => prev,
    };
    let mut out = frame.clone();
    if source.dimensions() != frame.dimensions() {
        return out;
    }
    for obj in objects {
        for (x, y) in obj.pixels() {
            if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
                out.put_pixel(x as u32, y as u32, *source.get_pixel(x as u32, y as u32));
            }
        }
    }
    out
}

/// Background cache plus the gamma curve derived from luminance entropy.
pub struct Preprocess {
    cache: ImageCache,
    min_std_dev: f32,
    min_frame: u32,
    pdf: [f64; HIST_BINS],
    cdfw: [f64; HIST_BINS],
    entropy: f64,
}

impl Preprocess {
    pub fn new(cache_size: usize, min_std_dev: f32) -> Self {
        Self {
            cache: ImageCache::new(cache_size),
            min_std_dev,
            min_frame: 0,
            pdf: [0.0; HIST_BINS],
            cdfw: [0.0; HIST_BINS],
            entropy: 0.0,
        }
    }

    pub fn from_params(params: &DetectionParameters) -> Self {
        Self::new(params.cache_size, params.min_std_dev)
    }

    /// Prime the cache with up to `max_size` frames numbered from
    /// `first_frame`. A short stream is not an error. Returns the number of
    /// frames consumed.
    pub fn init<I>(&mut self, frames: I, first_frame: u32) -> Result<usize>
    where
        I: IntoIterator<Item = RgbImage>,
    {
        self.pdf = [0.0; HIST_BINS];
        self.entropy = 0.0;
        let wanted = self.cache.max_size();
        let mut consumed = 0usize;
        let mut frames = frames.into_iter();

        while wanted == 0 || consumed < wanted {
            let Some(frame) = frames.next() else {
                warn!(
                    "Fewer input frames than needed for the sliding average ({} of {}); using all of them",
                    consumed, wanted
                );
                break;
            };
            self.update(frame, first_frame + consumed as u32, true)?;
            consumed += 1;
        }

        self.min_frame = first_frame + consumed as u32;
        info!("Background cache primed with {} frame(s), subtraction starts at frame {}", consumed, self.min_frame);
        Ok(consumed)
    }

    /// Add a frame to the cache. Near-uniform frames (luminance deviation at
    /// or below `min_std_dev`) are replaced by the current mean.
    pub fn update(&mut self, frame: RgbImage, frame_num: u32, update_model: bool) -> Result<()> {
        debug!("Updating cache for frame {}", frame_num);
        let lum = luminance(&frame);

        if self.min_std_dev > 0.0 && !self.cache.is_empty() {
            let std_dev = luminance_std_dev(&lum);
            if std_dev <= self.min_std_dev as f64 {
                warn!(
                    "Luminance deviation {:.3} in frame {} is too low; caching the running mean instead",
                    std_dev, frame_num
                );
                if let Some(mean) = self.cache.mean() {
                    self.cache.push_back(mean)?;
                }
                return Ok(());
            }
        }

        if update_model {
            self.pdf = luminance_pdf(&lum);
            self.entropy = entropy_of(&self.pdf);
            self.cdfw = gamma_curve(&self.pdf);
            debug!("Frame {} luminance entropy {:.4}", frame_num, self.entropy);
        }
        self.cache.push_back(frame)
    }

    /// Cache the background estimate instead of the raw frame once the cache
    /// is primed and objects are active.
    pub fn update_with_objects(
        &mut self,
        frame: &RgbImage,
        prev: &RgbImage,
        frame_num: u32,
        objects: &[BitObject],
    ) -> Result<()> {
        if !objects.is_empty() && frame_num >= self.min_frame {
            let mean = self.cache.mean();
            let bgnd = erase_objects(frame, mean.as_ref(), prev, objects);
            self.update(bgnd, frame_num, false)
        } else {
            self.update(frame.clone(), frame_num, false)
        }
    }

    /// Gamma-correct the value channel. The first call on an empty cache
    /// builds the curve from this frame.
    pub fn contrast_enhance(&mut self, frame: &RgbImage) -> RgbImage {
        if self.cache.is_empty() {
            self.pdf = luminance_pdf(&luminance(frame));
            self.entropy = entropy_of(&self.pdf);
            self.cdfw = gamma_curve(&self.pdf);
        }
        enhance_image(frame, &self.cdfw)
    }

    /// Frame with the active objects erased and low-pass filtered, or the
    /// frame unchanged when nothing is active.
    pub fn background(&self, frame: &RgbImage, prev: &RgbImage, frame_num: u32, objects: &[BitObject]) -> RgbImage {
        if objects.is_empty() {
            return frame.clone();
        }
        debug!("Erasing {} active object(s) from frame {}", objects.len(), frame_num);
        let mean = self.cache.mean();
        gaussian_blur_f32(&erase_objects(frame, mean.as_ref(), prev, objects), BACKGROUND_BLUR_SIGMA)
    }

    pub fn mean(&self) -> Option<RgbImage> {
        self.cache.mean()
    }

    pub fn abs_diff_mean(&self, frame: &RgbImage) -> RgbImage {
        self.cache.abs_diff_mean(frame)
    }

    pub fn clamped_diff_mean(&self, frame: &RgbImage) -> RgbImage {
        self.cache.clamped_diff_mean(frame)
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn entropy(&self) -> f64 {
        self.entropy
    }

    pub fn gamma_curve(&self) -> &[f64; HIST_BINS] {
        &self.cdfw
    }

    /// First frame from which background subtraction may begin.
    pub fn min_frame(&self) -> u32 {
        self.min_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn flat(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([value, value, value]))
    }

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let v = ((x + y * width) % 256) as u8;
            Rgb([v, v, v])
        })
    }

    #[test]
    fn test_cache_never_exceeds_max() {
        let mut cache = ImageCache::new(3);
        for v in 0..10u8 {
            cache.push_back(flat(4, 4, v)).unwrap();
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.front().unwrap().get_pixel(0, 0).0[0], 7);
        assert_eq!(cache.back().unwrap().get_pixel(0, 0).0[0], 9);

        cache.set_max_size(1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_mean_of_identical_frames_is_identity() {
        let frame = gradient(16, 8);
        let mut cache = ImageCache::new(5);
        for _ in 0..5 {
            cache.push_back(frame.clone()).unwrap();
        }
        assert_eq!(cache.mean().unwrap(), frame);
    }

    #[test]
    fn test_mean_tracks_eviction() {
        let mut cache = ImageCache::new(2);
        cache.push_back(flat(2, 2, 10)).unwrap();
        cache.push_back(flat(2, 2, 20)).unwrap();
        cache.push_back(flat(2, 2, 40)).unwrap();
        assert_eq!(cache.mean().unwrap().get_pixel(1, 1).0, [30, 30, 30]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut cache = ImageCache::new(2);
        cache.push_back(flat(2, 2, 0)).unwrap();
        assert!(matches!(
            cache.push_back(flat(3, 2, 0)),
            Err(EventError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_diff_mean() {
        let mut cache = ImageCache::new(2);
        let frame = flat(2, 2, 50);
        assert_eq!(cache.abs_diff_mean(&frame), frame);
        cache.push_back(flat(2, 2, 80)).unwrap();
        assert_eq!(cache.abs_diff_mean(&frame).get_pixel(0, 0).0, [30, 30, 30]);
        assert_eq!(cache.clamped_diff_mean(&frame).get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_entropy_bounds() {
        let single = GrayImage::from_pixel(16, 16, image::Luma([77]));
        assert_relative_eq!(luminance_entropy(&single), 0.0);

        // Every luminance level exactly once.
        let spread = GrayImage::from_fn(256, 1, |x, _| image::Luma([x as u8]));
        assert_relative_eq!(luminance_entropy(&spread), (256f64).ln(), epsilon = 1e-9);
    }

    #[test]
    fn test_gamma_curve_monotone_and_normalized() {
        let pdf = luminance_pdf(&luminance(&gradient(64, 64)));
        let cdfw = gamma_curve(&pdf);
        assert_relative_eq!(cdfw[0], 0.0);
        assert!(cdfw.windows(2).all(|w| w[0] <= w[1]));
        assert!(cdfw[255] < 1.0);
    }

    #[test]
    fn test_gamma_curve_flat_pdf_is_finite() {
        let pdf = [1.0 / 256.0; 256];
        let cdfw = gamma_curve(&pdf);
        assert!(cdfw.iter().all(|c| c.is_finite()));
        assert_relative_eq!(cdfw[128], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_frame_replaced_by_mean() {
        let mut pre = Preprocess::new(4, 2.0);
        pre.update(gradient(16, 16), 0, true).unwrap();
        pre.update(flat(16, 16, 0), 1, true).unwrap();
        assert_eq!(pre.cache().len(), 2);
        // The blank frame was not cached as-is.
        assert_eq!(pre.cache().back().unwrap(), &gradient(16, 16));
    }

    #[test]
    fn test_init_short_stream() {
        let mut pre = Preprocess::new(10, 0.0);
        let frames = (0..3).map(|_| gradient(8, 8));
        let consumed = pre.init(frames, 5).unwrap();
        assert_eq!(consumed, 3);
        assert_eq!(pre.min_frame(), 8);
        assert_eq!(pre.cache().len(), 3);
    }

    #[test]
    fn test_contrast_enhance_preserves_black_and_hue() {
        let mut pre = Preprocess::new(4, 0.0);
        let mut frame = gradient(32, 32);
        frame.put_pixel(0, 0, Rgb([0, 0, 0]));
        frame.put_pixel(1, 0, Rgb([200, 100, 0]));
        let out = pre.contrast_enhance(&frame);
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0]);
        let p = out.get_pixel(1, 0).0;
        // Red stays dominant, blue stays empty, green stays about half of red.
        assert!(p[0] >= 200);
        assert_eq!(p[2], 0);
        assert!((p[1] as f64 / p[0] as f64 - 0.5).abs() < 0.02);
    }

    #[test]
    fn test_background_without_objects_is_identity() {
        let pre = Preprocess::new(4, 0.0);
        let frame = gradient(8, 8);
        assert_eq!(pre.background(&frame, &frame, 3, &[]), frame);
    }

    #[test]
    fn test_background_erases_objects() {
        let mut pre = Preprocess::new(4, 0.0);
        for i in 0..4 {
            pre.update(flat(20, 20, 10), i, false).unwrap();
        }
        let mut frame = flat(20, 20, 10);
        let mut pixels = Vec::new();
        for y in 8..12 {
            for x in 8..12 {
                frame.put_pixel(x, y, Rgb([250, 250, 250]));
                pixels.push((x as i32, y as i32));
            }
        }
        let obj = BitObject::from_pixels(pixels);
        let bg = pre.background(&frame, &frame, 4, &[obj]);
        assert!(bg.get_pixel(10, 10).0[0] <= 11);
    }
}
