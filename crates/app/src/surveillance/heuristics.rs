//! Colour heuristic for small flames (lit matches, lighters) that the primary
//! model does not know about.
//!
//! Pixels are converted to 8-bit HSV (hue halved into `0..180`), thresholded
//! to saturated bright red/orange/yellow, median filtered to drop speckle,
//! and grouped into 8-connected regions. Regions larger than
//! [`MIN_REGION_AREA`] pixels are reported.

use image::RgbImage;

/// Inclusive HSV lower bound.
pub(crate) const HSV_LOWER: [u8; 3] = [0, 150, 150];
/// Inclusive HSV upper bound.
pub(crate) const HSV_UPPER: [u8; 3] = [35, 255, 255];
/// Regions must be strictly larger than this many pixels.
pub(crate) const MIN_REGION_AREA: usize = 30;
const MEDIAN_RADIUS: i64 = 2;

/// Axis-aligned bounding box of a flagged region, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Region {
    pub(crate) x: u32,
    pub(crate) y: u32,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) area: usize,
}

pub(crate) fn detect_small_fire(image: &RgbImage) -> Vec<Region> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let mask: Vec<bool> = image
        .pixels()
        .map(|p| in_fire_range(rgb_to_hsv(p.0)))
        .collect();
    let mask = median_filter(&mask, width as usize, height as usize);
    connected_regions(&mask, width as usize, height as usize)
        .into_iter()
        .filter(|region| region.area > MIN_REGION_AREA)
        .collect()
}

/// 8-bit HSV with hue in `0..180`.
pub(crate) fn rgb_to_hsv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let delta = max - min;
    let saturation = if max == 0.0 { 0.0 } else { 255.0 * delta / max };
    let mut hue = if delta == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (gf - bf) / delta
    } else if max == gf {
        120.0 + 60.0 * (bf - rf) / delta
    } else {
        240.0 + 60.0 * (rf - gf) / delta
    };
    if hue < 0.0 {
        hue += 360.0;
    }
    [
        ((hue / 2.0).round() as u32).min(179) as u8,
        saturation.round() as u8,
        max as u8,
    ]
}

fn in_fire_range(hsv: [u8; 3]) -> bool {
    (0..3).all(|i| hsv[i] >= HSV_LOWER[i] && hsv[i] <= HSV_UPPER[i])
}

/// 5x5 median of a binary mask with replicated borders.
fn median_filter(mask: &[bool], width: usize, height: usize) -> Vec<bool> {
    let window = ((2 * MEDIAN_RADIUS + 1) * (2 * MEDIAN_RADIUS + 1)) as usize;
    let majority = window / 2 + 1;
    let max_x = width as i64 - 1;
    let max_y = height as i64 - 1;
    let mut out = vec![false; mask.len()];
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let mut set = 0;
            for dy in -MEDIAN_RADIUS..=MEDIAN_RADIUS {
                let sy = (y + dy).clamp(0, max_y) as usize;
                for dx in -MEDIAN_RADIUS..=MEDIAN_RADIUS {
                    let sx = (x + dx).clamp(0, max_x) as usize;
                    if mask[sy * width + sx] {
                        set += 1;
                    }
                }
            }
            out[y as usize * width + x as usize] = set >= majority;
        }
    }
    out
}

fn connected_regions(mask: &[bool], width: usize, height: usize) -> Vec<Region> {
    let mut visited = vec![false; mask.len()];
    let mut regions = Vec::new();
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        stack.push(start);
        let (mut min_x, mut min_y) = (usize::MAX, usize::MAX);
        let (mut max_x, mut max_y) = (0, 0);
        let mut area = 0;

        while let Some(index) = stack.pop() {
            let (x, y) = (index % width, index / width);
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);

            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    let neighbour = ny * width + nx;
                    if mask[neighbour] && !visited[neighbour] {
                        visited[neighbour] = true;
                        stack.push(neighbour);
                    }
                }
            }
        }

        regions.push(Region {
            x: min_x as u32,
            y: min_y as u32,
            width: (max_x - min_x + 1) as u32,
            height: (max_y - min_y + 1) as u32,
            area,
        });
    }
    regions
}
