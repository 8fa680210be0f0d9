use anyhow::{Result, anyhow, bail};
use image::{ImageBuffer, Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use ml_core::Detection;
use video_ingest::{Frame, FrameFormat};

use crate::surveillance::{geolocation::Coordinates, heuristics::Region};

pub(crate) const DETECTION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub(crate) const FIRE_REGION_COLOR: Rgb<u8> = Rgb([255, 140, 0]);
pub(crate) const GPS_COLOR: Rgb<u8> = Rgb([255, 255, 0]);

const GLYPH_ADVANCE: i32 = 6;

/// Convert a captured BGR frame into an RGB canvas.
pub(crate) fn frame_to_rgb(frame: &Frame) -> Result<RgbImage> {
    if !matches!(frame.format, FrameFormat::Bgr8) {
        bail!("unsupported frame format");
    }
    if frame.width <= 0 || frame.height <= 0 || frame.data.len() != frame.expected_len() {
        bail!(
            "malformed frame: {}x{} with {} bytes",
            frame.width,
            frame.height,
            frame.data.len()
        );
    }
    let mut rgb = Vec::with_capacity(frame.data.len());
    for chunk in frame.data.chunks_exact(3) {
        rgb.push(chunk[2]);
        rgb.push(chunk[1]);
        rgb.push(chunk[0]);
    }
    ImageBuffer::from_vec(frame.width as u32, frame.height as u32, rgb)
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))
}

pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// Draw boxes and `LABEL NN%` captions for every primary detection.
pub(crate) fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    if image.width() == 0 || image.height() == 0 {
        return;
    }
    let max_x = (image.width() - 1) as f32;
    let max_y = (image.height() - 1) as f32;
    for det in detections {
        let left = det.bbox[0].clamp(0.0, max_x).round() as i32;
        let top = det.bbox[1].clamp(0.0, max_y).round() as i32;
        let right = det.bbox[2].clamp(0.0, max_x).round() as i32;
        let bottom = det.bbox[3].clamp(0.0, max_y).round() as i32;
        draw_rectangle(image, left, top, right, bottom, 2, DETECTION_COLOR);

        let label = format!("{} {:.0}%", det.label, det.score * 100.0);
        let label_y = (top - 12).max(0);
        let text_width = label.chars().count() as i32 * GLYPH_ADVANCE;
        fill_rect(image, left, label_y, left + text_width, label_y + 8, Rgb([0, 0, 0]));
        draw_label(image, left + 1, label_y + 1, &label, 1, DETECTION_COLOR);
    }
}

/// Outline regions flagged by the colour heuristic.
pub(crate) fn draw_regions(image: &mut RgbImage, regions: &[Region]) {
    for region in regions {
        draw_rectangle(
            image,
            region.x as i32,
            region.y as i32,
            (region.x + region.width) as i32,
            (region.y + region.height) as i32,
            2,
            FIRE_REGION_COLOR,
        );
    }
}

/// Yellow GPS banner in the top-left corner.
pub(crate) fn draw_gps_banner(image: &mut RgbImage, coords: Coordinates) {
    draw_rectangle(image, 20, 20, 280, 90, 2, GPS_COLOR);
    let text = format!("GPS: {:.4},{:.4}", coords.latitude, coords.longitude);
    draw_label(image, 30, 48, &text, 2, GPS_COLOR);
}

pub(crate) fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    thickness: i32,
    color: Rgb<u8>,
) {
    for inset in 0..thickness.max(1) {
        draw_outline(image, left + inset, top + inset, right - inset, bottom - inset, color);
    }
}

fn draw_outline(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    if left > right || top > bottom {
        return;
    }
    let width = image.width() as i32;
    let height = image.height() as i32;
    let mut put = |x: i32, y: i32| {
        if x >= 0 && x < width && y >= 0 && y < height {
            image.put_pixel(x as u32, y as u32, color);
        }
    };
    for x in left..=right {
        put(x, top);
        put(x, bottom);
    }
    for y in top..=bottom {
        put(left, y);
        put(right, y);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

/// Render `text` with the built-in 5x7 font, each font pixel drawn as a
/// `scale`x`scale` block.
pub(crate) fn draw_label(image: &mut RgbImage, x: i32, y: i32, text: &str, scale: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let scale = scale.max(1);
    let mut pen_x = x;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = pen_x + col * scale + dx;
                            let py = y + row as i32 * scale + dy;
                            if px >= 0 && px < width && py >= 0 && py < height {
                                image.put_pixel(px as u32, py as u32, color);
                            }
                        }
                    }
                }
            }
        }
        pen_x += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ',' => [0, 0, 0, 0, 0b01100, 0b00100, 0b01000],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}
