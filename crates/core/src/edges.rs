//! Line-art extraction from an uploaded photo.
//!
//! The default detector is a small Canny-style filter: Gaussian blur,
//! Sobel gradients, non-maximum suppression and double-threshold
//! hysteresis. Output is black strokes (`0`) on a white (`255`) field.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{imageops, DynamicImage, GrayImage, ImageFormat, Luma};

use crate::config::EdgesConfig;

pub const EDGE_VALUE: u8 = 0;
pub const BACKGROUND_VALUE: u8 = 255;

pub trait EdgeDetector: Send + Sync {
    /// Decodes `image_bytes`, writes the edge map to `output` and returns its path.
    fn detect_edges(&self, image_bytes: &[u8], output: &Path) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct GradientEdgeDetector {
    blur_sigma: f32,
    low_threshold: f32,
    high_threshold: f32,
}

impl GradientEdgeDetector {
    pub fn new(config: &EdgesConfig) -> Self {
        let (low, high) = if config.low_threshold <= config.high_threshold {
            (config.low_threshold, config.high_threshold)
        } else {
            (config.high_threshold, config.low_threshold)
        };
        Self {
            blur_sigma: config.blur_sigma,
            low_threshold: low,
            high_threshold: high,
        }
    }

    pub fn edge_map(&self, image: &DynamicImage) -> GrayImage {
        let rgb = image.to_rgb8();
        let blurred = if self.blur_sigma > 0.0 {
            imageops::blur(&rgb, self.blur_sigma)
        } else {
            rgb
        };
        let gray = imageops::grayscale(&blurred);

        let (width, height) = gray.dimensions();
        let (magnitude, direction) = sobel(&gray);
        let thinned = suppress_non_maximum(&magnitude, &direction, width, height);
        let edges = hysteresis(&thinned, width, height, self.low_threshold, self.high_threshold);

        GrayImage::from_fn(width, height, |x, y| {
            if edges[(y * width + x) as usize] {
                Luma([EDGE_VALUE])
            } else {
                Luma([BACKGROUND_VALUE])
            }
        })
    }
}

impl Default for GradientEdgeDetector {
    fn default() -> Self {
        Self::new(&EdgesConfig::default())
    }
}

impl EdgeDetector for GradientEdgeDetector {
    fn detect_edges(&self, image_bytes: &[u8], output: &Path) -> Result<PathBuf> {
        let decoded =
            image::load_from_memory(image_bytes).context("Could not decode image from bytes")?;
        let edges = self.edge_map(&decoded);
        edges
            .save_with_format(output, ImageFormat::Png)
            .with_context(|| format!("failed to write edge map: {}", output.display()))?;
        Ok(output.to_path_buf())
    }
}

/// L1 gradient magnitude and direction bucket (0: 0°, 1: 45°, 2: 90°, 3: 135°).
fn sobel(gray: &GrayImage) -> (Vec<f32>, Vec<u8>) {
    let (width, height) = gray.dimensions();
    let len = (width as usize) * (height as usize);
    let mut magnitude = vec![0.0f32; len];
    let mut direction = vec![0u8; len];

    let px = |x: i64, y: i64| -> f32 {
        let cx = x.clamp(0, width as i64 - 1) as u32;
        let cy = y.clamp(0, height as i64 - 1) as u32;
        f32::from(gray.get_pixel(cx, cy)[0])
    };

    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let gx = (px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x - 1, y) + px(x - 1, y + 1));
            let gy = (px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1))
                - (px(x - 1, y - 1) + 2.0 * px(x, y - 1) + px(x + 1, y - 1));

            let idx = (y as usize) * (width as usize) + x as usize;
            magnitude[idx] = gx.abs() + gy.abs();

            let mut angle = gy.atan2(gx).to_degrees();
            if angle < 0.0 {
                angle += 180.0;
            }
            direction[idx] = if !(22.5..157.5).contains(&angle) {
                0
            } else if angle < 67.5 {
                1
            } else if angle < 112.5 {
                2
            } else {
                3
            };
        }
    }

    (magnitude, direction)
}

fn suppress_non_maximum(magnitude: &[f32], direction: &[u8], width: u32, height: u32) -> Vec<f32> {
    let w = width as i64;
    let h = height as i64;
    let at = |x: i64, y: i64| -> f32 {
        if x < 0 || y < 0 || x >= w || y >= h {
            0.0
        } else {
            magnitude[(y * w + x) as usize]
        }
    };

    let mut out = vec![0.0f32; magnitude.len()];
    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) as usize;
            let m = magnitude[idx];
            if m == 0.0 {
                continue;
            }
            let (a, b) = match direction[idx] {
                0 => (at(x - 1, y), at(x + 1, y)),
                1 => (at(x - 1, y - 1), at(x + 1, y + 1)),
                2 => (at(x, y - 1), at(x, y + 1)),
                _ => (at(x + 1, y - 1), at(x - 1, y + 1)),
            };
            if m >= a && m >= b {
                out[idx] = m;
            }
        }
    }
    out
}

fn hysteresis(magnitude: &[f32], width: u32, height: u32, low: f32, high: f32) -> Vec<bool> {
    let w = width as i64;
    let h = height as i64;
    let mut edges = vec![false; magnitude.len()];
    let mut queue = VecDeque::new();

    for (idx, &m) in magnitude.iter().enumerate() {
        if m >= high {
            edges[idx] = true;
            queue.push_back(idx);
        }
    }

    while let Some(idx) = queue.pop_front() {
        let x = idx as i64 % w;
        let y = idx as i64 / w;
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (nx, ny) = (x + dx, y + dy);
                if (dx == 0 && dy == 0) || nx < 0 || ny < 0 || nx >= w || ny >= h {
                    continue;
                }
                let n = (ny * w + nx) as usize;
                if !edges[n] && magnitude[n] >= low {
                    edges[n] = true;
                    queue.push_back(n);
                }
            }
        }
    }

    edges
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    use super::*;

    fn encode_png(image: RgbImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn square_on_white() -> RgbImage {
        RgbImage::from_fn(100, 100, |x, y| {
            if (25..75).contains(&x) && (25..75).contains(&y) {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        })
    }

    #[test]
    fn uniform_image_has_no_edges() {
        let detector = GradientEdgeDetector::default();
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(50, 50, Rgb([255, 255, 255])));
        let edges = detector.edge_map(&white);
        assert_eq!(edges.dimensions(), (50, 50));
        assert!(edges.pixels().all(|p| p[0] == BACKGROUND_VALUE));
    }

    #[test]
    fn square_outline_is_detected() {
        let detector = GradientEdgeDetector::default();
        let edges = detector.edge_map(&DynamicImage::ImageRgb8(square_on_white()));

        assert!(edges.pixels().any(|p| p[0] == EDGE_VALUE));
        assert_eq!(edges.get_pixel(50, 50)[0], BACKGROUND_VALUE);
        assert_eq!(edges.get_pixel(5, 5)[0], BACKGROUND_VALUE);
    }

    #[test]
    fn detect_edges_writes_png() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("edge_square.png");
        let detector = GradientEdgeDetector::default();

        let written = detector
            .detect_edges(&encode_png(square_on_white()), &output)
            .unwrap();

        assert_eq!(written, output);
        let reloaded = image::open(&output).unwrap().to_luma8();
        assert!(reloaded.pixels().any(|p| p[0] == EDGE_VALUE));
    }

    #[test]
    fn undecodable_bytes_are_rejected() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("edge.png");
        let err = GradientEdgeDetector::default()
            .detect_edges(b"not an image", &output)
            .unwrap_err();
        assert!(format!("{err:#}").contains("Could not decode image"));
        assert!(!output.exists());
    }

    #[test]
    fn swapped_thresholds_are_normalized() {
        let detector = GradientEdgeDetector::new(&EdgesConfig {
            blur_sigma: 0.0,
            low_threshold: 300.0,
            high_threshold: 50.0,
        });
        assert_eq!(detector.low_threshold, 50.0);
        assert_eq!(detector.high_threshold, 300.0);
    }
}
