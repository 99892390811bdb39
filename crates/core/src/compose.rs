use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{imageops, Delay, Frame, ImageFormat, Rgba, RgbaImage};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::ComposeConfig;

pub const MANIFEST_NAME: &str = "steps.json";
const MANIFEST_MESSAGE: &str = "SketchSplit layers and preview.";

/// One file placed in the archive under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub job_id: String,
    pub message: String,
    pub files_included: Vec<String>,
    pub checksums: Vec<ManifestChecksum>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestChecksum {
    pub name: String,
    pub sha256: String,
}

pub trait Compositor: Send + Sync {
    /// Lays the edge map (`overlay`) over the stylized image (`base`).
    fn merge_layers(&self, base: &Path, overlay: &Path, output: &Path) -> Result<PathBuf>;

    /// Builds an endlessly looping animation from `frames`, in order.
    fn build_preview(&self, frames: &[PathBuf], output: &Path) -> Result<PathBuf>;

    /// Zips `entries` plus a manifest for `job_id`.
    fn build_archive(&self, job_id: &str, entries: &[ArchiveEntry], output: &Path) -> Result<PathBuf>;
}

#[derive(Debug, Clone)]
pub struct ImageCompositor {
    frame_ms: u32,
    line_color: [u8; 3],
    background_value: u8,
}

impl ImageCompositor {
    pub fn new(config: &ComposeConfig) -> Self {
        Self {
            frame_ms: config.preview_frame_ms.max(1),
            line_color: config.line_color,
            background_value: config.background_value,
        }
    }

    /// Background pixels become transparent, everything else the opaque line color.
    pub fn overlay_from_edges(&self, edges: &image::GrayImage) -> RgbaImage {
        let [r, g, b] = self.line_color;
        RgbaImage::from_fn(edges.width(), edges.height(), |x, y| {
            if edges.get_pixel(x, y)[0] == self.background_value {
                Rgba([0, 0, 0, 0])
            } else {
                Rgba([r, g, b, 255])
            }
        })
    }
}

impl Default for ImageCompositor {
    fn default() -> Self {
        Self::new(&ComposeConfig::default())
    }
}

impl Compositor for ImageCompositor {
    fn merge_layers(&self, base: &Path, overlay: &Path, output: &Path) -> Result<PathBuf> {
        let mut composite = image::open(base)
            .with_context(|| format!("failed to open base layer: {}", base.display()))?
            .to_rgba8();
        let edges = image::open(overlay)
            .with_context(|| format!("failed to open overlay layer: {}", overlay.display()))?
            .to_luma8();

        let mut layer = self.overlay_from_edges(&edges);
        if layer.dimensions() != composite.dimensions() {
            layer = imageops::resize(
                &layer,
                composite.width(),
                composite.height(),
                imageops::FilterType::Nearest,
            );
        }

        imageops::overlay(&mut composite, &layer, 0, 0);
        composite
            .save_with_format(output, ImageFormat::Png)
            .with_context(|| format!("failed to write composite: {}", output.display()))?;
        Ok(output.to_path_buf())
    }

    fn build_preview(&self, frames: &[PathBuf], output: &Path) -> Result<PathBuf> {
        let mut images: Vec<RgbaImage> = Vec::with_capacity(frames.len());
        for path in frames {
            match image::open(path) {
                Ok(img) => images.push(img.to_rgba8()),
                Err(error) => {
                    warn!(frame = %path.display(), error = %error, "Skipping unreadable preview frame");
                }
            }
        }

        let Some(first) = images.first() else {
            bail!("no frames available for preview");
        };
        let (width, height) = first.dimensions();

        let file = File::create(output)
            .with_context(|| format!("failed to create preview: {}", output.display()))?;
        let mut encoder = GifEncoder::new(BufWriter::new(file));
        encoder
            .set_repeat(Repeat::Infinite)
            .context("failed to configure preview looping")?;

        let delay = Delay::from_numer_denom_ms(self.frame_ms, 1);
        let gif_frames = images.into_iter().map(|img| {
            let img = if img.dimensions() == (width, height) {
                img
            } else {
                imageops::resize(&img, width, height, imageops::FilterType::Triangle)
            };
            Frame::from_parts(img, 0, 0, delay)
        });
        encoder
            .encode_frames(gif_frames)
            .context("failed to encode preview frames")?;

        Ok(output.to_path_buf())
    }

    fn build_archive(&self, job_id: &str, entries: &[ArchiveEntry], output: &Path) -> Result<PathBuf> {
        let file = File::create(output)
            .with_context(|| format!("failed to create archive: {}", output.display()))?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default());

        let mut files_included = Vec::with_capacity(entries.len());
        let mut checksums = Vec::with_capacity(entries.len());
        for entry in entries {
            let bytes = match std::fs::read(&entry.path) {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(file = %entry.path.display(), error = %error, "File not found for archive; skipping");
                    continue;
                }
            };
            zip.start_file(entry.name.as_str(), options)
                .with_context(|| format!("failed to start archive entry {}", entry.name))?;
            zip.write_all(&bytes)
                .with_context(|| format!("failed to write archive entry {}", entry.name))?;

            checksums.push(ManifestChecksum {
                name: entry.name.clone(),
                sha256: format!("{:x}", Sha256::digest(&bytes)),
            });
            files_included.push(entry.name.clone());
        }

        let manifest = Manifest {
            job_id: job_id.to_string(),
            message: MANIFEST_MESSAGE.to_string(),
            files_included,
            checksums,
        };
        zip.start_file(MANIFEST_NAME, options)
            .context("failed to start manifest entry")?;
        let encoded = serde_json::to_vec_pretty(&manifest).context("failed to encode manifest")?;
        zip.write_all(&encoded).context("failed to write manifest")?;

        let mut writer = zip.finish().context("failed to finalize archive")?;
        writer.flush().context("failed to flush archive")?;
        Ok(output.to_path_buf())
    }
}
