//! Lazy, once-per-job composition of the downloadable bundle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::compose::{ArchiveEntry, Compositor};
use crate::error::DownloadError;
use crate::job::{BundleArtifacts, Job, JobStatus};
use crate::registry::JobRegistry;
use crate::storage::{JobFiles, JobStorage};

pub struct ComposerDriver {
    registry: JobRegistry,
    storage: JobStorage,
    compositor: Arc<dyn Compositor>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl ComposerDriver {
    pub fn new(registry: JobRegistry, storage: JobStorage, compositor: Arc<dyn Compositor>) -> Self {
        Self {
            registry,
            storage,
            compositor,
            in_flight: DashMap::new(),
        }
    }

    /// Returns the job's archive, composing it on the first call.
    ///
    /// Concurrent first calls for one job serialize on a per-job lock; the
    /// winner composes and publishes, the rest find the published archive.
    /// Failures leave the job exactly as it was.
    pub async fn bundle_for_download(&self, job_id: &str) -> Result<PathBuf, DownloadError> {
        let job = self.downloadable(job_id)?;
        if let Some(bundle) = job.bundle_path {
            return Ok(bundle);
        }

        let slot = InFlightSlot::claim(&self.in_flight, job_id);
        let _guard = slot.lock.lock().await;

        let job = self.downloadable(job_id)?;
        if let Some(bundle) = job.bundle_path {
            debug!(job_id, "Bundle published while waiting");
            return Ok(bundle);
        }

        let (edge_map, stylized) = match (&job.edge_map_path, &job.stylized_image_path) {
            (Some(edge), Some(stylized)) if edge.exists() && stylized.exists() => {
                (edge.clone(), stylized.clone())
            }
            _ => {
                warn!(job_id, "Required image files for job are missing");
                return Err(DownloadError::MissingArtifacts);
            }
        };

        let files = self.storage.files(job_id, &job.original_filename);
        let compositor = Arc::clone(&self.compositor);
        let id = job_id.to_string();
        let composed = tokio::task::spawn_blocking(move || {
            compose_bundle(compositor.as_ref(), &id, &files, &edge_map, &stylized)
        })
        .await
        .map_err(|err| DownloadError::Composition(format!("composition task aborted: {err}")))?
        .map_err(|err| {
            warn!(job_id, error = %format!("{err:#}"), "Composition failed");
            DownloadError::Composition(format!("{err:#}"))
        })?;

        let bundle = composed.bundle_path.clone();
        self.registry
            .update(job_id, |job| job.record_bundle(composed))?;
        info!(job_id, path = %bundle.display(), "Bundle ready");
        Ok(bundle)
    }

    fn downloadable(&self, job_id: &str) -> Result<Job, DownloadError> {
        let job = self.registry.get(job_id)?;
        if job.status != JobStatus::Stylized {
            return Err(DownloadError::NotReady(job.status));
        }
        Ok(job)
    }
}

/// A claim on a job's composition lock. The map entry goes away with the
/// last claim, whichever way the locked section exits.
struct InFlightSlot<'a> {
    map: &'a DashMap<String, Arc<Mutex<()>>>,
    job_id: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> InFlightSlot<'a> {
    fn claim(map: &'a DashMap<String, Arc<Mutex<()>>>, job_id: &'a str) -> Self {
        let lock = Arc::clone(map.entry(job_id.to_string()).or_default().value());
        Self { map, job_id, lock }
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        // Two owners left: the map and this claim.
        self.map.remove_if(self.job_id, |_, held| {
            Arc::ptr_eq(held, &self.lock) && Arc::strong_count(held) == 2
        });
    }
}

fn compose_bundle(
    compositor: &dyn Compositor,
    job_id: &str,
    files: &JobFiles,
    edge_map: &Path,
    stylized: &Path,
) -> Result<BundleArtifacts> {
    let composite = compositor.merge_layers(stylized, edge_map, &files.composite)?;

    let frames = [edge_map.to_path_buf(), stylized.to_path_buf(), composite.clone()];
    let preview = match compositor.build_preview(&frames, &files.preview) {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(job_id, error = %format!("{err:#}"), "Preview failed; bundling without it");
            None
        }
    };

    let stem = &files.stem;
    let mut entries = vec![
        ArchiveEntry {
            name: format!("01_edge_map_{stem}.png"),
            path: edge_map.to_path_buf(),
        },
        ArchiveEntry {
            name: format!("02_stylized_{stem}.png"),
            path: stylized.to_path_buf(),
        },
        ArchiveEntry {
            name: format!("03_composite_{stem}.png"),
            path: composite.clone(),
        },
    ];
    if let Some(preview) = &preview {
        entries.push(ArchiveEntry {
            name: format!("preview_{stem}.gif"),
            path: preview.clone(),
        });
    }

    let bundle = compositor.build_archive(job_id, &entries, &files.bundle)?;
    Ok(BundleArtifacts {
        composite_image_path: composite,
        preview_path: preview,
        bundle_path: bundle,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use anyhow::bail;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use tempfile::tempdir;

    use super::*;
    use crate::compose::ImageCompositor;

    #[derive(Default)]
    struct CountingCompositor {
        merges: AtomicUsize,
        archives: AtomicUsize,
        fail_preview: bool,
        fail_next_archive: AtomicBool,
    }

    impl Compositor for CountingCompositor {
        fn merge_layers(&self, _base: &Path, _overlay: &Path, output: &Path) -> Result<PathBuf> {
            self.merges.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            std::fs::write(output, b"composite")?;
            Ok(output.to_path_buf())
        }

        fn build_preview(&self, _frames: &[PathBuf], output: &Path) -> Result<PathBuf> {
            if self.fail_preview {
                bail!("gif encoder unavailable");
            }
            std::fs::write(output, b"gif")?;
            Ok(output.to_path_buf())
        }

        fn build_archive(&self, _job_id: &str, entries: &[ArchiveEntry], output: &Path) -> Result<PathBuf> {
            if self.fail_next_archive.swap(false, Ordering::SeqCst) {
                bail!("disk full");
            }
            self.archives.fetch_add(1, Ordering::SeqCst);
            let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
            std::fs::write(output, names.join("\n"))?;
            Ok(output.to_path_buf())
        }
    }

    fn stylized_job(registry: &JobRegistry, storage: &JobStorage, id: &str) {
        registry.create(Job::new(id, "cat.png")).unwrap();
        let files = storage.files(id, "cat.png");
        storage.create_job_dir(&files).unwrap();
        GrayImage::from_fn(16, 16, |x, _| if x == 8 { Luma([0]) } else { Luma([255]) })
            .save(&files.edge_map)
            .unwrap();
        RgbImage::from_pixel(16, 16, Rgb([90, 140, 200]))
            .save(&files.stylized)
            .unwrap();
        registry
            .update(id, |job| job.record_edge_map(files.edge_map.clone()))
            .unwrap();
        registry.update(id, Job::start_remote).unwrap();
        registry
            .update(id, |job| job.record_stylized(files.stylized.clone()))
            .unwrap();
    }

    fn driver(root: &Path, compositor: Arc<dyn Compositor>) -> (Arc<ComposerDriver>, JobRegistry, JobStorage) {
        let registry = JobRegistry::new();
        let storage = JobStorage::new(root, "temp_images");
        let driver = ComposerDriver::new(registry.clone(), storage.clone(), compositor);
        (Arc::new(driver), registry, storage)
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let dir = tempdir().unwrap();
        let (driver, _, _) = driver(dir.path(), Arc::new(CountingCompositor::default()));
        let err = driver.bundle_for_download("nope").await.unwrap_err();
        assert!(matches!(err, DownloadError::NotFound(_)));
    }

    #[tokio::test]
    async fn job_still_processing_is_not_ready() {
        let dir = tempdir().unwrap();
        let compositor = Arc::new(CountingCompositor::default());
        let (driver, registry, _) = driver(dir.path(), compositor.clone());
        registry.create(Job::new("a", "cat.png")).unwrap();
        registry
            .update("a", |job| job.record_edge_map(dir.path().join("e.png")))
            .unwrap();
        registry.update("a", Job::start_remote).unwrap();

        let err = driver.bundle_for_download("a").await.unwrap_err();

        assert!(matches!(err, DownloadError::NotReady(JobStatus::ProcessingRemote)));
        assert_eq!(err.to_string(), "job not yet complete. Status: processing_remote");
        assert_eq!(compositor.merges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_first_downloads_compose_once() {
        let dir = tempdir().unwrap();
        let compositor = Arc::new(CountingCompositor::default());
        let (driver, registry, storage) = driver(dir.path(), compositor.clone());
        stylized_job(&registry, &storage, "a");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let driver = Arc::clone(&driver);
                tokio::spawn(async move { driver.bundle_for_download("a").await.unwrap() })
            })
            .collect();
        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.await.unwrap());
        }

        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(compositor.merges.load(Ordering::SeqCst), 1);
        assert_eq!(compositor.archives.load(Ordering::SeqCst), 1);
        let job = registry.get("a").unwrap();
        assert!(job.is_ready());
        assert_eq!(job.status, JobStatus::Stylized);
        assert!(driver.in_flight.is_empty());
    }

    #[tokio::test]
    async fn preview_failure_still_yields_bundle() {
        let dir = tempdir().unwrap();
        let compositor = Arc::new(CountingCompositor {
            fail_preview: true,
            ..CountingCompositor::default()
        });
        let (driver, registry, storage) = driver(dir.path(), compositor);
        stylized_job(&registry, &storage, "a");

        let bundle = driver.bundle_for_download("a").await.unwrap();

        let listing = std::fs::read_to_string(bundle).unwrap();
        assert_eq!(
            listing,
            "01_edge_map_cat.png\n02_stylized_cat.png\n03_composite_cat.png"
        );
        let job = registry.get("a").unwrap();
        assert!(job.preview_path.is_none());
        assert!(job.is_ready());
    }

    #[tokio::test]
    async fn archive_failure_keeps_job_and_allows_retry() {
        let dir = tempdir().unwrap();
        let compositor = Arc::new(CountingCompositor {
            fail_next_archive: AtomicBool::new(true),
            ..CountingCompositor::default()
        });
        let (driver, registry, storage) = driver(dir.path(), compositor.clone());
        stylized_job(&registry, &storage, "a");

        let err = driver.bundle_for_download("a").await.unwrap_err();
        assert!(matches!(err, DownloadError::Composition(ref msg) if msg.contains("disk full")));
        let job = registry.get("a").unwrap();
        assert_eq!(job.status, JobStatus::Stylized);
        assert!(job.composite_image_path.is_none());
        assert!(job.bundle_path.is_none());
        assert!(driver.in_flight.is_empty());

        driver.bundle_for_download("a").await.unwrap();
        assert!(registry.get("a").unwrap().is_ready());
        assert_eq!(compositor.merges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_stylized_file_is_reported() {
        let dir = tempdir().unwrap();
        let (driver, registry, storage) = driver(dir.path(), Arc::new(CountingCompositor::default()));
        stylized_job(&registry, &storage, "a");
        std::fs::remove_file(storage.files("a", "cat.png").stylized).unwrap();

        let err = driver.bundle_for_download("a").await.unwrap_err();
        assert!(matches!(err, DownloadError::MissingArtifacts));
        assert!(driver.in_flight.is_empty());
    }

    #[tokio::test]
    async fn failed_concurrent_downloads_release_lock_entry() {
        let dir = tempdir().unwrap();
        let compositor = Arc::new(CountingCompositor {
            fail_next_archive: AtomicBool::new(true),
            ..CountingCompositor::default()
        });
        let (driver, registry, storage) = driver(dir.path(), compositor.clone());
        stylized_job(&registry, &storage, "a");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let driver = Arc::clone(&driver);
                tokio::spawn(async move { driver.bundle_for_download("a").await })
            })
            .collect();
        let mut failures = 0;
        for handle in handles {
            if handle.await.unwrap().is_err() {
                failures += 1;
            }
        }

        assert_eq!(failures, 1);
        assert!(registry.get("a").unwrap().is_ready());
        assert!(driver.in_flight.is_empty());
    }

    #[tokio::test]
    async fn repeated_downloads_are_byte_identical() {
        let dir = tempdir().unwrap();
        let (driver, registry, storage) = driver(dir.path(), Arc::new(ImageCompositor::default()));
        stylized_job(&registry, &storage, "a");

        let first = driver.bundle_for_download("a").await.unwrap();
        let first_bytes = std::fs::read(&first).unwrap();
        let second = driver.bundle_for_download("a").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first_bytes, std::fs::read(&second).unwrap());
        let job = registry.get("a").unwrap();
        assert!(job.preview_path.is_some());
    }
}
