use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const MAX_STEM_CHARS: usize = 64;
const FALLBACK_STEM: &str = "upload";

/// Per-job directory layout under the temporary-storage root.
#[derive(Debug, Clone)]
pub struct JobStorage {
    root: PathBuf,
    public_mount: String,
}

/// The files a job may own, all inside `<root>/<job_id>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFiles {
    pub dir: PathBuf,
    pub stem: String,
    pub edge_map: PathBuf,
    pub stylized: PathBuf,
    pub composite: PathBuf,
    pub preview: PathBuf,
    pub bundle: PathBuf,
}

impl JobStorage {
    pub fn new(root: impl Into<PathBuf>, public_mount: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_mount: public_mount.into().trim_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn public_mount(&self) -> &str {
        &self.public_mount
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create storage root: {}", self.root.display()))
    }

    pub fn files(&self, job_id: &str, original_filename: &str) -> JobFiles {
        let dir = self.root.join(job_id);
        let stem = sanitize_stem(original_filename);
        JobFiles {
            edge_map: dir.join(format!("edge_{stem}.png")),
            stylized: dir.join(format!("stylized_{stem}.png")),
            composite: dir.join(format!("composite_{stem}.png")),
            preview: dir.join(format!("preview_{stem}.gif")),
            bundle: dir.join(format!("sketchsplit_{job_id}.zip")),
            dir,
            stem,
        }
    }

    /// Creates the job directory. Ids are unique, so no two jobs share one.
    pub fn create_job_dir(&self, files: &JobFiles) -> Result<()> {
        fs::create_dir_all(&files.dir)
            .with_context(|| format!("failed to create job directory: {}", files.dir.display()))
    }

    /// `<public_mount>/<relative path>` for a file under the root, if it is one.
    pub fn public_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(format!("{}/{}", self.public_mount, parts.join("/")))
    }
}

/// Reduces a client-supplied filename to a safe stem: directory parts and
/// the extension are dropped and only `[A-Za-z0-9_-]` survives.
pub fn sanitize_stem(original_filename: &str) -> String {
    let base = original_filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let stem = match base.rfind('.') {
        Some(idx) if idx > 0 => &base[..idx],
        _ => base,
    };

    let cleaned: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_STEM_CHARS)
        .collect();

    if cleaned.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_plain_stems() {
        assert_eq!(sanitize_stem("cat_photo-1.png"), "cat_photo-1");
        assert_eq!(sanitize_stem("archive.tar.gz"), "archivetar");
    }

    #[test]
    fn sanitize_strips_directory_components() {
        assert_eq!(sanitize_stem("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_stem("C:\\Users\\me\\face.jpg"), "face");
    }

    #[test]
    fn sanitize_falls_back_for_empty_results() {
        assert_eq!(sanitize_stem(""), "upload");
        assert_eq!(sanitize_stem(".."), "upload");
        assert_eq!(sanitize_stem("日本.png"), "upload");
        assert_eq!(sanitize_stem(".hidden"), "hidden");
    }

    #[test]
    fn sanitize_truncates_long_names() {
        let long = format!("{}.png", "a".repeat(200));
        assert_eq!(sanitize_stem(&long).len(), MAX_STEM_CHARS);
    }

    #[test]
    fn files_are_namespaced_by_job_id() {
        let storage = JobStorage::new("/srv/tmp", "temp_images");
        let files = storage.files("job-1", "../cat.png");
        assert_eq!(files.dir, PathBuf::from("/srv/tmp/job-1"));
        assert_eq!(files.edge_map, PathBuf::from("/srv/tmp/job-1/edge_cat.png"));
        assert_eq!(files.bundle, PathBuf::from("/srv/tmp/job-1/sketchsplit_job-1.zip"));
        assert!(files.preview.starts_with(&files.dir));
    }

    #[test]
    fn public_path_uses_mount_prefix() {
        let storage = JobStorage::new("/srv/tmp", "/temp_images/");
        let files = storage.files("job-1", "cat.png");
        assert_eq!(
            storage.public_path(&files.edge_map).as_deref(),
            Some("temp_images/job-1/edge_cat.png")
        );
        assert_eq!(storage.public_path(Path::new("/elsewhere/x.png")), None);
    }
}
