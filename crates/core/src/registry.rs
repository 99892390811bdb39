use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::JobError;
use crate::job::{Job, JobStatus};

/// Process-local job store.
///
/// Every read returns a snapshot clone and every write goes through
/// [`JobRegistry::update`], so a poller never sees a half-applied
/// transition.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<DashMap<String, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, job: Job) -> Result<String, JobError> {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(existing) => Err(JobError::DuplicateId(existing.key().clone())),
            Entry::Vacant(slot) => {
                let id = job.id.clone();
                slot.insert(job);
                Ok(id)
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Job, JobError> {
        self.jobs
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Atomic read-modify-write.
    ///
    /// `mutate` runs on a draft while the entry's shard lock is held; the
    /// draft replaces the stored record only if `mutate` returns `Ok`.
    /// `mutate` must not call back into the registry.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<Job, JobError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobError>,
    {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;

        let mut draft = entry.value().clone();
        mutate(&mut draft)?;
        draft.updated_at = Utc::now();
        *entry.value_mut() = draft.clone();
        Ok(draft)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn statuses(&self) -> Vec<(String, JobStatus)> {
        self.jobs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn create_then_get_returns_snapshot() {
        let registry = JobRegistry::new();
        let id = registry.create(Job::new("a", "cat.png")).unwrap();
        let job = registry.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.original_filename, "cat.png");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let registry = JobRegistry::new();
        registry.create(Job::new("a", "cat.png")).unwrap();
        let err = registry.create(Job::new("a", "dog.png")).unwrap_err();
        assert_eq!(err, JobError::DuplicateId("a".to_string()));
        assert_eq!(registry.get("a").unwrap().original_filename, "cat.png");
    }

    #[test]
    fn unknown_id_is_not_found() {
        let registry = JobRegistry::new();
        assert_eq!(
            registry.get("missing").unwrap_err(),
            JobError::NotFound("missing".to_string())
        );
        assert!(registry.update("missing", |_| Ok(())).is_err());
    }

    #[test]
    fn failed_mutation_leaves_record_untouched() {
        let registry = JobRegistry::new();
        registry.create(Job::new("a", "cat.png")).unwrap();

        let result = registry.update("a", |job| {
            job.original_filename = "scribbled.png".to_string();
            job.start_remote()
        });
        assert!(result.is_err());

        let job = registry.get("a").unwrap();
        assert_eq!(job.original_filename, "cat.png");
        assert_eq!(job.status, JobStatus::Created);
    }

    #[test]
    fn update_returns_committed_record() {
        let registry = JobRegistry::new();
        registry.create(Job::new("a", "cat.png")).unwrap();
        let updated = registry
            .update("a", |job| job.record_edge_map(PathBuf::from("/tmp/e.png")))
            .unwrap();
        assert_eq!(updated, registry.get("a").unwrap());
        assert_eq!(updated.status, JobStatus::EdgesReady);
    }

    #[test]
    fn concurrent_start_remote_has_single_winner() {
        let registry = JobRegistry::new();
        registry.create(Job::new("a", "cat.png")).unwrap();
        registry
            .update("a", |job| job.record_edge_map(PathBuf::from("/tmp/e.png")))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.update("a", Job::start_remote).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(registry.get("a").unwrap().status, JobStatus::ProcessingRemote);
    }

    #[test]
    fn readers_never_observe_status_without_its_path() {
        let registry = JobRegistry::new();
        registry.create(Job::new("a", "cat.png")).unwrap();

        let reader = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let job = registry.get("a").unwrap();
                    if job.status == JobStatus::EdgesReady {
                        assert!(job.edge_map_path.is_some());
                    }
                    if job.status == JobStatus::Created {
                        assert!(job.edge_map_path.is_none());
                    }
                }
            })
        };

        registry
            .update("a", |job| job.record_edge_map(PathBuf::from("/tmp/e.png")))
            .unwrap();
        reader.join().unwrap();
    }
}
