//! Batch-job state, guarded by a map-level lock plus one lock per job.
//!
//! Counter invariants: `completed + failed <= total` always; a terminal
//! status is monotonic and stamps `completed_at`; `completed` status means
//! every image finished and at least one succeeded; `failed` means every
//! image failed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

/// Job lifecycle.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, fan-out not finished.
    Pending,
    /// At least one image is in flight.
    Processing,
    /// All images finished, at least one succeeded.
    Completed,
    /// All images failed.
    Failed,
    /// Abandoned before completion.
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Per-image lifecycle inside a job.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    /// Recorded, not yet in the pipeline.
    Pending,
    /// Published into the pipeline.
    Processing,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
}

impl ImageState {
    fn is_terminal(self) -> bool {
        matches!(self, ImageState::Completed | ImageState::Failed)
    }
}

/// One image's slot in a batch job.
#[derive(Debug, Clone, Serialize)]
pub struct BatchImageStatus {
    /// Position in the submitted source list.
    pub index: usize,
    /// Filename used for the upload.
    pub original_filename: String,
    /// Trace id minted at fan-out; the correlation key.
    pub trace_id: String,
    /// Current state.
    pub status: ImageState,
    /// Key in the processed bucket, set on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_path: Option<String>,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// First time the image entered `processing`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the image reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl BatchImageStatus {
    /// A fresh pending slot.
    pub fn pending(index: usize, original_filename: String, trace_id: String) -> Self {
        Self {
            index,
            original_filename,
            trace_id,
            status: ImageState::Pending,
            processed_path: None,
            error: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// A coordinator-owned batch job.
#[derive(Debug, Clone, Serialize)]
pub struct BatchJob {
    /// External handle.
    pub job_id: String,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Number of submitted sources.
    pub total: usize,
    /// Images that completed.
    pub completed: usize,
    /// Images that failed.
    pub failed: usize,
    /// Per-image slots, indexed by submission order.
    pub images: Vec<BatchImageStatus>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// Set when the job reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    /// A fresh pending job for `total` sources.
    pub fn new(job_id: String, total: usize) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            status: JobStatus::Pending,
            total,
            completed: 0,
            failed: 0,
            images: Vec::with_capacity(total),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Finished share in percent.
    pub fn progress_percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (((self.completed + self.failed) * 100) / self.total) as u8
    }

    /// Whether the job is in a terminal status.
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Derive the status transition after a counter or image change.
    /// Terminal statuses are sticky.
    fn recompute_status(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        let finished = self.completed + self.failed;
        if finished >= self.total && self.total > 0 {
            self.status = if self.failed == self.total {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            self.completed_at = Some(Utc::now());
        } else if finished > 0 || self.images.iter().any(|i| i.status == ImageState::Processing) {
            self.status = JobStatus::Processing;
        }
    }

    fn image_by_trace_mut(&mut self, trace_id: &str) -> Option<&mut BatchImageStatus> {
        self.images.iter_mut().find(|i| i.trace_id == trace_id)
    }
}

/// Terminal outcome for one image, as correlated from `image_processed`.
#[derive(Debug, Clone)]
pub struct ImageOutcome {
    /// Correlation key.
    pub trace_id: String,
    /// Whether the pipeline completed the image.
    pub completed: bool,
    /// Processed-bucket key on success.
    pub processed_path: Option<String>,
    /// Failure detail.
    pub error: Option<String>,
}

/// Result of applying an update under the job lock: a snapshot to publish
/// from, the touched image, and whether this update ended the job.
pub struct AppliedUpdate {
    /// Job snapshot after the update.
    pub job: BatchJob,
    /// Image snapshot after the update.
    pub image: BatchImageStatus,
    /// True when this update moved the job into a terminal status.
    pub job_just_completed: bool,
}

/// All live jobs: an outer lock over the map, an inner lock per job.
#[derive(Default)]
pub struct JobStore {
    jobs: RwLock<HashMap<String, Arc<RwLock<BatchJob>>>>,
}

impl JobStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job.
    pub fn insert(&self, job: BatchJob) {
        let mut jobs = self.jobs.write().expect("job map lock poisoned");
        jobs.insert(job.job_id.clone(), Arc::new(RwLock::new(job)));
    }

    /// Snapshot one job.
    pub fn get(&self, job_id: &str) -> Option<BatchJob> {
        let jobs = self.jobs.read().expect("job map lock poisoned");
        jobs.get(job_id)
            .map(|job| job.read().expect("job lock poisoned").clone())
    }

    /// Snapshot every job, newest first.
    pub fn list(&self) -> Vec<BatchJob> {
        let jobs = self.jobs.read().expect("job map lock poisoned");
        let mut out: Vec<BatchJob> = jobs
            .values()
            .map(|job| job.read().expect("job lock poisoned").clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    fn job_handle(&self, job_id: &str) -> Option<Arc<RwLock<BatchJob>>> {
        let jobs = self.jobs.read().expect("job map lock poisoned");
        jobs.get(job_id).cloned()
    }

    /// Append an image slot to a job; returns the updated snapshot.
    pub fn add_image(&self, job_id: &str, image: BatchImageStatus) -> Option<BatchJob> {
        let handle = self.job_handle(job_id)?;
        let mut job = handle.write().expect("job lock poisoned");
        job.images.push(image);
        job.touch();
        job.recompute_status();
        Some(job.clone())
    }

    /// Move an image to `processing` (first publish into the pipeline).
    pub fn mark_image_processing(&self, job_id: &str, trace_id: &str) -> Option<AppliedUpdate> {
        let handle = self.job_handle(job_id)?;
        let mut job = handle.write().expect("job lock poisoned");
        let image = job.image_by_trace_mut(trace_id)?;
        if image.status.is_terminal() {
            return None;
        }
        image.status = ImageState::Processing;
        if image.start_time.is_none() {
            image.start_time = Some(Utc::now());
        }
        let image = image.clone();
        job.touch();
        job.recompute_status();
        Some(AppliedUpdate {
            job: job.clone(),
            image,
            job_just_completed: false,
        })
    }

    /// Mark an image failed during fan-out (fetch/upload/publish error).
    pub fn mark_image_failed(
        &self,
        job_id: &str,
        trace_id: &str,
        error: String,
    ) -> Option<AppliedUpdate> {
        self.apply_terminal(job_id, trace_id, false, None, Some(error))
    }

    /// Correlate a terminal pipeline outcome by trace id across all jobs.
    pub fn apply_outcome(&self, outcome: &ImageOutcome) -> Option<AppliedUpdate> {
        let job_id = {
            let jobs = self.jobs.read().expect("job map lock poisoned");
            jobs.iter()
                .find(|(_, job)| {
                    job.read()
                        .expect("job lock poisoned")
                        .images
                        .iter()
                        .any(|i| i.trace_id == outcome.trace_id)
                })
                .map(|(id, _)| id.clone())
        }?;
        self.apply_terminal(
            &job_id,
            &outcome.trace_id,
            outcome.completed,
            outcome.processed_path.clone(),
            outcome.error.clone(),
        )
    }

    fn apply_terminal(
        &self,
        job_id: &str,
        trace_id: &str,
        completed: bool,
        processed_path: Option<String>,
        error: Option<String>,
    ) -> Option<AppliedUpdate> {
        let handle = self.job_handle(job_id)?;
        let mut job = handle.write().expect("job lock poisoned");
        let was_terminal = job.status.is_terminal();

        let image = job.image_by_trace_mut(trace_id)?;
        if image.status.is_terminal() {
            // At-least-once delivery can replay a terminal envelope.
            debug!(trace_id, "ignoring duplicate terminal update");
            return None;
        }
        image.status = if completed {
            ImageState::Completed
        } else {
            ImageState::Failed
        };
        image.processed_path = processed_path;
        image.error = error;
        if image.start_time.is_none() {
            image.start_time = Some(Utc::now());
        }
        image.end_time = Some(Utc::now());
        let image = image.clone();

        if completed {
            job.completed += 1;
        } else {
            job.failed += 1;
        }
        job.touch();
        job.recompute_status();

        Some(AppliedUpdate {
            job_just_completed: !was_terminal && job.status.is_terminal(),
            job: job.clone(),
            image,
        })
    }

    /// Cancel every non-terminal job (service shutdown).
    pub fn cancel_open_jobs(&self) -> usize {
        let jobs = self.jobs.read().expect("job map lock poisoned");
        let mut cancelled = 0;
        for job in jobs.values() {
            let mut job = job.write().expect("job lock poisoned");
            if !job.status.is_terminal() {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                job.touch();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Evict terminal jobs whose completion is older than `ttl`. Returns the
    /// number removed.
    pub fn sweep_terminal(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(24));
        let mut jobs = self.jobs.write().expect("job map lock poisoned");
        let before = jobs.len();
        jobs.retain(|_, job| {
            let job = job.read().expect("job lock poisoned");
            match (job.status.is_terminal(), job.completed_at) {
                (true, Some(done)) => done > cutoff,
                _ => true,
            }
        });
        let removed = before - jobs.len();
        if removed > 0 {
            info!(removed, "swept terminal batch jobs");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_images(total: usize) -> (JobStore, String) {
        let store = JobStore::new();
        let job = BatchJob::new("job-1".to_string(), total);
        store.insert(job);
        for i in 0..total {
            store.add_image(
                "job-1",
                BatchImageStatus::pending(i, format!("img{i}.jpg"), format!("trace-{i}")),
            );
        }
        (store, "job-1".to_string())
    }

    fn outcome(trace_id: &str, completed: bool) -> ImageOutcome {
        ImageOutcome {
            trace_id: trace_id.to_string(),
            completed,
            processed_path: completed.then(|| format!("processed/{trace_id}/img.jpg")),
            error: (!completed).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn all_completed_job_completes() {
        let (store, job_id) = job_with_images(3);
        for i in 0..3 {
            store.apply_outcome(&outcome(&format!("trace-{i}"), true));
        }
        let job = store.get(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed, 3);
        assert_eq!(job.failed, 0);
        assert!(job.completed_at.is_some());
        assert_eq!(job.progress_percent(), 100);
    }

    #[test]
    fn mixed_outcomes_still_complete_the_job() {
        let (store, job_id) = job_with_images(3);
        store.apply_outcome(&outcome("trace-0", true));
        store.apply_outcome(&outcome("trace-1", false));
        let last = store.apply_outcome(&outcome("trace-2", true)).unwrap();
        assert!(last.job_just_completed);

        let job = store.get(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed, 2);
        assert_eq!(job.failed, 1);
    }

    #[test]
    fn all_failed_job_fails() {
        let (store, job_id) = job_with_images(2);
        store.apply_outcome(&outcome("trace-0", false));
        store.apply_outcome(&outcome("trace-1", false));
        let job = store.get(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn terminal_status_is_monotonic() {
        let (store, job_id) = job_with_images(1);
        store.apply_outcome(&outcome("trace-0", true));
        assert_eq!(store.get(&job_id).unwrap().status, JobStatus::Completed);

        // A replayed terminal envelope changes nothing.
        assert!(store.apply_outcome(&outcome("trace-0", false)).is_none());
        let job = store.get(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed, 1);
        assert_eq!(job.failed, 0);
    }

    #[test]
    fn counters_stay_bounded_under_concurrent_updates() {
        let store = Arc::new(JobStore::new());
        let total = 64;
        store.insert(BatchJob::new("job-c".to_string(), total));
        for i in 0..total {
            store.add_image(
                "job-c",
                BatchImageStatus::pending(i, format!("{i}.jpg"), format!("t-{i}")),
            );
        }

        let mut handles = Vec::new();
        for i in 0..total {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.apply_outcome(&outcome(&format!("t-{i}"), i % 3 != 0));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let job = store.get("job-c").unwrap();
        assert_eq!(job.completed + job.failed, total);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn processing_transition_sets_start_time_once() {
        let (store, job_id) = job_with_images(1);
        let first = store.mark_image_processing(&job_id, "trace-0").unwrap();
        let started = first.image.start_time.unwrap();
        assert_eq!(first.image.status, ImageState::Processing);
        assert_eq!(first.job.status, JobStatus::Processing);

        let second = store.mark_image_processing(&job_id, "trace-0").unwrap();
        assert_eq!(second.image.start_time.unwrap(), started);
    }

    #[test]
    fn fanout_failure_counts_as_failed_image() {
        let (store, job_id) = job_with_images(2);
        store.mark_image_failed(&job_id, "trace-0", "fetch refused".to_string());
        let job = store.get(&job_id).unwrap();
        assert_eq!(job.failed, 1);
        assert_eq!(job.images[0].error.as_deref(), Some("fetch refused"));
        assert!(job.images[0].end_time.is_some());
    }

    #[test]
    fn unknown_trace_is_ignored() {
        let (store, _) = job_with_images(1);
        assert!(store.apply_outcome(&outcome("no-such-trace", true)).is_none());
    }

    #[test]
    fn sweep_evicts_only_old_terminal_jobs() {
        let store = JobStore::new();

        let mut old = BatchJob::new("old".to_string(), 0);
        old.status = JobStatus::Completed;
        old.completed_at = Some(Utc::now() - chrono::Duration::hours(25));
        store.insert(old);

        let mut fresh = BatchJob::new("fresh".to_string(), 0);
        fresh.status = JobStatus::Completed;
        fresh.completed_at = Some(Utc::now());
        store.insert(fresh);

        store.insert(BatchJob::new("open".to_string(), 2));

        let removed = store.sweep_terminal(Duration::from_secs(24 * 3600));
        assert_eq!(removed, 1);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
        assert!(store.get("open").is_some());
    }

    #[test]
    fn cancel_open_jobs_spares_terminal_ones() {
        let store = JobStore::new();
        store.insert(BatchJob::new("open".to_string(), 3));
        let mut done = BatchJob::new("done".to_string(), 0);
        done.status = JobStatus::Failed;
        done.completed_at = Some(Utc::now());
        store.insert(done);

        assert_eq!(store.cancel_open_jobs(), 1);
        assert_eq!(store.get("open").unwrap().status, JobStatus::Cancelled);
        assert_eq!(store.get("done").unwrap().status, JobStatus::Failed);
    }
}
