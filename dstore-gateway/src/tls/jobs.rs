//! Provisioning job table - at most one in-flight job per domain

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Accepted, waiting for the plaintext listener to be released
    Pending,
    /// Provisioning command is running
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ProvisionJob {
    pub domain: String,
    pub status: JobStatus,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
}

impl ProvisionJob {
    fn in_flight(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running)
    }
}

/// Outcome of asking to start a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobBegin {
    /// Caller owns the new job and must drive it to completion
    Started,
    /// Another job for this domain is already pending or running
    InFlight,
    /// Last attempt failed less than the configured cooldown ago
    CoolingDown { remaining: Duration },
}

pub struct ProvisionJobs {
    /// Minimum wait after a failed attempt before the domain may be retried
    failure_cooldown: Duration,
    jobs: Mutex<HashMap<String, ProvisionJob>>,
}

impl ProvisionJobs {
    pub fn new(failure_cooldown: Duration) -> Self {
        Self {
            failure_cooldown,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self, domain: &str) -> JobBegin {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get(domain) {
            if job.in_flight() {
                return JobBegin::InFlight;
            }
            if job.status == JobStatus::Failed
                && let Some(finished) = job.finished_at
            {
                let elapsed = finished.elapsed();
                if elapsed < self.failure_cooldown {
                    return JobBegin::CoolingDown {
                        remaining: self.failure_cooldown - elapsed,
                    };
                }
            }
        }

        jobs.insert(
            domain.to_string(),
            ProvisionJob {
                domain: domain.to_string(),
                status: JobStatus::Pending,
                started_at: Instant::now(),
                finished_at: None,
            },
        );
        JobBegin::Started
    }

    pub fn mark_running(&self, domain: &str) {
        self.set_status(domain, JobStatus::Running);
    }

    pub fn mark_succeeded(&self, domain: &str) {
        self.set_status(domain, JobStatus::Succeeded);
    }

    pub fn mark_failed(&self, domain: &str) {
        self.set_status(domain, JobStatus::Failed);
    }

    fn set_status(&self, domain: &str, status: JobStatus) {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get_mut(domain) {
            job.status = status;
            if matches!(status, JobStatus::Succeeded | JobStatus::Failed) {
                job.finished_at = Some(Instant::now());
            }
        }
    }

    pub fn get(&self, domain: &str) -> Option<ProvisionJob> {
        self.jobs.lock().get(domain).cloned()
    }

    pub fn status(&self, domain: &str) -> Option<JobStatus> {
        self.jobs.lock().get(domain).map(|job| job.status)
    }

    pub fn is_in_flight(&self, domain: &str) -> bool {
        self.jobs
            .lock()
            .get(domain)
            .map(ProvisionJob::in_flight)
            .unwrap_or(false)
    }
}
