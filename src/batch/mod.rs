//! External batch-queue scheduler.

mod slurm;

pub use slurm::SlurmScheduler;

use async_trait::async_trait;
use std::path::PathBuf;

use crate::errors::BackendError;

/// A job array to submit: one command line per task.
#[derive(Debug, Clone, PartialEq)]
pub struct JobArraySpec {
    pub name: String,
    /// Submission directory; job script and task logs are written here
    pub dir: PathBuf,
    pub tasks: Vec<Vec<String>>,
}

/// Task counts of a job array as reported by the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStatus {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStatus {
    pub fn is_done(&self) -> bool {
        self.total > 0 && self.completed >= self.total
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total as f64) * 100.0
    }
}

#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Submit a job array and return its handle.
    async fn submit(&self, spec: &JobArraySpec) -> Result<String, BackendError>;

    /// Query the status of a job array of `tasks` tasks.
    async fn status(&self, job: &str, tasks: usize) -> Result<JobStatus, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status() {
        let status = JobStatus {
            total: 4,
            completed: 1,
            failed: 0,
        };
        assert_eq!(status.percent(), 25.0);
        assert!(!status.is_done());
        assert!(!status.has_failures());

        let done = JobStatus {
            completed: 4,
            ..status
        };
        assert!(done.is_done());
        assert_eq!(JobStatus::default().percent(), 0.0);
        assert!(!JobStatus::default().is_done());
    }
}
