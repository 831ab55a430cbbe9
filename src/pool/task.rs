//! Unit of work handed to the pool.

use uuid::Uuid;

use super::runnable::JobSpec;

/// Pairs an opaque identifier with the job to run.
///
/// The pool itself only consumes the job; the id exists for callers that
/// track work across dispatch and callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    id: Uuid,
    job: JobSpec,
}

impl Task {
    /// Create a task with a fresh identifier.
    pub fn new(job: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
        }
    }

    /// The task's identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The job to dispatch.
    pub fn job(&self) -> &JobSpec {
        &self.job
    }

    /// Consume the task, yielding the job.
    pub fn into_job(self) -> JobSpec {
        self.job
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_distinct() {
        let a = Task::new(JobSpec::new("one"));
        let b = Task::new(JobSpec::new("one"));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.job(), b.job());
    }

    #[test]
    fn test_into_job() {
        let task = Task::new(JobSpec::new("scan"));
        assert_eq!(task.into_job(), JobSpec::new("scan"));
    }
}
