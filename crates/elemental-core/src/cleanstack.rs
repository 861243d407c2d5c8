//! LIFO stack of deferred cleanup tasks.
//!
//! Tasks are classified as run-always, on-success or on-error. The stack is
//! the sole mechanism for unmounting binds, removing temporary directories
//! and promoting transaction rollback on every exit path.

use anyhow::Result;

type Task<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Always,
    SuccessOnly,
    ErrorOnly,
}

struct Job<'a> {
    task: Task<'a>,
    kind: JobKind,
}

/// A basic LIFO stack of cleanup jobs.
#[derive(Default)]
pub struct CleanStack<'a> {
    jobs: Vec<Job<'a>>,
}

impl<'a> CleanStack<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a task that is always executed.
    pub fn push(&mut self, task: impl FnOnce() -> Result<()> + 'a) {
        self.jobs.push(Job {
            task: Box::new(task),
            kind: JobKind::Always,
        });
    }

    /// Push a task executed only when cleanup runs with an error.
    pub fn push_error_only(&mut self, task: impl FnOnce() -> Result<()> + 'a) {
        self.jobs.push(Job {
            task: Box::new(task),
            kind: JobKind::ErrorOnly,
        });
    }

    /// Push a task executed only when cleanup runs without an error.
    pub fn push_success_only(&mut self, task: impl FnOnce() -> Result<()> + 'a) {
        self.jobs.push(Job {
            task: Box::new(task),
            kind: JobKind::SuccessOnly,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run the whole stack in reverse push order.
    ///
    /// The incoming result decides which categories run; errors raised by
    /// cleanup tasks are joined onto the incoming error, incoming first.
    pub fn cleanup(&mut self, incoming: Result<()>) -> Result<()> {
        let failed = incoming.is_err();
        let mut result = incoming;
        if let Err(err) = self.run_for(failed) {
            result = match result {
                Ok(()) => Err(err),
                Err(prev) => Err(prev.context(format!("cleanup also failed: {err:#}"))),
            };
        }
        result
    }

    /// Runs the stack in error or success mode, returning only errors
    /// raised by the cleanup tasks themselves.
    pub fn run_for(&mut self, failed: bool) -> Result<()> {
        let mut result = Ok(());
        while let Some(job) = self.jobs.pop() {
            let run = match job.kind {
                JobKind::Always => true,
                JobKind::SuccessOnly => !failed,
                JobKind::ErrorOnly => failed,
            };
            if !run {
                continue;
            }
            if let Err(err) = (job.task)() {
                result = match result {
                    Ok(()) => Err(err),
                    Err(prev) => Err(prev.context(format!("{err:#}"))),
                };
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use anyhow::anyhow;

    use super::*;

    fn recorder(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> impl FnOnce() -> Result<()> {
        let log = Rc::clone(log);
        move || {
            log.borrow_mut().push(tag);
            Ok(())
        }
    }

    #[test]
    fn success_runs_always_and_success_jobs_in_reverse_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut stack = CleanStack::new();
        stack.push(recorder(&log, "always-1"));
        stack.push_success_only(recorder(&log, "success"));
        stack.push_error_only(recorder(&log, "error"));
        stack.push(recorder(&log, "always-2"));

        assert!(stack.cleanup(Ok(())).is_ok());
        assert_eq!(*log.borrow(), vec!["always-2", "success", "always-1"]);
        assert!(stack.is_empty());
    }

    #[test]
    fn failure_runs_always_and_error_jobs() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut stack = CleanStack::new();
        stack.push(recorder(&log, "always"));
        stack.push_success_only(recorder(&log, "success"));
        stack.push_error_only(recorder(&log, "error"));

        let err = stack.cleanup(Err(anyhow!("boom"))).unwrap_err();
        assert_eq!(*log.borrow(), vec!["error", "always"]);
        assert!(format!("{err:#}").contains("boom"));
    }

    #[test]
    fn cleanup_errors_are_joined_onto_the_incoming_error() {
        let mut stack = CleanStack::new();
        stack.push(|| Err(anyhow!("unmount failed")));

        let err = stack.cleanup(Err(anyhow!("sync failed"))).unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("sync failed"));
        assert!(chain.contains("unmount failed"));
    }

    #[test]
    fn cleanup_error_alone_surfaces_on_success_path() {
        let mut stack = CleanStack::new();
        stack.push(|| Err(anyhow!("remove failed")));
        let err = stack.cleanup(Ok(())).unwrap_err();
        assert!(format!("{err:#}").contains("remove failed"));
    }

    #[test]
    fn each_job_runs_exactly_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut stack = CleanStack::new();
        stack.push(recorder(&log, "always"));
        let _ = stack.cleanup(Ok(()));
        let _ = stack.cleanup(Ok(()));
        assert_eq!(*log.borrow(), vec!["always"]);
    }
}
