//! CPU-side fork/join task composition used to parallelise per-pass frame
//! work.

use std::thread::{Scope, ScopedJoinHandle};

/// Pipeline-stage task composer.
///
/// Tasks enqueued within one stage may run concurrently; a stage only begins
/// once every task of the previous stage has finished. The render graph uses
/// one stage for per-pass CPU preparation, one for command recording, and one
/// single-task stage per pass for submission, which keeps queue submission
/// order deterministic.
pub trait TaskComposer<'env> {
    /// Begin a new pipeline stage, draining the previous one.
    fn begin_pipeline_stage(&mut self, desc: &str);

    /// Add a task to the current stage.
    fn enqueue_task(&mut self, task: Box<dyn FnOnce() + Send + 'env>);

    /// Wait for every enqueued task to finish.
    fn join(&mut self);
}

/// Runs every task immediately on the calling thread.
#[derive(Debug, Default)]
pub struct InlineComposer;

impl InlineComposer {
    pub fn new() -> Self {
        Self
    }
}

impl<'env> TaskComposer<'env> for InlineComposer {
    fn begin_pipeline_stage(&mut self, _desc: &str) {}

    fn enqueue_task(&mut self, task: Box<dyn FnOnce() + Send + 'env>) {
        task()
    }

    fn join(&mut self) {}
}

/// Stage-parallel composer built on scoped threads.
///
/// ```no_run
/// use deimos::task::{ScopedComposer, TaskComposer};
///
/// std::thread::scope(|scope| {
///     let mut composer = ScopedComposer::new(scope);
///     composer.begin_pipeline_stage("work");
///     composer.enqueue_task(Box::new(|| { /* ... */ }));
///     composer.join();
/// });
/// ```
pub struct ScopedComposer<'scope, 'env> {
    scope: &'scope Scope<'scope, 'env>,
    running: Vec<ScopedJoinHandle<'scope, ()>>,
}

impl<'scope, 'env> ScopedComposer<'scope, 'env> {
    pub fn new(scope: &'scope Scope<'scope, 'env>) -> Self {
        Self {
            scope,
            running: Vec::new(),
        }
    }

    fn drain(&mut self) {
        for handle in self.running.drain(..) {
            if handle.join().is_err() {
                error!("render graph task panicked");
            }
        }
    }
}

impl<'scope, 'env> TaskComposer<'env> for ScopedComposer<'scope, 'env> {
    fn begin_pipeline_stage(&mut self, _desc: &str) {
        self.drain();
    }

    fn enqueue_task(&mut self, task: Box<dyn FnOnce() + Send + 'env>) {
        self.running.push(self.scope.spawn(task));
    }

    fn join(&mut self) {
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn scoped_composer_serialises_stages() {
        let counter = AtomicU32::new(0);
        std::thread::scope(|scope| {
            let mut composer = ScopedComposer::new(scope);
            composer.begin_pipeline_stage("first");
            for _ in 0..4 {
                composer.enqueue_task(Box::new(|| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
            composer.begin_pipeline_stage("second");
            // The previous stage must have drained by now.
            assert_eq!(counter.load(Ordering::SeqCst), 4);
            composer.enqueue_task(Box::new(|| {
                counter.fetch_add(10, Ordering::SeqCst);
            }));
            composer.join();
            assert_eq!(counter.load(Ordering::SeqCst), 14);
        });
    }
}
