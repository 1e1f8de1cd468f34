//! Reasoning tasks and their per-thread workers.
//!
//! A [`ReasoningTask`] is created for one phase of a round. The pool calls
//! [`ReasoningTask::initialize`] once, then [`ReasoningTask::create_worker`]
//! for every thread taking part, and runs the workers to completion.
//!
//! Phase code is written once against [`PhaseBody::run`], generic over four
//! compile-time switches. [`specialize_worker!`] turns a runtime
//! [`TaskConfig`] into the matching instantiation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ReasonerResult;

/// Shared stop flag of one execution. Workers poll it at every dequeue.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Identity of a worker inside one execution.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub index: usize,
    pub token: CancellationToken,
}

impl WorkerHandle {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The four specialization axes of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskConfig {
    /// Report events to the engine's monitor.
    pub has_monitor: bool,
    /// Several workers share the queue cursors.
    pub multithreaded: bool,
    /// Equality reasoning is enabled: normalize and skip non-canonical rows.
    pub optimize_equality: bool,
    /// Restrict processing to the current component level.
    pub check_component_level: bool,
}

impl TaskConfig {
    /// Same configuration, forced single-threaded.
    pub fn serial(self) -> Self {
        Self {
            multithreaded: false,
            ..self
        }
    }
}

pub trait ReasoningTaskWorker: Send {
    /// Process work until the task's queues are drained or the execution is
    /// cancelled. Cancellation is not an error.
    fn run(&mut self) -> ReasonerResult<()>;
}

pub trait ReasoningTask: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> TaskConfig;

    /// Called once before any worker is created.
    fn initialize(&self, worker_count: usize) -> ReasonerResult<()>;

    fn create_worker(
        &self,
        index: usize,
        token: &CancellationToken,
    ) -> Box<dyn ReasoningTaskWorker>;
}

// ---------------------------------------------------------------------------
// Phase tasks
// ---------------------------------------------------------------------------

/// Body of a phase, shared by all of its workers.
pub trait PhaseBody: Send + Sync + 'static {
    const NAME: &'static str;

    fn initialize(&self, _worker_count: usize) -> ReasonerResult<()> {
        Ok(())
    }

    fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
        &self,
        worker: &WorkerHandle,
    ) -> ReasonerResult<()>;
}

/// Worker instantiated for one point of the configuration space.
pub struct PhaseWorker<B, const MON: bool, const MT: bool, const EQ: bool, const LVL: bool> {
    body: Arc<B>,
    handle: WorkerHandle,
}

impl<B: PhaseBody, const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>
    PhaseWorker<B, MON, MT, EQ, LVL>
{
    pub fn new(body: Arc<B>, handle: WorkerHandle) -> Self {
        Self { body, handle }
    }
}

impl<B: PhaseBody, const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>
    ReasoningTaskWorker for PhaseWorker<B, MON, MT, EQ, LVL>
{
    fn run(&mut self) -> ReasonerResult<()> {
        self.body.run::<MON, MT, EQ, LVL>(&self.handle)
    }
}

/// Expand a [`TaskConfig`] into the matching [`PhaseWorker`] instantiation.
#[macro_export]
macro_rules! specialize_worker {
    ($config:expr, $body:expr, $handle:expr) => {{
        let config: $crate::reasoning::task::TaskConfig = $config;
        let body = $body;
        let handle = $handle;
        use $crate::reasoning::task::{PhaseWorker, ReasoningTaskWorker};
        let worker: Box<dyn ReasoningTaskWorker> = match (
            config.has_monitor,
            config.multithreaded,
            config.optimize_equality,
            config.check_component_level,
        ) {
            (false, false, false, false) => Box::new(PhaseWorker::<_, false, false, false, false>::new(body, handle)),
            (false, false, false, true) => Box::new(PhaseWorker::<_, false, false, false, true>::new(body, handle)),
            (false, false, true, false) => Box::new(PhaseWorker::<_, false, false, true, false>::new(body, handle)),
            (false, false, true, true) => Box::new(PhaseWorker::<_, false, false, true, true>::new(body, handle)),
            (false, true, false, false) => Box::new(PhaseWorker::<_, false, true, false, false>::new(body, handle)),
            (false, true, false, true) => Box::new(PhaseWorker::<_, false, true, false, true>::new(body, handle)),
            (false, true, true, false) => Box::new(PhaseWorker::<_, false, true, true, false>::new(body, handle)),
            (false, true, true, true) => Box::new(PhaseWorker::<_, false, true, true, true>::new(body, handle)),
            (true, false, false, false) => Box::new(PhaseWorker::<_, true, false, false, false>::new(body, handle)),
            (true, false, false, true) => Box::new(PhaseWorker::<_, true, false, false, true>::new(body, handle)),
            (true, false, true, false) => Box::new(PhaseWorker::<_, true, false, true, false>::new(body, handle)),
            (true, false, true, true) => Box::new(PhaseWorker::<_, true, false, true, true>::new(body, handle)),
            (true, true, false, false) => Box::new(PhaseWorker::<_, true, true, false, false>::new(body, handle)),
            (true, true, false, true) => Box::new(PhaseWorker::<_, true, true, false, true>::new(body, handle)),
            (true, true, true, false) => Box::new(PhaseWorker::<_, true, true, true, false>::new(body, handle)),
            (true, true, true, true) => Box::new(PhaseWorker::<_, true, true, true, true>::new(body, handle)),
        };
        worker
    }};
}

/// A [`ReasoningTask`] running the same [`PhaseBody`] on every worker.
pub struct PhaseTask<B> {
    body: Arc<B>,
    config: TaskConfig,
}

impl<B: PhaseBody> PhaseTask<B> {
    pub fn new(body: B, config: TaskConfig) -> Self {
        Self {
            body: Arc::new(body),
            config,
        }
    }

    pub fn body(&self) -> &B {
        &self.body
    }
}

impl<B: PhaseBody> ReasoningTask for PhaseTask<B> {
    fn name(&self) -> &str {
        B::NAME
    }

    fn config(&self) -> TaskConfig {
        self.config
    }

    fn initialize(&self, worker_count: usize) -> ReasonerResult<()> {
        self.body.initialize(worker_count)
    }

    fn create_worker(
        &self,
        index: usize,
        token: &CancellationToken,
    ) -> Box<dyn ReasoningTaskWorker> {
        let handle = WorkerHandle {
            index,
            token: token.clone(),
        };
        specialize_worker!(self.config, Arc::clone(&self.body), handle)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(usize, [bool; 4])>>,
    }

    impl PhaseBody for Recorder {
        const NAME: &'static str = "recorder";

        fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
            &self,
            worker: &WorkerHandle,
        ) -> ReasonerResult<()> {
            self.seen
                .lock()
                .unwrap()
                .push((worker.index, [MON, MT, EQ, LVL]));
            Ok(())
        }
    }

    #[test]
    fn every_configuration_reaches_its_specialization() {
        for bits in 0u8..16 {
            let config = TaskConfig {
                has_monitor: bits & 8 != 0,
                multithreaded: bits & 4 != 0,
                optimize_equality: bits & 2 != 0,
                check_component_level: bits & 1 != 0,
            };
            let task = PhaseTask::new(Recorder::default(), config);
            let token = CancellationToken::new();
            task.create_worker(3, &token).run().unwrap();
            let seen = task.body().seen.lock().unwrap().clone();
            assert_eq!(
                seen,
                vec![(
                    3,
                    [
                        config.has_monitor,
                        config.multithreaded,
                        config.optimize_equality,
                        config.check_component_level
                    ]
                )]
            );
        }
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let handle = WorkerHandle {
            index: 0,
            token: token.clone(),
        };
        assert!(!handle.is_cancelled());
        token.cancel();
        assert!(handle.is_cancelled());
        assert!(!TaskConfig { multithreaded: true, ..Default::default() }.serial().multithreaded);
    }
}
