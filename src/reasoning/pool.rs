//! Engine worker threads and the pool that dispatches tasks to them.
//!
//! Each [`EngineWorkerThread`] is a long-lived OS thread driven through a
//! four-state machine:
//!
//! ```text
//! Idle --initialize_worker--> Loaded --start_reasoning--> Starting
//!  ^                                                         |
//!  +------------------ worker finished <-- Reasoning <-------+
//! ```
//!
//! The [`WorkerPool`] loads one worker per thread, starts them all, and
//! blocks until every thread has reported completion on the shared channel.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::{ReasonerResult, TaskError, WorkerFailure};

use super::task::{CancellationToken, ReasoningTask, ReasoningTaskWorker};

/// Stack size of engine threads; backward checking recurses deeply.
pub const WORKER_STACK_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Loaded = 1,
    Starting = 2,
    Reasoning = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Loaded,
            2 => WorkerState::Starting,
            3 => WorkerState::Reasoning,
            _ => WorkerState::Idle,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Loaded => "reasoning task loaded",
            WorkerState::Starting => "reasoning starting",
            WorkerState::Reasoning => "reasoning",
        }
    }
}

enum Command {
    Start(CancellationToken),
    Terminate,
}

struct Completion {
    worker_index: usize,
    result: Result<(), WorkerFailure>,
}

type WorkerSlot = Arc<Mutex<Option<Box<dyn ReasoningTaskWorker>>>>;

// ---------------------------------------------------------------------------
// EngineWorkerThread
// ---------------------------------------------------------------------------

/// One long-lived reasoning thread.
pub struct EngineWorkerThread {
    index: usize,
    state: Arc<AtomicU8>,
    slot: WorkerSlot,
    commands: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl EngineWorkerThread {
    fn spawn(index: usize, completions: Sender<Completion>) -> Result<Self, TaskError> {
        let state = Arc::new(AtomicU8::new(WorkerState::Idle as u8));
        let slot: WorkerSlot = Arc::new(Mutex::new(None));
        let (commands, inbox) = unbounded();

        let thread_state = Arc::clone(&state);
        let thread_slot = Arc::clone(&slot);
        let handle = std::thread::Builder::new()
            .name(format!("incremat-worker-{index}"))
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || thread_main(index, thread_state, thread_slot, inbox, completions))
            .map_err(|source| TaskError::ThreadSpawn {
                worker_index: index,
                source,
            })?;

        Ok(Self {
            index,
            state,
            slot,
            commands,
            handle: Some(handle),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> Result<(), TaskError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| TaskError::InvalidWorkerState {
                worker_index: self.index,
                expected: from.name(),
                actual: WorkerState::from_u8(actual).name(),
            })
    }

    /// Hand `worker` to the thread. Requires [`WorkerState::Idle`].
    pub fn initialize_worker(&self, worker: Box<dyn ReasoningTaskWorker>) -> Result<(), TaskError> {
        self.transition(WorkerState::Idle, WorkerState::Loaded)?;
        *self.slot.lock().expect("worker slot lock poisoned") = Some(worker);
        Ok(())
    }

    /// Drop a loaded worker that will not be started.
    fn unload(&self) {
        if self.transition(WorkerState::Loaded, WorkerState::Idle).is_ok() {
            self.slot.lock().expect("worker slot lock poisoned").take();
        }
    }

    /// Run the loaded worker. Requires [`WorkerState::Loaded`].
    pub fn start_reasoning(&self, token: &CancellationToken) -> Result<(), TaskError> {
        self.transition(WorkerState::Loaded, WorkerState::Starting)?;
        self.commands
            .send(Command::Start(token.clone()))
            .map_err(|_| TaskError::Disconnected {
                worker_index: self.index,
            })
    }

    fn terminate(&self) {
        let _ = self.commands.send(Command::Terminate);
    }
}

impl Drop for EngineWorkerThread {
    fn drop(&mut self) {
        self.terminate();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn thread_main(
    index: usize,
    state: Arc<AtomicU8>,
    slot: WorkerSlot,
    inbox: Receiver<Command>,
    completions: Sender<Completion>,
) {
    while let Ok(command) = inbox.recv() {
        let token = match command {
            Command::Terminate => break,
            Command::Start(token) => token,
        };
        state.store(WorkerState::Reasoning as u8, Ordering::SeqCst);
        let worker = slot.lock().expect("worker slot lock poisoned").take();
        let result = match worker {
            Some(mut worker) => run_worker(index, worker.as_mut()),
            None => Ok(()),
        };
        if result.is_err() {
            // Siblings poll the token and stop early.
            token.cancel();
        }
        state.store(WorkerState::Idle as u8, Ordering::SeqCst);
        if completions
            .send(Completion {
                worker_index: index,
                result,
            })
            .is_err()
        {
            break;
        }
    }
    tracing::trace!(worker = index, "engine worker thread exiting");
}

fn run_worker(index: usize, worker: &mut dyn ReasoningTaskWorker) -> Result<(), WorkerFailure> {
    match catch_unwind(AssertUnwindSafe(|| worker.run())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(WorkerFailure {
            worker_index: index,
            message: error.to_string(),
            source: Some(Box::new(error)),
        }),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "worker panicked".to_string());
            tracing::error!(worker = index, %message, "reasoning worker panicked");
            Err(WorkerFailure {
                worker_index: index,
                message: format!("panicked: {message}"),
                source: None,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// Fixed set of engine threads executing one task at a time.
pub struct WorkerPool {
    threads: Vec<EngineWorkerThread>,
    completions: Receiver<Completion>,
    running: Mutex<bool>,
    current: Mutex<Option<CancellationToken>>,
}

struct RunningGuard<'a>(&'a Mutex<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.0.lock() {
            *running = false;
        }
    }
}

impl WorkerPool {
    /// Spawn `threads` engine threads (at least one).
    pub fn new(threads: usize) -> Result<Self, TaskError> {
        let (sender, completions) = unbounded();
        let threads = (0..threads.max(1))
            .map(|i| EngineWorkerThread::spawn(i, sender.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(threads = threads.len(), "worker pool started");
        Ok(Self {
            threads,
            completions,
            running: Mutex::new(false),
            current: Mutex::new(None),
        })
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn thread_states(&self) -> Vec<WorkerState> {
        self.threads.iter().map(EngineWorkerThread::state).collect()
    }

    /// Run `task` on every thread and wait for all of them.
    ///
    /// Returns `Ok(false)` without doing anything when another task is
    /// running.
    pub fn execute(&self, task: &dyn ReasoningTask) -> ReasonerResult<bool> {
        self.dispatch(task, self.threads.len())
    }

    /// Run `task` on the first thread only.
    pub fn execute_serially(&self, task: &dyn ReasoningTask) -> ReasonerResult<bool> {
        self.dispatch(task, 1)
    }

    /// Ask the running task, if any, to stop at its next dequeue.
    pub fn stop_current_task(&self) {
        if let Some(token) = self.current.lock().expect("pool lock poisoned").as_ref() {
            token.cancel();
        }
    }

    fn dispatch(&self, task: &dyn ReasoningTask, workers: usize) -> ReasonerResult<bool> {
        {
            let mut running = self.running.lock().expect("pool lock poisoned");
            if *running {
                return Ok(false);
            }
            *running = true;
        }
        let _guard = RunningGuard(&self.running);

        task.initialize(workers)?;
        let token = CancellationToken::new();
        *self.current.lock().expect("pool lock poisoned") = Some(token.clone());
        let result = self.run_workers(task, workers, &token);
        *self.current.lock().expect("pool lock poisoned") = None;
        result.map(|()| true)
    }

    fn run_workers(
        &self,
        task: &dyn ReasoningTask,
        workers: usize,
        token: &CancellationToken,
    ) -> ReasonerResult<()> {
        let threads = &self.threads[..workers];
        for (i, thread) in threads.iter().enumerate() {
            if let Err(e) = thread.initialize_worker(task.create_worker(i, token)) {
                threads[..i].iter().for_each(EngineWorkerThread::unload);
                return Err(e.into());
            }
        }

        let mut started = 0;
        let mut start_error = None;
        for thread in threads {
            match thread.start_reasoning(token) {
                Ok(()) => started += 1,
                Err(e) => {
                    token.cancel();
                    start_error = Some(e);
                    break;
                }
            }
        }
        if start_error.is_some() {
            threads[started..].iter().for_each(EngineWorkerThread::unload);
        }

        let mut causes = Vec::new();
        for _ in 0..started {
            let completion = self
                .completions
                .recv()
                .map_err(|_| TaskError::Disconnected { worker_index: 0 })?;
            if let Err(failure) = completion.result {
                tracing::warn!(
                    task = task.name(),
                    worker = completion.worker_index,
                    error = %failure.message,
                    "reasoning worker failed"
                );
                causes.push(failure);
            }
        }

        if let Some(e) = start_error {
            return Err(e.into());
        }
        if !causes.is_empty() {
            causes.sort_by_key(|f| f.worker_index);
            return Err(TaskError::WorkersFailed {
                task: task.name().to_string(),
                causes,
            }
            .into());
        }
        if token.is_cancelled() {
            return Err(TaskError::Aborted.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::task::{PhaseBody, PhaseTask, TaskConfig, WorkerHandle};

    struct Noop;

    impl PhaseBody for Noop {
        const NAME: &'static str = "noop";

        fn run<const MON: bool, const MT: bool, const EQ: bool, const LVL: bool>(
            &self,
            _worker: &WorkerHandle,
        ) -> ReasonerResult<()> {
            Ok(())
        }
    }

    #[test]
    fn out_of_state_calls_are_rejected() {
        let pool = WorkerPool::new(1).unwrap();
        let thread = &pool.threads[0];
        let token = CancellationToken::new();
        assert!(matches!(
            thread.start_reasoning(&token),
            Err(TaskError::InvalidWorkerState { expected: "reasoning task loaded", .. })
        ));

        let task = PhaseTask::new(Noop, TaskConfig::default());
        thread.initialize_worker(task.create_worker(0, &token)).unwrap();
        assert_eq!(thread.state(), WorkerState::Loaded);
        assert!(matches!(
            thread.initialize_worker(task.create_worker(0, &token)),
            Err(TaskError::InvalidWorkerState { actual: "reasoning task loaded", .. })
        ));
        thread.unload();
        assert_eq!(thread.state(), WorkerState::Idle);
    }

    #[test]
    fn execute_returns_to_idle() {
        let pool = WorkerPool::new(3).unwrap();
        let task = PhaseTask::new(Noop, TaskConfig::default());
        assert!(pool.execute(&task).unwrap());
        assert!(pool.execute_serially(&task).unwrap());
        assert!(pool.thread_states().iter().all(|s| *s == WorkerState::Idle));
    }
}
