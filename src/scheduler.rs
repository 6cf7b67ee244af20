//! Parallel execution of the build graph.
//!
//! The scheduler owns a pool of worker threads fed through a mutex+condvar
//! task queue; results come back over a channel that the coordinator (the
//! caller's thread) drains on every tick. Nodes are dispatched strictly after
//! all of their dependencies completed or were skipped; among ready nodes the
//! dispatch order is unspecified.
//!
//! Workers never touch graph state. All transitions happen on the
//! coordinator, which keeps the locking discipline trivial: the queue mutex
//! for queue operations, the channel for results, nothing nested.

use crate::{
    error::{Error, Result},
    graph::{BuildGraph, BuildNode, NodeId, NodeKind, NodeState},
    utils,
};
use std::{
    collections::VecDeque,
    path::PathBuf,
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

/// How long the coordinator naps when neither results nor ready work showed
/// up in a tick.
const IDLE_TICK: Duration = Duration::from_millis(1);

/// What a worker should do for one node.
#[derive(Clone, Debug)]
pub enum TaskAction {
    /// Spawn the argv as a child process. An empty argv completes
    /// successfully without spawning anything.
    Spawn(Vec<String>),
    /// Copy a file; used by install nodes so they behave identically on
    /// every platform.
    Copy { from: PathBuf, to: PathBuf },
}

/// A unit of work handed to the worker pool.
#[derive(Clone, Debug)]
pub struct Task {
    pub node_id: NodeId,
    pub action: TaskAction,
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the child process.
    pub env: Vec<(String, String)>,
}

impl Task {
    /// Builds the task for a graph node.
    pub fn for_node(node: &BuildNode) -> Self {
        let action = match node.kind {
            NodeKind::Install => match (node.inputs.first(), node.outputs.first()) {
                (Some(from), Some(to)) => TaskAction::Copy { from: from.clone(), to: to.clone() },
                _ => TaskAction::Spawn(Vec::new()),
            },
            _ => TaskAction::Spawn(node.command.clone()),
        };
        Self { node_id: node.id, action, working_dir: node.working_dir.clone(), env: Vec::new() }
    }
}

/// Outcome of one executed task.
#[derive(Debug)]
pub struct TaskResult {
    pub node_id: NodeId,
    pub success: bool,
    pub error: Option<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl TaskResult {
    fn no_op(node_id: NodeId, elapsed: Duration) -> Self {
        Self {
            node_id,
            success: true,
            error: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: Some(0),
            elapsed,
        }
    }

    fn failed(node_id: NodeId, error: String, elapsed: Duration) -> Self {
        Self {
            node_id,
            success: false,
            error: Some(error),
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            elapsed,
        }
    }
}

/// Snapshot reported through the progress callback after every state change.
#[derive(Clone, Debug)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub running: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Name of the node that triggered this report, when dispatching.
    pub current: Option<String>,
    pub elapsed: Duration,
}

/// Aggregated counters returned by every executor variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub skipped_tasks: usize,
    /// Sum of per-task execution times (not wall clock).
    pub total_execution_time: Duration,
}

/// Cooperative cancellation flag shared with the coordinator.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation: no further tasks are dispatched, in-flight
    /// processes finish and deliver their results.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct QueueState {
    tasks: VecDeque<Task>,
    shutdown: bool,
}

/// FIFO hand-off between the coordinator and the workers.
///
/// `pop` blocks on the condvar while the queue is empty; `shutdown` drops any
/// queued tasks and wakes every blocked worker, which then sees the
/// end-of-stream `None`.
struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl TaskQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState { tasks: VecDeque::new(), shutdown: false }),
            available: Condvar::new(),
        }
    }

    fn push(&self, task: Task) {
        let mut state = self.state.lock().expect("task queue poisoned");
        if state.shutdown {
            return;
        }
        state.tasks.push_back(task);
        self.available.notify_one();
    }

    fn pop(&self) -> Option<Task> {
        let mut state = self.state.lock().expect("task queue poisoned");
        loop {
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            if state.shutdown {
                return None;
            }
            state = self.available.wait(state).expect("task queue poisoned");
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().expect("task queue poisoned");
        state.shutdown = true;
        state.tasks.clear();
        self.available.notify_all();
    }
}

type ProgressFn = dyn Fn(&Progress) + Send + Sync;

/// Drains the build graph's ready set on a pool of worker threads.
pub struct TaskScheduler {
    max_jobs: usize,
    stop_on_failure: bool,
    cancel: CancellationToken,
    progress: Option<Box<ProgressFn>>,
}

impl TaskScheduler {
    /// `max_jobs == 0` uses the detected CPU count.
    pub fn new(max_jobs: usize, stop_on_failure: bool) -> Self {
        let max_jobs = if max_jobs == 0 { num_cpus::get() } else { max_jobs };
        Self { max_jobs, stop_on_failure, cancel: CancellationToken::new(), progress: None }
    }

    /// Installs a progress callback invoked after every dispatch and every
    /// consumed result.
    pub fn with_progress(mut self, f: impl Fn(&Progress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// A handle that cancels this scheduler's current and future runs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    fn report(&self, graph: &BuildGraph, current: Option<&str>, started: Instant) {
        if let Some(progress) = &self.progress {
            let counts = graph.count_by_state();
            progress(&Progress {
                total: graph.total_nodes(),
                completed: counts.completed,
                running: counts.running,
                skipped: counts.skipped,
                failed: counts.failed,
                current: current.map(str::to_string),
                elapsed: started.elapsed(),
            });
        }
    }

    /// Executes the graph on the worker pool and blocks until every node
    /// reached a terminal state or the run was stopped.
    ///
    /// Failed nodes keep their dependents in `Pending`; with `stop_on_failure`
    /// the first failure additionally stops all further dispatch.
    pub fn execute(&self, graph: &mut BuildGraph) -> Result<ExecutionStats> {
        let started = Instant::now();
        let total = graph.total_nodes();
        let queue = Arc::new(TaskQueue::new());
        let (tx, rx) = mpsc::channel::<TaskResult>();

        let mut workers = Vec::with_capacity(self.max_jobs);
        for i in 0..self.max_jobs {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("ccforge-worker-{i}"))
                .spawn(move || {
                    while let Some(task) = queue.pop() {
                        let result = run_task(&task);
                        if tx.send(result).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|err| Error::msg(format!("failed to spawn worker thread: {err}")))?;
            workers.push(handle);
        }
        // workers hold their own senders
        drop(tx);

        let mut total_execution_time = Duration::ZERO;
        let mut ready = Vec::new();
        let mut in_flight = 0usize;
        let mut stop = false;

        loop {
            let mut progressed = false;

            while let Ok(result) = rx.try_recv() {
                progressed = true;
                in_flight -= 1;
                total_execution_time += result.elapsed;
                self.apply_result(graph, &result)?;
                if !result.success && self.stop_on_failure {
                    stop = true;
                }
                self.report(graph, None, started);
            }

            if stop || self.cancel.is_cancelled() {
                break;
            }

            graph.ready_nodes(&mut ready);
            for &id in &ready {
                graph.set_state(id, NodeState::Running)?;
                let node = graph.node(id).ok_or(Error::NodeNotFound(id))?;
                let name = node.name.clone();
                queue.push(Task::for_node(node));
                in_flight += 1;
                progressed = true;
                self.report(graph, Some(&name), started);
            }

            if graph.count_by_state().is_done() {
                break;
            }
            if !progressed {
                if in_flight == 0 {
                    // Nothing is running and nothing became ready: the
                    // remaining pending nodes sit behind failures.
                    break;
                }
                thread::sleep(IDLE_TICK);
            }
        }

        queue.shutdown();
        for worker in workers {
            let _ = worker.join();
        }
        // consume results that were in flight when the loop stopped
        while let Ok(result) = rx.try_recv() {
            total_execution_time += result.elapsed;
            self.apply_result(graph, &result)?;
        }

        let counts = graph.count_by_state();
        let stats = ExecutionStats {
            total_tasks: total,
            completed_tasks: counts.completed,
            failed_tasks: counts.failed,
            skipped_tasks: counts.skipped,
            total_execution_time,
        };
        debug!(?stats, "parallel execution finished");
        Ok(stats)
    }

    /// Runs the graph one task at a time on the caller's thread. Identical
    /// semantics to [`Self::execute`], no threads involved.
    pub fn execute_sequential(&self, graph: &mut BuildGraph) -> Result<ExecutionStats> {
        let started = Instant::now();
        let order = graph.topological_order()?;
        let total = graph.total_nodes();
        let mut total_execution_time = Duration::ZERO;

        for id in order {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(node) = graph.node(id) else { continue };
            if node.state != NodeState::Pending {
                continue;
            }
            let deps_satisfied = node.dependencies.iter().all(|dep| {
                graph.node(*dep).map(|d| d.state.satisfies_dependents()).unwrap_or(false)
            });
            if !deps_satisfied {
                // a dependency failed; leave this node pending
                continue;
            }

            let name = node.name.clone();
            let task = Task::for_node(node);
            graph.set_state(id, NodeState::Running)?;
            self.report(graph, Some(&name), started);

            let result = run_task(&task);
            total_execution_time += result.elapsed;
            let success = result.success;
            self.apply_result(graph, &result)?;
            self.report(graph, None, started);

            if !success && self.stop_on_failure {
                break;
            }
        }

        let counts = graph.count_by_state();
        Ok(ExecutionStats {
            total_tasks: total,
            completed_tasks: counts.completed,
            failed_tasks: counts.failed,
            skipped_tasks: counts.skipped,
            total_execution_time,
        })
    }

    /// Walks the topological order and marks every runnable node completed
    /// without spawning anything. Progress is reported as usual.
    pub fn execute_dry_run(&self, graph: &mut BuildGraph) -> Result<ExecutionStats> {
        let started = Instant::now();
        let order = graph.topological_order()?;
        let total = graph.total_nodes();

        for id in order {
            let Some(node) = graph.node(id) else { continue };
            if node.state != NodeState::Pending {
                continue;
            }
            let name = node.name.clone();
            graph.set_state(id, NodeState::Completed)?;
            self.report(graph, Some(&name), started);
        }

        let counts = graph.count_by_state();
        Ok(ExecutionStats {
            total_tasks: total,
            completed_tasks: counts.completed,
            failed_tasks: counts.failed,
            skipped_tasks: counts.skipped,
            total_execution_time: Duration::ZERO,
        })
    }

    fn apply_result(&self, graph: &mut BuildGraph, result: &TaskResult) -> Result<()> {
        if result.success {
            graph.set_state(result.node_id, NodeState::Completed)?;
        } else {
            let mut error = result.error.clone().unwrap_or_else(|| "task failed".to_string());
            // compiler diagnostics land on stderr; carry them on the node so
            // the engine can aggregate them into the build result
            let stderr = String::from_utf8_lossy(&result.stderr);
            let stderr = stderr.trim_end();
            if !stderr.is_empty() {
                error.push('\n');
                error.push_str(stderr);
            }
            trace!(node = result.node_id, %error, "task failed");
            graph.mark_failed(result.node_id, error)?;
        }
        if let Some(node) = graph.node_mut(result.node_id) {
            node.execution_time = result.elapsed;
        }
        Ok(())
    }
}

/// Executes one task to completion, capturing all output.
fn run_task(task: &Task) -> TaskResult {
    let started = Instant::now();
    match &task.action {
        TaskAction::Spawn(argv) if argv.is_empty() => {
            TaskResult::no_op(task.node_id, started.elapsed())
        }
        TaskAction::Spawn(argv) => {
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
            if let Some(dir) = &task.working_dir {
                cmd.current_dir(dir);
            }
            cmd.envs(task.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            debug!(?cmd, "spawning");

            match cmd.output() {
                Ok(output) => {
                    let success = output.status.success();
                    let error = (!success)
                        .then(|| format!("`{}` exited with {}", argv[0], output.status));
                    TaskResult {
                        node_id: task.node_id,
                        success,
                        error,
                        stdout: output.stdout,
                        stderr: output.stderr,
                        exit_code: output.status.code(),
                        elapsed: started.elapsed(),
                    }
                }
                Err(err) => TaskResult::failed(
                    task.node_id,
                    format!("failed to spawn `{}`: {err}", argv[0]),
                    started.elapsed(),
                ),
            }
        }
        TaskAction::Copy { from, to } => {
            let copied = utils::create_parent_dir_all(to)
                .map_err(|err| err.to_string())
                .and_then(|()| std::fs::copy(from, to).map_err(|err| err.to_string()));
            match copied {
                Ok(_) => TaskResult::no_op(task.node_id, started.elapsed()),
                Err(err) => TaskResult::failed(
                    task.node_id,
                    format!("failed to install {}: {err}", from.display()),
                    started.elapsed(),
                ),
            }
        }
    }
}
