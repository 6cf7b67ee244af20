//! Build progress reporting.
//!
//! The engine forwards scheduler progress to a process-wide [`Reporter`].
//! Library consumers that want their own presentation install one with
//! [`set_default`] before the first build; nothing is printed otherwise.

use crate::scheduler::{ExecutionStats, Progress};
use once_cell::sync::OnceCell;
use yansi::Paint;

/// Observer of build lifecycle events. All hooks default to no-ops.
pub trait Reporter: Send + Sync + 'static {
    /// A build was kicked off with the given number of graph nodes.
    fn on_build_started(&self, _total_nodes: usize) {}

    /// Scheduler progress; fires on every dispatch and every consumed result.
    fn on_progress(&self, _progress: &Progress) {}

    /// A node failed; `stderr` is the captured compiler output, possibly
    /// empty.
    fn on_task_failed(&self, _name: &str, _error: &str, _stderr: &[u8]) {}

    /// The build finished, successfully or not.
    fn on_build_finished(&self, _stats: &ExecutionStats, _success: bool) {}
}

/// Reporter that swallows everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {}

/// Reporter printing one line per scheduled task, in the style of `make`-era
/// build drivers.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicStdoutReporter;

impl Reporter for BasicStdoutReporter {
    fn on_build_started(&self, total_nodes: usize) {
        println!("{} {total_nodes} task(s)", Paint::green("Building").bold());
    }

    fn on_progress(&self, progress: &Progress) {
        if let Some(current) = &progress.current {
            let done = progress.completed + progress.skipped;
            println!("[{done}/{}] {current}", progress.total);
        }
    }

    fn on_task_failed(&self, name: &str, error: &str, stderr: &[u8]) {
        eprintln!("{} {name}: {error}", Paint::red("error").bold());
        if !stderr.is_empty() {
            eprintln!("{}", String::from_utf8_lossy(stderr).trim_end());
        }
    }

    fn on_build_finished(&self, stats: &ExecutionStats, success: bool) {
        if success {
            println!(
                "{} {} compiled, {} from cache in {:.2?}",
                Paint::green("Finished").bold(),
                stats.completed_tasks,
                stats.skipped_tasks,
                stats.total_execution_time
            );
        } else {
            eprintln!(
                "{} {} task(s) failed",
                Paint::red("Build failed:").bold(),
                stats.failed_tasks
            );
        }
    }
}

static NOOP: NoopReporter = NoopReporter;
static DEFAULT_REPORTER: OnceCell<Box<dyn Reporter>> = OnceCell::new();

/// Installs the process-wide reporter. Only the first call wins; returns
/// whether this call installed its reporter.
pub fn set_default(reporter: impl Reporter) -> bool {
    DEFAULT_REPORTER.set(Box::new(reporter)).is_ok()
}

/// The installed reporter, or a no-op if none was set.
pub fn get_default() -> &'static dyn Reporter {
    DEFAULT_REPORTER.get().map(|r| &**r).unwrap_or(&NOOP)
}
