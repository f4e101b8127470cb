//! Off-loop work: blocking closures and child processes.
//!
//! Commands that would stall the session hand a [`Job`] to the driver,
//! which runs it here under a timeout and feeds the [`JobResult`] back
//! into the session as a deferred reply. A job that outlives its timeout
//! reports [`CommandError::ProcessTimeout`]; child processes are killed.

use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::dispatch::CommandError;
use crate::dispatch::reply::ReplyTo;

pub type JobFn = Box<dyn FnOnce() -> Result<String, CommandError> + Send>;

pub enum JobKind {
    Blocking(JobFn),
    /// Program and arguments; stdout becomes the reply.
    Process { program: String, args: Vec<String> },
}

pub struct Job {
    pub id: u64,
    pub reply_to: ReplyTo,
    pub kind: JobKind,
    pub timeout: Duration,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            JobKind::Blocking(_) => "blocking".to_string(),
            JobKind::Process { program, .. } => format!("process {program}"),
        };
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &kind)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Job {
    pub fn blocking(
        reply_to: ReplyTo,
        timeout: Duration,
        f: impl FnOnce() -> Result<String, CommandError> + Send + 'static,
    ) -> Self {
        Self { id: 0, reply_to, kind: JobKind::Blocking(Box::new(f)), timeout }
    }

    pub fn process(reply_to: ReplyTo, timeout: Duration, program: &str, args: &[&str]) -> Self {
        Self {
            id: 0,
            reply_to,
            kind: JobKind::Process {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            },
            timeout,
        }
    }
}

#[derive(Debug)]
pub struct JobResult {
    pub id: u64,
    pub reply_to: ReplyTo,
    pub outcome: Result<String, CommandError>,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self { permits: Arc::new(Semaphore::new(size.max(1))) }
    }

    /// Run a blocking closure on the blocking pool.
    pub async fn run<T, F>(&self, timeout: Duration, f: F) -> Result<T, CommandError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CommandError::Failed("worker pool is shut down".into()))?;
        let handle = tokio::task::spawn_blocking(f);
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Worker task panicked");
                Err(CommandError::Panicked)
            }
            // The blocking thread cannot be cancelled; its result is dropped.
            Err(_) => Err(CommandError::ProcessTimeout),
        }
    }

    /// Run a child process to completion, killing it on timeout.
    pub async fn run_process(&self, cmd: &mut Command, timeout: Duration) -> Result<Output, CommandError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CommandError::Failed("worker pool is shut down".into()))?;
        cmd.kill_on_drop(true);
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CommandError::Failed(format!("could not run process: {e}"))),
            Err(_) => Err(CommandError::ProcessTimeout),
        }
    }

    pub async fn execute(&self, job: Job) -> JobResult {
        let Job { id, reply_to, kind, timeout } = job;
        let outcome = match kind {
            JobKind::Blocking(f) => self.run(timeout, f).await.and_then(|r| r),
            JobKind::Process { program, args } => {
                let mut cmd = Command::new(&program);
                cmd.args(&args);
                self.run_process(&mut cmd, timeout).await.map(|out| process_text(&out))
            }
        };
        if let Err(e) = &outcome {
            tracing::debug!(job = id, error = %e, "Job failed");
        }
        JobResult { id, reply_to, outcome }
    }
}

fn process_text(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut text = stdout.trim_end().to_string();
    if text.is_empty() {
        text = stderr.trim_end().to_string();
    }
    if !output.status.success() {
        text.push_str(&format!(" [exit code: {}]", output.status.code().unwrap_or(-1)));
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_to() -> ReplyTo {
        ReplyTo::new("alice", "alice!a@h", Some("#perch"))
    }

    #[tokio::test]
    async fn blocking_jobs_return_their_value() {
        let pool = WorkerPool::new(2);
        let v = pool.run(Duration::from_secs(5), || 6 * 7).await.unwrap();
        assert_eq!(v, 42);
    }

    #[tokio::test]
    async fn slow_jobs_time_out() {
        let pool = WorkerPool::new(1);
        let job = Job::blocking(reply_to(), Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok("late".into())
        });
        let result = pool.execute(job).await;
        assert!(matches!(result.outcome, Err(CommandError::ProcessTimeout)));
        assert_eq!(result.reply_to.nick, "alice");
    }

    #[tokio::test]
    async fn child_processes_report_stdout_or_time_out() {
        let pool = WorkerPool::default();
        let ok = pool
            .execute(Job::process(reply_to(), Duration::from_secs(5), "echo", &["hello"]))
            .await;
        assert_eq!(ok.outcome.unwrap(), "hello");
        let slow = pool
            .execute(Job::process(reply_to(), Duration::from_millis(100), "sleep", &["5"]))
            .await;
        assert!(matches!(slow.outcome, Err(CommandError::ProcessTimeout)));
    }
}
