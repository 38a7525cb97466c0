//! Remote job submission
//!
//! A benchmark run can be pushed to a cluster node instead of running in the
//! current process. [`JobExecutor::submit`] starts the job and hands back a
//! [`Job`] whose [`Job::result`] future resolves once the job has finished.
//! Output is captured to `<folder>/<job_id>_0_log.out` and `..._log.err`.
//!
//! There are no retries and no partial results: a job either produces its
//! captured output or fails with `BenchError::RemoteJob`. A job that exits
//! non-zero reports its exit status, the error log path and the last lines of
//! that log.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use futures_intrusive::channel::shared::{oneshot_channel, OneshotReceiver, OneshotSender};
use tracing::{debug, info};

use crate::error::{BenchError, Result};

/// Default folder for captured job output
pub const DEFAULT_JOB_FOLDER: &str = "sparse_embedding_perf";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lines of a failed job's error log quoted in its failure reason
const ERR_TAIL_LINES: usize = 20;

static NEXT_JOB: AtomicU64 = AtomicU64::new(0);

/// Command to run remotely
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Executable
    pub program: PathBuf,
    /// Arguments, passed through without UTF-8 conversion
    pub args: Vec<OsString>,
}

impl JobSpec {
    /// Job running `program` with `args`
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Captured output of a finished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    /// Job identifier
    pub job_id: String,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// Handle to a submitted job
pub struct Job {
    job_id: String,
    receiver: OneshotReceiver<Result<JobOutput>>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("job_id", &self.job_id).finish()
    }
}

impl Job {
    /// Job identifier
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Resolves once the job has finished
    pub async fn result(self) -> Result<JobOutput> {
        match self.receiver.receive().await {
            Some(result) => result,
            None => Err(BenchError::RemoteJob {
                job_id: self.job_id,
                reason: "job watcher exited without a result".to_string(),
            }),
        }
    }

    /// Block the calling thread until the job has finished
    pub fn wait(self) -> Result<JobOutput> {
        pollster::block_on(self.result())
    }
}

/// Facility that runs jobs somewhere else
pub trait JobExecutor {
    /// Start `spec`; the returned job completes asynchronously
    fn submit(&self, spec: JobSpec) -> Result<Job>;
}

/// Slurm allocation of a benchmark job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlurmParameters {
    /// Wall-clock limit in minutes
    pub timeout_min: u32,
    /// Partition
    pub partition: String,
    /// Node constraint
    pub constraint: String,
    /// GPUs per node
    pub gpus_per_node: u32,
}

impl Default for SlurmParameters {
    fn default() -> Self {
        Self {
            timeout_min: 10,
            partition: "dev".to_string(),
            constraint: "volta32gb".to_string(),
            gpus_per_node: 1,
        }
    }
}

impl SlurmParameters {
    /// `srun` prefix requesting this allocation for a single task
    #[must_use]
    pub fn launcher(&self) -> Vec<String> {
        vec![
            "srun".to_string(),
            "--nodes=1".to_string(),
            "--ntasks=1".to_string(),
            format!("--partition={}", self.partition),
            format!("--constraint={}", self.constraint),
            format!("--gpus-per-node={}", self.gpus_per_node),
            format!("--time={}", self.timeout_min),
        ]
    }

    /// Wall-clock limit
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_min) * 60)
    }
}

/// Runs jobs as child processes, optionally behind a launcher such as `srun`
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    folder: PathBuf,
    launcher: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandExecutor {
    /// Run jobs directly on this machine
    pub fn local(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            launcher: Vec::new(),
            timeout: None,
        }
    }

    /// Run jobs through `srun` with the given allocation
    pub fn slurm(folder: impl Into<PathBuf>, params: &SlurmParameters) -> Self {
        Self {
            folder: folder.into(),
            launcher: params.launcher(),
            timeout: Some(params.timeout()),
        }
    }

    /// Kill jobs running longer than `timeout`
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Folder receiving captured output
    #[must_use]
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Launcher prefix, empty for local jobs
    #[must_use]
    pub fn launcher(&self) -> &[String] {
        &self.launcher
    }

    fn command(&self, spec: &JobSpec) -> Command {
        match self.launcher.split_first() {
            Some((launcher, launcher_args)) => {
                let mut command = Command::new(launcher);
                command.args(launcher_args).arg(&spec.program).args(&spec.args);
                command
            }
            None => {
                let mut command = Command::new(&spec.program);
                command.args(&spec.args);
                command
            }
        }
    }
}

impl JobExecutor for CommandExecutor {
    fn submit(&self, spec: JobSpec) -> Result<Job> {
        let job_id = format!(
            "{}_{}",
            std::process::id(),
            NEXT_JOB.fetch_add(1, Ordering::Relaxed)
        );
        let fail = |reason: String| BenchError::RemoteJob {
            job_id: job_id.clone(),
            reason,
        };

        fs::create_dir_all(&self.folder)
            .map_err(|e| fail(format!("cannot create {}: {e}", self.folder.display())))?;
        let logs = LogPaths::new(&self.folder, &job_id);
        let stdout = File::create(&logs.stdout)
            .map_err(|e| fail(format!("cannot create {}: {e}", logs.stdout.display())))?;
        let stderr = File::create(&logs.stderr)
            .map_err(|e| fail(format!("cannot create {}: {e}", logs.stderr.display())))?;

        let child = self
            .command(&spec)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| fail(format!("cannot launch {}: {e}", spec.program.display())))?;
        info!("Submitted job {job_id}, logs in {}", self.folder.display());

        let (sender, receiver) = oneshot_channel();
        let watcher = Watcher {
            job_id: job_id.clone(),
            child,
            logs,
            timeout: self.timeout,
        };
        thread::Builder::new()
            .name(format!("job-{job_id}"))
            .spawn(move || watcher.run(sender))
            .map_err(|e| fail(format!("cannot start job watcher: {e}")))?;

        Ok(Job { job_id, receiver })
    }
}

struct LogPaths {
    stdout: PathBuf,
    stderr: PathBuf,
}

impl LogPaths {
    fn new(folder: &Path, job_id: &str) -> Self {
        Self {
            stdout: folder.join(format!("{job_id}_0_log.out")),
            stderr: folder.join(format!("{job_id}_0_log.err")),
        }
    }
}

struct Watcher {
    job_id: String,
    child: Child,
    logs: LogPaths,
    timeout: Option<Duration>,
}

impl Watcher {
    fn run(mut self, sender: OneshotSender<Result<JobOutput>>) {
        let result = self.wait().and_then(|status| self.collect(status));
        // The receiver may have been dropped; nothing left to report to
        let _ = sender.send(result);
    }

    fn wait(&mut self) -> Result<ExitStatus> {
        let started = Instant::now();
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) => return Err(self.failure(format!("cannot poll job: {e}"))),
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    return Err(self.failure(format!("timed out after {timeout:?}")));
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn collect(&self, status: ExitStatus) -> Result<JobOutput> {
        debug!("job {} exited with {status}", self.job_id);
        if !status.success() {
            return Err(self.failure(self.exit_reason(status)));
        }
        let read = |path: &Path| {
            fs::read_to_string(path)
                .map_err(|e| self.failure(format!("cannot read {}: {e}", path.display())))
        };
        Ok(JobOutput {
            job_id: self.job_id.clone(),
            stdout: read(&self.logs.stdout)?,
            stderr: read(&self.logs.stderr)?,
        })
    }

    /// Exit status, error log path and the tail of the error log
    fn exit_reason(&self, status: ExitStatus) -> String {
        let path = self.logs.stderr.display();
        match fs::read_to_string(&self.logs.stderr) {
            Ok(log) => {
                let lines: Vec<&str> = log.lines().collect();
                let tail = lines[lines.len().saturating_sub(ERR_TAIL_LINES)..].join("\n");
                if tail.trim().is_empty() {
                    format!("{status} (empty error log {path})")
                } else {
                    format!("{status} (error log {path}):\n{tail}")
                }
            }
            Err(e) => format!("{status} (cannot read error log {path}: {e})"),
        }
    }

    fn failure(&self, reason: String) -> BenchError {
        BenchError::RemoteJob {
            job_id: self.job_id.clone(),
            reason,
        }
    }
}
