//! Child process supervision
//!
//! [`ProcessSupervisor`] owns exactly one child process: it spawns it with
//! all three standard streams piped, runs a background read loop per output
//! stream, and tears the child down with a graceful signal followed by a
//! forceful one when the child does not comply in time.

use super::writer::StdinWriter;
use crate::error::{ChannelError, Result};
use crate::exit_hook::{self, HookId};
use crate::traits::LineHandler;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, TryLockError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error};

/// Interval used while waiting for a killed process to be reaped
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long [`ProcessSupervisor::close`] waits for the child to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminationPolicy {
    /// Delay between exit checks after the graceful signal
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,

    /// Number of exit checks before escalating to a forceful kill
    pub poll_attempts: u32,

    /// Upper bound on waiting for the process to be reaped after the kill
    #[serde(rename = "kill_wait_ms", with = "duration_ms")]
    pub kill_wait: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            poll_attempts: 10,
            kill_wait: Duration::from_secs(2),
        }
    }
}

impl TerminationPolicy {
    /// Total time granted to the child between the graceful signal and the kill
    pub fn grace_period(&self) -> Duration {
        self.poll_interval * self.poll_attempts
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration for spawning a supervised process
#[derive(Clone)]
pub struct ProcessConfig {
    /// Path to the executable
    pub program: String,

    /// Arguments to pass to the executable
    pub args: Vec<String>,

    /// Environment variables to set on top of the inherited environment
    pub env: HashMap<String, String>,

    /// Start from an empty environment instead of inheriting the host's
    pub env_clear: bool,

    /// Working directory for the child
    pub current_dir: Option<PathBuf>,

    /// Shutdown timing
    pub termination: TerminationPolicy,

    /// Receives each stdout line
    pub stdout_handler: Option<Arc<dyn LineHandler>>,

    /// Receives each stderr line
    pub stderr_handler: Option<Arc<dyn LineHandler>>,
}

impl ProcessConfig {
    /// Create a new process configuration
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            env_clear: false,
            current_dir: None,
            termination: TerminationPolicy::default(),
            stdout_handler: None,
            stderr_handler: None,
        }
    }

    /// Add an argument
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add several arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Do not inherit the host's environment.
    ///
    /// Only variables set through [`ProcessConfig::with_env`] reach the child.
    pub fn with_env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    /// Set the working directory
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Set the shutdown timing
    pub fn with_termination(mut self, termination: TerminationPolicy) -> Self {
        self.termination = termination;
        self
    }

    /// Set the stdout line handler
    pub fn with_stdout_handler(mut self, handler: impl LineHandler + 'static) -> Self {
        self.stdout_handler = Some(Arc::new(handler));
        self
    }

    /// Set the stderr line handler
    pub fn with_stderr_handler(mut self, handler: impl LineHandler + 'static) -> Self {
        self.stderr_handler = Some(Arc::new(handler));
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if self.env_clear {
            cmd.env_clear();
        }
        cmd.envs(&self.env);

        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl std::fmt::Debug for ProcessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessConfig")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("env_clear", &self.env_clear)
            .field("current_dir", &self.current_dir)
            .field("termination", &self.termination)
            .field("stdout_handler", &self.stdout_handler.is_some())
            .field("stderr_handler", &self.stderr_handler.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum TermSignal {
    Terminate,
    Kill,
}

impl TermSignal {
    fn name(self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }
}

/// Deliver `signal`, treating "no such process" as success.
#[cfg(unix)]
fn send_signal(_child: &mut Child, pid: u32, signal: TermSignal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        TermSignal::Terminate => Signal::SIGTERM,
        TermSignal::Kill => Signal::SIGKILL,
    };

    match signal::kill(Pid::from_raw(pid as i32), nix_signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!(pid, signal = signal.name(), "Process already gone");
            Ok(())
        }
        Err(errno) => Err(ChannelError::Signal {
            signal: signal.name(),
            pid,
            source: errno.into(),
        }),
    }
}

/// Without POSIX signals both steps are a hard kill.
#[cfg(not(unix))]
fn send_signal(child: &mut Child, pid: u32, signal: TermSignal) -> Result<()> {
    match child.start_kill() {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(source) => Err(ChannelError::Signal {
            signal: signal.name(),
            pid,
            source,
        }),
    }
}

/// Pid 0 would address the host's own process group
fn require_pid(pid: Option<u32>) -> Result<u32> {
    pid.filter(|pid| *pid != 0).ok_or(ChannelError::NotStarted)
}

type ReaderHandle = (&'static str, JoinHandle<Result<()>>);

struct Inner {
    config: ProcessConfig,
    started: AtomicBool,
    child: Mutex<Option<Child>>,
    pid: OnceLock<u32>,
    exit_status: OnceLock<ExitStatus>,
    stdin: StdinWriter,
    gone: watch::Sender<bool>,
    readers: Mutex<Vec<ReaderHandle>>,
    exit_hook: Mutex<Option<HookId>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn poll_exit(&self, child: &mut Child) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status.get() {
            return Ok(Some(*status));
        }

        let status = child.try_wait()?;
        if let Some(status) = status {
            debug!(pid = self.pid.get(), %status, "Process exited");
            let _ = self.exit_status.set(status);
        }
        Ok(status)
    }

    fn mark_gone(&self) {
        self.gone.send_replace(true);
    }

    fn close(&self) -> Result<()> {
        let mut guard = lock(&self.child);
        let Some(child) = guard.as_mut() else {
            return Ok(());
        };

        if self.poll_exit(child)?.is_some() {
            self.mark_gone();
            return Ok(());
        }

        let pid = require_pid(self.pid.get().copied())?;
        let policy = self.config.termination;

        debug!(pid, "Terminate process");
        send_signal(child, pid, TermSignal::Terminate)?;

        for _ in 0..policy.poll_attempts {
            if self.poll_exit(child)?.is_some() {
                self.mark_gone();
                return Ok(());
            }
            std::thread::sleep(policy.poll_interval);
        }

        debug!(pid, "Failed to terminate. Killing.");
        send_signal(child, pid, TermSignal::Kill)?;

        let deadline = Instant::now() + policy.kill_wait;
        loop {
            if self.poll_exit(child)?.is_some() {
                self.mark_gone();
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ChannelError::StillRunning { pid });
            }
            std::thread::sleep(KILL_POLL_INTERVAL);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(id) = lock(&self.exit_hook).take() {
            exit_hook::unregister(id);
        }
        self.gone.send_replace(true);
    }
}

/// Owns and supervises one child process and its raw I/O.
///
/// # Example
///
/// ```no_run
/// use childrpc_transport::subprocess::{ProcessConfig, ProcessSupervisor};
///
/// # async fn example() -> childrpc_transport::Result<()> {
/// let supervisor = ProcessSupervisor::new(ProcessConfig::new("helper").with_arg("--serve"));
/// supervisor.start(true).await?;
/// // ...
/// supervisor.close()?;
/// # Ok(())
/// # }
/// ```
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    /// Create a supervisor; nothing is spawned until [`start`](Self::start)
    pub fn new(config: ProcessConfig) -> Self {
        Self::with_stdin(config, StdinWriter::detached())
    }

    /// Create a supervisor that binds the child's stdin to `stdin` on start.
    ///
    /// Lets a line handler hold a writer to the child before the child exists.
    pub fn with_stdin(config: ProcessConfig, stdin: StdinWriter) -> Self {
        let (gone, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                started: AtomicBool::new(false),
                child: Mutex::new(None),
                pid: OnceLock::new(),
                exit_status: OnceLock::new(),
                stdin,
                gone,
                readers: Mutex::new(Vec::new()),
                exit_hook: Mutex::new(None),
            }),
        }
    }

    /// Spawn the child and start the stdout/stderr read loops.
    ///
    /// With `auto_terminate_at_exit` the supervisor registers its
    /// [`close`](Self::close) as an [exit hook](crate::exit_hook).
    ///
    /// # Panics
    ///
    /// Panics if the supervisor was already started.
    pub async fn start(&self, auto_terminate_at_exit: bool) -> Result<()> {
        let inner = &self.inner;
        let already_started = inner.started.swap(true, Ordering::SeqCst);
        assert!(!already_started, "ProcessSupervisor already started");

        debug!(program = %inner.config.program, args = ?inner.config.args, "Starting process");

        let mut child = inner.config.command().spawn().map_err(|source| {
            inner.started.store(false, Ordering::SeqCst);
            ChannelError::Spawn {
                program: inner.config.program.clone(),
                source,
            }
        })?;

        let stdin = child.stdin.take().ok_or(ChannelError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ChannelError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ChannelError::MissingPipe("stderr"))?;

        let pid = require_pid(child.id()).inspect_err(|_| {
            inner.started.store(false, Ordering::SeqCst);
        })?;
        let _ = inner.pid.set(pid);
        *lock(&inner.child) = Some(child);
        inner.stdin.attach(stdin).await;

        debug!(pid, "Process started");

        let stderr_reader = tokio::spawn(
            read_loop(
                "stderr",
                stderr,
                inner.config.stderr_handler.clone(),
                inner.gone.subscribe(),
            )
            .instrument(tracing::debug_span!("read_loop", stream = "stderr", pid)),
        );
        let stdout_reader = tokio::spawn(
            read_loop(
                "stdout",
                stdout,
                inner.config.stdout_handler.clone(),
                inner.gone.subscribe(),
            )
            .instrument(tracing::debug_span!("read_loop", stream = "stdout", pid)),
        );
        lock(&inner.readers).extend([("stderr", stderr_reader), ("stdout", stdout_reader)]);

        if auto_terminate_at_exit {
            let weak = Arc::downgrade(inner);
            let id = exit_hook::register(move || {
                if let Some(inner) = weak.upgrade()
                    && let Err(err) = inner.close()
                {
                    error!(error = %err, "Failed to close process at exit");
                }
            });
            *lock(&inner.exit_hook) = Some(id);
        }

        Ok(())
    }

    /// Terminate the child, escalating to a kill if it does not exit in time.
    ///
    /// Blocks the calling thread for up to the policy's grace period plus the
    /// kill wait. A no-op if the process was never started or has already
    /// exited.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Signal`] if a signal cannot be delivered for
    /// any reason other than the process being gone, and
    /// [`ChannelError::StillRunning`] if the process outlives the kill wait.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Close without blocking the async runtime, then wait for both read loops.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.close())
            .await
            .map_err(|source| ChannelError::ReaderTask {
                name: "close",
                source,
            })??;
        self.join_readers().await
    }

    /// Wait for the read loops to finish.
    ///
    /// Returns the first failure among them (stderr loop first). Each loop
    /// is awaited at most once; later calls return `Ok(())`.
    pub async fn join_readers(&self) -> Result<()> {
        let handles = std::mem::take(&mut *lock(&self.inner.readers));
        let mut first_error = None;

        for (name, handle) in handles {
            let outcome = handle
                .await
                .unwrap_or_else(|source| Err(ChannelError::ReaderTask { name, source }));

            if let Err(err) = outcome {
                match first_error {
                    None => first_error = Some(err),
                    Some(_) => debug!(task = name, error = %err, "Additional read loop failure"),
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Whether [`start`](Self::start) has succeeded
    pub fn is_started(&self) -> bool {
        self.inner.pid.get().is_some()
    }

    /// Process id of the child, once started
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid.get().copied()
    }

    /// Non-blocking check whether the child has exited.
    ///
    /// Returns `false` while [`close`](Self::close) is still waiting for the
    /// child to go away.
    pub fn has_exited(&self) -> bool {
        if self.inner.exit_status.get().is_some() {
            return true;
        }

        let mut guard = match self.inner.child.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        match guard.as_mut() {
            Some(child) => matches!(self.inner.poll_exit(child), Ok(Some(_))),
            None => false,
        }
    }

    /// Exit status, once the child is known to have exited
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.exit_status.get().copied()
    }

    /// Handle to the child's stdin
    pub fn stdin(&self) -> &StdinWriter {
        &self.inner.stdin
    }

    /// Get the process configuration
    pub fn config(&self) -> &ProcessConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("program", &self.inner.config.program)
            .field("pid", &self.pid())
            .field("exit_status", &self.exit_status())
            .finish()
    }
}

/// Feed each line of `stream` to `handler` until end-of-stream or until the
/// supervisor reports the process gone.
async fn read_loop<R>(
    name: &'static str,
    stream: R,
    handler: Option<Arc<dyn LineHandler>>,
    mut gone: watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    while !*gone.borrow() {
        line.clear();

        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => read,
            _ = gone.wait_for(|gone| *gone) => break,
        };

        let read = read.inspect_err(|err| error!(error = %err, "Unhandled read {} error", name))?;
        if read == 0 {
            break;
        }

        debug!(line = ?String::from_utf8_lossy(&line), "Read {} line", name);

        if let Some(handler) = &handler
            && let Err(err) = handler.handle_line(&line).await
        {
            error!(error = %err, "Unhandled read {} exception", name);
            return Err(err);
        }
    }

    debug!("{} read loop finished", name);
    Ok(())
}
