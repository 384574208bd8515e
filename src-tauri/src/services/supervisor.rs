/// Worker Supervisor
/// Owns the single worker process: spawn, stdin writes, stdout/stderr
/// readers, exit detection and shutdown.
use crate::config::WorkerConfig;
use crate::error::{SendError, SupervisorError};
use crate::models::{
    Channel, ExitReason, ExitReport, OutboundCommand, Payload, StartedReport, WorkerStatus,
};
use crate::services::framer::{self, LineFramer};
use crate::services::outbound;
use crate::services::router::Router;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const REAP_POLL: Duration = Duration::from_millis(25);
const REAP_POLL_MAX: Duration = Duration::from_millis(500);

/// The live child process and the queue feeding its stdin.
pub struct WorkerHandle {
    executable: PathBuf,
    args: Vec<OsString>,
    pid: u32,
    child: Child,
    /// Lines for the stdin writer thread. Dropping it closes stdin once the
    /// queue drains.
    stdin: mpsc::Sender<Vec<u8>>,
    /// Tells the reader threads to stop publishing
    stopping: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

enum WorkerState {
    NotStarted,
    Running(WorkerHandle),
    Exited(ExitReport),
}

impl WorkerState {
    fn status(&self) -> WorkerStatus {
        match self {
            WorkerState::NotStarted => WorkerStatus::NotStarted,
            WorkerState::Running(handle) => WorkerStatus::Running { pid: handle.pid },
            WorkerState::Exited(report) => WorkerStatus::Exited(report.clone()),
        }
    }
}

struct Shared {
    config: WorkerConfig,
    router: Router,
    state: Mutex<WorkerState>,
}

/// `NotStarted -> Running -> Exited`, never back. A crashed worker stays
/// down until the host restarts.
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(config: WorkerConfig, router: Router) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                router,
                state: Mutex::new(WorkerState::NotStarted),
            }),
        }
    }

    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    /// Spawn the worker. A no-op unless the worker has never been started.
    /// Spawn errors are logged and leave the supervisor `Exited`.
    pub fn start(&self) -> WorkerStatus {
        let mut state = self.shared.state.lock();
        match &*state {
            WorkerState::NotStarted => {}
            WorkerState::Running(handle) => {
                log::debug!("[Worker] Already running (pid {}), skipping spawn", handle.pid);
                return state.status();
            }
            WorkerState::Exited(report) => {
                log::warn!("[Worker] Not restarting, worker already exited: {:?}", report);
                return state.status();
            }
        }

        let config = &self.shared.config;
        log::info!(
            "[Worker] Starting {} {:?}",
            config.executable.display(),
            config.args
        );

        let (handle, pipes) = match spawn_worker(config) {
            Ok(spawned) => spawned,
            Err(err) => {
                log::error!("[Worker] {}", err);
                let report = ExitReport::spawn_failed();
                *state = WorkerState::Exited(report.clone());
                drop(state);
                self.shared.announce_exit(report.clone());
                return WorkerStatus::Exited(report);
            }
        };

        let pid = handle.pid;
        let stopping = handle.stopping.clone();
        let started = StartedReport {
            pid,
            executable: handle.executable.display().to_string(),
        };
        log::info!("[Worker] Spawned with pid {}", pid);
        *state = WorkerState::Running(handle);
        let status = state.status();
        drop(state);

        // Readers start after the announcement so `worker-started` precedes
        // any output from this worker.
        self.shared
            .router
            .publish(Channel::WorkerStarted, Payload::Started(started));
        if let Err(err) = pipes.spawn_readers(&self.shared, pid, stopping) {
            log::error!("[Worker] {}", err);
            self.terminate();
            return self.status();
        }
        status
    }

    /// Queue one command as one line. Rejected unless the worker is running.
    /// Never waits on the pipe: a worker that stops reading stdin only backs
    /// up its own queue.
    pub fn send(&self, command: &OutboundCommand) -> Result<(), SendError> {
        let line = outbound::encode_line(command)?;

        let mut state = self.shared.state.lock();
        if let Some(report) = self.shared.refresh(&mut state) {
            drop(state);
            self.shared.announce_exit(report.clone());
            return Err(SendError::NotRunning(WorkerStatus::Exited(report)));
        }

        match &*state {
            WorkerState::Running(handle) => {
                let len = line.len();
                handle
                    .stdin
                    .send(line)
                    .map_err(|_| SendError::StdinClosed)?;
                log::debug!("[Worker] Queued {} bytes for pid {}", len, handle.pid);
                Ok(())
            }
            other => Err(SendError::NotRunning(other.status())),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        let mut state = self.shared.state.lock();
        if let Some(report) = self.shared.refresh(&mut state) {
            drop(state);
            self.shared.announce_exit(report.clone());
            return WorkerStatus::Exited(report);
        }
        state.status()
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    /// Stop the worker. Idempotent; returns without waiting longer than the
    /// configured grace period plus a forced kill.
    pub fn terminate(&self) {
        let handle = {
            let mut state = self.shared.state.lock();
            match std::mem::replace(
                &mut *state,
                WorkerState::Exited(ExitReport {
                    code: None,
                    reason: ExitReason::Terminated,
                }),
            ) {
                WorkerState::Running(handle) => handle,
                previous => {
                    *state = previous;
                    log::debug!("[Worker] Terminate requested but worker is not running");
                    return;
                }
            }
        };

        let WorkerHandle {
            pid,
            mut child,
            stdin,
            stopping,
            ..
        } = handle;

        log::info!("[Worker] Terminating pid {}", pid);
        stopping.store(true, Ordering::SeqCst);
        drop(stdin);

        #[cfg(unix)]
        {
            // SIGTERM first so the worker can clean up
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }

        let deadline = Instant::now() + self.shared.config.terminate_grace;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() < deadline => thread::sleep(REAP_POLL),
                Ok(None) => {
                    log::warn!("[Worker] pid {} ignored SIGTERM, killing", pid);
                    let _ = child.kill();
                    break child.wait().ok();
                }
                Err(e) => {
                    log::error!("[Worker] Failed to check pid {}: {}", pid, e);
                    let _ = child.kill();
                    break None;
                }
            }
        };

        let report = ExitReport {
            code: status.and_then(|s| s.code()),
            reason: ExitReason::Terminated,
        };
        log::info!("[Worker] pid {} stopped ({:?})", pid, report.code);
        *self.shared.state.lock() = WorkerState::Exited(report.clone());
        self.shared.announce_exit(report);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Never leave an orphaned worker behind
        self.terminate();
    }
}

impl Shared {
    /// Non-blocking check whether a running worker has exited. Performs the
    /// `Running -> Exited` transition and returns the report for the caller
    /// to announce once the lock is released.
    fn refresh(&self, state: &mut WorkerState) -> Option<ExitReport> {
        let WorkerState::Running(handle) = state else {
            return None;
        };
        let report = match handle.child.try_wait() {
            Ok(None) => return None,
            Ok(Some(status)) => ExitReport::from_status(status),
            Err(e) => {
                log::error!("[Worker] Failed to check pid {}: {}", handle.pid, e);
                ExitReport {
                    code: None,
                    reason: ExitReason::Crashed,
                }
            }
        };
        log::warn!(
            "[Worker] pid {} exited on its own: {:?}",
            handle.pid,
            report
        );
        *state = WorkerState::Exited(report.clone());
        Some(report)
    }

    /// Called by the stdout reader at EOF: wait, without holding the lock,
    /// until the worker is reaped either here or by `terminate`. A worker
    /// that closed stdout but lives on is polled with backoff.
    fn reap_after_eof(&self, pid: u32) {
        let mut delay = REAP_POLL;
        loop {
            {
                let mut state = self.state.lock();
                match &*state {
                    WorkerState::Running(handle) if handle.pid == pid => {}
                    _ => return,
                }
                if let Some(report) = self.refresh(&mut state) {
                    drop(state);
                    self.announce_exit(report);
                    return;
                }
            }
            thread::sleep(delay);
            delay = (delay * 2).min(REAP_POLL_MAX);
        }
    }

    fn announce_exit(&self, report: ExitReport) {
        if report.is_crash() {
            self.router
                .publish(Channel::WorkerCrashed, Payload::Exited(report.clone()));
        }
        self.router
            .publish(Channel::WorkerExited, Payload::Exited(report));
    }
}

/// Output pipes of a freshly spawned worker, handed to the reader threads.
struct WorkerPipes {
    stdout: ChildStdout,
    stderr: ChildStderr,
}

impl WorkerPipes {
    fn spawn_readers(
        self,
        shared: &Arc<Shared>,
        pid: u32,
        stopping: Arc<AtomicBool>,
    ) -> Result<(), SupervisorError> {
        spawn_stdout_reader(self.stdout, shared.clone(), pid, stopping.clone())?;
        spawn_stderr_reader(self.stderr, shared.router.clone(), pid, stopping)
    }
}

fn spawn_worker(config: &WorkerConfig) -> Result<(WorkerHandle, WorkerPipes), SupervisorError> {
    let mut command = Command::new(&config.executable);
    command
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &config.working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
        executable: config.executable.display().to_string(),
        source,
    })?;

    let pid = child.id();
    let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
    let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(SupervisorError::MissingPipe("stdio"));
    };

    let stdin = match spawn_stdin_writer(stdin, pid) {
        Ok(stdin) => stdin,
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }
    };

    let handle = WorkerHandle {
        executable: config.executable.clone(),
        args: config.args.clone(),
        pid,
        child,
        stdin,
        stopping: Arc::new(AtomicBool::new(false)),
    };
    Ok((handle, WorkerPipes { stdout, stderr }))
}

/// Drains queued lines into the worker's stdin in call order. Exits when
/// the sender is dropped or the pipe breaks, closing stdin either way.
fn spawn_stdin_writer(
    mut stdin: ChildStdin,
    pid: u32,
) -> Result<mpsc::Sender<Vec<u8>>, SupervisorError> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    thread::Builder::new()
        .name("worker-stdin".into())
        .spawn(move || {
            for line in rx {
                if let Err(e) = stdin.write_all(&line).and_then(|_| stdin.flush()) {
                    log::warn!("[Worker] Failed to write to stdin of pid {}: {}", pid, e);
                    break;
                }
            }
            log::debug!("[Worker] stdin writer for pid {} finished", pid);
        })
        .map_err(|source| SupervisorError::Thread {
            name: "stdin",
            source,
        })?;
    Ok(tx)
}

fn spawn_stdout_reader(
    mut stdout: ChildStdout,
    shared: Arc<Shared>,
    pid: u32,
    stopping: Arc<AtomicBool>,
) -> Result<(), SupervisorError> {
    thread::Builder::new()
        .name("worker-stdout".into())
        .spawn(move || {
            let mut framer = LineFramer::new(shared.config.max_line_bytes);
            let mut buf = [0u8; 8192];
            'read: loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in framer.push(&buf[..n]) {
                            if stopping.load(Ordering::SeqCst) {
                                break 'read;
                            }
                            log::debug!("[Worker] stdout: {}", line);
                            shared
                                .router
                                .publish(Channel::WorkerMessage, Payload::Text(line));
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("[Worker] Error reading stdout of pid {}: {}", pid, e);
                        break;
                    }
                }
            }
            framer.finish();
            log::debug!("[Worker] stdout reader for pid {} finished", pid);

            if !stopping.load(Ordering::SeqCst) {
                shared.reap_after_eof(pid);
            }
        })
        .map(drop)
        .map_err(|source| SupervisorError::Thread {
            name: "stdout",
            source,
        })
}

fn spawn_stderr_reader(
    stderr: ChildStderr,
    router: Router,
    pid: u32,
    stopping: Arc<AtomicBool>,
) -> Result<(), SupervisorError> {
    thread::Builder::new()
        .name("worker-stderr".into())
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.split(b'\n') {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        log::warn!("[Worker] Error reading stderr of pid {}: {}", pid, e);
                        break;
                    }
                };
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                let Some(text) = framer::decode_line(&line) else {
                    continue;
                };
                log::warn!("[Worker] stderr: {}", text);
                router.publish(Channel::WorkerStderr, Payload::Text(text));
            }
        })
        .map(drop)
        .map_err(|source| SupervisorError::Thread {
            name: "stderr",
            source,
        })
}
