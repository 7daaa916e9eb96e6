//! The backend child supervisor.
//!
//! One supervisor owns at most one live child process at a time. Child
//! stdout is framed into per-line events; a terminal event classifying the
//! exit fires exactly once per child. New invocations either reuse the live
//! dispatcher (one request line down its stdin) or rotate it out via a
//! cooperative `exit` request. Termination escalates: a polite quit signal
//! first, then an unignorable kill if the child is still there when the
//! grace timer fires.
//!
//! All state lives behind one mutex. A poll thread ticks every
//! [`POLL_INTERVAL`], draining stdout (the pipe is non-blocking) and
//! reaping the child with a non-blocking wait; callers that need to block
//! until the reap suspend on a condvar paired with that mutex.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SpawnConfig;
use crate::invocation::{Invocation, ReuseDecision, decide_reuse, parse_env_var};
use crate::outbuf::OutputBuffer;

/// How often the poll loop drains stdout and checks for child exit.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Grace period between the polite quit signal and the forced kill.
pub const KILL_GRACE: Duration = Duration::from_millis(500);

const READ_BUF_SIZE: usize = 4096;

/// Why the child went away. Delivered once per child in [`SpawnEvent::Exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// No classification yet; never delivered for a child that actually ran.
    Unknown,
    /// Exited on its own with status 0.
    Success,
    /// Exited on its own with a non-zero status, or died to a signal the
    /// supervisor did not send.
    Failed,
    /// Went away after the polite quit signal, within the grace period.
    SigQuit,
    /// Survived the grace period and was forcibly killed.
    SigKill,
    /// Honoured a cooperative `exit` request.
    DispatcherExit,
    /// Retired to make room for a dispatcher with a different descriptor.
    DispatcherChanged,
}

impl ExitClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitClass::Unknown => "unknown",
            ExitClass::Success => "success",
            ExitClass::Failed => "failed",
            ExitClass::SigQuit => "sigquit",
            ExitClass::SigKill => "sigkill",
            ExitClass::DispatcherExit => "dispatcher-exit",
            ExitClass::DispatcherChanged => "dispatcher-changed",
        }
    }
}

/// Events emitted by the supervisor, in order: zero or more `Line`s, then
/// exactly one `Exit` per child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnEvent {
    /// One complete line of child stdout, without the trailing newline.
    Line(String),
    /// The child was reaped; carries the final classification.
    Exit(ExitClass),
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn {argv0}: {source}")]
    SpawnFailed {
        argv0: String,
        #[source]
        source: io::Error,
    },
    /// The request line was not fully accepted by the child's stdin pipe.
    /// Writes are attempted once and never retried; callers rotate instead.
    #[error("short write to child stdin: {written} of {expected} bytes accepted")]
    ShortWrite { written: usize, expected: usize },
    #[error("no child is running")]
    AlreadyFinished,
    #[error("a cooperative exit is already in flight")]
    ExitInProgress,
    #[error("kernel refused signal {signal}: {source}")]
    SignalRefused {
        signal: i32,
        #[source]
        source: io::Error,
    },
}

/// Why a shutdown is in flight. Tagged so "rotating without an exit request"
/// is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownReason {
    None,
    /// An embedder asked the dispatcher to exit.
    CooperativeExit,
    /// The supervisor is retiring the dispatcher to start a different one.
    DispatcherRotation,
}

/// Pipes and identity of the live child.
struct ChildHandle {
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

struct Inner {
    child: Option<ChildHandle>,
    buf: OutputBuffer,
    /// True from reap until the next launch.
    finished: bool,
    exit_class: ExitClass,
    shutdown: ShutdownReason,
    /// Descriptor of the current (or most recent) child, for reuse matching.
    last_argv0: Option<String>,
    last_envp: Option<Vec<String>>,
    /// Bumped on every launch; a forced-kill timer armed for an earlier
    /// generation can never signal a later child.
    generation: u64,
    poll_running: bool,
    events: Sender<SpawnEvent>,
}

struct Shared {
    state: Mutex<Inner>,
    /// Wakes callers blocked in `send_exit` or a dispatcher rotation once
    /// the poll loop has reaped the child.
    reaped: Condvar,
}

/// Supervisor for one backend helper process.
pub struct Supervisor {
    shared: Arc<Shared>,
    config: SpawnConfig,
}

impl Supervisor {
    /// Create a supervisor and the event stream it feeds.
    pub fn new(config: SpawnConfig) -> (Self, Receiver<SpawnEvent>) {
        let (events, receiver) = mpsc::channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(Inner {
                child: None,
                buf: OutputBuffer::new(),
                finished: false,
                exit_class: ExitClass::Unknown,
                shutdown: ShutdownReason::None,
                last_argv0: None,
                last_envp: None,
                generation: 0,
                poll_running: false,
                events,
            }),
            reaped: Condvar::new(),
        });
        (Supervisor { shared, config }, receiver)
    }

    /// Launch the invocation, or feed it to the live dispatcher when the
    /// descriptor matches.
    ///
    /// When the descriptor differs (or the request write fails), the live
    /// child is retired first: an `exit` request goes down its stdin, the
    /// call blocks until the reap, and the terminal event for that child
    /// carries [`ExitClass::DispatcherChanged`]. The fresh launch then
    /// proceeds independently.
    pub fn run(&self, inv: &Invocation) -> Result<(), SpawnError> {
        if inv.argv.is_empty() {
            return Err(SpawnError::SpawnFailed {
                argv0: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector"),
            });
        }

        let mut state = self.shared.state.lock().unwrap();
        if state.child.is_some() {
            let reusable = state.shutdown == ShutdownReason::None
                && decide_reuse(inv, state.last_argv0.as_deref(), state.last_envp.as_deref())
                    == ReuseDecision::Reuse;
            if reusable {
                if let Some(stdin) = state.child.as_mut().and_then(|c| c.stdin.as_mut()) {
                    let request = inv.request_line();
                    match write_request(stdin, &request) {
                        Ok(()) => {
                            debug!(argv0 = %inv.argv0(), "request dispatched to live child");
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(error = %e, "request write failed; rotating dispatcher");
                        }
                    }
                }
            } else {
                debug!(argv0 = %inv.argv0(), "descriptor differs from live dispatcher; rotating");
            }

            // Retire the current child, then fall through to a fresh launch.
            if state.shutdown == ShutdownReason::None {
                state.shutdown = ShutdownReason::DispatcherRotation;
                let sent = match state.child.as_mut().and_then(|c| c.stdin.as_mut()) {
                    Some(stdin) => write_request(stdin, "exit").is_ok(),
                    None => false,
                };
                if !sent {
                    let _ = self.polite_kill_locked(&mut state);
                }
            }
            state = self
                .shared
                .reaped
                .wait_while(state, |s| !s.finished)
                .unwrap();
        }

        self.launch_locked(&mut state, inv)
    }

    /// Write one command line to the live child's stdin, newline-terminated.
    pub fn send_stdin(&self, command: &str) -> Result<(), SpawnError> {
        let mut state = self.shared.state.lock().unwrap();
        match state.child.as_mut().and_then(|c| c.stdin.as_mut()) {
            Some(stdin) => write_request(stdin, command),
            None => Err(SpawnError::AlreadyFinished),
        }
    }

    /// Ask the dispatcher to exit on its own, then block until it is reaped.
    ///
    /// The terminal event for the child carries
    /// [`ExitClass::DispatcherExit`]. A second call while one is in flight
    /// fails with [`SpawnError::ExitInProgress`] and does not queue another
    /// request. If the `exit` line cannot be written the call falls back to
    /// the polite-kill escalation so it cannot block on a dead pipe forever.
    pub fn send_exit(&self) -> Result<(), SpawnError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.child.as_ref().is_none_or(|c| c.stdin.is_none()) {
            return Err(SpawnError::AlreadyFinished);
        }
        if state.shutdown != ShutdownReason::None {
            debug!("exit request already in flight");
            return Err(SpawnError::ExitInProgress);
        }

        state.shutdown = ShutdownReason::CooperativeExit;
        let sent = match state.child.as_mut().and_then(|c| c.stdin.as_mut()) {
            Some(stdin) => write_request(stdin, "exit"),
            None => Err(SpawnError::AlreadyFinished),
        };
        if let Err(e) = sent {
            warn!(error = %e, "exit request failed; escalating to polite kill");
            let _ = self.polite_kill_locked(&mut state);
        }

        let state = self
            .shared
            .reaped
            .wait_while(state, |s| !s.finished)
            .unwrap();
        drop(state);
        Ok(())
    }

    /// Terminate the child: polite quit now, forced kill after
    /// [`KILL_GRACE`] if it is still alive. Returns without waiting for the
    /// reap; the terminal event reports which stage got it.
    pub fn kill(&self) -> Result<(), SpawnError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.child.is_none() {
            debug!("kill requested but the child is already reaped");
            return Err(SpawnError::AlreadyFinished);
        }
        self.polite_kill_locked(&mut state)
    }

    /// PID of the live child, if any.
    pub fn pid(&self) -> Option<u32> {
        self.shared.state.lock().unwrap().child.as_ref().map(|c| c.pid)
    }

    /// True while a child is live and can still accept stdin requests.
    pub fn is_running(&self) -> bool {
        self.shared
            .state
            .lock()
            .unwrap()
            .child
            .as_ref()
            .is_some_and(|c| c.stdin.is_some())
    }

    fn launch_locked(&self, state: &mut Inner, inv: &Invocation) -> Result<(), SpawnError> {
        let mut cmd = Command::new(inv.argv0());
        cmd.args(&inv.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(envp) = &inv.envp {
            cmd.env_clear();
            for entry in envp {
                let (key, value) = parse_env_var(entry);
                cmd.env(key, value);
            }
        }

        let mut child = cmd.spawn().map_err(|e| SpawnError::SpawnFailed {
            argv0: inv.argv0().to_string(),
            source: e,
        })?;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        if let Some(out) = &stdout {
            if let Err(e) = set_nonblocking(out.as_raw_fd()) {
                warn!(pid, error = %e, "failed to set child stdout non-blocking");
            }
        }

        info!(pid, argv0 = %inv.argv0(), "child process started");
        state.child = Some(ChildHandle {
            child,
            pid,
            stdin,
            stdout,
        });
        state.buf.clear();
        state.finished = false;
        state.exit_class = ExitClass::Unknown;
        state.shutdown = ShutdownReason::None;
        state.last_argv0 = Some(inv.argv0().to_string());
        state.last_envp = inv.envp.clone();
        state.generation += 1;

        apply_priority(pid, self.config.nice);

        if !state.poll_running {
            state.poll_running = true;
            self.spawn_poll_thread();
        }
        Ok(())
    }

    /// Send the polite quit signal and arm the forced-kill timer. Caller
    /// holds the state lock and has checked that a child exists.
    fn polite_kill_locked(&self, state: &mut Inner) -> Result<(), SpawnError> {
        let Some(pid) = state.child.as_ref().map(|c| c.pid) else {
            return Err(SpawnError::AlreadyFinished);
        };
        if let Err(e) = send_signal(pid, libc::SIGQUIT) {
            warn!(pid, error = %e, "polite quit signal refused");
            return Err(e);
        }
        info!(pid, "sent polite quit; arming forced-kill timer");
        if state.exit_class == ExitClass::Unknown {
            state.exit_class = ExitClass::SigQuit;
        }
        self.spawn_forced_kill_timer(pid, state.generation);
        Ok(())
    }

    /// Single-shot timer: if the child of this generation is still live when
    /// the grace period ends, the polite attempt demonstrably failed and the
    /// classification switches to the forced kill.
    fn spawn_forced_kill_timer(&self, pid: u32, generation: u64) {
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || {
            thread::sleep(KILL_GRACE);
            let mut state = shared.state.lock().unwrap();
            if state.finished || state.generation != generation {
                debug!(pid, "forced-kill timer lapsed; child already gone");
                return;
            }
            warn!(pid, "grace period expired; sending forced kill");
            state.exit_class = ExitClass::SigKill;
            if let Err(e) = send_signal(pid, libc::SIGKILL) {
                warn!(pid, error = %e, "forced kill signal refused");
            }
        });
    }

    /// Periodic drain-and-reap loop. The thread stops once it has reaped
    /// its child (each launch arms a fresh one); a tick that finds no live
    /// child logs and stops without re-emitting anything.
    fn spawn_poll_thread(&self) {
        let shared = Arc::clone(&self.shared);
        thread::spawn(move || {
            loop {
                thread::sleep(POLL_INTERVAL);
                let mut state = shared.state.lock().unwrap();
                if state.finished || state.child.is_none() {
                    debug!("poll tick with no live child; stopping");
                    state.poll_running = false;
                    return;
                }

                state.pump_stdout();

                let status = match state.child.as_mut() {
                    Some(handle) => match handle.child.try_wait() {
                        Ok(status) => status,
                        Err(e) => {
                            warn!(pid = handle.pid, error = %e, "non-blocking wait failed");
                            None
                        }
                    },
                    None => None,
                };

                if let Some(status) = status {
                    state.reap(status);
                    state.poll_running = false;
                    shared.reaped.notify_all();
                    return;
                }
            }
        });
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let Ok(mut state) = self.shared.state.lock() else {
            return;
        };
        if state.child.is_some() {
            debug!("supervisor dropped with a live child; sending polite kill");
            let _ = self.polite_kill_locked(&mut state);
        }
    }
}

impl Inner {
    /// Drain everything currently readable from the child's stdout and emit
    /// the complete lines, oldest first.
    fn pump_stdout(&mut self) {
        if let Some(stdout) = self.child.as_mut().and_then(|c| c.stdout.as_mut()) {
            let mut chunk = [0u8; READ_BUF_SIZE];
            loop {
                match stdout.read(&mut chunk) {
                    Ok(0) => break, // EOF; the reap will follow shortly
                    Ok(n) => self.buf.extend(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "stdout read failed");
                        break;
                    }
                }
            }
        }
        while let Some(line) = self.buf.next_line() {
            let _ = self.events.send(SpawnEvent::Line(line));
        }
    }

    /// The child has exited: final stdout drain, close the pipes, classify,
    /// and emit the terminal event. Runs at most once per child.
    fn reap(&mut self, status: ExitStatus) {
        self.pump_stdout();

        self.exit_class = classify(self.exit_class, self.shutdown, status.code());
        if let Some(handle) = self.child.take() {
            info!(
                pid = handle.pid,
                code = status.code(),
                class = self.exit_class.as_str(),
                "child process reaped"
            );
            // Dropping the handle closes both pipe ends.
        }
        self.finished = true;
        let _ = self.events.send(SpawnEvent::Exit(self.exit_class));
    }
}

/// Resolve the final classification at reap time.
///
/// A class the shutdown path already committed to (polite or forced kill)
/// is never overwritten; otherwise an in-flight cooperative shutdown labels
/// the exit, and only a child that went away on its own is judged by its
/// exit code.
fn classify(current: ExitClass, shutdown: ShutdownReason, code: Option<i32>) -> ExitClass {
    if current != ExitClass::Unknown {
        return current;
    }
    match shutdown {
        ShutdownReason::DispatcherRotation => ExitClass::DispatcherChanged,
        ShutdownReason::CooperativeExit => ExitClass::DispatcherExit,
        ShutdownReason::None => match code {
            Some(0) => ExitClass::Success,
            _ => ExitClass::Failed,
        },
    }
}

/// Write one command line to the child. The write is attempted once; any
/// shortfall (including an outright error, which accepts zero bytes) is a
/// [`SpawnError::ShortWrite`].
fn write_request(stdin: &mut ChildStdin, command: &str) -> Result<(), SpawnError> {
    let mut line = String::with_capacity(command.len() + 1);
    line.push_str(command);
    line.push('\n');
    let bytes = line.as_bytes();
    let written = match stdin.write(bytes) {
        Ok(n) => n,
        Err(e) => {
            debug!(error = %e, "stdin write failed");
            0
        }
    };
    if written != bytes.len() {
        return Err(SpawnError::ShortWrite {
            written,
            expected: bytes.len(),
        });
    }
    Ok(())
}

fn send_signal(pid: u32, signum: libc::c_int) -> Result<(), SpawnError> {
    // SAFETY: kill(2) is safe to call with any pid and a valid signal number.
    let ret = unsafe { libc::kill(pid as libc::pid_t, signum) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        // ESRCH: the child is already gone; the poll loop will reap it.
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(SpawnError::SignalRefused {
                signal: signum,
                source: err,
            });
        }
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl(2) on a pipe descriptor this process owns.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Re-nice a freshly spawned child. Best-effort: a child that exits before
/// the adjustment lands, or a kernel that refuses it, costs a warning and
/// nothing else.
fn apply_priority(pid: u32, nice: i32) {
    if nice == 0 {
        return;
    }
    debug!(pid, nice, "adjusting child scheduling priority");
    // SAFETY: setpriority(2) with PRIO_PROCESS only affects the target pid.
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as _, nice as _) };
    if ret != 0 {
        warn!(
            pid,
            nice,
            error = %io::Error::last_os_error(),
            "failed to adjust child priority"
        );
    }
}
