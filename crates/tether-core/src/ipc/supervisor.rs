//! Supervision of a long-running subprocess.
//!
//! `ProcessSupervisor` owns exactly one child process at a time. The child's
//! stdout and stderr are each decoded on a dedicated thread into token
//! channels; a supervision thread waits for the child to go away and spawns
//! a replacement, so callers only ever see a short window of
//! [`Error::Closed`] failures while the process restarts.
//!
//! ```text
//! exchange() ──write──► stdin ─┐
//!                              │  child process
//! exchange() ◄──tokens── stdout decoder ◄─┤
//! exchange() ◄──tokens── stderr decoder ◄─┘
//!                              │ (both decoders finished)
//!                        ExitSignal ──► supervision thread ──► restart
//! ```

use std::fmt;
use std::io::{BufWriter, ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select, unbounded};

use crate::config::SubprocessConfig;
use crate::error::{Error, Result};

use super::protocol::{Codec, write_frame};
use super::reader::FrameReader;

/// Upper bound on waiting for leftover output of an exited process.
const RESIDUAL_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay between attempts when respawning the process fails.
const RESPAWN_BACKOFF: Duration = Duration::from_millis(500);

/// Poll interval while waiting for a closing process to exit by itself.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    /// The first process is being spawned.
    Starting,
    /// A process is live and accepting exchanges.
    Running,
    /// The process exited and is being reaped.
    Exiting,
    /// A replacement process is being spawned.
    Restarting,
    /// Shutdown was requested. Terminal.
    Closed,
}

impl SupervisorState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::Closed)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Exiting => "exiting",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One-shot notification that a process's output streams have ended.
///
/// Both decoder threads hold it; only the first to finish fires.
struct ExitSignal {
    fired: AtomicBool,
    tx: Sender<()>,
}

impl ExitSignal {
    fn new() -> (Arc<Self>, Receiver<()>) {
        let (tx, rx) = bounded(1);
        let signal = Self {
            fired: AtomicBool::new(false),
            tx,
        };
        (Arc::new(signal), rx)
    }

    /// Fire the signal. Returns false if it had already fired.
    fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.try_send(());
        true
    }
}

/// Stdin shared between the handle and in-flight exchanges.
///
/// `None` once stdin has been closed for shutdown.
type SharedStdin = Arc<Mutex<Option<BufWriter<ChildStdin>>>>;

/// One live child process and its plumbing.
struct ProcessHandle {
    child: Child,
    pid: u32,
    generation: u64,
    stdin: SharedStdin,
    stdout: Receiver<Vec<u8>>,
    stderr: Receiver<Vec<u8>>,
    exit: Receiver<()>,
}

/// The pieces of the current handle an exchange works on.
struct Channels {
    stdin: SharedStdin,
    stdout: Receiver<Vec<u8>>,
    stderr: Receiver<Vec<u8>>,
}

struct Slot {
    handle: Option<ProcessHandle>,
    state: SupervisorState,
}

/// State shared between the supervisor and its supervision thread.
struct Shared {
    program: PathBuf,
    config: SubprocessConfig,
    slot: Mutex<Slot>,
    closed: AtomicBool,
    generation: AtomicU64,
    restarts: AtomicU64,
}

fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::Lock(format!("subprocess lock poisoned (thread panicked): {}", e))
}

/// A broken pipe means the process is gone, which callers see as closed.
fn write_error(e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::BrokenPipe {
        Error::Closed
    } else {
        Error::Io(e)
    }
}

impl Shared {
    fn lock_slot(&self) -> Result<MutexGuard<'_, Slot>> {
        self.slot.lock().map_err(lock_error)
    }

    fn set_state(slot: &mut Slot, next: SupervisorState) {
        if slot.state.is_terminal() || slot.state == next {
            return;
        }
        tracing::debug!("Subprocess supervisor: {} -> {}", slot.state, next);
        slot.state = next;
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawn the process unless one is already live.
    fn start(&self) -> Result<()> {
        let mut slot = self.lock_slot()?;
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if slot.handle.is_some() {
            return Ok(());
        }

        let handle = self.spawn()?;
        tracing::info!(
            "Subprocess started: {} (pid {})",
            self.config.command_line(),
            handle.pid
        );
        slot.handle = Some(handle);
        Self::set_state(&mut slot, SupervisorState::Running);
        Ok(())
    }

    fn spawn(&self) -> Result<ProcessHandle> {
        let spawn_error = |source: std::io::Error| Error::Spawn {
            command: self.config.command_line(),
            source,
        };

        let mut child = Command::new(&self.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_error(std::io::Error::other(
                "failed to capture subprocess standard streams",
            )));
        };

        let pid = child.id();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (exit_signal, exit) = ExitSignal::new();
        let (stdout_tx, stdout_rx) = unbounded();
        let (stderr_tx, stderr_rx) = unbounded();

        let decoders = spawn_decoder(
            "stdout",
            stdout,
            self.config.codec_recv,
            self.config.max_buffer,
            stdout_tx,
            exit_signal.clone(),
        )
        .and_then(|()| {
            spawn_decoder(
                "stderr",
                stderr,
                Codec::Lines,
                self.config.max_buffer,
                stderr_tx,
                exit_signal,
            )
        });
        if let Err(e) = decoders {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Io(e));
        }

        Ok(ProcessHandle {
            child,
            pid,
            generation,
            stdin: Arc::new(Mutex::new(Some(BufWriter::new(stdin)))),
            stdout: stdout_rx,
            stderr: stderr_rx,
            exit,
        })
    }

    /// Remove the current handle, optionally only if it is `generation`.
    fn take_handle(
        &self,
        generation: Option<u64>,
        next: SupervisorState,
    ) -> Result<Option<ProcessHandle>> {
        let mut slot = self.lock_slot()?;
        let matches = match (&slot.handle, generation) {
            (Some(handle), Some(generation)) => handle.generation == generation,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return Ok(None);
        }
        Self::set_state(&mut slot, next);
        Ok(slot.handle.take())
    }

    fn snapshot(&self) -> Result<Option<Channels>> {
        let slot = self.lock_slot()?;
        Ok(slot.handle.as_ref().map(|handle| Channels {
            stdin: handle.stdin.clone(),
            stdout: handle.stdout.clone(),
            stderr: handle.stderr.clone(),
        }))
    }

    /// Reap an exited process and spawn its replacement.
    fn restart(&self, generation: u64) {
        tracing::warn!("Subprocess exited: {}", self.config.command_line());
        match self.take_handle(Some(generation), SupervisorState::Exiting) {
            Ok(Some(mut handle)) => {
                terminate(&mut handle, Duration::ZERO);
                flush_residual(&handle);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Failed to reap subprocess: {}", e);
                return;
            }
        }
        self.respawn();
    }

    fn respawn(&self) {
        if self.is_closed() {
            return;
        }
        if let Ok(mut slot) = self.lock_slot() {
            Self::set_state(&mut slot, SupervisorState::Restarting);
        }
        match self.start() {
            Ok(()) => {
                self.restarts.fetch_add(1, Ordering::Relaxed);
            }
            Err(Error::Closed) => {}
            Err(e) => tracing::error!("Failed to restart subprocess: {}", e),
        }
    }

    /// Final teardown once close was requested.
    fn shutdown(&self) {
        match self.take_handle(None, SupervisorState::Closed) {
            Ok(Some(mut handle)) => terminate(&mut handle, self.config.close_grace()),
            Ok(None) => {}
            Err(e) => tracing::error!("Failed to release subprocess on close: {}", e),
        }
        tracing::info!("Subprocess supervisor closed");
    }
}

/// Run a decode loop for one output stream on its own thread.
fn spawn_decoder<R>(
    stream: &'static str,
    reader: R,
    codec: Codec,
    max_buffer: usize,
    tx: Sender<Vec<u8>>,
    exit: Arc<ExitSignal>,
) -> std::io::Result<()>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("tether-{}", stream))
        .spawn(move || {
            for token in FrameReader::new(reader, codec, max_buffer) {
                match token {
                    Ok(token) => {
                        if tx.send(token).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to read subprocess {}: {}", stream, e);
                        break;
                    }
                }
            }
            drop(tx);
            exit.fire();
        })?;
    Ok(())
}

/// Stop a process and reap it.
///
/// With a non-zero `grace`, stdin is closed first and the process gets that
/// long to exit on its own before it is killed.
fn terminate(handle: &mut ProcessHandle, grace: Duration) {
    if !grace.is_zero() {
        if let Ok(mut stdin) = handle.stdin.try_lock() {
            drop(stdin.take());
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match handle.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!("Subprocess (pid {}) exited: {}", handle.pid, status);
                    return;
                }
                Ok(None) => thread::sleep(EXIT_POLL_INTERVAL),
                Err(e) => {
                    tracing::warn!("Failed to poll subprocess (pid {}): {}", handle.pid, e);
                    break;
                }
            }
        }
    }

    if let Err(e) = handle.child.kill() {
        tracing::debug!("Failed to kill subprocess (pid {}): {}", handle.pid, e);
    }
    match handle.child.wait() {
        Ok(status) => tracing::info!("Subprocess (pid {}) exited: {}", handle.pid, status),
        Err(e) => tracing::warn!("Failed to wait for subprocess (pid {}): {}", handle.pid, e),
    }
}

/// Collect whatever is left in a token channel, joined by newlines.
fn drain(rx: &Receiver<Vec<u8>>, deadline: Instant) -> Vec<u8> {
    let mut out = Vec::new();
    while let Ok(token) = rx.recv_deadline(deadline) {
        if !out.is_empty() {
            out.push(b'\n');
        }
        out.extend_from_slice(&token);
    }
    out
}

/// Log output an exited process produced that no exchange picked up.
fn flush_residual(handle: &ProcessHandle) {
    let deadline = Instant::now() + RESIDUAL_DRAIN_TIMEOUT;
    let stdout = drain(&handle.stdout, deadline);
    if !stdout.is_empty() {
        tracing::info!("{}", String::from_utf8_lossy(&stdout));
    }
    let stderr = drain(&handle.stderr, deadline);
    if !stderr.is_empty() {
        tracing::error!("{}", String::from_utf8_lossy(&stderr));
    }
}

fn supervise(shared: Arc<Shared>, close_rx: Receiver<()>, closed_tx: Sender<()>) {
    loop {
        let watched = match shared.lock_slot() {
            Ok(slot) => slot
                .handle
                .as_ref()
                .map(|handle| (handle.generation, handle.exit.clone())),
            Err(e) => {
                tracing::error!("Subprocess supervision stopped: {}", e);
                break;
            }
        };

        match watched {
            Some((generation, exit)) => {
                let closing = select! {
                    recv(exit) -> _ => false,
                    recv(close_rx) -> _ => true,
                };
                if closing {
                    break;
                }
                shared.restart(generation);
            }
            // A previous respawn failed; retry until closed.
            None => match close_rx.recv_timeout(RESPAWN_BACKOFF) {
                Err(RecvTimeoutError::Timeout) => shared.respawn(),
                _ => break,
            },
        }
    }

    shared.shutdown();
    drop(closed_tx);
}

/// Keeps one subprocess alive and exchanges framed payloads with it.
///
/// Created with a live process; [`exchange`](Self::exchange) is synchronous
/// and may be called from any thread, but concurrent exchanges share one
/// stdin/stdout pair and must be serialized by the caller to keep requests
/// and responses paired.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    close_tx: Sender<()>,
    closed_rx: Receiver<()>,
}

impl ProcessSupervisor {
    /// Spawn the configured command and start supervising it.
    ///
    /// Fails if the configuration is invalid or the command cannot be spawned.
    pub fn new(config: &SubprocessConfig) -> Result<Self> {
        config.validate()?;
        let program = config.resolve_program()?;

        let shared = Arc::new(Shared {
            program,
            config: config.clone(),
            slot: Mutex::new(Slot {
                handle: None,
                state: SupervisorState::Starting,
            }),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        });
        shared.start()?;

        let (close_tx, close_rx) = bounded(1);
        let (closed_tx, closed_rx) = bounded(0);
        let thread_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name("tether-supervisor".to_string())
            .spawn(move || supervise(thread_shared, close_rx, closed_tx));
        if let Err(e) = spawned {
            shared.closed.store(true, Ordering::Release);
            shared.shutdown();
            return Err(Error::Io(e));
        }

        Ok(Self {
            shared,
            close_tx,
            closed_rx,
        })
    }

    /// Ensure a process is running, spawning one if there is none.
    ///
    /// Fails with [`Error::Closed`] once shutdown has been requested.
    pub fn start(&self) -> Result<()> {
        self.shared.start()
    }

    /// Kill and reap the current process, if any.
    ///
    /// Unless the supervisor is closing, the supervision thread notices the
    /// exit and spawns a replacement.
    pub fn stop(&self) -> Result<()> {
        if let Some(mut handle) = self.shared.take_handle(None, SupervisorState::Exiting)? {
            terminate(&mut handle, Duration::ZERO);
        }
        Ok(())
    }

    /// Write one framed request and wait for the response.
    ///
    /// `prolog`, `payload` and `epilog` are written to stdin in order. The
    /// first token from stdout is the response. If stderr produces a token
    /// first, stderr lines arriving within the configured window are joined
    /// into an [`Error::Subprocess`]. Fails with [`Error::Closed`] when no
    /// process is live or it went away during the exchange.
    ///
    /// There is no timeout: a subprocess that never answers blocks the call.
    pub fn exchange(
        &self,
        prolog: Option<&[u8]>,
        payload: &[u8],
        epilog: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let channels = self.shared.snapshot()?.ok_or(Error::Closed)?;

        {
            let mut stdin = channels.stdin.lock().map_err(lock_error)?;
            let writer = stdin.as_mut().ok_or(Error::Closed)?;
            write_frame(writer, prolog, payload, epilog).map_err(write_error)?;
        }

        select! {
            recv(channels.stdout) -> token => token.map_err(|_| Error::Closed),
            recv(channels.stderr) -> token => match token {
                Ok(first) => Err(Error::Subprocess(collect_stderr(
                    first,
                    &channels.stderr,
                    self.shared.config.stderr_window(),
                ))),
                Err(_) => Err(Error::Closed),
            },
        }
    }

    /// Request shutdown without waiting for it.
    ///
    /// Only the first call has an effect.
    pub fn close_async(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.shared.slot.lock() {
            Shared::set_state(&mut slot, SupervisorState::Closed);
        }
        let _ = self.close_tx.try_send(());
    }

    /// Block until the supervision thread has released the process.
    ///
    /// On timeout the teardown keeps running in the background.
    pub fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        match self.closed_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "subprocess failed to close in {:?}",
                timeout
            ))),
            _ => Ok(()),
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.shared
            .slot
            .lock()
            .map(|slot| slot.state)
            .unwrap_or(SupervisorState::Closed)
    }

    /// Process ID of the live process, if any.
    pub fn pid(&self) -> Option<u32> {
        self.shared
            .lock_slot()
            .ok()
            .and_then(|slot| slot.handle.as_ref().map(|handle| handle.pid))
    }

    /// Number of times the process has been respawned after exiting.
    pub fn restarts(&self) -> u64 {
        self.shared.restarts.load(Ordering::Relaxed)
    }

    /// A handle that can kill the live process from any thread.
    pub fn kill_handle(&self) -> Option<ProcessKillHandle> {
        let slot = self.shared.lock_slot().ok()?;
        slot.handle.as_ref().map(|handle| ProcessKillHandle {
            shared: Arc::downgrade(&self.shared),
            pid: handle.pid,
            generation: handle.generation,
            killed: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        self.close_async();
    }
}

/// Join stderr tokens arriving within `window` of the first one.
fn collect_stderr(first: Vec<u8>, stderr: &Receiver<Vec<u8>>, window: Duration) -> String {
    let mut lines = vec![first];
    let deadline = Instant::now() + window;
    while let Ok(line) = stderr.recv_deadline(deadline) {
        lines.push(line);
    }
    let text = String::from_utf8_lossy(&lines.join(&b'\n')).into_owned();
    if text.is_empty() {
        "subprocess wrote an empty line to stderr".to_string()
    } else {
        text
    }
}

/// Thread-safe handle for killing a supervised process.
///
/// The supervisor treats the kill like any other exit and restarts the
/// process. A handle only ever targets the process it was taken from: once
/// that process has been reaped, killing through the handle does nothing, so
/// a recycled pid is never signalled.
#[derive(Clone)]
pub struct ProcessKillHandle {
    shared: Weak<Shared>,
    /// Process ID of the target.
    pid: u32,
    generation: u64,
    /// Whether the kill has been requested.
    killed: Arc<AtomicBool>,
}

impl ProcessKillHandle {
    /// Process ID of the target.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Kill the process with SIGKILL.
    ///
    /// Returns false if the kill was already requested or the target process
    /// is no longer the supervised one.
    pub fn kill(&self) -> bool {
        if self.killed.swap(true, Ordering::SeqCst) {
            return false; // Already killed
        }
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        // Holding the slot keeps the target from being reaped while signalled.
        let Ok(slot) = shared.lock_slot() else {
            return false;
        };
        let live = slot
            .handle
            .as_ref()
            .is_some_and(|handle| handle.generation == self.generation);
        if !live {
            tracing::debug!("Subprocess (pid {}) already gone, not killing", self.pid);
            return false;
        }

        #[cfg(unix)]
        {
            // SAFETY: kill(2) has no memory-safety preconditions.
            unsafe {
                libc::kill(self.pid as libc::pid_t, libc::SIGKILL);
            }
            true
        }

        #[cfg(not(unix))]
        {
            tracing::warn!("Killing subprocess {} by pid is not supported on this platform", self.pid);
            false
        }
    }

    /// Check if kill has been requested.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}
