/*!
Process bridge: spawn the program an entry names and pump its stdio through a stream.

- client input is read on a dedicated thread and queued to a second thread that writes
  the child's stdin, so a child ignoring stdin cannot hide a disconnect;
- stdout and stderr share one pipe and are forwarded on the calling thread, so the
  client sees them in the order the child wrote them;
- the child leads its own process group; termination is SIGTERM to the group, a grace
  period, then SIGKILL;
- termination triggers: stream read/write failure, client hang-up while the child runs,
  and the optional exec timeout. A client that only half-closes keeps receiving output.
*/

use std::io::{self, PipeReader, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn, Span};
use wait_timeout::ChildExt;

use crate::cgi::ProcessEnvironment;
use crate::config::Config;
use crate::errors::{Operation, ShaasError};
use crate::fsentry::{EntryKind, FilesystemEntry};
use crate::server::stream::{ByteSource, Departure, StreamEndpoint, StreamHalves};

/// Time between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(2);
const WAIT_POLL: Duration = Duration::from_millis(200);
/// How long a finished stream waits for the client to close before hanging up on it.
const LINGER: Duration = Duration::from_secs(1);
const BUF_SIZE: usize = 8192;
/// Input chunks held for a child that is not reading stdin. A full queue stalls reading.
const STDIN_QUEUE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(i32),
}

impl ChildExit {
    pub fn success(&self) -> bool {
        matches!(self, ChildExit::Exited(0))
    }
}

impl From<ExitStatus> for ChildExit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ChildExit::Exited(code),
            (None, Some(sig)) => ChildExit::Signaled(sig),
            (None, None) => ChildExit::Exited(-1),
        }
    }
}

struct ChildSlot {
    child: Child,
    exit: Option<ChildExit>,
}

fn lock(slot: &Mutex<ChildSlot>) -> MutexGuard<'_, ChildSlot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// A spawned child whose stdio has not been attached to a stream yet.
pub struct ChildProcessHandle {
    pid: u32,
    slot: Arc<Mutex<ChildSlot>>,
    output: PipeReader,
    stdin: Option<ChildStdin>,
}

impl ChildProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn terminator(&self) -> Terminator {
        Terminator {
            pgid: self.pid as i32,
            slot: self.slot.clone(),
        }
    }
}

/// Terminates the child's process group. Cloneable across pump threads.
#[derive(Clone)]
pub struct Terminator {
    pgid: i32,
    slot: Arc<Mutex<ChildSlot>>,
}

impl Terminator {
    pub fn terminate(&self) {
        let mut slot = lock(&self.slot);
        let pgid = Pid::from_raw(self.pgid);
        if slot.exit.is_some() {
            // Leader is gone; take down anything it left behind in the group
            let _ = killpg(pgid, Signal::SIGKILL);
            return;
        }
        if let Ok(Some(status)) = slot.child.try_wait() {
            slot.exit = Some(status.into());
            let _ = killpg(pgid, Signal::SIGKILL);
            return;
        }
        debug!(pgid = self.pgid, "sending SIGTERM to process group");
        let _ = killpg(pgid, Signal::SIGTERM);
        if let Ok(Some(status)) = slot.child.wait_timeout(TERM_GRACE) {
            slot.exit = Some(status.into());
            let _ = killpg(pgid, Signal::SIGKILL);
            return;
        }
        debug!(pgid = self.pgid, "grace period over; sending SIGKILL");
        let _ = killpg(pgid, Signal::SIGKILL);
        let _ = slot.child.kill();
        if let Ok(status) = slot.child.wait() {
            slot.exit = Some(status.into());
        }
    }
}

fn wait_child(slot: &Mutex<ChildSlot>) -> io::Result<ChildExit> {
    loop {
        let mut s = lock(slot);
        if let Some(exit) = s.exit {
            return Ok(exit);
        }
        if let Some(status) = s.child.wait_timeout(WAIT_POLL)? {
            let exit = ChildExit::from(status);
            s.exit = Some(exit);
            return Ok(exit);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessBridge {
    config: Arc<Config>,
}

impl ProcessBridge {
    pub fn new(config: Arc<Config>) -> Self {
        ProcessBridge { config }
    }

    /// Program and working directory for an entry.
    pub fn command_for(
        &self,
        entry: &FilesystemEntry,
        interactive: bool,
    ) -> Result<(PathBuf, PathBuf), ShaasError> {
        match entry.kind() {
            EntryKind::Directory if interactive => Ok((
                self.config.interactive_shell().to_path_buf(),
                entry.working_dir(),
            )),
            EntryKind::Directory => Ok((self.config.shell().to_path_buf(), entry.working_dir())),
            EntryKind::ExecutableFile => Ok((entry.path().to_path_buf(), entry.working_dir())),
            kind => Err(ShaasError::InvalidEntryKind {
                op: if interactive {
                    Operation::Exec
                } else {
                    Operation::Post
                },
                kind,
            }),
        }
    }

    pub fn spawn(
        &self,
        entry: &FilesystemEntry,
        env: &ProcessEnvironment,
        interactive: bool,
    ) -> Result<ChildProcessHandle, ShaasError> {
        let (program, cwd) = self.command_for(entry, interactive)?;
        let (output, writer) = io::pipe().map_err(ShaasError::Spawn)?;
        let writer_err = writer.try_clone().map_err(ShaasError::Spawn)?;

        let mut cmd = Command::new(&program);
        cmd.current_dir(&cwd)
            .env_clear()
            .envs(env.pairs())
            .stdin(Stdio::piped())
            .stdout(writer)
            .stderr(writer_err)
            .process_group(0);
        let mut child = cmd.spawn().map_err(ShaasError::Spawn)?;
        // Our copies of the write end must go before the pipe can reach EOF
        drop(cmd);

        let pid = child.id();
        let stdin = child.stdin.take();
        info!(pid, program = %program.display(), cwd = %cwd.display(), interactive, "spawned child");
        Ok(ChildProcessHandle {
            pid,
            slot: Arc::new(Mutex::new(ChildSlot { child, exit: None })),
            output,
            stdin,
        })
    }

    /// Pump a spawned child's stdio through `halves` until it exits.
    pub fn attach(
        &self,
        child: ChildProcessHandle,
        halves: StreamHalves,
    ) -> Result<ChildExit, ShaasError> {
        let terminator = child.terminator();
        let ChildProcessHandle {
            pid,
            slot,
            mut output,
            stdin,
        } = child;
        let StreamHalves {
            source,
            mut sink,
            hangup,
        } = halves;

        let finished = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let stdin_thread = {
            let terminator = terminator.clone();
            let finished = finished.clone();
            let span = Span::current();
            thread::spawn(move || {
                let _entered = span.enter();
                pump_stdin(source, stdin, &terminator, &finished);
                drop(done_tx);
            })
        };
        let watchdog = self
            .config
            .exec_timeout()
            .map(|limit| spawn_watchdog(limit, terminator.clone()));

        let mut failure: Option<ShaasError> = None;
        let mut buf = [0u8; BUF_SIZE];
        loop {
            match output.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = sink.write(&buf[..n]) {
                        warn!(pid, error = %e, "stream write failed; terminating child");
                        failure = Some(ShaasError::RuntimeExec(format!("stream write: {e}")));
                        terminator.terminate();
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(pid, error = %e, "reading child output failed; terminating child");
                    failure = Some(ShaasError::RuntimeExec(format!("child output: {e}")));
                    terminator.terminate();
                    break;
                }
            }
        }
        drop(output);

        let exit = wait_child(&slot);
        finished.store(true, Ordering::SeqCst);
        if let Some((stop, handle)) = watchdog {
            drop(stop);
            let _ = handle.join();
        }
        if let Err(e) = sink.finish() {
            debug!(pid, error = %e, "closing stream failed");
        }
        if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(LINGER) {
            hangup.hang_up();
        }
        let _ = stdin_thread.join();

        let exit = exit.map_err(|e| ShaasError::RuntimeExec(format!("waiting for child: {e}")))?;
        match exit {
            ChildExit::Exited(0) => info!(pid, code = 0, "child exited"),
            ChildExit::Exited(code) => warn!(pid, code, "child exited with nonzero status"),
            ChildExit::Signaled(signal) => warn!(pid, signal, "child killed by signal"),
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(exit),
        }
    }

    /// `spawn` + `attach` over an endpoint.
    pub fn run(
        &self,
        entry: &FilesystemEntry,
        env: &ProcessEnvironment,
        endpoint: StreamEndpoint,
        interactive: bool,
    ) -> Result<ChildExit, ShaasError> {
        let child = self.spawn(entry, env, interactive)?;
        let halves = match endpoint.split() {
            Ok(h) => h,
            Err(e) => {
                child.terminator().terminate();
                return Err(ShaasError::RuntimeExec(format!("stream setup: {e}")));
            }
        };
        self.attach(child, halves)
    }
}

/// Read client input and queue it for the child. Reading never waits on the child, so
/// a disconnect is seen even while the child ignores its stdin.
fn pump_stdin(
    mut source: Box<dyn ByteSource>,
    stdin: Option<ChildStdin>,
    terminator: &Terminator,
    finished: &AtomicBool,
) {
    let mut queue = stdin.map(spawn_stdin_writer);
    let mut buf = [0u8; BUF_SIZE];
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Some(tx) = &queue {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        // Keep draining so the client is not reset mid-request
                        queue = None;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !finished.load(Ordering::SeqCst) {
                    warn!(error = %e, "stream read failed; terminating child");
                    terminator.terminate();
                }
                return;
            }
        }
    }
    // The writer closes stdin once the queue is empty
    drop(queue);
    match source.wait_hangup() {
        Departure::HalfClosed => debug!("client finished sending; waiting for child output"),
        Departure::Gone if finished.load(Ordering::SeqCst) => {}
        Departure::Gone => {
            info!("client hung up; terminating child");
            terminator.terminate();
        }
    }
}

/// Feed queued input to the child's stdin on its own thread.
fn spawn_stdin_writer(mut stdin: ChildStdin) -> mpsc::SyncSender<Vec<u8>> {
    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(STDIN_QUEUE);
    let span = Span::current();
    thread::spawn(move || {
        let _entered = span.enter();
        for chunk in rx {
            if let Err(e) = stdin.write_all(&chunk) {
                debug!(error = %e, "child stdin closed; discarding input");
                return;
            }
        }
    });
    tx
}

fn spawn_watchdog(limit: Duration, terminator: Terminator) -> (mpsc::Sender<()>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<()>();
    let span = Span::current();
    let handle = thread::spawn(move || {
        let _entered = span.enter();
        if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(limit) {
            warn!(timeout = %humantime::format_duration(limit), "exec timeout reached; terminating child");
            terminator.terminate();
        }
    });
    (tx, handle)
}
