//! Child process plumbing for the Git executor.
//!
//! The child is placed in its own process group before exec so that a
//! timeout kills the whole pipeline. stdout and stderr are drained by two
//! scoped threads; draining them sequentially would deadlock as soon as the
//! child fills the other pipe's buffer. A watcher thread-loop enforces the
//! per-read gap and the total deadline through a channel of drain events.
use std::io::{self, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use super::Stdin;

const READ_BUFFER: usize = 8 * 1024;
const STDERR_TAIL: usize = 8 * 1024;
/// Poll interval while waiting for an already-silent child to exit.
const REAP_INTERVAL: Duration = Duration::from_millis(10);

static INIT: Once = Once::new();

/// Process-wide initialization: ignore `SIGPIPE` so broken pipes surface as
/// write errors instead of killing the service.
pub(super) fn init() {
    INIT.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

pub(super) struct Request<'a> {
    pub binary: &'a Path,
    pub args: &'a [String],
    pub cwd: Option<&'a Path>,
    pub env: Vec<(String, String)>,
    pub stdin: Stdin,
    pub timeout: Duration,
    pub write_timeout: Duration,
    pub max_output: u64,
    pub address_space: Option<u64>,
}

pub(super) struct Completed {
    pub exit_code: i32,
    pub stderr_tail: Vec<u8>,
}

pub(super) enum FaultKind {
    Spawn(io::Error),
    Timeout,
    OutputTooLarge,
    Io(io::Error),
}

pub(super) struct Fault {
    pub kind: FaultKind,
    pub exit_code: Option<i32>,
    pub stderr_tail: Vec<u8>,
}

enum Event {
    /// A chunk was read and written to its sink.
    Progress,
    /// A stream exceeded the cumulative output cap.
    Overflow,
    /// Reading from the child or writing to a sink failed.
    Failed(io::Error),
    /// A stream reached end-of-file.
    Done,
}

pub(super) fn run(
    request: Request,
    out: &mut (dyn Write + Send),
    err: &mut (dyn Write + Send),
) -> Result<Completed, Fault> {
    init();

    let mut cmd = Command::new(request.binary);
    cmd.args(request.args)
        .env_clear()
        .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if matches!(request.stdin, Stdin::Null) {
            Stdio::null()
        } else {
            Stdio::piped()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = request.cwd {
        cmd.current_dir(cwd);
    }
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    if let Some(limit) = request.address_space {
        unsafe {
            cmd.pre_exec(move || {
                let rlim = libc::rlimit {
                    rlim_cur: limit,
                    rlim_max: limit,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &rlim) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|e| Fault {
        kind: FaultKind::Spawn(e),
        exit_code: None,
        stderr_tail: Vec::new(),
    })?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take().unwrap();
    let stderr = child.stderr.take().unwrap();
    let deadline = Instant::now() + request.timeout;
    let tail = Mutex::new(Vec::new());
    let (events, drained) = chan::unbounded();
    let mut fault_kind: Option<FaultKind> = None;

    thread::scope(|s| {
        if let Some(mut sink) = stdin {
            let source = request.stdin;
            s.spawn(move || {
                let result = match source {
                    Stdin::Null => Ok(0),
                    Stdin::Bytes(bytes) => sink.write_all(&bytes).map(|()| bytes.len() as u64),
                    Stdin::Reader(mut reader) => io::copy(&mut reader, &mut sink),
                };
                if let Err(e) = result {
                    // Normal when the child exits before consuming its input.
                    log::trace!(target: "git", "Child stdin write ended early: {e}");
                }
            });
        }

        let stdout_events = events.clone();
        s.spawn(move || drain(stdout, out, request.max_output, &stdout_events, None));
        let stderr_events = events.clone();
        let stderr_tail = &tail;
        s.spawn(move || {
            drain(
                stderr,
                err,
                request.max_output,
                &stderr_events,
                Some(stderr_tail),
            )
        });
        drop(events);

        let mut active = 2;
        while active > 0 {
            let now = Instant::now();
            if now >= deadline {
                fault_kind = Some(FaultKind::Timeout);
                break;
            }
            match drained.recv_timeout(request.write_timeout.min(deadline - now)) {
                Ok(Event::Progress) => {}
                Ok(Event::Done) => active -= 1,
                Ok(Event::Overflow) => {
                    fault_kind = Some(FaultKind::OutputTooLarge);
                    break;
                }
                Ok(Event::Failed(e)) => {
                    fault_kind = Some(FaultKind::Io(e));
                    break;
                }
                Err(chan::RecvTimeoutError::Timeout) => {
                    fault_kind = Some(FaultKind::Timeout);
                    break;
                }
                Err(chan::RecvTimeoutError::Disconnected) => break,
            }
        }
        if fault_kind.is_some() {
            kill_group(&mut child);
        }
    });

    let stderr_tail = std::mem::take(&mut *tail.lock().expect("git: stderr tail poisoned"));

    if let Some(kind) = fault_kind {
        // The group was killed; reap without blocking forever.
        let exit_code = child.wait().ok().map(status_code);
        return Err(Fault {
            kind,
            exit_code,
            stderr_tail,
        });
    }

    // Streams are closed; give the child until the deadline to exit.
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(Completed {
                    exit_code: status_code(status),
                    stderr_tail,
                })
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    kill_group(&mut child);
                    let exit_code = child.wait().ok().map(status_code);
                    return Err(Fault {
                        kind: FaultKind::Timeout,
                        exit_code,
                        stderr_tail,
                    });
                }
                thread::sleep(REAP_INTERVAL);
            }
            Err(e) => {
                kill_group(&mut child);
                return Err(Fault {
                    kind: FaultKind::Io(e),
                    exit_code: None,
                    stderr_tail,
                });
            }
        }
    }
}

fn drain(
    mut src: impl Read,
    sink: &mut (dyn Write + Send),
    cap: u64,
    events: &chan::Sender<Event>,
    tail: Option<&Mutex<Vec<u8>>>,
) {
    let mut buf = [0u8; READ_BUFFER];
    let mut total: u64 = 0;
    loop {
        match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                if total > cap {
                    events.send(Event::Overflow).ok();
                    return;
                }
                if let Some(tail) = tail {
                    let mut tail = tail.lock().expect("git: stderr tail poisoned");
                    tail.extend_from_slice(&buf[..n]);
                    let excess = tail.len().saturating_sub(STDERR_TAIL);
                    if excess > 0 {
                        tail.drain(..excess);
                    }
                }
                if let Err(e) = sink.write_all(&buf[..n]) {
                    events.send(Event::Failed(e)).ok();
                    return;
                }
                events.send(Event::Progress).ok();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                events.send(Event::Failed(e)).ok();
                return;
            }
        }
    }
    events.send(Event::Done).ok();
}

/// Kill the child's whole process group, then the child directly in case
/// the group signal raced the exec.
fn kill_group(child: &mut Child) {
    let pid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
    child.kill().ok();
}

fn status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}
