// Runs one child process under a wall-clock limit.
// stdout and stderr are drained on their own threads so a chatty child
// cannot block on a full pipe while we poll it. The child leads its own
// process group, and the whole group is killed once the child is done,
// so nothing it spawned can hold the pipes open past the deadline.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};

use crate::error::ExecutionError;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    Exited {
        success: bool,
        stdout: String,
        stderr: String,
    },
    /// Killed at the deadline. Output is discarded.
    TimedOut,
}

pub fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<ProcessResult, ExecutionError> {
    let program = cmd.get_program().to_string_lossy().into_owned();

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd
        .spawn()
        .map_err(|source| ExecutionError::Spawn { program, source })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let deadline = Instant::now() + timeout;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                terminate(&mut child);
                return Ok(ProcessResult::TimedOut);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                terminate(&mut child);
                return Err(ExecutionError::Wait(e));
            }
        }
    };

    // Background processes left behind by the child would otherwise keep
    // the pipes open.
    kill_group(&child);

    let (Some(stdout), Some(stderr)) = (collect(&stdout, deadline), collect(&stderr, deadline))
    else {
        return Ok(ProcessResult::TimedOut);
    };

    Ok(ProcessResult::Exited {
        success: status.success(),
        stdout,
        stderr,
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<String> {
    let (tx, rx) = bounded(1);
    match pipe {
        Some(mut p) => {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = p.read_to_end(&mut buf);
                let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            });
        }
        None => {
            let _ = tx.send(String::new());
        }
    }
    rx
}

/// `None` when the pipe is still open at the deadline.
fn collect(rx: &Receiver<String>, deadline: Instant) -> Option<String> {
    rx.recv_deadline(deadline).ok()
}

fn terminate(child: &mut Child) {
    kill_group(child);
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    // The child was spawned with process_group(0), so its pid is the pgid.
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_: &Child) {}
