//! Child-process execution with an output cap and a cancellable deadline.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use opsgate_contracts::{
    cancel::Budget,
    error::{OpsError, OpsResult},
};

/// How often a running child is checked against its budget.
const POLL_SLICE: Duration = Duration::from_millis(200);

/// One process to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment on top of the inherited one.
    pub env: Vec<(String, String)>,
    /// argv run once if the process has to be aborted, e.g.
    /// `docker rm -f <name>` for a container.
    pub cleanup: Option<Vec<String>>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            cleanup: None,
        }
    }
}

/// What a finished process produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Interleaved stdout and stderr, up to the cap.
    pub output: Vec<u8>,
    /// Whether output beyond the cap was discarded.
    pub truncated: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Spawns processes. Injected into the sandbox so tests never need real
/// binaries.
pub trait ProcessRunner: Send + Sync {
    /// Run `spec` to completion within `budget`, keeping at most
    /// `max_output` bytes of output (0 keeps everything).
    fn run(&self, spec: &ProcessSpec, budget: &Budget, max_output: usize) -> OpsResult<ProcessOutput>;
}

/// Runs processes on the host with `std::process`.
///
/// On unix each child leads its own process group, so an abort also kills
/// anything it forked into the background.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProcessRunner;

#[derive(Default)]
struct Capture {
    buf: Vec<u8>,
    truncated: bool,
}

/// Drain `source` into `capture`, then signal `done`.
fn spawn_reader<R: Read + Send + 'static>(
    mut source: R,
    capture: Arc<Mutex<Capture>>,
    max_output: usize,
    done: Sender<()>,
) {
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match source.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let Ok(mut c) = capture.lock() else { break };
                    let room = if max_output == 0 {
                        n
                    } else {
                        max_output.saturating_sub(c.buf.len()).min(n)
                    };
                    c.buf.extend_from_slice(&chunk[..room]);
                    if room < n {
                        c.truncated = true;
                    }
                }
            }
        }
        let _ = done.send(());
    });
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let group = Pid::from_raw(child.id() as i32);
    if killpg(group, Signal::SIGKILL).is_err() {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

impl HostProcessRunner {
    fn abort(child: &mut Child, spec: &ProcessSpec) {
        kill_tree(child);
        let _ = child.wait();
        if let Some(cleanup) = &spec.cleanup {
            if let Some((program, args)) = cleanup.split_first() {
                let status = Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
                debug!(program = %program, ok = status.map(|s| s.success()).unwrap_or(false), "cleanup after abort");
            }
        }
    }
}

impl ProcessRunner for HostProcessRunner {
    fn run(&self, spec: &ProcessSpec, budget: &Budget, max_output: usize) -> OpsResult<ProcessOutput> {
        budget.check()?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command.spawn().map_err(|e| OpsError::ToolFailed {
            tool: spec.program.clone(),
            reason: format!("failed to spawn: {e}"),
        })?;

        let capture = Arc::new(Mutex::new(Capture::default()));
        let (done_tx, done_rx) = mpsc::channel();
        let mut pending = 0;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, capture.clone(), max_output, done_tx.clone());
            pending += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, capture.clone(), max_output, done_tx.clone());
            pending += 1;
        }
        drop(done_tx);

        let status = loop {
            let slice = budget.remaining().min(POLL_SLICE);
            let waited = child.wait_timeout(slice).map_err(|e| OpsError::ToolFailed {
                tool: spec.program.clone(),
                reason: format!("failed to wait: {e}"),
            })?;
            if let Some(status) = waited {
                break status;
            }
            if let Err(e) = budget.check() {
                warn!(program = %spec.program, error = %e, "aborting process");
                // Readers finish on their own once every pipe writer is gone.
                Self::abort(&mut child, spec);
                return Err(e);
            }
        };

        // Background descendants can keep the pipes open after the child exits.
        while pending > 0 {
            match done_rx.recv_timeout(budget.remaining().min(POLL_SLICE)) {
                Ok(()) => pending -= 1,
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = budget.check() {
                        warn!(program = %spec.program, error = %e, "descendants still hold output; killing process group");
                        Self::abort(&mut child, spec);
                        return Err(e);
                    }
                }
            }
        }
        let captured = capture
            .lock()
            .map(|mut c| (std::mem::take(&mut c.buf), c.truncated))
            .unwrap_or_default();

        Ok(ProcessOutput {
            exit_code: status.code(),
            output: captured.0,
            truncated: captured.1,
        })
    }
}
