//! Child processes with a wall-clock deadline and bounded captured output.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::EngineError;

/// How long to wait for output readers once a timed-out child is killed.
const READER_GRACE: Duration = Duration::from_secs(1);

type Captured = Result<(Vec<u8>, usize)>;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Human-readable log of both streams, with truncation notices.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }

    /// Last `max_bytes` of stderr (or stdout when stderr is empty), for
    /// one-line failure details.
    pub fn tail(&self, max_bytes: usize) -> String {
        let stream = if self.stderr.iter().all(u8::is_ascii_whitespace) {
            &self.stdout
        } else {
            &self.stderr
        };
        let text = String::from_utf8_lossy(stream);
        let text = text.trim();
        if text.len() <= max_bytes {
            return text.to_string();
        }
        let mut start = text.len() - max_bytes;
        while !text.is_char_boundary(start) {
            start += 1;
        }
        format!("...{}", &text[start..])
    }
}

/// Run `cmd` until it exits or `timeout` elapses, killing it on expiry.
///
/// The child leads its own process group and expiry kills the whole group,
/// so shells and task runners cannot leave grandchildren behind. Stdin is fed
/// and both pipes are drained on helper threads, which keeps the deadline
/// check independent of how the child uses its pipes. At most
/// `output_limit_bytes` per stream are kept in memory. If `tee_path` is set,
/// stdout lines are also written there as they arrive.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, tee = tee_path.is_some()))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    tee_path: Option<&Path>,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let tee = match tee_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create tee dir {}", parent.display()))?;
            }
            let file =
                File::create(path).with_context(|| format!("create tee file {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            return Err(EngineError::Spawn {
                program: cmd.get_program().to_string_lossy().into_owned(),
                source: err,
            }
            .into());
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_rx = spawn_reader(move || read_lines_limited(stdout, output_limit_bytes, tee));
    let stderr_rx = spawn_reader(move || read_limited(stderr, output_limit_bytes));

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // A child that exits without reading stdin closes the pipe; that is
        // reported through its exit status, not here.
        thread::spawn(move || {
            if let Err(err) = child_stdin.write_all(&input) {
                warn!(err = %err, "child closed stdin early");
            }
        });
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            kill_process_group(&mut child)?
        }
    };

    let grace = timed_out.then_some(READER_GRACE);
    let (stdout, stdout_truncated) = collect_output(&stdout_rx, grace).context("join stdout")?;
    let (stderr, stderr_truncated) = collect_output(&stderr_rx, grace).context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Kill the child and everything in its process group, then reap it.
fn kill_process_group(child: &mut Child) -> Result<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let pgid = i32::try_from(child.id()).context("child pid out of range")?;
        if let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            warn!(err = %err, pgid, "failed to kill process group");
        }
    }
    child.kill().context("kill command")?;
    child.wait().context("wait command after kill")
}

fn spawn_reader<F>(read: F) -> Receiver<Captured>
where
    F: FnOnce() -> Captured + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone only if the caller already gave up on us.
        let _ = tx.send(read());
    });
    rx
}

/// Wait for a reader; with `grace`, give up once it elapses.
///
/// A process outside the killed group can still hold the pipe open. Its
/// output is abandoned rather than letting it extend the deadline.
fn collect_output(rx: &Receiver<Captured>, grace: Option<Duration>) -> Captured {
    let Some(grace) = grace else {
        return rx
            .recv()
            .map_err(|_| anyhow!("output reader thread panicked"))?;
    };
    match rx.recv_timeout(grace) {
        Ok(captured) => captured,
        Err(RecvTimeoutError::Timeout) => {
            warn!("output pipe still open after kill, abandoning reader");
            Ok((Vec::new(), 0))
        }
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
    }
}

fn keep_bounded(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) -> usize {
    let keep = chunk.len().min(limit.saturating_sub(buf.len()));
    buf.extend_from_slice(&chunk[..keep]);
    chunk.len() - keep
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    mut tee: Option<BufWriter<File>>,
) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }
        if let Some(writer) = tee.as_mut()
            && let Err(err) = writer.write_all(&line).and_then(|_| writer.flush())
        {
            warn!(err = %err, "failed to write tee file");
            tee = None;
        }
        truncated += keep_bounded(&mut collected, &line, limit);
    }
    Ok((collected, truncated))
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        truncated += keep_bounded(&mut collected, &chunk[..n], limit);
    }
    Ok((collected, truncated))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_output_and_stdin() {
        let output = run_command(
            sh("cat; echo oops >&2"),
            Some(b"hello"),
            Duration::from_secs(10),
            1000,
            None,
        )
        .expect("run");
        assert!(output.success());
        assert_eq!(output.stdout, b"hello");
        assert_eq!(output.tail(100), "oops");
    }

    #[test]
    fn kills_child_on_timeout() {
        let output = run_command(sh("exec sleep 5"), None, Duration::from_millis(100), 1000, None)
            .expect("run");
        assert!(output.timed_out);
        assert!(!output.success());
        assert!(output.render_log("gate").contains("[gate timed out]"));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let started = Instant::now();
        let output = run_command(
            sh("sleep 4; echo late"),
            None,
            Duration::from_millis(200),
            1000,
            None,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "returned after {:?}",
            started.elapsed()
        );
        assert!(!String::from_utf8_lossy(&output.stdout).contains("late"));
    }

    #[test]
    fn unread_stdin_does_not_delay_the_deadline() {
        let prompt = vec![b'x'; 4 * 1024 * 1024];
        let started = Instant::now();
        let output = run_command(
            sh("sleep 4"),
            Some(&prompt),
            Duration::from_millis(200),
            1000,
            None,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn missing_program_is_a_typed_spawn_error() {
        let err = run_command(
            Command::new("plan-runner-no-such-program"),
            None,
            Duration::from_secs(1),
            100,
            None,
        )
        .expect_err("spawn should fail");
        assert!(EngineError::is_spawn(&err));
        assert!(err.to_string().contains("plan-runner-no-such-program"));
    }

    #[test]
    fn bounds_captured_output_and_tees_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tee = temp.path().join("logs").join("out.log");
        let output = run_command(
            sh("printf 'abcdef\\nghij\\n'"),
            None,
            Duration::from_secs(10),
            4,
            Some(&tee),
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 8);
        assert_eq!(std::fs::read_to_string(&tee).expect("tee"), "abcdef\nghij\n");
    }
}
