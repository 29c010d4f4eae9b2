//! Execution of external tools with a hard timeout.
//!
//! Every tool is spawned with piped stdio; stdin, stdout and stderr are
//! pumped by scoped threads while the calling thread polls the child until it
//! exits or the deadline passes. A child running past the deadline is killed.
//!
//! Work done in process, like writing a tarball or copying to a mounted
//! remote, is bounded with [bounded] instead.

use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::backends::AdapterError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Run `command` and return its trimmed stdout.
pub fn run(command: &mut Command, timeout: Duration) -> Result<String, AdapterError> {
    let mut stdout = Vec::new();
    run_with_io(command, timeout, None, &mut stdout)?;
    Ok(String::from_utf8_lossy(&stdout).trim_end().to_string())
}

/// Run `command`, feeding it `stdin` and copying its stdout into `stdout`.
pub fn run_with_io(
    command: &mut Command,
    timeout: Duration,
    stdin: Option<&mut (dyn Read + Send)>,
    stdout: &mut (dyn Write + Send),
) -> Result<(), AdapterError> {
    let tool = tool_name(command);
    log::trace!(target: "process", "Running: {command:?}");

    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => AdapterError::Unavailable {
            tool: tool.clone(),
            reason: e.to_string(),
        },
        _ => AdapterError::Io(e),
    })?;

    let child_stdin = child.stdin.take();
    let child_stdout = child.stdout.take();
    let child_stderr = child.stderr.take();

    let (status, fed, copied, stderr) = thread::scope(|s| {
        let feeder = s.spawn(move || -> io::Result<u64> {
            match (stdin, child_stdin) {
                // the child's stdin closes once `pipe` is dropped
                (Some(source), Some(mut pipe)) => io::copy(source, &mut pipe),
                _ => Ok(0),
            }
        });
        let reader = s.spawn(move || -> io::Result<u64> {
            match child_stdout {
                Some(mut pipe) => io::copy(&mut pipe, stdout),
                None => Ok(0),
            }
        });
        let errors = s.spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut pipe) = child_stderr {
                let _ = pipe.read_to_end(&mut buf);
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        // no deadline if it lies beyond what the clock can represent
        let status = wait_until(&mut child, Instant::now().checked_add(timeout));

        let fed = feeder
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("stdin feeder panicked")));
        let copied = reader
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("stdout reader panicked")));
        let stderr = errors.join().unwrap_or_default();
        (status, fed, copied, stderr)
    });

    let Some(status) = status? else {
        log::warn!(target: "process", "{tool} killed after {}s", timeout.as_secs());
        return Err(AdapterError::Timeout { tool, timeout });
    };

    let stderr = stderr.trim();
    if !status.success() {
        let message = if stderr.is_empty() {
            status.to_string()
        } else {
            stderr.to_string()
        };
        return Err(AdapterError::Failed {
            tool,
            message,
            code: status.code(),
        });
    }

    // relay stderr
    if !stderr.is_empty() {
        log::warn!(target: "process", "{tool}: {stderr}");
    }

    copied?;
    fed?;
    Ok(())
}

/// Wait for `child` to exit, killing it once `deadline` passed.
///
/// Returns `None` if the child had to be killed.
fn wait_until(child: &mut Child, deadline: Option<Instant>) -> io::Result<Option<ExitStatus>> {
    let Some(deadline) = deadline else {
        return child.wait().map(Some);
    };
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run `work` on a helper thread and give up on it after `timeout`.
///
/// A thread that timed out can't be stopped; it keeps running detached and
/// its result is dropped. Callers must only promote its output on success.
pub fn bounded<T, F>(tool: &str, timeout: Duration, work: F) -> Result<T, AdapterError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AdapterError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("{tool}-worker"))
        .spawn(move || {
            // the receiver is gone if we timed out
            let _ = tx.send(work());
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            log::warn!(target: "process", "{tool} abandoned after {}s", timeout.as_secs());
            Err(AdapterError::Timeout {
                tool: tool.to_string(),
                timeout,
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(AdapterError::failed(tool, "worker thread panicked")),
    }
}

fn tool_name(command: &Command) -> String {
    let program = command.get_program();
    Path::new(program)
        .file_name()
        .unwrap_or(program)
        .to_string_lossy()
        .into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let out = run(
            Command::new("sh").args(["-c", "echo hello"]),
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn feeds_stdin() {
        let mut input: &[u8] = b"piped through cat";
        let mut output = Vec::new();
        run_with_io(
            &mut Command::new("cat"),
            Duration::from_secs(10),
            Some(&mut input),
            &mut output,
        )
        .unwrap();
        assert_eq!(output, b"piped through cat");
    }

    #[test]
    fn kills_tool_after_timeout() {
        let started = Instant::now();
        let err = run(
            Command::new("sh").args(["-c", "exec sleep 10"]),
            Duration::from_millis(200),
        )
        .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { ref tool, .. } if tool == "sh"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn reports_stderr_of_failing_tool() {
        let err = run(
            Command::new("sh").args(["-c", "echo broken >&2; exit 3"]),
            Duration::from_secs(10),
        )
        .unwrap_err();
        match err {
            AdapterError::Failed { tool, message, code } => {
                assert_eq!(tool, "sh");
                assert_eq!(message, "broken");
                assert_eq!(code, Some(3));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_tool_is_unavailable() {
        let err = run(
            &mut Command::new("/nonexistent/hosting-backup-tool"),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, AdapterError::Unavailable { .. }));
    }

    #[test]
    fn keeps_non_utf8_stderr() {
        let err = run(
            Command::new("sh").args(["-c", r"printf 'Fehler \374ber Tabelle\n' >&2; exit 1"]),
            Duration::from_secs(10),
        )
        .unwrap_err();
        match err {
            AdapterError::Failed { message, .. } => {
                assert!(message.starts_with("Fehler "), "{message}");
                assert!(message.ends_with("ber Tabelle"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn huge_timeout_means_no_deadline() {
        let out = run(
            Command::new("sh").args(["-c", "echo done"]),
            Duration::from_secs(u64::MAX),
        )
        .unwrap();
        assert_eq!(out, "done");
    }

    #[test]
    fn bounded_returns_result_of_quick_work() {
        let value = bounded("copy", Duration::from_secs(10), || Ok(42)).unwrap();
        assert_eq!(value, 42);

        let err = bounded::<(), _>("copy", Duration::from_secs(10), || {
            Err(AdapterError::failed("copy", "disk full"))
        })
        .unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn bounded_gives_up_on_hanging_work() {
        let started = Instant::now();
        let err = bounded("copy", Duration::from_millis(100), || {
            thread::sleep(Duration::from_secs(5));
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout { ref tool, .. } if tool == "copy"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
