//! Bounded command execution.
//!
//! Spawns a command, captures stdout/stderr, and enforces a deadline.
//! The script variant writes the payload to a temp file first, for
//! commands whose argument would overflow the arg list.

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::process::Command;

#[allow(dead_code)]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2_500);

/// Result of a captured command execution
pub struct CaptureResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CaptureResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `program args..` in `cwd` and capture output, bounded by `timeout`.
pub async fn capture(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> CaptureResult {
    let start = Instant::now();

    let result = tokio::time::timeout(timeout, async {
        Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::null())
            .output()
            .await
    })
    .await;

    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(output)) => CaptureResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            duration_ms,
            timed_out: false,
        },
        Ok(Err(e)) => CaptureResult {
            stdout: String::new(),
            stderr: format!("Failed to execute command: {e}"),
            exit_code: None,
            duration_ms,
            timed_out: false,
        },
        Err(_) => CaptureResult {
            stdout: String::new(),
            stderr: format!("Command timed out after {} ms", timeout.as_millis()),
            exit_code: None,
            duration_ms,
            timed_out: true,
        },
    }
}

/// Run a shell script from a temp file (`sh <file>`), bounded by `timeout`.
/// For payloads that would overflow the arg list.
#[allow(dead_code)]
pub async fn capture_script(script: &str, cwd: &Path, timeout: Duration) -> CaptureResult {
    let file = match tempfile::NamedTempFile::new() {
        Ok(f) => f,
        Err(e) => {
            return CaptureResult {
                stdout: String::new(),
                stderr: format!("Failed to create temp script: {e}"),
                exit_code: None,
                duration_ms: 0,
                timed_out: false,
            }
        }
    };
    if let Err(e) = std::fs::write(file.path(), script) {
        return CaptureResult {
            stdout: String::new(),
            stderr: format!("Failed to write temp script: {e}"),
            exit_code: None,
            duration_ms: 0,
            timed_out: false,
        };
    }

    let path = file.path().to_string_lossy().into_owned();
    capture("sh", &[&path], cwd, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let result = capture(
            "sh",
            &["-c", "printf out; printf err >&2; exit 3"],
            Path::new("/tmp"),
            DEFAULT_TIMEOUT,
        )
        .await;
        assert_eq!(result.stdout, "out");
        assert_eq!(result.stderr, "err");
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.timed_out);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn enforces_timeout() {
        let result = capture(
            "sh",
            &["-c", "sleep 5"],
            Path::new("/tmp"),
            Duration::from_millis(50),
        )
        .await;
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn missing_binary_reports_error() {
        let result = capture(
            "definitely-not-a-binary-fyp",
            &[],
            Path::new("/tmp"),
            DEFAULT_TIMEOUT,
        )
        .await;
        assert_eq!(result.exit_code, None);
        assert!(result.stderr.contains("Failed to execute command"));
    }

    #[tokio::test]
    async fn script_runs_from_temp_file() {
        let result = capture_script("echo from-script", Path::new("/tmp"), DEFAULT_TIMEOUT).await;
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "from-script");
    }
}
