//! PTY child transport
//!
//! Spawns an interactive CLI behind a pseudo-terminal and exposes raw
//! output chunks, a blocking writer, resize, and signal delivery. One
//! reader thread per child feeds an unbounded channel; a reaper thread
//! waits for exit and reports the final status exactly once.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Mutex;

use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(String),

    #[error("failed to spawn child: {0}")]
    Spawn(String),

    #[error("pty io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty argv")]
    EmptyArgv,
}

/// Everything needed to spawn one PTY child.
pub struct PtySpawnConfig {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    /// Full child environment (the caller owns merging/scrubbing).
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

/// A running PTY child. Output and exit channels are taken once by the
/// supervisor; writes and resizes go through interior mutability so the
/// session can be shared behind an `Arc`.
pub struct PtySession {
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn std::io::Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    output_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    exit_rx: Mutex<Option<oneshot::Receiver<i32>>>,
}

impl PtySession {
    /// Open a PTY of the requested size and spawn the child inside it.
    pub fn spawn(config: PtySpawnConfig) -> Result<Self, PtyError> {
        let program = config.argv.first().ok_or(PtyError::EmptyArgv)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        for arg in &config.argv[1..] {
            cmd.arg(arg);
        }
        cmd.cwd(&config.cwd);
        cmd.env_clear();
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // The slave end lives on inside the child; dropping our handle lets
        // the reader observe EOF when the child exits.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let (output_tx, output_rx) = mpsc::unbounded_channel();
        spawn_reader_thread(reader, output_tx, pid);

        let (exit_tx, exit_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name(format!("pty-reap-{}", pid.unwrap_or(0)))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        warn!(
                            component = "pty",
                            event = "pty.wait_failed",
                            error = %e,
                            "Failed to reap PTY child"
                        );
                        -1
                    }
                };
                let _ = exit_tx.send(code);
            })
            .map_err(PtyError::Io)?;

        Ok(Self {
            pid,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            output_rx: Mutex::new(Some(output_rx)),
            exit_rx: Mutex::new(Some(exit_rx)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the raw output channel. Returns `None` after the first call.
    pub fn take_output(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.output_rx.lock().expect("output_rx lock poisoned").take()
    }

    /// Take the exit-code channel. Returns `None` after the first call.
    pub fn take_exit(&self) -> Option<oneshot::Receiver<i32>> {
        self.exit_rx.lock().expect("exit_rx lock poisoned").take()
    }

    /// Write bytes to the child's terminal. PTY writes are small and land
    /// in the kernel buffer; callers serialize through their own queue.
    pub fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        writer.write_all(data)?;
        writer.flush()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .lock()
            .expect("master lock poisoned")
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Open(e.to_string()))
    }

    /// Deliver a POSIX signal to the child pid. Errors are reported but
    /// callers treat them as non-fatal (the child may already be gone).
    pub fn signal(&self, signal: i32) -> std::io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    /// Hard-kill the child. Non-fatal on error.
    pub fn kill(&self) {
        if let Err(e) = self.killer.lock().expect("killer lock poisoned").kill() {
            debug!(
                component = "pty",
                event = "pty.kill_failed",
                pid = ?self.pid,
                error = %e,
                "Kill failed (child likely already exited)"
            );
        }
    }
}

fn spawn_reader_thread(
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::UnboundedSender<Bytes>,
    pid: Option<u32>,
) {
    let _ = std::thread::Builder::new()
        .name(format!("pty-read-{}", pid.unwrap_or(0)))
        .spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break; // receiver dropped — session forgotten
                        }
                    }
                    Err(e) => {
                        // EIO is the normal "child closed the slave" path
                        if e.raw_os_error() != Some(libc::EIO) {
                            debug!(
                                component = "pty",
                                event = "pty.read_error",
                                pid = ?pid,
                                error = %e,
                                "PTY read error"
                            );
                        }
                        break;
                    }
                }
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_config(script: &str) -> PtySpawnConfig {
        let mut env = vec![("TERM".into(), "xterm-256color".into())];
        if let Ok(path) = std::env::var("PATH") {
            env.push(("PATH".into(), path));
        }
        PtySpawnConfig {
            argv: vec!["sh".into(), "-c".into(), script.into()],
            cwd: std::env::temp_dir(),
            env,
            cols: 100,
            rows: 30,
        }
    }

    #[tokio::test]
    async fn spawn_captures_output_and_exit() {
        let session = PtySession::spawn(sh_config("printf hello-pty")).expect("spawn");
        let mut output_rx = session.take_output().expect("output channel");
        let exit_rx = session.take_exit().expect("exit channel");

        let mut collected = Vec::new();
        while let Some(chunk) = output_rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("hello-pty"), "got: {text:?}");

        let code = exit_rx.await.expect("exit code");
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn channels_are_taken_once() {
        let session = PtySession::spawn(sh_config("true")).expect("spawn");
        assert!(session.take_output().is_some());
        assert!(session.take_output().is_none());
        assert!(session.take_exit().is_some());
        assert!(session.take_exit().is_none());
    }

    #[tokio::test]
    async fn write_reaches_child() {
        let session = PtySession::spawn(sh_config("read line; printf \"echo:%s\" \"$line\""))
            .expect("spawn");
        let mut output_rx = session.take_output().expect("output channel");

        session.write(b"ping\r").expect("write");

        let mut collected = Vec::new();
        while let Some(chunk) = output_rx.recv().await {
            collected.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&collected).contains("echo:ping") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("echo:ping"));
    }

    #[test]
    fn empty_argv_is_rejected() {
        let err = PtySession::spawn(PtySpawnConfig {
            argv: vec![],
            cwd: std::env::temp_dir(),
            env: vec![],
            cols: 80,
            rows: 24,
        })
        .err()
        .expect("should fail");
        assert!(matches!(err, PtyError::EmptyArgv));
    }
}
