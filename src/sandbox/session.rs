// A bot kept alive for a whole match: one line of input block per turn in, one command line out.

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;

use super::cgroup::CgroupGuard;
use super::container::unavailable_reason;
use super::{tail, BotOutput, BotSession, StrategyKind, MAX_CAPTURE_BYTES};
use crate::error::SandboxError;

const SHUTDOWN_WAIT: Duration = Duration::from_millis(500);

/// What must be torn down besides the child itself.
pub(crate) enum Cleanup {
    Nothing,
    Cgroup(CgroupGuard),
    Container { runtime: String, name: String },
}

/// One read from the bot's stdout.
enum Reply {
    Line(String),
    Eof,
    /// A line longer than [`MAX_CAPTURE_BYTES`]; the rest of it is not read.
    Overlong,
}

pub struct PipeSession {
    strategy: StrategyKind,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr: Arc<Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
    cleanup: Cleanup,
    _scratch: Option<TempDir>,
    closed: bool,
}

impl PipeSession {
    pub(crate) fn new(
        strategy: StrategyKind,
        mut child: Child,
        cleanup: Cleanup,
        scratch: Option<TempDir>,
    ) -> std::io::Result<Self> {
        let missing = |name: &str| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, format!("{name} not piped"))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        // Stderr is drained in the background so a chatty bot never blocks on a full pipe.
        let stderr = Arc::new(Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|mut pipe| {
            let sink = Arc::clone(&stderr);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = pipe.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let mut text = sink.lock().unwrap_or_else(PoisonError::into_inner);
                    if text.len() < MAX_CAPTURE_BYTES {
                        text.push_str(&String::from_utf8_lossy(&buf[..n]));
                    }
                }
            })
        });

        Ok(PipeSession {
            strategy,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            stderr,
            stderr_task,
            cleanup,
            _scratch: scratch,
            closed: false,
        })
    }

    fn take_stderr(&self) -> String {
        std::mem::take(&mut *self.stderr.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn write_and_read(&mut self, input: &str) -> std::io::Result<Reply> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed")
        })?;
        stdin.write_all(input.as_bytes()).await?;
        stdin.flush().await?;
        self.read_reply().await
    }

    /// Next non-empty stdout line, decoded lossily and never longer than
    /// [`MAX_CAPTURE_BYTES`].
    async fn read_reply(&mut self) -> std::io::Result<Reply> {
        let limit = MAX_CAPTURE_BYTES as u64;
        loop {
            let mut buf = Vec::new();
            let n = (&mut self.stdout)
                .take(limit)
                .read_until(b'\n', &mut buf)
                .await?;
            if n == 0 {
                return Ok(Reply::Eof);
            }
            if !buf.ends_with(b"\n") && n as u64 >= limit {
                return Ok(Reply::Overlong);
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if !line.is_empty() {
                return Ok(Reply::Line(line.to_string()));
            }
        }
    }

    /// Why the bot stopped answering, once its process is gone.
    async fn exit_error(&mut self) -> SandboxError {
        let code = match tokio::time::timeout(SHUTDOWN_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => None,
        };
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(SHUTDOWN_WAIT, task).await;
        }
        let stderr = tail(&self.take_stderr(), 2048);
        if self.strategy == StrategyKind::Container {
            if let Some(reason) = unavailable_reason(code, &stderr) {
                return SandboxError::Unavailable {
                    strategy: self.strategy,
                    reason,
                };
            }
        }
        SandboxError::Crash {
            strategy: self.strategy,
            code,
            stderr,
        }
    }

    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stdin = None;
        let _ = self.child.start_kill();
        let _ = tokio::time::timeout(SHUTDOWN_WAIT, self.child.wait()).await;

        match &mut self.cleanup {
            Cleanup::Nothing => {}
            Cleanup::Cgroup(guard) => guard.release(),
            Cleanup::Container { runtime, name } => {
                let rm = tokio::process::Command::new(runtime.as_str())
                    .args(["rm", "-f", name.as_str()])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status();
                if let Err(e) | Ok(Err(e)) = tokio::time::timeout(Duration::from_secs(10), rm)
                    .await
                    .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))
                {
                    tracing::warn!(container = %name, error = %e, "could not remove bot container");
                }
            }
        }
    }
}

impl BotSession for PipeSession {
    fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    fn exchange<'a>(
        &'a mut self,
        input: &'a str,
        deadline: Duration,
    ) -> BoxFuture<'a, Result<BotOutput, SandboxError>> {
        Box::pin(async move {
            if self.closed {
                return Err(SandboxError::Crash {
                    strategy: self.strategy,
                    code: None,
                    stderr: "session already closed".to_string(),
                });
            }
            let started = Instant::now();
            let answered = tokio::time::timeout(deadline, self.write_and_read(input)).await;
            match answered {
                Ok(Ok(Reply::Line(line))) => Ok(BotOutput {
                    stdout: format!("{line}\n"),
                    stderr: self.take_stderr(),
                    exit_code: None,
                    strategy: self.strategy,
                    elapsed: started.elapsed(),
                }),
                Ok(Ok(Reply::Overlong)) => {
                    tracing::warn!(limit = MAX_CAPTURE_BYTES, "bot output line too long");
                    self.shutdown().await;
                    Err(SandboxError::Crash {
                        strategy: self.strategy,
                        code: None,
                        stderr: format!("output line longer than {MAX_CAPTURE_BYTES} bytes"),
                    })
                }
                Ok(Ok(Reply::Eof)) | Ok(Err(_)) => {
                    let err = self.exit_error().await;
                    self.shutdown().await;
                    Err(err)
                }
                Err(_) => {
                    self.shutdown().await;
                    Err(SandboxError::Timeout {
                        strategy: self.strategy,
                        deadline,
                    })
                }
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.shutdown())
    }
}

impl Drop for PipeSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // kill_on_drop takes care of the child and the cgroup guard cleans up after itself.
        if let Cleanup::Container { runtime, name } = &self.cleanup {
            let _ = std::process::Command::new(runtime)
                .args(["rm", "-f", name.as_str()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
        }
    }
}
