//! Running untrusted bot programs under a deadline and resource limits.
//!
//! Two isolation backends exist: a bare process (cgroup limits, no network namespace) and a
//! container runtime. [`SandboxRunner`] picks between them per invocation.

pub mod cgroup;
pub mod container;
pub mod process;
pub mod runner;
pub mod session;

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;

use crate::engine::ruleset::Ruleset;
use crate::error::SandboxError;

pub use container::ContainerBackend;
pub use process::ProcessBackend;
pub use runner::SandboxRunner;
pub use session::PipeSession;

/// Bytes of stdout/stderr kept per invocation; the rest is discarded.
pub const MAX_CAPTURE_BYTES: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Process,
    Container,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Process => "process",
            StrategyKind::Container => "container",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bot: a directory of files and the command that runs it from inside that directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotProgram {
    pub name: String,
    pub dir: PathBuf,
    pub command: Vec<String>,
}

impl BotProgram {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, command: &str) -> Self {
        BotProgram {
            name: name.into(),
            dir: dir.into(),
            command: command.split_whitespace().map(String::from).collect(),
        }
    }

    /// The first command argument naming a file in the bot directory (`bot.py` in
    /// `python3 bot.py`), if any.
    pub fn entry_file(&self) -> Option<&str> {
        self.command
            .iter()
            .skip(1)
            .map(String::as_str)
            .find(|arg| !arg.starts_with('-') && self.dir.join(arg).is_file())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids: u32,
}

impl From<&Ruleset> for ResourceLimits {
    fn from(ruleset: &Ruleset) -> Self {
        ResourceLimits {
            memory_mb: ruleset.memory_mb,
            cpus: ruleset.cpus,
            pids: ruleset.pids,
        }
    }
}

/// What one invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct BotOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub strategy: StrategyKind,
    pub elapsed: Duration,
}

/// One way of running a bot.
pub trait IsolationBackend: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Start the bot, feed it `input`, and collect its output within `deadline`.
    fn run<'a>(
        &'a self,
        program: &'a BotProgram,
        input: &'a str,
        deadline: Duration,
        limits: &'a ResourceLimits,
    ) -> BoxFuture<'a, Result<BotOutput, SandboxError>>;

    /// Start a long-lived bot that answers one line per turn.
    fn open_session<'a>(
        &'a self,
        program: &'a BotProgram,
        limits: &'a ResourceLimits,
    ) -> BoxFuture<'a, Result<Box<dyn BotSession>, SandboxError>>;

    /// Called when a session attempt failed. Returns true if the backend changed how it
    /// delivers `program` and the attempt is worth repeating once.
    fn fall_back_after(&self, _program: &BotProgram, _error: &SandboxError) -> bool {
        false
    }
}

/// A bot process kept alive across turns.
pub trait BotSession: Send {
    fn strategy(&self) -> StrategyKind;

    /// Write `input` and wait up to `deadline` for one non-empty output line.
    fn exchange<'a>(
        &'a mut self,
        input: &'a str,
        deadline: Duration,
    ) -> BoxFuture<'a, Result<BotOutput, SandboxError>>;

    /// Kill the bot and release whatever holds it.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Raw result of a child that ran to completion.
pub(crate) struct Completed {
    pub stdout: String,
    pub stderr: String,
    pub status: ExitStatus,
}

/// Feed `input` to a spawned child and collect everything it writes until it exits.
/// Returns `Ok(None)` if `deadline` passes first; the child is killed in that case.
pub(crate) async fn communicate(
    child: &mut Child,
    input: &str,
    deadline: Duration,
) -> std::io::Result<Option<Completed>> {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let io = async {
        if let Some(mut stdin) = stdin {
            // A bot that exits without reading its input is not an error here.
            let _ = stdin.write_all(input.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }
        let (out, err, status) = tokio::join!(drain(stdout), drain(stderr), child.wait());
        Ok::<_, std::io::Error>(Completed {
            stdout: out?,
            stderr: err?,
            status: status?,
        })
    };

    let finished = tokio::time::timeout(deadline, io).await;
    match finished {
        Ok(done) => done.map(Some),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(None)
        }
    }
}

/// Read a pipe to EOF, keeping at most [`MAX_CAPTURE_BYTES`].
pub(crate) async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = MAX_CAPTURE_BYTES.saturating_sub(kept.len());
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok(String::from_utf8_lossy(&kept).into_owned())
}

/// Decide whether a finished one-shot run produced usable output.
///
/// A nonzero exit still counts if the bot printed a command line; the exit code is then
/// appended to stderr. No output plus a failing exit is a crash.
pub(crate) fn accept_output(
    strategy: StrategyKind,
    done: Completed,
    elapsed: Duration,
) -> Result<BotOutput, SandboxError> {
    let code = done.status.code();
    let has_line = done.stdout.lines().any(|l| !l.trim().is_empty());

    if done.status.success() || has_line {
        let mut stderr = done.stderr;
        if !done.status.success() {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("exited with {}", describe_status(code)));
        }
        return Ok(BotOutput {
            stdout: done.stdout,
            stderr,
            exit_code: code,
            strategy,
            elapsed,
        });
    }

    Err(SandboxError::Crash {
        strategy,
        code,
        stderr: tail(&done.stderr, 2048),
    })
}

pub(crate) fn describe_status(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "signal".to_string(),
    }
}

/// Last `max` bytes of `text`, cut on a char boundary.
pub(crate) fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Canonical absolute path of a bot directory, for mounts and cache keys.
pub(crate) fn absolute_dir(dir: &Path) -> PathBuf {
    std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_display() {
        assert_eq!(StrategyKind::Process.to_string(), "process");
        assert_eq!(
            serde_json::to_value(StrategyKind::Container).unwrap(),
            "container"
        );
    }

    #[test]
    fn test_bot_program_entry_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bot.py"), "print('MOVE 0 1 1')").unwrap();
        let bot = BotProgram::new("p", dir.path(), "python3 -u bot.py");
        assert_eq!(bot.command, vec!["python3", "-u", "bot.py"]);
        assert_eq!(bot.entry_file(), Some("bot.py"));

        let bare = BotProgram::new("p", dir.path(), "./run");
        assert_eq!(bare.entry_file(), None);
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        assert_eq!(tail("héllo", 4), "llo");
    }

    #[test]
    fn test_limits_from_ruleset() {
        let limits = ResourceLimits::from(&Ruleset::default());
        assert_eq!(limits.memory_mb, 64);
        assert_eq!(limits.pids, 64);
    }
}
