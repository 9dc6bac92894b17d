// Bare-process backend: the bot runs on the host inside a cgroup, optionally in fresh
// network and mount namespaces via `unshare`, with its directory bound read-only, a scratch
// HOME/TMPDIR and a cleared environment.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;

use super::cgroup::CgroupGuard;
use super::session::{Cleanup, PipeSession};
use super::{
    absolute_dir, accept_output, communicate, BotOutput, BotProgram, BotSession,
    IsolationBackend, ResourceLimits, StrategyKind,
};
use crate::config::SandboxConfig;
use crate::error::SandboxError;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Rebinds `$0` read-only inside the new mount namespace, then runs the bot from it.
const READ_ONLY_LAUNCH: &str =
    r#"mount --bind "$0" "$0" && mount -o remount,bind,ro "$0" && cd "$0" && exec "$@""#;

pub struct ProcessBackend {
    config: SandboxConfig,
    netns: OnceCell<bool>,
    read_only: OnceCell<bool>,
    warned_uncontained: AtomicBool,
}

fn unavailable(reason: impl Into<String>) -> SandboxError {
    SandboxError::Unavailable {
        strategy: StrategyKind::Process,
        reason: reason.into(),
    }
}

impl ProcessBackend {
    pub fn new(config: SandboxConfig) -> Self {
        ProcessBackend {
            config,
            netns: OnceCell::new(),
            read_only: OnceCell::new(),
            warned_uncontained: AtomicBool::new(false),
        }
    }

    /// Whether `unshare -rn` works here. Probed once.
    async fn netns_available(&self) -> bool {
        *self
            .netns
            .get_or_init(|| async {
                let probe = Command::new("unshare")
                    .args(["-rn", "true"])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status();
                match tokio::time::timeout(Duration::from_secs(2), probe).await {
                    Ok(Ok(status)) => status.success(),
                    _ => false,
                }
            })
            .await
    }

    /// Whether a mount namespace can rebind a directory read-only. Probed once.
    async fn read_only_available(&self) -> bool {
        *self
            .read_only
            .get_or_init(|| async {
                let Ok(dir) = tempfile::tempdir() else {
                    return false;
                };
                let probe = Command::new("unshare")
                    .args(["-rnm", "--", "sh", "-c", READ_ONLY_LAUNCH])
                    .arg(dir.path())
                    .arg("true")
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status();
                match tokio::time::timeout(Duration::from_secs(2), probe).await {
                    Ok(Ok(status)) => status.success(),
                    _ => false,
                }
            })
            .await
    }

    fn warn_uncontained(&self, reason: &str) {
        if !self.warned_uncontained.swap(true, Ordering::Relaxed) {
            tracing::warn!(reason, "running bot processes without full containment");
        }
    }

    fn scratch_dir(&self) -> Result<TempDir, SandboxError> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("pac-arena-");
            b
        };
        let scratch = match &self.config.scratch_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        };
        scratch.map_err(|e| unavailable(format!("could not create scratch dir: {e}")))
    }

    async fn command(&self, program: &BotProgram, scratch: &Path) -> Result<Command, SandboxError> {
        let (bin, args) = program
            .command
            .split_first()
            .ok_or_else(|| unavailable(format!("bot '{}' has an empty command", program.name)))?;

        let dir = absolute_dir(&program.dir);
        let mut cmd = if self.config.process_netns && self.netns_available().await {
            let mut cmd = Command::new("unshare");
            if self.read_only_available().await {
                cmd.args(["-rnm", "--", "sh", "-c", READ_ONLY_LAUNCH]).arg(&dir);
            } else {
                self.warn_uncontained("bot directory cannot be made read-only");
                cmd.args(["-rn", "--"]);
            }
            cmd.arg(bin).args(args);
            cmd
        } else {
            if self.config.process_netns {
                if !self.config.allow_uncontained {
                    return Err(unavailable("network namespace unavailable ('unshare -rn' failed)"));
                }
                self.warn_uncontained("network namespace unavailable");
            }
            let mut cmd = Command::new(bin);
            cmd.args(args);
            cmd
        };

        cmd.current_dir(&dir)
            .env_clear()
            .env(
                "PATH",
                std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
            )
            .env("HOME", scratch)
            .env("TMPDIR", scratch)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn spawn(
        &self,
        program: &BotProgram,
        limits: &ResourceLimits,
    ) -> Result<(Child, Option<CgroupGuard>, TempDir), SandboxError> {
        let scratch = self.scratch_dir()?;
        let mut child = self
            .command(program, scratch.path())
            .await?
            .spawn()
            .map_err(|e| {
                unavailable(format!("could not start '{}': {e}", program.command.join(" ")))
            })?;
        let guard = match self.contain(&child, limits) {
            Ok(guard) => guard,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };
        Ok((child, guard, scratch))
    }

    /// Put the child into a fresh cgroup with the match's limits.
    fn contain(
        &self,
        child: &Child,
        limits: &ResourceLimits,
    ) -> Result<Option<CgroupGuard>, SandboxError> {
        let Some(pid) = child.id() else {
            // Already exited; nothing left to limit.
            return Ok(None);
        };
        let contained = CgroupGuard::create(limits).and_then(|guard| {
            guard.add(pid)?;
            Ok(guard)
        });
        match contained {
            Ok(guard) => Ok(Some(guard)),
            Err(reason) if self.config.allow_uncontained => {
                self.warn_uncontained(&reason);
                Ok(None)
            }
            Err(reason) => Err(unavailable(reason)),
        }
    }

    async fn run_once(
        &self,
        program: &BotProgram,
        input: &str,
        deadline: Duration,
        limits: &ResourceLimits,
    ) -> Result<BotOutput, SandboxError> {
        let started = Instant::now();
        let (mut child, mut guard, _scratch) = self.spawn(program, limits).await?;

        let finished = communicate(&mut child, input, deadline).await;
        if let Some(guard) = guard.as_mut() {
            guard.release();
        }

        match finished.map_err(|e| unavailable(format!("pipe error: {e}")))? {
            Some(done) => accept_output(StrategyKind::Process, done, started.elapsed()),
            None => {
                tracing::debug!(bot = %program.name, ?deadline, "bot process timed out");
                Err(SandboxError::Timeout {
                    strategy: StrategyKind::Process,
                    deadline,
                })
            }
        }
    }
}

impl IsolationBackend for ProcessBackend {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Process
    }

    fn run<'a>(
        &'a self,
        program: &'a BotProgram,
        input: &'a str,
        deadline: Duration,
        limits: &'a ResourceLimits,
    ) -> BoxFuture<'a, Result<BotOutput, SandboxError>> {
        Box::pin(self.run_once(program, input, deadline, limits))
    }

    fn open_session<'a>(
        &'a self,
        program: &'a BotProgram,
        limits: &'a ResourceLimits,
    ) -> BoxFuture<'a, Result<Box<dyn BotSession>, SandboxError>> {
        Box::pin(async move {
            let (child, guard, scratch) = self.spawn(program, limits).await?;
            let cleanup = match guard {
                Some(guard) => Cleanup::Cgroup(guard),
                None => Cleanup::Nothing,
            };
            let session = PipeSession::new(StrategyKind::Process, child, cleanup, Some(scratch))
                .map_err(|e| unavailable(format!("could not attach to bot pipes: {e}")))?;
            Ok(Box::new(session) as Box<dyn BotSession>)
        })
    }
}
