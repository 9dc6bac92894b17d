// Container backend: every invocation is a throwaway container started through the runtime CLI
// (`docker` by default) with no network, capped memory/cpu/pids, a read-only root and an
// unprivileged user.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::process::Command;
use uuid::Uuid;

use super::session::{Cleanup, PipeSession};
use super::{
    absolute_dir, accept_output, communicate, tail, BotOutput, BotProgram, BotSession,
    Completed, IsolationBackend, ResourceLimits, StrategyKind,
};
use crate::config::SandboxConfig;
use crate::error::SandboxError;

const BOT_MOUNT: &str = "/bot";
const UNPRIVILEGED_USER: &str = "65534:65534";
/// `docker run` exits with this when the daemon itself failed.
const RUNTIME_FAILURE_CODE: i32 = 125;
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

const UNAVAILABLE_PATTERNS: &[&str] = &[
    "cannot connect to the docker daemon",
    "is the docker daemon running",
    "error during connect",
    "error response from daemon",
    "permission denied while trying to connect",
    "pull access denied",
];

const FILE_ACCESS_PATTERNS: &[&str] = &[
    "can't open file",
    "no such file or directory",
    "permission denied",
];

/// How bot files reach the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Read-only bind mount of the bot directory.
    Mount,
    /// Files copied into a created container before it starts.
    Copy,
}

/// Why a container run failed for reasons outside the bot, if it did.
pub(crate) fn unavailable_reason(code: Option<i32>, stderr: &str) -> Option<String> {
    let lower = stderr.to_ascii_lowercase();
    if code == Some(RUNTIME_FAILURE_CODE) || UNAVAILABLE_PATTERNS.iter().any(|p| lower.contains(p))
    {
        let first = stderr.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        return Some(format!("container runtime failed: {}", first.trim()));
    }
    None
}

fn looks_like_file_access_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    FILE_ACCESS_PATTERNS.iter().any(|p| lower.contains(p))
}

fn unavailable(reason: impl Into<String>) -> SandboxError {
    SandboxError::Unavailable {
        strategy: StrategyKind::Container,
        reason: reason.into(),
    }
}

pub struct ContainerBackend {
    config: SandboxConfig,
    delivery: Mutex<HashMap<PathBuf, Delivery>>,
}

impl ContainerBackend {
    pub fn new(config: SandboxConfig) -> Self {
        ContainerBackend {
            config,
            delivery: Mutex::new(HashMap::new()),
        }
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<PathBuf, Delivery>> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn runtime(&self) -> Command {
        let mut cmd = Command::new(&self.config.container_runtime);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Flags shared by every bot container.
    fn isolation_args(&self, name: &str, limits: &ResourceLimits, delivery: Delivery) -> Vec<String> {
        let memory = format!("{}m", limits.memory_mb);
        let mut args = vec![
            "--name".to_string(),
            name.to_string(),
            "--network".to_string(),
            "none".to_string(),
            "--memory".to_string(),
            memory.clone(),
            "--memory-swap".to_string(),
            memory,
            "--cpus".to_string(),
            limits.cpus.to_string(),
            "--pids-limit".to_string(),
            limits.pids.to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--tmpfs".to_string(),
            "/tmp:rw,size=16m".to_string(),
            "--user".to_string(),
            UNPRIVILEGED_USER.to_string(),
            "-w".to_string(),
            BOT_MOUNT.to_string(),
            "-e".to_string(),
            "HOME=/tmp".to_string(),
            "-e".to_string(),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
        ];
        // `docker cp` cannot write into a read-only root; in copy mode the unprivileged user
        // still cannot modify anything outside /tmp.
        if delivery == Delivery::Mount {
            args.push("--read-only".to_string());
        }
        args
    }

    fn mount_arg(dir: &Path) -> String {
        format!("{}:{BOT_MOUNT}:ro", dir.display())
    }

    /// Probe once per bot directory whether a bind mount shows its files inside a container.
    async fn delivery_for(&self, program: &BotProgram) -> Result<Delivery, SandboxError> {
        let dir = absolute_dir(&program.dir);
        if let Some(delivery) = self.cache().get(&dir) {
            return Ok(*delivery);
        }

        let marker = program
            .entry_file()
            .map(String::from)
            .or_else(|| first_file_name(&dir));

        let mut cmd = self.runtime();
        cmd.stdin(Stdio::null()).args([
            "run",
            "--rm",
            "--network",
            "none",
            "-v",
            Self::mount_arg(&dir).as_str(),
            self.config.container_image.as_str(),
            "ls",
            "-la",
            BOT_MOUNT,
        ]);
        let probe_deadline = self.config.container_startup_grace * 4;
        let output = match tokio::time::timeout(probe_deadline, cmd.output()).await {
            Err(_) => return Err(unavailable("visibility probe timed out")),
            Ok(Err(e)) => {
                return Err(unavailable(format!(
                    "could not run '{}': {e}",
                    self.config.container_runtime
                )))
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if let Some(reason) = unavailable_reason(output.status.code(), &stderr) {
            return Err(unavailable(reason));
        }

        let visible = output.status.success()
            && marker.as_deref().map_or(true, |m| stdout.contains(m));
        let delivery = if visible {
            Delivery::Mount
        } else {
            Delivery::Copy
        };
        tracing::info!(dir = %dir.display(), ?delivery, "container file delivery decided");
        self.cache().insert(dir, delivery);
        Ok(delivery)
    }

    /// Create a stopped container and copy the bot files into it.
    async fn prepare_copy(
        &self,
        name: &str,
        program: &BotProgram,
        limits: &ResourceLimits,
        deadline: Duration,
    ) -> Result<(), SandboxError> {
        let dir = absolute_dir(&program.dir);

        let mut create = self.runtime();
        create
            .stdin(Stdio::null())
            .args(["create", "-i"])
            .args(self.isolation_args(name, limits, Delivery::Copy))
            .arg(&self.config.container_image)
            .args(&program.command);
        self.checked(create, deadline, "create").await?;

        let mut copy = self.runtime();
        copy.stdin(Stdio::null())
            .arg("cp")
            .arg(format!("{}/.", dir.display()))
            .arg(format!("{name}:{BOT_MOUNT}"));
        self.checked(copy, deadline, "cp").await
    }

    async fn checked(&self, mut cmd: Command, deadline: Duration, step: &str) -> Result<(), SandboxError> {
        let output = tokio::time::timeout(deadline, cmd.output())
            .await
            .map_err(|_| unavailable(format!("container {step} timed out")))?
            .map_err(|e| unavailable(format!("container {step} failed: {e}")))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(unavailable(format!(
            "container {step} failed: {}",
            tail(stderr.trim(), 512)
        )))
    }

    async fn remove(&self, name: &str) {
        let mut rm = self.runtime();
        rm.stdin(Stdio::null()).args(["rm", "-f", name]);
        match tokio::time::timeout(CLEANUP_TIMEOUT, rm.output()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(container = name, error = %e, "could not remove bot container"),
            Err(_) => tracing::warn!(container = name, "removing bot container timed out"),
        }
    }

    /// Start the bot container and talk to it until it exits or the deadline passes.
    async fn run_with(
        &self,
        delivery: Delivery,
        program: &BotProgram,
        input: &str,
        deadline: Duration,
        limits: &ResourceLimits,
    ) -> Result<BotOutput, SandboxError> {
        let started = Instant::now();
        let name = container_name();

        let mut cmd = self.runtime();
        match delivery {
            Delivery::Mount => {
                cmd.args(["run", "--rm", "-i"])
                    .args(self.isolation_args(&name, limits, delivery))
                    .arg("-v")
                    .arg(Self::mount_arg(&absolute_dir(&program.dir)))
                    .arg(&self.config.container_image)
                    .args(&program.command);
            }
            Delivery::Copy => {
                if let Err(e) = self.prepare_copy(&name, program, limits, deadline).await {
                    self.remove(&name).await;
                    return Err(e);
                }
                cmd.args(["start", "-a", "-i", name.as_str()]);
            }
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        let finished = match cmd.spawn() {
            Ok(mut child) => communicate(&mut child, input, remaining).await,
            Err(e) => {
                self.remove(&name).await;
                return Err(unavailable(format!(
                    "could not run '{}': {e}",
                    self.config.container_runtime
                )));
            }
        };

        // `--rm` covers the normal exit in mount mode; anything else needs an explicit removal.
        let timed_out = matches!(finished, Ok(None));
        if delivery == Delivery::Copy || timed_out {
            self.remove(&name).await;
        }

        match finished.map_err(|e| unavailable(format!("pipe error: {e}")))? {
            None => Err(SandboxError::Timeout {
                strategy: StrategyKind::Container,
                deadline,
            }),
            Some(done) => self.classify(done, started.elapsed()),
        }
    }

    fn classify(&self, done: Completed, elapsed: Duration) -> Result<BotOutput, SandboxError> {
        let has_output = done.stdout.lines().any(|l| !l.trim().is_empty());
        if !done.status.success() && !has_output {
            if let Some(reason) = unavailable_reason(done.status.code(), &done.stderr) {
                return Err(unavailable(reason));
            }
        }
        accept_output(StrategyKind::Container, done, elapsed)
    }

    async fn run_once(
        &self,
        program: &BotProgram,
        input: &str,
        deadline: Duration,
        limits: &ResourceLimits,
    ) -> Result<BotOutput, SandboxError> {
        let started = Instant::now();
        let delivery = self.delivery_for(program).await?;
        let remaining = deadline.saturating_sub(started.elapsed());
        let result = self.run_with(delivery, program, input, remaining, limits).await;

        match result {
            Err(ref e) if self.switch_to_copy(program, e) => {
                let remaining = deadline.saturating_sub(started.elapsed());
                self.run_with(Delivery::Copy, program, input, remaining, limits)
                    .await
            }
            other => other,
        }
    }

    /// A crash that reads like the bot could not open its own files means the bind mount
    /// is unusable for this directory. Remember copy delivery for it from now on.
    fn switch_to_copy(&self, program: &BotProgram, error: &SandboxError) -> bool {
        let SandboxError::Crash { stderr, .. } = error else {
            return false;
        };
        if !looks_like_file_access_failure(stderr) {
            return false;
        }
        let mut cache = self.cache();
        let delivery = cache
            .entry(absolute_dir(&program.dir))
            .or_insert(Delivery::Mount);
        if *delivery != Delivery::Mount {
            return false;
        }
        *delivery = Delivery::Copy;
        tracing::info!(
            bot = %program.name,
            "bot files not readable through the mount, switching to copy delivery"
        );
        true
    }

    async fn start_session(
        &self,
        program: &BotProgram,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn BotSession>, SandboxError> {
        let delivery = self.delivery_for(program).await?;
        let name = container_name();

        let mut cmd = self.runtime();
        match delivery {
            Delivery::Mount => {
                cmd.args(["run", "--rm", "-i"])
                    .args(self.isolation_args(&name, limits, delivery))
                    .arg("-v")
                    .arg(Self::mount_arg(&absolute_dir(&program.dir)))
                    .arg(&self.config.container_image)
                    .args(&program.command);
            }
            Delivery::Copy => {
                let grace = self.config.container_startup_grace * 4;
                if let Err(e) = self.prepare_copy(&name, program, limits, grace).await {
                    self.remove(&name).await;
                    return Err(e);
                }
                cmd.args(["start", "-a", "-i", name.as_str()]);
            }
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.remove(&name).await;
                return Err(unavailable(format!(
                    "could not run '{}': {e}",
                    self.config.container_runtime
                )));
            }
        };
        let cleanup = Cleanup::Container {
            runtime: self.config.container_runtime.clone(),
            name,
        };
        let session = PipeSession::new(StrategyKind::Container, child, cleanup, None)
            .map_err(|e| unavailable(format!("could not attach to container pipes: {e}")))?;
        Ok(Box::new(session))
    }
}

impl IsolationBackend for ContainerBackend {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Container
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
        Box::pin(self.start_session(program, limits))
    }

    fn fall_back_after(&self, program: &BotProgram, error: &SandboxError) -> bool {
        self.switch_to_copy(program, error)
    }
}

fn container_name() -> String {
    format!("pac-arena-{}", Uuid::new_v4().simple())
}

fn first_file_name(dir: &Path) -> Option<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    names.into_iter().next()
}
