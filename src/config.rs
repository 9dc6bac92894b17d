// Application configuration, loaded from environment variables and CLI flags.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::ruleset::{League, Ruleset};
use crate::error::RulesetError;
use crate::sandbox::BotProgram;

/// Which isolation strategy the sandbox runner may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerMode {
    /// Bare process below the threshold deadline, container (with fallback) above it.
    Auto,
    Process,
    Container,
}

impl FromStr for RunnerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(RunnerMode::Auto),
            "process" => Ok(RunnerMode::Process),
            "container" | "docker" => Ok(RunnerMode::Container),
            other => Err(format!("unknown runner mode '{other}'")),
        }
    }
}

/// Sandbox runner settings.
///
/// Environment variables (all optional):
/// - `PAC_RUNNER_MODE` - `auto`, `process` or `container` (default: `auto`)
/// - `PAC_CONTAINER_IMAGE` - base execution image (default: `python:3.11-slim`)
/// - `PAC_CONTAINER_RUNTIME` - container CLI binary (default: `docker`)
/// - `PAC_AUTO_PROCESS_THRESHOLD_MS` - deadline below which `auto` uses bare processes (default: 200)
/// - `PAC_CONTAINER_STARTUP_GRACE_MS` - minimum deadline for a container attempt (default: 1500)
/// - `PAC_ALLOW_UNCONTAINED` - run bare processes even when cgroup limits or the network
///   namespace cannot be applied (default: `false`)
/// - `PAC_PROCESS_NETNS` - wrap bare processes in `unshare -rn` (default: `true`)
/// - `PAC_SCRATCH_DIR` - parent directory for per-invocation scratch dirs
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub runner_mode: RunnerMode,
    pub container_image: String,
    pub container_runtime: String,
    pub auto_process_threshold: Duration,
    pub container_startup_grace: Duration,
    pub allow_uncontained: bool,
    pub process_netns: bool,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            runner_mode: RunnerMode::Auto,
            container_image: "python:3.11-slim".to_string(),
            container_runtime: "docker".to_string(),
            auto_process_threshold: Duration::from_millis(200),
            container_startup_grace: Duration::from_millis(1500),
            allow_uncontained: false,
            process_netns: true,
            scratch_dir: None,
        }
    }
}

impl SandboxConfig {
    /// Read the sandbox settings from the environment, keeping defaults for anything unset
    /// or unparseable.
    pub fn from_env() -> Self {
        fn flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(v) => v.eq_ignore_ascii_case("true") || v == "1",
                Err(_) => default,
            }
        }
        fn millis(var: &str, default: Duration) -> Duration {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        }

        let defaults = SandboxConfig::default();
        SandboxConfig {
            runner_mode: std::env::var("PAC_RUNNER_MODE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.runner_mode),
            container_image: std::env::var("PAC_CONTAINER_IMAGE")
                .unwrap_or(defaults.container_image),
            container_runtime: std::env::var("PAC_CONTAINER_RUNTIME")
                .unwrap_or(defaults.container_runtime),
            auto_process_threshold: millis(
                "PAC_AUTO_PROCESS_THRESHOLD_MS",
                defaults.auto_process_threshold,
            ),
            container_startup_grace: millis(
                "PAC_CONTAINER_STARTUP_GRACE_MS",
                defaults.container_startup_grace,
            ),
            allow_uncontained: flag("PAC_ALLOW_UNCONTAINED", defaults.allow_uncontained),
            process_netns: flag("PAC_PROCESS_NETNS", defaults.process_netns),
            scratch_dir: std::env::var("PAC_SCRATCH_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn with_runner_mode(mut self, mode: RunnerMode) -> Self {
        self.runner_mode = mode;
        self
    }

    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    pub fn with_process_netns(mut self, value: bool) -> Self {
        self.process_netns = value;
        self
    }

    pub fn with_container_image(mut self, image: impl Into<String>) -> Self {
        self.container_image = image.into();
        self
    }
}

/// Everything the `pac-arena` binary needs to play one local match.
#[derive(Debug, Clone)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub ruleset: Ruleset,
    pub seed: u64,
    pub player: Option<BotProgram>,
    pub opponent: Option<BotProgram>,
    /// Where to write the gzipped replay, if anywhere.
    pub replay_path: Option<PathBuf>,
    /// Keep one bot process per side for the whole match instead of one per turn.
    pub persistent: bool,
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// CLI flags:
    /// - `--player-dir <DIR>` / `--player-cmd <CMD>` - first bot (command run inside DIR)
    /// - `--opponent-dir <DIR>` / `--opponent-cmd <CMD>` - second bot
    /// - `--league <NAME>` - ruleset preset (wood2, wood1, bronze, silver, gold)
    /// - `--seed <N>` - map and spawn seed (default: current time)
    /// - `--width`, `--height`, `--max-turns`, `--deadline-ms` - ruleset overrides
    /// - `--runner <MODE>` - overrides `PAC_RUNNER_MODE`
    /// - `--image <IMAGE>` - overrides `PAC_CONTAINER_IMAGE`
    /// - `--replay <FILE>` - write the gzipped replay here
    /// - `--one-shot` - spawn a fresh bot process every turn
    pub fn load() -> Result<Self, RulesetError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args, SandboxConfig::from_env())
    }

    /// Build a config from an argument list on top of the given sandbox settings.
    pub fn from_args(args: &[String], mut sandbox: SandboxConfig) -> Result<Self, RulesetError> {
        let seed = Self::parse_cli_value(args, "--seed")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as u64);

        let mut ruleset = match Self::parse_cli_value(args, "--league") {
            Some(name) => Ruleset::for_league(name.parse::<League>()?, seed),
            None => Ruleset::default(),
        };
        if let Some(w) = Self::parse_cli_value(args, "--width").and_then(|v| v.parse().ok()) {
            ruleset.width = w;
        }
        if let Some(h) = Self::parse_cli_value(args, "--height").and_then(|v| v.parse().ok()) {
            ruleset.height = h;
        }
        if let Some(t) = Self::parse_cli_value(args, "--max-turns").and_then(|v| v.parse().ok()) {
            ruleset.max_turns = t;
        }
        if let Some(d) = Self::parse_cli_value(args, "--deadline-ms").and_then(|v| v.parse().ok())
        {
            ruleset.turn_deadline_ms = d;
        }
        ruleset.validate()?;

        if let Some(mode) = Self::parse_cli_value(args, "--runner").and_then(|v| v.parse().ok()) {
            sandbox.runner_mode = mode;
        }
        if let Some(image) = Self::parse_cli_value(args, "--image") {
            sandbox.container_image = image;
        }

        let bot = |name: &str| {
            let dir = Self::parse_cli_value(args, &format!("--{name}-dir"))?;
            let cmd = Self::parse_cli_value(args, &format!("--{name}-cmd"))?;
            Some(BotProgram::new(name, dir, &cmd))
        };

        Ok(Config {
            player: bot("player"),
            opponent: bot("opponent"),
            replay_path: Self::parse_cli_value(args, "--replay").map(PathBuf::from),
            persistent: !args.iter().any(|a| a == "--one-shot"),
            sandbox,
            ruleset,
            seed,
        })
    }

    /// Parse a CLI flag value like `--seed 42`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}
