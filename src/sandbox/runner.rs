// Strategy selection: which backend runs a bot, with what deadline, and where to go when it
// fails for reasons outside the bot.

use std::sync::Arc;
use std::time::Duration;

use super::{
    BotOutput, BotProgram, BotSession, ContainerBackend, IsolationBackend, ProcessBackend,
    ResourceLimits, StrategyKind,
};
use crate::config::{RunnerMode, SandboxConfig};
use crate::error::SandboxError;
use crate::metrics;

/// One step of an invocation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub strategy: StrategyKind,
    pub deadline: Duration,
}

#[derive(Clone, Copy)]
enum Job<'a> {
    OneShot(&'a str),
    /// Open a session and complete its first exchange.
    Session(&'a str),
}

struct Started {
    output: BotOutput,
    session: Option<Box<dyn BotSession>>,
}

pub struct SandboxRunner {
    config: SandboxConfig,
    process: Arc<dyn IsolationBackend>,
    container: Arc<dyn IsolationBackend>,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig) -> Self {
        let process = Arc::new(ProcessBackend::new(config.clone()));
        let container = Arc::new(ContainerBackend::new(config.clone()));
        Self::with_backends(config, process, container)
    }

    pub fn with_backends(
        config: SandboxConfig,
        process: Arc<dyn IsolationBackend>,
        container: Arc<dyn IsolationBackend>,
    ) -> Self {
        SandboxRunner {
            config,
            process,
            container,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The attempts for a bot with `deadline`, in order.
    ///
    /// - `process`: one bare-process attempt.
    /// - `container`: a container attempt with the deadline raised to the startup grace, then one
    ///   retry with the grace added again. Never falls back.
    /// - `auto`: bare process when `deadline` is under the threshold; otherwise the container
    ///   attempts followed by a bare process at the original deadline.
    pub fn plan(&self, deadline: Duration) -> Vec<Attempt> {
        let process = Attempt {
            strategy: StrategyKind::Process,
            deadline,
        };
        let first = deadline.max(self.config.container_startup_grace);
        let containers = [
            Attempt {
                strategy: StrategyKind::Container,
                deadline: first,
            },
            Attempt {
                strategy: StrategyKind::Container,
                deadline: first + self.config.container_startup_grace,
            },
        ];

        match self.config.runner_mode {
            RunnerMode::Process => vec![process],
            RunnerMode::Container => containers.to_vec(),
            RunnerMode::Auto if deadline < self.config.auto_process_threshold => vec![process],
            RunnerMode::Auto => {
                let mut plan = containers.to_vec();
                plan.push(process);
                plan
            }
        }
    }

    fn backend(&self, strategy: StrategyKind) -> &dyn IsolationBackend {
        match strategy {
            StrategyKind::Process => self.process.as_ref(),
            StrategyKind::Container => self.container.as_ref(),
        }
    }

    /// Run a bot once: feed `input`, collect its output.
    pub async fn run(
        &self,
        program: &BotProgram,
        input: &str,
        deadline: Duration,
        limits: &ResourceLimits,
    ) -> Result<BotOutput, SandboxError> {
        let started = self
            .execute(program, Job::OneShot(input), deadline, limits)
            .await?;
        Ok(started.output)
    }

    /// Start a long-lived bot and complete its first exchange under the same policy as
    /// [`SandboxRunner::run`]. Later exchanges go straight to the returned session.
    pub async fn start_session(
        &self,
        program: &BotProgram,
        first_input: &str,
        deadline: Duration,
        limits: &ResourceLimits,
    ) -> Result<(Box<dyn BotSession>, BotOutput), SandboxError> {
        let started = self
            .execute(program, Job::Session(first_input), deadline, limits)
            .await?;
        match started.session {
            Some(session) => Ok((session, started.output)),
            None => Err(SandboxError::Unavailable {
                strategy: started.output.strategy,
                reason: "backend returned no session".to_string(),
            }),
        }
    }

    async fn execute(
        &self,
        program: &BotProgram,
        job: Job<'_>,
        deadline: Duration,
        limits: &ResourceLimits,
    ) -> Result<Started, SandboxError> {
        let plan = self.plan(deadline);
        let mut last_error = None;

        for (i, attempt) in plan.iter().enumerate() {
            if let Some(previous) = i.checked_sub(1).map(|j| plan[j]) {
                if previous.strategy != attempt.strategy {
                    metrics::SANDBOX_FALLBACKS_TOTAL
                        .with_label_values(&[previous.strategy.as_str(), attempt.strategy.as_str()])
                        .inc();
                    tracing::warn!(
                        bot = %program.name,
                        from = %previous.strategy,
                        to = %attempt.strategy,
                        "falling back to another isolation strategy"
                    );
                } else {
                    tracing::debug!(bot = %program.name, deadline = ?attempt.deadline, "retrying");
                }
            }

            let backend = self.backend(attempt.strategy);
            let timer = metrics::SANDBOX_DURATION_SECONDS
                .with_label_values(&[attempt.strategy.as_str()])
                .start_timer();
            let result = match job {
                Job::OneShot(input) => backend
                    .run(program, input, attempt.deadline, limits)
                    .await
                    .map(|output| Started {
                        output,
                        session: None,
                    }),
                Job::Session(input) => {
                    Self::open_and_exchange(backend, program, input, attempt.deadline, limits)
                        .await
                }
            };
            timer.observe_duration();

            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.label(),
            };
            metrics::SANDBOX_INVOCATIONS_TOTAL
                .with_label_values(&[attempt.strategy.as_str(), outcome])
                .inc();

            match result {
                Ok(started) => return Ok(started),
                Err(e) if !e.is_infrastructure() => return Err(e),
                Err(e) => {
                    tracing::warn!(bot = %program.name, error = %e, "sandbox attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SandboxError::Unavailable {
            strategy: StrategyKind::Process,
            reason: "no isolation strategy configured".to_string(),
        }))
    }

    /// Open a session and feed it the first input. A backend that switches delivery after
    /// the failure gets one more try within the same attempt.
    async fn open_and_exchange(
        backend: &dyn IsolationBackend,
        program: &BotProgram,
        input: &str,
        deadline: Duration,
        limits: &ResourceLimits,
    ) -> Result<Started, SandboxError> {
        match Self::open_once(backend, program, input, deadline, limits).await {
            Err(e) if backend.fall_back_after(program, &e) => {
                tracing::info!(bot = %program.name, error = %e, "retrying session with fallback delivery");
                Self::open_once(backend, program, input, deadline, limits).await
            }
            other => other,
        }
    }

    async fn open_once(
        backend: &dyn IsolationBackend,
        program: &BotProgram,
        input: &str,
        deadline: Duration,
        limits: &ResourceLimits,
    ) -> Result<Started, SandboxError> {
        let mut session = backend.open_session(program, limits).await?;
        match session.exchange(input, deadline).await {
            Ok(output) => Ok(Started {
                output,
                session: Some(session),
            }),
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }
}
