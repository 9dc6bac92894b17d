// Match orchestration: feeds each bot its input through the sandbox, hands the parsed orders to
// the engine, and runs whole matches headless.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use uuid::Uuid;

use crate::error::{EngineError, MatchError, SandboxError};
use crate::metrics;
use crate::protocol::parse_output;
use crate::replay::{ReplayMessage, ReplayRecorder};
use crate::sandbox::{BotOutput, BotProgram, BotSession, ResourceLimits, SandboxRunner};

use super::game::{Engine, Game, MatchOutcome, TurnReport};
use super::pac::{PerSide, Side};
use super::ruleset::Ruleset;

/// One side's bot for the duration of a match.
pub struct BotSlot {
    program: BotProgram,
    persistent: bool,
    session: Option<Box<dyn BotSession>>,
}

impl BotSlot {
    /// A persistent slot keeps one bot process alive across turns and sends the map block once;
    /// otherwise every turn starts a fresh process with the map block prepended.
    pub fn new(program: BotProgram, persistent: bool) -> Self {
        BotSlot {
            program,
            persistent,
            session: None,
        }
    }

    pub fn program(&self) -> &BotProgram {
        &self.program
    }

    async fn invoke(
        &mut self,
        runner: &SandboxRunner,
        init: &str,
        turn_input: &str,
        deadline: Duration,
        limits: &ResourceLimits,
    ) -> Result<BotOutput, SandboxError> {
        if !self.persistent {
            let input = format!("{init}{turn_input}");
            return runner.run(&self.program, &input, deadline, limits).await;
        }

        if let Some(session) = self.session.as_mut() {
            let result = session.exchange(turn_input, deadline).await;
            if result.is_err() {
                self.close().await;
            }
            return result;
        }

        let input = format!("{init}{turn_input}");
        let (session, output) = runner
            .start_session(&self.program, &input, deadline, limits)
            .await?;
        self.session = Some(session);
        Ok(output)
    }

    /// Stop the bot's process, if one is still running.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

/// Play one turn: run both bots concurrently, then either step the engine with their orders or
/// record the failure of whichever bot did not answer.
pub async fn play_turn<E: Engine>(
    engine: &mut E,
    bots: &mut PerSide<BotSlot>,
    runner: &SandboxRunner,
    deadline: Duration,
    limits: &ResourceLimits,
) -> Result<TurnReport, EngineError> {
    let turn = engine.state().turn;
    if engine.is_finished() {
        return Err(EngineError::MatchFinished { turn });
    }

    let timer = metrics::TURN_DURATION_SECONDS.start_timer();
    let init = engine.init_input();
    let inputs = PerSide::new(
        engine.bot_input(Side::Player),
        engine.bot_input(Side::Opponent),
    );

    let PerSide { player, opponent } = bots;
    let (player_out, opponent_out) = tokio::join!(
        player.invoke(runner, &init, &inputs.player, deadline, limits),
        opponent.invoke(runner, &init, &inputs.opponent, deadline, limits),
    );
    let outputs = PerSide::new(player_out, opponent_out);

    let mut failures = Vec::new();
    for side in Side::BOTH {
        match &outputs[side] {
            Err(e) => {
                engine.on_bot_failure(side, turn + 1, &e.to_string());
                failures.push(format!("Bot '{side}' failed on turn {}: {e}", turn + 1));
            }
            Ok(out) if !out.stderr.trim().is_empty() => {
                tracing::debug!(%side, turn = turn + 1, stderr = %out.stderr.trim(), "bot stderr");
            }
            Ok(_) => {}
        }
    }

    let report = if failures.is_empty() {
        let orders = outputs.map(|_, out| match out {
            Ok(out) => parse_output(&out.stdout),
            Err(_) => Default::default(),
        });
        engine.step(orders)?
    } else {
        let state = engine.state();
        TurnReport {
            stdout: state
                .outcome
                .as_ref()
                .map(|o| o.final_message.clone())
                .unwrap_or_default(),
            stderr: failures.join("\n"),
            state,
        }
    };
    timer.observe_duration();
    Ok(report)
}

/// Everything needed to play one match without a store.
#[derive(Debug, Clone)]
pub struct MatchSetup {
    pub ruleset: Ruleset,
    pub seed: u64,
    pub bots: PerSide<BotProgram>,
    pub persistent: bool,
}

/// Result of a completed headless match.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub match_id: Uuid,
    pub seed: u64,
    pub outcome: MatchOutcome,
    pub scores: PerSide<u32>,
    pub turns: u32,
    /// Gzipped JSON array of replay messages.
    pub replay: Vec<u8>,
    pub elapsed: Duration,
}

struct ActiveMatch;

impl ActiveMatch {
    fn enter() -> Self {
        metrics::ACTIVE_MATCHES.inc();
        ActiveMatch
    }
}

impl Drop for ActiveMatch {
    fn drop(&mut self) {
        metrics::ACTIVE_MATCHES.dec();
    }
}

/// Play a full match to completion.
pub async fn run_match_headless(
    setup: MatchSetup,
    runner: &SandboxRunner,
) -> Result<MatchResult, MatchError> {
    let _active = ActiveMatch::enter();
    let match_id = Uuid::new_v4();
    let started = Instant::now();

    let game = Game::new(setup.ruleset.clone(), setup.seed)?;
    let mut bots = setup
        .bots
        .clone()
        .map(|_, program| BotSlot::new(program, setup.persistent));

    tracing::info!(
        %match_id,
        seed = setup.seed,
        player = %bots.player.program().name,
        opponent = %bots.opponent.program().name,
        "match started"
    );

    let played = AssertUnwindSafe(play_to_end(game, &mut bots, runner))
        .catch_unwind()
        .await;
    for side in Side::BOTH {
        bots[side].close().await;
    }

    let game = match played {
        Ok(result) => result?,
        Err(panic_info) => {
            let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            tracing::error!(%match_id, "headless match panicked: {msg}");
            return Err(MatchError::Panicked(msg));
        }
    };

    let outcome = game
        .outcome()
        .ok_or(EngineError::Unfinished { turn: game.turn() })?;

    let mut recorder = ReplayRecorder::new();
    let world = game.world();
    recorder.record(&ReplayMessage::Start {
        match_id,
        seed: setup.seed,
        ruleset: game.ruleset(),
        world: &world,
    })?;
    for entry in game.history() {
        recorder.record(&ReplayMessage::Turn(entry))?;
    }
    recorder.record(&ReplayMessage::End {
        outcome: &outcome,
        scores: game.scores(),
        turns: game.turn(),
    })?;

    metrics::MATCHES_TOTAL
        .with_label_values(&[outcome.result_label()])
        .inc();
    tracing::info!(
        %match_id,
        turns = game.turn(),
        player = game.scores().player,
        opponent = game.scores().opponent,
        "match finished: {}",
        outcome.final_message
    );

    Ok(MatchResult {
        match_id,
        seed: setup.seed,
        scores: game.scores(),
        turns: game.turn(),
        outcome,
        replay: recorder.finish()?,
        elapsed: started.elapsed(),
    })
}

async fn play_to_end(
    mut game: Game,
    bots: &mut PerSide<BotSlot>,
    runner: &SandboxRunner,
) -> Result<Game, EngineError> {
    let deadline = Duration::from_millis(game.ruleset().turn_deadline_ms);
    let limits = ResourceLimits::from(game.ruleset());
    while !game.is_finished() {
        let report = play_turn(&mut game, bots, runner, deadline, &limits).await?;
        if !report.stderr.is_empty() {
            tracing::debug!(turn = report.state.turn, "{}", report.stderr);
        }
    }
    Ok(game)
}
