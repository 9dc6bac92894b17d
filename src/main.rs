use std::process::ExitCode;

use pac_arena::config::Config;
use pac_arena::engine::pac::PerSide;
use pac_arena::engine::server::{run_match_headless, MatchSetup};
use pac_arena::metrics;
use pac_arena::sandbox::SandboxRunner;

const USAGE: &str = "usage: pac-arena --player-dir <DIR> --player-cmd <CMD> \
--opponent-dir <DIR> --opponent-cmd <CMD> [--league <NAME>] [--seed <N>] \
[--runner auto|process|container] [--replay <FILE>] [--one-shot]";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };
    let (Some(player), Some(opponent)) = (config.player.clone(), config.opponent.clone()) else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    if let Err(e) = metrics::register_metrics() {
        tracing::warn!("failed to register metrics: {e}");
    }

    let runner = SandboxRunner::new(config.sandbox.clone());
    tracing::info!(
        runner = ?config.sandbox.runner_mode,
        seed = config.seed,
        width = config.ruleset.width,
        height = config.ruleset.height,
        "pac-arena starting"
    );

    let setup = MatchSetup {
        ruleset: config.ruleset,
        seed: config.seed,
        bots: PerSide::new(player, opponent),
        persistent: config.persistent,
    };
    let result = match run_match_headless(setup, &runner).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("match failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(path) = &config.replay_path {
        if let Err(e) = tokio::fs::write(path, &result.replay).await {
            tracing::error!(path = %path.display(), "failed to write replay: {e}");
            return ExitCode::FAILURE;
        }
        tracing::info!(path = %path.display(), "replay written");
    }

    println!(
        "{} ({} - {}, {} turns)",
        result.outcome.final_message, result.scores.player, result.scores.opponent, result.turns
    );
    ExitCode::SUCCESS
}
