// Bots run as real processes: deadlines, failures and a full match through the store.

use std::path::Path;
use std::time::{Duration, Instant};

use pac_arena::config::{RunnerMode, SandboxConfig};
use pac_arena::engine::game::EndReason;
use pac_arena::engine::pac::{PerSide, Side};
use pac_arena::engine::ruleset::Ruleset;
use pac_arena::engine::server::{run_match_headless, MatchSetup};
use pac_arena::error::SandboxError;
use pac_arena::match_store::MatchStore;
use pac_arena::replay::decompress_replay;
use pac_arena::sandbox::{BotProgram, ResourceLimits, SandboxRunner, StrategyKind};

fn process_runner() -> SandboxRunner {
    SandboxRunner::new(
        SandboxConfig::default()
            .with_runner_mode(RunnerMode::Process)
            .with_allow_uncontained(true)
            .with_process_netns(false),
    )
}

fn shell_bot(dir: &Path, name: &str, script: &str) -> BotProgram {
    std::fs::write(dir.join("bot.sh"), script).unwrap();
    BotProgram::new(name, dir, "sh bot.sh")
}

fn ruleset(max_turns: u32) -> Ruleset {
    Ruleset {
        max_turns,
        turn_deadline_ms: 2000,
        ..Ruleset::default()
    }
}

#[tokio::test]
async fn test_sleeping_bot_times_out_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let bot = shell_bot(dir.path(), "sleeper", "sleep 5\n");
    let limits = ResourceLimits::from(&Ruleset::default());

    let started = Instant::now();
    let err = process_runner()
        .run(&bot, "1 1\n", Duration::from_millis(50), &limits)
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        err,
        SandboxError::Timeout {
            strategy: StrategyKind::Process,
            deadline: Duration::from_millis(50),
        }
    );
}

#[tokio::test]
async fn test_headless_match_writes_replay() {
    let dir = tempfile::tempdir().unwrap();
    let bot = shell_bot(dir.path(), "idle", "cat > /dev/null\necho WAIT\n");
    let setup = MatchSetup {
        ruleset: ruleset(4),
        seed: 21,
        bots: PerSide::new(bot.clone(), bot),
        persistent: false,
    };
    let result = run_match_headless(setup, &process_runner()).await.unwrap();
    assert_eq!(result.turns, 4);
    assert_eq!(result.outcome.reason, EndReason::MaxTurns);

    let json = decompress_replay(&result.replay).unwrap();
    let messages: serde_json::Value = serde_json::from_str(&json).unwrap();
    let messages = messages.as_array().unwrap();
    // start, the initial snapshot, four turns, end
    assert_eq!(messages.len(), 7);
    assert_eq!(messages[0]["type"], "start");
    assert_eq!(messages[0]["seed"], 21);
    assert_eq!(messages[6]["type"], "end");
    assert_eq!(messages[6]["turns"], 4);
}

#[tokio::test]
async fn test_store_plays_persistent_bots_to_the_end() {
    let dir = tempfile::tempdir().unwrap();
    let bot = shell_bot(dir.path(), "idle", "while read line; do echo WAIT; done\n");
    let store = MatchStore::new();
    let runner = process_runner();
    let id = store
        .create_with_bots(ruleset(3), 8, PerSide::new(bot.clone(), bot), true)
        .unwrap();

    while !store.is_finished(id).await.unwrap() {
        let report = store.play_turn(id, &runner).await.unwrap();
        assert!(report.stderr.contains("malformed command 'WAIT'"));
    }
    let state = store.state(id).await.unwrap();
    assert_eq!(state.turn, 3);
    assert_eq!(state.outcome.unwrap().winner, None);
    store.evict(id).await.unwrap();
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_silent_crash_forfeits_in_store() {
    let good_dir = tempfile::tempdir().unwrap();
    let bad_dir = tempfile::tempdir().unwrap();
    let good = shell_bot(good_dir.path(), "good", "cat > /dev/null\necho WAIT\n");
    let bad = shell_bot(bad_dir.path(), "bad", "cat > /dev/null\nexit 1\n");
    let store = MatchStore::new();
    let id = store
        .create_with_bots(ruleset(50), 3, PerSide::new(bad, good), false)
        .unwrap();

    let report = store.play_turn(id, &process_runner()).await.unwrap();
    assert!(report.stderr.contains("Bot 'player' failed on turn 1"));
    let state = store.state(id).await.unwrap();
    assert!(state.finished);
    assert_eq!(state.scores.player, 0);
    let outcome = state.outcome.unwrap();
    assert_eq!(outcome.winner, Some(Side::Opponent));
    assert!(outcome.final_message.starts_with("Winner: opponent"));
}
