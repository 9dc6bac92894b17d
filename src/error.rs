// Error taxonomy for rulesets, bot commands, the turn engine, the sandbox and the match store.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::engine::pac::{PacType, Side};
use crate::sandbox::StrategyKind;

/// A ruleset or layout that cannot produce a playable match.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RulesetError {
    #[error("grid {width}x{height} is outside the supported range")]
    Dimensions { width: usize, height: usize },
    #[error("pacs per side must be at least 1")]
    NoPacs,
    #[error("fog of war is not supported")]
    FogOfWarUnsupported,
    #[error("need {needed} mirrored spawn cells but the grid only has {available}")]
    NotEnoughSpawnCells { needed: usize, available: usize },
    #[error("invalid layout: {0}")]
    InvalidLayout(String),
    #[error("unknown league '{0}'")]
    UnknownLeague(String),
}

/// Why one bot sub-command was not carried out. Never fatal: the text goes to the turn's stderr log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("malformed command '{0}'")]
    Malformed(String),
    #[error("pac {0} does not exist")]
    UnknownPac(u32),
    #[error("pac {pac_id} is not owned by {side}")]
    OwnershipViolation { pac_id: u32, side: Side },
    #[error("pac {0} is dead")]
    DeadPac(u32),
    #[error("pac {0} already has a move this turn")]
    DuplicateMove(u32),
    #[error("pac {pac_id} is already at ({x}, {y})")]
    MoveToSelf { pac_id: u32, x: i32, y: i32 },
    #[error("no path for pac {pac_id} to ({x}, {y})")]
    NoPathFound { pac_id: u32, x: i32, y: i32 },
    #[error("pac {pac_id} cannot use {ability}: cooldown {remaining}")]
    AbilityOnCooldown {
        pac_id: u32,
        ability: &'static str,
        remaining: u32,
    },
    #[error("pac {pac_id} cannot use {ability}: disabled by ruleset")]
    AbilityDisabledByRuleset { pac_id: u32, ability: &'static str },
    #[error("pac {pac_id} cannot switch to {target}")]
    InvalidSwitchTarget { pac_id: u32, target: PacType },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("match already finished at turn {turn}")]
    MatchFinished { turn: u32 },
    #[error("match has no outcome yet at turn {turn}")]
    Unfinished { turn: u32 },
}

/// Infrastructure-level failure of one bot invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("{strategy} sandbox unavailable: {reason}")]
    Unavailable {
        strategy: StrategyKind,
        reason: String,
    },
    #[error("{strategy} sandbox timed out after {}ms", deadline.as_millis())]
    Timeout {
        strategy: StrategyKind,
        deadline: Duration,
    },
    #[error("bot crashed under {strategy} sandbox (exit code {code:?}): {stderr}")]
    Crash {
        strategy: StrategyKind,
        code: Option<i32>,
        stderr: String,
    },
}

impl SandboxError {
    /// Availability and timeout failures may be retried or handed to another strategy.
    /// A crash is the bot's own doing and never is.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            SandboxError::Unavailable { .. } | SandboxError::Timeout { .. }
        )
    }

    pub fn strategy(&self) -> StrategyKind {
        match self {
            SandboxError::Unavailable { strategy, .. }
            | SandboxError::Timeout { strategy, .. }
            | SandboxError::Crash { strategy, .. } => *strategy,
        }
    }

    /// Short label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SandboxError::Unavailable { .. } => "unavailable",
            SandboxError::Timeout { .. } => "timeout",
            SandboxError::Crash { .. } => "crash",
        }
    }
}

/// Failure of a whole headless match, as opposed to one bot inside it.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error(transparent)]
    Ruleset(#[from] RulesetError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("replay encoding failed: {0}")]
    Replay(#[from] std::io::Error),
    #[error("replay serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("match panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("match {0} not found")]
    NotFound(Uuid),
    #[error("match {0} has no bots attached")]
    NoBots(Uuid),
    #[error(transparent)]
    Ruleset(#[from] RulesetError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_classification() {
        let timeout = SandboxError::Timeout {
            strategy: StrategyKind::Container,
            deadline: Duration::from_millis(50),
        };
        let crash = SandboxError::Crash {
            strategy: StrategyKind::Process,
            code: Some(1),
            stderr: "boom".into(),
        };
        assert!(timeout.is_infrastructure());
        assert!(!crash.is_infrastructure());
        assert_eq!(timeout.to_string(), "container sandbox timed out after 50ms");
        assert_eq!(crash.strategy(), StrategyKind::Process);
    }

    #[test]
    fn test_command_error_messages() {
        let err = CommandError::OwnershipViolation {
            pac_id: 4,
            side: Side::Opponent,
        };
        assert_eq!(err.to_string(), "pac 4 is not owned by opponent");
        let err = CommandError::AbilityOnCooldown {
            pac_id: 1,
            ability: "SPEED",
            remaining: 9,
        };
        assert_eq!(err.to_string(), "pac 1 cannot use SPEED: cooldown 9");
    }
}
