// Bot commands, one per pipe-separated fragment of a bot's output line.

use serde::{Deserialize, Serialize};

use super::pac::PacType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum Command {
    Move { pac_id: u32, x: i32, y: i32 },
    Speed { pac_id: u32 },
    Switch { pac_id: u32, target: PacType },
}

impl Command {
    pub fn pac_id(&self) -> u32 {
        match *self {
            Command::Move { pac_id, .. }
            | Command::Speed { pac_id }
            | Command::Switch { pac_id, .. } => pac_id,
        }
    }

    pub fn is_ability(&self) -> bool {
        !matches!(self, Command::Move { .. })
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Move { pac_id, x, y } => write!(f, "MOVE {pac_id} {x} {y}"),
            Command::Speed { pac_id } => write!(f, "SPEED {pac_id}"),
            Command::Switch { pac_id, target } => write!(f, "SWITCH {pac_id} {target}"),
        }
    }
}

/// What one side submitted for a turn: the parsed commands plus fragments the codec dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Orders {
    pub commands: Vec<Command>,
    pub dropped: Vec<String>,
}

impl From<Vec<Command>> for Orders {
    fn from(commands: Vec<Command>) -> Self {
        Orders {
            commands,
            dropped: Vec::new(),
        }
    }
}

/// Join commands into one wire line.
pub fn format_commands(commands: &[Command]) -> String {
    commands
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(" | ")
}
