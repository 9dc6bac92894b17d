// Pacs, the two sides, and rock-paper-scissors type dominance.

use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use super::config::*;
use super::grid::Pos;

/// One of the two competing bots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Player,
    Opponent,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Player, Side::Opponent];

    pub fn other(self) -> Side {
        match self {
            Side::Player => Side::Opponent,
            Side::Opponent => Side::Player,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Player => "player",
            Side::Opponent => "opponent",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value held once per side, indexable by [`Side`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerSide<T> {
    pub player: T,
    pub opponent: T,
}

impl<T> PerSide<T> {
    pub fn new(player: T, opponent: T) -> Self {
        PerSide { player, opponent }
    }

    pub fn map<U>(self, mut f: impl FnMut(Side, T) -> U) -> PerSide<U> {
        PerSide {
            player: f(Side::Player, self.player),
            opponent: f(Side::Opponent, self.opponent),
        }
    }
}

impl<T> Index<Side> for PerSide<T> {
    type Output = T;

    fn index(&self, side: Side) -> &T {
        match side {
            Side::Player => &self.player,
            Side::Opponent => &self.opponent,
        }
    }
}

impl<T> IndexMut<Side> for PerSide<T> {
    fn index_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Player => &mut self.player,
            Side::Opponent => &mut self.opponent,
        }
    }
}

/// Pac type. Rock beats Scissors, Paper beats Rock, Scissors beats Paper; Neutral is inert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PacType {
    Rock,
    Paper,
    Scissors,
    Neutral,
}

impl PacType {
    /// Types assigned round-robin at spawn.
    pub const CYCLE: [PacType; 3] = [PacType::Rock, PacType::Paper, PacType::Scissors];

    /// True if `self` kills `other` when they share a cell.
    pub fn beats(self, other: PacType) -> bool {
        matches!(
            (self, other),
            (PacType::Rock, PacType::Scissors)
                | (PacType::Paper, PacType::Rock)
                | (PacType::Scissors, PacType::Paper)
        )
    }

    /// Integer code used in the bot input.
    pub fn code(self) -> i32 {
        match self {
            PacType::Rock => 0,
            PacType::Paper => 1,
            PacType::Scissors => 2,
            PacType::Neutral => -1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PacType::Rock => "ROCK",
            PacType::Paper => "PAPER",
            PacType::Scissors => "SCISSORS",
            PacType::Neutral => "NEUTRAL",
        }
    }

    /// Parse a type name, case-insensitively.
    pub fn from_name(s: &str) -> Option<PacType> {
        match s.to_ascii_uppercase().as_str() {
            "ROCK" => Some(PacType::Rock),
            "PAPER" => Some(PacType::Paper),
            "SCISSORS" => Some(PacType::Scissors),
            "NEUTRAL" => Some(PacType::Neutral),
            _ => None,
        }
    }
}

impl std::fmt::Display for PacType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single controllable unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Pac {
    pub id: u32,
    pub owner: Side,
    pub pos: Pos,
    #[serde(rename = "type")]
    pub pac_type: PacType,
    pub speed: u32,
    pub ability_duration: u32,
    pub ability_cooldown: u32,
    pub dead: bool,
    /// Cells entered during the current turn's movement, in order.
    pub path_this_turn: Vec<Pos>,
    /// Id of the pac that killed this one, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub killed_by: Option<u32>,
}

impl Pac {
    pub fn new(id: u32, owner: Side, pos: Pos, pac_type: PacType) -> Self {
        Pac {
            id,
            owner,
            pos,
            pac_type,
            speed: BASE_SPEED,
            ability_duration: 0,
            ability_cooldown: 0,
            dead: false,
            path_this_turn: Vec::new(),
            killed_by: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.dead
    }

    /// Advance ability timers by one turn. Speed ends when its duration runs out.
    pub fn tick(&mut self) {
        if self.ability_duration > 0 {
            self.ability_duration -= 1;
            if self.ability_duration == 0 {
                self.speed = BASE_SPEED;
            }
        }
        self.ability_cooldown = self.ability_cooldown.saturating_sub(1);
    }

    pub fn activate_speed(&mut self) {
        self.speed = MAX_SPEED;
        self.ability_duration = SPEED_DURATION;
        self.ability_cooldown = ABILITY_COOLDOWN;
    }

    pub fn switch_type(&mut self, new_type: PacType) {
        self.pac_type = new_type;
        self.ability_cooldown = ABILITY_COOLDOWN;
    }

    /// Two pacs may never end a micro-step on the same cell if they share an owner or a type.
    pub fn blocks(&self, other: &Pac) -> bool {
        self.owner == other.owner || self.pac_type == other.pac_type
    }
}
