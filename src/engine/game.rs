// Turn engine: owns one match's state and advances it one turn per `step` call.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use super::command::{format_commands, Command, Orders};
use super::config::*;
use super::grid::{Grid, GridSnapshot, Pos};
use super::mapgen::MapGenerator;
use super::movement::{resolve_movement, Route};
use super::pac::{Pac, PacType, PerSide, Side};
use super::pathfinder::find_path;
use super::ruleset::Ruleset;
use crate::error::{CommandError, EngineError, RulesetError};
use crate::metrics;
use crate::protocol::{self, ProtocolDescription};

/// The referee contract shared by every rule variant. Variants are expressed through
/// [`Ruleset`] data, not separate implementations.
pub trait Engine {
    fn protocol(&self) -> ProtocolDescription;
    /// Text sent once to each bot before its first turn.
    fn init_input(&self) -> String;
    /// Per-turn input for one side.
    fn bot_input(&self, side: Side) -> String;
    fn step(&mut self, orders: PerSide<Orders>) -> Result<TurnReport, EngineError>;
    fn state(&self) -> GameSnapshot;
    fn history(&self) -> &[HistoryEntry];
    fn is_finished(&self) -> bool;
    fn outcome(&self) -> Option<MatchOutcome>;
    fn on_bot_failure(&mut self, side: Side, turn: u32, reason: &str);
}

/// Snapshot of the full match state after a turn.
#[derive(Debug, Clone, Serialize)]
pub struct GameSnapshot {
    pub turn: u32,
    pub pacs: Vec<Pac>,
    pub pellets: Vec<Pos>,
    pub cherries: Vec<Pos>,
    pub scores: PerSide<u32>,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<MatchOutcome>,
}

/// One entry of the append-only match log.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub turn: u32,
    pub state: GameSnapshot,
    pub commands: PerSide<String>,
    pub stdout: String,
    pub stderr: String,
}

/// What `step` hands back: the new state plus the turn's diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub state: GameSnapshot,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotFailure {
    pub side: Side,
    pub turn: u32,
    pub reason: String,
}

/// Why the match ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndReason {
    BotFailure { side: Side, reason: String },
    BothBotsFailed,
    Elimination { survivor: Option<Side> },
    BoardCleared,
    InsurmountableLead,
    MaxTurns,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchOutcome {
    /// `None` for a draw.
    pub winner: Option<Side>,
    pub reason: EndReason,
    pub final_message: String,
}

impl MatchOutcome {
    fn new(winner: Option<Side>, reason: EndReason) -> Self {
        let final_message = match (&winner, &reason) {
            (Some(w), EndReason::BotFailure { side, reason }) => {
                format!("Winner: {w} ({side} failed: {reason})")
            }
            (Some(w), _) => format!("Winner: {w}"),
            (None, EndReason::BothBotsFailed) => "Draw (both bots failed)".to_string(),
            (None, _) => "Draw".to_string(),
        };
        MatchOutcome {
            winner,
            reason,
            final_message,
        }
    }

    /// Label used for metrics and logs.
    pub fn result_label(&self) -> &'static str {
        match self.winner {
            Some(Side::Player) => "player",
            Some(Side::Opponent) => "opponent",
            None => "draw",
        }
    }
}

/// A single match.
pub struct Game {
    ruleset: Ruleset,
    seed: u64,
    grid: Grid,
    pacs: Vec<Pac>,
    /// Ids of pacs removed from play after dying.
    fallen: BTreeSet<u32>,
    pellets: BTreeSet<Pos>,
    cherries: BTreeSet<Pos>,
    scores: PerSide<u32>,
    turn: u32,
    failures: Vec<BotFailure>,
    history: Vec<HistoryEntry>,
}

impl Game {
    /// Generate a maze from `seed` and set up a match on it.
    pub fn new(ruleset: Ruleset, seed: u64) -> Result<Self, RulesetError> {
        ruleset.validate()?;
        let grid = MapGenerator::new(seed).generate(ruleset.width, ruleset.height)?;
        Self::with_layout(ruleset, grid, seed)
    }

    /// Set up a match on a fixed layout, spawning and seeding collectibles from `seed`.
    pub fn with_layout(mut ruleset: Ruleset, grid: Grid, seed: u64) -> Result<Self, RulesetError> {
        ruleset.width = grid.width;
        ruleset.height = grid.height;
        ruleset.validate()?;

        // The maze consumed the seed itself; spawns draw from a separate stream.
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(0x9e37_79b9_7f4a_7c15));
        let pacs = spawn_pacs(&grid, &ruleset, &mut rng)?;
        let spawn_cells: HashSet<Pos> = pacs.iter().map(|p| p.pos).collect();
        let mut pellets: BTreeSet<Pos> = grid
            .floor_cells()
            .into_iter()
            .filter(|p| !spawn_cells.contains(p))
            .collect();
        let cherries = place_cherries(&grid, &mut pellets, ruleset.num_cherries, &mut rng);

        Ok(Self::assemble(ruleset, seed, grid, pacs, pellets, cherries))
    }

    /// Set up a match from explicit pieces. Every position must be floor and pac ids unique.
    pub fn from_parts(
        mut ruleset: Ruleset,
        grid: Grid,
        pacs: Vec<Pac>,
        pellets: impl IntoIterator<Item = Pos>,
        cherries: impl IntoIterator<Item = Pos>,
    ) -> Result<Self, RulesetError> {
        ruleset.width = grid.width;
        ruleset.height = grid.height;
        ruleset.validate()?;

        let mut ids = HashSet::new();
        for pac in &pacs {
            if !grid.is_floor(pac.pos) || !ids.insert(pac.id) {
                return Err(RulesetError::InvalidLayout(format!(
                    "pac {} at {} is not a unique pac on floor",
                    pac.id, pac.pos
                )));
            }
        }
        let pellets: BTreeSet<Pos> = pellets.into_iter().collect();
        let cherries: BTreeSet<Pos> = cherries.into_iter().collect();
        if let Some(bad) = pellets.iter().chain(&cherries).find(|p| !grid.is_floor(**p)) {
            return Err(RulesetError::InvalidLayout(format!(
                "collectible at {bad} is not on floor"
            )));
        }
        Ok(Self::assemble(ruleset, 0, grid, pacs, pellets, cherries))
    }

    fn assemble(
        ruleset: Ruleset,
        seed: u64,
        grid: Grid,
        pacs: Vec<Pac>,
        pellets: BTreeSet<Pos>,
        cherries: BTreeSet<Pos>,
    ) -> Self {
        let mut game = Game {
            ruleset,
            seed,
            grid,
            pacs,
            fallen: BTreeSet::new(),
            pellets,
            cherries,
            scores: PerSide::default(),
            turn: 0,
            failures: Vec::new(),
            history: Vec::new(),
        };
        let stdout = format!(
            "Match initialised: {}x{} grid, {} pacs, {} pellets, {} cherries",
            game.grid.width,
            game.grid.height,
            game.pacs.len(),
            game.pellets.len(),
            game.cherries.len()
        );
        let state = game.state();
        game.history.push(HistoryEntry {
            turn: 0,
            state,
            commands: PerSide::default(),
            stdout,
            stderr: String::new(),
        });
        game
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn world(&self) -> GridSnapshot {
        self.grid.snapshot()
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn scores(&self) -> PerSide<u32> {
        self.scores
    }

    pub fn pacs(&self) -> &[Pac] {
        &self.pacs
    }

    pub fn pac(&self, id: u32) -> Option<&Pac> {
        self.pacs.iter().find(|p| p.id == id)
    }

    /// Pacs still in play, in id order.
    pub fn living_pacs(&self) -> impl Iterator<Item = &Pac> {
        self.pacs.iter().filter(|p| p.is_alive())
    }

    pub fn pellets(&self) -> &BTreeSet<Pos> {
        &self.pellets
    }

    pub fn cherries(&self) -> &BTreeSet<Pos> {
        &self.cherries
    }

    pub fn failures(&self) -> &[BotFailure] {
        &self.failures
    }

    /// Side of the first bot failure, if any.
    pub fn failed_side(&self) -> Option<Side> {
        self.failures.first().map(|f| f.side)
    }

    /// Points still on the board.
    pub fn remaining_points(&self) -> u32 {
        self.pellets.len() as u32 * PELLET_SCORE + self.cherries.len() as u32 * self.ruleset.cherry_score
    }

    fn living_count(&self, side: Side) -> usize {
        self.living_pacs().filter(|p| p.owner == side).count()
    }

    // --- Step phases ---

    /// Resolve a pac id from `side`'s point of view.
    fn controllable_pac(&self, side: Side, pac_id: u32) -> Result<usize, CommandError> {
        if self.fallen.contains(&pac_id) {
            return Err(CommandError::DeadPac(pac_id));
        }
        let idx = self
            .pacs
            .iter()
            .position(|p| p.id == pac_id)
            .ok_or(CommandError::UnknownPac(pac_id))?;
        let pac = &self.pacs[idx];
        if pac.owner != side {
            return Err(CommandError::OwnershipViolation { pac_id, side });
        }
        if pac.dead {
            return Err(CommandError::DeadPac(pac_id));
        }
        Ok(idx)
    }

    fn apply_ability(&mut self, side: Side, command: &Command) -> Result<String, CommandError> {
        let idx = self.controllable_pac(side, command.pac_id())?;
        let speed_enabled = self.ruleset.speed_ability_enabled;
        let switch_enabled = self.ruleset.switch_ability_enabled;
        let pac = &mut self.pacs[idx];
        let pac_id = pac.id;

        let (ability, enabled) = match command {
            Command::Speed { .. } => ("SPEED", speed_enabled),
            Command::Switch { .. } => ("SWITCH", switch_enabled),
            Command::Move { .. } => return Ok(String::new()),
        };
        if !enabled {
            return Err(CommandError::AbilityDisabledByRuleset { pac_id, ability });
        }
        if pac.ability_cooldown > 0 {
            return Err(CommandError::AbilityOnCooldown {
                pac_id,
                ability,
                remaining: pac.ability_cooldown,
            });
        }
        match *command {
            Command::Switch { target, .. } => {
                if target == PacType::Neutral {
                    return Err(CommandError::InvalidSwitchTarget { pac_id, target });
                }
                pac.switch_type(target);
                Ok(format!("Pac {pac_id} switches to {target}"))
            }
            _ => {
                pac.activate_speed();
                Ok(format!("Pac {pac_id} activates SPEED"))
            }
        }
    }

    fn plan_route(
        &self,
        side: Side,
        pac_id: u32,
        x: i32,
        y: i32,
        planned: &HashSet<u32>,
    ) -> Result<Route, CommandError> {
        let idx = self.controllable_pac(side, pac_id)?;
        if planned.contains(&pac_id) {
            return Err(CommandError::DuplicateMove(pac_id));
        }
        let from = self.pacs[idx].pos;
        let no_path = CommandError::NoPathFound { pac_id, x, y };
        let target = self.grid.pos_at(x, y).ok_or(no_path.clone())?;
        if target == from {
            return Err(CommandError::MoveToSelf { pac_id, x, y });
        }
        let path = find_path(&self.grid, from, target).ok_or(no_path)?;
        Ok(Route::new(pac_id, path))
    }

    /// Opposite-side pacs sharing a cell fight. Deaths are decided on the pre-combat roster,
    /// and a pac killed by several opponents is credited to the lowest killer id.
    fn resolve_combat(&mut self, log: &mut Vec<String>) {
        let mut deaths: BTreeMap<u32, u32> = BTreeMap::new();
        for victim in self.living_pacs() {
            let killer = self
                .living_pacs()
                .filter(|k| {
                    k.owner != victim.owner
                        && k.pos == victim.pos
                        && k.pac_type.beats(victim.pac_type)
                })
                .map(|k| k.id)
                .min();
            if let Some(killer) = killer {
                deaths.insert(victim.id, killer);
            }
        }

        for (victim_id, killer_id) in deaths {
            if let Some(pac) = self.pacs.iter_mut().find(|p| p.id == victim_id) {
                pac.dead = true;
                pac.killed_by = Some(killer_id);
                log.push(format!("Pac {killer_id} kills pac {victim_id} at {}", pac.pos));
                metrics::PACS_KILLED_TOTAL.inc();
            }
        }
    }

    /// Living pacs eat what they stand on. Each side present on a cell is credited once.
    fn consume(&mut self, log: &mut Vec<String>) -> PerSide<u32> {
        let mut occupants: BTreeMap<Pos, BTreeSet<Side>> = BTreeMap::new();
        for pac in self.pacs.iter().filter(|p| p.is_alive()) {
            occupants.entry(pac.pos).or_default().insert(pac.owner);
        }

        let mut gains = PerSide::<u32>::default();
        for (cell, sides) in occupants {
            let value = if self.pellets.remove(&cell) {
                PELLET_SCORE
            } else if self.cherries.remove(&cell) {
                log.push(format!("Cherry eaten at {cell}"));
                self.ruleset.cherry_score
            } else {
                continue;
            };
            for side in sides {
                gains[side] += value;
            }
        }
        for side in Side::BOTH {
            self.scores[side] += gains[side];
        }
        gains
    }

    /// When exactly one side is wiped out, the survivor collects everything left on the board.
    fn award_on_elimination(&mut self, log: &mut Vec<String>) {
        if !self.failures.is_empty() {
            return;
        }
        let alive = PerSide::new(self.living_count(Side::Player), self.living_count(Side::Opponent));
        let survivor = match (alive.player, alive.opponent) {
            (0, 0) => return,
            (0, _) => Side::Opponent,
            (_, 0) => Side::Player,
            _ => return,
        };
        let remaining = self.remaining_points();
        if remaining > 0 {
            self.scores[survivor] += remaining;
            self.pellets.clear();
            self.cherries.clear();
            log.push(format!(
                "{} eliminated: {survivor} collects the remaining {remaining} points",
                survivor.other()
            ));
        }
    }

    fn compute_outcome(&self) -> Option<MatchOutcome> {
        if !self.is_finished() {
            return None;
        }

        if let Some(first) = self.failures.first() {
            if self.failures.len() > 1 {
                return Some(MatchOutcome::new(None, EndReason::BothBotsFailed));
            }
            return Some(MatchOutcome::new(
                Some(first.side.other()),
                EndReason::BotFailure {
                    side: first.side,
                    reason: first.reason.clone(),
                },
            ));
        }

        let by_score = match self.scores.player.cmp(&self.scores.opponent) {
            std::cmp::Ordering::Greater => Some(Side::Player),
            std::cmp::Ordering::Less => Some(Side::Opponent),
            std::cmp::Ordering::Equal => None,
        };
        let alive = PerSide::new(self.living_count(Side::Player), self.living_count(Side::Opponent));
        let reason = if alive.player == 0 || alive.opponent == 0 {
            let survivor = match (alive.player, alive.opponent) {
                (0, 0) => None,
                (0, _) => Some(Side::Opponent),
                _ => Some(Side::Player),
            };
            EndReason::Elimination { survivor }
        } else if self.pellets.is_empty() && self.cherries.is_empty() {
            EndReason::BoardCleared
        } else if self.scores.player.abs_diff(self.scores.opponent) > self.remaining_points() {
            EndReason::InsurmountableLead
        } else {
            EndReason::MaxTurns
        };
        Some(MatchOutcome::new(by_score, reason))
    }
}

impl Engine for Game {
    fn protocol(&self) -> ProtocolDescription {
        ProtocolDescription::for_ruleset(&self.ruleset)
    }

    fn init_input(&self) -> String {
        protocol::encode_init(&self.grid)
    }

    fn bot_input(&self, side: Side) -> String {
        protocol::encode_turn(self, side)
    }

    /// Advance one turn:
    /// 1. Remove pacs that died last turn, tick ability timers
    /// 2. Apply SPEED / SWITCH
    /// 3. Resolve movement in micro-steps
    /// 4. Combat, then consumption
    /// 5. Bookkeeping, elimination award, history
    fn step(&mut self, orders: PerSide<Orders>) -> Result<TurnReport, EngineError> {
        if self.is_finished() {
            return Err(EngineError::MatchFinished { turn: self.turn });
        }

        let mut stdout: Vec<String> = Vec::new();
        let mut stderr: Vec<String> = Vec::new();

        for pac in self.pacs.iter().filter(|p| p.dead) {
            self.fallen.insert(pac.id);
        }
        self.pacs.retain(|p| p.is_alive());
        for pac in &mut self.pacs {
            pac.path_this_turn.clear();
            pac.tick();
        }

        for side in Side::BOTH {
            for fragment in &orders[side].dropped {
                stderr.push(format!("[{side}] {}", CommandError::Malformed(fragment.clone())));
            }
        }

        for side in Side::BOTH {
            for command in orders[side].commands.iter().filter(|c| c.is_ability()) {
                match self.apply_ability(side, command) {
                    Ok(note) => stdout.push(format!("[{side}] {note}")),
                    Err(e) => stderr.push(format!("[{side}] {e}")),
                }
            }
        }

        let mut routes = Vec::new();
        let mut planned = HashSet::new();
        for side in Side::BOTH {
            for command in &orders[side].commands {
                if let Command::Move { pac_id, x, y } = *command {
                    match self.plan_route(side, pac_id, x, y, &planned) {
                        Ok(route) => {
                            planned.insert(pac_id);
                            routes.push(route);
                        }
                        Err(e) => stderr.push(format!("[{side}] {e}")),
                    }
                }
            }
        }
        let collisions_before = stdout.len();
        resolve_movement(&mut self.pacs, &mut routes, &mut stdout);
        metrics::COLLISIONS_TOTAL.inc_by((stdout.len() - collisions_before) as u64);

        self.resolve_combat(&mut stdout);
        let gains = self.consume(&mut stdout);
        if gains.player > 0 || gains.opponent > 0 {
            tracing::debug!(turn = self.turn + 1, player = gains.player, opponent = gains.opponent, "points scored");
        }

        self.turn += 1;
        self.award_on_elimination(&mut stdout);

        let state = self.state();
        if let Some(outcome) = &state.outcome {
            stdout.push(outcome.final_message.clone());
            tracing::info!(
                turn = self.turn,
                player = self.scores.player,
                opponent = self.scores.opponent,
                "{}",
                outcome.final_message
            );
        }

        let report = TurnReport {
            state: state.clone(),
            stdout: stdout.join("\n"),
            stderr: stderr.join("\n"),
        };
        self.history.push(HistoryEntry {
            turn: self.turn,
            state,
            commands: PerSide::new(
                format_commands(&orders.player.commands),
                format_commands(&orders.opponent.commands),
            ),
            stdout: report.stdout.clone(),
            stderr: report.stderr.clone(),
        });
        Ok(report)
    }

    fn state(&self) -> GameSnapshot {
        GameSnapshot {
            turn: self.turn,
            pacs: self.pacs.clone(),
            pellets: self.pellets.iter().copied().collect(),
            cherries: self.cherries.iter().copied().collect(),
            scores: self.scores,
            finished: self.is_finished(),
            outcome: self.compute_outcome(),
        }
    }

    fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    fn is_finished(&self) -> bool {
        if !self.failures.is_empty() || self.turn >= self.ruleset.max_turns {
            return true;
        }
        if self.pellets.is_empty() && self.cherries.is_empty() {
            return true;
        }
        if self.living_count(Side::Player) == 0 || self.living_count(Side::Opponent) == 0 {
            return true;
        }
        self.scores.player.abs_diff(self.scores.opponent) > self.remaining_points()
    }

    fn outcome(&self) -> Option<MatchOutcome> {
        self.compute_outcome()
    }

    /// Record a bot failure: that side scores zero and the match ends now.
    ///
    /// A finished match is left alone, except that the other side may still fail on the same
    /// turn as the first failure.
    fn on_bot_failure(&mut self, side: Side, turn: u32, reason: &str) {
        if self.failures.iter().any(|f| f.side == side) {
            return;
        }
        if self.is_finished() && !self.failures.iter().any(|f| f.turn == turn) {
            tracing::debug!(%side, turn, reason, "bot failure after the match ended, ignored");
            return;
        }
        self.failures.push(BotFailure {
            side,
            turn,
            reason: reason.to_string(),
        });
        self.scores[side] = 0;
        self.turn = self.turn.max(self.ruleset.max_turns);

        let stderr = format!("Bot '{side}' failed on turn {turn}: {reason}");
        tracing::warn!(%side, turn, reason, "bot failure ends the match");
        let state = self.state();
        let stdout = state
            .outcome
            .as_ref()
            .map(|o| o.final_message.clone())
            .unwrap_or_default();
        self.history.push(HistoryEntry {
            turn: self.turn,
            state,
            commands: PerSide::default(),
            stdout,
            stderr,
        });
    }
}

/// Pick mirrored spawn cells: player pacs on the left half, opponent pacs on the mirrored cells.
fn spawn_pacs(grid: &Grid, ruleset: &Ruleset, rng: &mut StdRng) -> Result<Vec<Pac>, RulesetError> {
    let n = ruleset.pacs_per_side;
    let candidates: Vec<Pos> = grid
        .floor_cells()
        .into_iter()
        .filter(|p| p.x < grid.mirror(*p).x && grid.is_floor(grid.mirror(*p)))
        .collect();
    if candidates.len() < n {
        return Err(RulesetError::NotEnoughSpawnCells {
            needed: n,
            available: candidates.len(),
        });
    }

    let chosen: Vec<Pos> = candidates.choose_multiple(rng, n).copied().collect();
    let mut pacs = Vec::with_capacity(n * 2);
    for (side, offset) in [(Side::Player, 0), (Side::Opponent, n)] {
        for (i, &pos) in chosen.iter().enumerate() {
            let pac_type = if ruleset.typed_pacs {
                PacType::CYCLE[i % PacType::CYCLE.len()]
            } else {
                PacType::Neutral
            };
            let pos = match side {
                Side::Player => pos,
                Side::Opponent => grid.mirror(pos),
            };
            pacs.push(Pac::new((offset + i) as u32, side, pos, pac_type));
        }
    }
    Ok(pacs)
}

/// Turn pellets into cherries in mirrored pairs. An odd count uses a middle-column cell if
/// one exists. Returns the cherry cells; they are removed from `pellets`.
fn place_cherries(
    grid: &Grid,
    pellets: &mut BTreeSet<Pos>,
    count: usize,
    rng: &mut StdRng,
) -> BTreeSet<Pos> {
    let left: Vec<Pos> = pellets
        .iter()
        .copied()
        .filter(|p| p.x < grid.mirror(*p).x && pellets.contains(&grid.mirror(*p)))
        .collect();
    let mut cherries = BTreeSet::new();
    for &pos in left.choose_multiple(rng, count / 2) {
        cherries.insert(pos);
        cherries.insert(grid.mirror(pos));
    }
    if count % 2 == 1 {
        let middle: Vec<Pos> = pellets
            .iter()
            .copied()
            .filter(|p| grid.mirror(*p) == *p)
            .collect();
        if let Some(&pos) = middle.choose(rng) {
            cherries.insert(pos);
        }
    }
    if cherries.len() < count {
        tracing::debug!(requested = count, placed = cherries.len(), "fewer cherries than requested");
    }
    for pos in &cherries {
        pellets.remove(pos);
    }
    cherries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders(cmds: Vec<Command>) -> Orders {
        Orders::from(cmds)
    }

    fn none() -> Orders {
        Orders::default()
    }

    /// `#########` / `#       #` / `#########` with the given pacs and pellets.
    fn corridor_game(pacs: Vec<Pac>, pellets: &[usize]) -> Game {
        let grid = Grid::from_rows(&["#########", "#       #", "#########"]).unwrap();
        Game::from_parts(
            Ruleset::default(),
            grid,
            pacs,
            pellets.iter().map(|&x| Pos::new(x, 1)),
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_game_spawn_is_symmetric() {
        let game = Game::new(Ruleset::default(), 11).unwrap();
        let players: Vec<&Pac> = game.pacs().iter().filter(|p| p.owner == Side::Player).collect();
        let opponents: Vec<&Pac> = game.pacs().iter().filter(|p| p.owner == Side::Opponent).collect();
        assert_eq!(players.len(), 3);
        assert_eq!(opponents.len(), 3);
        for (p, o) in players.iter().zip(&opponents) {
            assert!(game.grid().is_floor(p.pos));
            assert_eq!(game.grid().mirror(p.pos), o.pos);
            assert_eq!(p.pac_type, o.pac_type);
        }
        assert_eq!(game.history().len(), 1);
        assert_eq!(game.history()[0].turn, 0);
        assert_eq!(game.cherries().len(), 6);
        assert!(game.pacs().iter().all(|p| !game.pellets().contains(&p.pos)));
    }

    #[test]
    fn test_new_game_is_deterministic() {
        let a = Game::new(Ruleset::default(), 5).unwrap();
        let b = Game::new(Ruleset::default(), 5).unwrap();
        assert_eq!(a.pacs(), b.pacs());
        assert_eq!(a.pellets(), b.pellets());
        assert_eq!(a.cherries(), b.cherries());
    }

    #[test]
    fn test_untyped_ruleset_spawns_neutral() {
        let ruleset = Ruleset {
            typed_pacs: false,
            ..Ruleset::default()
        };
        let game = Game::new(ruleset, 2).unwrap();
        assert!(game.pacs().iter().all(|p| p.pac_type == PacType::Neutral));
    }

    #[test]
    fn test_fog_rejected_at_init() {
        let ruleset = Ruleset {
            fog_of_war: true,
            ..Ruleset::default()
        };
        assert!(matches!(Game::new(ruleset, 1), Err(RulesetError::FogOfWarUnsupported)));
    }

    #[test]
    fn test_move_and_eat() {
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(1, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(7, 1), PacType::Rock),
        ];
        let mut game = corridor_game(pacs, &[2, 3, 5, 6]);
        let report = game
            .step(PerSide::new(
                orders(vec![Command::Move { pac_id: 0, x: 3, y: 1 }]),
                none(),
            ))
            .unwrap();
        assert_eq!(game.pac(0).unwrap().pos, Pos::new(2, 1));
        assert_eq!(report.state.scores, PerSide::new(1, 0));
        assert_eq!(game.turn(), 1);
        assert_eq!(game.history().len(), 2);
        assert_eq!(game.history()[1].commands.player, "MOVE 0 3 1");
    }

    #[test]
    fn test_command_rejections_are_diagnostics() {
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(1, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(7, 1), PacType::Rock),
        ];
        let mut game = corridor_game(pacs, &[4]);
        let report = game
            .step(PerSide::new(
                Orders {
                    commands: vec![
                        Command::Move { pac_id: 1, x: 2, y: 1 },
                        Command::Move { pac_id: 0, x: 1, y: 1 },
                        Command::Move { pac_id: 0, x: 4, y: 0 },
                        Command::Speed { pac_id: 9 },
                        Command::Move { pac_id: 0, x: 2, y: 1 },
                    ],
                    dropped: vec!["JUMP 0".to_string()],
                },
                none(),
            ))
            .unwrap();
        assert!(report.stderr.contains("malformed command 'JUMP 0'"));
        assert!(report.stderr.contains("pac 1 is not owned by player"));
        assert!(report.stderr.contains("pac 0 is already at (1, 1)"));
        assert!(report.stderr.contains("no path for pac 0 to (4, 0)"));
        assert!(report.stderr.contains("pac 9 does not exist"));
        // The valid command still went through.
        assert_eq!(game.pac(0).unwrap().pos, Pos::new(2, 1));
    }

    #[test]
    fn test_duplicate_move_keeps_first() {
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(3, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(5, 1), PacType::Paper),
        ];
        let mut game = corridor_game(pacs, &[7]);
        let report = game
            .step(PerSide::new(
                orders(vec![
                    Command::Move { pac_id: 0, x: 1, y: 1 },
                    Command::Move { pac_id: 0, x: 7, y: 1 },
                ]),
                none(),
            ))
            .unwrap();
        assert_eq!(game.pac(0).unwrap().pos, Pos::new(2, 1));
        assert!(report.stderr.contains("already has a move"));
    }

    #[test]
    fn test_abilities_disabled_by_ruleset() {
        let grid = Grid::from_rows(&["#########", "#       #", "#########"]).unwrap();
        let ruleset = Ruleset {
            speed_ability_enabled: false,
            switch_ability_enabled: false,
            ..Ruleset::default()
        };
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(1, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(7, 1), PacType::Rock),
        ];
        let mut game = Game::from_parts(ruleset, grid, pacs, [Pos::new(4, 1)], Vec::new()).unwrap();
        let report = game
            .step(PerSide::new(
                orders(vec![
                    Command::Speed { pac_id: 0 },
                    Command::Switch {
                        pac_id: 0,
                        target: PacType::Paper,
                    },
                ]),
                none(),
            ))
            .unwrap();
        assert!(report.stderr.contains("SPEED: disabled by ruleset"));
        assert!(report.stderr.contains("SWITCH: disabled by ruleset"));
        assert_eq!(game.pac(0).unwrap().speed, 1);
        assert_eq!(game.pac(0).unwrap().pac_type, PacType::Rock);
    }

    #[test]
    fn test_switch_sets_cooldown() {
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(1, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(7, 1), PacType::Rock),
        ];
        let mut game = corridor_game(pacs, &[4]);
        game.step(PerSide::new(
            orders(vec![Command::Switch {
                pac_id: 0,
                target: PacType::Scissors,
            }]),
            none(),
        ))
        .unwrap();
        let pac = game.pac(0).unwrap();
        assert_eq!(pac.pac_type, PacType::Scissors);
        assert_eq!(pac.ability_cooldown, ABILITY_COOLDOWN);
    }

    #[test]
    fn test_speed_applies_to_same_turn_move() {
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(1, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(7, 1), PacType::Rock),
        ];
        let mut game = corridor_game(pacs, &[5]);
        game.step(PerSide::new(
            orders(vec![
                Command::Move { pac_id: 0, x: 4, y: 1 },
                Command::Speed { pac_id: 0 },
            ]),
            none(),
        ))
        .unwrap();
        let pac = game.pac(0).unwrap();
        assert_eq!(pac.pos, Pos::new(3, 1));
        assert_eq!(pac.path_this_turn, vec![Pos::new(2, 1), Pos::new(3, 1)]);
    }

    #[test]
    fn test_attackers_cannot_stack_on_victim() {
        // Player pac 5 (Paper) sits between opponent Scissors pacs 1 and 0 that both move onto it.
        // Same-side pacs never share a cell, so a victim faces at most one enemy per turn.
        let pacs = vec![
            Pac::new(0, Side::Opponent, Pos::new(5, 1), PacType::Scissors),
            Pac::new(1, Side::Opponent, Pos::new(3, 1), PacType::Scissors),
            Pac::new(5, Side::Player, Pos::new(4, 1), PacType::Paper),
        ];
        let mut game = corridor_game(pacs, &[1, 7]);
        game.step(PerSide::new(
            none(),
            orders(vec![
                Command::Move { pac_id: 1, x: 4, y: 1 },
                Command::Move { pac_id: 0, x: 4, y: 1 },
            ]),
        ))
        .unwrap();
        // The two scissors share a type, so both are rolled back and nobody fights.
        assert!(game.pac(5).unwrap().is_alive());

        // One at a time: pac 1 moves in and kills.
        game.step(PerSide::new(
            none(),
            orders(vec![Command::Move { pac_id: 1, x: 4, y: 1 }]),
        ))
        .unwrap();
        let victim = game.pac(5).unwrap();
        assert!(victim.dead);
        assert_eq!(victim.killed_by, Some(1));
    }

    #[test]
    fn test_dead_pac_removed_next_turn_and_rejected() {
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(3, 1), PacType::Rock),
            Pac::new(1, Side::Player, Pos::new(1, 1), PacType::Paper),
            Pac::new(2, Side::Opponent, Pos::new(4, 1), PacType::Paper),
            Pac::new(3, Side::Opponent, Pos::new(7, 1), PacType::Rock),
        ];
        let mut game = corridor_game(pacs, &[2, 5, 6]);
        game.step(PerSide::new(
            none(),
            orders(vec![Command::Move { pac_id: 2, x: 3, y: 1 }]),
        ))
        .unwrap();
        assert!(game.pac(0).unwrap().dead);
        assert_eq!(game.state().pacs.len(), 4);

        let report = game
            .step(PerSide::new(
                orders(vec![Command::Move { pac_id: 0, x: 2, y: 1 }]),
                none(),
            ))
            .unwrap();
        assert!(game.pac(0).is_none());
        assert!(report.stderr.contains("pac 0 is dead"));
    }

    #[test]
    fn test_elimination_awards_remaining_points() {
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(3, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(4, 1), PacType::Paper),
        ];
        let grid = Grid::from_rows(&["#########", "#       #", "#########"]).unwrap();
        let mut game = Game::from_parts(
            Ruleset::default(),
            grid,
            pacs,
            [Pos::new(1, 1), Pos::new(6, 1)],
            [Pos::new(7, 1)],
        )
        .unwrap();
        let report = game
            .step(PerSide::new(
                none(),
                orders(vec![Command::Move { pac_id: 1, x: 3, y: 1 }]),
            ))
            .unwrap();
        assert!(game.is_finished());
        assert_eq!(game.scores(), PerSide::new(0, 12));
        let outcome = report.state.outcome.unwrap();
        assert_eq!(outcome.winner, Some(Side::Opponent));
        assert_eq!(
            outcome.reason,
            EndReason::Elimination {
                survivor: Some(Side::Opponent)
            }
        );
    }

    #[test]
    fn test_insurmountable_lead_ends_early() {
        let grid = Grid::from_rows(&["#########", "#       #", "#########"]).unwrap();
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(1, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(7, 1), PacType::Rock),
        ];
        let mut game =
            Game::from_parts(Ruleset::default(), grid, pacs, [Pos::new(6, 1)], [Pos::new(2, 1)])
                .unwrap();
        game.step(PerSide::new(
            orders(vec![Command::Move { pac_id: 0, x: 2, y: 1 }]),
            none(),
        ))
        .unwrap();
        assert_eq!(game.scores(), PerSide::new(10, 0));
        assert!(game.is_finished());
        assert_eq!(game.outcome().unwrap().reason, EndReason::InsurmountableLead);
    }

    #[test]
    fn test_max_turns() {
        let grid = Grid::from_rows(&["#########", "#       #", "#########"]).unwrap();
        let ruleset = Ruleset {
            max_turns: 2,
            ..Ruleset::default()
        };
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(1, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(7, 1), PacType::Rock),
        ];
        let mut game = Game::from_parts(ruleset, grid, pacs, [Pos::new(4, 1)], Vec::new()).unwrap();
        game.step(PerSide::default()).unwrap();
        assert!(!game.is_finished());
        game.step(PerSide::default()).unwrap();
        assert!(game.is_finished());
        let outcome = game.outcome().unwrap();
        assert_eq!(outcome.reason, EndReason::MaxTurns);
        assert_eq!(outcome.final_message, "Draw");
        assert_eq!(
            game.step(PerSide::default()).unwrap_err(),
            EngineError::MatchFinished { turn: 2 }
        );
    }

    #[test]
    fn test_bot_failure_forfeits() {
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(1, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(7, 1), PacType::Rock),
        ];
        let mut game = corridor_game(pacs, &[2, 3, 4]);
        game.step(PerSide::new(
            orders(vec![Command::Move { pac_id: 0, x: 2, y: 1 }]),
            none(),
        ))
        .unwrap();
        game.on_bot_failure(Side::Player, 2, "timeout");
        assert!(game.is_finished());
        assert_eq!(game.turn(), game.ruleset().max_turns);
        assert_eq!(game.scores().player, 0);
        assert_eq!(game.failed_side(), Some(Side::Player));

        let last = game.history().last().unwrap();
        assert_eq!(last.stderr, "Bot 'player' failed on turn 2: timeout");
        let outcome = game.outcome().unwrap();
        assert_eq!(outcome.winner, Some(Side::Opponent));
        assert_eq!(outcome.final_message, "Winner: opponent (player failed: timeout)");
    }

    #[test]
    fn test_both_bots_failing_is_a_draw() {
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(1, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(7, 1), PacType::Rock),
        ];
        let mut game = corridor_game(pacs, &[4]);
        game.on_bot_failure(Side::Player, 1, "crash");
        game.on_bot_failure(Side::Opponent, 1, "timeout");
        game.on_bot_failure(Side::Opponent, 1, "timeout");
        assert_eq!(game.failures().len(), 2);
        let outcome = game.outcome().unwrap();
        assert_eq!(outcome.winner, None);
        assert_eq!(outcome.reason, EndReason::BothBotsFailed);
    }

    #[test]
    fn test_failure_after_finish_is_ignored() {
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(1, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(7, 1), PacType::Rock),
        ];
        let mut game = corridor_game(pacs, &[2]);
        game.step(PerSide::new(
            orders(vec![Command::Move { pac_id: 0, x: 2, y: 1 }]),
            none(),
        ))
        .unwrap();
        assert!(game.is_finished());
        let before = game.outcome().unwrap();
        assert_eq!(before.reason, EndReason::BoardCleared);
        let history_len = game.history().len();

        game.on_bot_failure(Side::Player, 2, "late crash");
        assert!(game.failures().is_empty());
        assert_eq!(game.scores(), PerSide::new(1, 0));
        assert_eq!(game.outcome().unwrap(), before);
        assert_eq!(game.history().len(), history_len);
    }

    #[test]
    fn test_second_failure_on_later_turn_is_ignored() {
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(1, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(7, 1), PacType::Rock),
        ];
        let mut game = corridor_game(pacs, &[4]);
        game.on_bot_failure(Side::Player, 1, "crash");
        game.on_bot_failure(Side::Opponent, 2, "timeout");
        assert_eq!(game.failures().len(), 1);
        assert_eq!(game.outcome().unwrap().winner, Some(Side::Opponent));
    }
}
