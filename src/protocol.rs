// Wire protocol between the referee and bots: line-based text in, one pipe-separated line out.

use serde::Serialize;

use crate::engine::command::{Command, Orders};
use crate::engine::game::Game;
use crate::engine::grid::Grid;
use crate::engine::pac::{PacType, Side};
use crate::engine::ruleset::Ruleset;

/// What a bot author needs to know about a match before it starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtocolDescription {
    pub max_turns: u32,
    pub per_turn_deadline_ms: u64,
    pub memory_cap_mb: u64,
    pub cpu_cap: f64,
    pub pids_cap: u32,
    pub pacs_per_side: usize,
    pub init_inputs: &'static str,
    pub turn_inputs: &'static str,
    pub turn_output: &'static str,
}

impl ProtocolDescription {
    pub fn for_ruleset(ruleset: &Ruleset) -> Self {
        ProtocolDescription {
            max_turns: ruleset.max_turns,
            per_turn_deadline_ms: ruleset.turn_deadline_ms,
            memory_cap_mb: ruleset.memory_mb,
            cpu_cap: ruleset.cpus,
            pids_cap: ruleset.pids,
            pacs_per_side: ruleset.pacs_per_side,
            init_inputs: "width height, then height rows of '#' (wall) and ' ' (floor)",
            turn_inputs: "myScore opponentScore; pac count; pacs as 'id mine x y type speedTurnsLeft abilityCooldown'; \
                          collectible count; collectibles as 'x y value'",
            turn_output: "commands separated by '|': MOVE <id> <x> <y> | SPEED <id> | SWITCH <id> <ROCK|PAPER|SCISSORS>",
        }
    }
}

/// The map block sent once before the first turn.
pub fn encode_init(grid: &Grid) -> String {
    let mut out = format!("{} {}\n", grid.width, grid.height);
    for row in grid.to_rows() {
        out.push_str(&row);
        out.push('\n');
    }
    out
}

/// Per-turn input for `side`. Every pac and collectible is visible.
pub fn encode_turn(game: &Game, side: Side) -> String {
    let scores = game.scores();
    let mut lines = vec![format!("{} {}", scores[side], scores[side.other()])];

    let pacs: Vec<_> = game.living_pacs().collect();
    lines.push(pacs.len().to_string());
    for pac in pacs {
        lines.push(format!(
            "{} {} {} {} {} {} {}",
            pac.id,
            u8::from(pac.owner == side),
            pac.pos.x,
            pac.pos.y,
            pac.pac_type.code(),
            pac.ability_duration,
            pac.ability_cooldown
        ));
    }

    let cherry_score = game.ruleset().cherry_score;
    lines.push((game.pellets().len() + game.cherries().len()).to_string());
    for pos in game.pellets() {
        lines.push(format!("{} {} 1", pos.x, pos.y));
    }
    for pos in game.cherries() {
        lines.push(format!("{} {} {}", pos.x, pos.y, cherry_score));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Parse a bot's raw stdout. Only the first non-empty line counts; each `|` fragment is parsed
/// on its own and bad fragments are reported in [`Orders::dropped`].
pub fn parse_output(raw: &str) -> Orders {
    let mut orders = Orders::default();
    let Some(line) = raw.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return orders;
    };

    for fragment in line.split('|').map(str::trim).filter(|f| !f.is_empty()) {
        match parse_command(fragment) {
            Some(command) => orders.commands.push(command),
            None => orders.dropped.push(fragment.to_string()),
        }
    }
    orders
}

/// Parse a single command. Trailing tokens after the required arguments are ignored.
pub fn parse_command(fragment: &str) -> Option<Command> {
    let tokens: Vec<&str> = fragment.split_whitespace().collect();
    let keyword = tokens.first()?.to_ascii_uppercase();
    let pac_id = tokens.get(1)?.parse::<u32>().ok()?;

    match keyword.as_str() {
        "MOVE" => {
            let x = tokens.get(2)?.parse::<i32>().ok()?;
            let y = tokens.get(3)?.parse::<i32>().ok()?;
            Some(Command::Move { pac_id, x, y })
        }
        "SPEED" => Some(Command::Speed { pac_id }),
        "SWITCH" => {
            let target = PacType::from_name(tokens.get(2)?)?;
            if target == PacType::Neutral {
                return None;
            }
            Some(Command::Switch { pac_id, target })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::command::format_commands;
    use crate::engine::grid::Pos;
    use crate::engine::pac::Pac;

    fn small_game() -> Game {
        let grid = Grid::from_rows(&["#######", "#     #", "#######"]).unwrap();
        let pacs = vec![
            Pac::new(0, Side::Player, Pos::new(1, 1), PacType::Rock),
            Pac::new(1, Side::Opponent, Pos::new(5, 1), PacType::Neutral),
        ];
        Game::from_parts(
            Ruleset::default(),
            grid,
            pacs,
            [Pos::new(2, 1), Pos::new(4, 1)],
            [Pos::new(3, 1)],
        )
        .unwrap()
    }

    #[test]
    fn test_encode_init() {
        let grid = Grid::from_rows(&["#####", "     ", "#####"]).unwrap();
        assert_eq!(encode_init(&grid), "5 3\n#####\n     \n#####\n");
    }

    #[test]
    fn test_encode_turn_for_each_side() {
        let game = small_game();
        assert_eq!(
            encode_turn(&game, Side::Player),
            "0 0\n2\n0 1 1 1 0 0 0\n1 0 5 1 -1 0 0\n3\n2 1 1\n4 1 1\n3 1 10\n"
        );
        let opp = encode_turn(&game, Side::Opponent);
        assert!(opp.contains("\n0 0 1 1 0 0 0\n1 1 5 1 -1 0 0\n"));
    }

    #[test]
    fn test_parse_takes_first_non_empty_line() {
        let orders = parse_output("\n   \nMOVE 0 3 4|speed 1\nMOVE 2 2 2\n");
        assert_eq!(
            orders.commands,
            vec![Command::Move { pac_id: 0, x: 3, y: 4 }, Command::Speed { pac_id: 1 }]
        );
        assert!(orders.dropped.is_empty());
    }

    #[test]
    fn test_parse_drops_bad_fragments_individually() {
        let orders = parse_output("MOVE 0 1 | JUMP 2 | SWITCH 1 LIZARD | SWITCH 2 scissors | MOVE x 1 1 | SWITCH 3 NEUTRAL");
        assert_eq!(
            orders.commands,
            vec![Command::Switch {
                pac_id: 2,
                target: PacType::Scissors
            }]
        );
        assert_eq!(
            orders.dropped,
            vec!["MOVE 0 1", "JUMP 2", "SWITCH 1 LIZARD", "MOVE x 1 1", "SWITCH 3 NEUTRAL"]
        );
    }

    #[test]
    fn test_parse_ignores_trailing_tokens() {
        assert_eq!(
            parse_command("MOVE 1 5 6 chasing"),
            Some(Command::Move { pac_id: 1, x: 5, y: 6 })
        );
    }

    #[test]
    fn test_empty_output_means_no_commands() {
        assert_eq!(parse_output(""), Orders::default());
        assert_eq!(parse_output("\n\n"), Orders::default());
        let orders = parse_output("garbage");
        assert!(orders.commands.is_empty());
        assert_eq!(orders.dropped, vec!["garbage"]);
    }

    #[test]
    fn test_echoed_commands_parse_back() {
        let commands = vec![
            Command::Move { pac_id: 0, x: 3, y: 1 },
            Command::Speed { pac_id: 0 },
            Command::Switch {
                pac_id: 1,
                target: PacType::Paper,
            },
        ];
        let parsed = parse_output(&format_commands(&commands));
        assert_eq!(parsed.commands, commands);
    }

    #[test]
    fn test_protocol_description() {
        let d = ProtocolDescription::for_ruleset(&Ruleset::default());
        assert_eq!(d.max_turns, 200);
        assert_eq!(d.per_turn_deadline_ms, 1000);
        assert_eq!(d.memory_cap_mb, 64);
        assert_eq!(d.pacs_per_side, 3);
    }
}
