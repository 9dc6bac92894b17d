// Randomized whole-game checks: bots issue random orders and the rules must hold every turn.

use std::collections::{BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use pac_arena::engine::command::{Command, Orders};
use pac_arena::engine::config::PELLET_SCORE;
use pac_arena::engine::game::{Engine, Game};
use pac_arena::engine::grid::Pos;
use pac_arena::engine::pac::{PacType, PerSide, Side};
use pac_arena::engine::ruleset::{League, Ruleset};

fn random_orders(game: &Game, side: Side, rng: &mut StdRng) -> Orders {
    let floor = game.grid().floor_cells();
    let mut commands = Vec::new();
    for pac in game.living_pacs().filter(|p| p.owner == side) {
        let command = match rng.gen_range(0..10) {
            0 => Command::Speed { pac_id: pac.id },
            1 => Command::Switch {
                pac_id: pac.id,
                target: PacType::CYCLE[rng.gen_range(0..3)],
            },
            _ => {
                let target = floor[rng.gen_range(0..floor.len())];
                Command::Move {
                    pac_id: pac.id,
                    x: target.x as i32,
                    y: target.y as i32,
                }
            }
        };
        commands.push(command);
    }
    Orders::from(commands)
}

fn check_invariants(game: &Game) {
    let mut cells: HashMap<_, Vec<_>> = HashMap::new();
    for pac in game.living_pacs() {
        assert!(game.grid().is_floor(pac.pos), "pac {} off the floor", pac.id);
        assert!(pac.speed == 1 || pac.speed == 2);
        cells.entry(pac.pos).or_default().push(pac);
    }
    for (pos, pacs) in cells {
        for (i, a) in pacs.iter().enumerate() {
            for b in &pacs[i + 1..] {
                assert!(!a.blocks(b), "pacs {} and {} share {pos}", a.id, b.id);
            }
        }
    }
    for pos in game.pellets() {
        assert!(!game.cherries().contains(pos));
    }
}

/// Points each side should have earned from the collectibles that left the board this turn.
fn expected_gains(game: &Game, pellets: &BTreeSet<Pos>, cherries: &BTreeSet<Pos>) -> PerSide<u32> {
    let mut gains = PerSide::<u32>::default();
    let eaten = pellets
        .difference(game.pellets())
        .map(|pos| (pos, PELLET_SCORE))
        .chain(
            cherries
                .difference(game.cherries())
                .map(|pos| (pos, game.ruleset().cherry_score)),
        );
    for (pos, value) in eaten {
        for side in Side::BOTH {
            if game.living_pacs().any(|p| p.owner == side && p.pos == *pos) {
                gains[side] += value;
            }
        }
    }
    gains
}

fn check_neutral_pacs_never_fight(game: &Game) {
    for pac in game.pacs().iter().filter(|p| p.dead) {
        assert_ne!(pac.pac_type, PacType::Neutral, "neutral pac {} died", pac.id);
        let killer = pac.killed_by.and_then(|id| game.pac(id)).unwrap();
        assert_ne!(killer.pac_type, PacType::Neutral, "neutral pac {} killed", killer.id);
    }
}

fn play_random(ruleset: Ruleset, seed: u64) -> Game {
    let mut game = Game::new(ruleset, seed).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut last_scores = game.scores();
    let mut last_remaining = game.remaining_points();

    while !game.is_finished() {
        let orders = PerSide::new(
            random_orders(&game, Side::Player, &mut rng),
            random_orders(&game, Side::Opponent, &mut rng),
        );
        let pellets = game.pellets().clone();
        let cherries = game.cherries().clone();
        game.step(orders).unwrap();
        check_invariants(&game);
        check_neutral_pacs_never_fight(&game);

        let scores = game.scores();
        // Wiping out a side hands the survivor the rest of the board.
        let eliminated = Side::BOTH
            .iter()
            .any(|side| game.living_pacs().all(|p| p.owner != *side));
        if !eliminated {
            let gains = expected_gains(&game, &pellets, &cherries);
            assert_eq!(scores.player - last_scores.player, gains.player);
            assert_eq!(scores.opponent - last_scores.opponent, gains.opponent);
        }
        assert!(scores.player >= last_scores.player);
        assert!(scores.opponent >= last_scores.opponent);
        assert!(game.remaining_points() <= last_remaining);
        last_scores = scores;
        last_remaining = game.remaining_points();
    }
    game
}

#[test]
fn test_random_games_respect_rules() {
    for seed in 0..12 {
        let game = play_random(Ruleset::default(), seed);
        assert!(game.turn() <= game.ruleset().max_turns);
        let outcome = game.outcome().unwrap();
        match outcome.winner {
            Some(side) => assert!(game.scores()[side] >= game.scores()[side.other()]),
            None => assert_eq!(game.scores().player, game.scores().opponent),
        }
        assert_eq!(game.history().len() as u32, game.turn() + 1);
    }
}

#[test]
fn test_random_games_in_every_league() {
    for league in [League::Wood2, League::Wood1, League::Bronze, League::Gold] {
        for seed in 0..3 {
            let ruleset = Ruleset::for_league(league, seed);
            let game = play_random(ruleset, seed);
            assert!(game.is_finished());
        }
    }
}

#[test]
fn test_same_seed_same_game() {
    let a = play_random(Ruleset::default(), 99);
    let b = play_random(Ruleset::default(), 99);
    assert_eq!(a.turn(), b.turn());
    assert_eq!(a.scores(), b.scores());
    assert_eq!(a.pacs(), b.pacs());
}
