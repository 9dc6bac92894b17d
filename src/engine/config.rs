// Rule constants shared by the turn engine, the ruleset and the protocol codec.

// Abilities
pub const SPEED_DURATION: u32 = 6;
pub const ABILITY_COOLDOWN: u32 = 10;
pub const MAX_SPEED: u32 = 2;
pub const BASE_SPEED: u32 = 1;

// Collectibles
pub const PELLET_SCORE: u32 = 1;
pub const DEFAULT_CHERRY_SCORE: u32 = 10;
pub const DEFAULT_NUM_CHERRIES: usize = 6;

// Match defaults
pub const DEFAULT_WIDTH: usize = 19;
pub const DEFAULT_HEIGHT: usize = 11;
pub const DEFAULT_PACS_PER_SIDE: usize = 3;
pub const DEFAULT_MAX_TURNS: u32 = 200;

// Sandbox limits advertised to bots
pub const DEFAULT_TURN_DEADLINE_MS: u64 = 1000;
pub const DEFAULT_MEMORY_MB: u64 = 64;
pub const DEFAULT_CPUS: f64 = 0.5;
pub const DEFAULT_PIDS: u32 = 64;

// Grid bounds accepted by the generator
pub const MIN_WIDTH: usize = 5;
pub const MIN_HEIGHT: usize = 3;
pub const MAX_WIDTH: usize = 63;
pub const MAX_HEIGHT: usize = 31;

// Wire glyphs for the initial map block
pub const WALL_CHAR: char = '#';
pub const FLOOR_CHAR: char = ' ';

/// Safety bound on collision rollback passes within one micro-step.
pub const MAX_COLLISION_PASSES: usize = 64;
