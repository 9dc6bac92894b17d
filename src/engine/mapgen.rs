// Maze generation: greedy polyomino tiling on a coarse lattice, corridors carved between pieces,
// mirrored into a horizontally symmetric grid with single-cell wrap tunnels.

use std::collections::{BTreeSet, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::config::*;
use super::grid::{Cell, Grid, Pos};
use crate::error::RulesetError;

/// Regeneration attempts before giving up on a symmetric, connected layout.
const MAX_ATTEMPTS: usize = 32;

/// Directions checked when carving, in the same up, right, down, left order as the pathfinder.
const DIRS: [(i32, i32); 4] = [(0, -1), (1, 0), (0, 1), (-1, 0)];

/// A polyomino in lattice units, anchored at (0, 0).
#[derive(Clone, Debug, PartialEq, Eq)]
struct Piece {
    blocks: BTreeSet<(i32, i32)>,
}

impl Piece {
    fn new(blocks: &[(i32, i32)]) -> Self {
        Piece {
            blocks: blocks.iter().copied().collect(),
        }
    }

    fn max_x(&self) -> i32 {
        self.blocks.iter().map(|b| b.0).max().unwrap_or(0)
    }

    fn max_y(&self) -> i32 {
        self.blocks.iter().map(|b| b.1).max().unwrap_or(0)
    }

    fn flip_x(&self) -> Self {
        let mx = self.max_x();
        Piece {
            blocks: self.blocks.iter().map(|&(x, y)| (mx - x, y)).collect(),
        }
    }

    fn flip_y(&self) -> Self {
        let my = self.max_y();
        Piece {
            blocks: self.blocks.iter().map(|&(x, y)| (x, my - y)).collect(),
        }
    }

    fn transpose(&self) -> Self {
        Piece {
            blocks: self.blocks.iter().map(|&(x, y)| (y, x)).collect(),
        }
    }

    fn fits(&self, occupied: &HashSet<(i32, i32)>, at: (i32, i32)) -> bool {
        self.blocks
            .iter()
            .all(|&(bx, by)| !occupied.contains(&(at.0 + bx, at.1 + by)))
    }
}

/// The piece catalog: square, L, vertical T, cross and horizontal T with their reflections.
fn catalog() -> Vec<Piece> {
    let mut pieces = vec![Piece::new(&[(0, 0), (1, 0), (0, 1), (1, 1)])];

    let l = Piece::new(&[(0, 0), (0, 1), (1, 1)]);
    pieces.extend([l.flip_x(), l.flip_y(), l.transpose(), l]);

    let vt = Piece::new(&[(0, 0), (0, 1), (1, 1), (0, 2)]);
    pieces.extend([vt.flip_x(), vt.transpose(), vt.transpose().flip_y(), vt]);

    pieces.push(Piece::new(&[(1, 0), (0, 1), (1, 1), (2, 1), (1, 2)]));

    let ht = Piece::new(&[(0, 0), (0, 1), (1, 1), (2, 1)]);
    pieces.extend([
        ht.flip_x(),
        ht.flip_y(),
        ht.flip_y().flip_x(),
        ht.transpose().flip_y().flip_x(),
        ht.transpose(),
        ht.transpose().flip_y(),
        ht.transpose().flip_x(),
        ht,
    ]);
    pieces
}

/// Seedable maze generator. The same seed and dimensions always yield the same grid.
pub struct MapGenerator {
    rng: StdRng,
    pieces: Vec<Piece>,
}

impl MapGenerator {
    pub fn new(seed: u64) -> Self {
        MapGenerator {
            rng: StdRng::seed_from_u64(seed),
            pieces: catalog(),
        }
    }

    /// Generate a full `width x height` grid.
    ///
    /// Steps:
    /// 1. Tile the left half (`width/2 + 1` columns) and carve corridors
    /// 2. Mirror it across the vertical midline
    /// 3. Wall the top and bottom rows
    /// 4. Collapse floor runs on the left/right edges to one-cell tunnels
    /// 5. Keep only the largest connected floor region
    ///
    /// A layout whose surviving region is not mirror-symmetric is discarded and regenerated
    /// from the same random stream.
    pub fn generate(&mut self, width: usize, height: usize) -> Result<Grid, RulesetError> {
        if !(MIN_WIDTH..=MAX_WIDTH).contains(&width) || !(MIN_HEIGHT..=MAX_HEIGHT).contains(&height)
        {
            return Err(RulesetError::Dimensions { width, height });
        }

        for attempt in 0..MAX_ATTEMPTS {
            let grid = self.generate_once(width, height);
            if grid.is_mirror_symmetric() && !grid.floor_cells().is_empty() {
                return Ok(grid);
            }
            tracing::debug!(attempt, width, height, "discarding asymmetric maze");
        }
        Err(RulesetError::InvalidLayout(format!(
            "no symmetric {width}x{height} maze after {MAX_ATTEMPTS} attempts"
        )))
    }

    fn generate_once(&mut self, width: usize, height: usize) -> Grid {
        let half_w = width / 2 + 1;
        let half = self.generate_half(half_w, height);

        let mut grid = Grid::new(width, height);
        for y in 0..height {
            for x in 0..half_w.min(width) {
                if half.is_floor(Pos::new(x, y)) {
                    grid.set(Pos::new(x, y), Cell::Floor);
                    grid.set(Pos::new(width - 1 - x, y), Cell::Floor);
                }
            }
        }

        for x in 0..width {
            grid.set(Pos::new(x, 0), Cell::Wall);
            grid.set(Pos::new(x, height - 1), Cell::Wall);
        }

        collapse_edge_tunnels(&mut grid, 0);
        collapse_edge_tunnels(&mut grid, width - 1);

        grid.keep_largest_region();
        grid
    }

    /// Tile the coarse lattice and carve a grid of the given size.
    fn generate_half(&mut self, width: usize, height: usize) -> Grid {
        let gen_w = (width / 2 + 1) as i32;
        let gen_h = (height / 2 + 1) as i32;

        let mut occupied: HashSet<(i32, i32)> = HashSet::new();
        let mut origin_of: HashMap<(i32, i32), (i32, i32)> = HashMap::new();
        let mut placed: HashMap<(i32, i32), Piece> = HashMap::new();

        for y in 0..gen_h {
            for x in 0..gen_w {
                let at = (x, y);
                if occupied.contains(&at) {
                    continue;
                }
                self.pieces.shuffle(&mut self.rng);
                let fitting: Vec<&Piece> = self
                    .pieces
                    .iter()
                    .filter(|p| p.fits(&occupied, at))
                    .collect();
                // A lone fitting piece is skipped, which leaves open areas in the maze.
                if fitting.len() > 1 {
                    let piece = fitting[1].clone();
                    for &(bx, by) in &piece.blocks {
                        let block = (x + bx, y + by);
                        occupied.insert(block);
                        origin_of.insert(block, at);
                    }
                    placed.insert(at, piece);
                }
            }
        }

        let mut grid = Grid::new(width, height);
        for y in 1..gen_h {
            for x in 1..gen_w {
                let Some(&origin) = origin_of.get(&(x, y)) else {
                    continue;
                };
                let Some(piece) = placed.get(&origin) else {
                    continue;
                };
                let (gx, gy) = (x * 2 - 1, y * 2 - 1);
                if gx as usize >= width || gy as usize >= height {
                    continue;
                }
                let block = (x - origin.0, y - origin.1);
                for (dx, dy) in DIRS {
                    if piece.blocks.contains(&(block.0 + dx, block.1 + dy)) {
                        continue;
                    }
                    for i in 0..3 {
                        let (cx, cy) = if dx == 0 {
                            (gx - 1 + i, gy + dy)
                        } else {
                            (gx + dx, gy - 1 + i)
                        };
                        if cx >= 0 && cy >= 0 && (cx as usize) < width && (cy as usize) < height {
                            grid.set(Pos::new(cx as usize, cy as usize), Cell::Floor);
                        }
                    }
                }
            }
        }
        grid
    }
}

/// Reduce every vertical floor run in column `x` to its middle cell.
fn collapse_edge_tunnels(grid: &mut Grid, x: usize) {
    let mut y = 1;
    while y + 1 < grid.height {
        if !grid.is_floor(Pos::new(x, y)) {
            y += 1;
            continue;
        }
        let start = y;
        while y + 1 < grid.height && grid.is_floor(Pos::new(x, y)) {
            y += 1;
        }
        let end = y - 1;
        if end > start {
            let mid = (start + end) / 2;
            for cy in start..=end {
                if cy != mid {
                    grid.set(Pos::new(x, cy), Cell::Wall);
                }
            }
        }
    }
}

/// Convenience wrapper: generate one grid from a seed.
pub fn generate(width: usize, height: usize, seed: u64) -> Result<Grid, RulesetError> {
    MapGenerator::new(seed).generate(width, height)
}
