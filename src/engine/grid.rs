// Grid: immutable wall/floor layout with horizontal wraparound at the left/right edges.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::config::*;
use crate::error::RulesetError;

/// A single cell of the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cell {
    Wall,
    Floor,
}

/// A cell coordinate. `x` grows to the right, `y` grows downward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pos {
    pub x: usize,
    pub y: usize,
}

impl Pos {
    pub const fn new(x: usize, y: usize) -> Self {
        Pos { x, y }
    }
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// The playing field. Row-major, `cells[y * width + x]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grid {
    pub width: usize,
    pub height: usize,
    cells: Vec<Cell>,
}

/// Serializable view of a grid, rows of `#` and ` `.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub width: usize,
    pub height: usize,
    pub rows: Vec<String>,
}

impl Grid {
    /// Create a grid with every cell a wall.
    pub fn new(width: usize, height: usize) -> Self {
        Grid {
            width,
            height,
            cells: vec![Cell::Wall; width * height],
        }
    }

    /// Parse rows of `#` (wall) and anything else (floor). All rows must have equal length.
    pub fn from_rows<S: AsRef<str>>(rows: &[S]) -> Result<Self, RulesetError> {
        let height = rows.len();
        let width = rows.first().map(|r| r.as_ref().chars().count()).unwrap_or(0);
        if width == 0 || height == 0 {
            return Err(RulesetError::InvalidLayout("empty layout".to_string()));
        }
        let mut grid = Grid::new(width, height);
        for (y, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.chars().count() != width {
                return Err(RulesetError::InvalidLayout(format!(
                    "row {y} has length {} instead of {width}",
                    row.chars().count()
                )));
            }
            for (x, ch) in row.chars().enumerate() {
                if ch != WALL_CHAR {
                    grid.set(Pos::new(x, y), Cell::Floor);
                }
            }
        }
        Ok(grid)
    }

    fn index(&self, pos: Pos) -> usize {
        pos.y * self.width + pos.x
    }

    /// Convert signed coordinates (as sent by bots) into an on-map position.
    pub fn pos_at(&self, x: i32, y: i32) -> Option<Pos> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(Pos::new(x as usize, y as usize))
    }

    pub fn cell(&self, pos: Pos) -> Cell {
        self.cells[self.index(pos)]
    }

    pub fn set(&mut self, pos: Pos, cell: Cell) {
        let idx = self.index(pos);
        self.cells[idx] = cell;
    }

    /// True if `pos` is on the map and is floor.
    pub fn is_floor(&self, pos: Pos) -> bool {
        pos.x < self.width && pos.y < self.height && self.cell(pos) == Cell::Floor
    }

    /// All floor cells in row-major order.
    pub fn floor_cells(&self) -> Vec<Pos> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == Cell::Floor)
            .map(|(i, _)| Pos::new(i % self.width, i / self.width))
            .collect()
    }

    /// Horizontal mirror of `pos` across the vertical midline.
    pub fn mirror(&self, pos: Pos) -> Pos {
        Pos::new(self.width - 1 - pos.x, pos.y)
    }

    /// The four neighbours of `pos` in fixed order: up, right, down, left.
    /// `x` wraps (`width-1` is adjacent to `0`), `y` does not.
    pub fn neighbors(&self, pos: Pos) -> impl Iterator<Item = Pos> + '_ {
        let up = (pos.y > 0).then(|| Pos::new(pos.x, pos.y - 1));
        let right = Some(Pos::new((pos.x + 1) % self.width, pos.y));
        let down = (pos.y + 1 < self.height).then(|| Pos::new(pos.x, pos.y + 1));
        let left = Some(Pos::new((pos.x + self.width - 1) % self.width, pos.y));
        [up, right, down, left].into_iter().flatten()
    }

    /// Floor neighbours of `pos` in the fixed neighbour order.
    pub fn walkable_neighbors(&self, pos: Pos) -> impl Iterator<Item = Pos> + '_ {
        self.neighbors(pos).filter(move |n| *n != pos && self.is_floor(*n))
    }

    /// Connected floor regions (wrap-aware), largest first. Ties keep discovery order.
    pub fn regions(&self) -> Vec<Vec<Pos>> {
        let mut visited = vec![false; self.cells.len()];
        let mut regions: Vec<Vec<Pos>> = Vec::new();

        for start in self.floor_cells() {
            if visited[self.index(start)] {
                continue;
            }
            let mut region = Vec::new();
            let mut queue = VecDeque::new();
            visited[self.index(start)] = true;
            queue.push_back(start);
            while let Some(cur) = queue.pop_front() {
                region.push(cur);
                for next in self.walkable_neighbors(cur) {
                    let idx = self.index(next);
                    if !visited[idx] {
                        visited[idx] = true;
                        queue.push_back(next);
                    }
                }
            }
            regions.push(region);
        }

        regions.sort_by(|a, b| b.len().cmp(&a.len()));
        regions
    }

    /// Turn every floor cell outside the largest connected region into wall.
    pub fn keep_largest_region(&mut self) {
        let regions = self.regions();
        for region in regions.iter().skip(1) {
            for &pos in region {
                self.set(pos, Cell::Wall);
            }
        }
    }

    /// True if the layout is identical to its horizontal mirror image.
    pub fn is_mirror_symmetric(&self) -> bool {
        (0..self.height).all(|y| {
            (0..self.width).all(|x| {
                let pos = Pos::new(x, y);
                self.cell(pos) == self.cell(self.mirror(pos))
            })
        })
    }

    /// Rows of `#` and ` `, top to bottom.
    pub fn to_rows(&self) -> Vec<String> {
        self.cells
            .chunks(self.width)
            .map(|row| {
                row.iter()
                    .map(|c| match c {
                        Cell::Wall => WALL_CHAR,
                        Cell::Floor => FLOOR_CHAR,
                    })
                    .collect()
            })
            .collect()
    }

    pub fn snapshot(&self) -> GridSnapshot {
        GridSnapshot {
            width: self.width,
            height: self.height,
            rows: self.to_rows(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corridor() -> Grid {
        Grid::from_rows(&["#####", "#   #", "#####"]).unwrap()
    }

    #[test]
    fn test_new_grid_is_all_wall() {
        let g = Grid::new(6, 4);
        assert_eq!(g.width, 6);
        assert_eq!(g.height, 4);
        assert!(g.floor_cells().is_empty());
    }

    #[test]
    fn test_from_rows_and_back() {
        let g = corridor();
        assert_eq!(g.floor_cells(), vec![Pos::new(1, 1), Pos::new(2, 1), Pos::new(3, 1)]);
        assert_eq!(g.to_rows(), vec!["#####", "#   #", "#####"]);
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        let err = Grid::from_rows(&["###", "#"]).unwrap_err();
        assert!(matches!(err, RulesetError::InvalidLayout(_)));
        assert!(Grid::from_rows::<&str>(&[]).is_err());
    }

    #[test]
    fn test_pos_at_bounds() {
        let g = corridor();
        assert_eq!(g.pos_at(4, 2), Some(Pos::new(4, 2)));
        assert_eq!(g.pos_at(5, 0), None);
        assert_eq!(g.pos_at(-1, 0), None);
        assert_eq!(g.pos_at(0, 3), None);
    }

    #[test]
    fn test_neighbor_order_and_wrap() {
        let g = Grid::new(5, 3);
        let n: Vec<Pos> = g.neighbors(Pos::new(0, 1)).collect();
        assert_eq!(
            n,
            vec![Pos::new(0, 0), Pos::new(1, 1), Pos::new(0, 2), Pos::new(4, 1)]
        );
        // No vertical wrap on the top row.
        let n: Vec<Pos> = g.neighbors(Pos::new(4, 0)).collect();
        assert_eq!(n, vec![Pos::new(0, 0), Pos::new(4, 1), Pos::new(3, 0)]);
    }

    #[test]
    fn test_regions_use_tunnel() {
        // The two halves only touch through the wrap edge.
        let g = Grid::from_rows(&["#####", "  #  ", "#####"]).unwrap();
        let regions = g.regions();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].len(), 4);
    }

    #[test]
    fn test_keep_largest_region() {
        let mut g = Grid::from_rows(&["#######", "#   # #", "#######"]).unwrap();
        g.keep_largest_region();
        assert_eq!(g.floor_cells().len(), 3);
        assert!(!g.is_floor(Pos::new(5, 1)));
    }

    #[test]
    fn test_mirror_symmetry() {
        assert!(corridor().is_mirror_symmetric());
        let g = Grid::from_rows(&["#####", "#  ##", "#####"]).unwrap();
        assert!(!g.is_mirror_symmetric());
        assert_eq!(g.mirror(Pos::new(1, 1)), Pos::new(3, 1));
    }
}
