// Breadth-first shortest paths over the floor graph, with horizontal wraparound.

use std::collections::VecDeque;

use super::grid::{Grid, Pos};

/// Shortest path from `start` to `goal`, both ends included.
///
/// Neighbours are expanded up, right, down, left, so among equal-length paths the first one
/// discovered in that order wins. Returns `None` when `goal` is a wall, off the map or cut off.
/// `start == goal` yields the single-cell path.
pub fn find_path(grid: &Grid, start: Pos, goal: Pos) -> Option<Vec<Pos>> {
    if !grid.is_floor(start) || !grid.is_floor(goal) {
        return None;
    }
    if start == goal {
        return Some(vec![start]);
    }

    let idx = |p: Pos| p.y * grid.width + p.x;
    let mut came_from: Vec<Option<Pos>> = vec![None; grid.width * grid.height];
    let mut visited = vec![false; grid.width * grid.height];
    let mut queue = VecDeque::new();

    visited[idx(start)] = true;
    queue.push_back(start);

    while let Some(cur) = queue.pop_front() {
        if cur == goal {
            let mut path = vec![goal];
            let mut step = goal;
            while let Some(prev) = came_from[idx(step)] {
                path.push(prev);
                step = prev;
            }
            path.reverse();
            return Some(path);
        }
        for next in grid.walkable_neighbors(cur) {
            let i = idx(next);
            if !visited[i] {
                visited[i] = true;
                came_from[i] = Some(cur);
                queue.push_back(next);
            }
        }
    }
    None
}

/// Number of steps between two cells, or `None` if unreachable.
pub fn distance(grid: &Grid, start: Pos, goal: Pos) -> Option<usize> {
    find_path(grid, start, goal).map(|p| p.len() - 1)
}
