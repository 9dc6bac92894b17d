// Movement resolution: pacs advance along their BFS routes one cell per micro-step, with
// same-cell and crossing collisions rolled back until the mover set is stable.

use std::collections::{BTreeMap, BTreeSet};

use super::config::*;
use super::grid::Pos;
use super::pac::Pac;

/// A pac's path for this turn (start cell first) and how many cells it has advanced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub pac_id: u32,
    pub path: Vec<Pos>,
    pub progress: usize,
}

impl Route {
    pub fn new(pac_id: u32, path: Vec<Pos>) -> Self {
        Route {
            pac_id,
            path,
            progress: 0,
        }
    }

    fn next_cell(&self) -> Option<Pos> {
        self.path.get(self.progress + 1).copied()
    }
}

/// One pac's intended move for the current micro-step.
#[derive(Debug, Clone, Copy)]
struct Intent {
    pac: usize,
    route: usize,
    to: Pos,
}

/// Run every micro-step of the turn. Pacs move in place; collision notes go to `log`.
pub fn resolve_movement(pacs: &mut [Pac], routes: &mut [Route], log: &mut Vec<String>) {
    for step in 0..MAX_SPEED {
        let mut intents: Vec<Intent> = routes
            .iter()
            .enumerate()
            .filter_map(|(ri, route)| {
                let pi = pacs.iter().position(|p| p.id == route.pac_id)?;
                let pac = &pacs[pi];
                if !pac.is_alive() || step >= pac.speed {
                    return None;
                }
                Some(Intent {
                    pac: pi,
                    route: ri,
                    to: route.next_cell()?,
                })
            })
            .collect();

        if intents.is_empty() {
            break;
        }

        resolve_conflicts(pacs, &mut intents, step, log);

        for intent in intents {
            let pac = &mut pacs[intent.pac];
            pac.pos = intent.to;
            pac.path_this_turn.push(intent.to);
            routes[intent.route].progress += 1;
        }
    }
}

/// Drop intents until no crossing or same-cell conflict remains.
fn resolve_conflicts(pacs: &[Pac], intents: &mut Vec<Intent>, step: u32, log: &mut Vec<String>) {
    for _ in 0..MAX_COLLISION_PASSES {
        let mut blocked: BTreeSet<usize> = BTreeSet::new();

        // Crossings: two movers swapping cells.
        for (i, a) in intents.iter().enumerate() {
            for b in intents.iter().skip(i + 1) {
                let (pa, pb) = (&pacs[a.pac], &pacs[b.pac]);
                if a.to != pb.pos || b.to != pa.pos {
                    continue;
                }
                if pa.blocks(pb) {
                    blocked.insert(a.pac);
                    blocked.insert(b.pac);
                } else if pa.pac_type.beats(pb.pac_type) {
                    blocked.insert(b.pac);
                } else if pb.pac_type.beats(pa.pac_type) {
                    blocked.insert(a.pac);
                } else {
                    blocked.insert(a.pac);
                    blocked.insert(b.pac);
                }
                log.push(format!(
                    "Crossing collision between pac {} and pac {} on micro-step {}",
                    pa.id,
                    pb.id,
                    step + 1
                ));
            }
        }

        // Same cell: every living pac ends the micro-step at its intent or where it stands.
        let mut by_cell: BTreeMap<Pos, Vec<(usize, bool)>> = BTreeMap::new();
        for (pi, pac) in pacs.iter().enumerate().filter(|(_, p)| p.is_alive()) {
            let moving = intents
                .iter()
                .find(|it| it.pac == pi && !blocked.contains(&pi));
            let cell = moving.map(|it| it.to).unwrap_or(pac.pos);
            by_cell.entry(cell).or_default().push((pi, moving.is_some()));
        }
        for (cell, group) in &by_cell {
            if group.len() < 2 {
                continue;
            }
            let conflict = group.iter().enumerate().any(|(i, (a, _))| {
                group
                    .iter()
                    .skip(i + 1)
                    .any(|(b, _)| pacs[*a].blocks(&pacs[*b]))
            });
            if !conflict {
                continue;
            }
            let movers: Vec<usize> = group.iter().filter(|(_, m)| *m).map(|(pi, _)| *pi).collect();
            if movers.is_empty() {
                continue;
            }
            let ids: Vec<String> = group.iter().map(|(pi, _)| pacs[*pi].id.to_string()).collect();
            log.push(format!(
                "Collision at {cell} between pacs {} on micro-step {}",
                ids.join(", "),
                step + 1
            ));
            blocked.extend(movers);
        }

        if blocked.is_empty() {
            return;
        }
        intents.retain(|it| !blocked.contains(&it.pac));
    }
    tracing::warn!(step, "collision resolution hit the pass limit, freezing all movers");
    intents.clear();
}
