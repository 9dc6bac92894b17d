// In-memory match store owned by the service layer: create, look up, step and evict matches by id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use uuid::Uuid;

use crate::engine::command::Orders;
use crate::engine::game::{Engine, Game, GameSnapshot, HistoryEntry, TurnReport};
use crate::engine::pac::{PerSide, Side};
use crate::engine::ruleset::Ruleset;
use crate::engine::server::{play_turn, BotSlot};
use crate::error::StoreError;
use crate::metrics;
use crate::protocol::ProtocolDescription;
use crate::sandbox::{BotProgram, ResourceLimits, SandboxRunner};

/// A stored match: the engine plus, optionally, the bots that play it.
pub struct StoredMatch {
    pub game: Game,
    bots: Option<PerSide<BotSlot>>,
}

type Slot = Arc<tokio::sync::Mutex<StoredMatch>>;

/// Thread-safe registry of matches keyed by id.
///
/// Each match sits behind its own async lock, so turns of one match are serialized while
/// different matches proceed independently.
#[derive(Clone, Default)]
pub struct MatchStore {
    inner: Arc<Mutex<HashMap<Uuid, Slot>>>,
}

impl MatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Slot>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, stored: StoredMatch) -> Uuid {
        let id = Uuid::new_v4();
        self.matches()
            .insert(id, Arc::new(tokio::sync::Mutex::new(stored)));
        metrics::ACTIVE_MATCHES.inc();
        id
    }

    /// Set up a match whose orders will be supplied through [`MatchStore::step`].
    pub fn create(&self, ruleset: Ruleset, seed: u64) -> Result<Uuid, StoreError> {
        let game = Game::new(ruleset, seed)?;
        let id = self.insert(StoredMatch { game, bots: None });
        tracing::info!(match_id = %id, seed, "match created");
        Ok(id)
    }

    /// Set up a match played by sandboxed bots through [`MatchStore::play_turn`].
    pub fn create_with_bots(
        &self,
        ruleset: Ruleset,
        seed: u64,
        bots: PerSide<BotProgram>,
        persistent: bool,
    ) -> Result<Uuid, StoreError> {
        let game = Game::new(ruleset, seed)?;
        let bots = bots.map(|_, program| BotSlot::new(program, persistent));
        let id = self.insert(StoredMatch {
            game,
            bots: Some(bots),
        });
        tracing::info!(match_id = %id, seed, persistent, "match created with bots");
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Result<Slot, StoreError> {
        self.matches()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    pub async fn protocol(&self, id: Uuid) -> Result<ProtocolDescription, StoreError> {
        Ok(self.get(id)?.lock().await.game.protocol())
    }

    pub async fn state(&self, id: Uuid) -> Result<GameSnapshot, StoreError> {
        Ok(self.get(id)?.lock().await.game.state())
    }

    pub async fn history(&self, id: Uuid) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self.get(id)?.lock().await.game.history().to_vec())
    }

    pub async fn is_finished(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.get(id)?.lock().await.game.is_finished())
    }

    /// Advance a match with orders supplied by the caller.
    pub async fn step(&self, id: Uuid, orders: PerSide<Orders>) -> Result<TurnReport, StoreError> {
        let slot = self.get(id)?;
        let mut stored = slot.lock().await;
        Ok(stored.game.step(orders)?)
    }

    /// Run the attached bots for one turn. Bot processes are stopped once the match ends.
    pub async fn play_turn(
        &self,
        id: Uuid,
        runner: &SandboxRunner,
    ) -> Result<TurnReport, StoreError> {
        let slot = self.get(id)?;
        let mut stored = slot.lock().await;
        let StoredMatch { game, bots } = &mut *stored;
        let bots = bots.as_mut().ok_or(StoreError::NoBots(id))?;

        let deadline = Duration::from_millis(game.ruleset().turn_deadline_ms);
        let limits = ResourceLimits::from(game.ruleset());
        let report = play_turn(game, bots, runner, deadline, &limits).await?;
        if game.is_finished() {
            for side in Side::BOTH {
                bots[side].close().await;
            }
        }
        Ok(report)
    }

    pub async fn on_bot_failure(
        &self,
        id: Uuid,
        side: Side,
        reason: &str,
    ) -> Result<(), StoreError> {
        let slot = self.get(id)?;
        let mut stored = slot.lock().await;
        let turn = stored.game.turn() + 1;
        stored.game.on_bot_failure(side, turn, reason);
        Ok(())
    }

    /// Drop a match, stopping any bot processes it still holds.
    pub async fn evict(&self, id: Uuid) -> Result<(), StoreError> {
        let slot = self
            .matches()
            .remove(&id)
            .ok_or(StoreError::NotFound(id))?;
        metrics::ACTIVE_MATCHES.dec();

        let mut stored = slot.lock().await;
        if let Some(bots) = stored.bots.as_mut() {
            for side in Side::BOTH {
                bots[side].close().await;
            }
        }
        tracing::info!(match_id = %id, turn = stored.game.turn(), "match evicted");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.matches().len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches().is_empty()
    }
}
