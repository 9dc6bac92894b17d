// Replay recording: collects match messages and compresses them for storage.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::io::{Read, Write};
use uuid::Uuid;

use crate::engine::game::{HistoryEntry, MatchOutcome};
use crate::engine::grid::GridSnapshot;
use crate::engine::pac::PerSide;
use crate::engine::ruleset::Ruleset;

/// One line of a replay file.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayMessage<'a> {
    Start {
        match_id: Uuid,
        seed: u64,
        ruleset: &'a Ruleset,
        world: &'a GridSnapshot,
    },
    Turn(&'a HistoryEntry),
    End {
        outcome: &'a MatchOutcome,
        scores: PerSide<u32>,
        turns: u32,
    },
}

/// Collects JSON replay messages during a match and compresses them on finish.
#[derive(Default)]
pub struct ReplayRecorder {
    messages: Vec<String>,
}

impl ReplayRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, message: &ReplayMessage<'_>) -> Result<(), serde_json::Error> {
        self.messages.push(serde_json::to_string(message)?);
        Ok(())
    }

    /// Record a raw JSON message string.
    pub fn record_message(&mut self, msg: &str) {
        self.messages.push(msg.to_string());
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Compress all recorded messages into a gzipped JSON array.
    pub fn finish(self) -> Result<Vec<u8>, std::io::Error> {
        // Each message is already valid JSON, so we join them manually.
        let json = format!("[{}]", self.messages.join(","));

        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(json.as_bytes())?;
        encoder.finish()
    }
}

/// Decompress gzipped replay data back to the JSON string.
pub fn decompress_replay(data: &[u8]) -> Result<String, std::io::Error> {
    let mut decoder = GzDecoder::new(data);
    let mut result = String::new();
    decoder.read_to_string(&mut result)?;
    Ok(result)
}
