//! Idempotency filter: one namespace of already-applied command ids.
//!
//! Every command id that has been applied locally (or appended locally, or
//! loaded from storage) is recorded here. A second sighting of the same id is
//! rejected no matter which peer relayed it.
//!
//! # Compaction
//!
//! Ids admitted through [`IdempotencyFilter::admit`] remember their command
//! timestamp. [`IdempotencyFilter::compact`] drops ids at or below a watermark
//! and raises the filter's floor. An unknown command whose timestamp is at or
//! below the floor comes back as [`Admission::BelowWatermark`]: the filter no
//! longer knows whether it was applied, so the caller must look the id up in
//! the durable log and [`IdempotencyFilter::record`] it if it is new. Ids
//! recorded through [`IdempotencyFilter::accept`] carry no timestamp and are
//! never compacted.

use std::collections::HashMap;

use renga_types::{Command, CommandId};
use tracing::{debug, trace};

/// Stamp for ids that were recorded without a timestamp.
const PINNED: u64 = u64::MAX;

/// Verdict for one incoming command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; the id is now recorded.
    Fresh,
    /// Already applied.
    Duplicate,
    /// Unknown, but inside the compacted range. Not recorded.
    BelowWatermark,
}

#[derive(Debug, Clone, Default)]
pub struct IdempotencyFilter {
    seen: HashMap<CommandId, u64>,
    /// Highest watermark passed to `compact` (0 = never compacted).
    floor: u64,
}

impl IdempotencyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` and return true the first time; false on every later call.
    pub fn accept(&mut self, id: CommandId) -> bool {
        if self.seen.contains_key(&id) {
            trace!(command_id = %id, "duplicate id");
            return false;
        }
        self.seen.insert(id, PINNED);
        true
    }

    /// Admit a full command, remembering its timestamp for compaction.
    pub fn admit(&mut self, command: &Command) -> Admission {
        if self.seen.contains_key(&command.command_id) {
            trace!(command_id = %command.command_id, "duplicate command");
            return Admission::Duplicate;
        }
        if self.floor > 0 && command.timestamp <= self.floor {
            trace!(
                command_id = %command.command_id,
                timestamp = command.timestamp,
                floor = self.floor,
                "command below dedup watermark"
            );
            return Admission::BelowWatermark;
        }
        self.seen.insert(command.command_id, command.timestamp);
        Admission::Fresh
    }

    /// Record one command the caller has confirmed is new.
    pub fn record(&mut self, command: &Command) {
        self.seen.insert(command.command_id, command.timestamp);
    }

    /// Pre-register commands (loaded history, local appends).
    pub fn register_all<'a>(&mut self, commands: impl IntoIterator<Item = &'a Command>) {
        for command in commands {
            self.seen
                .entry(command.command_id)
                .or_insert(command.timestamp);
        }
    }

    pub fn contains(&self, id: &CommandId) -> bool {
        self.seen.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Current compaction floor.
    pub fn watermark(&self) -> u64 {
        self.floor
    }

    /// Forget ids with timestamps at or below `watermark`; returns how many.
    ///
    /// The floor only moves forward.
    pub fn compact(&mut self, watermark: u64) -> usize {
        if watermark <= self.floor {
            return 0;
        }
        let before = self.seen.len();
        self.seen.retain(|_, stamp| *stamp > watermark);
        self.floor = watermark;
        let dropped = before - self.seen.len();
        debug!(watermark, dropped, remaining = self.seen.len(), "compacted idempotency filter");
        dropped
    }

    /// Empty the filter and reset the floor (full resynchronization).
    pub fn clear(&mut self) {
        self.seen.clear();
        self.floor = 0;
    }
}
