//! Commands and categories: the durable half of the data model.
//!
//! A [`Command`] is an immutable description of one durable mutation. Commands
//! live in per-[`Category`] logs; categories are independent partitions with
//! their own cursor and replay order.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::ids::CommandId;

/// A logical partition of the command log (one per entity family).
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    /// Progress meters ("clocks").
    pub const CLOCKS: &'static str = "clocks";
    /// Actor traits (harm, conditions, and the like).
    pub const TRAITS: &'static str = "traits";
    /// Free-form session journal.
    pub const JOURNAL: &'static str = "journal";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn clocks() -> Self {
        Self::new(Self::CLOCKS)
    }

    pub fn traits() -> Self {
        Self::new(Self::TRAITS)
    }

    pub fn journal() -> Self {
        Self::new(Self::JOURNAL)
    }

    /// The three categories a stock session replicates.
    pub fn defaults() -> Vec<Self> {
        vec![Self::clocks(), Self::traits(), Self::journal()]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Borrow<str> for Category {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Milliseconds since the Unix epoch, used for command timestamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One durable mutation.
///
/// Wire form: `{ commandId, type, payload, timestamp }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command_id: CommandId,
    /// String tag naming the mutation (e.g. `meter.advance`).
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

impl Command {
    /// Create a command stamped with a fresh id and the current time.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            command_id: CommandId::new(),
            kind: kind.into(),
            payload,
            timestamp: now_millis(),
        }
    }

    /// Override the timestamp (replays, tests).
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Total replay order: timestamp first, command id as the tie-break so
    /// every peer sorts identical batches identically.
    pub fn replay_cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.command_id.cmp(&other.command_id))
    }
}

/// Sort commands into replay order in place.
pub fn sort_for_replay(commands: &mut [Command]) {
    commands.sort_by(Command::replay_cmp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_shape() {
        let cmd = Command::new("meter.advance", json!({"meterId": "heat", "ticks": 1}))
            .with_timestamp(42);
        let value = serde_json::to_value(&cmd).expect("serialize");

        assert_eq!(value["type"], "meter.advance");
        assert_eq!(value["timestamp"], 42);
        assert!(value["commandId"].is_string());
        assert_eq!(value["payload"]["meterId"], "heat");
    }

    #[test]
    fn test_replay_order_uses_timestamp_then_id() {
        let a = Command::new("x", json!(null)).with_timestamp(20);
        let b = Command::new("x", json!(null)).with_timestamp(10);
        let c = Command::new("x", json!(null)).with_timestamp(10);

        let mut batch = vec![a.clone(), b.clone(), c.clone()];
        sort_for_replay(&mut batch);

        assert_eq!(batch[2], a);
        let (first, second) = if b.command_id < c.command_id { (b, c) } else { (c, b) };
        assert_eq!(batch[0], first);
        assert_eq!(batch[1], second);
    }

    #[test]
    fn test_category_is_a_plain_string_on_the_wire() {
        let json = serde_json::to_string(&Category::clocks()).expect("serialize");
        assert_eq!(json, "\"clocks\"");
    }
}
